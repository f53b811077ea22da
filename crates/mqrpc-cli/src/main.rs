//! mqrpc デモ: プロセス内ブローカー上で worker と client を動かす
//!
//! 環境変数
//! - `MQRPC_CONNECTION_URI`: 接続先（デフォルト `memory://local`）
//! - `MQRPC_TTL_MS`: 各リクエストの ttl（デフォルト 1000）
//! - `RUST_LOG`: ログレベル（デフォルト `info`）

use std::env;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mqrpc_core::config::{TaskRegistryConfig, WorkerConfig};
use mqrpc_core::impls::{InMemoryBroker, JsonCodec};
use mqrpc_core::ports::{Broker, MessageCodec};
use mqrpc_core::{Dispatcher, HandlerError, MethodHandler, ServiceBuilder, TaskRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_URI: &str = "memory://local";
const DEFAULT_TTL_MS: u64 = 1000;

struct DemoConfig {
    connection_uri: String,
    ttl: Duration,
}

impl DemoConfig {
    fn from_env() -> Self {
        let connection_uri =
            env::var("MQRPC_CONNECTION_URI").unwrap_or_else(|_| DEFAULT_URI.to_string());
        let ttl_ms = match env::var("MQRPC_TTL_MS") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = %raw, "invalid MQRPC_TTL_MS, using default");
                DEFAULT_TTL_MS
            }),
            Err(_) => DEFAULT_TTL_MS,
        };
        Self {
            connection_uri,
            ttl: Duration::from_millis(ttl_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GreetRequest {
    name: String,
}

#[derive(Debug, Serialize)]
struct Greeting {
    message: String,
    length: usize,
}

struct Text;

/// 最初の n 回だけ失敗する handler
struct FlakyHandler {
    remaining_failures: AtomicU32,
}

impl FlakyHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl MethodHandler for FlakyHandler {
    async fn call(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }
        Ok(json!({ "accepted": args.len() }))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn client(
    cfg: &DemoConfig,
    broker: &Arc<dyn Broker>,
    codec: &Arc<dyn MessageCodec>,
    service: &str,
    method: &str,
) -> Result<TaskRegistry, Box<dyn Error>> {
    let config = TaskRegistryConfig::new("demo-client", cfg.connection_uri.clone(), service, method)
        .with_default_ttl(cfg.ttl);
    let registry = TaskRegistry::new(config, broker.clone(), codec.clone());
    registry.init().await?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let cfg = DemoConfig::from_env();

    // (A) broker と codec を用意
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let codec: Arc<dyn MessageCodec> = Arc::new(JsonCodec::new());

    // (B) service を定義して worker に登録
    let text = ServiceBuilder::for_type::<Text>()
        .typed("reverse", |(s,): (String,)| async move {
            Ok::<_, HandlerError>(s.chars().rev().collect::<String>())
        })?
        .typed("greet", |(req,): (GreetRequest,)| async move {
            let message = format!("Hello, {}!", req.name);
            Ok::<_, HandlerError>(Greeting {
                length: message.len(),
                message,
            })
        })?
        .method("flaky", FlakyHandler::new(1))?
        .expect_methods(&["reverse", "greet", "flaky"])
        .build()?;

    let worker = Dispatcher::new(
        WorkerConfig::new("demo-worker", cfg.connection_uri.clone()),
        broker.clone(),
        codec.clone(),
    );
    worker.init().await?;
    worker.register(&text).await?;

    // (C) client から呼び出す
    let reverse = client(&cfg, &broker, &codec, "Text", "reverse").await?;
    let greet = client(&cfg, &broker, &codec, "Text", "greet").await?;
    let flaky = client(&cfg, &broker, &codec, "Text", "flaky").await?;
    let nobody = client(&cfg, &broker, &codec, "Missing", "method").await?;

    let reversed = reverse.call(vec![json!("mqrpc")], None).await?;
    info!(%reversed, "Text.reverse");

    let greeting = greet.call(vec![json!({ "name": "mqrpc" })], None).await?;
    info!(%greeting, "Text.greet");

    for attempt in 1..=2 {
        match flaky.call(vec![json!(attempt)], None).await {
            Ok(value) => info!(attempt, %value, "Text.flaky succeeded"),
            Err(err) => warn!(attempt, error = %err, kind = ?err.kind(), "Text.flaky failed"),
        }
    }

    if let Err(err) = nobody.call(vec![], None).await {
        warn!(error = %err, timeout = err.is_timeout(), "Missing.method");
    }

    // (D) 統計を出して片付ける
    info!(stats = %serde_json::to_string(&worker.stats())?, "worker stats");
    for registry in [&reverse, &greet, &flaky, &nobody] {
        info!(
            queue = registry.target_queue(),
            stats = %serde_json::to_string(&registry.stats())?,
            "client stats"
        );
        registry.destroy().await?;
    }
    worker.destroy().await?;
    Ok(())
}
