//! TaskRegistry - client 側の request / reply 相関
//!
//! # フロー
//! 1. `init()`: connect → channel → 専用 reply queue を宣言 → reply consumer 起動
//! 2. `publish()`: correlation id を決め、pending map に tracker を登録して publish
//! 3. reply loop: correlation id で pending map から取り除き、tracker を解決
//!
//! # 学習ポイント
//! - pending map は `parking_lot::Mutex` で保護し、lock を await を跨いで保持しない
//! - reply と timeout はどちらも「map からの remove」に成功した側だけが解決する
//! - timer は pending map を `Weak` で参照する（registry の drop を妨げない）

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::tracker::{Completion, CompletionTracker, IntegritySink, default_integrity_sink};
use crate::config::TaskRegistryConfig;
use crate::domain::{CorrelationId, ReplyEnvelope, RpcError, TaskRequest, reply_queue_name};
use crate::observability::{RegistrySnapshot, RegistryStats, bump};
use crate::ports::{
    Broker, Channel, Connection, ConsumeOptions, Consumer, ConsumerTag, DEFAULT_EXCHANGE, Delivery,
    MessageCodec, MessageProperties,
};

type PendingMap = Mutex<HashMap<CorrelationId, CompletionTracker>>;

/// init 済みの broker リソース
struct Session {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    consumer_tag: ConsumerTag,
    reply_loop: JoinHandle<()>,
}

/// publish の戻り値。`result` を await すると reply / timeout を受け取れる
#[derive(Debug)]
pub struct TaskResult {
    pub correlation_id: CorrelationId,
    pub result: Completion,
}

/// TaskRegistry は 1 つの service method に対する RPC client
///
/// # 使用例
/// ```ignore
/// let registry = TaskRegistry::new(config, broker, Arc::new(JsonCodec::new()));
/// registry.init().await?;
/// let reversed = registry.call(vec![json!("hello")], Some(Duration::from_secs(1))).await?;
/// registry.destroy().await?;
/// ```
pub struct TaskRegistry {
    config: TaskRegistryConfig,
    broker: Arc<dyn Broker>,
    codec: Arc<dyn MessageCodec>,
    reply_queue: String,
    target_queue: String,
    pending: Arc<PendingMap>,
    stats: Arc<RegistryStats>,
    integrity: IntegritySink,
    session: Mutex<Option<Session>>,
}

impl TaskRegistry {
    pub fn new(
        config: TaskRegistryConfig,
        broker: Arc<dyn Broker>,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        Self::with_integrity_sink(config, broker, codec, default_integrity_sink())
    }

    pub fn with_integrity_sink(
        config: TaskRegistryConfig,
        broker: Arc<dyn Broker>,
        codec: Arc<dyn MessageCodec>,
        integrity: IntegritySink,
    ) -> Self {
        let reply_queue = reply_queue_name(&config.id);
        let target_queue = config.target_queue();
        Self {
            config,
            broker,
            codec,
            reply_queue,
            target_queue,
            pending: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(RegistryStats::default()),
            integrity,
            session: Mutex::new(None),
        }
    }

    /// この registry 専用の reply queue 名（`<id>.<suffix>`）
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// publish 先の queue 名（`<service>.<method>`）
    pub fn target_queue(&self) -> &str {
        &self.target_queue
    }

    pub fn is_initialized(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> RegistrySnapshot {
        self.stats.snapshot(self.pending_count())
    }

    /// 接続して reply queue の consume を開始する
    ///
    /// 失敗しても registry は未初期化のまま残り、`init` を再試行できる。
    pub async fn init(&self) -> Result<(), RpcError> {
        if self.is_initialized() {
            debug!(registry = %self.config.id, "registry already initialized");
            return Ok(());
        }

        let connection = self
            .broker
            .connect(&self.config.connection_uri)
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?;

        match self.open_session(connection.clone()).await {
            Ok(session) => {
                info!(
                    registry = %self.config.id,
                    reply_queue = %self.reply_queue,
                    target = %self.target_queue,
                    "task registry initialized"
                );
                let previous = self.session.lock().replace(session);
                if let Some(previous) = previous {
                    previous.reply_loop.abort();
                }
                Ok(())
            }
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "failed to close connection after init error");
                }
                Err(err)
            }
        }
    }

    async fn open_session(&self, connection: Arc<dyn Connection>) -> Result<Session, RpcError> {
        let channel = connection.open_channel().await?;
        channel
            .declare_queue(&self.reply_queue, self.config.queue.to_options(true))
            .await?;

        let consumer = channel
            .consume(
                &self.reply_queue,
                ConsumeOptions {
                    no_ack: self.config.consumer.no_ack,
                },
            )
            .await?;
        let consumer_tag = consumer.tag().clone();

        let reply_loop = tokio::spawn(run_reply_loop(
            consumer,
            ReplyContext {
                channel: channel.clone(),
                codec: self.codec.clone(),
                pending: self.pending.clone(),
                stats: self.stats.clone(),
                no_ack: self.config.consumer.no_ack,
            },
        ));

        Ok(Session {
            connection,
            channel,
            consumer_tag,
            reply_loop,
        })
    }

    fn channel(&self) -> Result<Arc<dyn Channel>, RpcError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or(RpcError::NotInitialized)
    }

    /// Request を publish し、reply を待たずに TaskResult を返す
    pub async fn publish(&self, request: TaskRequest) -> Result<TaskResult, RpcError> {
        let channel = self.channel()?;

        let correlation_id = request
            .correlation_id
            .unwrap_or_else(CorrelationId::generate);
        let ttl = request
            .ttl
            .or_else(|| self.config.message.ttl())
            .filter(|ttl| !ttl.is_zero());

        let (tracker, completion) = CompletionTracker::unarmed(self.integrity.clone());
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&correlation_id) {
                return Err(RpcError::DuplicateCorrelationId(correlation_id));
            }
            pending.insert(correlation_id.clone(), tracker.clone());
        }

        // ttl は publish の開始から数える。送信が遅れても timer は進む
        if let Some(ttl) = ttl {
            let weak = Arc::downgrade(&self.pending);
            let stats = self.stats.clone();
            let id = correlation_id.clone();
            tracker.arm(ttl, move || expire_pending(weak, stats, id));
        }

        let properties = MessageProperties {
            correlation_id: Some(correlation_id.to_string()),
            reply_to: Some(self.reply_queue.clone()),
            expiration: ttl,
        };
        if let Err(err) = channel
            .publish(DEFAULT_EXCHANGE, &self.target_queue, request.payload, properties)
            .await
        {
            self.pending.lock().remove(&correlation_id);
            tracker.disarm();
            warn!(correlation_id = %correlation_id, error = %err, "publish failed");
            return Err(err.into());
        }

        bump(&self.stats.published);
        debug!(
            correlation_id = %correlation_id,
            queue = %self.target_queue,
            ttl_ms = ttl.map(|t| t.as_millis() as u64),
            "request published"
        );

        Ok(TaskResult {
            correlation_id,
            result: completion,
        })
    }

    /// 位置引数を encode して publish し、結果を待つ
    pub async fn call(&self, args: Vec<Value>, ttl: Option<Duration>) -> Result<Value, RpcError> {
        let payload = self.codec.encode(&Value::Array(args)).await?;
        let mut request = TaskRequest::new(payload);
        request.ttl = ttl;
        self.publish(request).await?.result.await
    }

    /// consume を止め、channel と connection を閉じる
    ///
    /// pending の request は解決しない。ttl 付きのものは timer で、
    /// それ以外は registry の drop で `Abandoned` になる。
    pub async fn destroy(&self) -> Result<(), RpcError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };

        // cancel に失敗した consumer は止まらないので loop を待たない
        match session.channel.cancel(&session.consumer_tag).await {
            Ok(()) => {
                if let Err(err) = session.reply_loop.await {
                    if err.is_panic() {
                        error!(error = %err, "reply loop panicked");
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to cancel reply consumer");
                session.reply_loop.abort();
            }
        }
        session.channel.close().await?;
        session.connection.close().await?;

        info!(
            registry = %self.config.id,
            pending = self.pending_count(),
            "task registry destroyed"
        );
        Ok(())
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.reply_loop.abort();
        }
    }
}

fn expire_pending(pending: Weak<PendingMap>, stats: Arc<RegistryStats>, id: CorrelationId) {
    let Some(pending) = pending.upgrade() else {
        return;
    };
    let removed = pending.lock().remove(&id);
    if let Some(tracker) = removed {
        bump(&stats.timeouts);
        debug!(correlation_id = %id, "request timed out");
        tracker.expire();
    }
}

struct ReplyContext {
    channel: Arc<dyn Channel>,
    codec: Arc<dyn MessageCodec>,
    pending: Arc<PendingMap>,
    stats: Arc<RegistryStats>,
    no_ack: bool,
}

async fn run_reply_loop(mut consumer: Consumer, ctx: ReplyContext) {
    while let Some(delivery) = consumer.next().await {
        handle_reply(&ctx, &delivery).await;

        if !ctx.no_ack {
            if let Err(err) = ctx.channel.ack(&delivery).await {
                error!(error = %err, delivery_tag = delivery.delivery_tag, "failed to ack reply");
            }
        }
    }
    debug!(consumer = %consumer.tag(), "reply consumer stopped");
}

async fn handle_reply(ctx: &ReplyContext, delivery: &Delivery) {
    let Some(raw_id) = delivery.properties.correlation_id.as_deref() else {
        bump(&ctx.stats.unmatched_replies);
        warn!(queue = %delivery.queue, "reply without correlation id dropped");
        return;
    };

    let id = CorrelationId::from(raw_id);
    let removed = ctx.pending.lock().remove(&id);
    let Some(tracker) = removed else {
        bump(&ctx.stats.unmatched_replies);
        debug!(correlation_id = %id, "reply for unknown correlation id dropped");
        return;
    };

    let outcome = match decode_envelope(ctx.codec.as_ref(), &delivery.body).await {
        Ok(envelope) => {
            debug!(correlation_id = %id, status = envelope.meta.status, "reply received");
            envelope.into_result()
        }
        Err(err) => {
            bump(&ctx.stats.malformed_replies);
            warn!(correlation_id = %id, error = %err, "malformed reply");
            Err(err)
        }
    };

    // 二重解決は tracker 側で integrity sink に報告される
    let _ = match outcome {
        Ok(value) => {
            bump(&ctx.stats.completed);
            tracker.complete(value)
        }
        Err(err) => {
            bump(&ctx.stats.failed);
            tracker.fail(err)
        }
    };
}

async fn decode_envelope(codec: &dyn MessageCodec, body: &[u8]) -> Result<ReplyEnvelope, RpcError> {
    let value = codec.decode(body).await?;
    ReplyEnvelope::from_value(value)
}
