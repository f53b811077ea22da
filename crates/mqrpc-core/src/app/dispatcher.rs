//! Dispatcher - worker 側の request 処理
//!
//! # フロー（1 メッセージごと）
//! 1. codec で decode（失敗 → 500 envelope）
//! 2. 位置引数の配列か検証（違う → 500 envelope）
//! 3. handler 実行（別 task で実行し、panic も失敗として扱う）
//! 4. 成功 → 200 envelope を reply_to へ publish → ack（または on_success hook）
//! 5. 失敗 → 500 envelope を publish → nack(requeue = false)（または on_failure hook）
//!
//! decode できないメッセージも handler の失敗と同じ経路で nack します。
//! どの分岐でも reply の publish と ack/nack はそれぞれ 1 回だけです。
//!
//! # 学習ポイント
//! - queue ごとに consumer loop を 1 つ spawn（queue 内では逐次処理）
//! - Channel は全 consumer loop で `Arc<dyn Channel>` として共有
//! - ack / nack は受け取った `Delivery` 自身に対して行う

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::builder::{ServiceDefinition, ServiceDescriptor};
use crate::config::WorkerConfig;
use crate::domain::{ReplyEnvelope, RpcError, STATUS_INTERNAL_ERROR};
use crate::observability::{DispatcherSnapshot, DispatcherStats, bump};
use crate::ports::{
    Broker, Channel, Connection, ConsumeOptions, Consumer, ConsumerTag, DEFAULT_EXCHANGE, Delivery,
    MessageCodec, MessageProperties,
};
use crate::typed::MethodHandler;

const NOT_AN_ARRAY: &str = "Incorrect type of message. Array is expected.";
const HANDLER_PANICKED: &str = "handler panicked";

/// デフォルトの ack / nack の代わりに呼ばれる hook
///
/// hook を設定した場合、メッセージの settle は hook の責任になります。
#[async_trait]
pub trait MessageHook: Send + Sync {
    async fn call(&self, channel: &dyn Channel, delivery: &Delivery) -> Result<(), RpcError>;
}

#[derive(Clone, Default)]
pub struct AckHooks {
    pub on_success: Option<Arc<dyn MessageHook>>,
    pub on_failure: Option<Arc<dyn MessageHook>>,
}

struct ConsumerHandle {
    tag: ConsumerTag,
    task: JoinHandle<()>,
}

struct WorkerSession {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    consumers: HashMap<String, ConsumerHandle>,
}

/// Dispatcher は登録された service method の request queue を consume する
///
/// # 使用例
/// ```ignore
/// let dispatcher = Dispatcher::new(WorkerConfig::new("worker", uri), broker, codec);
/// dispatcher.init().await?;
/// dispatcher.register(&text_service).await?;
/// ```
pub struct Dispatcher {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    codec: Arc<dyn MessageCodec>,
    hooks: AckHooks,
    stats: Arc<DispatcherStats>,
    session: Mutex<Option<WorkerSession>>,
}

impl Dispatcher {
    pub fn new(config: WorkerConfig, broker: Arc<dyn Broker>, codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            config,
            broker,
            codec,
            hooks: AckHooks::default(),
            stats: Arc::new(DispatcherStats::default()),
            session: Mutex::new(None),
        }
    }

    pub fn with_hooks(mut self, hooks: AckHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.session.lock().is_some()
    }

    /// consume 中の queue 名
    pub fn registered_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.consumers.keys().cloned().collect())
            .unwrap_or_default();
        queues.sort();
        queues
    }

    pub fn stats(&self) -> DispatcherSnapshot {
        let consumers = self
            .session
            .lock()
            .as_ref()
            .map_or(0, |s| s.consumers.len());
        self.stats.snapshot(consumers)
    }

    /// 接続と channel だけを用意する。queue は register まで宣言しない
    pub async fn init(&self) -> Result<(), RpcError> {
        if self.is_initialized() {
            debug!(worker = %self.config.id, "dispatcher already initialized");
            return Ok(());
        }

        let connection = self
            .broker
            .connect(&self.config.connection_uri)
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?;
        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "failed to close connection after init error");
                }
                return Err(err.into());
            }
        };

        *self.session.lock() = Some(WorkerSession {
            connection,
            channel,
            consumers: HashMap::new(),
        });
        info!(worker = %self.config.id, "dispatcher initialized");
        Ok(())
    }

    /// service の各 method について queue を宣言し consumer loop を起動する
    ///
    /// 既に consume 中の queue が含まれていれば何も宣言せずに失敗する。
    /// 途中の method で失敗した場合は、この呼び出しで起動した consumer を
    /// すべて止めてからエラーを返す（登録は全部か無しか）。
    pub async fn register(&self, service: &ServiceDefinition) -> Result<(), RpcError> {
        let channel = {
            let session = self.session.lock();
            let session = session.as_ref().ok_or(RpcError::NotInitialized)?;
            if let Some(taken) = service
                .descriptors()
                .iter()
                .map(ServiceDescriptor::queue_name)
                .find(|q| session.consumers.contains_key(q))
            {
                return Err(RpcError::AlreadyRegistered(taken));
            }
            session.channel.clone()
        };

        let mut started: Vec<(String, ConsumerHandle)> = Vec::new();
        for descriptor in service.descriptors() {
            match self.start_consumer(&channel, descriptor).await {
                Ok(handle) => started.push((descriptor.queue_name(), handle)),
                Err(err) => {
                    warn!(
                        service = service.name(),
                        queue = %descriptor.queue_name(),
                        error = %err,
                        "register failed, stopping consumers started so far"
                    );
                    stop_consumers(channel.as_ref(), started).await;
                    return Err(err);
                }
            }
        }

        // 並行した register が同じ queue を先に取った場合もここで弾く
        let rejected = {
            let mut guard = self.session.lock();
            match guard.as_mut() {
                None => Some((RpcError::NotInitialized, started)),
                Some(session) => {
                    let taken = started
                        .iter()
                        .map(|(queue, _)| queue)
                        .find(|queue| session.consumers.contains_key(*queue))
                        .cloned();
                    match taken {
                        Some(queue) => Some((RpcError::AlreadyRegistered(queue), started)),
                        None => {
                            session.consumers.extend(started);
                            None
                        }
                    }
                }
            }
        };
        if let Some((err, started)) = rejected {
            stop_consumers(channel.as_ref(), started).await;
            return Err(err);
        }

        info!(
            worker = %self.config.id,
            service = service.name(),
            methods = service.descriptors().len(),
            "service registered"
        );
        Ok(())
    }

    async fn start_consumer(
        &self,
        channel: &Arc<dyn Channel>,
        descriptor: &ServiceDescriptor,
    ) -> Result<ConsumerHandle, RpcError> {
        let queue = descriptor.queue_name();
        channel
            .declare_queue(&queue, self.config.queue.to_options(false))
            .await?;
        let consumer = channel.consume(&queue, ConsumeOptions::default()).await?;
        let tag = consumer.tag().clone();

        let ctx = MethodContext {
            queue: queue.clone(),
            handler: descriptor.handler.clone(),
            channel: channel.clone(),
            codec: self.codec.clone(),
            hooks: self.hooks.clone(),
            stats: self.stats.clone(),
        };
        let task = tokio::spawn(run_consumer_loop(consumer, ctx));
        debug!(
            service = %descriptor.service_name,
            method = %descriptor.method_name,
            queue = %queue,
            "method registered"
        );
        Ok(ConsumerHandle { tag, task })
    }

    /// 全 consumer を cancel して loop の終了を待ち、channel と connection を閉じる
    pub async fn destroy(&self) -> Result<(), RpcError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };

        stop_consumers(session.channel.as_ref(), session.consumers).await;
        session.channel.close().await?;
        session.connection.close().await?;

        info!(worker = %self.config.id, "dispatcher destroyed");
        Ok(())
    }
}

/// consumer を cancel し、止まった loop の終了を待つ
///
/// cancel に失敗した consumer の loop は終わらないので abort する。
async fn stop_consumers(
    channel: &dyn Channel,
    consumers: impl IntoIterator<Item = (String, ConsumerHandle)>,
) {
    for (queue, handle) in consumers {
        match channel.cancel(&handle.tag).await {
            Ok(()) => {
                if let Err(err) = handle.task.await {
                    if err.is_panic() {
                        error!(queue = %queue, error = %err, "consumer loop panicked");
                    }
                }
            }
            Err(err) => {
                warn!(queue = %queue, error = %err, "failed to cancel consumer");
                handle.task.abort();
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            for handle in session.consumers.into_values() {
                handle.task.abort();
            }
        }
    }
}

struct MethodContext {
    queue: String,
    handler: Arc<dyn MethodHandler>,
    channel: Arc<dyn Channel>,
    codec: Arc<dyn MessageCodec>,
    hooks: AckHooks,
    stats: Arc<DispatcherStats>,
}

async fn run_consumer_loop(mut consumer: Consumer, ctx: MethodContext) {
    while let Some(delivery) = consumer.next().await {
        handle_request(&ctx, &delivery).await;
    }
    debug!(queue = %ctx.queue, consumer = %consumer.tag(), "consumer stopped");
}

async fn handle_request(ctx: &MethodContext, delivery: &Delivery) {
    bump(&ctx.stats.received);

    let outcome = match decode_args(ctx.codec.as_ref(), &delivery.body).await {
        Ok(args) => invoke(ctx.handler.clone(), args).await,
        Err(message) => {
            bump(&ctx.stats.malformed);
            warn!(queue = %ctx.queue, error = %message, "malformed request");
            Err(message)
        }
    };

    let envelope = match outcome {
        Ok(value) => ReplyEnvelope::success(value),
        Err(message) => ReplyEnvelope::failure(STATUS_INTERNAL_ERROR, message),
    };
    let success = envelope.is_success();
    if success {
        bump(&ctx.stats.succeeded);
    } else {
        bump(&ctx.stats.failed);
    }

    send_reply(ctx, delivery, envelope).await;
    settle(ctx, delivery, success).await;
}

async fn decode_args(codec: &dyn MessageCodec, body: &[u8]) -> Result<Vec<Value>, String> {
    match codec.decode(body).await {
        Ok(Value::Array(args)) => Ok(args),
        Ok(_) => Err(NOT_AN_ARRAY.to_string()),
        Err(err) => Err(RpcError::from(err).to_string()),
    }
}

async fn invoke(handler: Arc<dyn MethodHandler>, args: Vec<Value>) -> Result<Value, String> {
    match tokio::spawn(async move { handler.call(args).await }).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(join_err) if join_err.is_panic() => Err(HANDLER_PANICKED.to_string()),
        Err(join_err) => Err(join_err.to_string()),
    }
}

async fn send_reply(ctx: &MethodContext, delivery: &Delivery, envelope: ReplyEnvelope) {
    let Some(reply_to) = delivery.properties.reply_to.as_deref() else {
        bump(&ctx.stats.unroutable);
        warn!(queue = %ctx.queue, "request without reply_to, reply skipped");
        return;
    };

    let body = match ctx.codec.encode(&envelope.to_value()).await {
        Ok(body) => body,
        Err(err) => {
            error!(queue = %ctx.queue, error = %err, "failed to encode reply");
            let fallback = ReplyEnvelope::failure(STATUS_INTERNAL_ERROR, err.to_string());
            match ctx.codec.encode(&fallback.to_value()).await {
                Ok(body) => body,
                Err(_) => return,
            }
        }
    };

    let properties = MessageProperties {
        correlation_id: delivery.properties.correlation_id.clone(),
        ..Default::default()
    };
    if let Err(err) = ctx
        .channel
        .publish(DEFAULT_EXCHANGE, reply_to, body, properties)
        .await
    {
        error!(queue = %ctx.queue, reply_to, error = %err, "failed to publish reply");
    } else {
        debug!(
            queue = %ctx.queue,
            correlation_id = delivery.properties.correlation_id.as_deref().unwrap_or_default(),
            status = envelope.meta.status,
            "reply published"
        );
    }
}

async fn settle(ctx: &MethodContext, delivery: &Delivery, success: bool) {
    let hook = if success {
        ctx.hooks.on_success.as_ref()
    } else {
        ctx.hooks.on_failure.as_ref()
    };

    let result = match hook {
        Some(hook) => hook.call(ctx.channel.as_ref(), delivery).await,
        None if success => ctx.channel.ack(delivery).await.map_err(RpcError::from),
        None => ctx
            .channel
            .nack(delivery, false)
            .await
            .map_err(RpcError::from),
    };
    if let Err(err) = result {
        error!(
            queue = %ctx.queue,
            delivery_tag = delivery.delivery_tag,
            success,
            error = %err,
            "failed to settle message"
        );
    }
}
