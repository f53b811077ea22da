//! Broker port - メッセージブローカーの抽象化
//!
//! TaskRegistry と Dispatcher はこの trait 群だけに依存します。
//! wire protocol や接続管理の詳細は実装側（AMQP クライアントや
//! `impls::InMemoryBroker`）に閉じ込めます。
//!
//! # 操作
//! - `Broker::connect(uri)` → Connection
//! - `Connection::open_channel()` → Channel
//! - `Channel::{declare_queue, publish, consume, cancel, ack, nack, close}`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Default exchange（routing key = queue 名）
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("queue '{0}' is exclusive to another connection")]
    ResourceLocked(String),

    #[error("exchange '{0}' is not supported")]
    UnsupportedExchange(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("unknown consumer tag '{0}'")]
    UnknownConsumer(String),
}

/// Queue 宣言時のオプション
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// 宣言した connection だけが使える。connection close で削除
    pub exclusive: bool,
    /// 最後の consumer が cancel されたら削除
    pub auto_delete: bool,
    /// queue 内のメッセージの寿命
    pub message_ttl: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// true なら配送した時点で ack 済み扱い
    pub no_ack: bool,
}

/// メッセージプロパティ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// メッセージ単位の寿命（queue の message_ttl と短い方が効く）
    pub expiration: Option<Duration>,
}

/// Consumer に配送された 1 メッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(pub String);

impl std::fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// 1 つの queue に対する consume の購読ハンドル
///
/// cancel されるか channel が閉じると `next()` は `None` を返します。
pub struct Consumer {
    tag: ConsumerTag,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn new(tag: ConsumerTag, deliveries: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { tag, deliveries }
    }

    pub fn tag(&self) -> &ConsumerTag {
        &self.tag
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Channel は publish / consume / ack の単位
///
/// 1 つの Channel を複数の consumer loop で共有するため `&self` で操作します。
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue を宣言する（既にあれば何もしない）
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError>;

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
