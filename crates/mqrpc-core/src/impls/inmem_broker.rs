//! InMemoryBroker - 開発・テスト用のプロセス内ブローカー
//!
//! # 学習ポイント
//! - 1 つの Mutex で queue / unacked / channel の状態をまとめて管理
//! - ロックは同期処理の中で完結させる（await を跨がない）
//! - consumer への配送は mpsc チャネル経由
//!
//! # サポートする挙動
//! - default exchange のみ（routing key = queue 名、宛先なしは破棄）
//! - consumer 間のラウンドロビン配送
//! - channel 単位の unacked 管理、nack(requeue) と channel close 時の再配送
//! - メッセージ単位の expiration と queue の message_ttl
//! - auto_delete（最後の consumer の cancel で削除）と exclusive queue

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::ports::{
    Broker, BrokerError, Channel, Connection, ConsumeOptions, Consumer, ConsumerTag, Delivery,
    DEFAULT_EXCHANGE, MessageProperties, QueueOptions,
};

/// InMemoryBroker はプロセス内で完結するブローカー
///
/// # 使用例
/// ```ignore
/// let broker = Arc::new(InMemoryBroker::new());
/// let conn = broker.connect("memory://local").await?;
/// let channel = conn.open_channel().await?;
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    expires_at: Option<Instant>,
    redelivered: bool,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct ConsumerSlot {
    tag: ConsumerTag,
    channel_id: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    refusing: bool,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    connections: HashSet<u64>,
    /// channel id → connection id
    channels: HashMap<u64, u64>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn connection_of(&self, channel_id: u64) -> Result<u64, BrokerError> {
        self.channels
            .get(&channel_id)
            .copied()
            .ok_or(BrokerError::ChannelClosed)
    }

    /// ready のメッセージを consumer に配れるだけ配る
    fn pump(&mut self, queue_name: &str) {
        let BrokerState {
            queues,
            unacked,
            next_id,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        let now = Instant::now();
        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            if message.is_expired(now) {
                debug!(queue = queue_name, "message expired before delivery");
                continue;
            }

            let idx = queue.cursor % queue.consumers.len();
            queue.cursor = idx.wrapping_add(1);

            *next_id += 1;
            let delivery_tag = *next_id;
            let slot = &queue.consumers[idx];
            let delivery = Delivery {
                delivery_tag,
                queue: queue_name.to_string(),
                redelivered: message.redelivered,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            if slot.sender.send(delivery).is_err() {
                // receiver が drop された consumer は外して再試行
                debug!(queue = queue_name, consumer = %slot.tag, "consumer went away");
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }

            if !slot.no_ack {
                unacked.insert(
                    delivery_tag,
                    Unacked {
                        channel_id: slot.channel_id,
                        queue: queue_name.to_string(),
                        message,
                    },
                );
            }
        }
    }

    /// この channel が受け取った unacked を取り出す
    fn take_unacked(&mut self, channel_id: u64, delivery_tag: u64) -> Result<Unacked, BrokerError> {
        let owned = self
            .unacked
            .get(&delivery_tag)
            .is_some_and(|entry| entry.channel_id == channel_id);
        if !owned {
            return Err(BrokerError::UnknownDeliveryTag(delivery_tag));
        }
        self.unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    /// unacked を queue の先頭に戻して再配送
    fn requeue(&mut self, entry: Unacked) {
        let Unacked { queue, mut message, .. } = entry;
        if let Some(state) = self.queues.get_mut(&queue) {
            message.redelivered = true;
            state.ready.push_front(message);
            self.pump(&queue);
        }
    }

    fn remove_consumer(&mut self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        let found = self.queues.iter_mut().find_map(|(name, queue)| {
            let idx = queue.consumers.iter().position(|c| &c.tag == tag)?;
            queue.consumers.remove(idx);
            Some((name.clone(), queue.options.auto_delete && queue.consumers.is_empty()))
        });

        match found {
            Some((name, true)) => {
                debug!(queue = %name, "auto-delete queue removed");
                self.queues.remove(&name);
                Ok(())
            }
            Some((_, false)) => Ok(()),
            None => Err(BrokerError::UnknownConsumer(tag.0.clone())),
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }

        let tags: Vec<ConsumerTag> = self
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .filter(|c| c.channel_id == channel_id)
            .map(|c| c.tag.clone())
            .collect();
        for tag in &tags {
            let _ = self.remove_consumer(tag);
        }

        let mut pending: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        // 先頭に積み戻すので、元の順序になるよう新しい tag から戻す
        pending.sort_unstable_by(|a, b| b.cmp(a));
        for tag in pending {
            if let Some(entry) = self.unacked.remove(&tag) {
                self.requeue(entry);
            }
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        if !self.connections.remove(&connection_id) {
            return;
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, conn)| **conn == connection_id)
            .map(|(ch, _)| *ch)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id);
        }

        self.queues
            .retain(|_, q| !(q.options.exclusive && q.owner == Some(connection_id)));
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// false にすると以降の connect が ConnectionRefused になる
    pub fn set_accepting(&self, accepting: bool) {
        self.state.lock().refusing = !accepting;
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// ready 状態（未配送）のメッセージ数
    pub fn message_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.ready.len())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// 宣言時のオプション（queue が無ければ None）
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state.lock().queues.get(name).map(|q| q.options.clone())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        let mut state = self.state.lock();
        if state.refusing {
            return Err(BrokerError::ConnectionRefused(uri.to_string()));
        }
        let id = state.next_id();
        state.connections.insert(id);
        debug!(connection = id, uri, "connection opened");

        Ok(Arc::new(InMemoryConnection {
            id,
            state: self.state.clone(),
        }))
    }
}

struct InMemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.state.lock();
        if !state.connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = state.next_id();
        state.channels.insert(id, self.id);

        Ok(Arc::new(InMemoryChannel {
            id,
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().close_connection(self.id);
        debug!(connection = self.id, "connection closed");
        Ok(())
    }
}

struct InMemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let connection_id = state.connection_of(self.id)?;

        if let Some(existing) = state.queues.get(name) {
            if existing.options.exclusive && existing.owner != Some(connection_id) {
                return Err(BrokerError::ResourceLocked(name.to_string()));
            }
            return Ok(());
        }

        let owner = options.exclusive.then_some(connection_id);
        state.queues.insert(
            name.to_string(),
            QueueState {
                options,
                owner,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            },
        );
        debug!(queue = name, "queue declared");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        if exchange != DEFAULT_EXCHANGE {
            return Err(BrokerError::UnsupportedExchange(exchange.to_string()));
        }

        let mut state = self.state.lock();
        state.connection_of(self.id)?;

        let Some(queue) = state.queues.get_mut(routing_key) else {
            debug!(queue = routing_key, "unroutable message dropped");
            return Ok(());
        };

        let ttl = match (properties.expiration, queue.options.message_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        queue.ready.push_back(StoredMessage {
            body,
            properties,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
            redelivered: false,
        });
        state.pump(routing_key);
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError> {
        let mut state = self.state.lock();
        let connection_id = state.connection_of(self.id)?;
        let tag = ConsumerTag(format!("ctag-{}", state.next_id()));

        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if target.options.exclusive && target.owner != Some(connection_id) {
            return Err(BrokerError::ResourceLocked(queue.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        target.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel_id: self.id,
            no_ack: options.no_ack,
            sender,
        });
        state.pump(queue);
        debug!(queue, consumer = %tag, "consumer started");

        Ok(Consumer::new(tag, receiver))
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.connection_of(self.id)?;
        state.remove_consumer(tag)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.connection_of(self.id)?;
        state
            .take_unacked(self.id, delivery.delivery_tag)
            .map(|_| ())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.connection_of(self.id)?;
        let entry = state.take_unacked(self.id, delivery.delivery_tag)?;

        if requeue {
            state.requeue(entry);
        } else {
            debug!(queue = %entry.queue, "message rejected");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open(broker: &InMemoryBroker) -> (Arc<dyn Connection>, Arc<dyn Channel>) {
        let conn = broker.connect("memory://test").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        (conn, channel)
    }

    fn props(correlation_id: &str) -> MessageProperties {
        MessageProperties {
            correlation_id: Some(correlation_id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_then_consume_delivers_in_order() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();

        ch.publish("", "q", b"1".to_vec(), props("a")).await.unwrap();
        ch.publish("", "q", b"2".to_vec(), props("b")).await.unwrap();

        let mut consumer = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        let first = consumer.next().await.unwrap();
        let second = consumer.next().await.unwrap();
        assert_eq!(first.body, b"1");
        assert_eq!(second.properties.correlation_id.as_deref(), Some("b"));
        assert_eq!(broker.unacked_count(), 2);
    }

    #[tokio::test]
    async fn unroutable_message_is_dropped() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        ch.publish("", "nobody", b"x".to_vec(), props("a")).await.unwrap();
        assert!(!broker.queue_exists("nobody"));
    }

    #[tokio::test]
    async fn named_exchange_is_rejected() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        let err = ch
            .publish("amq.topic", "q", b"x".to_vec(), props("a"))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::UnsupportedExchange("amq.topic".into()));
    }

    #[tokio::test]
    async fn ack_and_nack_settle_once() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        ch.publish("", "q", b"x".to_vec(), props("a")).await.unwrap();

        let mut consumer = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        let d = consumer.next().await.unwrap();
        ch.ack(&d).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert!(matches!(
            ch.nack(&d, false).await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        ch.publish("", "q", b"x".to_vec(), props("a")).await.unwrap();

        let mut consumer = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        let d = consumer.next().await.unwrap();
        assert!(!d.redelivered);
        ch.nack(&d, true).await.unwrap();

        let again = consumer.next().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, b"x");
    }

    #[tokio::test]
    async fn no_ack_consumer_leaves_nothing_unacked() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        let mut consumer = ch
            .consume("q", ConsumeOptions { no_ack: true })
            .await
            .unwrap();
        ch.publish("", "q", b"x".to_vec(), props("a")).await.unwrap();
        consumer.next().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn consumers_share_queue_round_robin() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        let mut c1 = ch.consume("q", ConsumeOptions { no_ack: true }).await.unwrap();
        let mut c2 = ch.consume("q", ConsumeOptions { no_ack: true }).await.unwrap();

        ch.publish("", "q", b"1".to_vec(), props("a")).await.unwrap();
        ch.publish("", "q", b"2".to_vec(), props("b")).await.unwrap();

        assert_eq!(c1.next().await.unwrap().body, b"1");
        assert_eq!(c2.next().await.unwrap().body, b"2");
    }

    #[tokio::test]
    async fn cancel_removes_auto_delete_queue() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        let options = QueueOptions {
            auto_delete: true,
            ..Default::default()
        };
        ch.declare_queue("q", options).await.unwrap();
        let mut consumer = ch.consume("q", ConsumeOptions::default()).await.unwrap();

        ch.cancel(consumer.tag()).await.unwrap();
        assert!(!broker.queue_exists("q"));
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test]
    async fn closing_channel_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = open(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();
        ch.publish("", "q", b"x".to_vec(), props("a")).await.unwrap();
        let mut consumer = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        consumer.next().await.unwrap();

        ch.close().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.message_count("q"), 1);

        let other = conn.open_channel().await.unwrap();
        let mut consumer = other.consume("q", ConsumeOptions::default()).await.unwrap();
        assert!(consumer.next().await.unwrap().redelivered);
    }

    #[tokio::test]
    async fn exclusive_queue_belongs_to_its_connection() {
        let broker = InMemoryBroker::new();
        let (conn, ch) = open(&broker).await;
        let options = QueueOptions {
            exclusive: true,
            ..Default::default()
        };
        ch.declare_queue("reply", options.clone()).await.unwrap();

        let (_other_conn, other) = open(&broker).await;
        assert_eq!(
            other.declare_queue("reply", options).await.unwrap_err(),
            BrokerError::ResourceLocked("reply".into())
        );

        conn.close().await.unwrap();
        assert!(!broker.queue_exists("reply"));
        assert_eq!(ch.close().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_not_delivered() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        ch.declare_queue("q", QueueOptions::default()).await.unwrap();

        let mut expiring = props("a");
        expiring.expiration = Some(Duration::from_millis(50));
        ch.publish("", "q", b"old".to_vec(), expiring).await.unwrap();
        ch.publish("", "q", b"new".to_vec(), props("b")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let mut consumer = ch.consume("q", ConsumeOptions::default()).await.unwrap();
        assert_eq!(consumer.next().await.unwrap().body, b"new");
    }

    #[tokio::test]
    async fn refused_connection() {
        let broker = InMemoryBroker::new();
        broker.set_accepting(false);
        let err = broker.connect("memory://down").await.err().unwrap();
        assert_eq!(err, BrokerError::ConnectionRefused("memory://down".into()));
    }

    #[tokio::test]
    async fn closed_channel_rejects_operations() {
        let broker = InMemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        ch.close().await.unwrap();
        assert_eq!(
            ch.declare_queue("q", QueueOptions::default()).await,
            Err(BrokerError::ChannelClosed)
        );
    }
}
