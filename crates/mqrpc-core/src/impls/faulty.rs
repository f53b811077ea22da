//! テスト用: InMemoryBroker に遅延や失敗を差し込むラッパー

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::InMemoryBroker;
use crate::ports::{
    Broker, BrokerError, Channel, Connection, ConsumeOptions, Consumer, ConsumerTag, Delivery,
    MessageProperties, QueueOptions,
};

#[derive(Clone, Copy, Default)]
struct Faults {
    publish_delay: Option<Duration>,
    fail_cancel: bool,
}

#[derive(Clone)]
pub(crate) struct FaultyBroker {
    inner: InMemoryBroker,
    faults: Faults,
}

impl FaultyBroker {
    pub(crate) fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            faults: Faults::default(),
        }
    }

    /// publish の前に `delay` だけ待つ
    pub(crate) fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.faults.publish_delay = Some(delay);
        self
    }

    /// cancel は常に失敗し、consumer はそのまま残る
    pub(crate) fn with_failing_cancel(mut self) -> Self {
        self.faults.fail_cancel = true;
        self
    }
}

#[async_trait]
impl Broker for FaultyBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        let inner = self.inner.connect(uri).await?;
        Ok(Arc::new(FaultyConnection {
            inner,
            faults: self.faults,
        }))
    }
}

struct FaultyConnection {
    inner: Arc<dyn Connection>,
    faults: Faults,
}

#[async_trait]
impl Connection for FaultyConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let inner = self.inner.open_channel().await?;
        Ok(Arc::new(FaultyChannel {
            inner,
            faults: self.faults,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}

struct FaultyChannel {
    inner: Arc<dyn Channel>,
    faults: Faults,
}

#[async_trait]
impl Channel for FaultyChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.inner.declare_queue(name, options).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        if let Some(delay) = self.faults.publish_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.publish(exchange, routing_key, body, properties).await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer, BrokerError> {
        self.inner.consume(queue, options).await
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        if self.faults.fail_cancel {
            return Err(BrokerError::UnknownConsumer(tag.0.clone()));
        }
        self.inner.cancel(tag).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner.ack(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.inner.nack(delivery, requeue).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}
