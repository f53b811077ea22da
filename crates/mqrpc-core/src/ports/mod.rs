//! Ports - 外部コラボレーターの抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。
//! - **broker**: connect / channel / publish / consume / ack / nack
//! - **codec**: encode / decode の契約

pub mod broker;
pub mod codec;

pub use self::broker::{
    Broker, BrokerError, Channel, Connection, ConsumeOptions, Consumer, ConsumerTag, Delivery,
    DEFAULT_EXCHANGE, MessageProperties, QueueOptions,
};
pub use self::codec::{CodecError, MessageCodec};
