//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **JsonCodec**: serde_json による codec
//! - **InMemoryBroker**: プロセス内ブローカー（開発・テスト用）
//!
//! 本番用のブローカー接続（AMQP など）は別クレートで `ports::Broker` を実装します。

#[cfg(test)]
pub(crate) mod faulty;
pub mod inmem_broker;
pub mod json_codec;

pub use self::inmem_broker::InMemoryBroker;
pub use self::json_codec::JsonCodec;
