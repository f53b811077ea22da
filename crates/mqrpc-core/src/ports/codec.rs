//! MessageCodec port - payload の encode / decode
//!
//! TaskRegistry と Dispatcher は構築時に codec を受け取ります（継承ではなく注入）。
//! 値の表現は `serde_json::Value` に統一し、wire 形式は実装が決めます。

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("{0}")]
    Encode(String),

    #[error("{0}")]
    Decode(String),
}

#[async_trait]
pub trait MessageCodec: Send + Sync {
    async fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// 壊れた入力は `CodecError::Decode` で失敗する
    async fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}
