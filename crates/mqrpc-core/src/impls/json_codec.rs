//! JsonCodec - serde_json による MessageCodec 実装

use async_trait::async_trait;
use serde_json::Value;

use crate::ports::{CodecError, MessageCodec};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageCodec for JsonCodec {
    async fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    async fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
