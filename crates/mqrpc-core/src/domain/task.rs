use std::time::Duration;

use super::ids::CorrelationId;

/// Client から worker へ送るリクエスト
///
/// `payload` は codec で encode 済みの位置引数列です。
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub correlation_id: Option<CorrelationId>,
    pub payload: Vec<u8>,
    pub ttl: Option<Duration>,
}

impl TaskRequest {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            correlation_id: None,
            payload: payload.into(),
            ttl: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
