//! Errors - エラー型と分類
//!
//! # 分類
//! - Connection: ブローカー接続の確立・維持に失敗（init まで致命的）
//! - Decode: wire payload が壊れている（その場で回復）
//! - Application: handler が失敗した（reply envelope で呼び出し側へ）
//! - Timeout: ttl 内に reply が来なかった（該当リクエストのみ）
//! - Integrity: CompletionTracker の誤用（二重解決など、core のバグ）

use thiserror::Error;

use super::ids::CorrelationId;
use crate::ports::broker::BrokerError;
use crate::ports::codec::CodecError;

/// ErrorKind は RpcError の運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Decode,
    Application,
    Timeout,
    Integrity,
}

/// RpcError は TaskRegistry / Dispatcher / Completion が返すエラー
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel is not set up; call `init` first")]
    NotInitialized,

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    /// Remote handler の失敗。Display は handler のエラーテキストそのもの
    #[error("{}", message.as_deref().unwrap_or("remote call failed"))]
    Application { status: i64, message: Option<String> },

    #[error("timeout exceeded")]
    TimeoutExceeded,

    #[error("already completed")]
    AlreadyCompleted,

    #[error("result awaiter was dropped before resolution")]
    AwaiterDropped,

    #[error("request was abandoned before resolution")]
    Abandoned,

    #[error("correlation id {0} is already pending")]
    DuplicateCorrelationId(CorrelationId),

    #[error("queue {0} already has a consumer on this dispatcher")]
    AlreadyRegistered(String),
}

impl RpcError {
    pub fn application(status: i64, message: impl Into<String>) -> Self {
        Self::Application {
            status,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) | Self::NotInitialized | Self::Broker(_) => ErrorKind::Connection,
            Self::Decode(_) | Self::Encode(_) => ErrorKind::Decode,
            Self::Application { .. } => ErrorKind::Application,
            Self::TimeoutExceeded => ErrorKind::Timeout,
            Self::AlreadyCompleted
            | Self::AwaiterDropped
            | Self::Abandoned
            | Self::DuplicateCorrelationId(_)
            | Self::AlreadyRegistered(_) => ErrorKind::Integrity,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutExceeded)
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(msg) => Self::Encode(msg),
            CodecError::Decode(msg) => Self::Decode(msg),
        }
    }
}
