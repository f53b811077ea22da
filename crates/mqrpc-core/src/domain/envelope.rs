//! ReplyEnvelope - worker から client への返信フォーマット
//!
//! wire 上の形: `{ "meta": { "status": 200, "message": "..." }, "data": ... }`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::RpcError;

pub const STATUS_OK: i64 = 200;
pub const STATUS_INTERNAL_ERROR: i64 = 500;

/// Envelope の meta 部
///
/// `message` は旧 wire 名 `msg` でも受け付けます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMeta {
    pub status: i64,

    #[serde(default, alias = "msg", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub meta: ReplyMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ReplyEnvelope {
    pub fn success(data: Value) -> Self {
        Self {
            meta: ReplyMeta {
                status: STATUS_OK,
                message: None,
            },
            data: Some(data),
        }
    }

    pub fn failure(status: i64, message: impl Into<String>) -> Self {
        Self {
            meta: ReplyMeta {
                status,
                message: Some(message.into()),
            },
            data: None,
        }
    }

    /// status が [200, 300) なら成功
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.meta.status)
    }

    /// 成功なら `data`（無ければ null）、失敗なら Application エラー
    pub fn into_result(self) -> Result<Value, RpcError> {
        if self.is_success() {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(RpcError::Application {
                status: self.meta.status,
                message: self.meta.message,
            })
        }
    }

    pub fn to_value(&self) -> Value {
        // ReplyEnvelope は常に JSON 値として表現できる
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        serde_json::from_value(value).map_err(|e| RpcError::Decode(format!("reply envelope: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(200, true)]
    #[case(204, true)]
    #[case(299, true)]
    #[case(300, false)]
    #[case(199, false)]
    #[case(500, false)]
    fn success_range(#[case] status: i64, #[case] ok: bool) {
        let env = ReplyEnvelope {
            meta: ReplyMeta {
                status,
                message: None,
            },
            data: None,
        };
        assert_eq!(env.is_success(), ok);
    }

    #[test]
    fn success_shape_on_the_wire() {
        let v = ReplyEnvelope::success(json!("pong")).to_value();
        assert_eq!(v, json!({ "meta": { "status": 200 }, "data": "pong" }));
    }

    #[test]
    fn failure_shape_on_the_wire() {
        let v = ReplyEnvelope::failure(500, "some error").to_value();
        assert_eq!(v, json!({ "meta": { "status": 500, "message": "some error" } }));
    }

    #[test]
    fn accepts_legacy_msg_field() {
        let env = ReplyEnvelope::from_value(json!({ "meta": { "status": 500, "msg": "legacy" } }))
            .unwrap();
        assert_eq!(env.meta.message.as_deref(), Some("legacy"));
    }

    #[test]
    fn missing_data_resolves_to_null() {
        let env = ReplyEnvelope::from_value(json!({ "meta": { "status": 200 } })).unwrap();
        assert_eq!(env.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn failure_into_application_error() {
        let err = ReplyEnvelope::failure(500, "boom").into_result().unwrap_err();
        assert!(matches!(err, RpcError::Application { status: 500, .. }));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn status_outside_http_range_keeps_message() {
        let env = ReplyEnvelope::from_value(json!({
            "meta": { "status": -1, "message": "worker exploded" }
        }))
        .unwrap();
        let err = env.into_result().unwrap_err();
        assert!(matches!(err, RpcError::Application { status: -1, .. }));
        assert_eq!(err.to_string(), "worker exploded");
    }

    #[test]
    fn rejects_envelope_without_meta() {
        let err = ReplyEnvelope::from_value(json!({ "data": 1 })).unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }
}
