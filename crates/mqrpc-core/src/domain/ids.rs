//! Correlation identifiers.
//!
//! # 生成規則
//! - 呼び出し側が指定しなければ ULID 文字列を生成する
//! - ULID は時刻でソート可能で、調整なしに複数プロセスで生成できる
//! - 指定された場合はそのまま使う（ブローカー上では opaque な文字列）

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Reply queue の suffix 長（衝突回避のため 10 文字以上）
pub const REPLY_SUFFIX_LEN: usize = 10;

/// Request と reply を結び付ける識別子
///
/// ブローカーの `correlation_id` プロパティにそのまま載るため、
/// 内部表現は文字列です。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// ULID ベースの新しい ID を生成
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 英数字のランダム文字列を生成（reply queue の suffix 用）
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
