//! Configuration for the client registry and the worker dispatcher.
//!
//! どれも `serde::Deserialize` なので、ファイルや環境変数からの読み込みは
//! 呼び出し側（CLI など）に任せます。時間は milliseconds で持ちます。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::queue_name;
use crate::ports::QueueOptions;

fn default_auto_delete() -> bool {
    true
}

/// Queue 宣言時のオプション
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_auto_delete")]
    pub auto_delete: bool,

    #[serde(default)]
    pub message_ttl_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            auto_delete: default_auto_delete(),
            message_ttl_ms: None,
        }
    }
}

impl QueueConfig {
    pub fn message_ttl(&self) -> Option<Duration> {
        self.message_ttl_ms.map(Duration::from_millis)
    }

    pub fn to_options(&self, exclusive: bool) -> QueueOptions {
        QueueOptions {
            exclusive,
            auto_delete: self.auto_delete,
            message_ttl: self.message_ttl(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub no_ack: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageConfig {
    /// TaskRequest に ttl が無いときのデフォルト
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

impl MessageConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// TaskRegistry の設定
///
/// 1 つの registry は 1 つの service method（`<service>.<method>`）を呼び出します。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRegistryConfig {
    pub id: String,
    pub connection_uri: String,
    pub service: String,
    pub method: String,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub message: MessageConfig,
}

impl TaskRegistryConfig {
    pub fn new(
        id: impl Into<String>,
        connection_uri: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            connection_uri: connection_uri.into(),
            service: service.into(),
            method: method.into(),
            queue: QueueConfig::default(),
            consumer: ConsumerConfig::default(),
            message: MessageConfig::default(),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.message.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.consumer.no_ack = no_ack;
        self
    }

    /// publish 先の queue 名
    pub fn target_queue(&self) -> String {
        queue_name(&self.service, &self.method)
    }
}

/// Dispatcher（worker 側）の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub connection_uri: String,

    #[serde(default)]
    pub queue: QueueConfig,
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, connection_uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connection_uri: connection_uri.into(),
            queue: QueueConfig::default(),
        }
    }
}
