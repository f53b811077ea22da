//! mqrpc-core
//!
//! Request / response RPC on top of a broker-mediated message queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（CorrelationId, queue 名, ReplyEnvelope, TaskRequest, RpcError）
//! - **ports**: 抽象化レイヤー（Broker / Connection / Channel, MessageCodec）
//! - **app**: CompletionTracker, TaskRegistry, Dispatcher, ServiceBuilder
//! - **typed**: handler API（MethodHandler, TypedMethod, MethodTable）
//! - **impls**: 実装（JsonCodec, InMemoryBroker）
//! - **config**: registry / worker の設定
//! - **observability**: 統計カウンタ

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use self::app::{
    AckHooks, Completion, CompletionTracker, Dispatcher, MessageHook, ServiceBuilder,
    ServiceDefinition, ServiceDescriptor, TaskRegistry, TaskResult,
};
pub use self::config::{TaskRegistryConfig, WorkerConfig};
pub use self::domain::{CorrelationId, ErrorKind, ReplyEnvelope, RpcError, TaskRequest};
pub use self::typed::{FnMethod, HandlerError, MethodHandler, TypedMethod};
