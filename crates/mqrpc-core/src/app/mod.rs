//! App - アプリケーション層
//!
//! ports を組み合わせて RPC の client / worker を実装します。
//!
//! # 主要コンポーネント
//! - **ServiceBuilder**: service 定義（method 名 → handler）の構築
//! - **CompletionTracker**: 1 回だけ解決される結果 + timeout
//! - **TaskRegistry**: client 側。request の publish と reply の相関
//! - **Dispatcher**: worker 側。request の consume、handler 実行、reply と ack/nack

pub mod builder;
pub mod dispatcher;
pub mod task_registry;
pub mod tracker;

// 主要な型を再エクスポート
pub use self::builder::{ServiceBuilder, ServiceDefinition, ServiceDescriptor};
pub use self::dispatcher::{AckHooks, Dispatcher, MessageHook};
pub use self::task_registry::{TaskRegistry, TaskResult};
pub use self::tracker::{
    Completion, CompletionTracker, IntegritySink, TrackerState, default_integrity_sink,
    log_integrity_error,
};
