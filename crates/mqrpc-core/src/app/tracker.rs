//! CompletionTracker - 1 回だけ解決される future + 任意の timeout
//!
//! # 状態遷移
//! - Pending → Completed（`complete`）
//! - Pending → Failed（`fail` または timeout）
//! - Completed / Failed は終端。以降の `complete` / `fail` は awaiter に届かず、
//!   `RpcError::AlreadyCompleted` として integrity sink に報告される
//!
//! # Timer
//! ttl があれば生成時に timer task を起動し、解決時に必ず abort します。
//! timer が先に発火した場合は `TimeoutExceeded` で Failed になります。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::domain::RpcError;

/// Integrity error の報告先（二重解決、awaiter 不在など）
pub type IntegritySink = Arc<dyn Fn(&RpcError) + Send + Sync>;

/// デフォルトの integrity sink: tracing に出す
pub fn log_integrity_error(err: &RpcError) {
    match err {
        RpcError::AwaiterDropped => warn!(error = %err, "completion has no awaiter"),
        _ => error!(error = %err, "completion tracker integrity error"),
    }
}

pub fn default_integrity_sink() -> IntegritySink {
    Arc::new(log_integrity_error)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Pending,
    Completed,
    Failed,
}

type Outcome = Result<Value, RpcError>;

struct TrackerInner {
    state: TrackerState,
    sender: Option<oneshot::Sender<Outcome>>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct CompletionTracker {
    inner: Arc<Mutex<TrackerInner>>,
    integrity: IntegritySink,
}

impl CompletionTracker {
    /// ttl 付きの tracker と、その結果を待つ `Completion` を作る
    ///
    /// ttl が `None` またはゼロなら timer は起動しない。
    pub fn new(ttl: Option<Duration>) -> (Self, Completion) {
        Self::with_integrity_sink(ttl, default_integrity_sink())
    }

    pub fn with_integrity_sink(ttl: Option<Duration>, integrity: IntegritySink) -> (Self, Completion) {
        let (tracker, completion) = Self::unarmed(integrity);
        if let Some(ttl) = effective_ttl(ttl) {
            let this = tracker.clone();
            tracker.arm(ttl, move || this.expire());
        }
        (tracker, completion)
    }

    /// timer なしで作る。timeout 時の処理を差し替えたい呼び出し側は `arm` する
    pub(crate) fn unarmed(integrity: IntegritySink) -> (Self, Completion) {
        let (sender, receiver) = oneshot::channel();
        let tracker = Self {
            inner: Arc::new(Mutex::new(TrackerInner {
                state: TrackerState::Pending,
                sender: Some(sender),
                timer: None,
            })),
            integrity,
        };
        (tracker, Completion { receiver })
    }

    /// ttl 経過後に `on_expire` を呼ぶ timer を起動する
    ///
    /// `on_expire` は最終的に `expire()` に到達しなければならない。
    pub(crate) fn arm<F>(&self, ttl: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            on_expire();
        });

        let mut inner = self.inner.lock();
        if inner.state == TrackerState::Pending {
            if let Some(previous) = inner.timer.replace(handle) {
                previous.abort();
            }
        } else {
            handle.abort();
        }
    }

    /// 起動済みの timer を止める。状態は変えない
    pub(crate) fn disarm(&self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
        }
    }

    pub fn complete(&self, value: Value) -> Result<(), RpcError> {
        self.resolve(Ok(value), true)
    }

    pub fn fail(&self, error: RpcError) -> Result<(), RpcError> {
        self.resolve(Err(error), true)
    }

    /// Timer 発火時の遷移。既に解決済みなら何もしない（abort と競合した場合）
    pub(crate) fn expire(&self) {
        let _ = self.resolve(Err(RpcError::TimeoutExceeded), false);
    }

    pub fn state(&self) -> TrackerState {
        self.inner.lock().state
    }

    pub fn is_pending(&self) -> bool {
        self.state() == TrackerState::Pending
    }

    fn resolve(&self, outcome: Outcome, report_conflict: bool) -> Result<(), RpcError> {
        let sender = {
            let mut inner = self.inner.lock();
            if inner.state != TrackerState::Pending {
                None
            } else {
                inner.state = if outcome.is_ok() {
                    TrackerState::Completed
                } else {
                    TrackerState::Failed
                };
                if let Some(timer) = inner.timer.take() {
                    timer.abort();
                }
                Some(inner.sender.take())
            }
        };

        let err = match sender {
            None if !report_conflict => return Err(RpcError::AlreadyCompleted),
            None => RpcError::AlreadyCompleted,
            Some(Some(sender)) => match sender.send(outcome) {
                Ok(()) => return Ok(()),
                Err(_) => RpcError::AwaiterDropped,
            },
            Some(None) => RpcError::AwaiterDropped,
        };
        (self.integrity)(&err);
        Err(err)
    }
}

impl fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("state", &self.state())
            .finish()
    }
}

fn effective_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|ttl| !ttl.is_zero())
}

/// Tracker の結果を 1 度だけ受け取る future
///
/// tracker が解決されないまま全て drop されると `RpcError::Abandoned` になる。
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<Outcome>,
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RpcError::Abandoned)))
    }
}
