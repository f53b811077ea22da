//! Observability - registry / dispatcher の累積カウンタ
//!
//! カウンタは `AtomicU64`（Relaxed）で、consumer loop から lock なしで更新します。
//! 外へ出すときは `snapshot()` で serializable な値にコピーします。

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// TaskRegistry（client 側）の統計
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub published: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub timeouts: AtomicU64,
    /// 対応する pending request が無かった reply
    pub unmatched_replies: AtomicU64,
    pub malformed_replies: AtomicU64,
}

impl RegistryStats {
    pub fn snapshot(&self, pending: usize) -> RegistrySnapshot {
        RegistrySnapshot {
            published: self.published.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            unmatched_replies: self.unmatched_replies.load(Ordering::Relaxed),
            malformed_replies: self.malformed_replies.load(Ordering::Relaxed),
            pending,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub published: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub unmatched_replies: u64,
    pub malformed_replies: u64,
    pub pending: usize,
}

/// Dispatcher（worker 側）の統計
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub received: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub malformed: AtomicU64,
    /// reply_to が無く返信できなかったメッセージ
    pub unroutable: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self, consumers: usize) -> DispatcherSnapshot {
        DispatcherSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            consumers,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub malformed: u64,
    pub unroutable: u64,
    pub consumers: usize,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
