use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Lifecycle of a cache entry. Transitions are monotone:
/// `Loading -> Complete` or `Loading -> Failed`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Loading,
    Complete,
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EntryStatus::Loading)
    }
}

#[derive(Debug)]
struct EntryState {
    buffer: Vec<u8>,
    status: EntryStatus,
}

/// One cached resource: an append-only buffer written by exactly one fetcher
/// and read concurrently by any number of stream servers.
///
/// The buffer and status live under the entry's own mutex; progress wakes go
/// through a [`Notify`] broadcast. Readers treat wakes as hints and re-check
/// state after waking. `ref_count` tracks attached consumers and is mutated
/// only by the directory while it holds its own lock.
#[derive(Debug)]
pub struct CacheEntry {
    key: String,
    created_at: Instant,
    state: Mutex<EntryState>,
    progress: Notify,
    ref_count: AtomicUsize,
}

/// Non-blocking view of an entry's committed bytes past a reader's offset.
#[derive(Debug)]
pub struct Snapshot {
    pub bytes: Vec<u8>,
    /// Committed length at snapshot time; the reader's next offset.
    pub offset: usize,
    pub status: EntryStatus,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            created_at: Instant::now(),
            state: Mutex::new(EntryState {
                buffer: Vec::new(),
                status: EntryStatus::Loading,
            }),
            progress: Notify::new(),
            ref_count: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn status(&self) -> EntryStatus {
        self.state.lock().status
    }

    pub fn size(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Producer-only append. Returns false (and drops the chunk) when the
    /// entry has already reached a terminal status, which happens when
    /// shutdown failed the entry underneath an in-flight fetch.
    pub fn append(&self, chunk: &[u8]) -> bool {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.buffer.extend_from_slice(chunk);
        }
        self.progress.notify_waiters();
        true
    }

    /// Producer-only terminal transition. No-op if already terminal.
    pub fn mark_complete(&self) {
        self.transition(EntryStatus::Complete);
    }

    /// Producer-only terminal transition, also used by shutdown drain.
    /// No-op if already terminal.
    pub fn mark_failed(&self) {
        self.transition(EntryStatus::Failed);
    }

    fn transition(&self, status: EntryStatus) {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
        }
        self.progress.notify_waiters();
    }

    /// Consumer-side snapshot of everything committed past `offset`. Never
    /// blocks; an `offset` beyond the committed length yields no bytes.
    pub fn read_from(&self, offset: usize) -> Snapshot {
        let state = self.state.lock();
        let committed = state.buffer.len();
        let bytes = if offset < committed {
            state.buffer[offset..].to_vec()
        } else {
            Vec::new()
        };
        Snapshot {
            bytes,
            offset: committed.max(offset),
            status: state.status,
        }
    }

    /// Block until the committed length advances past `offset`, the status
    /// turns terminal, or `deadline` elapses. Returns without guarantees
    /// either way: callers must re-check via [`read_from`](Self::read_from).
    pub async fn wait_for_progress(&self, offset: usize, deadline: Duration) {
        // The notified future must exist before the state re-check, otherwise
        // a wake landing between check and await would be lost.
        let notified = self.progress.notified();
        {
            let state = self.state.lock();
            if state.buffer.len() > offset || state.status.is_terminal() {
                return;
            }
        }
        let _ = tokio::time::timeout(deadline, notified).await;
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(super) fn attach(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn release(&self) -> usize {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "release without matching attach");
        previous - 1
    }
}
