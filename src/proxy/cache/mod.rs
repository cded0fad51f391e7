use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

mod entry;

pub use entry::{CacheEntry, EntryStatus, Snapshot};

/// Returned by [`CacheDirectory::lookup_or_create`] when the directory is at
/// capacity and every entry is either still loading or still referenced.
#[derive(Debug, Error)]
#[error("cache directory full ({max_entries} entries) with nothing evictable")]
pub struct CapacityExceeded {
    pub max_entries: usize,
}

/// Per-entry snapshot used by the periodic statistics reporter.
#[derive(Debug, Clone)]
pub struct EntryStats {
    pub key: String,
    pub size: usize,
    pub ref_count: usize,
    pub status: EntryStatus,
    pub age: Duration,
}

/// Bounded key -> entry registry. Cloning is cheap and shares the registry.
///
/// All map mutation, the ref-count protocol and admission/eviction run under
/// a single directory-wide mutex; none of those critical sections perform I/O
/// or wait on entry progress.
#[derive(Clone)]
pub struct CacheDirectory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
    max_entries: usize,
}

impl CacheDirectory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                entries: Mutex::new(HashMap::new()),
                max_entries,
            }),
        }
    }

    /// Find or admit the entry for `key`. The returned handle keeps the
    /// consumer attached until dropped; `created` tells the caller whether it
    /// is responsible for spawning the fetcher.
    ///
    /// Admission at capacity makes one eviction pass over entries that are
    /// terminal and unreferenced, removing the first found (map iteration
    /// order, no stronger tie-break). Entries that are still loading or still
    /// being read are never evicted.
    pub fn lookup_or_create(&self, key: &str) -> Result<(EntryHandle, bool), CapacityExceeded> {
        let mut entries = self.inner.entries.lock();

        if let Some(entry) = entries.get(key) {
            let entry = entry.clone();
            entry.attach();
            return Ok((self.handle(entry), false));
        }

        if entries.len() >= self.inner.max_entries {
            let victim = entries
                .iter()
                .find(|(_, entry)| entry.ref_count() == 0 && entry.status().is_terminal())
                .map(|(key, _)| key.clone());
            match victim {
                Some(victim) => {
                    entries.remove(&victim);
                    debug!(key = %victim, "evicted idle cache entry");
                }
                None => {
                    warn!(
                        max_entries = self.inner.max_entries,
                        "cache directory full with nothing evictable"
                    );
                    return Err(CapacityExceeded {
                        max_entries: self.inner.max_entries,
                    });
                }
            }
        }

        let entry = Arc::new(CacheEntry::new(key));
        entry.attach();
        entries.insert(key.to_string(), entry.clone());
        debug!(key, entries = entries.len(), "created cache entry");
        Ok((self.handle(entry), true))
    }

    fn handle(&self, entry: Arc<CacheEntry>) -> EntryHandle {
        EntryHandle {
            directory: self.clone(),
            entry,
        }
    }

    fn release(&self, entry: &CacheEntry) {
        let _entries = self.inner.entries.lock();
        let remaining = entry.release();
        debug!(key = %entry.key(), remaining, "released cache entry");
        // Eviction stays lazy: a zero ref count only makes the entry a
        // candidate for the next admission that needs room.
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn stats(&self) -> Vec<EntryStats> {
        let entries = self.inner.entries.lock();
        entries
            .values()
            .map(|entry| EntryStats {
                key: entry.key().to_string(),
                size: entry.size(),
                ref_count: entry.ref_count(),
                status: entry.status(),
                age: entry.age(),
            })
            .collect()
    }

    /// Shutdown drain: fail every still-loading entry (waking all blocked
    /// readers), wait up to `grace` for attached readers to finish their
    /// final sends, then drop the registry. Readers that outlive the grace
    /// period keep their entry alive through their own `Arc` until they exit.
    pub async fn drain(&self, grace: Duration) {
        let snapshot: Vec<Arc<CacheEntry>> = {
            let entries = self.inner.entries.lock();
            entries.values().cloned().collect()
        };
        info!(entries = snapshot.len(), "draining cache directory");
        for entry in &snapshot {
            entry.mark_failed();
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let attached: usize = snapshot.iter().map(|entry| entry.ref_count()).sum();
            if attached == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(attached, "drain grace period elapsed with readers attached");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.inner.entries.lock().clear();
        info!("cache directory drained");
    }
}

impl fmt::Debug for CacheDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheDirectory")
            .field("entries", &self.len())
            .field("max_entries", &self.inner.max_entries)
            .finish()
    }
}

/// Scoped attachment to a cache entry. Dropping the handle releases the
/// reference exactly once, on every exit path.
pub struct EntryHandle {
    directory: CacheDirectory,
    entry: Arc<CacheEntry>,
}

impl EntryHandle {
    /// Shared ownership of the underlying entry, e.g. for handing to a
    /// fetcher task. The clone does not count as an attachment.
    pub fn entry(&self) -> Arc<CacheEntry> {
        self.entry.clone()
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("key", &self.entry.key())
            .field("ref_count", &self.entry.ref_count())
            .finish()
    }
}

impl Deref for EntryHandle {
    type Target = CacheEntry;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        self.directory.release(&self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(max_entries: usize) -> CacheDirectory {
        CacheDirectory::new(max_entries)
    }

    #[test]
    fn second_lookup_shares_the_entry() {
        let dir = directory(4);
        let (first, created) = dir.lookup_or_create("example.com:80/").unwrap();
        assert!(created);
        let (second, created) = dir.lookup_or_create("example.com:80/").unwrap();
        assert!(!created);
        assert_eq!(first.ref_count(), 2);

        first.append(b"shared");
        assert_eq!(second.read_from(0).bytes, b"shared");
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn handle_drop_releases_exactly_once() {
        let dir = directory(4);
        let (handle, _) = dir.lookup_or_create("example.com:80/").unwrap();
        let entry = handle.entry();
        assert_eq!(entry.ref_count(), 1);
        drop(handle);
        assert_eq!(entry.ref_count(), 0);
    }

    #[test]
    fn directory_and_handle_render_debug_state() {
        let dir = directory(2);
        let (handle, _) = dir.lookup_or_create("a:80/").unwrap();
        let rendered = format!("{handle:?} {dir:?}");
        assert!(rendered.contains("a:80/"), "{rendered}");
        assert!(rendered.contains("max_entries: 2"), "{rendered}");
    }

    #[test]
    fn capacity_exceeded_when_nothing_evictable() {
        let dir = directory(1);
        let (loading, created) = dir.lookup_or_create("a:80/").unwrap();
        assert!(created);

        // Entry is Loading and referenced: admission of a new key must fail.
        let err = dir.lookup_or_create("b:80/").unwrap_err();
        assert_eq!(err.max_entries, 1);
        assert_eq!(dir.len(), 1);

        // Terminal but still referenced: still not evictable.
        loading.mark_complete();
        assert!(dir.lookup_or_create("b:80/").is_err());
        drop(loading);

        // Terminal and unreferenced: next admission evicts it.
        let (_fresh, created) = dir.lookup_or_create("b:80/").unwrap();
        assert!(created);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn loading_entries_survive_eviction_pass() {
        let dir = directory(2);
        let (loading, _) = dir.lookup_or_create("a:80/").unwrap();
        let entry = loading.entry();
        drop(loading);
        // ref_count is 0 but status is Loading: must not be evicted.
        let (done, _) = dir.lookup_or_create("b:80/").unwrap();
        done.mark_complete();
        drop(done);

        let (_new, created) = dir.lookup_or_create("c:80/").unwrap();
        assert!(created);
        assert_eq!(entry.status(), EntryStatus::Loading);
        let keys: Vec<String> = dir.stats().into_iter().map(|s| s.key).collect();
        assert!(keys.contains(&"a:80/".to_string()), "loading entry evicted");
        assert!(!keys.contains(&"b:80/".to_string()), "terminal entry kept");
    }

    #[test]
    fn stress_attach_release_returns_to_zero() {
        let dir = directory(4);
        let (origin, _) = dir.lookup_or_create("example.com:80/").unwrap();
        let entry = origin.entry();

        let handles: Vec<EntryHandle> = (0..64)
            .map(|_| dir.lookup_or_create("example.com:80/").unwrap().0)
            .collect();
        assert_eq!(entry.ref_count(), 65);
        drop(handles);
        drop(origin);
        assert_eq!(entry.ref_count(), 0);
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn drain_fails_loading_entries_and_clears() {
        let dir = directory(4);
        let (loading, _) = dir.lookup_or_create("a:80/").unwrap();
        let (complete, _) = dir.lookup_or_create("b:80/").unwrap();
        complete.mark_complete();
        let loading_entry = loading.entry();
        let complete_entry = complete.entry();
        drop(loading);
        drop(complete);

        dir.drain(Duration::from_millis(200)).await;

        assert_eq!(loading_entry.status(), EntryStatus::Failed);
        // Completed entries are not retroactively failed.
        assert_eq!(complete_entry.status(), EntryStatus::Complete);
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn drain_waits_for_attached_readers() {
        let dir = directory(4);
        let (handle, _) = dir.lookup_or_create("a:80/").unwrap();
        let entry = handle.entry();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(handle);
        });

        dir.drain(Duration::from_secs(2)).await;
        release.await.unwrap();
        assert_eq!(entry.ref_count(), 0);
        assert!(dir.is_empty());
    }
}
