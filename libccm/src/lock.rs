//! Per-volume mutual exclusion.
//!
//! Handlers for the same volume ID are serialized; different IDs never
//! contend.  Entries live in the table only while someone holds or waits for
//! them, so the table size tracks in-flight work rather than history.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::VolumeId;

/// Table of per-volume locks.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    entries: DashMap<VolumeId, Arc<Mutex<()>>>,
}

/// Exclusive access to one volume ID; released on drop.
#[derive(Debug)]
pub struct VolumeGuard<'a> {
    // Field order matters: the mutex unlocks before the entry is pruned.
    _guard: OwnedMutexGuard<()>,
    _pending: Pending<'a>,
}

/// Holds a reference to a table entry and prunes it once unused.
#[derive(Debug)]
struct Pending<'a> {
    locks: &'a VolumeLocks,
    volume_id: VolumeId,
    entry: Option<Arc<Mutex<()>>>,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.entry.take();
        self.locks.prune(&self.volume_id);
    }
}

impl VolumeLocks {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self, volume_id: &VolumeId) -> (Pending<'_>, Arc<Mutex<()>>) {
        let mutex = Arc::clone(
            self.entries
                .entry(volume_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let pending = Pending {
            locks: self,
            volume_id: volume_id.clone(),
            entry: Some(Arc::clone(&mutex)),
        };
        (pending, mutex)
    }

    /// Wait for exclusive access to `volume_id`.
    ///
    /// Cancel safe: dropping the future while waiting leaves no entry behind.
    pub async fn acquire(&self, volume_id: &VolumeId) -> VolumeGuard<'_> {
        let (pending, mutex) = self.pending(volume_id);
        let guard = mutex.lock_owned().await;
        VolumeGuard {
            _guard: guard,
            _pending: pending,
        }
    }

    /// Take `volume_id` if nobody holds it.
    pub fn try_acquire(&self, volume_id: &VolumeId) -> Option<VolumeGuard<'_>> {
        let (pending, mutex) = self.pending(volume_id);
        let guard = mutex.try_lock_owned().ok()?;
        Some(VolumeGuard {
            _guard: guard,
            _pending: pending,
        })
    }

    /// Number of entries currently in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&self, volume_id: &VolumeId) {
        // The table's own reference is the only one left when nobody holds
        // or waits for the lock. `remove_if` runs under the shard lock, so
        // no new reference can appear between the check and the removal.
        self.entries
            .remove_if(volume_id, |_, entry| Arc::strong_count(entry) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_is_serialized() {
        let locks = Arc::new(VolumeLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (locks, active, max_seen) =
                (Arc::clone(&locks), Arc::clone(&active), Arc::clone(&max_seen));
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(&VolumeId::from("vol-1")).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_ids_do_not_contend() {
        let locks = VolumeLocks::new();
        let _a = locks.acquire(&VolumeId::from("vol-a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&VolumeId::from("vol-b")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn try_acquire_reports_busy() {
        let locks = VolumeLocks::new();
        let id = VolumeId::from("vol-1");
        let held = locks.acquire(&id).await;
        assert!(locks.try_acquire(&id).is_none());
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());

        let guard = locks.try_acquire(&id);
        assert!(guard.is_some());
        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_entry() {
        let locks = VolumeLocks::new();
        let id = VolumeId::from("vol-1");
        let held = locks.acquire(&id).await;

        let waited = tokio::time::timeout(Duration::from_millis(20), locks.acquire(&id)).await;
        assert!(waited.is_err());
        assert_eq!(locks.len(), 1);

        drop(held);
        assert!(locks.is_empty());
    }
}
