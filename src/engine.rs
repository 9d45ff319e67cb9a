//! External collaborator seams: storage engine, replication throttle,
//! connection manager, memory attribution.
//!
//! The consumer core never talks to the key-value store, the checkpoint
//! machinery, or the host connection manager directly; it goes through the
//! traits here. The concrete [`VBucket`] handle is the one shared structure:
//! the engine owns the partitions, the consumer reads and updates them
//! through interior mutability.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::failover::{FailoverEntry, FailoverTable};
use crate::message::{MutationPayload, VBucketState, Vbid};
use crate::wire::WireError;

/// What the storage engine reported for an apply operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("temporary failure, retry")]
    TmpFail,
    #[error("memory pressure, retry")]
    Oom,
    #[error("partition not owned")]
    NotMyVbucket,
    #[error("key not found")]
    KeyEnoent,
    #[error("storage failure: {0}")]
    Other(&'static str),
}

/// Outcome of a storage rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStatus {
    Success,
    TmpFail,
    NotMyVbucket,
}

/// Priority for a scheduled partition snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPriority {
    High,
    Low,
}

/// Checkpoint snapshot coordinates for a partition: the current seqno and
/// the open snapshot window around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotInfo {
    pub start: u64,
    pub range: SnapshotRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotRange {
    pub start: u64,
    pub end: u64,
}

/// In-memory partition handle returned by the engine. Mutated from the
/// network thread and read from the processor thread.
#[derive(Debug)]
pub struct VBucket {
    vbid: Vbid,
    state: Mutex<VBucketState>,
    high_seqno: AtomicU64,
    failovers: Mutex<FailoverTable>,
    snapshot: Mutex<SnapshotInfo>,
    backfill_phase: AtomicBool,
}

impl VBucket {
    pub fn new(vbid: Vbid, state: VBucketState, failover_uuid: u64) -> Self {
        Self {
            vbid,
            state: Mutex::new(state),
            high_seqno: AtomicU64::new(0),
            failovers: Mutex::new(FailoverTable::new(failover_uuid)),
            snapshot: Mutex::new(SnapshotInfo::default()),
            backfill_phase: AtomicBool::new(false),
        }
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn state(&self) -> VBucketState {
        *self.state.lock().expect("vbucket state lock poisoned")
    }

    pub fn set_state(&self, state: VBucketState) {
        *self.state.lock().expect("vbucket state lock poisoned") = state;
    }

    pub fn high_seqno(&self) -> u64 {
        self.high_seqno.load(Ordering::Relaxed)
    }

    pub fn set_high_seqno(&self, seqno: u64) {
        self.high_seqno.store(seqno, Ordering::Relaxed);
    }

    pub fn snapshot_info(&self) -> SnapshotInfo {
        *self.snapshot.lock().expect("vbucket snapshot lock poisoned")
    }

    /// Open a fresh snapshot window.
    pub fn create_snapshot(&self, start: u64, end: u64) {
        let mut info = self.snapshot.lock().expect("vbucket snapshot lock poisoned");
        info.range = SnapshotRange { start, end };
    }

    /// Extend the current snapshot window.
    pub fn update_snapshot_end(&self, end: u64) {
        let mut info = self.snapshot.lock().expect("vbucket snapshot lock poisoned");
        info.range.end = end;
    }

    pub fn set_current_seqno(&self, seqno: u64) {
        let mut info = self.snapshot.lock().expect("vbucket snapshot lock poisoned");
        info.start = seqno;
    }

    pub fn is_backfill_phase(&self) -> bool {
        self.backfill_phase.load(Ordering::Relaxed)
    }

    pub fn set_backfill_phase(&self, backfill: bool) {
        self.backfill_phase.store(backfill, Ordering::Relaxed);
    }

    pub fn latest_failover_entry(&self) -> FailoverEntry {
        self.failovers
            .lock()
            .expect("failover lock poisoned")
            .latest_entry()
    }

    pub fn failover_entries(&self) -> Vec<FailoverEntry> {
        self.failovers
            .lock()
            .expect("failover lock poisoned")
            .entries()
            .to_vec()
    }

    /// Install the failover log from a stream-request response body,
    /// replacing the current table.
    pub fn replace_failover_log(&self, body: &[u8]) -> Result<(), WireError> {
        self.failovers
            .lock()
            .expect("failover lock poisoned")
            .replace_from_wire(body)
    }
}

/// Storage/engine bridge consumed by the core.
pub trait EngineBridge: Send + Sync {
    fn get_vbucket(&self, vbid: Vbid) -> Option<Arc<VBucket>>;

    /// Apply a replicated write carrying its own metadata.
    fn set_with_meta(&self, vbid: Vbid, mutation: &MutationPayload) -> Result<(), StoreError>;

    /// Apply a replicated delete carrying its own metadata.
    fn delete_with_meta(&self, vbid: Vbid, deletion: &MutationPayload) -> Result<(), StoreError>;

    /// Apply a write arriving while the partition is in backfill phase.
    fn add_backfill_item(&self, vbid: Vbid, mutation: &MutationPayload) -> Result<(), StoreError>;

    fn set_vbucket_state(&self, vbid: Vbid, state: VBucketState) -> Result<(), StoreError>;

    /// Roll the partition back to at most `seqno`.
    fn rollback(&self, vbid: Vbid, seqno: u64) -> RollbackStatus;

    /// Queue a persistence snapshot for the partition.
    fn schedule_vb_snapshot(&self, priority: SnapshotPriority, vbid: Vbid);

    /// Replication throttle admission gate; `false` means back off.
    fn should_process(&self) -> bool;
}

/// Host connection-manager hook: wake a paused connection so the host calls
/// `step` again (and optionally schedule it for immediate processing).
pub trait ConnectionNotifier: Send + Sync {
    fn notify_connection(&self, schedule: bool);
}

/// No-op notifier for hosts that poll.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl ConnectionNotifier for NullNotifier {
    fn notify_connection(&self, _schedule: bool) {}
}

/// Process-wide allocator attribution switch. Callbacks into host-owned
/// code (the producers sink) must run with host attribution; the guard
/// restores engine attribution on every exit path.
pub trait MemoryTracker: Send + Sync {
    fn switch_to_host(&self);
    fn switch_to_engine(&self);
}

/// Tracker for hosts without allocator attribution.
#[derive(Debug, Default)]
pub struct NullTracker;

impl MemoryTracker for NullTracker {
    fn switch_to_host(&self) {}
    fn switch_to_engine(&self) {}
}

/// RAII guard switching attribution to the host for the duration of a
/// producers callback.
pub struct HostAllocScope<'a> {
    tracker: &'a dyn MemoryTracker,
}

impl<'a> HostAllocScope<'a> {
    pub fn enter(tracker: &'a dyn MemoryTracker) -> Self {
        tracker.switch_to_host();
        Self { tracker }
    }
}

impl Drop for HostAllocScope<'_> {
    fn drop(&mut self) {
        self.tracker.switch_to_engine();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn vbucket_snapshot_window_updates() {
        let vb = VBucket::new(Vbid::new(0), VBucketState::Replica, 0xabc);
        vb.create_snapshot(5, 10);
        assert_eq!(vb.snapshot_info().range, SnapshotRange { start: 5, end: 10 });
        vb.update_snapshot_end(20);
        assert_eq!(vb.snapshot_info().range.end, 20);
    }

    #[test]
    fn vbucket_failover_replacement() {
        let vb = VBucket::new(Vbid::new(3), VBucketState::Replica, 1);
        let mut body = Vec::new();
        body.extend_from_slice(&77u64.to_be_bytes());
        body.extend_from_slice(&123u64.to_be_bytes());
        vb.replace_failover_log(&body).expect("replace");
        assert_eq!(vb.latest_failover_entry().uuid, 77);
        assert_eq!(vb.latest_failover_entry().seqno, 123);
    }

    struct CountingTracker {
        host: AtomicUsize,
        engine: AtomicUsize,
    }

    impl MemoryTracker for CountingTracker {
        fn switch_to_host(&self) {
            self.host.fetch_add(1, Ordering::SeqCst);
        }
        fn switch_to_engine(&self) {
            self.engine.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn alloc_scope_restores_on_drop() {
        let tracker = CountingTracker {
            host: AtomicUsize::new(0),
            engine: AtomicUsize::new(0),
        };
        {
            let _scope = HostAllocScope::enter(&tracker);
            assert_eq!(tracker.host.load(Ordering::SeqCst), 1);
            assert_eq!(tracker.engine.load(Ordering::SeqCst), 0);
        }
        assert_eq!(tracker.engine.load(Ordering::SeqCst), 1);
    }
}
