use std::time::Duration;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::brl::ByteRangeLockEntry;
use crate::handle_set::FileHandleSet;
use crate::intent::AccessMode;
use crate::lease::{Lease, LeaseManager};
use crate::reconnect::{ReconnectCoordinator, ReconnectState};
use crate::rpc::{FileAttrs, HandleId, LeaseKey};
use crate::slot::{AccessCounters, HandleSlot, SlotKind};

/// One cached file (or named stream) of the share.
///
/// The handle set sits behind an async lock that is held across server
/// round trips; the lease and reconnect flags have their own, cheaper
/// synchronization because break notifications and session events touch
/// them without going through the node lock.
#[derive(Debug)]
pub struct FileNode {
    pub(crate) path: String,
    pub(crate) is_stream: bool,
    pub(crate) lease: LeaseManager,
    pub(crate) reconnect: ReconnectCoordinator,
    pub(crate) handles: RwLock<FileHandleSet>,
}

impl FileNode {
    pub(crate) fn new(path: &str, max_lock_handles: usize) -> Self {
        FileNode {
            path: path.to_string(),
            is_stream: is_stream_path(path),
            lease: LeaseManager::new(LeaseKey::random()),
            reconnect: ReconnectCoordinator::new(),
            handles: RwLock::new(FileHandleSet::new(max_lock_handles)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_stream(&self) -> bool {
        self.is_stream
    }

    pub fn lease_key(&self) -> LeaseKey {
        self.lease.key()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.reconnect.state()
    }

    pub fn reopen_attempts(&self) -> u64 {
        self.reconnect.reopen_attempts()
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        let set = self.handles.read().await;
        NodeSnapshot {
            shared: SlotSnapshot::from(set.slot(SlotKind::Shared)),
            exclusive: SlotSnapshot::from(set.slot(SlotKind::Exclusive)),
            lock_handles: set.lock_handles().len(),
            lock_count: set.lock_count(),
            delete_on_close: set.delete_on_close,
            attrs: set.attrs(),
            state: self.reconnect.state(),
            lease: self.lease.snapshot(),
        }
    }
}

/// `file:stream` names a named data stream of `file`.
fn is_stream_path(path: &str) -> bool {
    path.rsplit('/').next().is_some_and(|name| name.contains(':'))
}

/// Point-in-time view of a slot, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub remote: HandleId,
    pub refcount: u32,
    pub access: Option<AccessMode>,
    pub counters: AccessCounters,
    pub deferred: bool,
    pub mmapped: bool,
    pub locks: Vec<ByteRangeLockEntry>,
    pub durable_granted: bool,
    pub durable_timeout: Duration,
    pub create_guid: Option<Uuid>,
}

impl From<&HandleSlot> for SlotSnapshot {
    fn from(slot: &HandleSlot) -> Self {
        SlotSnapshot {
            remote: slot.remote,
            refcount: slot.refcount,
            access: slot.access,
            counters: slot.counters,
            deferred: slot.deferred,
            mmapped: slot.mmapped.is_some(),
            locks: slot.locks.iter().copied().collect(),
            durable_granted: slot.durable.is_granted(),
            durable_timeout: slot.durable.timeout,
            create_guid: slot.durable.create_guid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub shared: SlotSnapshot,
    pub exclusive: SlotSnapshot,
    pub lock_handles: usize,
    pub lock_count: usize,
    pub delete_on_close: bool,
    pub attrs: Option<FileAttrs>,
    pub state: ReconnectState,
    pub lease: Lease,
}
