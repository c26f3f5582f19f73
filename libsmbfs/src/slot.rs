//! Handle slots: the two server handles a file may hold, plus the pool of
//! lock-only sub-handles hanging off the shared slot.

use crate::brl::ByteRangeLockTable;
use crate::durable::DurableHandleInfo;
use crate::error::{Result, SmbFsError};
use crate::intent::{AccessMode, OpenIntent};
use crate::rpc::{HandleId, LeaseState, Rights, ShareAccess};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Ordinary concurrent opens.
    Shared,
    /// Deny-mode opens (`O_EXLOCK`/`O_SHLOCK`).
    Exclusive,
}

impl SlotKind {
    pub const ALL: [SlotKind; 2] = [SlotKind::Shared, SlotKind::Exclusive];

    pub fn index(self) -> usize {
        match self {
            SlotKind::Shared => 0,
            SlotKind::Exclusive => 1,
        }
    }
}

/// Open counts per access mode, used for downgrade decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCounters {
    pub read: u32,
    pub write: u32,
    pub read_write: u32,
}

impl AccessCounters {
    fn counter(&mut self, access: AccessMode) -> &mut u32 {
        match access {
            AccessMode::Read => &mut self.read,
            AccessMode::Write => &mut self.write,
            AccessMode::ReadWrite => &mut self.read_write,
        }
    }

    pub fn incr(&mut self, access: AccessMode) {
        *self.counter(access) += 1;
    }

    pub fn decr(&mut self, access: AccessMode) -> Result<()> {
        let counter = self.counter(access);
        *counter = counter
            .checked_sub(1)
            .ok_or_else(|| SmbFsError::BadHandle(format!("no {access:?} opener to close")))?;
        Ok(())
    }

    pub fn total(&self) -> u32 {
        self.read + self.write + self.read_write
    }

    /// Smallest access mode covering every remaining opener.
    pub fn needed(&self) -> Option<AccessMode> {
        AccessMode::from_parts(
            self.read > 0 || self.read_write > 0,
            self.write > 0 || self.read_write > 0,
        )
    }
}

#[derive(Debug, Clone)]
pub struct HandleSlot {
    pub kind: SlotKind,
    pub remote: HandleId,
    pub refcount: u32,
    /// Access mode the server handle was granted.
    pub access: Option<AccessMode>,
    pub rights: Rights,
    pub share: ShareAccess,
    /// Deny semantics the handle was opened with.
    pub intent: Option<OpenIntent>,
    pub counters: AccessCounters,
    pub mmapped: Option<AccessMode>,
    pub is_exclusive_lock_open: bool,
    pub is_share_lock_open: bool,
    /// Lease state granted on this handle's open, if any.
    pub lease: Option<LeaseState>,
    /// The handle stays open on the server with no local opener.
    pub deferred: bool,
    pub durable: DurableHandleInfo,
    pub locks: ByteRangeLockTable,
}

impl HandleSlot {
    pub fn new(kind: SlotKind) -> Self {
        HandleSlot {
            kind,
            remote: HandleId::NONE,
            refcount: 0,
            access: None,
            rights: Rights::empty(),
            share: ShareAccess::empty(),
            intent: None,
            counters: AccessCounters::default(),
            mmapped: None,
            is_exclusive_lock_open: false,
            is_share_lock_open: false,
            lease: None,
            deferred: false,
            durable: DurableHandleInfo::default(),
            locks: ByteRangeLockTable::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.refcount > 0
    }

    /// Active or deferred: a server handle exists.
    pub fn is_open_on_wire(&self) -> bool {
        self.remote.is_valid()
    }

    pub fn add_opener(&mut self, access: AccessMode) {
        self.refcount += 1;
        self.counters.incr(access);
    }

    /// Forget the server handle and everything tied to it.
    pub fn reset(&mut self) {
        *self = HandleSlot::new(self.kind);
    }
}

/// A lock-only handle opened on demand for the shared slot.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub access: AccessMode,
    pub remote: HandleId,
    pub rights: Rights,
    pub durable: DurableHandleInfo,
    pub locks: ByteRangeLockTable,
}

/// Fixed-capacity pool of lock sub-handles, matched by access mode.
#[derive(Debug, Clone)]
pub struct LockHandlePool {
    handles: Vec<LockHandle>,
    capacity: usize,
}

impl LockHandlePool {
    pub fn new(capacity: usize) -> Self {
        LockHandlePool {
            handles: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn position(&self, access: AccessMode) -> Option<usize> {
        self.handles.iter().position(|h| h.access == access)
    }

    pub fn is_full(&self) -> bool {
        self.handles.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn push(&mut self, handle: LockHandle) -> usize {
        self.handles.push(handle);
        self.handles.len() - 1
    }

    pub fn get(&self, idx: usize) -> Option<&LockHandle> {
        self.handles.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut LockHandle> {
        self.handles.get_mut(idx)
    }

    pub fn remove(&mut self, idx: usize) -> LockHandle {
        self.handles.remove(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockHandle> {
        self.handles.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LockHandle> {
        self.handles.iter_mut()
    }

    pub fn drain(&mut self) -> Vec<LockHandle> {
        std::mem::take(&mut self.handles)
    }

    /// Union of the sub-handles' access; the shared handle must cover it.
    pub fn access_union(&self) -> Option<AccessMode> {
        self.handles
            .iter()
            .map(|h| h.access)
            .reduce(AccessMode::union)
    }
}
