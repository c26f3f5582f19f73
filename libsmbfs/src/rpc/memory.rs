//! In-process SMB server: enough open/lease/durable/lock semantics to drive
//! the client core in tests and demos, plus fault injection and call counters.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    CloseFlags, CreateDisposition, DurableGrant, FileAttrs, HandleId, LeaseKey, LeaseState,
    LockRequest, OpenReply, OpenRequest, ReclaimRequest, Rights, ShareAccess, SmbRpc,
};
use crate::error::RpcError;

/// Knobs that change how the server answers.
#[derive(Debug, Clone)]
pub struct Faults {
    /// Opens asking for any of these rights fail with `AccessDenied`.
    pub deny_rights: Rights,
    pub grant_leases: bool,
    pub grant_durable: bool,
    pub allow_persistent: bool,
    /// When false every durable reclaim fails.
    pub allow_reclaim: bool,
    /// Durable timeout granted on open and reclaim instead of the requested one.
    pub durable_timeout: Option<Duration>,
    /// Held before a lease break acknowledgement completes.
    pub lease_break_ack_delay: Duration,
}

impl Default for Faults {
    fn default() -> Self {
        Faults {
            deny_rights: Rights::empty(),
            grant_leases: true,
            grant_durable: true,
            allow_persistent: false,
            allow_reclaim: true,
            durable_timeout: None,
            lease_break_ack_delay: Duration::ZERO,
        }
    }
}

/// Per-primitive call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcStats {
    pub opens: u64,
    pub closes: u64,
    pub locks: u64,
    pub unlocks: u64,
    pub reads: u64,
    pub writes: u64,
    pub reclaims: u64,
    pub lease_break_acks: u64,
    pub deletes: u64,
    pub last_close_flags: Option<CloseFlags>,
    pub last_open_rights: Option<Rights>,
    pub last_open_lease: Option<LeaseState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLock {
    pub handle: HandleId,
    pub owner_pid: u32,
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
}

impl ServerLock {
    fn overlaps(&self, offset: u64, length: u64) -> bool {
        if self.length == 0 || length == 0 {
            return self.offset == offset && self.length == length;
        }
        self.offset < offset.saturating_add(length) && offset < self.offset.saturating_add(self.length)
    }
}

#[derive(Debug, Default)]
struct ServerFile {
    data: Vec<u8>,
    change_time: u64,
    locks: Vec<ServerLock>,
    lease: Option<(LeaseKey, LeaseState)>,
}

impl ServerFile {
    fn attrs(&self) -> FileAttrs {
        FileAttrs {
            size: self.data.len() as u64,
            change_time: self.change_time,
        }
    }
}

#[derive(Debug, Clone)]
struct ServerHandle {
    path: String,
    rights: Rights,
    share: ShareAccess,
    lease_key: Option<LeaseKey>,
    create_guid: Option<Uuid>,
    durable: Option<DurableGrant>,
}

#[derive(Debug, Default)]
struct ServerState {
    files: HashMap<String, ServerFile>,
    handles: HashMap<HandleId, ServerHandle>,
    /// Handles orphaned by a session drop that are held for durable reclaim.
    durable: HashMap<Uuid, (HandleId, ServerHandle)>,
    stale: HashSet<HandleId>,
    next_handle: u64,
    faults: Faults,
    stats: RpcStats,
}

impl ServerState {
    fn check_handle(&self, handle: HandleId) -> Result<&ServerHandle, RpcError> {
        if self.stale.contains(&handle) {
            return Err(RpcError::Reconnect);
        }
        self.handles.get(&handle).ok_or(RpcError::InvalidHandle)
    }

    fn share_conflict(&self, path: &str, rights: Rights, share: ShareAccess) -> bool {
        self.handles.values().filter(|h| h.path == path).any(|h| {
            (rights.can_read() && !h.share.contains(ShareAccess::READ))
                || (rights.can_write() && !h.share.contains(ShareAccess::WRITE))
                || (h.rights.can_read() && !share.contains(ShareAccess::READ))
                || (h.rights.can_write() && !share.contains(ShareAccess::WRITE))
        })
    }

    fn alloc_handle(&mut self) -> HandleId {
        self.next_handle += 1;
        HandleId(self.next_handle)
    }

    fn grant_lease(&mut self, path: &str, req: Option<&super::LeaseRequest>) -> Option<LeaseState> {
        let req = req?;
        if !self.faults.grant_leases {
            return None;
        }
        let file = self.files.get_mut(path)?;
        match file.lease {
            Some((key, _)) if key != req.key => None,
            _ => {
                file.lease = Some((req.key, req.state));
                Some(req.state)
            }
        }
    }

    fn release_lease_if_unused(&mut self, path: &str, key: Option<LeaseKey>) {
        let Some(key) = key else { return };
        let still_used = self
            .handles
            .values()
            .any(|h| h.path == path && h.lease_key == Some(key));
        if still_used {
            return;
        }
        if let Some(file) = self.files.get_mut(path) {
            if matches!(file.lease, Some((k, _)) if k == key) {
                file.lease = None;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryServer {
    state: Mutex<ServerState>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_file(&self, path: &str, data: &[u8]) {
        let mut st = self.state();
        let file = st.files.entry(path.to_string()).or_default();
        file.data = data.to_vec();
        file.change_time += 1;
    }

    /// Remove a file behind the client's back, including any durable handle
    /// the server was holding for it.
    pub fn remove_file(&self, path: &str) {
        let mut st = self.state();
        st.files.remove(path);
        st.durable.retain(|_, (_, h)| h.path != path);
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.state().files.contains_key(path)
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).map(|f| f.data.clone())
    }

    pub fn set_faults(&self, update: impl FnOnce(&mut Faults)) {
        update(&mut self.state().faults);
    }

    pub fn stats(&self) -> RpcStats {
        self.state().stats.clone()
    }

    pub fn open_handle_count(&self, path: &str) -> usize {
        self.state().handles.values().filter(|h| h.path == path).count()
    }

    pub fn locks_on(&self, path: &str) -> Vec<ServerLock> {
        self.state()
            .files
            .get(path)
            .map(|f| f.locks.clone())
            .unwrap_or_default()
    }

    pub fn lease_on(&self, path: &str) -> Option<(LeaseKey, LeaseState)> {
        self.state().files.get(path).and_then(|f| f.lease)
    }

    /// Simulate a session drop: every live handle goes stale. Durable ones
    /// are parked for reclaim together with their locks; the rest lose theirs.
    pub fn drop_session(&self) {
        let mut st = self.state();
        let handles: Vec<(HandleId, ServerHandle)> = st.handles.drain().collect();
        for (id, handle) in handles {
            st.stale.insert(id);
            let guid = handle.create_guid;
            match guid {
                Some(guid) => {
                    st.durable.insert(guid, (id, handle));
                }
                None => {
                    if let Some(file) = st.files.get_mut(&handle.path) {
                        file.locks.retain(|l| l.handle != id);
                    }
                }
            }
        }
        for file in st.files.values_mut() {
            file.lease = None;
        }
    }
}

#[async_trait]
impl SmbRpc for InMemoryServer {
    async fn open(&self, req: &OpenRequest) -> Result<OpenReply, RpcError> {
        let mut st = self.state();
        st.stats.opens += 1;
        st.stats.last_open_rights = Some(req.rights);
        st.stats.last_open_lease = req.lease.map(|l| l.state);

        if req.rights.intersects(st.faults.deny_rights) {
            return Err(RpcError::AccessDenied);
        }
        let exists = st.files.contains_key(&req.path);
        match req.disposition {
            CreateDisposition::Open if !exists => return Err(RpcError::NotFound),
            CreateDisposition::Create if exists => {
                return Err(RpcError::Io("object name collision".into()));
            }
            _ => {}
        }
        if st.share_conflict(&req.path, req.rights, req.share) {
            return Err(RpcError::SharingViolation);
        }
        st.files.entry(req.path.clone()).or_default();

        let lease = st.grant_lease(&req.path, req.lease.as_ref());
        let durable = match req.durable {
            Some(d) if st.faults.grant_durable => Some((
                d.create_guid,
                DurableGrant {
                    timeout: st.faults.durable_timeout.unwrap_or(d.timeout),
                    persistent: d.persistent && st.faults.allow_persistent,
                },
            )),
            _ => None,
        };
        let handle = st.alloc_handle();
        st.handles.insert(
            handle,
            ServerHandle {
                path: req.path.clone(),
                rights: req.rights,
                share: req.share,
                lease_key: lease.and(req.lease.map(|l| l.key)),
                create_guid: durable.map(|(guid, _)| guid),
                durable: durable.map(|(_, grant)| grant),
            },
        );
        let attrs = st.files.get(&req.path).map(ServerFile::attrs).unwrap_or_default();
        Ok(OpenReply {
            handle,
            lease,
            durable: durable.map(|(_, grant)| grant),
            attrs,
        })
    }

    async fn close(
        &self,
        handle: HandleId,
        flags: CloseFlags,
    ) -> Result<Option<FileAttrs>, RpcError> {
        let mut st = self.state();
        st.stats.closes += 1;
        st.stats.last_close_flags = Some(flags);
        st.check_handle(handle)?;
        let Some(closed) = st.handles.remove(&handle) else {
            return Err(RpcError::InvalidHandle);
        };
        st.release_lease_if_unused(&closed.path, closed.lease_key);
        let file = st.files.get_mut(&closed.path);
        match file {
            Some(file) => {
                file.locks.retain(|l| l.handle != handle);
                if flags.contains(CloseFlags::POSTQUERY_ATTRIB) {
                    Ok(Some(file.attrs()))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    async fn lock(&self, req: &LockRequest) -> Result<(), RpcError> {
        let mut st = self.state();
        st.stats.locks += 1;
        let path = st.check_handle(req.handle)?.path.clone();
        let file = st.files.get_mut(&path).ok_or(RpcError::NotFound)?;
        let conflict = file.locks.iter().any(|l| {
            l.overlaps(req.offset, req.length) && (l.exclusive || req.exclusive)
        });
        if conflict {
            return Err(RpcError::LockConflict);
        }
        file.locks.push(ServerLock {
            handle: req.handle,
            owner_pid: req.owner_pid,
            offset: req.offset,
            length: req.length,
            exclusive: req.exclusive,
        });
        Ok(())
    }

    async fn unlock(&self, req: &LockRequest) -> Result<(), RpcError> {
        let mut st = self.state();
        st.stats.unlocks += 1;
        let path = st.check_handle(req.handle)?.path.clone();
        let file = st.files.get_mut(&path).ok_or(RpcError::NotFound)?;
        let pos = file.locks.iter().position(|l| {
            l.handle == req.handle
                && l.owner_pid == req.owner_pid
                && l.offset == req.offset
                && l.length == req.length
        });
        match pos {
            Some(i) => {
                file.locks.remove(i);
                Ok(())
            }
            None => Err(RpcError::Io("range not locked".into())),
        }
    }

    async fn read(&self, handle: HandleId, offset: u64, len: usize) -> Result<Vec<u8>, RpcError> {
        let mut st = self.state();
        st.stats.reads += 1;
        let h = st.check_handle(handle)?;
        if !h.rights.can_read() {
            return Err(RpcError::AccessDenied);
        }
        let path = h.path.clone();
        let file = st.files.get(&path).ok_or(RpcError::NotFound)?;
        let start = (offset as usize).min(file.data.len());
        let end = start.saturating_add(len).min(file.data.len());
        Ok(file.data[start..end].to_vec())
    }

    async fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize, RpcError> {
        let mut st = self.state();
        st.stats.writes += 1;
        let h = st.check_handle(handle)?;
        if !h.rights.can_write() {
            return Err(RpcError::AccessDenied);
        }
        let path = h.path.clone();
        let file = st.files.get_mut(&path).ok_or(RpcError::NotFound)?;
        let start = offset as usize;
        if file.data.len() < start + data.len() {
            file.data.resize(start + data.len(), 0);
        }
        file.data[start..start + data.len()].copy_from_slice(data);
        file.change_time += 1;
        Ok(data.len())
    }

    async fn reclaim_durable(&self, req: &ReclaimRequest) -> Result<OpenReply, RpcError> {
        let mut st = self.state();
        st.stats.reclaims += 1;
        if !st.faults.allow_reclaim {
            return Err(RpcError::Io("durable handle not available".into()));
        }
        let Some((id, handle)) = st.durable.remove(&req.create_guid) else {
            return Err(RpcError::NotFound);
        };
        if handle.path != req.path || !st.files.contains_key(&handle.path) {
            return Err(RpcError::NotFound);
        }
        st.stale.remove(&id);
        let lease = st.grant_lease(&handle.path, req.lease.as_ref());
        let attrs = st.files.get(&handle.path).map(ServerFile::attrs).unwrap_or_default();
        let renewed = st.faults.durable_timeout;
        let durable = handle.durable.map(|grant| DurableGrant {
            timeout: renewed.unwrap_or(grant.timeout),
            ..grant
        });
        st.handles.insert(
            id,
            ServerHandle {
                lease_key: lease.and(req.lease.map(|l| l.key)),
                durable,
                ..handle
            },
        );
        Ok(OpenReply {
            handle: id,
            lease,
            durable,
            attrs,
        })
    }

    async fn lease_break_ack(&self, key: LeaseKey, state: LeaseState) -> Result<(), RpcError> {
        let delay = {
            let mut st = self.state();
            st.stats.lease_break_acks += 1;
            st.faults.lease_break_ack_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut st = self.state();
        for file in st.files.values_mut() {
            if let Some((k, s)) = file.lease.as_mut() {
                if *k == key {
                    *s = state;
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RpcError> {
        let mut st = self.state();
        st.stats.deletes += 1;
        if st.handles.values().any(|h| h.path == path) {
            return Err(RpcError::SharingViolation);
        }
        st.files.remove(path).map(|_| ()).ok_or(RpcError::NotFound)
    }
}
