use std::time::Duration;

use log::{debug, warn};

use super::{FileHandleSet, HandleToken, OpCtx, open_with_rights};
use crate::brl::{ByteRangeLockEntry, ByteRangeLockTable};
use crate::error::{Result, RpcError, SmbFsError};
use crate::intent::AccessMode;
use crate::rpc::{CloseFlags, CreateDisposition, HandleId, LockRequest, Rights, ShareAccess};
use crate::slot::{LockHandle, SlotKind};

/// Which server handle a lock lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockSite {
    Slot(SlotKind),
    Sub(usize),
}

impl FileHandleSet {
    fn table(&self, site: LockSite) -> Option<&ByteRangeLockTable> {
        match site {
            LockSite::Slot(kind) => Some(&self.slot(kind).locks),
            LockSite::Sub(idx) => self.lock_handles.get(idx).map(|h| &h.locks),
        }
    }

    fn table_mut(&mut self, site: LockSite) -> Option<&mut ByteRangeLockTable> {
        match site {
            LockSite::Slot(kind) => Some(&mut self.slot_mut(kind).locks),
            LockSite::Sub(idx) => self.lock_handles.get_mut(idx).map(|h| &mut h.locks),
        }
    }

    fn remote_at(&self, site: LockSite) -> HandleId {
        match site {
            LockSite::Slot(kind) => self.slot(kind).remote,
            LockSite::Sub(idx) => self
                .lock_handles
                .get(idx)
                .map_or(HandleId::NONE, |h| h.remote),
        }
    }

    /// Every byte-range lock held on the file, across all handles.
    pub fn lock_count(&self) -> usize {
        self.shared.locks.len()
            + self.exclusive.locks.len()
            + self.lock_handles.iter().map(|h| h.locks.len()).sum::<usize>()
    }

    /// Our own locks collide with each other on the server; catch that
    /// locally so the caller gets a retryable error.
    fn conflicts_locally(&self, offset: u64, length: u64, exclusive: bool) -> bool {
        self.shared.locks.conflicts(offset, length, exclusive)
            || self.exclusive.locks.conflicts(offset, length, exclusive)
            || self
                .lock_handles
                .iter()
                .any(|h| h.locks.conflicts(offset, length, exclusive))
    }

    fn ensure_usable(&self, token: &HandleToken) -> Result<()> {
        let slot = self.slot(token.slot);
        if !slot.is_active() || !slot.remote.is_valid() {
            return Err(SmbFsError::BadHandle(format!(
                "lock on {:?} slot without an open handle",
                token.slot
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn lock(
        &mut self,
        ctx: &OpCtx<'_>,
        token: &HandleToken,
        offset: u64,
        length: u64,
        owner_pid: u32,
        exclusive: bool,
        wait: bool,
    ) -> Result<()> {
        self.ensure_usable(token)?;
        if self.conflicts_locally(offset, length, exclusive) {
            debug!("{}: lock {offset}+{length} conflicts with our own", ctx.path);
            return Err(SmbFsError::WouldBlock);
        }

        let site = match token.slot {
            SlotKind::Exclusive => LockSite::Slot(SlotKind::Exclusive),
            SlotKind::Shared => self.lock_site(ctx, token.access).await,
        };
        let req = LockRequest {
            handle: self.remote_at(site),
            owner_pid,
            offset,
            length,
            exclusive,
            timeout: if wait {
                ctx.config.lock_wait_timeout()
            } else {
                Duration::ZERO
            },
        };
        match ctx.rpc.lock(&req).await {
            Ok(()) => {
                let entry = ByteRangeLockEntry {
                    offset,
                    length,
                    locking_pid: owner_pid,
                    owner_pid,
                    exclusive,
                };
                if let Some(table) = self.table_mut(site) {
                    table.insert(entry);
                }
                Ok(())
            }
            Err(e) => {
                self.release_idle_sub_handle(ctx, site).await;
                match e {
                    RpcError::LockConflict => Err(SmbFsError::LockDenied),
                    e => Err(e.into()),
                }
            }
        }
    }

    pub(crate) async fn unlock(
        &mut self,
        ctx: &OpCtx<'_>,
        token: &HandleToken,
        offset: u64,
        length: u64,
        owner_pid: u32,
    ) -> Result<()> {
        self.ensure_usable(token)?;
        let site = self
            .find_lock(token.slot, offset, length, owner_pid)
            .ok_or(SmbFsError::WouldBlock)?;
        let exclusive = self
            .table(site)
            .and_then(|t| t.find_exact(offset, length, owner_pid))
            .is_some_and(|e| e.exclusive);
        let req = LockRequest {
            handle: self.remote_at(site),
            owner_pid,
            offset,
            length,
            exclusive,
            timeout: Duration::ZERO,
        };
        ctx.rpc.unlock(&req).await?;
        if let Some(table) = self.table_mut(site) {
            table.remove_exact(offset, length, owner_pid);
        }
        self.release_idle_sub_handle(ctx, site).await;
        Ok(())
    }

    fn find_lock(&self, kind: SlotKind, offset: u64, length: u64, owner_pid: u32) -> Option<LockSite> {
        let mut sites = vec![LockSite::Slot(kind)];
        if kind == SlotKind::Shared {
            sites.extend((0..self.lock_handles.len()).map(LockSite::Sub));
        }
        sites.into_iter().find(|site| {
            self.table(*site)
                .is_some_and(|t| t.find_exact(offset, length, owner_pid).is_some())
        })
    }

    /// Pick the handle a shared-slot lock goes to: a sub-handle matching
    /// the opener's access, opened on demand, or the main handle when the
    /// pool is full or the sub-handle cannot be opened.
    async fn lock_site(&mut self, ctx: &OpCtx<'_>, access: AccessMode) -> LockSite {
        if let Some(idx) = self.lock_handles.position(access) {
            return LockSite::Sub(idx);
        }
        let covered = self.shared.access.is_some_and(|held| held.covers(access));
        if self.lock_handles.is_full() || !covered {
            return LockSite::Slot(SlotKind::Shared);
        }
        let rights = access.data_rights() | Rights::READ_ATTRIBUTES | Rights::SYNCHRONIZE;
        match open_with_rights(ctx, rights, ShareAccess::all(), false, CreateDisposition::Open).await {
            Ok(opened) => {
                debug!(
                    "{}: opened lock handle {:?} for {access:?}",
                    ctx.path, opened.reply.handle
                );
                LockSite::Sub(self.lock_handles.push(LockHandle {
                    access,
                    remote: opened.reply.handle,
                    rights,
                    durable: opened.durable,
                    locks: ByteRangeLockTable::new(),
                }))
            }
            Err(e) => {
                warn!(
                    "{}: lock handle open failed, using shared handle: {e}",
                    ctx.path
                );
                LockSite::Slot(SlotKind::Shared)
            }
        }
    }

    /// A sub-handle with no locks left is closed right away.
    async fn release_idle_sub_handle(&mut self, ctx: &OpCtx<'_>, site: LockSite) {
        let LockSite::Sub(idx) = site else {
            return;
        };
        if !self.lock_handles.get(idx).is_some_and(|h| h.locks.is_empty()) {
            return;
        }
        let handle = self.lock_handles.remove(idx);
        if let Err(e) = ctx.rpc.close(handle.remote, CloseFlags::empty()).await {
            debug!(
                "{}: close of lock handle {:?} failed: {e}",
                ctx.path, handle.remote
            );
        }
    }
}
