//! Reopen after a session drop.
//!
//! A dropped session leaves every server handle stale. The node is flagged
//! and the next operation reopens: durable handles are reclaimed by their
//! create GUID, everything else is opened fresh with the recorded rights and
//! has its byte-range locks re-acquired. Any failure revokes the node; from
//! then on I/O fails and closes only balance local counts.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::brl::ByteRangeLockEntry;
use crate::error::{Result, SmbFsError};
use crate::handle_set::{FileHandleSet, OpCtx, open_with_rights};
use crate::lease::LeaseManager;
use crate::rpc::{CreateDisposition, HandleId, LeaseRequest, LockRequest, ShareAccess};
use crate::slot::SlotKind;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReopenFlags: u32 {
        const NEEDS_REOPEN = 0x1;
        const REOPENING = 0x2;
        const NEEDS_REVOKE = 0x4;
        const REVOKED = 0x8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Normal,
    NeedsReopen,
    Reopening,
    NeedsRevoke,
    Revoked,
}

#[derive(Debug, Default)]
pub struct ReconnectCoordinator {
    flags: AtomicU32,
    attempts: AtomicU64,
}

impl ReconnectCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn flags(&self) -> ReopenFlags {
        ReopenFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn state(&self) -> ReconnectState {
        let flags = self.flags();
        if flags.contains(ReopenFlags::REVOKED) {
            ReconnectState::Revoked
        } else if flags.contains(ReopenFlags::NEEDS_REVOKE) {
            ReconnectState::NeedsRevoke
        } else if flags.contains(ReopenFlags::REOPENING) {
            ReconnectState::Reopening
        } else if flags.contains(ReopenFlags::NEEDS_REOPEN) {
            ReconnectState::NeedsReopen
        } else {
            ReconnectState::Normal
        }
    }

    /// Flag the node for reopen. Revoked nodes stay revoked.
    pub fn mark_needs_reopen(&self) -> bool {
        let terminal = (ReopenFlags::NEEDS_REVOKE | ReopenFlags::REVOKED).bits();
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur & terminal == 0).then_some(cur | ReopenFlags::NEEDS_REOPEN.bits())
            })
            .is_ok()
    }

    pub fn needs_reopen(&self) -> bool {
        self.flags().contains(ReopenFlags::NEEDS_REOPEN)
    }

    pub fn is_revoked(&self) -> bool {
        self.flags()
            .intersects(ReopenFlags::NEEDS_REVOKE | ReopenFlags::REVOKED)
    }

    pub fn reopen_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Back to normal; only once every slot on a revoked node has closed.
    pub fn reset(&self) {
        self.flags.store(0, Ordering::Release);
    }

    /// Reopen every handle of `set`. The caller holds the node lock for
    /// writing, so concurrent callers see the result of the first one.
    pub(crate) async fn reopen(&self, set: &mut FileHandleSet, ctx: &OpCtx<'_>) -> Result<()> {
        if self.is_revoked() {
            return Err(SmbFsError::Revoked);
        }
        if !self.needs_reopen() {
            return Ok(());
        }
        self.flags
            .fetch_or(ReopenFlags::REOPENING.bits(), Ordering::AcqRel);
        self.attempts.fetch_add(1, Ordering::Relaxed);

        match reopen_handles(set, ctx).await {
            Ok(()) => {
                self.flags.fetch_and(
                    !(ReopenFlags::NEEDS_REOPEN | ReopenFlags::REOPENING).bits(),
                    Ordering::AcqRel,
                );
                info!("{}: handles reopened", ctx.path);
                Ok(())
            }
            Err(e) => {
                self.flags
                    .fetch_or(ReopenFlags::NEEDS_REVOKE.bits(), Ordering::AcqRel);
                warn!("{}: reopen failed, revoking handles: {e}", ctx.path);
                set.close_remotes_quietly(ctx).await;
                set.revoke_all(ctx);
                self.flags
                    .store(ReopenFlags::REVOKED.bits(), Ordering::Release);
                Err(SmbFsError::Revoked)
            }
        }
    }
}

async fn reopen_handles(set: &mut FileHandleSet, ctx: &OpCtx<'_>) -> Result<()> {
    // Nobody is waiting on a deferred handle; let it go instead of reopening.
    for kind in SlotKind::ALL {
        let slot = set.slot(kind);
        if slot.deferred && !slot.is_active() {
            debug!("{}: dropping stale deferred {kind:?} handle", ctx.path);
            set.slot_mut(kind).reset();
            ctx.lease.clear_deferred(kind);
            ctx.registry.release();
        }
    }
    // The old session's lease is gone; the reopens below re-grant it.
    ctx.lease.unregister();

    for kind in SlotKind::ALL {
        if set.slot(kind).is_active() {
            reopen_slot(set, ctx, kind).await?;
        }
    }
    for idx in 0..set.lock_handles.len() {
        reopen_lock_handle(set, ctx, idx).await?;
    }
    Ok(())
}

async fn reopen_slot(set: &mut FileHandleSet, ctx: &OpCtx<'_>, kind: SlotKind) -> Result<()> {
    let slot = set.slot(kind);
    let (rights, share, wanted_lease) = (slot.rights, slot.share, slot.lease.is_some());
    let lease_state = LeaseManager::requested_caching(rights);
    let lease_req = (wanted_lease && !lease_state.is_empty()).then(|| LeaseRequest {
        key: ctx.lease.key(),
        state: lease_state,
    });

    if let Some(req) = slot.durable.reclaim_request(ctx.path, rights, share, lease_req) {
        match ctx.rpc.reclaim_durable(&req).await {
            Ok(reply) => {
                debug!(
                    "{}: reclaimed durable {kind:?} handle {:?}",
                    ctx.path, reply.handle
                );
                ctx.lease.record_grant(lease_state, reply.lease);
                // Locks and the create GUID survive a reclaim server-side.
                let slot = set.slot_mut(kind);
                slot.remote = reply.handle;
                slot.lease = reply.lease.filter(|l| !l.is_empty());
                slot.durable.record_grant(reply.handle, reply.durable.as_ref());
                return Ok(());
            }
            Err(e) => debug!(
                "{}: durable reclaim of {kind:?} handle failed, reopening: {e}",
                ctx.path
            ),
        }
    }

    let opened =
        open_with_rights(ctx, rights, share, wanted_lease, CreateDisposition::Open).await?;
    ctx.lease.record_grant(opened.requested_lease, opened.reply.lease);
    let remote = opened.reply.handle;
    let slot = set.slot_mut(kind);
    slot.remote = remote;
    slot.lease = opened.reply.lease.filter(|l| !l.is_empty());
    slot.durable = opened.durable;
    let locks: Vec<_> = slot.locks.iter().copied().collect();
    relock(ctx, remote, &locks).await?;
    debug!("{}: reopened {kind:?} handle as {remote:?}", ctx.path);
    Ok(())
}

async fn reopen_lock_handle(set: &mut FileHandleSet, ctx: &OpCtx<'_>, idx: usize) -> Result<()> {
    let Some(handle) = set.lock_handles.get(idx) else {
        return Ok(());
    };
    let rights = handle.rights;
    if let Some(req) = handle
        .durable
        .reclaim_request(ctx.path, rights, ShareAccess::all(), None)
    {
        match ctx.rpc.reclaim_durable(&req).await {
            Ok(reply) => {
                if let Some(handle) = set.lock_handles.get_mut(idx) {
                    handle.remote = reply.handle;
                    handle.durable.record_grant(reply.handle, reply.durable.as_ref());
                }
                return Ok(());
            }
            Err(e) => debug!("{}: durable reclaim of lock handle failed: {e}", ctx.path),
        }
    }

    let opened = open_with_rights(
        ctx,
        rights,
        ShareAccess::all(),
        false,
        CreateDisposition::Open,
    )
    .await?;
    let remote = opened.reply.handle;
    let Some(handle) = set.lock_handles.get_mut(idx) else {
        return Ok(());
    };
    handle.remote = remote;
    handle.durable = opened.durable;
    let locks: Vec<_> = handle.locks.iter().copied().collect();
    relock(ctx, remote, &locks).await
}

async fn relock(
    ctx: &OpCtx<'_>,
    handle: HandleId,
    locks: &[ByteRangeLockEntry],
) -> Result<()> {
    for entry in locks {
        let req = LockRequest {
            handle,
            owner_pid: entry.owner_pid,
            offset: entry.offset,
            length: entry.length,
            exclusive: entry.exclusive,
            timeout: Duration::ZERO,
        };
        ctx.rpc.lock(&req).await?;
    }
    Ok(())
}
