//! Multiplexing of local opens onto at most two server handles per file.
//!
//! - `open`: slot selection, share/upgrade, deferred reuse, rights ladder
//! - `close`: refcount drop, downgrade, deferral or real close, mmap release
//! - `lock`: byte-range lock routing onto the slots and lock sub-handles
//!
//! Every method here runs with the node lock held for writing.

mod close;
mod lock;
mod open;

pub use close::{CloseMode, CloseOutcome};

use log::{debug, warn};

use crate::config::ClientConfig;
use crate::deferred::DeferredCloseRegistry;
use crate::durable::DurableHandleInfo;
use crate::error::{Result, RpcError, SmbFsError};
use crate::intent::{AccessMode, OpenIntent};
use crate::lease::LeaseManager;
use crate::rpc::{
    CloseFlags, CreateDisposition, FileAttrs, HandleId, LeaseRequest, LeaseState, OpenReply,
    OpenRequest, Rights, ShareAccess, SmbRpc,
};
use crate::slot::{HandleSlot, LockHandlePool, SlotKind};

/// Everything an operation needs besides the handle set itself.
pub(crate) struct OpCtx<'a> {
    pub rpc: &'a dyn SmbRpc,
    pub config: &'a ClientConfig,
    pub registry: &'a DeferredCloseRegistry,
    pub lease: &'a LeaseManager,
    pub path: &'a str,
    pub is_stream: bool,
}

impl OpCtx<'_> {
    pub async fn wait_for_break(&self) -> bool {
        self.lease
            .wait_for_break(
                self.config.lease_break_wait_retries,
                self.config.lease_break_wait_interval(),
            )
            .await
    }
}

/// Returned to the glue on open and handed back on close/lock/I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleToken {
    pub slot: SlotKind,
    pub access: AccessMode,
    pub intent: OpenIntent,
}

/// One step of the rights degradation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RightsAttempt {
    pub rights: Rights,
    pub with_lease: bool,
}

/// Rights to try, most generous first: full request, then without the
/// optional ACL-write right, then (write-only opens) without the read right
/// that was added only to make a read/write lease possible.
pub(crate) fn rights_ladder(access: AccessMode, config: &ClientConfig) -> Vec<RightsAttempt> {
    let mut base = access.data_rights() | Rights::READ_ATTRIBUTES | Rights::SYNCHRONIZE;
    let opportunistic_read = access == AccessMode::Write;
    if access.can_write() {
        base |= Rights::WRITE_ATTRIBUTES;
    }
    if opportunistic_read {
        base |= Rights::READ_DATA;
    }

    let mut ladder = Vec::with_capacity(3);
    if access.can_write() && config.request_acl_write {
        ladder.push(RightsAttempt {
            rights: base | Rights::WRITE_DAC,
            with_lease: true,
        });
    }
    ladder.push(RightsAttempt {
        rights: base,
        with_lease: true,
    });
    if opportunistic_read {
        ladder.push(RightsAttempt {
            rights: base - Rights::READ_DATA,
            with_lease: false,
        });
    }
    ladder
}

/// Access a fresh open for `access` would end up holding.
pub(crate) fn effective_access(access: AccessMode, config: &ClientConfig) -> AccessMode {
    rights_ladder(access, config)
        .first()
        .and_then(|step| AccessMode::from_rights(step.rights))
        .unwrap_or(access)
}

/// A server handle obtained by `open_with_rights`.
pub(crate) struct OpenedHandle {
    pub reply: OpenReply,
    pub rights: Rights,
    pub requested_lease: LeaseState,
    pub durable: DurableHandleInfo,
}

pub(crate) async fn open_with_rights(
    ctx: &OpCtx<'_>,
    rights: Rights,
    share: ShareAccess,
    with_lease: bool,
    disposition: CreateDisposition,
) -> std::result::Result<OpenedHandle, RpcError> {
    let requested_lease = if with_lease {
        LeaseManager::requested_caching(rights)
    } else {
        LeaseState::empty()
    };
    let lease = (!requested_lease.is_empty()).then(|| LeaseRequest {
        key: ctx.lease.key(),
        state: requested_lease,
    });
    let mut durable = DurableHandleInfo::default();
    let durable_req = durable.prepare_request(ctx.config);
    let req = OpenRequest {
        path: ctx.path.to_string(),
        rights,
        share,
        disposition,
        lease,
        durable: Some(durable_req),
    };
    let reply = ctx.rpc.open(&req).await?;
    durable.record_grant(reply.handle, reply.durable.as_ref());
    Ok(OpenedHandle {
        reply,
        rights,
        requested_lease,
        durable,
    })
}

/// Open walking down the rights ladder on `AccessDenied`.
pub(crate) async fn open_on_wire(
    ctx: &OpCtx<'_>,
    access: AccessMode,
    share: ShareAccess,
    disposition: CreateDisposition,
) -> Result<OpenedHandle> {
    let ladder = rights_ladder(access, ctx.config);
    let last = ladder.len().saturating_sub(1);
    for (i, step) in ladder.into_iter().enumerate() {
        match open_with_rights(ctx, step.rights, share, step.with_lease, disposition).await {
            Ok(opened) => return Ok(opened),
            Err(RpcError::AccessDenied) if i < last => {
                debug!(
                    "{}: open with {:?} denied, retrying with fewer rights",
                    ctx.path, step.rights
                );
            }
            Err(RpcError::SharingViolation) => return Err(SmbFsError::Busy),
            Err(e) => return Err(e.into()),
        }
    }
    Err(SmbFsError::Invalid(format!("{}: empty rights ladder", ctx.path)))
}

/// Both handle slots of one file plus its lock sub-handles.
#[derive(Debug)]
pub struct FileHandleSet {
    pub(crate) shared: HandleSlot,
    pub(crate) exclusive: HandleSlot,
    pub(crate) lock_handles: LockHandlePool,
    pub(crate) delete_on_close: bool,
    pub(crate) attrs: Option<FileAttrs>,
}

impl FileHandleSet {
    pub fn new(max_lock_handles: usize) -> Self {
        FileHandleSet {
            shared: HandleSlot::new(SlotKind::Shared),
            exclusive: HandleSlot::new(SlotKind::Exclusive),
            lock_handles: LockHandlePool::new(max_lock_handles),
            delete_on_close: false,
            attrs: None,
        }
    }

    pub fn slot(&self, kind: SlotKind) -> &HandleSlot {
        match kind {
            SlotKind::Shared => &self.shared,
            SlotKind::Exclusive => &self.exclusive,
        }
    }

    pub(crate) fn slot_mut(&mut self, kind: SlotKind) -> &mut HandleSlot {
        match kind {
            SlotKind::Shared => &mut self.shared,
            SlotKind::Exclusive => &mut self.exclusive,
        }
    }

    fn other(kind: SlotKind) -> SlotKind {
        match kind {
            SlotKind::Shared => SlotKind::Exclusive,
            SlotKind::Exclusive => SlotKind::Shared,
        }
    }

    pub fn attrs(&self) -> Option<FileAttrs> {
        self.attrs
    }

    pub fn lock_handles(&self) -> &LockHandlePool {
        &self.lock_handles
    }

    pub fn has_active_opener(&self) -> bool {
        self.shared.is_active() || self.exclusive.is_active()
    }

    /// Any server handle still open, deferred ones included.
    pub fn has_wire_handles(&self) -> bool {
        self.shared.is_open_on_wire()
            || self.exclusive.is_open_on_wire()
            || !self.lock_handles.is_empty()
    }

    pub fn handle_for(&self, token: &HandleToken) -> Result<HandleId> {
        let slot = self.slot(token.slot);
        if !slot.is_active() {
            return Err(SmbFsError::BadHandle(format!(
                "{:?} slot has no opener",
                token.slot
            )));
        }
        if !slot.remote.is_valid() {
            return Err(SmbFsError::BadHandle(format!(
                "{:?} slot active without a server handle",
                token.slot
            )));
        }
        Ok(slot.remote)
    }

    fn install(&mut self, ctx: &OpCtx<'_>, kind: SlotKind, opened: OpenedHandle) {
        ctx.lease.record_grant(opened.requested_lease, opened.reply.lease);
        self.attrs = Some(opened.reply.attrs);
        let slot = self.slot_mut(kind);
        slot.remote = opened.reply.handle;
        slot.rights = opened.rights;
        slot.access = AccessMode::from_rights(opened.rights);
        slot.lease = opened.reply.lease.filter(|l| !l.is_empty());
        slot.durable = opened.durable;
        slot.deferred = false;
    }

    /// Replace the slot's server handle with one opened for `target`,
    /// keeping openers, counters and deny semantics. Used for upgrade and
    /// downgrade; the old handle is closed once the new one is in place.
    pub(crate) async fn swap_handle(
        &mut self,
        ctx: &OpCtx<'_>,
        kind: SlotKind,
        target: AccessMode,
    ) -> Result<()> {
        let slot = self.slot(kind);
        if !slot.locks.is_empty() {
            return Err(SmbFsError::Invalid(format!(
                "{kind:?} handle holds byte-range locks"
            )));
        }
        let share = slot.share;
        ctx.wait_for_break().await;
        let opened = open_on_wire(ctx, target, share, CreateDisposition::Open).await?;
        let old = self.slot(kind).remote;
        self.install(ctx, kind, opened);
        debug!(
            "{}: swapped {kind:?} handle {old:?} -> {:?} for {target:?}",
            ctx.path,
            self.slot(kind).remote
        );
        if let Err(e) = ctx.rpc.close(old, CloseFlags::empty()).await {
            warn!("{}: failed to close replaced handle {old:?}: {e}", ctx.path);
        }
        Ok(())
    }

    /// Really close the slot's server handle. Locks and durable state are
    /// cleared together with the close, under the node lock.
    pub(crate) async fn close_on_wire(&mut self, ctx: &OpCtx<'_>, kind: SlotKind) -> Result<()> {
        if kind == SlotKind::Shared {
            self.close_lock_handles(ctx).await;
        }
        let slot = self.slot_mut(kind);
        let remote = slot.remote;
        let flags = if slot.rights.can_write() {
            CloseFlags::POSTQUERY_ATTRIB
        } else {
            CloseFlags::empty()
        };
        let was_deferred = slot.deferred;
        slot.reset();
        if was_deferred {
            ctx.lease.clear_deferred(kind);
            ctx.registry.release();
        }
        if !self.slot(Self::other(kind)).is_open_on_wire() {
            ctx.lease.unregister();
        }
        if !remote.is_valid() {
            return Ok(());
        }
        match ctx.rpc.close(remote, flags).await {
            Ok(Some(attrs)) => self.attrs = Some(attrs),
            Ok(None) => {}
            Err(e @ (RpcError::Reconnect | RpcError::InvalidHandle)) => {
                debug!("{}: close of dead handle {remote:?}: {e}", ctx.path);
            }
            Err(e) => return Err(e.into()),
        }
        debug!("{}: closed {kind:?} handle {remote:?}", ctx.path);
        Ok(())
    }

    /// Really close a deferred handle that has no opener. Returns whether
    /// anything was closed.
    pub(crate) async fn close_deferred(&mut self, ctx: &OpCtx<'_>, kind: SlotKind) -> Result<bool> {
        let slot = self.slot(kind);
        if !slot.deferred || slot.is_active() {
            return Ok(false);
        }
        self.close_on_wire(ctx, kind).await?;
        Ok(true)
    }

    pub(crate) async fn close_lock_handles(&mut self, ctx: &OpCtx<'_>) {
        for handle in self.lock_handles.drain() {
            if let Err(e) = ctx.rpc.close(handle.remote, CloseFlags::empty()).await {
                debug!(
                    "{}: close of lock handle {:?} failed: {e}",
                    ctx.path, handle.remote
                );
            }
        }
    }

    /// Best-effort close of every server handle the set still names. A
    /// partial reopen may have left some of them live on the new session.
    pub(crate) async fn close_remotes_quietly(&self, ctx: &OpCtx<'_>) {
        let remotes = SlotKind::ALL
            .into_iter()
            .map(|kind| self.slot(kind).remote)
            .chain(self.lock_handles.iter().map(|h| h.remote))
            .filter(HandleId::is_valid);
        for remote in remotes {
            if let Err(e) = ctx.rpc.close(remote, CloseFlags::empty()).await {
                debug!("{}: dropping {remote:?}: {e}", ctx.path);
            }
        }
    }

    /// Abandon every server handle without talking to the server. Openers
    /// stay counted so their closes still balance.
    pub(crate) fn revoke_all(&mut self, ctx: &OpCtx<'_>) {
        for kind in SlotKind::ALL {
            let slot = self.slot_mut(kind);
            if slot.deferred {
                slot.reset();
                ctx.lease.clear_deferred(kind);
                ctx.registry.release();
                continue;
            }
            slot.remote = HandleId::NONE;
            slot.lease = None;
            slot.locks.clear();
            slot.durable.clear();
        }
        self.lock_handles.drain();
        ctx.lease.unregister();
    }

    /// Close everything, openers included. Used when the node is evicted.
    pub(crate) async fn force_close_all(&mut self, ctx: &OpCtx<'_>) {
        self.close_lock_handles(ctx).await;
        for kind in SlotKind::ALL {
            if self.slot(kind).is_open_on_wire() {
                if let Err(e) = self.close_on_wire(ctx, kind).await {
                    warn!("{}: forced close of {kind:?} handle failed: {e}", ctx.path);
                }
            }
            self.slot_mut(kind).reset();
        }
        ctx.lease.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_read_only() {
        let ladder = rights_ladder(AccessMode::Read, &ClientConfig::default());
        assert_eq!(ladder.len(), 1);
        assert!(ladder[0].rights.can_read() && !ladder[0].rights.can_write());
        assert!(ladder[0].with_lease);
    }

    #[test]
    fn test_ladder_write_only() {
        let ladder = rights_ladder(AccessMode::Write, &ClientConfig::default());
        assert_eq!(ladder.len(), 3);
        assert!(ladder[0].rights.contains(Rights::WRITE_DAC | Rights::READ_DATA));
        assert!(!ladder[1].rights.contains(Rights::WRITE_DAC));
        assert!(ladder[1].rights.contains(Rights::READ_DATA));
        assert!(!ladder[2].rights.contains(Rights::READ_DATA));
        assert!(!ladder[2].with_lease);
    }

    #[test]
    fn test_ladder_without_acl_write() {
        let config = ClientConfig {
            request_acl_write: false,
            ..Default::default()
        };
        let ladder = rights_ladder(AccessMode::ReadWrite, &config);
        assert_eq!(ladder.len(), 1);
        assert!(!ladder[0].rights.contains(Rights::WRITE_DAC));
    }

    #[test]
    fn test_effective_access() {
        let config = ClientConfig::default();
        assert_eq!(effective_access(AccessMode::Write, &config), AccessMode::ReadWrite);
        assert_eq!(effective_access(AccessMode::Read, &config), AccessMode::Read);
    }
}
