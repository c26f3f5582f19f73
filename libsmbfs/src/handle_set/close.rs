use std::time::Instant;

use log::debug;

use super::{FileHandleSet, HandleToken, OpCtx, effective_access};
use crate::error::{Result, SmbFsError};
use crate::intent::OpenIntent;
use crate::rpc::LeaseState;
use crate::slot::SlotKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    Normal,
    /// Close for real even when the handle could be deferred.
    NoDefer,
    /// The node is revoked: only local accounting, no RPC.
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Other openers still use the slot.
    StillOpen,
    /// Last opener gone; the server handle stays cached.
    Deferred,
    /// Last opener gone; the server handle was closed.
    Closed,
}

impl FileHandleSet {
    pub(crate) async fn close(
        &mut self,
        ctx: &OpCtx<'_>,
        token: HandleToken,
        mode: CloseMode,
    ) -> Result<CloseOutcome> {
        let kind = token.slot;
        let slot = self.slot_mut(kind);
        if !slot.is_active() {
            return Err(SmbFsError::BadHandle(format!("{kind:?} slot has no opener")));
        }
        slot.counters.decr(token.access)?;
        slot.refcount -= 1;

        if slot.refcount > 0 {
            if mode == CloseMode::Normal && kind == SlotKind::Shared && ctx.config.enable_downgrade {
                self.maybe_downgrade(ctx).await;
            }
            return Ok(CloseOutcome::StillOpen);
        }

        if mode == CloseMode::Revoked {
            self.slot_mut(kind).reset();
            if kind == SlotKind::Shared {
                self.lock_handles.drain();
            }
            return Ok(CloseOutcome::Closed);
        }

        // Let an in-flight break settle before deciding what to keep.
        ctx.wait_for_break().await;
        if mode == CloseMode::Normal && self.can_defer(ctx, kind) && ctx.registry.try_acquire() {
            if ctx.lease.try_mark_deferred(kind, Instant::now()) {
                let slot = self.slot_mut(kind);
                slot.deferred = true;
                debug!("{}: deferred close of {kind:?} handle {:?}", ctx.path, slot.remote);
                return Ok(CloseOutcome::Deferred);
            }
            ctx.registry.release();
        }
        self.close_on_wire(ctx, kind).await?;
        Ok(CloseOutcome::Closed)
    }

    fn can_defer(&self, ctx: &OpCtx<'_>, kind: SlotKind) -> bool {
        let slot = self.slot(kind);
        !self.delete_on_close
            && !ctx.is_stream
            && slot.remote.is_valid()
            && slot.locks.is_empty()
            && (kind != SlotKind::Shared || self.lock_handles.is_empty())
            && slot
                .lease
                .is_some_and(|l| l.contains(LeaseState::HANDLE_CACHING))
            && ctx.lease.has_handle_caching()
    }

    /// Reopen the shared handle with less access once the openers that
    /// needed more are gone. Failures are not reported.
    async fn maybe_downgrade(&mut self, ctx: &OpCtx<'_>) {
        let (Some(current), Some(mut needed)) = (self.shared.access, self.shared.counters.needed())
        else {
            return;
        };
        if let Some(locked) = self.lock_handles.access_union() {
            needed = needed.union(locked);
        }
        let target = effective_access(needed, ctx.config);
        if target == current || !current.covers(target) || !self.shared.locks.is_empty() {
            return;
        }
        match self.swap_handle(ctx, SlotKind::Shared, needed).await {
            Ok(()) => debug!("{}: downgraded shared handle {current:?} -> {target:?}", ctx.path),
            Err(e) => debug!("{}: downgrade to {target:?} skipped: {e}", ctx.path),
        }
    }

    /// Take an extra opener for a memory mapping of the file.
    pub(crate) fn map(&mut self, token: &HandleToken) -> Result<()> {
        let slot = self.slot_mut(token.slot);
        if !slot.is_active() {
            return Err(SmbFsError::BadHandle(format!(
                "mmap on {:?} slot without an opener",
                token.slot
            )));
        }
        if slot.mmapped.is_some() {
            return Ok(());
        }
        slot.add_opener(token.access);
        slot.mmapped = Some(token.access);
        Ok(())
    }

    /// Drop the mapping's opener through the regular close path.
    pub(crate) async fn unmap(
        &mut self,
        ctx: &OpCtx<'_>,
        mode: CloseMode,
    ) -> Result<Option<CloseOutcome>> {
        let Some(kind) = SlotKind::ALL
            .into_iter()
            .find(|kind| self.slot(*kind).mmapped.is_some())
        else {
            return Ok(None);
        };
        let slot = self.slot_mut(kind);
        let Some(access) = slot.mmapped.take() else {
            return Ok(None);
        };
        let intent = slot
            .intent
            .unwrap_or(OpenIntent::SharedAccess { access });
        let token = HandleToken {
            slot: kind,
            access,
            intent,
        };
        self.close(ctx, token, mode).await.map(Some)
    }
}
