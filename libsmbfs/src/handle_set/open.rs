use log::{debug, warn};

use super::{FileHandleSet, HandleToken, OpCtx, effective_access, open_on_wire};
use crate::config::DeferredReusePolicy;
use crate::error::{Result, SmbFsError};
use crate::intent::OpenIntent;
use crate::rpc::CreateDisposition;
use crate::slot::SlotKind;

impl FileHandleSet {
    /// Attach a local open to one of the slots, opening or upgrading the
    /// server handle as needed.
    pub(crate) async fn open(
        &mut self,
        ctx: &OpCtx<'_>,
        intent: OpenIntent,
        disposition: CreateDisposition,
    ) -> Result<HandleToken> {
        let token = HandleToken {
            slot: intent.slot(),
            access: intent.access(),
            intent,
        };
        match token.slot {
            SlotKind::Shared => self.open_shared(ctx, token, disposition).await?,
            SlotKind::Exclusive => self.open_exclusive(ctx, token, disposition).await?,
        }
        Ok(token)
    }

    async fn open_shared(
        &mut self,
        ctx: &OpCtx<'_>,
        token: HandleToken,
        disposition: CreateDisposition,
    ) -> Result<()> {
        if self.shared.is_active() {
            let current = self.shared.access.ok_or_else(|| {
                SmbFsError::BadHandle("active shared slot without an access mode".into())
            })?;
            if !current.covers(token.access) {
                let want = current.union(token.access);
                if let Err(e) = self.swap_handle(ctx, SlotKind::Shared, want).await {
                    warn!(
                        "{}: upgrade {current:?} -> {want:?} failed, keeping old handle: {e}",
                        ctx.path
                    );
                }
            }
            self.shared.add_opener(token.access);
            return Ok(());
        }

        if self.shared.deferred {
            if self.try_reuse_deferred(ctx, SlotKind::Shared, token) {
                return Ok(());
            }
            if let Err(e) = self.close_deferred(ctx, SlotKind::Shared).await {
                warn!("{}: closing stale deferred handle failed: {e}", ctx.path);
            }
        }
        // A cached deny-mode handle would refuse this open server-side.
        if self.exclusive.deferred && !self.exclusive.is_active() {
            if let Err(e) = self.close_deferred(ctx, SlotKind::Exclusive).await {
                warn!("{}: flushing deferred exclusive handle failed: {e}", ctx.path);
            }
        }
        self.fresh_open(ctx, token, disposition).await
    }

    async fn open_exclusive(
        &mut self,
        ctx: &OpCtx<'_>,
        token: HandleToken,
        disposition: CreateDisposition,
    ) -> Result<()> {
        if self.exclusive.is_active() {
            // Only share-lock opens stack, and only within the held access.
            let compatible = matches!(
                (self.exclusive.intent, token.intent),
                (Some(OpenIntent::ShareLock { access: held }), OpenIntent::ShareLock { access })
                    if held.covers(access)
            );
            if !compatible {
                debug!(
                    "{}: {:?} refused, exclusive slot held as {:?}",
                    ctx.path, token.intent, self.exclusive.intent
                );
                return Err(SmbFsError::Busy);
            }
            self.exclusive.add_opener(token.access);
            return Ok(());
        }

        if self.exclusive.deferred {
            if self.try_reuse_deferred(ctx, SlotKind::Exclusive, token) {
                return Ok(());
            }
            if let Err(e) = self.close_deferred(ctx, SlotKind::Exclusive).await {
                warn!("{}: closing stale deferred handle failed: {e}", ctx.path);
            }
        }
        // A cached shared handle would make the deny-mode open fail.
        if self.shared.deferred {
            if let Err(e) = self.close_deferred(ctx, SlotKind::Shared).await {
                warn!("{}: flushing deferred shared handle failed: {e}", ctx.path);
            }
        }
        self.fresh_open(ctx, token, disposition).await
    }

    /// Hand a deferred handle back to a new opener without any RPC.
    fn try_reuse_deferred(&mut self, ctx: &OpCtx<'_>, kind: SlotKind, token: HandleToken) -> bool {
        let slot = self.slot(kind);
        let Some(prior) = slot.access else {
            return false;
        };
        let same_kind = slot
            .intent
            .is_some_and(|held| held.same_kind(&token.intent));
        let access_ok = match ctx.config.deferred_reuse {
            DeferredReusePolicy::Exact => prior == effective_access(token.access, ctx.config),
            DeferredReusePolicy::Superset => prior.covers(token.access),
        };
        if !same_kind || !access_ok {
            return false;
        }
        if !ctx.lease.reactivate_deferred(kind) {
            return false;
        }
        ctx.registry.release();

        let slot = self.slot_mut(kind);
        slot.deferred = false;
        slot.intent = Some(token.intent);
        slot.add_opener(token.access);
        debug!(
            "{}: reused deferred {kind:?} handle {:?} for {:?}",
            ctx.path, slot.remote, token.access
        );
        true
    }

    async fn fresh_open(
        &mut self,
        ctx: &OpCtx<'_>,
        token: HandleToken,
        disposition: CreateDisposition,
    ) -> Result<()> {
        let share = token.intent.share_access();
        let opened = open_on_wire(ctx, token.access, share, disposition).await?;
        let remote = opened.reply.handle;
        self.install(ctx, token.slot, opened);

        let slot = self.slot_mut(token.slot);
        slot.share = share;
        slot.intent = Some(token.intent);
        slot.is_exclusive_lock_open = matches!(token.intent, OpenIntent::ExclusiveLock { .. });
        slot.is_share_lock_open = matches!(token.intent, OpenIntent::ShareLock { .. });
        slot.add_opener(token.access);
        debug!(
            "{}: opened {:?} handle {remote:?} as {:?} (lease {:?})",
            ctx.path, token.slot, slot.access, slot.lease
        );
        Ok(())
    }
}
