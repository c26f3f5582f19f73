//! Share-wide entry points used by the filesystem glue.
//!
//! `SmbShare` owns the node table, the deferred-close registry and the
//! RPC seam. Every per-file operation takes the node lock, builds an
//! [`OpCtx`] and delegates to the node's [`FileHandleSet`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use log::{debug, info, warn};
use tokio::sync::RwLockWriteGuard;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::deferred::{DeferredCloseRegistry, DeferredStats};
use crate::error::{Result, RpcError, SmbFsError};
use crate::handle_set::{CloseMode, CloseOutcome, FileHandleSet, HandleToken, OpCtx};
use crate::intent::{OpenFlags, OpenIntent};
use crate::node::FileNode;
use crate::rpc::{CreateDisposition, LeaseKey, LeaseState, SmbRpc};
use crate::slot::SlotKind;

fn lock_map<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((dir, _)) => dir,
    }
}

pub struct SmbShare {
    rpc: Arc<dyn SmbRpc>,
    config: ClientConfig,
    deferred: DeferredCloseRegistry,
    nodes: Mutex<HashMap<String, Arc<FileNode>>>,
    leases: Mutex<HashMap<LeaseKey, Weak<FileNode>>>,
    /// Bumped whenever an entry disappears from a directory, so cached
    /// listings know to refresh.
    dir_generations: Mutex<HashMap<String, u64>>,
}

impl SmbShare {
    pub fn new(rpc: Arc<dyn SmbRpc>, config: ClientConfig) -> Arc<Self> {
        let deferred = DeferredCloseRegistry::new(config.max_deferred_closes);
        Arc::new(SmbShare {
            rpc,
            config,
            deferred,
            nodes: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            dir_generations: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn deferred_stats(&self) -> DeferredStats {
        self.deferred.stats()
    }

    /// Node for `path`, created on first use.
    pub fn lookup(&self, path: &str) -> Arc<FileNode> {
        let mut nodes = lock_map(&self.nodes);
        if let Some(node) = nodes.get(path) {
            return node.clone();
        }
        let node = Arc::new(FileNode::new(path, self.config.max_lock_handles));
        lock_map(&self.leases).insert(node.lease_key(), Arc::downgrade(&node));
        nodes.insert(path.to_string(), node.clone());
        node
    }

    pub fn lookup_stream(&self, path: &str, stream: &str) -> Arc<FileNode> {
        self.lookup(&format!("{path}:{stream}"))
    }

    pub fn cached(&self, path: &str) -> Option<Arc<FileNode>> {
        lock_map(&self.nodes).get(path).cloned()
    }

    pub fn dir_generation(&self, dir: &str) -> u64 {
        lock_map(&self.dir_generations)
            .get(dir)
            .copied()
            .unwrap_or(0)
    }

    fn op_ctx<'a>(&'a self, node: &'a FileNode) -> OpCtx<'a> {
        OpCtx {
            rpc: self.rpc.as_ref(),
            config: &self.config,
            registry: &self.deferred,
            lease: &node.lease,
            path: &node.path,
            is_stream: node.is_stream,
        }
    }

    fn close_mode(node: &FileNode) -> CloseMode {
        if node.reconnect.is_revoked() {
            CloseMode::Revoked
        } else if node.reconnect.needs_reopen() {
            CloseMode::NoDefer
        } else {
            CloseMode::Normal
        }
    }

    /// Node lock for writing, with any pending reopen done first.
    async fn ready_handles<'a>(
        &self,
        node: &'a FileNode,
    ) -> Result<RwLockWriteGuard<'a, FileHandleSet>> {
        let mut set = node.handles.write().await;
        if node.reconnect.is_revoked() {
            return Err(SmbFsError::Revoked);
        }
        let ctx = self.op_ctx(node);
        node.reconnect.reopen(&mut set, &ctx).await?;
        Ok(set)
    }

    async fn ensure_ready(&self, node: &FileNode) -> Result<()> {
        if node.reconnect.is_revoked() {
            return Err(SmbFsError::Revoked);
        }
        if node.reconnect.needs_reopen() {
            self.ready_handles(node).await?;
        }
        Ok(())
    }

    /// Reconnect errors flag the node and are retried after a reopen.
    fn should_retry(node: &FileNode, err: &SmbFsError, retries: &mut u32) -> bool {
        let SmbFsError::Rpc(rpc) = err else {
            return false;
        };
        if !rpc.is_reconnect() {
            return false;
        }
        node.reconnect.mark_needs_reopen();
        if *retries == 0 {
            return false;
        }
        *retries -= 1;
        true
    }

    pub async fn open_for_access(&self, node: &FileNode, flags: OpenFlags) -> Result<HandleToken> {
        let intent = OpenIntent::from_flags(flags)?;
        let disposition = if flags.contains(OpenFlags::CREATE) {
            CreateDisposition::OpenIf
        } else {
            CreateDisposition::Open
        };
        let mut set = self.ready_handles(node).await?;
        let ctx = self.op_ctx(node);
        let token = set.open(&ctx, intent, disposition).await?;
        debug!("{}: open {intent:?} -> {:?}", node.path, token.slot);
        Ok(token)
    }

    pub async fn close_handle(&self, node: &FileNode, token: HandleToken) -> Result<()> {
        let mut set = node.handles.write().await;
        let ctx = self.op_ctx(node);
        let outcome = set.close(&ctx, token, Self::close_mode(node)).await?;
        self.after_close(node, &mut set, outcome).await
    }

    async fn after_close(
        &self,
        node: &FileNode,
        set: &mut FileHandleSet,
        outcome: CloseOutcome,
    ) -> Result<()> {
        if outcome == CloseOutcome::StillOpen || set.has_active_opener() {
            return Ok(());
        }
        if node.reconnect.is_revoked() {
            node.reconnect.reset();
            info!("{}: last revoked handle closed, node usable again", node.path);
        }
        if set.delete_on_close {
            self.delete_node(node, set).await?;
        }
        Ok(())
    }

    async fn delete_node(&self, node: &FileNode, set: &mut FileHandleSet) -> Result<()> {
        let ctx = self.op_ctx(node);
        ctx.wait_for_break().await;
        set.delete_on_close = false;
        match self.rpc.delete(&node.path).await {
            Ok(()) | Err(RpcError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.forget(node);
        *lock_map(&self.dir_generations)
            .entry(parent_dir(&node.path).to_string())
            .or_insert(0) += 1;
        debug!("{}: deleted on last close", node.path);
        Ok(())
    }

    fn forget(&self, node: &FileNode) {
        let mut nodes = lock_map(&self.nodes);
        if nodes
            .get(&node.path)
            .is_some_and(|cached| std::ptr::eq(Arc::as_ptr(cached), node))
        {
            nodes.remove(&node.path);
        }
        lock_map(&self.leases).remove(&node.lease_key());
    }

    pub async fn read(
        &self,
        node: &FileNode,
        token: &HandleToken,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut retries = self.config.reconnect_retries;
        loop {
            self.ensure_ready(node).await?;
            let set = node.handles.read().await;
            let handle = set.handle_for(token)?;
            let res = self.rpc.read(handle, offset, len).await.map_err(SmbFsError::from);
            drop(set);
            match res {
                Err(e) if Self::should_retry(node, &e, &mut retries) => continue,
                res => return res,
            }
        }
    }

    pub async fn write(
        &self,
        node: &FileNode,
        token: &HandleToken,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let mut retries = self.config.reconnect_retries;
        loop {
            self.ensure_ready(node).await?;
            let set = node.handles.read().await;
            let handle = set.handle_for(token)?;
            let res = self.rpc.write(handle, offset, data).await.map_err(SmbFsError::from);
            drop(set);
            match res {
                Err(e) if Self::should_retry(node, &e, &mut retries) => continue,
                res => return res,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn lock_range(
        &self,
        node: &FileNode,
        token: &HandleToken,
        offset: u64,
        length: u64,
        owner_pid: u32,
        exclusive: bool,
        wait: bool,
    ) -> Result<()> {
        let mut retries = self.config.reconnect_retries;
        loop {
            let mut set = self.ready_handles(node).await?;
            let ctx = self.op_ctx(node);
            match set
                .lock(&ctx, token, offset, length, owner_pid, exclusive, wait)
                .await
            {
                Err(e) if Self::should_retry(node, &e, &mut retries) => continue,
                res => return res,
            }
        }
    }

    pub async fn unlock_range(
        &self,
        node: &FileNode,
        token: &HandleToken,
        offset: u64,
        length: u64,
        owner_pid: u32,
    ) -> Result<()> {
        let mut retries = self.config.reconnect_retries;
        loop {
            let mut set = self.ready_handles(node).await?;
            let ctx = self.op_ctx(node);
            match set.unlock(&ctx, token, offset, length, owner_pid).await {
                Err(e) if Self::should_retry(node, &e, &mut retries) => continue,
                res => return res,
            }
        }
    }

    pub fn notify_reconnect_needed(&self, node: &FileNode) {
        if node.reconnect.mark_needs_reopen() {
            debug!("{}: flagged for reopen", node.path);
        }
    }

    /// The session went away: every cached node must reopen before use.
    pub fn notify_session_dropped(&self) {
        let nodes: Vec<_> = lock_map(&self.nodes).values().cloned().collect();
        for node in &nodes {
            node.reconnect.mark_needs_reopen();
        }
        info!("session dropped, {} nodes flagged for reopen", nodes.len());
    }

    /// Server-initiated lease break. The acknowledgement is sent with no
    /// lock held; deferred handles that lost handle caching are closed
    /// afterwards.
    pub async fn on_lease_break(&self, key: LeaseKey, new_state: LeaseState) -> Result<()> {
        let node = lock_map(&self.leases).get(&key).and_then(Weak::upgrade);
        let Some(node) = node else {
            debug!("break for unknown lease {key:?}, acknowledging");
            self.rpc.lease_break_ack(key, new_state).await?;
            return Ok(());
        };

        node.lease.begin_break(new_state);
        let ack = self.rpc.lease_break_ack(key, new_state).await;
        let to_close = node.lease.finish_break(new_state);
        if !to_close.is_empty() {
            let mut set = node.handles.write().await;
            let ctx = self.op_ctx(&node);
            for kind in to_close {
                if let Err(e) = set.close_deferred(&ctx, kind).await {
                    warn!("{}: closing deferred {kind:?} handle after break failed: {e}", node.path);
                }
            }
        }
        ack.map_err(Into::into)
    }

    /// Memory mappings hold an extra opener until `munmap`.
    pub async fn mmap(&self, node: &FileNode, token: &HandleToken) -> Result<()> {
        let mut set = self.ready_handles(node).await?;
        set.map(token)
    }

    pub async fn munmap(&self, node: &FileNode) -> Result<()> {
        let mut set = node.handles.write().await;
        let ctx = self.op_ctx(node);
        match set.unmap(&ctx, Self::close_mode(node)).await? {
            Some(outcome) => self.after_close(node, &mut set, outcome).await,
            None => Ok(()),
        }
    }

    /// Remove the file once its last opener closes. Deferred handles are
    /// flushed right away so they cannot keep the file alive.
    pub async fn set_delete_on_close(&self, node: &FileNode) -> Result<()> {
        let mut set = node.handles.write().await;
        set.delete_on_close = true;
        let ctx = self.op_ctx(node);
        for kind in SlotKind::ALL {
            set.close_deferred(&ctx, kind).await?;
        }
        if !set.has_active_opener() {
            self.delete_node(node, &mut set).await?;
        }
        Ok(())
    }

    /// Really close deferred handles that outlived the configured timeout.
    pub async fn reap_deferred_closes(&self) -> usize {
        let timeout = self.config.deferred_close_timeout();
        let candidates: Vec<_> = lock_map(&self.nodes)
            .values()
            .filter(|node| {
                !node
                    .lease
                    .expired_deferrals(Instant::now(), timeout)
                    .is_empty()
            })
            .cloned()
            .collect();

        let mut reaped = 0;
        for node in candidates {
            let mut set = node.handles.write().await;
            // Re-check under the lock: the handle may have been reused.
            let expired = node.lease.expired_deferrals(Instant::now(), timeout);
            let ctx = self.op_ctx(&node);
            for kind in expired {
                match set.close_deferred(&ctx, kind).await {
                    Ok(true) => reaped += 1,
                    Ok(false) => {}
                    Err(e) => warn!("{}: reaping deferred {kind:?} handle failed: {e}", node.path),
                }
            }
        }
        if reaped > 0 {
            debug!("reaped {reaped} expired deferred handles");
        }
        reaped
    }

    /// Periodic reaper; exits once the share is dropped.
    pub fn spawn_deferred_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let share = Arc::downgrade(self);
        let period = self.config.deferred_reaper_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(share) = share.upgrade() else {
                    break;
                };
                share.reap_deferred_closes().await;
            }
        })
    }

    /// Drop a node from the cache, closing whatever it still holds open.
    pub async fn evict(&self, path: &str) -> bool {
        let Some(node) = lock_map(&self.nodes).remove(path) else {
            return false;
        };
        lock_map(&self.leases).remove(&node.lease_key());
        let mut set = node.handles.write().await;
        let ctx = self.op_ctx(&node);
        set.force_close_all(&ctx).await;
        debug!("{path}: evicted");
        true
    }

    pub async fn shutdown(&self) {
        let paths: Vec<String> = lock_map(&self.nodes).keys().cloned().collect();
        for path in &paths {
            self.evict(path).await;
        }
        info!("share shut down, {} nodes released", paths.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/a/b/c"), "/a/b");
        assert_eq!(parent_dir("/a"), "/");
        assert_eq!(parent_dir("a"), "/");
    }
}
