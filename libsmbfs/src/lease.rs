//! Per-file caching lease.
//!
//! The lease lives behind its own mutex because break notifications mutate
//! it from the transport's task, independent of node-level work. The mutex
//! is never held across an `.await`: callers take it, read or mutate, and
//! release it before touching handle state.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, warn};

use crate::rpc::{LeaseKey, LeaseState, Rights};
use crate::slot::SlotKind;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct LeaseFlags: u8 {
        const GRANTED = 0x1;
        /// A break notification is being processed.
        const BREAKING = 0x2;
        const DEFERRED_CLOSE = 0x4;
    }
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub key: LeaseKey,
    pub requested: LeaseState,
    pub granted: LeaseState,
    pub flags: LeaseFlags,
    /// Start of the deferred close per slot, indexed by `SlotKind::index`.
    pub deferred_since: [Option<Instant>; 2],
    pub handle_reuse_count: u64,
    pub breaks: u64,
}

impl Lease {
    fn new(key: LeaseKey) -> Self {
        Lease {
            key,
            requested: LeaseState::empty(),
            granted: LeaseState::empty(),
            flags: LeaseFlags::empty(),
            deferred_since: [None, None],
            handle_reuse_count: 0,
            breaks: 0,
        }
    }

    pub fn has_handle_caching(&self) -> bool {
        self.flags.contains(LeaseFlags::GRANTED) && self.granted.contains(LeaseState::HANDLE_CACHING)
    }

    pub fn is_deferred(&self, slot: SlotKind) -> bool {
        self.deferred_since[slot.index()].is_some()
    }

    fn sync_deferred_flag(&mut self) {
        let any = self.deferred_since.iter().any(Option::is_some);
        self.flags.set(LeaseFlags::DEFERRED_CLOSE, any);
    }
}

#[derive(Debug)]
pub struct LeaseManager {
    inner: Mutex<Lease>,
}

impl LeaseManager {
    pub fn new(key: LeaseKey) -> Self {
        LeaseManager {
            inner: Mutex::new(Lease::new(key)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lease> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> LeaseKey {
        self.lock().key
    }

    pub fn snapshot(&self) -> Lease {
        self.lock().clone()
    }

    /// Caching to ask for, derived only from the rights being opened with.
    pub fn requested_caching(rights: Rights) -> LeaseState {
        let mut state = LeaseState::empty();
        if rights.can_read() {
            state |= LeaseState::READ_CACHING | LeaseState::HANDLE_CACHING;
            if rights.can_write() {
                state |= LeaseState::WRITE_CACHING;
            }
        }
        state
    }

    /// Record what the server granted on an open of this file.
    pub fn record_grant(&self, requested: LeaseState, granted: Option<LeaseState>) {
        let mut lease = self.lock();
        lease.requested = requested;
        match granted {
            Some(state) if !state.is_empty() => {
                lease.granted = state;
                lease.flags.insert(LeaseFlags::GRANTED);
            }
            _ => {}
        }
    }

    /// Drop the grant once no handle on the file holds the lease any more.
    pub fn unregister(&self) {
        let mut lease = self.lock();
        lease.granted = LeaseState::empty();
        lease.flags.remove(LeaseFlags::GRANTED);
        lease.deferred_since = [None, None];
        lease.sync_deferred_flag();
    }

    pub fn has_handle_caching(&self) -> bool {
        self.lock().has_handle_caching()
    }

    pub fn is_breaking(&self) -> bool {
        self.lock().flags.contains(LeaseFlags::BREAKING)
    }

    /// Mark `slot` deferred. Refused unless handle caching is granted and no
    /// break is in flight.
    pub fn try_mark_deferred(&self, slot: SlotKind, now: Instant) -> bool {
        let mut lease = self.lock();
        if !lease.has_handle_caching() || lease.flags.contains(LeaseFlags::BREAKING) {
            return false;
        }
        lease.deferred_since[slot.index()] = Some(now);
        lease.sync_deferred_flag();
        true
    }

    /// Take over a deferred handle for reuse. Only succeeds while handle
    /// caching is still granted.
    pub fn reactivate_deferred(&self, slot: SlotKind) -> bool {
        let mut lease = self.lock();
        if !lease.is_deferred(slot) || !lease.has_handle_caching() {
            return false;
        }
        lease.deferred_since[slot.index()] = None;
        lease.sync_deferred_flag();
        lease.handle_reuse_count += 1;
        true
    }

    /// Forget a deferral whose handle is being really closed or dropped.
    pub fn clear_deferred(&self, slot: SlotKind) -> bool {
        let mut lease = self.lock();
        let was = lease.deferred_since[slot.index()].take().is_some();
        lease.sync_deferred_flag();
        was
    }

    pub fn expired_deferrals(&self, now: Instant, timeout: Duration) -> Vec<SlotKind> {
        let lease = self.lock();
        SlotKind::ALL
            .into_iter()
            .filter(|slot| {
                lease.deferred_since[slot.index()]
                    .is_some_and(|since| now.saturating_duration_since(since) >= timeout)
            })
            .collect()
    }

    /// First half of a break: flag it so local closes hold off.
    pub fn begin_break(&self, new_state: LeaseState) {
        let mut lease = self.lock();
        lease.flags.insert(LeaseFlags::BREAKING);
        lease.breaks += 1;
        debug!(
            "{:?} breaking {:?} -> {:?}",
            lease.key, lease.granted, new_state
        );
    }

    /// Second half of a break: store the reduced grant and report deferred
    /// slots that lost handle caching and must now be really closed.
    pub fn finish_break(&self, new_state: LeaseState) -> Vec<SlotKind> {
        let mut lease = self.lock();
        lease.granted = new_state;
        if new_state.is_empty() {
            lease.flags.remove(LeaseFlags::GRANTED);
        }
        lease.flags.remove(LeaseFlags::BREAKING);
        if new_state.contains(LeaseState::HANDLE_CACHING) {
            return Vec::new();
        }
        SlotKind::ALL
            .into_iter()
            .filter(|slot| lease.is_deferred(*slot))
            .collect()
    }

    /// Bounded wait for an in-flight break to finish. Returns false when the
    /// wait gave up; the caller proceeds anyway.
    pub async fn wait_for_break(&self, retries: u32, interval: Duration) -> bool {
        for _ in 0..retries {
            if !self.is_breaking() {
                return true;
            }
            tokio::time::sleep(interval).await;
        }
        if self.is_breaking() {
            warn!(
                "{:?} break still in progress after {} waits, proceeding",
                self.key(),
                retries
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rwh() -> LeaseState {
        LeaseState::READ_CACHING | LeaseState::HANDLE_CACHING | LeaseState::WRITE_CACHING
    }

    #[test]
    fn test_requested_caching() {
        assert_eq!(
            LeaseManager::requested_caching(Rights::READ_DATA),
            LeaseState::READ_CACHING | LeaseState::HANDLE_CACHING
        );
        assert_eq!(
            LeaseManager::requested_caching(Rights::READ_DATA | Rights::WRITE_DATA),
            rwh()
        );
        assert!(LeaseManager::requested_caching(Rights::WRITE_DATA).is_empty());
    }

    #[test]
    fn test_defer_requires_handle_caching() {
        let lease = LeaseManager::new(LeaseKey(1));
        assert!(!lease.try_mark_deferred(SlotKind::Shared, Instant::now()));

        lease.record_grant(rwh(), Some(LeaseState::READ_CACHING));
        assert!(!lease.try_mark_deferred(SlotKind::Shared, Instant::now()));

        lease.record_grant(rwh(), Some(rwh()));
        assert!(lease.try_mark_deferred(SlotKind::Shared, Instant::now()));
        assert!(lease.snapshot().flags.contains(LeaseFlags::DEFERRED_CLOSE));

        assert!(lease.reactivate_deferred(SlotKind::Shared));
        let snap = lease.snapshot();
        assert_eq!(snap.handle_reuse_count, 1);
        assert!(!snap.flags.contains(LeaseFlags::DEFERRED_CLOSE));
    }

    #[test]
    fn test_break_losing_handle_caching_reports_deferred() {
        let lease = LeaseManager::new(LeaseKey(2));
        lease.record_grant(rwh(), Some(rwh()));
        assert!(lease.try_mark_deferred(SlotKind::Shared, Instant::now()));

        lease.begin_break(LeaseState::READ_CACHING);
        assert!(lease.is_breaking());
        assert!(!lease.try_mark_deferred(SlotKind::Exclusive, Instant::now()));

        let to_close = lease.finish_break(LeaseState::READ_CACHING);
        assert_eq!(to_close, vec![SlotKind::Shared]);
        assert!(!lease.is_breaking());
        assert!(!lease.reactivate_deferred(SlotKind::Shared));
    }

    #[test]
    fn test_expired_deferrals() {
        let lease = LeaseManager::new(LeaseKey(3));
        lease.record_grant(rwh(), Some(rwh()));
        let start = Instant::now();
        assert!(lease.try_mark_deferred(SlotKind::Shared, start));
        assert!(lease
            .expired_deferrals(start, Duration::from_secs(5))
            .is_empty());
        assert_eq!(
            lease.expired_deferrals(start + Duration::from_secs(5), Duration::from_secs(5)),
            vec![SlotKind::Shared]
        );
    }

    #[tokio::test]
    async fn test_wait_for_break_is_bounded() {
        let lease = LeaseManager::new(LeaseKey(4));
        assert!(lease.wait_for_break(3, Duration::from_millis(1)).await);
        lease.begin_break(LeaseState::empty());
        assert!(!lease.wait_for_break(3, Duration::from_millis(1)).await);
        lease.finish_break(LeaseState::empty());
        assert!(lease.wait_for_break(3, Duration::from_millis(1)).await);
    }
}
