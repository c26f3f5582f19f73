use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Snapshot of the share's deferred-close accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredStats {
    pub current: u32,
    pub max: u32,
    pub cumulative: u64,
}

/// Share-wide bound on handles kept open server-side with no local opener.
///
/// Plain atomics: the only invariant is `current <= max`, enforced by the
/// compare-exchange in `try_acquire`.
#[derive(Debug)]
pub struct DeferredCloseRegistry {
    current: AtomicU32,
    max: u32,
    cumulative: AtomicU64,
}

impl DeferredCloseRegistry {
    pub fn new(max: u32) -> Self {
        DeferredCloseRegistry {
            current: AtomicU32::new(0),
            max,
            cumulative: AtomicU64::new(0),
        }
    }

    /// Reserve room for one more deferred handle. False when the pool is full.
    pub fn try_acquire(&self) -> bool {
        let reserved = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur < self.max).then_some(cur + 1)
            })
            .is_ok();
        if reserved {
            self.cumulative.fetch_add(1, Ordering::Relaxed);
        }
        reserved
    }

    pub fn release(&self) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| cur.checked_sub(1));
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn stats(&self) -> DeferredStats {
        DeferredStats {
            current: self.current(),
            max: self.max,
            cumulative: self.cumulative.load(Ordering::Relaxed),
        }
    }
}
