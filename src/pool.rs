//! Object Pools
//!
//! Uniform allocator for `Trade` and `Position` records. Reuse is
//! identity-checked rather than relying on language-level finalizers: each
//! pooled value is wrapped with a monotonic id, and `release` only accepts
//! an id that the pool itself handed out and has not already reclaimed.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// A pooled value tagged with the id the pool used to hand it out.
pub struct Pooled<T> {
    pub id: u64,
    pub value: T,
}

struct FreeEntry<T> {
    value: T,
    released_at: Instant,
}

pub struct PoolHealth {
    pub in_use: usize,
    pub available: usize,
    pub capacity: usize,
    pub acquired_total: u64,
    pub released_total: u64,
}

impl PoolHealth {
    /// True once in-use exceeds 80% of the soft capacity.
    pub fn needs_gc(&self) -> bool {
        self.capacity > 0 && self.in_use as f64 > self.capacity as f64 * 0.8
    }

    pub fn drift(&self) -> i64 {
        self.acquired_total as i64 - self.released_total as i64
    }
}

/// Thread-safe object pool with identity-checked, idempotent release.
pub struct Pool<T: Default> {
    name: &'static str,
    capacity: usize,
    free: Mutex<Vec<FreeEntry<T>>>,
    outstanding: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    in_use: AtomicUsize,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
    double_release_total: AtomicU64,
}

impl<T: Default> Pool<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
            outstanding: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            in_use: AtomicUsize::new(0),
            acquired_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
            double_release_total: AtomicU64::new(0),
        }
    }

    /// Acquire a reusable instance. Always succeeds: the pool grows
    /// internally when its free list is exhausted.
    pub fn acquire(&self) -> Pooled<T> {
        let value = {
            let mut free = self.free.lock();
            free.pop().map(|e| e.value).unwrap_or_default()
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outstanding.lock().insert(id);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        self.acquired_total.fetch_add(1, Ordering::Relaxed);
        Pooled { id, value }
    }

    /// Return a value for reuse. Idempotent: releasing an id twice (or an
    /// id this pool never issued) logs a warning instead of corrupting the
    /// free list.
    pub fn release(&self, pooled: Pooled<T>) {
        let was_outstanding = self.outstanding.lock().remove(&pooled.id);
        if !was_outstanding {
            self.double_release_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(pool = self.name, id = pooled.id, "double release ignored");
            return;
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.released_total.fetch_add(1, Ordering::Relaxed);
        self.free.lock().push(FreeEntry {
            value: pooled.value,
            released_at: Instant::now(),
        });
    }

    pub fn health(&self) -> PoolHealth {
        PoolHealth {
            in_use: self.in_use.load(Ordering::Relaxed),
            available: self.free.lock().len(),
            capacity: self.capacity,
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            released_total: self.released_total.load(Ordering::Relaxed),
        }
    }

    /// Forced garbage pass: drop free entries that have sat idle past
    /// `idle_deadline`. Run automatically when `health().needs_gc()`, and
    /// periodically by the global pool-monitor task.
    pub fn gc(&self, idle_deadline: std::time::Duration) -> usize {
        let mut free = self.free.lock();
        let before = free.len();
        free.retain(|e| e.released_at.elapsed() < idle_deadline);
        before - free.len()
    }

    pub fn maybe_gc(&self, idle_deadline: std::time::Duration) {
        if self.health().needs_gc() {
            let dropped = self.gc(idle_deadline);
            if dropped > 0 {
                tracing::debug!(pool = self.name, dropped, "forced pool gc");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Dummy {
        n: u32,
    }

    #[test]
    fn acquire_returns_zeroed_instance() {
        let pool: Pool<Dummy> = Pool::new("dummy", 4);
        let p = pool.acquire();
        assert_eq!(p.value.n, 0);
        assert_eq!(pool.health().in_use, 1);
    }

    #[test]
    fn release_then_reacquire_reuses_slot() {
        let pool: Pool<Dummy> = Pool::new("dummy", 4);
        let mut p = pool.acquire();
        p.value.n = 7;
        pool.release(p);
        assert_eq!(pool.health().available, 1);
        let p2 = pool.acquire();
        assert_eq!(p2.value.n, 7);
    }

    #[test]
    fn double_release_is_idempotent() {
        let pool: Pool<Dummy> = Pool::new("dummy", 4);
        let p = pool.acquire();
        let id = p.id;
        pool.release(p);
        // Forge a second release with the same id; the pool must reject it.
        pool.release(Pooled {
            id,
            value: Dummy { n: 1 },
        });
        assert_eq!(pool.health().available, 1);
        assert_eq!(pool.double_release_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn needs_gc_above_80_percent() {
        let pool: Pool<Dummy> = Pool::new("dummy", 10);
        let held: Vec<_> = (0..9).map(|_| pool.acquire()).collect();
        assert!(pool.health().needs_gc());
        drop(held);
    }
}
