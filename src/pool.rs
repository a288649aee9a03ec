//! Engine memory pools.
//!
//! # Responsibilities
//! - Account every allocation made on behalf of a connection or request
//! - Enforce the cycle-wide memory limit
//! - Release the whole pool at once when its last owner goes away
//!
//! # Design Decisions
//! - Pools are accounting arenas: `pcalloc` hands out owned zeroed buffers,
//!   the pool only tracks how much it has handed out
//! - One shared `MemoryBudget` per cycle, debited lock-free
//! - `PoolStats` makes leaks observable (created vs destroyed)

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

/// Bytes debited for the pool structure itself.
pub const POOL_HEADER_SIZE: usize = 80;

/// Initial size of pools backing synthetic requests.
pub const DUMMY_POOL_SIZE: usize = 8 * 1024;

/// Initial size of pools backing network requests.
pub const REQUEST_POOL_SIZE: usize = 4 * 1024;

static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Cycle-wide memory limit shared by all pools.
#[derive(Debug, Default)]
pub struct MemoryBudget {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            used: AtomicUsize::new(0),
        }
    }

    /// Try to debit `size` bytes. Returns false when the limit would be exceeded.
    pub fn try_debit(&self, size: usize) -> bool {
        let Some(limit) = self.limit else {
            self.used.fetch_add(size, Ordering::Relaxed);
            return true;
        };

        let mut prev = self.used.load(Ordering::Relaxed);
        loop {
            let Some(next) = prev.checked_add(size).filter(|n| *n <= limit) else {
                return false;
            };
            match self.used.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(x) => prev = x,
            }
        }
    }

    pub fn credit(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// Pool creation/destruction counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl PoolStats {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Pools currently alive.
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.destroyed())
    }
}

/// Returned when the memory budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("memory budget exhausted while allocating {size} bytes")]
pub struct PoolExhausted {
    pub size: usize,
}

#[derive(Debug)]
struct PoolInner {
    id: u64,
    size: usize,
    allocated: AtomicUsize,
    budget: Arc<MemoryBudget>,
    stats: Arc<PoolStats>,
}

/// Handle to an engine pool. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool with the given initial size.
    pub fn create(size: usize, budget: &Arc<MemoryBudget>, stats: &Arc<PoolStats>) -> Result<Pool, PoolExhausted> {
        if !budget.try_debit(POOL_HEADER_SIZE) {
            return Err(PoolExhausted { size: POOL_HEADER_SIZE });
        }
        stats.created.fetch_add(1, Ordering::Relaxed);

        let pool = Pool {
            inner: Arc::new(PoolInner {
                id: POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                size,
                allocated: AtomicUsize::new(0),
                budget: Arc::clone(budget),
                stats: Arc::clone(stats),
            }),
        };
        tracing::trace!(pool = pool.id(), size, "Pool created");
        Ok(pool)
    }

    /// Account `size` bytes against this pool without handing out memory.
    pub fn reserve(&self, size: usize) -> Result<(), PoolExhausted> {
        if !self.inner.budget.try_debit(size) {
            return Err(PoolExhausted { size });
        }
        self.inner.allocated.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Allocate a zeroed buffer of `size` bytes.
    pub fn pcalloc(&self, size: usize) -> Option<BytesMut> {
        self.reserve(size).ok()?;
        Some(BytesMut::zeroed(size))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Bytes handed out so far.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// True when both handles refer to the same pool.
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let allocated = *self.allocated.get_mut();
        self.budget.credit(POOL_HEADER_SIZE + allocated);
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pool = self.id, allocated, "Pool destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_limits_debits() {
        let budget = MemoryBudget::with_limit(100);
        assert!(budget.try_debit(60));
        assert!(!budget.try_debit(41));
        assert!(budget.try_debit(40));
        budget.credit(100);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn pool_returns_everything_on_drop() {
        let budget = Arc::new(MemoryBudget::with_limit(1024));
        let stats = Arc::new(PoolStats::default());

        let pool = Pool::create(512, &budget, &stats).unwrap();
        let buf = pool.pcalloc(100).unwrap();
        assert_eq!(buf.len(), 100);
        assert!(buf.iter().all(|b| *b == 0));
        assert_eq!(budget.used(), POOL_HEADER_SIZE + 100);
        assert_eq!(stats.live(), 1);

        let shared = pool.clone();
        drop(pool);
        assert_eq!(stats.live(), 1);

        drop(shared);
        assert_eq!(stats.live(), 0);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn pool_creation_fails_without_budget() {
        let budget = Arc::new(MemoryBudget::with_limit(POOL_HEADER_SIZE - 1));
        let stats = Arc::new(PoolStats::default());
        assert!(Pool::create(512, &budget, &stats).is_err());
        assert_eq!(stats.created(), 0);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn failed_allocation_leaves_accounting_untouched() {
        let budget = Arc::new(MemoryBudget::with_limit(POOL_HEADER_SIZE + 10));
        let stats = Arc::new(PoolStats::default());
        let pool = Pool::create(512, &budget, &stats).unwrap();
        assert!(pool.pcalloc(11).is_none());
        assert_eq!(pool.allocated(), 0);
        assert!(pool.pcalloc(10).is_some());
    }
}
