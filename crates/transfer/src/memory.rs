//! Fixed-size buffer pools that bound memory use under concurrency.
//!
//! A [`BufferPool`] hands out at most `capacity` buffers of one block size.
//! When all of them are leased, [`BufferPool::lease`] returns `None`: a
//! backpressure signal, not an error. Buffers go back to the pool when the
//! [`LeasedBuffer`] is released or dropped, so a buffer has exactly one
//! owner between lease and release.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of live buffers per block size.
pub const DEFAULT_BUFFERS_PER_POOL: usize = 64;

/// A bounded pool of reusable buffers of one block size.
pub struct BufferPool {
    block_size: usize,
    capacity: usize,
    state: Mutex<PoolState>,
    released: Notify,
}

struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
}

impl BufferPool {
    /// Creates a pool of at most `capacity` buffers (minimum 1).
    pub fn new(block_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                free: Vec::new(),
                outstanding: 0,
            }),
            released: Notify::new(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently leased.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Number of allocated buffers waiting in the free list.
    pub fn idle(&self) -> usize {
        self.lock().free.len()
    }

    /// Leases a buffer, or returns `None` when the pool is exhausted.
    pub fn lease(self: &Arc<Self>) -> Option<LeasedBuffer> {
        let mut state = self.lock();
        if state.outstanding >= self.capacity {
            return None;
        }
        let buf = state
            .free
            .pop()
            .unwrap_or_else(|| vec![0u8; self.block_size]);
        state.outstanding += 1;
        Some(LeasedBuffer {
            buf,
            pool: Arc::clone(self),
        })
    }

    /// Waits until a buffer can be leased.
    ///
    /// Returns `None` if `cancel` fires first.
    pub async fn lease_wait(self: &Arc<Self>, cancel: &CancellationToken) -> Option<LeasedBuffer> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if let Some(lease) = self.lease() {
                return Some(lease);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Frees every idle buffer. Returns how many were dropped.
    pub fn release_unused(&self) -> usize {
        let mut state = self.lock();
        let trimmed = state.free.len();
        state.free = Vec::new();
        trimmed
    }

    fn give_back(&self, buf: Vec<u8>) {
        {
            let mut state = self.lock();
            debug_assert!(state.outstanding > 0, "buffer released twice");
            state.outstanding = state.outstanding.saturating_sub(1);
            if buf.len() == self.block_size {
                state.free.push(buf);
            }
        }
        self.released.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Dereferences to the full block-sized byte slice.
pub struct LeasedBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl LeasedBuffer {
    /// Returns the buffer to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for LeasedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for LeasedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for LeasedBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

impl std::fmt::Debug for LeasedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}

/// Registry of pools keyed by block size.
///
/// Pools are created lazily on first use and live as long as the registry.
/// Share one registry (behind an `Arc`) between transfers that should
/// share a memory budget.
pub struct BufferPoolRegistry {
    capacity: usize,
    pools: Mutex<HashMap<usize, Arc<BufferPool>>>,
}

impl Default for BufferPoolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFERS_PER_POOL)
    }
}

impl BufferPoolRegistry {
    /// Creates a registry whose pools hold at most `capacity` buffers each.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pool for `block_size`, creating it if needed.
    pub fn pool(&self, block_size: usize) -> Arc<BufferPool> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(pools.entry(block_size).or_insert_with(|| {
            debug!(block_size, capacity = self.capacity, "creating buffer pool");
            BufferPool::new(block_size, self.capacity)
        }))
    }

    /// Trims idle buffers in every pool. Returns how many were dropped.
    pub fn release_unused(&self) -> usize {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools.values().map(|p| p.release_unused()).sum()
    }

    /// Total leased buffers across all pools.
    pub fn outstanding(&self) -> usize {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools.values().map(|p| p.outstanding()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lease_until_exhausted() {
        let pool = BufferPool::new(16, 2);
        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        assert_eq!(a.len(), 16);
        assert!(pool.lease().is_none());
        assert_eq!(pool.outstanding(), 2);

        a.release();
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.idle(), 1);
        let c = pool.lease().unwrap();
        assert_eq!(pool.idle(), 0);
        drop(b);
        drop(c);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(8, 1);
        let mut a = pool.lease().unwrap();
        a[0] = 0xAB;
        let ptr = a.as_ptr();
        a.release();
        let b = pool.lease().unwrap();
        assert_eq!(b.as_ptr(), ptr);
    }

    #[test]
    fn release_unused_trims_idle() {
        let pool = BufferPool::new(8, 4);
        let leases: Vec<_> = (0..3).map(|_| pool.lease().unwrap()).collect();
        drop(leases);
        assert_eq!(pool.idle(), 3);
        assert_eq!(pool.release_unused(), 3);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn registry_keys_by_block_size() {
        let registry = BufferPoolRegistry::new(2);
        let a = registry.pool(1024);
        let b = registry.pool(1024);
        let c = registry.pool(2048);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _l1 = a.lease().unwrap();
        let _l2 = c.lease().unwrap();
        assert_eq!(registry.outstanding(), 2);
    }

    #[tokio::test]
    async fn lease_wait_wakes_on_release() {
        let pool = BufferPool::new(4, 1);
        let held = pool.lease().unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.lease_wait(&cancel).await.is_some() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release();
        assert!(waiter.await.unwrap());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn lease_wait_honors_cancel() {
        let pool = BufferPool::new(4, 1);
        let _held = pool.lease().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(pool.lease_wait(&cancel).await.is_none());
    }
}
