//! Buffer Pool - Quota-Counted Memory Pages for One Result Partition
//!
//! This module implements `BufferPool`, the per-partition page allocator that
//! drives backpressure through the whole exchange layer.
//!
//! ## What Does BufferPool Do?
//!
//! 1. **Hands out pages** as `BufferBuilder`s, one pool permit per page
//! 2. **Enforces the quota**: never more than `num_buffers` pages outstanding
//! 3. **Blocks producers** when exhausted (`request_buffer_builder().await`),
//!    which is exactly how backpressure propagates upstream
//! 4. **Recycles on last release**: a page's permit returns to the pool when
//!    the final `Buffer`/`BufferConsumer` handle referencing it drops
//! 5. **Re-quotas live** via `set_num_buffers` so memory can be redistributed
//!    across concurrently running tasks
//!
//! ## Blocking and Cancellation
//!
//! The blocking request is an async wait. Cancelling the producing task drops
//! the pending future, which removes the waiter without consuming a permit —
//! nothing leaks. The non-blocking variant reports exhaustion as `None`
//! rather than an error, since running dry is an expected steady state under
//! backpressure.
//!
//! ## Fairness
//!
//! Waiters are woken in FIFO order; every recycled page wakes exactly one
//! waiter, and a waiter that acquires while quota headroom remains passes the
//! wakeup on, so quota growth reaches all parked requesters.
//!
//! ## Thread Safety
//!
//! The pool is `Send + Sync` and cheap to clone (`Arc` internals). Counter
//! updates happen under a short std mutex; waiting uses `tokio::sync::Notify`.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::buffer::BufferBuilder;
use crate::error::{Error, Result};

/// Shared pool internals.
struct PoolShared {
    page_size: usize,
    state: Mutex<PoolState>,
    available: Notify,
}

struct PoolState {
    /// Maximum pages that may be outstanding.
    quota: usize,
    /// Pages currently held by builders, consumers, or in-flight buffers.
    outstanding: usize,
    destroyed: bool,
}

/// One outstanding page. Dropping the last reference returns the page's
/// quota slot to the pool and wakes a waiter.
pub struct PoolPermit {
    shared: Arc<PoolShared>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.outstanding -= 1;
        drop(state);
        self.shared.available.notify_one();
    }
}

/// Quota-counted page pool for one result partition.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool handing out pages of `page_size` bytes, at most
    /// `num_buffers` outstanding at a time.
    pub fn new(page_size: usize, num_buffers: usize) -> Self {
        assert!(page_size > 0, "page size must be positive");
        assert!(num_buffers > 0, "pool must hold at least one buffer");
        Self {
            shared: Arc::new(PoolShared {
                page_size,
                state: Mutex::new(PoolState {
                    quota: num_buffers,
                    outstanding: 0,
                    destroyed: false,
                }),
                available: Notify::new(),
            }),
        }
    }

    /// Request a page, waiting until one is available.
    ///
    /// Cancel-safe: dropping the returned future before it resolves leaves
    /// the pool untouched.
    pub async fn request_buffer_builder(&self) -> Result<BufferBuilder> {
        loop {
            if let Some(builder) = self.try_acquire()? {
                return Ok(builder);
            }
            self.shared.available.notified().await;
        }
    }

    /// Request a page without waiting. `None` means "would block".
    pub fn try_request_buffer_builder(&self) -> Result<Option<BufferBuilder>> {
        self.try_acquire()
    }

    fn try_acquire(&self) -> Result<Option<BufferBuilder>> {
        let headroom;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.destroyed {
                return Err(Error::PoolDestroyed);
            }
            if state.outstanding >= state.quota {
                return Ok(None);
            }
            state.outstanding += 1;
            headroom = state.outstanding < state.quota;
        }
        if headroom {
            // Pass the wakeup on so quota growth reaches every parked waiter.
            self.shared.available.notify_one();
        }
        let permit = Arc::new(PoolPermit {
            shared: self.shared.clone(),
        });
        Ok(Some(BufferBuilder::new(self.shared.page_size, permit)))
    }

    /// Grow or shrink the live quota.
    ///
    /// Shrinking below the current outstanding count is allowed: pinned pages
    /// stay valid and requests block until enough of them are recycled.
    pub fn set_num_buffers(&self, num_buffers: usize) -> Result<()> {
        if num_buffers == 0 {
            let outstanding = self.shared.state.lock().unwrap().outstanding;
            return Err(Error::InsufficientBuffers {
                requested: num_buffers,
                outstanding,
            });
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            state.quota = num_buffers;
        }
        self.shared.available.notify_waiters();
        self.shared.available.notify_one();
        Ok(())
    }

    /// Tear the pool down. Pending and future requests fail with
    /// [`Error::PoolDestroyed`]; already-outstanding pages stay valid until
    /// their handles drop.
    pub fn destroy(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.destroyed = true;
        }
        self.shared.available.notify_waiters();
        self.shared.available.notify_one();
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().unwrap().destroyed
    }

    /// Pages currently outstanding.
    pub fn num_outstanding(&self) -> usize {
        self.shared.state.lock().unwrap().outstanding
    }

    /// Pages that could be handed out right now.
    pub fn num_available(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.quota.saturating_sub(state.outstanding)
    }

    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_within_quota() {
        let pool = BufferPool::new(128, 2);
        let a = pool.request_buffer_builder().await.unwrap();
        let b = pool.request_buffer_builder().await.unwrap();
        assert_eq!(pool.num_outstanding(), 2);
        assert_eq!(pool.num_available(), 0);
        drop(a);
        drop(b);
        assert_eq!(pool.num_outstanding(), 0);
    }

    #[tokio::test]
    async fn test_try_request_reports_would_block() {
        let pool = BufferPool::new(128, 1);
        let held = pool.try_request_buffer_builder().unwrap();
        assert!(held.is_some());
        assert!(pool.try_request_buffer_builder().unwrap().is_none());
        drop(held);
        assert!(pool.try_request_buffer_builder().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_blocking_request_unblocked_by_recycle() {
        let pool = BufferPool::new(128, 1);
        let held = pool.request_buffer_builder().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.request_buffer_builder().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let builder = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(builder.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaks_nothing() {
        let pool = BufferPool::new(128, 1);
        let held = pool.request_buffer_builder().await.unwrap();

        // Start a wait and cancel it mid-flight.
        {
            let fut = pool.request_buffer_builder();
            tokio::pin!(fut);
            let poll = tokio::time::timeout(Duration::from_millis(20), fut.as_mut()).await;
            assert!(poll.is_err(), "request should still be pending");
        }

        drop(held);
        assert_eq!(pool.num_outstanding(), 0);
        // The pool must still serve the next requester.
        let builder = pool.request_buffer_builder().await.unwrap();
        drop(builder);
    }

    #[tokio::test]
    async fn test_quota_growth_wakes_waiters() {
        let pool = BufferPool::new(128, 1);
        let _held = pool.request_buffer_builder().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.request_buffer_builder().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.set_num_buffers(2).unwrap();
        let builder = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(builder.is_ok());
    }

    #[tokio::test]
    async fn test_shrink_below_outstanding() {
        let pool = BufferPool::new(128, 2);
        let a = pool.request_buffer_builder().await.unwrap();
        let _b = pool.request_buffer_builder().await.unwrap();

        pool.set_num_buffers(1).unwrap();
        assert!(pool.try_request_buffer_builder().unwrap().is_none());

        // Releasing one page still leaves the pool at its (reduced) quota.
        drop(a);
        assert!(pool.try_request_buffer_builder().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_quota_rejected() {
        let pool = BufferPool::new(128, 2);
        assert!(matches!(
            pool.set_num_buffers(0),
            Err(Error::InsufficientBuffers { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_unblocks_waiters() {
        let pool = BufferPool::new(128, 1);
        let _held = pool.request_buffer_builder().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.request_buffer_builder().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.destroy();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::PoolDestroyed)));
        assert!(matches!(
            pool.try_request_buffer_builder(),
            Err(Error::PoolDestroyed)
        ));
    }
}
