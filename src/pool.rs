//! RT memory pool: a fixed byte budget shared by the RT thread and the
//! compiler's memory manager.
//!
//! The host reserves a realtime pool once at startup. Memory the RT thread
//! ends up holding (unit slots, factory instance memory, job buffers) is
//! allocated on the NRT side and charged against the budget through an
//! [`RtLease`]; the RT thread itself only ever returns leases. Leasing is a
//! single compare-and-swap loop and never allocates. Running out of budget is
//! the RT allocation failure every caller has to check.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Default pool size, matching the usual 8 MiB realtime memory of a host.
pub const DEFAULT_POOL_BYTES: usize = 8 * 1024 * 1024;

/// Errors raised by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Not enough budget left for the request.
    #[error("rt pool exhausted: requested {requested} bytes, {available} available")]
    Exhausted {
        /// Bytes asked for.
        requested: usize,
        /// Bytes still free at the time of the request.
        available: usize,
    },
}

/// Realtime memory budget.
#[derive(Debug)]
pub struct RtPool {
    capacity: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

impl RtPool {
    /// Create a pool with `capacity` bytes of budget.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Total budget in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently leased.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use())
    }

    /// Highest `in_use` ever observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Charge `bytes` against the pool.
    ///
    /// RT-safe: wait-free in the uncontended case, never allocates.
    pub fn lease(self: &Arc<Self>, bytes: usize) -> Result<RtLease, PoolError> {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let available = self.capacity.saturating_sub(current);
            if bytes > available {
                return Err(PoolError::Exhausted {
                    requested: bytes,
                    available,
                });
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(current + bytes, Ordering::Relaxed);
                    return Ok(RtLease {
                        pool: Arc::clone(self),
                        bytes,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Lease room for `count` values of `T`.
    pub fn lease_array<T>(self: &Arc<Self>, count: usize) -> Result<RtLease, PoolError> {
        self.lease(std::mem::size_of::<T>().saturating_mul(count))
    }
}

/// A charge against an [`RtPool`]; the bytes return to the pool on drop.
#[derive(Debug)]
pub struct RtLease {
    pool: Arc<RtPool>,
    bytes: usize,
}

impl RtLease {
    /// Size of this lease in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for RtLease {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}
