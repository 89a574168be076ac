//! Reusable byte buffers with usage counters.
//!
//! Every buffer handed out by [`BufferPool::rent`] goes back to the pool
//! when its [`PooledBuffer`] is dropped, so `outstanding` drops to zero once
//! all received and queued data has been consumed.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use serde::Serialize;

/// Idle buffers kept for reuse; extra returns are freed.
const MAX_RETAINED: usize = 64;

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Buffers currently rented and not yet returned.
    pub outstanding: usize,
    /// Total rentals since the pool was created.
    pub rented: u64,
    /// Total returns since the pool was created.
    pub returned: u64,
}

#[derive(Debug, Default)]
struct PoolInner {
    idle: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
    rented: AtomicU64,
    returned: AtomicU64,
}

/// A shared pool of byte buffers.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rent a zero-filled buffer of exactly `len` bytes.
    pub fn rent(&self, len: usize) -> PooledBuffer {
        let mut buf = self.take_idle();
        buf.resize(len, 0);
        self.lease(buf)
    }

    /// Rent an empty buffer with room for at least `capacity` bytes.
    pub fn rent_empty(&self, capacity: usize) -> PooledBuffer {
        let mut buf = self.take_idle();
        buf.reserve(capacity);
        self.lease(buf)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
            rented: self.inner.rented.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
        }
    }

    fn take_idle(&self) -> BytesMut {
        let mut idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        idle.pop().unwrap_or_default()
    }

    fn lease(&self, buf: BytesMut) -> PooledBuffer {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        self.inner.rented.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        {
            let mut idle = self.pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < MAX_RETAINED {
                idle.push(buf);
            }
        }
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.pool.returned.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_and_return_updates_counters() {
        let pool = BufferPool::new();
        let a = pool.rent(16);
        let b = pool.rent_empty(8);
        assert_eq!(a.len(), 16);
        assert!(b.is_empty());
        assert_eq!(pool.stats().outstanding, 2);

        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.rented, 2);
        assert_eq!(stats.returned, 2);
    }

    #[test]
    fn reused_buffer_is_zeroed() {
        let pool = BufferPool::new();
        let mut first = pool.rent(4);
        first.copy_from_slice(b"dirt");
        drop(first);

        let second = pool.rent(4);
        assert_eq!(second.as_ref(), &[0, 0, 0, 0]);
    }
}
