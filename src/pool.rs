//! Pooled payload buffers.
//!
//! Every packet that needs scratch memory — inline copies and the
//! file-segment read buffer — draws a fixed-size buffer from a
//! process-wide pool. The pool pre-allocates [`BUFFER_PACKET_POOL`]
//! buffers on first use and hands them out through a free list, so
//! steady-state writes never touch the allocator.
//!
//! When the pool runs dry, [`Pool::grab`] first drives a global
//! [`flush_all`](crate::flush::flush_all) pass — draining queues releases
//! buffers, which is backpressure without allocation — and only then
//! spills to a fresh heap buffer. Spilled buffers are returned to the
//! allocator on release, not to the free list, so the pool's resident
//! memory stays bounded.

use spin::Mutex;

use crate::config::{BUFFER_PACKET_POOL, BUFFER_PACKET_SIZE};
use crate::metrics;

pub(crate) struct Pool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    free: Vec<Box<[u8]>>,
    primed: bool,
}

/// A payload buffer on loan from a [`Pool`] (or spilled from the heap).
///
/// Dropping the handle releases the buffer: back to the owning pool's
/// free list, or to the allocator for spilled buffers.
impl std::fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuf")
            .field("len", &self.buf.as_ref().map(|b| b.len()))
            .finish()
    }
}

pub(crate) struct PoolBuf {
    buf: Option<Box<[u8]>>,
    origin: Option<&'static Pool>,
}

impl Pool {
    pub(crate) const fn new(capacity: usize) -> Pool {
        Pool {
            capacity,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                primed: false,
            }),
        }
    }

    /// Pop a pooled buffer, or `None` when the free list is empty.
    ///
    /// The first call links the entire pre-allocated array into the free
    /// list.
    pub(crate) fn grab_try(&'static self) -> Option<PoolBuf> {
        let buf = {
            let mut inner = self.inner.lock();
            if !inner.primed {
                inner.primed = true;
                inner.free = (0..self.capacity)
                    .map(|_| vec![0u8; BUFFER_PACKET_SIZE].into_boxed_slice())
                    .collect();
            }
            inner.free.pop()
        };
        buf.map(|buf| PoolBuf {
            buf: Some(buf),
            origin: Some(self),
        })
    }

    /// Grab a buffer; never fails.
    ///
    /// An empty pool triggers one `flush_all` pass (queues draining
    /// release buffers) before spilling to the general allocator.
    pub(crate) fn grab(&'static self) -> PoolBuf {
        if let Some(buf) = self.grab_try() {
            return buf;
        }
        crate::flush::flush_all();
        if let Some(buf) = self.grab_try() {
            return buf;
        }
        metrics::PACKETS_SPILLED.increment();
        PoolBuf {
            buf: Some(vec![0u8; BUFFER_PACKET_SIZE].into_boxed_slice()),
            origin: None,
        }
    }

    fn release(&self, buf: Box<[u8]>) {
        // Only buffers handed out by grab_try carry an origin, so the
        // free list can never exceed the primed capacity.
        self.inner.lock().free.push(buf);
    }

    /// Buffers currently on the free list.
    pub(crate) fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

impl PoolBuf {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..],
            None => &[],
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => &mut buf[..],
            None => &mut [],
        }
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.buf.take(), self.origin) {
            pool.release(buf);
        }
        // Spilled buffers fall back to the allocator here.
    }
}

static POOL: Pool = Pool::new(BUFFER_PACKET_POOL);

/// Grab a payload buffer from the process-wide pool.
pub(crate) fn grab() -> PoolBuf {
    POOL.grab()
}

/// Free-list length of the process-wide pool (leak checks in tests).
#[allow(dead_code)]
pub(crate) fn free_count() -> usize {
    POOL.free_count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn leaked(capacity: usize) -> &'static Pool {
        Box::leak(Box::new(Pool::new(capacity)))
    }

    #[test]
    fn lazy_priming_and_release() {
        let pool = leaked(4);
        let a = pool.grab_try().unwrap();
        assert_eq!(pool.free_count(), 3);
        assert_eq!(a.as_slice().len(), BUFFER_PACKET_SIZE);
        drop(a);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhaustion_spills_to_heap() {
        let pool = leaked(2);
        let a = pool.grab();
        let b = pool.grab();
        assert_eq!(pool.free_count(), 0);

        // Nothing queued anywhere, so flush_all cannot help — grab must
        // spill rather than block.
        let c = pool.grab();
        assert_eq!(c.as_slice().len(), BUFFER_PACKET_SIZE);
        drop(c);
        // Spilled buffer went back to the allocator, not the free list.
        assert_eq!(pool.free_count(), 0);

        drop(a);
        drop(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn parallel_grab_release_keeps_free_list_consistent() {
        let pool = leaked(4);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || {
                    for round in 0..200 {
                        let mut buf = pool.grab();
                        // Scribble a thread-unique pattern; a buffer
                        // shared between two owners would tear it.
                        let tag = (i * 251 + round) as u8;
                        buf.as_mut_slice()[..64].fill(tag);
                        assert!(buf.as_slice()[..64].iter().all(|&b| b == tag));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // Every loan was returned; pooled buffers all back on the list.
        assert_eq!(pool.free_count(), 4);
    }
}
