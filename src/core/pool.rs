//! Byte buffer pool with RAII checkout

use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A free list of equally sized buffers
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buf_size: usize,
    /// Buffers beyond this many are dropped on return
    max_free: usize,
}

impl BufferPool {
    pub fn new(count: usize, buf_size: usize) -> Arc<Self> {
        let free = (0..count).map(|_| BytesMut::with_capacity(buf_size)).collect();
        Arc::new(Self {
            free: Mutex::new(free),
            buf_size,
            max_free: count,
        })
    }

    /// Check out a buffer, allocating a fresh one if the pool is momentarily empty
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buf_size));
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut buf: BytesMut) {
        buf.clear();
        // Frames split off by consumers shrink the buffer; reclaim or regrow it
        buf.reserve(self.buf_size);
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// A buffer on loan from a `BufferPool`, returned when dropped
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
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
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_and_return() {
        let pool = BufferPool::new(2, 64);
        {
            let mut a = pool.get();
            a.extend_from_slice(b"abc");
            let _b = pool.get();
            assert_eq!(pool.available(), 0);

            // Exhausted pool falls back to allocation
            let c = pool.get();
            assert!(c.capacity() >= 64);
        }
        assert_eq!(pool.available(), 2);
        assert!(pool.get().is_empty());
    }
}
