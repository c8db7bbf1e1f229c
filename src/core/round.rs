//! Rotating pool of read buffers, write buffers and timer shards
//!
//! Each accepted connection takes the next index and uses
//! `index % len` of each array, which bounds the number of lock domains
//! concurrent connections touch without one pool or timer per connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::CometConfig;
use crate::core::pool::BufferPool;
use crate::core::timer::Timer;

pub struct Round {
    readers: Vec<Arc<BufferPool>>,
    writers: Vec<Arc<BufferPool>>,
    timers: Vec<Arc<Timer>>,
    counter: AtomicUsize,
}

impl Round {
    /// Build all pools and spawn the timer shards on the current runtime
    pub fn new(config: &CometConfig) -> Self {
        let readers = (0..config.reader_pools.max(1))
            .map(|_| BufferPool::new(config.read_buf, config.read_buf_size))
            .collect();
        let writers = (0..config.writer_pools.max(1))
            .map(|_| BufferPool::new(config.write_buf, config.write_buf_size))
            .collect();
        let timers = (0..config.timer_shards.max(1))
            .map(|_| Arc::new(Timer::new(config.timer_size)))
            .collect();

        Self {
            readers,
            writers,
            timers,
            counter: AtomicUsize::new(0),
        }
    }

    /// Rotating index for the next accepted connection
    pub fn next_index(&self) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn reader(&self, index: usize) -> &Arc<BufferPool> {
        &self.readers[index % self.readers.len()]
    }

    pub fn writer(&self, index: usize) -> &Arc<BufferPool> {
        &self.writers[index % self.writers.len()]
    }

    pub fn timer(&self, index: usize) -> &Arc<Timer> {
        &self.timers[index % self.timers.len()]
    }
}
