//! Fixed-capacity circular buffer of `Proto` slots
//!
//! The ring is a bounded single-producer/single-consumer queue. It has no
//! internal locking: the reader loop is the only producer and the dispatch
//! loop the only consumer. Slots are reused in place, so a consumer must move
//! out anything it keeps past `commit_read`.

use crate::core::proto::Proto;

pub struct Ring {
    /// Read cursor
    rp: u64,
    /// Write cursor
    wp: u64,
    num: u64,
    mask: u64,
    data: Vec<Proto>,
}

impl Ring {
    /// Create a ring whose capacity is `num` rounded up to a power of two
    pub fn new(num: usize) -> Self {
        let num = num.max(1).next_power_of_two() as u64;
        Self {
            rp: 0,
            wp: 0,
            num,
            mask: num - 1,
            data: vec![Proto::default(); num as usize],
        }
    }

    pub fn capacity(&self) -> usize {
        self.num as usize
    }

    /// Number of written slots not yet consumed
    pub fn len(&self) -> usize {
        (self.wp - self.rp) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    pub fn is_full(&self) -> bool {
        self.wp - self.rp >= self.num
    }

    /// Slot for the next write, or `None` when every slot is outstanding
    pub fn try_reserve_write(&mut self) -> Option<&mut Proto> {
        if self.is_full() {
            return None;
        }
        let idx = (self.wp & self.mask) as usize;
        Some(&mut self.data[idx])
    }

    pub fn commit_write(&mut self) {
        self.wp += 1;
    }

    /// Oldest committed slot, or `None` when there is nothing to read
    pub fn try_reserve_read(&mut self) -> Option<&mut Proto> {
        if self.is_empty() {
            return None;
        }
        let idx = (self.rp & self.mask) as usize;
        Some(&mut self.data[idx])
    }

    pub fn commit_read(&mut self) {
        self.rp += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(ring: &mut Ring, seq: i32) -> bool {
        match ring.try_reserve_write() {
            Some(slot) => {
                slot.seq = seq;
                ring.commit_write();
                true
            }
            None => false,
        }
    }

    fn read(ring: &mut Ring) -> Option<i32> {
        let seq = ring.try_reserve_read()?.seq;
        ring.commit_read();
        Some(seq)
    }

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(Ring::new(3).capacity(), 4);
        assert_eq!(Ring::new(4).capacity(), 4);
        assert_eq!(Ring::new(5).capacity(), 8);
        assert_eq!(Ring::new(0).capacity(), 1);
    }

    #[test]
    fn test_fill_and_drain_twice() {
        let mut ring = Ring::new(3);
        for _ in 0..2 {
            for seq in 10..14 {
                assert!(write(&mut ring, seq));
            }
            assert!(!write(&mut ring, 99));
            assert!(ring.is_full());

            for seq in 10..14 {
                assert_eq!(read(&mut ring), Some(seq));
            }
            assert_eq!(read(&mut ring), None);
        }
    }

    #[test]
    fn test_reserve_without_commit_is_not_visible() {
        let mut ring = Ring::new(2);
        ring.try_reserve_write().unwrap().seq = 1;
        assert!(ring.try_reserve_read().is_none());
        ring.commit_write();
        assert_eq!(read(&mut ring), Some(1));
    }
}
