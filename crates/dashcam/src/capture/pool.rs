//! Fixed-size buffer pool shared by the capture stage and the delivery worker
//!
//! Slots move through three owners: the free queue, the stage (in flight)
//! and the delivery worker (in delivery). The pool keeps a count of each so
//! that `free + in_flight + in_delivery == capacity` can be checked at any
//! time. The free queue is FIFO so every slot gets reused in turn.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::PoolError;
use crate::slot::{BufferSlot, SlotState};

/// Snapshot of where the pool's slots currently are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub in_flight: usize,
    pub in_delivery: usize,
}

impl PoolStats {
    /// True when every slot is accounted for.
    pub fn is_balanced(&self) -> bool {
        self.free + self.in_flight + self.in_delivery == self.capacity
    }

    /// True when every slot is back in the free queue.
    pub fn is_idle(&self) -> bool {
        self.free == self.capacity
    }
}

struct PoolInner {
    free: VecDeque<BufferSlot>,
    in_flight: usize,
    in_delivery: usize,
}

/// Pool of reusable buffer slots.
pub struct BufferPool {
    capacity: usize,
    slot_size: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Allocate `count` slots of `slot_size` bytes each.
    pub fn new(count: usize, slot_size: usize) -> Result<Self, PoolError> {
        if count == 0 || slot_size == 0 {
            return Err(PoolError::InvalidLayout {
                count,
                size: slot_size,
            });
        }

        info!(
            count,
            slot_size,
            total_kb = (count * slot_size) / 1024,
            "Creating buffer pool"
        );

        let free = (0..count).map(|i| BufferSlot::new(i, slot_size)).collect();

        Ok(Self {
            capacity: count,
            slot_size,
            inner: Mutex::new(PoolInner {
                free,
                in_flight: 0,
                in_delivery: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            capacity: self.capacity,
            free: inner.free.len(),
            in_flight: inner.in_flight,
            in_delivery: inner.in_delivery,
        }
    }

    /// Take the slot at the head of the free queue. It is counted as in
    /// flight until it is delivered or released.
    pub fn acquire(&self) -> Result<BufferSlot, PoolError> {
        let mut inner = self.lock();
        let mut slot = inner.free.pop_front().ok_or(PoolError::Exhausted {
            capacity: self.capacity,
        })?;
        slot.set_state(SlotState::InFlight);
        inner.in_flight += 1;
        Ok(slot)
    }

    /// Record that the stage handed `slot` to the delivery worker.
    pub fn mark_delivered(&self, slot: &mut BufferSlot) {
        if slot.state() != SlotState::InFlight {
            debug!(
                slot = slot.index(),
                state = ?slot.state(),
                "Delivered slot was not in flight"
            );
            return;
        }
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.in_delivery += 1;
        slot.set_state(SlotState::InDelivery);
    }

    /// Clear the slot and append it to the tail of the free queue.
    pub fn release(&self, mut slot: BufferSlot) {
        debug_assert!(slot.index() < self.capacity, "slot from another pool");
        debug_assert_eq!(slot.capacity(), self.slot_size, "slot from another pool");

        let mut inner = self.lock();
        match slot.state() {
            SlotState::InFlight => inner.in_flight = inner.in_flight.saturating_sub(1),
            SlotState::InDelivery => inner.in_delivery = inner.in_delivery.saturating_sub(1),
            SlotState::Free => {
                debug!(slot = slot.index(), "Released a slot that was already free");
            }
        }
        slot.reset();
        slot.set_state(SlotState::Free);
        inner.free.push_back(slot);
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotFlags;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn new_pool_is_idle() {
        let pool = BufferPool::new(4, 1024).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.capacity, 4);
        assert!(stats.is_idle());
        assert!(stats.is_balanced());
    }

    #[test]
    fn rejects_empty_layout() {
        assert!(BufferPool::new(0, 1024).is_err());
        assert!(BufferPool::new(4, 0).is_err());
    }

    #[test]
    fn acquire_until_exhausted() {
        let pool = BufferPool::new(2, 16).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(matches!(
            pool.acquire(),
            Err(PoolError::Exhausted { capacity: 2 })
        ));

        let stats = pool.stats();
        assert_eq!(stats.in_flight, 2);
        assert!(stats.is_balanced());

        pool.release(a);
        pool.release(b);
        assert!(pool.stats().is_idle());
    }

    #[test]
    fn release_is_fifo() {
        let pool = BufferPool::new(3, 16).unwrap();
        let first = pool.acquire().unwrap();
        assert_eq!(first.index(), 0);
        pool.release(first);

        // Slot 0 went to the tail; 1 and 2 come out before it.
        assert_eq!(pool.acquire().unwrap().index(), 1);
        assert_eq!(pool.acquire().unwrap().index(), 2);
        assert_eq!(pool.acquire().unwrap().index(), 0);
    }

    #[test]
    fn delivery_accounting() {
        let pool = BufferPool::new(3, 16).unwrap();
        let mut slot = pool.acquire().unwrap();
        pool.mark_delivered(&mut slot);

        let stats = pool.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.in_delivery, 1);
        assert_eq!(stats.free, 2);
        assert!(stats.is_balanced());

        pool.release(slot);
        assert!(pool.stats().is_idle());
    }

    #[test]
    fn release_clears_payload_and_flags() {
        let pool = BufferPool::new(1, 16).unwrap();
        let mut slot = pool.acquire().unwrap();
        slot.fill(b"jpeg");
        slot.set_flags(SlotFlags::end_of_frame());
        pool.release(slot);

        let slot = pool.acquire().unwrap();
        assert!(slot.is_empty());
        assert!(!slot.flags().is_terminal());
        assert_eq!(slot.state(), SlotState::InFlight);
    }

    #[test]
    fn stays_balanced_under_concurrent_use() {
        let pool = Arc::new(BufferPool::new(4, 64).unwrap());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    if let Ok(mut slot) = pool.acquire() {
                        assert!(pool.stats().is_balanced());
                        pool.mark_delivered(&mut slot);
                        pool.release(slot);
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert!(stats.is_balanced());
        assert!(stats.is_idle());
    }
}
