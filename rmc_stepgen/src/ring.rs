//! SPSC ring of step segments.
//!
//! Ownership protocol: the producer owns `put` and only ever writes
//! the slot at `put` before advancing it; the consumer owns `get` and
//! `size`. A producer publish does not touch `size` directly — it
//! bumps `pending`, and the consumer folds `pending` into `size` at
//! its next tick. This is the one-sided handoff that keeps each
//! counter single-writer.

use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::{MAX_RING_DEPTH, MAX_STEP_AXES};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring full (capacity {capacity})")]
    BufferFull { capacity: usize },
    #[error("ring capacity {0} out of range 1..={MAX_RING_DEPTH}")]
    BadCapacity(usize),
}

/// Per-axis share of one step segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct StepSlot {
    /// Absolute commanded position [steps] at the end of the segment.
    pub cmd_position: i64,
    /// DDS phase increment per FIQ tick.
    pub adder: u32,
    /// Step direction; set = negative.
    pub direction: bool,
    /// Mirrored scanner-sync input (axis 0 only).
    pub scan_sync: bool,
    pub _pad: [u8; 2],
}

/// One servo period worth of step commands, all axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct StepSegment {
    pub axes: [StepSlot; MAX_STEP_AXES],
}

const_assert_eq!(core::mem::size_of::<StepSlot>(), 16);
const_assert_eq!(
    core::mem::size_of::<StepSegment>(),
    16 * MAX_STEP_AXES
);

struct Shared {
    slots: [UnsafeCell<StepSegment>; MAX_RING_DEPTH],
    capacity: usize,
    /// Producer slot index.
    put: AtomicUsize,
    /// Consumer head index.
    get: AtomicUsize,
    /// Occupied count; consumer-owned.
    size: AtomicUsize,
    /// Published-but-uncounted segments; producer bumps, consumer
    /// folds into `size`.
    pending: AtomicUsize,
}

// Slot contents are only written by the producer while the slot is
// outside the occupied window, and only read by the consumer once
// inside it; the pending/size handoff publishes the write.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

/// Construct a ring with the given capacity.
pub struct StepRing;

impl StepRing {
    pub fn with_capacity(capacity: usize) -> Result<(RingProducer, RingConsumer), RingError> {
        if capacity == 0 || capacity > MAX_RING_DEPTH {
            return Err(RingError::BadCapacity(capacity));
        }
        let shared = Arc::new(Shared {
            slots: core::array::from_fn(|_| UnsafeCell::new(StepSegment::default())),
            capacity,
            put: AtomicUsize::new(0),
            get: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
        });
        Ok((
            RingProducer {
                shared: Arc::clone(&shared),
            },
            RingConsumer { shared },
        ))
    }
}

/// Servo-side handle.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Publish one segment. Fails when the ring is full, leaving every
    /// occupied slot untouched.
    pub fn publish(&mut self, segment: &StepSegment) -> Result<(), RingError> {
        let shared = &*self.shared;
        if self.occupied() >= shared.capacity {
            return Err(RingError::BufferFull {
                capacity: shared.capacity,
            });
        }
        let put = shared.put.load(Ordering::Relaxed);
        unsafe {
            *shared.slots[put].get() = *segment;
        }
        fence(Ordering::Release);
        shared
            .put
            .store((put + 1) % shared.capacity, Ordering::Release);
        // The update flag: consumer counts this segment in at its next
        // tick.
        shared.pending.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Segments currently in flight (counted + published-uncounted).
    pub fn occupied(&self) -> usize {
        self.shared.size.load(Ordering::Acquire) + self.shared.pending.load(Ordering::Acquire)
    }

    /// Free slots available to the producer right now.
    pub fn free(&self) -> usize {
        self.shared.capacity - self.occupied()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// FIQ-side handle.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Fold producer-published segments into the occupied count.
    /// Call once at handler entry.
    pub fn absorb_updates(&mut self) {
        let pending = self.shared.pending.swap(0, Ordering::AcqRel);
        if pending != 0 {
            self.shared.size.fetch_add(pending, Ordering::Release);
        }
    }

    /// The head segment, if any.
    pub fn peek(&self) -> Option<StepSegment> {
        if self.shared.size.load(Ordering::Acquire) == 0 {
            return None;
        }
        let get = self.shared.get.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        Some(unsafe { *self.shared.slots[get].get() })
    }

    /// Consume the head segment. No-op on an empty ring.
    pub fn advance(&mut self) {
        if self.shared.size.load(Ordering::Acquire) == 0 {
            return;
        }
        let get = self.shared.get.load(Ordering::Relaxed);
        self.shared
            .get
            .store((get + 1) % self.shared.capacity, Ordering::Relaxed);
        self.shared.size.fetch_sub(1, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.shared.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(pos: i64) -> StepSegment {
        let mut s = StepSegment::default();
        s.axes[0].cmd_position = pos;
        s
    }

    #[test]
    fn capacity_bounds() {
        assert!(StepRing::with_capacity(0).is_err());
        assert!(StepRing::with_capacity(MAX_RING_DEPTH + 1).is_err());
        assert!(StepRing::with_capacity(1).is_ok());
        assert!(StepRing::with_capacity(MAX_RING_DEPTH).is_ok());
    }

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = StepRing::with_capacity(4).unwrap();
        tx.publish(&seg(1)).unwrap();
        tx.publish(&seg(2)).unwrap();
        rx.absorb_updates();
        assert_eq!(rx.peek().unwrap().axes[0].cmd_position, 1);
        rx.advance();
        assert_eq!(rx.peek().unwrap().axes[0].cmd_position, 2);
        rx.advance();
        assert!(rx.peek().is_none());
    }

    #[test]
    fn full_ring_rejects_without_corruption() {
        let (mut tx, mut rx) = StepRing::with_capacity(2).unwrap();
        tx.publish(&seg(1)).unwrap();
        tx.publish(&seg(2)).unwrap();
        assert_eq!(
            tx.publish(&seg(3)).unwrap_err(),
            RingError::BufferFull { capacity: 2 }
        );
        rx.absorb_updates();
        assert_eq!(rx.peek().unwrap().axes[0].cmd_position, 1);
        rx.advance();
        assert_eq!(rx.peek().unwrap().axes[0].cmd_position, 2);
    }

    #[test]
    fn consumer_counts_only_after_absorb() {
        let (mut tx, mut rx) = StepRing::with_capacity(4).unwrap();
        tx.publish(&seg(1)).unwrap();
        assert_eq!(rx.len(), 0);
        assert!(rx.peek().is_none());
        rx.absorb_updates();
        assert_eq!(rx.len(), 1);
        // Producer sees in-flight segments either way.
        assert_eq!(tx.occupied(), 1);
    }

    #[test]
    fn wraparound() {
        let (mut tx, mut rx) = StepRing::with_capacity(2).unwrap();
        for round in 0..10i64 {
            tx.publish(&seg(round)).unwrap();
            rx.absorb_updates();
            assert_eq!(rx.peek().unwrap().axes[0].cmd_position, round);
            rx.advance();
        }
    }

    #[test]
    fn size_invariant_under_interleaving() {
        let (mut tx, mut rx) = StepRing::with_capacity(8).unwrap();
        let mut modeled = 0usize;
        for i in 0..1000i64 {
            if i % 3 != 0 && tx.publish(&seg(i)).is_ok() {
                modeled += 1;
            }
            if i % 2 == 0 {
                rx.absorb_updates();
                if rx.len() > 0 {
                    rx.advance();
                    modeled -= 1;
                }
            }
            assert!(tx.occupied() <= 8);
            assert_eq!(tx.occupied(), modeled);
        }
    }
}
