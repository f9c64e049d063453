//! Bounded multi-producer / single-consumer event ring
//!
//! Each slot carries a sequence number that encodes whose turn it is:
//!
//! - `seq == pos`: free, a producer claiming position `pos` may write it
//! - `seq == pos + 1`: written, the consumer at position `pos` may read it
//! - after reading, the consumer sets `seq = pos + capacity`, freeing the slot
//!   for the producer one lap later
//!
//! Producers claim positions with a CAS on `tail`, write the value, then
//! publish it with a `Release` store of the sequence. The consumer `Acquire`s
//! the sequence before reading, and `Release`s the freed sequence after.
//! Producers never wait on one another: a push either lands within a bounded
//! number of attempts or is dropped and counted.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// Claim attempts before a contended push gives up and drops its event
pub const MAX_PUSH_ATTEMPTS: usize = 32;

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Ring<T> {
    slots: Box<[Slot<T>]>,
    capacity: usize,
    /// Next position producers claim
    tail: CachePadded<AtomicUsize>,
    /// Next position the consumer reads
    head: CachePadded<AtomicUsize>,
    dropped: AtomicU64,
}

// SAFETY: slot access is serialized by the sequence protocol above.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event queue capacity must be positive");
        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            capacity,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, value: T) -> bool {
        let mut pos = self.tail.load(Ordering::Relaxed);
        for _ in 0..MAX_PUSH_ATTEMPTS {
            let slot = &self.slots[pos % self.capacity];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS made this producer the sole owner of
                        // the slot until the sequence store below.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                // Slot still holds an unread event from the previous lap
                break;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// # Safety
    ///
    /// Must only be called by the single consumer.
    unsafe fn pop(&self) -> Option<T> {
        let pos = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[pos % self.capacity];
        let seq = slot.sequence.load(Ordering::Acquire);
        if seq != pos.wrapping_add(1) {
            return None;
        }
        let value = (*slot.value.get()).assume_init_read();
        slot.sequence
            .store(pos.wrapping_add(self.capacity), Ordering::Release);
        self.head.store(pos.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head).min(self.capacity)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no producer or consumer is left.
        while unsafe { self.pop() }.is_some() {}
    }
}

/// Producer side of an event queue; clone one per producing thread
pub struct EventSender<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: Send> EventSender<T> {
    /// Enqueue an event without blocking
    ///
    /// Returns `false` and counts a drop when the queue is full. A push that
    /// loses the claim race [`MAX_PUSH_ATTEMPTS`] times in a row is dropped
    /// the same way, even if slots are free; under that much contention the
    /// queue is effectively full.
    #[inline]
    pub fn push(&self, event: T) -> bool {
        self.ring.push(event)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side of an event queue; there is exactly one
pub struct EventReceiver<T> {
    ring: Arc<Ring<T>>,
}

impl<T: Send> EventReceiver<T> {
    /// Take the oldest event, if any
    pub fn pop_one(&mut self) -> Option<T> {
        // SAFETY: `&mut self` on the unique receiver makes this the only consumer.
        unsafe { self.ring.pop() }
    }

    /// Drain up to `max_count` events
    pub fn pop(&mut self, max_count: usize) -> Vec<T> {
        let mut events = Vec::with_capacity(max_count.min(self.ring.len()));
        self.pop_into(&mut events, max_count);
        events
    }

    /// Drain up to `max_count` events into `out`, returning how many were added
    pub fn pop_into(&mut self, out: &mut Vec<T>, max_count: usize) -> usize {
        let mut taken = 0;
        while taken < max_count {
            let Some(event) = self.pop_one() else {
                break;
            };
            out.push(event);
            taken += 1;
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

/// Create a bounded MPSC event queue holding at most `capacity` events
pub fn event_queue<T: Send>(capacity: usize) -> (EventSender<T>, EventReceiver<T>) {
    let ring = Arc::new(Ring::new(capacity));
    (
        EventSender {
            ring: Arc::clone(&ring),
        },
        EventReceiver { ring },
    )
}
