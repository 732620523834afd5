//! Bounded multi-producer/multi-consumer queue of fixed-size elements.
//!
//! Two counting semaphores gate the queue: `free` counts empty slots and
//! bounds the senders, `filled` counts written slots and releases the
//! receivers. A sender holds a `free` permit while it copies into the slot at
//! the tail cursor, so two senders can never claim the same slot; receivers
//! mirror this with `filled` and the head cursor.
//!
//! The cursors are advanced inside a [`SpinMutex`] critical section, which is
//! what keeps the copy and the cursor update atomic with respect to other
//! senders (or receivers) preempting the current one.
//!
//! The blocking operations suspend on a semaphore and must be called from
//! thread context. [`BoundedQueue::try_send`] and
//! [`BoundedQueue::try_receive`] never block and may be called from
//! interrupt handlers.

use core::{fmt, marker::PhantomData, ptr::NonNull};

use fault::Location;
use ksync::{Semaphore, SpinMutex, Ticks};
use snafu::{Snafu, ensure};

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("element size {size} is not a non-zero multiple of 4"))]
    InvalidElementSize {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("queue needs at least one slot"))]
    NoSlots {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("buffer of {len} bytes cannot hold {count} elements of {size} bytes"))]
    BufferTooSmall {
        len: usize,
        count: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("element of {len} bytes passed to a queue of {size}-byte elements"))]
    ElementSizeMismatch {
        len: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

pub struct BoundedQueue<'a, S> {
    slots: NonNull<u8>,
    elem_size: usize,
    elem_count: usize,
    head: SpinMutex<usize>,
    tail: SpinMutex<usize>,
    free: S,
    filled: S,
    _buffer: PhantomData<&'a mut [u8]>,
}

// Each slot is touched only by the holder of its semaphore permit, inside the
// matching cursor lock.
unsafe impl<S> Send for BoundedQueue<'_, S> where S: Send {}
unsafe impl<S> Sync for BoundedQueue<'_, S> where S: Sync {}

impl<S> fmt::Debug for BoundedQueue<'_, S>
where
    S: Semaphore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("elem_size", &self.elem_size)
            .field("elem_count", &self.elem_count)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<'a, S> BoundedQueue<'a, S>
where
    S: Semaphore,
{
    /// Creates an empty queue of `elem_count` slots of `elem_size` bytes
    /// each, stored in `buffer`.
    pub fn new(
        buffer: &'a mut [u8],
        elem_size: usize,
        elem_count: usize,
    ) -> Result<Self, QueueError> {
        ensure!(
            elem_size > 0 && elem_size % 4 == 0,
            InvalidElementSizeSnafu { size: elem_size }
        );
        ensure!(elem_count > 0, NoSlotsSnafu);
        ensure!(
            elem_size
                .checked_mul(elem_count)
                .is_some_and(|needed| needed <= buffer.len()),
            BufferTooSmallSnafu {
                len: buffer.len(),
                count: elem_count,
                size: elem_size,
            }
        );
        Ok(Self {
            slots: NonNull::from(buffer).cast(),
            elem_size,
            elem_count,
            head: SpinMutex::new(0),
            tail: SpinMutex::new(0),
            free: S::new(elem_count),
            filled: S::new(0),
            _buffer: PhantomData,
        })
    }

    #[must_use]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.elem_count
    }

    /// Number of slots holding an element that no receiver has claimed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filled.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots no sender has claimed.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.free.count()
    }

    /// Sends `data`, waiting for a free slot as long as necessary.
    #[track_caller]
    pub fn send(&self, data: &[u8]) {
        self.check_len(data.len());
        self.free.acquire();
        self.push(data);
    }

    /// Sends `data` if a slot is free right now.
    ///
    /// Interrupt-safe.
    #[track_caller]
    pub fn try_send(&self, data: &[u8]) -> bool {
        self.check_len(data.len());
        if !self.free.try_acquire() {
            return false;
        }
        self.push(data);
        true
    }

    /// Sends `data`, waiting at most `timeout` ticks for a free slot.
    #[track_caller]
    pub fn send_timeout(&self, data: &[u8], timeout: Ticks) -> bool {
        self.check_len(data.len());
        if !self.free.acquire_timeout(timeout) {
            log::trace!("queue send timed out after {timeout} ticks");
            return false;
        }
        self.push(data);
        true
    }

    /// Receives the oldest element into `out`, waiting as long as necessary.
    #[track_caller]
    pub fn receive(&self, out: &mut [u8]) {
        self.check_len(out.len());
        self.filled.acquire();
        self.pop(out);
    }

    /// Receives the oldest element into `out` if one is queued right now.
    ///
    /// Interrupt-safe.
    #[track_caller]
    pub fn try_receive(&self, out: &mut [u8]) -> bool {
        self.check_len(out.len());
        if !self.filled.try_acquire() {
            return false;
        }
        self.pop(out);
        true
    }

    /// Receives the oldest element into `out`, waiting at most `timeout`
    /// ticks for one to arrive.
    #[track_caller]
    pub fn receive_timeout(&self, out: &mut [u8], timeout: Ticks) -> bool {
        self.check_len(out.len());
        if !self.filled.acquire_timeout(timeout) {
            log::trace!("queue receive timed out after {timeout} ticks");
            return false;
        }
        self.pop(out);
        true
    }

    #[track_caller]
    fn check_len(&self, len: usize) {
        if len != self.elem_size {
            fault::fatal(
                ElementSizeMismatchSnafu {
                    len,
                    size: self.elem_size,
                }
                .build(),
            );
        }
    }

    fn slot(&self, index: usize) -> NonNull<u8> {
        unsafe { self.slots.add(index * self.elem_size) }
    }

    fn advance(&self, index: usize) -> usize {
        if index + 1 == self.elem_count { 0 } else { index + 1 }
    }

    /// Fills the tail slot; the caller holds a `free` permit.
    fn push(&self, data: &[u8]) {
        {
            let mut tail = self.tail.lock();
            unsafe {
                self.slot(*tail)
                    .copy_from_nonoverlapping(NonNull::from(data).cast(), self.elem_size);
            }
            *tail = self.advance(*tail);
        }
        self.filled.release();
    }

    /// Drains the head slot; the caller holds a `filled` permit.
    fn pop(&self, out: &mut [u8]) {
        {
            let mut head = self.head.lock();
            unsafe {
                NonNull::from(out)
                    .cast::<u8>()
                    .copy_from_nonoverlapping(self.slot(*head), self.elem_size);
            }
            *head = self.advance(*head);
        }
        self.free.release();
    }
}
