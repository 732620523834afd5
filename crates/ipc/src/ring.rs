//! Lock-free single-producer/single-consumer ring buffer.
//!
//! The producer owns `tail` and the consumer owns `head`. A slot is written
//! before `tail` is published with a release store, and the consumer loads
//! `tail` with acquire ordering before reading the slot, so a reader never
//! observes a slot before its contents. The same pairing on `head` keeps the
//! producer from overwriting a slot that is still being read.
//!
//! One slot always stays empty to tell a full ring from an empty one, so a
//! ring over `N` slots holds at most `N - 1` values.
//!
//! # Usage Example
//!
//! ```rust
//! use ipc::SpscRing;
//!
//! let mut buffer = [0_u32; 4];
//! let mut ring = SpscRing::new(&mut buffer);
//! let (mut producer, mut consumer) = ring.split();
//!
//! assert!(producer.write(1));
//! assert!(producer.write(2));
//! assert_eq!(consumer.snoop(), Some(1));
//! assert_eq!(consumer.read(), Some(1));
//! assert_eq!(consumer.read(), Some(2));
//! assert_eq!(consumer.read(), None);
//! ```

use core::{
    fmt,
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

pub struct SpscRing<'a> {
    slots: NonNull<u32>,
    len: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    _buffer: PhantomData<&'a mut [u32]>,
}

// Slot accesses are ordered by the head/tail protocol; the raw methods put
// the single-producer/single-consumer obligation on the caller.
unsafe impl Send for SpscRing<'_> {}
unsafe impl Sync for SpscRing<'_> {}

impl fmt::Debug for SpscRing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpscRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<'a> SpscRing<'a> {
    /// Creates an empty ring over `buffer`.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is empty.
    #[must_use]
    pub fn new(buffer: &'a mut [u32]) -> Self {
        assert!(!buffer.is_empty(), "ring buffer needs at least one slot");
        Self {
            len: buffer.len(),
            slots: NonNull::from(buffer).cast(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            _buffer: PhantomData,
        }
    }

    fn advance(&self, index: usize) -> usize {
        if index + 1 == self.len { 0 } else { index + 1 }
    }

    /// Maximum number of values the ring holds at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.len - 1
    }

    /// Number of values currently queued.
    ///
    /// Exact only when neither side is running concurrently.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            self.len - head + tail
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.advance(self.tail.load(Ordering::Acquire)) == self.head.load(Ordering::Acquire)
    }

    /// Appends `value`, or returns `false` if the ring is full.
    ///
    /// # Safety
    ///
    /// At most one context may act as producer at any time.
    pub unsafe fn write(&self, value: u32) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = self.advance(tail);
        if next == self.head.load(Ordering::Acquire) {
            return false;
        }
        unsafe { self.slots.add(tail).write(value) };
        self.tail.store(next, Ordering::Release);
        true
    }

    /// Removes the oldest value, or returns `None` if the ring is empty.
    ///
    /// # Safety
    ///
    /// At most one context may act as consumer at any time.
    pub unsafe fn read(&self) -> Option<u32> {
        let head = self.head.load(Ordering::Relaxed);
        let value = unsafe { self.peek_at(head) }?;
        self.head.store(self.advance(head), Ordering::Release);
        Some(value)
    }

    /// Returns the oldest value without removing it.
    ///
    /// # Safety
    ///
    /// At most one context may act as consumer at any time.
    pub unsafe fn snoop(&self) -> Option<u32> {
        unsafe { self.peek_at(self.head.load(Ordering::Relaxed)) }
    }

    unsafe fn peek_at(&self, head: usize) -> Option<u32> {
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        Some(unsafe { self.slots.add(head).read() })
    }

    /// Splits the ring into its two endpoints.
    ///
    /// The endpoints borrow the ring mutably, so no other producer or
    /// consumer can exist while they are alive.
    pub fn split(&mut self) -> (Producer<'_, 'a>, Consumer<'_, 'a>) {
        (Producer { ring: self }, Consumer { ring: self })
    }
}

/// Writing endpoint of a [`SpscRing`].
#[derive(Debug)]
pub struct Producer<'r, 'a> {
    ring: &'r SpscRing<'a>,
}

impl Producer<'_, '_> {
    /// Appends `value`, or returns `false` if the ring is full.
    pub fn write(&mut self, value: u32) -> bool {
        unsafe { self.ring.write(value) }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

/// Reading endpoint of a [`SpscRing`].
#[derive(Debug)]
pub struct Consumer<'r, 'a> {
    ring: &'r SpscRing<'a>,
}

impl Consumer<'_, '_> {
    /// Removes the oldest value.
    pub fn read(&mut self) -> Option<u32> {
        unsafe { self.ring.read() }
    }

    /// Returns the oldest value without removing it.
    #[must_use]
    pub fn snoop(&self) -> Option<u32> {
        unsafe { self.ring.snoop() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
