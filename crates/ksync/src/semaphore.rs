//! Counting semaphores.
//!
//! [`Semaphore`] is the interface the scheduler layer provides to the rest of
//! the core. The blocking operations ([`acquire`](Semaphore::acquire),
//! [`acquire_timeout`](Semaphore::acquire_timeout)) may suspend the caller and
//! are restricted to thread context; [`try_acquire`](Semaphore::try_acquire)
//! and [`release`](Semaphore::release) never block and may be called from
//! interrupt handlers.
//!
//! [`SpinSemaphore`] implements the interface with an atomic counter and
//! busy-waiting. Waiters are not queued, so it gives no FIFO guarantee among
//! them.

use core::{
    fmt, hint,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    clock::{Clock, Ticks},
    interrupt,
};

pub trait Semaphore {
    /// Creates a semaphore holding `count` permits.
    fn new(count: usize) -> Self
    where
        Self: Sized;

    /// Takes a permit, waiting indefinitely for one to become available.
    fn acquire(&self);

    /// Takes a permit if one is available without waiting.
    fn try_acquire(&self) -> bool;

    /// Takes a permit, waiting at most `timeout` ticks.
    ///
    /// Returns `false` if the timeout expired first.
    fn acquire_timeout(&self, timeout: Ticks) -> bool;

    /// Returns a permit.
    fn release(&self);

    /// Number of permits currently available.
    fn count(&self) -> usize;
}

pub struct SpinSemaphore<C> {
    count: AtomicUsize,
    clock: C,
}

impl<C> fmt::Debug for SpinSemaphore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinSemaphore")
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<C> SpinSemaphore<C> {
    pub const fn with_clock(count: usize, clock: C) -> Self {
        Self {
            count: AtomicUsize::new(count),
            clock,
        }
    }
}

impl<C> Semaphore for SpinSemaphore<C>
where
    C: Clock + Default,
{
    fn new(count: usize) -> Self {
        Self::with_clock(count, C::default())
    }

    #[track_caller]
    fn acquire(&self) {
        interrupt::assert_may_block();
        while !self.try_acquire() {
            hint::spin_loop();
        }
    }

    fn try_acquire(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }

    #[track_caller]
    fn acquire_timeout(&self, timeout: Ticks) -> bool {
        interrupt::assert_may_block();
        if self.try_acquire() {
            return true;
        }
        let deadline = self.clock.now().saturating_add(timeout);
        loop {
            if self.try_acquire() {
                return true;
            }
            if self.clock.now() >= deadline {
                return false;
            }
            hint::spin_loop();
        }
    }

    fn release(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::clock::HostClock;

    type Sem = SpinSemaphore<HostClock>;

    #[test]
    fn test_try_acquire_respects_count() {
        let sem = Sem::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert_eq!(sem.count(), 1);
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_timeout_expires() {
        let sem = Sem::new(0);
        assert!(!sem.acquire_timeout(Ticks::new(10)));
        assert!(!sem.acquire_timeout(Ticks::ZERO));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_timeout_succeeds_when_released() {
        let sem = Sem::new(0);
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                sem.release();
            });
            assert!(sem.acquire_timeout(Ticks::new(10_000)));
        });
    }

    #[test]
    fn test_blocking_acquire_wakes_up() {
        let sem = Sem::new(0);
        thread::scope(|s| {
            let waiter = s.spawn(|| sem.acquire());
            thread::sleep(Duration::from_millis(10));
            sem.release();
            waiter.join().unwrap();
        });
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_non_blocking_ops_allowed_in_isr() {
        let sem = Sem::new(0);
        let _isr = interrupt::enter_isr();
        sem.release();
        assert!(sem.try_acquire());
    }

    #[test]
    #[should_panic(expected = "blocking operation called from interrupt context")]
    fn test_blocking_acquire_in_isr_panics() {
        let sem = Sem::new(1);
        let _isr = interrupt::enter_isr();
        sem.acquire();
    }
}
