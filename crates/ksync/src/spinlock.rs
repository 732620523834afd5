//! Interrupt-masking spin lock.
//!
//! Holding a [`SpinMutex`] keeps interrupts masked, so a critical section
//! protected by it cannot be preempted by an interrupt handler on the same
//! core. This makes it the lock of choice for state shared between threads
//! and interrupt handlers; the critical sections must stay short and must
//! never block.

use core::{
    fmt,
    ops::{Deref, DerefMut},
};

use crate::interrupt::{self, Guard};

#[derive(Default)]
pub struct SpinMutex<T> {
    inner: spin::mutex::SpinMutex<T>,
}

impl<T> fmt::Debug for SpinMutex<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SpinMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

impl<T> SpinMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::mutex::SpinMutex::new(data),
        }
    }

    /// Masks interrupts, then spins until the lock is free.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let interrupts = interrupt::disable();
        SpinMutexGuard {
            data: self.inner.lock(),
            _interrupts: interrupts,
        }
    }

    /// Takes the lock only if it is free; interrupts stay as they were
    /// otherwise.
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        let interrupts = interrupt::disable();
        let data = self.inner.try_lock()?;
        Some(SpinMutexGuard {
            data,
            _interrupts: interrupts,
        })
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Releases the lock before unmasking interrupts.
pub struct SpinMutexGuard<'a, T> {
    // Field order is drop order.
    data: spin::mutex::SpinMutexGuard<'a, T>,
    _interrupts: Guard,
}

unsafe impl<T> Sync for SpinMutexGuard<'_, T> where T: Sync {}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl<T> SpinMutexGuard<'_, T> {
    pub fn unlock(self) {
        drop(self);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{hint, thread};

    use super::*;

    #[test]
    fn test_lock_masks_interrupts() {
        let mutex = SpinMutex::new(0_u32);
        {
            let mut guard = mutex.lock();
            assert!(!interrupt::is_enabled());
            *guard += 1;
        }
        assert!(interrupt::is_enabled());
        assert_eq!(mutex.into_inner(), 1);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let mutex = SpinMutex::new(());
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        guard.unlock();
        assert!(mutex.try_lock().is_some());
        assert!(interrupt::is_enabled());
    }

    #[test]
    fn test_usable_from_isr() {
        let mutex = SpinMutex::new(1_u32);
        let _isr = interrupt::enter_isr();
        *mutex.lock() *= 3;
        assert_eq!(*mutex.lock(), 3);
    }

    #[test]
    fn test_exclusion_between_threads() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 1000;

        let mutex = SpinMutex::new(0_usize);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let mut guard = mutex.lock();
                        let value = *guard;
                        hint::spin_loop();
                        *guard = value + 1;
                    }
                });
            }
        });
        assert_eq!(mutex.into_inner(), THREADS * ROUNDS);
    }
}
