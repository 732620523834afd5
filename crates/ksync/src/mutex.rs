//! Mutex for thread context.
//!
//! Stands in for the scheduler's sleeping mutex: contended callers would be
//! suspended on the mutex wait queue, so locking from an interrupt handler is
//! a contract violation and is rejected by
//! [`interrupt::assert_may_block`].

use core::fmt;

use crate::interrupt;

pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

pub struct Mutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> Default for Mutex<T>
where
    T: Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Mutex<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.inner.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    /// Acquires the mutex, waiting for the current holder to release it.
    ///
    /// # Panics
    ///
    /// Panics if called from interrupt context.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        interrupt::assert_may_block();
        self.inner.lock()
    }

    /// # Panics
    ///
    /// Panics if called from interrupt context.
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        interrupt::assert_may_block();
        self.inner.try_lock()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
