//! Low-level synchronization for a single-core preemptive kernel.
//!
//! - [`interrupt`]: nested interrupt masking and the interrupt-context
//!   marker used to reject blocking calls from interrupt handlers.
//! - [`spinlock::SpinMutex`]: interrupt-masking lock, usable from interrupt
//!   handlers.
//! - [`mutex::Mutex`]: lock for thread context only.
//! - [`semaphore`]: the counting-semaphore interface the scheduler layer
//!   provides, and a spinning implementation.
//! - [`clock`]: tick source for bounded waits.
//!
//! The interrupt backend is selected at build time: the `std` feature
//! emulates interrupt state per host thread and `riscv64` targets drive
//! `sstatus.SIE`. Other targets keep the interrupt-context marker, so
//! [`Mutex`] and the heap built on it work, but panic as soon as interrupts
//! would be masked.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod clock;
pub mod interrupt;
pub mod mutex;
pub mod semaphore;
pub mod spinlock;

pub use self::{
    clock::{Clock, Ticks},
    mutex::{Mutex, MutexGuard},
    semaphore::{Semaphore, SpinSemaphore},
    spinlock::{SpinMutex, SpinMutexGuard},
};
