//! Message passing between interrupt handlers and threads.
//!
//! - [`ring::SpscRing`]: lock-free single-producer/single-consumer ring of
//!   32-bit words. Neither side ever blocks, so either side may run in an
//!   interrupt handler.
//! - [`queue::BoundedQueue`]: multi-producer/multi-consumer queue of
//!   fixed-size elements, gated by two counting semaphores. The `try_*`
//!   operations are interrupt-safe; the others may block.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod queue;
pub mod ring;

pub use self::{
    queue::{BoundedQueue, QueueError},
    ring::{Consumer, Producer, SpscRing},
};
