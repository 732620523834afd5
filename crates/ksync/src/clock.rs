//! Tick source for bounded waits.

use derive_more::{Add, Display, From, Sub};

/// A count of scheduler ticks.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Add, Sub)]
#[display("{_0}")]
pub struct Ticks(u64);

impl Ticks {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    #[must_use]
    pub const fn new(ticks: u64) -> Self {
        Self(ticks)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

/// Monotonic tick counter provided by the timer layer.
pub trait Clock {
    fn now(&self) -> Ticks;
}

/// Host clock counting one tick per elapsed millisecond.
#[cfg(any(test, feature = "std"))]
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    epoch: std::time::Instant,
}

#[cfg(any(test, feature = "std"))]
impl Default for HostClock {
    fn default() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl Clock for HostClock {
    fn now(&self) -> Ticks {
        Ticks(u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX))
    }
}
