// src/time.rs
//! Logical time for the routing engine.
//!
//! All protocol state is expressed in [`Time`], a monotonic instant measured
//! from an arbitrary epoch. Hosts provide a [`Clock`]; tests and simulations
//! share a [`ManualClock`] they advance by hand.

use std::cell::Cell;
use std::fmt;
use std::ops::{Add, Sub};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic instant relative to the clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(Duration);

impl Time {
    pub const ZERO: Time = Time(Duration::ZERO);

    pub fn from_millis(ms: u64) -> Self {
        Time(Duration::from_millis(ms))
    }

    pub fn since_epoch(&self) -> Duration {
        self.0
    }

    /// Time left until `deadline`, zero once it has passed.
    pub fn until(&self, deadline: Time) -> Duration {
        deadline.0.saturating_sub(self.0)
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        Time(self.0.saturating_add(rhs))
    }
}

impl Sub<Time> for Time {
    type Output = Duration;

    fn sub(self, rhs: Time) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0.as_secs_f64())
    }
}

pub trait Clock {
    fn now(&self) -> Time;
}

/// Wall-clock source backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Time {
        Time(self.epoch.elapsed())
    }
}

/// Hand-driven clock. Clones share the same current time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Time>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    /// Jump to `at`. Moving backwards is ignored.
    pub fn set(&self, at: Time) {
        if at > self.now.get() {
            self.now.set(at);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let a = ManualClock::new();
        let b = a.clone();
        a.advance(Duration::from_millis(250));
        assert_eq!(b.now(), Time::from_millis(250));
        b.set(Time::from_millis(100));
        assert_eq!(a.now(), Time::from_millis(250));
    }

    #[test]
    fn until_saturates() {
        let t = Time::from_millis(500);
        assert_eq!(t.until(Time::from_millis(700)), Duration::from_millis(200));
        assert_eq!(t.until(Time::from_millis(100)), Duration::ZERO);
        assert_eq!(Time::from_millis(100) - t, Duration::ZERO);
    }
}
