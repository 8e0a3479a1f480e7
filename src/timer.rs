// src/timer.rs
//! Cancellable one-shot timers keyed by what they are for.
//!
//! A key has at most one pending deadline. Re-arming replaces the previous
//! deadline and bumps the generation, so a handle taken before the re-arm no
//! longer matches and cancelling through it is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use crate::time::Time;

/// Identifies one arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub fire_at: Time,
    pub generation: u64,
}

#[derive(Debug)]
pub struct Timers<K> {
    queue: BTreeMap<(Time, u64), K>,
    armed: HashMap<K, TimerHandle>,
    next_generation: u64,
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Timers {
            queue: BTreeMap::new(),
            armed: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<K: Clone + Eq + Hash> Timers<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` to fire at `at`, replacing any pending deadline.
    pub fn arm(&mut self, key: K, at: Time) -> TimerHandle {
        self.cancel(&key);
        self.next_generation += 1;
        let handle = TimerHandle {
            fire_at: at,
            generation: self.next_generation,
        };
        self.queue.insert((at, handle.generation), key.clone());
        self.armed.insert(key, handle);
        handle
    }

    /// Cancel the pending deadline of `key`. Returns false if none was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.armed.remove(key) {
            Some(h) => {
                self.queue.remove(&(h.fire_at, h.generation));
                true
            }
            None => false,
        }
    }

    /// Cancel only if `handle` is still the current arming of `key`.
    pub fn cancel_handle(&mut self, key: &K, handle: TimerHandle) -> bool {
        if self.armed.get(key) == Some(&handle) {
            self.cancel(key)
        } else {
            false
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Time> {
        self.armed.get(key).map(|h| h.fire_at)
    }

    /// Time left before `key` fires; zero when not armed or overdue.
    pub fn remaining(&self, key: &K, now: Time) -> Duration {
        self.deadline(key).map(|at| now.until(at)).unwrap_or(Duration::ZERO)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Time> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest timer due at or before `now`.
    pub fn pop_due(&mut self, now: Time) -> Option<K> {
        let (&(at, generation), _) = self.queue.iter().next()?;
        if at > now {
            return None;
        }
        let key = self.queue.remove(&(at, generation))?;
        self.armed.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut t = Timers::new();
        t.arm("b", Time::from_millis(20));
        t.arm("a", Time::from_millis(10));
        assert_eq!(t.next_deadline(), Some(Time::from_millis(10)));
        assert_eq!(t.pop_due(Time::from_millis(5)), None);
        assert_eq!(t.pop_due(Time::from_millis(25)), Some("a"));
        assert_eq!(t.pop_due(Time::from_millis(25)), Some("b"));
        assert!(t.is_empty());
    }

    #[test]
    fn rearm_replaces_previous_deadline() {
        let mut t = Timers::new();
        let first = t.arm(1u8, Time::from_millis(10));
        let second = t.arm(1u8, Time::from_millis(50));
        assert_ne!(first.generation, second.generation);
        assert_eq!(t.len(), 1);
        assert_eq!(t.pop_due(Time::from_millis(20)), None);
        assert!(!t.cancel_handle(&1, first));
        assert!(t.is_armed(&1));
        assert!(t.cancel_handle(&1, second));
        assert!(!t.is_armed(&1));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut t = Timers::new();
        t.arm('x', Time::from_millis(10));
        assert!(t.cancel(&'x'));
        assert!(!t.cancel(&'x'));
        assert_eq!(t.next_deadline(), None);
        assert_eq!(t.pop_due(Time::from_millis(100)), None);
    }

    #[test]
    fn remaining_counts_down() {
        let mut t = Timers::new();
        t.arm(0u32, Time::from_millis(1000));
        assert_eq!(
            t.remaining(&0, Time::from_millis(400)),
            Duration::from_millis(600)
        );
        assert_eq!(t.remaining(&0, Time::from_millis(1400)), Duration::ZERO);
        assert_eq!(t.remaining(&9, Time::ZERO), Duration::ZERO);
    }
}
