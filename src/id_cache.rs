// src/id_cache.rs
//! Short-lived memory of `(address, id)` pairs.
//!
//! Used to drop route requests already processed (origin, request id) and
//! broadcast data packets already forwarded (source, uid).

use std::time::Duration;

use crate::packet::Address;
use crate::time::Time;

#[derive(Debug, Clone)]
struct Seen {
    address: Address,
    id: u64,
    expires_at: Time,
}

#[derive(Debug)]
pub struct IdCache {
    seen: Vec<Seen>,
    lifetime: Duration,
}

impl IdCache {
    pub fn new(lifetime: Duration) -> Self {
        IdCache {
            seen: Vec::new(),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn set_lifetime(&mut self, lifetime: Duration) {
        self.lifetime = lifetime;
    }

    /// True if the pair was seen within the lifetime. Otherwise records it
    /// and returns false.
    pub fn is_duplicate(&mut self, address: Address, id: u64, now: Time) -> bool {
        self.purge(now);
        if self.seen.iter().any(|s| s.address == address && s.id == id) {
            return true;
        }
        self.seen.push(Seen {
            address,
            id,
            expires_at: now + self.lifetime,
        });
        false
    }

    pub fn purge(&mut self, now: Time) {
        self.seen.retain(|s| s.expires_at >= now);
    }

    pub fn len(&mut self, now: Time) -> usize {
        self.purge(now);
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_is_duplicate() {
        let mut c = IdCache::new(Duration::from_secs(5));
        let now = Time::ZERO;
        assert!(!c.is_duplicate(Address(1), 7, now));
        assert!(c.is_duplicate(Address(1), 7, now));
        assert!(!c.is_duplicate(Address(2), 7, now));
        assert!(!c.is_duplicate(Address(1), 8, now));
        assert_eq!(c.len(now), 3);
    }

    #[test]
    fn entries_expire() {
        let mut c = IdCache::new(Duration::from_secs(5));
        let now = Time::ZERO;
        c.is_duplicate(Address(1), 7, now);
        let later = now + Duration::from_millis(5001);
        assert!(!c.is_duplicate(Address(1), 7, later));
    }
}
