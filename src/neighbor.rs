// src/neighbor.rs
//! One-hop neighbor liveness.
//!
//! A neighbor stays alive as long as something keeps refreshing it: hellos,
//! any received control message, or traffic forwarded through it. Expired
//! neighbors and neighbors the link layer failed to reach are removed on the
//! next purge and reported as broken links.

use std::time::Duration;

use crate::packet::Address;
use crate::time::Time;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub address: Address,
    pub expires_at: Time,
    /// Set when the link layer reported a failed transmission.
    pub closing: bool,
}

impl Neighbor {
    pub fn new(address: Address, expires_at: Time) -> Self {
        Neighbor {
            address,
            expires_at,
            closing: false,
        }
    }

    fn is_down(&self, now: Time) -> bool {
        self.expires_at < now || self.closing
    }
}

/// Tracks which nodes are currently in radio range.
///
/// Broken links found while purging are buffered until the owner collects
/// them with [`NeighborTracker::take_broken`].
#[derive(Debug, Default)]
pub struct NeighborTracker {
    neighbors: Vec<Neighbor>,
    broken: Vec<Address>,
}

impl NeighborTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_neighbor(&mut self, addr: Address, now: Time) -> bool {
        self.purge(now);
        self.neighbors.iter().any(|n| n.address == addr)
    }

    /// Time until `addr` expires, zero if unknown.
    pub fn expiry(&mut self, addr: Address, now: Time) -> Duration {
        self.purge(now);
        self.neighbors
            .iter()
            .find(|n| n.address == addr)
            .map(|n| now.until(n.expires_at))
            .unwrap_or(Duration::ZERO)
    }

    /// Refresh `addr` so it lives at least until `now + extend_by`.
    pub fn update(&mut self, addr: Address, extend_by: Duration, now: Time) {
        let expires_at = now + extend_by;
        if let Some(n) = self.neighbors.iter_mut().find(|n| n.address == addr) {
            n.expires_at = n.expires_at.max(expires_at);
            return;
        }
        tracing::trace!(neighbor = %addr, "opening link");
        self.neighbors.push(Neighbor::new(addr, expires_at));
        self.purge(now);
    }

    /// Remove expired and closing neighbors, recording each as broken.
    pub fn purge(&mut self, now: Time) {
        if self.neighbors.iter().all(|n| !n.is_down(now)) {
            return;
        }
        let broken = &mut self.broken;
        self.neighbors.retain(|n| {
            if n.is_down(now) {
                tracing::debug!(neighbor = %n.address, "closing link");
                broken.push(n.address);
                false
            } else {
                true
            }
        });
    }

    /// The link layer could not deliver to `addr`.
    pub fn on_transmission_failure(&mut self, addr: Address, now: Time) {
        for n in self.neighbors.iter_mut().filter(|n| n.address == addr) {
            n.closing = true;
        }
        self.purge(now);
    }

    /// Drain the broken links recorded since the last call.
    pub fn take_broken(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.broken)
    }

    pub fn all(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.iter()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        Address(0x0010)
    }

    #[test]
    fn update_extends_but_never_shortens() {
        let mut tbl = NeighborTracker::new();
        let now = Time::ZERO;

        tbl.update(addr(), Duration::from_secs(3), now);
        tbl.update(addr(), Duration::from_secs(1), now);
        assert_eq!(tbl.expiry(addr(), now), Duration::from_secs(3));

        tbl.update(addr(), Duration::from_secs(5), now);
        assert_eq!(tbl.expiry(addr(), now), Duration::from_secs(5));
        assert_eq!(tbl.len(), 1);
    }

    #[test]
    fn unknown_neighbor_has_zero_expiry() {
        let mut tbl = NeighborTracker::new();
        assert!(!tbl.is_neighbor(addr(), Time::ZERO));
        assert_eq!(tbl.expiry(addr(), Time::ZERO), Duration::ZERO);
    }

    #[test]
    fn purge_reports_expired_neighbors() {
        let mut tbl = NeighborTracker::new();
        let now = Time::ZERO;
        tbl.update(addr(), Duration::from_secs(2), now);
        tbl.update(Address(0x20), Duration::from_secs(10), now);

        let later = now + Duration::from_secs(3);
        tbl.purge(later);
        assert_eq!(tbl.take_broken(), vec![addr()]);
        assert!(!tbl.is_neighbor(addr(), later));
        assert!(tbl.is_neighbor(Address(0x20), later));

        // A second purge at the same instant finds nothing new.
        tbl.purge(later);
        assert!(tbl.take_broken().is_empty());
    }

    #[test]
    fn transmission_failure_closes_link() {
        let mut tbl = NeighborTracker::new();
        let now = Time::ZERO;
        tbl.update(addr(), Duration::from_secs(10), now);
        tbl.on_transmission_failure(addr(), now);
        assert!(tbl.is_empty());
        assert_eq!(tbl.take_broken(), vec![addr()]);
    }

    #[test]
    fn failure_for_unknown_neighbor_is_ignored() {
        let mut tbl = NeighborTracker::new();
        tbl.on_transmission_failure(addr(), Time::ZERO);
        assert!(tbl.take_broken().is_empty());
    }
}
