// src/routing.rs
//! Per-destination route state.
//!
//! One [`RouteEntry`] per destination address. Entries age out on their own:
//! every query purges first, so an expired valid route is demoted to invalid
//! and an expired invalid route is forgotten. Entries in search are never
//! purged; the discovery retry timer owns their lifetime.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use crate::packet::Address;
use crate::time::Time;

/// Lifecycle of a route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteState {
    Valid,
    Invalid,
    InSearch,
}

impl RouteState {
    fn label(self) -> &'static str {
        match self {
            RouteState::Valid => "UP",
            RouteState::Invalid => "DOWN",
            RouteState::InSearch => "IN_SEARCH",
        }
    }
}

/// A forwarding decision: where a packet for `destination` goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Address,
    pub source: Address,
    pub next_hop: Address,
    pub iface_index: u32,
}

impl Route {
    /// Short description for logging.
    pub fn summary(&self) -> String {
        format!(
            "dst={} src={} via={} iface={}",
            self.destination, self.source, self.next_hop, self.iface_index
        )
    }
}

/// Everything known about one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Address,
    pub next_hop: Address,
    pub iface_index: u32,
    pub seqno: u32,
    /// False when `seqno` is not known to be the destination's.
    pub valid_seqno: bool,
    pub hop_count: u16,
    pub state: RouteState,
    pub expires_at: Time,
    precursors: Vec<Address>,
    rreq_count: u8,
    unidirectional: bool,
    blacklist_expires_at: Time,
}

impl RouteEntry {
    /// A valid one-hop entry with an unknown seqno.
    pub fn new(destination: Address, next_hop: Address, expires_at: Time) -> Self {
        RouteEntry {
            destination,
            next_hop,
            iface_index: 0,
            seqno: 0,
            valid_seqno: false,
            hop_count: 1,
            state: RouteState::Valid,
            expires_at,
            precursors: Vec::new(),
            rreq_count: 0,
            unidirectional: false,
            blacklist_expires_at: Time::ZERO,
        }
    }

    pub fn with_seqno(mut self, seqno: u32, valid: bool) -> Self {
        self.seqno = seqno;
        self.valid_seqno = valid;
        self
    }

    pub fn with_hop_count(mut self, hop_count: u16) -> Self {
        self.hop_count = hop_count;
        self
    }

    pub fn with_state(mut self, state: RouteState) -> Self {
        self.state = state;
        self
    }

    pub fn with_iface(mut self, iface_index: u32) -> Self {
        self.iface_index = iface_index;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.state == RouteState::Valid
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: Time) -> Duration {
        now.until(self.expires_at)
    }

    pub fn set_lifetime(&mut self, lifetime: Duration, now: Time) {
        self.expires_at = now + lifetime;
    }

    /// Push the expiry out to at least `now + lifetime`.
    pub fn extend_lifetime(&mut self, lifetime: Duration, now: Time) {
        self.expires_at = self.expires_at.max(now + lifetime);
    }

    /// Forwarding view of this entry.
    pub fn route(&self, source: Address) -> Route {
        Route {
            destination: self.destination,
            source,
            next_hop: self.next_hop,
            iface_index: self.iface_index,
        }
    }

    pub fn precursors(&self) -> &[Address] {
        &self.precursors
    }

    pub fn has_precursor(&self, precursor: Address) -> bool {
        self.precursors.contains(&precursor)
    }

    /// Returns false if already present.
    pub fn insert_precursor(&mut self, precursor: Address) -> bool {
        if self.has_precursor(precursor) {
            return false;
        }
        self.precursors.push(precursor);
        true
    }

    pub fn delete_precursor(&mut self, precursor: Address) -> bool {
        let before = self.precursors.len();
        self.precursors.retain(|p| *p != precursor);
        before != self.precursors.len()
    }

    /// Discovery attempts made at the network diameter.
    pub fn rreq_count(&self) -> u8 {
        self.rreq_count
    }

    pub fn increment_rreq_count(&mut self) {
        self.rreq_count = self.rreq_count.saturating_add(1);
    }

    pub fn is_unidirectional(&self) -> bool {
        self.unidirectional
    }

    pub fn blacklist_expires_at(&self) -> Time {
        self.blacklist_expires_at
    }

    /// Requests heard from this neighbor are ignored while blacklisted.
    pub fn is_blacklisted(&self, now: Time) -> bool {
        self.unidirectional && self.blacklist_expires_at > now
    }

    fn invalidate(&mut self, bad_link_lifetime: Duration, now: Time) {
        if self.state == RouteState::Invalid {
            return;
        }
        self.state = RouteState::Invalid;
        self.rreq_count = 0;
        self.expires_at = now + bad_link_lifetime;
    }
}

/// Routing table of one node.
#[derive(Debug)]
pub struct RoutingTable {
    entries: BTreeMap<Address, RouteEntry>,
    /// How long an invalidated entry is kept before deletion.
    bad_link_lifetime: Duration,
}

impl RoutingTable {
    pub fn new(bad_link_lifetime: Duration) -> Self {
        RoutingTable {
            entries: BTreeMap::new(),
            bad_link_lifetime,
        }
    }

    pub fn bad_link_lifetime(&self) -> Duration {
        self.bad_link_lifetime
    }

    pub fn set_bad_link_lifetime(&mut self, lifetime: Duration) {
        self.bad_link_lifetime = lifetime;
    }

    /// Copy of the entry for `dst`, in any state.
    pub fn lookup(&mut self, dst: Address, now: Time) -> Option<RouteEntry> {
        self.purge(now);
        self.entries.get(&dst).cloned()
    }

    /// Copy of the entry for `dst` only if it is valid.
    pub fn lookup_valid(&mut self, dst: Address, now: Time) -> Option<RouteEntry> {
        self.lookup(dst, now).filter(RouteEntry::is_valid)
    }

    /// Insert a new entry. Fails if `dst` is already known.
    pub fn add(&mut self, mut entry: RouteEntry, now: Time) -> bool {
        self.purge(now);
        if self.entries.contains_key(&entry.destination) {
            return false;
        }
        if entry.state != RouteState::InSearch {
            entry.rreq_count = 0;
        }
        self.entries.insert(entry.destination, entry);
        true
    }

    /// Replace an existing entry. Fails if `dst` is unknown.
    pub fn update(&mut self, mut entry: RouteEntry) -> bool {
        let Some(slot) = self.entries.get_mut(&entry.destination) else {
            return false;
        };
        if entry.state != RouteState::InSearch {
            entry.rreq_count = 0;
        }
        *slot = entry;
        true
    }

    pub fn delete(&mut self, dst: Address, now: Time) -> bool {
        self.purge(now);
        self.entries.remove(&dst).is_some()
    }

    /// Force the state of `dst` and reset its request counter.
    pub fn set_state(&mut self, dst: Address, state: RouteState) -> bool {
        match self.entries.get_mut(&dst) {
            Some(e) => {
                e.state = state;
                e.rreq_count = 0;
                true
            }
            None => false,
        }
    }

    /// Invalidate every listed destination that is currently valid.
    pub fn invalidate_all(&mut self, unreachable: &[(Address, u32)], now: Time) {
        self.purge(now);
        let lifetime = self.bad_link_lifetime;
        for (dst, _) in unreachable {
            if let Some(e) = self.entries.get_mut(dst) {
                if e.state == RouteState::Valid {
                    tracing::trace!(destination = %dst, "invalidating route");
                    e.invalidate(lifetime, now);
                }
            }
        }
    }

    /// Drop expired invalid entries and demote expired valid ones.
    pub fn purge(&mut self, now: Time) {
        let lifetime = self.bad_link_lifetime;
        self.entries.retain(|_, e| {
            if e.unidirectional && e.blacklist_expires_at <= now {
                e.unidirectional = false;
            }
            if e.expires_at >= now {
                return true;
            }
            match e.state {
                RouteState::Invalid => false,
                RouteState::Valid => {
                    e.invalidate(lifetime, now);
                    true
                }
                RouteState::InSearch => true,
            }
        });
    }

    /// Destinations (with last known seqno) whose next hop is `next_hop`.
    pub fn destinations_via(&mut self, next_hop: Address, now: Time) -> Vec<(Address, u32)> {
        self.purge(now);
        self.entries
            .values()
            .filter(|e| e.next_hop == next_hop)
            .map(|e| (e.destination, e.seqno))
            .collect()
    }

    /// Blacklist `neighbor` for `blacklist_timeout`.
    pub fn mark_unidirectional(
        &mut self,
        neighbor: Address,
        blacklist_timeout: Duration,
        now: Time,
    ) -> bool {
        match self.entries.get_mut(&neighbor) {
            Some(e) => {
                e.unidirectional = true;
                e.blacklist_expires_at = now + blacklist_timeout;
                e.rreq_count = 0;
                true
            }
            None => false,
        }
    }

    pub fn insert_precursor(&mut self, dst: Address, precursor: Address) -> bool {
        self.entries
            .get_mut(&dst)
            .is_some_and(|e| e.insert_precursor(precursor))
    }

    pub fn precursors(&self, dst: Address) -> Vec<Address> {
        self.entries
            .get(&dst)
            .map(|e| e.precursors.clone())
            .unwrap_or_default()
    }

    /// Extend a valid entry's lifetime to at least `now + lifetime`.
    pub fn extend_lifetime(&mut self, dst: Address, lifetime: Duration, now: Time) -> bool {
        self.purge(now);
        match self.entries.get_mut(&dst) {
            Some(e) if e.state == RouteState::Valid => {
                e.extend_lifetime(lifetime, now);
                e.rreq_count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Human-readable table, one line per destination.
    pub fn dump(&mut self, now: Time) -> String {
        self.purge(now);
        let mut out = String::from("Destination\tGateway\tIface\tFlag\tExpire\tHops\n");
        for e in self.entries.values() {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}\t{:.2}\t{}",
                e.destination,
                e.next_hop,
                e.iface_index,
                e.state.label(),
                e.remaining(now).as_secs_f64(),
                e.hop_count
            );
        }
        out
    }
}

/// True if `a` is strictly fresher than `b` under wrapping comparison.
pub fn seqno_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(n: u16) -> Address {
        Address(n)
    }

    fn table() -> RoutingTable {
        RoutingTable::new(Duration::from_secs(15))
    }

    #[test]
    fn add_rejects_duplicates_and_update_requires_presence() {
        let mut t = table();
        let now = Time::ZERO;
        let e = RouteEntry::new(addr(2), addr(2), now + Duration::from_secs(3));
        assert!(!t.update(e.clone()));
        assert!(t.add(e.clone(), now));
        assert!(!t.add(e, now));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn lookup_valid_filters_state() {
        let mut t = table();
        let now = Time::ZERO;
        let e = RouteEntry::new(addr(3), addr(2), now + Duration::from_secs(3))
            .with_state(RouteState::InSearch);
        t.add(e, now);
        assert!(t.lookup(addr(3), now).is_some());
        assert!(t.lookup_valid(addr(3), now).is_none());
        assert!(t.set_state(addr(3), RouteState::Valid));
        assert!(t.lookup_valid(addr(3), now).is_some());
        assert!(!t.set_state(addr(99), RouteState::Valid));
    }

    #[test]
    fn purge_demotes_then_deletes() {
        let mut t = table();
        let start = Time::ZERO;
        t.add(
            RouteEntry::new(addr(2), addr(2), start + Duration::from_secs(1)),
            start,
        );

        // Expiry itself is not yet expired.
        let at_expiry = start + Duration::from_secs(1);
        assert!(t.lookup_valid(addr(2), at_expiry).is_some());

        let later = start + Duration::from_millis(1001);
        let e = t.lookup(addr(2), later).unwrap();
        assert_eq!(e.state, RouteState::Invalid);
        assert_eq!(e.expires_at, later + Duration::from_secs(15));

        let much_later = later + Duration::from_secs(16);
        assert!(t.lookup(addr(2), much_later).is_none());
    }

    #[test]
    fn purge_never_deletes_in_search() {
        let mut t = table();
        let start = Time::ZERO;
        let e = RouteEntry::new(addr(4), addr(4), start + Duration::from_millis(10))
            .with_state(RouteState::InSearch);
        t.add(e, start);
        let e = t.lookup(addr(4), start + Duration::from_secs(100)).unwrap();
        assert_eq!(e.state, RouteState::InSearch);
    }

    #[test]
    fn purge_twice_is_idempotent() {
        let mut t = table();
        let start = Time::ZERO;
        t.add(
            RouteEntry::new(addr(2), addr(2), start + Duration::from_secs(1)),
            start,
        );
        t.add(
            RouteEntry::new(addr(3), addr(2), start + Duration::from_secs(10)),
            start,
        );
        let now = start + Duration::from_secs(2);
        t.purge(now);
        let snapshot: Vec<RouteEntry> = t.entries().cloned().collect();
        t.purge(now);
        let again: Vec<RouteEntry> = t.entries().cloned().collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn invalidate_only_touches_valid_entries() {
        let mut t = table();
        let now = Time::ZERO;
        let ttl = now + Duration::from_secs(5);
        t.add(RouteEntry::new(addr(1), addr(1), ttl), now);
        t.add(
            RouteEntry::new(addr(2), addr(1), ttl).with_state(RouteState::InSearch),
            now,
        );
        t.invalidate_all(&[(addr(1), 0), (addr(2), 0), (addr(7), 0)], now);
        assert_eq!(t.lookup(addr(1), now).unwrap().state, RouteState::Invalid);
        assert_eq!(t.lookup(addr(2), now).unwrap().state, RouteState::InSearch);
    }

    #[test]
    fn rreq_count_resets_outside_search() {
        let mut t = table();
        let now = Time::ZERO;
        let mut e = RouteEntry::new(addr(5), addr(5), now + Duration::from_secs(5))
            .with_state(RouteState::InSearch);
        e.increment_rreq_count();
        t.add(e.clone(), now);
        assert_eq!(t.lookup(addr(5), now).unwrap().rreq_count(), 1);

        e.increment_rreq_count();
        t.update(e.clone());
        assert_eq!(t.lookup(addr(5), now).unwrap().rreq_count(), 2);

        e.state = RouteState::Valid;
        t.update(e);
        assert_eq!(t.lookup(addr(5), now).unwrap().rreq_count(), 0);
    }

    #[test]
    fn destinations_via_next_hop() {
        let mut t = table();
        let now = Time::ZERO;
        let ttl = now + Duration::from_secs(5);
        t.add(RouteEntry::new(addr(1), addr(1), ttl).with_seqno(4, true), now);
        t.add(RouteEntry::new(addr(2), addr(1), ttl).with_seqno(9, true), now);
        t.add(RouteEntry::new(addr(3), addr(8), ttl), now);
        assert_eq!(
            t.destinations_via(addr(1), now),
            vec![(addr(1), 4), (addr(2), 9)]
        );
    }

    #[test]
    fn blacklist_expires() {
        let mut t = table();
        let now = Time::ZERO;
        t.add(
            RouteEntry::new(addr(6), addr(6), now + Duration::from_secs(60)),
            now,
        );
        assert!(t.mark_unidirectional(addr(6), Duration::from_secs(5), now));
        assert!(t.lookup(addr(6), now).unwrap().is_blacklisted(now));
        let later = now + Duration::from_secs(6);
        let e = t.lookup(addr(6), later).unwrap();
        assert!(!e.is_blacklisted(later));
        assert!(!e.is_unidirectional());
        assert!(!t.mark_unidirectional(addr(42), Duration::from_secs(5), now));
    }

    #[test]
    fn precursors_are_a_set() {
        let mut t = table();
        let now = Time::ZERO;
        t.add(
            RouteEntry::new(addr(1), addr(1), now + Duration::from_secs(5)),
            now,
        );
        assert!(t.insert_precursor(addr(1), addr(9)));
        assert!(!t.insert_precursor(addr(1), addr(9)));
        assert!(t.insert_precursor(addr(1), addr(8)));
        assert!(!t.insert_precursor(addr(2), addr(8)));
        assert_eq!(t.precursors(addr(1)), vec![addr(9), addr(8)]);
    }

    #[test]
    fn extend_lifetime_never_shortens() {
        let mut t = table();
        let now = Time::ZERO;
        t.add(
            RouteEntry::new(addr(1), addr(1), now + Duration::from_secs(10)),
            now,
        );
        assert!(t.extend_lifetime(addr(1), Duration::from_secs(3), now));
        assert_eq!(
            t.lookup(addr(1), now).unwrap().expires_at,
            now + Duration::from_secs(10)
        );
        assert!(t.extend_lifetime(addr(1), Duration::from_secs(20), now));
        assert_eq!(
            t.lookup(addr(1), now).unwrap().expires_at,
            now + Duration::from_secs(20)
        );
    }

    #[test]
    fn dump_lists_entries() {
        let mut t = table();
        let now = Time::ZERO;
        t.add(
            RouteEntry::new(addr(1), addr(2), now + Duration::from_secs(3)).with_hop_count(2),
            now,
        );
        let out = t.dump(now);
        assert!(out.contains("00:01\t00:02\t0\tUP"));
    }

    #[test]
    fn seqno_freshness_wraps() {
        assert!(seqno_newer(5, 4));
        assert!(!seqno_newer(4, 5));
        assert!(!seqno_newer(4, 4));
        assert!(seqno_newer(1, u32::MAX));
    }

    proptest! {
        #[test]
        fn seqno_newer_is_antisymmetric(a in any::<u32>(), b in any::<u32>()) {
            prop_assert!(!(seqno_newer(a, b) && seqno_newer(b, a)));
        }
    }
}
