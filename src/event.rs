// src/event.rs
//! High-level events emitted by a routing node.
//!
//! Applications drain these to react to discovery results and link changes
//! without diffing the routing table.

use crate::packet::Address;
use crate::routing::Route;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A route requested by this node became usable.
    RouteDiscovered(Address, Route),

    /// Discovery gave up after the given number of full-diameter attempts.
    DiscoveryFailed(Address, u8),

    /// A neighbor went away; the listed destinations were routed through it.
    LinkBroken(Address, Vec<Address>),

    /// A neighbor did not acknowledge a reply and was blacklisted.
    NeighborBlacklisted(Address),
}
