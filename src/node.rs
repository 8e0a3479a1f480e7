// src/node.rs
//! The route discovery engine of one node.
//!
//! An [`AodvNode`] owns its routing table, pending-packet queue, neighbor
//! tracker and timers. It never blocks and never reads a clock of its own:
//! the host feeds it received frames, link-layer failures and outbound
//! packets, and calls [`AodvNode::poll`] whenever [`AodvNode::next_deadline`]
//! has passed. Everything the node transmits goes through its [`Transport`].

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::AodvConfig;
use crate::error::{ConfigError, ForwardError};
use crate::event::Event;
use crate::id_cache::IdCache;
use crate::message::{Message, RouteError, RouteReply, RouteReplyAck, RouteRequest};
use crate::neighbor::{Neighbor, NeighborTracker};
use crate::packet::{AODV_SERVICE_ID, Address, DataPacket, Frame, Transport};
use crate::queue::{ErrorCallback, ForwardCallback, QueueEntry, RequestQueue};
use crate::routing::{Route, RouteEntry, RouteState, RoutingTable, seqno_newer};
use crate::time::{Clock, Time};
use crate::timer::Timers;

/// Upper bound of the random delay added to protocol transmissions.
const MAX_JITTER_MS: u64 = 10;
/// Upper bound of the random delay before the first hello.
const MAX_HELLO_START_MS: u64 = 100;
/// Length of a rate-limiting window.
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);
/// Extra delay for a request pushed out of a full rate-limit window.
const RATE_LIMIT_SLACK: Duration = Duration::from_micros(100);

/// Everything the node can be waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    RreqRetry(Address),
    AckWait(Address),
    DeferredRequest(Address),
    Hello,
    NeighborPurge,
    RreqRateLimit,
    RerrRateLimit,
    Transmit(u64),
}

/// Counters for what the node did since it was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub requests_sent: u64,
    pub requests_deferred: u64,
    pub requests_forwarded: u64,
    pub duplicate_requests: u64,
    pub replies_sent: u64,
    pub replies_forwarded: u64,
    pub acks_sent: u64,
    pub errors_sent: u64,
    pub errors_suppressed: u64,
    pub hellos_sent: u64,
    pub malformed: u64,
    pub data_forwarded: u64,
    pub data_dropped: u64,
    pub link_breaks: u64,
    pub discoveries_failed: u64,
}

pub struct AodvNode<T: Transport, C: Clock> {
    address: Address,
    config: AodvConfig,
    transport: T,
    clock: C,
    rng: StdRng,

    seqno: u32,
    request_id: u32,

    routes: RoutingTable,
    queue: RequestQueue,
    neighbors: NeighborTracker,
    request_ids: IdCache,
    broadcast_ids: IdCache,

    timers: Timers<TimerKind>,
    outgoing: HashMap<u64, Frame>,
    next_outgoing: u64,

    rreq_window_count: u16,
    rerr_window_count: u16,
    last_broadcast: Option<Time>,

    stats: NodeStats,
    events: Vec<Event>,
}

impl<T: Transport, C: Clock> AodvNode<T, C> {
    /// Create a node with the given short address. Call [`AodvNode::start`]
    /// before feeding it traffic.
    pub fn new(
        address: Address,
        config: AodvConfig,
        transport: T,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(AodvNode {
            address,
            routes: RoutingTable::new(config.delete_period),
            queue: RequestQueue::new(config.max_queue_len, config.max_queue_time),
            neighbors: NeighborTracker::new(),
            request_ids: IdCache::new(config.path_discovery_time),
            broadcast_ids: IdCache::new(config.path_discovery_time),
            config,
            transport,
            clock,
            rng,
            seqno: 0,
            request_id: 0,
            timers: Timers::new(),
            outgoing: HashMap::new(),
            next_outgoing: 0,
            rreq_window_count: 0,
            rerr_window_count: 0,
            last_broadcast: None,
            stats: NodeStats::default(),
            events: Vec::new(),
        })
    }

    /// Arm the periodic timers.
    pub fn start(&mut self) {
        let now = self.now();
        self.timers
            .arm(TimerKind::RreqRateLimit, now + RATE_LIMIT_WINDOW);
        self.timers
            .arm(TimerKind::RerrRateLimit, now + RATE_LIMIT_WINDOW);
        if self.config.enable_hello {
            let offset = Duration::from_millis(self.rng.random_range(0..=MAX_HELLO_START_MS));
            self.timers.arm(TimerKind::Hello, now + offset);
            self.timers
                .arm(TimerKind::NeighborPurge, now + self.config.hello_interval);
        }
        debug!(node = %self.address, "routing started");
    }

    /// Fire every timer due at the current time. Returns how many fired.
    pub fn poll(&mut self) -> usize {
        let now = self.now();
        let mut fired = 0;
        while let Some(kind) = self.timers.pop_due(now) {
            self.on_timer(kind, now);
            fired += 1;
        }
        self.process_broken_links();
        fired
    }

    /// When [`AodvNode::poll`] next has work to do.
    pub fn next_deadline(&self) -> Option<Time> {
        self.timers.next_deadline()
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub fn config(&self) -> &AodvConfig {
        &self.config
    }

    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routes
    }

    /// Current entry for `dst`, after expiring stale state.
    pub fn route_entry(&mut self, dst: Address) -> Option<RouteEntry> {
        let now = self.now();
        self.routes.lookup(dst, now)
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.all()
    }

    pub fn is_neighbor(&mut self, addr: Address) -> bool {
        let now = self.now();
        let alive = self.neighbors.is_neighbor(addr, now);
        self.process_broken_links();
        alive
    }

    pub fn queued_packets(&mut self) -> usize {
        let now = self.now();
        self.queue.len(now)
    }

    /// True while a discovery for `dst` is waiting for its retry timer.
    pub fn discovery_pending(&self, dst: Address) -> bool {
        self.timers.is_armed(&TimerKind::RreqRetry(dst))
    }

    pub fn dump_routes(&mut self) -> String {
        let now = self.now();
        self.routes.dump(now)
    }

    /// Take and return all pending events since the last call.
    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Route for a locally originated packet to `dst`.
    ///
    /// Using a route keeps it and its next hop alive for another
    /// active route timeout.
    pub fn route_output(&mut self, dst: Address) -> Result<Route, ForwardError> {
        let now = self.now();
        let Some(entry) = self.routes.lookup_valid(dst, now) else {
            trace!(node = %self.address, destination = %dst, "no valid route");
            return Err(ForwardError::NoRouteToHost);
        };
        let active = self.config.active_route_timeout;
        self.routes.extend_lifetime(dst, active, now);
        self.routes.extend_lifetime(entry.next_hop, active, now);
        Ok(entry.route(self.address))
    }

    /// Park `packet` until a route to its destination is found, starting a
    /// discovery unless one is already running.
    pub fn defer_output(
        &mut self,
        packet: DataPacket,
        forward: ForwardCallback,
        error: ErrorCallback,
    ) {
        let now = self.now();
        let dst = packet.destination();
        let uid = packet.uid;
        if !self
            .queue
            .enqueue(QueueEntry::new(packet, forward, error), now)
        {
            trace!(node = %self.address, uid, "packet already queued");
            return;
        }
        debug!(node = %self.address, uid, destination = %dst, "queued packet awaiting route");
        let searching = self
            .routes
            .lookup(dst, now)
            .is_some_and(|e| e.state == RouteState::InSearch);
        if !searching {
            self.send_request(dst);
        }
    }

    /// Handle a data packet received from the link layer.
    ///
    /// Returns true when the packet was consumed here: forwarded, or dropped
    /// as a duplicate or echo of our own traffic. Returns false when this node
    /// is the destination or no route exists; in the latter case `error` has
    /// been called and a route error sent toward the source.
    pub fn route_input(
        &mut self,
        packet: DataPacket,
        forward: ForwardCallback,
        error: ErrorCallback,
    ) -> bool {
        let now = self.now();
        let source = packet.source();
        let dst = packet.destination();

        if source == self.address {
            return true;
        }

        if dst.is_broadcast() {
            if self
                .broadcast_ids
                .is_duplicate(source, packet.uid, now)
            {
                trace!(node = %self.address, uid = packet.uid, "duplicate broadcast");
                return true;
            }
            self.routes
                .extend_lifetime(source, self.config.active_route_timeout, now);
            if self.config.enable_broadcast {
                let route = Route {
                    destination: Address::BROADCAST,
                    source: self.address,
                    next_hop: Address::BROADCAST,
                    iface_index: self.config.interface_index,
                };
                forward(route, packet);
                self.stats.data_forwarded += 1;
            }
            return true;
        }

        if dst == self.address {
            return false;
        }

        let forwarded = self.forward_data(packet, forward, error, now);
        self.process_broken_links();
        forwarded
    }

    /// The link layer failed to deliver a frame to `neighbor`.
    pub fn on_transmission_failure(&mut self, neighbor: Address) {
        let now = self.now();
        debug!(node = %self.address, neighbor = %neighbor, "transmission failed");
        self.neighbors.on_transmission_failure(neighbor, now);
        self.process_broken_links();
    }

    /// Forget the route to `dst`, abandoning any discovery and its packets.
    pub fn remove_route(&mut self, dst: Address) -> bool {
        let now = self.now();
        self.timers.cancel(&TimerKind::RreqRetry(dst));
        self.timers.cancel(&TimerKind::DeferredRequest(dst));
        self.queue.drop_all(dst, now);
        self.routes.delete(dst, now)
    }

    /// Handle a control frame from `sender`. Returns false if the frame is
    /// not routing traffic or does not decode.
    pub fn on_receive(&mut self, frame: &Frame, sender: Address) -> bool {
        if frame.service_id != AODV_SERVICE_ID || sender == self.address {
            return false;
        }
        let msg = match Message::parse(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.malformed += 1;
                debug!(node = %self.address, from = %sender, error = %e, "dropping malformed message");
                return false;
            }
        };
        let now = self.now();
        trace!(node = %self.address, from = %sender, kind = ?msg.message_type(), "received");

        self.update_route_to_neighbor(sender, now);
        match msg {
            Message::Request(req) => self.recv_request(req, sender, frame.ttl, now),
            Message::Reply(rep) => self.recv_reply(rep, sender, frame.ttl, now),
            Message::Error(rerr) => self.recv_error(rerr, sender, now),
            Message::ReplyAck(_) => self.recv_reply_ack(sender),
        }
        self.process_broken_links();
        true
    }

    /// Originate a route request for `dst` using an expanding ring search.
    pub fn send_request(&mut self, dst: Address) {
        let now = self.now();
        if self.rreq_window_count >= self.config.rreq_rate_limit {
            let delay =
                self.timers.remaining(&TimerKind::RreqRateLimit, now) + RATE_LIMIT_SLACK;
            self.timers
                .arm(TimerKind::DeferredRequest(dst), now + delay);
            self.stats.requests_deferred += 1;
            debug!(node = %self.address, destination = %dst, "request rate limit reached, deferring");
            return;
        }
        self.rreq_window_count += 1;

        let cfg = &self.config;
        let mut req = RouteRequest::new(0, dst, self.address, 0);
        let ttl = match self.routes.lookup(dst, now) {
            Some(mut entry) => {
                let ttl = if entry.state != RouteState::InSearch {
                    entry
                        .hop_count
                        .saturating_add(cfg.ttl_increment)
                        .min(cfg.net_diameter)
                } else {
                    let next = entry.hop_count.saturating_add(cfg.ttl_increment);
                    if next > cfg.ttl_threshold {
                        cfg.net_diameter
                    } else {
                        next
                    }
                };
                if ttl == cfg.net_diameter {
                    entry.increment_rreq_count();
                }
                if entry.valid_seqno {
                    req.destination_seqno = entry.seqno;
                } else {
                    req.set_unknown_seqno(true);
                }
                entry.hop_count = ttl;
                entry.state = RouteState::InSearch;
                entry.set_lifetime(cfg.path_discovery_time, now);
                self.routes.update(entry);
                ttl
            }
            None => {
                let ttl = cfg.ttl_start;
                req.set_unknown_seqno(true);
                let mut entry = RouteEntry::new(
                    dst,
                    Address::BROADCAST,
                    now + cfg.path_discovery_time,
                )
                .with_hop_count(ttl)
                .with_state(RouteState::InSearch)
                .with_iface(cfg.interface_index);
                if ttl == cfg.net_diameter {
                    entry.increment_rreq_count();
                }
                self.routes.add(entry, now);
                ttl
            }
        };

        req.set_gratuitous(cfg.gratuitous_reply);
        req.set_destination_only(cfg.destination_only);

        self.seqno = self.seqno.wrapping_add(1);
        self.request_id = self.request_id.wrapping_add(1);
        req.origin_seqno = self.seqno;
        req.id = self.request_id;
        self.request_ids
            .is_duplicate(self.address, u64::from(self.request_id), now);

        debug!(
            node = %self.address,
            destination = %dst,
            ttl,
            id = self.request_id,
            "sending route request"
        );
        self.stats.requests_sent += 1;
        self.broadcast_later(req.into(), hop_limit(ttl), now);
        self.schedule_rreq_retry(dst, now);
    }

    fn now(&self) -> Time {
        self.clock.now()
    }

    fn on_timer(&mut self, kind: TimerKind, now: Time) {
        match kind {
            TimerKind::RreqRetry(dst) => self.route_request_timer_expire(dst, now),
            TimerKind::AckWait(neighbor) => {
                if self
                    .routes
                    .mark_unidirectional(neighbor, self.config.blacklist_timeout, now)
                {
                    warn!(node = %self.address, neighbor = %neighbor, "reply not acknowledged, blacklisting");
                    self.events.push(Event::NeighborBlacklisted(neighbor));
                }
            }
            TimerKind::DeferredRequest(dst) => self.send_request(dst),
            TimerKind::Hello => self.hello_timer_expire(now),
            TimerKind::NeighborPurge => {
                self.neighbors.purge(now);
                self.timers
                    .arm(TimerKind::NeighborPurge, now + self.config.hello_interval);
            }
            TimerKind::RreqRateLimit => {
                self.rreq_window_count = 0;
                self.timers
                    .arm(TimerKind::RreqRateLimit, now + RATE_LIMIT_WINDOW);
            }
            TimerKind::RerrRateLimit => {
                self.rerr_window_count = 0;
                self.timers
                    .arm(TimerKind::RerrRateLimit, now + RATE_LIMIT_WINDOW);
            }
            TimerKind::Transmit(id) => {
                if let Some(frame) = self.outgoing.remove(&id) {
                    self.transport.send(frame);
                }
            }
        }
    }

    fn schedule_rreq_retry(&mut self, dst: Address, now: Time) {
        let Some(entry) = self.routes.lookup(dst, now) else {
            return;
        };
        let cfg = &self.config;
        let retry = if entry.hop_count < cfg.net_diameter {
            let hops = u32::from(entry.hop_count) + u32::from(cfg.timeout_buffer);
            cfg.node_traversal_time.saturating_mul(2 * hops)
        } else {
            let backoff = entry.rreq_count().saturating_sub(1).min(31);
            cfg.net_traversal_time.saturating_mul(1u32 << backoff)
        };
        trace!(node = %self.address, destination = %dst, ?retry, "request retry scheduled");
        self.timers.arm(TimerKind::RreqRetry(dst), now + retry);
    }

    fn route_request_timer_expire(&mut self, dst: Address, now: Time) {
        let entry = self.routes.lookup(dst, now);
        match entry {
            Some(e) if e.is_valid() => {
                debug!(node = %self.address, destination = %dst, "route found");
                let route = e.route(self.address);
                self.send_packets_from_queue(dst, route, now);
            }
            Some(e) if e.state == RouteState::InSearch
                && e.rreq_count() < self.config.rreq_retries =>
            {
                trace!(node = %self.address, destination = %dst, previous_ttl = e.hop_count, "resending request");
                self.send_request(dst);
            }
            other => {
                let attempts = other.map(|e| e.rreq_count()).unwrap_or(0);
                warn!(node = %self.address, destination = %dst, attempts, "route discovery failed");
                self.routes.delete(dst, now);
                self.queue.drop_all(dst, now);
                self.stats.discoveries_failed += 1;
                self.events.push(Event::DiscoveryFailed(dst, attempts));
            }
        }
    }

    fn hello_timer_expire(&mut self, now: Time) {
        let offset = match self.last_broadcast.take() {
            Some(at) => {
                trace!(node = %self.address, "hello suppressed by recent broadcast");
                now - at
            }
            None => {
                self.send_hello(now);
                Duration::ZERO
            }
        };
        let next = self.config.hello_interval.saturating_sub(offset);
        self.timers.arm(TimerKind::Hello, now + next);
    }

    fn send_hello(&mut self, now: Time) {
        let hello = RouteReply::hello(self.address, self.seqno, self.config.neighbor_lifetime());
        self.stats.hellos_sent += 1;
        let frame = Frame::control(Address::BROADCAST, 1, Message::from(hello).to_bytes());
        self.transmit_later(frame, now);
    }

    fn update_route_to_neighbor(&mut self, sender: Address, now: Time) {
        let active = self.config.active_route_timeout;
        match self.routes.lookup(sender, now) {
            None => {
                let entry = RouteEntry::new(sender, sender, now + active)
                    .with_iface(self.config.interface_index);
                self.routes.add(entry, now);
            }
            Some(mut entry) => {
                if !(entry.valid_seqno && entry.hop_count == 1 && entry.next_hop == sender) {
                    entry.valid_seqno = false;
                    entry.state = RouteState::Valid;
                    entry.hop_count = 1;
                    entry.next_hop = sender;
                    entry.iface_index = self.config.interface_index;
                }
                entry.extend_lifetime(active, now);
                self.routes.update(entry);
            }
        }
    }

    fn recv_request(&mut self, mut req: RouteRequest, sender: Address, ttl: u8, now: Time) {
        if self
            .routes
            .lookup(sender, now)
            .is_some_and(|e| e.is_blacklisted(now))
        {
            debug!(node = %self.address, from = %sender, "ignoring request from blacklisted neighbor");
            return;
        }

        let origin = req.origin;
        if self
            .request_ids
            .is_duplicate(origin, u64::from(req.id), now)
        {
            self.stats.duplicate_requests += 1;
            trace!(node = %self.address, %origin, id = req.id, "duplicate request");
            return;
        }

        let hop = req.hop_count.saturating_add(1);
        req.hop_count = hop;

        let cfg = &self.config;
        let reverse_lifetime = cfg.net_traversal_time
            .saturating_mul(2)
            .saturating_sub(cfg.node_traversal_time.saturating_mul(2 * u32::from(hop)));
        match self.routes.lookup(origin, now) {
            None => {
                let entry = RouteEntry::new(origin, sender, now + reverse_lifetime)
                    .with_seqno(req.origin_seqno, true)
                    .with_hop_count(u16::from(hop))
                    .with_iface(cfg.interface_index);
                self.routes.add(entry, now);
            }
            Some(mut entry) => {
                if !entry.valid_seqno || seqno_newer(req.origin_seqno, entry.seqno) {
                    entry.seqno = req.origin_seqno;
                }
                entry.valid_seqno = true;
                entry.next_hop = sender;
                entry.hop_count = u16::from(hop);
                entry.state = RouteState::Valid;
                entry.iface_index = cfg.interface_index;
                entry.extend_lifetime(reverse_lifetime, now);
                self.routes.update(entry);
            }
        }
        self.neighbors
            .update(sender, self.config.neighbor_lifetime(), now);

        trace!(
            node = %self.address,
            %origin,
            destination = %req.destination,
            hop,
            id = req.id,
            "processing request"
        );

        if req.destination == self.address {
            if let Some(to_origin) = self.routes.lookup(origin, now) {
                self.send_reply(&req, &to_origin);
            }
            return;
        }

        let dst = req.destination;
        if let Some(to_dst) = self.routes.lookup(dst, now) {
            if to_dst.next_hop == sender {
                trace!(node = %self.address, from = %sender, "dropping request that would loop");
                return;
            }
            let fresh_enough = req.unknown_seqno()
                || (to_dst.seqno.wrapping_sub(req.destination_seqno) as i32) >= 0;
            if fresh_enough && to_dst.valid_seqno {
                if !req.destination_only() && to_dst.is_valid() {
                    if let Some(to_origin) = self.routes.lookup(origin, now) {
                        self.send_reply_by_intermediate(to_dst, to_origin, req.gratuitous(), now);
                    }
                    return;
                }
                req.destination_seqno = to_dst.seqno;
                req.set_unknown_seqno(false);
            }
        }

        if ttl < 2 {
            trace!(node = %self.address, %origin, destination = %dst, "request hop limit exhausted");
            return;
        }
        self.stats.requests_forwarded += 1;
        self.broadcast_later(req.into(), ttl - 1, now);
    }

    fn send_reply(&mut self, req: &RouteRequest, to_origin: &RouteEntry) {
        if !req.unknown_seqno() && req.destination_seqno == self.seqno.wrapping_add(1) {
            self.seqno = self.seqno.wrapping_add(1);
        }
        let rep = RouteReply::new(
            req.destination,
            self.seqno,
            to_origin.destination,
            0,
            self.config.my_route_timeout,
        );
        debug!(node = %self.address, origin = %to_origin.destination, via = %to_origin.next_hop, "replying as destination");
        self.stats.replies_sent += 1;
        self.send_now(to_origin.next_hop, hop_limit(to_origin.hop_count), rep.into());
    }

    fn send_reply_by_intermediate(
        &mut self,
        mut to_dst: RouteEntry,
        mut to_origin: RouteEntry,
        gratuitous: bool,
        now: Time,
    ) {
        let mut rep = RouteReply::new(
            to_dst.destination,
            to_dst.seqno,
            to_origin.destination,
            hop_limit(to_dst.hop_count),
            to_dst.remaining(now),
        );
        // A one-hop destination may sit behind a unidirectional link.
        if to_dst.hop_count == 1 {
            rep.set_ack_required(true);
            self.timers.arm(
                TimerKind::AckWait(to_origin.next_hop),
                now + self.config.next_hop_wait,
            );
        }
        to_dst.insert_precursor(to_origin.next_hop);
        to_origin.insert_precursor(to_dst.next_hop);
        self.routes.update(to_dst.clone());
        self.routes.update(to_origin.clone());

        debug!(
            node = %self.address,
            destination = %to_dst.destination,
            origin = %to_origin.destination,
            "replying on behalf of destination"
        );
        self.stats.replies_sent += 1;
        self.send_now(to_origin.next_hop, hop_limit(to_origin.hop_count), rep.into());

        if gratuitous {
            let grat = RouteReply::new(
                to_origin.destination,
                to_origin.seqno,
                to_dst.destination,
                hop_limit(to_origin.hop_count),
                to_origin.remaining(now),
            );
            self.stats.replies_sent += 1;
            self.send_now(to_dst.next_hop, hop_limit(to_dst.hop_count), grat.into());
        }
    }

    fn recv_reply(&mut self, mut rep: RouteReply, sender: Address, ttl: u8, now: Time) {
        let hop = rep.hop_count.saturating_add(1);
        rep.hop_count = hop;
        if rep.is_hello() {
            self.process_hello(&rep, now);
            return;
        }

        let dst = rep.destination;
        let existing = self.routes.lookup(dst, now);
        match &existing {
            Some(to_dst) => {
                let same = rep.destination_seqno == to_dst.seqno;
                let better = !to_dst.valid_seqno
                    || seqno_newer(rep.destination_seqno, to_dst.seqno)
                    || (same && !to_dst.is_valid())
                    || (same && u16::from(hop) < to_dst.hop_count);
                if better {
                    self.apply_reply(to_dst.clone(), &rep, sender, now);
                }
            }
            None => {
                let entry = RouteEntry::new(dst, sender, now + rep.lifetime)
                    .with_seqno(rep.destination_seqno, true)
                    .with_hop_count(u16::from(hop))
                    .with_iface(self.config.interface_index);
                self.routes.add(entry, now);
            }
        }

        if rep.ack_required() {
            self.stats.acks_sent += 1;
            self.send_now(sender, 1, RouteReplyAck::new().into());
            rep.set_ack_required(false);
        }

        if rep.origin == self.address {
            // A reply from the destination itself finds the entry already
            // refreshed to a valid 1-hop route; the retry timer still tells.
            let retry_armed = self.timers.cancel(&TimerKind::RreqRetry(dst));
            let was_searching = retry_armed
                || existing
                    .as_ref()
                    .is_some_and(|e| e.state == RouteState::InSearch);
            if was_searching {
                if let Some(current) = self.routes.lookup(dst, now) {
                    self.apply_reply(current, &rep, sender, now);
                }
            }
            if let Some(entry) = self.routes.lookup_valid(dst, now) {
                let route = entry.route(self.address);
                if was_searching {
                    debug!(node = %self.address, route = %route.summary(), hops = entry.hop_count, "route discovered");
                    self.events.push(Event::RouteDiscovered(dst, route));
                }
                self.send_packets_from_queue(dst, route, now);
            }
            return;
        }

        let Some(mut to_origin) = self.routes.lookup(rep.origin, now) else {
            trace!(node = %self.address, origin = %rep.origin, "no reverse route for reply");
            return;
        };
        if to_origin.state == RouteState::InSearch {
            return;
        }
        to_origin.extend_lifetime(self.config.active_route_timeout, now);
        self.routes.update(to_origin.clone());

        if let Some(to_dst) = self.routes.lookup_valid(dst, now) {
            self.routes.insert_precursor(dst, to_origin.next_hop);
            self.routes
                .insert_precursor(to_dst.next_hop, to_origin.next_hop);
            self.routes.insert_precursor(rep.origin, to_dst.next_hop);
            self.routes
                .insert_precursor(to_origin.next_hop, to_dst.next_hop);
        }

        if ttl < 2 {
            trace!(node = %self.address, destination = %dst, origin = %rep.origin, "reply hop limit exhausted");
            return;
        }
        self.stats.replies_forwarded += 1;
        self.send_now(to_origin.next_hop, ttl - 1, rep.into());
    }

    /// Overwrite the forward route with what `rep` says, keeping precursors.
    fn apply_reply(&mut self, mut entry: RouteEntry, rep: &RouteReply, sender: Address, now: Time) {
        entry.next_hop = sender;
        entry.hop_count = u16::from(rep.hop_count);
        entry.seqno = rep.destination_seqno;
        entry.valid_seqno = true;
        entry.state = RouteState::Valid;
        entry.iface_index = self.config.interface_index;
        entry.set_lifetime(rep.lifetime, now);
        self.routes.update(entry);
    }

    fn recv_reply_ack(&mut self, sender: Address) {
        self.timers.cancel(&TimerKind::AckWait(sender));
        self.routes.set_state(sender, RouteState::Valid);
    }

    fn process_hello(&mut self, rep: &RouteReply, now: Time) {
        let neighbor = rep.destination;
        let lifetime = self.config.neighbor_lifetime();
        match self.routes.lookup(neighbor, now) {
            None => {
                let entry = RouteEntry::new(neighbor, neighbor, now + rep.lifetime)
                    .with_seqno(rep.destination_seqno, true)
                    .with_iface(self.config.interface_index);
                self.routes.add(entry, now);
            }
            Some(mut entry) => {
                entry.extend_lifetime(lifetime, now);
                entry.seqno = rep.destination_seqno;
                entry.valid_seqno = true;
                entry.state = RouteState::Valid;
                entry.hop_count = 1;
                entry.next_hop = neighbor;
                entry.iface_index = self.config.interface_index;
                self.routes.update(entry);
            }
        }
        if self.config.enable_hello {
            self.neighbors.update(neighbor, lifetime, now);
        }
    }

    fn recv_error(&mut self, rerr: RouteError, sender: Address, now: Time) {
        let mut unreachable: Vec<(Address, u32)> = Vec::new();
        for &(dst, seqno) in rerr.unreachable() {
            // Routes already invalid were announced when they broke.
            if self
                .routes
                .lookup_valid(dst, now)
                .is_some_and(|e| e.next_hop == sender)
            {
                unreachable.push((dst, seqno));
            }
        }
        if unreachable.is_empty() {
            return;
        }
        debug!(node = %self.address, from = %sender, count = unreachable.len(), "routes reported broken");
        self.announce_unreachable(&unreachable, now);
        self.routes.invalidate_all(&unreachable, now);
    }

    fn process_broken_links(&mut self) {
        loop {
            let broken = self.neighbors.take_broken();
            if broken.is_empty() {
                break;
            }
            for next_hop in broken {
                self.handle_link_failure(next_hop);
            }
        }
    }

    /// Report every destination reached through `next_hop` as unreachable.
    fn handle_link_failure(&mut self, next_hop: Address) {
        let now = self.now();
        let Some(to_next_hop) = self.routes.lookup(next_hop, now) else {
            return;
        };
        let mut unreachable = vec![(next_hop, to_next_hop.seqno)];
        unreachable.extend(
            self.routes
                .destinations_via(next_hop, now)
                .into_iter()
                .filter(|(dst, _)| *dst != next_hop),
        );
        debug!(node = %self.address, neighbor = %next_hop, affected = unreachable.len(), "link broken");
        self.stats.link_breaks += 1;
        self.announce_unreachable(&unreachable, now);
        self.routes.invalidate_all(&unreachable, now);

        let lost = unreachable
            .iter()
            .skip(1)
            .map(|(dst, _)| *dst)
            .collect();
        self.events.push(Event::LinkBroken(next_hop, lost));
    }

    /// Send route errors for `unreachable` to the precursors of those routes.
    fn announce_unreachable(&mut self, unreachable: &[(Address, u32)], now: Time) {
        let mut rerr = RouteError::new();
        let mut precursors: Vec<Address> = Vec::new();
        for &(dst, seqno) in unreachable {
            if rerr.is_full() {
                let full = std::mem::take(&mut rerr);
                self.send_rerr_message(full, &precursors, now);
            }
            if !rerr.add_unreachable(dst, seqno) {
                continue;
            }
            for p in self.routes.precursors(dst) {
                if !precursors.contains(&p) {
                    precursors.push(p);
                }
            }
        }
        if !rerr.is_empty() {
            self.send_rerr_message(rerr, &precursors, now);
        }
    }

    fn send_rerr_message(&mut self, rerr: RouteError, precursors: &[Address], now: Time) {
        if precursors.is_empty() {
            trace!(node = %self.address, "no precursors to notify");
            return;
        }
        if self.rerr_window_count >= self.config.rerr_rate_limit {
            self.stats.errors_suppressed += 1;
            warn!(node = %self.address, "error rate limit reached, suppressing route error");
            return;
        }
        let destination = match precursors {
            [only] => {
                if self.routes.lookup_valid(*only, now).is_none() {
                    return;
                }
                *only
            }
            _ => Address::BROADCAST,
        };
        self.rerr_window_count += 1;
        self.stats.errors_sent += 1;
        let frame = Frame::control(destination, 1, Message::from(rerr).to_bytes());
        self.transmit_later(frame, now);
    }

    /// Tell the source of an unroutable packet that `dst` is gone.
    fn send_rerr_no_route(&mut self, dst: Address, seqno: u32, origin: Address, now: Time) {
        if self.rerr_window_count >= self.config.rerr_rate_limit {
            self.stats.errors_suppressed += 1;
            warn!(node = %self.address, "error rate limit reached, suppressing route error");
            return;
        }
        let mut rerr = RouteError::new();
        rerr.add_unreachable(dst, seqno);
        let to = self
            .routes
            .lookup_valid(origin, now)
            .map(|e| e.next_hop)
            .unwrap_or(Address::BROADCAST);
        self.rerr_window_count += 1;
        self.stats.errors_sent += 1;
        self.send_now(to, 1, rerr.into());
    }

    fn forward_data(
        &mut self,
        packet: DataPacket,
        forward: ForwardCallback,
        error: ErrorCallback,
        now: Time,
    ) -> bool {
        let dst = packet.destination();
        let origin = packet.source();
        let active = self.config.active_route_timeout;

        match self.routes.lookup(dst, now) {
            Some(to_dst) if to_dst.is_valid() => {
                let route = to_dst.route(self.address);
                trace!(node = %self.address, uid = packet.uid, route = %route.summary(), "forwarding");
                self.routes.extend_lifetime(origin, active, now);
                self.routes.extend_lifetime(dst, active, now);
                self.routes.extend_lifetime(route.next_hop, active, now);
                let back_hop = self.routes.lookup(origin, now).map(|e| e.next_hop);
                if let Some(back_hop) = back_hop {
                    self.routes.extend_lifetime(back_hop, active, now);
                }
                self.neighbors.update(route.next_hop, active, now);
                if let Some(back_hop) = back_hop {
                    self.neighbors.update(back_hop, active, now);
                }
                self.stats.data_forwarded += 1;
                forward(route, packet);
                true
            }
            stale => {
                let seqno = stale
                    .filter(|e| e.valid_seqno)
                    .map(|e| e.seqno)
                    .unwrap_or(0);
                debug!(node = %self.address, uid = packet.uid, destination = %dst, "no route to forward");
                self.send_rerr_no_route(dst, seqno, origin, now);
                self.stats.data_dropped += 1;
                error(packet, ForwardError::NoRouteToHost);
                false
            }
        }
    }

    fn send_packets_from_queue(&mut self, dst: Address, route: Route, now: Time) {
        while let Some(entry) = self.queue.dequeue(dst, now) {
            trace!(node = %self.address, uid = entry.packet.uid, "sending queued packet");
            (entry.forward)(route, entry.packet);
        }
    }

    fn send_now(&mut self, to: Address, ttl: u8, msg: Message) {
        self.transport
            .send(Frame::control(to, ttl, msg.to_bytes()));
    }

    fn broadcast_later(&mut self, msg: Message, ttl: u8, now: Time) {
        self.last_broadcast = Some(now);
        let frame = Frame::control(Address::BROADCAST, ttl, msg.to_bytes());
        self.transmit_later(frame, now);
    }

    /// Queue `frame` behind a random jitter.
    fn transmit_later(&mut self, frame: Frame, now: Time) {
        let jitter = Duration::from_millis(self.rng.random_range(0..=MAX_JITTER_MS));
        let id = self.next_outgoing;
        self.next_outgoing += 1;
        self.outgoing.insert(id, frame);
        self.timers.arm(TimerKind::Transmit(id), now + jitter);
    }
}

fn hop_limit(hops: u16) -> u8 {
    u8::try_from(hops).unwrap_or(u8::MAX)
}
