// src/sim.rs
//! Deterministic in-memory network of routing nodes.
//!
//! All nodes share one [`ManualClock`]. Frames are delivered instantly to
//! every node linked with the sender; a unicast over a missing link is
//! reported back to the sender as a transmission failure. Data packets travel
//! as [`DATA_SERVICE_ID`] frames and are forwarded hop by hop through
//! `route_input`.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Cursor;
use std::rc::Rc;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, trace};

use crate::config::AodvConfig;
use crate::error::{ConfigError, ForwardError};
use crate::event::Event;
use crate::node::AodvNode;
use crate::packet::{AODV_SERVICE_ID, Address, DATA_SERVICE_ID, DataPacket, Frame, Transport};
use crate::queue::{ErrorCallback, ForwardCallback};
use crate::routing::Route;
use crate::time::{Clock, ManualClock, Time};

type Outbox = Rc<RefCell<VecDeque<(Address, Frame)>>>;
type DropLog = Rc<RefCell<Vec<Dropped>>>;

/// Transport of one simulated node: tags frames with the sender.
#[derive(Debug, Clone)]
pub struct SimLink {
    from: Address,
    outbox: Outbox,
}

impl Transport for SimLink {
    fn send(&mut self, frame: Frame) {
        self.outbox.borrow_mut().push_back((self.from, frame));
    }
}

pub type SimNode = AodvNode<SimLink, ManualClock>;

/// A data packet that reached its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub at: Time,
    pub node: Address,
    pub packet: DataPacket,
}

/// A data packet some node gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    pub node: Address,
    pub packet: DataPacket,
    pub reason: ForwardError,
}

pub struct Network {
    clock: ManualClock,
    config: AodvConfig,
    nodes: BTreeMap<Address, SimNode>,
    links: BTreeSet<(Address, Address)>,
    outbox: Outbox,
    dropped: DropLog,
    delivered: Vec<Delivery>,
    next_uid: u64,
}

impl Network {
    pub fn new(config: AodvConfig) -> Self {
        Network {
            clock: ManualClock::new(),
            config,
            nodes: BTreeMap::new(),
            links: BTreeSet::new(),
            outbox: Rc::new(RefCell::new(VecDeque::new())),
            dropped: Rc::new(RefCell::new(Vec::new())),
            delivered: Vec::new(),
            next_uid: 1,
        }
    }

    /// Nodes `1..=len`, each linked to the next.
    pub fn chain(len: u16, config: AodvConfig) -> Result<Self, ConfigError> {
        let mut net = Network::new(config);
        for i in 1..=len {
            net.add_node(Address(i))?;
        }
        for i in 1..len {
            net.connect(Address(i), Address(i + 1));
        }
        Ok(net)
    }

    /// A `width` x `height` grid numbered row by row from 1, linked to the
    /// four orthogonal neighbors.
    pub fn grid(width: u16, height: u16, config: AodvConfig) -> Result<Self, ConfigError> {
        let mut net = Network::new(config);
        let at = |x: u16, y: u16| Address(y * width + x + 1);
        for y in 0..height {
            for x in 0..width {
                net.add_node(at(x, y))?;
            }
        }
        for y in 0..height {
            for x in 0..width {
                if x + 1 < width {
                    net.connect(at(x, y), at(x + 1, y));
                }
                if y + 1 < height {
                    net.connect(at(x, y), at(x, y + 1));
                }
            }
        }
        Ok(net)
    }

    /// Create and start a node. Seeded configs get a per-node seed.
    pub fn add_node(&mut self, address: Address) -> Result<(), ConfigError> {
        let mut config = self.config.clone();
        config.rng_seed = config
            .rng_seed
            .map(|seed| seed.wrapping_add(u64::from(address.0)));
        let link = SimLink {
            from: address,
            outbox: Rc::clone(&self.outbox),
        };
        let mut node = AodvNode::new(address, config, link, self.clock.clone())?;
        node.start();
        self.nodes.insert(address, node);
        Ok(())
    }

    pub fn connect(&mut self, a: Address, b: Address) {
        self.links.insert(link_key(a, b));
    }

    pub fn disconnect(&mut self, a: Address, b: Address) {
        debug!(%a, %b, "cutting link");
        self.links.remove(&link_key(a, b));
    }

    pub fn is_linked(&self, a: Address, b: Address) -> bool {
        self.links.contains(&link_key(a, b))
    }

    pub fn now(&self) -> Time {
        self.clock.now()
    }

    pub fn node(&self, address: Address) -> Option<&SimNode> {
        self.nodes.get(&address)
    }

    pub fn node_mut(&mut self, address: Address) -> Option<&mut SimNode> {
        self.nodes.get_mut(&address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.nodes.keys().copied()
    }

    pub fn delivered(&self) -> &[Delivery] {
        &self.delivered
    }

    pub fn dropped(&self) -> Vec<Dropped> {
        self.dropped.borrow().clone()
    }

    /// Events of every node since the last call, tagged with the node.
    pub fn drain_events(&mut self) -> Vec<(Address, Event)> {
        self.nodes
            .iter_mut()
            .flat_map(|(addr, node)| node.drain_events().into_iter().map(|e| (*addr, e)))
            .collect()
    }

    /// Originate a data packet at `source`. Returns its uid, or `None` if
    /// `source` is not part of the network.
    pub fn send_data(&mut self, source: Address, destination: Address, payload: Vec<u8>) -> Option<u64> {
        let uid = self.next_uid;
        self.next_uid += 1;
        let packet = DataPacket::new(uid, source, destination, payload);

        if destination.is_broadcast() {
            self.nodes.get(&source)?;
            self.outbox
                .borrow_mut()
                .push_back((source, Frame::data(destination, encode_data(&packet))));
            self.flush();
            return Some(uid);
        }

        let forward = self.forward_callback(source);
        let error = self.error_callback(source);
        let node = self.nodes.get_mut(&source)?;
        match node.route_output(destination) {
            Ok(route) => forward(route, packet),
            Err(_) => node.defer_output(packet, forward, error),
        }
        self.flush();
        Some(uid)
    }

    /// Run the network for `duration`, firing timers in deadline order.
    pub fn advance(&mut self, duration: Duration) {
        let until = self.clock.now() + duration;
        loop {
            self.flush();
            let next = self.nodes.values().filter_map(SimNode::next_deadline).min();
            match next {
                Some(at) if at <= until => {
                    self.clock.set(at);
                    self.poll_all();
                }
                _ => break,
            }
        }
        self.clock.set(until);
        self.poll_all();
        self.flush();
    }

    fn poll_all(&mut self) {
        for node in self.nodes.values_mut() {
            node.poll();
        }
    }

    fn pop_frame(&self) -> Option<(Address, Frame)> {
        self.outbox.borrow_mut().pop_front()
    }

    /// Deliver queued frames until the network is quiet.
    fn flush(&mut self) {
        while let Some((from, frame)) = self.pop_frame() {
            if frame.is_broadcast() {
                let receivers: Vec<Address> = self
                    .nodes
                    .keys()
                    .copied()
                    .filter(|to| *to != from && self.is_linked(from, *to))
                    .collect();
                for to in receivers {
                    self.deliver(from, to, &frame);
                }
            } else if self.is_linked(from, frame.destination) {
                self.deliver(from, frame.destination, &frame);
            } else {
                trace!(%from, to = %frame.destination, "no link");
                if let Some(node) = self.nodes.get_mut(&from) {
                    node.on_transmission_failure(frame.destination);
                }
            }
        }
    }

    fn deliver(&mut self, from: Address, to: Address, frame: &Frame) {
        match frame.service_id {
            AODV_SERVICE_ID => {
                if let Some(node) = self.nodes.get_mut(&to) {
                    node.on_receive(frame, from);
                }
            }
            DATA_SERVICE_ID => {
                let Some(packet) = decode_data(&frame.payload) else {
                    debug!(%from, %to, "dropping undecodable data frame");
                    return;
                };
                self.receive_data(to, packet);
            }
            other => trace!(%to, service = other, "unknown service"),
        }
    }

    fn receive_data(&mut self, at: Address, packet: DataPacket) {
        let dst = packet.destination();
        let local = dst == at || (dst.is_broadcast() && packet.source() != at);
        if local && !self.has_delivery(at, packet.uid) {
            trace!(node = %at, uid = packet.uid, "delivered");
            self.delivered.push(Delivery {
                at: self.clock.now(),
                node: at,
                packet: packet.clone(),
            });
        }
        if dst == at {
            return;
        }

        let forward = self.forward_callback(at);
        let error = self.error_callback(at);
        if let Some(node) = self.nodes.get_mut(&at) {
            node.route_input(packet, forward, error);
        }
    }

    fn has_delivery(&self, node: Address, uid: u64) -> bool {
        self.delivered
            .iter()
            .any(|d| d.node == node && d.packet.uid == uid)
    }

    fn forward_callback(&self, from: Address) -> ForwardCallback {
        let outbox = Rc::clone(&self.outbox);
        Box::new(move |route: Route, packet: DataPacket| {
            let frame = Frame::data(route.next_hop, encode_data(&packet));
            outbox.borrow_mut().push_back((from, frame));
        })
    }

    fn error_callback(&self, node: Address) -> ErrorCallback {
        let dropped = Rc::clone(&self.dropped);
        Box::new(move |packet: DataPacket, reason: ForwardError| {
            dropped.borrow_mut().push(Dropped {
                node,
                packet,
                reason,
            });
        })
    }
}

fn link_key(a: Address, b: Address) -> (Address, Address) {
    if a <= b { (a, b) } else { (b, a) }
}

/// uid, source, destination, then the payload.
fn encode_data(packet: &DataPacket) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + packet.payload.len());
    // Writing into a Vec cannot fail.
    let _ = out.write_u64::<BigEndian>(packet.uid);
    let _ = out.write_u16::<BigEndian>(packet.source().0);
    let _ = out.write_u16::<BigEndian>(packet.destination().0);
    out.extend_from_slice(&packet.payload);
    out
}

fn decode_data(buf: &[u8]) -> Option<DataPacket> {
    let mut cur = Cursor::new(buf);
    let uid = cur.read_u64::<BigEndian>().ok()?;
    let source = Address(cur.read_u16::<BigEndian>().ok()?);
    let destination = Address(cur.read_u16::<BigEndian>().ok()?);
    let payload = buf[cur.position() as usize..].to_vec();
    Some(DataPacket::new(uid, source, destination, payload))
}
