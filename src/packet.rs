// src/packet.rs
//! Addresses, link-layer frames and data packets.
//!
//! The routing engine never touches a radio. Everything it transmits goes
//! through a [`Transport`] as a [`Frame`]: a destination short address, a
//! service id, the hop limit and the encoded payload.

use std::fmt;

/// Service id (SAP) carrying routing control traffic.
pub const AODV_SERVICE_ID: u8 = 54;

/// Service id used for application data in the in-memory network.
pub const DATA_SERVICE_ID: u8 = 55;

/// 16-bit short node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub u16);

impl Address {
    /// Link-layer broadcast address (`ff:ff`).
    pub const BROADCAST: Address = Address(0xFFFF);

    pub const fn new(raw: u16) -> Self {
        Address(raw)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl From<u16> for Address {
    fn from(raw: u16) -> Self {
        Address(raw)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [hi, lo] = self.to_bytes();
        write!(f, "{hi:02x}:{lo:02x}")
    }
}

/// One link-layer transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Next-hop address, or [`Address::BROADCAST`].
    pub destination: Address,
    pub service_id: u8,
    /// Remaining hop limit carried beside the payload.
    pub ttl: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn control(destination: Address, ttl: u8, payload: Vec<u8>) -> Self {
        Frame {
            destination,
            service_id: AODV_SERVICE_ID,
            ttl,
            payload,
        }
    }

    /// An application data frame for the in-memory network.
    pub fn data(destination: Address, payload: Vec<u8>) -> Self {
        Frame {
            destination,
            service_id: DATA_SERVICE_ID,
            ttl: u8::MAX,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }
}

/// Outbound side of the link layer.
///
/// Sending is fire-and-forget. Delivery failures are reported back to the
/// node through `AodvNode::on_transmission_failure`.
pub trait Transport {
    fn send(&mut self, frame: Frame);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, frame: Frame) {
        (**self).send(frame)
    }
}

/// End-to-end addressing of an application packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub source: Address,
    pub destination: Address,
}

/// An application packet handed to the routing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Unique id assigned by the originator; used for duplicate suppression.
    pub uid: u64,
    pub header: DataHeader,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn new(uid: u64, source: Address, destination: Address, payload: Vec<u8>) -> Self {
        DataPacket {
            uid,
            header: DataHeader {
                source,
                destination,
            },
            payload,
        }
    }

    pub fn source(&self) -> Address {
        self.header.source
    }

    pub fn destination(&self) -> Address {
        self.header.destination
    }
}
