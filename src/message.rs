// src/message.rs
//! Wire format of routing control messages.
//!
//! Every message starts with a one-byte type followed by a fixed layout
//! (big-endian, 16-bit short addresses):
//!
//! - Route Request (1): flags, reserved, hop count, request id (4),
//!   destination (2), destination seqno (4), origin (2), origin seqno (4).
//! - Route Reply (2): flags, prefix size, hop count, destination (2),
//!   destination seqno (4), origin (2), lifetime in ms (4).
//! - Route Error (3): flags, reserved, count, then `count` pairs of
//!   address (2) and seqno (4).
//! - Route Reply Ack (4): one reserved byte.
//!
//! Reserved bits are preserved so decoding and re-encoding is byte exact.

use std::io::{Cursor, Write};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::error::DecodeError;
use crate::packet::Address;

const RREQ_GRATUITOUS: u8 = 1 << 5;
const RREQ_DESTINATION_ONLY: u8 = 1 << 4;
const RREQ_UNKNOWN_SEQNO: u8 = 1 << 3;
const RREP_ACK_REQUIRED: u8 = 1 << 6;
const RERR_NO_DELETE: u8 = 1 << 0;

/// Largest number of unreachable destinations one Route Error can carry.
pub const MAX_UNREACHABLE: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    RouteRequest = 1,
    RouteReply = 2,
    RouteError = 3,
    RouteReplyAck = 4,
}

impl MessageType {
    /// Size of the body following the type byte, for fixed-size kinds.
    fn fixed_body_len(self) -> Option<usize> {
        match self {
            MessageType::RouteRequest => Some(19),
            MessageType::RouteReply => Some(15),
            MessageType::RouteReplyAck => Some(1),
            MessageType::RouteError => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(MessageType::RouteRequest),
            2 => Ok(MessageType::RouteReply),
            3 => Ok(MessageType::RouteError),
            4 => Ok(MessageType::RouteReplyAck),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteRequest {
    flags: u8,
    reserved: u8,
    pub hop_count: u8,
    pub id: u32,
    pub destination: Address,
    pub destination_seqno: u32,
    pub origin: Address,
    pub origin_seqno: u32,
}

impl RouteRequest {
    pub fn new(id: u32, destination: Address, origin: Address, origin_seqno: u32) -> Self {
        RouteRequest {
            id,
            destination,
            origin,
            origin_seqno,
            ..Default::default()
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn gratuitous(&self) -> bool {
        self.flags & RREQ_GRATUITOUS != 0
    }

    pub fn set_gratuitous(&mut self, on: bool) {
        set_bit(&mut self.flags, RREQ_GRATUITOUS, on);
    }

    pub fn destination_only(&self) -> bool {
        self.flags & RREQ_DESTINATION_ONLY != 0
    }

    pub fn set_destination_only(&mut self, on: bool) {
        set_bit(&mut self.flags, RREQ_DESTINATION_ONLY, on);
    }

    pub fn unknown_seqno(&self) -> bool {
        self.flags & RREQ_UNKNOWN_SEQNO != 0
    }

    pub fn set_unknown_seqno(&mut self, on: bool) {
        set_bit(&mut self.flags, RREQ_UNKNOWN_SEQNO, on);
    }

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.flags;
        out[1] = self.reserved;
        out[2] = self.hop_count;
        BigEndian::write_u32(&mut out[3..7], self.id);
        BigEndian::write_u16(&mut out[7..9], self.destination.0);
        BigEndian::write_u32(&mut out[9..13], self.destination_seqno);
        BigEndian::write_u16(&mut out[13..15], self.origin.0);
        BigEndian::write_u32(&mut out[15..19], self.origin_seqno);
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(RouteRequest {
            flags: cur.read_u8()?,
            reserved: cur.read_u8()?,
            hop_count: cur.read_u8()?,
            id: cur.read_u32::<BigEndian>()?,
            destination: Address(cur.read_u16::<BigEndian>()?),
            destination_seqno: cur.read_u32::<BigEndian>()?,
            origin: Address(cur.read_u16::<BigEndian>()?),
            origin_seqno: cur.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteReply {
    flags: u8,
    pub prefix_size: u8,
    pub hop_count: u8,
    pub destination: Address,
    pub destination_seqno: u32,
    pub origin: Address,
    /// Encoded in whole milliseconds, saturating at `u32::MAX`.
    pub lifetime: Duration,
}

impl RouteReply {
    pub fn new(
        destination: Address,
        destination_seqno: u32,
        origin: Address,
        hop_count: u8,
        lifetime: Duration,
    ) -> Self {
        RouteReply {
            hop_count,
            destination,
            destination_seqno,
            origin,
            lifetime,
            ..Default::default()
        }
    }

    /// A hello beacon: a reply about ourselves with destination == origin.
    pub fn hello(own: Address, own_seqno: u32, lifetime: Duration) -> Self {
        RouteReply::new(own, own_seqno, own, 0, lifetime)
    }

    pub fn is_hello(&self) -> bool {
        self.destination == self.origin
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn ack_required(&self) -> bool {
        self.flags & RREP_ACK_REQUIRED != 0
    }

    pub fn set_ack_required(&mut self, on: bool) {
        set_bit(&mut self.flags, RREP_ACK_REQUIRED, on);
    }

    fn encode(&self, out: &mut [u8]) {
        let lifetime_ms = u32::try_from(self.lifetime.as_millis()).unwrap_or(u32::MAX);
        out[0] = self.flags;
        out[1] = self.prefix_size;
        out[2] = self.hop_count;
        BigEndian::write_u16(&mut out[3..5], self.destination.0);
        BigEndian::write_u32(&mut out[5..9], self.destination_seqno);
        BigEndian::write_u16(&mut out[9..11], self.origin.0);
        BigEndian::write_u32(&mut out[11..15], lifetime_ms);
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(RouteReply {
            flags: cur.read_u8()?,
            prefix_size: cur.read_u8()?,
            hop_count: cur.read_u8()?,
            destination: Address(cur.read_u16::<BigEndian>()?),
            destination_seqno: cur.read_u32::<BigEndian>()?,
            origin: Address(cur.read_u16::<BigEndian>()?),
            lifetime: Duration::from_millis(u64::from(cur.read_u32::<BigEndian>()?)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteReplyAck {
    reserved: u8,
}

impl RouteReplyAck {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Destinations that became unreachable, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteError {
    flags: u8,
    reserved: u8,
    unreachable: Vec<(Address, u32)>,
}

impl RouteError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_delete(&self) -> bool {
        self.flags & RERR_NO_DELETE != 0
    }

    pub fn set_no_delete(&mut self, on: bool) {
        set_bit(&mut self.flags, RERR_NO_DELETE, on);
    }

    /// Add an unreachable destination. Returns false if the message is full
    /// or the destination is already listed.
    pub fn add_unreachable(&mut self, destination: Address, seqno: u32) -> bool {
        if self.unreachable.len() >= MAX_UNREACHABLE
            || self.unreachable.iter().any(|(a, _)| *a == destination)
        {
            return false;
        }
        self.unreachable.push((destination, seqno));
        true
    }

    /// Pop the first listed destination.
    pub fn remove_unreachable(&mut self) -> Option<(Address, u32)> {
        if self.unreachable.is_empty() {
            None
        } else {
            Some(self.unreachable.remove(0))
        }
    }

    pub fn unreachable(&self) -> &[(Address, u32)] {
        &self.unreachable
    }

    pub fn len(&self) -> usize {
        self.unreachable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unreachable.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.unreachable.len() >= MAX_UNREACHABLE
    }

    fn body_len(&self) -> usize {
        3 + 6 * self.unreachable.len()
    }

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.flags;
        out[1] = self.reserved;
        out[2] = self.unreachable.len() as u8;
        for (i, (addr, seqno)) in self.unreachable.iter().enumerate() {
            let at = 3 + 6 * i;
            BigEndian::write_u16(&mut out[at..at + 2], addr.0);
            BigEndian::write_u32(&mut out[at + 2..at + 6], *seqno);
        }
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let flags = cur.read_u8()?;
        let reserved = cur.read_u8()?;
        let count = cur.read_u8()?;
        let mut unreachable = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let addr = Address(cur.read_u16::<BigEndian>()?);
            let seqno = cur.read_u32::<BigEndian>()?;
            unreachable.push((addr, seqno));
        }
        Ok(RouteError {
            flags,
            reserved,
            unreachable,
        })
    }
}

/// Any routing control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(RouteRequest),
    Reply(RouteReply),
    Error(RouteError),
    ReplyAck(RouteReplyAck),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::RouteRequest,
            Message::Reply(_) => MessageType::RouteReply,
            Message::Error(_) => MessageType::RouteError,
            Message::ReplyAck(_) => MessageType::RouteReplyAck,
        }
    }

    /// Total encoded size including the type byte.
    pub fn encoded_len(&self) -> usize {
        let kind = self.message_type();
        let body = match self {
            Message::Error(e) => e.body_len(),
            _ => kind.fixed_body_len().unwrap_or(0),
        };
        1 + body
    }

    /// Decode one message occupying all of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Message, DecodeError> {
        let (&first, body) = buf.split_first().ok_or(DecodeError::Empty)?;
        let kind = MessageType::try_from(first)?;

        if let Some(expected) = kind.fixed_body_len() {
            if body.len() < expected {
                return Err(DecodeError::Truncated(kind));
            }
            if body.len() != expected {
                return Err(DecodeError::Length {
                    kind,
                    expected,
                    actual: body.len(),
                });
            }
        }

        let mut cur = Cursor::new(body);
        let truncated = |_| DecodeError::Truncated(kind);
        let msg = match kind {
            MessageType::RouteRequest => Message::Request(RouteRequest::decode(&mut cur).map_err(truncated)?),
            MessageType::RouteReply => Message::Reply(RouteReply::decode(&mut cur).map_err(truncated)?),
            MessageType::RouteError => Message::Error(RouteError::decode(&mut cur).map_err(truncated)?),
            MessageType::RouteReplyAck => Message::ReplyAck(RouteReplyAck {
                reserved: cur.read_u8().map_err(truncated)?,
            }),
        };

        let consumed = cur.position() as usize;
        if consumed != body.len() {
            return Err(DecodeError::Length {
                kind,
                expected: consumed,
                actual: body.len(),
            });
        }
        Ok(msg)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        buf[0] = self.message_type() as u8;
        let body = &mut buf[1..];
        match self {
            Message::Request(m) => m.encode(body),
            Message::Reply(m) => m.encode(body),
            Message::Error(m) => m.encode(body),
            Message::ReplyAck(m) => body[0] = m.reserved,
        }
        buf
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.to_bytes())
    }
}

impl From<RouteRequest> for Message {
    fn from(m: RouteRequest) -> Self {
        Message::Request(m)
    }
}

impl From<RouteReply> for Message {
    fn from(m: RouteReply) -> Self {
        Message::Reply(m)
    }
}

impl From<RouteError> for Message {
    fn from(m: RouteError) -> Self {
        Message::Error(m)
    }
}

impl From<RouteReplyAck> for Message {
    fn from(m: RouteReplyAck) -> Self {
        Message::ReplyAck(m)
    }
}

fn set_bit(flags: &mut u8, bit: u8, on: bool) {
    if on {
        *flags |= bit;
    } else {
        *flags &= !bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_request() -> RouteRequest {
        let mut r = RouteRequest::new(0x01020304, Address(0x0002), Address(0x0001), 7);
        r.hop_count = 3;
        r.destination_seqno = 42;
        r.set_unknown_seqno(true);
        r.set_gratuitous(true);
        r
    }

    #[test]
    fn request_layout() {
        let bytes = Message::from(sample_request()).to_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 0b0010_1000);
        assert_eq!(bytes[3], 3);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..10], &[0, 2]);
        assert_eq!(&bytes[14..16], &[0, 1]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 7]);
    }

    #[test]
    fn request_roundtrip_keeps_flags() {
        let msg = Message::from(sample_request());
        let parsed = Message::parse(&msg.to_bytes()).unwrap();
        let Message::Request(r) = &parsed else {
            panic!("expected request, got {parsed:?}");
        };
        assert!(r.unknown_seqno());
        assert!(r.gratuitous());
        assert!(!r.destination_only());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn reply_ack_flag_and_lifetime() {
        let mut rep = RouteReply::new(Address(5), 9, Address(1), 2, Duration::from_millis(3000));
        rep.set_ack_required(true);
        let bytes = Message::from(rep.clone()).to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[1], 0b0100_0000);
        assert_eq!(&bytes[12..16], &3000u32.to_be_bytes());
        assert_eq!(Message::parse(&bytes).unwrap(), Message::Reply(rep));
    }

    #[test]
    fn hello_is_reply_about_self() {
        let h = RouteReply::hello(Address(3), 11, Duration::from_secs(2));
        assert!(h.is_hello());
        assert_eq!(h.hop_count, 0);
        assert_eq!(Message::from(h).message_type(), MessageType::RouteReply);
    }

    #[test]
    fn error_rejects_duplicates_and_overflow() {
        let mut e = RouteError::new();
        assert!(e.add_unreachable(Address(1), 10));
        assert!(!e.add_unreachable(Address(1), 11));
        for i in 2..=255u16 {
            assert!(e.add_unreachable(Address(i), 0));
        }
        assert!(e.is_full());
        assert!(!e.add_unreachable(Address(999), 0));
        assert_eq!(e.remove_unreachable(), Some((Address(1), 10)));
        assert_eq!(e.len(), 254);
    }

    #[test]
    fn error_roundtrip_preserves_order() {
        let mut e = RouteError::new();
        e.set_no_delete(true);
        e.add_unreachable(Address(9), 1);
        e.add_unreachable(Address(4), 2);
        let bytes = Message::from(e.clone()).to_bytes();
        assert_eq!(bytes.len(), 1 + 3 + 12);
        assert_eq!(bytes[1], 1);
        assert_eq!(bytes[3], 2);
        let Message::Error(back) = Message::parse(&bytes).unwrap() else {
            panic!("expected route error");
        };
        assert!(back.no_delete());
        assert_eq!(back.unreachable(), &[(Address(9), 1), (Address(4), 2)]);
    }

    #[test]
    fn ack_is_two_bytes() {
        let bytes = Message::from(RouteReplyAck::new()).to_bytes();
        assert_eq!(bytes, vec![4, 0]);
        assert_eq!(
            Message::parse(&bytes).unwrap(),
            Message::ReplyAck(RouteReplyAck::new())
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(Message::parse(&[]), Err(DecodeError::Empty));
        assert_eq!(Message::parse(&[9, 0]), Err(DecodeError::UnknownType(9)));
        assert_eq!(
            Message::parse(&[1, 0, 0]),
            Err(DecodeError::Truncated(MessageType::RouteRequest))
        );
        assert!(matches!(
            Message::parse(&[4, 0, 0]),
            Err(DecodeError::Length { .. })
        ));
        // count says two entries, only one present
        assert_eq!(
            Message::parse(&[3, 0, 0, 2, 0, 1, 0, 0, 0, 5]),
            Err(DecodeError::Truncated(MessageType::RouteError))
        );
        assert!(matches!(
            Message::parse(&[3, 0, 0, 0, 0xAA]),
            Err(DecodeError::Length { .. })
        ));
    }

    proptest! {
        #[test]
        fn parse_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Message::parse(&bytes);
        }

        #[test]
        fn accepted_input_reencodes_identically(bytes in proptest::collection::vec(any::<u8>(), 1..40)) {
            if let Ok(msg) = Message::parse(&bytes) {
                prop_assert_eq!(msg.to_bytes(), bytes);
            }
        }
    }
}
