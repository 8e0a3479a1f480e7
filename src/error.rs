// src/error.rs
//! Error types shared across the crate.

use thiserror::Error;

use crate::message::MessageType;

/// Failure to decode a control message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("truncated {0:?} body")]
    Truncated(MessageType),
    #[error("{kind:?} body has {actual} bytes, expected {expected}")]
    Length {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },
}

/// Reason a data packet could not be forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ForwardError {
    #[error("no route to host")]
    NoRouteToHost,
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("net_diameter {0} does not fit in a one-byte hop limit")]
    DiameterTooLarge(u16),
    #[error("ttl_threshold {threshold} exceeds net_diameter {diameter}")]
    ThresholdAboveDiameter { threshold: u16, diameter: u16 },
    #[error("ttl_start {start} exceeds net_diameter {diameter}")]
    StartAboveDiameter { start: u16, diameter: u16 },
}
