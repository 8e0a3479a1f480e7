// src/config.rs
//! Protocol parameters of a node.
//!
//! Defaults follow the usual AODV constants scaled for a low-rate radio.
//! Several timeouts are derived from others; [`AodvConfig::with_derived_timeouts`]
//! recomputes them after changing the base values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AodvConfig {
    /// Full-diameter discovery attempts before giving up.
    pub rreq_retries: u8,
    pub ttl_start: u16,
    pub ttl_increment: u16,
    /// Above this TTL the search jumps straight to `net_diameter`.
    pub ttl_threshold: u16,
    pub timeout_buffer: u16,
    /// Route requests originated per second.
    pub rreq_rate_limit: u16,
    /// Route errors originated per second.
    pub rerr_rate_limit: u16,
    #[serde(with = "duration_ms")]
    pub active_route_timeout: Duration,
    pub net_diameter: u16,
    #[serde(with = "duration_ms")]
    pub node_traversal_time: Duration,
    #[serde(with = "duration_ms")]
    pub net_traversal_time: Duration,
    #[serde(with = "duration_ms")]
    pub path_discovery_time: Duration,
    #[serde(with = "duration_ms")]
    pub my_route_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub hello_interval: Duration,
    pub allowed_hello_loss: u16,
    /// Lifetime of an invalidated route before deletion.
    #[serde(with = "duration_ms")]
    pub delete_period: Duration,
    #[serde(with = "duration_ms")]
    pub next_hop_wait: Duration,
    #[serde(with = "duration_ms")]
    pub blacklist_timeout: Duration,
    pub max_queue_len: usize,
    #[serde(with = "duration_ms")]
    pub max_queue_time: Duration,
    pub destination_only: bool,
    pub gratuitous_reply: bool,
    pub enable_hello: bool,
    pub enable_broadcast: bool,
    pub interface_index: u32,
    /// Fixed RNG seed for reproducible jitter.
    pub rng_seed: Option<u64>,
}

impl Default for AodvConfig {
    fn default() -> Self {
        AodvConfig {
            rreq_retries: 2,
            ttl_start: 1,
            ttl_increment: 2,
            ttl_threshold: 7,
            timeout_buffer: 2,
            rreq_rate_limit: 10,
            rerr_rate_limit: 10,
            active_route_timeout: Duration::from_secs(3),
            net_diameter: 35,
            node_traversal_time: Duration::from_millis(40),
            net_traversal_time: Duration::from_millis(2800),
            path_discovery_time: Duration::from_millis(5600),
            my_route_timeout: Duration::from_millis(11200),
            hello_interval: Duration::from_secs(1),
            allowed_hello_loss: 2,
            delete_period: Duration::from_secs(15),
            next_hop_wait: Duration::from_millis(50),
            blacklist_timeout: Duration::from_millis(5600),
            max_queue_len: 64,
            max_queue_time: Duration::from_secs(30),
            destination_only: false,
            gratuitous_reply: true,
            enable_hello: true,
            enable_broadcast: true,
            interface_index: 0,
            rng_seed: None,
        }
    }
}

impl AodvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rreq_retries(mut self, value: u8) -> Self {
        self.rreq_retries = value;
        self
    }

    pub fn ttl_start(mut self, value: u16) -> Self {
        self.ttl_start = value;
        self
    }

    pub fn ttl_increment(mut self, value: u16) -> Self {
        self.ttl_increment = value;
        self
    }

    pub fn ttl_threshold(mut self, value: u16) -> Self {
        self.ttl_threshold = value;
        self
    }

    pub fn net_diameter(mut self, value: u16) -> Self {
        self.net_diameter = value;
        self
    }

    pub fn node_traversal_time(mut self, value: Duration) -> Self {
        self.node_traversal_time = value;
        self
    }

    pub fn active_route_timeout(mut self, value: Duration) -> Self {
        self.active_route_timeout = value;
        self
    }

    pub fn hello_interval(mut self, value: Duration) -> Self {
        self.hello_interval = value;
        self
    }

    pub fn rate_limits(mut self, rreq: u16, rerr: u16) -> Self {
        self.rreq_rate_limit = rreq;
        self.rerr_rate_limit = rerr;
        self
    }

    pub fn max_queue(mut self, len: usize, time: Duration) -> Self {
        self.max_queue_len = len;
        self.max_queue_time = time;
        self
    }

    pub fn destination_only(mut self, value: bool) -> Self {
        self.destination_only = value;
        self
    }

    pub fn gratuitous_reply(mut self, value: bool) -> Self {
        self.gratuitous_reply = value;
        self
    }

    pub fn enable_hello(mut self, value: bool) -> Self {
        self.enable_hello = value;
        self
    }

    pub fn enable_broadcast(mut self, value: bool) -> Self {
        self.enable_broadcast = value;
        self
    }

    pub fn interface_index(mut self, value: u32) -> Self {
        self.interface_index = value;
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Recompute the timeouts that depend on diameter, traversal time,
    /// active route timeout, hello interval and retry count.
    pub fn with_derived_timeouts(mut self) -> Self {
        self.net_traversal_time = self.node_traversal_time * 2 * u32::from(self.net_diameter);
        self.path_discovery_time = self.net_traversal_time * 2;
        self.my_route_timeout = self.path_discovery_time.max(self.active_route_timeout) * 2;
        self.delete_period = self.active_route_timeout.max(self.hello_interval) * 5;
        self.next_hop_wait = self.node_traversal_time + Duration::from_millis(10);
        self.blacklist_timeout = self.net_traversal_time * u32::from(self.rreq_retries);
        self
    }

    /// Neighbor lifetime granted by one hello.
    pub fn neighbor_lifetime(&self) -> Duration {
        self.hello_interval * u32::from(self.allowed_hello_loss)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero: [(&'static str, u64); 6] = [
            ("ttl_start", u64::from(self.ttl_start)),
            ("ttl_increment", u64::from(self.ttl_increment)),
            ("net_diameter", u64::from(self.net_diameter)),
            ("rreq_rate_limit", u64::from(self.rreq_rate_limit)),
            ("rerr_rate_limit", u64::from(self.rerr_rate_limit)),
            ("max_queue_len", self.max_queue_len as u64),
        ];
        if let Some((field, _)) = nonzero.into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }
        if self.hello_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "hello_interval",
            });
        }
        if self.net_diameter > u16::from(u8::MAX) {
            return Err(ConfigError::DiameterTooLarge(self.net_diameter));
        }
        if self.ttl_threshold > self.net_diameter {
            return Err(ConfigError::ThresholdAboveDiameter {
                threshold: self.ttl_threshold,
                diameter: self.net_diameter,
            });
        }
        if self.ttl_start > self.net_diameter {
            return Err(ConfigError::StartAboveDiameter {
                start: self.ttl_start,
                diameter: self.net_diameter,
            });
        }
        Ok(())
    }
}

/// Durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_defaults_are_consistent() {
        let base = AodvConfig::default();
        assert_eq!(base.clone().with_derived_timeouts(), base);
    }

    #[test]
    fn builder_chain() {
        let c = AodvConfig::new()
            .rreq_retries(4)
            .ttl_start(3)
            .enable_hello(false)
            .rng_seed(7);
        assert_eq!(c.rreq_retries, 4);
        assert_eq!(c.ttl_start, 3);
        assert!(!c.enable_hello);
        assert_eq!(c.rng_seed, Some(7));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert_eq!(
            AodvConfig::new().ttl_start(0).validate(),
            Err(ConfigError::Zero { field: "ttl_start" })
        );
        assert_eq!(
            AodvConfig::new().net_diameter(300).validate(),
            Err(ConfigError::DiameterTooLarge(300))
        );
        assert!(matches!(
            AodvConfig::new().net_diameter(5).validate(),
            Err(ConfigError::ThresholdAboveDiameter { .. })
        ));
        assert_eq!(
            AodvConfig::new().ttl_increment(0).validate(),
            Err(ConfigError::Zero {
                field: "ttl_increment"
            })
        );
        assert!(matches!(
            AodvConfig::new().max_queue(0, Duration::from_secs(1)).validate(),
            Err(ConfigError::Zero { .. })
        ));
    }

    #[test]
    fn json_uses_milliseconds_and_defaults() {
        let c: AodvConfig =
            serde_json::from_str(r#"{ "hello_interval": 2500, "rreq_retries": 5 }"#).unwrap();
        assert_eq!(c.hello_interval, Duration::from_millis(2500));
        assert_eq!(c.rreq_retries, 5);
        assert_eq!(c.net_diameter, 35);

        let json = serde_json::to_value(AodvConfig::default()).unwrap();
        assert_eq!(json["active_route_timeout"], 3000);
        assert_eq!(json["node_traversal_time"], 40);
    }
}
