//! # Gateway Configuration
//!
//! The configuration surface consumed by the core (spec §6). Loading this
//! from a file, environment, or remote config service is the front-end's
//! job; this module only defines the shape and sane defaults, mirroring the
//! way the teacher's `cli::BenchmarkConfiguration` separates "what the
//! engine needs" from "how the user supplied it."

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Word order for multi-register Modbus numeric types (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WordOrder {
    BigEndian,
    LittleEndian,
}

impl Default for WordOrder {
    fn default() -> Self {
        WordOrder::BigEndian
    }
}

/// Per-protocol knobs that don't generalize across protocols: default unit
/// id, word order, CIP session timeout, OPC-UA security policy selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolDefaults {
    /// Modbus: unit id used when a device doesn't specify one.
    pub default_unit_id: u8,
    /// Modbus: word order for 32/64-bit numeric registers.
    pub word_order: WordOrder,
    /// CIP: session keepalive/idle timeout.
    pub cip_session_timeout: Duration,
    /// OPC-UA: selected security policy URI (`None` == no security).
    pub opcua_security_policy: Option<String>,
}

impl Default for ProtocolDefaults {
    fn default() -> Self {
        Self {
            default_unit_id: 1,
            word_order: WordOrder::BigEndian,
            cip_session_timeout: Duration::from_secs(30),
            opcua_security_policy: None,
        }
    }
}

/// Circuit breaker thresholds (spec §4.4, §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Minimum requests observed in the rolling window before the breaker
    /// is eligible to trip.
    pub min_requests: u32,
    /// Failure ratio (0.0–1.0) within the window that trips the breaker.
    pub failure_ratio: f64,
    /// How long the breaker stays open before admitting trial requests.
    pub open_timeout: Duration,
    /// Number of trial requests admitted while half-open.
    pub max_trials: u32,
    /// Size of the rolling window, in most-recent requests.
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 10,
            failure_ratio: 0.5,
            open_timeout: Duration::from_secs(30),
            max_trials: 3,
            window_size: 64,
        }
    }
}

/// Batch scheduler behaviour (spec §4.5, §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_size: usize,
    pub min_size: usize,
    pub timeout: Duration,
    pub adaptive: bool,
    /// Bound on each per-(device, op-kind) pending queue; `enqueue` fails
    /// with `queue-full` past this.
    pub queue_capacity: usize,
    /// Deadline slack: a request whose deadline is within this of "now"
    /// forces an immediate flush of its queue.
    pub deadline_slack: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 64,
            min_size: 1,
            timeout: Duration::from_millis(5),
            adaptive: true,
            queue_capacity: 4096,
            deadline_slack: Duration::from_millis(2),
        }
    }
}

/// Top-level configuration consumed by the gateway core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Upper bound on total connections to one device.
    pub max_connections_per_device: usize,
    /// Process-wide upper bound on total connections across all devices.
    pub max_total_connections: usize,
    /// Dial + session-register deadline.
    pub connection_timeout: Duration,
    /// Close idle pooled connections older than this.
    pub idle_timeout: Duration,
    /// Pool health-check / staleness sweep cadence.
    pub health_check_interval: Duration,
    /// Deadline for a pool `acquire` to wait for a connection.
    pub acquire_timeout: Duration,
    pub breaker: BreakerConfig,
    pub batch: BatchConfig,
    /// Handler-level transient-error retry count.
    pub retry_count: u32,
    /// Delay between handler-level retries.
    pub retry_delay: Duration,
    /// Consecutive op failures in `Degraded` before a device is dropped to `Unconnected`.
    pub degraded_failure_limit: u32,
    /// Per-protocol knobs keyed by protocol id ("modbus", "cip", "opcua").
    pub protocol_defaults: HashMap<String, ProtocolDefaults>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut protocol_defaults = HashMap::new();
        protocol_defaults.insert("modbus".to_string(), ProtocolDefaults::default());
        protocol_defaults.insert("cip".to_string(), ProtocolDefaults::default());
        protocol_defaults.insert("opcua".to_string(), ProtocolDefaults::default());

        Self {
            max_connections_per_device: 4,
            max_total_connections: 256,
            connection_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
            acquire_timeout: Duration::from_millis(500),
            breaker: BreakerConfig::default(),
            batch: BatchConfig::default(),
            retry_count: 2,
            retry_delay: Duration::from_millis(50),
            degraded_failure_limit: 5,
            protocol_defaults,
        }
    }
}

impl GatewayConfig {
    /// Per-protocol defaults, falling back to the crate default if the
    /// caller's config didn't populate an entry for this protocol.
    pub fn protocol_defaults(&self, protocol: &str) -> ProtocolDefaults {
        self.protocol_defaults
            .get(protocol)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let cfg = GatewayConfig::default();
        assert!(cfg.max_connections_per_device <= cfg.max_total_connections);
        assert!(cfg.batch.min_size <= cfg.batch.max_size);
        assert!(cfg.breaker.failure_ratio > 0.0 && cfg.breaker.failure_ratio <= 1.0);
    }

    #[test]
    fn unknown_protocol_falls_back_to_default() {
        let cfg = GatewayConfig {
            protocol_defaults: HashMap::new(),
            ..GatewayConfig::default()
        };
        let defaults = cfg.protocol_defaults("modbus");
        assert_eq!(defaults.default_unit_id, 1);
    }
}
