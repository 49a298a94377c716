//! # Connection
//!
//! The narrowest abstraction in the stack (spec §4.2): open, close,
//! is-healthy, execute, stats. A `Connection` owns one socket and its
//! protocol's session bookkeeping (CIP session handle, Modbus unit id
//! default, OPC-UA secure-channel id); it is not thread-safe — the pool's
//! lease discipline is what prevents concurrent use (spec §4.2, §5).
//!
//! Concrete connections (`handler::modbus::ModbusConnection`, etc.) own the
//! wire parsing; this module only defines the shared contract and the
//! latency/use-count bookkeeping every implementation threads through.

use crate::error::Result;
use crate::value::DeviceId;
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Per-connection bookkeeping updated on every `execute` (spec §4.2:
/// "each operation MUST update last-used, increment use-count, and add its
/// wall-clock latency to a running sum").
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
    pub cumulative_latency: Duration,
}

impl ConnectionStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_used: now,
            use_count: 0,
            cumulative_latency: Duration::ZERO,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        self.last_used = Instant::now();
        self.use_count += 1;
        self.cumulative_latency += latency;
    }

    pub fn mean_latency(&self) -> Duration {
        if self.use_count == 0 {
            Duration::ZERO
        } else {
            self.cumulative_latency / self.use_count as u32
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A single live transport to one device (spec §4.2). Protocol-specific
/// request/response payloads are opaque bytes at this layer; the handler
/// that owns this connection type is the only thing that constructs or
/// interprets them.
#[async_trait]
pub trait Connection: Send {
    /// Dial and perform any protocol session handshake (CIP
    /// RegisterSession, etc). Called once, before the connection is handed
    /// to a pool.
    async fn open(&mut self) -> Result<()>;

    /// Tear down the session and close the socket (CIP UnregisterSession
    /// before FIN, etc).
    async fn close(&mut self) -> Result<()>;

    /// Must return false after any transport error or any protocol-level
    /// error considered fatal (spec §4.2). Never performs I/O.
    fn is_healthy(&self) -> bool;

    /// Send a pre-encoded protocol request and return the decoded
    /// response payload. Implementations update `stats()` and `is_healthy`
    /// as a side effect of this call.
    async fn execute(&mut self, request: &[u8]) -> Result<Vec<u8>>;

    fn stats(&self) -> ConnectionStats;

    fn device_id(&self) -> &DeviceId;
}

/// A factory that opens new connections for one device, invoked by the
/// pool on idle-queue miss (spec §4.3, step 2). Boxed so the pool can hold
/// one per device without needing to know the concrete protocol.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_record_updates_count_and_cumulative_latency() {
        let mut stats = ConnectionStats::new();
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(20));
        assert_eq!(stats.use_count, 2);
        assert_eq!(stats.cumulative_latency, Duration::from_millis(30));
        assert_eq!(stats.mean_latency(), Duration::from_millis(15));
    }

    #[test]
    fn fresh_stats_has_zero_mean_latency() {
        let stats = ConnectionStats::new();
        assert_eq!(stats.mean_latency(), Duration::ZERO);
    }
}
