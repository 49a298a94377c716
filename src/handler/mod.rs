//! # Protocol Handler (Facade)
//!
//! The northbound contract every concrete protocol implements (spec §4.6).
//! Concrete handlers own wire parsing; this facade owns pooling, breaker,
//! batching, and diagnostics — modelled on the teacher's
//! `ipc::IpcTransport` trait plus `TransportFactory`, generalised from "one
//! transport mechanism" to "one protocol handler, looked up by id in a
//! registry" (spec §9 "dynamic dispatch").

pub mod cip;
pub mod modbus;
pub mod opcua;

use crate::breaker::BreakerRegistry;
use crate::diagnostics::{DiagnosticsRegistry, DiagnosticsSnapshot};
use crate::error::{GatewayError, Result};
use crate::pool::PoolRegistry;
use crate::scheduler::{BatchExecutor, BatchScheduler};
use crate::value::{DataType, Device, DeviceId, Protocol, Tag, TagId, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-device connection/session state (spec §4.6 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unconnected,
    Connecting,
    Connected,
    Degraded,
    ConnectedAfterRetry,
}

/// Vendor/model identity reported by a device (spec §4.6 `device-info`).
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub capabilities: Vec<String>,
    pub max_connections: Option<usize>,
}

/// A device found during `discover()` (spec §4.6, §6, §11).
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    pub info: DeviceInfo,
}

/// The protocol-neutral facade presented to northbound code (spec §4.6).
/// `BatchExecutor` is a supertrait: every handler also knows how to group
/// and execute the batches the scheduler hands it.
#[async_trait]
pub trait ProtocolHandler: BatchExecutor {
    fn protocol(&self) -> Protocol;

    async fn connect(&self, device: &Device) -> Result<()>;
    async fn disconnect(&self, device: &Device) -> Result<()>;
    async fn is_connected(&self, device: &Device) -> bool;

    async fn read_tag(&self, device: &Device, tag: &Tag) -> Result<Value>;
    async fn write_tag(&self, device: &Device, tag: &Tag, value: crate::value::Scalar) -> Result<()>;

    /// Every requested tag gets an entry; a per-tag failure never fails the
    /// whole call (spec §4.6 Outputs).
    async fn read_multiple(&self, device: &Device, tags: &[Tag]) -> HashMap<TagId, Result<Value>>;

    async fn discover(&self, network_range: &str, deadline: Duration) -> Vec<DiscoveredDevice>;
    async fn device_info(&self, device: &Device) -> Result<DeviceInfo>;
    fn supported_types(&self) -> &'static [DataType];
    fn validate_address(&self, address: &str) -> bool;
    async fn ping(&self, device: &Device) -> Result<()>;
    fn diagnostics(&self, device_id: &DeviceId) -> DiagnosticsSnapshot;

    /// Upcast to the `BatchExecutor` seam the scheduler depends on. Trivial
    /// in every implementor (`{ self }`) — a workaround for this MSRV not
    /// having trait-object upcasting, needed wherever code only holds a
    /// `dyn ProtocolHandler` and must hand it to `dispatch_once`.
    fn as_batch_executor(&self) -> &dyn BatchExecutor;
}

/// Per-device state, retry counters, and shared registries threaded
/// through every concrete handler (spec §4.6 state machine, §9 global
/// state).
pub struct HandlerContext {
    pub pools: Arc<PoolRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub diagnostics: Arc<DiagnosticsRegistry>,
    pub scheduler: Arc<BatchScheduler>,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub degraded_failure_limit: u32,
    states: Mutex<HashMap<DeviceId, (DeviceState, u32)>>,
}

impl HandlerContext {
    pub fn new(
        pools: Arc<PoolRegistry>,
        breakers: Arc<BreakerRegistry>,
        diagnostics: Arc<DiagnosticsRegistry>,
        scheduler: Arc<BatchScheduler>,
        retry_count: u32,
        retry_delay: Duration,
        degraded_failure_limit: u32,
    ) -> Self {
        Self {
            pools,
            breakers,
            diagnostics,
            scheduler,
            retry_count,
            retry_delay,
            degraded_failure_limit,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_of(&self, device_id: &DeviceId) -> DeviceState {
        self.states.lock().get(device_id).map(|(s, _)| *s).unwrap_or(DeviceState::Unconnected)
    }

    pub fn set_state(&self, device_id: &DeviceId, state: DeviceState) {
        let mut states = self.states.lock();
        let entry = states.entry(device_id.clone()).or_insert((DeviceState::Unconnected, 0));
        entry.0 = state;
        if state != DeviceState::Degraded {
            entry.1 = 0;
        }
    }

    /// Per spec §4.6: `Degraded` → `Unconnected` after N consecutive
    /// failures.
    pub fn record_degraded_failure(&self, device_id: &DeviceId) -> DeviceState {
        let mut states = self.states.lock();
        let entry = states.entry(device_id.clone()).or_insert((DeviceState::Degraded, 0));
        entry.0 = DeviceState::Degraded;
        entry.1 += 1;
        if entry.1 >= self.degraded_failure_limit {
            entry.0 = DeviceState::Unconnected;
            entry.1 = 0;
        }
        entry.0
    }

    /// Runs `op`, retrying up to `retry_count` times with `retry_delay` on
    /// retryable errors (spec §4.6 "failure semantics"). Address/type
    /// errors are never retried since `GatewayError::is_retryable` is
    /// false for them.
    pub async fn with_retry<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.retry_count => {
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Applies an operation's outcome to the device state machine (spec §4.6):
/// success promotes straight to `Connected`; a transport/session failure is
/// fatal and drops the device to `Unconnected` immediately; any other
/// retryable error is a transient hiccup that only demotes the device after
/// `degraded_failure_limit` consecutive occurrences; non-retryable
/// address/type errors never move the state machine, since they say nothing
/// about reachability.
pub fn apply_outcome<T>(ctx: &HandlerContext, device_id: &DeviceId, result: &Result<T>) {
    match result {
        Ok(_) => ctx.set_state(device_id, DeviceState::Connected),
        Err(GatewayError::TransportError(_)) | Err(GatewayError::SessionLost(_)) => {
            ctx.set_state(device_id, DeviceState::Unconnected);
        }
        Err(e) if e.is_retryable() => {
            ctx.record_degraded_failure(device_id);
        }
        Err(_) => {}
    }
}

/// Deduplicates discovery hits by `(protocol, address, port)` (spec §11):
/// a multicast probe and a broadcast probe can both see the same device.
pub fn dedup_discovered(devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
    let mut seen = std::collections::HashSet::new();
    devices.into_iter().filter(|d| seen.insert((d.protocol, d.address.clone(), d.port))).collect()
}

/// Process-global registry mapping `device.protocol` to its handler (spec
/// §9 "dynamic dispatch": adding a protocol means registering a new
/// variant, not modifying the core).
pub struct HandlerRegistry {
    handlers: HashMap<Protocol, Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(handler.protocol(), handler);
    }

    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(&protocol).cloned()
    }

    pub fn for_device(&self, device: &Device) -> Result<Arc<dyn ProtocolHandler>> {
        self.get(device.protocol).ok_or_else(|| GatewayError::InvalidAddress {
            address: device.id.to_string(),
            reason: format!("no handler registered for protocol {}", device.protocol),
        })
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_drops_to_unconnected_after_limit() {
        let ctx = HandlerContext::new(
            Arc::new(PoolRegistry::new(4, 256, Duration::from_secs(60), Duration::from_millis(500))),
            Arc::new(BreakerRegistry::new(10, 0.5, Duration::from_secs(30), 3, 64)),
            Arc::new(DiagnosticsRegistry::new()),
            Arc::new(BatchScheduler::new(crate::config::BatchConfig::default())),
            2,
            Duration::from_millis(10),
            3,
        );
        let device_id = DeviceId::from("dev-1");
        ctx.set_state(&device_id, DeviceState::Degraded);
        assert_eq!(ctx.record_degraded_failure(&device_id), DeviceState::Degraded);
        assert_eq!(ctx.record_degraded_failure(&device_id), DeviceState::Degraded);
        assert_eq!(ctx.record_degraded_failure(&device_id), DeviceState::Unconnected);
    }
}
