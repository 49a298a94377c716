//! # Gateway Core
//!
//! Ties the device registry, pool/breaker/diagnostics registries, batch
//! scheduler, and handler registry into one process-global object (spec §9
//! "global state", §5 "one long-lived scheduler task per (device, op-kind)
//! queue"), mirroring how the teacher's `main.rs` wires `BenchmarkConfig`,
//! `ResultsManager`, and per-mechanism runners together rather than passing
//! loose arguments between free functions.

use crate::breaker::BreakerRegistry;
use crate::config::{GatewayConfig, WordOrder};
use crate::connection::ConnectionFactory;
use crate::diagnostics::{DiagnosticsRegistry, DiagnosticsSnapshot};
use crate::error::{GatewayError, Result};
use crate::handler::cip::CipHandler;
use crate::handler::modbus::ModbusHandler;
use crate::handler::opcua::OpcUaHandler;
use crate::handler::{HandlerContext, HandlerRegistry, ProtocolHandler};
use crate::pool::PoolRegistry;
use crate::registry::DeviceRegistry;
use crate::scheduler::{BatchRequest, BatchScheduler, Op, OpKind};
use crate::value::{Device, DeviceId, Protocol, Scalar, Tag, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Process-global gateway state (spec §9). One instance per running
/// process; every device, pool, breaker, and handler hangs off this.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    devices: Arc<DeviceRegistry>,
    pools: Arc<PoolRegistry>,
    breakers: Arc<BreakerRegistry>,
    diagnostics: Arc<DiagnosticsRegistry>,
    scheduler: Arc<BatchScheduler>,
    handlers: Arc<HandlerRegistry>,
    ctx: Arc<HandlerContext>,
    dispatch_tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        let pools = Arc::new(PoolRegistry::new(
            config.max_connections_per_device,
            config.max_total_connections,
            config.idle_timeout,
            config.acquire_timeout,
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.min_requests,
            config.breaker.failure_ratio,
            config.breaker.open_timeout,
            config.breaker.max_trials,
            config.breaker.window_size,
        ));
        let diagnostics = Arc::new(DiagnosticsRegistry::new());
        let scheduler = Arc::new(BatchScheduler::new(config.batch));

        let ctx = Arc::new(HandlerContext::new(
            pools.clone(),
            breakers.clone(),
            diagnostics.clone(),
            scheduler.clone(),
            config.retry_count,
            config.retry_delay,
            config.degraded_failure_limit,
        ));

        let mut handlers = HandlerRegistry::new();
        handlers.register(Arc::new(ModbusHandler::new(ctx.clone(), config.clone())));
        handlers.register(Arc::new(CipHandler::new(ctx.clone(), config.clone())));
        handlers.register(Arc::new(OpcUaHandler::new(ctx.clone(), config.clone())));

        Self {
            config,
            devices: Arc::new(DeviceRegistry::new()),
            pools,
            breakers,
            diagnostics,
            scheduler,
            handlers: Arc::new(handlers),
            ctx,
            dispatch_tasks: Vec::new(),
        }
    }

    pub fn register_device(&self, device: Device) {
        self.devices.insert(device);
    }

    pub fn handler_for(&self, device: &Device) -> Result<Arc<dyn ProtocolHandler>> {
        self.handlers.for_device(device)
    }

    pub fn diagnostics(&self, device_id: &DeviceId) -> DiagnosticsSnapshot {
        self.diagnostics.for_device(device_id).snapshot()
    }

    /// Connects to every registered device up front (spec §4.6 `connect`),
    /// logging but not failing the whole startup on a single device that's
    /// unreachable — a device that starts `Unconnected` will simply retry
    /// on its first operation.
    pub async fn connect_all(&self) {
        for device in self.devices.all() {
            let handler = match self.handlers.for_device(&device) {
                Ok(h) => h,
                Err(e) => {
                    warn!(device_id = %device.id, %e, "no handler registered, skipping connect");
                    continue;
                }
            };
            if let Err(e) = handler.connect(&device).await {
                warn!(device_id = %device.id, %e, "initial connect failed, device starts unconnected");
            } else {
                info!(device_id = %device.id, "connected");
            }
        }
    }

    /// Word order to encode/decode a device's multi-register numeric values
    /// with (spec §4.1), resolved from the device's protocol defaults.
    /// Falls back to the Modbus default if the device isn't registered,
    /// since a request for an unregistered device fails at `enqueue`
    /// anyway once it reaches the handler lookup.
    fn word_order_for(&self, device_id: &DeviceId) -> WordOrder {
        let protocol = self.devices.get(device_id).map(|d| d.protocol).unwrap_or(Protocol::Modbus);
        self.config.protocol_defaults(protocol.id()).word_order
    }

    /// Submits one tag read through the batch scheduler (spec §4.5) rather
    /// than calling the handler directly, so concurrent reads against the
    /// same device get coalesced.
    pub async fn enqueue_read(&self, device_id: &DeviceId, tag: Tag, priority: i32, deadline: Duration) -> Result<Value> {
        let word_order = self.word_order_for(device_id);
        let (request, rx) = BatchRequest::new(device_id.clone(), tag, Op::Read, tokio::time::Instant::now() + deadline, priority, self.scheduler.next_sequence(), word_order);
        self.scheduler.enqueue(request).await?;
        rx.await.map_err(|_| GatewayError::SessionLost("dispatch task dropped the response channel".into()))?
    }

    pub async fn enqueue_write(&self, device_id: &DeviceId, tag: Tag, value: Scalar, priority: i32, deadline: Duration) -> Result<Value> {
        let word_order = self.word_order_for(device_id);
        let (request, rx) = BatchRequest::new(device_id.clone(), tag, Op::Write(value), tokio::time::Instant::now() + deadline, priority, self.scheduler.next_sequence(), word_order);
        self.scheduler.enqueue(request).await?;
        rx.await.map_err(|_| GatewayError::SessionLost("dispatch task dropped the response channel".into()))?
    }

    /// Spawns one long-lived dispatch loop per (device, op-kind) pair
    /// currently registered (spec §5). New devices registered after this
    /// call won't get a loop until `spawn_dispatch_loops` is called again —
    /// acceptable for the demo binary, where the device set is fixed at
    /// startup.
    pub fn spawn_dispatch_loops(&mut self) {
        let core_count = core_affinity::get_core_ids().map(|ids| ids.len()).unwrap_or(0);
        let mut next_core = 0usize;

        for device in self.devices.all() {
            let Ok(handler) = self.handlers.for_device(&device) else {
                continue;
            };
            for op_kind in [OpKind::Read, OpKind::Write] {
                let scheduler = self.scheduler.clone();
                let breakers = self.breakers.clone();
                let pools = self.pools.clone();
                let device_id = device.id.clone();
                let device_clone = device.clone();
                let handler = handler.clone();
                let config = self.config.clone();
                let ctx = self.ctx.clone();
                let poll_interval = config.batch.timeout;
                let core_id = if core_count > 0 {
                    let id = next_core % core_count;
                    next_core += 1;
                    Some(id)
                } else {
                    None
                };

                let task = tokio::spawn(async move {
                    let breaker = breakers.breaker_for(&device_id);
                    let pool = pools.pool_for(&device_id).await;
                    let factory = factory_for(&device_clone, &config);
                    let dispatch_loop: std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>> = Box::pin(async move {
                        loop {
                            crate::scheduler::dispatch_once(
                                &scheduler,
                                &device_id,
                                op_kind,
                                handler.as_batch_executor(),
                                breaker.as_ref(),
                                pool.as_ref(),
                                factory.as_ref(),
                                ctx.as_ref(),
                            )
                            .await;
                            tokio::time::sleep(poll_interval).await;
                        }
                    });
                    if let Err(e) = crate::utils::spawn_with_affinity(dispatch_loop, core_id).await {
                        warn!(%e, "dispatch loop exited");
                    }
                });
                self.dispatch_tasks.push(task);
            }
        }
    }

    pub fn shutdown(&mut self) {
        for task in self.dispatch_tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds the right `ConnectionFactory` for a device's protocol. The
/// dispatch loop needs its own factory to hand `dispatch_once`, built the
/// same way each handler builds its private one.
fn factory_for(device: &Device, config: &GatewayConfig) -> Box<dyn ConnectionFactory> {
    use crate::handler::cip::CipConnectionFactory;
    use crate::handler::modbus::ModbusConnectionFactory;
    use crate::handler::opcua::OpcUaConnectionFactory;

    match device.protocol {
        Protocol::Modbus => {
            let default_unit_id = config.protocol_defaults(Protocol::Modbus.id()).default_unit_id;
            Box::new(ModbusConnectionFactory::new(device.clone(), default_unit_id))
        }
        Protocol::Cip => Box::new(CipConnectionFactory::new(device.clone())),
        Protocol::OpcUa => Box::new(OpcUaConnectionFactory::new(device.clone())),
    }
}
