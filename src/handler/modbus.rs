//! Modbus TCP protocol handler (spec §4.1, §4.2, §4.6, §6).
//!
//! Frame: `[transaction-id:2][protocol-id=0:2][length:2][unit-id:1]
//! [function-code:1][pdu...]`, big-endian. The connection type owns this
//! framing; the handler owns grouping, retries, and value codec.

use crate::address::modbus::{self, FunctionCode, ModbusAddress, ModbusException, ModbusTable, MAX_COILS_PER_READ, MAX_HOLDING_REGISTERS_PER_READ};
use crate::config::{GatewayConfig, WordOrder};
use crate::connection::{Connection, ConnectionFactory, ConnectionStats};
use crate::diagnostics::{DiagnosticsRegistry, DiagnosticsSnapshot};
use crate::error::{GatewayError, ProtocolErrorKind, Result};
use crate::handler::{apply_outcome, dedup_discovered, DeviceInfo, DeviceState, DiscoveredDevice, HandlerContext, ProtocolHandler};
use crate::scheduler::{BatchExecutor, BatchRequest, Op};
use crate::value::{DataType, Device, DeviceId, Protocol, Quality, Scalar, Tag, TagId, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const PROTOCOL_ID: u16 = 0;

/// A live TCP transport to one Modbus device (spec §4.2).
pub struct ModbusConnection {
    device_id: DeviceId,
    stream: TcpStream,
    transaction_id: AtomicU16,
    healthy: bool,
    stats: ConnectionStats,
    default_unit_id: u8,
}

impl ModbusConnection {
    async fn dial(device: &Device, default_unit_id: u8) -> Result<TcpStream> {
        let addr: SocketAddr = format!("{}:{}", device.address, device.port)
            .parse()
            .map_err(|e| GatewayError::TransportError(format!("bad socket address: {}", e)))?;
        let stream = TcpStream::connect(addr).await?;
        let sock_ref = socket2::SockRef::from(&stream);
        sock_ref.set_nodelay(true).ok();
        Ok(stream)
    }

    /// `request` is `[function_code, ...pdu_data]`; the default unit id is
    /// used for every request (spec §4.2 notes unit id is per-request, but
    /// this gateway applies one default per device, matching the common
    /// RTU-over-TCP bridge deployment).
    async fn send_pdu(&mut self, function_code: u8, data: &[u8]) -> Result<Vec<u8>> {
        let txn_id = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        let length = (2 + data.len()) as u16; // unit-id + function-code + data
        let mut frame = Vec::with_capacity(7 + 1 + data.len());
        frame.extend_from_slice(&txn_id.to_be_bytes());
        frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(self.default_unit_id);
        frame.push(function_code);
        frame.extend_from_slice(data);

        if self.stream.write_all(&frame).await.is_err() {
            self.healthy = false;
            return Err(GatewayError::TransportError("write failed".into()));
        }

        let mut header = [0u8; 7];
        if self.stream.read_exact(&mut header).await.is_err() {
            self.healthy = false;
            return Err(GatewayError::TransportError("read header failed".into()));
        }
        let resp_txn = u16::from_be_bytes([header[0], header[1]]);
        let resp_len = u16::from_be_bytes([header[4], header[5]]);
        if resp_txn != txn_id {
            self.healthy = false;
            return Err(GatewayError::SessionLost("transaction id mismatch".into()));
        }
        let remaining = (resp_len as usize).saturating_sub(2); // minus unit-id/function-code already counted below
        let mut body = vec![0u8; remaining + 1]; // function code + pdu
        if self.stream.read_exact(&mut body).await.is_err() {
            self.healthy = false;
            return Err(GatewayError::TransportError("read body failed".into()));
        }
        let resp_function = body[0];
        if resp_function & 0x80 != 0 {
            let exception_code = *body.get(1).unwrap_or(&0);
            let exception = ModbusException::from_code(exception_code);
            let recoverable = exception.map(|e| e.is_recoverable()).unwrap_or(false);
            return Err(GatewayError::ProtocolError {
                kind: if recoverable { ProtocolErrorKind::Recoverable } else { ProtocolErrorKind::Permanent },
                message: format!("exception {:#04x}", exception_code),
            });
        }
        Ok(body[1..].to_vec())
    }
}

#[async_trait]
impl Connection for ModbusConnection {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    async fn execute(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let started = Instant::now();
        let function_code = *request.first().ok_or_else(|| GatewayError::TransportError("empty request".into()))?;
        let result = self.send_pdu(function_code, &request[1..]).await;
        self.stats.record(started.elapsed());
        result
    }

    fn stats(&self) -> ConnectionStats {
        self.stats
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

pub struct ModbusConnectionFactory {
    device: Device,
    default_unit_id: u8,
}

impl ModbusConnectionFactory {
    pub fn new(device: Device, default_unit_id: u8) -> Self {
        Self { device, default_unit_id }
    }
}

#[async_trait]
impl ConnectionFactory for ModbusConnectionFactory {
    async fn open(&self) -> Result<Box<dyn Connection>> {
        let stream = ModbusConnection::dial(&self.device, self.default_unit_id).await?;
        Ok(Box::new(ModbusConnection {
            device_id: self.device.id.clone(),
            stream,
            transaction_id: AtomicU16::new(0),
            healthy: true,
            stats: ConnectionStats::new(),
            default_unit_id: self.default_unit_id,
        }))
    }
}

fn build_read_request(table: ModbusTable, start: u16, quantity: u16) -> (u8, Vec<u8>) {
    let mut data = Vec::with_capacity(4);
    data.extend_from_slice(&start.to_be_bytes());
    data.extend_from_slice(&quantity.to_be_bytes());
    (FunctionCode::read_for(table).code(), data)
}

fn decode_read_response(body: &[u8], table: ModbusTable, quantity: u16) -> Result<Vec<u16>> {
    let byte_count = *body.first().unwrap_or(&0) as usize;
    let payload = &body[1..];
    if payload.len() < byte_count {
        return Err(GatewayError::ProtocolError {
            kind: ProtocolErrorKind::Permanent,
            message: "response shorter than advertised byte count".into(),
        });
    }
    match table {
        ModbusTable::Coil | ModbusTable::DiscreteInput => {
            let mut bits = Vec::with_capacity(quantity as usize);
            for i in 0..quantity as usize {
                let byte = payload[i / 8];
                let bit = (byte >> (i % 8)) & 1;
                bits.push(bit as u16);
            }
            Ok(bits)
        }
        ModbusTable::InputRegister | ModbusTable::HoldingRegister => {
            Ok(payload.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
        }
    }
}

/// Concrete Modbus TCP protocol handler (spec §4.6).
pub struct ModbusHandler {
    ctx: Arc<HandlerContext>,
    gateway_config: Arc<GatewayConfig>,
}

impl ModbusHandler {
    pub fn new(ctx: Arc<HandlerContext>, gateway_config: Arc<GatewayConfig>) -> Self {
        Self { ctx, gateway_config }
    }

    fn word_order(&self, _device: &Device) -> WordOrder {
        self.gateway_config.protocol_defaults(Protocol::Modbus.id()).word_order
    }

    fn default_unit_id(&self, _device: &Device) -> u8 {
        self.gateway_config.protocol_defaults(Protocol::Modbus.id()).default_unit_id
    }

    fn factory_for(&self, device: &Device) -> ModbusConnectionFactory {
        ModbusConnectionFactory::new(device.clone(), self.default_unit_id(device))
    }

    async fn read_single(&self, device: &Device, tag: &Tag) -> Result<Value> {
        let addr = modbus::parse(&tag.address)?;
        let count = tag.data_type.modbus_register_count();
        let pool = self.ctx.pools.pool_for(&device.id).await;
        let breaker = self.ctx.breakers.breaker_for(&device.id);
        let factory = self.factory_for(device);
        let diagnostics = self.ctx.diagnostics.for_device(&device.id);

        if breaker.allow().is_err() {
            return Err(GatewayError::BreakerOpen {
                device_id: device.id.to_string(),
            });
        }

        let mut conn = pool.acquire(&factory).await?;
        let (fc, data) = build_read_request(addr.table, addr.wire_offset, count.max(1));
        let started = Instant::now();
        let result = conn.execute(&[&[fc][..], &data[..]].concat()).await;
        let value = match result {
            Ok(body) => {
                let registers = decode_read_response(&body, addr.table, count.max(1))?;
                let word_order = self.word_order(device);
                let scalar = if matches!(addr.table, ModbusTable::Coil | ModbusTable::DiscreteInput) {
                    Scalar::Bool(registers[0] != 0)
                } else {
                    modbus::decode_registers(&registers, tag.data_type, word_order)?
                };
                breaker.record(true);
                diagnostics.record_success(started.elapsed());
                Ok(Value::good(scalar))
            }
            Err(e) => {
                if breaker.record(!e.counts_against_breaker()) {
                    diagnostics.record_breaker_trip();
                }
                diagnostics.record_error(&format!("{}", e), "read", &tag.address);
                Err(e)
            }
        };
        pool.release(conn).await;
        value
    }
}

#[async_trait]
impl ProtocolHandler for ModbusHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Modbus
    }

    async fn connect(&self, device: &Device) -> Result<()> {
        self.ctx.set_state(&device.id, DeviceState::Connecting);
        let pool = self.ctx.pools.pool_for(&device.id).await;
        let factory = self.factory_for(device);
        match pool.acquire(&factory).await {
            Ok(conn) => {
                pool.release(conn).await;
                self.ctx.set_state(&device.id, DeviceState::Connected);
                Ok(())
            }
            Err(e) => {
                self.ctx.set_state(&device.id, DeviceState::Unconnected);
                Err(e)
            }
        }
    }

    async fn disconnect(&self, device: &Device) -> Result<()> {
        self.ctx.set_state(&device.id, DeviceState::Unconnected);
        Ok(())
    }

    async fn is_connected(&self, device: &Device) -> bool {
        self.ctx.state_of(&device.id) == DeviceState::Connected
    }

    async fn read_tag(&self, device: &Device, tag: &Tag) -> Result<Value> {
        let result = self.ctx.with_retry(|| self.read_single(device, tag)).await;
        apply_outcome(&self.ctx, &device.id, &result);
        result
    }

    async fn write_tag(&self, device: &Device, tag: &Tag, value: Scalar) -> Result<()> {
        let addr = modbus::parse(&tag.address)?;
        if !addr.table.is_writable() || !tag.writable {
            return Err(GatewayError::UnwritableAddress {
                address: tag.address.clone(),
            });
        }

        let pool = self.ctx.pools.pool_for(&device.id).await;
        let breaker = self.ctx.breakers.breaker_for(&device.id);
        let factory = self.factory_for(device);
        let diagnostics = self.ctx.diagnostics.for_device(&device.id);
        let word_order = self.word_order(device);

        let result: Result<()> = self
            .ctx
            .with_retry(|| async {
                if breaker.allow().is_err() {
                    return Err(GatewayError::BreakerOpen {
                        device_id: device.id.to_string(),
                    });
                }
                let mut conn = pool.acquire(&factory).await?;

                let (fc, data) = match addr.table {
                    ModbusTable::Coil => {
                        let Scalar::Bool(on) = value else {
                            pool.release(conn).await;
                            return Err(GatewayError::TypeMismatch {
                                data_type: "Bool".into(),
                                reason: "coil writes require a bool value".into(),
                            });
                        };
                        let mut d = addr.wire_offset.to_be_bytes().to_vec();
                        d.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
                        (FunctionCode::WriteSingleCoil.code(), d)
                    }
                    ModbusTable::HoldingRegister => {
                        let registers = modbus::encode_registers(value, word_order);
                        if registers.len() == 1 {
                            let mut d = addr.wire_offset.to_be_bytes().to_vec();
                            d.extend_from_slice(&registers[0].to_be_bytes());
                            (FunctionCode::WriteSingleRegister.code(), d)
                        } else {
                            let mut d = addr.wire_offset.to_be_bytes().to_vec();
                            d.extend_from_slice(&(registers.len() as u16).to_be_bytes());
                            d.push((registers.len() * 2) as u8);
                            for r in &registers {
                                d.extend_from_slice(&r.to_be_bytes());
                            }
                            (FunctionCode::WriteMultipleRegisters.code(), d)
                        }
                    }
                    _ => unreachable!("is_writable() already excluded this table"),
                };

                let started = Instant::now();
                let op_result = conn.execute(&[&[fc][..], &data[..]].concat()).await;
                match &op_result {
                    Ok(_) => {
                        breaker.record(true);
                        diagnostics.record_success(started.elapsed());
                    }
                    Err(e) => {
                        if breaker.record(!e.counts_against_breaker()) {
                            diagnostics.record_breaker_trip();
                        }
                        diagnostics.record_error(&format!("{}", e), "write", &tag.address);
                    }
                }
                pool.release(conn).await;
                op_result.map(|_| ())
            })
            .await;
        apply_outcome(&self.ctx, &device.id, &result);
        result
    }

    async fn read_multiple(&self, device: &Device, tags: &[Tag]) -> HashMap<TagId, Result<Value>> {
        let mut out = HashMap::with_capacity(tags.len());
        for tag in tags {
            out.insert(tag.id.clone(), self.read_tag(device, tag).await);
        }
        out
    }

    async fn discover(&self, network_range: &str, deadline: Duration) -> Vec<DiscoveredDevice> {
        // Trivial-read liveness probe per spec §6: dial TCP 502 and issue a
        // one-register FC3 read against each candidate host; any well-formed
        // reply (including an exception) proves a Modbus stack is listening.
        // `network_range` is a comma-separated list of `host` or `host:port`
        // candidates; a full subnet sweep is a front-end/provisioning
        // concern, out of scope here (spec §1).
        let candidates: Vec<String> = network_range.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        let overall_deadline = tokio::time::Instant::now() + deadline;
        let mut found = Vec::new();

        for candidate in candidates {
            let remaining = overall_deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let addr_str = if candidate.contains(':') { candidate.clone() } else { format!("{}:502", candidate) };
            let Ok(addr) = addr_str.parse::<SocketAddr>() else {
                continue;
            };
            let per_host_timeout = remaining.min(Duration::from_millis(200));
            let default_unit_id = self.gateway_config.protocol_defaults(Protocol::Modbus.id()).default_unit_id;
            let probe = async {
                let mut stream = TcpStream::connect(addr).await?;
                let sock_ref = socket2::SockRef::from(&stream);
                sock_ref.set_nodelay(true).ok();
                let mut frame = Vec::with_capacity(12);
                frame.extend_from_slice(&0u16.to_be_bytes()); // transaction id
                frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
                frame.extend_from_slice(&6u16.to_be_bytes()); // unit-id + fc + start + quantity
                frame.push(default_unit_id);
                frame.push(FunctionCode::ReadHoldingRegisters.code());
                frame.extend_from_slice(&0u16.to_be_bytes());
                frame.extend_from_slice(&1u16.to_be_bytes());
                stream.write_all(&frame).await?;
                let mut header = [0u8; 7];
                stream.read_exact(&mut header).await?;
                Ok::<(), GatewayError>(())
            };
            if tokio::time::timeout(per_host_timeout, probe).await.map(|r| r.is_ok()).unwrap_or(false) {
                found.push(DiscoveredDevice {
                    protocol: Protocol::Modbus,
                    address: addr.ip().to_string(),
                    port: addr.port(),
                    info: DeviceInfo::default(),
                });
            }
        }

        dedup_discovered(found)
    }

    async fn device_info(&self, _device: &Device) -> Result<DeviceInfo> {
        Ok(DeviceInfo::default())
    }

    fn supported_types(&self) -> &'static [DataType] {
        &[
            DataType::Bool,
            DataType::Int16,
            DataType::UInt16,
            DataType::Int32,
            DataType::UInt32,
            DataType::Float32,
            DataType::Int64,
            DataType::UInt64,
            DataType::Float64,
        ]
    }

    fn validate_address(&self, address: &str) -> bool {
        modbus::parse(address).is_ok()
    }

    async fn ping(&self, device: &Device) -> Result<()> {
        let pool = self.ctx.pools.pool_for(&device.id).await;
        let factory = self.factory_for(device);
        let conn = pool.acquire(&factory).await?;
        pool.release(conn).await;
        Ok(())
    }

    fn diagnostics(&self, device_id: &DeviceId) -> DiagnosticsSnapshot {
        self.ctx.diagnostics.for_device(device_id).snapshot()
    }

    fn as_batch_executor(&self) -> &dyn BatchExecutor {
        self
    }
}

#[async_trait]
impl BatchExecutor for ModbusHandler {
    fn can_batch(&self, a: &BatchRequest, b: &BatchRequest) -> bool {
        if a.device_id != b.device_id || a.op_kind() != b.op_kind() {
            return false;
        }
        let (Ok(addr_a), Ok(addr_b)) = (modbus::parse(&a.tag.address), modbus::parse(&b.tag.address)) else {
            return false;
        };
        addr_a.table == addr_b.table && addr_a.table == ModbusTable::HoldingRegister
    }

    fn max_wire_batch(&self) -> usize {
        MAX_HOLDING_REGISTERS_PER_READ as usize
    }

    async fn execute_batch(
        &self,
        conn: &mut dyn Connection,
        batch: Vec<BatchRequest>,
    ) -> std::result::Result<(), (Vec<BatchRequest>, GatewayError)> {
        // Only contiguous holding-register reads are coalesced (spec
        // §4.5); anything else falls straight back to per-request.
        let mut parsed: Vec<(ModbusAddress, &BatchRequest)> = Vec::with_capacity(batch.len());
        for req in &batch {
            match modbus::parse(&req.tag.address) {
                Ok(a) if a.table == ModbusTable::HoldingRegister && matches!(req.op, Op::Read) => parsed.push((a, req)),
                _ => return Err((batch, GatewayError::InvalidAddress {
                    address: "batch".into(),
                    reason: "not a homogeneous holding-register read batch".into(),
                })),
            }
        }
        let min = parsed.iter().map(|(a, _)| a.wire_offset).min().unwrap();
        let max = parsed.iter().map(|(a, r)| a.wire_offset + r.tag.data_type.modbus_register_count()).max().unwrap();
        let span = max - min;
        if span > MAX_HOLDING_REGISTERS_PER_READ {
            return Err((batch, GatewayError::ProtocolError {
                kind: ProtocolErrorKind::Permanent,
                message: "batch span exceeds 125 registers".into(),
            }));
        }

        let (fc, data) = build_read_request(ModbusTable::HoldingRegister, min, span);
        let body = match conn.execute(&[&[fc][..], &data[..]].concat()).await {
            Ok(b) => b,
            Err(e) => return Err((batch, e)),
        };
        let registers = match decode_read_response(&body, ModbusTable::HoldingRegister, span) {
            Ok(r) => r,
            Err(e) => return Err((batch, e)),
        };

        for req in batch {
            let addr = modbus::parse(&req.tag.address).expect("validated above");
            let offset = (addr.wire_offset - min) as usize;
            let count = req.tag.data_type.modbus_register_count() as usize;
            if offset + count > registers.len() {
                req.resolve(Err(GatewayError::ProtocolError {
                    kind: ProtocolErrorKind::Permanent,
                    message: "illegal-data-address".into(),
                }));
                continue;
            }
            let scalar = modbus::decode_registers(&registers[offset..offset + count], req.tag.data_type, req.word_order);
            req.resolve(scalar.map(Value::good));
        }
        Ok(())
    }

    async fn execute_one(&self, conn: &mut dyn Connection, request: &BatchRequest) -> Result<Value> {
        let addr = modbus::parse(&request.tag.address)?;
        match request.op {
            Op::Read => {
                let count = request.tag.data_type.modbus_register_count().max(1);
                let (fc, data) = build_read_request(addr.table, addr.wire_offset, count);
                conn.execute(&[&[fc][..], &data[..]].concat()).await.and_then(|body| {
                    let registers = decode_read_response(&body, addr.table, count)?;
                    if matches!(addr.table, ModbusTable::Coil | ModbusTable::DiscreteInput) {
                        Ok(Value::good(Scalar::Bool(registers[0] != 0)))
                    } else {
                        modbus::decode_registers(&registers, request.tag.data_type, request.word_order).map(Value::good)
                    }
                })
            }
            Op::Write(scalar) => {
                if !addr.table.is_writable() {
                    return Err(GatewayError::UnwritableAddress {
                        address: request.tag.address.clone(),
                    });
                }
                let registers = modbus::encode_registers(scalar, request.word_order);
                let mut data = addr.wire_offset.to_be_bytes().to_vec();
                data.extend_from_slice(&registers[0].to_be_bytes());
                conn.execute(&[&[FunctionCode::WriteSingleRegister.code()][..], &data[..]].concat())
                    .await
                    .map(|_| Value::good(scalar))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_read_response_unpacks_holding_registers() {
        let body = vec![4, 0x0B, 0xAA, 0x00, 0x01];
        let regs = decode_read_response(&body, ModbusTable::HoldingRegister, 2).unwrap();
        assert_eq!(regs, vec![0x0BAA, 0x0001]);
    }

    #[test]
    fn decode_read_response_unpacks_coil_bits() {
        let body = vec![1, 0b0000_0101];
        let bits = decode_read_response(&body, ModbusTable::Coil, 3).unwrap();
        assert_eq!(bits, vec![1, 0, 1]);
    }

    #[test]
    fn build_read_request_encodes_start_and_quantity() {
        let (fc, data) = build_read_request(ModbusTable::HoldingRegister, 99, 1);
        assert_eq!(fc, FunctionCode::ReadHoldingRegisters.code());
        assert_eq!(data, vec![0x00, 0x63, 0x00, 0x01]);
    }
}
