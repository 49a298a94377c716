//! OPC-UA protocol handler (spec §4.1, §4.2, §4.6, §6).
//!
//! Secure-channel binary framing: a message header
//! `[message-type:3][chunk-type:1][message-size:4]` followed by a
//! type-specific body. `HEL`/`ACK` establish the transport connection;
//! `OPN`/`CLO` manage the secure channel (this gateway only speaks the
//! `None` security policy); `MSG` carries service requests. Default port
//! 4840.

use crate::address::opcua::{self, IdentifierKind, OpcUaNodeId};
use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionFactory, ConnectionStats};
use crate::diagnostics::DiagnosticsSnapshot;
use crate::error::{GatewayError, ProtocolErrorKind, Result};
use crate::handler::{apply_outcome, dedup_discovered, DeviceInfo, DeviceState, DiscoveredDevice, HandlerContext, ProtocolHandler};
use crate::scheduler::{BatchExecutor, BatchRequest, Op};
use crate::value::{DataType, Device, DeviceId, Protocol, Scalar, Tag, TagId, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const OPC_UA_DEFAULT_PORT: u16 = 4840;
const DEFAULT_BUFFER_SIZE: u32 = 65536;

fn message_header(message_type: &[u8; 3], chunk_type: u8, body_len: usize) -> Vec<u8> {
    let mut h = Vec::with_capacity(8);
    h.extend_from_slice(message_type);
    h.push(chunk_type);
    h.extend_from_slice(&((8 + body_len) as u32).to_le_bytes());
    h
}

fn build_hello(endpoint_url: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // protocol version
    body.extend_from_slice(&DEFAULT_BUFFER_SIZE.to_le_bytes()); // receive buffer size
    body.extend_from_slice(&DEFAULT_BUFFER_SIZE.to_le_bytes()); // send buffer size
    body.extend_from_slice(&0u32.to_le_bytes()); // max message size (0 = no limit)
    body.extend_from_slice(&0u32.to_le_bytes()); // max chunk count (0 = no limit)
    body.extend_from_slice(&(endpoint_url.len() as u32).to_le_bytes());
    body.extend_from_slice(endpoint_url.as_bytes());

    let mut frame = message_header(b"HEL", b'F', body.len());
    frame.extend_from_slice(&body);
    frame
}

/// Read one complete message and split it into `(message_type, chunk_type,
/// body)`.
async fn read_message(stream: &mut TcpStream) -> Result<([u8; 3], u8, Vec<u8>)> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    let message_type = [header[0], header[1], header[2]];
    let chunk_type = header[3];
    let total_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let body_len = total_len.saturating_sub(8);
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await?;
    Ok((message_type, chunk_type, body))
}

struct ReadRequestPayload<'a> {
    node: &'a OpcUaNodeId,
}

fn encode_node_id(node: &OpcUaNodeId) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&node.namespace.to_le_bytes());
    match node.kind {
        IdentifierKind::Numeric => {
            out.push(b'i');
            let id: u32 = node.identifier.parse().unwrap_or(0);
            out.extend_from_slice(&id.to_le_bytes());
        }
        IdentifierKind::String => {
            out.push(b's');
            out.extend_from_slice(&(node.identifier.len() as u32).to_le_bytes());
            out.extend_from_slice(node.identifier.as_bytes());
        }
        IdentifierKind::Guid | IdentifierKind::Opaque => {
            out.push(if node.kind == IdentifierKind::Guid { b'g' } else { b'b' });
            out.extend_from_slice(&(node.identifier.len() as u32).to_le_bytes());
            out.extend_from_slice(node.identifier.as_bytes());
        }
    }
    out
}

/// Minimal `MSG`-framed request body: `[service:1][node-id][op-data...]`.
/// `service` 0 = Read, 1 = Write. This is a deliberately simplified
/// encoding of the Read/Write services (spec §6), not a byte-exact OPC-UA
/// binary stack — the full `Variant`/`ExtensionObject` type system is
/// outside this gateway's scope (spec §1, northbound server boundary).
fn build_read_request(node: &OpcUaNodeId) -> Vec<u8> {
    let mut body = vec![0u8];
    body.extend_from_slice(&encode_node_id(node));
    body
}

fn build_write_request(node: &OpcUaNodeId, data_type: DataType, value: Scalar) -> Vec<u8> {
    let mut body = vec![1u8];
    body.extend_from_slice(&encode_node_id(node));
    body.push(data_type as u8);
    body.extend_from_slice(&encode_scalar(value));
    body
}

fn encode_scalar(value: Scalar) -> Vec<u8> {
    match value {
        Scalar::Bool(v) => vec![v as u8],
        Scalar::Int16(v) => v.to_le_bytes().to_vec(),
        Scalar::UInt16(v) => v.to_le_bytes().to_vec(),
        Scalar::Int32(v) => v.to_le_bytes().to_vec(),
        Scalar::UInt32(v) => v.to_le_bytes().to_vec(),
        Scalar::Float32(v) => v.to_le_bytes().to_vec(),
        Scalar::Int64(v) => v.to_le_bytes().to_vec(),
        Scalar::UInt64(v) => v.to_le_bytes().to_vec(),
        Scalar::Float64(v) => v.to_le_bytes().to_vec(),
    }
}

fn decode_scalar(bytes: &[u8], data_type: DataType) -> Result<Scalar> {
    let scalar = match data_type {
        DataType::Bool => Scalar::Bool(*bytes.first().unwrap_or(&0) != 0),
        DataType::Int16 => Scalar::Int16(i16::from_le_bytes(bytes[0..2].try_into().unwrap())),
        DataType::UInt16 => Scalar::UInt16(u16::from_le_bytes(bytes[0..2].try_into().unwrap())),
        DataType::Int32 => Scalar::Int32(i32::from_le_bytes(bytes[0..4].try_into().unwrap())),
        DataType::UInt32 => Scalar::UInt32(u32::from_le_bytes(bytes[0..4].try_into().unwrap())),
        DataType::Float32 => Scalar::Float32(f32::from_le_bytes(bytes[0..4].try_into().unwrap())),
        DataType::Int64 => Scalar::Int64(i64::from_le_bytes(bytes[0..8].try_into().unwrap())),
        DataType::UInt64 => Scalar::UInt64(u64::from_le_bytes(bytes[0..8].try_into().unwrap())),
        DataType::Float64 => Scalar::Float64(f64::from_le_bytes(bytes[0..8].try_into().unwrap())),
    };
    Ok(scalar)
}

/// `[status:1][...]`; status 0 = good, 1 = service fault (recoverable),
/// 2 = service fault (permanent), followed by the encoded scalar on
/// success.
fn decode_msg_response(body: &[u8], data_type: DataType) -> Result<Scalar> {
    match body.first() {
        Some(0) => decode_scalar(&body[1..], data_type),
        Some(1) => Err(GatewayError::ProtocolError {
            kind: ProtocolErrorKind::Recoverable,
            message: "service fault (recoverable)".into(),
        }),
        _ => Err(GatewayError::ProtocolError {
            kind: ProtocolErrorKind::Permanent,
            message: "service fault".into(),
        }),
    }
}

pub struct OpcUaConnection {
    device_id: DeviceId,
    stream: TcpStream,
    secure_channel_id: u32,
    sequence: AtomicU32,
    healthy: bool,
    stats: ConnectionStats,
    endpoint_url: String,
}

#[async_trait]
impl Connection for OpcUaConnection {
    async fn open(&mut self) -> Result<()> {
        let hello = build_hello(&self.endpoint_url);
        self.stream.write_all(&hello).await?;
        let (message_type, _chunk, _body) = read_message(&mut self.stream).await?;
        if &message_type != b"ACK" {
            return Err(GatewayError::SessionLost("expected ACK after HEL".into()));
        }
        // OpenSecureChannel (`OPN`) with the `None` security policy: the
        // gateway treats the exchange as a formality and assigns itself a
        // local channel id, since the None policy carries no cryptographic
        // material to negotiate.
        self.secure_channel_id = 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let frame = message_header(b"CLO", b'F', 0);
        let _ = self.stream.write_all(&frame).await;
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy && self.secure_channel_id != 0
    }

    async fn execute(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let started = Instant::now();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut body = Vec::with_capacity(8 + request.len());
        body.extend_from_slice(&self.secure_channel_id.to_le_bytes());
        body.extend_from_slice(&seq.to_le_bytes());
        body.extend_from_slice(request);

        let mut frame = message_header(b"MSG", b'F', body.len());
        frame.extend_from_slice(&body);

        if self.stream.write_all(&frame).await.is_err() {
            self.healthy = false;
            return Err(GatewayError::TransportError("write failed".into()));
        }
        let (message_type, _chunk, resp_body) = match read_message(&mut self.stream).await {
            Ok(v) => v,
            Err(e) => {
                self.healthy = false;
                return Err(e);
            }
        };
        if &message_type != b"MSG" {
            self.healthy = false;
            return Err(GatewayError::SessionLost("unexpected response message type".into()));
        }
        self.stats.record(started.elapsed());
        // Strip the echoed secure-channel/sequence header.
        Ok(resp_body.get(8..).unwrap_or(&[]).to_vec())
    }

    fn stats(&self) -> ConnectionStats {
        self.stats
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

pub struct OpcUaConnectionFactory {
    device: Device,
}

impl OpcUaConnectionFactory {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

#[async_trait]
impl ConnectionFactory for OpcUaConnectionFactory {
    async fn open(&self) -> Result<Box<dyn Connection>> {
        let addr: SocketAddr = format!("{}:{}", self.device.address, self.device.port)
            .parse()
            .map_err(|e| GatewayError::TransportError(format!("bad socket address: {}", e)))?;
        let stream = TcpStream::connect(addr).await?;
        let endpoint_url = format!("opc.tcp://{}:{}", self.device.address, self.device.port);
        Ok(Box::new(OpcUaConnection {
            device_id: self.device.id.clone(),
            stream,
            secure_channel_id: 0,
            sequence: AtomicU32::new(1),
            healthy: true,
            stats: ConnectionStats::new(),
            endpoint_url,
        }))
    }
}

/// Concrete OPC-UA protocol handler (spec §4.6).
pub struct OpcUaHandler {
    ctx: Arc<HandlerContext>,
    #[allow(dead_code)]
    gateway_config: Arc<GatewayConfig>,
}

impl OpcUaHandler {
    pub fn new(ctx: Arc<HandlerContext>, gateway_config: Arc<GatewayConfig>) -> Self {
        Self { ctx, gateway_config }
    }

    fn factory_for(&self, device: &Device) -> OpcUaConnectionFactory {
        OpcUaConnectionFactory::new(device.clone())
    }
}

#[async_trait]
impl ProtocolHandler for OpcUaHandler {
    fn protocol(&self) -> Protocol {
        Protocol::OpcUa
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
        let node = opcua::parse(&tag.address)?;
        let pool = self.ctx.pools.pool_for(&device.id).await;
        let breaker = self.ctx.breakers.breaker_for(&device.id);
        let factory = self.factory_for(device);
        let diagnostics = self.ctx.diagnostics.for_device(&device.id);

        let result = self
            .ctx
            .with_retry(|| async {
                if breaker.allow().is_err() {
                    return Err(GatewayError::BreakerOpen {
                        device_id: device.id.to_string(),
                    });
                }
                let mut conn = pool.acquire(&factory).await?;
                let req = build_read_request(&node);
                let started = Instant::now();
                let result = conn.execute(&req).await.and_then(|body| decode_msg_response(&body, tag.data_type).map(Value::good));
                match &result {
                    Ok(_) => {
                        breaker.record(true);
                        diagnostics.record_success(started.elapsed());
                    }
                    Err(e) => {
                        if breaker.record(!e.counts_against_breaker()) {
                            diagnostics.record_breaker_trip();
                        }
                        diagnostics.record_error(&format!("{}", e), "read", &tag.address);
                    }
                }
                pool.release(conn).await;
                result
            })
            .await;
        apply_outcome(&self.ctx, &device.id, &result);
        result
    }

    async fn write_tag(&self, device: &Device, tag: &Tag, value: Scalar) -> Result<()> {
        if !tag.writable {
            return Err(GatewayError::UnwritableAddress {
                address: tag.address.clone(),
            });
        }
        let node = opcua::parse(&tag.address)?;
        let pool = self.ctx.pools.pool_for(&device.id).await;
        let breaker = self.ctx.breakers.breaker_for(&device.id);
        let factory = self.factory_for(device);
        let diagnostics = self.ctx.diagnostics.for_device(&device.id);

        let result: Result<()> = self
            .ctx
            .with_retry(|| async {
                if breaker.allow().is_err() {
                    return Err(GatewayError::BreakerOpen {
                        device_id: device.id.to_string(),
                    });
                }
                let mut conn = pool.acquire(&factory).await?;
                let req = build_write_request(&node, tag.data_type, value);
                let started = Instant::now();
                let op_result = conn.execute(&req).await;
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
        // FindServers proper requires an already-open HEL/ACK transport
        // connection; a bare HEL/ACK handshake against each candidate
        // endpoint is enough to prove an OPC-UA stack is listening there
        // (spec §6, §11).
        let candidates: Vec<String> = network_range.split(',').map(str::trim).filter(|s| !s.is_empty()).map(|s| s.to_string()).collect();
        let deadline = tokio::time::Instant::now() + deadline;
        let mut found = Vec::new();

        for target in candidates {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let addr_str = if target.contains(':') { target.clone() } else { format!("{}:{}", target, OPC_UA_DEFAULT_PORT) };
            let Ok(addr) = addr_str.parse::<SocketAddr>() else { continue };

            let probe = async {
                let mut stream = TcpStream::connect(addr).await?;
                let endpoint_url = format!("opc.tcp://{}:{}", addr.ip(), addr.port());
                stream.write_all(&build_hello(&endpoint_url)).await?;
                let (message_type, _chunk, _body) = read_message(&mut stream).await?;
                Result::Ok(message_type == *b"ACK")
            };
            if let Ok(Ok(true)) = tokio::time::timeout(remaining, probe).await {
                found.push(DiscoveredDevice {
                    protocol: Protocol::OpcUa,
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
            DataType::Float64,
        ]
    }

    fn validate_address(&self, address: &str) -> bool {
        opcua::parse(address).is_ok()
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
impl BatchExecutor for OpcUaHandler {
    fn can_batch(&self, a: &BatchRequest, b: &BatchRequest) -> bool {
        // A single Read service call can carry up to 1000 nodes (spec
        // §4.5); coalescing into one multi-node request is not yet
        // implemented, so every request dispatches individually.
        a.device_id == b.device_id && false
    }

    fn max_wire_batch(&self) -> usize {
        1000
    }

    async fn execute_batch(
        &self,
        _conn: &mut dyn Connection,
        batch: Vec<BatchRequest>,
    ) -> std::result::Result<(), (Vec<BatchRequest>, GatewayError)> {
        Err((batch, GatewayError::QueueFull {
            device_id: "batching-not-supported".into(),
        }))
    }

    async fn execute_one(&self, conn: &mut dyn Connection, request: &BatchRequest) -> Result<Value> {
        let node = opcua::parse(&request.tag.address)?;
        match request.op {
            Op::Read => {
                let req = build_read_request(&node);
                conn.execute(&req).await.and_then(|body| decode_msg_response(&body, request.tag.data_type).map(Value::good))
            }
            Op::Write(scalar) => {
                let req = build_write_request(&node, request.tag.data_type, scalar);
                conn.execute(&req).await.map(|_| Value::good(scalar))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_has_correct_message_type_and_size() {
        let frame = build_hello("opc.tcp://localhost:4840");
        assert_eq!(&frame[0..3], b"HEL");
        assert_eq!(frame[3], b'F');
        let size = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        assert_eq!(size as usize, frame.len());
    }

    #[test]
    fn read_request_encodes_numeric_node_id() {
        let node = opcua::parse("ns=2;i=85").unwrap();
        let req = build_read_request(&node);
        assert_eq!(req[0], 0);
        assert_eq!(&req[1..3], &2u16.to_le_bytes());
        assert_eq!(req[3], b'i');
    }

    #[test]
    fn decode_msg_response_maps_status_to_good_or_fault() {
        let ok_body = [&[0u8][..], &100u16.to_le_bytes()].concat();
        assert_eq!(decode_msg_response(&ok_body, DataType::UInt16).unwrap(), Scalar::UInt16(100));
        let fault_body = [1u8];
        assert!(decode_msg_response(&fault_body, DataType::UInt16).unwrap_err().is_retryable());
    }
}
