//! EtherNet/IP + CIP protocol handler (spec §4.1, §4.2, §4.6, §6).
//!
//! Encapsulation header: `[command:2][length:2][session:4][status:4]
//! [context:8][options:4]`, little-endian. Session lifecycle
//! (`RegisterSession`/`UnregisterSession`) and the `SendRRData` envelope
//! are grounded in the `wellpulse` EtherNet/IP adapter's encapsulation
//! builder.

use crate::address::cip::{self, CipGeneralStatus, EpathSegment};
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
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

pub const ETHERNET_IP_PORT: u16 = 44818;
const CIP_MULTICAST_ADDR: &str = "224.0.1.1:44818";
const ENCAP_CMD_LIST_IDENTITY: u16 = 0x63;

const ENCAP_CMD_REGISTER_SESSION: u16 = 0x65;
const ENCAP_CMD_UNREGISTER_SESSION: u16 = 0x66;
const ENCAP_CMD_SEND_RR_DATA: u16 = 0x6F;

const CIP_SERVICE_GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
const CIP_SERVICE_SET_ATTRIBUTE_SINGLE: u8 = 0x10;
const CIP_SERVICE_REPLY_MASK: u8 = 0x80;

fn encap_header(command: u16, length: u16, session: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(24);
    h.extend_from_slice(&command.to_le_bytes());
    h.extend_from_slice(&length.to_le_bytes());
    h.extend_from_slice(&session.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // status
    h.extend_from_slice(&[0u8; 8]); // sender context
    h.extend_from_slice(&0u32.to_le_bytes()); // options
    h
}

fn build_register_session() -> Vec<u8> {
    let mut frame = encap_header(ENCAP_CMD_REGISTER_SESSION, 4, 0);
    frame.extend_from_slice(&1u16.to_le_bytes()); // protocol version
    frame.extend_from_slice(&0u16.to_le_bytes()); // options flags
    frame
}

fn encode_epath(path: &[EpathSegment]) -> Vec<u8> {
    let mut out = Vec::new();
    for seg in path {
        match seg {
            EpathSegment::Symbolic(name) => {
                out.push(0x91);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
                if name.len() % 2 != 0 {
                    out.push(0); // pad to even length
                }
            }
            EpathSegment::ArrayIndex(idx) => {
                if *idx <= 0xFF {
                    out.push(0x28);
                    out.push(*idx as u8);
                } else {
                    out.push(0x29);
                    out.push(0);
                    out.extend_from_slice(&(*idx as u16).to_le_bytes());
                }
            }
            EpathSegment::Class(class) => {
                out.push(0x20);
                out.push(*class as u8);
            }
            EpathSegment::Instance(instance) => {
                if *instance <= 0xFF {
                    out.push(0x24);
                    out.push(*instance as u8);
                } else {
                    out.push(0x25);
                    out.push(0);
                    out.extend_from_slice(&(*instance as u16).to_le_bytes());
                }
            }
            EpathSegment::Attribute(attr) => {
                out.push(0x30);
                out.push(*attr as u8);
            }
        }
    }
    out
}

/// Wraps an already-encoded CIP service request inside a `SendRRData`
/// Common Packet Format envelope (null address item + an unconnected-data
/// item carrying the request).
fn wrap_send_rr_data(session: u32, cip_request: &[u8]) -> Vec<u8> {
    let mut cpf = Vec::new();
    cpf.extend_from_slice(&0u32.to_le_bytes()); // interface handle
    cpf.extend_from_slice(&10u16.to_le_bytes()); // timeout (100ms units)
    cpf.extend_from_slice(&2u16.to_le_bytes()); // item count
    cpf.extend_from_slice(&0x0000u16.to_le_bytes()); // null address item type
    cpf.extend_from_slice(&0u16.to_le_bytes()); // null address item length
    cpf.extend_from_slice(&0x00B2u16.to_le_bytes()); // unconnected data item type
    cpf.extend_from_slice(&(cip_request.len() as u16).to_le_bytes());
    cpf.extend_from_slice(cip_request);

    let mut frame = encap_header(ENCAP_CMD_SEND_RR_DATA, cpf.len() as u16, session);
    frame.extend_from_slice(&cpf);
    frame
}

fn parse_cip_reply(body: &[u8]) -> Result<Vec<u8>> {
    // body: interface handle(4) + timeout(2) + item count(2) + items...
    if body.len() < 8 {
        return Err(GatewayError::ProtocolError {
            kind: ProtocolErrorKind::Permanent,
            message: "CPF body too short".into(),
        });
    }
    let item_count = u16::from_le_bytes([body[6], body[7]]);
    let mut offset = 8;
    let mut data_item: Option<&[u8]> = None;
    for _ in 0..item_count {
        if offset + 4 > body.len() {
            break;
        }
        let item_type = u16::from_le_bytes([body[offset], body[offset + 1]]);
        let item_len = u16::from_le_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let item_body = &body[offset + 4..offset + 4 + item_len.min(body.len() - offset - 4)];
        if item_type == 0x00B2 {
            data_item = Some(item_body);
        }
        offset += 4 + item_len;
    }
    let cip_reply = data_item.ok_or_else(|| GatewayError::ProtocolError {
        kind: ProtocolErrorKind::Permanent,
        message: "no unconnected-data item in CPF reply".into(),
    })?;
    if cip_reply.len() < 4 {
        return Err(GatewayError::ProtocolError {
            kind: ProtocolErrorKind::Permanent,
            message: "CIP reply too short".into(),
        });
    }
    let service = cip_reply[0];
    if service & CIP_SERVICE_REPLY_MASK == 0 {
        return Err(GatewayError::ProtocolError {
            kind: ProtocolErrorKind::Permanent,
            message: "reply missing service reply bit".into(),
        });
    }
    let general_status = cip_reply[2];
    let status = CipGeneralStatus::from_code(general_status);
    if !matches!(status, CipGeneralStatus::Success) {
        return Err(GatewayError::ProtocolError {
            kind: if status.is_recoverable() { ProtocolErrorKind::Recoverable } else { ProtocolErrorKind::Permanent },
            message: format!("general status {:#04x}", general_status),
        });
    }
    let extended_size = cip_reply[3] as usize;
    let data_start = 4 + extended_size * 2;
    Ok(cip_reply.get(data_start..).unwrap_or(&[]).to_vec())
}

fn decode_cip_value(data: &[u8], data_type: DataType) -> Result<Scalar> {
    let bytes: &[u8] = data;
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

fn encode_cip_value(scalar: Scalar) -> Vec<u8> {
    match scalar {
        Scalar::Bool(v) => vec![if v { 0xFF } else { 0x00 }],
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

pub struct CipConnection {
    device_id: DeviceId,
    stream: TcpStream,
    session: u32,
    healthy: bool,
    stats: ConnectionStats,
}

impl CipConnection {
    async fn read_encap_reply(stream: &mut TcpStream) -> Result<(u16, u32, Vec<u8>)> {
        let mut header = [0u8; 24];
        stream.read_exact(&mut header).await?;
        let command = u16::from_le_bytes([header[0], header[1]]);
        let length = u16::from_le_bytes([header[2], header[3]]);
        let session = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut body = vec![0u8; length as usize];
        stream.read_exact(&mut body).await?;
        Ok((command, session, body))
    }
}

#[async_trait]
impl Connection for CipConnection {
    async fn open(&mut self) -> Result<()> {
        let frame = build_register_session();
        self.stream.write_all(&frame).await?;
        let (_, session, body) = Self::read_encap_reply(&mut self.stream).await?;
        if body.len() < 4 {
            return Err(GatewayError::SessionLost("short RegisterSession reply".into()));
        }
        self.session = session;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let frame = encap_header(ENCAP_CMD_UNREGISTER_SESSION, 0, self.session);
        let _ = self.stream.write_all(&frame).await;
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy && self.session != 0
    }

    /// `request` is `[service, path_segment_count, ...encoded_path_bytes]`
    /// produced by the handler; this layer only wraps/unwraps the
    /// `SendRRData` envelope.
    async fn execute(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let started = Instant::now();
        let frame = wrap_send_rr_data(self.session, request);

        if self.stream.write_all(&frame).await.is_err() {
            self.healthy = false;
            return Err(GatewayError::TransportError("write failed".into()));
        }
        let (_, _session, body) = match Self::read_encap_reply(&mut self.stream).await {
            Ok(v) => v,
            Err(e) => {
                self.healthy = false;
                return Err(e);
            }
        };
        // Permanent protocol errors (bad tag, bad path) do not kill the
        // session; only transport/read failures above do.
        let result = parse_cip_reply(&body);
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

pub struct CipConnectionFactory {
    device: Device,
}

impl CipConnectionFactory {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

#[async_trait]
impl ConnectionFactory for CipConnectionFactory {
    async fn open(&self) -> Result<Box<dyn Connection>> {
        let addr: SocketAddr = format!("{}:{}", self.device.address, self.device.port)
            .parse()
            .map_err(|e| GatewayError::TransportError(format!("bad socket address: {}", e)))?;
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(CipConnection {
            device_id: self.device.id.clone(),
            stream,
            session: 0,
            healthy: true,
            stats: ConnectionStats::new(),
        }))
    }
}

fn raw_service_request(service: u8, path: &[EpathSegment], data: &[u8]) -> Vec<u8> {
    let epath = encode_epath(path);
    let mut out = Vec::with_capacity(2 + epath.len() + data.len());
    out.push(service);
    out.push((epath.len() / 2) as u8);
    out.extend_from_slice(&epath);
    out.extend_from_slice(data);
    out
}

/// Concrete EtherNet/IP + CIP protocol handler (spec §4.6).
pub struct CipHandler {
    ctx: Arc<HandlerContext>,
    #[allow(dead_code)]
    gateway_config: Arc<GatewayConfig>,
}

impl CipHandler {
    pub fn new(ctx: Arc<HandlerContext>, gateway_config: Arc<GatewayConfig>) -> Self {
        Self { ctx, gateway_config }
    }

    fn factory_for(&self, device: &Device) -> CipConnectionFactory {
        CipConnectionFactory::new(device.clone())
    }
}

#[async_trait]
impl ProtocolHandler for CipHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Cip
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
        let addr = cip::parse(&tag.address)?;
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
                let request = raw_service_request(CIP_SERVICE_GET_ATTRIBUTE_SINGLE, &addr.path, &[]);
                let started = Instant::now();
                let result = conn.execute(&request).await.and_then(|data| decode_cip_value(&data, tag.data_type).map(Value::good));
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
        let addr = cip::parse(&tag.address)?;
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
                let data = encode_cip_value(value);
                let request = raw_service_request(CIP_SERVICE_SET_ATTRIBUTE_SINGLE, &addr.path, &data);
                let started = Instant::now();
                let op_result = conn.execute(&request).await;
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
        // Multicasts ListIdentity to 224.0.1.1:44818 and broadcasts on the
        // supplied scan range (spec §6); any UDP reply to a ListIdentity
        // command proves a CIP stack is listening at the sender's address.
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        socket.set_broadcast(true).ok();
        let request = encap_header(ENCAP_CMD_LIST_IDENTITY, 0, 0);

        if let Ok(multicast) = CIP_MULTICAST_ADDR.parse::<SocketAddr>() {
            let _ = socket.send_to(&request, multicast).await;
        }
        for target in network_range.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let addr_str = if target.contains(':') { target.to_string() } else { format!("{}:{}", target, ETHERNET_IP_PORT) };
            if let Ok(addr) = addr_str.parse::<SocketAddr>() {
                let _ = socket.send_to(&request, addr).await;
            }
        }

        let mut found = Vec::new();
        let mut buf = [0u8; 512];
        let _ = tokio::time::timeout(deadline, async {
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) if n >= 2 && u16::from_le_bytes([buf[0], buf[1]]) == ENCAP_CMD_LIST_IDENTITY => {
                        found.push(DiscoveredDevice {
                            protocol: Protocol::Cip,
                            address: from.ip().to_string(),
                            port: ETHERNET_IP_PORT,
                            info: DeviceInfo::default(),
                        });
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        })
        .await;

        dedup_discovered(found)
    }

    async fn device_info(&self, _device: &Device) -> Result<DeviceInfo> {
        Ok(DeviceInfo::default())
    }

    fn supported_types(&self) -> &'static [DataType] {
        &[DataType::Bool, DataType::Int16, DataType::UInt16, DataType::Int32, DataType::UInt32, DataType::Float32]
    }

    fn validate_address(&self, address: &str) -> bool {
        cip::parse(address).is_ok()
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
impl BatchExecutor for CipHandler {
    fn can_batch(&self, a: &BatchRequest, b: &BatchRequest) -> bool {
        // Multiple Service Packet coalescing (spec §4.5) is not
        // implemented; every request dispatches individually.
        a.device_id == b.device_id && false
    }

    fn max_wire_batch(&self) -> usize {
        50
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
        let addr = cip::parse(&request.tag.address)?;
        match request.op {
            Op::Read => {
                let req = raw_service_request(CIP_SERVICE_GET_ATTRIBUTE_SINGLE, &addr.path, &[]);
                conn.execute(&req).await.and_then(|data| decode_cip_value(&data, request.tag.data_type).map(Value::good))
            }
            Op::Write(scalar) => {
                let data = encode_cip_value(scalar);
                let req = raw_service_request(CIP_SERVICE_SET_ATTRIBUTE_SINGLE, &addr.path, &data);
                conn.execute(&req).await.map(|_| Value::good(scalar))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epath_encodes_symbolic_segment_with_even_padding() {
        let path = vec![EpathSegment::Symbolic("Temp".into())];
        let encoded = encode_epath(&path);
        assert_eq!(encoded, vec![0x91, 4, b'T', b'e', b'm', b'p']);
    }

    #[test]
    fn epath_pads_odd_length_symbolic_names() {
        let path = vec![EpathSegment::Symbolic("Fan".into())];
        let encoded = encode_epath(&path);
        assert_eq!(encoded, vec![0x91, 3, b'F', b'a', b'n', 0]);
    }

    #[test]
    fn raw_service_request_carries_service_and_word_count() {
        let path = vec![EpathSegment::Symbolic("Temp".into())];
        let req = raw_service_request(CIP_SERVICE_GET_ATTRIBUTE_SINGLE, &path, &[]);
        assert_eq!(req[0], CIP_SERVICE_GET_ATTRIBUTE_SINGLE);
        assert_eq!(req[1], 3); // 6 epath bytes / 2
    }

    #[test]
    fn decode_cip_real_value() {
        let bytes = 98.6f32.to_le_bytes();
        let v = decode_cip_value(&bytes, DataType::Float32).unwrap();
        assert_eq!(v, Scalar::Float32(98.6));
    }
}
