//! End-to-end smoke test against a virtual EtherNet/IP + CIP device:
//! RegisterSession handshake followed by a GetAttributeSingle/
//! SetAttributeSingle round trip over SendRRData, matching the real wire
//! sequence a PLC-side adapter expects.

use bifrost_gateway::breaker::BreakerRegistry;
use bifrost_gateway::diagnostics::DiagnosticsRegistry;
use bifrost_gateway::handler::cip::CipHandler;
use bifrost_gateway::handler::{HandlerContext, ProtocolHandler};
use bifrost_gateway::pool::PoolRegistry;
use bifrost_gateway::scheduler::BatchScheduler;
use bifrost_gateway::value::{DataType, Device, Protocol, Scalar, Tag};
use bifrost_gateway::GatewayConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const REGISTER_SESSION: u16 = 0x65;
const SEND_RR_DATA: u16 = 0x6F;

async fn spawn_virtual_cip_device() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut value: i16 = 7;
        loop {
            let mut header = [0u8; 24];
            if socket.read_exact(&mut header).await.is_err() {
                return;
            }
            let command = u16::from_le_bytes([header[0], header[1]]);
            let length = u16::from_le_bytes([header[2], header[3]]);
            let mut body = vec![0u8; length as usize];
            socket.read_exact(&mut body).await.unwrap();

            match command {
                c if c == REGISTER_SESSION => {
                    let session: u32 = 0xCAFEBABE;
                    let mut reply = encap_header(REGISTER_SESSION, 4, session);
                    reply.extend_from_slice(&1u16.to_le_bytes());
                    reply.extend_from_slice(&0u16.to_le_bytes());
                    socket.write_all(&reply).await.unwrap();
                }
                c if c == SEND_RR_DATA => {
                    let session = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
                    let item_count = u16::from_le_bytes([body[6], body[7]]);
                    let mut offset = 8;
                    let mut cip_request: &[u8] = &[];
                    for _ in 0..item_count {
                        let item_type = u16::from_le_bytes([body[offset], body[offset + 1]]);
                        let item_len = u16::from_le_bytes([body[offset + 2], body[offset + 3]]) as usize;
                        let item_body = &body[offset + 4..offset + 4 + item_len];
                        if item_type == 0x00B2 {
                            cip_request = item_body;
                        }
                        offset += 4 + item_len;
                    }
                    let service = cip_request[0];
                    let path_words = cip_request[1] as usize;
                    let data = &cip_request[2 + path_words * 2..];

                    let reply_data = if service == 0x0E {
                        value.to_le_bytes().to_vec()
                    } else {
                        value = i16::from_le_bytes([data[0], data[1]]);
                        Vec::new()
                    };

                    let mut cip_reply = vec![service | 0x80, 0, 0, 0];
                    cip_reply.extend_from_slice(&reply_data);

                    let mut cpf = Vec::new();
                    cpf.extend_from_slice(&0u32.to_le_bytes());
                    cpf.extend_from_slice(&10u16.to_le_bytes());
                    cpf.extend_from_slice(&2u16.to_le_bytes());
                    cpf.extend_from_slice(&0x0000u16.to_le_bytes());
                    cpf.extend_from_slice(&0u16.to_le_bytes());
                    cpf.extend_from_slice(&0x00B2u16.to_le_bytes());
                    cpf.extend_from_slice(&(cip_reply.len() as u16).to_le_bytes());
                    cpf.extend_from_slice(&cip_reply);

                    let mut reply = encap_header(SEND_RR_DATA, cpf.len() as u16, session);
                    reply.extend_from_slice(&cpf);
                    socket.write_all(&reply).await.unwrap();
                }
                other => panic!("unexpected encapsulation command {other:#06x} in test server"),
            }
        }
    });

    addr
}

fn encap_header(command: u16, length: u16, session: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(24);
    h.extend_from_slice(&command.to_le_bytes());
    h.extend_from_slice(&length.to_le_bytes());
    h.extend_from_slice(&session.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes());
    h.extend_from_slice(&[0u8; 8]);
    h.extend_from_slice(&0u32.to_le_bytes());
    h
}

fn handler() -> CipHandler {
    let config = Arc::new(GatewayConfig::default());
    let ctx = Arc::new(HandlerContext::new(
        Arc::new(PoolRegistry::new(4, 256, Duration::from_secs(60), Duration::from_millis(500))),
        Arc::new(BreakerRegistry::new(10, 0.5, Duration::from_secs(30), 3, 64)),
        Arc::new(DiagnosticsRegistry::new()),
        Arc::new(BatchScheduler::new(config.batch)),
        2,
        Duration::from_millis(10),
        5,
    ));
    CipHandler::new(ctx, config)
}

#[tokio::test]
async fn connect_registers_a_session_before_any_reads() {
    let addr = spawn_virtual_cip_device().await;
    let device = Device::new("drive-test", Protocol::Cip, addr.ip().to_string(), addr.port());
    let handler = handler();
    handler.connect(&device).await.unwrap();
}

#[tokio::test]
async fn write_then_read_round_trips_the_attribute() {
    let addr = spawn_virtual_cip_device().await;
    let device = Device::new("drive-rw", Protocol::Cip, addr.ip().to_string(), addr.port());
    let tag = Tag::new("fault-code", device.id.clone(), "Fault.Code", DataType::Int16, true);
    let handler = handler();

    handler.write_tag(&device, &tag, Scalar::Int16(99)).await.unwrap();
    let value = handler.read_tag(&device, &tag).await.unwrap();
    assert_eq!(value.scalar, Scalar::Int16(99));
}
