//! End-to-end smoke test against a virtual Modbus TCP device: the handler
//! writes a holding register then reads it back through the pool/breaker
//! stack, exactly as the demo binary drives it.

use bifrost_gateway::breaker::BreakerRegistry;
use bifrost_gateway::diagnostics::DiagnosticsRegistry;
use bifrost_gateway::handler::modbus::ModbusHandler;
use bifrost_gateway::handler::{HandlerContext, ProtocolHandler};
use bifrost_gateway::pool::PoolRegistry;
use bifrost_gateway::scheduler::BatchScheduler;
use bifrost_gateway::value::{DataType, Device, Protocol, Scalar, Tag};
use bifrost_gateway::GatewayConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal Modbus TCP server: answers FC3 (read holding registers) and FC6
/// (write single register) against a single in-memory register file.
async fn spawn_virtual_modbus_device() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut registers = vec![0u16; 16];
        loop {
            let mut header = [0u8; 7];
            if socket.read_exact(&mut header).await.is_err() {
                return;
            }
            let txn_id = u16::from_be_bytes([header[0], header[1]]);
            let length = u16::from_be_bytes([header[4], header[5]]);
            let mut body = vec![0u8; (length - 1) as usize];
            socket.read_exact(&mut body).await.unwrap();
            let function_code = body[0];
            let pdu = &body[1..];

            let (resp_fc, resp_data) = match function_code {
                3 => {
                    let start = u16::from_be_bytes([pdu[0], pdu[1]]) as usize;
                    let count = u16::from_be_bytes([pdu[2], pdu[3]]) as usize;
                    let mut data = vec![(count * 2) as u8];
                    for r in &registers[start..start + count] {
                        data.extend_from_slice(&r.to_be_bytes());
                    }
                    (3u8, data)
                }
                6 => {
                    let offset = u16::from_be_bytes([pdu[0], pdu[1]]) as usize;
                    let value = u16::from_be_bytes([pdu[2], pdu[3]]);
                    registers[offset] = value;
                    (6u8, pdu.to_vec())
                }
                other => panic!("unexpected function code {other} in test server"),
            };

            let resp_length = (2 + resp_data.len()) as u16;
            let mut frame = Vec::new();
            frame.extend_from_slice(&txn_id.to_be_bytes());
            frame.extend_from_slice(&0u16.to_be_bytes());
            frame.extend_from_slice(&resp_length.to_be_bytes());
            frame.push(1); // unit id
            frame.push(resp_fc);
            frame.extend_from_slice(&resp_data);
            socket.write_all(&frame).await.unwrap();
        }
    });

    addr
}

fn handler() -> (ModbusHandler, Arc<HandlerContext>) {
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
    (ModbusHandler::new(ctx.clone(), config), ctx)
}

#[tokio::test]
async fn write_then_read_round_trips_through_the_full_stack() {
    let addr = spawn_virtual_modbus_device().await;
    let device = Device::new("plc-test", Protocol::Modbus, addr.ip().to_string(), addr.port());
    let tag = Tag::new("speed", device.id.clone(), "40001", DataType::UInt16, true);
    let (handler, _ctx) = handler();

    handler.connect(&device).await.unwrap();
    handler.write_tag(&device, &tag, Scalar::UInt16(4242)).await.unwrap();
    let value = handler.read_tag(&device, &tag).await.unwrap();
    assert_eq!(value.scalar, Scalar::UInt16(4242));
}

#[tokio::test]
async fn reading_an_unwritten_register_returns_zero() {
    let addr = spawn_virtual_modbus_device().await;
    let device = Device::new("plc-zero", Protocol::Modbus, addr.ip().to_string(), addr.port());
    let tag = Tag::new("idle", device.id.clone(), "40005", DataType::UInt16, false);
    let (handler, _ctx) = handler();

    let value = handler.read_tag(&device, &tag).await.unwrap();
    assert_eq!(value.scalar, Scalar::UInt16(0));
}

#[tokio::test]
async fn diagnostics_record_the_successful_round_trip() {
    let addr = spawn_virtual_modbus_device().await;
    let device = Device::new("plc-diag", Protocol::Modbus, addr.ip().to_string(), addr.port());
    let tag = Tag::new("speed", device.id.clone(), "40002", DataType::UInt16, false);
    let (handler, _ctx) = handler();

    handler.read_tag(&device, &tag).await.unwrap();
    let snapshot = handler.diagnostics(&device.id);
    assert_eq!(snapshot.success_count, 1);
    assert_eq!(snapshot.error_count, 0);
}
