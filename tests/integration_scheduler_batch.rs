//! Exercises the batch scheduler's dispatch loop end-to-end: two holding
//! register reads queued close together against the same device are
//! coalesced into a single FC3 wire exchange by `ModbusHandler`'s
//! `BatchExecutor` impl.

use bifrost_gateway::breaker::BreakerRegistry;
use bifrost_gateway::config::{BatchConfig, GatewayConfig, WordOrder};
use bifrost_gateway::diagnostics::DiagnosticsRegistry;
use bifrost_gateway::handler::modbus::ModbusHandler;
use bifrost_gateway::handler::{HandlerContext, ProtocolHandler};
use bifrost_gateway::pool::PoolRegistry;
use bifrost_gateway::scheduler::{dispatch_once, BatchRequest, BatchScheduler, Op, OpKind};
use bifrost_gateway::value::{DataType, Device, Protocol, Tag};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Like the Modbus virtual device in the round-trip test, but also counts
/// how many distinct FC3 requests it receives so the test can assert the
/// scheduler actually coalesced the two queued reads into one.
async fn spawn_virtual_modbus_device(read_count: Arc<AtomicUsize>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let registers = vec![11u16, 22u16, 33u16, 44u16];
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
            assert_eq!(function_code, 3, "only FC3 reads are expected in this test");
            read_count.fetch_add(1, Ordering::SeqCst);

            let start = u16::from_be_bytes([pdu[0], pdu[1]]) as usize;
            let count = u16::from_be_bytes([pdu[2], pdu[3]]) as usize;
            let mut data = vec![(count * 2) as u8];
            for r in &registers[start..start + count] {
                data.extend_from_slice(&r.to_be_bytes());
            }

            let resp_length = (2 + data.len()) as u16;
            let mut frame = Vec::new();
            frame.extend_from_slice(&txn_id.to_be_bytes());
            frame.extend_from_slice(&0u16.to_be_bytes());
            frame.extend_from_slice(&resp_length.to_be_bytes());
            frame.push(1);
            frame.push(3);
            frame.extend_from_slice(&data);
            socket.write_all(&frame).await.unwrap();
        }
    });

    addr
}

#[tokio::test]
async fn two_queued_reads_are_coalesced_into_one_wire_exchange() {
    let read_count = Arc::new(AtomicUsize::new(0));
    let addr = spawn_virtual_modbus_device(read_count.clone()).await;
    let device = Device::new("plc-batch", Protocol::Modbus, addr.ip().to_string(), addr.port());

    let batch_config = BatchConfig {
        max_size: 64,
        min_size: 1,
        timeout: Duration::from_millis(200),
        adaptive: false,
        queue_capacity: 64,
        deadline_slack: Duration::from_millis(2),
    };
    let mut gateway_config = GatewayConfig::default();
    gateway_config.batch = batch_config;
    let gateway_config = Arc::new(gateway_config);

    let pools = Arc::new(PoolRegistry::new(4, 256, Duration::from_secs(60), Duration::from_millis(500)));
    let breakers = Arc::new(BreakerRegistry::new(10, 0.5, Duration::from_secs(30), 3, 64));
    let diagnostics = Arc::new(DiagnosticsRegistry::new());
    let scheduler = Arc::new(BatchScheduler::new(gateway_config.batch));
    let ctx = Arc::new(HandlerContext::new(
        pools.clone(),
        breakers.clone(),
        diagnostics,
        scheduler.clone(),
        2,
        Duration::from_millis(10),
        5,
    ));
    let handler = ModbusHandler::new(ctx.clone(), gateway_config);

    let tag_a = Tag::new("reg-a", device.id.clone(), "40001", DataType::UInt16, false);
    let tag_b = Tag::new("reg-b", device.id.clone(), "40002", DataType::UInt16, false);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let (req_a, rx_a) = BatchRequest::new(device.id.clone(), tag_a, Op::Read, deadline, 0, scheduler.next_sequence(), WordOrder::BigEndian);
    let (req_b, rx_b) = BatchRequest::new(device.id.clone(), tag_b, Op::Read, deadline, 0, scheduler.next_sequence(), WordOrder::BigEndian);
    scheduler.enqueue(req_a).await.unwrap();
    scheduler.enqueue(req_b).await.unwrap();

    // Force an immediate flush instead of waiting out the batch timeout.
    tokio::time::sleep(Duration::from_millis(210)).await;

    let breaker = breakers.breaker_for(&device.id);
    let pool = pools.pool_for(&device.id).await;
    let factory = bifrost_gateway::handler::modbus::ModbusConnectionFactory::new(device.clone(), 1);

    dispatch_once(&scheduler, &device.id, OpKind::Read, &handler, breaker.as_ref(), pool.as_ref(), &factory, ctx.as_ref()).await;

    let value_a = rx_a.await.unwrap().unwrap();
    let value_b = rx_b.await.unwrap().unwrap();
    assert_eq!(value_a.scalar, bifrost_gateway::value::Scalar::UInt16(11));
    assert_eq!(value_b.scalar, bifrost_gateway::value::Scalar::UInt16(22));
    assert_eq!(read_count.load(Ordering::SeqCst), 1, "expected both reads to share one wire exchange");
}
