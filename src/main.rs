//! # Bifrost Gateway — Demo Entry Point
//!
//! Boots a `Gateway`, registers a handful of demonstration devices (one per
//! protocol adapter), drives reads and writes through the full
//! pool/breaker/scheduler stack, and prints per-device diagnostics. A real
//! deployment would load its device and tag list from provisioning data
//! instead of the hardcoded set below.

use bifrost_gateway::cli::Args;
use bifrost_gateway::config::GatewayConfig;
use bifrost_gateway::gateway::Gateway;
use bifrost_gateway::value::{DataType, Device, Protocol, Scalar, Tag};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("bifrost-gateway.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "bifrost-gateway.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    let _log_guard = guard;

    let config = match args.config.as_ref() {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str::<GatewayConfig>(&raw)?
        }
        None => GatewayConfig::default(),
    };

    info!("starting bifrost gateway");

    let mut gateway = Gateway::new(config);

    let modbus_device = Device::new("plc-1", Protocol::Modbus, "127.0.0.1", 502);
    let cip_device = Device::new("drive-1", Protocol::Cip, "127.0.0.1", 44818);
    let opcua_device = Device::new("hmi-1", Protocol::OpcUa, "127.0.0.1", 4840);

    gateway.register_device(modbus_device.clone());
    gateway.register_device(cip_device.clone());
    gateway.register_device(opcua_device.clone());

    let modbus_tag = Tag::new("line-speed", modbus_device.id.clone(), "40001", DataType::UInt16, true);
    let cip_tag = Tag::new("fault-code", cip_device.id.clone(), "Fault.Code", DataType::Int16, false);
    let opcua_tag = Tag::new("tank-level", opcua_device.id.clone(), "ns=2;i=1001", DataType::Float32, true);

    gateway.connect_all().await;
    gateway.spawn_dispatch_loops();

    let deadline = Duration::from_millis(200);

    match gateway.enqueue_read(&modbus_device.id, modbus_tag.clone(), 0, deadline).await {
        Ok(value) => info!(?value, "read line-speed"),
        Err(e) => error!(%e, "read line-speed failed"),
    }

    match gateway.enqueue_write(&modbus_device.id, modbus_tag, Scalar::UInt16(1200), 0, deadline).await {
        Ok(_) => info!("wrote line-speed"),
        Err(e) => error!(%e, "write line-speed failed"),
    }

    match gateway.enqueue_read(&cip_device.id, cip_tag, 0, deadline).await {
        Ok(value) => info!(?value, "read fault-code"),
        Err(e) => error!(%e, "read fault-code failed"),
    }

    match gateway.enqueue_read(&opcua_device.id, opcua_tag, 0, deadline).await {
        Ok(value) => info!(?value, "read tank-level"),
        Err(e) => error!(%e, "read tank-level failed"),
    }

    for device_id in [&modbus_device.id, &cip_device.id, &opcua_device.id] {
        let snapshot = gateway.diagnostics(device_id);
        info!(device_id = %device_id, ?snapshot, "diagnostics");
    }

    gateway.shutdown();
    Ok(())
}
