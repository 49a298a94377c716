//! # Bifrost Gateway
//!
//! An industrial protocol gateway: device-session and I/O engine fronting
//! Modbus TCP/RTU, EtherNet/IP-CIP, and OPC-UA fieldbus devices behind a
//! uniform connection-pool/circuit-breaker/batch-scheduler/protocol-handler
//! architecture.

pub mod address;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod utils;
pub mod value;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use value::{DataType, Device, DeviceId, Protocol, Quality, Scalar, Tag, TagId, Value};

/// The current version of the gateway engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
