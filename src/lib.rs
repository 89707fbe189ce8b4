//! # Voltage Gateway - Multi-Instance Modbus TCP Gateway
//!
//! Exposes live monitoring points as a standards-compliant Modbus TCP
//! register/coil map. Each configured gateway runs its own listener, address
//! space, unit id and data-type conversion rules; client writes to editable
//! points are forwarded back to the point store.
//!
//! ## Features
//!
//! - **🔌 Many gateways, one process**: independent listeners started, stopped
//!   and restarted from configuration-change events
//! - **🔄 Two-way data flow**: periodic outward sync of point values, gated
//!   inward writes
//! - **🧮 Data representations**: Int16, Float32 in four byte orders, and
//!   linearly scaled 16-bit integers
//! - **🛡️ Atomic multi-register values**: one guard per register bank, so a
//!   Float32 is never read half-updated
//! - **📊 Status publication**: connected clients and last activity per gateway
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_gateway::{
//!     BroadcastStatusPublisher, GatewayConfig, GatewayManager, GatewaySettings, Mapping,
//!     MemoryConfigStore, MemoryPointStore, RegisterType, Worker,
//! };
//! use voltage_gateway::codec::Endianness;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config_store = Arc::new(MemoryConfigStore::new());
//!     config_store.upsert_gateway(GatewayConfig::new(1, "plant", "0.0.0.0", 5020, 1));
//!     config_store.set_mappings(1, vec![
//!         Mapping::new(1, "temperature", RegisterType::InputRegister, 0).float32(Endianness::BigEndian),
//!     ]);
//!
//!     let point_store = Arc::new(MemoryPointStore::new());
//!     point_store.set_raw_value("temperature", "23.5");
//!
//!     let manager = Arc::new(GatewayManager::new(
//!         config_store,
//!         point_store,
//!         Arc::new(BroadcastStatusPublisher::new(16)),
//!         GatewaySettings::default(),
//!     ));
//!
//!     let (_events_tx, events_rx) = tokio::sync::mpsc::channel(16);
//!     let mut worker = Worker::new(manager);
//!     worker.start(events_rx).await;
//!     tokio::signal::ctrl_c().await.ok();
//!     worker.stop().await;
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  config events  ┌─────────────────┐
//! │    Worker     │────────────────►│ Gateway Manager │
//! │ (sync/status/ │                 └─────────────────┘
//! │  cache loops) │                          │ one per gateway
//! └───────────────┘                 ┌─────────────────┐   ┌─────────────┐
//!                                   │ GatewayInstance │◄─►│ Point Store │
//!                                   └─────────────────┘   └─────────────┘
//!                                            │
//!                                   ┌─────────────────┐
//!                                   │ Modbus TCP      │◄──► Modbus masters
//!                                   │ Server + Bank   │
//!                                   └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Value encodings for registers and coils
pub mod codec;

/// Gateway configuration, mapping and point records
pub mod model;

/// Worker and server settings
pub mod config;

/// Config store, point store and status publisher interfaces
pub mod store;

/// Modbus TCP client used for probing gateways
pub mod client;

/// Modbus TCP server
pub mod server;

/// Register storage shared by a server and its instance
pub mod register_bank;

/// A single gateway: server, bank, mappings
pub mod instance;

/// Instance lifecycle and fan-out
pub mod manager;

/// Periodic loops driving the manager
pub mod worker;

/// Utility functions and performance monitoring
pub mod utils;

/// Logging setup and packet tracing
pub mod logging;

// Re-export main types for convenience
pub use error::{GatewayError, GatewayResult};
pub use protocol::{ModbusRequest, ModbusResponse, ModbusFunction, ModbusException};
pub use codec::{DataRepresentation, Endianness};
pub use model::{
    ChangeType, ConfigChangeEvent, GatewayConfig, GatewayId, GatewayStatus, Mapping, PendingWrite, PointId,
    PointSnapshot, RegisterType,
};
pub use config::GatewaySettings;
pub use store::{
    BroadcastStatusPublisher, ConfigStore, Fixture, MemoryConfigStore, MemoryPointStore, PointStore, StatusPublisher,
};
pub use client::{ClientStats, ModbusClient, ModbusTcpClient};
pub use server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats, WriteEvent, WrittenValues};
pub use register_bank::{RegisterBank, RegisterBankStats};
pub use instance::{GatewayInstance, InstancePhase, SyncSummary};
pub use manager::GatewayManager;
pub use worker::Worker;
pub use utils::{PerformanceMetrics, OperationTimer};
pub use logging::{init_logging, LoggingMode, PacketLogger};

/// Default timeout for client operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of coils that can be read in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Gateway v{} - multi-instance Modbus TCP gateway", VERSION)
}
