//! Gateway data model
//!
//! These are the records the gateway reads from the configuration and point
//! stores. The gateway owns none of them; it only holds snapshots.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::codec::{DataRepresentation, Endianness};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::UnitId;
use crate::utils::validation;

/// Gateway identifier
pub type GatewayId = u32;

/// Monitoring point identifier
pub type PointId = String;

/// Point metadata keyed by point id, used for the editability gate
pub type ItemsCache = HashMap<PointId, PointSnapshot>;

/// Shared, immutable items cache snapshot
pub type SharedItemsCache = Arc<ItemsCache>;

/// The four Modbus data banks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterType {
    /// Read/write bit (FC 01/05/15)
    Coil,
    /// Read-only bit (FC 02)
    DiscreteInput,
    /// Read/write word (FC 03/06/16)
    HoldingRegister,
    /// Read-only word (FC 04)
    InputRegister,
}

impl RegisterType {
    /// Whether the bank holds single bits
    pub const fn is_bit(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::DiscreteInput)
    }

    /// Whether Modbus masters may write to the bank
    pub const fn is_writable(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::HoldingRegister)
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterType::Coil => "coil",
            RegisterType::DiscreteInput => "discrete input",
            RegisterType::HoldingRegister => "holding register",
            RegisterType::InputRegister => "input register",
        };
        write!(f, "{}", name)
    }
}

/// One configured Modbus TCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub id: GatewayId,
    pub name: String,
    pub listen_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: UnitId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub connected_clients: usize,
    #[serde(default)]
    pub last_read: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_write: Option<DateTime<Utc>>,
}

fn default_port() -> u16 {
    crate::DEFAULT_TCP_PORT
}

fn default_unit_id() -> UnitId {
    1
}

fn default_enabled() -> bool {
    true
}

impl GatewayConfig {
    /// Create an enabled gateway with no recorded stats
    pub fn new<S: Into<String>>(id: GatewayId, name: S, listen_address: S, port: u16, unit_id: UnitId) -> Self {
        Self {
            id,
            name: name.into(),
            listen_address: listen_address.into(),
            port,
            unit_id,
            enabled: true,
            connected_clients: 0,
            last_read: None,
            last_write: None,
        }
    }

    /// Socket address to bind
    ///
    /// An empty listen address or `*` binds every interface.
    pub fn bind_address(&self) -> GatewayResult<SocketAddr> {
        let host = self.listen_address.trim();
        let ip: IpAddr = if host.is_empty() || host == "*" {
            IpAddr::from([0, 0, 0, 0])
        } else {
            host.parse().map_err(|e| {
                GatewayError::configuration(format!(
                    "Gateway {}: invalid listen address '{}': {}",
                    self.id, host, e
                ))
            })?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Binding between one monitoring point and one protocol address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub gateway_id: GatewayId,
    pub point_id: PointId,
    pub register_type: RegisterType,
    pub address: u16,
    #[serde(default)]
    pub representation: DataRepresentation,
    #[serde(default)]
    pub endianness: Endianness,
    #[serde(default)]
    pub scale_min: f64,
    #[serde(default)]
    pub scale_max: f64,
}

impl Mapping {
    /// Create an Int16 mapping; adjust the representation with the builders
    pub fn new<S: Into<String>>(gateway_id: GatewayId, point_id: S, register_type: RegisterType, address: u16) -> Self {
        Self {
            gateway_id,
            point_id: point_id.into(),
            register_type,
            address,
            representation: DataRepresentation::Int16,
            endianness: Endianness::BigEndian,
            scale_min: 0.0,
            scale_max: 0.0,
        }
    }

    pub fn float32(mut self, endianness: Endianness) -> Self {
        self.representation = DataRepresentation::Float32;
        self.endianness = endianness;
        self
    }

    pub fn scaled(mut self, scale_min: f64, scale_max: f64) -> Self {
        self.representation = DataRepresentation::ScaledInteger;
        self.scale_min = scale_min;
        self.scale_max = scale_max;
        self
    }

    /// Number of addresses the mapping occupies
    ///
    /// Derived from the representation for word banks; bit banks always span
    /// a single address.
    pub fn register_count(&self) -> u16 {
        if self.register_type.is_bit() {
            1
        } else {
            self.representation.register_count()
        }
    }

    /// Whether `address` falls inside this mapping's range
    pub fn contains(&self, address: u16) -> bool {
        let start = self.address as u32;
        let end = start + self.register_count() as u32;
        (start..end).contains(&(address as u32))
    }

    /// Check that the whole range fits in the 0-65535 address space
    pub fn validate(&self) -> GatewayResult<()> {
        validation::validate_address_range(self.address, self.register_count())
    }
}

/// Eventually-consistent view of one monitoring point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointSnapshot {
    pub id: PointId,
    #[serde(default)]
    pub raw_value: Option<String>,
    #[serde(default)]
    pub pending_value: Option<String>,
    #[serde(default)]
    pub editable: bool,
}

/// A value written by an operator that overrides the raw value for a while
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub point_id: PointId,
    pub value: String,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: i64,
}

impl PendingWrite {
    /// Whether the override still applies at `now`
    ///
    /// A window past the representable date range never expires when the
    /// duration is positive and is already over when it is negative.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match ChronoDuration::try_seconds(self.duration_seconds)
            .and_then(|window| self.timestamp.checked_add_signed(window))
        {
            Some(expiry) => now < expiry,
            None => self.duration_seconds > 0,
        }
    }
}

/// Runtime snapshot published for every running gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub gateway_id: GatewayId,
    pub name: String,
    pub connected_clients: usize,
    pub last_read: Option<DateTime<Utc>>,
    pub last_write: Option<DateTime<Utc>>,
}

/// Kind of configuration change delivered by the message bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Added,
    Updated,
    Deleted,
}

/// Inbound configuration change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChangeEvent {
    pub gateway_id: GatewayId,
    pub change_type: ChangeType,
}
