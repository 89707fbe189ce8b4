//! # Voltage Gateway Error Handling
//!
//! This module provides error handling for the gateway, covering the Modbus TCP
//! wire protocol, listener lifecycle, and the external configuration and point
//! stores the gateway talks to.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket failures while serving or probing a gateway
//! - **Connection Errors**: bind failures, refused connections
//! - **Timeout Errors**: client requests that exceed their deadline
//!
//! ### Protocol Errors
//! - **Protocol Errors**: Modbus protocol violations
//! - **Frame Errors**: malformed MBAP frames
//! - **Exception Responses**: standard Modbus exception codes
//!
//! ### Data Errors
//! - **Invalid Function**: unsupported function codes
//! - **Invalid Address**: address ranges that leave the 0-65535 space
//! - **Invalid Data**: malformed values and quantities
//!
//! ### System Errors
//! - **Configuration Errors**: invalid listen address, bad settings file
//! - **Store Errors**: failures reported by the config or point store
//! - **Not Found**: unknown gateway ids
//! - **Internal Errors**: poisoned locks and other invariant breaks
//!
//! Codec edge cases never surface here: the codec resolves them to fallback
//! values instead.
//!
//! ## Usage Example
//!
//! ```rust
//! use voltage_gateway::{GatewayError, GatewayResult};
//!
//! fn handle(result: GatewayResult<()>) {
//!     match result {
//!         Ok(()) => {}
//!         Err(error) if error.is_recoverable() => {
//!             println!("will retry on the next cycle: {}", error);
//!         }
//!         Err(error) => println!("fatal: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error types
///
/// Each variant carries enough context to log a useful line; the gateway
/// contains failures at the smallest unit (one mapping, one instance, one loop
/// iteration), so most of these end up in a log rather than a caller.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// I/O related errors
    ///
    /// # Examples
    /// - Socket reset while answering a client
    /// - Settings file missing
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// Bind failures land here; they are fatal to starting that one instance
    /// and to nothing else.
    ///
    /// # Examples
    /// - Port already bound by another process
    /// - Connection refused when probing a gateway
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Invalid address range
    ///
    /// # Examples
    /// - Float32 mapping at address 65535 (needs 65535..=65536)
    /// - Zero quantity in a read request
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value
    ///
    /// # Examples
    /// - Coil value not 0x0000 or 0xFF00
    /// - Reading 200 holding registers (max 125)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Server Device Failure
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    ///
    /// # Examples
    /// - Unparsable listen address
    /// - Malformed settings file
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// External store errors
    ///
    /// Raised by `ConfigStore` / `PointStore` implementations. The gateway
    /// treats them as transient: the next scheduled iteration retries.
    #[error("Store error: {message}")]
    Store { message: String },

    /// Unknown gateway
    #[error("Gateway {gateway_id} not found")]
    NotFound { gateway_id: u32 },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Automatically maps standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Server Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Server Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }.to_string();

        Self::Exception { function, code, message }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store { message: message.into() }
    }

    /// Create a not-found error for a gateway id
    pub fn not_found(gateway_id: u32) -> Self {
        Self::NotFound { gateway_id }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (the next cycle may succeed)
    ///
    /// ```rust
    /// use voltage_gateway::GatewayError;
    ///
    /// assert!(GatewayError::store("point store unavailable").is_recoverable());
    /// assert!(!GatewayError::configuration("bad address").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Store { .. } => true,
            Self::Exception { code, .. } => {
                matches!(code, 0x05 | 0x06) // Acknowledge, Busy
            },
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(self,
            Self::Io { .. } |
            Self::Connection { .. } |
            Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(self,
            Self::Protocol { .. } |
            Self::InvalidFunction { .. } |
            Self::Exception { .. } |
            Self::Frame { .. }
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Specific timeout durations should be supplied by building the error with
/// [`GatewayError::timeout`] directly.
impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}
