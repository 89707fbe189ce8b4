//! Logging setup and Modbus packet tracing
//!
//! Everything in the crate logs through the `log` facade. Binaries call
//! [`init_logging`] once; libraries embedding the gateway install whatever
//! logger they like instead.
//!
//! [`PacketLogger`] renders raw MBAP frames as hex together with an
//! interpreted summary of the PDU. Servers enable it with the
//! `packet_logging` setting.

use log::{debug, info, LevelFilter};
use std::net::SocketAddr;

use crate::protocol::{ModbusFunction, MBAP_HEADER_SIZE};

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw packet data only
    Raw,
    /// Show interpreted packet data with field descriptions
    Interpreted,
    /// Interpreted at info, raw hex at debug
    Both,
}

/// Install `env_logger` with `default_filter` unless `RUST_LOG` is set
///
/// Calling it twice is harmless; the second call is ignored.
pub fn init_logging(default_filter: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(default_filter)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Per-server packet tracer
#[derive(Debug, Clone)]
pub struct PacketLogger {
    label: String,
    mode: LoggingMode,
}

impl PacketLogger {
    /// Create a tracer in `Both` mode; `label` identifies the server
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self::with_mode(label, LoggingMode::Both)
    }

    /// Create a tracer with specific mode
    pub fn with_mode<S: Into<String>>(label: S, mode: LoggingMode) -> Self {
        Self {
            label: label.into(),
            mode,
        }
    }

    /// Log one complete MBAP frame
    pub fn log_frame(&self, direction: &str, peer: SocketAddr, frame: &[u8]) {
        match self.mode {
            LoggingMode::Raw => {
                info!("[{}] {} {} Raw: {}", self.label, direction, peer, hex_dump(frame));
            }
            LoggingMode::Interpreted => {
                info!("[{}] {} {} {}", self.label, direction, peer, interpret_frame(frame));
            }
            LoggingMode::Both => {
                info!("[{}] {} {} {}", self.label, direction, peer, interpret_frame(frame));
                debug!("[{}] {} {} Raw: {}", self.label, direction, peer, hex_dump(frame));
            }
        }
    }
}

/// Upper-case hex bytes separated by spaces
pub fn hex_dump(data: &[u8]) -> String {
    let encoded = hex::encode_upper(data);
    let mut out = String::with_capacity(encoded.len() + data.len());
    for (i, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.extend(pair.iter().map(|&b| b as char));
    }
    out
}

/// Summarize an MBAP frame: header fields, function name, decoded payload
///
/// Request and response layouts share function codes, so the payload is
/// described by shape rather than direction.
pub fn interpret_frame(frame: &[u8]) -> String {
    if frame.len() < MBAP_HEADER_SIZE + 2 {
        return format!("Short frame: {}", hex::encode(frame));
    }

    let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
    let unit_id = frame[6];
    let function_code = frame[7];
    let data = &frame[MBAP_HEADER_SIZE + 2..];

    if function_code & 0x80 != 0 {
        let code = data.first().copied().unwrap_or(0);
        return format!(
            "TID: {}, Unit: {}, Exception for 0x{:02X}: code 0x{:02X}",
            transaction_id, unit_id, function_code & 0x7F, code
        );
    }

    let function_name = ModbusFunction::from_u8(function_code)
        .map(|f| f.to_string())
        .unwrap_or_else(|_| format!("Unknown Function (0x{:02X})", function_code));

    format!(
        "TID: {}, Unit: {}, Function: {}, {}",
        transaction_id, unit_id, function_name, interpret_data(function_code, data)
    )
}

fn interpret_data(function_code: u8, data: &[u8]) -> String {
    if data.is_empty() {
        return "No data".to_string();
    }

    match function_code {
        // Requests carry address + quantity; responses a byte count
        0x01..=0x04 if data.len() == 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let quantity = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: {}, Quantity: {}", address, quantity)
        }
        0x01 | 0x02 => {
            let byte_count = data[0];
            let bits: Vec<bool> = data[1..].iter()
                .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
                .take(16)
                .collect();
            format!("Byte count: {}, Bits: {:?}", byte_count, bits)
        }
        0x03 | 0x04 => {
            let byte_count = data[0];
            let registers: Vec<u16> = data[1..].chunks_exact(2)
                .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                .take(8)
                .collect();
            format!("Byte count: {}, Registers: {:?}", byte_count, registers)
        }
        0x05 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: {}, Value: 0x{:04X} ({})", address, value, if value == 0xFF00 { "ON" } else { "OFF" })
        }
        0x06 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
        }
        0x0F | 0x10 if data.len() >= 4 => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let quantity = u16::from_be_bytes([data[2], data[3]]);
            format!("Address: {}, Quantity: {}", address, quantity)
        }
        _ => format!("Data: {}", hex::encode(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x00, 0x01, 0xAB]), "00 01 AB");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_interpret_read_request_and_response() {
        let request = [0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x0A, 0x00, 0x02];
        let summary = interpret_frame(&request);
        assert!(summary.contains("TID: 7"));
        assert!(summary.contains("Read Holding Registers"));
        assert!(summary.contains("Address: 10, Quantity: 2"));

        let response = [0x00, 0x07, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x41, 0xBC, 0x00, 0x00];
        assert!(interpret_frame(&response).contains("Registers: [16828, 0]"));
    }

    #[test]
    fn test_interpret_exception_and_short_frames() {
        let exception = [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x09, 0x83, 0x0B];
        assert!(interpret_frame(&exception).contains("Exception for 0x03: code 0x0B"));
        assert!(interpret_frame(&[0x00, 0x01]).starts_with("Short frame"));
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging(LevelFilter::Debug);
        init_logging(LevelFilter::Info);
    }
}
