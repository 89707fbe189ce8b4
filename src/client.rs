/// Modbus TCP client
///
/// A small master used to probe running gateways (the `gateway_probe`
/// binary) and to drive them from integration tests. It speaks the same
/// eight function codes the gateway serves.

use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{GatewayError, GatewayResult};
use crate::logging::hex_dump;
use crate::protocol::{
    data_utils, MbapHeader, ModbusFunction, ModbusRequest, ModbusResponse, UnitId, MBAP_HEADER_SIZE,
};

/// Trait defining the interface for Modbus client operations
///
/// Function-code names follow the Modbus numbering so traces and code line up.
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01)
    async fn read_01(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> GatewayResult<Vec<bool>>;

    /// Read discrete inputs (function code 0x02)
    async fn read_02(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> GatewayResult<Vec<bool>>;

    /// Read holding registers (function code 0x03)
    async fn read_03(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> GatewayResult<Vec<u16>>;

    /// Read input registers (function code 0x04)
    async fn read_04(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> GatewayResult<Vec<u16>>;

    /// Write single coil (function code 0x05)
    async fn write_05(&mut self, unit_id: UnitId, address: u16, value: bool) -> GatewayResult<()>;

    /// Write single register (function code 0x06)
    async fn write_06(&mut self, unit_id: UnitId, address: u16, value: u16) -> GatewayResult<()>;

    /// Write multiple coils (function code 0x0F)
    async fn write_0f(&mut self, unit_id: UnitId, address: u16, values: &[bool]) -> GatewayResult<()>;

    /// Write multiple registers (function code 0x10)
    async fn write_10(&mut self, unit_id: UnitId, address: u16, values: &[u16]) -> GatewayResult<()>;

    /// Check if client is connected
    fn is_connected(&self) -> bool;

    /// Close the client connection
    async fn close(&mut self) -> GatewayResult<()>;

    /// Get client statistics
    fn get_stats(&self) -> ClientStats;
}

/// Client-side traffic statistics
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Modbus TCP client implementation
pub struct ModbusTcpClient {
    stream: Option<TcpStream>,
    address: SocketAddr,
    timeout: Duration,
    transaction_id: u16,
    stats: ClientStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl ModbusTcpClient {
    /// Connect to a Modbus TCP server
    pub async fn new(address: SocketAddr, timeout: Duration) -> GatewayResult<Self> {
        let stream = TcpStream::connect(address).await
            .map_err(|e| GatewayError::connection(format!("Failed to connect to {}: {}", address, e)))?;

        Ok(Self {
            stream: Some(stream),
            address,
            timeout,
            transaction_id: 0,
            stats: ClientStats::default(),
            packet_logging: false,
        })
    }

    /// Connect using an address string such as `127.0.0.1:502`
    pub async fn from_address(address: &str, timeout: Duration) -> GatewayResult<Self> {
        let address: SocketAddr = address.parse()
            .map_err(|e| GatewayError::configuration(format!("Invalid address '{}': {}", address, e)))?;
        Self::new(address, timeout).await
    }

    /// Get the server address
    pub fn server_address(&self) -> SocketAddr {
        self.address
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Reconnect to the server
    async fn reconnect(&mut self) -> GatewayResult<()> {
        self.stream = None;

        let stream = TcpStream::connect(self.address).await
            .map_err(|e| GatewayError::connection(format!("Failed to reconnect to {}: {}", self.address, e)))?;

        self.stream = Some(stream);
        Ok(())
    }

    /// Get next transaction ID
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Send one request and wait for its response
    ///
    /// Exception responses are returned as `GatewayError::Exception`.
    pub async fn execute_request(&mut self, request: &ModbusRequest) -> GatewayResult<ModbusResponse> {
        request.validate()?;

        if self.stream.is_none() {
            self.reconnect().await?;
        }

        let transaction_id = self.next_transaction_id();
        let frame = MbapHeader::frame(transaction_id, request.unit_id, &request.to_pdu());
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.packet_logging {
            debug!("TCP send to {}: {}", self.address, hex_dump(&frame));
        }

        let response_frame = match timeout(self.timeout, self.exchange(&frame)).await {
            Ok(Ok(response_frame)) => response_frame,
            Ok(Err(e)) => {
                self.stats.errors += 1;
                if e.is_transport_error() {
                    self.stream = None;
                }
                return Err(e);
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                self.stream = None;
                return Err(GatewayError::timeout("modbus request", self.timeout.as_millis() as u64));
            }
        };

        self.stats.responses_received += 1;
        self.stats.bytes_received += response_frame.len() as u64;

        if self.packet_logging {
            debug!("TCP receive from {}: {}", self.address, hex_dump(&response_frame));
        }

        let header = MbapHeader::parse(&response_frame)?;
        if header.transaction_id != transaction_id {
            self.stats.errors += 1;
            return Err(GatewayError::frame(format!(
                "Transaction ID mismatch: sent {}, received {}",
                transaction_id, header.transaction_id
            )));
        }

        let response = Self::decode_response(&response_frame, header)?;
        if let Some(error) = response.get_exception() {
            self.stats.errors += 1;
            return Err(error);
        }

        Ok(response)
    }

    /// Write the frame, then read exactly one response frame
    async fn exchange(&mut self, frame: &[u8]) -> GatewayResult<Vec<u8>> {
        let stream = self.stream.as_mut()
            .ok_or_else(|| GatewayError::connection("Not connected"))?;

        stream.write_all(frame).await?;

        // Read response header first: MBAP + unit id
        let mut header_buf = [0u8; MBAP_HEADER_SIZE + 1];
        stream.read_exact(&mut header_buf).await?;
        let header = MbapHeader::parse(&header_buf)?;

        let mut response_buf = vec![0u8; MBAP_HEADER_SIZE + header.length as usize];
        response_buf[..MBAP_HEADER_SIZE + 1].copy_from_slice(&header_buf);
        stream.read_exact(&mut response_buf[MBAP_HEADER_SIZE + 1..]).await?;
        Ok(response_buf)
    }

    /// Decode response from TCP frame
    fn decode_response(frame: &[u8], header: MbapHeader) -> GatewayResult<ModbusResponse> {
        let function_code = frame[MBAP_HEADER_SIZE + 1];
        let data = &frame[MBAP_HEADER_SIZE + 2..];

        // Check for exception response
        if function_code & 0x80 != 0 {
            let exception_code = *data.first()
                .ok_or_else(|| GatewayError::frame("Invalid exception response"))?;
            return Ok(ModbusResponse::new_exception(
                header.unit_id,
                ModbusFunction::from_u8(function_code & 0x7F)?,
                exception_code,
            ));
        }

        let function = ModbusFunction::from_u8(function_code)?;
        Ok(ModbusResponse::new_success(header.unit_id, function, data.to_vec()))
    }

    async fn read_bits(&mut self, unit_id: UnitId, function: ModbusFunction, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
        let request = ModbusRequest::new_read(unit_id, function, address, quantity);
        let response = self.execute_request(&request).await?;
        response.parse_bits(quantity)
    }

    async fn read_words(&mut self, unit_id: UnitId, function: ModbusFunction, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
        let request = ModbusRequest::new_read(unit_id, function, address, quantity);
        let response = self.execute_request(&request).await?;
        let registers = response.parse_registers()?;
        if registers.len() != quantity as usize {
            return Err(GatewayError::frame(format!(
                "Expected {} registers, received {}", quantity, registers.len()
            )));
        }
        Ok(registers)
    }

    async fn write(&mut self, unit_id: UnitId, function: ModbusFunction, address: u16, quantity: u16, data: Vec<u8>) -> GatewayResult<()> {
        let request = ModbusRequest {
            unit_id,
            function,
            address,
            quantity,
            data,
        };
        self.execute_request(&request).await?;
        Ok(())
    }
}

#[async_trait]
impl ModbusClient for ModbusTcpClient {
    async fn read_01(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
        self.read_bits(unit_id, ModbusFunction::ReadCoils, address, quantity).await
    }

    async fn read_02(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
        self.read_bits(unit_id, ModbusFunction::ReadDiscreteInputs, address, quantity).await
    }

    async fn read_03(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
        self.read_words(unit_id, ModbusFunction::ReadHoldingRegisters, address, quantity).await
    }

    async fn read_04(&mut self, unit_id: UnitId, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
        self.read_words(unit_id, ModbusFunction::ReadInputRegisters, address, quantity).await
    }

    async fn write_05(&mut self, unit_id: UnitId, address: u16, value: bool) -> GatewayResult<()> {
        let data = if value { vec![0xFF, 0x00] } else { vec![0x00, 0x00] };
        self.write(unit_id, ModbusFunction::WriteSingleCoil, address, 1, data).await
    }

    async fn write_06(&mut self, unit_id: UnitId, address: u16, value: u16) -> GatewayResult<()> {
        self.write(unit_id, ModbusFunction::WriteSingleRegister, address, 1, value.to_be_bytes().to_vec()).await
    }

    async fn write_0f(&mut self, unit_id: UnitId, address: u16, values: &[bool]) -> GatewayResult<()> {
        if values.is_empty() || values.len() > 1968 {
            return Err(GatewayError::invalid_data(format!("Invalid coil count: {}", values.len())));
        }
        let data = data_utils::pack_bits(values);
        self.write(unit_id, ModbusFunction::WriteMultipleCoils, address, values.len() as u16, data).await
    }

    async fn write_10(&mut self, unit_id: UnitId, address: u16, values: &[u16]) -> GatewayResult<()> {
        if values.is_empty() || values.len() > 123 {
            return Err(GatewayError::invalid_data(format!("Invalid register count: {}", values.len())));
        }
        let data = data_utils::registers_to_bytes(values);
        self.write(unit_id, ModbusFunction::WriteMultipleRegisters, address, values.len() as u16, data).await
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> GatewayResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn get_stats(&self) -> ClientStats {
        self.stats.clone()
    }
}
