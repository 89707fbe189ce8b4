/// Modbus TCP server for one gateway instance
///
/// This module provides the listener side of a gateway: MBAP framing, the
/// eight supported function codes, unit-id filtering, per-client tasks, and
/// the write-event subscription the owning instance uses to learn about
/// client writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use log::{info, error, debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::logging::PacketLogger;
use crate::model::RegisterType;
use crate::protocol::{data_utils, MbapHeader, ModbusException, ModbusFunction, UnitId, MBAP_HEADER_SIZE};
use crate::register_bank::{RegisterBank, RegisterBankStats};
use crate::utils::validation;

/// Largest quantity accepted by Write Multiple Coils (0x0F)
const MAX_WRITE_COILS: u16 = 0x07B0;

/// Largest quantity accepted by Write Multiple Registers (0x10)
const MAX_WRITE_REGISTERS: u16 = 0x007B;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Bind and start accepting clients
    async fn start(&mut self) -> GatewayResult<()>;

    /// Stop accepting, close every client connection, release the port
    async fn stop(&mut self) -> GatewayResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;

    /// Get register bank reference
    fn register_bank(&self) -> &RegisterBank;
}

/// Values a client write stored, aligned with [`WriteEvent::addresses`]
#[derive(Debug, Clone, PartialEq)]
pub enum WrittenValues {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

/// A client write that landed in the register bank
///
/// Carries the written values themselves, so a sync pass that overwrites
/// the bank before the event is dispatched cannot change what gets forwarded.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEvent {
    /// Coil or HoldingRegister
    pub register_type: RegisterType,
    /// Every address the request touched, in ascending order
    pub addresses: Vec<u16>,
    pub values: WrittenValues,
    pub timestamp: DateTime<Utc>,
}

impl WriteEvent {
    /// Event for coils written from `address` on
    pub fn coils(address: u16, values: &[bool]) -> Self {
        Self {
            register_type: RegisterType::Coil,
            addresses: Self::span(address, values.len()),
            values: WrittenValues::Bits(values.to_vec()),
            timestamp: Utc::now(),
        }
    }

    /// Event for holding registers written from `address` on
    pub fn registers(address: u16, values: &[u16]) -> Self {
        Self {
            register_type: RegisterType::HoldingRegister,
            addresses: Self::span(address, values.len()),
            values: WrittenValues::Words(values.to_vec()),
            timestamp: Utc::now(),
        }
    }

    fn span(address: u16, len: usize) -> Vec<u16> {
        (0..len).map(|i| address.wrapping_add(i as u16)).collect()
    }

    fn offset(&self, address: u16) -> Option<usize> {
        self.addresses.iter().position(|&a| a == address)
    }

    /// Bit the request wrote at `address`, if any
    pub fn bit_at(&self, address: u16) -> Option<bool> {
        match &self.values {
            WrittenValues::Bits(bits) => self.offset(address).and_then(|i| bits.get(i).copied()),
            WrittenValues::Words(_) => None,
        }
    }

    /// Register the request wrote at `address`, if any
    pub fn word_at(&self, address: u16) -> Option<u16> {
        match &self.values {
            WrittenValues::Words(words) => self.offset(address).and_then(|i| words.get(i).copied()),
            WrittenValues::Bits(_) => None,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub register_bank_stats: Option<RegisterBankStats>,
}

/// Modbus TCP server configuration
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    /// Requests for any other unit id get exception 0x0B
    pub unit_id: UnitId,
    pub max_connections: usize,
    pub request_timeout: Duration,
    pub packet_logging: bool,
}

impl ModbusTcpServerConfig {
    pub fn new(bind_address: SocketAddr, unit_id: UnitId) -> Self {
        Self {
            bind_address,
            unit_id,
            max_connections: 100,
            request_timeout: Duration::from_secs(30),
            packet_logging: false,
        }
    }
}

/// Result of processing one request frame
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    /// Complete response frame, MBAP header included
    pub response: Vec<u8>,
    /// Set when the request was answered with an exception
    pub exception: Option<ModbusException>,
    /// Set when the request changed the coil or holding-register bank
    pub write: Option<WriteEvent>,
}

type WriteSubscription = Arc<Mutex<Option<mpsc::Sender<WriteEvent>>>>;

/// State shared between the accept loop and every client task
#[derive(Clone)]
struct Shared {
    register_bank: RegisterBank,
    stats: Arc<Mutex<ServerStats>>,
    connected_clients: Arc<AtomicUsize>,
    write_tx: WriteSubscription,
    packet_logger: Option<PacketLogger>,
    unit_id: UnitId,
    request_timeout: Duration,
    max_connections: usize,
}

/// Modbus TCP server implementation
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    shared: Shared,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl ModbusTcpServer {
    /// Create a server over an existing register bank
    pub fn with_config(config: ModbusTcpServerConfig, register_bank: RegisterBank) -> Self {
        let packet_logger = config.packet_logging
            .then(|| PacketLogger::new(format!("{}", config.bind_address)));
        let shared = Shared {
            register_bank,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            connected_clients: Arc::new(AtomicUsize::new(0)),
            write_tx: Arc::new(Mutex::new(None)),
            packet_logger,
            unit_id: config.unit_id,
            request_timeout: config.request_timeout,
            max_connections: config.max_connections,
        };

        Self {
            config,
            shared,
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
            start_time: None,
        }
    }

    /// Address actually bound, available while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of currently connected clients
    pub fn connected_clients(&self) -> usize {
        self.shared.connected_clients.load(Ordering::Relaxed)
    }

    /// Route future client writes into a bounded queue
    ///
    /// Replaces any previous subscription.
    pub fn subscribe_writes(&self, capacity: usize) -> mpsc::Receiver<WriteEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.shared.write_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Drop the write subscription; the receiver sees the queue close
    pub fn unsubscribe_writes(&self) {
        self.shared.write_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Handle client connection
    async fn handle_client(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        shared: Shared,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("📡 New client connected: {}", peer_addr);

        loop {
            let frame = tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer_addr);
                    break;
                }
                result = timeout(shared.request_timeout, Self::read_frame(&mut stream)) => {
                    match result {
                        Ok(Ok(Some(frame))) => frame,
                        Ok(Ok(None)) => {
                            debug!("Client {} closed the connection", peer_addr);
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!("Dropping client {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            warn!("Read timeout from {}", peer_addr);
                            break;
                        }
                    }
                }
            };

            if let Some(logger) = &shared.packet_logger {
                logger.log_frame("RX", peer_addr, &frame);
            }

            let outcome = match Self::process_request(&frame, &shared.register_bank, shared.unit_id) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Error processing request from {}: {}", peer_addr, e);
                    shared.record(|stats| stats.failed_requests += 1);
                    break;
                }
            };

            if let Some(event) = outcome.write.clone() {
                shared.publish_write(event);
            }

            if let Some(logger) = &shared.packet_logger {
                logger.log_frame("TX", peer_addr, &outcome.response);
            }

            if let Err(e) = stream.write_all(&outcome.response).await {
                error!("Failed to send response to {}: {}", peer_addr, e);
                break;
            }

            let received = frame.len() as u64;
            let sent = outcome.response.len() as u64;
            let failed = outcome.exception.is_some();
            shared.record(|stats| {
                stats.total_requests += 1;
                stats.bytes_received += received;
                stats.bytes_sent += sent;
                if failed {
                    stats.failed_requests += 1;
                } else {
                    stats.successful_requests += 1;
                }
            });
        }

        shared.connected_clients.fetch_sub(1, Ordering::Relaxed);
        info!("🔌 Client {} disconnected", peer_addr);
    }

    /// Read one complete MBAP frame
    ///
    /// Returns `None` on a clean close before the first header byte.
    async fn read_frame(stream: &mut TcpStream) -> GatewayResult<Option<Vec<u8>>> {
        let mut header = [0u8; MBAP_HEADER_SIZE + 1];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mbap = MbapHeader::parse(&header)?;
        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + mbap.length as usize);
        frame.extend_from_slice(&header);
        frame.resize(MBAP_HEADER_SIZE + mbap.length as usize, 0);
        stream.read_exact(&mut frame[MBAP_HEADER_SIZE + 1..]).await?;
        Ok(Some(frame))
    }

    /// Process one complete request frame against the register bank
    ///
    /// Malformed MBAP headers are errors (the connection is dropped); every
    /// problem past the header is answered with a Modbus exception.
    pub fn process_request(
        frame: &[u8],
        register_bank: &RegisterBank,
        unit_id: UnitId,
    ) -> GatewayResult<RequestOutcome> {
        let header = MbapHeader::parse(frame)?;
        let end = MBAP_HEADER_SIZE + header.length as usize;
        if frame.len() < end {
            return Err(GatewayError::frame("Incomplete frame"));
        }

        let pdu = &frame[MBAP_HEADER_SIZE + 1..end];
        let function_code = pdu[0];
        let data = &pdu[1..];

        debug!("Processing request: TID={}, Function=0x{:02x}, Unit={}",
               header.transaction_id, function_code, header.unit_id);

        if header.unit_id != unit_id {
            debug!("Unit {} not served here (configured {})", header.unit_id, unit_id);
            return Ok(Self::exception_outcome(
                &header,
                function_code,
                ModbusException::GatewayTargetDeviceFailedToRespond,
            ));
        }

        let function = match ModbusFunction::from_u8(function_code) {
            Ok(function) => function,
            Err(_) => {
                return Ok(Self::exception_outcome(&header, function_code, ModbusException::IllegalFunction));
            }
        };

        let result = match function {
            ModbusFunction::ReadCoils => Self::handle_read_bits(data, register_bank, RegisterType::Coil),
            ModbusFunction::ReadDiscreteInputs => Self::handle_read_bits(data, register_bank, RegisterType::DiscreteInput),
            ModbusFunction::ReadHoldingRegisters => Self::handle_read_words(data, register_bank, RegisterType::HoldingRegister),
            ModbusFunction::ReadInputRegisters => Self::handle_read_words(data, register_bank, RegisterType::InputRegister),
            ModbusFunction::WriteSingleCoil => Self::handle_write_single_coil(data, register_bank),
            ModbusFunction::WriteSingleRegister => Self::handle_write_single_register(data, register_bank),
            ModbusFunction::WriteMultipleCoils => Self::handle_write_multiple_coils(data, register_bank),
            ModbusFunction::WriteMultipleRegisters => Self::handle_write_multiple_registers(data, register_bank),
        };

        match result {
            Ok((response_data, write)) => {
                let mut pdu = Vec::with_capacity(1 + response_data.len());
                pdu.push(function_code);
                pdu.extend_from_slice(&response_data);
                Ok(RequestOutcome {
                    response: MbapHeader::frame(header.transaction_id, header.unit_id, &pdu),
                    exception: None,
                    write,
                })
            }
            Err(e) => {
                debug!("Request 0x{:02x} rejected: {}", function_code, e);
                Ok(Self::exception_outcome(&header, function_code, ModbusException::from_error(&e)))
            }
        }
    }

    fn exception_outcome(header: &MbapHeader, function_code: u8, exception: ModbusException) -> RequestOutcome {
        RequestOutcome {
            response: Self::create_error_response(header, function_code, exception.to_u8()),
            exception: Some(exception),
            write: None,
        }
    }

    /// Address and quantity at the head of every request PDU
    fn address_quantity(data: &[u8]) -> GatewayResult<(u16, u16)> {
        if data.len() < 4 {
            return Err(GatewayError::invalid_data("Request data too short"));
        }
        Ok((
            u16::from_be_bytes([data[0], data[1]]),
            u16::from_be_bytes([data[2], data[3]]),
        ))
    }

    /// Handle read coils (0x01) and read discrete inputs (0x02)
    fn handle_read_bits(
        data: &[u8],
        register_bank: &RegisterBank,
        bank: RegisterType,
    ) -> GatewayResult<(Vec<u8>, Option<WriteEvent>)> {
        let (address, quantity) = Self::address_quantity(data)?;
        validation::validate_coil_count(quantity)?;

        let bits = register_bank.lock()?.read_bits(bank, address, quantity)?;
        let packed = data_utils::pack_bits(&bits);

        let mut response = Vec::with_capacity(1 + packed.len());
        response.push(packed.len() as u8);
        response.extend_from_slice(&packed);
        Ok((response, None))
    }

    /// Handle read holding registers (0x03) and read input registers (0x04)
    fn handle_read_words(
        data: &[u8],
        register_bank: &RegisterBank,
        bank: RegisterType,
    ) -> GatewayResult<(Vec<u8>, Option<WriteEvent>)> {
        let (address, quantity) = Self::address_quantity(data)?;
        validation::validate_register_count(quantity)?;

        let registers = register_bank.lock()?.read_words(bank, address, quantity)?;

        let mut response = Vec::with_capacity(1 + registers.len() * 2);
        response.push((quantity * 2) as u8);
        response.extend_from_slice(&data_utils::registers_to_bytes(&registers));
        Ok((response, None))
    }

    /// Handle write single coil (0x05)
    fn handle_write_single_coil(
        data: &[u8],
        register_bank: &RegisterBank,
    ) -> GatewayResult<(Vec<u8>, Option<WriteEvent>)> {
        let (address, value) = Self::address_quantity(data)?;

        let coil_value = match value {
            0x0000 => false,
            0xFF00 => true,
            _ => return Err(GatewayError::invalid_data(format!("Invalid coil value: 0x{:04X}", value))),
        };

        register_bank.write_single_coil(address, coil_value)?;

        // Echo back the request
        Ok((data[..4].to_vec(), Some(WriteEvent::coils(address, &[coil_value]))))
    }

    /// Handle write single register (0x06)
    fn handle_write_single_register(
        data: &[u8],
        register_bank: &RegisterBank,
    ) -> GatewayResult<(Vec<u8>, Option<WriteEvent>)> {
        let (address, value) = Self::address_quantity(data)?;

        register_bank.write_single_register(address, value)?;

        // Echo back the request
        Ok((data[..4].to_vec(), Some(WriteEvent::registers(address, &[value]))))
    }

    /// Handle write multiple coils (0x0F)
    fn handle_write_multiple_coils(
        data: &[u8],
        register_bank: &RegisterBank,
    ) -> GatewayResult<(Vec<u8>, Option<WriteEvent>)> {
        let (address, quantity) = Self::address_quantity(data)?;
        if quantity == 0 || quantity > MAX_WRITE_COILS {
            return Err(GatewayError::invalid_data(format!("Invalid coil count: {}", quantity)));
        }

        let byte_count = *data.get(4)
            .ok_or_else(|| GatewayError::invalid_data("Missing byte count"))? as usize;
        if byte_count != (quantity as usize + 7) / 8 || data.len() < 5 + byte_count {
            return Err(GatewayError::invalid_data("Byte count does not match coil count"));
        }

        let coils = data_utils::unpack_bits(&data[5..5 + byte_count], quantity as usize);
        register_bank.write_multiple_coils(address, &coils)?;

        // Return address and quantity
        Ok((data[..4].to_vec(), Some(WriteEvent::coils(address, &coils))))
    }

    /// Handle write multiple registers (0x10)
    fn handle_write_multiple_registers(
        data: &[u8],
        register_bank: &RegisterBank,
    ) -> GatewayResult<(Vec<u8>, Option<WriteEvent>)> {
        let (address, quantity) = Self::address_quantity(data)?;
        if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
            return Err(GatewayError::invalid_data(format!("Invalid register count: {}", quantity)));
        }

        let byte_count = *data.get(4)
            .ok_or_else(|| GatewayError::invalid_data("Missing byte count"))? as usize;
        if byte_count != quantity as usize * 2 || data.len() < 5 + byte_count {
            return Err(GatewayError::invalid_data("Byte count does not match register count"));
        }

        let registers = data_utils::bytes_to_registers(&data[5..5 + byte_count])?;
        register_bank.write_multiple_registers(address, &registers)?;

        // Return address and quantity
        Ok((data[..4].to_vec(), Some(WriteEvent::registers(address, &registers))))
    }

    /// Create error response
    fn create_error_response(header: &MbapHeader, function_code: u8, exception_code: u8) -> Vec<u8> {
        // Set exception bit
        MbapHeader::frame(header.transaction_id, header.unit_id, &[function_code | 0x80, exception_code])
    }
}

impl Shared {
    fn record<F: FnOnce(&mut ServerStats)>(&self, update: F) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Hand a write event to the subscriber without waiting on it
    fn publish_write(&self, event: WriteEvent) {
        let tx = self.write_tx.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(tx) = tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Write queue full, dropping {} write at {:?}", event.register_type, event.addresses);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Write subscriber gone");
            }
        }
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> GatewayResult<()> {
        if self.is_running() {
            return Err(GatewayError::protocol("Server is already running"));
        }

        info!("🚀 Starting Modbus TCP server on {}", self.config.bind_address);

        let listener = TcpListener::bind(self.config.bind_address).await
            .map_err(|e| GatewayError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e)))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.local_addr = Some(local_addr);
        self.start_time = Some(Instant::now());

        info!("✅ Modbus TCP server listening on {} (unit {}, max {} connections, timeout {:?})",
              local_addr, self.config.unit_id, self.config.max_connections, self.config.request_timeout);

        let shared = self.shared.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                if shared.connected_clients.load(Ordering::Relaxed) >= shared.max_connections {
                                    warn!("Refusing {}: connection limit {} reached", addr, shared.max_connections);
                                    continue;
                                }

                                shared.connected_clients.fetch_add(1, Ordering::Relaxed);
                                shared.record(|stats| stats.connections_count += 1);

                                let shared = shared.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_client(stream, addr, shared, shutdown_rx).await;
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping server on {}", local_addr);
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn stop(&mut self) -> GatewayResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        // The listener lives in the accept task; wait so the port is free on return
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Accept task ended abnormally: {}", e);
            }
        }

        if let Some(addr) = self.local_addr.take() {
            info!("⏹️  Modbus TCP server on {} stopped", addr);
        }
        self.start_time = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.accept_task.as_ref().map_or(false, |task| !task.is_finished())
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();

        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }

        stats.register_bank_stats = self.shared.register_bank.get_stats().ok();
        stats
    }

    fn register_bank(&self) -> &RegisterBank {
        &self.shared.register_bank
    }
}
