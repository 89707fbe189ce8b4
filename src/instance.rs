//! One running gateway: a Modbus TCP server plus its point bindings
//!
//! A [`GatewayInstance`] owns the register bank its server answers from,
//! the current mapping list and a snapshot of point metadata (the items
//! cache). Values flow two ways:
//!
//! - outward, `sync_registers_from_source` copies point values into the bank;
//! - inward, client writes are queued by the server, checked against the
//!   items cache and forwarded to the point store.
//!
//! Lifecycle is `Stopped -> Starting -> Running -> Stopping -> Stopped`.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{self, DataRepresentation};
use crate::config::GatewaySettings;
use crate::error::{GatewayError, GatewayResult};
use crate::model::{
    GatewayConfig, GatewayId, GatewayStatus, ItemsCache, Mapping, PendingWrite, PointId, SharedItemsCache,
};
use crate::register_bank::{RegisterBank, RegisterFile};
use crate::server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, WriteEvent};
use crate::store::PointStore;
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Lifecycle phase of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Counts from one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub written: usize,
    /// Mappings whose point had neither a pending nor a raw value
    pub skipped: usize,
    pub failed: usize,
}

/// Mutable runtime record, guarded as a whole
struct InstanceState {
    phase: InstancePhase,
    server: Option<ModbusTcpServer>,
    dispatcher: Option<JoinHandle<()>>,
    last_read: Option<DateTime<Utc>>,
    last_write: Option<DateTime<Utc>>,
    sync_metrics: PerformanceMetrics,
}

/// A single configured Modbus TCP gateway
pub struct GatewayInstance {
    config: GatewayConfig,
    settings: Arc<GatewaySettings>,
    register_bank: RegisterBank,
    mappings: ArcSwap<Vec<Mapping>>,
    items_cache: ArcSwap<ItemsCache>,
    point_store: Arc<dyn PointStore>,
    state: Mutex<InstanceState>,
}

impl GatewayInstance {
    /// Create a stopped instance with no mappings and an empty items cache
    pub fn new(config: GatewayConfig, point_store: Arc<dyn PointStore>, settings: Arc<GatewaySettings>) -> Self {
        Self {
            config,
            settings,
            register_bank: RegisterBank::new(),
            mappings: ArcSwap::from_pointee(Vec::new()),
            items_cache: ArcSwap::from_pointee(ItemsCache::new()),
            point_store,
            state: Mutex::new(InstanceState {
                phase: InstancePhase::Stopped,
                server: None,
                dispatcher: None,
                last_read: None,
                last_write: None,
                sync_metrics: PerformanceMetrics::new(),
            }),
        }
    }

    pub fn id(&self) -> GatewayId {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn register_bank(&self) -> &RegisterBank {
        &self.register_bank
    }

    fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> InstancePhase {
        self.lock_state().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == InstancePhase::Running
    }

    /// Bound listener address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_state().server.as_ref().and_then(|s| s.local_addr())
    }

    pub fn connected_clients(&self) -> usize {
        self.lock_state().server.as_ref().map_or(0, |s| s.connected_clients())
    }

    /// Sync pass timings since the last start
    ///
    /// A pass counts as failed when it errored or any mapping failed to encode.
    pub fn sync_metrics(&self) -> PerformanceMetrics {
        self.lock_state().sync_metrics.clone()
    }

    /// Snapshot for status publication
    pub fn status(&self) -> GatewayStatus {
        let state = self.lock_state();
        GatewayStatus {
            gateway_id: self.config.id,
            name: self.config.name.clone(),
            connected_clients: state.server.as_ref().map_or(0, |s| s.connected_clients()),
            last_read: state.last_read,
            last_write: state.last_write,
        }
    }

    /// Bind the listener and start dispatching client writes
    ///
    /// A no-op unless the instance is stopped. Bind failures are returned and
    /// leave the instance stopped.
    pub async fn start(self: &Arc<Self>) -> GatewayResult<()> {
        {
            let mut state = self.lock_state();
            if state.phase != InstancePhase::Stopped {
                warn!("Gateway {} ({}) is {:?}, not starting", self.config.id, self.config.name, state.phase);
                return Ok(());
            }
            state.phase = InstancePhase::Starting;
        }

        let mut server = match self.build_server() {
            Ok(server) => server,
            Err(e) => {
                self.lock_state().phase = InstancePhase::Stopped;
                return Err(e);
            }
        };

        if let Err(e) = server.start().await {
            self.lock_state().phase = InstancePhase::Stopped;
            return Err(e);
        }

        let writes = server.subscribe_writes(self.settings.write_queue_capacity);
        let dispatcher = tokio::spawn(Arc::clone(self).dispatch_writes(writes));
        let local_addr = server.local_addr();

        {
            let mut state = self.lock_state();
            state.server = Some(server);
            state.dispatcher = Some(dispatcher);
            state.phase = InstancePhase::Running;
        }

        info!(
            "✅ Gateway {} ({}) running on {} with unit id {}",
            self.config.id,
            self.config.name,
            local_addr.map_or_else(|| "?".to_string(), |a| a.to_string()),
            self.config.unit_id
        );
        Ok(())
    }

    fn build_server(&self) -> GatewayResult<ModbusTcpServer> {
        let mut server_config = ModbusTcpServerConfig::new(self.config.bind_address()?, self.config.unit_id);
        server_config.max_connections = self.settings.max_connections;
        server_config.request_timeout = self.settings.request_timeout();
        server_config.packet_logging = self.settings.packet_logging;
        Ok(ModbusTcpServer::with_config(server_config, self.register_bank.clone()))
    }

    /// Stop serving and clear runtime counters
    ///
    /// Idempotent. The write subscription is dropped before the listener so
    /// no client write is dispatched after this returns.
    pub async fn stop(&self) -> GatewayResult<()> {
        let (server, dispatcher) = {
            let mut state = self.lock_state();
            if state.phase != InstancePhase::Running {
                debug!("Gateway {} is {:?}, nothing to stop", self.config.id, state.phase);
                return Ok(());
            }
            state.phase = InstancePhase::Stopping;
            (state.server.take(), state.dispatcher.take())
        };

        if let Some(mut server) = server {
            server.unsubscribe_writes();
            if let Err(e) = server.stop().await {
                warn!("Gateway {}: server stop failed: {}", self.config.id, e);
            }
        }

        // Drains whatever was already queued, then sees the queue close
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!("Gateway {}: write dispatcher ended abnormally: {}", self.config.id, e);
            }
        }

        let metrics = {
            let mut state = self.lock_state();
            state.phase = InstancePhase::Stopped;
            state.last_read = None;
            state.last_write = None;
            std::mem::take(&mut state.sync_metrics)
        };

        info!(
            "⏹️  Gateway {} ({}) stopped after {} sync passes ({:.1}% clean, avg {:?})",
            self.config.id,
            self.config.name,
            metrics.total_runs,
            metrics.success_rate(),
            metrics.avg_duration
        );
        Ok(())
    }

    /// Replace the mapping list wholesale
    pub fn update_mappings(&self, mappings: Vec<Mapping>) {
        let mut own = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            if mapping.gateway_id != self.config.id {
                warn!(
                    "Gateway {}: ignoring mapping for point {} that belongs to gateway {}",
                    self.config.id, mapping.point_id, mapping.gateway_id
                );
                continue;
            }
            if let Err(e) = mapping.validate() {
                warn!("Gateway {}: mapping for point {} is invalid: {}", self.config.id, mapping.point_id, e);
            }
            own.push(mapping);
        }
        debug!("Gateway {}: {} mappings loaded", self.config.id, own.len());
        self.mappings.store(Arc::new(own));
    }

    /// Current mapping list snapshot
    pub fn mappings(&self) -> Arc<Vec<Mapping>> {
        self.mappings.load_full()
    }

    /// Replace the items cache wholesale
    pub fn items_cache(&self) -> SharedItemsCache {
        self.items_cache.load_full()
    }

    pub fn update_items_cache(&self, cache: SharedItemsCache) {
        self.items_cache.store(cache);
    }

    /// Copy current point values into the register bank
    pub async fn sync_registers_from_source(&self) -> GatewayResult<SyncSummary> {
        let started = Instant::now();
        let result = self.load_and_apply().await;

        let elapsed = started.elapsed();
        {
            let mut state = self.lock_state();
            match &result {
                Ok(summary) if summary.failed == 0 => state.sync_metrics.record_success(elapsed),
                _ => state.sync_metrics.record_failure(elapsed),
            }
        }
        result
    }

    async fn load_and_apply(&self) -> GatewayResult<SyncSummary> {
        let raw_values = self.point_store.get_raw_values().await?;
        let pending_writes = self.point_store.get_pending_writes().await?;
        self.apply_point_values(&raw_values, &pending_writes, Utc::now())
    }

    /// Encode resolved point values under a single bank guard
    ///
    /// An active pending write wins over the raw value; a point with neither
    /// is skipped. Mappings fail independently.
    pub fn apply_point_values(
        &self,
        raw_values: &HashMap<PointId, String>,
        pending_writes: &[PendingWrite],
        now: DateTime<Utc>,
    ) -> GatewayResult<SyncSummary> {
        let timer = OperationTimer::start("register sync");

        let mut active: HashMap<&str, &PendingWrite> = HashMap::new();
        for pending in pending_writes.iter().filter(|p| p.is_active(now)) {
            let newest = active
                .get(pending.point_id.as_str())
                .map_or(true, |current| pending.timestamp >= current.timestamp);
            if newest {
                active.insert(pending.point_id.as_str(), pending);
            }
        }

        let mappings = self.mappings.load();
        let mut summary = SyncSummary::default();
        {
            let mut file = self.register_bank.lock()?;
            for mapping in mappings.iter() {
                let value = active
                    .get(mapping.point_id.as_str())
                    .map(|p| p.value.as_str())
                    .or_else(|| raw_values.get(&mapping.point_id).map(String::as_str));

                let Some(value) = value else {
                    summary.skipped += 1;
                    continue;
                };

                match encode_mapping(&mut file, mapping, value) {
                    Ok(()) => summary.written += 1,
                    Err(e) => {
                        warn!(
                            "Gateway {}: cannot encode point {} at {} {}: {}",
                            self.config.id, mapping.point_id, mapping.register_type, mapping.address, e
                        );
                        summary.failed += 1;
                    }
                }
            }
        }

        timer.stop_with_budget(self.settings.sync_interval());
        Ok(summary)
    }

    async fn dispatch_writes(self: Arc<Self>, mut writes: mpsc::Receiver<WriteEvent>) {
        while let Some(event) = writes.recv().await {
            self.handle_write_event(event).await;
        }
        debug!("Gateway {}: write dispatcher finished", self.config.id);
    }

    /// Forward a client write to the point store, one call per mapping
    ///
    /// Points missing from the items cache or not editable are rejected; the
    /// client already got its normal response and the value stays in the bank
    /// until the next sync overwrites it.
    pub async fn handle_write_event(&self, event: WriteEvent) {
        let mappings = self.mappings.load_full();
        let items = self.items_cache.load_full();

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for &address in &event.addresses {
            let found = mappings
                .iter()
                .enumerate()
                .find(|(_, m)| m.register_type == event.register_type && m.contains(address));
            match found {
                Some((index, mapping)) => {
                    if seen.insert(index) {
                        targets.push(mapping);
                    }
                }
                None => debug!(
                    "Gateway {}: write to unmapped {} {}",
                    self.config.id, event.register_type, address
                ),
            }
        }

        {
            let mut state = self.lock_state();
            state.last_read = Some(event.timestamp);
            state.last_write = Some(event.timestamp);
        }

        for mapping in targets {
            match items.get(&mapping.point_id) {
                Some(point) if point.editable => {}
                Some(_) => {
                    warn!(
                        "Gateway {}: rejected write to read-only point {} ({} {})",
                        self.config.id, mapping.point_id, mapping.register_type, mapping.address
                    );
                    continue;
                }
                None => {
                    warn!(
                        "Gateway {}: rejected write to unknown point {} ({} {})",
                        self.config.id, mapping.point_id, mapping.register_type, mapping.address
                    );
                    continue;
                }
            }

            let value = match self.read_back(mapping, &event) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Gateway {}: cannot decode point {}: {}", self.config.id, mapping.point_id, e);
                    continue;
                }
            };

            match self.point_store.write_value(&mapping.point_id, &value).await {
                Ok(()) => info!("Gateway {}: point {} <- {}", self.config.id, mapping.point_id, value),
                Err(e) => error!("Gateway {}: write of point {} failed: {}", self.config.id, mapping.point_id, e),
            }
        }
    }

    /// Decode one mapping as a point value string
    ///
    /// Addresses the client wrote take their value from the event; the bank
    /// only fills in the rest of a multi-register mapping.
    fn read_back(&self, mapping: &Mapping, event: &WriteEvent) -> GatewayResult<String> {
        mapping.validate()?;

        if mapping.register_type.is_bit() {
            let bit = match event.bit_at(mapping.address) {
                Some(bit) => bit,
                None => self.register_bank.lock()?.read_bits(mapping.register_type, mapping.address, 1)?[0],
            };
            return Ok(codec::decode_coil(bit).to_string());
        }

        let mut registers = self.register_bank.lock()?.read_words(
            mapping.register_type,
            mapping.address,
            mapping.register_count(),
        )?;
        for (offset, register) in registers.iter_mut().enumerate() {
            if let Some(word) = event.word_at(mapping.address.wrapping_add(offset as u16)) {
                *register = word;
            }
        }
        decode_words(mapping, &registers)
    }
}

/// Write one resolved value into the bank according to the mapping
fn encode_mapping(file: &mut RegisterFile, mapping: &Mapping, value: &str) -> GatewayResult<()> {
    mapping.validate()?;

    if mapping.register_type.is_bit() {
        return file.write_bits(mapping.register_type, mapping.address, &[codec::coil_from_str(value)]);
    }

    let numeric = codec::parse_numeric(value);
    match mapping.representation {
        DataRepresentation::Int16 => {
            file.write_words(mapping.register_type, mapping.address, &[codec::encode_int16(numeric)])
        }
        DataRepresentation::Float32 => {
            let registers = codec::encode_float32(numeric as f32, mapping.endianness);
            file.write_words(mapping.register_type, mapping.address, &registers)
        }
        DataRepresentation::ScaledInteger => {
            let register = codec::encode_scaled(numeric, mapping.scale_min, mapping.scale_max);
            file.write_words(mapping.register_type, mapping.address, &[register])
        }
        DataRepresentation::Unknown => Err(GatewayError::invalid_data("unsupported data representation")),
    }
}

/// Decode the registers of a word mapping as a point value string
fn decode_words(mapping: &Mapping, registers: &[u16]) -> GatewayResult<String> {
    match mapping.representation {
        DataRepresentation::Int16 => Ok(codec::decode_int16(registers[0]).to_string()),
        DataRepresentation::Float32 => {
            Ok(codec::decode_float32([registers[0], registers[1]], mapping.endianness).to_string())
        }
        DataRepresentation::ScaledInteger => {
            Ok(codec::decode_scaled(registers[0], mapping.scale_min, mapping.scale_max).to_string())
        }
        DataRepresentation::Unknown => Err(GatewayError::invalid_data("unsupported data representation")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Endianness;
    use crate::model::{PointSnapshot, RegisterType};
    use crate::protocol::MbapHeader;
    use crate::store::MemoryPointStore;
    use chrono::Duration as ChronoDuration;

    fn instance_with(point_store: Arc<MemoryPointStore>) -> Arc<GatewayInstance> {
        let config = GatewayConfig::new(1, "test", "127.0.0.1", 0, 1);
        Arc::new(GatewayInstance::new(config, point_store, Arc::new(GatewaySettings::default())))
    }

    fn point(id: &str, editable: bool) -> PointSnapshot {
        PointSnapshot {
            id: id.to_string(),
            raw_value: None,
            pending_value: None,
            editable,
        }
    }

    fn cache(points: &[PointSnapshot]) -> SharedItemsCache {
        Arc::new(points.iter().map(|p| (p.id.clone(), p.clone())).collect())
    }

    fn raw(values: &[(&str, &str)]) -> HashMap<PointId, String> {
        values.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_sync_encodes_every_representation() {
        let instance = instance_with(Arc::new(MemoryPointStore::new()));
        instance.update_mappings(vec![
            Mapping::new(1, "temp", RegisterType::InputRegister, 0).float32(Endianness::BigEndian),
            Mapping::new(1, "count", RegisterType::HoldingRegister, 10),
            Mapping::new(1, "level", RegisterType::HoldingRegister, 11).scaled(0.0, 100.0),
            Mapping::new(1, "pump", RegisterType::Coil, 3),
            Mapping::new(1, "alarm", RegisterType::DiscreteInput, 4),
        ]);

        let values = raw(&[("temp", "23.5"), ("count", "-2"), ("level", "100"), ("pump", "true"), ("alarm", "0")]);
        let summary = instance.apply_point_values(&values, &[], Utc::now()).unwrap();
        assert_eq!(summary, SyncSummary { written: 5, skipped: 0, failed: 0 });

        let bank = instance.register_bank();
        assert_eq!(bank.read_input_registers(0, 2).unwrap(), vec![0x41BC, 0x0000]);
        assert_eq!(bank.read_holding_registers(10, 2).unwrap(), vec![0xFFFE, 0xFFFF]);
        assert_eq!(bank.read_coils(3, 1).unwrap(), vec![true]);
        assert_eq!(bank.read_discrete_inputs(4, 1).unwrap(), vec![false]);
    }

    #[test]
    fn test_pending_write_precedence() {
        let instance = instance_with(Arc::new(MemoryPointStore::new()));
        instance.update_mappings(vec![
            Mapping::new(1, "a", RegisterType::HoldingRegister, 0),
            Mapping::new(1, "b", RegisterType::HoldingRegister, 1),
            Mapping::new(1, "c", RegisterType::HoldingRegister, 2),
        ]);

        let now = Utc::now();
        let pending = vec![
            PendingWrite {
                point_id: "a".to_string(),
                value: "7".to_string(),
                timestamp: now - ChronoDuration::seconds(5),
                duration_seconds: 60,
            },
            PendingWrite {
                point_id: "b".to_string(),
                value: "9".to_string(),
                timestamp: now - ChronoDuration::seconds(120),
                duration_seconds: 60,
            },
        ];
        let values = raw(&[("a", "1"), ("b", "2")]);

        let summary = instance.apply_point_values(&values, &pending, now).unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(instance.register_bank().read_holding_registers(0, 3).unwrap(), vec![7, 2, 0]);
    }

    #[test]
    fn test_open_ended_pending_write() {
        let instance = instance_with(Arc::new(MemoryPointStore::new()));
        instance.update_mappings(vec![Mapping::new(1, "a", RegisterType::HoldingRegister, 0)]);

        let now = Utc::now();
        let pending = vec![PendingWrite {
            point_id: "a".to_string(),
            value: "7".to_string(),
            timestamp: now,
            duration_seconds: i64::MAX,
        }];

        let summary = instance.apply_point_values(&raw(&[("a", "1")]), &pending, now).unwrap();
        assert_eq!(summary.written, 1);
        assert_eq!(instance.register_bank().read_holding_registers(0, 1).unwrap(), vec![7]);
    }

    #[test]
    fn test_failing_mapping_does_not_abort_pass() {
        let instance = instance_with(Arc::new(MemoryPointStore::new()));
        instance.update_mappings(vec![
            Mapping::new(1, "edge", RegisterType::HoldingRegister, 65535).float32(Endianness::BigEndian),
            Mapping::new(1, "ok", RegisterType::HoldingRegister, 0),
        ]);

        let values = raw(&[("edge", "1.0"), ("ok", "12")]);
        let summary = instance.apply_point_values(&values, &[], Utc::now()).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.written, 1);
        assert_eq!(instance.register_bank().read_holding_registers(0, 1).unwrap(), vec![12]);
    }

    #[tokio::test]
    async fn test_write_gate() {
        let store = Arc::new(MemoryPointStore::new());
        store.upsert_point(point("setpoint", true));
        store.upsert_point(point("readonly", false));
        let instance = instance_with(store.clone());
        instance.update_mappings(vec![
            Mapping::new(1, "setpoint", RegisterType::HoldingRegister, 0).float32(Endianness::MidBigEndian),
            Mapping::new(1, "readonly", RegisterType::Coil, 5),
            Mapping::new(1, "ghost", RegisterType::Coil, 6),
        ]);
        instance.update_items_cache(cache(&[point("setpoint", true), point("readonly", false)]));

        let registers = codec::encode_float32(42.25, Endianness::MidBigEndian);
        instance.register_bank().write_multiple_registers(0, &registers).unwrap();
        instance.register_bank().write_multiple_coils(5, &[true, true]).unwrap();

        let timestamp = Utc::now();
        instance.handle_write_event(WriteEvent {
            timestamp,
            ..WriteEvent::registers(0, &registers)
        }).await;
        instance.handle_write_event(WriteEvent {
            timestamp,
            ..WriteEvent::coils(5, &[true, true, true])
        }).await;

        assert_eq!(store.written_values(), vec![("setpoint".to_string(), "42.25".to_string())]);

        let status = instance.status();
        assert_eq!(status.last_read, Some(timestamp));
        assert_eq!(status.last_write, Some(timestamp));
    }

    #[tokio::test]
    async fn test_client_write_survives_sync_before_dispatch() {
        let store = Arc::new(MemoryPointStore::new());
        store.upsert_point(point("sp", true));
        store.upsert_point(point("flag", true));
        let instance = instance_with(store.clone());
        instance.update_mappings(vec![
            Mapping::new(1, "sp", RegisterType::HoldingRegister, 3),
            Mapping::new(1, "flag", RegisterType::Coil, 8),
        ]);
        instance.update_items_cache(cache(&[point("sp", true), point("flag", true)]));

        let bank = instance.register_bank();
        let register_write = ModbusTcpServer::process_request(
            &MbapHeader::frame(1, 1, &[0x06, 0x00, 0x03, 0x00, 0x37]), bank, 1,
        ).unwrap().write.unwrap();
        let coil_write = ModbusTcpServer::process_request(
            &MbapHeader::frame(2, 1, &[0x05, 0x00, 0x08, 0xFF, 0x00]), bank, 1,
        ).unwrap().write.unwrap();

        // A sync pass lands before the dispatcher gets to the events
        instance.apply_point_values(&raw(&[("sp", "10"), ("flag", "0")]), &[], Utc::now()).unwrap();
        assert_eq!(bank.read_holding_registers(3, 1).unwrap(), vec![10]);

        instance.handle_write_event(register_write).await;
        instance.handle_write_event(coil_write).await;

        assert_eq!(
            store.written_values(),
            vec![("sp".to_string(), "55".to_string()), ("flag".to_string(), "1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_sync_metrics() {
        let store = Arc::new(MemoryPointStore::new());
        store.set_raw_value("ok", "5");
        store.set_raw_value("edge", "1.0");
        let instance = instance_with(store);

        instance.update_mappings(vec![Mapping::new(1, "ok", RegisterType::HoldingRegister, 0)]);
        instance.sync_registers_from_source().await.unwrap();
        instance.update_mappings(vec![
            Mapping::new(1, "edge", RegisterType::HoldingRegister, 65535).float32(Endianness::BigEndian),
        ]);
        instance.sync_registers_from_source().await.unwrap();

        let metrics = instance.sync_metrics();
        assert_eq!(metrics.total_runs, 2);
        assert_eq!(metrics.successful_runs, 1);
        assert_eq!(metrics.failed_runs, 1);
    }

    #[tokio::test]
    async fn test_write_to_wrong_bank_is_ignored() {
        let store = Arc::new(MemoryPointStore::new());
        store.upsert_point(point("flag", true));
        let instance = instance_with(store.clone());
        instance.update_mappings(vec![Mapping::new(1, "flag", RegisterType::DiscreteInput, 0)]);
        instance.update_items_cache(cache(&[point("flag", true)]));

        instance.handle_write_event(WriteEvent::coils(0, &[true])).await;
        assert!(store.written_values().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let instance = instance_with(Arc::new(MemoryPointStore::new()));
        assert_eq!(instance.phase(), InstancePhase::Stopped);
        assert!(instance.local_addr().is_none());

        instance.start().await.unwrap();
        assert!(instance.is_running());
        let addr = instance.local_addr().unwrap();

        // Second start is a no-op
        instance.start().await.unwrap();
        assert_eq!(instance.local_addr(), Some(addr));

        instance.stop().await.unwrap();
        assert_eq!(instance.phase(), InstancePhase::Stopped);
        instance.stop().await.unwrap();

        let status = instance.status();
        assert_eq!(status.connected_clients, 0);
        assert!(status.last_write.is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_instance_stopped() {
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let config = GatewayConfig::new(2, "busy", "127.0.0.1", port, 1);
        let instance = Arc::new(GatewayInstance::new(
            config,
            Arc::new(MemoryPointStore::new()),
            Arc::new(GatewaySettings::default()),
        ));

        assert!(instance.start().await.is_err());
        assert_eq!(instance.phase(), InstancePhase::Stopped);
    }
}
