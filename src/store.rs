//! External collaborators of the gateway
//!
//! The gateway reads its configuration from a [`ConfigStore`], reads and
//! writes point values through a [`PointStore`], and announces runtime status
//! through a [`StatusPublisher`]. Production deployments back these with a
//! database and a message bus; the in-memory implementations here back the
//! tests and the demo binary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::error::{GatewayError, GatewayResult};
use crate::model::{GatewayConfig, GatewayId, GatewayStatus, Mapping, PendingWrite, PointId, PointSnapshot};

/// Source of gateway configurations and mappings
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_enabled_gateways(&self) -> GatewayResult<Vec<GatewayConfig>>;

    async fn get_gateway(&self, id: GatewayId) -> GatewayResult<Option<GatewayConfig>>;

    async fn get_mappings(&self, gateway_id: GatewayId) -> GatewayResult<Vec<Mapping>>;

    /// Persist observed runtime stats; `false` when the gateway is unknown
    async fn update_gateway_status(
        &self,
        id: GatewayId,
        connected_clients: usize,
        last_read: Option<DateTime<Utc>>,
        last_write: Option<DateTime<Utc>>,
    ) -> GatewayResult<bool>;
}

/// Source of monitoring point values and sink for client writes
#[async_trait]
pub trait PointStore: Send + Sync {
    async fn get_all_points(&self) -> GatewayResult<Vec<PointSnapshot>>;

    /// Current raw value of every point that has one
    async fn get_raw_values(&self) -> GatewayResult<HashMap<PointId, String>>;

    /// Pending operator writes, expired ones included
    async fn get_pending_writes(&self) -> GatewayResult<Vec<PendingWrite>>;

    async fn write_value(&self, point_id: &str, value: &str) -> GatewayResult<()>;
}

/// Outbound status channel
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, status: &GatewayStatus) -> GatewayResult<()>;
}

/// In-memory configuration store
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    gateways: RwLock<BTreeMap<GatewayId, GatewayConfig>>,
    mappings: RwLock<HashMap<GatewayId, Vec<Mapping>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a gateway configuration
    pub fn upsert_gateway(&self, config: GatewayConfig) {
        self.gateways.write().unwrap_or_else(PoisonError::into_inner).insert(config.id, config);
    }

    /// Remove a gateway and its mappings
    pub fn remove_gateway(&self, id: GatewayId) -> Option<GatewayConfig> {
        self.mappings.write().unwrap_or_else(PoisonError::into_inner).remove(&id);
        self.gateways.write().unwrap_or_else(PoisonError::into_inner).remove(&id)
    }

    /// Replace the mapping list of one gateway
    pub fn set_mappings(&self, gateway_id: GatewayId, mappings: Vec<Mapping>) {
        self.mappings.write().unwrap_or_else(PoisonError::into_inner).insert(gateway_id, mappings);
    }

    /// Current stored configuration, runtime stats included
    pub fn gateway(&self, id: GatewayId) -> Option<GatewayConfig> {
        self.gateways.read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn list_enabled_gateways(&self) -> GatewayResult<Vec<GatewayConfig>> {
        let gateways = self.gateways.read().unwrap_or_else(PoisonError::into_inner);
        Ok(gateways.values().filter(|g| g.enabled).cloned().collect())
    }

    async fn get_gateway(&self, id: GatewayId) -> GatewayResult<Option<GatewayConfig>> {
        Ok(self.gateway(id))
    }

    async fn get_mappings(&self, gateway_id: GatewayId) -> GatewayResult<Vec<Mapping>> {
        let mappings = self.mappings.read().unwrap_or_else(PoisonError::into_inner);
        Ok(mappings.get(&gateway_id).cloned().unwrap_or_default())
    }

    async fn update_gateway_status(
        &self,
        id: GatewayId,
        connected_clients: usize,
        last_read: Option<DateTime<Utc>>,
        last_write: Option<DateTime<Utc>>,
    ) -> GatewayResult<bool> {
        let mut gateways = self.gateways.write().unwrap_or_else(PoisonError::into_inner);
        let Some(gateway) = gateways.get_mut(&id) else {
            return Ok(false);
        };
        gateway.connected_clients = connected_clients;
        gateway.last_read = last_read;
        gateway.last_write = last_write;
        Ok(true)
    }
}

/// In-memory point store
///
/// `write_value` records the write and loops it back into the raw value,
/// like a device that accepts every setpoint.
#[derive(Debug, Default)]
pub struct MemoryPointStore {
    points: RwLock<HashMap<PointId, PointSnapshot>>,
    pending: RwLock<Vec<PendingWrite>>,
    writes: Mutex<Vec<(PointId, String)>>,
}

impl MemoryPointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a point
    pub fn upsert_point(&self, point: PointSnapshot) {
        self.points.write().unwrap_or_else(PoisonError::into_inner).insert(point.id.clone(), point);
    }

    /// Set the raw value of a point, creating a read-only point if needed
    pub fn set_raw_value(&self, point_id: &str, value: &str) {
        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        points
            .entry(point_id.to_string())
            .or_insert_with(|| PointSnapshot {
                id: point_id.to_string(),
                raw_value: None,
                pending_value: None,
                editable: false,
            })
            .raw_value = Some(value.to_string());
    }

    pub fn add_pending_write(&self, pending: PendingWrite) {
        self.pending.write().unwrap_or_else(PoisonError::into_inner).push(pending);
    }

    /// Every `write_value` call so far, in order
    pub fn written_values(&self) -> Vec<(PointId, String)> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl PointStore for MemoryPointStore {
    async fn get_all_points(&self) -> GatewayResult<Vec<PointSnapshot>> {
        Ok(self.points.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect())
    }

    async fn get_raw_values(&self) -> GatewayResult<HashMap<PointId, String>> {
        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        Ok(points
            .values()
            .filter_map(|p| p.raw_value.as_ref().map(|v| (p.id.clone(), v.clone())))
            .collect())
    }

    async fn get_pending_writes(&self) -> GatewayResult<Vec<PendingWrite>> {
        Ok(self.pending.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn write_value(&self, point_id: &str, value: &str) -> GatewayResult<()> {
        {
            let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
            let point = points
                .get_mut(point_id)
                .ok_or_else(|| GatewayError::store(format!("Unknown point '{}'", point_id)))?;
            point.raw_value = Some(value.to_string());
        }
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((point_id.to_string(), value.to_string()));
        Ok(())
    }
}

/// Status publisher backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastStatusPublisher {
    tx: broadcast::Sender<GatewayStatus>,
}

impl BroadcastStatusPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayStatus> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl StatusPublisher for BroadcastStatusPublisher {
    async fn publish(&self, status: &GatewayStatus) -> GatewayResult<()> {
        // No subscribers is not an error; the message is simply unobserved
        let _ = self.tx.send(status.clone());
        Ok(())
    }
}

/// JSON description of gateways, mappings and points
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub gateways: Vec<GatewayConfig>,
    pub mappings: Vec<Mapping>,
    pub points: Vec<PointSnapshot>,
}

impl Fixture {
    pub fn from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::io(format!("Failed to read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Build populated in-memory stores
    pub fn into_stores(self) -> (MemoryConfigStore, MemoryPointStore) {
        let config_store = MemoryConfigStore::new();
        for gateway in self.gateways {
            config_store.upsert_gateway(gateway);
        }

        let mut by_gateway: HashMap<GatewayId, Vec<Mapping>> = HashMap::new();
        for mapping in self.mappings {
            by_gateway.entry(mapping.gateway_id).or_default().push(mapping);
        }
        for (gateway_id, mappings) in by_gateway {
            config_store.set_mappings(gateway_id, mappings);
        }

        let point_store = MemoryPointStore::new();
        for point in self.points {
            point_store.upsert_point(point);
        }

        (config_store, point_store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RegisterType;

    #[tokio::test]
    async fn test_config_store() {
        let store = MemoryConfigStore::new();
        store.upsert_gateway(GatewayConfig::new(1, "A", "127.0.0.1", 5020, 1));
        let mut disabled = GatewayConfig::new(2, "B", "127.0.0.1", 5021, 1);
        disabled.enabled = false;
        store.upsert_gateway(disabled);
        store.set_mappings(1, vec![Mapping::new(1, "p1", RegisterType::Coil, 0)]);

        let enabled = store.list_enabled_gateways().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, 1);
        assert_eq!(store.get_mappings(1).await.unwrap().len(), 1);
        assert!(store.get_mappings(2).await.unwrap().is_empty());

        let now = Utc::now();
        assert!(store.update_gateway_status(1, 3, Some(now), None).await.unwrap());
        assert!(!store.update_gateway_status(9, 0, None, None).await.unwrap());
        let stored = store.get_gateway(1).await.unwrap().unwrap();
        assert_eq!(stored.connected_clients, 3);
        assert_eq!(stored.last_read, Some(now));
    }

    #[tokio::test]
    async fn test_point_store() {
        let store = MemoryPointStore::new();
        store.set_raw_value("t1", "23.5");
        store.upsert_point(PointSnapshot {
            id: "sp".to_string(),
            raw_value: None,
            pending_value: None,
            editable: true,
        });

        let raw = store.get_raw_values().await.unwrap();
        assert_eq!(raw.get("t1").map(String::as_str), Some("23.5"));
        assert!(!raw.contains_key("sp"));

        store.write_value("sp", "42").await.unwrap();
        assert_eq!(store.written_values(), vec![("sp".to_string(), "42".to_string())]);
        assert_eq!(store.get_raw_values().await.unwrap().get("sp").map(String::as_str), Some("42"));

        assert!(matches!(store.write_value("missing", "1").await, Err(GatewayError::Store { .. })));
    }

    #[tokio::test]
    async fn test_broadcast_publisher() {
        let publisher = BroadcastStatusPublisher::new(8);
        let status = GatewayStatus {
            gateway_id: 1,
            name: "A".to_string(),
            connected_clients: 0,
            last_read: None,
            last_write: None,
        };
        publisher.publish(&status).await.unwrap();

        let mut rx = publisher.subscribe();
        publisher.publish(&status).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), status);
    }

    #[test]
    fn test_fixture() {
        let json = r#"{
            "gateways": [{"id": 1, "name": "A", "listenAddress": "127.0.0.1", "port": 5020}],
            "mappings": [{"gatewayId": 1, "pointId": "t1", "registerType": "InputRegister", "address": 0,
                          "representation": "Float32"}],
            "points": [{"id": "t1", "rawValue": "23.5"}]
        }"#;
        let fixture: Fixture = serde_json::from_str(json).unwrap();
        let (config_store, point_store) = fixture.into_stores();
        assert_eq!(config_store.gateway(1).unwrap().unit_id, 1);
        assert_eq!(point_store.written_values().len(), 0);
    }
}
