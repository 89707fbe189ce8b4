//! Owner of every running gateway instance
//!
//! The manager starts, stops and restarts instances in response to
//! configuration changes, keeps the shared items cache fresh, and fans the
//! periodic sync and status work out over all running instances. Failures
//! are contained per instance: one gateway that cannot bind or sync never
//! holds back the others.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::config::GatewaySettings;
use crate::error::GatewayResult;
use crate::instance::GatewayInstance;
use crate::model::{ChangeType, ConfigChangeEvent, GatewayConfig, GatewayId, ItemsCache, SharedItemsCache};
use crate::store::{ConfigStore, PointStore, StatusPublisher};

/// Gateway manager
pub struct GatewayManager {
    config_store: Arc<dyn ConfigStore>,
    point_store: Arc<dyn PointStore>,
    publisher: Arc<dyn StatusPublisher>,
    settings: Arc<GatewaySettings>,
    instances: DashMap<GatewayId, Arc<GatewayInstance>>,
    items_cache: ArcSwap<ItemsCache>,
    last_refresh: Mutex<Option<Instant>>,
}

impl GatewayManager {
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        point_store: Arc<dyn PointStore>,
        publisher: Arc<dyn StatusPublisher>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            config_store,
            point_store,
            publisher,
            settings: Arc::new(settings),
            instances: DashMap::new(),
            items_cache: ArcSwap::from_pointee(ItemsCache::new()),
            last_refresh: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Running instance by id
    pub fn instance(&self, id: GatewayId) -> Option<Arc<GatewayInstance>> {
        self.instances.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Ids of all running instances, ascending
    pub fn running_gateway_ids(&self) -> Vec<GatewayId> {
        let mut ids: Vec<GatewayId> = self.instances.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Current shared items cache snapshot
    pub fn items_cache(&self) -> SharedItemsCache {
        self.items_cache.load_full()
    }

    /// Snapshot of the instance map, so no map guard is held across an await
    fn instances_snapshot(&self) -> Vec<Arc<GatewayInstance>> {
        self.instances.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Start every enabled gateway
    ///
    /// Returns how many started. Only a failure to list gateways is an error;
    /// each start failure is logged and skipped.
    pub async fn load_and_start_all(&self) -> GatewayResult<usize> {
        let gateways = self.config_store.list_enabled_gateways().await?;
        info!("🚀 Loading {} enabled gateway(s)", gateways.len());

        if let Err(e) = self.refresh_items_cache().await {
            error!("Items cache refresh failed, all writes will be rejected until the next refresh: {}", e);
        }

        let mut started = 0;
        for config in gateways {
            let (id, name) = (config.id, config.name.clone());
            match self.start_gateway(config).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to start gateway {} ({}): {}", id, name, e),
            }
        }

        info!("✅ {} gateway(s) running", started);
        Ok(started)
    }

    /// Start one gateway from its configuration
    ///
    /// Returns `false` without touching anything when it is already running.
    pub async fn start_gateway(&self, config: GatewayConfig) -> GatewayResult<bool> {
        let id = config.id;
        if self.instances.contains_key(&id) {
            warn!("Gateway {} ({}) is already running", id, config.name);
            return Ok(false);
        }

        let mappings = self.config_store.get_mappings(id).await?;
        let instance = Arc::new(GatewayInstance::new(
            config,
            Arc::clone(&self.point_store),
            Arc::clone(&self.settings),
        ));
        instance.update_mappings(mappings);
        instance.update_items_cache(self.items_cache.load_full());
        instance.start().await?;

        let inserted = match self.instances.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&instance));
                true
            }
        };

        if !inserted {
            warn!("Gateway {} was started concurrently, discarding duplicate", id);
            instance.stop().await?;
            return Ok(false);
        }

        // A refresh that ran while the instance was starting could not see it
        instance.update_items_cache(self.items_cache.load_full());
        Ok(true)
    }

    /// Load a gateway's configuration and start it
    ///
    /// Missing or disabled gateways are skipped with a warning.
    pub async fn start_gateway_by_id(&self, id: GatewayId) -> GatewayResult<bool> {
        match self.config_store.get_gateway(id).await? {
            None => {
                warn!("Gateway {} not found, not starting", id);
                Ok(false)
            }
            Some(config) if !config.enabled => {
                warn!("Gateway {} ({}) is disabled, not starting", id, config.name);
                Ok(false)
            }
            Some(config) => self.start_gateway(config).await,
        }
    }

    /// Stop and forget one gateway; `false` when it was not running
    pub async fn stop_gateway(&self, id: GatewayId) -> GatewayResult<bool> {
        let Some((_, instance)) = self.instances.remove(&id) else {
            debug!("Gateway {} is not running", id);
            return Ok(false);
        };
        instance.stop().await?;
        Ok(true)
    }

    /// Stop, pause, then start again from the stored configuration
    pub async fn restart_gateway(&self, id: GatewayId) -> GatewayResult<bool> {
        info!("🔄 Restarting gateway {}", id);
        self.stop_gateway(id).await?;
        tokio::time::sleep(self.settings.restart_delay()).await;
        self.start_gateway_by_id(id).await
    }

    /// Reload one running gateway's mappings from the config store
    ///
    /// A gateway that is not running picks its mappings up when it starts.
    pub async fn update_gateway_mappings(&self, id: GatewayId) -> GatewayResult<()> {
        let Some(instance) = self.instance(id) else {
            warn!("Gateway {} is not running, mapping reload skipped", id);
            return Ok(());
        };
        let mappings = self.config_store.get_mappings(id).await?;
        info!("Gateway {}: reloaded {} mapping(s)", id, mappings.len());
        instance.update_mappings(mappings);
        Ok(())
    }

    /// Reload the items cache and push it into every running instance
    pub async fn refresh_items_cache(&self) -> GatewayResult<()> {
        let points = self.point_store.get_all_points().await?;
        let cache: SharedItemsCache = Arc::new(
            points.into_iter().map(|point| (point.id.clone(), point)).collect(),
        );
        debug!("Items cache refreshed with {} point(s)", cache.len());

        self.items_cache.store(Arc::clone(&cache));
        for instance in self.instances_snapshot() {
            instance.update_items_cache(Arc::clone(&cache));
        }

        *self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        Ok(())
    }

    /// Refresh the items cache only when it is older than the configured age
    pub async fn refresh_items_cache_if_needed(&self) -> GatewayResult<bool> {
        let stale = self
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map_or(true, |at| at.elapsed() > self.settings.cache_max_age());
        if !stale {
            return Ok(false);
        }
        self.refresh_items_cache().await?;
        Ok(true)
    }

    /// Sync every running instance concurrently
    ///
    /// Returns how many instances synced without error.
    pub async fn update_all_registers(&self) -> usize {
        let tasks = self.instances_snapshot().into_iter().map(|instance| {
            tokio::spawn(async move {
                let result = instance.sync_registers_from_source().await;
                (instance.id(), result)
            })
        });

        let mut synced = 0;
        for joined in join_all(tasks).await {
            match joined {
                Ok((_, Ok(summary))) => {
                    synced += 1;
                    if summary.failed > 0 {
                        debug!("Sync pass: {} written, {} failed", summary.written, summary.failed);
                    }
                }
                Ok((id, Err(e))) if e.is_recoverable() => warn!("Gateway {}: register sync skipped: {}", id, e),
                Ok((id, Err(e))) => error!("Gateway {}: register sync failed: {}", id, e),
                Err(e) => error!("Register sync task panicked: {}", e),
            }
        }
        synced
    }

    /// Publish and persist every running instance's status
    ///
    /// Returns how many instances were both published and persisted.
    pub async fn publish_status_updates(&self) -> usize {
        let mut delivered = 0;
        for instance in self.instances_snapshot() {
            let status = instance.status();

            let published = match self.publisher.publish(&status).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Gateway {}: status publish failed: {}", status.gateway_id, e);
                    false
                }
            };

            let persisted = match self
                .config_store
                .update_gateway_status(status.gateway_id, status.connected_clients, status.last_read, status.last_write)
                .await
            {
                Ok(true) => true,
                Ok(false) => {
                    warn!("Gateway {}: no stored configuration to update", status.gateway_id);
                    false
                }
                Err(e) => {
                    warn!("Gateway {}: status persist failed: {}", status.gateway_id, e);
                    false
                }
            };

            if published && persisted {
                delivered += 1;
            }
        }
        delivered
    }

    /// Apply one configuration change notification
    pub async fn handle_config_changed(&self, event: ConfigChangeEvent) -> GatewayResult<()> {
        info!("Configuration change for gateway {}: {:?}", event.gateway_id, event.change_type);
        match event.change_type {
            ChangeType::Added => self.start_gateway_by_id(event.gateway_id).await.map(|_| ()),
            ChangeType::Updated => self.restart_gateway(event.gateway_id).await.map(|_| ()),
            ChangeType::Deleted => self.stop_gateway(event.gateway_id).await.map(|_| ()),
        }
    }

    /// Stop every running instance
    pub async fn stop_all(&self) {
        let ids: Vec<GatewayId> = self.instances.iter().map(|entry| *entry.key()).collect();
        if ids.is_empty() {
            return;
        }

        info!("⏹️  Stopping {} gateway(s)", ids.len());
        let removed: Vec<Arc<GatewayInstance>> = ids
            .into_iter()
            .filter_map(|id| self.instances.remove(&id).map(|(_, instance)| instance))
            .collect();

        let results = join_all(removed.iter().map(|instance| instance.stop())).await;
        for (instance, result) in removed.iter().zip(results) {
            if let Err(e) = result {
                error!("Gateway {}: stop failed: {}", instance.id(), e);
            }
        }
    }
}
