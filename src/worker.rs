//! Process shell that drives the gateway manager
//!
//! After a startup delay the worker starts every enabled gateway, then runs
//! until stopped:
//!
//! | loop          | default period | work                                   |
//! |---------------|----------------|----------------------------------------|
//! | sync          | 500 ms         | `update_all_registers`                 |
//! | status        | 5 s            | `publish_status_updates`               |
//! | cache         | 60 s           | `refresh_items_cache_if_needed`        |
//! | config events | on arrival     | `handle_config_changed`                |
//!
//! Every iteration handles its own errors, panics included, so a bad
//! iteration never ends its loop.

use futures::FutureExt;
use log::{debug, error, info, warn};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::manager::GatewayManager;
use crate::model::ConfigChangeEvent;

/// Background worker
pub struct Worker {
    manager: Arc<GatewayManager>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    pub fn new(manager: Arc<GatewayManager>) -> Self {
        Self {
            manager,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn manager(&self) -> &Arc<GatewayManager> {
        &self.manager
    }

    /// Token that stops every loop when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait out the startup delay, start all gateways, spawn the loops
    ///
    /// Returns once the loops are running. Cancelling during the delay skips
    /// the rest.
    pub async fn start(&mut self, config_events: mpsc::Receiver<ConfigChangeEvent>) {
        if !self.tasks.is_empty() {
            warn!("Worker already started");
            return;
        }

        let settings = self.manager.settings().clone();
        info!("Worker starting in {:?}", settings.startup_delay());
        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Worker cancelled during startup delay");
                return;
            }
            _ = tokio::time::sleep(settings.startup_delay()) => {}
        }

        if let Err(e) = self.manager.load_and_start_all().await {
            error!("Initial gateway load failed: {}", e);
        }

        let manager = Arc::clone(&self.manager);
        self.tasks.push(spawn_periodic("sync", settings.sync_interval(), self.cancel.clone(), move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.update_all_registers().await;
            }
        }));

        let manager = Arc::clone(&self.manager);
        self.tasks.push(spawn_periodic("status", settings.status_interval(), self.cancel.clone(), move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.publish_status_updates().await;
            }
        }));

        let manager = Arc::clone(&self.manager);
        self.tasks.push(spawn_periodic("cache", settings.cache_check_interval(), self.cancel.clone(), move || {
            let manager = Arc::clone(&manager);
            async move {
                if let Err(e) = manager.refresh_items_cache_if_needed().await {
                    error!("Items cache refresh failed: {}", e);
                }
            }
        }));

        self.tasks.push(tokio::spawn(consume_config_events(
            Arc::clone(&self.manager),
            config_events,
            self.cancel.clone(),
        )));

        info!("Worker running");
    }

    /// Cancel the loops, wait for them, then stop every gateway
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Worker loop ended abnormally: {}", e);
            }
        }
        self.manager.stop_all().await;
        info!("Worker stopped");
    }
}

/// Run `iteration` every `period` until cancelled
fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, iteration: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if AssertUnwindSafe(iteration()).catch_unwind().await.is_err() {
                        error!("{} loop iteration panicked", name);
                    }
                }
            }
        }
        debug!("{} loop stopped", name);
    })
}

async fn consume_config_events(
    manager: Arc<GatewayManager>,
    mut events: mpsc::Receiver<ConfigChangeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        let Some(event) = event else {
            info!("Config change channel closed");
            break;
        };

        let gateway_id = event.gateway_id;
        match AssertUnwindSafe(manager.handle_config_changed(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Config change for gateway {} failed: {}", gateway_id, e),
            Err(_) => error!("Config change for gateway {} panicked", gateway_id),
        }
    }
    debug!("config event loop stopped");
}
