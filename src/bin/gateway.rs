/// Voltage Gateway
///
/// Runs every enabled gateway described by a JSON fixture until Ctrl+C.
/// Status updates are printed as they are published.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, LevelFilter};
use tokio::sync::mpsc;

use voltage_gateway::{init_logging, BroadcastStatusPublisher, Fixture, GatewayManager, GatewaySettings, Worker};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-instance Modbus TCP gateway")]
struct Args {
    /// JSON file with gateways, mappings and points
    #[arg(short, long, default_value = "demos/fixture.json")]
    fixture: PathBuf,

    /// JSON settings file; defaults apply when omitted
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Default log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Log every request and response frame
    #[arg(long)]
    packet_logging: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_level);

    let mut settings = match &args.settings {
        Some(path) => GatewaySettings::from_file(path)?,
        None => GatewaySettings::default(),
    };
    if args.packet_logging {
        settings.packet_logging = true;
    }
    settings.validate()?;

    let fixture = Fixture::from_file(&args.fixture)?;
    info!(
        "Loaded {} gateways, {} mappings, {} points from {}",
        fixture.gateways.len(),
        fixture.mappings.len(),
        fixture.points.len(),
        args.fixture.display()
    );
    let (config_store, point_store) = fixture.into_stores();

    let publisher = Arc::new(BroadcastStatusPublisher::new(64));
    let mut statuses = publisher.subscribe();
    tokio::spawn(async move {
        while let Ok(status) = statuses.recv().await {
            info!(
                "📊 gateway {} ({}): {} clients, last read {:?}, last write {:?}",
                status.gateway_id, status.name, status.connected_clients, status.last_read, status.last_write
            );
        }
    });

    let manager = Arc::new(GatewayManager::new(
        Arc::new(config_store),
        Arc::new(point_store),
        publisher,
        settings,
    ));

    // No bus is attached; the sender stays alive so the event loop keeps running
    let (_config_events_tx, config_events_rx) = mpsc::channel(16);
    let mut worker = Worker::new(Arc::clone(&manager));
    worker.start(config_events_rx).await;

    for id in manager.running_gateway_ids() {
        if let Some(instance) = manager.instance(id) {
            info!("🚀 {} listening on {:?}", instance.name(), instance.local_addr());
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl+C: {}", e);
    }

    info!("🛑 Shutting down");
    worker.stop().await;
    Ok(())
}
