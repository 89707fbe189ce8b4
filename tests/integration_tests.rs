//! Integration Tests for Voltage Gateway
//!
//! These tests run real gateways on loopback listeners and talk to them with
//! the bundled Modbus TCP client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use voltage_gateway::codec::{decode_float32, encode_float32};
use voltage_gateway::*;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

fn test_settings() -> GatewaySettings {
    GatewaySettings {
        startup_delay_secs: 0,
        sync_interval_ms: 20,
        restart_delay_ms: 10,
        ..GatewaySettings::default()
    }
}

fn point(id: &str, raw: Option<&str>, editable: bool) -> PointSnapshot {
    PointSnapshot {
        id: id.to_string(),
        raw_value: raw.map(str::to_string),
        pending_value: None,
        editable,
    }
}

struct Harness {
    config_store: Arc<MemoryConfigStore>,
    point_store: Arc<MemoryPointStore>,
    publisher: Arc<BroadcastStatusPublisher>,
    manager: Arc<GatewayManager>,
}

impl Harness {
    fn new() -> Self {
        let config_store = Arc::new(MemoryConfigStore::new());
        let point_store = Arc::new(MemoryPointStore::new());
        let publisher = Arc::new(BroadcastStatusPublisher::new(32));
        let manager = Arc::new(GatewayManager::new(
            config_store.clone(),
            point_store.clone(),
            publisher.clone(),
            test_settings(),
        ));
        Self { config_store, point_store, publisher, manager }
    }

    /// Plant gateway on an ephemeral port with one mapping per representation
    fn with_plant_gateway(self) -> Self {
        self.config_store.upsert_gateway(GatewayConfig::new(1, "plant", "127.0.0.1", 0, 1));
        self.config_store.set_mappings(1, vec![
            Mapping::new(1, "temperature", RegisterType::InputRegister, 0).float32(Endianness::BigEndian),
            Mapping::new(1, "level", RegisterType::InputRegister, 2).scaled(0.0, 100.0),
            Mapping::new(1, "running", RegisterType::DiscreteInput, 0),
            Mapping::new(1, "interlock", RegisterType::Coil, 0),
            Mapping::new(1, "pump_enable", RegisterType::Coil, 1),
            Mapping::new(1, "setpoint", RegisterType::HoldingRegister, 10).float32(Endianness::MidBigEndian),
            Mapping::new(1, "alarm_limit", RegisterType::HoldingRegister, 12),
        ]);

        self.point_store.upsert_point(point("temperature", Some("23.5"), false));
        self.point_store.upsert_point(point("level", Some("50"), false));
        self.point_store.upsert_point(point("running", Some("true"), false));
        self.point_store.upsert_point(point("interlock", Some("0"), false));
        self.point_store.upsert_point(point("pump_enable", Some("0"), true));
        self.point_store.upsert_point(point("setpoint", Some("10"), true));
        self.point_store.upsert_point(point("alarm_limit", Some("80"), true));
        self
    }

    fn addr(&self, id: GatewayId) -> SocketAddr {
        self.manager
            .instance(id)
            .and_then(|instance| instance.local_addr())
            .expect("gateway is running")
    }

    async fn client(&self, id: GatewayId) -> ModbusTcpClient {
        ModbusTcpClient::new(self.addr(id), CLIENT_TIMEOUT).await.unwrap()
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = timeout(Duration::from_secs(3), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

/// Points synced outward are visible through every read function code
#[tokio::test]
async fn test_outward_sync_over_tcp() {
    let harness = Harness::new().with_plant_gateway();
    assert_eq!(harness.manager.load_and_start_all().await.unwrap(), 1);
    assert_eq!(harness.manager.update_all_registers().await, 1);

    let mut client = harness.client(1).await;
    assert_eq!(client.read_04(1, 0, 2).await.unwrap(), vec![0x41BC, 0x0000]);
    assert_eq!(client.read_04(1, 2, 1).await.unwrap(), vec![32768]);
    assert_eq!(client.read_02(1, 0, 1).await.unwrap(), vec![true]);
    assert_eq!(client.read_01(1, 0, 2).await.unwrap(), vec![false, false]);

    let setpoint = client.read_03(1, 10, 3).await.unwrap();
    assert_eq!(decode_float32([setpoint[0], setpoint[1]], Endianness::MidBigEndian), 10.0);
    assert_eq!(setpoint[2], 80);

    // Unmapped addresses read as zero
    assert_eq!(client.read_03(1, 100, 2).await.unwrap(), vec![0, 0]);

    client.close().await.unwrap();
    harness.manager.stop_all().await;
}

/// Only writes to editable points reach the point store
#[tokio::test]
async fn test_inward_write_gate() {
    let harness = Harness::new().with_plant_gateway();
    harness.manager.load_and_start_all().await.unwrap();
    harness.manager.update_all_registers().await;

    let mut client = harness.client(1).await;

    // Read-only point: normal response, nothing forwarded
    client.write_05(1, 0, true).await.unwrap();

    // Editable points; the dispatcher handles events in arrival order
    client.write_05(1, 1, true).await.unwrap();
    client.write_10(1, 10, &encode_float32(42.25, Endianness::MidBigEndian)).await.unwrap();
    client.write_06(1, 12, 95).await.unwrap();

    let store = harness.point_store.clone();
    eventually("three forwarded writes", || {
        let store = store.clone();
        async move { store.written_values().len() >= 3 }
    })
    .await;

    assert_eq!(
        harness.point_store.written_values(),
        vec![
            ("pump_enable".to_string(), "1".to_string()),
            ("setpoint".to_string(), "42.25".to_string()),
            ("alarm_limit".to_string(), "95".to_string()),
        ]
    );

    // The rejected coil keeps the client's value until the next sync
    assert_eq!(client.read_01(1, 0, 1).await.unwrap(), vec![true]);
    harness.manager.update_all_registers().await;
    assert_eq!(client.read_01(1, 0, 1).await.unwrap(), vec![false]);

    let status = harness.manager.instance(1).unwrap().status();
    assert!(status.last_write.is_some());
    assert_eq!(status.last_read, status.last_write);

    client.close().await.unwrap();
    harness.manager.stop_all().await;
}

/// Requests for another unit id are answered with exception 0x0B
#[tokio::test]
async fn test_foreign_unit_id_rejected() {
    let harness = Harness::new().with_plant_gateway();
    harness.manager.load_and_start_all().await.unwrap();

    let mut client = harness.client(1).await;
    match client.read_03(7, 0, 1).await {
        Err(GatewayError::Exception { function, code, .. }) => {
            assert_eq!(function, 0x03);
            assert_eq!(code, 0x0B);
        }
        other => panic!("expected exception response, got {:?}", other),
    }

    // The connection survives the exception
    assert!(client.read_03(1, 0, 1).await.is_ok());
    harness.manager.stop_all().await;
}

/// Out-of-range requests are answered with exception 0x02
///
/// The client refuses to build such a request, so the frame is sent raw.
#[tokio::test]
async fn test_address_out_of_range() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let harness = Harness::new().with_plant_gateway();
    harness.manager.load_and_start_all().await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(harness.addr(1)).await.unwrap();
    let request = [0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0xFF, 0xFF, 0x00, 0x02];
    stream.write_all(&request).await.unwrap();

    let mut response = [0u8; 9];
    timeout(CLIENT_TIMEOUT, stream.read_exact(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, [0x00, 0x2A, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]);

    harness.manager.stop_all().await;
}

/// One gateway failing to bind does not keep the others from starting
#[tokio::test]
async fn test_start_failure_is_isolated() {
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let busy_port = blocker.local_addr().unwrap().port();

    let harness = Harness::new();
    harness.config_store.upsert_gateway(GatewayConfig::new(1, "busy", "127.0.0.1", busy_port, 1));
    harness.config_store.upsert_gateway(GatewayConfig::new(2, "free", "127.0.0.1", 0, 1));

    assert_eq!(harness.manager.load_and_start_all().await.unwrap(), 1);
    assert_eq!(harness.manager.running_gateway_ids(), vec![2]);

    let mut client = harness.client(2).await;
    assert!(client.read_03(1, 0, 1).await.is_ok());
    harness.manager.stop_all().await;
}

/// A restarted gateway binds the same fixed port again
#[tokio::test]
async fn test_restart_rebinds_port() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let harness = Harness::new();
    harness.config_store.upsert_gateway(GatewayConfig::new(5, "fixed", "127.0.0.1", port, 1));
    harness.config_store.set_mappings(5, vec![Mapping::new(5, "counter", RegisterType::HoldingRegister, 0)]);
    harness.point_store.set_raw_value("counter", "1");
    harness.manager.load_and_start_all().await.unwrap();

    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    assert_eq!(harness.addr(5), addr);

    for round in 2..4u16 {
        harness.point_store.set_raw_value("counter", &round.to_string());
        harness
            .manager
            .handle_config_changed(ConfigChangeEvent { gateway_id: 5, change_type: ChangeType::Updated })
            .await
            .unwrap();
        assert_eq!(harness.addr(5), addr);

        harness.manager.update_all_registers().await;
        let mut client = ModbusTcpClient::new(addr, CLIENT_TIMEOUT).await.unwrap();
        assert_eq!(client.read_03(1, 0, 1).await.unwrap(), vec![round]);
        client.close().await.unwrap();
    }

    harness
        .manager
        .handle_config_changed(ConfigChangeEvent { gateway_id: 5, change_type: ChangeType::Deleted })
        .await
        .unwrap();
    assert!(harness.manager.running_gateway_ids().is_empty());
    assert!(ModbusTcpClient::new(addr, CLIENT_TIMEOUT).await.is_err());
}

/// Float32 values are never observed half-updated
#[tokio::test]
async fn test_float32_reads_are_atomic() {
    let harness = Harness::new();
    harness.config_store.upsert_gateway(GatewayConfig::new(1, "atomic", "127.0.0.1", 0, 1));
    harness.config_store.set_mappings(1, vec![
        Mapping::new(1, "value", RegisterType::HoldingRegister, 0).float32(Endianness::BigEndian),
    ]);
    harness.point_store.set_raw_value("value", "1.0");
    harness.manager.load_and_start_all().await.unwrap();
    harness.manager.update_all_registers().await;

    let manager = harness.manager.clone();
    let point_store = harness.point_store.clone();
    let writer = tokio::spawn(async move {
        for i in 0..200 {
            let value = if i % 2 == 0 { "-2.5" } else { "1.0" };
            point_store.set_raw_value("value", value);
            manager.update_all_registers().await;
            tokio::task::yield_now().await;
        }
    });

    let mut client = harness.client(1).await;
    for _ in 0..200 {
        let registers = client.read_03(1, 0, 2).await.unwrap();
        let value = decode_float32([registers[0], registers[1]], Endianness::BigEndian);
        assert!(value == 1.0 || value == -2.5, "torn read: {:?} -> {}", registers, value);
    }

    writer.await.unwrap();
    harness.manager.stop_all().await;
}

/// Status updates carry client counts and are persisted to the config store
#[tokio::test]
async fn test_status_publication() {
    let harness = Harness::new().with_plant_gateway();
    harness.manager.load_and_start_all().await.unwrap();
    let mut statuses = harness.publisher.subscribe();

    let mut client = harness.client(1).await;
    client.write_06(1, 12, 70).await.unwrap();

    let manager = harness.manager.clone();
    eventually("one connected client", || {
        let manager = manager.clone();
        async move { manager.instance(1).map_or(false, |i| i.connected_clients() == 1) }
    })
    .await;
    let store = harness.point_store.clone();
    eventually("forwarded write", || {
        let store = store.clone();
        async move { !store.written_values().is_empty() }
    })
    .await;

    assert_eq!(harness.manager.publish_status_updates().await, 1);
    let status = statuses.recv().await.unwrap();
    assert_eq!(status.gateway_id, 1);
    assert_eq!(status.connected_clients, 1);
    assert!(status.last_write.is_some());

    let stored = harness.config_store.gateway(1).unwrap();
    assert_eq!(stored.connected_clients, 1);
    assert_eq!(stored.last_write, status.last_write);

    client.close().await.unwrap();
    harness.manager.stop_all().await;
}

/// Mapping reloads take effect without a restart
#[tokio::test]
async fn test_mapping_reload() {
    let harness = Harness::new().with_plant_gateway();
    harness.manager.load_and_start_all().await.unwrap();
    let addr = harness.addr(1);

    harness.config_store.set_mappings(1, vec![
        Mapping::new(1, "alarm_limit", RegisterType::HoldingRegister, 40),
    ]);
    harness.manager.update_gateway_mappings(1).await.unwrap();
    harness.manager.update_all_registers().await;

    assert_eq!(harness.addr(1), addr);
    let mut client = harness.client(1).await;
    assert_eq!(client.read_03(1, 40, 1).await.unwrap(), vec![80]);

    // Unknown gateways are skipped, not an error
    harness.manager.update_gateway_mappings(99).await.unwrap();
    harness.manager.stop_all().await;
}

/// The worker brings gateways up and reacts to configuration events
#[tokio::test]
async fn test_worker_end_to_end() {
    let harness = Harness::new().with_plant_gateway();
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(8);
    let mut worker = Worker::new(harness.manager.clone());
    worker.start(events_rx).await;

    let mut client = harness.client(1).await;
    harness.point_store.set_raw_value("alarm_limit", "77");
    let mut observed = 0;
    for _ in 0..100 {
        observed = client.read_03(1, 12, 1).await.unwrap()[0];
        if observed == 77 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(observed, 77);
    client.close().await.unwrap();

    events_tx
        .send(ConfigChangeEvent { gateway_id: 1, change_type: ChangeType::Deleted })
        .await
        .unwrap();
    let manager = harness.manager.clone();
    eventually("gateway removal", || {
        let manager = manager.clone();
        async move { manager.instance(1).is_none() }
    })
    .await;

    worker.stop().await;
}
