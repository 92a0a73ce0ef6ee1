//! Integration tests for the relay engine.
//!
//! These tests run real listeners (serial through an in-memory device,
//! UDP over loopback) and a real WebSocket push server.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use nmea_core::{ConfigStorage, MemoryConfigStore, RelayConfig, Sentence, Source, TransportKind};
use nmea_protocol::PushEvent;
use nmea_providers::{DeviceOpener, DeviceStream, ListenerError};
use nmea_server::{
    BroadcastPublisher, ConfigWatcher, ConnectionManager, DefaultLauncher, EngineState, PublishError,
    Publisher, PushServer,
};

const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

/// Publisher that records every event.
#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<PushEvent>>,
}

impl RecordingPublisher {
    fn events(&self) -> Vec<PushEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, event: &PushEvent) -> Result<(), PublishError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Serial devices backed by fixed byte strings.
struct CannedDevices(HashMap<String, Vec<u8>>);

impl DeviceOpener for CannedDevices {
    fn open(&self, path: &str, _baud_rate: u32) -> Result<DeviceStream, ListenerError> {
        match self.0.get(path) {
            Some(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            None => Err(ListenerError::Open {
                path: path.to_string(),
                reason: "not found".to_string(),
            }),
        }
    }
}

/// Configuration with only the serial transport enabled.
fn serial_only(path: &str) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.serial.port = path.to_string();
    config.udp.enabled = false;
    config.tcp.enabled = false;
    config
}

fn serial_engine(bytes: &str) -> (Arc<ConnectionManager>, Arc<RecordingPublisher>) {
    let publisher = Arc::new(RecordingPublisher::default());
    let state = Arc::new(EngineState::new(serial_only("/dev/ttyTEST"), publisher.clone()));
    let devices = CannedDevices(HashMap::from([(
        "/dev/ttyTEST".to_string(),
        bytes.as_bytes().to_vec(),
    )]));
    let manager = ConnectionManager::new(state, DefaultLauncher::new(Arc::new(devices)));
    (Arc::new(manager), publisher)
}

/// Poll `condition` for up to two seconds.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_serial_sentence_published_once() {
    let (manager, publisher) = serial_engine(&format!("{GGA}\r\n"));

    let report = manager.reconcile().await;
    assert_eq!(report.started, vec![TransportKind::Serial]);

    assert!(eventually(|| publisher.events().len() >= 2).await);
    // Give the listener a moment to push anything extra.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = publisher.events();
    assert_eq!(events.len(), 2, "one publish is one bare and one web event");
    assert_eq!(events[0], PushEvent::NmeaData(GGA.to_string()));
    match &events[1] {
        PushEvent::NmeaDataWeb(web) => {
            assert_eq!(web.source, "SERIAL");
            assert_eq!(web.message, GGA);
        }
        other => panic!("Expected nmea_data_web, got {other:?}"),
    }

    let history = manager.state().emitter().get_history(50);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source, Source::Serial);
    assert!(history[0].to_string().contains("[SERIAL] $GPGGA"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_denylisted_sentence_never_published() {
    let (manager, publisher) = serial_engine("$GPMMB,1,2,3*00\r\n");
    manager.reconcile().await;

    let stats = manager.state().statistics().clone();
    assert!(eventually(|| stats.snapshot().rejected_denied == 1).await);

    assert!(publisher.events().is_empty());
    assert_eq!(manager.state().emitter().history_len(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_dead_serial_listener_restarted_by_reconcile() {
    let (manager, _) = serial_engine(&format!("{GGA}\r\n"));
    manager.reconcile().await;

    // The canned device hits end of file, which ends the listener.
    assert!(eventually(|| !manager.is_active(TransportKind::Serial)).await);

    let report = manager.reconcile().await;
    assert_eq!(report.stopped, vec![TransportKind::Serial]);
    assert_eq!(report.started, vec![TransportKind::Serial]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_udp_loopback_ingest() {
    let port = std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let mut config = RelayConfig::default();
    config.serial.enabled = false;
    config.tcp.enabled = false;
    config.udp.bind_ip = "127.0.0.1".parse().unwrap();
    config.udp.port = port;

    let publisher = Arc::new(RecordingPublisher::default());
    let state = Arc::new(EngineState::new(config, publisher.clone()));
    let manager = ConnectionManager::new(state, DefaultLauncher::default());
    assert_eq!(manager.reconcile().await.started, vec![TransportKind::Udp]);

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let mut received = false;
    for _ in 0..20 {
        sender.send_to(format!("{GGA}\r\n").as_bytes(), target).await.unwrap();
        if eventually(|| !publisher.events().is_empty()).await {
            received = true;
            break;
        }
    }
    assert!(received, "datagram should reach the emitter");

    let history = manager.state().emitter().get_history(1);
    assert_eq!(history[0].source, Source::Udp);
    assert!(manager.get_status().udp_active);

    manager.shutdown().await;
    assert!(!manager.get_status().udp_active);
}

#[tokio::test]
async fn test_breaker_opens_on_failing_channel() {
    struct Broken;

    impl Publisher for Broken {
        fn publish(&self, _event: &PushEvent) -> Result<(), PublishError> {
            Err(PublishError::Closed)
        }
    }

    let mut config = serial_only("/dev/null-device");
    config.emission.failure_threshold = 2;
    let state = Arc::new(EngineState::new(config, Arc::new(Broken)));
    let manager = ConnectionManager::new(state, DefaultLauncher::default());

    let emitter = manager.state().emitter().clone();
    for _ in 0..3 {
        emitter.publish(&Sentence::new(Source::Test, GGA));
    }

    let status = manager.get_status();
    let circuit = status.circuit.expect("status carries breaker state");
    assert_eq!(circuit.state, nmea_core::CircuitState::Open);
    let statistics = status.statistics.expect("status carries statistics");
    assert_eq!(statistics.publish_failures, 2);
    assert_eq!(statistics.breaker_rejected, 1);
    // History is kept regardless of the channel.
    assert_eq!(emitter.history_len(), 3);
}

#[tokio::test]
async fn test_watcher_reconciles_on_change() {
    let initial = serial_only("/dev/ttyTEST").to_key_values();
    let storage = Arc::new(MemoryConfigStore::new(initial.clone()));
    let (manager, _) = serial_engine("");
    manager.reconcile().await;

    let mut watcher = ConfigWatcher::new(storage.clone(), manager.clone());
    assert!(watcher.check().await.is_none(), "unchanged storage is ignored");

    let mut updated: BTreeMap<String, String> = initial;
    updated.insert("ENABLE_SERIAL".to_string(), "false".to_string());
    storage.save(&updated).unwrap();

    let report = watcher.check().await.expect("change should reconcile");
    assert_eq!(report.stopped, vec![TransportKind::Serial]);
    assert!(report.started.is_empty());
    assert!(!manager.state().config().serial.enabled);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_saved_update_is_not_applied_twice() {
    let storage = Arc::new(MemoryConfigStore::new(serial_only("/dev/ttyTEST").to_key_values()));
    let (manager, _) = serial_engine("");
    manager.reconcile().await;
    let mut watcher = ConfigWatcher::new(storage.clone(), manager.clone());

    let updates = BTreeMap::from([("ENABLE_SERIAL".to_string(), "false".to_string())]);
    let (report, warnings) = manager
        .update_config(storage.as_ref(), updates)
        .await
        .expect("update saves");
    assert_eq!(report.stopped, vec![TransportKind::Serial]);
    assert!(warnings.is_empty());
    assert_eq!(storage.load().unwrap()["ENABLE_SERIAL"], "false");

    // The watcher sees the new mtime, reloads the same values and finds nothing to do.
    let report = watcher.check().await.expect("saved file is a change");
    assert!(report.is_empty());
    assert!(!manager.state().config().serial.enabled);
    assert!(watcher.check().await.is_none());

    manager.shutdown().await;
}

// ============================================================================
// Push server
// ============================================================================

async fn start_push_server() -> (SocketAddr, Arc<ConnectionManager>) {
    let publisher = BroadcastPublisher::default();
    let state = Arc::new(EngineState::new(
        serial_only("/dev/ttyTEST"),
        Arc::new(publisher.clone()),
    ));
    let manager = Arc::new(ConnectionManager::new(state, DefaultLauncher::default()));

    let server = PushServer::bind("127.0.0.1:0".parse().unwrap(), publisher, manager.clone())
        .await
        .expect("bind push server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run(manager.state().shutdown_signal().clone()));

    (addr, manager)
}

async fn connect_client(addr: SocketAddr) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let url = format!("ws://{}/", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("Failed to connect");
    ws_stream
}

/// Wait for a JSON text message with timeout.
async fn recv_json(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> serde_json::Value {
    match timeout(Duration::from_secs(5), ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(&text).expect("Valid JSON"),
        other => panic!("Expected text message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_push_backfill_and_live_events() {
    let (addr, manager) = start_push_server().await;
    let emitter = manager.state().emitter().clone();
    for n in 0..12 {
        emitter.publish(&Sentence::new(Source::Tcp, format!("$GPTST,{n}*00")));
    }

    let mut ws = connect_client(addr).await;
    let backfill = recv_json(&mut ws).await;
    assert_eq!(backfill["event"], "nmea_history");
    let lines = backfill["data"].as_array().expect("history lines");
    assert_eq!(lines.len(), 10);
    for (line, n) in lines.iter().zip(2..12) {
        assert!(line
            .as_str()
            .unwrap()
            .ends_with(&format!("[TCP] $GPTST,{n}*00")));
    }

    emitter.publish(&Sentence::new(Source::Udp, GGA));
    let bare = recv_json(&mut ws).await;
    assert_eq!(bare["event"], "nmea_data");
    assert_eq!(bare["data"], GGA);
    let web = recv_json(&mut ws).await;
    assert_eq!(web["event"], "nmea_data_web");
    assert_eq!(web["data"]["source"], "UDP");

    ws.close(None).await.ok();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_push_answers_requests() {
    let (addr, manager) = start_push_server().await;
    let mut ws = connect_client(addr).await;

    ws.send(Message::Text(r#"{"event":"request_status"}"#.to_string()))
        .await
        .unwrap();
    let status = recv_json(&mut ws).await;
    assert_eq!(status["event"], "status");
    assert_eq!(status["data"]["serial_enabled"], true);
    assert_eq!(status["data"]["udp_enabled"], false);
    assert_eq!(status["data"]["connections_active"], 0);
    assert_eq!(status["data"]["udp_mode"], "server");
    assert_eq!(status["data"]["tcp_mode"], "server");

    manager
        .state()
        .emitter()
        .publish(&Sentence::new(Source::Serial, GGA));
    // Skip the two live events.
    recv_json(&mut ws).await;
    recv_json(&mut ws).await;

    ws.send(Message::Text(r#"{"event":"request_history","count":5}"#.to_string()))
        .await
        .unwrap();
    let history = recv_json(&mut ws).await;
    assert_eq!(history["event"], "history");
    assert_eq!(history["data"]["count"], 1);
    assert!(history["data"].get("success").is_none());
    assert!(history["data"]["history"][0]
        .as_str()
        .unwrap()
        .ends_with(&format!("[SERIAL] {GGA}")));

    ws.close(None).await.ok();
    manager.shutdown().await;
}
