//! Robustness tests for the relay server.
//!
//! These tests verify the relay handles edge cases and error conditions gracefully:
//! - Malformed and non-text frames
//! - Frame size limits
//! - Rapid connect/disconnect and abrupt drops
//! - Many concurrent clients and high-frequency updates
//! - Repeated reconnects under the same id
//! - Peers that stop reading
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use georelay_core::ClientId;
use georelay_protocol::text;
use georelayd::config::RelayConfig;
use georelayd::registry::{spawn_registry, RegistryHandle, RegistryStats};
use georelayd::server::RelayServer;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const ORIGIN: (f64, f64) = (37.7749, -122.4194);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    addr: SocketAddr,
    registry: RegistryHandle,
    cancel_token: CancellationToken,
}

impl TestServer {
    async fn spawn_with(config: RelayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let registry = spawn_registry(&config);
        let cancel_token = CancellationToken::new();
        let server = RelayServer::new(&config, registry.clone(), cancel_token.clone());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        Self {
            addr,
            registry,
            cancel_token,
        }
    }

    async fn spawn() -> Self {
        Self::spawn_with(RelayConfig::default()).await
    }

    async fn connect(&self) -> TestClient {
        let (ws, _) = connect_async(format!("ws://{}", self.addr))
            .await
            .expect("connect to server");
        TestClient { ws }
    }

    async fn wait_for(&self, check: impl Fn(&RegistryStats) -> bool) -> RegistryStats {
        self.wait_for_within(RECV_TIMEOUT, check).await
    }

    async fn wait_for_within(
        &self,
        limit: Duration,
        check: impl Fn(&RegistryStats) -> bool,
    ) -> RegistryStats {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let stats = self.registry.stats().await.expect("stats");
            if check(&stats) {
                return stats;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "registry never reached expected state: {stats:?}"
            );
            sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn send_raw(&mut self, message: Message) {
        self.ws.send(message).await.expect("send frame");
    }

    async fn send_json(&mut self, value: Value) {
        self.send_raw(Message::text(value.to_string())).await;
    }

    async fn register(&mut self, id: &str, user_type: &str, lat: f64, lng: f64) {
        self.send_json(json!({
            "type": "register",
            "id": id,
            "userType": user_type,
            "lat": lat,
            "lng": lng,
        }))
        .await;
    }

    async fn recv_json(&mut self) -> Value {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .expect("valid frame");
            match frame {
                Message::Text(body) => return serde_json::from_str(body.as_str()).expect("JSON"),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    async fn recv_error(&mut self) -> String {
        let reply = self.recv_json().await;
        assert_eq!(reply["type"], "error", "unexpected reply: {reply}");
        reply["message"].as_str().unwrap_or_default().to_string()
    }
}

// ============================================================================
// Malformed Input
// ============================================================================

#[tokio::test]
async fn test_malformed_frames_get_format_errors() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let malformed = [
        "",
        "{",
        "{\"type\": \"register\", \"id\": ",
        "[]",
        "null",
        "42",
        "{\"id\": \"x\", \"lat\": 1, \"lng\": 1}",
        "{\"type\": \"commuter\", \"id\": \"x\"}",
        "{\"type\": \"commuter\", \"lat\": 1, \"lng\": 1}",
        "{\"type\": \"commuter\", \"id\": \"x\", \"lat\": \"north\", \"lng\": 1}",
    ];

    for frame in malformed {
        client.send_raw(Message::text(frame)).await;
        assert_eq!(client.recv_error().await, text::INVALID_FORMAT, "frame: {frame:?}");
    }

    // Still usable afterwards
    client.register("survivor", "commuter", ORIGIN.0, ORIGIN.1).await;
    server.wait_for(|s| s.clients == 1).await;
}

#[tokio::test]
async fn test_binary_frame_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send_raw(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef].into()))
        .await;
    assert_eq!(client.recv_error().await, text::INVALID_FORMAT);

    client.register("after-binary", "commuter", ORIGIN.0, ORIGIN.1).await;
    server.wait_for(|s| s.clients == 1).await;
}

#[tokio::test]
async fn test_out_of_range_registration_closes() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.register("lost", "taxi", 91.0, 0.0).await;
    assert_eq!(client.recv_error().await, text::INVALID_REGISTRATION);

    server.wait_for(|s| s.connections == 0).await;
}

// ============================================================================
// Size Limits
// ============================================================================

#[tokio::test]
async fn test_oversized_frame_rejected_connection_survives() {
    let server = TestServer::spawn_with(RelayConfig {
        max_message_size: 256,
        ..RelayConfig::default()
    })
    .await;
    let mut client = server.connect().await;

    let padding = "x".repeat(1024);
    client
        .send_json(json!({"type": "register", "id": padding, "userType": "commuter"}))
        .await;
    assert_eq!(client.recv_error().await, text::MESSAGE_TOO_LARGE);

    client.register("small", "commuter", ORIGIN.0, ORIGIN.1).await;
    let stats = server.wait_for(|s| s.clients == 1).await;
    assert_eq!(stats.connections, 1);
}

// ============================================================================
// Connection Churn
// ============================================================================

#[tokio::test]
async fn test_rapid_connect_disconnect() {
    let server = TestServer::spawn().await;

    for i in 0..20 {
        let mut client = server.connect().await;
        client
            .register(&format!("churn-{i}"), "taxi", ORIGIN.0, ORIGIN.1)
            .await;
        client.recv_json().await;
        client.ws.close(None).await.expect("close");
    }

    let stats = server.wait_for(|s| s.connections == 0).await;
    assert_eq!((stats.clients, stats.groups), (0, 0));
}

#[tokio::test]
async fn test_abrupt_drop_is_cleaned_up() {
    let server = TestServer::spawn().await;

    let mut client = server.connect().await;
    client.register("dropper", "taxi", ORIGIN.0, ORIGIN.1).await;
    client.recv_json().await;
    server.wait_for(|s| s.groups == 1).await;

    // No close handshake
    drop(client);

    let stats = server.wait_for(|s| s.connections == 0).await;
    assert_eq!((stats.clients, stats.groups), (0, 0));
}

#[tokio::test]
async fn test_stalled_reader_is_torn_down_after_write_timeout() {
    let server = TestServer::spawn_with(RelayConfig {
        write_timeout_secs: 1,
        heartbeat_interval_secs: 3600,
        heartbeat_timeout_secs: 3600,
        ..RelayConfig::default()
    })
    .await;

    // Registers, then never reads again.
    let mut stalled = server.connect().await;
    stalled.register("stalled", "taxi", ORIGIN.0, ORIGIN.1).await;
    server.wait_for(|s| s.clients == 1 && s.groups == 1).await;

    let mut sender = server.connect().await;
    sender.register("flooder", "commuter", ORIGIN.0, ORIGIN.1).await;

    // Far more than the socket buffers hold, so the writer blocks.
    let plate = "P".repeat(60_000);
    for _ in 0..400 {
        sender
            .send_json(json!({
                "type": "commuter",
                "id": "flooder",
                "lat": ORIGIN.0,
                "lng": ORIGIN.1,
                "licensePlate": plate,
            }))
            .await;
    }

    let stats = server
        .wait_for_within(Duration::from_secs(15), |s| s.connections == 1)
        .await;
    assert_eq!((stats.clients, stats.groups), (1, 0));
    assert!(server
        .registry
        .get_client(ClientId::new("stalled"))
        .await
        .unwrap()
        .is_none());
    drop(stalled);
}

#[tokio::test]
async fn test_repeated_reconnects_under_same_id() {
    let server = TestServer::spawn().await;
    let mut clients = Vec::new();

    for _ in 0..10 {
        let mut client = server.connect().await;
        client.register("phone", "taxi", ORIGIN.0, ORIGIN.1).await;
        assert_eq!(client.recv_json().await["type"], "groupAssignment");
        clients.push(client);
    }

    let stats = server.wait_for(|s| s.connections == 1).await;
    assert_eq!(stats.clients, 1);
    assert_eq!(stats.groups, 1);

    let groups = server.registry.get_groups().await.unwrap();
    assert_eq!(groups[0].members.len(), 1);
}

// ============================================================================
// Load
// ============================================================================

#[tokio::test]
async fn test_many_concurrent_listeners_receive_relay() {
    let server = TestServer::spawn().await;
    let mut listeners = Vec::new();

    for i in 0..30 {
        let mut client = server.connect().await;
        client
            .register(&format!("listener-{i}"), "commuter", ORIGIN.0, ORIGIN.1)
            .await;
        listeners.push(client);
    }
    server.wait_for(|s| s.clients == 30).await;

    let mut sender = server.connect().await;
    sender.register("broadcaster", "commuter", ORIGIN.0, ORIGIN.1).await;
    sender
        .send_json(json!({"type": "commuter", "id": "broadcaster", "lat": ORIGIN.0, "lng": ORIGIN.1}))
        .await;

    for listener in &mut listeners {
        assert_eq!(listener.recv_json().await["id"], "broadcaster");
    }
}

#[tokio::test]
async fn test_rapid_updates_arrive_in_order() {
    let server = TestServer::spawn().await;

    let mut listener = server.connect().await;
    listener.register("watcher", "commuter", ORIGIN.0, ORIGIN.1).await;
    server.wait_for(|s| s.clients == 1).await;

    let mut mover = server.connect().await;
    mover.register("mover", "commuter", ORIGIN.0, ORIGIN.1).await;

    // Fewer than the outbound buffer, so nothing is shed.
    let steps = 50;
    for step in 0..steps {
        let lat = ORIGIN.0 + f64::from(step) * 0.00001;
        mover
            .send_json(json!({"type": "commuter", "id": "mover", "lat": lat, "lng": ORIGIN.1}))
            .await;
    }

    let mut last = f64::MIN;
    for _ in 0..steps {
        let relay = listener.recv_json().await;
        let lat = relay["lat"].as_f64().expect("lat");
        assert!(lat > last, "relays out of order");
        last = lat;
    }
}
