use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tether_core::{shutdown_channel, TokenIssuer, TokenScope};
use tether_endpoint::{
    BackoffConfig, CaptureSettings, EndpointConfig, EndpointError, InputInjector,
    ReconnectController, ScreenSource, SessionDriver, WsSessionDriver,
};
use tether_relay::{CloseReason, RelayConfig, RelayServer, SharedState};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "endpoint-test-secret";

struct TestRelay {
    addr: SocketAddr,
    state: SharedState,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestRelay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = RelayConfig::new(SECRET);
        config.shutdown_grace = Duration::from_millis(10);
        let server = RelayServer::new(config, None);
        let state = server.state();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async move {
            let _ = stopped.await;
        }));
        Self {
            addr,
            state,
            stop: Some(stop),
            handle,
        }
    }

    fn endpoint_config(&self) -> EndpointConfig {
        let mut config = EndpointConfig::new(&format!("http://{}", self.addr));
        config.heartbeat_interval = Duration::from_secs(60);
        config.backoff = BackoffConfig {
            floor: Duration::from_millis(50),
            max: Duration::from_millis(200),
        };
        config
    }

    async fn controller(&self) -> Ws {
        let token = TokenIssuer::new(SECRET.as_bytes(), time::Duration::hours(1))
            .issue("console", TokenScope::Controller)
            .unwrap();
        let url = format!("ws://{}/ws/control?token={}", self.addr, token.as_str());
        let (ws, _) = connect_async(url).await.unwrap();
        let state = self.state.clone();
        wait_until(move || state.registry.controller_count() == 1).await;
        ws
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("relay did not stop")
            .expect("relay task panicked")
            .unwrap();
    }
}

struct StaticScreen;

#[async_trait]
impl ScreenSource for StaticScreen {
    async fn capture(&self, _settings: &CaptureSettings) -> Result<Vec<u8>, EndpointError> {
        Ok(b"frame".to_vec())
    }
}

#[derive(Default)]
struct RecordingInjector {
    calls: Mutex<Vec<String>>,
}

impl InputInjector for RecordingInjector {
    fn move_to(&self, x: f64, y: f64) -> Result<(), EndpointError> {
        self.calls.lock().push(format!("move {x} {y}"));
        Ok(())
    }

    fn click(&self) -> Result<(), EndpointError> {
        self.calls.lock().push("click".into());
        Ok(())
    }

    fn press(&self, key: &str) -> Result<(), EndpointError> {
        self.calls.lock().push(format!("press {key}"));
        Ok(())
    }
}

/// Next text frame whose `type` matches, skipping everything else.
async fn next_of_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[test_timeout::tokio_timeout_test]
async fn endpoint_streams_frames_and_applies_commands() {
    let relay = TestRelay::start().await;
    let mut controller = relay.controller().await;

    let injector = Arc::new(RecordingInjector::default());
    let driver = Arc::new(WsSessionDriver::new(
        relay.endpoint_config(),
        Some(Arc::new(StaticScreen)),
        injector.clone(),
    ));
    let (trigger, shutdown) = shutdown_channel();
    let session = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.run_session(shutdown).await })
    };

    let connected = next_of_type(&mut controller, "client_connected").await;
    let endpoint_id = connected["client_id"].as_str().unwrap().to_string();

    let relayed = next_of_type(&mut controller, "client_data").await;
    assert_eq!(relayed["client_id"], endpoint_id.as_str());
    let screen: Value = serde_json::from_str(relayed["data"].as_str().unwrap()).unwrap();
    assert_eq!(screen, json!({"type": "screen", "data": "ZnJhbWU="}));

    let command = json!({"client_id": endpoint_id, "type": "mouse_move", "x": 0.25, "y": 0.75});
    controller
        .send(Message::text(command.to_string()))
        .await
        .unwrap();
    let recorded = injector.clone();
    wait_until(move || recorded.calls.lock().iter().any(|call| call == "move 0.25 0.75")).await;

    let update = json!({"client_id": endpoint_id, "type": "config", "screen_quality": 40});
    controller
        .send(Message::text(update.to_string()))
        .await
        .unwrap();
    let observed = driver.clone();
    wait_until(move || observed.capture_settings().quality == 40).await;

    trigger.trigger();
    let report = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .expect("session did not stop")
        .unwrap();
    assert!(report.reached_active);
    assert!(report.error.is_none());
    assert!(driver.identity_token().is_some());

    let gone = next_of_type(&mut controller, "client_disconnected").await;
    assert_eq!(gone["client_id"], endpoint_id.as_str());
    assert_eq!(relay.state.registry.endpoint_count(), 0);

    relay.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn dropped_endpoint_reconnects_under_same_id() {
    let relay = TestRelay::start().await;
    let mut controller = relay.controller().await;

    let driver = WsSessionDriver::new(
        relay.endpoint_config(),
        None,
        Arc::new(RecordingInjector::default()),
    );
    let backoff = relay.endpoint_config().backoff;
    let (trigger, shutdown) = shutdown_channel();
    let agent = tokio::spawn(async move {
        ReconnectController::new(driver, backoff, Duration::from_secs(1))
            .run(shutdown)
            .await
    });

    let connected = next_of_type(&mut controller, "client_connected").await;
    let endpoint_id = connected["client_id"].as_str().unwrap().to_string();

    let registry = relay.state.registry.clone();
    assert!(registry
        .unregister(&endpoint_id, CloseReason::Disconnected)
        .is_some());
    registry.notify_endpoint_gone(&endpoint_id);

    let gone = next_of_type(&mut controller, "client_disconnected").await;
    assert_eq!(gone["client_id"], endpoint_id.as_str());
    let again = next_of_type(&mut controller, "client_connected").await;
    assert_eq!(again["client_id"], endpoint_id.as_str());
    assert_eq!(registry.endpoint_ids(), vec![endpoint_id.clone()]);

    trigger.trigger();
    let attempts = tokio::time::timeout(Duration::from_secs(5), agent)
        .await
        .expect("reconnect loop did not stop")
        .unwrap();
    assert_eq!(attempts, 2);
    wait_until(move || registry.endpoint_count() == 0).await;

    relay.shutdown().await;
}

#[test_timeout::tokio_timeout_test]
async fn agent_keeps_retrying_until_relay_appears() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = EndpointConfig::new(&format!("http://{addr}"));
    config.backoff = BackoffConfig {
        floor: Duration::from_millis(20),
        max: Duration::from_millis(40),
    };
    let driver = WsSessionDriver::new(config.clone(), None, Arc::new(RecordingInjector::default()));
    let (trigger, shutdown) = shutdown_channel();
    let agent = tokio::spawn(async move {
        ReconnectController::new(driver, config.backoff, Duration::from_secs(1))
            .run(shutdown)
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    trigger.trigger();
    let attempts = tokio::time::timeout(Duration::from_secs(5), agent)
        .await
        .expect("reconnect loop did not stop")
        .unwrap();
    assert!(attempts >= 3, "only {attempts} attempts");
}
