//! WebSocket session against the relay's endpoint route.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::ShutdownSignal;
use tokio::{net::TcpStream, time::Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{
    capture::{CaptureSettings, FrameCache, ScreenSource},
    config::EndpointConfig,
    error::EndpointError,
    frames::{clamp_unit, decode_inbound, InboundFrame, OutboundFrame},
    input::InputInjector,
    reconnect::{SessionDriver, SessionReport},
};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State that outlives a single connection.
#[derive(Debug)]
struct Carried {
    identity_token: Option<String>,
    settings: CaptureSettings,
}

pub struct WsSessionDriver {
    config: EndpointConfig,
    screen: Option<Arc<dyn ScreenSource>>,
    injector: Arc<dyn InputInjector>,
    carried: Mutex<Carried>,
}

impl WsSessionDriver {
    /// Without a screen source the session only heartbeats and takes commands.
    pub fn new(
        config: EndpointConfig,
        screen: Option<Arc<dyn ScreenSource>>,
        injector: Arc<dyn InputInjector>,
    ) -> Self {
        let settings = config.capture;
        Self {
            config,
            screen,
            injector,
            carried: Mutex::new(Carried {
                identity_token: None,
                settings,
            }),
        }
    }

    /// Identity token from the most recent `auth` frame.
    pub fn identity_token(&self) -> Option<String> {
        self.carried.lock().identity_token.clone()
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        self.carried.lock().settings
    }

    fn connect_url(&self) -> String {
        match &self.carried.lock().identity_token {
            Some(token) => format!("{}?resume={token}", self.config.relay_url),
            None => self.config.relay_url.clone(),
        }
    }

    async fn connect(&self) -> Result<RelaySocket, EndpointError> {
        let url = self.connect_url();
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|source| EndpointError::Connect {
                url: self.config.relay_url.clone(),
                source,
            })?;
        debug!(url = %self.config.relay_url, "connected to relay");
        Ok(socket)
    }

    /// The relay's first text frame must be `auth`.
    async fn await_auth(&self, socket: &mut RelaySocket) -> Result<String, EndpointError> {
        let timeout = self.config.handshake_timeout;
        let handshake = async {
            loop {
                match socket.next().await {
                    None => return Err(EndpointError::Closed),
                    Some(Err(err)) => return Err(EndpointError::Transport(err)),
                    Some(Ok(Message::Text(text))) => {
                        return match decode_inbound(text.as_str()) {
                            Ok(InboundFrame::Auth { token }) => Ok(token),
                            Ok(other) => Err(EndpointError::HandshakeRejected(format!(
                                "expected auth frame, got {other:?}"
                            ))),
                            Err(err) => Err(EndpointError::HandshakeRejected(err.to_string())),
                        };
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.as_str().to_owned())
                            .unwrap_or_else(|| "no reason".to_string());
                        return Err(EndpointError::HandshakeRejected(reason));
                    }
                    Some(Ok(_)) => continue,
                }
            }
        };
        tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| EndpointError::HandshakeTimeout(timeout))?
    }

    async fn stream(
        &self,
        socket: &mut RelaySocket,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), EndpointError> {
        let heartbeat = self.config.heartbeat_interval;
        let mut heartbeat_tick = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        let mut frames = self.screen.clone().map(FrameCache::new);
        let next_frame = tokio::time::sleep(std::time::Duration::ZERO);
        tokio::pin!(next_frame);

        loop {
            tokio::select! {
                _ = shutdown.triggered() => {
                    info!("shutdown requested; closing relay session");
                    let _ = socket
                        .close(Some(CloseFrame {
                            code: CloseCode::Away,
                            reason: "endpoint shutting down".into(),
                        }))
                        .await;
                    return Ok(());
                }
                _ = heartbeat_tick.tick() => {
                    send_frame(socket, &OutboundFrame::Ping).await?;
                }
                _ = &mut next_frame, if frames.is_some() => {
                    let settings = self.capture_settings();
                    if let Some(cache) = frames.as_mut() {
                        match cache.frame(&settings).await {
                            Ok(data) => send_frame(socket, &OutboundFrame::Screen { data }).await?,
                            Err(err) => warn!(error = %err, "frame skipped"),
                        }
                    }
                    next_frame.as_mut().reset(Instant::now() + settings.update_interval);
                }
                message = socket.next() => match message {
                    None => return Err(EndpointError::Closed),
                    Some(Err(err)) => return Err(EndpointError::Transport(err)),
                    Some(Ok(Message::Text(text))) => self.handle_inbound(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_inbound(text),
                        Err(_) => warn!(len = bytes.len(), "ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(reason = ?frame.map(|frame| frame.reason.as_str().to_owned()), "relay closed session");
                        return Err(EndpointError::Closed);
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    /// Apply one frame from the relay. Malformed or unknown frames are logged
    /// and ignored.
    fn handle_inbound(&self, text: &str) {
        let frame = match decode_inbound(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "ignoring unrecognised frame");
                return;
            }
        };

        let result = match frame {
            InboundFrame::Auth { token } => {
                self.carried.lock().identity_token = Some(token);
                debug!("identity token refreshed");
                Ok(())
            }
            InboundFrame::Pong => {
                debug!("heartbeat acknowledged");
                Ok(())
            }
            InboundFrame::MouseMove { x, y } => self.injector.move_to(clamp_unit(x), clamp_unit(y)),
            InboundFrame::MouseClick { x, y } => self
                .injector
                .move_to(clamp_unit(x), clamp_unit(y))
                .and_then(|_| self.injector.click()),
            InboundFrame::KeyPress { key } => self.injector.press(&key),
            InboundFrame::Config {
                screen_quality,
                screen_scale,
                update_interval,
            } => {
                let mut carried = self.carried.lock();
                carried
                    .settings
                    .apply_update(screen_quality, screen_scale, update_interval);
                info!(settings = ?carried.settings, "capture settings updated");
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(error = %err, "command failed");
        }
    }
}

async fn send_frame(
    socket: &mut RelaySocket,
    frame: &OutboundFrame<'_>,
) -> Result<(), EndpointError> {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "failed to encode frame");
            return Ok(());
        }
    };
    socket.send(Message::text(text)).await?;
    Ok(())
}

#[async_trait]
impl SessionDriver for WsSessionDriver {
    async fn run_session(&self, shutdown: ShutdownSignal) -> SessionReport {
        let mut socket = match self.connect().await {
            Ok(socket) => socket,
            Err(err) => return SessionReport::failed(err),
        };

        let token = match self.await_auth(&mut socket).await {
            Ok(token) => token,
            Err(err) => {
                let _ = socket.close(None).await;
                return SessionReport::failed(err);
            }
        };
        let subject = subject_of(&token);
        self.carried.lock().identity_token = Some(token);
        info!(session_id = %subject, "authenticated with relay");

        let error = self.stream(&mut socket, shutdown).await.err();
        if error.is_some() {
            let _ = socket.close(None).await;
        }
        SessionReport {
            reached_active: true,
            error,
        }
    }
}

/// Best-effort read of the `sub` claim for logging; the signature is the
/// relay's concern.
fn subject_of(token: &str) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    token
        .split('.')
        .nth(1)
        .and_then(|payload| URL_SAFE_NO_PAD.decode(payload).ok())
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .and_then(|claims| claims.get("sub").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_string())
}
