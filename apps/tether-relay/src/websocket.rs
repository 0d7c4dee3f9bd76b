//! Relay protocol engine: the per-connection state machines for endpoints and
//! controllers.
//!
//! Each upgraded socket is split into a reader, driven by the handler task,
//! and a writer task fed through the session's bounded queue. Registry
//! operations never await, so a broadcast can never observe a half-applied
//! register or unregister.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use serde::Deserialize;
use tether_core::{
    decode_controller_command, decode_endpoint_frame, generate_session_id,
    protocol::{binary_as_text, LEGACY_PING, LEGACY_PONG},
    ControllerCommand, EndpointFrame, FrameError, RelayMessage, SessionId, TokenScope,
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    handlers::{authorize_controller, CredentialQuery},
    registry::{CloseReason, Delivery, Role, Session},
    server::{AppState, SharedState},
};

#[derive(Debug, Default, Deserialize)]
pub struct EndpointQuery {
    /// Identity token from a previous session, used to keep the same id.
    pub resume: Option<String>,
}

pub async fn endpoint_ws_handler(
    State(state): State<SharedState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<EndpointQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_endpoint(socket, state, query.resume, remote_addr))
}

pub async fn controller_ws_handler(
    State(state): State<SharedState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match authorize_controller(&state, &headers, query.token.as_deref()) {
        Ok(claims) => {
            let principal = claims.subject_id().to_string();
            ws.on_upgrade(move |socket| run_controller(socket, state, principal, remote_addr))
                .into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn run_endpoint(
    socket: WebSocket,
    state: SharedState,
    resume: Option<String>,
    remote_addr: SocketAddr,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(state.config.session_buffer);

    let session = match register_endpoint(&state, resume.as_deref(), tx, remote_addr) {
        Ok(session) => session,
        Err(err) => {
            warn!(remote_addr = %remote_addr, error = %err, "endpoint registration failed");
            return;
        }
    };
    let id = session.id().to_string();
    spawn_writer(id.clone(), ws_tx, rx, state.config.heartbeat.interval);

    if let Err(err) = announce_endpoint(&state, &session) {
        warn!(session_id = %id, error = %err, "failed to announce endpoint");
    }

    read_frames(&state, &session, &mut ws_rx, |text| {
        handle_endpoint_text(&state, &session, text)
    })
    .await;

    if state
        .registry
        .unregister_session(&session, CloseReason::Disconnected)
    {
        state.registry.notify_endpoint_gone(&id);
    }
    info!(session_id = %id, "endpoint session closed");
}

/// Reuse the id carried by a valid resume token when it is free, otherwise
/// register under a fresh id.
fn register_endpoint(
    state: &AppState,
    resume: Option<&str>,
    tx: mpsc::Sender<Message>,
    remote_addr: SocketAddr,
) -> Result<Arc<Session>, RelayError> {
    let resumed = resume.and_then(|token| {
        match state.issuer.verify_scoped(token, TokenScope::Endpoint) {
            Ok(claims) => Some(claims.subject_id().to_string()),
            Err(err) => {
                debug!(error = %err, "resume token rejected; issuing fresh id");
                None
            }
        }
    });

    if let Some(id) = resumed {
        match state
            .registry
            .register(Role::Endpoint, id.clone(), tx.clone(), Some(remote_addr))
        {
            Ok(session) => {
                info!(session_id = %id, "endpoint session resumed");
                return Ok(session);
            }
            Err(RelayError::DuplicateId(_)) => {
                debug!(session_id = %id, "resumed id still live; issuing fresh id");
            }
            Err(err) => return Err(err),
        }
    }

    let mut attempts = 0;
    loop {
        attempts += 1;
        match state.registry.register(
            Role::Endpoint,
            generate_session_id(),
            tx.clone(),
            Some(remote_addr),
        ) {
            Err(RelayError::DuplicateId(_)) if attempts < 3 => continue,
            other => return other,
        }
    }
}

fn announce_endpoint(state: &AppState, session: &Session) -> Result<(), RelayError> {
    let token = state.issuer.issue(session.id(), TokenScope::Endpoint)?;
    session.send_relay(&RelayMessage::Auth {
        token: token.into_string(),
    })?;
    state.registry.broadcast_to_controllers(
        &RelayMessage::ClientConnected {
            client_id: session.id().to_string(),
        },
        None,
    )?;
    Ok(())
}

fn handle_endpoint_text(state: &AppState, session: &Session, text: &str) {
    match decode_endpoint_frame(text) {
        Ok(EndpointFrame::Ping { legacy }) => {
            let reply = if legacy {
                Ok(Message::Text(LEGACY_PONG.to_string()))
            } else {
                RelayMessage::Pong.encode().map(Message::Text)
            };
            reply_to(session, reply);
        }
        Ok(EndpointFrame::Pong) => {}
        Ok(EndpointFrame::Data { kind, raw }) => {
            let message = RelayMessage::ClientData {
                client_id: session.id().to_string(),
                data: raw,
            };
            match state.registry.broadcast_to_controllers(&message, None) {
                Ok(report) => debug!(
                    session_id = %session.id(),
                    kind = %kind,
                    delivered = report.delivered,
                    "endpoint frame relayed"
                ),
                Err(err) => warn!(session_id = %session.id(), error = %err, "failed to relay endpoint frame"),
            }
        }
        Err(err) => malformed(session, err),
    }
}

async fn run_controller(
    socket: WebSocket,
    state: SharedState,
    principal: String,
    remote_addr: SocketAddr,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(state.config.session_buffer);

    let session = match state.registry.register(
        Role::Controller,
        generate_session_id(),
        tx,
        Some(remote_addr),
    ) {
        Ok(session) => session,
        Err(err) => {
            warn!(principal = %principal, error = %err, "controller registration failed");
            return;
        }
    };
    let id = session.id().to_string();
    spawn_writer(id.clone(), ws_tx, rx, state.config.heartbeat.interval);
    info!(session_id = %id, principal = %principal, "controller attached");

    read_frames(&state, &session, &mut ws_rx, |text| {
        handle_controller_text(&state, &session, text)
    })
    .await;

    state
        .registry
        .unregister_session(&session, CloseReason::Disconnected);
    info!(session_id = %id, principal = %principal, "controller detached");
}

fn handle_controller_text(state: &AppState, session: &Session, text: &str) {
    if text.trim() == LEGACY_PING {
        reply_to(session, Ok(Message::Text(LEGACY_PONG.to_string())));
        return;
    }

    match decode_controller_command(text) {
        Ok(ControllerCommand::Ping) => {
            reply_to(session, RelayMessage::Pong.encode().map(Message::Text));
        }
        Ok(ControllerCommand::Forward { target, raw }) => {
            match state.registry.send_to_endpoint(&target, Message::Text(raw)) {
                Ok(Delivery::Delivered) => {
                    counter!("tether_relay_messages_forwarded_total", "direction" => "to_endpoint")
                        .increment(1);
                    debug!(session_id = %session.id(), target = %target, "command forwarded");
                }
                Ok(Delivery::Dropped) => {}
                Err(RelayError::NotFound(_)) => {
                    warn!(session_id = %session.id(), target = %target, "unknown target; command dropped");
                    counter!("tether_relay_frames_dropped_total", "reason" => "unknown_target")
                        .increment(1);
                }
                Err(err) => {
                    warn!(session_id = %session.id(), target = %target, error = %err, "command delivery failed");
                }
            }
        }
        Err(err) => malformed(session, err),
    }
}

fn reply_to(session: &Session, reply: Result<Message, serde_json::Error>) {
    let result = reply
        .map_err(RelayError::from)
        .and_then(|message| session.send(message));
    if let Err(err) = result {
        debug!(session_id = %session.id(), error = %err, "failed to answer ping");
    }
}

fn malformed(session: &Session, err: FrameError) {
    let err = RelayError::from(err);
    warn!(
        session_id = %session.id(),
        role = session.role().as_str(),
        error = %err,
        "malformed frame dropped"
    );
    counter!("tether_relay_frames_dropped_total", "reason" => err.kind()).increment(1);
}

/// Drive the inbound half until the peer leaves, the registry closes the
/// session, or the relay shuts down.
///
/// Reads wait at most one heartbeat interval; an expired wait only checks the
/// heartbeat age, leaving eviction to the monitor unless the session is
/// already past its timeout.
async fn read_frames<F>(
    state: &AppState,
    session: &Session,
    ws_rx: &mut SplitStream<WebSocket>,
    mut on_text: F,
) where
    F: FnMut(&str),
{
    let heartbeat = state.config.heartbeat;
    let mut closed = session.closed();
    let mut shutdown = state.shutdown.clone();

    loop {
        let next = tokio::select! {
            _ = closed.triggered() => break,
            _ = shutdown.triggered() => break,
            next = tokio::time::timeout(heartbeat.interval, ws_rx.next()) => next,
        };

        let message = match next {
            Err(_) => {
                let age = Instant::now().saturating_duration_since(session.last_heartbeat());
                if age > heartbeat.timeout {
                    warn!(session_id = %session.id(), age_secs = age.as_secs(), "session idle past timeout");
                    break;
                }
                continue;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(session_id = %session.id(), error = %err, "transport error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        session.touch();
        match message {
            Message::Text(text) => on_text(&text),
            Message::Binary(bytes) => match binary_as_text(&bytes) {
                Ok(text) => on_text(text),
                Err(err) => malformed(session, err),
            },
            Message::Close(frame) => {
                debug!(
                    session_id = %session.id(),
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "peer closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Forward queued frames to the socket, interleaving transport keepalive pings.
/// Ends after a close frame, a failed send, or once every sender is gone.
fn spawn_writer(
    session_id: SessionId,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    keepalive: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut keepalive = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        loop {
            let message = tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = keepalive.tick() => Message::Ping(Vec::new()),
            };
            let closing = matches!(message, Message::Close(_));
            if let Err(err) = ws_tx.send(message).await {
                debug!(session_id = %session_id, error = %err, "websocket send failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
        debug!(session_id = %session_id, "writer task finished");
    })
}
