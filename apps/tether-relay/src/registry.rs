//! Registry of live endpoint and controller connections.
//!
//! This is the single source of truth for "who is connected". Each role has
//! its own keyed collection; mutations lock only the shard being changed, and
//! broadcasts iterate over a snapshot so no guard is held while sending.

use std::{borrow::Cow, net::SocketAddr, sync::Arc};

use axum::extract::ws::{close_code, CloseFrame, Message};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use tether_core::{shutdown_channel, RelayMessage, SessionId, ShutdownSignal, ShutdownTrigger};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Endpoint,
    Controller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Endpoint => "endpoint",
            Role::Controller => "controller",
        }
    }
}

/// Outcome of handing one frame to a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The queue was full; this frame was skipped for this peer only.
    Dropped,
}

/// One registered peer connection.
///
/// The session owns the sending half of its transport queue; once the session
/// is closed and the last handle dropped, the writer task closes the socket.
pub struct Session {
    id: SessionId,
    role: Role,
    tx: mpsc::Sender<Message>,
    last_heartbeat: Mutex<Instant>,
    connected_at: Instant,
    remote_addr: Option<SocketAddr>,
    closed: ShutdownTrigger,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered() || self.tx.is_closed()
    }

    /// Fires when the registry closes this session.
    pub fn closed(&self) -> ShutdownSignal {
        self.closed.subscribe()
    }

    pub fn send(&self, message: Message) -> Result<Delivery, RelayError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(
                    "tether_relay_frames_dropped_total",
                    "reason" => "queue_full",
                    "role" => self.role.as_str()
                )
                .increment(1);
                warn!(session_id = %self.id, role = self.role.as_str(), "outbound queue full; frame dropped");
                Ok(Delivery::Dropped)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RelayError::TransportError(self.id.clone()))
            }
        }
    }

    pub fn send_relay(&self, message: &RelayMessage) -> Result<Delivery, RelayError> {
        self.send(Message::Text(message.encode()?))
    }

    fn close(&self, code: u16, reason: &'static str) {
        let _ = self.tx.try_send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })));
        self.closed.trigger();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Why a session is being removed; selects the close frame sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Disconnected,
    HeartbeatTimeout,
    TransportFailure,
    Shutdown,
}

impl CloseReason {
    fn frame(&self) -> (u16, &'static str) {
        match self {
            CloseReason::Disconnected => (close_code::NORMAL, "disconnected"),
            CloseReason::HeartbeatTimeout => (close_code::POLICY, "heartbeat timeout"),
            CloseReason::TransportFailure => (close_code::ERROR, "transport failure"),
            CloseReason::Shutdown => (close_code::AWAY, "relay shutting down"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// A point-in-time view of one session's liveness.
#[derive(Debug, Clone)]
pub struct HeartbeatSnapshot {
    pub id: SessionId,
    pub role: Role,
    pub last_heartbeat: Instant,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    endpoints: DashMap<SessionId, Arc<Session>>,
    controllers: DashMap<SessionId, Arc<Session>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                endpoints: DashMap::new(),
                controllers: DashMap::new(),
            }),
        }
    }

    fn collection(&self, role: Role) -> &DashMap<SessionId, Arc<Session>> {
        match role {
            Role::Endpoint => &self.inner.endpoints,
            Role::Controller => &self.inner.controllers,
        }
    }

    /// Insert a new session for `transport`. Fails if `id` is live in either role.
    pub fn register(
        &self,
        role: Role,
        id: SessionId,
        transport: mpsc::Sender<Message>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Arc<Session>, RelayError> {
        let other = match role {
            Role::Endpoint => Role::Controller,
            Role::Controller => Role::Endpoint,
        };
        if self.collection(other).contains_key(&id) {
            return Err(RelayError::DuplicateId(id));
        }

        let now = Instant::now();
        let (closed, _) = shutdown_channel();
        let session = match self.collection(role).entry(id.clone()) {
            Entry::Occupied(_) => return Err(RelayError::DuplicateId(id)),
            Entry::Vacant(entry) => {
                let session = Arc::new(Session {
                    id,
                    role,
                    tx: transport,
                    last_heartbeat: Mutex::new(now),
                    connected_at: now,
                    remote_addr,
                    closed,
                });
                entry.insert(Arc::clone(&session));
                session
            }
        };

        counter!("tether_relay_connections_total", "role" => role.as_str()).increment(1);
        self.record_gauge(role);
        info!(
            session_id = %session.id,
            role = role.as_str(),
            remote_addr = ?remote_addr,
            "session registered"
        );
        Ok(session)
    }

    /// Remove `id` from whichever collection holds it and close its transport.
    /// Returns the removed session, or `None` if it was already gone.
    pub fn unregister(&self, id: &str, reason: CloseReason) -> Option<Arc<Session>> {
        let (role, session) = match self.inner.endpoints.remove(id) {
            Some((_, session)) => (Role::Endpoint, session),
            None => match self.inner.controllers.remove(id) {
                Some((_, session)) => (Role::Controller, session),
                None => return None,
            },
        };
        self.finish_removal(role, &session, reason);
        Some(session)
    }

    /// Remove `session` only if it is still the entry registered under its
    /// id. A successor that resumed the same id is left in place.
    pub fn unregister_session(&self, session: &Session, reason: CloseReason) -> bool {
        let map = self.collection(session.role());
        let removed = map
            .remove_if(session.id(), |_, current| std::ptr::eq(current.as_ref(), session))
            .is_some();
        if removed {
            self.finish_removal(session.role(), session, reason);
        }
        removed
    }

    fn finish_removal(&self, role: Role, session: &Session, reason: CloseReason) {
        let id = session.id();
        let (code, text) = reason.frame();
        session.close(code, text);
        self.record_gauge(role);
        info!(
            session_id = %id,
            role = role.as_str(),
            reason = ?reason,
            connected_secs = session.connected_at().elapsed().as_secs(),
            "session unregistered"
        );
    }

    pub fn lookup_endpoint(&self, id: &str) -> Result<Arc<Session>, RelayError> {
        self.lookup(Role::Endpoint, id)
    }

    pub fn lookup_controller(&self, id: &str) -> Result<Arc<Session>, RelayError> {
        self.lookup(Role::Controller, id)
    }

    fn lookup(&self, role: Role, id: &str) -> Result<Arc<Session>, RelayError> {
        self.collection(role)
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }

    /// Record a liveness signal for `id`. Returns false if it is not registered.
    pub fn update_heartbeat(&self, id: &str) -> bool {
        let session = self
            .inner
            .endpoints
            .get(id)
            .or_else(|| self.inner.controllers.get(id))
            .map(|entry| Arc::clone(entry.value()));
        match session {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Deliver `message` to one endpoint. A failed transport unregisters it.
    pub fn send_to_endpoint(&self, id: &str, message: Message) -> Result<Delivery, RelayError> {
        let session = self.lookup_endpoint(id)?;
        match session.send(message) {
            Ok(delivery) => Ok(delivery),
            Err(err) => {
                warn!(session_id = %id, error = %err, "endpoint send failed; unregistering");
                if self.unregister(id, CloseReason::TransportFailure).is_some() {
                    self.notify_endpoint_gone(id);
                }
                Err(err)
            }
        }
    }

    /// Deliver `message` to every controller except `exclude`.
    ///
    /// Iterates a snapshot; controllers whose transport has failed are removed
    /// after the pass and the broadcast continues for the rest.
    pub fn broadcast_to_controllers(
        &self,
        message: &RelayMessage,
        exclude: Option<&str>,
    ) -> Result<BroadcastReport, RelayError> {
        let text = message.encode()?;
        let targets: Vec<Arc<Session>> = self
            .inner
            .controllers
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != exclude)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for session in targets {
            match session.send(Message::Text(text.clone())) {
                Ok(Delivery::Delivered) => report.delivered += 1,
                Ok(Delivery::Dropped) => report.dropped += 1,
                Err(err) => {
                    warn!(session_id = %session.id, error = %err, "broadcast to controller failed");
                    failed.push(session.id.clone());
                }
            }
        }

        report.failed = failed.len();
        for id in failed {
            self.unregister(&id, CloseReason::TransportFailure);
        }

        if report.delivered > 0 {
            counter!(
                "tether_relay_messages_forwarded_total",
                "direction" => "to_controllers"
            )
            .increment(report.delivered as u64);
        }
        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            failed = report.failed,
            "broadcast to controllers"
        );
        Ok(report)
    }

    /// Tell every controller that an endpoint has left.
    pub fn notify_endpoint_gone(&self, id: &str) {
        let message = RelayMessage::ClientDisconnected {
            client_id: id.to_string(),
        };
        if let Err(err) = self.broadcast_to_controllers(&message, None) {
            warn!(session_id = %id, error = %err, "failed to announce endpoint disconnect");
        }
    }

    pub fn endpoint_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .inner
            .endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.len()
    }

    pub fn controller_count(&self) -> usize {
        self.inner.controllers.len()
    }

    pub fn heartbeat_snapshot(&self) -> Vec<HeartbeatSnapshot> {
        let snapshot = |role: Role| {
            self.collection(role)
                .iter()
                .map(|entry| HeartbeatSnapshot {
                    id: entry.key().clone(),
                    role,
                    last_heartbeat: entry.value().last_heartbeat(),
                })
                .collect::<Vec<_>>()
        };
        let mut all = snapshot(Role::Endpoint);
        all.extend(snapshot(Role::Controller));
        all
    }

    /// Close every session; used on shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self
            .heartbeat_snapshot()
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        ids.iter()
            .filter(|id| self.unregister(id, CloseReason::Shutdown).is_some())
            .count()
    }

    fn record_gauge(&self, role: Role) {
        gauge!("tether_relay_sessions_active", "role" => role.as_str())
            .set(self.collection(role).len() as f64);
    }
}
