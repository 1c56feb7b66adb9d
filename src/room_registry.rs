use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::quiz::messages::ServerMessage;

/// Which side of the room a connection represents. Hosts receive every
/// broadcast (including host-only diagnostics); participants receive the
/// subset addressed to the whole room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Host,
    Participant,
}

/// Reason a connection was force-closed, surfaced to the transport layer
/// so it can choose the matching close frame (out of scope here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    SendFailed,
    HeartbeatTimeout,
}

/// A single open connection's metadata plus its outbound channel. Frames
/// enqueued on `sender` are delivered to this connection in enqueue order
/// (spec.md §5 "per WebSocket: FIFO"); there is no cross-connection
/// ordering guarantee.
struct ConnectionEntry {
    role: ConnectionRole,
    principal_id: String,
    display_name: String,
    participant_id: Option<String>,
    sender: mpsc::UnboundedSender<ServerMessage>,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    heartbeat_task: JoinHandle<()>,
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        self.heartbeat_task.abort();
    }
}

/// A handle returned to the transport layer on `connect`. The registry
/// never touches an actual socket — the out-of-scope HTTP/WebSocket layer
/// owns the accept/upgrade and forwards frames pulled off `receiver` to
/// the wire, and pushes inbound client frames back through
/// `RoomRegistry::record_heartbeat` / the engine's own entry points.
pub struct ConnectionHandle {
    pub connection_id: String,
    pub session_id: String,
    pub receiver: mpsc::UnboundedReceiver<ServerMessage>,
}

/// In-process mapping `session_id -> set<connection>` plus per-connection
/// metadata and a heartbeat monitor (C5). Pure in-memory state, mutated
/// only through these methods — never a module-level global (spec.md §9
/// singleton-connection-manager redesign flag), constructed once at
/// startup and shared via `Arc`.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, HashMap<String, ConnectionEntry>>>,
    clock: Arc<dyn Clock>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl RoomRegistry {
    pub fn new(clock: Arc<dyn Clock>, heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            clock,
            heartbeat_interval,
            heartbeat_timeout,
        })
    }

    /// Accepts a new connection into `session_id`'s room, records its
    /// metadata, spawns its heartbeat task, and returns the handle the
    /// transport layer pumps frames through. Sends the
    /// `connection_established` frame before returning.
    pub async fn connect(
        self: &Arc<Self>,
        session_id: &str,
        role: ConnectionRole,
        principal_id: &str,
        display_name: &str,
        participant_id: Option<String>,
    ) -> ConnectionHandle {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let now = self.clock.now();

        let registry = Arc::clone(self);
        let session_id_owned = session_id.to_string();
        let connection_id_owned = connection_id.clone();
        let interval = self.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !registry
                    .tick_heartbeat(&session_id_owned, &connection_id_owned)
                    .await
                {
                    break;
                }
            }
        });

        let entry = ConnectionEntry {
            role,
            principal_id: principal_id.to_string(),
            display_name: display_name.to_string(),
            participant_id,
            sender: tx.clone(),
            connected_at: now,
            last_heartbeat: now,
            heartbeat_task,
        };

        {
            let mut rooms = self.rooms.write().await;
            rooms
                .entry(session_id.to_string())
                .or_default()
                .insert(connection_id.clone(), entry);
        }

        let _ = tx.send(ServerMessage::ConnectionEstablished {
            timestamp: now,
            connection_id: connection_id.clone(),
        });

        ConnectionHandle {
            connection_id,
            session_id: session_id.to_string(),
            receiver: rx,
        }
    }

    /// Cancels the heartbeat task, removes the connection, and drops the
    /// room entirely once its last connection leaves.
    pub async fn disconnect(&self, session_id: &str, connection_id: &str, _reason: CloseReason) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(session_id) {
            room.remove(connection_id);
            if room.is_empty() {
                rooms.remove(session_id);
            }
        }
    }

    /// Best-effort send; on failure the connection is disconnected
    /// immediately (spec.md §4.3).
    pub async fn send(&self, session_id: &str, connection_id: &str, message: ServerMessage) {
        let failed = {
            let rooms = self.rooms.read().await;
            match rooms.get(session_id).and_then(|room| room.get(connection_id)) {
                Some(entry) => entry.sender.send(message).is_err(),
                None => return,
            }
        };
        if failed {
            self.disconnect(session_id, connection_id, CloseReason::SendFailed).await;
        }
    }

    /// Fans a message out to every connection in the room, optionally
    /// excluding one (e.g. the submitter already replied to directly).
    /// Each per-connection failure isolates to that connection; the
    /// registry does not wait for delivery before returning.
    pub async fn broadcast(&self, session_id: &str, message: ServerMessage, exclude: Option<&str>) {
        self.broadcast_filtered(session_id, message, |_, _| true, exclude).await;
    }

    pub async fn broadcast_hosts(&self, session_id: &str, message: ServerMessage) {
        self.broadcast_filtered(session_id, message, |role, _| *role == ConnectionRole::Host, None)
            .await;
    }

    pub async fn broadcast_participants(&self, session_id: &str, message: ServerMessage) {
        self.broadcast_filtered(
            session_id,
            message,
            |role, _| *role == ConnectionRole::Participant,
            None,
        )
        .await;
    }

    async fn broadcast_filtered(
        &self,
        session_id: &str,
        message: ServerMessage,
        predicate: impl Fn(&ConnectionRole, &ConnectionEntry) -> bool,
        exclude: Option<&str>,
    ) {
        let mut failed = Vec::new();
        {
            let rooms = self.rooms.read().await;
            let Some(room) = rooms.get(session_id) else {
                return;
            };
            for (connection_id, entry) in room.iter() {
                if Some(connection_id.as_str()) == exclude {
                    continue;
                }
                if !predicate(&entry.role, entry) {
                    continue;
                }
                if entry.sender.send(message.clone()).is_err() {
                    failed.push(connection_id.clone());
                }
            }
        }
        for connection_id in failed {
            self.disconnect(session_id, &connection_id, CloseReason::SendFailed).await;
        }
    }

    pub async fn total_connections(&self, session_id: &str) -> usize {
        self.rooms.read().await.get(session_id).map(|r| r.len()).unwrap_or(0)
    }

    /// Updates `last_heartbeat` for a connection on receipt of a client
    /// `pong` frame.
    pub async fn record_heartbeat(&self, session_id: &str, connection_id: &str) {
        let now = self.clock.now();
        let mut rooms = self.rooms.write().await;
        if let Some(entry) = rooms.get_mut(session_id).and_then(|r| r.get_mut(connection_id)) {
            entry.last_heartbeat = now;
        }
    }

    /// One heartbeat tick for a single connection: send a ping, then check
    /// whether the connection has gone stale since the last tick. Returns
    /// `false` once the connection is gone so the spawned task can stop.
    async fn tick_heartbeat(&self, session_id: &str, connection_id: &str) -> bool {
        let now = self.clock.now();
        let (stale, principal) = {
            let rooms = self.rooms.read().await;
            match rooms.get(session_id).and_then(|r| r.get(connection_id)) {
                Some(entry) => (
                    now.signed_duration_since(entry.last_heartbeat) > chrono::Duration::from_std(self.heartbeat_timeout).unwrap_or_default(),
                    entry.principal_id.clone(),
                ),
                None => return false,
            }
        };

        if stale {
            debug!(session_id, connection_id, principal = %principal, "heartbeat timeout, force-closing connection");
            self.disconnect(session_id, connection_id, CloseReason::HeartbeatTimeout).await;
            return false;
        }

        self.send(session_id, connection_id, ServerMessage::Ping { timestamp: now }).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;

    fn registry() -> Arc<RoomRegistry> {
        RoomRegistry::new(
            Arc::new(FixedClock::new(Utc::now())),
            Duration::from_millis(10),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn connect_sends_connection_established_and_registers() {
        let registry = registry();
        let mut handle = registry
            .connect("s1", ConnectionRole::Host, "tenant-a", "Teacher", None)
            .await;
        let first = handle.receiver.recv().await.unwrap();
        assert!(matches!(first, ServerMessage::ConnectionEstablished { .. }));
        assert_eq!(registry.total_connections("s1").await, 1);
    }

    #[tokio::test]
    async fn broadcast_is_isolated_per_connection_failure() {
        let registry = registry();
        let mut host = registry
            .connect("s1", ConnectionRole::Host, "tenant-a", "Teacher", None)
            .await;
        let participant = registry
            .connect("s1", ConnectionRole::Participant, "guest-1", "Alice", Some("p1".into()))
            .await;
        drop(participant);

        // drain connection_established for host
        host.receiver.recv().await;

        registry
            .broadcast(
                "s1",
                ServerMessage::SessionEnded {
                    timestamp: Utc::now(),
                    session_id: "s1".into(),
                    reason: "cancelled".into(),
                },
                None,
            )
            .await;

        let next = host.receiver.recv().await.unwrap();
        assert!(matches!(next, ServerMessage::SessionEnded { .. }));
    }

    #[tokio::test]
    async fn disconnect_drops_empty_room() {
        let registry = registry();
        let handle = registry
            .connect("s1", ConnectionRole::Host, "tenant-a", "Teacher", None)
            .await;
        registry.disconnect("s1", &handle.connection_id, CloseReason::ClientDisconnected).await;
        assert_eq!(registry.total_connections("s1").await, 0);
    }
}
