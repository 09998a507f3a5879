// One live document: its replica, the connections in its room and their
// presence.
//
// All room mutations and broadcasts happen under `state`. Broadcasting only
// enqueues onto unbounded per-connection channels, so the lock never spans
// network or storage I/O, and every member sees updates in merge order.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex as StdMutex, PoisonError,
    },
};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{Map, Value};
use tandem_common::{
    protocol::ws::{PeerPresence, WsMessage},
    types::{DocumentId, Role},
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::replica::{decode_update, MergeEffect, ReplicaDoc, CONTENT_TEXT};
use crate::storage::{SaveOutcome, StorageAdapter, StorageError};

pub type Outbound = mpsc::UnboundedSender<WsMessage>;

/// A connection joining a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub outbound: Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { broadcast_to: usize },
    RejectedUnauthorized,
    RejectedMalformed,
    NoOp,
    UnknownConnection,
}

impl UpdateOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::RejectedUnauthorized => "read_only",
            Self::RejectedMalformed => "malformed",
            Self::NoOp => "noop",
            Self::UnknownConnection => "unknown_connection",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Clean,
    Persisted { bytes: usize },
    RejectedTooSmall { bytes: usize },
}

struct ConnectionEntry {
    user_id: Uuid,
    role: Role,
    outbound: Outbound,
    presence: Map<String, Value>,
}

struct SessionState {
    replica: ReplicaDoc,
    connections: HashMap<Uuid, ConnectionEntry>,
}

pub struct DocumentSession {
    doc_id: DocumentId,
    state: Mutex<SessionState>,
    /// Bumped under `state` on every state-changing merge.
    generation: AtomicU64,
    /// Generation covered by the last successful save. Held across the
    /// save so saves of one session never overlap.
    persisted_generation: Mutex<u64>,
    last_persisted: StdMutex<Option<Vec<u8>>>,
}

impl DocumentSession {
    pub fn new(doc_id: DocumentId, replica: ReplicaDoc, persisted: Option<Vec<u8>>) -> Self {
        Self {
            doc_id,
            state: Mutex::new(SessionState { replica, connections: HashMap::new() }),
            generation: AtomicU64::new(0),
            persisted_generation: Mutex::new(0),
            last_persisted: StdMutex::new(persisted),
        }
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    /// Adds `member` to the room and queues its `sync_full` as the first
    /// outbound frame. A peer state vector that fails to decode falls back to
    /// the full state.
    pub(crate) async fn add_connection(&self, member: Member, state_vector: Option<&[u8]>) {
        let mut state = self.state.lock().await;

        let state_bytes = match state_vector {
            Some(remote) => state.replica.diff_since(remote).unwrap_or_else(|error| {
                warn!(
                    doc_id = %self.doc_id,
                    connection_id = %member.connection_id,
                    error = %error,
                    "ignoring invalid state vector on join"
                );
                state.replica.full_state()
            }),
            None => state.replica.full_state(),
        };
        let peers = peers_of(&state.connections, member.connection_id);

        let _ = member.outbound.send(WsMessage::SyncFull {
            doc_id: self.doc_id.clone(),
            connection_id: member.connection_id,
            role: member.role,
            state_b64: STANDARD.encode(state_bytes),
            peers,
        });

        state.connections.insert(
            member.connection_id,
            ConnectionEntry {
                user_id: member.user_id,
                role: member.role,
                outbound: member.outbound,
                presence: Map::new(),
            },
        );
    }

    /// Removes the connection and tells the rest of the room. Returns the
    /// remaining member count, or `None` when the connection was not here.
    pub(crate) async fn remove_connection(&self, connection_id: Uuid) -> Option<usize> {
        let mut state = self.state.lock().await;
        state.connections.remove(&connection_id)?;
        broadcast(&state.connections, connection_id, &WsMessage::PresenceLeft { connection_id });
        Some(state.connections.len())
    }

    pub async fn apply_update(&self, connection_id: Uuid, update_bytes: &[u8]) -> UpdateOutcome {
        let mut state = self.state.lock().await;

        let Some(entry) = state.connections.get(&connection_id) else {
            return UpdateOutcome::UnknownConnection;
        };
        if !entry.role.can_write() {
            return UpdateOutcome::RejectedUnauthorized;
        }

        let update = match decode_update(update_bytes) {
            Ok(update) => update,
            Err(error) => {
                warn!(
                    doc_id = %self.doc_id,
                    connection_id = %connection_id,
                    update_bytes = update_bytes.len(),
                    error = %error,
                    "dropping undecodable update"
                );
                return UpdateOutcome::RejectedMalformed;
            }
        };

        match state.replica.integrate(update) {
            Ok(MergeEffect::Changed) => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                let message = WsMessage::Update {
                    update_b64: STANDARD.encode(update_bytes),
                    origin: Some(connection_id),
                };
                let broadcast_to = broadcast(&state.connections, connection_id, &message);
                UpdateOutcome::Applied { broadcast_to }
            }
            Ok(MergeEffect::Unchanged) => UpdateOutcome::NoOp,
            Err(error) => {
                warn!(
                    doc_id = %self.doc_id,
                    connection_id = %connection_id,
                    error = %error,
                    "update failed to integrate; restoring last persisted snapshot"
                );
                state.replica = self.restore_replica();
                UpdateOutcome::RejectedMalformed
            }
        }
    }

    /// Merges `fields` into the sender's presence (last write wins per field)
    /// and relays them to the rest of the room. Returns the recipient count,
    /// or `None` for an unknown connection.
    pub async fn update_presence(
        &self,
        connection_id: Uuid,
        fields: Map<String, Value>,
    ) -> Option<usize> {
        let mut state = self.state.lock().await;
        let entry = state.connections.get_mut(&connection_id)?;
        for (key, value) in &fields {
            entry.presence.insert(key.clone(), value.clone());
        }

        let message =
            WsMessage::PresenceUpdate { connection_id: Some(connection_id), fields: Value::Object(fields) };
        Some(broadcast(&state.connections, connection_id, &message))
    }

    pub async fn presence_snapshot(&self, excluding: Uuid) -> Vec<PeerPresence> {
        let state = self.state.lock().await;
        peers_of(&state.connections, excluding)
    }

    /// Updates the cached role of a connection after re-validation.
    pub async fn set_role(&self, connection_id: Uuid, role: Role) -> bool {
        let mut state = self.state.lock().await;
        match state.connections.get_mut(&connection_id) {
            Some(entry) => {
                entry.role = role;
                true
            }
            None => false,
        }
    }

    pub async fn full_state(&self) -> Vec<u8> {
        self.state.lock().await.replica.full_state()
    }

    pub async fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, super::replica::ReplicaError> {
        self.state.lock().await.replica.diff_since(state_vector)
    }

    pub async fn text_projection(&self) -> String {
        self.state.lock().await.replica.text_projection(CONTENT_TEXT)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn has_connection(&self, connection_id: Uuid) -> bool {
        self.state.lock().await.connections.contains_key(&connection_id)
    }

    pub fn is_dirty(&self) -> bool {
        let generation = self.generation.load(Ordering::SeqCst);
        match self.persisted_generation.try_lock() {
            Ok(persisted) => generation != *persisted,
            // A save is in flight; the next tick re-checks.
            Err(_) => false,
        }
    }

    /// Saves the current state when it changed since the last successful
    /// save. Failed saves leave the session dirty.
    pub async fn persist(&self, storage: &StorageAdapter) -> Result<PersistOutcome, StorageError> {
        let mut persisted_generation = self.persisted_generation.lock().await;

        let (generation, payload, projection) = {
            let state = self.state.lock().await;
            let generation = self.generation.load(Ordering::SeqCst);
            if generation == *persisted_generation {
                return Ok(PersistOutcome::Clean);
            }
            (generation, state.replica.full_state(), state.replica.text_projection(CONTENT_TEXT))
        };

        match storage.save(&self.doc_id, &payload, Some(projection)).await? {
            SaveOutcome::Persisted { bytes } => {
                *persisted_generation = generation;
                *self.last_persisted.lock().unwrap_or_else(PoisonError::into_inner) = Some(payload);
                debug!(doc_id = %self.doc_id, generation, payload_bytes = bytes, "snapshot persisted");
                Ok(PersistOutcome::Persisted { bytes })
            }
            SaveOutcome::RejectedTooSmall { bytes } => {
                // Nothing worth keeping; wait for the next change.
                *persisted_generation = generation;
                Ok(PersistOutcome::RejectedTooSmall { bytes })
            }
        }
    }

    fn restore_replica(&self) -> ReplicaDoc {
        let persisted = self.last_persisted.lock().unwrap_or_else(PoisonError::into_inner).clone();
        persisted
            .and_then(|payload| match ReplicaDoc::from_snapshot(&payload) {
                Ok(replica) => Some(replica),
                Err(error) => {
                    warn!(doc_id = %self.doc_id, error = %error, "last persisted snapshot is unusable");
                    None
                }
            })
            .unwrap_or_default()
    }
}

fn broadcast(connections: &HashMap<Uuid, ConnectionEntry>, except: Uuid, message: &WsMessage) -> usize {
    let mut delivered = 0;
    for (connection_id, entry) in connections {
        if *connection_id != except && entry.outbound.send(message.clone()).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

fn peers_of(connections: &HashMap<Uuid, ConnectionEntry>, excluding: Uuid) -> Vec<PeerPresence> {
    let mut peers = connections
        .iter()
        .filter(|(connection_id, _)| **connection_id != excluding)
        .map(|(connection_id, entry)| PeerPresence {
            connection_id: *connection_id,
            user_id: entry.user_id,
            fields: entry.presence.clone(),
        })
        .collect::<Vec<_>>();
    peers.sort_by_key(|peer| peer.connection_id);
    peers
}
