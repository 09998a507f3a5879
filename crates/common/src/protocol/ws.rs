// WebSocket message types for the tandem-sync.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DocumentId, Role};

/// The protocol version spoken by this build.
pub const CURRENT_PROTOCOL_VERSION: &str = "tandem-sync.v1";

/// Versions the relay accepts, newest first. Index 1 is the N-1 slot.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION, "tandem-sync.v0"];

/// All message types in the tandem-sync.v1 WebSocket protocol.
///
/// Binary CRDT payloads travel base64-encoded inside JSON text frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: first frame on every connection.
    Join {
        doc_id: DocumentId,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<String>,
        /// Encoded state vector of the client's local replica. When present
        /// the server answers with a diff instead of the full state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_vector_b64: Option<String>,
    },

    /// Server -> Client: join accepted, initial state.
    SyncFull {
        doc_id: DocumentId,
        connection_id: Uuid,
        role: Role,
        state_b64: String,
        #[serde(default)]
        peers: Vec<PeerPresence>,
    },

    /// Server -> Client: join refused; the server closes the socket after it.
    Reject { code: String, reason: String },

    /// Bidirectional: a CRDT delta. `origin` is set on server fan-out.
    Update {
        update_b64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Uuid>,
    },

    /// Bidirectional: ephemeral presence fields (name, color, cursor, ...).
    /// `connection_id` is set on server fan-out.
    PresenceUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<Uuid>,
        fields: serde_json::Value,
    },

    /// Server -> Client: a peer left the room; drop its presence.
    PresenceLeft { connection_id: Uuid },

    /// Server -> Client: error scoped to one request; the connection stays open.
    Error { code: String, message: String, retryable: bool },

    /// Client -> Server: leave the room and close.
    Leave,
}

/// Presence of one room member as sent in `sync_full`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerPresence {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub fields: serde_json::Map<String, serde_json::Value>,
}
