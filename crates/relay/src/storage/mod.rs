// Durable document snapshots.
//
// The adapter is the only path sessions use to reach a backend. It owns the
// integrity guards: minimum payload size on write, SHA-256 verification on
// read, and a deadline on every backend call.

pub mod memory;
pub mod postgres;

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tandem_common::types::DocumentId;
use tracing::{info_span, warn, Instrument};

pub use memory::MemorySnapshotBackend;
pub use postgres::PostgresSnapshotBackend;

pub const DEFAULT_MIN_SNAPSHOT_BYTES: usize = 20;
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// One stored row per document identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub doc_id: DocumentId,
    pub payload: Vec<u8>,
    pub checksum: Vec<u8>,
    /// Plaintext view of the `content` text. The REST layer reads this
    /// column; the relay never writes its `documents` table.
    pub text_projection: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub trait SnapshotBackend: Send + Sync {
    fn fetch<'a>(&'a self, doc_id: &'a DocumentId) -> BackendFuture<'a, Option<DocumentSnapshot>>;

    /// Insert or replace the row for `snapshot.doc_id`.
    fn upsert<'a>(&'a self, snapshot: &'a DocumentSnapshot) -> BackendFuture<'a, ()>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("stored snapshot for {doc_id} failed checksum verification")]
    Corrupt { doc_id: DocumentId },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Persisted { bytes: usize },
    RejectedTooSmall { bytes: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct StorageConfig {
    pub min_snapshot_bytes: usize,
    pub timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { min_snapshot_bytes: DEFAULT_MIN_SNAPSHOT_BYTES, timeout: DEFAULT_STORAGE_TIMEOUT }
    }
}

#[derive(Clone)]
pub struct StorageAdapter {
    backend: Arc<dyn SnapshotBackend>,
    config: StorageConfig,
}

impl StorageAdapter {
    pub fn new(backend: Arc<dyn SnapshotBackend>, config: StorageConfig) -> Self {
        Self { backend, config }
    }

    pub async fn load(&self, doc_id: &DocumentId) -> Result<Option<DocumentSnapshot>, StorageError> {
        let fetched = tokio::time::timeout(self.config.timeout, self.backend.fetch(doc_id))
            .instrument(info_span!("relay.storage.load", doc_id = %doc_id))
            .await
            .map_err(|_| StorageError::Timeout(self.config.timeout))??;

        let Some(snapshot) = fetched else {
            return Ok(None);
        };

        if snapshot_checksum(&snapshot.payload) != snapshot.checksum {
            warn!(doc_id = %doc_id, payload_bytes = snapshot.payload.len(), "snapshot checksum mismatch");
            return Err(StorageError::Corrupt { doc_id: doc_id.clone() });
        }

        Ok(Some(snapshot))
    }

    /// Upserts the snapshot for `doc_id`. Payloads under the configured
    /// minimum are refused without touching the stored row.
    pub async fn save(
        &self,
        doc_id: &DocumentId,
        payload: &[u8],
        text_projection: Option<String>,
    ) -> Result<SaveOutcome, StorageError> {
        let bytes = payload.len();
        if bytes < self.config.min_snapshot_bytes {
            warn!(
                doc_id = %doc_id,
                payload_bytes = bytes,
                min_snapshot_bytes = self.config.min_snapshot_bytes,
                "refusing to persist undersized snapshot"
            );
            return Ok(SaveOutcome::RejectedTooSmall { bytes });
        }

        let snapshot = DocumentSnapshot {
            doc_id: doc_id.clone(),
            payload: payload.to_vec(),
            checksum: snapshot_checksum(payload),
            text_projection,
            updated_at: Utc::now(),
        };

        tokio::time::timeout(self.config.timeout, self.backend.upsert(&snapshot))
            .instrument(info_span!("relay.storage.save", doc_id = %doc_id, payload_bytes = bytes))
            .await
            .map_err(|_| StorageError::Timeout(self.config.timeout))??;

        Ok(SaveOutcome::Persisted { bytes })
    }
}

pub fn snapshot_checksum(payload: &[u8]) -> Vec<u8> {
    Sha256::digest(payload).to_vec()
}
