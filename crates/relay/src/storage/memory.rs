use std::{collections::HashMap, sync::Arc};

use tandem_common::types::DocumentId;
use tokio::sync::RwLock;

use super::{BackendFuture, DocumentSnapshot, SnapshotBackend};

/// Process-local snapshot table for tests and single-node development.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotBackend {
    rows: Arc<RwLock<HashMap<DocumentId, DocumentSnapshot>>>,
}

impl MemorySnapshotBackend {
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn get(&self, doc_id: &DocumentId) -> Option<DocumentSnapshot> {
        self.rows.read().await.get(doc_id).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn tamper_payload_for_tests(&self, doc_id: &DocumentId, payload: Vec<u8>) {
        if let Some(row) = self.rows.write().await.get_mut(doc_id) {
            row.payload = payload;
        }
    }
}

impl SnapshotBackend for MemorySnapshotBackend {
    fn fetch<'a>(&'a self, doc_id: &'a DocumentId) -> BackendFuture<'a, Option<DocumentSnapshot>> {
        Box::pin(async move { Ok(self.rows.read().await.get(doc_id).cloned()) })
    }

    fn upsert<'a>(&'a self, snapshot: &'a DocumentSnapshot) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.rows.write().await.insert(snapshot.doc_id.clone(), snapshot.clone());
            Ok(())
        })
    }
}
