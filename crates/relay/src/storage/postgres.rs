use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tandem_common::types::DocumentId;
use tracing::{info_span, Instrument};

use super::{BackendFuture, DocumentSnapshot, SnapshotBackend};

#[derive(Debug, Clone)]
pub struct PostgresSnapshotBackend {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct SnapshotRow {
    payload: Vec<u8>,
    checksum: Vec<u8>,
    text_projection: Option<String>,
    updated_at: DateTime<Utc>,
}

impl PostgresSnapshotBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SnapshotBackend for PostgresSnapshotBackend {
    fn fetch<'a>(&'a self, doc_id: &'a DocumentId) -> BackendFuture<'a, Option<DocumentSnapshot>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, SnapshotRow>(
                "
                SELECT payload, checksum, text_projection, updated_at
                FROM document_snapshots
                WHERE doc_id = $1
                ",
            )
            .bind(doc_id.as_str())
            .fetch_optional(&self.pool)
            .instrument(info_span!("relay.db.query", query = "fetch_document_snapshot"))
            .await
            .with_context(|| format!("failed to fetch snapshot for {doc_id}"))?;

            Ok(row.map(|row| DocumentSnapshot {
                doc_id: doc_id.clone(),
                payload: row.payload,
                checksum: row.checksum,
                text_projection: row.text_projection,
                updated_at: row.updated_at,
            }))
        })
    }

    fn upsert<'a>(&'a self, snapshot: &'a DocumentSnapshot) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                "
                INSERT INTO document_snapshots (doc_id, payload, checksum, text_projection, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (doc_id) DO UPDATE
                SET payload = EXCLUDED.payload,
                    checksum = EXCLUDED.checksum,
                    text_projection = EXCLUDED.text_projection,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(snapshot.doc_id.as_str())
            .bind(snapshot.payload.as_slice())
            .bind(snapshot.checksum.as_slice())
            .bind(snapshot.text_projection.as_deref())
            .bind(snapshot.updated_at)
            .execute(&self.pool)
            .instrument(info_span!("relay.db.query", query = "upsert_document_snapshot"))
            .await
            .with_context(|| format!("failed to upsert snapshot for {}", snapshot.doc_id))?;

            Ok(())
        })
    }
}
