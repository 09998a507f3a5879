// Role lookups against the project membership tables owned by the REST layer.
//
// The relay never writes these tables; it only resolves which project owns a
// document and which role a user holds on that project.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context};
use sqlx::PgPool;
use tandem_common::types::{DocumentId, Role};
use tokio::sync::RwLock;
use tracing::{info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryGrants {
    documents: HashMap<DocumentId, Uuid>,
    roles: HashMap<(Uuid, Uuid), Role>,
}

#[derive(Clone)]
pub enum PermissionResolver {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryGrants>>),
}

impl PermissionResolver {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryGrants::default())))
    }

    /// Project that owns `doc_id`, or `None` when the document is unknown or
    /// soft-deleted.
    pub async fn project_for_document(&self, doc_id: &DocumentId) -> anyhow::Result<Option<Uuid>> {
        match self {
            Self::Postgres(pool) => {
                let Some(entity_id) = doc_id.entity_id() else {
                    return Ok(None);
                };

                sqlx::query_scalar::<_, Uuid>(
                    r#"
                    SELECT project_id
                    FROM documents
                    WHERE id = $1
                      AND deleted_at IS NULL
                    "#,
                )
                .bind(entity_id)
                .fetch_optional(pool)
                .instrument(info_span!("relay.db.query", query = "project_for_document"))
                .await
                .with_context(|| format!("failed to resolve project for document {doc_id}"))
            }
            Self::Memory(grants) => Ok(grants.read().await.documents.get(doc_id).copied()),
        }
    }

    /// Role of `user_id` on `project_id`. The project owner always resolves
    /// to [`Role::Owner`]; everyone else needs a membership row.
    pub async fn resolve_role(&self, user_id: Uuid, project_id: Uuid) -> anyhow::Result<Option<Role>> {
        match self {
            Self::Postgres(pool) => {
                let role = sqlx::query_scalar::<_, Option<String>>(
                    r#"
                    SELECT CASE WHEN p.owner_id = $2 THEN 'owner' ELSE pm.role END
                    FROM projects AS p
                    LEFT JOIN project_members AS pm
                        ON pm.project_id = p.id
                       AND pm.user_id = $2
                    WHERE p.id = $1
                      AND p.deleted_at IS NULL
                    "#,
                )
                .bind(project_id)
                .bind(user_id)
                .fetch_optional(pool)
                .instrument(info_span!("relay.db.query", query = "resolve_project_role"))
                .await
                .context("failed to query project role")?
                .flatten()
                .map(|role| {
                    Role::from_db_value(&role)
                        .ok_or_else(|| anyhow!("invalid project role '{role}' in database"))
                })
                .transpose()?;

                Ok(role)
            }
            Self::Memory(grants) => {
                Ok(grants.read().await.roles.get(&(project_id, user_id)).copied())
            }
        }
    }

    pub async fn assign_document(&self, doc_id: DocumentId, project_id: Uuid) {
        if let Self::Memory(grants) = self {
            grants.write().await.documents.insert(doc_id, project_id);
        }
    }

    pub async fn grant(&self, project_id: Uuid, user_id: Uuid, role: Role) {
        if let Self::Memory(grants) = self {
            grants.write().await.roles.insert((project_id, user_id), role);
        }
    }

    pub async fn revoke(&self, project_id: Uuid, user_id: Uuid) {
        if let Self::Memory(grants) = self {
            grants.write().await.roles.remove(&(project_id, user_id));
        }
    }
}
