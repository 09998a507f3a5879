// Access checks at the two fixed points of a connection's life: the join
// handshake and every state-mutating update.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::http::{header::AUTHORIZATION, HeaderMap};
use tandem_common::types::{DocumentId, Role};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::jwt::JwtAccessTokenService;
use crate::error::ErrorCode;
use crate::permissions::PermissionResolver;

pub const DEFAULT_ROLE_REVALIDATE_AFTER: Duration = Duration::from_secs(30);

/// An authenticated caller bound to one document.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub doc_id: DocumentId,
    pub project_id: Uuid,
    pub role: Role,
    role_checked_at: Instant,
}

impl Principal {
    pub fn new(user_id: Uuid, doc_id: DocumentId, project_id: Uuid, role: Role) -> Self {
        Self { user_id, doc_id, project_id, role, role_checked_at: Instant::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationDecision {
    Allow,
    Deny,
    Revoked,
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("invalid or expired access token")]
    InvalidToken,
    #[error("caller has no access to document {0}")]
    Forbidden(DocumentId),
    #[error("permission lookup failed")]
    Lookup(#[source] anyhow::Error),
}

impl GateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidToken => ErrorCode::AuthInvalidToken,
            Self::Forbidden(_) => ErrorCode::AuthForbidden,
            Self::Lookup(_) => ErrorCode::InternalError,
        }
    }
}

#[derive(Clone)]
pub struct AccessGate {
    tokens: Arc<JwtAccessTokenService>,
    permissions: PermissionResolver,
    revalidate_after: Duration,
}

impl AccessGate {
    pub fn new(
        tokens: Arc<JwtAccessTokenService>,
        permissions: PermissionResolver,
        revalidate_after: Duration,
    ) -> Self {
        Self { tokens, permissions, revalidate_after }
    }

    pub fn permissions(&self) -> &PermissionResolver {
        &self.permissions
    }

    /// Verifies the token and resolves the caller's role on the document's
    /// project. Any failure refuses the connection.
    pub async fn authenticate_connect(
        &self,
        token: &str,
        doc_id: &DocumentId,
    ) -> Result<Principal, GateError> {
        let user_id = self.tokens.validate_access_token(token).map_err(|error| {
            debug!(doc_id = %doc_id, error = %error, "rejecting connect with invalid token");
            GateError::InvalidToken
        })?;

        let project_id = self
            .permissions
            .project_for_document(doc_id)
            .await
            .map_err(GateError::Lookup)?
            .ok_or_else(|| GateError::Forbidden(doc_id.clone()))?;

        let role = self
            .permissions
            .resolve_role(user_id, project_id)
            .await
            .map_err(GateError::Lookup)?
            .ok_or_else(|| GateError::Forbidden(doc_id.clone()))?;

        Ok(Principal::new(user_id, doc_id.clone(), project_id, role))
    }

    pub fn authorize_read(&self, principal: &Principal) -> bool {
        principal.role.allows(Role::Viewer)
    }

    /// Allows the mutation iff the caller can write. The cached role is
    /// refreshed first once it is older than the revalidation window.
    pub async fn authorize_mutation(
        &self,
        principal: &mut Principal,
    ) -> Result<MutationDecision, GateError> {
        if principal.role_checked_at.elapsed() >= self.revalidate_after {
            let current = self
                .permissions
                .resolve_role(principal.user_id, principal.project_id)
                .await
                .map_err(GateError::Lookup)?;
            principal.role_checked_at = Instant::now();

            match current {
                Some(role) if role != principal.role => {
                    info!(
                        user_id = %principal.user_id,
                        doc_id = %principal.doc_id,
                        from = %principal.role,
                        to = %role,
                        "role changed since join"
                    );
                    principal.role = role;
                }
                Some(_) => {}
                None => {
                    warn!(
                        user_id = %principal.user_id,
                        doc_id = %principal.doc_id,
                        "access revoked since join"
                    );
                    return Ok(MutationDecision::Revoked);
                }
            }
        }

        if principal.role.can_write() {
            Ok(MutationDecision::Allow)
        } else {
            Ok(MutationDecision::Deny)
        }
    }
}

/// Bearer token from the upgrade request, used when the join frame carries
/// an empty token.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token.to_owned())
}
