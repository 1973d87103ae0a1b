use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::error::ApiError;
use crate::models::{AppState, Caller, Role};
use crate::store::StoreError;

/// Authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub caller: Caller,
}

/// Maps a hashed bearer token to the caller it was issued to.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token_hash: &str) -> Result<Option<Caller>, StoreError>;
}

#[derive(Debug, sqlx::FromRow)]
struct SessionLookupRow {
    session_token_id: Uuid,
    user_id: Uuid,
    roles: i16,
}

pub struct PgSessionResolver {
    db: PgPool,
}

impl PgSessionResolver {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionResolver for PgSessionResolver {
    async fn resolve(&self, token_hash: &str) -> Result<Option<Caller>, StoreError> {
        // Validate session_token + ensure app_user is active
        let row: Option<SessionLookupRow> = sqlx::query_as::<_, SessionLookupRow>(
            r#"
            SELECT st.session_token_id, st.user_id, u.roles
            FROM session_token st
            JOIN app_user u ON u.user_id = st.user_id
            WHERE st.session_token_hash = $1
              AND st.revoked_at IS NULL
              AND st.expires_at > now()
              AND u.is_active = true
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        // Touch last_seen_at (best-effort)
        if let Err(e) = sqlx::query(
            r#"
            UPDATE session_token
            SET last_seen_at = now()
            WHERE session_token_id = $1
            "#,
        )
        .bind(row.session_token_id)
        .execute(&self.db)
        .await
        {
            tracing::debug!(session_token_id = %row.session_token_id, "last_seen_at touch failed: {e}");
        }

        Ok(Some(Caller {
            user_id: row.user_id,
            role: Role::from_code(row.roles),
        }))
    }
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            // Extract Authorization: Bearer <token>
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;

            let token_hash = hash_access_token(authz.token());

            let caller = state
                .sessions
                .resolve(&token_hash)
                .await
                .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
                .ok_or_else(ApiError::session_expired)?;

            Ok(AuthContext { caller })
        }
    }
}
