use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Error;
use crate::models::user::ROLE_ADMIN;
use crate::utils::jwt::{decode_token, Claims};
use crate::AppState;

/// Caller identity, inserted as a request extension by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case(ROLE_ADMIN)
    }
}

fn reject(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

fn authenticate(req: &Request) -> Result<AuthUser, Response> {
    let Some(auth_header) = req.headers().get(axum::http::header::AUTHORIZATION) else {
        return Err(reject(StatusCode::UNAUTHORIZED, "missing_authorization"));
    };
    let Ok(auth_str) = auth_header.to_str() else {
        return Err(reject(StatusCode::UNAUTHORIZED, "bad_authorization"));
    };
    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        return Err(reject(StatusCode::UNAUTHORIZED, "unsupported_scheme"));
    };

    let config = crate::config::get_config();
    let claims: Claims = decode_token(&config.jwt_secret, token)
        .map_err(|_| reject(StatusCode::UNAUTHORIZED, "invalid_token"))?;
    let id = Uuid::parse_str(&claims.sub)
        .map_err(|_| reject(StatusCode::UNAUTHORIZED, "invalid_token"))?;
    Ok(AuthUser {
        id,
        role: claims.role.unwrap_or_default(),
    })
}

/// Re-reads the account behind a valid token so deactivation and role
/// changes apply to tokens that were issued before them.
async fn load_account(pool: &PgPool, claimed: AuthUser) -> Result<AuthUser, Response> {
    let account: Option<(String, bool)> =
        sqlx::query_as(r#"SELECT role, is_active FROM users WHERE id = $1"#)
            .bind(claimed.id)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::from(e).into_response())?;
    match account {
        None => Err(reject(StatusCode::UNAUTHORIZED, "invalid_token")),
        Some((_, false)) => Err(reject(StatusCode::FORBIDDEN, "account_disabled")),
        Some((role, true)) => Ok(AuthUser { id: claimed.id, role }),
    }
}

pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let claimed = match authenticate(&req) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match load_account(&state.pool, claimed).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(resp) => resp,
    }
}

pub async fn require_admin(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let claimed = match authenticate(&req) {
        Ok(user) if user.is_admin() => user,
        Ok(_) => return reject(StatusCode::FORBIDDEN, "forbidden"),
        Err(resp) => return resp,
    };
    match load_account(&state.pool, claimed).await {
        Ok(user) if user.is_admin() => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Ok(_) => reject(StatusCode::FORBIDDEN, "forbidden"),
        Err(resp) => resp,
    }
}
