use sqlx::PgPool;
use uuid::Uuid;

use crate::dto::admin_dto::{UpdateUserPayload, UserListQuery};
use crate::dto::auth_dto::{AuthResponse, LoginPayload, RegisterPayload, UserResponse};
use crate::error::{Error, Result};
use crate::models::user::{User, ROLE_LEARNER};
use crate::utils::crypto::{hash_password, verify_password};
use crate::utils::jwt::issue_token;

#[derive(Clone)]
pub struct UserService {
    pool: PgPool,
    jwt_secret: String,
    jwt_ttl_hours: i64,
}

impl UserService {
    pub fn new(pool: PgPool, jwt_secret: String, jwt_ttl_hours: i64) -> Self {
        Self {
            pool,
            jwt_secret,
            jwt_ttl_hours,
        }
    }

    fn auth_response(&self, user: User) -> Result<AuthResponse> {
        let token = issue_token(&self.jwt_secret, user.id, &user.role, self.jwt_ttl_hours)?;
        Ok(AuthResponse {
            token,
            user: UserResponse::from(user),
        })
    }

    pub async fn register(&self, payload: RegisterPayload) -> Result<AuthResponse> {
        let email = payload.email.trim().to_lowercase();
        let password_hash = hash_password(&payload.password)
            .map_err(|e| Error::Internal(format!("Password hashing failed: {}", e)))?;

        let user = sqlx::query_as::<_, User>(
            r#"INSERT INTO users (name, email, password_hash, role)
               VALUES ($1, $2, $3, $4)
               RETURNING *"#,
        )
        .bind(payload.name.trim())
        .bind(&email)
        .bind(password_hash)
        .bind(ROLE_LEARNER)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match Error::from(e) {
            Error::Conflict(_) => Error::Conflict("Email is already registered".to_string()),
            other => other,
        })?;

        tracing::info!(user_id = %user.id, "user registered");
        self.auth_response(user)
    }

    pub async fn login(&self, payload: LoginPayload) -> Result<AuthResponse> {
        let email = payload.email.trim().to_lowercase();
        let user = sqlx::query_as::<_, User>(r#"SELECT * FROM users WHERE email = $1"#)
            .bind(&email)
            .fetch_optional(&self.pool)
            .await?;

        let Some(user) = user else {
            return Err(Error::Unauthorized("Invalid email or password".to_string()));
        };
        if !verify_password(&payload.password, &user.password_hash).unwrap_or(false) {
            return Err(Error::Unauthorized("Invalid email or password".to_string()));
        }
        if !user.is_active {
            return Err(Error::Forbidden("Account is disabled".to_string()));
        }
        self.auth_response(user)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<User> {
        let user = sqlx::query_as::<_, User>(r#"SELECT * FROM users WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
        Ok(user)
    }

    pub async fn list(&self, query: UserListQuery) -> Result<(Vec<UserResponse>, i64)> {
        let page = query.page.unwrap_or(1).max(1);
        let per_page = query.per_page.unwrap_or(50).clamp(1, 200);
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));

        let users = sqlx::query_as::<_, User>(
            r#"SELECT * FROM users
               WHERE ($1::TEXT IS NULL OR role = $1)
                 AND ($2::TEXT IS NULL OR name ILIKE $2 OR email ILIKE $2)
               ORDER BY created_at DESC
               LIMIT $3 OFFSET $4"#,
        )
        .bind(&query.role)
        .bind(&search)
        .bind(per_page)
        .bind((page - 1) * per_page)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM users
               WHERE ($1::TEXT IS NULL OR role = $1)
                 AND ($2::TEXT IS NULL OR name ILIKE $2 OR email ILIKE $2)"#,
        )
        .bind(&query.role)
        .bind(&search)
        .fetch_one(&self.pool)
        .await?;

        Ok((users.into_iter().map(UserResponse::from).collect(), total))
    }

    pub async fn update(&self, id: Uuid, payload: UpdateUserPayload) -> Result<User> {
        self.get_by_id(id).await?;
        let user = sqlx::query_as::<_, User>(
            r#"UPDATE users SET
                   role = COALESCE($2, role),
                   is_active = COALESCE($3, is_active),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(payload.role)
        .bind(payload.is_active)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }
}
