use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssessmentAttempt {
    pub id: Uuid,
    pub assessment_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub answers: JsonValue,
    pub current_index: i32,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub score: Option<rust_decimal::Decimal>,
    pub max_score: Option<rust_decimal::Decimal>,
    pub percentage: Option<rust_decimal::Decimal>,
    pub passed: Option<bool>,
    pub forced: bool,
    pub graded_answers: Option<JsonValue>,
    pub certificate_issued: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
