use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserBlockProgress {
    pub user_id: Uuid,
    pub block_id: Uuid,
    pub completed: bool,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserAssessmentProgress {
    pub user_id: Uuid,
    pub assessment_id: Uuid,
    pub completed: bool,
    pub best_percentage: Option<rust_decimal::Decimal>,
    pub completed_at: DateTime<Utc>,
}
