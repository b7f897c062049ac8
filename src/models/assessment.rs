use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

pub const PLACEMENT_END: &str = "end";
pub const PLACEMENT_EMBEDDED: &str = "embedded";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Assessment {
    pub id: Uuid,
    pub course_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub placement: String,
    pub passing_score: i32,
    pub time_limit_minutes: i32,
    pub max_retakes: Option<i32>,
    pub has_certificate: bool,
    pub certificate_template_id: Option<Uuid>,
    pub questions: JsonValue,
    pub xp_reward: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assessment {
    /// Course-final: placed at the end and not tied to any unit.
    pub fn is_course_final(&self) -> bool {
        self.placement == PLACEMENT_END && self.unit_id.is_none()
    }
}
