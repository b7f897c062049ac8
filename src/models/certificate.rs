use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Certificate {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub assessment_id: Uuid,
    pub template_id: Option<Uuid>,
    pub verification_code: String,
    pub fields: JsonValue,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CertificateTemplate {
    pub id: Uuid,
    pub name: String,
    pub file_path: String,
    pub field_names: JsonValue,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}
