use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::assessment::Assessment;
use crate::models::course::{Course, CourseUnit};
use crate::models::learning_block::LearningBlock;
use crate::utils::validation::{validate_content_type, validate_media_url};

#[derive(Debug, Clone, Deserialize)]
pub struct CourseListQuery {
    pub module_id: Option<Uuid>,
    pub level: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseListResponse {
    pub items: Vec<Course>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDetail {
    #[serde(flatten)]
    pub unit: CourseUnit,
    pub blocks: Vec<LearningBlock>,
    pub assessments: Vec<AssessmentSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseDetail {
    #[serde(flatten)]
    pub course: Course,
    pub units: Vec<UnitDetail>,
    pub final_assessments: Vec<AssessmentSummary>,
    pub enrolled: bool,
}

/// Assessment as listed in the catalog, without questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentSummary {
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
    pub total_questions: usize,
}

impl From<&Assessment> for AssessmentSummary {
    fn from(a: &Assessment) -> Self {
        Self {
            id: a.id,
            course_id: a.course_id,
            unit_id: a.unit_id,
            title: a.title.clone(),
            description: a.description.clone(),
            placement: a.placement.clone(),
            passing_score: a.passing_score,
            time_limit_minutes: a.time_limit_minutes,
            max_retakes: a.max_retakes,
            has_certificate: a.has_certificate,
            total_questions: a.questions.as_array().map(|q| q.len()).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub course_id: Uuid,
    pub enrolled: bool,
    pub enrolled_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateCoursePayload {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub description: Option<String>,
    #[validate(length(min = 1, max = 50))]
    pub level: String,
    pub duration: Option<String>,
    pub module_id: Option<Uuid>,
    pub is_published: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateCoursePayload {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[validate(length(min = 1, max = 50))]
    pub level: Option<String>,
    pub duration: Option<String>,
    pub module_id: Option<Uuid>,
    pub is_published: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateUnitPayload {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateUnitPayload {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AttachUnitPayload {
    pub unit_id: Uuid,
    #[validate(range(min = 0))]
    pub position: i32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBlockPayload {
    pub unit_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(custom(function = "validate_content_type"))]
    pub content_type: String,
    pub content: Option<String>,
    #[validate(custom(function = "validate_media_url"))]
    pub media_url: Option<String>,
    #[validate(range(min = 0))]
    pub position: Option<i32>,
    #[validate(range(min = 0, max = 10000))]
    pub xp_reward: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateBlockPayload {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    #[validate(custom(function = "validate_content_type"))]
    pub content_type: Option<String>,
    pub content: Option<String>,
    #[validate(custom(function = "validate_media_url"))]
    pub media_url: Option<String>,
    #[validate(range(min = 0))]
    pub position: Option<i32>,
    #[validate(range(min = 0, max = 10000))]
    pub xp_reward: Option<i32>,
}
