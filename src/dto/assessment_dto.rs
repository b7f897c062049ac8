use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;
use validator::Validate;

use crate::dto::course_dto::AssessmentSummary;
use crate::models::question::{PublicQuestion, Question};
use crate::services::assessment_flow::FlowState;
use crate::utils::validation::validate_placement;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentOverview {
    #[serde(flatten)]
    pub assessment: AssessmentSummary,
    pub state: FlowState,
    pub attempts_used: i64,
    /// `None` when retakes are unlimited.
    pub attempts_remaining: Option<i64>,
    pub can_start: bool,
    pub open_attempt_id: Option<Uuid>,
    pub best_percentage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAttemptResponse {
    pub attempt_id: Uuid,
    pub state: FlowState,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub time_remaining_seconds: i64,
    pub current_index: usize,
    pub questions: Vec<PublicQuestion>,
    pub answers: JsonValue,
    pub resumed: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SaveAnswerRequest {
    pub question_id: i32,
    pub answer: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveAnswerResponse {
    pub saved: bool,
    pub question_id: i32,
    pub answered: usize,
    pub total_questions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigateResponse {
    pub current_index: usize,
    pub question_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStatusResponse {
    pub attempt_id: Uuid,
    pub state: FlowState,
    pub time_remaining_seconds: i64,
    pub answered: usize,
    pub total_questions: usize,
    pub current_index: usize,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAssessmentResponse {
    pub attempt_id: Uuid,
    pub state: FlowState,
    pub passed: bool,
    pub score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub certificate_issued: bool,
    pub certificate_id: Option<Uuid>,
    pub forced: bool,
    pub attempts_remaining: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAssessmentPayload {
    pub course_id: Uuid,
    pub unit_id: Option<Uuid>,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub description: Option<String>,
    #[validate(custom(function = "validate_placement"))]
    pub placement: String,
    #[validate(range(min = 0, max = 100))]
    pub passing_score: i32,
    #[validate(range(min = 1, max = 600, message = "Time limit must be between 1 and 600 minutes"))]
    pub time_limit_minutes: i32,
    #[validate(range(min = 0))]
    pub max_retakes: Option<i32>,
    pub has_certificate: Option<bool>,
    pub certificate_template_id: Option<Uuid>,
    pub questions: Vec<Question>,
    #[validate(range(min = 0, max = 10000))]
    pub xp_reward: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateAssessmentPayload {
    pub unit_id: Option<Uuid>,
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    pub description: Option<String>,
    #[validate(custom(function = "validate_placement"))]
    pub placement: Option<String>,
    #[validate(range(min = 0, max = 100))]
    pub passing_score: Option<i32>,
    #[validate(range(min = 1, max = 600))]
    pub time_limit_minutes: Option<i32>,
    #[validate(range(min = 0))]
    pub max_retakes: Option<i32>,
    pub has_certificate: Option<bool>,
    pub certificate_template_id: Option<Uuid>,
    pub questions: Option<Vec<Question>>,
    #[validate(range(min = 0, max = 10000))]
    pub xp_reward: Option<i32>,
}
