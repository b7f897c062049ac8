use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: i32,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub question: String,
    #[serde(default = "default_points")]
    pub points: i32,
    #[serde(default)]
    pub options: Vec<String>,
    /// Index for `multiple_choice`, indices for `multi_select`, bool for `true_false`.
    pub correct_answer: JsonValue,
    pub explanation: Option<String>,
}

fn default_points() -> i32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    MultipleChoice,
    MultiSelect,
    TrueFalse,
}

/// Question as shown to a learner taking the assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicQuestion {
    pub id: i32,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub question: String,
    pub points: i32,
    pub options: Vec<String>,
}

impl From<&Question> for PublicQuestion {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id,
            question_type: q.question_type,
            question: q.question.clone(),
            points: q.points,
            options: q.options.clone(),
        }
    }
}

pub fn parse_questions(raw: &JsonValue) -> Vec<Question> {
    serde_json::from_value(raw.clone()).unwrap_or_default()
}
