use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeCriterion {
    BlocksCompleted,
    AssessmentsPassed,
    CoursesCompleted,
    XpTotal,
}

impl BadgeCriterion {
    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeCriterion::BlocksCompleted => "blocks_completed",
            BadgeCriterion::AssessmentsPassed => "assessments_passed",
            BadgeCriterion::CoursesCompleted => "courses_completed",
            BadgeCriterion::XpTotal => "xp_total",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "blocks_completed" => Some(BadgeCriterion::BlocksCompleted),
            "assessments_passed" => Some(BadgeCriterion::AssessmentsPassed),
            "courses_completed" => Some(BadgeCriterion::CoursesCompleted),
            "xp_total" => Some(BadgeCriterion::XpTotal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Badge {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    pub criterion: String,
    pub threshold: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct XpEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source_type: String,
    pub source_id: Uuid,
    pub amount: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LeaderboardRow {
    pub user_id: Uuid,
    pub name: String,
    pub xp: i64,
}
