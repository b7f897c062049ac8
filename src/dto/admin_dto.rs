use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::utils::validation::validate_role;

#[derive(Debug, Clone, Deserialize)]
pub struct UserListQuery {
    pub role: Option<String>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateUserPayload {
    #[validate(custom(function = "validate_role"))]
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub users: i64,
    pub active_users: i64,
    pub courses: i64,
    pub published_courses: i64,
    pub enrollments: i64,
    pub completed_enrollments: i64,
    pub attempts: i64,
    pub passed_attempts: i64,
    pub pass_rate: f64,
    pub certificates: i64,
}
