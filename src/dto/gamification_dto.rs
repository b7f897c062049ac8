use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBadgePayload {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub description: Option<String>,
    #[validate(url)]
    pub icon_url: Option<String>,
    #[validate(length(min = 1))]
    pub criterion: String,
    #[validate(range(min = 1))]
    pub threshold: i32,
}
