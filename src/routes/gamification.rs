use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json},
    Extension,
};
use serde_json::json;

use crate::{
    dto::gamification_dto::LeaderboardQuery,
    error::Result,
    middleware::auth::AuthUser,
    AppState,
};

const DEFAULT_LEADERBOARD_SIZE: i64 = 10;
const MAX_LEADERBOARD_SIZE: i64 = 100;
const XP_HISTORY_LIMIT: i64 = 50;

#[utoipa::path(
    get,
    path = "/api/badges",
    responses(
        (status = 200, description = "Every badge with the caller's earned state")
    )
)]
#[axum::debug_handler]
pub async fn my_badges(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse> {
    let badges = state.gamification_service.badges_for_user(user.id).await?;
    Ok(Json(badges))
}

#[utoipa::path(
    get,
    path = "/api/leaderboard",
    params(
        ("limit" = Option<i64>, Query, description = "Number of entries, 1..=100")
    ),
    responses(
        (status = 200, description = "Learners ranked by total XP")
    )
)]
#[axum::debug_handler]
pub async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<impl IntoResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LEADERBOARD_SIZE)
        .clamp(1, MAX_LEADERBOARD_SIZE);
    let entries = state.gamification_service.leaderboard(limit).await?;
    Ok(Json(entries))
}

#[utoipa::path(
    get,
    path = "/api/xp/history",
    responses(
        (status = 200, description = "Total XP and the most recent XP events")
    )
)]
#[axum::debug_handler]
pub async fn xp_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse> {
    let total = state.gamification_service.total_xp(user.id).await?;
    let events = state
        .gamification_service
        .xp_history(user.id, XP_HISTORY_LIMIT)
        .await?;
    Ok(Json(json!({
        "total_xp": total,
        "events": events,
    })))
}
