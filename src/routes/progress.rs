use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
    Extension,
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::Result,
    middleware::auth::AuthUser,
    services::achievement_service::AchievementOutcome,
    services::progress_service::{CourseProgressView, UserProgressSummary},
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/progress",
    responses(
        (status = 200, description = "Progress across enrolled courses", body = Json<UserProgressSummary>)
    )
)]
#[axum::debug_handler]
pub async fn my_progress(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<UserProgressSummary>> {
    let summary = state.progress_service.user_progress(user.id).await?;
    Ok(Json(summary))
}

#[utoipa::path(
    get,
    path = "/api/courses/{id}/progress",
    params(
        ("id" = Uuid, Path, description = "Course ID")
    ),
    responses(
        (status = 200, description = "Progress for one course", body = Json<CourseProgressView>),
        (status = 404, description = "Course not found")
    )
)]
#[axum::debug_handler]
pub async fn course_progress(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<CourseProgressView>> {
    state.course_service.get_course(id).await?;
    let view = state.progress_service.course_progress(user.id, id).await?;
    Ok(Json(view))
}

#[utoipa::path(
    post,
    path = "/api/blocks/{id}/complete",
    params(
        ("id" = Uuid, Path, description = "Learning block ID")
    ),
    responses(
        (status = 200, description = "Block marked complete (idempotent)", body = Json<AchievementOutcome>),
        (status = 404, description = "Block not found")
    )
)]
#[axum::debug_handler]
pub async fn complete_block(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let block = state.course_service.get_block(id).await?;
    let newly_completed = state.progress_service.mark_block_complete(user.id, block.id).await?;

    let outcome = if newly_completed {
        state
            .achievement_service
            .on_block_completed(user.id, &block)
            .await?
    } else {
        AchievementOutcome::default()
    };

    Ok(Json(json!({
        "block_id": block.id,
        "newly_completed": newly_completed,
        "xp_awarded": outcome.xp_awarded,
        "courses_completed": outcome.courses_completed,
        "badges_earned": outcome.badges_earned,
    })))
}
