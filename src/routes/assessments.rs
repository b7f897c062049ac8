use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Extension,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::assessment_dto::{
        AssessmentOverview, AttemptStatusResponse, NavigateResponse, SaveAnswerRequest,
        SaveAnswerResponse, StartAttemptResponse, SubmitAssessmentResponse,
    },
    error::Result,
    middleware::auth::AuthUser,
    services::assessment_flow::Navigation,
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/assessments/{id}",
    params(
        ("id" = Uuid, Path, description = "Assessment ID")
    ),
    responses(
        (status = 200, description = "Assessment overview with attempt state", body = Json<AssessmentOverview>),
        (status = 404, description = "Assessment not found")
    )
)]
#[axum::debug_handler]
pub async fn get_assessment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<AssessmentOverview>> {
    let overview = state.attempt_service.overview(user.id, id).await?;
    Ok(Json(overview))
}

#[utoipa::path(
    post,
    path = "/api/assessments/{id}/start",
    params(
        ("id" = Uuid, Path, description = "Assessment ID")
    ),
    responses(
        (status = 201, description = "Attempt started", body = Json<StartAttemptResponse>),
        (status = 200, description = "Open attempt resumed", body = Json<StartAttemptResponse>),
        (status = 403, description = "Not enrolled or no attempts remaining")
    )
)]
#[axum::debug_handler]
pub async fn start_attempt(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<StartAttemptResponse>)> {
    let started = state.attempt_service.start(user.id, id).await?;
    let status = if started.resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(started)))
}

#[utoipa::path(
    post,
    path = "/api/assessments/{id}/submit",
    params(
        ("id" = Uuid, Path, description = "Assessment ID")
    ),
    responses(
        (status = 200, description = "Graded result", body = Json<SubmitAssessmentResponse>),
        (status = 400, description = "Not every question answered"),
        (status = 409, description = "No attempt in progress")
    )
)]
#[axum::debug_handler]
pub async fn submit_assessment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmitAssessmentResponse>> {
    let result = state
        .attempt_service
        .submit_for_assessment(user.id, id)
        .await?;
    Ok(Json(result))
}

#[utoipa::path(
    patch,
    path = "/api/attempts/{id}/answer",
    params(
        ("id" = Uuid, Path, description = "Attempt ID")
    ),
    request_body = SaveAnswerRequest,
    responses(
        (status = 200, description = "Answer saved", body = Json<SaveAnswerResponse>),
        (status = 409, description = "Attempt is no longer in progress")
    )
)]
#[axum::debug_handler]
pub async fn save_answer(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SaveAnswerRequest>,
) -> Result<Json<SaveAnswerResponse>> {
    payload.validate()?;
    let saved = state.attempt_service.save_answer(user.id, id, payload).await?;
    Ok(Json(saved))
}

#[utoipa::path(
    post,
    path = "/api/attempts/{id}/navigate",
    params(
        ("id" = Uuid, Path, description = "Attempt ID")
    ),
    request_body = Navigation,
    responses(
        (status = 200, description = "Current question moved", body = Json<NavigateResponse>),
        (status = 400, description = "Index out of range")
    )
)]
#[axum::debug_handler]
pub async fn navigate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(nav): Json<Navigation>,
) -> Result<Json<NavigateResponse>> {
    let moved = state.attempt_service.navigate(user.id, id, nav).await?;
    Ok(Json(moved))
}

#[utoipa::path(
    get,
    path = "/api/attempts/{id}/status",
    params(
        ("id" = Uuid, Path, description = "Attempt ID")
    ),
    responses(
        (status = 200, description = "Attempt state and time remaining", body = Json<AttemptStatusResponse>),
        (status = 404, description = "Attempt not found")
    )
)]
#[axum::debug_handler]
pub async fn attempt_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<AttemptStatusResponse>> {
    let status = state.attempt_service.status(user.id, id).await?;
    Ok(Json(status))
}

#[utoipa::path(
    post,
    path = "/api/attempts/{id}/submit",
    params(
        ("id" = Uuid, Path, description = "Attempt ID")
    ),
    responses(
        (status = 200, description = "Graded result", body = Json<SubmitAssessmentResponse>),
        (status = 400, description = "Not every question answered")
    )
)]
#[axum::debug_handler]
pub async fn submit_attempt(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmitAssessmentResponse>> {
    let result = state.attempt_service.submit(user.id, id).await?;
    Ok(Json(result))
}

#[utoipa::path(
    get,
    path = "/api/attempts/{id}/result",
    params(
        ("id" = Uuid, Path, description = "Attempt ID")
    ),
    responses(
        (status = 200, description = "Result of a finished attempt", body = Json<SubmitAssessmentResponse>),
        (status = 409, description = "Attempt not finished yet")
    )
)]
#[axum::debug_handler]
pub async fn attempt_result(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmitAssessmentResponse>> {
    let result = state.attempt_service.get_result(user.id, id).await?;
    Ok(Json(result))
}
