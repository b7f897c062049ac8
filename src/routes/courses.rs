use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Json},
    Extension,
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    dto::course_dto::{CourseDetail, CourseListQuery, CourseListResponse, EnrollResponse},
    error::Result,
    middleware::auth::AuthUser,
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/courses",
    params(
        ("module_id" = Option<Uuid>, Query, description = "Filter by module"),
        ("level" = Option<String>, Query, description = "Filter by level"),
        ("page" = Option<i64>, Query, description = "Page number"),
        ("per_page" = Option<i64>, Query, description = "Items per page")
    ),
    responses(
        (status = 200, description = "Published courses", body = Json<CourseListResponse>)
    )
)]
#[axum::debug_handler]
pub async fn list_courses(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<CourseListQuery>,
) -> Result<Json<CourseListResponse>> {
    let result = state.course_service.list(query, user.is_admin()).await?;
    Ok(Json(result))
}

#[utoipa::path(
    get,
    path = "/api/courses/{id}",
    params(
        ("id" = Uuid, Path, description = "Course ID")
    ),
    responses(
        (status = 200, description = "Course with units, blocks and assessments", body = Json<CourseDetail>),
        (status = 404, description = "Course not found")
    )
)]
#[axum::debug_handler]
pub async fn get_course(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<CourseDetail>> {
    let detail = state
        .course_service
        .detail(id, user.id, user.is_admin())
        .await?;
    Ok(Json(detail))
}

#[utoipa::path(
    post,
    path = "/api/courses/{id}/enroll",
    params(
        ("id" = Uuid, Path, description = "Course ID")
    ),
    responses(
        (status = 200, description = "Enrolled (idempotent)", body = Json<EnrollResponse>),
        (status = 404, description = "Course not found")
    )
)]
#[axum::debug_handler]
pub async fn enroll(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<EnrollResponse>> {
    let result = state.course_service.enroll(user.id, id).await?;
    Ok(Json(result))
}

#[utoipa::path(
    get,
    path = "/api/units/{id}",
    params(
        ("id" = Uuid, Path, description = "Unit ID")
    ),
    responses(
        (status = 200, description = "Unit with its blocks and assessments"),
        (status = 404, description = "Unit not found")
    )
)]
#[axum::debug_handler]
pub async fn get_unit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let (unit, blocks, assessments) = state.course_service.unit_detail(id).await?;
    Ok(Json(json!({
        "unit": unit,
        "blocks": blocks,
        "assessments": assessments,
    })))
}
