use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    Extension,
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::admin_dto::{DashboardStats, UpdateUserPayload, UserListQuery},
    dto::assessment_dto::{CreateAssessmentPayload, UpdateAssessmentPayload},
    dto::course_dto::{
        AttachUnitPayload, CreateBlockPayload, CreateCoursePayload, CreateUnitPayload,
        UpdateBlockPayload, UpdateCoursePayload, UpdateUnitPayload,
    },
    dto::gamification_dto::CreateBadgePayload,
    dto::auth_dto::UserResponse,
    error::{Error, Result},
    middleware::auth::AuthUser,
    services::export_service::ExportService,
    services::upload_service::TEMPLATE_EXTENSIONS,
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub course_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

/// Accepts either a JSON array (`["learner_name","date"]`) or a
/// comma-separated list.
pub fn parse_field_names(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim();
    let names: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str::<Vec<String>>(raw)?
    } else {
        raw.split(',').map(str::to_string).collect()
    };
    Ok(names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect())
}

// ---- courses ----

#[utoipa::path(
    post,
    path = "/api/admin/courses",
    request_body = CreateCoursePayload,
    responses(
        (status = 201, description = "Course created"),
        (status = 400, description = "Invalid payload")
    )
)]
#[axum::debug_handler]
pub async fn create_course(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(payload): Json<CreateCoursePayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let course = state.course_service.create_course(payload).await?;
    state
        .audit_service
        .record(admin.id, "create", "course", course.id, serde_json::to_value(&course).ok())
        .await;
    Ok((StatusCode::CREATED, Json(course)))
}

#[utoipa::path(
    put,
    path = "/api/admin/courses/{id}",
    params(("id" = Uuid, Path, description = "Course ID")),
    request_body = UpdateCoursePayload,
    responses(
        (status = 200, description = "Course updated"),
        (status = 404, description = "Course not found")
    )
)]
#[axum::debug_handler]
pub async fn update_course(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateCoursePayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let course = state.course_service.update_course(id, payload).await?;
    state
        .audit_service
        .record(admin.id, "update", "course", id, serde_json::to_value(&course).ok())
        .await;
    Ok(Json(course))
}

#[utoipa::path(
    delete,
    path = "/api/admin/courses/{id}",
    params(("id" = Uuid, Path, description = "Course ID")),
    responses(
        (status = 204, description = "Course deleted"),
        (status = 404, description = "Course not found")
    )
)]
#[axum::debug_handler]
pub async fn delete_course(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.course_service.delete_course(id).await?;
    state.audit_service.record(admin.id, "delete", "course", id, None).await;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/admin/courses/{id}/units",
    params(("id" = Uuid, Path, description = "Course ID")),
    request_body = AttachUnitPayload,
    responses(
        (status = 200, description = "Unit attached; returns the course's ordered units")
    )
)]
#[axum::debug_handler]
pub async fn attach_unit(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AttachUnitPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let units = state
        .course_service
        .attach_unit(id, payload.unit_id, payload.position)
        .await?;
    state
        .audit_service
        .record(
            admin.id,
            "attach_unit",
            "course",
            id,
            Some(json!({ "unit_id": payload.unit_id, "position": payload.position })),
        )
        .await;
    Ok(Json(units))
}

#[utoipa::path(
    delete,
    path = "/api/admin/courses/{id}/units/{unit_id}",
    params(
        ("id" = Uuid, Path, description = "Course ID"),
        ("unit_id" = Uuid, Path, description = "Unit ID")
    ),
    responses(
        (status = 204, description = "Unit detached"),
        (status = 404, description = "Unit is not part of the course")
    )
)]
#[axum::debug_handler]
pub async fn detach_unit(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path((id, unit_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse> {
    state.course_service.detach_unit(id, unit_id).await?;
    state
        .audit_service
        .record(admin.id, "detach_unit", "course", id, Some(json!({ "unit_id": unit_id })))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ---- units ----

#[utoipa::path(
    post,
    path = "/api/admin/units",
    request_body = CreateUnitPayload,
    responses((status = 201, description = "Unit created"))
)]
#[axum::debug_handler]
pub async fn create_unit(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(payload): Json<CreateUnitPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let unit = state.course_service.create_unit(payload).await?;
    state
        .audit_service
        .record(admin.id, "create", "unit", unit.id, serde_json::to_value(&unit).ok())
        .await;
    Ok((StatusCode::CREATED, Json(unit)))
}

#[utoipa::path(
    put,
    path = "/api/admin/units/{id}",
    params(("id" = Uuid, Path, description = "Unit ID")),
    request_body = UpdateUnitPayload,
    responses(
        (status = 200, description = "Unit updated"),
        (status = 404, description = "Unit not found")
    )
)]
#[axum::debug_handler]
pub async fn update_unit(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateUnitPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let unit = state.course_service.update_unit(id, payload).await?;
    state
        .audit_service
        .record(admin.id, "update", "unit", id, serde_json::to_value(&unit).ok())
        .await;
    Ok(Json(unit))
}

#[utoipa::path(
    delete,
    path = "/api/admin/units/{id}",
    params(("id" = Uuid, Path, description = "Unit ID")),
    responses((status = 204, description = "Unit deleted"))
)]
#[axum::debug_handler]
pub async fn delete_unit(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.course_service.delete_unit(id).await?;
    state.audit_service.record(admin.id, "delete", "unit", id, None).await;
    Ok(StatusCode::NO_CONTENT)
}

// ---- learning blocks ----

#[utoipa::path(
    post,
    path = "/api/admin/blocks",
    request_body = CreateBlockPayload,
    responses((status = 201, description = "Learning block created"))
)]
#[axum::debug_handler]
pub async fn create_block(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(payload): Json<CreateBlockPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let block = state.course_service.create_block(payload).await?;
    state
        .audit_service
        .record(admin.id, "create", "learning_block", block.id, serde_json::to_value(&block).ok())
        .await;
    Ok((StatusCode::CREATED, Json(block)))
}

#[utoipa::path(
    put,
    path = "/api/admin/blocks/{id}",
    params(("id" = Uuid, Path, description = "Learning block ID")),
    request_body = UpdateBlockPayload,
    responses((status = 200, description = "Learning block updated"))
)]
#[axum::debug_handler]
pub async fn update_block(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateBlockPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let block = state.course_service.update_block(id, payload).await?;
    state
        .audit_service
        .record(admin.id, "update", "learning_block", id, serde_json::to_value(&block).ok())
        .await;
    Ok(Json(block))
}

#[utoipa::path(
    delete,
    path = "/api/admin/blocks/{id}",
    params(("id" = Uuid, Path, description = "Learning block ID")),
    responses((status = 204, description = "Learning block deleted"))
)]
#[axum::debug_handler]
pub async fn delete_block(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.course_service.delete_block(id).await?;
    state
        .audit_service
        .record(admin.id, "delete", "learning_block", id, None)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ---- assessments ----

#[utoipa::path(
    post,
    path = "/api/admin/assessments",
    request_body = CreateAssessmentPayload,
    responses(
        (status = 201, description = "Assessment created"),
        (status = 400, description = "Invalid questions or placement")
    )
)]
#[axum::debug_handler]
pub async fn create_assessment(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(payload): Json<CreateAssessmentPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let assessment = state.course_service.create_assessment(payload).await?;
    state
        .audit_service
        .record(
            admin.id,
            "create",
            "assessment",
            assessment.id,
            Some(json!({ "title": assessment.title, "course_id": assessment.course_id })),
        )
        .await;
    Ok((StatusCode::CREATED, Json(assessment)))
}

#[utoipa::path(
    get,
    path = "/api/admin/assessments/{id}",
    params(("id" = Uuid, Path, description = "Assessment ID")),
    responses((status = 200, description = "Assessment including answer keys"))
)]
#[axum::debug_handler]
pub async fn get_assessment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let assessment = state.course_service.get_assessment(id).await?;
    Ok(Json(assessment))
}

#[utoipa::path(
    put,
    path = "/api/admin/assessments/{id}",
    params(("id" = Uuid, Path, description = "Assessment ID")),
    request_body = UpdateAssessmentPayload,
    responses((status = 200, description = "Assessment updated"))
)]
#[axum::debug_handler]
pub async fn update_assessment(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAssessmentPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let assessment = state.course_service.update_assessment(id, payload).await?;
    state
        .audit_service
        .record(
            admin.id,
            "update",
            "assessment",
            id,
            Some(json!({ "title": assessment.title })),
        )
        .await;
    Ok(Json(assessment))
}

#[utoipa::path(
    delete,
    path = "/api/admin/assessments/{id}",
    params(("id" = Uuid, Path, description = "Assessment ID")),
    responses((status = 204, description = "Assessment deleted"))
)]
#[axum::debug_handler]
pub async fn delete_assessment(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.course_service.delete_assessment(id).await?;
    state
        .audit_service
        .record(admin.id, "delete", "assessment", id, None)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ---- users ----

#[utoipa::path(
    get,
    path = "/api/admin/users",
    params(
        ("role" = Option<String>, Query, description = "Filter by role"),
        ("search" = Option<String>, Query, description = "Name or email contains"),
        ("page" = Option<i64>, Query, description = "Page number"),
        ("per_page" = Option<i64>, Query, description = "Items per page")
    ),
    responses((status = 200, description = "Paginated users"))
)]
#[axum::debug_handler]
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UserListQuery>,
) -> Result<impl IntoResponse> {
    let (users, total) = state.user_service.list(query).await?;
    Ok(Json(json!({ "users": users, "total": total })))
}

#[utoipa::path(
    patch,
    path = "/api/admin/users/{id}",
    params(("id" = Uuid, Path, description = "User ID")),
    request_body = UpdateUserPayload,
    responses(
        (status = 200, description = "User updated", body = Json<UserResponse>),
        (status = 404, description = "User not found")
    )
)]
#[axum::debug_handler]
pub async fn update_user(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateUserPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    if id == admin.id && payload.is_active == Some(false) {
        return Err(Error::BadRequest("You cannot deactivate your own account".to_string()));
    }
    let changes = json!({ "role": payload.role, "is_active": payload.is_active });
    let user = state.user_service.update(id, payload).await?;
    state
        .audit_service
        .record(admin.id, "update", "user", id, Some(changes))
        .await;
    Ok(Json(UserResponse::from(user)))
}

// ---- badges ----

#[utoipa::path(
    post,
    path = "/api/admin/badges",
    request_body = CreateBadgePayload,
    responses((status = 201, description = "Badge created"))
)]
#[axum::debug_handler]
pub async fn create_badge(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(payload): Json<CreateBadgePayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let badge = state.gamification_service.create_badge(payload).await?;
    state
        .audit_service
        .record(admin.id, "create", "badge", badge.id, serde_json::to_value(&badge).ok())
        .await;
    Ok((StatusCode::CREATED, Json(badge)))
}

// ---- uploads ----

#[utoipa::path(
    post,
    path = "/api/admin/media",
    request_body(content = String, description = "Multipart form with a `file` field", content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Media stored"),
        (status = 400, description = "Missing or disallowed file")
    )
)]
#[axum::debug_handler]
pub async fn upload_media(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.bin").to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await?;
        let media = state
            .upload_service
            .save_media(&filename, content_type, &data, admin.id)
            .await?;
        state
            .audit_service
            .record(admin.id, "upload", "media", media.id, Some(json!({ "name": filename })))
            .await;
        return Ok((StatusCode::CREATED, Json(media)));
    }
    Err(Error::BadRequest("Multipart field `file` is required".to_string()))
}

#[utoipa::path(
    get,
    path = "/api/admin/media",
    params(("limit" = Option<i64>, Query, description = "Max items, default 100")),
    responses((status = 200, description = "Uploaded media, newest first"))
)]
#[axum::debug_handler]
pub async fn list_media(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse> {
    let media = state.upload_service.list_media(query.limit.unwrap_or(100)).await?;
    Ok(Json(media))
}

#[utoipa::path(
    post,
    path = "/api/admin/certificate-templates",
    request_body(content = String, description = "Multipart form: `file` (PDF), `name`, `field_names`, optional `is_default`", content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Template stored"),
        (status = 400, description = "Missing file or form fields")
    )
)]
#[axum::debug_handler]
pub async fn upload_template(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let mut name: Option<String> = None;
    let mut field_names: Vec<String> = Vec::new();
    let mut is_default = false;
    let mut file: Option<(String, bytes::Bytes)> = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "name" => name = Some(field.text().await?.trim().to_string()),
            "field_names" => field_names = parse_field_names(&field.text().await?)?,
            "is_default" => {
                let raw = field.text().await?;
                is_default = matches!(raw.trim(), "true" | "1" | "on");
            }
            "file" => {
                let filename = field.file_name().unwrap_or("template.pdf").to_string();
                file = Some((filename, field.bytes().await?));
            }
            _ => {}
        }
    }

    let (filename, data) =
        file.ok_or_else(|| Error::BadRequest("Multipart field `file` is required".to_string()))?;
    let name = name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| filename.clone());

    let stored = state
        .upload_service
        .store("certificates", &filename, &data, TEMPLATE_EXTENSIONS)
        .await?;
    let template = state
        .certificate_service
        .create_template(&name, &stored.relative_path, &field_names, is_default)
        .await?;
    state
        .audit_service
        .record(
            admin.id,
            "create",
            "certificate_template",
            template.id,
            Some(json!({ "name": template.name, "is_default": template.is_default })),
        )
        .await;
    Ok((StatusCode::CREATED, Json(template)))
}

#[utoipa::path(
    get,
    path = "/api/admin/certificate-templates",
    responses((status = 200, description = "Certificate templates"))
)]
#[axum::debug_handler]
pub async fn list_templates(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let templates = state.certificate_service.list_templates().await?;
    Ok(Json(templates))
}

#[utoipa::path(
    get,
    path = "/api/admin/certificate-templates/{id}/file",
    params(("id" = Uuid, Path, description = "Template ID")),
    responses(
        (status = 200, description = "Template PDF", content_type = "application/pdf"),
        (status = 404, description = "Template not found")
    )
)]
#[axum::debug_handler]
pub async fn download_template(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let template = state.certificate_service.get_template(id).await?;
    let path = state.upload_service.resolve(&template.file_path)?;
    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        tracing::warn!(error = %e, path = %path.display(), "template file missing");
        Error::NotFound("Template file not found".to_string())
    })?;
    let body = Body::from_stream(ReaderStream::new(file));
    let disposition = format!(
        "attachment; filename=\"{}.pdf\"",
        template.name.replace('"', "").replace(' ', "_")
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}

// ---- reporting ----

#[utoipa::path(
    get,
    path = "/api/admin/export/progress",
    params(("course_id" = Option<Uuid>, Query, description = "Restrict to one course")),
    responses(
        (status = 200, description = "Learner progress workbook", content_type = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
    )
)]
#[axum::debug_handler]
pub async fn export_progress(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse> {
    let rows = state.progress_service.export_rows(query.course_id).await?;
    let buffer = ExportService::generate_progress_xlsx(&rows)?;
    let filename = format!("progress_{}.xlsx", chrono::Utc::now().format("%Y%m%d"));
    let disposition = format!("attachment; filename=\"{}\"", filename);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        buffer,
    ))
}

#[utoipa::path(
    get,
    path = "/api/admin/dashboard",
    responses((status = 200, description = "Platform totals", body = Json<DashboardStats>))
)]
#[axum::debug_handler]
pub async fn dashboard(State(state): State<AppState>) -> Result<Json<DashboardStats>> {
    let stats = state.course_service.dashboard_stats().await?;
    Ok(Json(stats))
}

#[utoipa::path(
    get,
    path = "/api/admin/audit",
    params(("limit" = Option<i64>, Query, description = "Max entries, default 100")),
    responses((status = 200, description = "Recent admin actions"))
)]
#[axum::debug_handler]
pub async fn audit_log(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse> {
    let entries = state.audit_service.recent(query.limit.unwrap_or(100)).await?;
    Ok(Json(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_from_comma_list() {
        let names = parse_field_names(" learner_name, course_name ,,date ").unwrap();
        assert_eq!(names, vec!["learner_name", "course_name", "date"]);
    }

    #[test]
    fn field_names_from_json_array() {
        let names = parse_field_names(r#"["learner_name", " score "]"#).unwrap();
        assert_eq!(names, vec!["learner_name", "score"]);
    }

    #[test]
    fn malformed_json_array_is_rejected() {
        assert!(parse_field_names("[\"unterminated").is_err());
    }
}
