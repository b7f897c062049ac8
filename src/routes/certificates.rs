use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
    Extension,
};
use uuid::Uuid;

use crate::{
    error::Result,
    middleware::auth::AuthUser,
    services::certificate_service::CertificateVerification,
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/certificates",
    responses(
        (status = 200, description = "Certificates earned by the caller")
    )
)]
#[axum::debug_handler]
pub async fn list_certificates(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse> {
    let certificates = state.certificate_service.list_for_user(user.id).await?;
    Ok(Json(certificates))
}

#[utoipa::path(
    get,
    path = "/api/certificates/{id}",
    params(
        ("id" = Uuid, Path, description = "Certificate ID")
    ),
    responses(
        (status = 200, description = "Certificate with filled form fields"),
        (status = 404, description = "Certificate not found")
    )
)]
#[axum::debug_handler]
pub async fn get_certificate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let certificate = state.certificate_service.get_for_user(user.id, id).await?;
    Ok(Json(certificate))
}

/// Public: anyone holding a code can check it.
#[utoipa::path(
    get,
    path = "/api/certificates/verify/{code}",
    params(
        ("code" = String, Path, description = "Verification code printed on the certificate")
    ),
    responses(
        (status = 200, description = "Verification outcome", body = Json<CertificateVerification>)
    )
)]
#[axum::debug_handler]
pub async fn verify_certificate(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<CertificateVerification>> {
    let verification = state.certificate_service.verify(&code).await?;
    Ok(Json(verification))
}
