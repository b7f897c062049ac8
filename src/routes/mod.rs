pub mod admin;
pub mod assessments;
pub mod auth;
pub mod certificates;
pub mod courses;
pub mod gamification;
pub mod health;
pub mod notifications;
pub mod progress;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, patch, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, services::ServeDir, trace::TraceLayer};

use crate::{
    config::Config,
    middleware::{
        auth::{require_admin, require_auth},
        cors::cors_layer,
        rate_limit::{rps_middleware, RateLimiter},
    },
    AppState,
};

const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

/// Full HTTP surface: public, learner and admin groups, each with its own
/// guard, plus static uploads.
pub fn router(state: AppState, config: &Config) -> Router {
    let public_api = Router::new()
        .route("/health", get(health::health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route(
            "/api/certificates/verify/:code",
            get(certificates::verify_certificate),
        )
        .layer(axum::middleware::from_fn_with_state(
            RateLimiter::new(config.public_rps),
            rps_middleware,
        ));

    let learner_api = Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/courses", get(courses::list_courses))
        .route("/api/courses/:id", get(courses::get_course))
        .route("/api/courses/:id/enroll", post(courses::enroll))
        .route("/api/courses/:id/progress", get(progress::course_progress))
        .route("/api/units/:id", get(courses::get_unit))
        .route("/api/blocks/:id/complete", post(progress::complete_block))
        .route("/api/progress", get(progress::my_progress))
        .route("/api/assessments/:id", get(assessments::get_assessment))
        .route("/api/assessments/:id/start", post(assessments::start_attempt))
        .route("/api/assessments/:id/submit", post(assessments::submit_assessment))
        .route("/api/attempts/:id/answer", patch(assessments::save_answer))
        .route("/api/attempts/:id/navigate", post(assessments::navigate))
        .route("/api/attempts/:id/status", get(assessments::attempt_status))
        .route("/api/attempts/:id/submit", post(assessments::submit_attempt))
        .route("/api/attempts/:id/result", get(assessments::attempt_result))
        .route("/api/certificates", get(certificates::list_certificates))
        .route("/api/certificates/:id", get(certificates::get_certificate))
        .route("/api/badges", get(gamification::my_badges))
        .route("/api/leaderboard", get(gamification::leaderboard))
        .route("/api/xp/history", get(gamification::xp_history))
        .route("/api/notifications", get(notifications::list_notifications))
        .route(
            "/api/notifications/unread-count",
            get(notifications::unread_count),
        )
        .route(
            "/api/notifications/read-all",
            post(notifications::mark_all_read),
        )
        .route("/api/notifications/:id/read", post(notifications::mark_read))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ))
        .layer(axum::middleware::from_fn_with_state(
            RateLimiter::new(config.api_rps),
            rps_middleware,
        ));

    let admin_api = Router::new()
        .route("/api/admin/dashboard", get(admin::dashboard))
        .route("/api/admin/audit", get(admin::audit_log))
        .route("/api/admin/courses", post(admin::create_course))
        .route(
            "/api/admin/courses/:id",
            axum::routing::put(admin::update_course).delete(admin::delete_course),
        )
        .route("/api/admin/courses/:id/units", post(admin::attach_unit))
        .route(
            "/api/admin/courses/:id/units/:unit_id",
            delete(admin::detach_unit),
        )
        .route("/api/admin/units", post(admin::create_unit))
        .route(
            "/api/admin/units/:id",
            axum::routing::put(admin::update_unit).delete(admin::delete_unit),
        )
        .route("/api/admin/blocks", post(admin::create_block))
        .route(
            "/api/admin/blocks/:id",
            axum::routing::put(admin::update_block).delete(admin::delete_block),
        )
        .route("/api/admin/assessments", post(admin::create_assessment))
        .route(
            "/api/admin/assessments/:id",
            get(admin::get_assessment)
                .put(admin::update_assessment)
                .delete(admin::delete_assessment),
        )
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/users/:id", patch(admin::update_user))
        .route("/api/admin/badges", post(admin::create_badge))
        .route(
            "/api/admin/media",
            get(admin::list_media).post(admin::upload_media),
        )
        .route(
            "/api/admin/certificate-templates",
            get(admin::list_templates).post(admin::upload_template),
        )
        .route(
            "/api/admin/certificate-templates/:id/file",
            get(admin::download_template),
        )
        .route("/api/admin/export/progress", get(admin::export_progress))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ))
        .layer(axum::middleware::from_fn_with_state(
            RateLimiter::new(config.api_rps),
            rps_middleware,
        ));

    Router::new()
        .merge(public_api)
        .merge(learner_api)
        .merge(admin_api)
        .nest_service("/uploads", ServeDir::new(&config.uploads_dir))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(config.cors_origin.as_deref()))
                .layer(CompressionLayer::new()),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
