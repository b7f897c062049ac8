pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use std::sync::Arc;

use crate::config::Config;
use crate::services::{
    achievement_service::AchievementService, attempt_service::AttemptService,
    audit_service::AuditService, certificate_service::CertificateService,
    course_service::CourseService, gamification_service::GamificationService,
    notification_service::NotificationService,
    progress_service::{ProgressCache, ProgressService},
    upload_service::UploadService, user_service::UserService,
};
use crate::utils::countdown::CountdownRegistry;
use crate::utils::time::{Clock, SystemClock};
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub user_service: UserService,
    pub course_service: CourseService,
    pub progress_service: ProgressService,
    pub gamification_service: GamificationService,
    pub notification_service: NotificationService,
    pub certificate_service: CertificateService,
    pub achievement_service: AchievementService,
    pub attempt_service: AttemptService,
    pub audit_service: AuditService,
    pub upload_service: UploadService,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, crate::config::get_config(), Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let user_service = UserService::new(
            pool.clone(),
            config.jwt_secret.clone(),
            config.jwt_ttl_hours,
        );
        let course_service = CourseService::new(pool.clone());
        let progress_service = ProgressService::new(pool.clone(), ProgressCache::new());
        let gamification_service = GamificationService::new(pool.clone());
        let notification_service = NotificationService::new(
            pool.clone(),
            config.notification_webhook_url.clone(),
            config.webhook_secret.clone(),
        );
        let certificate_service = CertificateService::new(
            pool.clone(),
            config.webhook_secret.clone(),
            clock.clone(),
        );
        let achievement_service = AchievementService::new(
            pool.clone(),
            progress_service.clone(),
            gamification_service.clone(),
            notification_service.clone(),
        );
        let attempt_service = AttemptService::new(
            pool.clone(),
            clock,
            CountdownRegistry::new(),
            course_service.clone(),
            progress_service.clone(),
            certificate_service.clone(),
            achievement_service.clone(),
            notification_service.clone(),
        );
        let audit_service = AuditService::new(pool.clone());
        let upload_service = UploadService::new(pool.clone(), config.uploads_dir.clone());

        Self {
            pool,
            user_service,
            course_service,
            progress_service,
            gamification_service,
            notification_service,
            certificate_service,
            achievement_service,
            attempt_service,
            audit_service,
            upload_service,
        }
    }
}
