pub mod achievement_service;
pub mod assessment_flow;
pub mod attempt_service;
pub mod audit_service;
pub mod certificate_service;
pub mod course_service;
pub mod export_service;
pub mod gamification_service;
pub mod grading_service;
pub mod notification_service;
pub mod progress_service;
pub mod upload_service;
pub mod user_service;
