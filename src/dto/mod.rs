pub mod admin_dto;
pub mod assessment_dto;
pub mod auth_dto;
pub mod course_dto;
pub mod gamification_dto;
pub mod notification_dto;
