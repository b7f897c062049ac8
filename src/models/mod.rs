pub mod assessment;
pub mod attempt;
pub mod audit_log;
pub mod badge;
pub mod certificate;
pub mod course;
pub mod learning_block;
pub mod media;
pub mod notification;
pub mod progress;
pub mod question;
pub mod user;
pub mod webhook_log;
