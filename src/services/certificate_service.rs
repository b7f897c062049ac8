//! Certificate issuance, verification codes and template form filling.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::certificate::{Certificate, CertificateTemplate};
use crate::utils::crypto::{constant_time_eq, hmac_sha256};
use crate::utils::time::{format_certificate_date, Clock};

const CODE_BYTES: usize = 12;

/// Values available to a certificate template.
#[derive(Debug, Clone)]
pub struct CertificateData {
    pub learner_name: String,
    pub course_name: String,
    pub course_level: String,
    pub course_duration: Option<String>,
    pub assessment_title: String,
    pub percentage: f64,
    pub issued_at: DateTime<Utc>,
    pub verification_code: String,
}

pub fn verification_code(secret: &str, certificate_id: Uuid) -> String {
    let mac = hmac_sha256(secret.as_bytes(), certificate_id.as_bytes());
    URL_SAFE_NO_PAD.encode(&mac[..CODE_BYTES])
}

/// Codes are 16 characters of unpadded base64url.
pub fn is_well_formed_code(code: &str) -> bool {
    code.len() == 16
        && code
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub fn verify_code(secret: &str, certificate_id: Uuid, code: &str) -> bool {
    constant_time_eq(&verification_code(secret, certificate_id), code)
}

/// Splits a form-field name into lowercase words on punctuation and
/// camelCase boundaries, so `IssuedTo`, `issued_to` and `Issued To` agree.
fn field_words(field: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in field.chars() {
        if !ch.is_ascii_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_ascii_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        current.push(ch.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn field_value(field: &str, data: &CertificateData) -> Option<String> {
    let words = field_words(field);
    let has = |needle: &str| words.iter().any(|w| w.contains(needle));
    let word = |w: &str| words.iter().any(|x| x == w);
    let about_person = has("learner") || has("student") || has("recipient") || has("employee");

    // value keywords take precedence over what the value is about
    if has("score") || has("grade") || has("percent") || word("result") {
        return Some(format!("{:.0}%", data.percentage));
    }
    let issued = has("issued");
    if has("date") || (issued && !word("to") && !word("by")) {
        return Some(format_certificate_date(data.issued_at));
    }
    if has("code") || has("verif") || has("serial") || word("number") || word("no") || word("id") {
        if about_person {
            return None;
        }
        return Some(data.verification_code.clone());
    }

    if has("level") {
        return Some(data.course_level.clone());
    }
    if has("duration") || has("hours") {
        return data.course_duration.clone();
    }
    if has("course") {
        return Some(data.course_name.clone());
    }
    if has("assessment") || has("exam") || word("test") {
        return Some(data.assessment_title.clone());
    }
    if has("name") || about_person || (issued && word("to")) {
        return Some(data.learner_name.clone());
    }
    None
}

/// Maps template form-field names to values by matching on the field name.
/// Fields that match nothing are left out.
pub fn resolve_form_fields(field_names: &[String], data: &CertificateData) -> BTreeMap<String, String> {
    field_names
        .iter()
        .filter_map(|field| field_value(field, data).map(|v| (field.clone(), v)))
        .collect()
}

pub fn template_field_names(template: &CertificateTemplate) -> Vec<String> {
    serde_json::from_value(template.field_names.clone()).unwrap_or_default()
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CertificateVerification {
    pub valid: bool,
    pub certificate: Option<Certificate>,
}

/// What a certificate is about, loaded before issuance.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CertificateSubject {
    pub learner_name: String,
    pub course_id: Uuid,
    pub course_name: String,
    pub course_level: String,
    pub course_duration: Option<String>,
    pub assessment_title: String,
    pub template_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct CertificateService {
    pool: PgPool,
    secret: String,
    clock: Arc<dyn Clock>,
}

impl CertificateService {
    pub fn new(pool: PgPool, secret: String, clock: Arc<dyn Clock>) -> Self {
        Self { pool, secret, clock }
    }

    /// Assigns a new certificate id and stamps the values a template can use.
    pub fn draft(&self, subject: &CertificateSubject, percentage: f64) -> (Uuid, CertificateData) {
        let id = Uuid::new_v4();
        let data = CertificateData {
            learner_name: subject.learner_name.clone(),
            course_name: subject.course_name.clone(),
            course_level: subject.course_level.clone(),
            course_duration: subject.course_duration.clone(),
            assessment_title: subject.assessment_title.clone(),
            percentage,
            issued_at: self.clock.now(),
            verification_code: verification_code(&self.secret, id),
        };
        (id, data)
    }

    /// Issues the certificate for a passed assessment on the caller's
    /// connection, so it commits or rolls back with the graded attempt.
    /// Returns `None` when the learner already holds one for this assessment.
    pub async fn issue(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        assessment_id: Uuid,
        percentage: f64,
    ) -> Result<Option<Certificate>> {
        let subject = sqlx::query_as::<_, CertificateSubject>(
            r#"SELECT u.name AS learner_name, c.id AS course_id, c.name AS course_name,
                      c.level AS course_level, c.duration AS course_duration,
                      a.title AS assessment_title, a.certificate_template_id AS template_id
               FROM assessments a
               JOIN courses c ON c.id = a.course_id
               JOIN users u ON u.id = $2
               WHERE a.id = $1"#,
        )
        .bind(assessment_id)
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;

        let template = Self::resolve_template(&mut *conn, subject.template_id).await?;

        let (id, data) = self.draft(&subject, percentage);
        let fields = match &template {
            Some(t) => resolve_form_fields(&template_field_names(t), &data),
            None => BTreeMap::new(),
        };

        let certificate = sqlx::query_as::<_, Certificate>(
            r#"INSERT INTO certificates
                   (id, user_id, course_id, assessment_id, template_id, verification_code, fields, issued_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (user_id, assessment_id) DO NOTHING
               RETURNING *"#,
        )
        .bind(id)
        .bind(user_id)
        .bind(subject.course_id)
        .bind(assessment_id)
        .bind(template.as_ref().map(|t| t.id))
        .bind(&data.verification_code)
        .bind(json!(fields))
        .bind(data.issued_at)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(c) = &certificate {
            tracing::info!(certificate_id = %c.id, %user_id, %assessment_id, "certificate issued");
        }
        Ok(certificate)
    }

    async fn resolve_template(
        conn: &mut PgConnection,
        template_id: Option<Uuid>,
    ) -> Result<Option<CertificateTemplate>> {
        let template = match template_id {
            Some(id) => {
                sqlx::query_as::<_, CertificateTemplate>(
                    r#"SELECT * FROM certificate_templates WHERE id = $1"#,
                )
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
            }
            None => {
                sqlx::query_as::<_, CertificateTemplate>(
                    r#"SELECT * FROM certificate_templates WHERE is_default ORDER BY created_at DESC LIMIT 1"#,
                )
                .fetch_optional(&mut *conn)
                .await?
            }
        };
        Ok(template)
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Certificate>> {
        let rows = sqlx::query_as::<_, Certificate>(
            r#"SELECT * FROM certificates WHERE user_id = $1 ORDER BY issued_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_for_user(&self, user_id: Uuid, certificate_id: Uuid) -> Result<Certificate> {
        let row = sqlx::query_as::<_, Certificate>(
            r#"SELECT * FROM certificates WHERE id = $1 AND user_id = $2"#,
        )
        .bind(certificate_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn verify(&self, code: &str) -> Result<CertificateVerification> {
        if !is_well_formed_code(code) {
            return Ok(CertificateVerification {
                valid: false,
                certificate: None,
            });
        }
        let found = sqlx::query_as::<_, Certificate>(
            r#"SELECT * FROM certificates WHERE verification_code = $1"#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match found {
            Some(cert) if verify_code(&self.secret, cert.id, code) => CertificateVerification {
                valid: true,
                certificate: Some(cert),
            },
            _ => CertificateVerification {
                valid: false,
                certificate: None,
            },
        })
    }

    pub async fn create_template(
        &self,
        name: &str,
        file_path: &str,
        field_names: &[String],
        is_default: bool,
    ) -> Result<CertificateTemplate> {
        if field_names.is_empty() {
            return Err(Error::BadRequest(
                "A certificate template needs at least one form field".to_string(),
            ));
        }
        let mut tx = self.pool.begin().await?;
        if is_default {
            sqlx::query(r#"UPDATE certificate_templates SET is_default = FALSE WHERE is_default"#)
                .execute(&mut *tx)
                .await?;
        }
        let template = sqlx::query_as::<_, CertificateTemplate>(
            r#"INSERT INTO certificate_templates (name, file_path, field_names, is_default)
               VALUES ($1, $2, $3, $4)
               RETURNING *"#,
        )
        .bind(name)
        .bind(file_path)
        .bind(json!(field_names))
        .bind(is_default)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(template)
    }

    pub async fn list_templates(&self) -> Result<Vec<CertificateTemplate>> {
        let rows = sqlx::query_as::<_, CertificateTemplate>(
            r#"SELECT * FROM certificate_templates ORDER BY created_at DESC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_template(&self, id: Uuid) -> Result<CertificateTemplate> {
        let row = sqlx::query_as::<_, CertificateTemplate>(
            r#"SELECT * FROM certificate_templates WHERE id = $1"#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::MockClock;
    use chrono::TimeZone;

    fn data() -> CertificateData {
        CertificateData {
            learner_name: "Ada Lovelace".into(),
            course_name: "Safety Basics".into(),
            course_level: "Beginner".into(),
            course_duration: Some("4 hours".into()),
            assessment_title: "Final Exam".into(),
            percentage: 87.5,
            issued_at: Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).unwrap(),
            verification_code: "abc123".into(),
        }
    }

    #[test]
    fn fills_fields_by_name_pattern() {
        let fields: Vec<String> = [
            "CourseName",
            "recipient_name",
            "Date",
            "Score",
            "certificate_id",
            "Level",
            "Duration",
            "signature",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let filled = resolve_form_fields(&fields, &data());
        assert_eq!(filled["CourseName"], "Safety Basics");
        assert_eq!(filled["recipient_name"], "Ada Lovelace");
        assert_eq!(filled["Date"], "January 15, 2026");
        assert_eq!(filled["Score"], "88%");
        assert_eq!(filled["certificate_id"], "abc123");
        assert_eq!(filled["Level"], "Beginner");
        assert_eq!(filled["Duration"], "4 hours");
        assert!(!filled.contains_key("signature"));
    }

    #[test]
    fn course_name_wins_over_learner_name() {
        let filled = resolve_form_fields(&["course_title".to_string(), "full_name".to_string()], &data());
        assert_eq!(filled["course_title"], "Safety Basics");
        assert_eq!(filled["full_name"], "Ada Lovelace");
    }

    #[test]
    fn value_keywords_win_over_subject_keywords() {
        let fields: Vec<String> = ["exam_score", "Exam Date", "Issued To", "student_number", "Learner Grade"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let filled = resolve_form_fields(&fields, &data());
        assert_eq!(filled["exam_score"], "88%");
        assert_eq!(filled["Exam Date"], "January 15, 2026");
        assert_eq!(filled["Issued To"], "Ada Lovelace");
        assert_eq!(filled["Learner Grade"], "88%");
        assert!(!filled.contains_key("student_number"));
    }

    #[test]
    fn issued_alone_is_a_date_but_issued_by_is_unknown() {
        let fields: Vec<String> = ["IssuedOn", "issued", "issued_by", "IssuedTo", "ExamTitle", "CourseLevel"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let filled = resolve_form_fields(&fields, &data());
        assert_eq!(filled["IssuedOn"], "January 15, 2026");
        assert_eq!(filled["issued"], "January 15, 2026");
        assert!(!filled.contains_key("issued_by"));
        assert_eq!(filled["IssuedTo"], "Ada Lovelace");
        assert_eq!(filled["ExamTitle"], "Final Exam");
        assert_eq!(filled["CourseLevel"], "Beginner");
    }

    #[test]
    fn missing_duration_is_skipped() {
        let mut d = data();
        d.course_duration = None;
        let filled = resolve_form_fields(&["duration".to_string()], &d);
        assert!(filled.is_empty());
    }

    #[tokio::test]
    async fn drafts_are_stamped_by_the_injected_clock() {
        let issued = Utc.with_ymd_and_hms(2026, 2, 3, 14, 0, 0).unwrap();
        let mut clock = MockClock::new();
        clock.expect_now().return_const(issued);
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let service = CertificateService::new(pool, "secret".into(), Arc::new(clock));
        let subject = CertificateSubject {
            learner_name: "Ada Lovelace".into(),
            course_id: Uuid::new_v4(),
            course_name: "Safety Basics".into(),
            course_level: "Beginner".into(),
            course_duration: None,
            assessment_title: "Final Exam".into(),
            template_id: None,
        };

        let (id, data) = service.draft(&subject, 92.0);
        assert_eq!(data.issued_at, issued);
        assert!(verify_code("secret", id, &data.verification_code));
        let filled = resolve_form_fields(&["issue_date".to_string()], &data);
        assert_eq!(filled["issue_date"], "February 3, 2026");
    }

    #[test]
    fn verification_codes_are_bound_to_id_and_secret() {
        let id = Uuid::new_v4();
        let code = verification_code("secret", id);
        assert_eq!(code.len(), 16);
        assert!(verify_code("secret", id, &code));
        assert!(!verify_code("other", id, &code));
        assert!(!verify_code("secret", Uuid::new_v4(), &code));
        assert!(is_well_formed_code(&code));
    }

    #[test]
    fn malformed_codes_are_rejected_up_front() {
        assert!(!is_well_formed_code(""));
        assert!(!is_well_formed_code("short"));
        assert!(!is_well_formed_code("abcdefgh/jklmnop"));
        assert!(!is_well_formed_code("abcdefghijklmnopq"));
        assert!(is_well_formed_code("abcDEF-_12345678"));
    }
}
