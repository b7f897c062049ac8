use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use uuid::Uuid;

use crate::dto::assessment_dto::{
    AssessmentOverview, AttemptStatusResponse, NavigateResponse, SaveAnswerRequest,
    SaveAnswerResponse, StartAttemptResponse, SubmitAssessmentResponse,
};
use crate::dto::course_dto::AssessmentSummary;
use crate::error::{Error, Result};
use crate::models::assessment::Assessment;
use crate::models::attempt::AssessmentAttempt;
use crate::models::question::{parse_questions, PublicQuestion};
use crate::services::achievement_service::AchievementService;
use crate::services::assessment_flow::{
    attempts_remaining, AssessmentSession, FlowState, Navigation, SubmissionResult,
};
use crate::services::certificate_service::CertificateService;
use crate::services::course_service::CourseService;
use crate::services::grading_service::GradingService;
use crate::services::notification_service::{
    NotificationService, KIND_ASSESSMENT_RESULT, KIND_CERTIFICATE_ISSUED,
};
use crate::services::progress_service::ProgressService;
use crate::utils::countdown::CountdownRegistry;
use crate::utils::time::Clock;

/// Attempts left in `submitting` longer than this are finalized by the sweeper.
const STUCK_SUBMISSION_MINUTES: i64 = 5;

/// Stored answers are a JSON object keyed by question id.
pub fn answers_from_json(raw: &JsonValue) -> BTreeMap<i32, JsonValue> {
    raw.as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| k.parse::<i32>().ok().map(|id| (id, v.clone())))
                .collect()
        })
        .unwrap_or_default()
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(2)
}

fn to_f64(value: Option<Decimal>) -> f64 {
    value.and_then(|d| d.to_f64()).unwrap_or(0.0)
}

#[derive(Clone)]
pub struct AttemptService {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    countdowns: CountdownRegistry,
    courses: CourseService,
    progress: ProgressService,
    certificates: CertificateService,
    achievements: AchievementService,
    notifications: NotificationService,
}

impl AttemptService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        clock: Arc<dyn Clock>,
        countdowns: CountdownRegistry,
        courses: CourseService,
        progress: ProgressService,
        certificates: CertificateService,
        achievements: AchievementService,
        notifications: NotificationService,
    ) -> Self {
        Self {
            pool,
            clock,
            countdowns,
            courses,
            progress,
            certificates,
            achievements,
            notifications,
        }
    }

    async fn completed_attempts(&self, user_id: Uuid, assessment_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM assessment_attempts
               WHERE user_id = $1 AND assessment_id = $2 AND status = 'completed'"#,
        )
        .bind(user_id)
        .bind(assessment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn open_attempt(&self, user_id: Uuid, assessment_id: Uuid) -> Result<Option<AssessmentAttempt>> {
        let row = sqlx::query_as::<_, AssessmentAttempt>(
            r#"SELECT * FROM assessment_attempts
               WHERE user_id = $1 AND assessment_id = $2 AND status IN ('in_progress', 'submitting')"#,
        )
        .bind(user_id)
        .bind(assessment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn load_for_user(&self, attempt_id: Uuid, user_id: Uuid) -> Result<(AssessmentAttempt, Assessment)> {
        let attempt = sqlx::query_as::<_, AssessmentAttempt>(
            r#"SELECT * FROM assessment_attempts WHERE id = $1 AND user_id = $2"#,
        )
        .bind(attempt_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound("Attempt not found".to_string()))?;
        let assessment = self.courses.get_assessment(attempt.assessment_id).await?;
        Ok((attempt, assessment))
    }

    fn session_for(attempt: &AssessmentAttempt, assessment: &Assessment, attempts_used: i64) -> AssessmentSession {
        let ids = parse_questions(&assessment.questions).iter().map(|q| q.id).collect();
        let state = FlowState::parse(&attempt.status).unwrap_or(FlowState::Completed);
        AssessmentSession::resume(
            ids,
            state,
            answers_from_json(&attempt.answers),
            usize::try_from(attempt.current_index).unwrap_or(0),
            attempt.expires_at,
            attempts_used,
            assessment.max_retakes,
        )
    }

    fn schedule_countdown(&self, attempt: &AssessmentAttempt) {
        let left = (attempt.expires_at - self.clock.now())
            .to_std()
            .unwrap_or_default();
        let svc = self.clone();
        let attempt_id = attempt.id;
        self.countdowns.schedule(attempt_id, left, move || async move {
            match svc.force_submit(attempt_id).await {
                Ok(Some(_)) => tracing::info!(%attempt_id, "attempt force-submitted on timeout"),
                Ok(None) => {}
                Err(e) => tracing::error!(%attempt_id, error = ?e, "force submit failed"),
            }
        });
    }

    pub async fn overview(&self, user_id: Uuid, assessment_id: Uuid) -> Result<AssessmentOverview> {
        let assessment = self.courses.get_assessment(assessment_id).await?;
        let used = self.completed_attempts(user_id, assessment_id).await?;
        let open = self.open_attempt(user_id, assessment_id).await?;

        let best: Option<Decimal> = sqlx::query_scalar(
            r#"SELECT MAX(percentage) FROM assessment_attempts
               WHERE user_id = $1 AND assessment_id = $2 AND status = 'completed'"#,
        )
        .bind(user_id)
        .bind(assessment_id)
        .fetch_one(&self.pool)
        .await?;

        let ids = parse_questions(&assessment.questions).iter().map(|q| q.id).collect();
        let fresh = AssessmentSession::new(ids, used, assessment.max_retakes);
        let state = match &open {
            Some(a) => FlowState::parse(&a.status).unwrap_or(FlowState::InProgress),
            None => fresh.state(),
        };

        Ok(AssessmentOverview {
            assessment: AssessmentSummary::from(&assessment),
            state,
            attempts_used: used,
            attempts_remaining: fresh.attempts_remaining(),
            can_start: open.is_none() && fresh.can_start(),
            open_attempt_id: open.map(|a| a.id),
            best_percentage: best.and_then(|d| d.to_f64()),
        })
    }

    /// Starts a new attempt, or resumes the learner's open one.
    pub async fn start(&self, user_id: Uuid, assessment_id: Uuid) -> Result<StartAttemptResponse> {
        let assessment = self.courses.get_assessment(assessment_id).await?;
        if !self.progress.is_enrolled(user_id, assessment.course_id).await? {
            return Err(Error::Forbidden("Enroll in the course first".to_string()));
        }
        let questions = parse_questions(&assessment.questions);
        if questions.is_empty() {
            return Err(Error::BadRequest("Assessment has no questions".to_string()));
        }
        let public: Vec<PublicQuestion> = questions.iter().map(PublicQuestion::from).collect();

        if let Some(open) = self.open_attempt(user_id, assessment_id).await? {
            if open.status == FlowState::Submitting.as_str() {
                return Err(Error::Conflict(
                    "Previous attempt is still being graded".to_string(),
                ));
            }
            if open.expires_at > self.clock.now() {
                if self.countdowns.remaining_secs(open.id).is_none() {
                    self.schedule_countdown(&open);
                }
                let used = self.completed_attempts(user_id, assessment_id).await?;
                let session = Self::session_for(&open, &assessment, used);
                return Ok(StartAttemptResponse {
                    attempt_id: open.id,
                    state: session.state(),
                    started_at: open.started_at,
                    expires_at: open.expires_at,
                    time_remaining_seconds: session.time_remaining(self.clock.as_ref()).num_seconds(),
                    current_index: session.current_index(),
                    questions: public,
                    answers: open.answers,
                    resumed: true,
                });
            }
            self.force_submit(open.id).await?;
        }

        let used = self.completed_attempts(user_id, assessment_id).await?;
        let mut session = AssessmentSession::new(
            questions.iter().map(|q| q.id).collect(),
            used,
            assessment.max_retakes,
        );
        let started_at = self.clock.now();
        let deadline = session.start(
            self.clock.as_ref(),
            Duration::minutes(i64::from(assessment.time_limit_minutes)),
        )?;

        let attempt = sqlx::query_as::<_, AssessmentAttempt>(
            r#"INSERT INTO assessment_attempts (assessment_id, user_id, status, started_at, expires_at)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(assessment_id)
        .bind(user_id)
        .bind(session.state().as_str())
        .bind(started_at)
        .bind(deadline)
        .fetch_one(&self.pool)
        .await?;

        self.schedule_countdown(&attempt);
        tracing::info!(attempt_id = %attempt.id, %user_id, %assessment_id, "attempt started");

        Ok(StartAttemptResponse {
            attempt_id: attempt.id,
            state: session.state(),
            started_at: attempt.started_at,
            expires_at: attempt.expires_at,
            time_remaining_seconds: session.time_remaining(self.clock.as_ref()).num_seconds(),
            current_index: session.current_index(),
            questions: public,
            answers: attempt.answers,
            resumed: false,
        })
    }

    /// Submits on the learner's behalf when the deadline already passed.
    async fn expire_if_due(&self, attempt: &AssessmentAttempt, session: &mut AssessmentSession) -> Result<()> {
        if session.expire_if_due(self.clock.as_ref()) {
            self.force_submit(attempt.id).await?;
            return Err(Error::Conflict(
                "Time is up; the attempt was submitted automatically".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn save_answer(&self, user_id: Uuid, attempt_id: Uuid, req: SaveAnswerRequest) -> Result<SaveAnswerResponse> {
        let (attempt, assessment) = self.load_for_user(attempt_id, user_id).await?;
        let mut session = Self::session_for(&attempt, &assessment, 0);
        self.expire_if_due(&attempt, &mut session).await?;
        session.answer(req.question_id, req.answer.clone())?;

        let result = sqlx::query(
            r#"UPDATE assessment_attempts
               SET answers = answers || jsonb_build_object($2::TEXT, $3::JSONB), updated_at = NOW()
               WHERE id = $1 AND status = 'in_progress'"#,
        )
        .bind(attempt_id)
        .bind(req.question_id.to_string())
        .bind(&req.answer)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Conflict("Attempt is no longer in progress".to_string()));
        }

        Ok(SaveAnswerResponse {
            saved: true,
            question_id: req.question_id,
            answered: session.answered_count(),
            total_questions: session.total_questions(),
        })
    }

    pub async fn navigate(&self, user_id: Uuid, attempt_id: Uuid, nav: Navigation) -> Result<NavigateResponse> {
        let (attempt, assessment) = self.load_for_user(attempt_id, user_id).await?;
        let mut session = Self::session_for(&attempt, &assessment, 0);
        self.expire_if_due(&attempt, &mut session).await?;
        let index = session.navigate(nav)?;

        sqlx::query(
            r#"UPDATE assessment_attempts SET current_index = $2, updated_at = NOW()
               WHERE id = $1 AND status = 'in_progress'"#,
        )
        .bind(attempt_id)
        .bind(index as i32)
        .execute(&self.pool)
        .await?;

        Ok(NavigateResponse {
            current_index: index,
            question_id: session.current_question_id(),
        })
    }

    pub async fn status(&self, user_id: Uuid, attempt_id: Uuid) -> Result<AttemptStatusResponse> {
        let (attempt, assessment) = self.load_for_user(attempt_id, user_id).await?;
        let session = Self::session_for(&attempt, &assessment, 0);
        let remaining = self
            .countdowns
            .remaining_secs(attempt_id)
            .map(|s| s as i64)
            .unwrap_or_else(|| session.time_remaining(self.clock.as_ref()).num_seconds());
        Ok(AttemptStatusResponse {
            attempt_id,
            state: session.state(),
            time_remaining_seconds: if session.state() == FlowState::InProgress { remaining } else { 0 },
            answered: session.answered_count(),
            total_questions: session.total_questions(),
            current_index: session.current_index(),
            expires_at: attempt.expires_at,
        })
    }

    /// Learner-initiated submission. Every question must be answered unless
    /// the deadline already passed, in which case the attempt is force-submitted.
    pub async fn submit(&self, user_id: Uuid, attempt_id: Uuid) -> Result<SubmitAssessmentResponse> {
        let (attempt, assessment) = self.load_for_user(attempt_id, user_id).await?;
        let mut session = Self::session_for(&attempt, &assessment, 0);

        if session.is_expired(self.clock.as_ref()) {
            return self
                .force_submit(attempt_id)
                .await?
                .ok_or_else(|| Error::Conflict("Attempt was already submitted".to_string()));
        }
        session.submit()?;

        let claimed = sqlx::query_as::<_, AssessmentAttempt>(
            r#"UPDATE assessment_attempts SET status = 'submitting', updated_at = NOW()
               WHERE id = $1 AND status = 'in_progress'
               RETURNING *"#,
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::Conflict("Attempt was already submitted".to_string()))?;

        self.countdowns.cancel(attempt_id);
        self.finalize(claimed, assessment).await
    }

    /// Submits the learner's open attempt on `assessment_id`.
    pub async fn submit_for_assessment(&self, user_id: Uuid, assessment_id: Uuid) -> Result<SubmitAssessmentResponse> {
        let open = self
            .open_attempt(user_id, assessment_id)
            .await?
            .ok_or_else(|| Error::Conflict("No attempt in progress".to_string()))?;
        self.submit(user_id, open.id).await
    }

    /// Submits with whatever answers exist. Returns `None` when the attempt had
    /// already left `in_progress`, so concurrent expiries finalize once.
    pub async fn force_submit(&self, attempt_id: Uuid) -> Result<Option<SubmitAssessmentResponse>> {
        let claimed = sqlx::query_as::<_, AssessmentAttempt>(
            r#"UPDATE assessment_attempts SET status = 'submitting', forced = TRUE, updated_at = NOW()
               WHERE id = $1 AND status = 'in_progress'
               RETURNING *"#,
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(attempt) = claimed else {
            return Ok(None);
        };
        self.countdowns.cancel(attempt_id);
        let assessment = self.courses.get_assessment(attempt.assessment_id).await?;
        self.finalize(attempt, assessment).await.map(Some)
    }

    /// Grades a `submitting` attempt and applies every consequence of the result.
    async fn finalize(&self, attempt: AssessmentAttempt, assessment: Assessment) -> Result<SubmitAssessmentResponse> {
        let questions = parse_questions(&assessment.questions);
        let answers = answers_from_json(&attempt.answers);
        let report = GradingService::grade(&questions, &answers, assessment.passing_score);

        // grade, progress and certificate commit together; a failure leaves the
        // attempt in `submitting` for the sweeper to retry
        let mut tx = self.pool.begin().await?;
        let certificate = if report.passed && assessment.has_certificate {
            self.certificates
                .issue(&mut *tx, attempt.user_id, assessment.id, report.percentage)
                .await?
        } else {
            None
        };

        let updated = sqlx::query(
            r#"UPDATE assessment_attempts
               SET status = 'completed', completed_at = $2, score = $3, max_score = $4,
                   percentage = $5, passed = $6, graded_answers = $7, certificate_issued = $8,
                   updated_at = NOW()
               WHERE id = $1 AND status = 'submitting'"#,
        )
        .bind(attempt.id)
        .bind(self.clock.now())
        .bind(Decimal::from(report.earned_points))
        .bind(Decimal::from(report.max_points))
        .bind(to_decimal(report.percentage))
        .bind(report.passed)
        .bind(json!(report.graded))
        .bind(certificate.is_some())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::Conflict("Attempt was already graded".to_string()));
        }

        if report.passed {
            ProgressService::record_assessment_pass(
                &mut *tx,
                attempt.user_id,
                assessment.id,
                report.percentage,
            )
            .await?;
        }
        tx.commit().await?;

        tracing::info!(
            attempt_id = %attempt.id,
            user_id = %attempt.user_id,
            percentage = report.percentage,
            passed = report.passed,
            forced = attempt.forced,
            "attempt graded"
        );

        if report.passed {
            self.progress.invalidate_user(attempt.user_id);
            if let Err(e) = self.achievements.on_assessment_passed(attempt.user_id, &assessment).await {
                tracing::warn!(attempt_id = %attempt.id, error = ?e, "achievement processing failed");
            }
        }

        let used = self.completed_attempts(attempt.user_id, assessment.id).await?;
        let mut session = Self::session_for(&attempt, &assessment, used - 1);
        session.acknowledge(SubmissionResult {
            passed: report.passed,
            score: f64::from(report.earned_points),
            max_score: f64::from(report.max_points),
            percentage: report.percentage,
            certificate_issued: certificate.is_some(),
        })?;

        let verdict = if report.passed { "passed" } else { "did not pass" };
        if let Err(e) = self
            .notifications
            .notify(
                attempt.user_id,
                KIND_ASSESSMENT_RESULT,
                &format!("{}: {}", assessment.title, verdict),
                &format!("You scored {:.0}% (passing score {}%).", report.percentage, assessment.passing_score),
                Some(json!({
                    "attempt_id": attempt.id,
                    "assessment_id": assessment.id,
                    "percentage": report.percentage,
                    "passed": report.passed,
                    "forced": attempt.forced,
                })),
            )
            .await
        {
            tracing::warn!(error = ?e, "failed to store result notification");
        }
        if let Some(cert) = &certificate {
            if let Err(e) = self
                .notifications
                .notify(
                    attempt.user_id,
                    KIND_CERTIFICATE_ISSUED,
                    "Certificate issued",
                    &format!("Your certificate for {} is ready.", assessment.title),
                    Some(json!({ "certificate_id": cert.id, "verification_code": cert.verification_code })),
                )
                .await
            {
                tracing::warn!(error = ?e, "failed to store certificate notification");
            }
        }

        Ok(SubmitAssessmentResponse {
            attempt_id: attempt.id,
            state: session.state(),
            passed: report.passed,
            score: f64::from(report.earned_points),
            max_score: f64::from(report.max_points),
            percentage: report.percentage,
            certificate_issued: certificate.is_some(),
            certificate_id: certificate.map(|c| c.id),
            forced: attempt.forced,
            attempts_remaining: attempts_remaining(assessment.max_retakes, used),
        })
    }

    pub async fn get_result(&self, user_id: Uuid, attempt_id: Uuid) -> Result<SubmitAssessmentResponse> {
        let (attempt, assessment) = self.load_for_user(attempt_id, user_id).await?;
        if attempt.status != FlowState::Completed.as_str() {
            return Err(Error::Conflict("Attempt has not been graded yet".to_string()));
        }
        let used = self.completed_attempts(user_id, assessment.id).await?;
        let certificate_id: Option<Uuid> = sqlx::query_scalar(
            r#"SELECT id FROM certificates WHERE user_id = $1 AND assessment_id = $2"#,
        )
        .bind(user_id)
        .bind(assessment.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(SubmitAssessmentResponse {
            attempt_id,
            state: FlowState::Completed,
            passed: attempt.passed.unwrap_or(false),
            score: to_f64(attempt.score),
            max_score: to_f64(attempt.max_score),
            percentage: to_f64(attempt.percentage),
            certificate_issued: attempt.certificate_issued,
            certificate_id: certificate_id.filter(|_| attempt.certificate_issued),
            forced: attempt.forced,
            attempts_remaining: attempts_remaining(assessment.max_retakes, used),
        })
    }

    /// Re-arms countdowns for attempts that were in flight when the process stopped.
    pub async fn restore_countdowns(&self) -> Result<usize> {
        let open = sqlx::query_as::<_, AssessmentAttempt>(
            r#"SELECT * FROM assessment_attempts WHERE status = 'in_progress' AND expires_at > $1"#,
        )
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await?;
        for attempt in &open {
            self.schedule_countdown(attempt);
        }
        Ok(open.len())
    }

    /// Finalizes attempts whose countdown never fired or whose grading was interrupted.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let expired: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT id FROM assessment_attempts WHERE status = 'in_progress' AND expires_at <= $1"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut finalized = 0;
        for id in expired {
            match self.force_submit(id).await {
                Ok(Some(_)) => finalized += 1,
                Ok(None) => {}
                Err(e) => tracing::error!(attempt_id = %id, error = ?e, "sweep force submit failed"),
            }
        }

        let stuck = sqlx::query_as::<_, AssessmentAttempt>(
            r#"SELECT * FROM assessment_attempts WHERE status = 'submitting' AND updated_at <= $1"#,
        )
        .bind(now - Duration::minutes(STUCK_SUBMISSION_MINUTES))
        .fetch_all(&self.pool)
        .await?;
        for attempt in stuck {
            let id = attempt.id;
            let result = match self.courses.get_assessment(attempt.assessment_id).await {
                Ok(assessment) => self.finalize(attempt, assessment).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => finalized += 1,
                Err(e) => tracing::error!(attempt_id = %id, error = ?e, "sweep finalize failed"),
            }
        }

        if finalized > 0 {
            tracing::info!(finalized, "expired attempts finalized");
        }
        Ok(finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_json_keys_are_question_ids() {
        let raw = json!({"1": 2, "7": [0, 1], "bogus": true});
        let answers = answers_from_json(&raw);
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[&1], json!(2));
        assert_eq!(answers[&7], json!([0, 1]));
    }

    #[test]
    fn non_object_answers_are_empty() {
        assert!(answers_from_json(&JsonValue::Null).is_empty());
        assert!(answers_from_json(&json!([1, 2])).is_empty());
    }

    #[test]
    fn decimals_round_to_cents() {
        assert_eq!(to_decimal(33.3333), Decimal::new(3333, 2));
        assert_eq!(to_f64(Some(Decimal::new(8750, 2))), 87.5);
        assert_eq!(to_f64(None), 0.0);
    }
}
