//! Side effects of learner progress: XP, course completion, badges and the
//! notifications that announce them.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::assessment::Assessment;
use crate::models::badge::Badge;
use crate::models::learning_block::LearningBlock;
use crate::services::gamification_service::{
    GamificationService, COURSE_COMPLETION_XP, XP_SOURCE_ASSESSMENT, XP_SOURCE_BLOCK, XP_SOURCE_COURSE,
};
use crate::services::notification_service::{
    NotificationService, KIND_BADGE_EARNED, KIND_COURSE_COMPLETED,
};
use crate::services::progress_service::ProgressService;

/// What a single progress event unlocked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AchievementOutcome {
    pub xp_awarded: i32,
    pub courses_completed: Vec<Uuid>,
    pub badges_earned: Vec<Badge>,
}

#[derive(Clone)]
pub struct AchievementService {
    pool: PgPool,
    progress: ProgressService,
    gamification: GamificationService,
    notifications: NotificationService,
}

impl AchievementService {
    pub fn new(
        pool: PgPool,
        progress: ProgressService,
        gamification: GamificationService,
        notifications: NotificationService,
    ) -> Self {
        Self {
            pool,
            progress,
            gamification,
            notifications,
        }
    }

    pub async fn on_block_completed(&self, user_id: Uuid, block: &LearningBlock) -> Result<AchievementOutcome> {
        let mut outcome = AchievementOutcome::default();
        if self
            .gamification
            .award_xp(user_id, XP_SOURCE_BLOCK, block.id, block.xp_reward)
            .await?
        {
            outcome.xp_awarded += block.xp_reward;
        }

        for course_id in self.progress.courses_for_unit(block.unit_id).await? {
            if self.progress.is_enrolled(user_id, course_id).await?
                && self.check_course_completion(user_id, course_id).await?
            {
                outcome.xp_awarded += COURSE_COMPLETION_XP;
                outcome.courses_completed.push(course_id);
            }
        }

        outcome.badges_earned = self.award_badges(user_id).await?;
        Ok(outcome)
    }

    pub async fn on_assessment_passed(&self, user_id: Uuid, assessment: &Assessment) -> Result<AchievementOutcome> {
        let mut outcome = AchievementOutcome::default();
        if self
            .gamification
            .award_xp(user_id, XP_SOURCE_ASSESSMENT, assessment.id, assessment.xp_reward)
            .await?
        {
            outcome.xp_awarded += assessment.xp_reward;
        }

        if self.check_course_completion(user_id, assessment.course_id).await? {
            outcome.xp_awarded += COURSE_COMPLETION_XP;
            outcome.courses_completed.push(assessment.course_id);
        }

        outcome.badges_earned = self.award_badges(user_id).await?;
        Ok(outcome)
    }

    /// Marks the enrollment complete the first time the course qualifies.
    /// Returns `true` only on that first transition.
    pub async fn check_course_completion(&self, user_id: Uuid, course_id: Uuid) -> Result<bool> {
        let view = self.progress.course_progress(user_id, course_id).await?;
        if !view.completed {
            return Ok(false);
        }

        let updated = sqlx::query(
            r#"UPDATE enrollments SET completed_at = NOW()
               WHERE user_id = $1 AND course_id = $2 AND completed_at IS NULL"#,
        )
        .bind(user_id)
        .bind(course_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        tracing::info!(%user_id, %course_id, "course completed");
        self.gamification
            .award_xp(user_id, XP_SOURCE_COURSE, course_id, COURSE_COMPLETION_XP)
            .await?;
        self.notify(
            user_id,
            KIND_COURSE_COMPLETED,
            "Course completed",
            &format!("You completed {}.", view.course_name),
            json!({ "course_id": course_id }),
        )
        .await;
        Ok(true)
    }

    async fn award_badges(&self, user_id: Uuid) -> Result<Vec<Badge>> {
        let badges = self.gamification.evaluate_badges(user_id).await?;
        for badge in &badges {
            self.notify(
                user_id,
                KIND_BADGE_EARNED,
                "Badge earned",
                &format!("You earned the {} badge.", badge.name),
                json!({ "badge_id": badge.id }),
            )
            .await;
        }
        Ok(badges)
    }

    async fn notify(&self, user_id: Uuid, kind: &str, title: &str, body: &str, data: serde_json::Value) {
        if let Err(e) = self
            .notifications
            .notify(user_id, kind, title, body, Some(data))
            .await
        {
            tracing::warn!(error = ?e, %user_id, kind, "failed to store notification");
        }
    }
}
