use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::dto::gamification_dto::CreateBadgePayload;
use crate::error::{Error, Result};
use crate::models::badge::{Badge, BadgeCriterion, LeaderboardRow, XpEvent};

pub const XP_SOURCE_BLOCK: &str = "block";
pub const XP_SOURCE_ASSESSMENT: &str = "assessment";
pub const XP_SOURCE_COURSE: &str = "course";
pub const COURSE_COMPLETION_XP: i32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerStats {
    pub blocks_completed: i64,
    pub assessments_passed: i64,
    pub courses_completed: i64,
    pub xp_total: i64,
}

impl LearnerStats {
    pub fn value_for(&self, criterion: BadgeCriterion) -> i64 {
        match criterion {
            BadgeCriterion::BlocksCompleted => self.blocks_completed,
            BadgeCriterion::AssessmentsPassed => self.assessments_passed,
            BadgeCriterion::CoursesCompleted => self.courses_completed,
            BadgeCriterion::XpTotal => self.xp_total,
        }
    }
}

/// Badges whose threshold is met and that the learner does not hold yet.
/// Badges with an unknown criterion are never awarded.
pub fn eligible_badges(stats: &LearnerStats, badges: &[Badge], owned: &HashSet<Uuid>) -> Vec<Uuid> {
    badges
        .iter()
        .filter(|b| !owned.contains(&b.id))
        .filter(|b| {
            BadgeCriterion::parse(&b.criterion)
                .map(|c| stats.value_for(c) >= i64::from(b.threshold))
                .unwrap_or(false)
        })
        .map(|b| b.id)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: Uuid,
    pub name: String,
    pub xp: i64,
}

/// Competition ranking over rows already sorted by XP descending: equal XP
/// shares a rank and the next distinct score skips ahead (1, 1, 3).
pub fn rank_leaderboard(rows: Vec<LeaderboardRow>) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = Vec::with_capacity(rows.len());
    for (idx, row) in rows.into_iter().enumerate() {
        let rank = match entries.last() {
            Some(prev) if prev.xp == row.xp => prev.rank,
            _ => idx + 1,
        };
        entries.push(LeaderboardEntry {
            rank,
            user_id: row.user_id,
            name: row.name,
            xp: row.xp,
        });
    }
    entries
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeStatus {
    #[serde(flatten)]
    pub badge: Badge,
    pub earned: bool,
    pub awarded_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone)]
pub struct GamificationService {
    pool: PgPool,
}

impl GamificationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Awards XP once per (source_type, source_id). Returns `true` if new.
    pub async fn award_xp(
        &self,
        user_id: Uuid,
        source_type: &str,
        source_id: Uuid,
        amount: i32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO xp_events (user_id, source_type, source_id, amount)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (user_id, source_type, source_id) DO NOTHING"#,
        )
        .bind(user_id)
        .bind(source_type)
        .bind(source_id)
        .bind(amount.max(0))
        .execute(&self.pool)
        .await?;
        let awarded = result.rows_affected() > 0;
        if awarded {
            tracing::debug!(%user_id, source_type, %source_id, amount, "xp awarded");
        }
        Ok(awarded)
    }

    pub async fn total_xp(&self, user_id: Uuid) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(SUM(amount), 0)::BIGINT FROM xp_events WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    pub async fn xp_history(&self, user_id: Uuid, limit: i64) -> Result<Vec<XpEvent>> {
        let rows = sqlx::query_as::<_, XpEvent>(
            r#"SELECT * FROM xp_events WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"#,
        )
        .bind(user_id)
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn learner_stats(&self, user_id: Uuid) -> Result<LearnerStats> {
        let (blocks_completed, assessments_passed, courses_completed, xp_total): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"SELECT
                    (SELECT COUNT(*) FROM user_block_progress WHERE user_id = $1 AND completed),
                    (SELECT COUNT(*) FROM user_assessment_progress WHERE user_id = $1 AND completed),
                    (SELECT COUNT(*) FROM enrollments WHERE user_id = $1 AND completed_at IS NOT NULL),
                    (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM xp_events WHERE user_id = $1)"#,
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(LearnerStats {
            blocks_completed,
            assessments_passed,
            courses_completed,
            xp_total,
        })
    }

    /// Awards every newly earned badge and returns them.
    pub async fn evaluate_badges(&self, user_id: Uuid) -> Result<Vec<Badge>> {
        let stats = self.learner_stats(user_id).await?;
        let badges = self.list_badges().await?;
        let owned: HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            r#"SELECT badge_id FROM user_badges WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        let mut awarded = Vec::new();
        for badge_id in eligible_badges(&stats, &badges, &owned) {
            let inserted = sqlx::query(
                r#"INSERT INTO user_badges (user_id, badge_id) VALUES ($1, $2)
                   ON CONFLICT DO NOTHING"#,
            )
            .bind(user_id)
            .bind(badge_id)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() > 0 {
                if let Some(badge) = badges.iter().find(|b| b.id == badge_id) {
                    tracing::info!(%user_id, badge = %badge.name, "badge awarded");
                    awarded.push(badge.clone());
                }
            }
        }
        Ok(awarded)
    }

    pub async fn list_badges(&self) -> Result<Vec<Badge>> {
        let badges = sqlx::query_as::<_, Badge>(r#"SELECT * FROM badges ORDER BY threshold, name"#)
            .fetch_all(&self.pool)
            .await?;
        Ok(badges)
    }

    pub async fn badges_for_user(&self, user_id: Uuid) -> Result<Vec<BadgeStatus>> {
        let badges = self.list_badges().await?;
        let owned: Vec<(Uuid, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
            r#"SELECT badge_id, awarded_at FROM user_badges WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(badges
            .into_iter()
            .map(|badge| {
                let awarded_at = owned.iter().find(|(id, _)| *id == badge.id).map(|(_, at)| *at);
                BadgeStatus {
                    earned: awarded_at.is_some(),
                    awarded_at,
                    badge,
                }
            })
            .collect())
    }

    pub async fn create_badge(&self, payload: CreateBadgePayload) -> Result<Badge> {
        if BadgeCriterion::parse(&payload.criterion).is_none() {
            return Err(Error::BadRequest(format!(
                "Unknown badge criterion '{}'",
                payload.criterion
            )));
        }
        let badge = sqlx::query_as::<_, Badge>(
            r#"INSERT INTO badges (name, description, icon_url, criterion, threshold)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(payload.name)
        .bind(payload.description)
        .bind(payload.icon_url)
        .bind(payload.criterion)
        .bind(payload.threshold)
        .fetch_one(&self.pool)
        .await?;
        Ok(badge)
    }

    /// Top learners by XP; ties go to whoever reached their total first.
    pub async fn leaderboard(&self, limit: i64) -> Result<Vec<LeaderboardEntry>> {
        let rows = sqlx::query_as::<_, LeaderboardRow>(
            r#"SELECT u.id AS user_id, u.name, COALESCE(SUM(x.amount), 0)::BIGINT AS xp
               FROM users u
               JOIN xp_events x ON x.user_id = u.id
               WHERE u.is_active
               GROUP BY u.id, u.name
               ORDER BY xp DESC, MAX(x.created_at) ASC
               LIMIT $1"#,
        )
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;
        Ok(rank_leaderboard(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn badge(criterion: &str, threshold: i32) -> Badge {
        Badge {
            id: Uuid::new_v4(),
            name: format!("{}-{}", criterion, threshold),
            description: None,
            icon_url: None,
            criterion: criterion.to_string(),
            threshold,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn badges_awarded_when_threshold_met() {
        let stats = LearnerStats {
            blocks_completed: 10,
            assessments_passed: 1,
            courses_completed: 0,
            xp_total: 250,
        };
        let first_block = badge("blocks_completed", 1);
        let ten_blocks = badge("blocks_completed", 10);
        let first_course = badge("courses_completed", 1);
        let xp_500 = badge("xp_total", 500);
        let bogus = badge("logins", 0);
        let badges = vec![first_block.clone(), ten_blocks.clone(), first_course, xp_500, bogus];

        let mut owned = HashSet::new();
        owned.insert(first_block.id);

        assert_eq!(eligible_badges(&stats, &badges, &owned), vec![ten_blocks.id]);
    }

    #[test]
    fn leaderboard_ties_share_rank() {
        let row = |name: &str, xp: i64| LeaderboardRow {
            user_id: Uuid::new_v4(),
            name: name.to_string(),
            xp,
        };
        let ranked = rank_leaderboard(vec![row("a", 300), row("b", 300), row("c", 120), row("d", 50)]);
        let ranks: Vec<usize> = ranked.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 1, 3, 4]);
        assert_eq!(ranked[0].name, "a");
    }
}
