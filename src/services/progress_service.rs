//! Derived course progress.
//!
//! Percent complete is never stored; it is recomputed from the course's units,
//! blocks, assessments and the learner's completion records.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::Result;
use crate::models::assessment::{Assessment, PLACEMENT_END};
use crate::models::learning_block::LearningBlock;
use crate::services::export_service::ProgressExportRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub id: Uuid,
    pub unit_id: Uuid,
}

impl From<&LearningBlock> for BlockRef {
    fn from(block: &LearningBlock) -> Self {
        Self {
            id: block.id,
            unit_id: block.unit_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssessmentRef {
    pub id: Uuid,
    pub unit_id: Option<Uuid>,
    pub placement: String,
}

impl AssessmentRef {
    pub fn is_course_final(&self) -> bool {
        self.placement == PLACEMENT_END && self.unit_id.is_none()
    }
}

impl From<&Assessment> for AssessmentRef {
    fn from(a: &Assessment) -> Self {
        Self {
            id: a.id,
            unit_id: a.unit_id,
            placement: a.placement.clone(),
        }
    }
}

/// Per-user completion flags.
#[derive(Debug, Clone, Default)]
pub struct CompletionRecords {
    pub blocks: HashSet<Uuid>,
    pub assessments: HashSet<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseProgress {
    pub total_blocks: u32,
    pub completed_blocks: u32,
    pub total_assessments: u32,
    pub completed_assessments: u32,
    pub percent_complete: u8,
}

/// Percent complete of one course.
///
/// `assessments` are the course's assessments; course-final ones (placement
/// `end` with no unit) are left out of both numerator and denominator. Blocks
/// outside `units` are ignored. A course with nothing to complete is 100%.
pub fn compute_course_progress(
    units: &[Uuid],
    blocks: &[BlockRef],
    assessments: &[AssessmentRef],
    completions: &CompletionRecords,
) -> CourseProgress {
    let unit_set: HashSet<&Uuid> = units.iter().collect();

    let mut total_blocks = 0u32;
    let mut completed_blocks = 0u32;
    for block in blocks.iter().filter(|b| unit_set.contains(&b.unit_id)) {
        total_blocks += 1;
        if completions.blocks.contains(&block.id) {
            completed_blocks += 1;
        }
    }

    let mut total_assessments = 0u32;
    let mut completed_assessments = 0u32;
    for assessment in assessments.iter().filter(|a| !a.is_course_final()) {
        total_assessments += 1;
        if completions.assessments.contains(&assessment.id) {
            completed_assessments += 1;
        }
    }

    let total = u64::from(total_blocks + total_assessments);
    let done = u64::from(completed_blocks + completed_assessments);
    let percent_complete = if total == 0 {
        100
    } else {
        // round half up without floats
        ((200 * done + total) / (2 * total)).min(100) as u8
    };

    CourseProgress {
        total_blocks,
        completed_blocks,
        total_assessments,
        completed_assessments,
        percent_complete,
    }
}

/// Whether every course-final assessment has been passed.
pub fn final_assessments_passed(assessments: &[AssessmentRef], completions: &CompletionRecords) -> bool {
    assessments
        .iter()
        .filter(|a| a.is_course_final())
        .all(|a| completions.assessments.contains(&a.id))
}

/// Fingerprint of everything `compute_course_progress` reads.
pub fn progress_fingerprint(
    units: &[Uuid],
    blocks: &[BlockRef],
    assessments: &[AssessmentRef],
    completions: &CompletionRecords,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    let mut units = units.to_vec();
    units.sort();
    units.hash(&mut hasher);

    let mut blocks = blocks.to_vec();
    blocks.sort_by_key(|b| b.id);
    blocks.hash(&mut hasher);

    let mut assessments = assessments.to_vec();
    assessments.sort_by_key(|a| a.id);
    assessments.hash(&mut hasher);

    let mut done_blocks: Vec<&Uuid> = completions.blocks.iter().collect();
    done_blocks.sort();
    done_blocks.hash(&mut hasher);
    let mut done_assessments: Vec<&Uuid> = completions.assessments.iter().collect();
    done_assessments.sort();
    done_assessments.hash(&mut hasher);

    hasher.finish()
}

/// Memoizes progress per (user, course), recomputing only when inputs change.
#[derive(Clone, Default)]
pub struct ProgressCache {
    entries: Arc<Mutex<HashMap<(Uuid, Uuid), (u64, CourseProgress)>>>,
}

impl ProgressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute<F>(&self, key: (Uuid, Uuid), fingerprint: u64, compute: F) -> CourseProgress
    where
        F: FnOnce() -> CourseProgress,
    {
        let mut entries = self.entries.lock().expect("progress cache mutex poisoned");
        if let Some((fp, progress)) = entries.get(&key) {
            if *fp == fingerprint {
                return *progress;
            }
        }
        let progress = compute();
        entries.insert(key, (fingerprint, progress));
        progress
    }

    pub fn invalidate_user(&self, user_id: Uuid) {
        self.entries
            .lock()
            .expect("progress cache mutex poisoned")
            .retain(|(user, _), _| *user != user_id);
    }
}

/// Inputs for one learner and one course, as fetched from the database.
#[derive(Debug, Clone, Default)]
pub struct CourseInputs {
    pub units: Vec<Uuid>,
    pub blocks: Vec<BlockRef>,
    pub assessments: Vec<AssessmentRef>,
    pub completions: CompletionRecords,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseProgressView {
    pub course_id: Uuid,
    pub course_name: String,
    #[serde(flatten)]
    pub progress: CourseProgress,
    pub final_assessments_passed: bool,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProgressSummary {
    pub courses: Vec<CourseProgressView>,
    pub overall_percent: u8,
    pub courses_completed: usize,
}

/// Mean of per-course percentages; 100 when there is nothing enrolled.
pub fn overall_percent(courses: &[CourseProgressView]) -> u8 {
    if courses.is_empty() {
        return 100;
    }
    let n = courses.len() as u64;
    let sum: u64 = courses
        .iter()
        .map(|c| u64::from(c.progress.percent_complete))
        .sum();
    ((2 * sum + n) / (2 * n)) as u8
}

#[derive(Clone)]
pub struct ProgressService {
    pool: PgPool,
    cache: ProgressCache,
}

impl ProgressService {
    pub fn new(pool: PgPool, cache: ProgressCache) -> Self {
        Self { pool, cache }
    }

    pub async fn fetch_course_inputs(&self, user_id: Uuid, course_id: Uuid) -> Result<CourseInputs> {
        let units: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT unit_id FROM course_units WHERE course_id = $1 ORDER BY position"#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        let blocks: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"SELECT id, unit_id FROM learning_blocks WHERE unit_id = ANY($1)"#,
        )
        .bind(&units)
        .fetch_all(&self.pool)
        .await?;

        let assessments: Vec<(Uuid, Option<Uuid>, String)> = sqlx::query_as(
            r#"SELECT id, unit_id, placement FROM assessments WHERE course_id = $1"#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        let block_ids: Vec<Uuid> = blocks.iter().map(|(id, _)| *id).collect();
        let assessment_ids: Vec<Uuid> = assessments.iter().map(|(id, _, _)| *id).collect();

        let done_blocks: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT block_id FROM user_block_progress
               WHERE user_id = $1 AND completed AND block_id = ANY($2)"#,
        )
        .bind(user_id)
        .bind(&block_ids)
        .fetch_all(&self.pool)
        .await?;

        let done_assessments: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT assessment_id FROM user_assessment_progress
               WHERE user_id = $1 AND completed AND assessment_id = ANY($2)"#,
        )
        .bind(user_id)
        .bind(&assessment_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(CourseInputs {
            units,
            blocks: blocks
                .into_iter()
                .map(|(id, unit_id)| BlockRef { id, unit_id })
                .collect(),
            assessments: assessments
                .into_iter()
                .map(|(id, unit_id, placement)| AssessmentRef {
                    id,
                    unit_id,
                    placement,
                })
                .collect(),
            completions: CompletionRecords {
                blocks: done_blocks.into_iter().collect(),
                assessments: done_assessments.into_iter().collect(),
            },
        })
    }

    pub fn progress_from_inputs(&self, user_id: Uuid, course_id: Uuid, inputs: &CourseInputs) -> CourseProgress {
        let fp = progress_fingerprint(
            &inputs.units,
            &inputs.blocks,
            &inputs.assessments,
            &inputs.completions,
        );
        self.cache.get_or_compute((user_id, course_id), fp, || {
            compute_course_progress(
                &inputs.units,
                &inputs.blocks,
                &inputs.assessments,
                &inputs.completions,
            )
        })
    }

    pub async fn course_progress(&self, user_id: Uuid, course_id: Uuid) -> Result<CourseProgressView> {
        let (course_name, completed_at): (String, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"SELECT c.name, e.completed_at
               FROM courses c
               LEFT JOIN enrollments e ON e.course_id = c.id AND e.user_id = $2
               WHERE c.id = $1"#,
        )
        .bind(course_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let inputs = self.fetch_course_inputs(user_id, course_id).await?;
        let progress = self.progress_from_inputs(user_id, course_id, &inputs);
        let finals_passed = final_assessments_passed(&inputs.assessments, &inputs.completions);

        Ok(CourseProgressView {
            course_id,
            course_name,
            progress,
            final_assessments_passed: finals_passed,
            completed: progress.percent_complete == 100 && finals_passed,
            completed_at,
        })
    }

    pub async fn user_progress(&self, user_id: Uuid) -> Result<UserProgressSummary> {
        let course_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"SELECT course_id FROM enrollments WHERE user_id = $1 ORDER BY enrolled_at"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut courses = Vec::with_capacity(course_ids.len());
        for course_id in course_ids {
            courses.push(self.course_progress(user_id, course_id).await?);
        }

        Ok(UserProgressSummary {
            overall_percent: overall_percent(&courses),
            courses_completed: courses.iter().filter(|c| c.completed).count(),
            courses,
        })
    }

    /// Returns `true` when the block was not already complete.
    pub async fn mark_block_complete(&self, user_id: Uuid, block_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO user_block_progress (user_id, block_id, completed)
               VALUES ($1, $2, TRUE)
               ON CONFLICT (user_id, block_id) DO NOTHING"#,
        )
        .bind(user_id)
        .bind(block_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            self.cache.invalidate_user(user_id);
        }
        Ok(result.rows_affected() > 0)
    }

    /// Records a passed assessment on the caller's connection, keeping the best
    /// percentage seen. Call [`ProgressService::invalidate_user`] once the
    /// surrounding transaction commits.
    pub async fn record_assessment_pass(
        conn: &mut PgConnection,
        user_id: Uuid,
        assessment_id: Uuid,
        percentage: f64,
    ) -> Result<bool> {
        let pct = Decimal::from_f64(percentage).unwrap_or_default().round_dp(2);
        let first_time: Option<bool> = sqlx::query_scalar(
            r#"INSERT INTO user_assessment_progress (user_id, assessment_id, completed, best_percentage)
               VALUES ($1, $2, TRUE, $3)
               ON CONFLICT (user_id, assessment_id) DO UPDATE
               SET best_percentage = GREATEST(user_assessment_progress.best_percentage, EXCLUDED.best_percentage)
               RETURNING (xmax = 0)"#,
        )
        .bind(user_id)
        .bind(assessment_id)
        .bind(pct)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(first_time.unwrap_or(false))
    }

    pub fn invalidate_user(&self, user_id: Uuid) {
        self.cache.invalidate_user(user_id);
    }

    /// Courses whose structure includes the given unit.
    pub async fn courses_for_unit(&self, unit_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(r#"SELECT course_id FROM course_units WHERE unit_id = $1"#)
            .bind(unit_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn is_enrolled(&self, user_id: Uuid, course_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(SELECT 1 FROM enrollments WHERE user_id = $1 AND course_id = $2)"#,
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// One row per enrollment, optionally limited to a single course.
    pub async fn export_rows(&self, course_id: Option<Uuid>) -> Result<Vec<ProgressExportRow>> {
        let enrollments: Vec<(Uuid, String, String, Uuid, String, DateTime<Utc>, Option<DateTime<Utc>>, i64)> =
            sqlx::query_as(
                r#"SELECT u.id, u.name, u.email, c.id, c.name, e.enrolled_at, e.completed_at,
                          (SELECT COALESCE(SUM(amount), 0)::BIGINT FROM xp_events x WHERE x.user_id = u.id)
                   FROM enrollments e
                   JOIN users u ON u.id = e.user_id
                   JOIN courses c ON c.id = e.course_id
                   WHERE ($1::UUID IS NULL OR e.course_id = $1)
                   ORDER BY c.name, u.name"#,
            )
            .bind(course_id)
            .fetch_all(&self.pool)
            .await?;

        let mut rows = Vec::with_capacity(enrollments.len());
        for (user_id, learner_name, email, course_id, course_name, enrolled_at, completed_at, xp) in enrollments {
            let inputs = self.fetch_course_inputs(user_id, course_id).await?;
            let progress = self.progress_from_inputs(user_id, course_id, &inputs);
            rows.push(ProgressExportRow {
                user_id,
                learner_name,
                email,
                course_name,
                percent_complete: progress.percent_complete,
                completed_blocks: progress.completed_blocks,
                total_blocks: progress.total_blocks,
                completed_assessments: progress.completed_assessments,
                total_assessments: progress.total_assessments,
                xp,
                enrolled_at,
                completed_at,
            });
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn blocks_for(units: &[Uuid], per_unit: usize) -> Vec<BlockRef> {
        units
            .iter()
            .flat_map(|u| {
                (0..per_unit).map(move |_| BlockRef {
                    id: Uuid::new_v4(),
                    unit_id: *u,
                })
            })
            .collect()
    }

    fn assessment(unit_id: Option<Uuid>, placement: &str) -> AssessmentRef {
        AssessmentRef {
            id: Uuid::new_v4(),
            unit_id,
            placement: placement.to_string(),
        }
    }

    #[test]
    fn empty_course_is_complete() {
        let p = compute_course_progress(&[], &[], &[], &CompletionRecords::default());
        assert_eq!(p.percent_complete, 100);

        // A course with only a course-final assessment has nothing to count.
        let finals = vec![assessment(None, "end")];
        let p = compute_course_progress(&ids(1), &[], &finals, &CompletionRecords::default());
        assert_eq!(p.total_assessments, 0);
        assert_eq!(p.percent_complete, 100);
    }

    #[test]
    fn course_final_assessment_excluded_but_unit_end_assessment_counted() {
        let units = ids(1);
        let blocks = blocks_for(&units, 2);
        let course_final = assessment(None, "end");
        let unit_end = assessment(Some(units[0]), "end");
        let embedded = assessment(Some(units[0]), "embedded");
        let assessments = vec![course_final.clone(), unit_end.clone(), embedded];

        let mut done = CompletionRecords::default();
        done.blocks.insert(blocks[0].id);
        done.assessments.insert(course_final.id);
        done.assessments.insert(unit_end.id);

        let p = compute_course_progress(&units, &blocks, &assessments, &done);
        assert_eq!(p.total_blocks, 2);
        assert_eq!(p.total_assessments, 2);
        assert_eq!(p.completed_assessments, 1);
        // 2 of 4
        assert_eq!(p.percent_complete, 50);
        assert!(final_assessments_passed(&assessments, &done));
    }

    #[test]
    fn rounds_half_up() {
        let units = ids(1);
        let blocks = blocks_for(&units, 8);
        let mut done = CompletionRecords::default();
        // 1/8 = 12.5 -> 13
        done.blocks.insert(blocks[0].id);
        assert_eq!(compute_course_progress(&units, &blocks, &[], &done).percent_complete, 13);

        let blocks = blocks_for(&units, 3);
        let mut done = CompletionRecords::default();
        // 2/3 = 66.67 -> 67
        done.blocks.insert(blocks[0].id);
        done.blocks.insert(blocks[1].id);
        assert_eq!(compute_course_progress(&units, &blocks, &[], &done).percent_complete, 67);
    }

    #[test]
    fn blocks_outside_course_units_are_ignored() {
        let units = ids(1);
        let mut blocks = blocks_for(&units, 1);
        let stray = BlockRef {
            id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
        };
        blocks.push(stray);
        let mut done = CompletionRecords::default();
        done.blocks.insert(stray.id);

        let p = compute_course_progress(&units, &blocks, &[], &done);
        assert_eq!(p.total_blocks, 1);
        assert_eq!(p.completed_blocks, 0);
        assert_eq!(p.percent_complete, 0);
    }

    #[test]
    fn percent_never_decreases_as_records_are_added() {
        let units = ids(3);
        let blocks = blocks_for(&units, 4);
        let assessments = vec![
            assessment(Some(units[0]), "embedded"),
            assessment(Some(units[1]), "end"),
            assessment(None, "end"),
        ];

        let mut done = CompletionRecords::default();
        let mut last = compute_course_progress(&units, &blocks, &assessments, &done).percent_complete;
        for (i, block) in blocks.iter().enumerate() {
            done.blocks.insert(block.id);
            if let Some(a) = assessments.get(i) {
                done.assessments.insert(a.id);
            }
            let now = compute_course_progress(&units, &blocks, &assessments, &done).percent_complete;
            assert!(now >= last, "{} dropped to {}", last, now);
            last = now;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn fingerprint_ignores_ordering_but_tracks_completions() {
        let units = ids(2);
        let blocks = blocks_for(&units, 2);
        let mut reversed_units = units.clone();
        reversed_units.reverse();
        let mut reversed_blocks = blocks.clone();
        reversed_blocks.reverse();

        let none = CompletionRecords::default();
        assert_eq!(
            progress_fingerprint(&units, &blocks, &[], &none),
            progress_fingerprint(&reversed_units, &reversed_blocks, &[], &none)
        );

        let mut some = CompletionRecords::default();
        some.blocks.insert(blocks[0].id);
        assert_ne!(
            progress_fingerprint(&units, &blocks, &[], &none),
            progress_fingerprint(&units, &blocks, &[], &some)
        );
    }

    #[test]
    fn cache_recomputes_only_on_fingerprint_change() {
        let cache = ProgressCache::new();
        let key = (Uuid::new_v4(), Uuid::new_v4());
        let sample = compute_course_progress(&[], &[], &[], &CompletionRecords::default());

        let mut calls = 0;
        cache.get_or_compute(key, 1, || {
            calls += 1;
            sample
        });
        cache.get_or_compute(key, 1, || {
            calls += 1;
            sample
        });
        assert_eq!(calls, 1);

        cache.get_or_compute(key, 2, || {
            calls += 1;
            sample
        });
        assert_eq!(calls, 2);

        cache.invalidate_user(key.0);
        cache.get_or_compute(key, 2, || {
            calls += 1;
            sample
        });
        assert_eq!(calls, 3);
    }

    #[test]
    fn overall_is_mean_of_courses() {
        let view = |pct: u8| CourseProgressView {
            course_id: Uuid::new_v4(),
            course_name: "c".into(),
            progress: CourseProgress {
                total_blocks: 0,
                completed_blocks: 0,
                total_assessments: 0,
                completed_assessments: 0,
                percent_complete: pct,
            },
            final_assessments_passed: true,
            completed: pct == 100,
            completed_at: None,
        };
        assert_eq!(overall_percent(&[]), 100);
        assert_eq!(overall_percent(&[view(100), view(50), view(0)]), 50);
        assert_eq!(overall_percent(&[view(33), view(34)]), 34);
    }
}
