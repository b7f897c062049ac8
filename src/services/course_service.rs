use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::dto::admin_dto::DashboardStats;
use crate::dto::assessment_dto::{CreateAssessmentPayload, UpdateAssessmentPayload};
use crate::dto::course_dto::{
    AssessmentSummary, CourseDetail, CourseListQuery, CourseListResponse, CreateBlockPayload,
    CreateCoursePayload, CreateUnitPayload, EnrollResponse, UnitDetail, UpdateBlockPayload,
    UpdateCoursePayload, UpdateUnitPayload,
};
use crate::error::{Error, Result};
use crate::models::assessment::Assessment;
use crate::models::course::{Course, CourseUnit, Enrollment, Unit};
use crate::models::learning_block::LearningBlock;
use crate::models::question::Question;

/// Rejects question sets that would grade ambiguously.
pub fn validate_questions(questions: &[Question]) -> Result<()> {
    use crate::models::question::QuestionType;
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    for q in questions {
        if !seen.insert(q.id) {
            return Err(Error::BadRequest(format!("Duplicate question id {}", q.id)));
        }
        if q.points < 0 {
            return Err(Error::BadRequest(format!("Question {} has negative points", q.id)));
        }
        let in_range = |v: &serde_json::Value| {
            v.as_u64()
                .map(|i| (i as usize) < q.options.len())
                .unwrap_or(false)
        };
        let ok = match q.question_type {
            QuestionType::MultipleChoice => q.options.len() >= 2 && in_range(&q.correct_answer),
            QuestionType::MultiSelect => {
                q.options.len() >= 2
                    && q.correct_answer
                        .as_array()
                        .map(|a| !a.is_empty() && a.iter().all(in_range))
                        .unwrap_or(false)
            }
            QuestionType::TrueFalse => q.correct_answer.is_boolean(),
        };
        if !ok {
            return Err(Error::BadRequest(format!(
                "Question {} has an invalid correct answer",
                q.id
            )));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct CourseService {
    pool: PgPool,
}

impl CourseService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, query: CourseListQuery, include_unpublished: bool) -> Result<CourseListResponse> {
        let page = query.page.unwrap_or(1).max(1);
        let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
        let offset = (page - 1) * per_page;

        let items = sqlx::query_as::<_, Course>(
            r#"SELECT * FROM courses
               WHERE ($1 OR is_published)
                 AND ($2::UUID IS NULL OR module_id = $2)
                 AND ($3::TEXT IS NULL OR level = $3)
               ORDER BY created_at DESC
               LIMIT $4 OFFSET $5"#,
        )
        .bind(include_unpublished)
        .bind(query.module_id)
        .bind(&query.level)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM courses
               WHERE ($1 OR is_published)
                 AND ($2::UUID IS NULL OR module_id = $2)
                 AND ($3::TEXT IS NULL OR level = $3)"#,
        )
        .bind(include_unpublished)
        .bind(query.module_id)
        .bind(&query.level)
        .fetch_one(&self.pool)
        .await?;

        let total_pages = if total == 0 { 0 } else { (total + per_page - 1) / per_page };
        Ok(CourseListResponse {
            items,
            total,
            page,
            per_page,
            total_pages,
        })
    }

    pub async fn get_course(&self, id: Uuid) -> Result<Course> {
        let course = sqlx::query_as::<_, Course>(r#"SELECT * FROM courses WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("Course not found".to_string()))?;
        Ok(course)
    }

    /// Full course structure as seen by `user_id`.
    pub async fn detail(&self, course_id: Uuid, user_id: Uuid, is_admin: bool) -> Result<CourseDetail> {
        let course = self.get_course(course_id).await?;
        if !course.is_published && !is_admin {
            return Err(Error::NotFound("Course not found".to_string()));
        }

        let units = self.course_units(course_id).await?;
        let unit_ids: Vec<Uuid> = units.iter().map(|u| u.unit_id).collect();

        let blocks = sqlx::query_as::<_, LearningBlock>(
            r#"SELECT * FROM learning_blocks WHERE unit_id = ANY($1) ORDER BY position, created_at"#,
        )
        .bind(&unit_ids)
        .fetch_all(&self.pool)
        .await?;

        let assessments = self.assessments_for_course(course_id).await?;

        let enrolled: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(SELECT 1 FROM enrollments WHERE user_id = $1 AND course_id = $2)"#,
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?;

        let final_assessments = assessments
            .iter()
            .filter(|a| a.is_course_final())
            .map(AssessmentSummary::from)
            .collect();

        let units = units
            .into_iter()
            .map(|unit| UnitDetail {
                blocks: blocks
                    .iter()
                    .filter(|b| b.unit_id == unit.unit_id)
                    .cloned()
                    .collect(),
                assessments: assessments
                    .iter()
                    .filter(|a| a.unit_id == Some(unit.unit_id))
                    .map(AssessmentSummary::from)
                    .collect(),
                unit,
            })
            .collect();

        Ok(CourseDetail {
            course,
            units,
            final_assessments,
            enrolled,
        })
    }

    pub async fn course_units(&self, course_id: Uuid) -> Result<Vec<CourseUnit>> {
        let rows = sqlx::query_as::<_, CourseUnit>(
            r#"SELECT cu.course_id, cu.unit_id, u.title, u.description, cu.position
               FROM course_units cu JOIN units u ON u.id = cu.unit_id
               WHERE cu.course_id = $1
               ORDER BY cu.position, u.title"#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn assessments_for_course(&self, course_id: Uuid) -> Result<Vec<Assessment>> {
        let rows = sqlx::query_as::<_, Assessment>(
            r#"SELECT * FROM assessments WHERE course_id = $1 ORDER BY created_at"#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn unit_detail(&self, unit_id: Uuid) -> Result<(Unit, Vec<LearningBlock>, Vec<AssessmentSummary>)> {
        let unit = self.get_unit(unit_id).await?;
        let blocks = sqlx::query_as::<_, LearningBlock>(
            r#"SELECT * FROM learning_blocks WHERE unit_id = $1 ORDER BY position, created_at"#,
        )
        .bind(unit_id)
        .fetch_all(&self.pool)
        .await?;
        let assessments = sqlx::query_as::<_, Assessment>(
            r#"SELECT * FROM assessments WHERE unit_id = $1 ORDER BY created_at"#,
        )
        .bind(unit_id)
        .fetch_all(&self.pool)
        .await?;
        Ok((unit, blocks, assessments.iter().map(AssessmentSummary::from).collect()))
    }

    pub async fn enroll(&self, user_id: Uuid, course_id: Uuid) -> Result<EnrollResponse> {
        let course = self.get_course(course_id).await?;
        if !course.is_published {
            return Err(Error::NotFound("Course not found".to_string()));
        }
        sqlx::query(
            r#"INSERT INTO enrollments (user_id, course_id) VALUES ($1, $2)
               ON CONFLICT (user_id, course_id) DO NOTHING"#,
        )
        .bind(user_id)
        .bind(course_id)
        .execute(&self.pool)
        .await?;

        let enrollment = sqlx::query_as::<_, Enrollment>(
            r#"SELECT * FROM enrollments WHERE user_id = $1 AND course_id = $2"#,
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(%user_id, %course_id, "enrolled");
        Ok(EnrollResponse {
            course_id,
            enrolled: true,
            enrolled_at: enrollment.enrolled_at,
        })
    }

    // ---- admin: courses ----

    pub async fn create_course(&self, payload: CreateCoursePayload) -> Result<Course> {
        let course = sqlx::query_as::<_, Course>(
            r#"INSERT INTO courses (name, description, level, duration, module_id, is_published)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING *"#,
        )
        .bind(payload.name)
        .bind(payload.description)
        .bind(payload.level)
        .bind(payload.duration)
        .bind(payload.module_id)
        .bind(payload.is_published.unwrap_or(false))
        .fetch_one(&self.pool)
        .await?;
        Ok(course)
    }

    pub async fn update_course(&self, id: Uuid, payload: UpdateCoursePayload) -> Result<Course> {
        self.get_course(id).await?;
        let course = sqlx::query_as::<_, Course>(
            r#"UPDATE courses SET
                   name = COALESCE($2, name),
                   description = COALESCE($3, description),
                   level = COALESCE($4, level),
                   duration = COALESCE($5, duration),
                   module_id = COALESCE($6, module_id),
                   is_published = COALESCE($7, is_published),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(payload.name)
        .bind(payload.description)
        .bind(payload.level)
        .bind(payload.duration)
        .bind(payload.module_id)
        .bind(payload.is_published)
        .fetch_one(&self.pool)
        .await?;
        Ok(course)
    }

    pub async fn delete_course(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(r#"DELETE FROM courses WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("Course not found".to_string()));
        }
        Ok(())
    }

    // ---- admin: units ----

    pub async fn get_unit(&self, id: Uuid) -> Result<Unit> {
        let unit = sqlx::query_as::<_, Unit>(r#"SELECT * FROM units WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("Unit not found".to_string()))?;
        Ok(unit)
    }

    pub async fn create_unit(&self, payload: CreateUnitPayload) -> Result<Unit> {
        let unit = sqlx::query_as::<_, Unit>(
            r#"INSERT INTO units (title, description) VALUES ($1, $2) RETURNING *"#,
        )
        .bind(payload.title)
        .bind(payload.description)
        .fetch_one(&self.pool)
        .await?;
        Ok(unit)
    }

    pub async fn update_unit(&self, id: Uuid, payload: UpdateUnitPayload) -> Result<Unit> {
        self.get_unit(id).await?;
        let unit = sqlx::query_as::<_, Unit>(
            r#"UPDATE units SET
                   title = COALESCE($2, title),
                   description = COALESCE($3, description),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(payload.title)
        .bind(payload.description)
        .fetch_one(&self.pool)
        .await?;
        Ok(unit)
    }

    pub async fn delete_unit(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(r#"DELETE FROM units WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("Unit not found".to_string()));
        }
        Ok(())
    }

    /// Places a unit in a course; re-attaching only moves it.
    pub async fn attach_unit(&self, course_id: Uuid, unit_id: Uuid, position: i32) -> Result<Vec<CourseUnit>> {
        self.get_course(course_id).await?;
        self.get_unit(unit_id).await?;
        sqlx::query(
            r#"INSERT INTO course_units (course_id, unit_id, position) VALUES ($1, $2, $3)
               ON CONFLICT (course_id, unit_id) DO UPDATE SET position = EXCLUDED.position"#,
        )
        .bind(course_id)
        .bind(unit_id)
        .bind(position)
        .execute(&self.pool)
        .await?;
        self.course_units(course_id).await
    }

    pub async fn detach_unit(&self, course_id: Uuid, unit_id: Uuid) -> Result<()> {
        let result = sqlx::query(r#"DELETE FROM course_units WHERE course_id = $1 AND unit_id = $2"#)
            .bind(course_id)
            .bind(unit_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("Unit is not part of this course".to_string()));
        }
        Ok(())
    }

    // ---- admin: learning blocks ----

    pub async fn get_block(&self, id: Uuid) -> Result<LearningBlock> {
        let block = sqlx::query_as::<_, LearningBlock>(r#"SELECT * FROM learning_blocks WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("Learning block not found".to_string()))?;
        Ok(block)
    }

    pub async fn create_block(&self, payload: CreateBlockPayload) -> Result<LearningBlock> {
        self.get_unit(payload.unit_id).await?;
        let block = sqlx::query_as::<_, LearningBlock>(
            r#"INSERT INTO learning_blocks (unit_id, title, content_type, content, media_url, position, xp_reward)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(payload.unit_id)
        .bind(payload.title)
        .bind(payload.content_type)
        .bind(payload.content)
        .bind(payload.media_url)
        .bind(payload.position.unwrap_or(0))
        .bind(payload.xp_reward.unwrap_or(10))
        .fetch_one(&self.pool)
        .await?;
        Ok(block)
    }

    pub async fn update_block(&self, id: Uuid, payload: UpdateBlockPayload) -> Result<LearningBlock> {
        self.get_block(id).await?;
        let block = sqlx::query_as::<_, LearningBlock>(
            r#"UPDATE learning_blocks SET
                   title = COALESCE($2, title),
                   content_type = COALESCE($3, content_type),
                   content = COALESCE($4, content),
                   media_url = COALESCE($5, media_url),
                   position = COALESCE($6, position),
                   xp_reward = COALESCE($7, xp_reward),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(payload.title)
        .bind(payload.content_type)
        .bind(payload.content)
        .bind(payload.media_url)
        .bind(payload.position)
        .bind(payload.xp_reward)
        .fetch_one(&self.pool)
        .await?;
        Ok(block)
    }

    pub async fn delete_block(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(r#"DELETE FROM learning_blocks WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("Learning block not found".to_string()));
        }
        Ok(())
    }

    // ---- admin: assessments ----

    pub async fn get_assessment(&self, id: Uuid) -> Result<Assessment> {
        let assessment = sqlx::query_as::<_, Assessment>(r#"SELECT * FROM assessments WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound("Assessment not found".to_string()))?;
        Ok(assessment)
    }

    pub async fn create_assessment(&self, payload: CreateAssessmentPayload) -> Result<Assessment> {
        validate_questions(&payload.questions)?;
        self.get_course(payload.course_id).await?;
        if let Some(unit_id) = payload.unit_id {
            self.get_unit(unit_id).await?;
        }
        let assessment = sqlx::query_as::<_, Assessment>(
            r#"INSERT INTO assessments
                   (course_id, unit_id, title, description, placement, passing_score,
                    time_limit_minutes, max_retakes, has_certificate, certificate_template_id,
                    questions, xp_reward)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               RETURNING *"#,
        )
        .bind(payload.course_id)
        .bind(payload.unit_id)
        .bind(payload.title)
        .bind(payload.description)
        .bind(payload.placement)
        .bind(payload.passing_score)
        .bind(payload.time_limit_minutes)
        .bind(payload.max_retakes)
        .bind(payload.has_certificate.unwrap_or(false))
        .bind(payload.certificate_template_id)
        .bind(json!(payload.questions))
        .bind(payload.xp_reward.unwrap_or(50))
        .fetch_one(&self.pool)
        .await?;
        Ok(assessment)
    }

    pub async fn update_assessment(&self, id: Uuid, payload: UpdateAssessmentPayload) -> Result<Assessment> {
        self.get_assessment(id).await?;
        if let Some(questions) = &payload.questions {
            validate_questions(questions)?;
        }
        let assessment = sqlx::query_as::<_, Assessment>(
            r#"UPDATE assessments SET
                   unit_id = COALESCE($2, unit_id),
                   title = COALESCE($3, title),
                   description = COALESCE($4, description),
                   placement = COALESCE($5, placement),
                   passing_score = COALESCE($6, passing_score),
                   time_limit_minutes = COALESCE($7, time_limit_minutes),
                   max_retakes = COALESCE($8, max_retakes),
                   has_certificate = COALESCE($9, has_certificate),
                   certificate_template_id = COALESCE($10, certificate_template_id),
                   questions = COALESCE($11, questions),
                   xp_reward = COALESCE($12, xp_reward),
                   updated_at = NOW()
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(payload.unit_id)
        .bind(payload.title)
        .bind(payload.description)
        .bind(payload.placement)
        .bind(payload.passing_score)
        .bind(payload.time_limit_minutes)
        .bind(payload.max_retakes)
        .bind(payload.has_certificate)
        .bind(payload.certificate_template_id)
        .bind(payload.questions.map(|q| json!(q)))
        .bind(payload.xp_reward)
        .fetch_one(&self.pool)
        .await?;
        Ok(assessment)
    }

    pub async fn delete_assessment(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(r#"DELETE FROM assessments WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("Assessment not found".to_string()));
        }
        Ok(())
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats> {
        let row: (i64, i64, i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"SELECT
                (SELECT COUNT(*) FROM users),
                (SELECT COUNT(*) FROM users WHERE is_active),
                (SELECT COUNT(*) FROM courses),
                (SELECT COUNT(*) FROM courses WHERE is_published),
                (SELECT COUNT(*) FROM enrollments),
                (SELECT COUNT(*) FROM enrollments WHERE completed_at IS NOT NULL),
                (SELECT COUNT(*) FROM assessment_attempts WHERE status = 'completed'),
                (SELECT COUNT(*) FROM assessment_attempts WHERE status = 'completed' AND passed),
                (SELECT COUNT(*) FROM certificates)"#,
        )
        .fetch_one(&self.pool)
        .await?;
        let (users, active_users, courses, published_courses, enrollments, completed_enrollments, attempts, passed_attempts, certificates) = row;

        let pass_rate = if attempts > 0 {
            ((passed_attempts as f64 / attempts as f64) * 10000.0).round() / 100.0
        } else {
            0.0
        };

        Ok(DashboardStats {
            users,
            active_users,
            courses,
            published_courses,
            enrollments,
            completed_enrollments,
            attempts,
            passed_attempts,
            pass_rate,
            certificates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::question::QuestionType;
    use serde_json::json;

    fn q(id: i32, question_type: QuestionType, correct: serde_json::Value) -> Question {
        Question {
            id,
            question_type,
            question: "?".into(),
            points: 1,
            options: vec!["a".into(), "b".into(), "c".into()],
            correct_answer: correct,
            explanation: None,
        }
    }

    #[test]
    fn accepts_well_formed_questions() {
        let questions = vec![
            q(1, QuestionType::MultipleChoice, json!(2)),
            q(2, QuestionType::MultiSelect, json!([0, 1])),
            q(3, QuestionType::TrueFalse, json!(true)),
        ];
        assert!(validate_questions(&questions).is_ok());
    }

    #[test]
    fn rejects_bad_question_sets() {
        assert!(validate_questions(&[q(1, QuestionType::MultipleChoice, json!(3))]).is_err());
        assert!(validate_questions(&[q(1, QuestionType::MultiSelect, json!([]))]).is_err());
        assert!(validate_questions(&[q(1, QuestionType::TrueFalse, json!("yes"))]).is_err());
        assert!(validate_questions(&[
            q(1, QuestionType::TrueFalse, json!(true)),
            q(1, QuestionType::TrueFalse, json!(false)),
        ])
        .is_err());
    }
}
