use std::collections::{BTreeMap, BTreeSet};

use crate::models::question::{Question, QuestionType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradedAnswer {
    pub question_id: i32,
    pub question_text: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub given_answer: JsonValue,
    pub correct_answer: JsonValue,
    pub points_earned: i32,
    pub max_points: i32,
    pub is_correct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradeReport {
    pub earned_points: i32,
    pub max_points: i32,
    pub percentage: f64,
    pub passed: bool,
    pub graded: Vec<GradedAnswer>,
}

pub struct GradingService;

impl GradingService {
    pub fn grade(
        questions: &[Question],
        answers: &BTreeMap<i32, JsonValue>,
        passing_score: i32,
    ) -> GradeReport {
        let mut max_points: i32 = 0;
        let mut earned_points: i32 = 0;
        let mut graded = Vec::with_capacity(questions.len());

        for q in questions {
            max_points += q.points;
            let given = answers.get(&q.id).cloned().unwrap_or(JsonValue::Null);

            let is_correct = match q.question_type {
                QuestionType::MultipleChoice => {
                    selected_index(&given).is_some()
                        && selected_index(&given) == q.correct_answer.as_i64()
                }
                QuestionType::MultiSelect => match (index_set(&given), index_set(&q.correct_answer)) {
                    (Some(given_set), Some(correct_set)) => given_set == correct_set,
                    _ => false,
                },
                QuestionType::TrueFalse => {
                    as_bool(&given).is_some() && as_bool(&given) == as_bool(&q.correct_answer)
                }
            };

            let points_earned = if is_correct { q.points } else { 0 };
            earned_points += points_earned;

            graded.push(GradedAnswer {
                question_id: q.id,
                question_text: q.question.clone(),
                question_type: q.question_type,
                given_answer: describe_answer(q, &given),
                correct_answer: describe_answer(q, &q.correct_answer),
                points_earned,
                max_points: q.points,
                is_correct,
            });
        }

        let percentage = if max_points > 0 {
            let raw = f64::from(earned_points) / f64::from(max_points) * 100.0;
            (raw * 100.0).round() / 100.0
        } else {
            0.0
        };

        GradeReport {
            earned_points,
            max_points,
            percentage,
            passed: percentage >= f64::from(passing_score),
            graded,
        }
    }
}

fn selected_index(value: &JsonValue) -> Option<i64> {
    value.as_i64().or_else(|| {
        if value.is_object() {
            value.get("selected").and_then(|v| v.as_i64())
        } else {
            None
        }
    })
}

fn index_set(value: &JsonValue) -> Option<BTreeSet<i64>> {
    let items = value
        .as_array()
        .or_else(|| value.get("selected").and_then(|v| v.as_array()))?;
    items.iter().map(|v| v.as_i64()).collect()
}

fn as_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// Resolves option indices to their text so the breakdown reads on its own.
fn describe_answer(q: &Question, value: &JsonValue) -> JsonValue {
    match q.question_type {
        QuestionType::MultipleChoice => selected_index(value)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| q.options.get(i))
            .map(|opt| json!(opt))
            .unwrap_or_else(|| value.clone()),
        QuestionType::MultiSelect => match index_set(value) {
            Some(set) => JsonValue::Array(
                set.into_iter()
                    .filter_map(|i| usize::try_from(i).ok())
                    .filter_map(|i| q.options.get(i))
                    .map(|opt| json!(opt))
                    .collect(),
            ),
            None => value.clone(),
        },
        QuestionType::TrueFalse => as_bool(value).map(|b| json!(b)).unwrap_or(JsonValue::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: i32, question_type: QuestionType, correct: JsonValue, points: i32) -> Question {
        Question {
            id,
            question_type,
            question: format!("Q{}", id),
            points,
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            correct_answer: correct,
            explanation: None,
        }
    }

    #[test]
    fn grades_each_question_type() {
        let questions = vec![
            question(1, QuestionType::MultipleChoice, json!(2), 2),
            question(2, QuestionType::MultiSelect, json!([0, 3]), 1),
            question(3, QuestionType::TrueFalse, json!(false), 1),
        ];
        let mut answers = BTreeMap::new();
        answers.insert(1, json!({"selected": 2}));
        answers.insert(2, json!([3, 0]));
        answers.insert(3, json!("false"));

        let report = GradingService::grade(&questions, &answers, 70);
        assert_eq!(report.earned_points, 4);
        assert_eq!(report.max_points, 4);
        assert_eq!(report.percentage, 100.0);
        assert!(report.passed);
        assert_eq!(report.graded[0].given_answer, json!("c"));
        assert_eq!(report.graded[1].correct_answer, json!(["a", "d"]));
    }

    #[test]
    fn missing_answers_score_zero() {
        let questions = vec![
            question(1, QuestionType::MultipleChoice, json!(0), 1),
            question(2, QuestionType::TrueFalse, json!(true), 2),
        ];
        let mut answers = BTreeMap::new();
        answers.insert(1, json!(0));

        let report = GradingService::grade(&questions, &answers, 50);
        assert_eq!(report.earned_points, 1);
        assert_eq!(report.percentage, 33.33);
        assert!(!report.passed);
        assert!(!report.graded[1].is_correct);
    }

    #[test]
    fn partial_multi_select_is_wrong() {
        let questions = vec![question(1, QuestionType::MultiSelect, json!([0, 1]), 1)];
        let mut answers = BTreeMap::new();
        answers.insert(1, json!([0]));
        let report = GradingService::grade(&questions, &answers, 0);
        assert_eq!(report.earned_points, 0);
        // 0% still meets a zero passing score.
        assert!(report.passed);
    }

    #[test]
    fn empty_assessment_is_zero_percent() {
        let report = GradingService::grade(&[], &BTreeMap::new(), 70);
        assert_eq!(report.percentage, 0.0);
        assert!(!report.passed);
    }
}
