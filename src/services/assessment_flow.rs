//! Assessment-taking state machine.
//!
//! `not_started -> in_progress -> submitting -> completed`, with `unavailable`
//! as a terminal state once every allowed attempt has been used.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::utils::time::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    NotStarted,
    InProgress,
    Submitting,
    Completed,
    Unavailable,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::NotStarted => "not_started",
            FlowState::InProgress => "in_progress",
            FlowState::Submitting => "submitting",
            FlowState::Completed => "completed",
            FlowState::Unavailable => "unavailable",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not_started" => Some(FlowState::NotStarted),
            "in_progress" => Some(FlowState::InProgress),
            "submitting" => Some(FlowState::Submitting),
            "completed" => Some(FlowState::Completed),
            "unavailable" => Some(FlowState::Unavailable),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlowError {
    #[error("no attempts remaining")]
    NoAttemptsRemaining,
    #[error("cannot {action} while {from}")]
    InvalidTransition { from: FlowState, action: &'static str },
    #[error("question {0} is not part of this assessment")]
    UnknownQuestion(i32),
    #[error("{answered} of {total} questions answered")]
    Incomplete { answered: usize, total: usize },
}

impl From<FlowError> for Error {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::NoAttemptsRemaining => Error::Forbidden(err.to_string()),
            FlowError::InvalidTransition { .. } => Error::Conflict(err.to_string()),
            FlowError::UnknownQuestion(_) | FlowError::Incomplete { .. } => {
                Error::BadRequest(err.to_string())
            }
        }
    }
}

/// What the server reports back when a submission is acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub passed: bool,
    pub score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub certificate_issued: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "index", rename_all = "snake_case")]
pub enum Navigation {
    Next,
    Previous,
    GoTo(usize),
}

/// Remaining attempts, `None` meaning unlimited.
pub fn attempts_remaining(max_retakes: Option<i32>, attempts_used: i64) -> Option<i64> {
    max_retakes.map(|max| (i64::from(max) - attempts_used).max(0))
}

#[derive(Debug, Clone)]
pub struct AssessmentSession {
    state: FlowState,
    question_ids: Vec<i32>,
    answers: BTreeMap<i32, JsonValue>,
    current_index: usize,
    attempts_used: i64,
    max_retakes: Option<i32>,
    deadline: Option<DateTime<Utc>>,
    forced: bool,
    result: Option<SubmissionResult>,
}

impl AssessmentSession {
    pub fn new(question_ids: Vec<i32>, attempts_used: i64, max_retakes: Option<i32>) -> Self {
        let mut session = Self {
            state: FlowState::NotStarted,
            question_ids,
            answers: BTreeMap::new(),
            current_index: 0,
            attempts_used,
            max_retakes,
            deadline: None,
            forced: false,
            result: None,
        };
        if session.attempts_remaining() == Some(0) {
            session.state = FlowState::Unavailable;
        }
        session
    }

    /// Rebuilds an in-flight session from its persisted parts.
    pub fn resume(
        question_ids: Vec<i32>,
        state: FlowState,
        answers: BTreeMap<i32, JsonValue>,
        current_index: usize,
        deadline: DateTime<Utc>,
        attempts_used: i64,
        max_retakes: Option<i32>,
    ) -> Self {
        let last = question_ids.len().saturating_sub(1);
        Self {
            state,
            question_ids,
            answers,
            current_index: current_index.min(last),
            attempts_used,
            max_retakes,
            deadline: Some(deadline),
            forced: false,
            result: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn attempts_used(&self) -> i64 {
        self.attempts_used
    }

    pub fn attempts_remaining(&self) -> Option<i64> {
        attempts_remaining(self.max_retakes, self.attempts_used)
    }

    pub fn can_start(&self) -> bool {
        self.state == FlowState::NotStarted && self.attempts_remaining() != Some(0)
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn answers(&self) -> &BTreeMap<i32, JsonValue> {
        &self.answers
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_question_id(&self) -> Option<i32> {
        self.question_ids.get(self.current_index).copied()
    }

    pub fn total_questions(&self) -> usize {
        self.question_ids.len()
    }

    pub fn answered_count(&self) -> usize {
        self.question_ids
            .iter()
            .filter(|id| self.answers.contains_key(id))
            .count()
    }

    pub fn all_answered(&self) -> bool {
        self.answered_count() == self.question_ids.len()
    }

    pub fn was_forced(&self) -> bool {
        self.forced
    }

    pub fn result(&self) -> Option<&SubmissionResult> {
        self.result.as_ref()
    }

    pub fn start(
        &mut self,
        clock: &dyn Clock,
        time_limit: Duration,
    ) -> Result<DateTime<Utc>, FlowError> {
        if self.attempts_remaining() == Some(0) {
            self.state = FlowState::Unavailable;
            return Err(FlowError::NoAttemptsRemaining);
        }
        self.expect(FlowState::NotStarted, "start")?;
        let deadline = clock.now() + time_limit;
        self.state = FlowState::InProgress;
        self.deadline = Some(deadline);
        self.current_index = 0;
        self.answers.clear();
        Ok(deadline)
    }

    pub fn answer(&mut self, question_id: i32, value: JsonValue) -> Result<(), FlowError> {
        self.expect(FlowState::InProgress, "answer")?;
        if !self.question_ids.contains(&question_id) {
            return Err(FlowError::UnknownQuestion(question_id));
        }
        self.answers.insert(question_id, value);
        Ok(())
    }

    pub fn navigate(&mut self, nav: Navigation) -> Result<usize, FlowError> {
        self.expect(FlowState::InProgress, "navigate")?;
        let last = self.question_ids.len().saturating_sub(1);
        self.current_index = match nav {
            Navigation::Next => (self.current_index + 1).min(last),
            Navigation::Previous => self.current_index.saturating_sub(1),
            Navigation::GoTo(index) => index.min(last),
        };
        Ok(self.current_index)
    }

    pub fn time_remaining(&self, clock: &dyn Clock) -> Duration {
        match (self.state, self.deadline) {
            (FlowState::InProgress, Some(deadline)) => {
                (deadline - clock.now()).max(Duration::zero())
            }
            _ => Duration::zero(),
        }
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        self.state == FlowState::InProgress
            && self.deadline.map(|d| clock.now() >= d).unwrap_or(false)
    }

    /// Learner-initiated submit; requires every question to be answered.
    pub fn submit(&mut self) -> Result<(), FlowError> {
        self.expect(FlowState::InProgress, "submit")?;
        if !self.all_answered() {
            return Err(FlowError::Incomplete {
                answered: self.answered_count(),
                total: self.question_ids.len(),
            });
        }
        self.state = FlowState::Submitting;
        Ok(())
    }

    /// Timer-driven submit with whatever answers exist. Returns `false` when the
    /// session already left `in_progress`, so repeated expiries are no-ops.
    pub fn force_submit(&mut self) -> bool {
        if self.state != FlowState::InProgress {
            return false;
        }
        self.state = FlowState::Submitting;
        self.forced = true;
        true
    }

    /// Forces submission if the deadline has passed.
    pub fn expire_if_due(&mut self, clock: &dyn Clock) -> bool {
        if self.is_expired(clock) {
            self.force_submit()
        } else {
            false
        }
    }

    pub fn acknowledge(&mut self, result: SubmissionResult) -> Result<(), FlowError> {
        self.expect(FlowState::Submitting, "acknowledge")?;
        self.state = FlowState::Completed;
        self.attempts_used += 1;
        self.result = Some(result);
        Ok(())
    }

    /// Next attempt after a completed one, or `unavailable` if none remain.
    pub fn next_attempt(&self) -> Self {
        Self::new(self.question_ids.clone(), self.attempts_used, self.max_retakes)
    }

    fn expect(&self, wanted: FlowState, action: &'static str) -> Result<(), FlowError> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(FlowError::InvalidTransition {
                from: self.state,
                action,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::MockClock;
    use chrono::TimeZone;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn clock_at(secs: i64) -> MockClock {
        let mut clock = MockClock::new();
        let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        clock.expect_now().return_const(at);
        clock
    }

    fn result(passed: bool) -> SubmissionResult {
        SubmissionResult {
            passed,
            score: 2.0,
            max_score: 3.0,
            percentage: 66.67,
            certificate_issued: false,
        }
    }

    #[test]
    fn happy_path_walks_every_state() {
        let mut session = AssessmentSession::new(vec![1, 2], 0, Some(3));
        assert_eq!(session.state(), FlowState::NotStarted);
        assert!(session.can_start());

        session.start(&clock_at(0), Duration::minutes(10)).unwrap();
        assert_eq!(session.state(), FlowState::InProgress);

        session.answer(1, json!(0)).unwrap();
        assert_eq!(session.navigate(Navigation::Next).unwrap(), 1);
        session.answer(2, json!(true)).unwrap();
        assert_ok!(session.submit());
        assert_eq!(session.state(), FlowState::Submitting);

        assert_ok!(session.acknowledge(result(true)));
        assert_eq!(session.state(), FlowState::Completed);
        assert_eq!(session.attempts_used(), 1);
        assert_eq!(session.attempts_remaining(), Some(2));
        assert!(session.result().unwrap().passed);
    }

    #[test]
    fn submit_requires_all_answers() {
        let mut session = AssessmentSession::new(vec![1, 2, 3], 0, None);
        session.start(&clock_at(0), Duration::minutes(5)).unwrap();
        session.answer(2, json!(1)).unwrap();
        assert_eq!(
            session.submit(),
            Err(FlowError::Incomplete { answered: 1, total: 3 })
        );
        assert_eq!(session.state(), FlowState::InProgress);
    }

    #[test]
    fn answers_are_keyed_by_question_and_overwritten() {
        let mut session = AssessmentSession::new(vec![10, 20], 0, None);
        session.start(&clock_at(0), Duration::minutes(5)).unwrap();
        session.answer(10, json!(1)).unwrap();
        session.answer(10, json!(2)).unwrap();
        assert_eq!(session.answers().get(&10), Some(&json!(2)));
        assert_eq!(session.answered_count(), 1);
        assert_eq!(session.answer(99, json!(0)), Err(FlowError::UnknownQuestion(99)));
    }

    #[test]
    fn navigation_clamps_to_bounds() {
        let mut session = AssessmentSession::new(vec![1, 2, 3], 0, None);
        session.start(&clock_at(0), Duration::minutes(5)).unwrap();
        assert_eq!(session.navigate(Navigation::Previous).unwrap(), 0);
        assert_eq!(session.navigate(Navigation::GoTo(10)).unwrap(), 2);
        assert_eq!(session.navigate(Navigation::Next).unwrap(), 2);
        assert_eq!(session.current_question_id(), Some(3));
    }

    #[test]
    fn expiry_forces_submission_exactly_once() {
        let mut session = AssessmentSession::new(vec![1, 2], 0, Some(1));
        session.start(&clock_at(0), Duration::seconds(60)).unwrap();

        assert!(!session.expire_if_due(&clock_at(59)));
        assert_eq!(session.time_remaining(&clock_at(30)), Duration::seconds(30));

        assert!(session.expire_if_due(&clock_at(60)));
        assert!(session.was_forced());
        assert_eq!(session.state(), FlowState::Submitting);
        assert_eq!(session.answered_count(), 0);

        assert!(!session.expire_if_due(&clock_at(61)));
        assert!(!session.force_submit());
    }

    #[test]
    fn exhausted_attempts_make_session_unavailable() {
        let session = AssessmentSession::new(vec![1], 2, Some(2));
        assert_eq!(session.state(), FlowState::Unavailable);
        assert_eq!(session.attempts_remaining(), Some(0));
        assert!(!session.can_start());

        let mut session = session;
        assert_eq!(
            session.start(&clock_at(0), Duration::minutes(1)),
            Err(FlowError::NoAttemptsRemaining)
        );
    }

    #[test]
    fn last_attempt_leads_to_unavailable() {
        let mut session = AssessmentSession::new(vec![1], 0, Some(1));
        session.start(&clock_at(0), Duration::minutes(1)).unwrap();
        session.answer(1, json!(0)).unwrap();
        session.submit().unwrap();
        session.acknowledge(result(false)).unwrap();
        assert_eq!(session.next_attempt().state(), FlowState::Unavailable);
    }

    #[test]
    fn attempts_remaining_never_negative() {
        assert_eq!(attempts_remaining(Some(3), 1), Some(2));
        assert_eq!(attempts_remaining(Some(3), 5), Some(0));
        assert_eq!(attempts_remaining(None, 50), None);
        assert_eq!(attempts_remaining(Some(0), 0), Some(0));
    }

    #[test]
    fn actions_outside_in_progress_are_rejected() {
        let mut session = AssessmentSession::new(vec![1], 0, None);
        assert!(matches!(
            session.answer(1, json!(0)),
            Err(FlowError::InvalidTransition { from: FlowState::NotStarted, .. })
        ));
        assert_err!(session.acknowledge(result(true)));
        assert!(!session.force_submit());
    }

    #[test]
    fn navigation_parses_from_json() {
        let nav: Navigation = serde_json::from_value(json!({"direction": "go_to", "index": 4})).unwrap();
        assert_eq!(nav, Navigation::GoTo(4));
        let nav: Navigation = serde_json::from_value(json!({"direction": "next"})).unwrap();
        assert_eq!(nav, Navigation::Next);
    }
}
