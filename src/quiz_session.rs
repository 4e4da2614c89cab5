use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::{Quiz, QuizAnswerRecord, SessionAttempt};

/// Final score derived from a session's attempts log. Each question is
/// counted once using its most recent attempt only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionScore {
    pub correct: i32,
    pub total: i32,
    pub percentage: i32,
    pub passed: bool,
}

/// In-memory quiz progress for one user's run through a quiz. Holds no
/// I/O and never fails: invalid operations are silent no-ops, matching
/// interactive-UI expectations.
#[derive(Debug, Clone, Serialize)]
pub struct QuizSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub quiz: Quiz,
    pub current_index: usize,
    pub selected_answer_ids: HashSet<Uuid>,
    pub attempts: Vec<SessionAttempt>,
    pub feedback_shown: bool,
    pub completed: bool,
    pub started_at: DateTime<Utc>,
}

impl QuizSession {
    pub fn new(user_id: Uuid, quiz: Quiz, now: DateTime<Utc>) -> Self {
        QuizSession {
            id: Uuid::new_v4(),
            user_id,
            quiz,
            current_index: 0,
            selected_answer_ids: HashSet::new(),
            attempts: Vec::new(),
            feedback_shown: false,
            completed: false,
            started_at: now,
        }
    }

    pub fn current_question(&self) -> Option<&crate::models::Question> {
        self.quiz.questions.get(self.current_index)
    }

    /// Toggle (multi-select) or replace (single-select) the current
    /// selection. Ignored while feedback for the active question is on
    /// screen, after completion, or for an answer that does not belong
    /// to the active question.
    pub fn select_answer(&mut self, answer_id: Uuid) {
        if self.feedback_shown || self.completed {
            return;
        }
        let (belongs, multi_select) = match self.current_question() {
            Some(q) => (
                q.answers.iter().any(|a| a.id == answer_id),
                q.is_multi_select(),
            ),
            None => return,
        };
        if !belongs {
            return;
        }
        if multi_select {
            if !self.selected_answer_ids.remove(&answer_id) {
                self.selected_answer_ids.insert(answer_id);
            }
        } else {
            self.selected_answer_ids.clear();
            self.selected_answer_ids.insert(answer_id);
        }
    }

    /// Grade the current selection by exact set equality against the
    /// question's correct-answer set and append it to the attempts
    /// log. Retries on the same question append additional entries.
    pub fn submit_answer(&mut self) {
        if self.feedback_shown || self.completed || self.selected_answer_ids.is_empty() {
            return;
        }
        let (question_id, correct_ids) = match self.current_question() {
            Some(q) => (q.id, q.correct_answer_ids()),
            None => return,
        };
        let is_correct = self.selected_answer_ids == correct_ids;
        let mut selected: Vec<Uuid> = self.selected_answer_ids.iter().copied().collect();
        selected.sort();
        self.attempts.push(SessionAttempt {
            question_id,
            selected_answer_ids: selected,
            is_correct,
        });
        self.feedback_shown = true;
    }

    /// Move on after feedback. A wrong latest attempt keeps the same
    /// question active so the user must retry until correct; a right
    /// one advances, or completes the session on the last question.
    pub fn proceed(&mut self) {
        if !self.feedback_shown || self.completed {
            return;
        }
        let last_correct = self
            .current_question()
            .and_then(|q| self.attempts.iter().rev().find(|a| a.question_id == q.id))
            .map(|a| a.is_correct)
            .unwrap_or(false);

        self.selected_answer_ids.clear();
        self.feedback_shown = false;

        if !last_correct {
            return;
        }
        if self.current_index + 1 < self.quiz.questions.len() {
            self.current_index += 1;
        } else {
            self.completed = true;
        }
    }

    /// Back to a pristine run with a fresh session identity.
    pub fn restart(&mut self, now: DateTime<Utc>) {
        self.id = Uuid::new_v4();
        self.current_index = 0;
        self.selected_answer_ids.clear();
        self.attempts.clear();
        self.feedback_shown = false;
        self.completed = false;
        self.started_at = now;
    }

    pub fn progress_percentage(&self) -> i32 {
        let total = self.quiz.questions.len();
        if total == 0 {
            return 0;
        }
        let done = self.current_index + usize::from(self.feedback_shown);
        ((100.0 * done as f64 / total as f64).round()) as i32
    }

    pub fn final_score(&self) -> SessionScore {
        let total = self.quiz.questions.len() as i32;
        let mut latest: HashMap<Uuid, bool> = HashMap::new();
        for attempt in &self.attempts {
            latest.insert(attempt.question_id, attempt.is_correct);
        }
        let correct = latest.values().filter(|c| **c).count() as i32;
        let percentage = if total == 0 {
            0
        } else {
            ((100.0 * correct as f64 / total as f64).round()) as i32
        };
        SessionScore {
            correct,
            total,
            percentage,
            passed: total > 0 && percentage == 100,
        }
    }

    /// Per-question answer records for persistence: the attempts log
    /// folded down to the last attempt per question, in attempt order.
    pub fn answer_records(&self) -> Vec<QuizAnswerRecord> {
        let mut by_question: HashMap<Uuid, QuizAnswerRecord> = HashMap::new();
        let mut order: Vec<Uuid> = Vec::new();
        for attempt in &self.attempts {
            if !by_question.contains_key(&attempt.question_id) {
                order.push(attempt.question_id);
            }
            by_question.insert(
                attempt.question_id,
                QuizAnswerRecord {
                    question_id: attempt.question_id,
                    selected_answer_ids: attempt.selected_answer_ids.clone(),
                    is_correct: attempt.is_correct,
                    points: i32::from(attempt.is_correct),
                },
            );
        }
        order
            .into_iter()
            .filter_map(|id| by_question.remove(&id))
            .collect()
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds().max(0)
    }
}
