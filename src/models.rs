use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// A quiz as authored by the content team. The core never mutates
/// quizzes; they are seeded alongside podcast episodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub episode_id: Option<Uuid>,
    pub pass_percentage: i32,
    pub created_at: DateTime<Utc>,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub prompt: String,
    pub explanation: Option<String>,
    pub learning_outcome: Option<String>,
    pub answers: Vec<Answer>, // display-sorted by letter
}

impl Question {
    pub fn correct_answer_ids(&self) -> HashSet<Uuid> {
        self.answers
            .iter()
            .filter(|a| a.is_correct)
            .map(|a| a.id)
            .collect()
    }

    /// Multi-select is derived from having more than one correct answer.
    pub fn is_multi_select(&self) -> bool {
        self.answers.iter().filter(|a| a.is_correct).count() > 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub id: Uuid,
    pub letter: String,
    pub text: String,
    pub is_correct: bool,
}

/// A podcast episode reference, used for CPD-hour estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub title: String,
    pub duration_seconds: i64,
}

/// Public-facing quiz shape with the answer key stripped out.
#[derive(Debug, Clone, Serialize)]
pub struct QuizView {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub episode_id: Option<Uuid>,
    pub pass_percentage: i32,
    pub questions: Vec<QuestionView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionView {
    pub id: Uuid,
    pub prompt: String,
    pub learning_outcome: Option<String>,
    pub multi_select: bool,
    pub answers: Vec<AnswerView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerView {
    pub id: Uuid,
    pub letter: String,
    pub text: String,
}

impl From<&Quiz> for QuizView {
    fn from(quiz: &Quiz) -> Self {
        QuizView {
            id: quiz.id,
            title: quiz.title.clone(),
            description: quiz.description.clone(),
            episode_id: quiz.episode_id,
            pass_percentage: quiz.pass_percentage,
            questions: quiz
                .questions
                .iter()
                .map(|q| QuestionView {
                    id: q.id,
                    prompt: q.prompt.clone(),
                    learning_outcome: q.learning_outcome.clone(),
                    multi_select: q.is_multi_select(),
                    answers: q
                        .answers
                        .iter()
                        .map(|a| AnswerView {
                            id: a.id,
                            letter: a.letter.clone(),
                            text: a.text.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// One graded submission of a single question within a session. The
/// session keeps every attempt; retries append rather than overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAttempt {
    pub question_id: Uuid,
    pub selected_answer_ids: Vec<Uuid>,
    pub is_correct: bool,
}

/// Per-question answer record carried inside a persisted completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizAnswerRecord {
    pub question_id: Uuid,
    pub selected_answer_ids: Vec<Uuid>,
    pub is_correct: bool,
    pub points: i32,
}

/// A durable record of one graded quiz result. Immutable after
/// creation except for hard deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizCompletion {
    pub id: Uuid,
    pub user_id: Uuid,
    pub quiz_id: Uuid,
    pub episode_id: Option<Uuid>,
    pub score: i32,
    pub max_score: i32,
    pub percentage: i32,
    pub time_spent_seconds: i64,
    pub completed_at: DateTime<Utc>,
    pub answers: Vec<QuizAnswerRecord>,
    pub passed: bool,
    pub attempt_number: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeCategory {
    Completion,
    Score,
    Streak,
    Special,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Badge {
    pub id: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub earned_at: DateTime<Utc>,
    pub category: BadgeCategory,
}

/// Per-user progress rollup, updated incrementally on every persisted
/// completion. Badges are keyed by badge id so a badge can only ever
/// be held once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProgress {
    pub user_id: Uuid,
    pub total_completed: i32,
    pub total_passed: i32,
    pub total_score: i64,
    pub total_max_score: i64,
    pub average_score: i32,
    pub completion_rate: i32,
    pub total_time_seconds: i64,
    pub last_activity: DateTime<Utc>,
    pub badges: BTreeMap<String, Badge>,
}

/// Attempt-budget bookkeeping for one (user, quiz) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationLimits {
    pub user_id: Uuid,
    pub quiz_id: Uuid,
    pub attempts_used: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub reset_at: DateTime<Utc>,
}

/// The status payload returned by every attempt-status check and
/// carried by blocked-attempt errors so the caller can render
/// countdown messaging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStatus {
    pub can_attempt: bool,
    pub attempts_remaining: i32,
    pub total_attempts: i32,
    pub attempts_used: i32,
    pub next_attempt_available_at: Option<DateTime<Utc>>,
    pub reset_at: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitCompletionRequest {
    pub quiz_id: Uuid,
    pub episode_id: Option<Uuid>,
    pub answers: Vec<QuizAnswerRecord>,
    pub score: i32,
    pub max_score: i32,
    pub percentage: i32,
    pub time_spent_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordAttemptRequest {
    pub passed: bool,
}

/// Display-only statistics derived from the full completion history on
/// each read. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub streak_days: i32,
    pub cpd_hours: f64,
    pub achievements: Vec<Achievement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Achievement {
    pub id: String,
    pub name: String,
    pub description: String,
}
