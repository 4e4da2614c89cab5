use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::continuation_policy::ContinuationPolicy;
use crate::database::Database;
use crate::errors::ApiError;
use crate::models::{
    AttemptStatus, Quiz, QuizCompletion, SubmitCompletionRequest, UserProgress, UserStats,
};
use crate::progress;
use crate::{log_service_error, log_service_start, log_service_success};

/// Service coordinating the completion store, the continuation policy
/// and the progress rollup. Every clock-sensitive operation takes
/// `now` from the caller so tests control time.
#[derive(Clone)]
pub struct CompletionService {
    db: Database,
    policy: ContinuationPolicy,
}

impl CompletionService {
    pub fn new(db: Database, policy: ContinuationPolicy) -> Self {
        CompletionService { db, policy }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // Quiz reads
    pub async fn get_quiz(&self, quiz_id: Uuid) -> Result<Quiz, ApiError> {
        self.db
            .get_quiz(quiz_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Quiz {quiz_id}")))
    }

    pub async fn list_quizzes(&self) -> Result<Vec<Quiz>, ApiError> {
        Ok(self.db.list_quizzes().await?)
    }

    // Continuation policy
    /// Read-mostly status check. A check that lands after the reset
    /// window rewrites the limits row so the reset is durable.
    pub async fn attempt_status(
        &self,
        user_id: Uuid,
        quiz_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AttemptStatus, ApiError> {
        let limits = self.db.get_limits(user_id, quiz_id).await?;
        let decision = self.policy.evaluate(limits.as_ref(), now);
        if let Some(updated) = &decision.updated {
            self.db.upsert_limits(updated).await?;
        }
        Ok(decision.status)
    }

    /// Consume one attempt without storing a completion. Used when a
    /// failed run ends client-side before any result is submitted.
    pub async fn record_attempt(
        &self,
        user_id: Uuid,
        quiz_id: Uuid,
        passed: bool,
        now: DateTime<Utc>,
    ) -> Result<AttemptStatus, ApiError> {
        log_service_start!(
            "completion_service",
            "record_attempt",
            user_id = user_id,
            quiz_id = quiz_id
        );
        let limits = self.db.get_limits(user_id, quiz_id).await?;
        let updated = self
            .policy
            .record_attempt(limits, user_id, quiz_id, passed, now);
        self.db.upsert_limits(&updated).await?;
        Ok(self.policy.evaluate(Some(&updated), now).status)
    }

    /// Staff override: zero the budget and start a fresh window.
    pub async fn reset_attempts(
        &self,
        user_id: Uuid,
        quiz_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AttemptStatus, ApiError> {
        let reset = self.policy.reset_attempts(user_id, quiz_id, now);
        self.db.upsert_limits(&reset).await?;
        Ok(self.policy.evaluate(Some(&reset), now).status)
    }

    // Completion submission
    /// Validate, gate on the continuation policy, then persist inside
    /// one transaction. Only a strictly better percentage produces a
    /// new row; either way the attempt budget is spent. Returns the
    /// user's best stored completion for this quiz.
    pub async fn submit_completion(
        &self,
        user_id: Uuid,
        request: SubmitCompletionRequest,
        now: DateTime<Utc>,
    ) -> Result<QuizCompletion, ApiError> {
        log_service_start!(
            "completion_service",
            "submit_completion",
            user_id = user_id,
            quiz_id = request.quiz_id
        );

        let quiz = self.get_quiz(request.quiz_id).await?;
        validate_submission(&quiz, &request)?;

        let limits = self.db.get_limits(user_id, request.quiz_id).await?;
        let decision = self.policy.evaluate(limits.as_ref(), now);
        if !decision.status.can_attempt {
            log_service_error!(
                "completion_service",
                "submit_completion",
                user_id = user_id,
                error = decision.status.message
            );
            return Err(ApiError::PolicyDenied(decision.status));
        }
        // A status check that crossed the reset window rewrote the row;
        // the attempt below must build on that rewritten state.
        let limits = decision.updated.or(limits);

        let passed = request.percentage == 100;

        let mut tx = self.db.begin().await?;

        let best = self
            .db
            .best_completion_tx(&mut tx, user_id, request.quiz_id)
            .await?;
        let stored_attempts = self
            .db
            .count_completions_tx(&mut tx, user_id, request.quiz_id)
            .await?;

        let improved = best
            .as_ref()
            .map(|b| request.percentage > b.percentage)
            .unwrap_or(true);

        let result = match best {
            // Deduplicated resubmission: nothing stored, nothing rolled
            // up, but the attempt budget below is still spent.
            Some(existing) if !improved => existing,
            _ => {
                let completion = QuizCompletion {
                    id: Uuid::new_v4(),
                    user_id,
                    quiz_id: request.quiz_id,
                    episode_id: request.episode_id.or(quiz.episode_id),
                    score: request.score,
                    max_score: request.max_score,
                    percentage: request.percentage,
                    time_spent_seconds: request.time_spent_seconds,
                    completed_at: now,
                    answers: request.answers,
                    passed,
                    attempt_number: (stored_attempts + 1) as i32,
                };
                self.db.insert_completion_tx(&mut tx, &completion).await?;

                let mut rollup = self
                    .db
                    .get_progress_tx(&mut tx, user_id)
                    .await?
                    .unwrap_or_else(|| progress::new_progress(user_id, now));
                progress::apply_completion(&mut rollup, &completion);
                self.db.upsert_progress_tx(&mut tx, &rollup).await?;

                completion
            }
        };

        let updated_limits = self
            .policy
            .record_attempt(limits, user_id, request.quiz_id, passed, now);
        self.db.upsert_limits_tx(&mut tx, &updated_limits).await?;

        tx.commit().await.map_err(anyhow::Error::from)?;

        log_service_success!(
            "completion_service",
            "submit_completion",
            user_id = user_id,
            if improved {
                "completion stored"
            } else {
                "resubmission deduplicated, best score kept"
            }
        );
        Ok(result)
    }

    // Completion reads
    pub async fn best_score(
        &self,
        user_id: Uuid,
        quiz_id: Uuid,
    ) -> Result<Option<QuizCompletion>, ApiError> {
        Ok(self.db.best_completion(user_id, quiz_id).await?)
    }

    pub async fn completion_history(&self, user_id: Uuid) -> Result<Vec<QuizCompletion>, ApiError> {
        Ok(self.db.completions_for_user(user_id).await?)
    }

    pub async fn quiz_completions(&self, quiz_id: Uuid) -> Result<Vec<QuizCompletion>, ApiError> {
        Ok(self.db.completions_for_quiz(quiz_id).await?)
    }

    pub async fn has_completed(&self, user_id: Uuid, quiz_id: Uuid) -> Result<bool, ApiError> {
        Ok(self.db.best_completion(user_id, quiz_id).await?.is_some())
    }

    pub async fn has_passed(&self, user_id: Uuid, quiz_id: Uuid) -> Result<bool, ApiError> {
        Ok(self
            .db
            .best_completion(user_id, quiz_id)
            .await?
            .map(|c| c.passed)
            .unwrap_or(false))
    }

    /// Count of persisted completions. Diverges from the policy's
    /// attempts_used counter because deduplicated resubmissions spend
    /// budget without storing a row.
    pub async fn persisted_attempt_count(
        &self,
        user_id: Uuid,
        quiz_id: Uuid,
    ) -> Result<i64, ApiError> {
        Ok(self.db.count_completions(user_id, quiz_id).await?)
    }

    /// Hard delete. The progress rollup is left untouched.
    pub async fn delete_completion(&self, completion_id: Uuid) -> Result<(), ApiError> {
        if self.db.delete_completion(completion_id).await? {
            Ok(())
        } else {
            Err(ApiError::NotFound(format!("Completion {completion_id}")))
        }
    }

    // Aggregates
    pub async fn progress(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<UserProgress, ApiError> {
        Ok(self
            .db
            .get_progress(user_id)
            .await?
            .unwrap_or_else(|| progress::new_progress(user_id, now)))
    }

    /// Derived stats, recomputed from the full history on every call.
    pub async fn stats(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<UserStats, ApiError> {
        let completions = self.db.completions_for_user(user_id).await?;
        let durations = self.db.episode_durations().await?;
        Ok(progress::derive_stats(
            &completions,
            &durations,
            now.date_naive(),
        ))
    }
}

fn validate_submission(quiz: &Quiz, request: &SubmitCompletionRequest) -> Result<(), ApiError> {
    if request.answers.is_empty() {
        return Err(ApiError::ValidationError(
            "Submission must contain at least one answer".to_string(),
        ));
    }
    if !(0..=100).contains(&request.percentage) {
        return Err(ApiError::ValidationError(format!(
            "Percentage must be between 0 and 100, got {}",
            request.percentage
        )));
    }
    if request.max_score <= 0 {
        return Err(ApiError::ValidationError(
            "Max score must be greater than 0".to_string(),
        ));
    }
    if request.time_spent_seconds < 0 {
        return Err(ApiError::ValidationError(
            "Time spent cannot be negative".to_string(),
        ));
    }

    let question_ids: HashSet<Uuid> = quiz.questions.iter().map(|q| q.id).collect();
    let mut seen = HashSet::new();
    for answer in &request.answers {
        if !question_ids.contains(&answer.question_id) {
            return Err(ApiError::ValidationError(format!(
                "Question {} does not belong to quiz {}",
                answer.question_id, quiz.id
            )));
        }
        if !seen.insert(answer.question_id) {
            return Err(ApiError::ValidationError(format!(
                "Duplicate answer for question {}",
                answer.question_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Answer, Question, QuizAnswerRecord};
    use chrono::Duration;

    async fn service() -> CompletionService {
        let db = Database::new("sqlite::memory:").await.unwrap();
        CompletionService::new(db, ContinuationPolicy::default())
    }

    async fn seed_quiz(service: &CompletionService) -> Quiz {
        let question = |correct_letter: &str| {
            let answers = ["A", "B"]
                .iter()
                .map(|letter| Answer {
                    id: Uuid::new_v4(),
                    letter: letter.to_string(),
                    text: format!("Option {letter}"),
                    is_correct: *letter == correct_letter,
                })
                .collect();
            Question {
                id: Uuid::new_v4(),
                prompt: "Which applies?".to_string(),
                explanation: None,
                learning_outcome: None,
                answers,
            }
        };
        let quiz = Quiz {
            id: Uuid::new_v4(),
            title: "Canine dermatology".to_string(),
            description: None,
            episode_id: None,
            pass_percentage: 100,
            created_at: Utc::now(),
            questions: vec![question("A"), question("B")],
        };
        service.db.create_quiz(&quiz).await.unwrap();
        quiz
    }

    fn submission(quiz: &Quiz, correct_count: usize) -> SubmitCompletionRequest {
        let answers: Vec<QuizAnswerRecord> = quiz
            .questions
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let is_correct = i < correct_count;
                QuizAnswerRecord {
                    question_id: q.id,
                    selected_answer_ids: vec![q.answers[0].id],
                    is_correct,
                    points: i32::from(is_correct),
                }
            })
            .collect();
        let total = quiz.questions.len();
        SubmitCompletionRequest {
            quiz_id: quiz.id,
            episode_id: None,
            answers,
            score: correct_count as i32,
            max_score: total as i32,
            percentage: ((100.0 * correct_count as f64 / total as f64).round()) as i32,
            time_spent_seconds: 90,
        }
    }

    #[tokio::test]
    async fn submit_persists_completion_and_rollup() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        let stored = svc
            .submit_completion(user, submission(&quiz, 2), now)
            .await
            .unwrap();
        assert_eq!(stored.percentage, 100);
        assert!(stored.passed);
        assert_eq!(stored.attempt_number, 1);

        let rollup = svc.progress(user, now).await.unwrap();
        assert_eq!(rollup.total_completed, 1);
        assert_eq!(rollup.total_passed, 1);
        assert!(rollup.badges.contains_key("first-quiz"));
        assert!(rollup.badges.contains_key("perfect-score"));

        assert!(svc.has_completed(user, quiz.id).await.unwrap());
        assert!(svc.has_passed(user, quiz.id).await.unwrap());
        assert!(!svc.has_completed(Uuid::new_v4(), quiz.id).await.unwrap());
    }

    #[tokio::test]
    async fn resubmission_with_lower_score_keeps_best() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        let first = svc
            .submit_completion(user, submission(&quiz, 2), now)
            .await
            .unwrap();
        let second = svc
            .submit_completion(user, submission(&quiz, 1), now + Duration::minutes(5))
            .await
            .unwrap();

        // Dedup returns the stored best, not the weaker resubmission.
        assert_eq!(second.id, first.id);
        assert_eq!(second.percentage, 100);
        assert_eq!(svc.completion_history(user).await.unwrap().len(), 1);

        // The rollup only ever saw the stored completion.
        let rollup = svc.progress(user, now).await.unwrap();
        assert_eq!(rollup.total_completed, 1);
    }

    #[tokio::test]
    async fn better_resubmission_is_stored_alongside() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        // A pass spends budget without cooldown, so retakes are immediate.
        svc.submit_completion(user, submission(&quiz, 2), now)
            .await
            .unwrap();
        let quiz2 = seed_quiz(&svc).await;
        svc.submit_completion(user, submission(&quiz2, 2), now)
            .await
            .unwrap();
        assert_eq!(svc.completion_history(user).await.unwrap().len(), 2);
        assert_eq!(svc.quiz_completions(quiz.id).await.unwrap().len(), 1);
        assert_eq!(svc.quiz_completions(quiz2.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn attempt_budget_diverges_from_stored_count() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        // Two passing submissions at the same score: one stored row,
        // two attempts spent.
        svc.submit_completion(user, submission(&quiz, 2), now)
            .await
            .unwrap();
        svc.submit_completion(user, submission(&quiz, 2), now + Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(svc.persisted_attempt_count(user, quiz.id).await.unwrap(), 1);
        let status = svc
            .attempt_status(user, quiz.id, now + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(status.attempts_used, 2);
        assert_eq!(status.attempts_remaining, 1);
    }

    #[tokio::test]
    async fn failed_submission_triggers_cooldown_block() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        let stored = svc
            .submit_completion(user, submission(&quiz, 1), now)
            .await
            .unwrap();
        assert!(!stored.passed);

        // First ever completion is the new best even though it failed.
        let best = svc.best_score(user, quiz.id).await.unwrap().unwrap();
        assert_eq!(best.id, stored.id);
        let status = svc
            .attempt_status(user, quiz.id, now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(status.attempts_used, 1);

        let result = svc
            .submit_completion(user, submission(&quiz, 2), now + Duration::hours(1))
            .await;
        match result {
            Err(ApiError::PolicyDenied(status)) => {
                assert!(!status.can_attempt);
                assert_eq!(
                    status.next_attempt_available_at,
                    Some(now + Duration::hours(24))
                );
            }
            other => panic!("expected PolicyDenied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_budget_blocks_until_window_reset() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let mut now = Utc::now();

        for _ in 0..3 {
            // First one stores a row; dedup swallows the rest. Each
            // cooldown is waited out before the next try.
            svc.submit_completion(user, submission(&quiz, 1), now)
                .await
                .unwrap();
            now += Duration::hours(25);
        }

        // Budget gone even though the last cooldown elapsed.
        let status = svc.attempt_status(user, quiz.id, now).await.unwrap();
        assert!(!status.can_attempt);
        assert_eq!(status.attempts_used, 3);

        // Past the window the budget comes back.
        let after_window = now + Duration::days(8);
        let status = svc.attempt_status(user, quiz.id, after_window).await.unwrap();
        assert!(status.can_attempt);
        assert_eq!(status.attempts_used, 0);
    }

    #[tokio::test]
    async fn manual_reset_reopens_attempts() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        svc.record_attempt(user, quiz.id, false, now).await.unwrap();
        let blocked = svc
            .attempt_status(user, quiz.id, now + Duration::hours(1))
            .await
            .unwrap();
        assert!(!blocked.can_attempt);

        let status = svc
            .reset_attempts(user, quiz.id, now + Duration::hours(1))
            .await
            .unwrap();
        assert!(status.can_attempt);
        assert_eq!(status.attempts_used, 0);
    }

    #[tokio::test]
    async fn validation_rejects_malformed_submissions() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        let mut empty = submission(&quiz, 2);
        empty.answers.clear();
        assert!(matches!(
            svc.submit_completion(user, empty, now).await,
            Err(ApiError::ValidationError(_))
        ));

        let mut out_of_range = submission(&quiz, 2);
        out_of_range.percentage = 130;
        assert!(matches!(
            svc.submit_completion(user, out_of_range, now).await,
            Err(ApiError::ValidationError(_))
        ));

        let mut foreign = submission(&quiz, 2);
        foreign.answers[0].question_id = Uuid::new_v4();
        assert!(matches!(
            svc.submit_completion(user, foreign, now).await,
            Err(ApiError::ValidationError(_))
        ));

        let mut unknown_quiz = submission(&quiz, 2);
        unknown_quiz.quiz_id = Uuid::new_v4();
        assert!(matches!(
            svc.submit_completion(user, unknown_quiz, now).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_missing_completion_is_not_found() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        let stored = svc
            .submit_completion(user, submission(&quiz, 2), now)
            .await
            .unwrap();
        svc.delete_completion(stored.id).await.unwrap();
        assert!(matches!(
            svc.delete_completion(stored.id).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_derive_from_history() {
        let svc = service().await;
        let quiz = seed_quiz(&svc).await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        svc.submit_completion(user, submission(&quiz, 2), now)
            .await
            .unwrap();

        let stats = svc.stats(user, now).await.unwrap();
        assert_eq!(stats.streak_days, 1);
        assert!((stats.cpd_hours - 0.75).abs() < 1e-9);
        assert!(stats.achievements.iter().any(|a| a.id == "getting-started"));
    }
}
