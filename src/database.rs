use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::models::*;

/// Thin wrapper over the SQLite pool. Constructed once at startup and
/// passed by reference to every service; no ambient global client.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let db = Database { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// The best-score dedup and rollup update run as one transaction
    /// keyed by (user_id, quiz_id); see CompletionService.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                duration_seconds INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quizzes (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                episode_id TEXT,
                pass_percentage INTEGER NOT NULL DEFAULT 100,
                created_at TEXT NOT NULL,
                FOREIGN KEY (episode_id) REFERENCES episodes(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS questions (
                id TEXT PRIMARY KEY,
                quiz_id TEXT NOT NULL,
                prompt TEXT NOT NULL,
                explanation TEXT,
                learning_outcome TEXT,
                position INTEGER NOT NULL,
                FOREIGN KEY (quiz_id) REFERENCES quizzes(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS answers (
                id TEXT PRIMARY KEY,
                question_id TEXT NOT NULL,
                letter TEXT NOT NULL,
                text TEXT NOT NULL,
                is_correct INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (question_id) REFERENCES questions(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quiz_completions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                quiz_id TEXT NOT NULL,
                episode_id TEXT,
                score INTEGER NOT NULL,
                max_score INTEGER NOT NULL,
                percentage INTEGER NOT NULL,
                time_spent_seconds INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT NOT NULL,
                answers TEXT NOT NULL,
                passed INTEGER NOT NULL DEFAULT 0,
                attempt_number INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_progress (
                user_id TEXT PRIMARY KEY,
                total_completed INTEGER NOT NULL DEFAULT 0,
                total_passed INTEGER NOT NULL DEFAULT 0,
                total_score INTEGER NOT NULL DEFAULT 0,
                total_max_score INTEGER NOT NULL DEFAULT 0,
                average_score INTEGER NOT NULL DEFAULT 0,
                completion_rate INTEGER NOT NULL DEFAULT 0,
                total_time_seconds INTEGER NOT NULL DEFAULT 0,
                last_activity TEXT NOT NULL,
                badges TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS continuation_limits (
                user_id TEXT NOT NULL,
                quiz_id TEXT NOT NULL,
                attempts_used INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                blocked_until TEXT,
                reset_at TEXT NOT NULL,
                PRIMARY KEY (user_id, quiz_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Episode operations (content-management seed data)
    pub async fn create_episode(&self, episode: &Episode) -> Result<()> {
        sqlx::query("INSERT INTO episodes (id, title, duration_seconds) VALUES (?1, ?2, ?3)")
            .bind(episode.id.to_string())
            .bind(&episode.title)
            .bind(episode.duration_seconds)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn episode_durations(&self) -> Result<HashMap<Uuid, i64>> {
        let rows = sqlx::query("SELECT id, duration_seconds FROM episodes")
            .fetch_all(&self.pool)
            .await?;

        let mut durations = HashMap::new();
        for row in rows {
            durations.insert(
                Uuid::parse_str(&row.get::<String, _>("id"))?,
                row.get::<i64, _>("duration_seconds"),
            );
        }
        Ok(durations)
    }

    // Quiz operations (read-mostly; quizzes are owned by the content team)
    pub async fn create_quiz(&self, quiz: &Quiz) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO quizzes (id, title, description, episode_id, pass_percentage, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(quiz.id.to_string())
        .bind(&quiz.title)
        .bind(&quiz.description)
        .bind(quiz.episode_id.map(|id| id.to_string()))
        .bind(quiz.pass_percentage)
        .bind(quiz.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for (position, question) in quiz.questions.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO questions (id, quiz_id, prompt, explanation, learning_outcome, position)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(question.id.to_string())
            .bind(quiz.id.to_string())
            .bind(&question.prompt)
            .bind(&question.explanation)
            .bind(&question.learning_outcome)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;

            for answer in &question.answers {
                sqlx::query(
                    r#"
                    INSERT INTO answers (id, question_id, letter, text, is_correct)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )
                .bind(answer.id.to_string())
                .bind(question.id.to_string())
                .bind(&answer.letter)
                .bind(&answer.text)
                .bind(answer.is_correct)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_quiz(&self, id: Uuid) -> Result<Option<Quiz>> {
        let row = sqlx::query("SELECT * FROM quizzes WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let questions = self.questions_for_quiz(id).await?;
        Ok(Some(row_to_quiz(&row, questions)?))
    }

    pub async fn list_quizzes(&self) -> Result<Vec<Quiz>> {
        let rows = sqlx::query("SELECT * FROM quizzes ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let mut quizzes = Vec::new();
        for row in rows {
            let quiz_id = Uuid::parse_str(&row.get::<String, _>("id"))?;
            let questions = self.questions_for_quiz(quiz_id).await?;
            quizzes.push(row_to_quiz(&row, questions)?);
        }
        Ok(quizzes)
    }

    async fn questions_for_quiz(&self, quiz_id: Uuid) -> Result<Vec<Question>> {
        let question_rows =
            sqlx::query("SELECT * FROM questions WHERE quiz_id = ?1 ORDER BY position ASC")
                .bind(quiz_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        let mut questions = Vec::new();
        for row in question_rows {
            let question_id = Uuid::parse_str(&row.get::<String, _>("id"))?;
            // Answers are presented sorted by letter.
            let answer_rows =
                sqlx::query("SELECT * FROM answers WHERE question_id = ?1 ORDER BY letter ASC")
                    .bind(question_id.to_string())
                    .fetch_all(&self.pool)
                    .await?;

            let mut answers = Vec::new();
            for answer_row in answer_rows {
                answers.push(Answer {
                    id: Uuid::parse_str(&answer_row.get::<String, _>("id"))?,
                    letter: answer_row.get("letter"),
                    text: answer_row.get("text"),
                    is_correct: answer_row.get("is_correct"),
                });
            }

            questions.push(Question {
                id: question_id,
                prompt: row.get("prompt"),
                explanation: row.get("explanation"),
                learning_outcome: row.get("learning_outcome"),
                answers,
            });
        }
        Ok(questions)
    }

    // Completion operations
    pub async fn get_completion(&self, id: Uuid) -> Result<Option<QuizCompletion>> {
        let row = sqlx::query("SELECT * FROM quiz_completions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_completion(&r)).transpose()
    }

    pub async fn completions_for_user(&self, user_id: Uuid) -> Result<Vec<QuizCompletion>> {
        let rows = sqlx::query("SELECT * FROM quiz_completions WHERE user_id = ?1")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_completion).collect()
    }

    pub async fn completions_for_quiz(&self, quiz_id: Uuid) -> Result<Vec<QuizCompletion>> {
        let rows = sqlx::query("SELECT * FROM quiz_completions WHERE quiz_id = ?1")
            .bind(quiz_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_completion).collect()
    }

    pub async fn best_completion(
        &self,
        user_id: Uuid,
        quiz_id: Uuid,
    ) -> Result<Option<QuizCompletion>> {
        fetch_best_completion(&self.pool, user_id, quiz_id).await
    }

    pub async fn best_completion_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        user_id: Uuid,
        quiz_id: Uuid,
    ) -> Result<Option<QuizCompletion>> {
        fetch_best_completion(&mut **tx, user_id, quiz_id).await
    }

    pub async fn count_completions(&self, user_id: Uuid, quiz_id: Uuid) -> Result<i64> {
        fetch_completion_count(&self.pool, user_id, quiz_id).await
    }

    pub async fn count_completions_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        user_id: Uuid,
        quiz_id: Uuid,
    ) -> Result<i64> {
        fetch_completion_count(&mut **tx, user_id, quiz_id).await
    }

    pub async fn insert_completion_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        completion: &QuizCompletion,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quiz_completions (id, user_id, quiz_id, episode_id, score, max_score,
                                          percentage, time_spent_seconds, completed_at, answers,
                                          passed, attempt_number)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(completion.id.to_string())
        .bind(completion.user_id.to_string())
        .bind(completion.quiz_id.to_string())
        .bind(completion.episode_id.map(|id| id.to_string()))
        .bind(completion.score)
        .bind(completion.max_score)
        .bind(completion.percentage)
        .bind(completion.time_spent_seconds)
        .bind(completion.completed_at.to_rfc3339())
        .bind(serde_json::to_string(&completion.answers)?)
        .bind(completion.passed)
        .bind(completion.attempt_number)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Hard delete. The progress rollup is intentionally not
    /// recomputed; it is a monotonic, best-effort aggregate.
    pub async fn delete_completion(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM quiz_completions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // Progress operations
    pub async fn get_progress(&self, user_id: Uuid) -> Result<Option<UserProgress>> {
        fetch_progress(&self.pool, user_id).await
    }

    pub async fn get_progress_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        user_id: Uuid,
    ) -> Result<Option<UserProgress>> {
        fetch_progress(&mut **tx, user_id).await
    }

    pub async fn upsert_progress_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        progress: &UserProgress,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_progress (user_id, total_completed, total_passed, total_score,
                                       total_max_score, average_score, completion_rate,
                                       total_time_seconds, last_activity, badges)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (user_id) DO UPDATE SET
                total_completed = excluded.total_completed,
                total_passed = excluded.total_passed,
                total_score = excluded.total_score,
                total_max_score = excluded.total_max_score,
                average_score = excluded.average_score,
                completion_rate = excluded.completion_rate,
                total_time_seconds = excluded.total_time_seconds,
                last_activity = excluded.last_activity,
                badges = excluded.badges
            "#,
        )
        .bind(progress.user_id.to_string())
        .bind(progress.total_completed)
        .bind(progress.total_passed)
        .bind(progress.total_score)
        .bind(progress.total_max_score)
        .bind(progress.average_score)
        .bind(progress.completion_rate)
        .bind(progress.total_time_seconds)
        .bind(progress.last_activity.to_rfc3339())
        .bind(serde_json::to_string(&progress.badges)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // Continuation-limit operations
    pub async fn get_limits(
        &self,
        user_id: Uuid,
        quiz_id: Uuid,
    ) -> Result<Option<ContinuationLimits>> {
        fetch_limits(&self.pool, user_id, quiz_id).await
    }

    pub async fn upsert_limits(&self, limits: &ContinuationLimits) -> Result<()> {
        upsert_limits_query(&self.pool, limits).await
    }

    pub async fn upsert_limits_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        limits: &ContinuationLimits,
    ) -> Result<()> {
        upsert_limits_query(&mut **tx, limits).await
    }
}

async fn fetch_best_completion<'e, E>(
    executor: E,
    user_id: Uuid,
    quiz_id: Uuid,
) -> Result<Option<QuizCompletion>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT * FROM quiz_completions
        WHERE user_id = ?1 AND quiz_id = ?2
        ORDER BY percentage DESC
        LIMIT 1
        "#,
    )
    .bind(user_id.to_string())
    .bind(quiz_id.to_string())
    .fetch_optional(executor)
    .await?;
    row.map(|r| row_to_completion(&r)).transpose()
}

async fn fetch_completion_count<'e, E>(executor: E, user_id: Uuid, quiz_id: Uuid) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT COUNT(*) AS attempt_count FROM quiz_completions WHERE user_id = ?1 AND quiz_id = ?2",
    )
    .bind(user_id.to_string())
    .bind(quiz_id.to_string())
    .fetch_one(executor)
    .await?;
    Ok(row.get("attempt_count"))
}

async fn fetch_progress<'e, E>(executor: E, user_id: Uuid) -> Result<Option<UserProgress>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM user_progress WHERE user_id = ?1")
        .bind(user_id.to_string())
        .fetch_optional(executor)
        .await?;
    row.map(|r| row_to_progress(&r)).transpose()
}

async fn fetch_limits<'e, E>(
    executor: E,
    user_id: Uuid,
    quiz_id: Uuid,
) -> Result<Option<ContinuationLimits>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM continuation_limits WHERE user_id = ?1 AND quiz_id = ?2")
        .bind(user_id.to_string())
        .bind(quiz_id.to_string())
        .fetch_optional(executor)
        .await?;
    row.map(|r| row_to_limits(&r)).transpose()
}

async fn upsert_limits_query<'e, E>(executor: E, limits: &ContinuationLimits) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO continuation_limits (user_id, quiz_id, attempts_used, last_attempt_at,
                                         blocked_until, reset_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT (user_id, quiz_id) DO UPDATE SET
            attempts_used = excluded.attempts_used,
            last_attempt_at = excluded.last_attempt_at,
            blocked_until = excluded.blocked_until,
            reset_at = excluded.reset_at
        "#,
    )
    .bind(limits.user_id.to_string())
    .bind(limits.quiz_id.to_string())
    .bind(limits.attempts_used)
    .bind(limits.last_attempt_at.map(|d| d.to_rfc3339()))
    .bind(limits.blocked_until.map(|d| d.to_rfc3339()))
    .bind(limits.reset_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

fn row_to_quiz(row: &SqliteRow, questions: Vec<Question>) -> Result<Quiz> {
    Ok(Quiz {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        title: row.get("title"),
        description: row.get("description"),
        episode_id: parse_optional_uuid(row.get::<Option<String>, _>("episode_id"))?,
        pass_percentage: row.get("pass_percentage"),
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        questions,
    })
}

fn row_to_completion(row: &SqliteRow) -> Result<QuizCompletion> {
    let answers: Vec<QuizAnswerRecord> = serde_json::from_str(&row.get::<String, _>("answers"))?;
    Ok(QuizCompletion {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        user_id: Uuid::parse_str(&row.get::<String, _>("user_id"))?,
        quiz_id: Uuid::parse_str(&row.get::<String, _>("quiz_id"))?,
        episode_id: parse_optional_uuid(row.get::<Option<String>, _>("episode_id"))?,
        score: row.get("score"),
        max_score: row.get("max_score"),
        percentage: row.get("percentage"),
        time_spent_seconds: row.get("time_spent_seconds"),
        completed_at: parse_datetime(&row.get::<String, _>("completed_at"))?,
        answers,
        passed: row.get("passed"),
        attempt_number: row.get("attempt_number"),
    })
}

fn row_to_progress(row: &SqliteRow) -> Result<UserProgress> {
    let badges: BTreeMap<String, Badge> = serde_json::from_str(&row.get::<String, _>("badges"))?;
    Ok(UserProgress {
        user_id: Uuid::parse_str(&row.get::<String, _>("user_id"))?,
        total_completed: row.get("total_completed"),
        total_passed: row.get("total_passed"),
        total_score: row.get("total_score"),
        total_max_score: row.get("total_max_score"),
        average_score: row.get("average_score"),
        completion_rate: row.get("completion_rate"),
        total_time_seconds: row.get("total_time_seconds"),
        last_activity: parse_datetime(&row.get::<String, _>("last_activity"))?,
        badges,
    })
}

fn row_to_limits(row: &SqliteRow) -> Result<ContinuationLimits> {
    Ok(ContinuationLimits {
        user_id: Uuid::parse_str(&row.get::<String, _>("user_id"))?,
        quiz_id: Uuid::parse_str(&row.get::<String, _>("quiz_id"))?,
        attempts_used: row.get("attempts_used"),
        last_attempt_at: parse_optional_datetime(row.get::<Option<String>, _>("last_attempt_at"))?,
        blocked_until: parse_optional_datetime(row.get::<Option<String>, _>("blocked_until"))?,
        reset_at: parse_datetime(&row.get::<String, _>("reset_at"))?,
    })
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn parse_optional_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_datetime).transpose()
}

fn parse_optional_uuid(value: Option<String>) -> Result<Option<Uuid>> {
    Ok(value.as_deref().map(Uuid::parse_str).transpose()?)
}
