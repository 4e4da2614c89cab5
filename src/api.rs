use axum::{
    extract::{Path, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::{
    completion_service::CompletionService,
    errors::{ApiError, ErrorContext, ErrorResponse},
    models::*,
    quiz_session::{QuizSession, SessionScore},
};

use crate::{log_api_start, log_api_success, log_api_warn};

#[derive(Clone)]
pub struct AppState {
    pub completion_service: CompletionService,
    pub quiz_sessions: Arc<Mutex<HashMap<Uuid, QuizSession>>>,
}

impl AppState {
    pub fn new(completion_service: CompletionService) -> Self {
        AppState {
            completion_service,
            quiz_sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Deserialize)]
pub struct SelectAnswerRequest {
    pub answer_id: Uuid,
}

/// Client-facing session snapshot. The quiz inside carries no answer
/// key; correct answers are only revealed through feedback after a
/// submission.
#[derive(Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub quiz: QuizView,
    pub current_index: usize,
    pub total_questions: usize,
    pub selected_answer_ids: Vec<Uuid>,
    pub feedback: Option<AnswerFeedback>,
    pub progress_percentage: i32,
    pub completed: bool,
    pub score: Option<SessionScore>,
}

#[derive(Serialize)]
pub struct AnswerFeedback {
    pub is_correct: bool,
    pub correct_answer_ids: Vec<Uuid>,
    pub explanation: Option<String>,
}

impl SessionView {
    fn from_session(session: &QuizSession) -> Self {
        let feedback = if session.feedback_shown {
            session.current_question().map(|q| {
                let is_correct = session
                    .attempts
                    .iter()
                    .rev()
                    .find(|a| a.question_id == q.id)
                    .map(|a| a.is_correct)
                    .unwrap_or(false);
                let mut correct: Vec<Uuid> = q.correct_answer_ids().into_iter().collect();
                correct.sort();
                AnswerFeedback {
                    is_correct,
                    correct_answer_ids: correct,
                    explanation: q.explanation.clone(),
                }
            })
        } else {
            None
        };

        SessionView {
            session_id: session.id,
            user_id: session.user_id,
            quiz: QuizView::from(&session.quiz),
            current_index: session.current_index,
            total_questions: session.quiz.questions.len(),
            selected_answer_ids: {
                let mut ids: Vec<Uuid> = session.selected_answer_ids.iter().copied().collect();
                ids.sort();
                ids
            },
            feedback,
            progress_percentage: session.progress_percentage(),
            completed: session.completed,
            score: session.completed.then(|| session.final_score()),
        }
    }
}

// Quiz endpoints
pub async fn list_quizzes(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<QuizView>>>, ErrorResponse> {
    log_api_start!("list_quizzes");

    match state.completion_service.list_quizzes().await {
        Ok(quizzes) => {
            let views: Vec<QuizView> = quizzes.iter().map(QuizView::from).collect();
            log_api_success!("list_quizzes", count = views.len(), "quizzes listed");
            Ok(Json(ApiResponse::success(views)))
        }
        Err(e) => Err(e.to_response_with_context(ErrorContext::new("list_quizzes", "quiz"))),
    }
}

pub async fn get_quiz(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<QuizView>>, ErrorResponse> {
    match state.completion_service.get_quiz(id).await {
        Ok(quiz) => Ok(Json(ApiResponse::success(QuizView::from(&quiz)))),
        Err(e) => {
            let context = ErrorContext::new("get_quiz", "quiz").with_id(&id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

// Continuation-policy endpoints
pub async fn get_attempt_status(
    State(state): State<AppState>,
    Path((user_id, quiz_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ApiResponse<AttemptStatus>>, ErrorResponse> {
    log_api_start!("get_attempt_status", user_id = user_id, quiz_id = quiz_id);

    match state
        .completion_service
        .attempt_status(user_id, quiz_id, Utc::now())
        .await
    {
        Ok(status) => Ok(Json(ApiResponse::success(status))),
        Err(e) => {
            let context = ErrorContext::new("get_attempt_status", "attempt status")
                .with_id(&quiz_id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn record_attempt(
    State(state): State<AppState>,
    Path((user_id, quiz_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<RecordAttemptRequest>,
) -> Result<Json<ApiResponse<AttemptStatus>>, ErrorResponse> {
    log_api_start!("record_attempt", user_id = user_id, quiz_id = quiz_id);

    match state
        .completion_service
        .record_attempt(user_id, quiz_id, request.passed, Utc::now())
        .await
    {
        Ok(status) => {
            log_api_success!(
                "record_attempt",
                user_id = user_id,
                quiz_id = quiz_id,
                "attempt recorded"
            );
            Ok(Json(ApiResponse::success(status)))
        }
        Err(e) => {
            let context =
                ErrorContext::new("record_attempt", "attempt").with_id(&quiz_id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn reset_attempts(
    State(state): State<AppState>,
    Path((user_id, quiz_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ApiResponse<AttemptStatus>>, ErrorResponse> {
    info!(user_id = %user_id, quiz_id = %quiz_id, "Resetting quiz attempts");

    match state
        .completion_service
        .reset_attempts(user_id, quiz_id, Utc::now())
        .await
    {
        Ok(status) => Ok(Json(ApiResponse::success(status))),
        Err(e) => {
            let context =
                ErrorContext::new("reset_attempts", "attempt").with_id(&quiz_id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

// Completion endpoints
pub async fn submit_completion(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<SubmitCompletionRequest>,
) -> Result<Json<ApiResponse<QuizCompletion>>, ErrorResponse> {
    log_api_start!("submit_completion", user_id = user_id, quiz_id = request.quiz_id);
    let quiz_id = request.quiz_id;

    match state
        .completion_service
        .submit_completion(user_id, request, Utc::now())
        .await
    {
        Ok(completion) => {
            log_api_success!(
                "submit_completion",
                user_id = user_id,
                quiz_id = quiz_id,
                "completion submitted"
            );
            Ok(Json(ApiResponse::success(completion)))
        }
        Err(e) => {
            let context =
                ErrorContext::new("submit_completion", "completion").with_id(&quiz_id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn get_completions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<QuizCompletion>>>, ErrorResponse> {
    match state.completion_service.completion_history(user_id).await {
        Ok(completions) => {
            log_api_success!(
                "get_completions",
                count = completions.len(),
                "completions listed"
            );
            Ok(Json(ApiResponse::success(completions)))
        }
        Err(e) => {
            let context =
                ErrorContext::new("get_completions", "completion").with_id(&user_id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

/// A user with no completion for the quiz is a valid empty result,
/// not an error: the payload is null, never a 404.
pub async fn get_best_score(
    State(state): State<AppState>,
    Path((user_id, quiz_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ApiResponse<Option<QuizCompletion>>>, ErrorResponse> {
    match state.completion_service.best_score(user_id, quiz_id).await {
        Ok(best) => {
            if best.is_none() {
                log_api_warn!(
                    "get_best_score",
                    user_id = user_id,
                    quiz_id = quiz_id,
                    "no completion stored yet"
                );
            }
            Ok(Json(ApiResponse::success(best)))
        }
        Err(e) => {
            let context =
                ErrorContext::new("get_best_score", "completion").with_id(&quiz_id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn delete_completion(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<bool>>, ErrorResponse> {
    info!(completion_id = %id, "Deleting completion");

    match state.completion_service.delete_completion(id).await {
        Ok(()) => Ok(Json(ApiResponse::success(true))),
        Err(e) => {
            let context =
                ErrorContext::new("delete_completion", "completion").with_id(&id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

// Aggregate endpoints
pub async fn get_progress(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<UserProgress>>, ErrorResponse> {
    match state.completion_service.progress(user_id, Utc::now()).await {
        Ok(progress) => Ok(Json(ApiResponse::success(progress))),
        Err(e) => {
            let context =
                ErrorContext::new("get_progress", "progress").with_id(&user_id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn get_stats(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<UserStats>>, ErrorResponse> {
    match state.completion_service.stats(user_id, Utc::now()).await {
        Ok(stats) => Ok(Json(ApiResponse::success(stats))),
        Err(e) => {
            let context = ErrorContext::new("get_stats", "stats").with_id(&user_id.to_string());
            Err(e.to_response_with_context(context))
        }
    }
}

// Quiz session endpoints
pub async fn start_session(
    State(state): State<AppState>,
    Path((user_id, quiz_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ApiResponse<SessionView>>, ErrorResponse> {
    log_api_start!("start_session", user_id = user_id, quiz_id = quiz_id);

    // The attempt gate sits at session start so a blocked user never
    // walks through a quiz they cannot submit.
    let status = match state
        .completion_service
        .attempt_status(user_id, quiz_id, Utc::now())
        .await
    {
        Ok(status) => status,
        Err(e) => {
            let context =
                ErrorContext::new("start_session", "session").with_id(&quiz_id.to_string());
            return Err(e.to_response_with_context(context));
        }
    };
    if !status.can_attempt {
        let context = ErrorContext::new("start_session", "session").with_id(&quiz_id.to_string());
        return Err(ApiError::PolicyDenied(status).to_response_with_context(context));
    }

    let quiz = match state.completion_service.get_quiz(quiz_id).await {
        Ok(quiz) => quiz,
        Err(e) => {
            let context = ErrorContext::new("start_session", "quiz").with_id(&quiz_id.to_string());
            return Err(e.to_response_with_context(context));
        }
    };

    let session = QuizSession::new(user_id, quiz, Utc::now());
    let view = SessionView::from_session(&session);
    {
        let mut sessions = state.quiz_sessions.lock().unwrap();
        sessions.insert(session.id, session);
    }

    log_api_success!("start_session", session_id = view.session_id, "session started");
    Ok(Json(ApiResponse::success(view)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<SessionView>>, ErrorResponse> {
    let sessions = state.quiz_sessions.lock().unwrap();
    match sessions.get(&session_id) {
        Some(session) => Ok(Json(ApiResponse::success(SessionView::from_session(session)))),
        None => {
            let error = ApiError::NotFound(format!("Session '{session_id}'"));
            let context =
                ErrorContext::new("get_session", "session").with_id(&session_id.to_string());
            Err(error.to_response_with_context(context))
        }
    }
}

pub async fn select_answer(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SelectAnswerRequest>,
) -> Result<Json<ApiResponse<SessionView>>, ErrorResponse> {
    with_session(&state, session_id, "select_answer", |session| {
        session.select_answer(request.answer_id);
    })
}

pub async fn submit_answer(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<SessionView>>, ErrorResponse> {
    with_session(&state, session_id, "submit_answer", |session| {
        session.submit_answer();
    })
}

/// Restart assigns the session a fresh identity, so the map entry is
/// re-keyed: the returned session_id is the one that resolves from
/// here on, and the old handle stops existing.
pub async fn restart_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<SessionView>>, ErrorResponse> {
    let mut sessions = state.quiz_sessions.lock().unwrap();
    let Some(mut session) = sessions.remove(&session_id) else {
        let error = ApiError::NotFound(format!("Session '{session_id}'"));
        let context =
            ErrorContext::new("restart_session", "session").with_id(&session_id.to_string());
        return Err(error.to_response_with_context(context));
    };
    session.restart(Utc::now());
    let view = SessionView::from_session(&session);
    sessions.insert(session.id, session);
    Ok(Json(ApiResponse::success(view)))
}

/// Advance past feedback. When this crosses the finish line the final
/// score is submitted as a completion exactly once; later calls on the
/// completed session are no-ops and submit nothing.
pub async fn proceed(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<SessionView>>, ErrorResponse> {
    log_api_start!("proceed", session_id = session_id);
    let now = Utc::now();

    let (view, submission) = {
        let mut sessions = state.quiz_sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(&session_id) else {
            let error = ApiError::NotFound(format!("Session '{session_id}'"));
            let context = ErrorContext::new("proceed", "session").with_id(&session_id.to_string());
            return Err(error.to_response_with_context(context));
        };

        let was_completed = session.completed;
        session.proceed();
        let just_finished = session.completed && !was_completed;

        let submission = just_finished.then(|| {
            let score = session.final_score();
            (
                session.user_id,
                SubmitCompletionRequest {
                    quiz_id: session.quiz.id,
                    episode_id: session.quiz.episode_id,
                    answers: session.answer_records(),
                    // Percentage-denominated: the interactive flow
                    // grades out of 100 regardless of question count.
                    score: score.percentage,
                    max_score: 100,
                    percentage: score.percentage,
                    time_spent_seconds: session.elapsed_seconds(now),
                },
            )
        });
        (SessionView::from_session(session), submission)
    };

    if let Some((user_id, request)) = submission {
        let quiz_id = request.quiz_id;
        if let Err(e) = state
            .completion_service
            .submit_completion(user_id, request, now)
            .await
        {
            let context = ErrorContext::new("proceed", "completion").with_id(&quiz_id.to_string());
            return Err(e.to_response_with_context(context));
        }
        log_api_success!("proceed", session_id = session_id, "session completed and submitted");
    }

    Ok(Json(ApiResponse::success(view)))
}

fn with_session(
    state: &AppState,
    session_id: Uuid,
    operation: &str,
    apply: impl FnOnce(&mut QuizSession),
) -> Result<Json<ApiResponse<SessionView>>, ErrorResponse> {
    let mut sessions = state.quiz_sessions.lock().unwrap();
    match sessions.get_mut(&session_id) {
        Some(session) => {
            apply(session);
            Ok(Json(ApiResponse::success(SessionView::from_session(session))))
        }
        None => {
            let error = ApiError::NotFound(format!("Session '{session_id}'"));
            let context = ErrorContext::new(operation, "session").with_id(&session_id.to_string());
            Err(error.to_response_with_context(context))
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Quiz routes
        .route("/api/quizzes", get(list_quizzes))
        .route("/api/quizzes/:id", get(get_quiz))
        // Continuation-policy routes
        .route(
            "/api/users/:user_id/quizzes/:quiz_id/attempt-status",
            get(get_attempt_status),
        )
        .route(
            "/api/users/:user_id/quizzes/:quiz_id/attempts",
            post(record_attempt),
        )
        .route(
            "/api/users/:user_id/quizzes/:quiz_id/attempts/reset",
            post(reset_attempts),
        )
        // Completion routes
        .route("/api/users/:user_id/completions", post(submit_completion))
        .route("/api/users/:user_id/completions", get(get_completions))
        .route(
            "/api/users/:user_id/quizzes/:quiz_id/best-score",
            get(get_best_score),
        )
        .route("/api/completions/:id", delete(delete_completion))
        // Aggregate routes
        .route("/api/users/:user_id/progress", get(get_progress))
        .route("/api/users/:user_id/stats", get(get_stats))
        // Quiz session routes
        .route(
            "/api/users/:user_id/quizzes/:quiz_id/session/start",
            post(start_session),
        )
        .route("/api/sessions/:session_id", get(get_session))
        .route("/api/sessions/:session_id/select", post(select_answer))
        .route("/api/sessions/:session_id/submit", post(submit_answer))
        .route("/api/sessions/:session_id/proceed", post(proceed))
        .route("/api/sessions/:session_id/restart", post(restart_session))
        .with_state(state)
}
