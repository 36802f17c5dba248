use crate::error::{AppError, ErrorDetail};
use crate::models::{
    Difficulty, Identity, Question, QuestionType, QuestionView, Quiz, Role, SubmissionOutcome,
    SubmittedAnswer,
};
use crate::state::{AppState, QuestionPatch};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use validator::Validate;

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn client_key(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("local")
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Resolves the caller's verified identity from the bearer token. Token
/// issuance itself belongs to the session collaborator.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    req_id: &str,
) -> Result<Identity, AppError> {
    let token = bearer_token(headers).ok_or_else(|| {
        AppError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing bearer token", req_id)
    })?;
    state.resolve_identity(token).await.ok_or_else(|| {
        AppError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "invalid token", req_id)
    })
}

fn require_instructor(identity: Identity, req_id: &str) -> Result<i64, AppError> {
    match identity.role {
        Role::Instructor => Ok(identity.user_id),
        Role::Student => Err(AppError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "instructor role required",
            req_id,
        )),
    }
}

fn require_student(identity: Identity, req_id: &str) -> Result<i64, AppError> {
    match identity.role {
        Role::Student => Ok(identity.user_id),
        Role::Instructor => Err(AppError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "student role required",
            req_id,
        )),
    }
}

fn payload_errors(errors: validator::ValidationErrors, req_id: String) -> AppError {
    let details = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |e| ErrorDetail {
                field: field.to_string(),
                issue: e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string()),
            })
        })
        .collect();
    AppError::new(
        StatusCode::BAD_REQUEST,
        "VALIDATION_ERROR",
        "payload validation failed",
        req_id,
    )
    .with_details(details)
}

fn rate_limited(req_id: String) -> AppError {
    AppError::new(
        StatusCode::TOO_MANY_REQUESTS,
        "RATE_LIMITED",
        "too many requests",
        req_id,
    )
}

// ---- question bank ----------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
pub struct CreateQuestionPayload {
    #[serde(rename = "moduleId")]
    pub module_id: i64,
    #[validate(length(min = 1, message = "must not be empty"))]
    pub text: String,
    #[validate(length(min = 1, message = "must not be empty"))]
    pub answer: String,
    pub options: Option<Vec<String>>,
    #[serde(rename = "type")]
    pub kind: QuestionType,
    pub difficulty: Difficulty,
}

pub async fn create_question(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateQuestionPayload>,
) -> Result<(StatusCode, Json<Question>), AppError> {
    let req_id = request_id_from_headers(&headers);
    if !state.db.check_rate_limit("question_create", client_key(&headers), 60) {
        return Err(rate_limited(req_id));
    }
    let identity = authenticate(&state, &headers, &req_id).await?;
    let instructor_id = require_instructor(identity, &req_id)?;
    payload.validate().map_err(|e| payload_errors(e, req_id.clone()))?;

    let question = state
        .create_question(
            instructor_id,
            payload.module_id,
            payload.text,
            payload.answer,
            payload.options,
            payload.kind,
            payload.difficulty,
        )
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok((StatusCode::CREATED, Json(question)))
}

pub async fn list_questions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Question>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let instructor_id = require_instructor(identity, &req_id)?;
    Ok(Json(state.questions_for_instructor(instructor_id).await))
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateQuestionPayload {
    pub text: Option<String>,
    pub answer: Option<String>,
    pub options: Option<Vec<String>>,
    pub difficulty: Option<Difficulty>,
}

pub async fn update_question(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateQuestionPayload>,
) -> Result<Json<Question>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let instructor_id = require_instructor(identity, &req_id)?;
    let patch = QuestionPatch {
        text: payload.text,
        answer: payload.answer,
        options: payload.options,
        difficulty: payload.difficulty,
    };
    let question = state
        .update_question(id, instructor_id, patch)
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok(Json(question))
}

pub async fn delete_question(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let instructor_id = require_instructor(identity, &req_id)?;
    state
        .delete_question(id, instructor_id)
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn questions_by_module(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(module_id): Path<i64>,
) -> Result<Json<Vec<Question>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let questions = state
        .questions_by_module(module_id, identity)
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok(Json(questions))
}

// ---- quiz definition registry -----------------------------------------------

#[derive(Debug, Deserialize, Validate)]
pub struct CreateQuizPayload {
    #[serde(rename = "moduleId")]
    pub module_id: i64,
    #[validate(range(min = 1, message = "must be positive"))]
    #[serde(rename = "questionCount")]
    pub question_count: usize,
    #[serde(rename = "questionType")]
    pub question_type: QuestionType,
}

pub async fn create_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateQuizPayload>,
) -> Result<(StatusCode, Json<Quiz>), AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let instructor_id = require_instructor(identity, &req_id)?;
    payload.validate().map_err(|e| payload_errors(e, req_id.clone()))?;

    let quiz = state
        .create_quiz(
            instructor_id,
            payload.module_id,
            payload.question_count,
            payload.question_type,
        )
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok((StatusCode::CREATED, Json(quiz)))
}

pub async fn list_my_quizzes(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Quiz>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    Ok(Json(state.quizzes_for(identity).await))
}

pub async fn get_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Quiz>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let instructor_id = require_instructor(identity, &req_id)?;
    let quiz = state
        .quiz_by_id(id, instructor_id)
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok(Json(quiz))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateQuizPayload {
    #[validate(range(min = 1, message = "must be positive"))]
    #[serde(rename = "questionCount")]
    pub question_count: usize,
    #[serde(rename = "questionType")]
    pub question_type: QuestionType,
}

pub async fn update_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateQuizPayload>,
) -> Result<Json<Quiz>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let instructor_id = require_instructor(identity, &req_id)?;
    payload.validate().map_err(|e| payload_errors(e, req_id.clone()))?;

    let quiz = state
        .update_quiz(id, instructor_id, payload.question_count, payload.question_type)
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok(Json(quiz))
}

pub async fn delete_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let instructor_id = require_instructor(identity, &req_id)?;
    state
        .delete_quiz(id, instructor_id)
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn quizzes_by_module(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(module_id): Path<i64>,
) -> Result<Json<Vec<Quiz>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    authenticate(&state, &headers, &req_id).await?;
    let quizzes = state
        .quizzes_by_module(module_id)
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok(Json(quizzes))
}

// ---- selection cache & grading ----------------------------------------------

pub async fn student_questions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
) -> Result<Json<Vec<QuestionView>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let student_id = require_student(identity, &req_id)?;
    let questions = state
        .questions_for_student(quiz_id, student_id)
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok(Json(questions))
}

#[derive(Debug, Deserialize)]
pub struct SubmitQuizPayload {
    pub answers: Vec<SubmittedAnswer>,
}

pub async fn submit_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(quiz_id): Path<i64>,
    Json(payload): Json<SubmitQuizPayload>,
) -> Result<Json<SubmissionOutcome>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let identity = authenticate(&state, &headers, &req_id).await?;
    let student_id = require_student(identity, &req_id)?;
    if !state
        .db
        .check_rate_limit("quiz_submit", &student_id.to_string(), 60)
    {
        return Err(rate_limited(req_id));
    }
    let outcome = state
        .submit_quiz(student_id, quiz_id, payload.answers)
        .await
        .map_err(|e| e.into_app(req_id))?;
    Ok(Json(outcome))
}
