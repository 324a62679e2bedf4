use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    middleware::{ClientKey, RequestId},
    models::SessionContext,
    routes::AppState,
    services::session_service::{Answer, SessionStart, SessionSummary, TurnOutcome},
};

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub domain: String,
    #[serde(default)]
    pub context: SessionContext,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub question_id: String,
    pub choice: String,
    pub response_time_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub satisfaction: f64,
}

/// Admission check that runs before any other work on mutating endpoints
async fn admit(state: &AppState, client: &ClientKey) -> AppResult<()> {
    state
        .rate_limiter
        .check_limit(client.as_str())
        .await
        .into_result()
        .map(|_| ())
}

/// Malformed bodies are caller errors like any other invalid turn input
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::Validation(rejection.body_text()))
}

fn parse_session_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::Validation(format!("'{}' is not a session id", raw)))
}

/// Handler for starting a session
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(client): Extension<ClientKey>,
    payload: Result<Json<StartSessionRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<SessionStart>)> {
    admit(&state, &client).await?;
    let request = body(payload)?;

    tracing::info!(
        request_id = %request_id,
        domain = %request.domain,
        "Starting session"
    );

    let start = state.sessions.start(&request.domain, request.context).await?;
    Ok((StatusCode::CREATED, Json(start)))
}

/// Handler for answering the pending question
pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(client): Extension<ClientKey>,
    Path(session_id): Path<String>,
    payload: Result<Json<AnswerRequest>, JsonRejection>,
) -> AppResult<Json<TurnOutcome>> {
    admit(&state, &client).await?;
    let session_id = parse_session_id(&session_id)?;
    let request = body(payload)?;

    tracing::info!(
        request_id = %request_id,
        session_id = %session_id,
        question_id = %request.question_id,
        "Processing answer"
    );

    let outcome = state
        .sessions
        .answer(
            session_id,
            Answer {
                question_id: request.question_id,
                choice: request.choice,
                response_time_ms: request.response_time_ms,
            },
        )
        .await?;

    Ok(Json(outcome))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> AppResult<Json<SessionSummary>> {
    let session_id = parse_session_id(&session_id)?;
    Ok(Json(state.sessions.get_session(session_id).await?))
}

/// Handler for post-session satisfaction feedback
pub async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(client): Extension<ClientKey>,
    Path(session_id): Path<String>,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> AppResult<StatusCode> {
    admit(&state, &client).await?;
    let session_id = parse_session_id(&session_id)?;
    let request = body(payload)?;

    tracing::info!(
        request_id = %request_id,
        session_id = %session_id,
        satisfaction = request.satisfaction,
        "Recording feedback"
    );

    state
        .sessions
        .record_feedback(session_id, request.satisfaction)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
