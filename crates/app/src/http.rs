//! ListenBrainz-compatible push endpoints, a generic scrobble endpoint and
//! the now-playing read API.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use listenledger_core::listen::{ListenSubmission, Scrobble};
use listenledger_core::EngineError;
use listenledger_engine::{NowPlayingView, PushIngestor};
use serde_json::{json, Value};
use std::sync::Arc;

pub type AppState = Arc<PushIngestor>;

pub fn router(ingestor: Arc<PushIngestor>) -> Router {
    Router::new()
        .route("/1/submit-listens", post(submit_listens))
        .route("/1/validate-token", get(validate_token))
        .route("/api/scrobble", post(scrobble))
        .route("/api/player/now-playing", get(now_playing))
        .with_state(ingestor)
}

#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    /// Body that is not a parseable submission at all.
    BadRequest(String),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Engine(EngineError::Unauthenticated) => (
                StatusCode::UNAUTHORIZED,
                json!({ "code": 401, "error": "You need to provide a valid token." }),
            ),
            AppError::Engine(EngineError::Validation(issues)) => (
                StatusCode::BAD_REQUEST,
                json!({ "code": 400, "error": "Invalid listen payload.", "fields": issues }),
            ),
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "code": 400, "error": message }),
            ),
            AppError::Engine(err) => {
                tracing::error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "code": 500, "error": "Internal server error." }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Accepts `Token <t>` and `Bearer <t>`; anything else yields an empty token,
/// which fails authentication like an unknown one.
pub fn listen_token(headers: &HeaderMap) -> &str {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return "";
    };
    let value = value.trim();
    match value.split_once(' ') {
        Some((scheme, token))
            if scheme.eq_ignore_ascii_case("token") || scheme.eq_ignore_ascii_case("bearer") =>
        {
            token.trim()
        }
        _ => "",
    }
}

async fn submit_listens(
    State(ingestor): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ListenSubmission>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    // Token first: an unauthenticated caller gets 401 even for a malformed body.
    let user = ingestor.authenticate(listen_token(&headers)).await?;
    let Json(submission) = body?;
    let accepted = ingestor.submit_for(&user, &submission, Utc::now()).await?;
    Ok(Json(json!({ "status": "ok", "accepted": accepted })))
}

async fn scrobble(
    State(ingestor): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Scrobble>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let user = ingestor.authenticate(listen_token(&headers)).await?;
    let Json(scrobble) = body?;
    let receipt = ingestor.scrobble_for(&user, &scrobble).await?;
    Ok(Json(json!({
        "success": true,
        "track_id": receipt.track_id,
        "recorded": receipt.recorded,
    })))
}

async fn validate_token(
    State(ingestor): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let user = ingestor.authenticate(listen_token(&headers)).await?;
    Ok(Json(json!({
        "code": 200,
        "message": "Token valid.",
        "valid": true,
        "user_name": user.username,
    })))
}

async fn now_playing(
    State(ingestor): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Option<NowPlayingView>>, AppError> {
    let user = ingestor.authenticate(listen_token(&headers)).await?;
    let view = ingestor.now_playing(user.id, Utc::now()).await?;
    Ok(Json(view))
}
