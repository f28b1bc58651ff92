use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::MissedTickBehavior;

use crate::chat::ChatApp;
use crate::error::{self, Error};
use crate::trace::HttpTraceLine;
use crate::types::StreamedChunk;
use crate::web::{AppState, Session};

const TRACE_INTERVAL: Duration = Duration::from_millis(100);

/// A chat submission from the page.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatForm {
    session_id: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionForm {
    session_id: String,
}

/// An error rendered as `{"error": ...}`.
pub(crate) enum ApiError {
    /// The page sent a submission that cannot be answered (400).
    Invalid(String),

    /// Scoring failed upstream, whatever the endpoint's own status was (502).
    Upstream(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Upstream(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Invalid(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Upstream(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl ChatForm {
    fn validate(self) -> Result<(String, String), ApiError> {
        if self.session_id.trim().is_empty() {
            return Err(ApiError::Invalid("session_id must not be empty".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(ApiError::Invalid("message must not be empty".to_string()));
        }
        Ok((self.session_id, self.message))
    }
}

/// `GET /api/health`
pub(crate) async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// `GET /api/info`
pub(crate) async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let level = state.level();
    let endpoint = state.client.endpoint();
    Json(json!({
        "level": level.number(),
        "title": level.title(),
        "streaming": level.streams(),
        "trace": level.traces(),
        "endpoint": {
            "scoring_uri": endpoint.scoring_uri.as_str(),
            "deployment": endpoint.deployment,
            "auth_mode": endpoint.auth_mode.to_string(),
        },
    }))
}

/// `POST /api/chat`
pub(crate) async fn chat(
    State(state): State<Arc<AppState>>,
    Json(form): Json<ChatForm>,
) -> Result<Json<Value>, ApiError> {
    let (session_id, message) = form.validate()?;
    let session = state.session(&session_id);
    let chat = session.chat();
    let mut chat = chat.lock().await;
    let response = chat.respond_simple(&message).await?;
    Ok(Json(json!({
        "answer": response.answer,
        "metadata": response.metadata,
        "history": chat.history(),
    })))
}

/// `POST /api/chat/stream`
pub(crate) async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(form): Json<ChatForm>,
) -> Result<Response, ApiError> {
    let (session_id, message) = form.validate()?;
    let session = state.session(&session_id);
    let traced = state.level().traces();
    Ok(Sse::new(answer_events(session, message, traced))
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// One wake-up of the answer loop.
enum Step {
    Chunk(Option<error::Result<StreamedChunk>>),
    Tick,
}

fn answer_events(
    session: Arc<Session>,
    message: String,
    traced: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let chat = session.chat();
        let mut chat = chat.lock_owned().await;
        let mut ticker = tokio::time::interval(TRACE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut answer = String::new();
        let mut failure = None;
        {
            let mut chunks = chat.respond_stream(&message);
            loop {
                // trace lines are flushed while the endpoint is still thinking
                let step = tokio::select! {
                    chunk = chunks.next() => Step::Chunk(chunk),
                    _ = ticker.tick(), if traced => Step::Tick,
                };
                if traced {
                    for line in session.trace().drain_new() {
                        yield Ok(trace_event(&line));
                    }
                }
                match step {
                    Step::Tick => {}
                    Step::Chunk(None) => break,
                    Step::Chunk(Some(Ok(chunk))) => {
                        answer.push_str(&chunk.answer);
                        yield Ok(event("chunk", json!({"text": chunk.answer})));
                    }
                    Step::Chunk(Some(Err(err))) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }
        if traced {
            for line in session.trace().drain_new() {
                yield Ok(trace_event(&line));
            }
        }
        let last = match failure {
            Some(err) => event("error", json!({"message": err.to_string()})),
            None => event("done", json!({"answer": answer})),
        };
        yield Ok(last);
    }
}

fn event(name: &str, data: Value) -> Event {
    Event::default().event(name).data(data.to_string())
}

fn trace_event(line: &HttpTraceLine) -> Event {
    event(
        "trace",
        json!({"call": line.call, "direction": line.direction, "text": line.text}),
    )
}

/// `POST /api/clear`
pub(crate) async fn clear(
    State(state): State<Arc<AppState>>,
    Json(form): Json<SessionForm>,
) -> impl IntoResponse {
    if let Some(session) = state.sessions().get(&form.session_id) {
        session.chat().lock().await.clear();
        session.trace().clear();
        tracing::debug!(session_id = %form.session_id, "cleared chat session");
    }
    Json(json!({"cleared": true}))
}

/// `GET /api/trace?session_id=`
pub(crate) async fn trace(
    State(state): State<Arc<AppState>>,
    Query(form): Query<SessionForm>,
) -> impl IntoResponse {
    let lines = state
        .sessions()
        .get(&form.session_id)
        .map(|session| session.trace().lines())
        .unwrap_or_default();
    Json(json!({"lines": lines}))
}
