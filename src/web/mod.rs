//! The browser front-end.
//!
//! [`router`] serves an embedded chat page and the JSON/SSE API it talks to.  What the API offers
//! depends on the [`UiLevel`]:
//!
//! - Level 1 ([`UiLevel::OneShot`]): `POST /api/chat` answers in one piece.
//! - Level 2 ([`UiLevel::Streaming`]): `POST /api/chat/stream` answers as server-sent events.
//! - Level 3 ([`UiLevel::StreamingWithTrace`]): as Level 2, with every raw HTTP line of the
//!   scoring call mirrored as `trace` events and kept for `GET /api/trace`.
//!
//! Each browser tab picks a session id; every session has its own history and trace.

mod assets;
mod handlers;
mod sessions;

use std::fmt;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::client::ScoringClient;
use crate::config::{Config, ServerSettings};
use crate::error::{Error, Result};
use crate::resolver::resolve_endpoint;

pub use sessions::{DEFAULT_MAX_SESSIONS, Session, SessionStore};

/// Which of the three chat front-ends to serve.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiLevel {
    /// Complete answers only.
    OneShot,

    /// Answers stream in as they are generated.
    Streaming,

    /// Streaming plus a live view of the raw HTTP exchange.
    StreamingWithTrace,
}

impl UiLevel {
    /// 1, 2 or 3.
    pub fn number(self) -> u8 {
        match self {
            UiLevel::OneShot => 1,
            UiLevel::Streaming => 2,
            UiLevel::StreamingWithTrace => 3,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            UiLevel::OneShot => "Level 1: Simple Chat",
            UiLevel::Streaming => "Level 2: Streaming Chat",
            UiLevel::StreamingWithTrace => "Level 3: Streaming Chat with HTTP Trace",
        }
    }

    pub fn streams(self) -> bool {
        !matches!(self, UiLevel::OneShot)
    }

    pub fn traces(self) -> bool {
        matches!(self, UiLevel::StreamingWithTrace)
    }
}

impl fmt::Display for UiLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title())
    }
}

/// State shared by every request.
#[derive(Debug)]
pub struct AppState {
    level: UiLevel,
    client: ScoringClient,
    sessions: SessionStore,
}

impl AppState {
    /// Create the state for `level`, scoring through `client`.
    pub fn new(level: UiLevel, client: ScoringClient) -> Self {
        Self {
            level,
            client,
            sessions: SessionStore::new(),
        }
    }

    /// Keep at most `max_sessions` sessions, dropping the least recently used first.
    pub fn with_session_limit(mut self, max_sessions: usize) -> Self {
        self.sessions = SessionStore::with_capacity(max_sessions);
        self
    }

    pub fn level(&self) -> UiLevel {
        self.level
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The session called `id`, created on first use.
    pub fn session(&self, id: &str) -> Arc<Session> {
        self.sessions
            .get_or_create(id, || Session::new(&self.client, self.level.traces()))
    }
}

/// Build the router for `level`.
pub fn router(level: UiLevel, client: ScoringClient) -> Router {
    router_with_state(Arc::new(AppState::new(level, client)))
}

/// Build the router over existing state.
pub fn router_with_state(state: Arc<AppState>) -> Router {
    let level = state.level;
    let mut app = Router::new()
        .route("/", get(assets::index))
        .route("/assets/main.css", get(assets::stylesheet))
        .route("/api/info", get(handlers::info))
        .route("/api/health", get(handlers::health))
        .route("/api/clear", post(handlers::clear));
    app = if level.streams() {
        app.route("/api/chat/stream", post(handlers::chat_stream))
    } else {
        app.route("/api/chat", post(handlers::chat))
    };
    if level.traces() {
        app = app.route("/api/trace", get(handlers::trace));
    }
    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Resolve the configured endpoint, then serve `level` until Ctrl-C.
///
/// Configuration and resolution errors are returned before anything is bound.
pub async fn launch(level: UiLevel) -> Result<()> {
    let config = Config::from_env()?;
    let settings = ServerSettings::from_env()?;
    let endpoint = resolve_endpoint(&config).await?;
    let client = ScoringClient::with_options(
        endpoint,
        Some(settings.request_timeout),
        Some(settings.replay_delay),
    )?;

    let listener = TcpListener::bind(settings.bind_addr)
        .await
        .map_err(|e| Error::io(format!("cannot listen on {}", settings.bind_addr), e))?;
    let addr = listener
        .local_addr()
        .map_err(|e| Error::io("cannot read the bound address", e))?;
    tracing::info!("{level} running on http://{addr}");

    let state = AppState::new(level, client).with_session_limit(settings.max_sessions);
    axum::serve(listener, router_with_state(Arc::new(state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::io("server failed", e))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(UiLevel::OneShot.number(), 1);
        assert!(!UiLevel::OneShot.streams());
        assert!(UiLevel::Streaming.streams());
        assert!(!UiLevel::Streaming.traces());
        assert!(UiLevel::StreamingWithTrace.traces());
        assert_eq!(UiLevel::StreamingWithTrace.number(), 3);
        assert_eq!(
            serde_json::to_value(UiLevel::StreamingWithTrace).unwrap(),
            "streaming_with_trace"
        );
    }
}
