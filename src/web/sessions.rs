use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;

use crate::chat::EndpointChat;
use crate::client::ScoringClient;
use crate::trace::TraceBuffer;

/// One browser session: its chat and, at Level 3, its HTTP trace.
#[derive(Debug)]
pub struct Session {
    chat: Arc<AsyncMutex<EndpointChat<ScoringClient>>>,
    trace: Arc<TraceBuffer>,
}

impl Session {
    /// Create a session scoring through `client`, attaching the trace buffer when `traced`.
    pub fn new(client: &ScoringClient, traced: bool) -> Self {
        let trace = Arc::new(TraceBuffer::new());
        let client = if traced {
            client.with_trace_logger(trace.clone())
        } else {
            client.clone()
        };
        Self {
            chat: Arc::new(AsyncMutex::new(EndpointChat::new(client))),
            trace,
        }
    }

    /// The chat, locked for one submission at a time.
    pub fn chat(&self) -> Arc<AsyncMutex<EndpointChat<ScoringClient>>> {
        Arc::clone(&self.chat)
    }

    pub fn trace(&self) -> &TraceBuffer {
        &self.trace
    }
}

/// How many sessions are kept before the least recently used one is dropped.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Sessions by id, capped at a fixed number.
///
/// Once the cap is reached, creating a session evicts the one that has gone unused the longest.
/// An evicted session that is still serving a request lives on until that request ends.
#[derive(Debug)]
pub struct SessionStore {
    capacity: usize,
    sessions: Mutex<Sessions>,
}

#[derive(Debug, Default)]
struct Sessions {
    by_id: HashMap<String, Entry>,
    clock: u64,
}

#[derive(Debug)]
struct Entry {
    session: Arc<Session>,
    last_used: u64,
}

impl Sessions {
    fn touch(&mut self, id: &str) -> Option<Arc<Session>> {
        self.clock += 1;
        let now = self.clock;
        let entry = self.by_id.get_mut(id)?;
        entry.last_used = now;
        Some(Arc::clone(&entry.session))
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .by_id
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            tracing::debug!(session_id = %id, "evicting idle chat session");
            self.by_id.remove(&id);
        }
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SESSIONS)
    }

    /// A store holding at most `capacity` sessions (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: Mutex::new(Sessions::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The session called `id`, if it exists.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions().touch(id)
    }

    /// The session called `id`, built by `make` if it does not exist yet.
    pub fn get_or_create(&self, id: &str, make: impl FnOnce() -> Session) -> Arc<Session> {
        let mut sessions = self.sessions();
        if let Some(session) = sessions.touch(id) {
            return session;
        }
        while sessions.by_id.len() >= self.capacity {
            sessions.evict_oldest();
        }
        tracing::debug!(session_id = id, "new chat session");
        let session = Arc::new(make());
        let last_used = sessions.clock;
        sessions.by_id.insert(
            id.to_string(),
            Entry {
                session: Arc::clone(&session),
                last_used,
            },
        );
        session
    }

    pub fn len(&self) -> usize {
        self.sessions().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().by_id.is_empty()
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
