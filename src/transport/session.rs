//! Legacy SSE session transport.
//!
//! `GET <sse_path>` opens a long-lived event stream and announces the command
//! endpoint in an `endpoint` event. Commands are POSTed to
//! `<messages_path>?sessionId=<id>`, answered with `202 Accepted`, and their
//! JSON-RPC responses are pushed back over the stream as `message` events.
//!
//! A session lives exactly as long as its stream: the [`SessionGuard`] is
//! owned by the stream and deregisters the session when the stream is
//! dropped. Sessions are process-local and do not survive a restart.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    Json,
    body::Body,
    extract::{Query, State},
    http::{Request, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::{AppState, read_json_body};
use crate::dispatcher::Reply;
use crate::{Error, Result};

/// One open SSE session
#[derive(Debug)]
pub struct Session {
    id: String,
    sender: mpsc::Sender<Reply>,
    created_at: DateTime<Utc>,
}

impl Session {
    /// Session identifier (UUID v4)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the stream was opened
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Queue a reply for delivery on the session's stream.
    ///
    /// Waits while the stream's buffer is full.
    pub async fn send(&self, reply: Reply) -> Result<()> {
        self.sender
            .send(reply)
            .await
            .map_err(|_| Error::Transport(format!("Session {} is closed", self.id)))
    }
}

/// Table of open sessions
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    buffer: usize,
}

impl SessionRegistry {
    /// Create a registry whose sessions buffer up to `buffer` undelivered replies
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a new session.
    ///
    /// The session stays registered until the returned guard is dropped.
    pub fn open(self: &Arc<Self>) -> (SessionGuard, mpsc::Receiver<Reply>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            sender,
            created_at: Utc::now(),
        });
        let id = session.id.clone();

        self.sessions.write().insert(id.clone(), session);
        info!(session_id = %id, "Opened SSE session");

        let guard = SessionGuard {
            registry: Arc::clone(self),
            id,
        };
        (guard, receiver)
    }

    /// Look up an open session
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Whether a session is open
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Remove a session. Returns whether it was registered.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id);
        if let Some(session) = &removed {
            let open_for = Utc::now() - session.created_at;
            info!(
                session_id = %id,
                open_secs = open_for.num_seconds(),
                "Closed SSE session"
            );
        }
        removed.is_some()
    }

    /// Number of open sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no sessions are open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

/// Keeps a session registered while alive
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: String,
}

impl SessionGuard {
    /// Id of the guarded session
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Query string of the command endpoint
#[derive(Debug, Deserialize)]
pub(crate) struct MessagesQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// GET handler: open a session stream
pub(crate) async fn sse_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (guard, mut receiver) = state.sessions.open();
    let endpoint = format!("{}?sessionId={}", state.transport.messages_path, guard.id());

    let stream = stream! {
        let guard = guard;
        yield Ok::<Event, Infallible>(Event::default().event("endpoint").data(endpoint));

        while let Some(reply) = receiver.recv().await {
            match serde_json::to_string(&reply) {
                Ok(data) => yield Ok::<Event, Infallible>(Event::default().event("message").data(data)),
                Err(e) => warn!(session_id = %guard.id(), error = %e, "Failed to encode reply"),
            }
        }

        debug!(session_id = %guard.id(), "Session channel drained");
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.transport.keep_alive_interval))
}

/// POST handler: submit one command to an open session
pub(crate) async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
    request: Request<Body>,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing sessionId parameter"})),
        )
            .into_response();
    };

    let Some(session) = state.sessions.get(&session_id) else {
        debug!(session_id = %session_id, "Command for unknown session");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Transport not found"})),
        )
            .into_response();
    };

    let (parts, body) = request.into_parts();
    let payload = match read_json_body(body, state.max_body_size).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    let context = state.new_context(&parts.headers);
    let dispatcher = Arc::clone(&state.dispatcher);
    let span = info_span!("session_command", session_id = %session_id, context = %context.id());

    tokio::spawn(
        async move {
            let Some(reply) = dispatcher.handle_payload(payload, context).await else {
                return;
            };
            if let Err(e) = session.send(reply).await {
                debug!(error = %e, "Dropping reply for closed session");
            }
        }
        .instrument(span),
    );

    (StatusCode::ACCEPTED, "Accepted").into_response()
}
