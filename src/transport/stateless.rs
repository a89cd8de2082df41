//! Streamable HTTP transport (stateless mode).
//!
//! Every POST gets its own [`ServerInstance`]: created idle, connected to a
//! context built from that POST's headers, used for exactly one payload and
//! closed once the response exists. Nothing survives between POSTs, so GET
//! and DELETE (which only make sense for sessions) are refused with 405.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use futures::Stream;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{AppState, read_json_body, rpc_error_response};
use crate::context::RequestContext;
use crate::dispatcher::{Dispatcher, Reply};
use crate::error::rpc_codes;
use crate::{Error, Result};

/// Fixed body answered to GET and DELETE on the stateless endpoint
pub const METHOD_NOT_ALLOWED_BODY: &str =
    r#"{"jsonrpc":"2.0","error":{"code":-32000,"message":"Method not allowed."},"id":null}"#;

/// Lifecycle of one stateless exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Created, no request bound yet
    Idle,
    /// Bound to a request context
    Connected,
    /// Payload handed to the dispatcher
    Handling,
    /// Released; the context has been dropped
    Closed,
}

/// Server and transport pair serving exactly one POST
pub struct ServerInstance {
    id: String,
    state: ExchangeState,
    dispatcher: Arc<Dispatcher>,
    context: Option<Arc<RequestContext>>,
}

impl ServerInstance {
    /// Create an idle instance
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let id = format!("exch-{}", Uuid::new_v4());
        debug!(exchange = %id, state = ?ExchangeState::Idle, "Exchange created");
        Self {
            id,
            state: ExchangeState::Idle,
            dispatcher,
            context: None,
        }
    }

    /// Exchange identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Bind the request context. Only valid on an idle instance.
    pub fn connect(&mut self, context: Arc<RequestContext>) -> Result<()> {
        if self.state != ExchangeState::Idle {
            return Err(Error::Transport(format!(
                "exchange {} cannot connect while {:?}",
                self.id, self.state
            )));
        }
        self.context = Some(context);
        self.transition(ExchangeState::Connected);
        Ok(())
    }

    /// Handle the exchange's single payload.
    ///
    /// Returns `None` when the payload only carried notifications.
    pub async fn handle(&mut self, payload: Value) -> Result<Option<Reply>> {
        let context = match (&self.context, self.state) {
            (Some(context), ExchangeState::Connected) => Arc::clone(context),
            _ => {
                return Err(Error::Transport(format!(
                    "exchange {} cannot handle a payload while {:?}",
                    self.id, self.state
                )));
            }
        };
        self.transition(ExchangeState::Handling);
        Ok(self.dispatcher.handle_payload(payload, context).await)
    }

    /// Release the exchange. Idempotent.
    pub fn close(&mut self) {
        if self.state == ExchangeState::Closed {
            return;
        }
        self.context = None;
        self.transition(ExchangeState::Closed);
    }

    fn transition(&mut self, next: ExchangeState) {
        debug!(exchange = %self.id, from = ?self.state, to = ?next, "Exchange state change");
        self.state = next;
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        self.close();
    }
}

/// POST handler for the stateless endpoint
pub(crate) async fn post_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let payload = match read_json_body(body, state.max_body_size).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    let mut instance = ServerInstance::new(Arc::clone(&state.dispatcher));
    if let Err(e) = instance.connect(state.new_context(&parts.headers)) {
        error!(error = %e, "Failed to connect exchange");
        return rpc_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            rpc_codes::INTERNAL_ERROR,
            &e.to_string(),
        );
    }

    if accepts_only_event_stream(&parts.headers) && !is_notification_only(&payload) {
        return sse_reply(instance, payload).into_response();
    }

    let outcome = instance.handle(payload).await;
    instance.close();

    match outcome {
        Ok(Some(reply)) => Json(reply).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!(error = %e, "Exchange failed");
            rpc_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                rpc_codes::INTERNAL_ERROR,
                &e.to_string(),
            )
        }
    }
}

/// GET and DELETE handler for the stateless endpoint
pub(crate) async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::ALLOW, "POST"),
        ],
        METHOD_NOT_ALLOWED_BODY,
    )
        .into_response()
}

/// Stream the exchange's responses as SSE `message` events.
///
/// The instance is owned by the stream, so a client that disconnects early
/// drops (and thereby closes) it along with any in-flight handler work.
fn sse_reply(
    mut instance: ServerInstance,
    payload: Value,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = stream! {
        match instance.handle(payload).await {
            Ok(Some(reply)) => {
                for response in reply.responses() {
                    match serde_json::to_string(response) {
                        Ok(data) => yield Ok::<Event, Infallible>(Event::default().event("message").data(data)),
                        Err(e) => warn!(exchange = %instance.id(), error = %e, "Failed to encode response"),
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(exchange = %instance.id(), error = %e, "Exchange failed");
                let body = serde_json::json!({
                    "jsonrpc": "2.0",
                    "error": {"code": rpc_codes::INTERNAL_ERROR, "message": e.to_string()},
                    "id": null
                });
                yield Ok::<Event, Infallible>(Event::default().event("message").data(body.to_string()));
            }
        }
        instance.close();
    };
    Sse::new(stream)
}

/// Whether the client accepts `text/event-stream` and nothing else
fn accepts_only_event_stream(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let mut media_types = accept
        .split(',')
        .map(|part| part.split(';').next().unwrap_or("").trim())
        .filter(|t| !t.is_empty())
        .peekable();
    media_types.peek().is_some() && media_types.all(|t| t.eq_ignore_ascii_case("text/event-stream"))
}

/// Whether a payload consists solely of notifications
fn is_notification_only(payload: &Value) -> bool {
    let is_notification = |message: &Value| {
        message.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
            && message
                .get("method")
                .and_then(Value::as_str)
                .is_some_and(|m| m.starts_with("notifications/"))
    };
    match payload {
        Value::Array(messages) => !messages.is_empty() && messages.iter().all(is_notification),
        message => is_notification(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Credentials;
    use crate::registry::ToolRegistry;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn instance() -> ServerInstance {
        ServerInstance::new(Arc::new(Dispatcher::new(Arc::new(ToolRegistry::new()))))
    }

    #[tokio::test]
    async fn lifecycle_walks_every_state() {
        let mut exchange = instance();
        assert_eq!(exchange.state(), ExchangeState::Idle);

        exchange
            .connect(Arc::new(RequestContext::anonymous()))
            .unwrap();
        assert_eq!(exchange.state(), ExchangeState::Connected);

        let reply = exchange
            .handle(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        assert!(reply.is_some());
        assert_eq!(exchange.state(), ExchangeState::Handling);

        exchange.close();
        assert_eq!(exchange.state(), ExchangeState::Closed);
    }

    #[tokio::test]
    async fn handle_requires_connection() {
        let mut exchange = instance();
        let err = exchange
            .handle(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn instance_serves_a_single_payload() {
        let mut exchange = instance();
        exchange
            .connect(Arc::new(RequestContext::anonymous()))
            .unwrap();
        exchange
            .handle(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        assert!(
            exchange
                .handle(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
                .await
                .is_err()
        );
    }

    #[test]
    fn close_and_drop_release_the_context() {
        let context = Arc::new(RequestContext::new(Credentials::Token("t".into()), None));

        let mut closed = instance();
        closed.connect(Arc::clone(&context)).unwrap();
        assert_eq!(Arc::strong_count(&context), 2);
        closed.close();
        assert_eq!(Arc::strong_count(&context), 1);

        let mut dropped = instance();
        dropped.connect(Arc::clone(&context)).unwrap();
        drop(dropped);
        assert_eq!(Arc::strong_count(&context), 1);
    }

    #[test]
    fn connect_twice_is_rejected() {
        let mut exchange = instance();
        exchange
            .connect(Arc::new(RequestContext::anonymous()))
            .unwrap();
        assert!(
            exchange
                .connect(Arc::new(RequestContext::anonymous()))
                .is_err()
        );
    }

    #[test]
    fn event_stream_only_accept_detection() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_only_event_stream(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        assert!(accepts_only_event_stream(&headers));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        assert!(!accepts_only_event_stream(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        assert!(!accepts_only_event_stream(&headers));
    }

    #[test]
    fn notification_only_detection() {
        assert!(is_notification_only(
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
        ));
        assert!(is_notification_only(&json!([
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "method": "notifications/cancelled"}
        ])));
        assert!(!is_notification_only(&json!([
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "id": 1, "method": "ping"}
        ])));
        assert!(!is_notification_only(&json!([])));
    }

    #[test]
    fn method_not_allowed_body_is_exact() {
        let parsed: Value = serde_json::from_str(METHOD_NOT_ALLOWED_BODY).unwrap();
        assert_eq!(parsed["error"]["code"], -32000);
        assert_eq!(parsed["error"]["message"], "Method not allowed.");
        assert_eq!(parsed["id"], Value::Null);
    }
}
