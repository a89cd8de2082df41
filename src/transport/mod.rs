//! HTTP transports and the router that mounts them.
//!
//! Two generations of the MCP HTTP transport are served side by side:
//!
//! - [`stateless`]: streamable HTTP, one POST per exchange, no session state
//! - [`session`]: the legacy SSE channel paired with a POST command path
//!
//! Both extract tenant credentials from the inbound request, build a fresh
//! [`RequestContext`] and hand the payload to the shared [`Dispatcher`].

pub mod session;
pub mod stateless;

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

pub use session::{Session, SessionGuard, SessionRegistry};
pub use stateless::{ExchangeState, ServerInstance};

use crate::config::TransportConfig;
use crate::context::{CredentialExtractor, RequestContext};
use crate::dispatcher::Dispatcher;
use crate::error::rpc_codes;
use crate::upstream::UpstreamFactory;

/// Shared application state
pub struct AppState {
    /// Dispatcher over the tool registry
    pub dispatcher: Arc<Dispatcher>,
    /// Tenant credential extraction
    pub extractor: CredentialExtractor,
    /// Upstream client factory handed to every request context
    pub factory: Option<Arc<dyn UpstreamFactory>>,
    /// Open legacy SSE sessions
    pub sessions: Arc<SessionRegistry>,
    /// Transport configuration
    pub transport: TransportConfig,
    /// Maximum accepted request body in bytes
    pub max_body_size: usize,
}

impl AppState {
    /// Build a fresh context for one inbound call from its headers
    #[must_use]
    pub fn new_context(&self, headers: &HeaderMap) -> Arc<RequestContext> {
        let credentials = self.extractor.extract(headers);
        Arc::new(RequestContext::new(credentials, self.factory.clone()))
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let transport = state.transport.clone();

    Router::new()
        .route("/health", get(health_handler))
        .route(
            &transport.stateless_path,
            post(stateless::post_handler)
                .get(stateless::method_not_allowed)
                .delete(stateless::method_not_allowed),
        )
        .route(&transport.sse_path, get(session::sse_handler))
        .route(&transport.messages_path, post(session::messages_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "tools": state.dispatcher.registry().len(),
        "sessions": state.sessions.len(),
    }))
}

/// Read and parse a JSON request body, answering transport faults directly.
pub(crate) async fn read_json_body(body: Body, limit: usize) -> Result<Value, Response> {
    let bytes = axum::body::to_bytes(body, limit).await.map_err(|e| {
        rpc_error_response(
            StatusCode::BAD_REQUEST,
            rpc_codes::PARSE_ERROR,
            &format!("Failed to read body: {e}"),
        )
    })?;

    serde_json::from_slice(&bytes).map_err(|e| {
        rpc_error_response(
            StatusCode::BAD_REQUEST,
            rpc_codes::PARSE_ERROR,
            &format!("Invalid JSON: {e}"),
        )
    })
}

/// JSON-RPC error envelope with a `null` id
pub(crate) fn rpc_error_response(status: StatusCode, code: i32, message: &str) -> Response {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "error": {"code": code, "message": message},
            "id": null
        })),
    )
        .into_response()
}
