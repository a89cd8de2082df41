//! Tool dispatch and JSON-RPC method routing.
//!
//! [`Dispatcher::dispatch`] turns one [`ToolInvocation`] into exactly one
//! [`ToolsCallResult`]: unknown tools, invalid arguments, handler failures and
//! handler panics all come back as `isError` results the calling model can
//! read. Only faults the tool cannot own (see
//! [`Error::is_tool_recoverable`]) escape as `Err`, and the transports render
//! those as JSON-RPC `-32603`.
//!
//! [`Dispatcher::handle_payload`] is the JSON-RPC front door shared by both
//! transports, batches included.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::context::{RequestContext, run_with_context};
use crate::error::rpc_codes;
use crate::protocol::{
    Info, InitializeResult, JsonRpcResponse, PROTOCOL_VERSION, RequestId, ServerCapabilities,
    ToolsCallParams, ToolsCallResult, ToolsCapability, ToolsListResult, negotiate_version,
};
use crate::registry::{ToolInvocation, ToolRegistry};
use crate::validation::validate_arguments;
use crate::{Error, Result};

/// Reply to one inbound JSON-RPC payload
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Reply {
    /// Response to a single request
    Single(JsonRpcResponse),
    /// Responses to a batch, in request order (notifications omitted)
    Batch(Vec<JsonRpcResponse>),
}

impl Reply {
    /// Individual responses carried by this reply
    #[must_use]
    pub fn responses(&self) -> &[JsonRpcResponse] {
        match self {
            Self::Single(response) => std::slice::from_ref(response),
            Self::Batch(responses) => responses,
        }
    }
}

/// Routes calls to registered tool handlers
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    server_info: Info,
    instructions: Option<String>,
}

impl Dispatcher {
    /// Create a dispatcher over a start-up built registry
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            server_info: Info {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
            instructions: None,
        }
    }

    /// Override the `serverInfo` returned by `initialize`
    #[must_use]
    pub fn with_server_info(mut self, info: Info) -> Self {
        self.server_info = info;
        self
    }

    /// Set the instructions returned by `initialize`
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Registry this dispatcher routes into
    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one tool invocation on behalf of `context`.
    ///
    /// The handler runs inside a [`run_with_context`] scope and is called at
    /// most once.
    ///
    /// # Errors
    ///
    /// Only errors that are not tool-recoverable (transport, internal, I/O)
    /// are returned; everything else is folded into an `isError` result.
    pub async fn dispatch(
        &self,
        invocation: ToolInvocation,
        context: Arc<RequestContext>,
    ) -> Result<ToolsCallResult> {
        let name = invocation.name.clone();

        let Some(tool) = self.registry.lookup(&name) else {
            debug!(tool = %name, "Unknown tool requested");
            return Ok(ToolsCallResult::error(format!("Unknown tool: {name}")));
        };

        let checked = validate_arguments(&invocation.arguments, tool.descriptor.input_schema());
        if !checked.is_valid() {
            debug!(tool = %name, fields = ?checked.fields(), "Rejected tool arguments");
            return Ok(ToolsCallResult::error(format!(
                "Invalid arguments for tool {name}:\n{}",
                checked.describe()
            )));
        }

        let invocation = ToolInvocation::new(name.clone(), checked.arguments);
        let handler = Arc::clone(&tool.handler);
        let started = Instant::now();

        let outcome = AssertUnwindSafe(run_with_context(
            Arc::clone(&context),
            handler.call(invocation, context),
        ))
        .catch_unwind()
        .await;

        let elapsed_ms = started.elapsed().as_millis();
        match outcome {
            Ok(Ok(result)) => {
                debug!(tool = %name, elapsed_ms, is_error = result.is_error, "Tool call finished");
                Ok(result)
            }
            Ok(Err(e)) if e.is_tool_recoverable() => {
                warn!(tool = %name, elapsed_ms, error = %e, "Tool call failed");
                Ok(ToolsCallResult::error(format!(
                    "Error executing tool {name}: {e}"
                )))
            }
            Ok(Err(e)) => {
                error!(tool = %name, elapsed_ms, error = %e, "Tool call aborted");
                Err(e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(tool = %name, elapsed_ms, panic = %message, "Tool handler panicked");
                Ok(ToolsCallResult::error(format!(
                    "Error executing tool {name}: handler panicked: {message}"
                )))
            }
        }
    }

    /// Handle one inbound payload: a single message or a batch array.
    ///
    /// Returns `None` when nothing needs answering (notifications only).
    pub async fn handle_payload(&self, payload: Value, context: Arc<RequestContext>) -> Option<Reply> {
        match payload {
            Value::Array(messages) if messages.is_empty() => Some(Reply::Single(
                JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Empty batch"),
            )),
            Value::Array(messages) => {
                let mut responses = Vec::with_capacity(messages.len());
                for message in messages {
                    if let Some(response) = self.handle_message(message, Arc::clone(&context)).await {
                        responses.push(response);
                    }
                }
                (!responses.is_empty()).then_some(Reply::Batch(responses))
            }
            message => self.handle_message(message, context).await.map(Reply::Single),
        }
    }

    /// Handle one JSON-RPC message.
    ///
    /// Returns `None` for notifications.
    pub async fn handle_message(
        &self,
        message: Value,
        context: Arc<RequestContext>,
    ) -> Option<JsonRpcResponse> {
        let (id, method, params) = match parse_request(&message) {
            Ok(parsed) => parsed,
            Err(response) => return Some(response),
        };

        if is_notification_method(&method) {
            debug!(notification = %method, "Handling notification");
            return None;
        }

        // parse_request guarantees an id for everything but notifications
        let id = id?;
        debug!(method = %method, id = %id, context = %context.id(), "JSON-RPC request");

        let response = match method.as_str() {
            "initialize" => self.handle_initialize(id, params.as_ref()),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(id, params, context).await,
            _ => JsonRpcResponse::error(
                Some(id),
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ),
        };
        Some(response)
    }

    fn handle_initialize(&self, id: RequestId, params: Option<&Value>) -> JsonRpcResponse {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        let negotiated = negotiate_version(requested);
        debug!(client = requested, negotiated, "Protocol version negotiation");

        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: ServerCapabilities {
                logging: None,
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        };
        success(id, &result)
    }

    fn handle_tools_list(&self, id: RequestId) -> JsonRpcResponse {
        let result = ToolsListResult {
            tools: self.registry.list_tools().map(|d| d.to_tool()).collect(),
            next_cursor: None,
        };
        success(id, &result)
    }

    async fn handle_tools_call(
        &self,
        id: RequestId,
        params: Option<Value>,
        context: Arc<RequestContext>,
    ) -> JsonRpcResponse {
        let params: ToolsCallParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::INVALID_PARAMS,
                    format!("Invalid tools/call params: {e}"),
                );
            }
            None => {
                return JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::INVALID_PARAMS,
                    "Missing tools/call params",
                );
            }
        };

        let invocation = ToolInvocation::new(params.name, params.arguments);
        match self.dispatch(invocation, context).await {
            Ok(result) => success(id, &result),
            Err(e) => JsonRpcResponse::error(Some(id), rpc_codes::INTERNAL_ERROR, e.to_string()),
        }
    }
}

fn success<T: Serialize>(id: RequestId, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(
            Some(id),
            rpc_codes::INTERNAL_ERROR,
            Error::from(e).to_string(),
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Check whether a method name represents a notification (no response expected).
fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Parse a JSON-RPC request or notification into `(id, method, params)`.
///
/// The id is `None` only for notifications.
#[allow(clippy::result_large_err)]
pub fn parse_request(
    value: &Value,
) -> std::result::Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    if !value.is_object() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Request must be a JSON object",
        ));
    }

    if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(RequestId::from_value);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method"))?;

    if !is_notification_method(method) && id.is_none() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Missing id",
        ));
    }

    Ok((id, method.to_string(), value.get("params").cloned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Credentials, current_context};
    use crate::registry::{ToolDescriptor, handler_fn};
    use pretty_assertions::assert_eq;

    fn get_record_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "limit": {"type": "integer"}
            },
            "required": ["id"]
        })
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDescriptor::new("records_get", "Fetch a record")
                    .with_schema(get_record_schema())
                    .read_only(true),
                handler_fn(|inv: ToolInvocation, _ctx| async move {
                    Ok(ToolsCallResult::json(&inv.arguments))
                }),
            )
            .unwrap();
        registry
            .register(
                ToolDescriptor::new("who", "Report the caller's token"),
                handler_fn(|_inv: ToolInvocation, _ctx| async move {
                    let ctx = current_context()?;
                    let token = ctx.require_access_token()?.to_string();
                    Ok::<_, Error>(ToolsCallResult::text(token))
                }),
            )
            .unwrap();
        registry
            .register(
                ToolDescriptor::new("flaky", "Always fails upstream"),
                handler_fn(|_inv: ToolInvocation, _ctx| async move {
                    Err::<ToolsCallResult, _>(Error::Upstream("HTTP 503 Service Unavailable".into()))
                }),
            )
            .unwrap();
        registry
            .register(
                ToolDescriptor::new("broken", "Panics"),
                handler_fn(|_inv: ToolInvocation, _ctx| async move {
                    if true {
                        panic!("index out of range");
                    }
                    Ok(ToolsCallResult::text("unreachable"))
                }),
            )
            .unwrap();
        registry
            .register(
                ToolDescriptor::new("fatal", "Internal failure"),
                handler_fn(|_inv: ToolInvocation, _ctx| async move {
                    Err::<ToolsCallResult, _>(Error::Internal("state corrupted".into()))
                }),
            )
            .unwrap();
        Dispatcher::new(Arc::new(registry))
    }

    fn ctx() -> Arc<RequestContext> {
        Arc::new(RequestContext::anonymous())
    }

    fn token_ctx(token: &str) -> Arc<RequestContext> {
        Arc::new(RequestContext::new(Credentials::Token(token.to_string()), None))
    }

    // ── dispatch ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_is_error_result() {
        let result = dispatcher()
            .dispatch(ToolInvocation::new("nope", json!({})), ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.joined_text(), "Unknown tool: nope");
    }

    #[tokio::test]
    async fn missing_required_argument_names_the_field() {
        let result = dispatcher()
            .dispatch(ToolInvocation::new("records_get", json!({})), ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        let text = result.joined_text();
        assert!(text.starts_with("Invalid arguments for tool records_get:"));
        assert!(text.contains("Parameter 'id': required parameter is missing"));
    }

    #[tokio::test]
    async fn required_argument_checked_when_schema_has_no_properties() {
        let registry = ToolRegistry::new()
            .with_tool(
                ToolDescriptor::new("records_archive", "Archive a record")
                    .with_schema(json!({"type": "object", "required": ["id"]})),
                handler_fn(|_inv: ToolInvocation, _ctx| async move {
                    Ok(ToolsCallResult::text("archived"))
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let result = dispatcher
            .dispatch(ToolInvocation::new("records_archive", json!({})), ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(
            result
                .joined_text()
                .contains("Parameter 'id': required parameter is missing")
        );

        let result = dispatcher
            .dispatch(ToolInvocation::new("records_archive", json!({"id": "r1"})), ctx())
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.joined_text(), "archived");
    }

    #[tokio::test]
    async fn handler_sees_coerced_arguments() {
        let result = dispatcher()
            .dispatch(
                ToolInvocation::new("records_get", json!({"id": "r1", "limit": "42"})),
                ctx(),
            )
            .await
            .unwrap();
        assert!(!result.is_error);
        let echoed: Value = serde_json::from_str(&result.joined_text()).unwrap();
        assert_eq!(echoed, json!({"id": "r1", "limit": 42}));
    }

    #[tokio::test]
    async fn handler_error_is_wrapped() {
        let result = dispatcher()
            .dispatch(ToolInvocation::new("flaky", json!({})), ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(
            result.joined_text(),
            "Error executing tool flaky: Upstream error: HTTP 503 Service Unavailable"
        );
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let dispatcher = dispatcher();
        let result = dispatcher
            .dispatch(ToolInvocation::new("broken", json!({})), ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.joined_text().contains("index out of range"));

        // The dispatcher keeps working afterwards
        let again = dispatcher
            .dispatch(ToolInvocation::new("records_get", json!({"id": "x"})), ctx())
            .await
            .unwrap();
        assert!(!again.is_error);
    }

    #[tokio::test]
    async fn internal_error_escapes_dispatch() {
        let err = dispatcher()
            .dispatch(ToolInvocation::new("fatal", json!({})), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn handler_reads_ambient_context() {
        let result = dispatcher()
            .dispatch(ToolInvocation::new("who", json!({})), token_ctx("tenant-a"))
            .await
            .unwrap();
        assert_eq!(result.joined_text(), "tenant-a");
    }

    #[tokio::test]
    async fn missing_credentials_fail_inside_handler() {
        let result = dispatcher()
            .dispatch(ToolInvocation::new("who", json!({})), ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.joined_text().contains("Authentication error"));
    }

    #[tokio::test]
    async fn context_is_released_after_dispatch() {
        let context = token_ctx("t");
        dispatcher()
            .dispatch(ToolInvocation::new("who", json!({})), Arc::clone(&context))
            .await
            .unwrap();
        assert_eq!(Arc::strong_count(&context), 1);
    }

    // ── JSON-RPC routing ──────────────────────────────────────────────────

    #[tokio::test]
    async fn initialize_negotiates_version() {
        let response = dispatcher()
            .handle_message(
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                       "params": {"protocolVersion": "2024-11-05"}}),
                ctx(),
            )
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let response = dispatcher()
            .handle_message(json!({"jsonrpc": "2.0", "id": "p", "method": "ping"}), ctx())
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({})));
        assert_eq!(response.id, Some(RequestId::String("p".into())));
    }

    #[tokio::test]
    async fn tools_list_in_registration_order() {
        let response = dispatcher()
            .handle_message(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}), ctx())
            .await
            .unwrap();
        let result = response.result.unwrap();
        let names: Vec<&str> = result["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["records_get", "who", "flaky", "broken", "fatal"]);
        assert_eq!(result["tools"][0]["annotations"]["readOnlyHint"], true);
    }

    #[tokio::test]
    async fn tools_call_wraps_result() {
        let response = dispatcher()
            .handle_message(
                json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                       "params": {"name": "nope", "arguments": {}}}),
                ctx(),
            )
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "Unknown tool: nope");
    }

    #[tokio::test]
    async fn tools_call_internal_failure_is_rpc_error() {
        let response = dispatcher()
            .handle_message(
                json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call",
                       "params": {"name": "fatal"}}),
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, rpc_codes::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn tools_call_without_params_is_invalid_params() {
        let response = dispatcher()
            .handle_message(json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call"}), ctx())
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, rpc_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let response = dispatcher()
            .handle_message(
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                ctx(),
            )
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let response = dispatcher()
            .handle_message(json!({"jsonrpc": "2.0", "id": 6, "method": "resources/list"}), ctx())
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, rpc_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let d = dispatcher();
        for bad in [
            json!({"id": 1, "method": "ping"}),
            json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "method": "ping"}),
            json!("ping"),
        ] {
            let response = d.handle_message(bad.clone(), ctx()).await.unwrap();
            assert_eq!(
                response.error.unwrap().code,
                rpc_codes::INVALID_REQUEST,
                "payload: {bad}"
            );
        }
    }

    #[tokio::test]
    async fn batch_answers_requests_and_skips_notifications() {
        let reply = dispatcher()
            .handle_payload(
                json!([
                    {"jsonrpc": "2.0", "id": 1, "method": "ping"},
                    {"jsonrpc": "2.0", "method": "notifications/initialized"},
                    {"jsonrpc": "2.0", "id": 2, "method": "tools/list"}
                ]),
                ctx(),
            )
            .await
            .unwrap();
        let ids: Vec<Option<RequestId>> = reply.responses().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![Some(RequestId::Number(1)), Some(RequestId::Number(2))]);
        assert!(serde_json::to_value(&reply).unwrap().is_array());
    }

    #[tokio::test]
    async fn notification_only_batch_has_no_reply() {
        let reply = dispatcher()
            .handle_payload(
                json!([{"jsonrpc": "2.0", "method": "notifications/cancelled"}]),
                ctx(),
            )
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let reply = dispatcher().handle_payload(json!([]), ctx()).await.unwrap();
        assert_eq!(
            reply.responses()[0].error.as_ref().unwrap().code,
            rpc_codes::INVALID_REQUEST
        );
    }
}
