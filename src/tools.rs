//! Generic tools every adapter binary ships with.
//!
//! Service-specific adapters register their own tools next to these; the
//! stand-alone binary serves only these two.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::Result;
use crate::context::RequestContext;
use crate::protocol::ToolsCallResult;
use crate::registry::{ToolDescriptor, ToolInvocation, ToolRegistry, handler_fn};

/// Register `whoami` and `upstream_get`
pub fn register_builtin_tools(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ToolDescriptor::new(
            "whoami",
            "Report whether upstream credentials accompany this call and their shape. Never reveals credential values.",
        )
        .with_category("diagnostics")
        .read_only(true),
        handler_fn(whoami),
    )?;

    registry.register(
        ToolDescriptor::new(
            "upstream_get",
            "Perform a read-only GET against the upstream API with the caller's credentials and return the JSON body.",
        )
        .with_schema(json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the configured upstream base URL, e.g. /contacts/42",
                    "minLength": 1
                },
                "query": {
                    "type": "object",
                    "description": "Query string parameters"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        }))
        .with_category("upstream")
        .read_only(true),
        handler_fn(upstream_get),
    )?;

    Ok(())
}

async fn whoami(_invocation: ToolInvocation, context: Arc<RequestContext>) -> Result<ToolsCallResult> {
    let credentials = context.credentials();
    Ok(ToolsCallResult::json(&json!({
        "context": context.id(),
        "credentials": {
            "present": !credentials.is_empty(),
            "kind": credentials.kind(),
            "has_access_token": credentials.access_token().is_some(),
            "fields": credentials.field_names(),
        }
    })))
}

async fn upstream_get(invocation: ToolInvocation, context: Arc<RequestContext>) -> Result<ToolsCallResult> {
    let path = invocation.str_arg("path")?;
    let query = invocation.arg("query").filter(|q| q.is_object());

    let client = context.upstream().await?;
    let body: Value = client.get(path, query).await?;
    Ok(ToolsCallResult::json(&body))
}
