//! SaaS MCP Bridge Library
//!
//! Multi-tenant request-routing layer between the Model Context Protocol
//! (JSON-RPC 2.0) and per-service SaaS adapter logic.
//!
//! # Features
//!
//! - **Tool Registry**: named operations with JSON Schema argument contracts
//! - **Credential Isolation**: per-call tenant context in task-local storage
//! - **Uniform Errors**: every tool call answers with content, failures as `isError`
//! - **Two Transports**: stateless streamable HTTP and the legacy SSE + POST pairing
//!
//! # Protocol Version
//!
//! Negotiates MCP protocol versions 2025-06-18, 2025-03-26 and 2024-11-05.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod tools;
pub mod transport;
pub mod upstream;
pub mod validation;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}"))),
    }
}
