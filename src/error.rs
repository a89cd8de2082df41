//! Error types for the adapter layer
//!
//! The variants follow the failure taxonomy of the routing layer: transport
//! faults surface at the HTTP boundary, everything a tool can recover from is
//! folded into an `isError` tool result by the dispatcher.

use std::io;

use thiserror::Error;

/// Result type alias for the adapter layer
pub type Result<T> = std::result::Result<T, Error>;

/// Adapter layer errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed request, unsupported method or unknown session
    #[error("Transport error: {0}")]
    Transport(String),

    /// Missing or unusable upstream credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Tool arguments do not match the declared schema
    #[error("Validation error: {0}")]
    Validation(String),

    /// Failure reported by the upstream SaaS API
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// No tool registered under this name
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Context accessed outside of a `run_with_context` scope
    #[error("No request context is active for the current task")]
    ContextMissing,

    /// JSON-RPC error
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Transport(_) => rpc_codes::SERVER_ERROR_START,
            Self::UnknownTool(_) => rpc_codes::METHOD_NOT_FOUND,
            Self::Validation(_) => rpc_codes::INVALID_PARAMS,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Whether this error is recovered into a tool result instead of failing the exchange
    #[must_use]
    pub fn is_tool_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_) | Self::Internal(_) | Self::Io(_))
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
}
