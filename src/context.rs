//! Per-call tenant context and its task-local propagation.
//!
//! Every inbound call gets its own [`RequestContext`] holding the tenant's
//! upstream credentials and a lazily built upstream client. The context is
//! installed with [`run_with_context`] and read from anywhere below it in the
//! call chain with [`current_context`].
//!
//! # Isolation
//!
//! The context lives in a `tokio::task_local!` slot scoped to one future.
//! Two scopes polled concurrently (on the same or different worker threads)
//! each see only their own value, and the value is dropped as soon as the
//! scoped future settles. Work moved onto a fresh `tokio::spawn` does not
//! inherit the scope; pass the `Arc<RequestContext>` explicitly in that case.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

use crate::config::CredentialsConfig;
use crate::upstream::{UpstreamClient, UpstreamFactory};
use crate::{Error, Result};

tokio::task_local! {
    /// Context of the call currently being served by this task.
    static CURRENT_CONTEXT: Arc<RequestContext>;
}

/// Fields probed for an access token when none are configured
pub const DEFAULT_TOKEN_FIELDS: &[&str] = &["access_token", "token", "api_key"];

/// Tenant credential bundle.
///
/// `Empty` is a sentinel, not an error: listing tools needs no credentials,
/// and tools that do need them fail inside their handler.
#[derive(Clone, Default, PartialEq)]
pub enum Credentials {
    /// No credentials were supplied
    #[default]
    Empty,
    /// Raw token
    Token(String),
    /// Structured credentials (e.g. `{"access_token": "...", "workspace": "..."}`)
    Json(Map<String, Value>),
}

// Secrets never reach log output.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Credentials::Empty"),
            Self::Token(_) => f.write_str("Credentials::Token(<redacted>)"),
            Self::Json(map) => {
                let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                write!(f, "Credentials::Json(keys={keys:?})")
            }
        }
    }
}

impl Credentials {
    /// Interpret a raw credential string: a JSON object, a JSON string, or a bare token.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Self::Json(map),
            Ok(Value::String(token)) if !token.is_empty() => Self::Token(token),
            _ => Self::Token(trimmed.to_string()),
        }
    }

    /// Decode a header value carrying base64-encoded JSON.
    ///
    /// Standard and URL-safe alphabets are accepted, with or without padding.
    /// Returns `None` when the value is not decodable.
    #[must_use]
    pub fn from_header_value(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let bytes = [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(trimmed).ok())?;
        match serde_json::from_slice::<Value>(&bytes).ok()? {
            Value::Object(map) => Some(Self::Json(map)),
            Value::String(token) if !token.is_empty() => Some(Self::Token(token)),
            _ => None,
        }
    }

    /// Whether no credential material is present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Token(t) => t.is_empty(),
            Self::Json(map) => map.is_empty(),
        }
    }

    /// Shape of the credentials, safe to log or show to a model
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "none",
            Self::Token(_) => "token",
            Self::Json(_) => "json",
        }
    }

    /// Access token using the default field list
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token_from(DEFAULT_TOKEN_FIELDS)
    }

    /// Access token: the raw token, or the first non-empty string among `fields`
    #[must_use]
    pub fn access_token_from<S: AsRef<str>>(&self, fields: &[S]) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Token(t) => Some(t.as_str()).filter(|t| !t.is_empty()),
            Self::Json(map) => fields
                .iter()
                .filter_map(|f| map.get(f.as_ref()).and_then(Value::as_str))
                .find(|v| !v.is_empty()),
        }
    }

    /// Names of the structured credential fields (values are never exposed)
    #[must_use]
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            Self::Json(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Service-specific field of structured credentials
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Json(map) => map.get(name),
            _ => None,
        }
    }
}

/// Extracts tenant credentials from inbound requests.
///
/// Priority: process-wide default, then the credentials header, then
/// [`Credentials::Empty`].
#[derive(Debug, Clone)]
pub struct CredentialExtractor {
    default: Option<Credentials>,
    header: HeaderName,
}

impl CredentialExtractor {
    /// Build from configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the header name is not a valid HTTP header.
    pub fn new(config: &CredentialsConfig) -> Result<Self> {
        let header = HeaderName::try_from(config.header.to_ascii_lowercase())
            .map_err(|e| Error::Config(format!("Invalid credentials header: {e}")))?;
        let default = config
            .default_token
            .as_deref()
            .map(Credentials::parse)
            .filter(|c| !c.is_empty());
        Ok(Self { default, header })
    }

    /// Header this extractor reads
    #[must_use]
    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    /// Extract credentials from request headers. Never fails.
    #[must_use]
    pub fn extract(&self, headers: &HeaderMap) -> Credentials {
        if let Some(default) = &self.default {
            return default.clone();
        }

        let Some(value) = headers.get(&self.header) else {
            return Credentials::Empty;
        };

        match value.to_str().ok().and_then(Credentials::from_header_value) {
            Some(credentials) => credentials,
            None => {
                debug!(header = %self.header, "Credentials header is not base64 JSON, ignoring");
                Credentials::Empty
            }
        }
    }
}

/// State belonging to exactly one inbound call
pub struct RequestContext {
    id: String,
    credentials: Credentials,
    factory: Option<Arc<dyn UpstreamFactory>>,
    upstream: OnceCell<Arc<dyn UpstreamClient>>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("credentials", &self.credentials)
            .field("upstream_built", &self.upstream.initialized())
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    /// Create a context for one call
    #[must_use]
    pub fn new(credentials: Credentials, factory: Option<Arc<dyn UpstreamFactory>>) -> Self {
        Self {
            id: format!("ctx-{}", Uuid::new_v4()),
            credentials,
            factory,
            upstream: OnceCell::new(),
        }
    }

    /// Context with no credentials and no upstream factory
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new(Credentials::Empty, None)
    }

    /// Call identifier, for log correlation
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tenant credentials of this call
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Access token, or an authentication error naming what is missing
    pub fn require_access_token(&self) -> Result<&str> {
        self.credentials.access_token().ok_or_else(|| {
            Error::Auth(format!(
                "No upstream access token supplied (credentials: {})",
                self.credentials.kind()
            ))
        })
    }

    /// Upstream client for this call, built on first use.
    ///
    /// Credential problems surface here, inside the handler that first needs
    /// the upstream, so credential-free tools keep working.
    pub async fn upstream(&self) -> Result<Arc<dyn UpstreamClient>> {
        let client = self
            .upstream
            .get_or_try_init(|| async {
                let factory = self.factory.as_ref().ok_or_else(|| {
                    Error::Config("No upstream client factory configured".to_string())
                })?;
                debug!(context = %self.id, "Building upstream client");
                factory.build(&self.credentials)
            })
            .await?;
        Ok(Arc::clone(client))
    }
}

/// Run `body` with `context` installed as the current request context.
///
/// The context is released when `body` completes, whether it succeeds,
/// fails, or unwinds.
pub async fn run_with_context<F, T>(context: Arc<RequestContext>, body: F) -> T
where
    F: Future<Output = T>,
{
    CURRENT_CONTEXT.scope(context, body).await
}

/// Context of the call being served by the current task.
///
/// # Errors
///
/// Returns [`Error::ContextMissing`] outside of a [`run_with_context`] scope.
pub fn current_context() -> Result<Arc<RequestContext>> {
    CURRENT_CONTEXT
        .try_with(Arc::clone)
        .map_err(|_| Error::ContextMissing)
}
