//! Upstream SaaS API client boundary.
//!
//! Handlers never construct HTTP clients themselves: they ask their
//! [`RequestContext`](crate::context::RequestContext) for one, and the context
//! builds it once per call through an [`UpstreamFactory`] from that call's
//! credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::debug;
use url::Url;

pub use reqwest::Method;

use crate::config::{CredentialsConfig, UpstreamConfig};
use crate::context::Credentials;
use crate::{Error, Result};

/// Longest upstream error body echoed back into an error message
const ERROR_BODY_EXCERPT: usize = 512;

/// Client a handler uses to call the target SaaS API
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Perform one request and return the decoded JSON body.
    ///
    /// Non-JSON bodies come back as a JSON string; empty bodies as `null`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: Option<&Value>,
        body: Option<Value>,
    ) -> Result<Value>;

    /// GET shorthand
    async fn get(&self, path: &str, query: Option<&Value>) -> Result<Value> {
        self.request(Method::GET, path, query, None).await
    }

    /// POST shorthand
    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::POST, path, None, Some(body)).await
    }
}

/// Builds an upstream client from one call's credentials
pub trait UpstreamFactory: Send + Sync {
    /// Build a client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the credentials cannot authenticate upstream.
    fn build(&self, credentials: &Credentials) -> Result<Arc<dyn UpstreamClient>>;
}

/// Factory producing bearer-authenticated `reqwest` clients
#[derive(Debug, Clone)]
pub struct HttpUpstreamFactory {
    base_url: Option<Url>,
    timeout: Duration,
    user_agent: String,
    headers: HeaderMap,
    token_fields: Vec<String>,
}

impl HttpUpstreamFactory {
    /// Create from configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the base URL or a configured header is invalid.
    pub fn new(upstream: &UpstreamConfig, credentials: &CredentialsConfig) -> Result<Self> {
        let base_url = upstream.base_url.as_deref().map(parse_base_url).transpose()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &upstream.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| Error::Config(format!("Invalid upstream header name {name}: {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| Error::Config(format!("Invalid upstream header value: {e}")))?;
            headers.insert(name, value);
        }

        Ok(Self {
            base_url,
            timeout: upstream.timeout,
            user_agent: upstream.user_agent.clone(),
            headers,
            token_fields: credentials.token_fields.clone(),
        })
    }
}

impl UpstreamFactory for HttpUpstreamFactory {
    fn build(&self, credentials: &Credentials) -> Result<Arc<dyn UpstreamClient>> {
        let token = credentials
            .access_token_from(&self.token_fields)
            .ok_or_else(|| {
                Error::Auth(format!(
                    "Upstream credentials missing: expected one of [{}] (credentials: {})",
                    self.token_fields.join(", "),
                    credentials.kind()
                ))
            })?
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .default_headers(self.headers.clone())
            .build()?;

        Ok(Arc::new(HttpUpstreamClient {
            client,
            base_url: self.base_url.clone(),
            token,
        }))
    }
}

/// Bearer-authenticated HTTP client bound to one tenant
struct HttpUpstreamClient {
    client: reqwest::Client,
    base_url: Option<Url>,
    token: String,
}

impl HttpUpstreamClient {
    /// Resolve `path` against the base URL.
    ///
    /// The bearer token only ever goes to the configured origin, below the
    /// configured base path.
    fn url_for(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_ref().ok_or_else(|| {
            Error::Config(format!("upstream.base_url is not configured (path: {path})"))
        })?;
        let resolved = base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Validation(format!("Invalid upstream path {path}: {e}")))?;

        if resolved.origin() != base.origin() || !resolved.path().starts_with(base.path()) {
            return Err(Error::Validation(format!(
                "Upstream path {path} resolves outside {base}"
            )));
        }
        Ok(resolved)
    }
}

/// Parse the configured base URL so relative paths join below it
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url =
        Url::parse(raw).map_err(|e| Error::Config(format!("Invalid upstream.base_url {raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!(
            "upstream.base_url must be http(s), got {}",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: Option<&Value>,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = self.url_for(path)?;
        debug!(method = %method, url = %url, "Upstream request");

        let mut request = self
            .client
            .request(method, url.clone())
            .bearer_auth(&self.token);
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("request to {url} failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Upstream(format!("reading response from {url} failed: {e}")))?;

        if !status.is_success() {
            return Err(Error::Upstream(format!(
                "HTTP {status}: {}",
                excerpt(&text)
            )));
        }

        Ok(decode_body(&text))
    }
}

fn decode_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= ERROR_BODY_EXCERPT {
        text.to_string()
    } else {
        let cut: String = text.chars().take(ERROR_BODY_EXCERPT).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn factory(base_url: Option<&str>) -> HttpUpstreamFactory {
        HttpUpstreamFactory::new(
            &UpstreamConfig {
                base_url: base_url.map(String::from),
                ..Default::default()
            },
            &CredentialsConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn build_without_credentials_is_auth_error() {
        let err = factory(None).build(&Credentials::Empty).err().unwrap();
        assert!(matches!(err, Error::Auth(_)));
        assert!(err.to_string().contains("access_token"));
    }

    #[test]
    fn build_with_token_succeeds() {
        assert!(factory(None).build(&Credentials::Token("t".into())).is_ok());
    }

    #[test]
    fn invalid_header_is_config_error() {
        let mut upstream = UpstreamConfig::default();
        upstream
            .headers
            .insert("bad header".to_string(), "v".to_string());
        let err = HttpUpstreamFactory::new(&upstream, &CredentialsConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    fn client(base_url: Option<&str>) -> HttpUpstreamClient {
        HttpUpstreamClient {
            client: reqwest::Client::new(),
            base_url: base_url.map(|u| parse_base_url(u).unwrap()),
            token: "t".to_string(),
        }
    }

    #[test]
    fn url_joins_base_and_path() {
        let client = client(Some("https://api.example.com/v1"));
        assert_eq!(
            client.url_for("/contacts/42").unwrap().as_str(),
            "https://api.example.com/v1/contacts/42"
        );
        assert_eq!(
            client.url_for("contacts?limit=5").unwrap().as_str(),
            "https://api.example.com/v1/contacts?limit=5"
        );
    }

    #[test]
    fn foreign_origin_paths_are_rejected() {
        let client = client(Some("https://api.example.com/v1"));
        for path in [
            "https://attacker.example/x",
            "http://127.0.0.1:8080/steal",
            "http://api.example.com/v1/contacts",
            "https://api.example.com:8443/v1/contacts",
        ] {
            let err = client.url_for(path).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{path}: {err}");
        }
    }

    #[test]
    fn paths_cannot_escape_the_base_path() {
        let client = client(Some("https://api.example.com/v1/"));
        assert!(matches!(client.url_for("../admin"), Err(Error::Validation(_))));
        assert!(matches!(client.url_for("/v1/../../admin"), Err(Error::Validation(_))));
    }

    #[test]
    fn scheme_relative_path_stays_on_base_host() {
        let client = client(Some("https://api.example.com/v1"));
        let url = client.url_for("//attacker.example/x").unwrap();
        assert_eq!(url.host_str(), Some("api.example.com"));
    }

    #[tokio::test]
    async fn request_to_foreign_origin_never_leaves_the_process() {
        let upstream = factory(Some("https://api.example.com/v1"))
            .build(&Credentials::Token("tenant-secret".into()))
            .unwrap();
        let err = upstream
            .get("http://127.0.0.1:1/steal", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("resolves outside"));
    }

    #[test]
    fn relative_path_without_base_url_is_config_error() {
        assert!(matches!(client(None).url_for("contacts"), Err(Error::Config(_))));
    }

    #[test]
    fn invalid_base_url_is_rejected_at_startup() {
        for base in ["not a url", "ftp://files.example.com"] {
            let err = HttpUpstreamFactory::new(
                &UpstreamConfig {
                    base_url: Some(base.to_string()),
                    ..Default::default()
                },
                &CredentialsConfig::default(),
            )
            .unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{base}");
        }
    }

    #[test]
    fn decode_body_handles_json_text_and_empty() {
        assert_eq!(decode_body(r#"{"ok":true}"#), json!({"ok": true}));
        assert_eq!(decode_body("plain"), json!("plain"));
        assert_eq!(decode_body("  "), Value::Null);
    }

    #[test]
    fn excerpt_truncates_long_bodies() {
        let long = "x".repeat(ERROR_BODY_EXCERPT + 10);
        let out = excerpt(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.len(), ERROR_BODY_EXCERPT + 3);
    }
}
