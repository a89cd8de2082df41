//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "SAAS_MCP_BRIDGE_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Transport endpoint configuration
    pub transport: TransportConfig,
    /// Tenant credential extraction
    pub credentials: CredentialsConfig,
    /// Upstream SaaS API client
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in upstream settings
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        if let Some(base_url) = self.upstream.base_url.as_mut() {
            *base_url = expand_string(&re, base_url);
        }
        for value in self.upstream.headers.values_mut() {
            *value = expand_string(&re, value);
        }
        if let Some(token) = self.credentials.default_token.as_mut() {
            *token = expand_string(&re, token);
        }
    }

    /// Reject settings the transports cannot serve with
    fn validate(&self) -> Result<()> {
        let t = &self.transport;
        for (name, path) in [
            ("stateless_path", &t.stateless_path),
            ("sse_path", &t.sse_path),
            ("messages_path", &t.messages_path),
        ] {
            if !path.starts_with('/') {
                return Err(Error::Config(format!(
                    "transport.{name} must start with '/': {path}"
                )));
            }
        }
        if t.sse_path == t.messages_path
            || t.stateless_path == t.sse_path
            || t.stateless_path == t.messages_path
        {
            return Err(Error::Config(
                "transport paths must be distinct".to_string(),
            ));
        }
        if t.session_buffer == 0 {
            return Err(Error::Config(
                "transport.session_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Replace a leading `~` with the user's home directory
fn expand_home(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
        _ => path.to_string(),
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 4 * 1024 * 1024,
        }
    }
}

/// Transport endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Stateless streamable HTTP endpoint
    pub stateless_path: String,
    /// Legacy SSE stream endpoint
    pub sse_path: String,
    /// Legacy command submission endpoint
    pub messages_path: String,
    /// Keep-alive interval for SSE streams
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// Outbound message buffer per session
    pub session_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stateless_path: "/mcp".to_string(),
            sse_path: "/sse".to_string(),
            messages_path: "/messages".to_string(),
            keep_alive_interval: Duration::from_secs(15),
            session_buffer: 64,
        }
    }
}

/// Tenant credential extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Process-wide credential; takes priority over any request header.
    /// Either a raw token or a JSON object.
    #[serde(default, deserialize_with = "lenient_token::deserialize")]
    pub default_token: Option<String>,
    /// Header carrying base64-encoded JSON credentials
    pub header: String,
    /// JSON fields probed (in order) for the access token
    pub token_fields: Vec<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            default_token: None,
            header: "x-upstream-credentials".to_string(),
            token_fields: vec![
                "access_token".to_string(),
                "token".to_string(),
                "api_key".to_string(),
            ],
        }
    }
}

/// Upstream SaaS API client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL every handler path is joined to
    pub base_url: Option<String>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// User-Agent sent upstream
    pub user_agent: String,
    /// Extra headers sent with every request (supports `${VAR}`)
    pub headers: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("saas-mcp-bridge/{}", env!("CARGO_PKG_VERSION")),
            headers: HashMap::new(),
        }
    }
}

/// Token deserialization that tolerates unquoted scalars.
///
/// Env and YAML providers turn `12345` into a number and a mapping into a
/// dict; both still mean a credential string.
mod lenient_token {
    use serde::{Deserialize, Deserializer, de::Error as _};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(v @ (Value::Number(_) | Value::Bool(_) | Value::Object(_))) => Ok(Some(v.to_string())),
            Some(Value::Array(_)) => Err(D::Error::custom(
                "default_token must be a string or an object",
            )),
        }
    }
}

/// Serde module for human-readable durations ("30s", "5m", "100ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "100ms" or bare seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.transport.stateless_path, "/mcp");
        assert_eq!(config.transport.sse_path, "/sse");
        assert_eq!(config.transport.messages_path, "/messages");
        assert_eq!(config.credentials.header, "x-upstream-credentials");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn humantime_parses_all_units() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("7").unwrap(), Duration::from_secs(7));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
server:
  port: 9191
transport:
  keep_alive_interval: "250ms"
upstream:
  base_url: "https://api.example.com/v2"
  timeout: "5s"
"#
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9191);
        assert_eq!(config.transport.keep_alive_interval, Duration::from_millis(250));
        assert_eq!(
            config.upstream.base_url.as_deref(),
            Some("https://api.example.com/v2")
        );
        assert_eq!(config.upstream.timeout, Duration::from_secs(5));
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/bridge.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn validate_rejects_relative_paths() {
        let mut config = Config::default();
        config.transport.sse_path = "sse".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_colliding_paths() {
        let mut config = Config::default();
        config.transport.messages_path = "/sse".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_string_uses_default_for_unset_var() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let out = expand_string(&re, "https://${SAAS_BRIDGE_TEST_UNSET_HOST:-api.local}/v1");
        assert_eq!(out, "https://api.local/v1");
    }

    #[test]
    fn load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "SAAS_BRIDGE_TEST_ENV_FILE_KEY=from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(
            env::var("SAAS_BRIDGE_TEST_ENV_FILE_KEY").unwrap(),
            "from_env_file"
        );
    }

    #[test]
    fn home_prefix_uses_home_dir() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.bridge.env"), format!("{}/.bridge.env", home.display()));
        }
        assert_eq!(expand_home("/etc/bridge.env"), "/etc/bridge.env");
        assert_eq!(expand_home("relative/~.env"), "relative/~.env");
    }

    #[test]
    fn numeric_default_token_is_kept_as_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.yaml");
        std::fs::write(&path, "credentials:\n  default_token: 12345\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.credentials.default_token.as_deref(), Some("12345"));
    }

    #[test]
    fn mapping_default_token_becomes_json() {
        let yaml = r#"
credentials:
  default_token:
    access_token: "abc"
    workspace: "w1"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let raw = config.credentials.default_token.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["access_token"], "abc");
        assert_eq!(value["workspace"], "w1");
    }

    #[test]
    fn load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn config_deserializes_from_yaml() {
        let yaml = r#"
credentials:
  header: "x-tenant-auth"
  token_fields: ["bot_token"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.credentials.header, "x-tenant-auth");
        assert_eq!(config.credentials.token_fields, vec!["bot_token"]);
        assert_eq!(config.server.port, 8080);
    }
}
