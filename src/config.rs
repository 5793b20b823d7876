//! Application-level configuration loading: room limits, timeouts and external collaborators.

use std::{collections::HashMap, env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "CODE_ROOM_BACK_CONFIG_PATH";

const DEFAULT_CHAT_CAPACITY: usize = 500;
const DEFAULT_IDENTIFICATION_TIMEOUT_SECS: u64 = 10;
const DEFAULT_EXECUTION_REQUEST_TTL_SECS: u64 = 120;
const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Maximum number of chat messages kept in memory per room.
    pub chat_capacity: usize,
    /// Delay granted to a new socket to send its `authenticate` frame.
    pub identification_timeout: Duration,
    /// Lifetime of an execution request; `None` disables expiry.
    pub execution_request_ttl: Option<Duration>,
    /// Identity verification settings.
    pub identity: IdentityConfig,
    /// Execution sandbox settings.
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Default)]
/// Where and how identity tokens are verified.
pub struct IdentityConfig {
    /// Base URL of the identity service. `None` means only `static_tokens` are accepted.
    pub base_url: Option<String>,
    /// Fixed token table for local development, token -> (member id, display name).
    pub static_tokens: HashMap<String, (String, String)>,
}

#[derive(Debug, Clone)]
/// Connection details of the Judge0-compatible execution sandbox.
pub struct SandboxConfig {
    /// Base URL of the sandbox API. `None` disables remote execution.
    pub base_url: Option<String>,
    /// Value of the `X-RapidAPI-Key` header, when the sandbox is behind RapidAPI.
    pub api_key: Option<String>,
    /// Value of the `X-RapidAPI-Host` header.
    pub api_host: Option<String>,
    /// Per-submission request timeout.
    pub timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            api_host: None,
            timeout: Duration::from_secs(DEFAULT_SANDBOX_TIMEOUT_SECS),
        }
    }
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(app_config) => {
                    info!(
                        path = %path.display(),
                        chat_capacity = app_config.chat_capacity,
                        sandbox = app_config.sandbox.base_url.is_some(),
                        "loaded application config"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a configuration document; absent fields take their default value.
    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<RawConfig>(contents).map(Into::into)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    chat_capacity: Option<usize>,
    identification_timeout_secs: Option<u64>,
    execution_request_ttl_secs: Option<u64>,
    identity: RawIdentity,
    sandbox: RawSandbox,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIdentity {
    base_url: Option<String>,
    static_tokens: Vec<RawStaticToken>,
}

#[derive(Debug, Deserialize)]
struct RawStaticToken {
    token: String,
    member_id: String,
    display_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSandbox {
    base_url: Option<String>,
    api_key: Option<String>,
    api_host: Option<String>,
    timeout_secs: Option<u64>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let ttl_secs = value
            .execution_request_ttl_secs
            .unwrap_or(DEFAULT_EXECUTION_REQUEST_TTL_SECS);

        Self {
            chat_capacity: value
                .chat_capacity
                .filter(|capacity| *capacity > 0)
                .unwrap_or(DEFAULT_CHAT_CAPACITY),
            identification_timeout: Duration::from_secs(
                value
                    .identification_timeout_secs
                    .unwrap_or(DEFAULT_IDENTIFICATION_TIMEOUT_SECS),
            ),
            // 0 keeps requests alive until they are voted, cancelled or abandoned.
            execution_request_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            identity: value.identity.into(),
            sandbox: value.sandbox.into(),
        }
    }
}

impl From<RawIdentity> for IdentityConfig {
    fn from(value: RawIdentity) -> Self {
        Self {
            base_url: non_blank(value.base_url),
            static_tokens: value
                .static_tokens
                .into_iter()
                .map(|entry| (entry.token, (entry.member_id, entry.display_name)))
                .collect(),
        }
    }
}

impl From<RawSandbox> for SandboxConfig {
    fn from(value: RawSandbox) -> Self {
        Self {
            base_url: non_blank(value.base_url),
            api_key: non_blank(value.api_key),
            api_host: non_blank(value.api_host),
            timeout: Duration::from_secs(
                value.timeout_secs.unwrap_or(DEFAULT_SANDBOX_TIMEOUT_SECS),
            ),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config.chat_capacity, 500);
        assert_eq!(config.identification_timeout, Duration::from_secs(10));
        assert_eq!(config.execution_request_ttl, Some(Duration::from_secs(120)));
        assert!(config.sandbox.base_url.is_none());
        assert_eq!(config.sandbox.timeout, Duration::from_secs(15));
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let config = AppConfig::from_json(r#"{"execution_request_ttl_secs": 0}"#).unwrap();
        assert!(config.execution_request_ttl.is_none());
    }

    #[test]
    fn nested_sections_are_parsed() {
        let config = AppConfig::from_json(
            r#"{
                "chat_capacity": 50,
                "identity": {
                    "base_url": "http://identity:4000",
                    "static_tokens": [
                        {"token": "dev", "member_id": "u1", "display_name": "Dev"}
                    ]
                },
                "sandbox": {"base_url": "https://judge0.example", "api_key": " ", "timeout_secs": 3}
            }"#,
        )
        .unwrap();

        assert_eq!(config.chat_capacity, 50);
        assert_eq!(
            config.identity.base_url.as_deref(),
            Some("http://identity:4000")
        );
        assert_eq!(
            config.identity.static_tokens.get("dev"),
            Some(&("u1".to_string(), "Dev".to_string()))
        );
        assert_eq!(
            config.sandbox.base_url.as_deref(),
            Some("https://judge0.example")
        );
        assert!(config.sandbox.api_key.is_none());
        assert_eq!(config.sandbox.timeout, Duration::from_secs(3));
    }
}
