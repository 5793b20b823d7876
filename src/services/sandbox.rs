//! Client of the Judge0-compatible execution sandbox.

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::SandboxConfig,
    dto::sandbox::{ExecutionReport, LanguageInfo, RunStatus},
    state::execution::ExecutionSnapshot,
};

const CPU_TIME_LIMIT_SECS: u32 = 5;
const MEMORY_LIMIT_KB: u32 = 128_000;
const WALL_TIME_LIMIT_SECS: u32 = 10;

/// Languages accepted by the sandbox: tag, Judge0 language id, display name.
const LANGUAGES: &[(&str, u32, &str)] = &[
    ("javascript", 63, "JavaScript (Node.js)"),
    ("python", 71, "Python 3"),
    ("java", 62, "Java"),
    ("cpp", 54, "C++ 17"),
    ("c", 50, "C"),
    ("csharp", 51, "C#"),
    ("php", 68, "PHP"),
    ("ruby", 72, "Ruby"),
    ("go", 60, "Go"),
    ("rust", 73, "Rust"),
    ("kotlin", 78, "Kotlin"),
    ("swift", 83, "Swift"),
    ("typescript", 74, "TypeScript"),
];

/// Sandbox call failures.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("unsupported language `{0}`")]
    UnsupportedLanguage(String),
    #[error("no execution sandbox is configured")]
    NotConfigured,
    #[error("execution sandbox timed out")]
    Timeout,
    #[error("execution sandbox unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SandboxError::Timeout
        } else {
            SandboxError::Unavailable(err.to_string())
        }
    }
}

/// Runs programs on behalf of room participants.
pub trait SandboxClient: Send + Sync {
    fn execute(
        &self,
        program: ExecutionSnapshot,
    ) -> BoxFuture<'static, Result<ExecutionReport, SandboxError>>;
    fn languages(&self) -> Vec<LanguageInfo>;
    fn is_enabled(&self) -> bool;
}

/// Judge0 language id of a language tag, case-insensitive.
pub fn language_id(language: &str) -> Option<u32> {
    LANGUAGES
        .iter()
        .find(|(tag, _, _)| tag.eq_ignore_ascii_case(language))
        .map(|(_, id, _)| *id)
}

fn supported_languages() -> Vec<LanguageInfo> {
    LANGUAGES
        .iter()
        .map(|(tag, _, name)| LanguageInfo {
            id: (*tag).to_string(),
            name: (*name).to_string(),
        })
        .collect()
}

/// Stand-in used when no sandbox URL is configured.
#[derive(Debug, Clone, Default)]
pub struct DisabledSandbox;

impl SandboxClient for DisabledSandbox {
    fn execute(
        &self,
        _program: ExecutionSnapshot,
    ) -> BoxFuture<'static, Result<ExecutionReport, SandboxError>> {
        Box::pin(async { Err(SandboxError::NotConfigured) })
    }

    fn languages(&self) -> Vec<LanguageInfo> {
        supported_languages()
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[derive(Debug, Serialize)]
struct Submission<'a> {
    source_code: &'a str,
    language_id: u32,
    stdin: &'a str,
    cpu_time_limit: u32,
    memory_limit: u32,
    wall_time_limit: u32,
}

#[derive(Debug, Deserialize)]
struct SubmissionStatus {
    id: u32,
    description: String,
}

#[derive(Debug, Deserialize)]
struct SubmissionResult {
    status: SubmissionStatus,
    stdout: Option<String>,
    stderr: Option<String>,
    compile_output: Option<String>,
    memory: Option<u64>,
    time: Option<String>,
}

impl From<SubmissionResult> for ExecutionReport {
    fn from(result: SubmissionResult) -> Self {
        let SubmissionResult {
            status,
            stdout,
            stderr,
            compile_output,
            memory,
            time,
        } = result;
        let stdout = stdout.unwrap_or_default();

        let (status_kind, stdout, error) = match status.id {
            3 => (RunStatus::Accepted, stdout, None),
            5 => (
                RunStatus::TimeLimitExceeded,
                stdout,
                Some("Time Limit Exceeded".to_string()),
            ),
            6 => (
                RunStatus::CompileError,
                String::new(),
                Some(compile_output.unwrap_or_else(|| "Compilation failed".into())),
            ),
            7..=12 => (
                RunStatus::RuntimeError,
                stdout,
                Some(stderr.unwrap_or_else(|| status.description.clone())),
            ),
            _ => (
                RunStatus::Other,
                String::new(),
                Some(stderr.unwrap_or_else(|| status.description.clone())),
            ),
        };

        ExecutionReport {
            stdout,
            status: status_kind,
            status_description: status.description,
            error,
            memory,
            cpu_time: time,
        }
    }
}

/// HTTP client for a Judge0 deployment, optionally behind RapidAPI.
#[derive(Clone)]
pub struct Judge0Client {
    client: Client,
    submissions_url: Arc<str>,
    api_key: Option<Arc<str>>,
    api_host: Option<Arc<str>>,
}

impl Judge0Client {
    /// Build a client for the sandbox rooted at `base_url`.
    pub fn new(base_url: &str, config: &SandboxConfig) -> Result<Self, SandboxError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| SandboxError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            submissions_url: Arc::from(format!(
                "{}/submissions?base64_encoded=false&wait=true",
                base_url.trim_end_matches('/')
            )),
            api_key: config.api_key.as_deref().map(Arc::from),
            api_host: config.api_host.as_deref().map(Arc::from),
        })
    }

    fn with_headers(&self, mut builder: RequestBuilder) -> RequestBuilder {
        if let Some(key) = &self.api_key {
            builder = builder.header("X-RapidAPI-Key", key.as_ref());
        }
        if let Some(host) = &self.api_host {
            builder = builder.header("X-RapidAPI-Host", host.as_ref());
        }
        builder
    }
}

impl SandboxClient for Judge0Client {
    fn execute(
        &self,
        program: ExecutionSnapshot,
    ) -> BoxFuture<'static, Result<ExecutionReport, SandboxError>> {
        let Some(language_id) = language_id(&program.language) else {
            return Box::pin(async move { Err(SandboxError::UnsupportedLanguage(program.language)) });
        };

        let submission = Submission {
            source_code: &program.code,
            language_id,
            stdin: &program.input,
            cpu_time_limit: CPU_TIME_LIMIT_SECS,
            memory_limit: MEMORY_LIMIT_KB,
            wall_time_limit: WALL_TIME_LIMIT_SECS,
        };
        let request = self.with_headers(self.client.post(self.submissions_url.as_ref()).json(&submission));
        let language = program.language;

        Box::pin(async move {
            debug!(%language, language_id, "submitting program to sandbox");
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(SandboxError::Unavailable(format!(
                    "sandbox answered {status}"
                )));
            }
            let result: SubmissionResult = response.json().await?;
            let report = ExecutionReport::from(result);
            info!(%language, status = ?report.status, "program executed");
            Ok(report)
        })
    }

    fn languages(&self) -> Vec<LanguageInfo> {
        supported_languages()
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Sandbox client matching the configuration.
pub fn from_config(config: &SandboxConfig) -> Result<Arc<dyn SandboxClient>, SandboxError> {
    match config.base_url.as_deref() {
        Some(base_url) => Ok(Arc::new(Judge0Client::new(base_url, config)?)),
        None => Ok(Arc::new(DisabledSandbox)),
    }
}
