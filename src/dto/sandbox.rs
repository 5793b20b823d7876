use serde::Serialize;
use utoipa::ToSchema;

/// Normalised verdict of a sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Accepted,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    Other,
}

/// Result of running a program, sent back to the requester only.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    /// Program standard output.
    pub stdout: String,
    pub status: RunStatus,
    /// Sandbox wording of the verdict.
    pub status_description: String,
    /// Compiler output or standard error, when the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Peak memory in kilobytes, as reported by the sandbox.
    pub memory: Option<u64>,
    /// CPU time in seconds, as reported by the sandbox.
    pub cpu_time: Option<String>,
}

/// Language the sandbox can run.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LanguageInfo {
    /// Tag used in `language` fields.
    pub id: String,
    /// Human readable name.
    pub name: String,
}

/// Response of `GET /sandbox/languages`.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LanguagesResponse {
    /// Whether a sandbox is configured at all.
    pub enabled: bool,
    pub languages: Vec<LanguageInfo>,
}
