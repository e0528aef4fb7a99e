use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Enums ---

/// Power state as reported by the provider. Hetzner uses a handful of
/// transitional states (starting, stopping, migrating, rebuilding...) that we
/// never act on individually, so they collapse into one variant that keeps the
/// raw string for logs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Off,
    Transitional(String),
}

impl ServerStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ServerStatus::Running,
            "off" => ServerStatus::Off,
            other => ServerStatus::Transitional(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ServerStatus::Running => "running",
            ServerStatus::Off => "off",
            ServerStatus::Transitional(s) => s.as_str(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServerStatus::Running)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal verdict of one traffic reset run.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResetOutcome {
    Succeeded,
    Failed,
    /// Another run for the same server was active; nothing was issued.
    AlreadyInProgress,
}

// --- Entities ---

/// Point-in-time snapshot of a provider server. Never mutated in place; every
/// workflow step that needs current truth re-fetches.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: ServerStatus,
    /// Tier (commercial type) name, e.g. "cx23".
    pub server_type: String,
    /// Accumulated outbound traffic in bytes for the current billing period.
    pub outgoing_traffic: u64,
    /// Monthly outbound allowance in bytes, when the provider reports one.
    pub included_traffic: Option<u64>,
}

/// One entry of a tier from the provider catalog.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerTypeInfo {
    pub name: String,
    pub cores: u32,
    pub memory_gb: f64,
    pub disk_gb: u64,
    pub monthly_price: Option<f64>,
}

/// One line of the run log: emoji severity marker plus human-readable message.
/// Append-only; insertion order is the causal order of the workflow.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub icon: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(icon: &str, message: impl Into<String>) -> Self {
        Self {
            icon: icon.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.icon, self.message)
    }
}

/// Record of one traffic reset execution: the ordered log is the single source
/// of truth for what happened, returned to the caller alongside the verdict.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResetRun {
    pub run_id: Uuid,
    pub server_id: u64,
    pub outcome: ResetOutcome,
    pub log: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// --- Errors ---

/// Failure taxonomy of the provider client. Transient faults (timeouts,
/// connection errors, rate limiting) are retried inside the client and only
/// surface here once the attempt budget is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Non-transient provider rejection: 4xx/5xx, or an error object embedded
    /// in an otherwise-successful response. Never retried.
    #[error("provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    /// Network-level failure on a single attempt.
    #[error("transport error: {0}")]
    Transport(String),

    /// The bounded retry loop ran out of attempts.
    #[error("retry budget exhausted after {attempts} attempts (last error: {last_error})")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The provider answered with a payload missing a field we rely on.
    #[error("malformed provider response: missing {0}")]
    MissingField(&'static str),
}

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ApiError::Provider {
            status: 404,
            message: what.into(),
        }
    }
}
