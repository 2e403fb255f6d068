//! Error types for the conversation pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Tenant configuration error: {0}")]
    TenantConfig(#[from] ConfigurationError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Process configuration errors (environment, startup).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single field-level validation problem.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Ingestion queue errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Message rejected: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Ingestion queue full ({max} messages, none evictable)")]
    Capacity { max: usize },

    #[error("Message {id} not found")]
    NotFound { id: Uuid },

    #[error("Message {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },
}

impl IngestError {
    /// Flatten into human-readable strings for result objects.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Validation(issues) => issues.iter().map(ToString::to_string).collect(),
            other => vec![other.to_string()],
        }
    }
}

/// Non-fatal preprocessing problems, recorded on the message.
#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Text is empty after cleaning")]
    EmptyAfterCleaning,

    #[error("Language could not be detected")]
    LanguageUndetected,
}

/// Analysis errors from the real-time processor or its analyzers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    #[error("Analyzer {analyzer} failed: {reason}")]
    AnalyzerFailed { analyzer: String, reason: String },

    #[error("Analysis timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Analysis for conversation {conversation_id} was cancelled")]
    Cancelled { conversation_id: String },

    #[error("Conversation {conversation_id} has no messages to analyze")]
    EmptyContext { conversation_id: String },
}

/// Tenant configuration manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Tenant {tenant_id} has no configuration")]
    TenantNotFound { tenant_id: String },

    #[error("Tenant {tenant_id} has no configuration version {version}")]
    VersionNotFound { tenant_id: String, version: u64 },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigurationError {
    /// Flatten into human-readable strings for result objects.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Validation(issues) => issues.iter().map(ToString::to_string).collect(),
            other => vec![other.to_string()],
        }
    }
}

/// Webhook delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook request to {url} failed: {reason}")]
    RequestFailed { url: String, reason: String },

    #[error("Webhook {url} responded with status {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Failed to serialize webhook payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Orchestrator-level errors, surfaced in `PipelineOutcome::errors`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Tenant {tenant_id} is not configured")]
    UnknownTenant { tenant_id: String },

    #[error("Tenant {tenant_id} is disabled")]
    TenantDisabled { tenant_id: String },

    #[error("Tenant {tenant_id} exceeded its rate limit")]
    RateLimited { tenant_id: String },

    #[error("Service unavailable for tenant {tenant_id}: circuit breaker is open")]
    CircuitOpen { tenant_id: String },

    #[error("Ingestion failed: {0}")]
    Ingestion(#[from] IngestError),

    #[error("Analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
