//! Tenant configuration data model.

use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::ingestion::types::Priority;

/// Tenant that always exists and backs lookups for unknown tenants.
pub const DEFAULT_TENANT: &str = "default";

/// Events a webhook can subscribe to.
pub const WEBHOOK_EVENTS: &[&str] = &["message.processed", "message.failed"];

// ── Settings groups ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_minute: u32,
    pub burst_limit: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 1000,
            burst_limit: 1000,
        }
    }
}

/// What to do when a tenant's circuit breaker is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Serve the newest cached result for the conversation (or a neutral one).
    #[default]
    Cache,
    /// Accept the message for later processing and return without analysis.
    Degraded,
    /// Reject with an unavailability error.
    Offline,
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => write!(f, "cache"),
            Self::Degraded => write!(f, "degraded"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    pub max_concurrent_analyses: u32,
    pub timeout_ms: u64,
    pub batch_size: u32,
    pub priority: Priority,
    /// Run conversation-level insights on every message.
    pub real_time_insights: bool,
    pub fallback_mode: FallbackMode,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            max_concurrent_analyses: 50,
            timeout_ms: 10_000,
            batch_size: 50,
            priority: Priority::Normal,
            real_time_insights: true,
            fallback_mode: FallbackMode::Cache,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingSettings {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_size: u32,
}

impl Default for CachingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            max_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub emotion_analysis: bool,
    pub intent_analysis: bool,
    pub recommendations: bool,
    pub webhooks: bool,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            emotion_analysis: true,
            intent_analysis: true,
            recommendations: true,
            webhooks: true,
        }
    }
}

impl FeatureSettings {
    /// Names of the enabled features.
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            ("emotion_analysis", self.emotion_analysis),
            ("intent_analysis", self.intent_analysis),
            ("recommendations", self.recommendations),
            ("webhooks", self.webhooks),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub min_confidence: f32,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self { min_confidence: 0.6 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub data_retention_days: u32,
    pub audit_logging: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            data_retention_days: 90,
            audit_logging: true,
        }
    }
}

/// Webhook target. The secret is never serialized, so exports omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub url: String,
    #[serde(default = "default_webhook_events")]
    pub events: Vec<String>,
    #[serde(
        default,
        skip_serializing,
        deserialize_with = "deserialize_secret"
    )]
    pub secret: Option<SecretString>,
}

impl PartialEq for WebhookSettings {
    fn eq(&self, other: &Self) -> bool {
        use secrecy::ExposeSecret;
        self.url == other.url
            && self.events == other.events
            && self.secret.as_ref().map(|s| s.expose_secret().to_string())
                == other.secret.as_ref().map(|s| s.expose_secret().to_string())
    }
}

fn default_webhook_events() -> Vec<String> {
    WEBHOOK_EVENTS.iter().map(|e| e.to_string()).collect()
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

/// All settings groups for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    pub rate_limiting: RateLimitSettings,
    pub processing: ProcessingSettings,
    pub caching: CachingSettings,
    pub features: FeatureSettings,
    pub quality: QualitySettings,
    pub security: SecuritySettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSettings>,
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    /// Strictly increasing per tenant.
    pub version: u64,
    pub environment: String,
}

/// One version of a tenant's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfiguration {
    pub tenant_id: String,
    pub enabled: bool,
    pub settings: TenantSettings,
    pub metadata: ConfigurationMetadata,
}

impl TenantConfiguration {
    pub fn version(&self) -> u64 {
        self.metadata.version
    }
}

/// Why a configuration changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    Updated,
    Enabled,
    Disabled,
    RolledBack { from_version: u64 },
    Imported,
}

/// Broadcast whenever a tenant's current configuration is replaced.
#[derive(Debug, Clone)]
pub struct ConfigurationChange {
    pub kind: ChangeKind,
    pub configuration: TenantConfiguration,
}

/// Successful write: the new configuration plus non-fatal warnings.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationUpdate {
    pub configuration: TenantConfiguration,
    pub warnings: Vec<String>,
}

/// Per-tenant outcome of an import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<ImportFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFailure {
    pub tenant_id: String,
    pub errors: Vec<String>,
}

/// Export document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationExport {
    pub exported_at: DateTime<Utc>,
    pub environment: String,
    pub tenants: Vec<TenantConfiguration>,
}
