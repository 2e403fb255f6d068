//! Configuration types.
//!
//! Every section has a `Default` and is overridable from `CONVO_*`
//! environment variables. Unparseable values fall back to the default.

use std::str::FromStr;
use std::time::Duration;

/// Languages the lexical detector and the validator know about.
pub const SUPPORTED_LANGUAGES: &[&str] = &["en", "es", "fr", "de", "it", "pt"];

/// Full service configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub ingestion: IngestionConfig,
    pub processor: ProcessorConfig,
    pub orchestrator: OrchestratorConfig,
    pub tenants: TenantManagerConfig,
    pub server: ServerConfig,
}

impl PipelineConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        Self {
            ingestion: IngestionConfig::from_env(&env),
            processor: ProcessorConfig::from_env(&env),
            orchestrator: OrchestratorConfig::from_env(&env),
            tenants: TenantManagerConfig::from_env(&env),
            server: ServerConfig::from_env(&env),
        }
    }
}

/// Ingestion queue settings.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Maximum number of buffered messages (all statuses).
    pub max_queue_size: usize,
    /// Maximum message size in bytes (text + audio + attachment refs).
    pub max_message_bytes: usize,
    /// Accepted language codes (primary subtag, lowercase).
    pub supported_languages: Vec<String>,
    /// Whether cleaning/normalization/language detection runs on ingest.
    pub preprocessing_enabled: bool,
    /// Sub-batch size for `ingest_batch`.
    pub batch_size: usize,
    /// Failures allowed before a message is permanently failed.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// How long terminal messages stay in the buffer.
    pub retention: Duration,
    /// Language assumed when detection finds nothing.
    pub default_language: String,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_message_bytes: 1_048_576,
            supported_languages: SUPPORTED_LANGUAGES.iter().map(|s| s.to_string()).collect(),
            preprocessing_enabled: true,
            batch_size: 50,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            retention: Duration::from_secs(3600), // 1 hour
            default_language: "en".to_string(),
        }
    }
}

impl IngestionConfig {
    fn from_env(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            max_queue_size: env.parse_or("CONVO_QUEUE_MAX_SIZE", d.max_queue_size),
            max_message_bytes: env.parse_or("CONVO_MAX_MESSAGE_BYTES", d.max_message_bytes),
            supported_languages: env
                .list("CONVO_SUPPORTED_LANGUAGES")
                .unwrap_or(d.supported_languages),
            preprocessing_enabled: env.parse_or("CONVO_PREPROCESSING", d.preprocessing_enabled),
            batch_size: env.parse_or("CONVO_INGEST_BATCH_SIZE", d.batch_size),
            max_retries: env.parse_or("CONVO_MAX_RETRIES", d.max_retries),
            retry_base_delay: env.millis_or("CONVO_RETRY_BASE_MS", d.retry_base_delay),
            retry_max_delay: env.millis_or("CONVO_RETRY_MAX_MS", d.retry_max_delay),
            retention: env.secs_or("CONVO_RETENTION_SECS", d.retention),
            default_language: env
                .get("CONVO_DEFAULT_LANGUAGE")
                .unwrap_or(d.default_language),
        }
    }
}

/// Real-time processor settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Ceiling on simultaneous analyses (semaphore size).
    pub max_concurrent_analyses: usize,
    pub cache_ttl: Duration,
    pub cache_max_size: usize,
    /// Upper bound on one emotion+intent analysis.
    pub analysis_timeout: Duration,
    /// Number of recent messages whose text is passed to analyzers.
    pub context_window: usize,
    /// Messages kept per conversation for context building.
    pub max_context_messages: usize,
    pub min_confidence: f32,
    /// Health check fails as degraded above this latency.
    pub latency_target: Duration,
    /// Messages per minute above which a conversation is escalating.
    pub escalation_rate_per_minute: f64,
    /// Messages per minute below which a long conversation is stuck.
    pub stuck_rate_per_minute: f64,
    /// Minimum span before a conversation can be considered stuck.
    pub stuck_window: Duration,
    /// Conversation windows idle longer than this are pruned.
    pub conversation_idle_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_analyses: 50,
            cache_ttl: Duration::from_secs(300),
            cache_max_size: 10_000,
            analysis_timeout: Duration::from_secs(10),
            context_window: 10,
            max_context_messages: 20,
            min_confidence: 0.6,
            latency_target: Duration::from_secs(2),
            escalation_rate_per_minute: 10.0,
            stuck_rate_per_minute: 0.5,
            stuck_window: Duration::from_secs(300), // 5 minutes
            conversation_idle_timeout: Duration::from_secs(1800),
        }
    }
}

impl ProcessorConfig {
    fn from_env(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            max_concurrent_analyses: env
                .parse_or("CONVO_MAX_CONCURRENT_ANALYSES", d.max_concurrent_analyses),
            cache_ttl: env.secs_or("CONVO_CACHE_TTL_SECS", d.cache_ttl),
            cache_max_size: env.parse_or("CONVO_CACHE_MAX_SIZE", d.cache_max_size),
            analysis_timeout: env.millis_or("CONVO_ANALYSIS_TIMEOUT_MS", d.analysis_timeout),
            context_window: env.parse_or("CONVO_CONTEXT_WINDOW", d.context_window),
            max_context_messages: env.parse_or("CONVO_MAX_CONTEXT_MESSAGES", d.max_context_messages),
            min_confidence: env.parse_or("CONVO_MIN_CONFIDENCE", d.min_confidence),
            latency_target: env.millis_or("CONVO_LATENCY_TARGET_MS", d.latency_target),
            escalation_rate_per_minute: env
                .parse_or("CONVO_ESCALATION_RATE", d.escalation_rate_per_minute),
            stuck_rate_per_minute: env.parse_or("CONVO_STUCK_RATE", d.stuck_rate_per_minute),
            stuck_window: env.secs_or("CONVO_STUCK_WINDOW_SECS", d.stuck_window),
            conversation_idle_timeout: env
                .secs_or("CONVO_CONVERSATION_IDLE_SECS", d.conversation_idle_timeout),
        }
    }
}

/// Orchestrator settings: resiliency and background loops.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub health_check_interval: Duration,
    pub metrics_interval: Duration,
    pub drain_interval: Duration,
    pub drain_batch_size: usize,
    pub housekeeping_interval: Duration,
    /// Claimed messages older than this are requeued by housekeeping.
    pub stale_processing_timeout: Duration,
    /// Consecutive failures that open a tenant's circuit breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits before admitting a trial request.
    pub breaker_cooldown: Duration,
    pub max_recovery_attempts: u32,
    pub recovery_delay: Duration,
    /// Split batches into concurrent sub-batches.
    pub load_balancing: bool,
    pub worker_count: usize,
    pub webhook_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            drain_interval: Duration::from_secs(1),
            drain_batch_size: 10,
            housekeeping_interval: Duration::from_secs(300),
            stale_processing_timeout: Duration::from_secs(120),
            failure_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
            max_recovery_attempts: 3,
            recovery_delay: Duration::from_secs(2),
            load_balancing: true,
            worker_count: 4,
            webhook_timeout: Duration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    fn from_env(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            health_check_interval: env
                .secs_or("CONVO_HEALTH_INTERVAL_SECS", d.health_check_interval),
            metrics_interval: env.secs_or("CONVO_METRICS_INTERVAL_SECS", d.metrics_interval),
            drain_interval: env.millis_or("CONVO_DRAIN_INTERVAL_MS", d.drain_interval),
            drain_batch_size: env.parse_or("CONVO_DRAIN_BATCH_SIZE", d.drain_batch_size),
            housekeeping_interval: env
                .secs_or("CONVO_HOUSEKEEPING_INTERVAL_SECS", d.housekeeping_interval),
            stale_processing_timeout: env
                .secs_or("CONVO_STALE_PROCESSING_SECS", d.stale_processing_timeout),
            failure_threshold: env.parse_or("CONVO_BREAKER_THRESHOLD", d.failure_threshold),
            breaker_cooldown: env.secs_or("CONVO_BREAKER_COOLDOWN_SECS", d.breaker_cooldown),
            max_recovery_attempts: env
                .parse_or("CONVO_MAX_RECOVERY_ATTEMPTS", d.max_recovery_attempts),
            recovery_delay: env.millis_or("CONVO_RECOVERY_DELAY_MS", d.recovery_delay),
            load_balancing: env.parse_or("CONVO_LOAD_BALANCING", d.load_balancing),
            worker_count: env.parse_or("CONVO_WORKER_COUNT", d.worker_count),
            webhook_timeout: env.millis_or("CONVO_WEBHOOK_TIMEOUT_MS", d.webhook_timeout),
        }
    }
}

/// Tenant configuration manager settings.
#[derive(Debug, Clone)]
pub struct TenantManagerConfig {
    /// Prior versions retained per tenant.
    pub max_history: usize,
    /// Environment stamped into configuration metadata.
    pub environment: String,
}

impl Default for TenantManagerConfig {
    fn default() -> Self {
        Self {
            max_history: 10,
            environment: "production".to_string(),
        }
    }
}

impl TenantManagerConfig {
    fn from_env(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            max_history: env.parse_or("CONVO_CONFIG_HISTORY", d.max_history),
            environment: env.get("CONVO_ENVIRONMENT").unwrap_or(d.environment),
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory for rolling log files; stdout only when unset.
    pub log_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    fn from_env(env: &Env<'_>) -> Self {
        let d = Self::default();
        Self {
            port: env.parse_or("CONVO_PORT", d.port),
            log_dir: env.get("CONVO_LOG_DIR").or(d.log_dir),
        }
    }
}

/// Thin wrapper over a key lookup with typed accessors.
struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "Ignoring unparseable config value");
                default
            }),
            None => default,
        }
    }

    fn secs_or(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse_or(key, default.as_secs()))
    }

    fn millis_or(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse_or(key, default.as_millis() as u64))
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_empty() {
        let config = PipelineConfig::from_lookup(|_| None);
        assert_eq!(config.ingestion.max_queue_size, 10_000);
        assert_eq!(config.processor.max_concurrent_analyses, 50);
        assert_eq!(config.orchestrator.failure_threshold, 3);
        assert_eq!(config.tenants.max_history, 10);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.ingestion.supported_languages.len(), SUPPORTED_LANGUAGES.len());
    }

    #[test]
    fn overrides_are_applied() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("CONVO_QUEUE_MAX_SIZE", "25"),
            ("CONVO_ANALYSIS_TIMEOUT_MS", "750"),
            ("CONVO_SUPPORTED_LANGUAGES", "EN, fr"),
            ("CONVO_LOAD_BALANCING", "false"),
            ("CONVO_LOG_DIR", "/tmp/logs"),
            ("CONVO_STALE_PROCESSING_SECS", "45"),
        ]));
        assert_eq!(config.ingestion.max_queue_size, 25);
        assert_eq!(config.processor.analysis_timeout, Duration::from_millis(750));
        assert_eq!(config.ingestion.supported_languages, vec!["en", "fr"]);
        assert!(!config.orchestrator.load_balancing);
        assert_eq!(config.server.log_dir.as_deref(), Some("/tmp/logs"));
        assert_eq!(config.orchestrator.stale_processing_timeout, Duration::from_secs(45));
    }

    #[test]
    fn unparseable_values_fall_back() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("CONVO_PORT", "not-a-port"),
            ("CONVO_MAX_RETRIES", ""),
        ]));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.ingestion.max_retries, 3);
    }
}
