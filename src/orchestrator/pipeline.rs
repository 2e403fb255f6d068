//! Pipeline orchestrator: per-tenant policy, admission, and fan-out.
//!
//! Request flow:
//! 1. Tenant lookup (unknown/disabled → reject)
//! 2. Token-bucket rate limit
//! 3. Circuit breaker (open → tenant fallback)
//! 4. Ingest (claimed on arrival)
//! 5. Analyze, then mark processed or failed
//! 6. Conversation insights for real-time tenants
//! 7. Notifications + webhook
//! 8. Monitor + breaker bookkeeping
//!
//! Drained messages (deferred or retrying) go through steps 5 to 8 under
//! their tenant's policy. A claimed message whose call panics or is dropped
//! goes back to the queue's retry path.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore, broadcast};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::RealTimeProcessor;
use crate::analysis::processor::ProcessorStats;
use crate::analysis::types::{
    Complexity, ConversationAnalysis, EmotionResult, IntentResult, ProcessOptions,
    ProcessingResult, Sentiment, Urgency,
};
use crate::config::OrchestratorConfig;
use crate::error::{AnalysisError, IngestError, PipelineError};
use crate::health::{ComponentHealth, HealthProbe, HealthState, RecoveryAction, overall_state};
use crate::ingestion::types::{Channel, IngestedMessage, MessageContent, MessageMetadata, Priority};
use crate::ingestion::{IngestionQueue, QueueStats};
use crate::orchestrator::background::BackgroundTasks;
use crate::orchestrator::circuit::{Admission, CircuitBreakers, CircuitState};
use crate::orchestrator::monitor::{MonitorMetrics, MonitoringSink, ProcessingEvent};
use crate::orchestrator::notify::{ConversationEvent, NotificationHub, NotificationStats};
use crate::orchestrator::rate_limit::RateLimiter;
use crate::orchestrator::webhook::{WebhookDelivery, WebhookPayload};
use crate::tenant::model::{FeatureSettings, WebhookSettings};
use crate::tenant::{
    ConfigurationChange, DEFAULT_TENANT, FallbackMode, TenantConfigManager, TenantConfiguration,
    TenantSettings,
};

const EVENT_MESSAGE_PROCESSED: &str = "message.processed";
const EVENT_MESSAGE_FAILED: &str = "message.failed";

// ── Tenant policy ───────────────────────────────────────────────────

/// Runtime view of a tenant's configuration.
#[derive(Debug, Clone)]
pub struct TenantPolicy {
    pub tenant_id: String,
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst_limit: u32,
    pub max_concurrent_analyses: u32,
    pub timeout: Duration,
    pub caching_enabled: bool,
    pub priority: Priority,
    pub features: FeatureSettings,
    pub real_time_insights: bool,
    pub fallback_mode: FallbackMode,
    pub min_confidence: f32,
    pub webhook: Option<WebhookSettings>,
    /// Configuration version this policy was derived from (0 if manual).
    pub version: u64,
}

impl TenantPolicy {
    /// Policy with default settings.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self::from_settings(tenant_id, true, &TenantSettings::default(), 0)
    }

    pub fn from_configuration(configuration: &TenantConfiguration) -> Self {
        Self::from_settings(
            configuration.tenant_id.clone(),
            configuration.enabled,
            &configuration.settings,
            configuration.version(),
        )
    }

    fn from_settings(
        tenant_id: impl Into<String>,
        enabled: bool,
        settings: &TenantSettings,
        version: u64,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            enabled,
            requests_per_minute: settings.rate_limiting.requests_per_minute,
            burst_limit: settings.rate_limiting.burst_limit,
            max_concurrent_analyses: settings.processing.max_concurrent_analyses,
            timeout: Duration::from_millis(settings.processing.timeout_ms),
            caching_enabled: settings.caching.enabled,
            priority: settings.processing.priority,
            features: settings.features.clone(),
            real_time_insights: settings.processing.real_time_insights,
            fallback_mode: settings.processing.fallback_mode,
            min_confidence: settings.quality.min_confidence,
            webhook: settings.webhook.clone(),
            version,
        }
    }

    fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            use_cache: self.caching_enabled,
            min_confidence: Some(self.min_confidence),
        }
    }

    /// Drop analysis parts for disabled features.
    fn redact(&self, result: &mut ProcessingResult) {
        if !self.features.emotion_analysis {
            result.emotion = None;
        }
        if !self.features.intent_analysis {
            result.intent = None;
        }
    }
}

/// Policy snapshot plus the tenant's concurrency slots.
#[derive(Clone)]
struct TenantRuntime {
    policy: Arc<TenantPolicy>,
    slots: Arc<Semaphore>,
}

// ── Requests and outcomes ───────────────────────────────────────────

fn default_channel() -> Channel {
    Channel::Chat
}

/// One inbound message for `process_conversation_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub conversation_id: String,
    pub content: MessageContent,
    #[serde(default = "default_channel")]
    pub channel: Channel,
    pub tenant_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl ProcessRequest {
    pub fn text(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: MessageContent::text(text),
            channel: Channel::Chat,
            tenant_id: tenant_id.into(),
            user_id: None,
            metadata: MessageMetadata::default(),
        }
    }
}

/// Structured result of one orchestrated call. Never an `Err`: expected
/// failures are reported through `success` and `errors`.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ProcessingResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ConversationAnalysis>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Set when the tenant's breaker was open and a fallback answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackMode>,
    pub processing_time_ms: u64,
}

impl ProcessOutcome {
    fn rejected(error: PipelineError, started: Instant) -> Self {
        let errors = match &error {
            PipelineError::Ingestion(inner) => inner.messages(),
            other => vec![other.to_string()],
        };
        Self::failed(None, None, errors, started)
    }

    fn failed(
        message_id: Option<Uuid>,
        result: Option<ProcessingResult>,
        errors: Vec<String>,
        started: Instant,
    ) -> Self {
        Self {
            success: false,
            message_id,
            result,
            analysis: None,
            errors,
            warnings: Vec::new(),
            fallback: None,
            processing_time_ms: elapsed_ms(started),
        }
    }
}

// ── Health and metrics ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub tenant_id: String,
    pub state: CircuitState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub total_processed: u64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub active_connections: usize,
    pub active_analyses: usize,
    pub queue: QueueStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub state: HealthState,
    pub components: Vec<ComponentHealth>,
    /// Tenants whose breaker is not closed.
    pub circuits: Vec<CircuitStatus>,
    pub metrics: SystemMetrics,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub component: String,
    pub attempts: u32,
    pub recovered: bool,
    pub actions: Vec<RecoveryAction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub monitor: MonitorMetrics,
    pub processor: ProcessorStats,
    pub queue: QueueStats,
    pub notifications: NotificationStats,
    pub tenants: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HousekeepingReport {
    /// Messages stuck in processing that went back to the retry path.
    pub requeued_messages: usize,
    pub expired_messages: usize,
    pub expired_cache_entries: usize,
    pub stale_channels: usize,
}

/// How an outcome feeds the monitor and the breaker.
enum Verdict<'a> {
    Success,
    Failure(&'a str),
    /// Neither (client error, superseded analysis).
    Neutral,
}

/// What happened to a claimed message.
enum Conclusion {
    Superseded(ProcessingResult),
    Failed(ProcessingResult),
    Processed {
        result: ProcessingResult,
        analysis: Option<ConversationAnalysis>,
    },
}

/// A message this orchestrator has claimed but not yet marked. Dropped
/// while armed, it hands the message back to the queue as a failure.
struct ClaimGuard {
    queue: Arc<IngestionQueue>,
    id: Uuid,
    armed: bool,
}

impl ClaimGuard {
    fn new(queue: &Arc<IngestionQueue>, id: Uuid) -> Self {
        Self {
            queue: Arc::clone(queue),
            id,
            armed: true,
        }
    }

    /// The caller marks the message itself from here on.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(id = %self.id, "No runtime to release abandoned message");
            return;
        };
        let queue = Arc::clone(&self.queue);
        let id = self.id;
        runtime.spawn(async move {
            match queue.mark_as_failed(id, "processing abandoned").await {
                Ok(status) => warn!(id = %id, status = %status, "Abandoned message released"),
                Err(err) => debug!(id = %id, error = %err, "Abandoned message already settled"),
            }
        });
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct PipelineOrchestrator {
    config: OrchestratorConfig,
    queue: Arc<IngestionQueue>,
    processor: Arc<RealTimeProcessor>,
    tenants: Arc<TenantConfigManager>,
    monitor: Arc<dyn MonitoringSink>,
    notifications: Arc<NotificationHub>,
    webhooks: Arc<dyn WebhookDelivery>,
    policies: RwLock<HashMap<String, TenantRuntime>>,
    breakers: CircuitBreakers,
    rate_limiter: RateLimiter,
    background: Mutex<Option<BackgroundTasks>>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        queue: Arc<IngestionQueue>,
        processor: Arc<RealTimeProcessor>,
        tenants: Arc<TenantConfigManager>,
        monitor: Arc<dyn MonitoringSink>,
        notifications: Arc<NotificationHub>,
        webhooks: Arc<dyn WebhookDelivery>,
    ) -> Arc<Self> {
        Arc::new(Self {
            breakers: CircuitBreakers::new(config.failure_threshold, config.breaker_cooldown),
            config,
            queue,
            processor,
            tenants,
            monitor,
            notifications,
            webhooks,
            policies: RwLock::new(HashMap::new()),
            rate_limiter: RateLimiter::new(),
            background: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<IngestionQueue> {
        &self.queue
    }

    pub fn processor(&self) -> &Arc<RealTimeProcessor> {
        &self.processor
    }

    pub fn tenants(&self) -> &Arc<TenantConfigManager> {
        &self.tenants
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Load tenant policies and start the background loops.
    pub async fn start(self: &Arc<Self>) {
        let mut background = self.background.lock().await;
        if background.is_some() {
            warn!("Orchestrator already started");
            return;
        }
        let tenants = self.sync_tenants().await;
        *background = Some(BackgroundTasks::spawn(self));
        info!(tenants, "Pipeline orchestrator started");
    }

    /// Stop the background loops and drop in-memory state.
    pub async fn cleanup(&self) {
        let background = self.background.lock().await.take();
        if let Some(background) = background {
            background.shutdown().await;
        }
        self.processor.shutdown().await;
        self.notifications.clear().await;
        self.breakers.clear();
        self.rate_limiter.clear().await;
        self.policies.write().await.clear();
        info!("Pipeline orchestrator stopped");
    }

    // ── Tenant policy ───────────────────────────────────────────────

    /// Register or replace a tenant's runtime policy. Calls already in
    /// flight keep the snapshot they started with.
    pub async fn configure_tenant(&self, policy: TenantPolicy) {
        let tenant_id = policy.tenant_id.clone();
        let mut policies = self.policies.write().await;

        let rates_changed = policies.get(&tenant_id).is_none_or(|current| {
            current.policy.requests_per_minute != policy.requests_per_minute
                || current.policy.burst_limit != policy.burst_limit
        });
        if rates_changed {
            self.rate_limiter
                .configure(&tenant_id, policy.requests_per_minute, policy.burst_limit)
                .await;
        }

        info!(
            tenant_id = %tenant_id,
            enabled = policy.enabled,
            version = policy.version,
            fallback = ?policy.fallback_mode,
            "Tenant policy configured"
        );
        let slots = Arc::new(Semaphore::new(policy.max_concurrent_analyses.max(1) as usize));
        policies.insert(
            tenant_id,
            TenantRuntime {
                policy: Arc::new(policy),
                slots,
            },
        );
    }

    pub async fn remove_tenant(&self, tenant_id: &str) -> bool {
        let removed = self.policies.write().await.remove(tenant_id).is_some();
        self.rate_limiter.remove(tenant_id).await;
        self.breakers.remove(tenant_id);
        removed
    }

    pub async fn tenant_policy(&self, tenant_id: &str) -> Option<TenantPolicy> {
        self.policies
            .read()
            .await
            .get(tenant_id)
            .map(|r| TenantPolicy::clone(&r.policy))
    }

    /// Rebuild every policy from the configuration manager.
    pub async fn sync_tenants(&self) -> usize {
        let configurations = self.tenants.get_all_configurations().await;
        let count = configurations.len();
        for configuration in &configurations {
            self.configure_tenant(TenantPolicy::from_configuration(configuration))
                .await;
        }
        count
    }

    /// React to a configuration change broadcast.
    pub async fn apply_change(&self, change: &ConfigurationChange) {
        debug!(
            tenant_id = %change.configuration.tenant_id,
            kind = ?change.kind,
            version = change.configuration.version(),
            "Applying configuration change"
        );
        self.configure_tenant(TenantPolicy::from_configuration(&change.configuration))
            .await;
    }

    async fn runtime(&self, tenant_id: &str) -> Option<TenantRuntime> {
        self.policies.read().await.get(tenant_id).cloned()
    }

    // ── Processing ──────────────────────────────────────────────────

    /// Process one message end to end. Panics in collaborators are caught
    /// here and reported as failures.
    pub async fn process_conversation_message(&self, request: ProcessRequest) -> ProcessOutcome {
        let started = Instant::now();
        let tenant_id = request.tenant_id.clone();
        let conversation_id = request.conversation_id.clone();

        match AssertUnwindSafe(self.process_guarded(request, started))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let error = self
                    .record_panic(&tenant_id, &conversation_id, started, panic)
                    .await;
                ProcessOutcome::failed(None, None, vec![error], started)
            }
        }
    }

    /// Count a caught panic against the tenant. Returns the error text.
    async fn record_panic(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        started: Instant,
        panic: Box<dyn Any + Send>,
    ) -> String {
        let reason = panic_reason(panic.as_ref());
        error!(
            tenant_id = %tenant_id,
            conversation_id = %conversation_id,
            reason = %reason,
            "Panic while processing message"
        );
        let error = PipelineError::Unexpected(reason).to_string();
        self.monitor
            .record_failure(event(tenant_id, conversation_id, started, None), &error)
            .await;
        self.breakers.record_failure(tenant_id);
        error
    }

    async fn process_guarded(&self, request: ProcessRequest, started: Instant) -> ProcessOutcome {
        let tenant_id = request.tenant_id.clone();

        let Some(runtime) = self.runtime(&tenant_id).await else {
            debug!(tenant_id = %tenant_id, "Rejected message for unknown tenant");
            return ProcessOutcome::rejected(PipelineError::UnknownTenant { tenant_id }, started);
        };
        if !runtime.policy.enabled {
            return ProcessOutcome::rejected(PipelineError::TenantDisabled { tenant_id }, started);
        }
        if !self.rate_limiter.try_acquire(&tenant_id).await {
            warn!(tenant_id = %tenant_id, "Tenant rate limited");
            return ProcessOutcome::rejected(PipelineError::RateLimited { tenant_id }, started);
        }

        match self.breakers.admit(&tenant_id) {
            Admission::Rejected => self.fallback(&runtime.policy, request, started).await,
            admission => self.execute(&runtime, request, admission, started).await,
        }
    }

    /// Steps 4 to 8 for an admitted request.
    async fn execute(
        &self,
        runtime: &TenantRuntime,
        request: ProcessRequest,
        admission: Admission,
        started: Instant,
    ) -> ProcessOutcome {
        let policy = Arc::clone(&runtime.policy);
        let _slot = Arc::clone(&runtime.slots).acquire_owned().await.ok();
        let conversation_id = request.conversation_id.clone();
        let metadata = tenant_metadata(&policy, &request);

        let (receipt, message) = match self
            .queue
            .ingest_and_claim(
                conversation_id.clone(),
                request.channel,
                request.content,
                metadata,
            )
            .await
        {
            Ok(ingested) => ingested,
            Err(err) => {
                warn!(
                    tenant_id = %policy.tenant_id,
                    conversation_id = %conversation_id,
                    error = %err,
                    "Ingestion failed"
                );
                let error = err.to_string();
                let verdict = match &err {
                    IngestError::Validation(_) => Verdict::Neutral,
                    _ => Verdict::Failure(&error),
                };
                self.settle(
                    &policy.tenant_id,
                    admission,
                    verdict,
                    event(&policy.tenant_id, &conversation_id, started, None),
                )
                .await;
                return ProcessOutcome::rejected(PipelineError::Ingestion(err), started);
            }
        };
        let claim = ClaimGuard::new(&self.queue, message.id);
        let mut warnings = receipt.warnings;

        match self
            .analyze_claimed(&policy, &message, claim, admission, started)
            .await
        {
            Conclusion::Superseded(result) => {
                warnings.push("analysis superseded by a newer message in the conversation".into());
                ProcessOutcome {
                    success: true,
                    message_id: Some(message.id),
                    result: Some(result),
                    analysis: None,
                    errors: Vec::new(),
                    warnings,
                    fallback: None,
                    processing_time_ms: elapsed_ms(started),
                }
            }
            Conclusion::Failed(result) => {
                let errors = result.errors.clone();
                ProcessOutcome::failed(Some(message.id), Some(result), errors, started)
            }
            Conclusion::Processed { result, analysis } => ProcessOutcome {
                success: true,
                message_id: Some(message.id),
                result: Some(result),
                analysis,
                errors: Vec::new(),
                warnings,
                fallback: None,
                processing_time_ms: elapsed_ms(started),
            },
        }
    }

    /// Analyze a claimed message under `policy`, mark it, fan the outcome
    /// out, and settle the monitor and the breaker.
    async fn analyze_claimed(
        &self,
        policy: &TenantPolicy,
        message: &IngestedMessage,
        mut claim: ClaimGuard,
        admission: Admission,
        started: Instant,
    ) -> Conclusion {
        let tenant_id = policy.tenant_id.as_str();
        let conversation_id = message.conversation_id.as_str();

        let analysis = self
            .processor
            .process_message(message, None, policy.process_options());
        let mut result = match tokio::time::timeout(policy.timeout, analysis).await {
            Ok(result) => result,
            Err(_) => {
                let timeout = AnalysisError::Timeout {
                    timeout: policy.timeout,
                };
                ProcessingResult::failed(message, timeout.to_string(), elapsed_ms(started))
            }
        };
        claim.disarm();

        if result.cancelled {
            if let Err(err) = self.queue.mark_as_processed(message.id).await {
                warn!(id = %message.id, error = %err, "Could not complete superseded message");
            }
            policy.redact(&mut result);
            self.settle(
                tenant_id,
                admission,
                Verdict::Neutral,
                event(tenant_id, conversation_id, started, Some(&result)),
            )
            .await;
            return Conclusion::Superseded(result);
        }

        if !result.is_success() {
            let reason = result.errors.join("; ");
            match self.queue.mark_as_failed(message.id, reason.clone()).await {
                Ok(status) => debug!(id = %message.id, status = %status, "Message marked failed"),
                Err(err) => warn!(id = %message.id, error = %err, "Could not mark message failed"),
            }
            policy.redact(&mut result);
            self.publish_failed(policy, conversation_id, message.id, &result.errors)
                .await;
            self.settle(
                tenant_id,
                admission,
                Verdict::Failure(&reason),
                event(tenant_id, conversation_id, started, Some(&result)),
            )
            .await;
            return Conclusion::Failed(result);
        }

        if let Err(err) = self.queue.mark_as_processed(message.id).await {
            warn!(id = %message.id, error = %err, "Could not mark message processed");
        }
        let analysis = if policy.real_time_insights {
            self.conversation_insights(policy, message, &result).await
        } else {
            None
        };
        policy.redact(&mut result);

        self.publish_processed(policy, message, &result, analysis.as_ref())
            .await;
        self.settle(
            tenant_id,
            admission,
            Verdict::Success,
            event(tenant_id, conversation_id, started, Some(&result)),
        )
        .await;
        Conclusion::Processed { result, analysis }
    }

    /// Insights for `message`, derived from its own result. Messages that
    /// arrived later in the conversation are not considered.
    async fn conversation_insights(
        &self,
        policy: &TenantPolicy,
        message: &IngestedMessage,
        result: &ProcessingResult,
    ) -> Option<ConversationAnalysis> {
        let context = self.processor.context_through(message).await;
        match self
            .processor
            .analyze_conversation(&context, result.clone())
            .await
        {
            Ok(mut analysis) => {
                policy.redact(&mut analysis.result);
                if !policy.features.recommendations {
                    analysis.recommendations.clear();
                }
                Some(analysis)
            }
            Err(err) => {
                warn!(
                    tenant_id = %policy.tenant_id,
                    conversation_id = %message.conversation_id,
                    error = %err,
                    "Conversation insights failed"
                );
                None
            }
        }
    }

    /// Answer for a tenant whose breaker is open.
    async fn fallback(
        &self,
        policy: &TenantPolicy,
        request: ProcessRequest,
        started: Instant,
    ) -> ProcessOutcome {
        let tenant_id = policy.tenant_id.clone();
        info!(
            tenant_id = %tenant_id,
            conversation_id = %request.conversation_id,
            mode = ?policy.fallback_mode,
            "Circuit open, using fallback"
        );

        match policy.fallback_mode {
            FallbackMode::Offline => {
                ProcessOutcome::rejected(PipelineError::CircuitOpen { tenant_id }, started)
            }
            FallbackMode::Cache => {
                let (mut result, warning) =
                    match self.processor.latest_result(&request.conversation_id).await {
                        Some(result) => (result, "circuit open: served cached result"),
                        None => (
                            neutral_result(&request.conversation_id),
                            "circuit open: served neutral placeholder result",
                        ),
                    };
                result.cached = true;
                policy.redact(&mut result);
                ProcessOutcome {
                    success: true,
                    message_id: None,
                    result: Some(result),
                    analysis: None,
                    errors: Vec::new(),
                    warnings: vec![warning.to_string()],
                    fallback: Some(FallbackMode::Cache),
                    processing_time_ms: elapsed_ms(started),
                }
            }
            FallbackMode::Degraded => {
                let metadata = tenant_metadata(policy, &request);
                match self
                    .queue
                    .ingest_message(
                        request.conversation_id,
                        request.channel,
                        request.content,
                        metadata,
                    )
                    .await
                {
                    Ok(receipt) => {
                        let mut warnings = receipt.warnings;
                        warnings.push("circuit open: message queued for deferred analysis".into());
                        ProcessOutcome {
                            success: true,
                            message_id: Some(receipt.id),
                            result: None,
                            analysis: None,
                            errors: Vec::new(),
                            warnings,
                            fallback: Some(FallbackMode::Degraded),
                            processing_time_ms: elapsed_ms(started),
                        }
                    }
                    Err(err) => {
                        let mut outcome =
                            ProcessOutcome::rejected(PipelineError::Ingestion(err), started);
                        outcome.fallback = Some(FallbackMode::Degraded);
                        outcome
                    }
                }
            }
        }
    }

    /// Process many requests. With load balancing the input is split into
    /// `worker_count` contiguous sub-batches that run concurrently (each
    /// sequentially). Outcomes are in input order.
    pub async fn process_batch(&self, requests: Vec<ProcessRequest>) -> Vec<ProcessOutcome> {
        let total = requests.len();
        let workers = self.config.worker_count.max(1);
        let outcomes = if self.config.load_balancing && workers > 1 && total > 1 {
            let chunk = total.div_ceil(workers);
            let batches = requests.chunks(chunk).map(|batch| async move {
                let mut outcomes = Vec::with_capacity(batch.len());
                for request in batch {
                    outcomes.push(self.process_conversation_message(request.clone()).await);
                }
                outcomes
            });
            join_all(batches).await.into_iter().flatten().collect::<Vec<_>>()
        } else {
            let mut outcomes = Vec::with_capacity(total);
            for request in requests {
                outcomes.push(self.process_conversation_message(request).await);
            }
            outcomes
        };

        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(total, failed, "Batch processed");
        outcomes
    }

    /// Claim due messages (deferred or retrying) and analyze each under
    /// its tenant's policy.
    pub async fn drain_once(&self) -> usize {
        let messages = self.queue.claim_batch(self.config.drain_batch_size).await;
        if messages.is_empty() {
            return 0;
        }
        let claims: Vec<ClaimGuard> = messages
            .iter()
            .map(|m| ClaimGuard::new(&self.queue, m.id))
            .collect();

        let drains = messages
            .iter()
            .zip(claims)
            .map(|(message, claim)| self.drain_message(message, claim));
        join_all(drains).await;

        debug!(drained = messages.len(), "Queue drained");
        messages.len()
    }

    async fn drain_message(&self, message: &IngestedMessage, claim: ClaimGuard) {
        let started = Instant::now();
        let tenant_id = message
            .metadata
            .tenant_id
            .clone()
            .unwrap_or_else(|| DEFAULT_TENANT.to_string());
        let (policy, slots) = match self.runtime(&tenant_id).await {
            Some(runtime) => (runtime.policy, Some(runtime.slots)),
            None => (Arc::new(TenantPolicy::new(tenant_id.clone())), None),
        };

        let drain = async {
            let _slot = match slots {
                Some(slots) => slots.acquire_owned().await.ok(),
                None => None,
            };
            self.analyze_claimed(&policy, message, claim, Admission::Allowed, started)
                .await
        };
        if let Err(panic) = AssertUnwindSafe(drain).catch_unwind().await {
            self.record_panic(&tenant_id, &message.conversation_id, started, panic)
                .await;
        }
    }

    async fn settle(
        &self,
        tenant_id: &str,
        admission: Admission,
        verdict: Verdict<'_>,
        event: ProcessingEvent,
    ) {
        match verdict {
            Verdict::Success => {
                self.monitor.record_success(event).await;
                self.breakers.record_success(tenant_id);
            }
            Verdict::Failure(error) => {
                self.monitor.record_failure(event, error).await;
                self.breakers.record_failure(tenant_id);
            }
            Verdict::Neutral => {}
        }
        // A trial slot goes back only after the outcome is recorded.
        drop(admission);
    }

    // ── Notifications ───────────────────────────────────────────────

    pub async fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<ConversationEvent> {
        self.notifications.subscribe(conversation_id).await
    }

    pub async fn notification_stats(&self) -> NotificationStats {
        self.notifications.stats().await
    }

    async fn publish_processed(
        &self,
        policy: &TenantPolicy,
        message: &IngestedMessage,
        result: &ProcessingResult,
        analysis: Option<&ConversationAnalysis>,
    ) {
        let now = Utc::now();
        self.notifications
            .publish(ConversationEvent::MessageProcessed {
                conversation_id: message.conversation_id.clone(),
                message_id: message.id,
                result: Box::new(result.clone()),
                analysis: analysis.map(|a| Box::new(a.clone())),
                timestamp: now,
            })
            .await;

        let payload = WebhookPayload::new(
            EVENT_MESSAGE_PROCESSED,
            &message.conversation_id,
            message.id,
            Some(result),
            analysis,
            now,
        );
        self.dispatch_webhook(policy, &payload).await;
    }

    async fn publish_failed(
        &self,
        policy: &TenantPolicy,
        conversation_id: &str,
        message_id: Uuid,
        errors: &[String],
    ) {
        let now = Utc::now();
        self.notifications
            .publish(ConversationEvent::MessageFailed {
                conversation_id: conversation_id.to_string(),
                message_id: Some(message_id),
                errors: errors.to_vec(),
                timestamp: now,
            })
            .await;

        let payload =
            WebhookPayload::new(EVENT_MESSAGE_FAILED, conversation_id, message_id, None, None, now);
        self.dispatch_webhook(policy, &payload).await;
    }

    /// Best effort: failures are logged, never retried.
    async fn dispatch_webhook(&self, policy: &TenantPolicy, payload: &WebhookPayload) {
        let Some(target) = policy.webhook.as_ref() else {
            return;
        };
        if !policy.features.webhooks || !target.events.iter().any(|e| *e == payload.event_type) {
            return;
        }

        let delivery = self.webhooks.deliver(target, payload);
        match tokio::time::timeout(self.config.webhook_timeout, delivery).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                tenant_id = %policy.tenant_id,
                event = %payload.event_type,
                error = %err,
                "Webhook delivery failed"
            ),
            Err(_) => warn!(
                tenant_id = %policy.tenant_id,
                event = %payload.event_type,
                url = %target.url,
                "Webhook delivery timed out"
            ),
        }
    }

    // ── Health ──────────────────────────────────────────────────────

    pub async fn health(&self) -> SystemHealth {
        let (queue, processor, tenants, notifications, monitor) = tokio::join!(
            self.queue.check(),
            self.processor.check(),
            self.tenants.check(),
            self.notifications.check(),
            self.monitor.check(),
        );
        let components = vec![queue, processor, tenants, notifications, monitor];
        let state = overall_state(&components);

        let circuits = self
            .breakers
            .tripped()
            .into_iter()
            .map(|(tenant_id, state)| CircuitStatus { tenant_id, state })
            .collect();

        let monitored = self.monitor.metrics().await;
        let metrics = SystemMetrics {
            total_processed: monitored.total_processed,
            average_latency_ms: monitored.average_latency_ms,
            error_rate: monitored.error_rate,
            active_connections: self.notifications.stats().await.active_connections,
            active_analyses: self.processor.active_analyses(),
            queue: self.queue.stats().await,
        };

        SystemHealth {
            state,
            components,
            circuits,
            metrics,
            checked_at: Utc::now(),
        }
    }

    /// Health check plus auto-recovery when the system is unhealthy.
    pub async fn run_health_check(&self) -> SystemHealth {
        let health = self.health().await;
        match health.state {
            HealthState::Healthy => debug!("System healthy"),
            HealthState::Degraded => {
                let degraded: Vec<&str> = health
                    .components
                    .iter()
                    .filter(|c| c.state != HealthState::Healthy)
                    .map(|c| c.component.as_str())
                    .collect();
                warn!(components = ?degraded, "System degraded");
            }
            HealthState::Unhealthy => {
                warn!("System unhealthy, attempting recovery");
                let reports = self.auto_recover(&health).await;
                let recovered = reports.iter().filter(|r| r.recovered).count();
                info!(attempted = reports.len(), recovered, "Auto-recovery finished");
            }
        }
        health
    }

    /// Try to heal every unhealthy component in `health`.
    pub async fn auto_recover(&self, health: &SystemHealth) -> Vec<RecoveryReport> {
        let mut reports = Vec::new();
        for component in health
            .components
            .iter()
            .filter(|c| c.state == HealthState::Unhealthy)
        {
            let name = component.component.as_str();
            let report = if name == self.queue.component() {
                self.recover_component(self.queue.as_ref()).await
            } else if name == self.processor.component() {
                self.recover_component(self.processor.as_ref()).await
            } else if name == self.tenants.component() {
                self.recover_component(self.tenants.as_ref()).await
            } else if name == self.notifications.component() {
                self.recover_component(self.notifications.as_ref()).await
            } else if name == self.monitor.component() {
                self.recover_component(self.monitor.as_ref()).await
            } else {
                continue;
            };
            reports.push(report);
        }
        reports
    }

    async fn recover_component<P>(&self, probe: &P) -> RecoveryReport
    where
        P: HealthProbe + ?Sized,
    {
        let component = probe.component();
        let mut actions = Vec::new();
        for attempt in 1..=self.config.max_recovery_attempts {
            let action = probe.recover().await;
            info!(component, attempt, action = %action, "Recovery action taken");
            actions.push(action);

            tokio::time::sleep(self.config.recovery_delay).await;
            if probe.check().await.state != HealthState::Unhealthy {
                info!(component, attempt, "Component recovered");
                return RecoveryReport {
                    component: component.to_string(),
                    attempts: attempt,
                    recovered: true,
                    actions,
                };
            }
        }

        error!(
            component,
            attempts = self.config.max_recovery_attempts,
            "Auto-recovery gave up"
        );
        RecoveryReport {
            component: component.to_string(),
            attempts: self.config.max_recovery_attempts,
            recovered: false,
            actions,
        }
    }

    pub async fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            monitor: self.monitor.metrics().await,
            processor: self.processor.stats().await,
            queue: self.queue.stats().await,
            notifications: self.notifications.stats().await,
            tenants: self.policies.read().await.len(),
        }
    }

    /// Log a one-line metrics summary.
    pub async fn log_metrics(&self) {
        let metrics = self.metrics().await;
        info!(
            processed = metrics.monitor.total_processed,
            error_rate = metrics.monitor.error_rate,
            avg_latency_ms = metrics.monitor.average_latency_ms,
            queue_pending = metrics.queue.pending,
            queue_utilization = metrics.queue.utilization,
            active_analyses = metrics.processor.active_analyses,
            cache_entries = metrics.processor.cache_entries,
            subscribers = metrics.notifications.active_connections,
            tenants = metrics.tenants,
            "Pipeline metrics"
        );
    }

    /// Requeue stalled claims, then run retention cleanup for the queue,
    /// the cache, and notification channels.
    pub async fn housekeeping(&self) -> HousekeepingReport {
        let report = HousekeepingReport {
            requeued_messages: self
                .queue
                .requeue_stale(self.config.stale_processing_timeout)
                .await,
            expired_messages: self.queue.cleanup(self.queue.config().retention).await,
            expired_cache_entries: self.processor.cleanup_cache().await,
            stale_channels: self.notifications.cleanup_stale().await,
        };
        debug!(?report, "Housekeeping finished");
        report
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn event(
    tenant_id: &str,
    conversation_id: &str,
    started: Instant,
    result: Option<&ProcessingResult>,
) -> ProcessingEvent {
    ProcessingEvent {
        tenant_id: tenant_id.to_string(),
        conversation_id: conversation_id.to_string(),
        latency_ms: elapsed_ms(started),
        emotion_confidence: result.and_then(|r| r.emotion.as_ref()).map(|e| e.confidence),
        intent_confidence: result.and_then(|r| r.intent.as_ref()).map(|i| i.confidence),
    }
}

/// Request metadata stamped with tenant and user ids and the tenant's
/// default priority.
fn tenant_metadata(policy: &TenantPolicy, request: &ProcessRequest) -> MessageMetadata {
    let mut metadata = request.metadata.clone();
    metadata.tenant_id = Some(policy.tenant_id.clone());
    if request.user_id.is_some() {
        metadata.user_id = request.user_id.clone();
    }
    metadata.priority.get_or_insert(policy.priority);
    metadata
}

/// Placeholder served by the cache fallback when nothing is cached.
fn neutral_result(conversation_id: &str) -> ProcessingResult {
    ProcessingResult {
        conversation_id: conversation_id.to_string(),
        message_id: Uuid::nil(),
        emotion: Some(EmotionResult {
            sentiment: Sentiment::Neutral,
            confidence: 0.0,
            primary_emotion: None,
            intensity: None,
        }),
        intent: Some(IntentResult {
            primary_intent: "general_inquiry".into(),
            urgency: Urgency::Low,
            complexity: Complexity::Simple,
            confidence: 0.0,
            entities: Vec::new(),
            keywords: Vec::new(),
        }),
        processing_time_ms: 0,
        timestamp: Utc::now(),
        cached: true,
        cancelled: false,
        errors: Vec::new(),
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
