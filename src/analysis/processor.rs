//! Real-time processor: cached, bounded, cancellable message analysis.
//!
//! Flow for one message:
//! 1. Result cache (by message id) → may short-circuit
//! 2. Wait for an analysis slot
//! 3. Supersede any in-flight analysis for the same conversation
//! 4. Emotion + intent analyzers run concurrently, under a timeout
//! 5. Cache and record statistics
//!
//! Cancellation is best effort: a superseded call may still finish, and
//! its result comes back flagged `cancelled` and is never cached.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{join_all, try_join};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::analyzer::{EmotionAnalyzer, IntentAnalyzer};
use crate::analysis::cache::ResultCache;
use crate::analysis::insights::{self, FlowThresholds};
use crate::analysis::limiter::AnalysisLimiter;
use crate::analysis::types::{
    ConversationAnalysis, ConversationContext, EmotionOptions, EmotionRequest, EmotionResult,
    IntentOptions, IntentRequest, IntentResult, ProcessOptions, ProcessingResult,
};
use crate::config::ProcessorConfig;
use crate::error::AnalysisError;
use crate::health::{ComponentHealth, HealthProbe, RecoveryAction};
use crate::ingestion::types::{Channel, IngestedMessage, MessageContent, MessageMetadata};

const HEALTH_CHECK_CONVERSATION: &str = "__health_check__";
const HEALTH_CHECK_TEXT: &str = "Hello, I need help with my order please";

struct InFlight {
    generation: u64,
    token: CancellationToken,
}

type InFlightMap = std::sync::Mutex<HashMap<String, InFlight>>;

/// Registration of one running analysis. Dropping it (normally, or when
/// the caller's future is dropped) removes the entry unless a newer
/// analysis has taken the conversation over.
struct InFlightGuard<'a> {
    in_flight: &'a InFlightMap,
    conversation_id: String,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(&self.conversation_id)
            .is_some_and(|f| f.generation == self.generation)
        {
            in_flight.remove(&self.conversation_id);
        }
    }
}

struct ConversationWindow {
    messages: VecDeque<IngestedMessage>,
    last_activity: Instant,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    errors: u64,
    cache_hits: u64,
    cancellations: u64,
    average_latency_ms: f64,
}

/// Snapshot of processor counters.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cancellations: u64,
    pub average_latency_ms: f64,
    pub active_analyses: usize,
    pub peak_active_analyses: usize,
    pub max_concurrent_analyses: usize,
    pub cache_entries: usize,
    pub tracked_conversations: usize,
}

/// Runs emotion/intent analysis with caching and bounded concurrency.
pub struct RealTimeProcessor {
    config: ProcessorConfig,
    emotion: Arc<dyn EmotionAnalyzer>,
    intent: Arc<dyn IntentAnalyzer>,
    cache: ResultCache,
    limiter: AnalysisLimiter,
    in_flight: InFlightMap,
    next_generation: AtomicU64,
    windows: RwLock<HashMap<String, ConversationWindow>>,
    counters: Mutex<Counters>,
}

impl RealTimeProcessor {
    pub fn new(
        config: ProcessorConfig,
        emotion: Arc<dyn EmotionAnalyzer>,
        intent: Arc<dyn IntentAnalyzer>,
    ) -> Arc<Self> {
        info!(
            emotion = emotion.name(),
            intent = intent.name(),
            max_concurrent = config.max_concurrent_analyses,
            "Real-time processor ready"
        );
        Arc::new(Self {
            cache: ResultCache::new(config.cache_ttl, config.cache_max_size),
            limiter: AnalysisLimiter::new(config.max_concurrent_analyses),
            config,
            emotion,
            intent,
            in_flight: std::sync::Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            windows: RwLock::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    // ── Single message ──────────────────────────────────────────────

    /// Analyze one message. Never fails: errors come back on the result.
    pub async fn process_message(
        &self,
        message: &IngestedMessage,
        context: Option<ConversationContext>,
        options: ProcessOptions,
    ) -> ProcessingResult {
        if options.use_cache {
            if let Some(mut hit) = self.cache.get(message.id).await {
                hit.cached = true;
                self.counters.lock().await.cache_hits += 1;
                debug!(message_id = %message.id, "Analysis cache hit");
                return hit;
            }
        }

        self.observe(message).await;

        let started = Instant::now();
        let _permit = self.limiter.acquire().await;
        let (registration, token) = self.begin(&message.conversation_id);

        let context = match context {
            Some(context) => context,
            None => self.context_for(message).await,
        };
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(AnalysisError::Cancelled {
                conversation_id: message.conversation_id.clone(),
            }),
            outcome = self.analyze(message, &context, &options) => outcome,
        };

        drop(registration);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((emotion, intent)) if !token.is_cancelled() => {
                let result = ProcessingResult {
                    conversation_id: message.conversation_id.clone(),
                    message_id: message.id,
                    emotion: Some(emotion),
                    intent: Some(intent),
                    processing_time_ms: elapsed_ms,
                    timestamp: Utc::now(),
                    cached: false,
                    cancelled: false,
                    errors: Vec::new(),
                };
                self.cache.insert(result.clone()).await;
                self.record_success(elapsed_ms).await;
                debug!(
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    elapsed_ms,
                    "Message analyzed"
                );
                result
            }
            Ok(_) | Err(AnalysisError::Cancelled { .. }) => {
                self.counters.lock().await.cancellations += 1;
                debug!(
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    "Analysis superseded"
                );
                let mut result = ProcessingResult::failed(message, "analysis cancelled", elapsed_ms);
                result.cancelled = true;
                result
            }
            Err(err) => {
                self.counters.lock().await.errors += 1;
                warn!(
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    error = %err,
                    "Analysis failed"
                );
                match self.cache.get(message.id).await {
                    Some(mut fallback) => {
                        fallback.cached = true;
                        fallback.errors.push(err.to_string());
                        fallback
                    }
                    None => ProcessingResult::failed(message, err.to_string(), elapsed_ms),
                }
            }
        }
    }

    /// Run both analyzers concurrently under the configured timeout.
    async fn analyze(
        &self,
        message: &IngestedMessage,
        context: &ConversationContext,
        options: &ProcessOptions,
    ) -> Result<(EmotionResult, IntentResult), AnalysisError> {
        let text = message
            .normalized_text
            .clone()
            .unwrap_or_else(|| message.text().to_string());
        if text.trim().is_empty() {
            return Err(AnalysisError::AnalyzerFailed {
                analyzer: "input".into(),
                reason: "message has no text to analyze".into(),
            });
        }

        let context_window: Vec<String> = {
            let earlier = ConversationContext {
                messages: context
                    .messages
                    .iter()
                    .filter(|m| m.id != message.id)
                    .cloned()
                    .collect(),
                ..context.clone()
            };
            earlier.recent_text(self.config.context_window)
        };
        let language = message
            .metadata
            .language
            .clone()
            .unwrap_or_else(|| context.metadata.language.clone());
        let min_confidence = options.min_confidence.unwrap_or(self.config.min_confidence);

        let emotion_request = EmotionRequest {
            text: text.clone(),
            conversation_id: message.conversation_id.clone(),
            message_id: message.id,
            language: language.clone(),
            context_window: context_window.clone(),
            options: EmotionOptions {
                min_confidence,
                include_intensity: true,
            },
        };
        let intent_request = IntentRequest {
            text,
            conversation_id: message.conversation_id.clone(),
            message_id: message.id,
            language,
            context_window,
            options: IntentOptions {
                min_confidence,
                ..IntentOptions::default()
            },
        };

        let both = try_join(
            self.emotion.analyze(emotion_request),
            self.intent.analyze(intent_request),
        );
        match tokio::time::timeout(self.config.analysis_timeout, both).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AnalysisError::Timeout {
                timeout: self.config.analysis_timeout,
            }),
        }
    }

    // ── Conversation ────────────────────────────────────────────────

    /// Analyze the latest message of a conversation and derive insights.
    ///
    /// Without an explicit context, the processor's own window is used.
    pub async fn process_conversation(
        &self,
        conversation_id: &str,
        context: Option<ConversationContext>,
        options: ProcessOptions,
    ) -> Result<ConversationAnalysis, AnalysisError> {
        let context = match context {
            Some(context) => context,
            None => self
                .build_context(conversation_id)
                .await
                .ok_or_else(|| AnalysisError::EmptyContext {
                    conversation_id: conversation_id.to_string(),
                })?,
        };
        let latest = context
            .latest()
            .cloned()
            .ok_or_else(|| AnalysisError::EmptyContext {
                conversation_id: conversation_id.to_string(),
            })?;

        let result = self
            .process_message(&latest, Some(context.clone()), options)
            .await;
        self.analyze_conversation(&context, result).await
    }

    /// Derive insights from a result already computed for the context's
    /// latest message. Runs no analyzer.
    pub async fn analyze_conversation(
        &self,
        context: &ConversationContext,
        result: ProcessingResult,
    ) -> Result<ConversationAnalysis, AnalysisError> {
        let conversation_id = context.conversation_id.as_str();
        if result.cancelled {
            return Err(AnalysisError::Cancelled {
                conversation_id: conversation_id.to_string(),
            });
        }
        if result.emotion.is_none() && result.intent.is_none() {
            return Err(AnalysisError::AnalyzerFailed {
                analyzer: "processor".into(),
                reason: result.errors.join("; "),
            });
        }

        let mut sentiments = Vec::new();
        for earlier in context.messages.iter().filter(|m| m.id != result.message_id) {
            if let Some(emotion) = self.cache.get(earlier.id).await.and_then(|r| r.emotion) {
                sentiments.push(emotion.sentiment);
            }
        }
        if let Some(emotion) = &result.emotion {
            sentiments.push(emotion.sentiment);
        }

        let thresholds = FlowThresholds {
            escalation_rate_per_minute: self.config.escalation_rate_per_minute,
            stuck_rate_per_minute: self.config.stuck_rate_per_minute,
            stuck_window: self.config.stuck_window,
        };
        let insights = insights::derive_insights(context, &result, &sentiments, &thresholds);
        let recommendations = insights::recommendations(&insights, &result);

        debug!(
            conversation_id = %conversation_id,
            message_id = %result.message_id,
            flow = ?insights.flow,
            trend = ?insights.sentiment_trend,
            recommendations = recommendations.len(),
            "Conversation analyzed"
        );

        Ok(ConversationAnalysis {
            conversation_id: conversation_id.to_string(),
            result,
            insights,
            recommendations,
        })
    }

    /// Analyze many messages concurrently; results are in input order.
    pub async fn process_batch(
        &self,
        messages: &[IngestedMessage],
        contexts: Option<&HashMap<String, ConversationContext>>,
        options: ProcessOptions,
    ) -> Vec<ProcessingResult> {
        let futures = messages.iter().map(|message| {
            let context = contexts.and_then(|c| c.get(&message.conversation_id).cloned());
            self.process_message(message, context, options)
        });
        let results = join_all(futures).await;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(total = results.len(), failed, "Batch analysis complete");
        results
    }

    // ── Cancellation ────────────────────────────────────────────────

    /// Signal cancellation of the in-flight analysis for a conversation.
    pub async fn cancel_analysis(&self, conversation_id: &str) -> bool {
        match self.in_flight().remove(conversation_id) {
            Some(in_flight) => {
                in_flight.token.cancel();
                info!(conversation_id = %conversation_id, "Analysis cancelled");
                true
            }
            None => false,
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new analysis, superseding the previous one.
    fn begin(&self, conversation_id: &str) -> (InFlightGuard<'_>, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let previous = self.in_flight().insert(
            conversation_id.to_string(),
            InFlight {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        let registration = InFlightGuard {
            in_flight: &self.in_flight,
            conversation_id: conversation_id.to_string(),
            generation,
        };
        (registration, token)
    }

    // ── Conversation windows ────────────────────────────────────────

    async fn observe(&self, message: &IngestedMessage) {
        let mut windows = self.windows.write().await;
        let window = windows
            .entry(message.conversation_id.clone())
            .or_insert_with(|| ConversationWindow {
                messages: VecDeque::new(),
                last_activity: Instant::now(),
            });
        if !window.messages.iter().any(|m| m.id == message.id) {
            window.messages.push_back(message.clone());
        }
        while window.messages.len() > self.config.max_context_messages.max(1) {
            window.messages.pop_front();
        }
        window.last_activity = Instant::now();
    }

    /// Context built from the processor's window for a conversation.
    pub async fn build_context(&self, conversation_id: &str) -> Option<ConversationContext> {
        let windows = self.windows.read().await;
        let window = windows.get(conversation_id)?;
        Some(ConversationContext::from_messages(
            conversation_id,
            window.messages.iter().cloned().collect(),
            self.config.max_context_messages,
        ))
    }

    /// Context whose latest message is `message`: the window up to and
    /// including it. Later arrivals in the same conversation are left out.
    pub async fn context_through(&self, message: &IngestedMessage) -> ConversationContext {
        let cutoff = (message.timestamp(), message.sequence);
        let mut messages: Vec<IngestedMessage> = {
            let windows = self.windows.read().await;
            windows
                .get(&message.conversation_id)
                .map(|window| {
                    window
                        .messages
                        .iter()
                        .filter(|m| m.id != message.id && (m.timestamp(), m.sequence) <= cutoff)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        messages.push(message.clone());
        ConversationContext::from_messages(
            message.conversation_id.clone(),
            messages,
            self.config.max_context_messages,
        )
    }

    async fn context_for(&self, message: &IngestedMessage) -> ConversationContext {
        match self.build_context(&message.conversation_id).await {
            Some(context) => context,
            None => ConversationContext::from_messages(
                message.conversation_id.clone(),
                vec![message.clone()],
                self.config.max_context_messages,
            ),
        }
    }

    // ── Housekeeping & stats ────────────────────────────────────────

    /// Evict expired cache entries and idle conversation windows.
    pub async fn cleanup_cache(&self) -> usize {
        let expired = self.cache.evict_expired().await;
        let idle = {
            let mut windows = self.windows.write().await;
            let before = windows.len();
            let timeout = self.config.conversation_idle_timeout;
            windows.retain(|_, w| w.last_activity.elapsed() < timeout);
            before - windows.len()
        };
        if expired > 0 || idle > 0 {
            info!(expired, idle_conversations = idle, "Processor cache cleaned");
        }
        expired
    }

    /// Newest cached result for a conversation.
    pub async fn latest_result(&self, conversation_id: &str) -> Option<ProcessingResult> {
        self.cache.latest_for_conversation(conversation_id).await
    }

    pub fn active_analyses(&self) -> usize {
        self.limiter.active()
    }

    pub fn peak_active_analyses(&self) -> usize {
        self.limiter.peak()
    }

    async fn record_success(&self, elapsed_ms: u64) {
        let mut counters = self.counters.lock().await;
        counters.processed += 1;
        let n = counters.processed as f64;
        counters.average_latency_ms += (elapsed_ms as f64 - counters.average_latency_ms) / n;
    }

    pub async fn stats(&self) -> ProcessorStats {
        let (processed, errors, cache_hits, cancellations, average_latency_ms) = {
            let c = self.counters.lock().await;
            (c.processed, c.errors, c.cache_hits, c.cancellations, c.average_latency_ms)
        };
        ProcessorStats {
            processed,
            errors,
            cache_hits,
            cancellations,
            average_latency_ms,
            active_analyses: self.limiter.active(),
            peak_active_analyses: self.limiter.peak(),
            max_concurrent_analyses: self.limiter.capacity(),
            cache_entries: self.cache.len().await,
            tracked_conversations: self.windows.read().await.len(),
        }
    }

    /// Stop in-flight work and drop all cached state (shutdown).
    pub async fn shutdown(&self) {
        let drained: Vec<InFlight> = self.in_flight().drain().map(|(_, f)| f).collect();
        for in_flight in drained {
            in_flight.token.cancel();
        }
        self.cache.clear().await;
        self.windows.write().await.clear();
    }
}

#[async_trait]
impl HealthProbe for RealTimeProcessor {
    fn component(&self) -> &'static str {
        "realtime_processor"
    }

    /// Push a synthetic message through the analyzers, bypassing cache and stats.
    async fn check(&self) -> ComponentHealth {
        let mut message = IngestedMessage::new(
            HEALTH_CHECK_CONVERSATION,
            Channel::Chat,
            MessageContent::text(HEALTH_CHECK_TEXT),
            MessageMetadata::default().with_language("en"),
        );
        message.normalized_text = Some(HEALTH_CHECK_TEXT.to_lowercase());
        let context = ConversationContext::from_messages(
            HEALTH_CHECK_CONVERSATION,
            vec![message.clone()],
            1,
        );

        let started = Instant::now();
        let outcome = {
            let _permit = self.limiter.acquire().await;
            self.analyze(&message, &context, &ProcessOptions::default())
                .await
        };
        let elapsed = started.elapsed();

        match outcome {
            Err(err) => ComponentHealth::unhealthy(self.component(), err.to_string()),
            Ok(_) if elapsed > self.config.latency_target => ComponentHealth::degraded(
                self.component(),
                format!(
                    "synthetic analysis took {}ms (target {}ms)",
                    elapsed.as_millis(),
                    self.config.latency_target.as_millis()
                ),
            ),
            Ok(_) => ComponentHealth::healthy(self.component()),
        }
    }

    async fn recover(&self) -> RecoveryAction {
        let count = self.cache.clear().await;
        self.limiter.reset_peak();
        RecoveryAction::Evicted { count }
    }
}
