//! Ingestion queue: bounded, priority-ordered in-memory message buffer.
//!
//! Messages are validated and preprocessed on the way in, then held until
//! the processor claims them. Retrieval order is priority tier (urgent
//! first), then arrival. Capacity check, eviction and insert happen under
//! one write lock so concurrent ingests cannot overshoot the ceiling.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::preprocess::{self, primary_subtag};
use super::types::{
    Channel, IngestReceipt, IngestedMessage, MessageContent, MessageMetadata, MessageStatus,
    NewMessage, Priority,
};
use crate::config::IngestionConfig;
use crate::error::{IngestError, ValidationIssue};
use crate::health::{ComponentHealth, HealthProbe, RecoveryAction};

/// Utilization above which the queue reports degraded.
const DEGRADED_UTILIZATION: f64 = 0.8;
/// Utilization above which the queue reports unhealthy.
const UNHEALTHY_UTILIZATION: f64 = 0.95;

type OrderKey = (Reverse<Priority>, u64);

#[derive(Default)]
struct Buffer {
    messages: HashMap<Uuid, IngestedMessage>,
    order: BTreeMap<OrderKey, Uuid>,
    next_sequence: u64,
}

impl Buffer {
    fn insert(&mut self, message: IngestedMessage) {
        self.order
            .insert((Reverse(message.priority()), message.sequence), message.id);
        self.messages.insert(message.id, message);
    }

    fn remove(&mut self, id: Uuid) -> Option<IngestedMessage> {
        let message = self.messages.remove(&id)?;
        self.order
            .remove(&(Reverse(message.priority()), message.sequence));
        Some(message)
    }

    /// Evict the oldest terminal messages until there is room for one more.
    fn make_room(&mut self, max: usize) -> usize {
        if self.messages.len() < max {
            return 0;
        }
        let mut terminal: Vec<(chrono::DateTime<Utc>, Uuid)> = self
            .messages
            .values()
            .filter(|m| m.status.is_terminal())
            .map(|m| (m.processed_at.unwrap_or(m.created_at), m.id))
            .collect();
        terminal.sort();

        let needed = self.messages.len() + 1 - max;
        let mut evicted = 0;
        for (_, id) in terminal.into_iter().take(needed) {
            self.remove(id);
            evicted += 1;
        }
        evicted
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub capacity: usize,
    pub utilization: f64,
}

/// Bounded, priority-ordered message buffer.
pub struct IngestionQueue {
    config: IngestionConfig,
    buffer: RwLock<Buffer>,
}

impl IngestionQueue {
    /// Create a new queue.
    pub fn new(config: IngestionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            buffer: RwLock::new(Buffer::default()),
        })
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Validate an incoming message without touching the buffer.
    pub fn validate(
        &self,
        conversation_id: &str,
        content: &MessageContent,
        metadata: &MessageMetadata,
    ) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if conversation_id.trim().is_empty() {
            issues.push(ValidationIssue::new(
                "conversation_id",
                "conversation id must not be empty",
            ));
        }
        if content.is_empty() {
            issues.push(ValidationIssue::new(
                "content",
                "message must contain text, audio, or attachments",
            ));
        }
        let size = content.size_bytes();
        if size > self.config.max_message_bytes {
            issues.push(ValidationIssue::new(
                "content",
                format!(
                    "message size {size} bytes exceeds limit of {} bytes",
                    self.config.max_message_bytes
                ),
            ));
        }
        if let Some(language) = &metadata.language {
            let code = primary_subtag(language);
            if !self.config.supported_languages.iter().any(|l| *l == code) {
                issues.push(ValidationIssue::new(
                    "metadata.language",
                    format!("unsupported language '{language}'"),
                ));
            }
        }

        issues
    }

    /// Validate, preprocess, and enqueue a message.
    pub async fn ingest_message(
        &self,
        conversation_id: impl Into<String>,
        channel: Channel,
        content: MessageContent,
        metadata: MessageMetadata,
    ) -> Result<IngestReceipt, IngestError> {
        self.enqueue(conversation_id.into(), channel, content, metadata, false)
            .await
            .map(|(receipt, _)| receipt)
    }

    /// Like `ingest_message`, but the message is inserted already claimed
    /// (processing) so no drain can pick it up first.
    pub async fn ingest_and_claim(
        &self,
        conversation_id: impl Into<String>,
        channel: Channel,
        content: MessageContent,
        metadata: MessageMetadata,
    ) -> Result<(IngestReceipt, IngestedMessage), IngestError> {
        self.enqueue(conversation_id.into(), channel, content, metadata, true)
            .await
    }

    async fn enqueue(
        &self,
        conversation_id: String,
        channel: Channel,
        content: MessageContent,
        mut metadata: MessageMetadata,
        claim: bool,
    ) -> Result<(IngestReceipt, IngestedMessage), IngestError> {
        let issues = self.validate(&conversation_id, &content, &metadata);
        if !issues.is_empty() {
            debug!(
                conversation_id = %conversation_id,
                issues = issues.len(),
                "Rejected message at validation"
            );
            return Err(IngestError::Validation(issues));
        }

        let now = Utc::now();
        metadata.timestamp.get_or_insert(now);
        metadata.priority.get_or_insert(Priority::Normal);
        if let Some(language) = metadata.language.as_mut() {
            *language = primary_subtag(language);
        }

        let mut message = IngestedMessage::new(conversation_id, channel, content, metadata);
        message.preprocessing.validated = true;

        let mut warnings = Vec::new();
        if self.config.preprocessing_enabled {
            for problem in preprocess::apply(
                &mut message,
                &self.config.supported_languages,
                &self.config.default_language,
            ) {
                warnings.push(problem.to_string());
                message.errors.push(format!("preprocessing: {problem}"));
            }
        }

        let id = message.id;
        {
            let mut buffer = self.buffer.write().await;
            let evicted = buffer.make_room(self.config.max_queue_size);
            if evicted > 0 {
                debug!(evicted, "Evicted terminal messages to make room");
            }
            if buffer.messages.len() >= self.config.max_queue_size {
                warn!(
                    max = self.config.max_queue_size,
                    "Ingestion queue full, rejecting message"
                );
                return Err(IngestError::Capacity {
                    max: self.config.max_queue_size,
                });
            }
            message.sequence = buffer.next_sequence;
            buffer.next_sequence += 1;
            if claim {
                message.status = MessageStatus::Processing;
                message.claimed_at = Some(now);
            }

            info!(
                id = %id,
                conversation_id = %message.conversation_id,
                channel = %message.channel,
                priority = %message.priority(),
                "Message ingested"
            );
            buffer.insert(message.clone());
        }

        Ok((IngestReceipt { id, warnings }, message))
    }

    /// Ingest many messages, yielding between sub-batches.
    ///
    /// Returns one result per input, in input order.
    pub async fn ingest_batch(
        &self,
        messages: Vec<NewMessage>,
    ) -> Vec<Result<IngestReceipt, IngestError>> {
        let count = messages.len();
        let batch_size = self.config.batch_size.max(1);
        let mut results = Vec::with_capacity(count);

        let mut iter = messages.into_iter().peekable();
        while iter.peek().is_some() {
            for msg in iter.by_ref().take(batch_size) {
                results.push(
                    self.ingest_message(msg.conversation_id, msg.channel, msg.content, msg.metadata)
                        .await,
                );
            }
            tokio::task::yield_now().await;
        }

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        info!(accepted, total = count, "Batch ingestion complete");
        results
    }

    /// Up to `limit` due pending messages in priority then arrival order.
    ///
    /// Does not change any state; repeated calls return the same messages.
    pub async fn get_messages_for_processing(&self, limit: usize) -> Vec<IngestedMessage> {
        let now = Utc::now();
        let buffer = self.buffer.read().await;
        buffer
            .order
            .values()
            .filter_map(|id| buffer.messages.get(id))
            .filter(|m| m.is_due(now))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Move a pending message to processing and return it.
    pub async fn claim(&self, id: Uuid) -> Result<IngestedMessage, IngestError> {
        let mut buffer = self.buffer.write().await;
        let message = buffer
            .messages
            .get_mut(&id)
            .ok_or(IngestError::NotFound { id })?;
        if message.status != MessageStatus::Pending {
            return Err(IngestError::InvalidTransition {
                id,
                state: message.status.to_string(),
                target: MessageStatus::Processing.to_string(),
            });
        }
        message.status = MessageStatus::Processing;
        message.claimed_at = Some(Utc::now());
        Ok(message.clone())
    }

    /// Select and claim up to `limit` due messages in one critical section.
    pub async fn claim_batch(&self, limit: usize) -> Vec<IngestedMessage> {
        let now = Utc::now();
        let mut buffer = self.buffer.write().await;
        let ids: Vec<Uuid> = buffer
            .order
            .values()
            .filter(|id| buffer.messages.get(*id).is_some_and(|m| m.is_due(now)))
            .take(limit)
            .copied()
            .collect();

        ids.into_iter()
            .filter_map(|id| {
                let message = buffer.messages.get_mut(&id)?;
                message.status = MessageStatus::Processing;
                message.claimed_at = Some(now);
                Some(message.clone())
            })
            .collect()
    }

    /// Snapshot of a single message.
    pub async fn get_message(&self, id: Uuid) -> Option<IngestedMessage> {
        self.buffer.read().await.messages.get(&id).cloned()
    }

    /// Mark a message as successfully processed.
    pub async fn mark_as_processed(&self, id: Uuid) -> Result<(), IngestError> {
        let mut buffer = self.buffer.write().await;
        let message = buffer
            .messages
            .get_mut(&id)
            .ok_or(IngestError::NotFound { id })?;
        if message.status.is_terminal() {
            return Err(IngestError::InvalidTransition {
                id,
                state: message.status.to_string(),
                target: MessageStatus::Completed.to_string(),
            });
        }
        message.status = MessageStatus::Completed;
        message.processed_at = Some(Utc::now());
        message.claimed_at = None;
        message.not_before = None;
        debug!(id = %id, "Message processed");
        Ok(())
    }

    /// Record a processing failure.
    ///
    /// While the retry budget lasts the message returns to pending with an
    /// exponential not-before delay; after `max_retries` failures it stays
    /// failed. Returns the resulting status.
    pub async fn mark_as_failed(
        &self,
        id: Uuid,
        error: impl Into<String>,
    ) -> Result<MessageStatus, IngestError> {
        let error = error.into();
        let mut buffer = self.buffer.write().await;
        let message = buffer
            .messages
            .get_mut(&id)
            .ok_or(IngestError::NotFound { id })?;
        if message.status.is_terminal() {
            return Err(IngestError::InvalidTransition {
                id,
                state: message.status.to_string(),
                target: MessageStatus::Failed.to_string(),
            });
        }

        Ok(self.fail(message, error))
    }

    /// Count a failure against the retry budget.
    fn fail(&self, message: &mut IngestedMessage, error: String) -> MessageStatus {
        message.retry_count += 1;
        message.claimed_at = None;

        if message.retry_count < self.config.max_retries {
            let delay = self.retry_delay(message.retry_count);
            message.status = MessageStatus::Pending;
            message.not_before = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
            info!(
                id = %message.id,
                retry = message.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Message failed, scheduled for retry"
            );
        } else {
            message.status = MessageStatus::Failed;
            message.processed_at = Some(Utc::now());
            message.not_before = None;
            warn!(
                id = %message.id,
                conversation_id = %message.conversation_id,
                retries = message.retry_count,
                error = %error,
                "Message permanently failed"
            );
        }
        message.errors.push(error);
        message.status
    }

    /// Put messages claimed longer than `max_processing` ago back on the
    /// retry path, as if their processing had failed. Returns the count.
    pub async fn requeue_stale(&self, max_processing: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_processing)
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut buffer = self.buffer.write().await;
        let mut requeued = 0;
        for message in buffer.messages.values_mut() {
            let stale = message.status == MessageStatus::Processing
                && message.claimed_at.is_none_or(|at| at <= cutoff);
            if stale {
                self.fail(message, "processing timed out".to_string());
                requeued += 1;
            }
        }
        if requeued > 0 {
            warn!(requeued, "Requeued messages stuck in processing");
        }
        requeued
    }

    /// Backoff before retry `attempt` (1-based): base × 2^(attempt−1), capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.config
            .retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.retry_max_delay)
    }

    /// Evict terminal messages older than `max_age`. Returns the count.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut buffer = self.buffer.write().await;
        let expired: Vec<Uuid> = buffer
            .messages
            .values()
            .filter(|m| m.status.is_terminal())
            .filter(|m| m.processed_at.unwrap_or(m.created_at) <= cutoff)
            .map(|m| m.id)
            .collect();
        for id in &expired {
            buffer.remove(*id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Cleaned up terminal messages");
        }
        expired.len()
    }

    /// Number of buffered messages (all statuses).
    pub async fn len(&self) -> usize {
        self.buffer.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffer.read().await.messages.is_empty()
    }

    pub async fn stats(&self) -> QueueStats {
        let buffer = self.buffer.read().await;
        let mut stats = QueueStats {
            total: buffer.messages.len(),
            capacity: self.config.max_queue_size,
            ..QueueStats::default()
        };
        for message in buffer.messages.values() {
            match message.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Completed => stats.completed += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
        }
        stats.utilization = stats.total as f64 / stats.capacity.max(1) as f64;
        stats
    }

    /// Drop everything (shutdown).
    pub async fn clear(&self) {
        let mut buffer = self.buffer.write().await;
        buffer.messages.clear();
        buffer.order.clear();
    }
}

#[async_trait]
impl HealthProbe for IngestionQueue {
    fn component(&self) -> &'static str {
        "ingestion_queue"
    }

    async fn check(&self) -> ComponentHealth {
        let stats = self.stats().await;
        let pct = stats.utilization * 100.0;
        if stats.utilization >= UNHEALTHY_UTILIZATION {
            ComponentHealth::unhealthy(self.component(), format!("queue {pct:.0}% full"))
        } else if stats.utilization >= DEGRADED_UTILIZATION {
            ComponentHealth::degraded(self.component(), format!("queue {pct:.0}% full"))
        } else {
            ComponentHealth::healthy(self.component())
        }
    }

    async fn recover(&self) -> RecoveryAction {
        let count = self.cleanup(self.config.retention).await;
        RecoveryAction::Evicted { count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthState;

    fn queue_with(config: IngestionConfig) -> Arc<IngestionQueue> {
        IngestionQueue::new(config)
    }

    fn queue() -> Arc<IngestionQueue> {
        queue_with(IngestionConfig::default())
    }

    async fn ingest_text(q: &IngestionQueue, conversation: &str, text: &str) -> Uuid {
        q.ingest_message(
            conversation,
            Channel::Chat,
            MessageContent::text(text),
            MessageMetadata::default(),
        )
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn ingest_assigns_unique_ids_and_defaults() {
        let q = queue();
        let a = ingest_text(&q, "c1", "I need help with my order").await;
        let b = ingest_text(&q, "c1", "I need help with my order").await;
        assert_ne!(a, b);

        let msg = q.get_message(a).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.priority(), Priority::Normal);
        assert!(msg.metadata.timestamp.is_some());
        assert!(msg.preprocessing.validated);
        assert!(msg.preprocessing.cleaned);
        assert!(msg.preprocessing.normalized);
        assert_eq!(msg.metadata.language.as_deref(), Some("en"));
        assert!(msg.preprocessing.language_detected);
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let q = queue();
        let err = q
            .ingest_message("c1", Channel::Chat, MessageContent::default(), MessageMetadata::default())
            .await
            .unwrap_err();
        match err {
            IngestError::Validation(issues) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].field, "content");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_and_queue_unchanged() {
        let q = queue_with(IngestionConfig {
            max_message_bytes: 16,
            ..IngestionConfig::default()
        });
        ingest_text(&q, "c1", "short").await;
        let before = q.len().await;

        let result = q
            .ingest_message(
                "c1",
                Channel::Email,
                MessageContent::text("this message is definitely longer than sixteen bytes"),
                MessageMetadata::default(),
            )
            .await;
        assert!(matches!(result, Err(IngestError::Validation(_))));
        assert_eq!(q.len().await, before);
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected() {
        let q = queue();
        let result = q
            .ingest_message(
                "c1",
                Channel::Chat,
                MessageContent::text("hello"),
                MessageMetadata::default().with_language("xx"),
            )
            .await;
        let Err(IngestError::Validation(issues)) = result else {
            panic!("expected validation error");
        };
        assert_eq!(issues[0].field, "metadata.language");
    }

    #[tokio::test]
    async fn declared_language_is_kept_and_not_detected() {
        let q = queue();
        let receipt = q
            .ingest_message(
                "c1",
                Channel::Chat,
                MessageContent::text("i need help"),
                MessageMetadata::default().with_language("fr-CA"),
            )
            .await
            .unwrap();
        let msg = q.get_message(receipt.id).await.unwrap();
        assert_eq!(msg.metadata.language.as_deref(), Some("fr"));
        assert!(!msg.preprocessing.language_detected);
    }

    #[tokio::test]
    async fn undetectable_language_is_a_warning_not_an_error() {
        let q = queue();
        let receipt = q
            .ingest_message(
                "c1",
                Channel::Chat,
                MessageContent::text("xyzzy plugh"),
                MessageMetadata::default(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.warnings.len(), 1);
        let msg = q.get_message(receipt.id).await.unwrap();
        assert_eq!(msg.metadata.language.as_deref(), Some("en"));
        assert_eq!(msg.errors.len(), 1);
        assert_eq!(msg.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn urgent_message_is_served_before_earlier_normal() {
        let q = queue();
        ingest_text(&q, "c2", "hello there, just a question").await;
        let urgent = q
            .ingest_message(
                "c1",
                Channel::Chat,
                MessageContent::text("I need help now"),
                MessageMetadata::default().with_priority(Priority::Urgent),
            )
            .await
            .unwrap()
            .id;

        let next = q.get_messages_for_processing(1).await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, urgent);
        assert_eq!(next[0].conversation_id, "c1");
    }

    #[tokio::test]
    async fn retrieval_orders_by_priority_then_arrival() {
        let q = queue();
        let low = q
            .ingest_message(
                "c",
                Channel::Sms,
                MessageContent::text("low"),
                MessageMetadata::default().with_priority(Priority::Low),
            )
            .await
            .unwrap()
            .id;
        let normal_1 = ingest_text(&q, "c", "first").await;
        let high = q
            .ingest_message(
                "c",
                Channel::Sms,
                MessageContent::text("high"),
                MessageMetadata::default().with_priority(Priority::High),
            )
            .await
            .unwrap()
            .id;
        let normal_2 = ingest_text(&q, "c", "second").await;

        let ids: Vec<Uuid> = q
            .get_messages_for_processing(10)
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![high, normal_1, normal_2, low]);
    }

    #[tokio::test]
    async fn retrieval_is_idempotent() {
        let q = queue();
        for i in 0..5 {
            ingest_text(&q, "c1", &format!("message {i}")).await;
        }
        let first: Vec<Uuid> = q.get_messages_for_processing(10).await.iter().map(|m| m.id).collect();
        let second: Vec<Uuid> = q.get_messages_for_processing(10).await.iter().map(|m| m.id).collect();
        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
        assert_eq!(q.len().await, 5);
    }

    #[tokio::test]
    async fn message_retrievable_until_terminal() {
        let q = queue();
        let id = ingest_text(&q, "c1", "hello").await;
        assert_eq!(q.get_messages_for_processing(10).await.len(), 1);

        q.mark_as_processed(id).await.unwrap();
        assert!(q.get_messages_for_processing(10).await.is_empty());
        assert_eq!(q.get_message(id).await.unwrap().status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn claim_moves_to_processing_once() {
        let q = queue();
        let id = ingest_text(&q, "c1", "hello").await;

        let claimed = q.claim(id).await.unwrap();
        assert_eq!(claimed.status, MessageStatus::Processing);
        assert!(matches!(
            q.claim(id).await,
            Err(IngestError::InvalidTransition { .. })
        ));
        assert!(q.get_messages_for_processing(10).await.is_empty());
    }

    #[tokio::test]
    async fn claim_batch_respects_limit_and_order() {
        let q = queue();
        for i in 0..4 {
            ingest_text(&q, "c1", &format!("m{i}")).await;
        }
        let claimed = q.claim_batch(3).await;
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|m| m.status == MessageStatus::Processing));
        assert_eq!(q.claim_batch(10).await.len(), 1);
        assert!(q.claim_batch(10).await.is_empty());
    }

    #[tokio::test]
    async fn failures_retry_until_budget_exhausted() {
        let q = queue_with(IngestionConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            ..IngestionConfig::default()
        });
        let id = ingest_text(&q, "c1", "hello").await;

        q.claim(id).await.unwrap();
        assert_eq!(q.mark_as_failed(id, "boom 1").await.unwrap(), MessageStatus::Pending);
        q.claim(id).await.unwrap();
        assert_eq!(q.mark_as_failed(id, "boom 2").await.unwrap(), MessageStatus::Pending);
        q.claim(id).await.unwrap();
        assert_eq!(q.mark_as_failed(id, "boom 3").await.unwrap(), MessageStatus::Failed);

        let msg = q.get_message(id).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.retry_count, 3);
        assert!(msg.errors.iter().any(|e| e == "boom 3"));

        // Permanently failed: further failures are rejected.
        assert!(q.mark_as_failed(id, "boom 4").await.is_err());
    }

    #[tokio::test]
    async fn stale_processing_messages_are_requeued() {
        let q = queue_with(IngestionConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
            ..IngestionConfig::default()
        });
        let id = ingest_text(&q, "c1", "hello").await;
        let idle = ingest_text(&q, "c1", "still pending").await;
        assert!(q.claim(id).await.unwrap().claimed_at.is_some());

        assert_eq!(q.requeue_stale(Duration::from_secs(3600)).await, 0);
        assert_eq!(q.requeue_stale(Duration::ZERO).await, 1);
        let msg = q.get_message(id).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.retry_count, 1);
        assert!(msg.claimed_at.is_none());
        assert!(msg.errors.iter().any(|e| e == "processing timed out"));
        assert_eq!(q.get_message(idle).await.unwrap().retry_count, 0);

        // A second stall exhausts the budget.
        q.claim(id).await.unwrap();
        assert_eq!(q.requeue_stale(Duration::ZERO).await, 1);
        assert_eq!(q.get_message(id).await.unwrap().status, MessageStatus::Failed);
        assert_eq!(q.stats().await.processing, 0);
    }

    #[tokio::test]
    async fn retried_message_waits_for_backoff() {
        let q = queue_with(IngestionConfig {
            retry_base_delay: Duration::from_secs(60),
            ..IngestionConfig::default()
        });
        let id = ingest_text(&q, "c1", "hello").await;
        q.mark_as_failed(id, "transient").await.unwrap();

        let msg = q.get_message(id).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.not_before.is_some());
        assert!(q.get_messages_for_processing(10).await.is_empty());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let q = IngestionQueue {
            config: IngestionConfig {
                retry_base_delay: Duration::from_millis(100),
                retry_max_delay: Duration::from_millis(500),
                ..IngestionConfig::default()
            },
            buffer: RwLock::new(Buffer::default()),
        };
        assert_eq!(q.retry_delay(1), Duration::from_millis(100));
        assert_eq!(q.retry_delay(2), Duration::from_millis(200));
        assert_eq!(q.retry_delay(3), Duration::from_millis(400));
        assert_eq!(q.retry_delay(4), Duration::from_millis(500));
        assert_eq!(q.retry_delay(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn full_queue_evicts_terminal_entries() {
        let q = queue_with(IngestionConfig {
            max_queue_size: 2,
            ..IngestionConfig::default()
        });
        let done = ingest_text(&q, "c1", "one").await;
        ingest_text(&q, "c1", "two").await;
        q.mark_as_processed(done).await.unwrap();

        let third = ingest_text(&q, "c1", "three").await;
        assert_eq!(q.len().await, 2);
        assert!(q.get_message(done).await.is_none());
        assert!(q.get_message(third).await.is_some());
    }

    #[tokio::test]
    async fn full_queue_without_terminal_entries_rejects() {
        let q = queue_with(IngestionConfig {
            max_queue_size: 2,
            ..IngestionConfig::default()
        });
        ingest_text(&q, "c1", "one").await;
        ingest_text(&q, "c1", "two").await;

        let result = q
            .ingest_message("c1", Channel::Chat, MessageContent::text("three"), MessageMetadata::default())
            .await;
        assert!(matches!(result, Err(IngestError::Capacity { max: 2 })));
        assert_eq!(q.len().await, 2);
    }

    #[tokio::test]
    async fn cleanup_only_touches_old_terminal_messages() {
        let q = queue();
        let done = ingest_text(&q, "c1", "done").await;
        let pending = ingest_text(&q, "c1", "pending").await;
        let processing = ingest_text(&q, "c1", "processing").await;
        q.mark_as_processed(done).await.unwrap();
        q.claim(processing).await.unwrap();

        assert_eq!(q.cleanup(Duration::from_secs(3600)).await, 0);
        assert_eq!(q.cleanup(Duration::ZERO).await, 1);
        assert!(q.get_message(done).await.is_none());
        assert!(q.get_message(pending).await.is_some());
        assert!(q.get_message(processing).await.is_some());
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let q = queue_with(IngestionConfig {
            batch_size: 2,
            ..IngestionConfig::default()
        });
        let inputs = vec![
            NewMessage {
                conversation_id: "c1".into(),
                channel: Channel::Chat,
                content: MessageContent::text("first"),
                metadata: MessageMetadata::default(),
            },
            NewMessage {
                conversation_id: "c1".into(),
                channel: Channel::Chat,
                content: MessageContent::default(),
                metadata: MessageMetadata::default(),
            },
            NewMessage {
                conversation_id: "c2".into(),
                channel: Channel::Voice,
                content: MessageContent {
                    audio: Some(vec![0; 32]),
                    ..MessageContent::default()
                },
                metadata: MessageMetadata::default(),
            },
        ];
        let results = q.ingest_batch(inputs).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert_eq!(q.len().await, 2);
    }

    #[tokio::test]
    async fn ingest_and_claim_is_invisible_to_drains() {
        let q = queue();
        let (receipt, message) = q
            .ingest_and_claim(
                "c1",
                Channel::Chat,
                MessageContent::text("claimed on arrival"),
                MessageMetadata::default(),
            )
            .await
            .unwrap();
        assert_eq!(message.id, receipt.id);
        assert_eq!(message.status, MessageStatus::Processing);
        assert!(q.get_messages_for_processing(10).await.is_empty());
        assert!(q.claim_batch(10).await.is_empty());
        q.mark_as_processed(receipt.id).await.unwrap();
    }

    #[tokio::test]
    async fn health_tracks_utilization() {
        let q = queue_with(IngestionConfig {
            max_queue_size: 10,
            ..IngestionConfig::default()
        });
        assert_eq!(q.check().await.state, HealthState::Healthy);
        for i in 0..8 {
            ingest_text(&q, "c1", &format!("m{i}")).await;
        }
        assert_eq!(q.check().await.state, HealthState::Degraded);
        for i in 0..2 {
            ingest_text(&q, "c1", &format!("n{i}")).await;
        }
        assert_eq!(q.check().await.state, HealthState::Unhealthy);
    }
}
