//! Per-conversation notification fan-out.
//!
//! Each conversation with subscribers gets its own broadcast channel. The
//! transport (WebSocket, SSE, push) lives outside the crate and consumes
//! these receivers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::analysis::types::{ConversationAnalysis, ProcessingResult};
use crate::health::{ComponentHealth, HealthProbe, RecoveryAction};

/// Per-conversation channel capacity.
const CONVERSATION_CHANNEL_CAPACITY: usize = 64;

/// Channel count above which the hub reports degraded.
const DEGRADED_CHANNEL_COUNT: usize = 50_000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    MessageProcessed {
        conversation_id: String,
        message_id: Uuid,
        result: Box<ProcessingResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        analysis: Option<Box<ConversationAnalysis>>,
        timestamp: DateTime<Utc>,
    },
    MessageFailed {
        conversation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
        errors: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ConversationEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::MessageProcessed {
                conversation_id, ..
            }
            | Self::MessageFailed {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotificationStats {
    pub conversations: usize,
    pub active_connections: usize,
    pub published: u64,
    pub undelivered: u64,
}

pub struct NotificationHub {
    channels: RwLock<HashMap<String, broadcast::Sender<ConversationEvent>>>,
    published: AtomicU64,
    undelivered: AtomicU64,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
        }
    }

    /// Subscribe to one conversation's events.
    pub async fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<ConversationEvent> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(CONVERSATION_CHANNEL_CAPACITY).0);
        debug!(conversation_id = %conversation_id, "Conversation subscriber added");
        tx.subscribe()
    }

    /// Same as `subscribe`, as a `Stream` (lagged items surface as errors).
    pub async fn subscribe_stream(&self, conversation_id: &str) -> BroadcastStream<ConversationEvent> {
        BroadcastStream::new(self.subscribe(conversation_id).await)
    }

    /// Publish to a conversation's subscribers. Returns the receiver count.
    pub async fn publish(&self, event: ConversationEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let channels = self.channels.read().await;
        let delivered = channels
            .get(event.conversation_id())
            .and_then(|tx| tx.send(event).ok())
            .unwrap_or(0);
        if delivered == 0 {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Drop conversation channels that have no receivers left.
    pub async fn cleanup_stale(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let removed = before - channels.len();
        if removed > 0 {
            info!(removed, "Removed stale notification channels");
        }
        removed
    }

    pub async fn stats(&self) -> NotificationStats {
        let channels = self.channels.read().await;
        NotificationStats {
            conversations: channels.len(),
            active_connections: channels.values().map(|tx| tx.receiver_count()).sum(),
            published: self.published.load(Ordering::Relaxed),
            undelivered: self.undelivered.load(Ordering::Relaxed),
        }
    }

    pub async fn clear(&self) {
        self.channels.write().await.clear();
    }
}

#[async_trait]
impl HealthProbe for NotificationHub {
    fn component(&self) -> &'static str {
        "notifications"
    }

    async fn check(&self) -> ComponentHealth {
        let channels = self.channels.read().await.len();
        if channels > DEGRADED_CHANNEL_COUNT {
            ComponentHealth::degraded(
                self.component(),
                format!("{channels} conversation channels open"),
            )
        } else {
            ComponentHealth::healthy(self.component())
        }
    }

    async fn recover(&self) -> RecoveryAction {
        RecoveryAction::Evicted {
            count: self.cleanup_stale().await,
        }
    }
}
