//! Analysis request/response types and conversation-level insights.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ingestion::types::{IngestedMessage, ParticipantRole};

// ── Emotion ─────────────────────────────────────────────────────────

/// Overall sentiment label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    /// Signed score used for trend computation.
    pub fn score(&self) -> i8 {
        match self {
            Self::Positive => 1,
            Self::Neutral => 0,
            Self::Negative => -1,
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Neutral => write!(f, "neutral"),
            Self::Negative => write!(f, "negative"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionResult {
    pub sentiment: Sentiment,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_emotion: Option<String>,
    /// Only present when the request asked for intensity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionOptions {
    pub min_confidence: f32,
    pub include_intensity: bool,
}

impl Default for EmotionOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            include_intensity: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionRequest {
    pub text: String,
    pub conversation_id: String,
    pub message_id: Uuid,
    pub language: String,
    /// Recent conversation text, oldest first.
    pub context_window: Vec<String>,
    pub options: EmotionOptions,
}

// ── Intent ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        };
        write!(f, "{s}")
    }
}

/// Intent labels that mark a conversation as wrapping up.
pub const RESOLUTION_INTENTS: &[&str] = &["resolution", "farewell", "gratitude"];

/// Intent label asking for a supervisor or manager.
pub const ESCALATION_INTENT: &str = "escalation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub primary_intent: String,
    pub urgency: Urgency,
    pub complexity: Complexity,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentOptions {
    pub min_confidence: f32,
    pub include_entities: bool,
    pub include_context_keywords: bool,
}

impl Default for IntentOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            include_entities: true,
            include_context_keywords: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRequest {
    pub text: String,
    pub conversation_id: String,
    pub message_id: Uuid,
    pub language: String,
    pub context_window: Vec<String>,
    pub options: IntentOptions,
}

// ── Context ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub language: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
}

/// A bounded window of one conversation, oldest message first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub messages: Vec<IngestedMessage>,
    pub participants: Vec<Participant>,
    pub metadata: ContextMetadata,
}

impl ConversationContext {
    /// Build a context from messages, keeping the newest `max_messages`.
    ///
    /// `message_count` reflects every message seen, not just the window.
    pub fn from_messages(
        conversation_id: impl Into<String>,
        mut messages: Vec<IngestedMessage>,
        max_messages: usize,
    ) -> Self {
        messages.sort_by_key(|m| (m.timestamp(), m.sequence));
        let message_count = messages.len();
        if messages.len() > max_messages {
            messages.drain(..messages.len() - max_messages);
        }

        let mut participants: Vec<Participant> = Vec::new();
        for message in &messages {
            let id = message
                .metadata
                .sender
                .clone()
                .or_else(|| message.metadata.user_id.clone())
                .unwrap_or_else(|| message.metadata.sender_role.to_string());
            if !participants.iter().any(|p| p.id == id) {
                participants.push(Participant {
                    id,
                    role: message.metadata.sender_role,
                });
            }
        }

        let now = Utc::now();
        let started_at = messages.first().map_or(now, IngestedMessage::timestamp);
        let last_activity = messages.last().map_or(now, IngestedMessage::timestamp);
        let tenant_id = messages.iter().rev().find_map(|m| m.metadata.tenant_id.clone());
        let language = messages
            .iter()
            .rev()
            .find_map(|m| m.metadata.language.clone())
            .unwrap_or_else(|| "en".to_string());

        Self {
            conversation_id: conversation_id.into(),
            messages,
            participants,
            metadata: ContextMetadata {
                tenant_id,
                language,
                started_at,
                last_activity,
                message_count,
            },
        }
    }

    pub fn latest(&self) -> Option<&IngestedMessage> {
        self.messages.last()
    }

    /// Text of the newest `n` messages, oldest first, skipping empty ones.
    pub fn recent_text(&self, n: usize) -> Vec<String> {
        let texts: Vec<String> = self
            .messages
            .iter()
            .map(|m| m.normalized_text.clone().unwrap_or_else(|| m.text().to_string()))
            .filter(|t| !t.is_empty())
            .collect();
        let skip = texts.len().saturating_sub(n);
        texts.into_iter().skip(skip).collect()
    }

    /// Span between first and last message.
    pub fn duration(&self) -> chrono::Duration {
        self.metadata.last_activity - self.metadata.started_at
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// Output of one analysis pass over a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub conversation_id: String,
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<EmotionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentResult>,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub cached: bool,
    /// Superseded or externally cancelled; the result should be discarded.
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ProcessingResult {
    pub(crate) fn failed(message: &IngestedMessage, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id,
            emotion: None,
            intent: None,
            processing_time_ms: elapsed_ms,
            timestamp: Utc::now(),
            cached: false,
            cancelled: false,
            errors: vec![error.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Smooth,
    Escalating,
    Resolving,
    Stuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentTrend {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationInsights {
    pub flow: FlowState,
    pub sentiment_trend: SentimentTrend,
    pub urgency: Urgency,
    pub complexity: Complexity,
    /// Messages per minute across the context window.
    pub message_rate: f64,
}

/// Conversation-scoped analysis: latest result plus insights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationAnalysis {
    pub conversation_id: String,
    pub result: ProcessingResult,
    pub insights: ConversationInsights,
    pub recommendations: Vec<String>,
}

/// Per-call processing options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessOptions {
    pub use_cache: bool,
    /// Overrides the configured confidence floor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f32>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            min_confidence: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::types::{
        Channel, MessageContent, MessageMetadata, MessageStatus, PreprocessingState,
    };

    fn message(conversation: &str, text: &str, sender: &str, minutes_ago: i64, seq: u64) -> IngestedMessage {
        let ts = Utc::now() - chrono::Duration::minutes(minutes_ago);
        IngestedMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation.into(),
            channel: Channel::Chat,
            content: MessageContent::text(text),
            normalized_text: Some(text.to_lowercase()),
            metadata: MessageMetadata {
                sender: Some(sender.into()),
                timestamp: Some(ts),
                ..MessageMetadata::default()
            },
            preprocessing: PreprocessingState::default(),
            status: MessageStatus::Pending,
            errors: Vec::new(),
            retry_count: 0,
            not_before: None,
            sequence: seq,
            created_at: ts,
            claimed_at: None,
            processed_at: None,
        }
    }

    #[test]
    fn context_window_keeps_newest_and_counts_all() {
        let msgs = vec![
            message("c1", "Third", "alice", 1, 2),
            message("c1", "First", "alice", 10, 0),
            message("c1", "Second", "bob", 5, 1),
        ];
        let ctx = ConversationContext::from_messages("c1", msgs, 2);
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.metadata.message_count, 3);
        assert_eq!(ctx.latest().unwrap().text(), "Third");
        assert_eq!(ctx.recent_text(5), vec!["second", "third"]);
        assert_eq!(ctx.participants.len(), 2);
        assert!(ctx.duration() >= chrono::Duration::minutes(3));
    }

    #[test]
    fn empty_context_has_zero_duration() {
        let ctx = ConversationContext::from_messages("c1", Vec::new(), 10);
        assert!(ctx.latest().is_none());
        assert_eq!(ctx.duration(), chrono::Duration::zero());
    }

    #[test]
    fn sentiment_scores() {
        assert!(Sentiment::Positive.score() > Sentiment::Neutral.score());
        assert!(Sentiment::Neutral.score() > Sentiment::Negative.score());
    }
}
