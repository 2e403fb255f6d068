//! Message types owned by the ingestion queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Channel ─────────────────────────────────────────────────────────

/// Transport a message arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Chat,
    Voice,
    Email,
    Social,
    Sms,
    Webhook,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Chat => "chat",
            Self::Voice => "voice",
            Self::Email => "email",
            Self::Social => "social",
            Self::Sms => "sms",
            Self::Webhook => "webhook",
        };
        write!(f, "{s}")
    }
}

// ── Priority ────────────────────────────────────────────────────────

/// Priority tier. Ordering is `Low < Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

// ── Content & metadata ──────────────────────────────────────────────

/// Message payload. At least one part must be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Raw audio bytes (voice channel).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<u8>>,
    /// Attachment references (URLs or storage keys).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl MessageContent {
    /// Text-only content.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// True when there is no text, audio, or attachment.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty())
            && self.audio.as_ref().is_none_or(|a| a.is_empty())
            && self.attachments.is_empty()
    }

    /// Approximate size in bytes used for the size ceiling.
    pub fn size_bytes(&self) -> usize {
        self.text.as_ref().map_or(0, String::len)
            + self.audio.as_ref().map_or(0, Vec::len)
            + self.attachments.iter().map(String::len).sum::<usize>()
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    #[default]
    Customer,
    Agent,
    System,
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Customer => write!(f, "customer"),
            Self::Agent => write!(f, "agent"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Caller-supplied metadata. Missing timestamp and priority are filled in on ingest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub sender_role: ParticipantRole,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Declared (or detected) language code.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl MessageMetadata {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────

/// Which preprocessing steps completed for a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessingState {
    pub cleaned: bool,
    pub normalized: bool,
    pub language_detected: bool,
    pub validated: bool,
}

/// Lifecycle status of a buffered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ── Ingested message ────────────────────────────────────────────────

/// A unit of customer communication held by the ingestion queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedMessage {
    pub id: Uuid,
    pub conversation_id: String,
    pub channel: Channel,
    pub content: MessageContent,
    /// Case-folded, NFC-normalized text used for matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_text: Option<String>,
    pub metadata: MessageMetadata,
    pub preprocessing: PreprocessingState,
    pub status: MessageStatus,
    pub errors: Vec<String>,
    pub retry_count: u32,
    /// Retried messages are not handed out before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Monotonic arrival sequence used to break priority ties.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    /// When the message last moved to processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl IngestedMessage {
    /// A fresh pending message. The queue assigns the sequence on insert.
    pub fn new(
        conversation_id: impl Into<String>,
        channel: Channel,
        content: MessageContent,
        metadata: MessageMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            channel,
            content,
            normalized_text: None,
            metadata,
            preprocessing: PreprocessingState::default(),
            status: MessageStatus::Pending,
            errors: Vec::new(),
            retry_count: 0,
            not_before: None,
            sequence: 0,
            created_at: now,
            claimed_at: None,
            processed_at: None,
        }
    }

    /// Effective priority (normal when none was given).
    pub fn priority(&self) -> Priority {
        self.metadata.priority.unwrap_or_default()
    }

    /// Effective timestamp (falls back to creation time).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.metadata.timestamp.unwrap_or(self.created_at)
    }

    /// Message text, empty for audio/attachment-only messages.
    pub fn text(&self) -> &str {
        self.content.text.as_deref().unwrap_or("")
    }

    /// True when the message may be handed out at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Pending && self.not_before.is_none_or(|t| t <= now)
    }
}

/// One entry for `IngestionQueue::ingest_batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: String,
    pub channel: Channel,
    pub content: MessageContent,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

/// Successful ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub id: Uuid,
    /// Non-fatal problems (preprocessing errors, undetected language).
    pub warnings: Vec<String>,
}
