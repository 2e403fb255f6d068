//! Ingestion: validation, preprocessing, and the priority buffer.

pub mod preprocess;
pub mod queue;
pub mod types;

pub use queue::{IngestionQueue, QueueStats};
pub use types::{
    Channel, IngestReceipt, IngestedMessage, MessageContent, MessageMetadata, MessageStatus,
    NewMessage, ParticipantRole, Priority,
};
