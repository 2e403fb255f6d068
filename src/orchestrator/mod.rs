//! Pipeline orchestration: admission, resiliency, fan-out, and health.

pub mod background;
pub mod circuit;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod rate_limit;
pub mod webhook;

pub use circuit::CircuitState;
pub use monitor::{InMemoryMonitor, MonitorMetrics, MonitoringSink, ProcessingEvent};
pub use notify::{ConversationEvent, NotificationHub, NotificationStats};
pub use pipeline::{
    PipelineOrchestrator, ProcessOutcome, ProcessRequest, SystemHealth, TenantPolicy,
};
pub use webhook::{HttpWebhookDelivery, WebhookDelivery, WebhookPayload};
