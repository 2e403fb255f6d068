//! Outcome monitoring: success/failure recording and rolled-up metrics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::health::{ComponentHealth, HealthProbe, RecoveryAction};

/// Minimum samples before the error rate affects health.
const MIN_SAMPLES_FOR_HEALTH: u64 = 10;
const DEGRADED_ERROR_RATE: f64 = 0.2;
const UNHEALTHY_ERROR_RATE: f64 = 0.5;

/// One processed message, as seen by the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingEvent {
    pub tenant_id: String,
    pub conversation_id: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_confidence: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TenantMetrics {
    pub processed: u64,
    pub failures: u64,
    pub average_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorMetrics {
    pub total_processed: u64,
    pub successes: u64,
    pub failures: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub average_confidence: Option<f64>,
    pub tenants: BTreeMap<String, TenantMetrics>,
    pub since: DateTime<Utc>,
}

/// Sink for processing outcomes. Also a health probe.
#[async_trait]
pub trait MonitoringSink: HealthProbe {
    async fn record_success(&self, event: ProcessingEvent);

    async fn record_failure(&self, event: ProcessingEvent, error: &str);

    async fn metrics(&self) -> MonitorMetrics;

    async fn reset(&self);
}

struct Totals {
    successes: u64,
    failures: u64,
    latency_sum_ms: u128,
    confidence_sum: f64,
    confidence_samples: u64,
    tenants: BTreeMap<String, TenantMetrics>,
    since: DateTime<Utc>,
}

impl Default for Totals {
    fn default() -> Self {
        Self {
            successes: 0,
            failures: 0,
            latency_sum_ms: 0,
            confidence_sum: 0.0,
            confidence_samples: 0,
            tenants: BTreeMap::new(),
            since: Utc::now(),
        }
    }
}

impl Totals {
    fn record(&mut self, event: &ProcessingEvent, failed: bool) {
        if failed {
            self.failures += 1;
        } else {
            self.successes += 1;
        }
        self.latency_sum_ms += u128::from(event.latency_ms);
        for confidence in [event.emotion_confidence, event.intent_confidence]
            .into_iter()
            .flatten()
        {
            self.confidence_sum += f64::from(confidence);
            self.confidence_samples += 1;
        }

        let tenant = self.tenants.entry(event.tenant_id.clone()).or_default();
        tenant.processed += 1;
        if failed {
            tenant.failures += 1;
        }
        let n = tenant.processed as f64;
        tenant.average_latency_ms += (event.latency_ms as f64 - tenant.average_latency_ms) / n;
    }

    fn total(&self) -> u64 {
        self.successes + self.failures
    }

    fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.failures as f64 / total as f64,
        }
    }
}

/// Process-local monitoring sink.
#[derive(Default)]
pub struct InMemoryMonitor {
    totals: RwLock<Totals>,
}

impl InMemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MonitoringSink for InMemoryMonitor {
    async fn record_success(&self, event: ProcessingEvent) {
        debug!(
            tenant_id = %event.tenant_id,
            conversation_id = %event.conversation_id,
            latency_ms = event.latency_ms,
            "Recorded success"
        );
        self.totals.write().await.record(&event, false);
    }

    async fn record_failure(&self, event: ProcessingEvent, error: &str) {
        debug!(
            tenant_id = %event.tenant_id,
            conversation_id = %event.conversation_id,
            error = %error,
            "Recorded failure"
        );
        self.totals.write().await.record(&event, true);
    }

    async fn metrics(&self) -> MonitorMetrics {
        let totals = self.totals.read().await;
        let total = totals.total();
        MonitorMetrics {
            total_processed: total,
            successes: totals.successes,
            failures: totals.failures,
            error_rate: totals.error_rate(),
            average_latency_ms: if total == 0 {
                0.0
            } else {
                totals.latency_sum_ms as f64 / total as f64
            },
            average_confidence: (totals.confidence_samples > 0)
                .then(|| totals.confidence_sum / totals.confidence_samples as f64),
            tenants: totals.tenants.clone(),
            since: totals.since,
        }
    }

    async fn reset(&self) {
        *self.totals.write().await = Totals::default();
        info!("Monitoring counters reset");
    }
}

#[async_trait]
impl HealthProbe for InMemoryMonitor {
    fn component(&self) -> &'static str {
        "monitoring"
    }

    async fn check(&self) -> ComponentHealth {
        let totals = self.totals.read().await;
        if totals.total() < MIN_SAMPLES_FOR_HEALTH {
            return ComponentHealth::healthy(self.component());
        }
        let rate = totals.error_rate();
        let reason = format!("error rate {:.0}%", rate * 100.0);
        if rate >= UNHEALTHY_ERROR_RATE {
            ComponentHealth::unhealthy(self.component(), reason)
        } else if rate >= DEGRADED_ERROR_RATE {
            ComponentHealth::degraded(self.component(), reason)
        } else {
            ComponentHealth::healthy(self.component())
        }
    }

    async fn recover(&self) -> RecoveryAction {
        self.reset().await;
        RecoveryAction::Reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthState;

    fn event(tenant: &str, latency_ms: u64) -> ProcessingEvent {
        ProcessingEvent {
            tenant_id: tenant.into(),
            conversation_id: "c1".into(),
            latency_ms,
            emotion_confidence: Some(0.8),
            intent_confidence: Some(0.6),
        }
    }

    #[tokio::test]
    async fn metrics_roll_up_outcomes() {
        let monitor = InMemoryMonitor::new();
        monitor.record_success(event("t1", 10)).await;
        monitor.record_success(event("t1", 30)).await;
        monitor.record_failure(event("t2", 20), "boom").await;

        let metrics = monitor.metrics().await;
        assert_eq!(metrics.total_processed, 3);
        assert_eq!(metrics.failures, 1);
        assert!((metrics.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((metrics.average_latency_ms - 20.0).abs() < 1e-9);
        assert!((metrics.average_confidence.unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(metrics.tenants["t1"].processed, 2);
        assert_eq!(metrics.tenants["t2"].failures, 1);
    }

    #[tokio::test]
    async fn health_follows_error_rate_and_reset_recovers() {
        let monitor = InMemoryMonitor::new();
        for _ in 0..10 {
            monitor.record_failure(event("t1", 5), "boom").await;
        }
        assert_eq!(monitor.check().await.state, HealthState::Unhealthy);

        assert_eq!(monitor.recover().await, RecoveryAction::Reset);
        assert_eq!(monitor.check().await.state, HealthState::Healthy);
        assert_eq!(monitor.metrics().await.total_processed, 0);
    }
}
