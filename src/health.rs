//! Component health model shared by every service.
//!
//! Each component implements [`HealthProbe`]; the orchestrator polls the
//! probes, folds them into a system status, and calls `recover()` on the
//! unhealthy ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of one component. Ordering is `Healthy < Degraded < Unhealthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of a single component probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub state: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: HealthState::Healthy,
            reason: None,
            checked_at: Utc::now(),
        }
    }

    pub fn degraded(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: HealthState::Degraded,
            reason: Some(reason.into()),
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: HealthState::Unhealthy,
            reason: Some(reason.into()),
            checked_at: Utc::now(),
        }
    }
}

/// What a recovery attempt did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Cached or buffered state was evicted.
    Evicted { count: usize },
    /// Counters were reset.
    Reset,
    /// The component cannot heal itself.
    ManualInterventionRequired { reason: String },
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Evicted { count } => write!(f, "evicted {count} entries"),
            Self::Reset => write!(f, "reset"),
            Self::ManualInterventionRequired { reason } => {
                write!(f, "manual intervention required: {reason}")
            }
        }
    }
}

/// A component the orchestrator can probe and try to heal.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Stable component name used in reports and logs.
    fn component(&self) -> &'static str;

    async fn check(&self) -> ComponentHealth;

    async fn recover(&self) -> RecoveryAction;
}

/// Fold component states: any unhealthy ⇒ unhealthy, any degraded ⇒ degraded.
pub fn overall_state(components: &[ComponentHealth]) -> HealthState {
    components
        .iter()
        .map(|c| c.state)
        .max()
        .unwrap_or(HealthState::Healthy)
}
