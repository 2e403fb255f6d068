//! Per-tenant circuit breaker.
//!
//! closed → open after `failure_threshold` consecutive failures.
//! open → half-open only when a request arrives after the cool-down; there
//! is no timer, so an idle tenant's breaker stays open until traffic
//! returns. Half-open admits a single trial: success closes, failure
//! reopens. Admission and its transition happen under one lock.
//!
//! The trial slot is owned by a [`TrialGuard`]. A trial that is dropped or
//! unwinds before an outcome is recorded hands the slot back on drop.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Result of asking the breaker for permission.
#[derive(Debug)]
pub enum Admission {
    /// Normal traffic.
    Allowed,
    /// The single half-open trial.
    Trial(TrialGuard),
    /// Breaker open (or trial already in flight): use the fallback.
    Rejected,
}

impl Admission {
    pub fn is_trial(&self) -> bool {
        matches!(self, Self::Trial(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

#[derive(Debug, Default)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Id of the outstanding half-open trial.
    trial: Option<u64>,
}

type BreakerMap = Arc<Mutex<HashMap<String, Breaker>>>;

/// Critical sections never await, so a std mutex is enough and lets
/// [`TrialGuard`] release from `Drop`.
fn lock(breakers: &BreakerMap) -> MutexGuard<'_, HashMap<String, Breaker>> {
    breakers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outstanding half-open trial for one tenant.
#[derive(Debug)]
#[must_use = "dropping the guard releases the trial slot"]
pub struct TrialGuard {
    breakers: BreakerMap,
    tenant_id: String,
    trial: u64,
}

impl TrialGuard {
    /// Give the slot back if this trial still owns it. Idempotent.
    pub fn release(&mut self) {
        let mut breakers = lock(&self.breakers);
        if let Some(breaker) = breakers.get_mut(&self.tenant_id) {
            if breaker.trial == Some(self.trial) {
                breaker.trial = None;
                debug!(tenant_id = %self.tenant_id, "Half-open trial released");
            }
        }
    }
}

impl Drop for TrialGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct CircuitBreakers {
    failure_threshold: u32,
    cooldown: Duration,
    breakers: BreakerMap,
    next_trial: AtomicU64,
}

impl CircuitBreakers {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            breakers: Arc::new(Mutex::new(HashMap::new())),
            next_trial: AtomicU64::new(0),
        }
    }

    /// Decide whether a request for `tenant_id` may proceed.
    pub fn admit(&self, tenant_id: &str) -> Admission {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(tenant_id.to_string()).or_default();
        match breaker.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled = breaker
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.cooldown);
                if !cooled {
                    return Admission::Rejected;
                }
                breaker.state = CircuitState::HalfOpen;
                info!(tenant_id = %tenant_id, "Circuit half-open, admitting trial request");
                self.start_trial(tenant_id, breaker)
            }
            CircuitState::HalfOpen if breaker.trial.is_some() => Admission::Rejected,
            CircuitState::HalfOpen => self.start_trial(tenant_id, breaker),
        }
    }

    fn start_trial(&self, tenant_id: &str, breaker: &mut Breaker) -> Admission {
        let trial = self.next_trial.fetch_add(1, Ordering::Relaxed);
        breaker.trial = Some(trial);
        Admission::Trial(TrialGuard {
            breakers: Arc::clone(&self.breakers),
            tenant_id: tenant_id.to_string(),
            trial,
        })
    }

    pub fn record_success(&self, tenant_id: &str) {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(tenant_id.to_string()).or_default();
        if breaker.state != CircuitState::Closed {
            info!(tenant_id = %tenant_id, "Circuit closed");
        }
        *breaker = Breaker::default();
    }

    pub fn record_failure(&self, tenant_id: &str) {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(tenant_id.to_string()).or_default();
        breaker.consecutive_failures += 1;
        match breaker.state {
            CircuitState::Closed if breaker.consecutive_failures >= self.failure_threshold => {
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
                warn!(
                    tenant_id = %tenant_id,
                    failures = breaker.consecutive_failures,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.trial = None;
                warn!(tenant_id = %tenant_id, "Trial request failed, circuit reopened");
            }
            _ => {}
        }
    }

    pub fn state(&self, tenant_id: &str) -> CircuitState {
        lock(&self.breakers)
            .get(tenant_id)
            .map_or(CircuitState::Closed, |b| b.state)
    }

    /// Tenants whose breaker is not closed.
    pub fn tripped(&self) -> Vec<(String, CircuitState)> {
        let breakers = lock(&self.breakers);
        let mut tripped: Vec<(String, CircuitState)> = breakers
            .iter()
            .filter(|(_, b)| b.state != CircuitState::Closed)
            .map(|(id, b)| (id.clone(), b.state))
            .collect();
        tripped.sort();
        tripped
    }

    pub fn remove(&self, tenant_id: &str) {
        lock(&self.breakers).remove(tenant_id);
    }

    pub fn clear(&self) {
        lock(&self.breakers).clear();
    }
}
