// ABOUTME: Per-source health tracking for the polling loop
// ABOUTME: Turns runs of failed cycles into a degraded liveness signal

use cachenotify_core::LivenessConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    /// Cycles are committing normally
    Healthy,
    /// Degraded source has started committing again
    Recovering,
    /// Too many consecutive failed cycles
    Degraded,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "Healthy"),
            HealthState::Recovering => write!(f, "Recovering"),
            HealthState::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Owned by a single source task, so no interior locking.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    state: HealthState,
    failure_threshold: u32,
    success_threshold: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl HealthMonitor {
    pub fn new(config: &LivenessConfig) -> Self {
        Self {
            state: HealthState::Healthy,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.state == HealthState::Degraded
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;

        match self.state {
            HealthState::Degraded => {
                info!("Health: Degraded -> Recovering");
                self.state = HealthState::Recovering;
                self.check_recovered();
            }
            HealthState::Recovering => self.check_recovered(),
            HealthState::Healthy => debug!("cycle committed"),
        }
    }

    fn check_recovered(&mut self) {
        if self.consecutive_successes >= self.success_threshold {
            info!("Health: Recovering -> Healthy");
            self.state = HealthState::Healthy;
            self.consecutive_successes = 0;
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;

        match self.state {
            HealthState::Healthy => {
                if self.consecutive_failures >= self.failure_threshold {
                    warn!(
                        "Health: Healthy -> Degraded ({} consecutive failures)",
                        self.consecutive_failures
                    );
                    self.state = HealthState::Degraded;
                }
            }
            HealthState::Recovering => {
                warn!("Health: Recovering -> Degraded");
                self.state = HealthState::Degraded;
            }
            HealthState::Degraded => debug!("still degraded, failure recorded"),
        }
    }
}
