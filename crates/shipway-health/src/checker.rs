//! Probe result debouncing.
//!
//! `HealthTracker` turns a stream of raw probe results into a
//! `HealthStatus` using consecutive-success and consecutive-failure
//! thresholds, with a start-period grace window.

use std::time::Duration;

use tracing::{debug, warn};

use shipway_core::HealthPolicy;
use shipway_state::HealthStatus;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx (e.g. 503 on a dependency failure).
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_success(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Successes needed to enter Healthy.
    healthy_threshold: u32,
    /// Failures needed to enter Unhealthy.
    unhealthy_threshold: u32,
    /// Failures observed before this much time has passed since instance
    /// start are not counted.
    start_period: Duration,
}

impl HealthTracker {
    pub fn new(policy: &HealthPolicy) -> Self {
        Self::with_thresholds(
            policy.healthy_threshold,
            policy.unhealthy_threshold,
            policy.start_period,
        )
    }

    pub fn with_thresholds(
        healthy_threshold: u32,
        unhealthy_threshold: u32,
        start_period: Duration,
    ) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
            start_period,
        }
    }

    /// Record a probe result taken outside the start period.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        self.record_at(result, self.start_period)
    }

    /// Record a probe result taken `since_start` after the instance started.
    pub fn record_at(&mut self, result: ProbeResult, since_start: Duration) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;

                if self.consecutive_successes >= self.healthy_threshold
                    && self.status != HealthStatus::Healthy
                {
                    debug!(
                        successes = self.consecutive_successes,
                        threshold = self.healthy_threshold,
                        "instance became healthy"
                    );
                    self.status = HealthStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                if since_start < self.start_period {
                    debug!(?result, ?since_start, "probe failure inside start period ignored");
                    return self.status;
                }

                self.consecutive_successes = 0;
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.unhealthy_threshold
                    && self.status != HealthStatus::Unhealthy
                {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        "instance marked unhealthy"
                    );
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }
}
