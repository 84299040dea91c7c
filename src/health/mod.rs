/// Health checking for database backends
pub mod tcp;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::HealthConfig;
use crate::core::{Backend, BackendSet, BackendState};
use crate::error::PasarelaError;

pub use tcp::TcpProbe;

/// Health status of a backend
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy backend
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Liveness probe supplied by the network layer
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe one backend by its configured address
    async fn probe(&self, address: &str) -> HealthStatus;
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub marked_up: usize,
    pub marked_down: usize,
    /// Backends held in maintenance
    pub held: usize,
    /// Transitions lost to a concurrent `modify`
    pub conflicts: usize,
}

/// State a backend should move to after a probe, if any.
///
/// Maintenance is operator-held and deleted backends are retired, so neither moves.
pub fn next_state(current: BackendState, healthy: bool) -> Option<BackendState> {
    match (current, healthy) {
        (BackendState::Maintaining | BackendState::Deleted, _) => None,
        (BackendState::Unknown | BackendState::Down, true) => Some(BackendState::Up),
        (BackendState::Up | BackendState::Unknown, false) => Some(BackendState::Down),
        _ => None,
    }
}

/// Periodic health sweep over a backend set
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    check_interval: Duration,
    check_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        check_interval: Duration,
        check_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            check_interval,
            check_timeout,
        }
    }

    /// TCP probing with the configured interval and timeout
    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(
            Arc::new(TcpProbe::new()),
            Duration::from_secs(config.interval_sec),
            Duration::from_secs(config.timeout_sec),
        )
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn check_timeout(&self) -> Duration {
        self.check_timeout
    }

    async fn probe_backend(&self, backend: &Backend) -> HealthStatus {
        match timeout(self.check_timeout, self.probe.probe(backend.address())).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        }
    }

    /// Probe every backend that is not deleted and apply the resulting transitions.
    ///
    /// Probes run concurrently and outside the registry lock. Each transition is a
    /// compare-and-swap against the state seen before probing, so an operator change made
    /// while the probe was in flight wins.
    pub async fn check(&self, set: &BackendSet) -> SweepReport {
        let candidates: Vec<(Arc<Backend>, BackendState)> = set
            .backends()
            .into_iter()
            .map(|backend| {
                let state = backend.state();
                (backend, state)
            })
            .filter(|(_, state)| *state != BackendState::Deleted)
            .collect();

        let statuses = join_all(
            candidates
                .iter()
                .map(|(backend, _)| self.probe_backend(backend)),
        )
        .await;

        let now = SystemTime::now();
        let mut report = SweepReport::default();

        for ((backend, observed), status) in candidates.iter().zip(statuses) {
            report.checked += 1;
            backend.touch_check_time(now);

            if !status.is_healthy() {
                tracing::warn!("Backend {} failed health check: {}", backend.address(), status);
            }

            if *observed == BackendState::Maintaining {
                report.held += 1;
                continue;
            }

            let Some(target) = next_state(*observed, status.is_healthy()) else {
                continue;
            };

            match set.transition_by_id(backend.id(), *observed, target) {
                Ok(_) => {
                    if target == BackendState::Up {
                        report.marked_up += 1;
                    } else {
                        report.marked_down += 1;
                    }
                }
                Err(PasarelaError::Conflict { actual, .. }) => {
                    tracing::debug!(
                        "Skipping transition of {} to {}: state changed to {} during probe",
                        backend.address(),
                        target,
                        actual
                    );
                    report.conflicts += 1;
                }
                Err(e) => {
                    // Removed while the probe was in flight
                    tracing::debug!("Skipping transition of {}: {}", backend.address(), e);
                }
            }
        }

        set.touch_last_check(now);
        report
    }

    /// Sweep on every interval tick until `shutdown` flips to true or its sender is dropped
    pub async fn run(&self, set: Arc<BackendSet>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.check(&set).await;
                    tracing::debug!(
                        "Health sweep: {} checked, {} up, {} down, {} held, {} conflicts",
                        report.checked,
                        report.marked_up,
                        report.marked_down,
                        report.held,
                        report.conflicts
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Health checker stopping");
                        break;
                    }
                }
            }
        }
    }
}
