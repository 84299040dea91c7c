pub mod config;
pub mod error;
/// Pasarela - backend pool manager for MySQL-protocol proxies
///
/// Tracks the upstream servers a proxy can route to, keeps their health state current,
/// groups them into replication topologies and answers "which backend should serve this
/// new connection" for a requested role and policy:
/// 1. Read-write pick: the first primary that is up
/// 2. Read-only pick: round-robin, random or first among replicas that are up
/// 3. Group pick: round-robin among the replicas of one topology group
pub mod core;
pub mod health;
pub mod utils;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::{Backend, BackendAlgo, BackendSet, BackendType, ProcessContext};
use crate::error::{PasarelaError, PasarelaResult};
use crate::health::HealthChecker;

/// Role requested by the routing layer for a new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Writes, or reads that must see the latest writes
    ReadWrite,
    /// Reads that may go to any replica
    ReadOnly,
    /// Reads pinned to the replicas of one group
    Group(String),
}

/// Backend set plus its health checker, wired from configuration
pub struct Pasarela {
    set: Arc<BackendSet>,
    checker: Arc<HealthChecker>,
    algorithm: BackendAlgo,
    /// Fall back to the primary when no replica is available
    ro_fallback_to_rw: bool,
    shutdown: watch::Sender<bool>,
    health_task: Option<JoinHandle<()>>,
}

impl Pasarela {
    pub fn new(set: BackendSet, checker: HealthChecker, algorithm: BackendAlgo) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            set: Arc::new(set),
            checker: Arc::new(checker),
            algorithm,
            ro_fallback_to_rw: true,
            shutdown,
            health_task: None,
        }
    }

    /// Build the set from `config` and a TCP health checker
    pub fn from_config(config: &Config, ctx: &ProcessContext) -> PasarelaResult<Self> {
        config.validate()?;
        let set = BackendSet::from_config(config, ctx)?;
        let checker = HealthChecker::from_config(&config.health);
        Ok(Self::new(set, checker, config.backends.algorithm))
    }

    pub fn with_ro_fallback(mut self, enabled: bool) -> Self {
        self.ro_fallback_to_rw = enabled;
        self
    }

    pub fn backends(&self) -> &Arc<BackendSet> {
        &self.set
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    pub fn algorithm(&self) -> BackendAlgo {
        self.algorithm
    }

    /// Pick a backend for `route`.
    ///
    /// Read-only routes fall back to the primary when no replica is up and fallback is
    /// enabled; a read-write route never degrades to a replica.
    pub fn select(&self, route: &Route) -> PasarelaResult<Arc<Backend>> {
        let picked = match route {
            Route::ReadWrite => return self.set.get_rw(),
            Route::ReadOnly => self.set.get_ro(self.algorithm),
            Route::Group(name) => self.set.group_pick_slave_backend(name),
        };

        match picked {
            Err(e @ (PasarelaError::Exhausted { .. } | PasarelaError::Unavailable { .. }))
                if self.ro_fallback_to_rw =>
            {
                tracing::debug!("Read-only pick failed ({}), falling back to primary", e);
                let primary = match route {
                    Route::Group(name) => self.set.group_master(name),
                    _ => self.set.get_rw(),
                };
                primary.map_err(|_| e)
            }
            other => other,
        }
    }

    /// Spawn the periodic health sweep; calling it twice keeps the first task
    pub fn start_health_checks(&mut self) {
        if self.health_task.is_some() {
            return;
        }

        let checker = Arc::clone(&self.checker);
        let set = Arc::clone(&self.set);
        let shutdown = self.shutdown.subscribe();
        tracing::info!(
            "Starting health checks every {:?} for {} backends",
            checker.check_interval(),
            set.count()
        );
        self.health_task = Some(tokio::spawn(async move {
            checker.run(set, shutdown).await;
        }));
    }

    pub fn is_running(&self) -> bool {
        self.health_task.is_some()
    }

    /// Stop the health sweep and wait for it to finish
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.health_task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Health check task ended abnormally: {}", e);
            }
        }
    }

    /// Number of read-write backends currently up
    pub fn available_primaries(&self) -> usize {
        self.set
            .backends()
            .iter()
            .filter(|b| b.serves(BackendType::ReadWrite))
            .count()
    }
}
