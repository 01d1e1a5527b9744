//! Periodic session maintenance: processing timeouts and eviction.

use std::sync::Arc;
use std::time::Duration;

use headlock_core::{Coordinator, SessionsConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a maintenance pass should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenancePolicy {
    pub interval: Duration,
    pub processing_timeout: Option<Duration>,
    pub retention: Option<Duration>,
}

impl MaintenancePolicy {
    /// `None` when neither pass is configured
    pub fn from_config(config: &SessionsConfig) -> Option<Self> {
        config.maintenance_enabled().then(|| Self {
            interval: config.reap_interval(),
            processing_timeout: config.processing_timeout(),
            retention: config.retention(),
        })
    }
}

/// Run one pass; returns (expired, evicted) counts
pub fn run_once(coordinator: &Coordinator, policy: &MaintenancePolicy) -> (usize, usize) {
    let expired = policy
        .processing_timeout
        .map_or(0, |timeout| coordinator.expire_processing(timeout).len());
    let evicted = policy
        .retention
        .map_or(0, |retention| coordinator.evict_finished(retention).len());
    (expired, evicted)
}

/// Spawn the maintenance loop; stops when `shutdown` is cancelled
pub fn spawn(
    coordinator: Arc<Coordinator>,
    policy: MaintenancePolicy,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    info!(
        interval_secs = policy.interval.as_secs(),
        processing_timeout = ?policy.processing_timeout,
        retention = ?policy.retention,
        "Session maintenance enabled"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(policy.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (expired, evicted) = run_once(&coordinator, &policy);
                    if expired > 0 || evicted > 0 {
                        info!(expired, evicted, "Session maintenance pass");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Session maintenance shutting down");
                    break;
                }
            }
        }
    })
}
