//! Background renewal scheduler
//!
//! Runs one renewal cycle per interval until shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::orchestrator::{CycleReport, RenewalOrchestrator};

/// Minimum check interval (1 minute)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic cycle runner
///
/// At most one cycle runs at a time. A cycle that panics is logged and the
/// loop carries on with the next interval.
#[derive(Debug, Clone)]
pub struct RenewalScheduler {
    orchestrator: Arc<RenewalOrchestrator>,
    check_interval: Duration,
    in_flight: Arc<Mutex<()>>,
}

impl RenewalScheduler {
    pub fn new(orchestrator: Arc<RenewalOrchestrator>, check_interval: Duration) -> Self {
        Self {
            orchestrator,
            check_interval: check_interval.max(MIN_CHECK_INTERVAL),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run cycles until `shutdown` resolves
    ///
    /// The first cycle starts immediately. Shutdown returns without waiting
    /// for a cycle in progress: that cycle keeps running on its own task,
    /// still holding the single-flight guard, until it finishes or the
    /// runtime is dropped. Ledgers are only ever replaced atomically, so
    /// stopping the runtime mid-cycle leaves them consistent.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping renewal scheduler");
                    return;
                }
                _ = ticker.tick() => {
                    debug!("Running scheduled renewal cycle");
                    tokio::select! {
                        _ = &mut shutdown => {
                            warn!("Shutdown requested during a renewal cycle, stopping");
                            return;
                        }
                        _ = self.run_once() => {}
                    }
                }
            }
        }
    }

    /// Run a single cycle now
    ///
    /// Returns `None` when another cycle is still running or when the cycle
    /// panicked.
    pub async fn run_once(&self) -> Option<CycleReport> {
        let Ok(guard) = Arc::clone(&self.in_flight).try_lock_owned() else {
            warn!("Previous renewal cycle still running, skipping this one");
            return None;
        };

        let start = Instant::now();
        let orchestrator = Arc::clone(&self.orchestrator);
        // The guard lives as long as the cycle task, even if this future is dropped.
        let handle = tokio::spawn(async move {
            let _guard = guard;
            orchestrator.run_cycle().await
        });

        match handle.await {
            Ok(report) => {
                info!(
                    cycle_id = %report.cycle_id,
                    phase = %report.phase,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Renewal cycle completed"
                );
                Some(report)
            }
            Err(e) if e.is_panic() => {
                error!(error = %e, "Renewal cycle panicked");
                None
            }
            Err(e) => {
                error!(error = %e, "Renewal cycle task failed");
                None
            }
        }
    }
}
