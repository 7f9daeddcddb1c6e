// backupagent/src/scheduler/mod.rs
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backup::{Orchestrator, RunOutcome};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Fires the orchestrator at a fixed interval.
///
/// Every tick is spawned as its own task so a slow run never delays the
/// timer; overlap is rejected by the orchestrator's run guard. The first
/// tick fires immediately.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    shutdown_grace: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Ticks until `shutdown` resolves, then waits up to the grace period for
    /// the run in flight. Returns the number of ticks fired.
    pub async fn run<F>(self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_secs = self.interval.as_secs_f64(), "🚀 Scheduler started");
        let mut runs: JoinSet<RunOutcome> = JoinSet::new();
        let mut ticks = 0usize;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    ticks += 1;
                    debug!(tick = ticks, "Scheduler tick");
                    let orchestrator = Arc::clone(&self.orchestrator);
                    runs.spawn(async move { orchestrator.tick().await });
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => reap(joined),
            }
        }

        info!(in_flight = runs.len(), "Scheduler stopping");
        let drain = async {
            while let Some(joined) = runs.join_next().await {
                reap(joined);
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                grace_secs = self.shutdown_grace.as_secs(),
                "Backup run still in flight after the grace period; aborting it"
            );
            runs.abort_all();
        }
        ticks
    }
}

fn reap(joined: Result<RunOutcome, JoinError>) {
    match joined {
        Ok(outcome) => debug!(?outcome, "Run task finished"),
        Err(e) if e.is_panic() => error!("❌ Backup run panicked; run guard released"),
        Err(e) => warn!(error = %e, "Backup run task was cancelled"),
    }
}
