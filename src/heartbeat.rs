//! Worker liveness beacons and the stale-claim reaper.
//!
//! Each worker periodically writes a heartbeat file named after its id,
//! carrying the current timestamp. A worker is alive when its last beat is
//! within the freshness threshold.
//!
//! The reaper releases an InProgress claim only when BOTH the claim age and
//! the owner's heartbeat exceed the threshold; a worker that is merely busy
//! inside a long builder call keeps beating and is never reaped. The reaper
//! also blocks features whose CI has failed too many times, and backs off
//! when the daily budget is exhausted.

use crate::claims::ClaimManager;
use crate::errors::ClaimError;
use crate::ledger::CostLedger;
use crate::shutdown::ShutdownFlag;
use crate::state::{CiStatus, FeatureStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A worker's liveness beacon.
#[derive(Debug, Clone)]
pub struct HeartbeatBeacon {
    dir: PathBuf,
    worker_id: String,
}

impl HeartbeatBeacon {
    pub fn new(dir: &Path, worker_id: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            worker_id: worker_id.to_string(),
        }
    }

    /// Record the current timestamp for this worker.
    pub fn touch(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).context("Failed to create heartbeats directory")?;
        std::fs::write(self.dir.join(&self.worker_id), Utc::now().to_rfc3339())
            .context("Failed to write heartbeat")?;
        Ok(())
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

/// Last recorded beat for a worker, if any.
pub fn last_heartbeat(dir: &Path, worker_id: &str) -> Option<DateTime<Utc>> {
    let content = std::fs::read_to_string(dir.join(worker_id)).ok()?;
    DateTime::parse_from_rfc3339(content.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// True when the worker's beacon is fresh.
pub fn is_alive(dir: &Path, worker_id: &str, freshness: Duration) -> bool {
    match last_heartbeat(dir, worker_id) {
        Some(beat) => {
            let age = Utc::now() - beat;
            age.to_std().map(|a| a <= freshness).unwrap_or(true)
        }
        None => false,
    }
}

/// What one reaper sweep did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub released: Vec<String>,
    pub ci_blocked: Vec<String>,
}

/// Background task that recovers stale claims and enforces CI limits.
pub struct Reaper {
    claims: Arc<ClaimManager>,
    ledger: CostLedger,
    heartbeats_dir: PathBuf,
    interval: Duration,
    freshness: Duration,
    max_ci_attempts: u32,
    budget_cooldown: Duration,
    shutdown: ShutdownFlag,
}

impl Reaper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        claims: Arc<ClaimManager>,
        ledger: CostLedger,
        heartbeats_dir: &Path,
        interval: Duration,
        freshness: Duration,
        max_ci_attempts: u32,
        budget_cooldown: Duration,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            claims,
            ledger,
            heartbeats_dir: heartbeats_dir.to_path_buf(),
            interval,
            freshness,
            max_ci_attempts,
            budget_cooldown,
            shutdown,
        }
        .normalize()
    }

    fn normalize(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = Duration::from_secs(60);
        }
        self
    }

    /// Run until shutdown. Sweep errors are logged and absorbed; the reaper
    /// never takes a feature down with it.
    pub async fn run(self) {
        loop {
            if self.shutdown.is_triggered() {
                return;
            }

            match self.ledger.within_budget() {
                Ok(false) => {
                    if self.shutdown.sleep(self.budget_cooldown).await {
                        return;
                    }
                    continue;
                }
                Ok(true) => {}
                Err(e) => eprintln!("reaper: ledger read failed: {:#}", e),
            }

            if let Err(e) = self.sweep() {
                eprintln!("reaper: sweep failed: {}", e);
            }

            if self.shutdown.sleep(self.interval).await {
                return;
            }
        }
    }

    /// One pass over the state document.
    pub fn sweep(&self) -> Result<SweepReport, ClaimError> {
        let doc = self.claims.store().snapshot()?;
        let mut report = SweepReport::default();
        let now = Utc::now();

        for feature in &doc.features {
            if !matches!(
                feature.status,
                FeatureStatus::Pending | FeatureStatus::InProgress
            ) {
                continue;
            }

            if feature.ci_status == CiStatus::Failed && feature.ci_attempts >= self.max_ci_attempts
            {
                let reason = format!("CI failed {} times", feature.ci_attempts);
                match self.claims.block(&feature.id, &reason) {
                    Ok(()) => report.ci_blocked.push(feature.id.clone()),
                    Err(ClaimError::Unavailable { .. }) => {}
                    Err(e) => return Err(e),
                }
                continue;
            }

            if feature.status == FeatureStatus::InProgress {
                let Some(claimed_at) = feature.claimed_at else {
                    continue;
                };
                let claim_age = (now - claimed_at).to_std().unwrap_or_default();
                let owner_alive = feature
                    .claimed_by
                    .as_deref()
                    .is_some_and(|w| is_alive(&self.heartbeats_dir, w, self.freshness));

                if claim_age > self.freshness && !owner_alive {
                    // Re-checked inside the mutation; a racing completion
                    // surfaces as NotInProgress and is ignored.
                    match self.claims.release(&feature.id, "stale") {
                        Ok(()) => report.released.push(feature.id.clone()),
                        Err(ClaimError::NotInProgress { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Ok(report)
    }
}
