//! Orchestrator lifecycle.
//!
//! Runs the prerequisite check, initializes the state store (first run
//! only), then launches the reaper and N staggered workers and supervises
//! them: if work remains and every worker has died, a fresh generation is
//! spawned. When the backlog drains the run shuts down cleanly, surfaces
//! blocked features, and computes the merge plan.

use crate::builder::Builder;
use crate::catalog::Catalog;
use crate::claims::ClaimManager;
use crate::config::Config;
use crate::decisions::DecisionQueue;
use crate::errors::OrchestratorError;
use crate::heartbeat::{HeartbeatBeacon, Reaper};
use crate::ledger::CostLedger;
use crate::mergeplan::{self, MergePlan};
use crate::notify::{Notifier, ProgressCounts};
use crate::shutdown::ShutdownFlag;
use crate::store::StateStore;
use crate::vcs::Vcs;
use crate::worker::{Worker, WorkerConfig};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Final status of a run.
#[derive(Debug)]
pub struct RunReport {
    pub counts: ProgressCounts,
    /// `(feature id, reason)` for every Blocked feature.
    pub blocked: Vec<(String, String)>,
    /// Present when at least one feature completed and the dependency
    /// subgraph is acyclic.
    pub merge_plan: Option<MergePlan>,
    pub daily_cost: f64,
    /// True when the backlog drained; false when the run was interrupted.
    pub drained: bool,
}

pub struct Orchestrator {
    config: Config,
    catalog: Arc<Catalog>,
    claims: Arc<ClaimManager>,
    decisions: Arc<DecisionQueue>,
    builder: Arc<dyn Builder>,
    vcs: Arc<dyn Vcs>,
    notifier: Arc<dyn Notifier>,
    shutdown: ShutdownFlag,
    worker_stagger: Duration,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        catalog: Catalog,
        builder: Arc<dyn Builder>,
        vcs: Arc<dyn Vcs>,
        notifier: Arc<dyn Notifier>,
        shutdown: ShutdownFlag,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let store = Arc::new(StateStore::new(
            &config.state_path,
            &config.locks_path,
            config.claim_lock_timeout,
            &catalog,
        ));
        let claims = Arc::new(ClaimManager::new(
            store,
            catalog.clone(),
            notifier.clone(),
            &config.feature_branch_prefix,
        ));
        let decisions = Arc::new(DecisionQueue::new(
            &config.decisions_path,
            &config.locks_path,
            config.lock_timeout,
            notifier.clone(),
        ));
        Self {
            config,
            catalog,
            claims,
            decisions,
            builder,
            vcs,
            notifier,
            shutdown,
            worker_stagger: Duration::from_millis(500),
        }
    }

    /// Override the worker spawn stagger (tests use zero).
    pub fn with_worker_stagger(mut self, stagger: Duration) -> Self {
        self.worker_stagger = stagger;
        self
    }

    pub fn claims(&self) -> &Arc<ClaimManager> {
        &self.claims
    }

    pub fn decisions(&self) -> &Arc<DecisionQueue> {
        &self.decisions
    }

    /// Prerequisite check. Any failure here is fatal before spawning.
    pub fn preflight(&self) -> Result<(), OrchestratorError> {
        self.catalog
            .validate()
            .map_err(|e| OrchestratorError::PrerequisiteFailed(e.to_string()))?;
        self.vcs
            .available()
            .map_err(|e| OrchestratorError::PrerequisiteFailed(format!("VCS: {:#}", e)))?;
        self.builder
            .preflight()
            .map_err(|e| OrchestratorError::PrerequisiteFailed(format!("builder: {:#}", e)))?;
        self.config
            .ensure_directories()
            .map_err(|e| OrchestratorError::PrerequisiteFailed(e.to_string()))?;
        Ok(())
    }

    fn ledger(&self) -> CostLedger {
        CostLedger::new(
            &self.config.ledger_path,
            self.config.cost_per_input_token,
            self.config.cost_per_output_token,
            self.config.max_daily_cost,
        )
    }

    fn spawn_workers(&self, generation: u32) -> Vec<JoinHandle<()>> {
        let worker_config = WorkerConfig::from_config(&self.config);
        let stagger = self.worker_stagger;
        (0..self.config.num_workers)
            .map(|i| {
                let worker = Worker::new(
                    &format!("worker-{}", i + 1),
                    self.claims.clone(),
                    self.ledger(),
                    HeartbeatBeacon::new(
                        &self.config.heartbeats_path,
                        &format!("worker-{}", i + 1),
                    ),
                    self.builder.clone(),
                    self.vcs.clone(),
                    self.decisions.clone(),
                    worker_config.clone(),
                    self.shutdown.clone(),
                );
                // Stagger the first claims to avoid a thundering herd on the
                // state mutex; later generations start immediately.
                let delay = if generation == 0 {
                    stagger * i as u32
                } else {
                    Duration::ZERO
                };
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    worker.run().await;
                })
            })
            .collect()
    }

    fn spawn_reaper(&self) -> JoinHandle<()> {
        let reaper = Reaper::new(
            self.claims.clone(),
            self.ledger(),
            &self.config.heartbeats_path,
            self.config.reaper_interval,
            self.config.stale_claim_threshold,
            self.config.max_ci_attempts,
            self.config.budget_cooldown,
            self.shutdown.clone(),
        );
        tokio::spawn(reaper.run())
    }

    /// Run the full lifecycle to completion or interruption.
    pub async fn run(&self) -> Result<RunReport, OrchestratorError> {
        self.preflight()?;
        let doc = self.claims.store().load()?;
        self.notifier.notify_started(doc.features.len());

        let reaper = self.spawn_reaper();
        let mut workers = self.spawn_workers(0);
        let mut generation = 0;

        // Supervision loop: drain is polled every tick, the mass-death
        // respawn check only every supervision interval.
        let tick = Duration::from_secs(1);
        let mut since_supervision = Duration::ZERO;
        let drained = loop {
            if self.shutdown.sleep(tick).await {
                break false;
            }

            let doc = match self.claims.store().snapshot() {
                Ok(doc) => doc,
                Err(e) => {
                    eprintln!("orchestrator: state read failed: {}", e);
                    break false;
                }
            };
            if doc.is_drained() {
                break true;
            }

            since_supervision += tick;
            if since_supervision >= self.config.supervision_interval {
                since_supervision = Duration::ZERO;
                workers.retain(|handle| !handle.is_finished());
                if workers.is_empty() {
                    generation += 1;
                    eprintln!(
                        "orchestrator: all workers exited with work remaining; respawning (generation {})",
                        generation
                    );
                    workers = self.spawn_workers(generation);
                }
            }
        };

        // Drain or interrupt: stop everything and wait for it to land.
        self.shutdown.trigger();
        for handle in workers {
            let _ = handle.await;
        }
        let _ = reaper.await;

        self.report(drained)
    }

    fn report(&self, drained: bool) -> Result<RunReport, OrchestratorError> {
        let doc = self.claims.store().snapshot()?;
        let counts = ProgressCounts::from_document(&doc);
        self.notifier.notify_progress(&counts);

        let blocked: Vec<(String, String)> = doc
            .features
            .iter()
            .filter(|f| f.status == crate::state::FeatureStatus::Blocked)
            .map(|f| {
                (
                    f.id.clone(),
                    f.blocked_reason.clone().unwrap_or_default(),
                )
            })
            .collect();

        let daily_cost = self.ledger().daily_total().unwrap_or(0.0);
        if self.config.max_daily_cost > 0.0 {
            self.notifier.notify_cost(daily_cost, self.config.max_daily_cost);
        }

        let merge_plan = if counts.completed > 0 {
            let plan = mergeplan::plan(&self.catalog, &doc)
                .map_err(|e| OrchestratorError::MergePlan(e.to_string()))?;
            std::fs::write(
                &self.config.merge_plan_path,
                plan.render_markdown(&self.config.default_branch),
            )
            .context("Failed to write merge plan")?;
            Some(plan)
        } else {
            None
        };

        Ok(RunReport {
            counts,
            blocked,
            merge_plan,
            daily_cost,
            drained,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ScriptedBuilder;
    use crate::catalog::FeatureSpec;
    use crate::notify::NullNotifier;
    use crate::vcs::NullVcs;
    use tempfile::tempdir;

    fn orchestrator(
        dir: &std::path::Path,
        features: Vec<FeatureSpec>,
        builder: ScriptedBuilder,
        workers: usize,
    ) -> Orchestrator {
        let mut config = Config::new(dir.to_path_buf(), false).unwrap();
        config.num_workers = workers;
        config.max_iterations_per_feature = 3;
        let catalog = Catalog {
            features,
            integration_tests: Vec::new(),
        };
        Orchestrator::new(
            config,
            catalog,
            Arc::new(builder),
            Arc::new(NullVcs::with_pr_url("https://example.com/pr/1")),
            Arc::new(NullNotifier),
            ShutdownFlag::new(),
        )
        .with_worker_stagger(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_single_worker_chain_run() {
        let dir = tempdir().unwrap();
        let builder = ScriptedBuilder::new(vec![
            "<promise>FEATURE_COMPLETE:a</promise>".into(),
            "<promise>FEATURE_COMPLETE:b</promise>".into(),
            "<promise>FEATURE_COMPLETE:c</promise>".into(),
        ]);
        let orch = orchestrator(
            dir.path(),
            vec![
                FeatureSpec::new("a", "A", vec![], 1),
                FeatureSpec::new("b", "B", vec!["a".into()], 2),
                FeatureSpec::new("c", "C", vec!["b".into()], 3),
            ],
            builder,
            1,
        );

        let report = orch.run().await.unwrap();
        assert!(report.drained);
        assert_eq!(report.counts.completed, 3);
        assert!(report.blocked.is_empty());
        let plan = report.merge_plan.unwrap();
        assert_eq!(plan.ordered_ids(), vec!["a", "b", "c"]);
        assert!(dir.path().join(".foreman/merge-plan.md").exists());
    }

    #[tokio::test]
    async fn test_blocked_feature_surfaces_in_report() {
        let dir = tempdir().unwrap();
        let builder = ScriptedBuilder::new(vec![
            "<promise>BLOCKED:solo:Need a production API key</promise>".into(),
        ]);
        let orch = orchestrator(
            dir.path(),
            vec![FeatureSpec::new("solo", "Solo", vec![], 1)],
            builder,
            1,
        );

        let report = orch.run().await.unwrap();
        assert!(report.drained);
        assert_eq!(report.counts.blocked, 1);
        assert_eq!(
            report.blocked,
            vec![("solo".to_string(), "Need a production API key".to_string())]
        );
        assert!(report.merge_plan.is_none());
    }

    #[tokio::test]
    async fn test_empty_catalog_drains_immediately() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(dir.path(), vec![], ScriptedBuilder::new(vec![]), 1);

        let report = orch.run().await.unwrap();
        assert!(report.drained);
        assert_eq!(report.counts.total(), 0);
    }

    #[tokio::test]
    async fn test_preflight_failure_is_fatal_before_spawning() {
        let dir = tempdir().unwrap();
        let mut config = Config::new(dir.path().to_path_buf(), false).unwrap();
        config.num_workers = 1;
        // Catalog with a dangling dependency fails validation.
        let catalog = Catalog {
            features: vec![FeatureSpec::new("a", "A", vec!["ghost".into()], 1)],
            integration_tests: Vec::new(),
        };
        let orch = Orchestrator::new(
            config,
            catalog,
            Arc::new(ScriptedBuilder::new(vec![])),
            Arc::new(NullVcs::new()),
            Arc::new(NullNotifier),
            ShutdownFlag::new(),
        );

        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PrerequisiteFailed(_)));
        // Nothing was spawned, so no state document was created either.
        assert!(!dir.path().join(".foreman/state.json").exists());
    }

    #[tokio::test]
    async fn test_interrupted_run_reports_not_drained() {
        let dir = tempdir().unwrap();
        // Builder never emits a marker, so the run only ends via shutdown.
        let orch = orchestrator(
            dir.path(),
            vec![FeatureSpec::new("slow", "Slow", vec![], 1)],
            ScriptedBuilder::new(vec![]),
            1,
        );
        let shutdown = orch.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown.trigger();
        });

        let report = orch.run().await.unwrap();
        assert!(!report.drained);
    }

    #[tokio::test]
    async fn test_completed_state_survives_restart() {
        let dir = tempdir().unwrap();
        let features = || {
            vec![
                FeatureSpec::new("a", "A", vec![], 1),
                FeatureSpec::new("b", "B", vec!["a".into()], 2),
            ]
        };

        let first = orchestrator(
            dir.path(),
            features(),
            ScriptedBuilder::new(vec![
                "<promise>FEATURE_COMPLETE:a</promise>".into(),
                "<promise>BLOCKED:b:halt here</promise>".into(),
            ]),
            1,
        );
        let report = first.run().await.unwrap();
        assert_eq!(report.counts.completed, 1);

        // Second run: 'a' stays completed, 'b' is still blocked; the state
        // document is not re-initialized.
        let second = orchestrator(dir.path(), features(), ScriptedBuilder::new(vec![]), 1);
        let report = second.run().await.unwrap();
        assert_eq!(report.counts.completed, 1);
        assert_eq!(report.counts.blocked, 1);
    }
}
