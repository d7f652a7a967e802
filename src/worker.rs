//! The per-task worker loop.
//!
//! A worker claims one feature at a time, prepares its branch, and drives
//! the external builder until a terminal marker appears or the iteration
//! budget runs out. Iteration-level failures are absorbed; terminal feature
//! outcomes are always expressed as state transitions, never as crashes.
//!
//! On shutdown mid-feature the claim is deliberately left InProgress: the
//! reaper returns it to Pending once its freshness expires, and another
//! worker picks it up.

use crate::builder::{Builder, TaskAssignment};
use crate::claims::ClaimManager;
use crate::config::Config;
use crate::decisions::{DecisionQueue, NewDecision};
use crate::errors::DecisionError;
use crate::heartbeat::HeartbeatBeacon;
use crate::ledger::CostLedger;
use crate::signals::{TerminalSignal, first_terminal_for, parse_decision_reason};
use crate::shutdown::ShutdownFlag;
use crate::vcs::Vcs;
use std::sync::Arc;
use std::time::Duration;

/// Worker-loop timing and limits.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_iterations_per_feature: u32,
    pub budget_cooldown: Duration,
    pub idle_sleep: Duration,
    pub iteration_pause: Duration,
    pub heartbeat_interval: Duration,
    pub decision_timeout: Duration,
    pub default_branch: String,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations_per_feature: config.max_iterations_per_feature,
            budget_cooldown: config.budget_cooldown,
            idle_sleep: Duration::from_secs(5),
            iteration_pause: Duration::from_secs(1),
            heartbeat_interval: config.heartbeat_interval,
            decision_timeout: config.decision_timeout,
            default_branch: config.default_branch.clone(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_iterations_per_feature: 10,
            budget_cooldown: Duration::from_secs(300),
            idle_sleep: Duration::from_secs(5),
            iteration_pause: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(60),
            decision_timeout: Duration::from_secs(3600),
            default_branch: "main".to_string(),
        }
    }
}

pub struct Worker {
    id: String,
    claims: Arc<ClaimManager>,
    ledger: CostLedger,
    beacon: HeartbeatBeacon,
    builder: Arc<dyn Builder>,
    vcs: Arc<dyn Vcs>,
    decisions: Arc<DecisionQueue>,
    config: WorkerConfig,
    shutdown: ShutdownFlag,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        claims: Arc<ClaimManager>,
        ledger: CostLedger,
        beacon: HeartbeatBeacon,
        builder: Arc<dyn Builder>,
        vcs: Arc<dyn Vcs>,
        decisions: Arc<DecisionQueue>,
        config: WorkerConfig,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            id: id.to_string(),
            claims,
            ledger,
            beacon,
            builder,
            vcs,
            decisions,
            config,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main loop: claim, build, repeat, until the backlog drains or
    /// shutdown triggers.
    pub async fn run(self) {
        loop {
            if self.shutdown.is_triggered() {
                return;
            }
            self.touch();

            if !self.budget_ok() {
                if self.shutdown.sleep(self.config.budget_cooldown).await {
                    return;
                }
                continue;
            }

            let claimed = match self.claims.claim_next(&self.id) {
                Ok(claimed) => claimed,
                Err(e) => {
                    // Contention and transient store errors: back off and retry.
                    eprintln!("worker {}: claim failed: {}", self.id, e);
                    if self.shutdown.sleep(self.config.idle_sleep).await {
                        return;
                    }
                    continue;
                }
            };

            match claimed {
                Some(feature_id) => self.work_feature(&feature_id).await,
                None => {
                    let drained = self
                        .claims
                        .store()
                        .snapshot()
                        .map(|doc| doc.is_drained())
                        .unwrap_or(false);
                    if drained {
                        return;
                    }
                    if self.shutdown.sleep(self.config.idle_sleep).await {
                        return;
                    }
                }
            }
        }
    }

    fn touch(&self) {
        if let Err(e) = self.beacon.touch() {
            eprintln!("worker {}: heartbeat failed: {}", self.id, e);
        }
    }

    fn budget_ok(&self) -> bool {
        self.ledger.within_budget().unwrap_or(true)
    }

    /// Drive one claimed feature to a terminal transition.
    async fn work_feature(&self, feature_id: &str) {
        let Some(spec) = self.claims.catalog().get(feature_id).cloned() else {
            let _ = self.claims.release(feature_id, "unknown feature");
            return;
        };
        let branch = self
            .claims
            .store()
            .snapshot()
            .ok()
            .and_then(|doc| doc.get(feature_id).and_then(|f| f.branch.clone()))
            .unwrap_or_else(|| format!("feature/{}", feature_id));

        if let Err(e) = self.vcs.ensure_branch(&branch, &self.config.default_branch) {
            eprintln!("worker {}: branch prep failed for {}: {:#}", self.id, feature_id, e);
            let _ = self.claims.release(feature_id, "branch preparation failed");
            return;
        }

        let mut task =
            TaskAssignment::new(spec, &branch, self.config.max_iterations_per_feature);

        let mut iteration = 0;
        while iteration < self.config.max_iterations_per_feature {
            self.touch();
            if self.shutdown.is_triggered() {
                // Claim stays InProgress; the reaper recovers it.
                return;
            }
            if !self.budget_ok() {
                if self.shutdown.sleep(self.config.budget_cooldown).await {
                    return;
                }
                continue;
            }

            iteration += 1;
            task.iteration = iteration;

            let output = match self.builder.run(&task).await {
                Ok(output) => output,
                Err(e) => {
                    // External failure is a non-terminal iteration.
                    eprintln!("worker {}: builder failed on {}: {:#}", self.id, feature_id, e);
                    if self.shutdown.sleep(self.config.iteration_pause).await {
                        return;
                    }
                    continue;
                }
            };

            if let Err(e) =
                self.ledger
                    .record(&self.id, feature_id, output.tokens_in, output.tokens_out)
            {
                eprintln!("worker {}: ledger append failed: {:#}", self.id, e);
            }

            match first_terminal_for(&output.output, feature_id) {
                Some(TerminalSignal::Complete { .. }) => {
                    let pr_url = self.vcs.pr_url_for_current_branch().ok().flatten();
                    if let Err(e) = self.claims.complete(feature_id, pr_url.as_deref()) {
                        eprintln!("worker {}: complete failed for {}: {}", self.id, feature_id, e);
                    }
                    return;
                }
                Some(TerminalSignal::Blocked { reason, .. }) => {
                    match parse_decision_reason(&reason) {
                        Some(prompt) => {
                            if self.rendezvous(feature_id, &mut task, prompt, &reason).await {
                                // Answer received; keep iterating with it.
                                continue;
                            }
                            return;
                        }
                        None => {
                            if let Err(e) = self.claims.block(feature_id, &reason) {
                                eprintln!(
                                    "worker {}: block failed for {}: {}",
                                    self.id, feature_id, e
                                );
                            }
                            return;
                        }
                    }
                }
                Some(TerminalSignal::Stuck { .. }) => {
                    let reason = format!("Stuck after {} iterations", iteration);
                    if let Err(e) = self.claims.block(feature_id, &reason) {
                        eprintln!("worker {}: block failed for {}: {}", self.id, feature_id, e);
                    }
                    return;
                }
                None => {
                    if self.shutdown.sleep(self.config.iteration_pause).await {
                        return;
                    }
                }
            }
        }

        if let Err(e) = self.claims.block(feature_id, "Max iterations reached") {
            eprintln!("worker {}: block failed for {}: {}", self.id, feature_id, e);
        }
    }

    /// Raise a decision for a question-shaped blocker and wait for the
    /// answer. Returns `true` when the feature loop should resume.
    async fn rendezvous(
        &self,
        feature_id: &str,
        task: &mut TaskAssignment,
        prompt: crate::signals::DecisionPrompt,
        original_reason: &str,
    ) -> bool {
        let created = self.decisions.create(NewDecision {
            question: prompt.question.clone(),
            options: prompt.options,
            context: format!("feature {} on branch {}", feature_id, task.branch),
            default_answer: None,
            timeout: self.config.decision_timeout,
            requesting_worker: self.id.clone(),
            requesting_feature: feature_id.to_string(),
        });
        let decision_id = match created {
            Ok(id) => id,
            Err(e) => {
                eprintln!("worker {}: decision create failed: {}", self.id, e);
                let _ = self.claims.block(feature_id, original_reason);
                return false;
            }
        };

        // Keep beating while parked on the decision so the reaper does not
        // mistake the wait for a dead worker.
        let beat = {
            let beacon = self.beacon.clone();
            let shutdown = self.shutdown.clone();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    let _ = beacon.touch();
                    if shutdown.sleep(interval).await {
                        return;
                    }
                }
            })
        };
        let waited = self.decisions.wait(&decision_id, &self.shutdown).await;
        beat.abort();

        match waited {
            Ok(answer) => {
                let by = self
                    .decisions
                    .get(&decision_id)
                    .ok()
                    .and_then(|d| d.answered_by)
                    .unwrap_or_else(|| "default".to_string());
                task.extra_context.push(format!(
                    "Decision: {} -> {} (answered by {})",
                    prompt.question, answer, by
                ));
                true
            }
            Err(DecisionError::Cancelled) => false,
            Err(e) => {
                eprintln!(
                    "worker {}: decision {} unresolved: {}",
                    self.id, decision_id, e
                );
                let _ = self.claims.block(feature_id, original_reason);
                false
            }
        }
    }
}
