//! Async human-in-the-loop decisions.
//!
//! Each decision is a JSON record in a dedicated directory, keyed by a
//! unique id. The record file is the rendezvous point between the worker
//! that raised the question and the external answerer, which are different
//! processes; every mutation happens under a per-record lock with an
//! atomic rename, so an `answer` posted by `foreman answer` in one process
//! is observed by a `wait` polling in another.

use crate::errors::DecisionError;
use crate::lock::DirLock;
use crate::notify::Notifier;
use crate::shutdown::ShutdownFlag;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle of a decision record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    #[default]
    Pending,
    Answered,
    TimedOut,
    Cancelled,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Answered => "answered",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A persisted decision record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: String,
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_answer: Option<String>,
    pub timeout_seconds: u64,
    pub requesting_worker: String,
    pub requesting_feature: String,
    #[serde(default)]
    pub status: DecisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_by: Option<String>,
}

impl Decision {
    /// Wall-clock deadline for this decision.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.timeout_seconds as i64)
    }
}

/// Parameters for a new decision.
#[derive(Debug, Clone)]
pub struct NewDecision {
    pub question: String,
    pub options: Vec<String>,
    pub context: String,
    pub default_answer: Option<String>,
    pub timeout: Duration,
    pub requesting_worker: String,
    pub requesting_feature: String,
}

/// Persistent rendezvous between decision requesters and answerers.
pub struct DecisionQueue {
    dir: PathBuf,
    locks: DirLock,
    lock_timeout: Duration,
    notifier: Arc<dyn Notifier>,
}

impl DecisionQueue {
    pub fn new(
        dir: &Path,
        locks_dir: &Path,
        lock_timeout: Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            locks: DirLock::new(locks_dir),
            lock_timeout,
            notifier,
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn lock_name(id: &str) -> String {
        format!("decision-{}", id)
    }

    /// Persist a Pending record and emit a decision-needed notification.
    /// Returns the new decision id.
    pub fn create(&self, new: NewDecision) -> Result<String, DecisionError> {
        let decision = Decision {
            id: Uuid::new_v4().to_string(),
            question: new.question,
            options: new.options,
            context: new.context,
            default_answer: new.default_answer,
            timeout_seconds: new.timeout.as_secs(),
            requesting_worker: new.requesting_worker,
            requesting_feature: new.requesting_feature,
            status: DecisionStatus::Pending,
            answer: None,
            created_at: Utc::now(),
            answered_at: None,
            answered_by: None,
        };
        self.write_record(&decision)?;
        self.notifier
            .notify_decision_needed(&decision.id, &decision.question, &decision.options);
        Ok(decision.id)
    }

    /// Read a record by id.
    pub fn get(&self, id: &str) -> Result<Decision, DecisionError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(DecisionError::NotFound(id.to_string()));
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read decision record: {}", path.display()))?;
        let decision: Decision = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse decision record: {}", path.display()))?;
        Ok(decision)
    }

    /// Post an answer against a Pending decision.
    ///
    /// The answer must be one of the recorded options. Posting the same
    /// `(answer, answerer)` pair against an already-Answered record is
    /// accepted idempotently; any other post against a non-Pending record
    /// is rejected.
    pub fn answer(&self, id: &str, answer: &str, answerer: &str) -> Result<(), DecisionError> {
        self.with_record(id, |decision| {
            match decision.status {
                DecisionStatus::Pending => {}
                DecisionStatus::Answered
                    if decision.answer.as_deref() == Some(answer)
                        && decision.answered_by.as_deref() == Some(answerer) =>
                {
                    return Ok(false);
                }
                status => {
                    return Err(DecisionError::NotPending {
                        id: id.to_string(),
                        status: status.as_str().to_string(),
                    });
                }
            }
            if !decision.options.iter().any(|o| o == answer) {
                return Err(DecisionError::InvalidAnswer {
                    answer: answer.to_string(),
                    options: decision.options.clone(),
                });
            }
            decision.status = DecisionStatus::Answered;
            decision.answer = Some(answer.to_string());
            decision.answered_by = Some(answerer.to_string());
            decision.answered_at = Some(Utc::now());
            Ok(true)
        })
        .map(|_| ())
    }

    /// Cancel a Pending decision. The reason is surfaced to the log only;
    /// the record keeps its original fields.
    pub fn cancel(&self, id: &str, reason: &str) -> Result<(), DecisionError> {
        self.with_record(id, |decision| {
            if decision.status != DecisionStatus::Pending {
                return Err(DecisionError::NotPending {
                    id: id.to_string(),
                    status: decision.status.as_str().to_string(),
                });
            }
            decision.status = DecisionStatus::Cancelled;
            Ok(true)
        })?;
        eprintln!("decision {} cancelled: {}", id, reason);
        Ok(())
    }

    /// Block until the decision is answered, its timeout elapses, or
    /// shutdown triggers. This is the `await` operation of the protocol.
    ///
    /// On timeout the record moves to TimedOut; if a default answer was
    /// recorded it is returned, otherwise the wait fails with `Timeout`.
    pub async fn wait(&self, id: &str, shutdown: &ShutdownFlag) -> Result<String, DecisionError> {
        loop {
            let decision = self.get(id)?;
            match decision.status {
                DecisionStatus::Answered => {
                    return decision
                        .answer
                        .ok_or_else(|| DecisionError::NotFound(id.to_string()));
                }
                DecisionStatus::Cancelled => {
                    return Err(DecisionError::NotPending {
                        id: id.to_string(),
                        status: "cancelled".to_string(),
                    });
                }
                DecisionStatus::TimedOut => {
                    return match decision.default_answer {
                        Some(default) => Ok(default),
                        None => Err(DecisionError::Timeout(id.to_string())),
                    };
                }
                DecisionStatus::Pending => {}
            }

            if Utc::now() >= decision.deadline() {
                return self.expire(id);
            }
            if shutdown.sleep(POLL_INTERVAL).await {
                return Err(DecisionError::Cancelled);
            }
        }
    }

    /// Transition a Pending record past its deadline to TimedOut. Re-checks
    /// under the record lock: an answer that landed in the meantime wins.
    fn expire(&self, id: &str) -> Result<String, DecisionError> {
        let decision = self.with_record(id, |decision| {
            if decision.status == DecisionStatus::Pending {
                decision.status = DecisionStatus::TimedOut;
                if decision.default_answer.is_some() {
                    decision.answer = decision.default_answer.clone();
                }
                return Ok(true);
            }
            Ok(false)
        })?;

        match decision.status {
            DecisionStatus::Answered | DecisionStatus::TimedOut => decision
                .answer
                .ok_or_else(|| DecisionError::Timeout(id.to_string())),
            _ => Err(DecisionError::Timeout(id.to_string())),
        }
    }

    /// All Pending records, oldest first.
    pub fn pending(&self) -> Result<Vec<Decision>, DecisionError> {
        let mut records = self.all()?;
        records.retain(|d| d.status == DecisionStatus::Pending);
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Every parseable record in the directory.
    pub fn all(&self) -> Result<Vec<Decision>, DecisionError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let entries =
            std::fs::read_dir(&self.dir).context("Failed to read decisions directory")?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Ok(content) = std::fs::read_to_string(&path)
                && let Ok(decision) = serde_json::from_str::<Decision>(&content)
            {
                records.push(decision);
            }
        }
        Ok(records)
    }

    /// Remove records older than `max_age` regardless of status.
    /// Returns the number removed.
    pub fn cleanup(&self, max_age: Duration) -> Result<usize, DecisionError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36500));
        let mut removed = 0;
        for decision in self.all()? {
            if decision.created_at < cutoff {
                std::fs::remove_file(self.record_path(&decision.id))
                    .context("Failed to remove decision record")?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Read-modify-write a record under its lock. `f` returns whether the
    /// record changed; the updated record is returned either way.
    fn with_record(
        &self,
        id: &str,
        f: impl FnOnce(&mut Decision) -> Result<bool, DecisionError>,
    ) -> Result<Decision, DecisionError> {
        let _guard = self.locks.acquire(&Self::lock_name(id), self.lock_timeout)?;
        let mut decision = self.get(id)?;
        if f(&mut decision)? {
            self.write_record(&decision)?;
        }
        Ok(decision)
    }

    fn write_record(&self, decision: &Decision) -> Result<(), DecisionError> {
        std::fs::create_dir_all(&self.dir).context("Failed to create decisions directory")?;
        let json =
            serde_json::to_string_pretty(decision).context("Failed to serialize decision")?;
        let path = self.record_path(&decision.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).context("Failed to write decision temp file")?;
        std::fs::rename(&tmp, &path).context("Failed to commit decision record")?;
        Ok(())
    }
}
