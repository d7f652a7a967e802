//! The claim protocol.
//!
//! Every operation here is a single `StateStore::mutate` transaction, so all
//! claim-path writes are serialized by the state mutex and the preconditions
//! are re-checked at commit time. Two workers racing for the same feature
//! therefore see exactly one success.
//!
//! Notifications are emitted after a successful commit; a notification can
//! never reference a transition that has not persisted, and a notification
//! failure never rolls back state.

use crate::catalog::Catalog;
use crate::errors::ClaimError;
use crate::notify::{Notifier, ProgressCounts};
use crate::state::{CiStatus, FeatureStatus, StateDocument};
use crate::store::StateStore;
use chrono::Utc;
use std::sync::Arc;

pub struct ClaimManager {
    store: Arc<StateStore>,
    catalog: Arc<Catalog>,
    notifier: Arc<dyn Notifier>,
    branch_prefix: String,
}

impl ClaimManager {
    pub fn new(
        store: Arc<StateStore>,
        catalog: Arc<Catalog>,
        notifier: Arc<dyn Notifier>,
        branch_prefix: &str,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
            branch_prefix: branch_prefix.to_string(),
        }
    }

    /// Ids that are Pending with every dependency Completed, ordered by
    /// ascending `(priority, id)` for deterministic selection.
    pub fn claimable_ids(&self) -> Result<Vec<String>, ClaimError> {
        let doc = self.store.snapshot()?;
        Ok(self.claimable_in(&doc))
    }

    fn claimable_in(&self, doc: &StateDocument) -> Vec<String> {
        let mut candidates: Vec<(i32, String)> = doc
            .features
            .iter()
            .filter(|f| f.status == FeatureStatus::Pending)
            .filter(|f| self.dependencies_met(doc, &f.id))
            .filter_map(|f| self.catalog.get(&f.id).map(|spec| (spec.priority, f.id.clone())))
            .collect();
        candidates.sort();
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    fn dependencies_met(&self, doc: &StateDocument, id: &str) -> bool {
        self.catalog
            .get(id)
            .map(|spec| {
                spec.depends_on.iter().all(|dep| {
                    doc.get(dep)
                        .is_some_and(|d| d.status == FeatureStatus::Completed)
                })
            })
            .unwrap_or(false)
    }

    /// Claim a specific feature for a worker.
    ///
    /// Preconditions (re-checked at commit time): status is Pending and
    /// every dependency is Completed. On success the feature moves to
    /// InProgress with claim fields set and a branch assigned.
    pub fn claim(&self, id: &str, worker: &str) -> Result<(), ClaimError> {
        let branch = self.branch_name(id);
        self.store
            .mutate(|doc| self.apply_claim(doc, id, worker, &branch))?;
        self.notifier.notify_claimed(id, worker);
        Ok(())
    }

    fn apply_claim(
        &self,
        doc: &mut StateDocument,
        id: &str,
        worker: &str,
        branch: &str,
    ) -> Result<(), ClaimError> {
        if self.catalog.get(id).is_none() {
            return Err(ClaimError::UnknownFeature(id.to_string()));
        }
        let status = doc
            .get(id)
            .map(|f| f.status)
            .ok_or_else(|| ClaimError::UnknownFeature(id.to_string()))?;
        if status != FeatureStatus::Pending {
            return Err(ClaimError::Unavailable {
                id: id.to_string(),
                reason: format!("status is {}", status),
            });
        }
        if !self.dependencies_met(doc, id) {
            return Err(ClaimError::Unavailable {
                id: id.to_string(),
                reason: "dependencies are not completed".to_string(),
            });
        }

        let feature = doc.get_mut(id).expect("presence checked above");
        feature.status = FeatureStatus::InProgress;
        feature.claimed_by = Some(worker.to_string());
        feature.claimed_at = Some(Utc::now());
        if feature.branch.is_none() {
            feature.branch = Some(branch.to_string());
        }
        Ok(())
    }

    /// Claim the best available feature: lowest priority value, ties broken
    /// by ascending id. Returns `None` when nothing is claimable.
    pub fn claim_next(&self, worker: &str) -> Result<Option<String>, ClaimError> {
        let claimed = self.store.mutate(|doc| -> Result<Option<String>, ClaimError> {
            let Some(id) = self.claimable_in(doc).into_iter().next() else {
                return Ok(None);
            };
            let branch = self.branch_name(&id);
            self.apply_claim(doc, &id, worker, &branch)?;
            Ok(Some(id))
        })?;
        if let Some(ref id) = claimed {
            self.notifier.notify_claimed(id, worker);
        }
        Ok(claimed)
    }

    /// Return an InProgress feature to Pending, clearing the claim fields.
    /// Used by the reaper for stale claims and by workers backing out.
    pub fn release(&self, id: &str, reason: &str) -> Result<(), ClaimError> {
        self.store.mutate(|doc| {
            let feature = doc
                .get_mut(id)
                .ok_or_else(|| ClaimError::UnknownFeature(id.to_string()))?;
            if feature.status != FeatureStatus::InProgress {
                return Err(ClaimError::NotInProgress {
                    id: id.to_string(),
                    status: feature.status.to_string(),
                });
            }
            feature.status = FeatureStatus::Pending;
            feature.clear_claim();
            Ok(())
        })?;
        self.notifier.notify_released(id, reason);
        Ok(())
    }

    /// Mark an InProgress feature Completed.
    pub fn complete(&self, id: &str, pr_url: Option<&str>) -> Result<(), ClaimError> {
        self.store.mutate(|doc| {
            let feature = doc
                .get_mut(id)
                .ok_or_else(|| ClaimError::UnknownFeature(id.to_string()))?;
            if feature.status != FeatureStatus::InProgress {
                return Err(ClaimError::NotInProgress {
                    id: id.to_string(),
                    status: feature.status.to_string(),
                });
            }
            feature.status = FeatureStatus::Completed;
            feature.completed_at = Some(Utc::now());
            if let Some(url) = pr_url {
                feature.pr_url = Some(url.to_string());
            }
            feature.clear_claim();
            Ok(())
        })?;
        self.notifier.notify_completed(id, pr_url);
        Ok(())
    }

    /// Block a Pending or InProgress feature with a reason. Blocked is
    /// terminal unless explicitly reset.
    pub fn block(&self, id: &str, reason: &str) -> Result<(), ClaimError> {
        self.store.mutate(|doc| {
            let feature = doc
                .get_mut(id)
                .ok_or_else(|| ClaimError::UnknownFeature(id.to_string()))?;
            if !matches!(
                feature.status,
                FeatureStatus::Pending | FeatureStatus::InProgress
            ) {
                return Err(ClaimError::Unavailable {
                    id: id.to_string(),
                    reason: format!("cannot block from status {}", feature.status),
                });
            }
            feature.status = FeatureStatus::Blocked;
            feature.blocked_reason = Some(reason.to_string());
            feature.clear_claim();
            Ok(())
        })?;
        self.notifier.notify_blocked(id, reason);
        Ok(())
    }

    /// Explicitly reset a Blocked feature back to Pending.
    pub fn reset(&self, id: &str) -> Result<(), ClaimError> {
        self.store.mutate(|doc| {
            let feature = doc
                .get_mut(id)
                .ok_or_else(|| ClaimError::UnknownFeature(id.to_string()))?;
            if feature.status != FeatureStatus::Blocked {
                return Err(ClaimError::Unavailable {
                    id: id.to_string(),
                    reason: format!("cannot reset from status {}", feature.status),
                });
            }
            feature.status = FeatureStatus::Pending;
            feature.blocked_reason = None;
            Ok(())
        })?;
        Ok(())
    }

    /// Record an observed CI status; `increment` bumps the failure counter.
    pub fn update_ci(&self, id: &str, status: CiStatus, increment: bool) -> Result<(), ClaimError> {
        self.store.mutate(|doc| {
            let feature = doc
                .get_mut(id)
                .ok_or_else(|| ClaimError::UnknownFeature(id.to_string()))?;
            feature.ci_status = status;
            if increment {
                feature.ci_attempts += 1;
            }
            Ok::<(), ClaimError>(())
        })?;
        Ok(())
    }

    /// Current per-status counts.
    pub fn counts(&self) -> Result<ProgressCounts, ClaimError> {
        Ok(ProgressCounts::from_document(&self.store.snapshot()?))
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    fn branch_name(&self, id: &str) -> String {
        format!("{}/{}", self.branch_prefix, id)
    }
}
