//! Mutable feature state.
//!
//! One [`FeatureState`] record per catalog feature, collected in a
//! [`StateDocument`]. The document is the only shared mutable object in the
//! system; every change goes through `StateStore::mutate`, which calls
//! [`StateDocument::validate`] before anything is persisted.
//!
//! Status DFA: Pending → InProgress → {Pending, Completed, Blocked}.
//! Blocked is terminal unless explicitly reset.

use crate::errors::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Lifecycle status of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl FeatureStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Blocked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last observed CI outcome for a feature's branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    #[default]
    Unset,
    Pending,
    Passed,
    Failed,
}

/// Mutable state record for one feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureState {
    pub id: String,
    #[serde(default)]
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub ci_status: CiStatus,
    #[serde(default)]
    pub ci_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl FeatureState {
    /// Fresh Pending record for a feature id.
    pub fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: FeatureStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            completed_at: None,
            branch: None,
            pr_url: None,
            ci_status: CiStatus::Unset,
            ci_attempts: 0,
            blocked_reason: None,
        }
    }

    /// Clear the claim fields, returning the record to an unclaimed shape.
    pub fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
    }
}

/// The feature-state document, persisted as a single JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateDocument {
    pub features: Vec<FeatureState>,
}

impl StateDocument {
    /// Initialize a document from catalog ids, every feature Pending.
    pub fn from_ids(ids: &[String]) -> Self {
        Self {
            features: ids.iter().map(|id| FeatureState::pending(id)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&FeatureState> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut FeatureState> {
        self.features.iter_mut().find(|f| f.id == id)
    }

    /// Count features with the given status.
    pub fn count(&self, status: FeatureStatus) -> usize {
        self.features.iter().filter(|f| f.status == status).count()
    }

    /// Ids of features with the given status, in document order.
    pub fn ids_with_status(&self, status: FeatureStatus) -> Vec<String> {
        self.features
            .iter()
            .filter(|f| f.status == status)
            .map(|f| f.id.clone())
            .collect()
    }

    /// True when no Pending or InProgress work remains.
    pub fn is_drained(&self) -> bool {
        self.count(FeatureStatus::Pending) == 0 && self.count(FeatureStatus::InProgress) == 0
    }

    /// Validate the record-shape invariants.
    ///
    /// - ids are unique
    /// - InProgress ⇔ claimed_by and claimed_at present
    /// - Completed ⇒ completed_at present
    /// - Blocked ⇒ blocked_reason present
    pub fn validate(&self) -> Result<(), StateError> {
        let mut seen = HashSet::new();
        for feature in &self.features {
            if !seen.insert(feature.id.as_str()) {
                return Err(StateError::DuplicateFeature(feature.id.clone()));
            }

            let claimed = feature.claimed_by.is_some() && feature.claimed_at.is_some();
            match feature.status {
                FeatureStatus::InProgress => {
                    if !claimed {
                        return Err(StateError::InvariantViolation(format!(
                            "feature '{}' is in_progress without claim fields",
                            feature.id
                        )));
                    }
                }
                _ => {
                    if feature.claimed_by.is_some() || feature.claimed_at.is_some() {
                        return Err(StateError::InvariantViolation(format!(
                            "feature '{}' carries claim fields while {}",
                            feature.id, feature.status
                        )));
                    }
                }
            }

            if feature.status == FeatureStatus::Completed && feature.completed_at.is_none() {
                return Err(StateError::InvariantViolation(format!(
                    "feature '{}' is completed without completed_at",
                    feature.id
                )));
            }

            if feature.status == FeatureStatus::Blocked && feature.blocked_reason.is_none() {
                return Err(StateError::InvariantViolation(format!(
                    "feature '{}' is blocked without a reason",
                    feature.id
                )));
            }
        }
        Ok(())
    }
}
