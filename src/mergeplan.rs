//! Topological merge planning over completed features.
//!
//! Kahn's algorithm restricted to the Completed set: dependencies pointing
//! outside the set are ignored, waves of in-degree-zero vertices are
//! emitted in ascending id order for reproducibility, and a non-empty
//! residue after the sort is a dependency cycle, which aborts planning.

use crate::catalog::Catalog;
use crate::state::{FeatureStatus, StateDocument};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// A cycle among completed features. Planning refuses to emit an ordering.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Dependency cycle among completed features; unresolved: {residual:?}")]
pub struct CycleError {
    /// Vertices left with non-zero in-degree, ascending by id.
    pub residual: Vec<String>,
}

/// One feature in merge order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

/// A reproducible, topologically ordered merge plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MergePlan {
    pub entries: Vec<MergeEntry>,
}

impl MergePlan {
    pub fn ordered_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the merge-plan document. Features without a PR get a
    /// manual-merge stanza.
    pub fn render_markdown(&self, base_branch: &str) -> String {
        let mut out = String::from("# Merge Plan\n\n");
        if self.entries.is_empty() {
            out.push_str("No completed features to merge.\n");
            return out;
        }
        out.push_str(&format!(
            "Merge into `{}` in the following order:\n\n",
            base_branch
        ));
        for (i, entry) in self.entries.iter().enumerate() {
            let branch = entry.branch.as_deref().unwrap_or("(no branch recorded)");
            match &entry.pr_url {
                Some(url) => {
                    out.push_str(&format!(
                        "{}. **{}** — branch `{}` — {}\n",
                        i + 1,
                        entry.id,
                        branch,
                        url
                    ));
                }
                None => {
                    out.push_str(&format!(
                        "{}. **{}** — branch `{}`\n   - Manual merge required: no PR was recorded. \
                         Merge `{}` into `{}` by hand and verify CI before continuing.\n",
                        i + 1,
                        entry.id,
                        branch,
                        branch,
                        base_branch
                    ));
                }
            }
        }
        out
    }
}

/// Compute the merge plan for every feature currently Completed.
pub fn plan(catalog: &Catalog, doc: &StateDocument) -> Result<MergePlan, CycleError> {
    let completed: BTreeSet<&str> = doc
        .features
        .iter()
        .filter(|f| f.status == FeatureStatus::Completed)
        .map(|f| f.id.as_str())
        .collect();

    // In-degree and adjacency restricted to the completed set.
    let mut in_degree: BTreeMap<&str, usize> = completed.iter().map(|&id| (id, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for &id in &completed {
        let Some(spec) = catalog.get(id) else { continue };
        for dep in &spec.depends_on {
            if completed.contains(dep.as_str()) {
                *in_degree.get_mut(id).expect("id is in the completed set") += 1;
                dependents.entry(dep.as_str()).or_default().push(id);
            }
        }
    }

    let mut order: Vec<&str> = Vec::with_capacity(completed.len());
    // BTreeMap iteration makes each wave come out ascending by id.
    let mut wave: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    while !wave.is_empty() {
        let mut next_wave = BTreeSet::new();
        for &id in &wave {
            order.push(id);
            for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                let deg = in_degree
                    .get_mut(dependent)
                    .expect("dependent is in the completed set");
                *deg -= 1;
                if *deg == 0 {
                    next_wave.insert(dependent);
                }
            }
        }
        wave = next_wave.into_iter().collect();
    }

    if order.len() != completed.len() {
        let residual: Vec<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(CycleError { residual });
    }

    let entries = order
        .into_iter()
        .map(|id| {
            let feature = doc.get(id).expect("id came from the document");
            MergeEntry {
                id: id.to_string(),
                branch: feature.branch.clone(),
                pr_url: feature.pr_url.clone(),
            }
        })
        .collect();
    Ok(MergePlan { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FeatureSpec;
    use chrono::Utc;

    fn catalog(specs: Vec<(&str, Vec<&str>)>) -> Catalog {
        Catalog {
            features: specs
                .into_iter()
                .map(|(id, deps)| {
                    FeatureSpec::new(id, id, deps.into_iter().map(String::from).collect(), 1)
                })
                .collect(),
            integration_tests: Vec::new(),
        }
    }

    fn completed_doc(catalog: &Catalog, ids: &[&str]) -> StateDocument {
        let mut doc = StateDocument::from_ids(&catalog.ids());
        for id in ids {
            let f = doc.get_mut(id).unwrap();
            f.status = FeatureStatus::Completed;
            f.completed_at = Some(Utc::now());
            f.branch = Some(format!("feature/{}", id));
        }
        doc
    }

    #[test]
    fn test_linear_chain_order() {
        let cat = catalog(vec![("a", vec![]), ("b", vec!["a"]), ("c", vec!["b"])]);
        let doc = completed_doc(&cat, &["a", "b", "c"]);

        let plan = plan(&cat, &doc).unwrap();
        assert_eq!(plan.ordered_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_completed_set() {
        let cat = catalog(vec![("a", vec![])]);
        let doc = StateDocument::from_ids(&cat.ids());

        let plan = plan(&cat, &doc).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_dependencies_outside_completed_set_ignored() {
        // b depends on a, but only b is completed: a's edge is out of scope.
        let cat = catalog(vec![("a", vec![]), ("b", vec!["a"])]);
        let doc = completed_doc(&cat, &["b"]);

        let plan = plan(&cat, &doc).unwrap();
        assert_eq!(plan.ordered_ids(), vec!["b"]);
    }

    #[test]
    fn test_same_wave_sorted_by_id() {
        let cat = catalog(vec![
            ("root", vec![]),
            ("zeta", vec!["root"]),
            ("alpha", vec!["root"]),
            ("mid", vec!["root"]),
        ]);
        let doc = completed_doc(&cat, &["root", "zeta", "alpha", "mid"]);

        let plan = plan(&cat, &doc).unwrap();
        assert_eq!(plan.ordered_ids(), vec!["root", "alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_diamond_is_deterministic() {
        let cat = catalog(vec![
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["a"]),
            ("d", vec!["b", "c"]),
        ]);
        let doc = completed_doc(&cat, &["a", "b", "c", "d"]);

        let plan = plan(&cat, &doc).unwrap();
        assert_eq!(plan.ordered_ids(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_detected_and_reported() {
        // Injected pathological state: p and q completed with a mutual edge.
        let cat = catalog(vec![("p", vec!["q"]), ("q", vec!["p"])]);
        let doc = completed_doc(&cat, &["p", "q"]);

        let err = plan(&cat, &doc).unwrap_err();
        assert_eq!(err.residual, vec!["p", "q"]);
    }

    #[test]
    fn test_cycle_reports_only_cycle_members() {
        let cat = catalog(vec![
            ("ok", vec![]),
            ("p", vec!["q"]),
            ("q", vec!["p"]),
        ]);
        let doc = completed_doc(&cat, &["ok", "p", "q"]);

        let err = plan(&cat, &doc).unwrap_err();
        assert_eq!(err.residual, vec!["p", "q"]);
    }

    #[test]
    fn test_markdown_includes_pr_and_manual_stanza() {
        let cat = catalog(vec![("a", vec![]), ("b", vec!["a"])]);
        let mut doc = completed_doc(&cat, &["a", "b"]);
        doc.get_mut("a").unwrap().pr_url = Some("https://example.com/pr/1".into());

        let plan = plan(&cat, &doc).unwrap();
        let md = plan.render_markdown("main");

        assert!(md.contains("1. **a** — branch `feature/a` — https://example.com/pr/1"));
        assert!(md.contains("2. **b**"));
        assert!(md.contains("Manual merge required"));
        assert!(md.contains("`main`"));
    }

    #[test]
    fn test_markdown_empty_plan() {
        let md = MergePlan::default().render_markdown("main");
        assert!(md.contains("No completed features"));
    }
}
