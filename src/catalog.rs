//! Static feature catalog loading.
//!
//! The catalog is the source-controlled, read-only input: a `features.json`
//! document describing every unit of work with its dependencies and builder
//! hints. It is loaded once and never modified at runtime; all mutable
//! bookkeeping lives in the separate state document (see `state`).

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Workflow hint forwarded opaquely to the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    /// Test-first implementation
    Tdd,
    /// Straight implementation
    #[default]
    Direct,
    /// Documentation work
    Docs,
    /// Anything else
    Other,
}

/// A single feature specification.
///
/// `id` and `depends_on` are immutable after load; the hint fields are opaque
/// and passed through to the builder prompt verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureSpec {
    /// Stable short identifier, unique across the catalog
    pub id: String,
    /// Human label
    pub name: String,
    /// Feature ids that must be Completed before this one may be claimed
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lower is higher priority for claim tie-breaking
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub workflow_type: WorkflowType,
    /// Opaque builder hints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<String>,
}

fn default_priority() -> i32 {
    100
}

impl FeatureSpec {
    /// Create a spec with the given id, name, dependencies, and priority.
    pub fn new(id: &str, name: &str, depends_on: Vec<String>, priority: i32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            depends_on,
            priority,
            workflow_type: WorkflowType::default(),
            api_endpoints: Vec::new(),
            packages: Vec::new(),
            env_vars: Vec::new(),
        }
    }
}

/// A labelled set of feature ids exercised by a downstream integration phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrationTest {
    pub name: String,
    pub features: Vec<String>,
}

/// The full catalog document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub features: Vec<FeatureSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integration_tests: Vec<IntegrationTest>,
}

impl Catalog {
    /// Load and validate a catalog from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
        let catalog: Catalog = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog JSON: {}", path.display()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Save the catalog to a JSON file (used by `foreman init`).
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize catalog to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write catalog file: {}", path.display()))?;
        Ok(())
    }

    /// Check structural validity: unique ids, dependencies reference known ids.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashMap::new();
        for (i, feature) in self.features.iter().enumerate() {
            if let Some(prev) = seen.insert(feature.id.clone(), i) {
                bail!(
                    "Duplicate feature id '{}' (entries {} and {})",
                    feature.id,
                    prev,
                    i
                );
            }
        }
        for feature in &self.features {
            for dep in &feature.depends_on {
                if !seen.contains_key(dep) {
                    bail!(
                        "Unknown dependency '{}' in feature '{}': no feature with that id exists",
                        dep,
                        feature.id
                    );
                }
            }
        }
        Ok(())
    }

    /// Look up a feature by id.
    pub fn get(&self, id: &str) -> Option<&FeatureSpec> {
        self.features.iter().find(|f| f.id == id)
    }

    /// All feature ids in catalog order.
    pub fn ids(&self) -> Vec<String> {
        self.features.iter().map(|f| f.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sample_catalog_json() -> &'static str {
        r#"{
            "features": [
                {
                    "id": "db",
                    "name": "Database schema",
                    "depends_on": [],
                    "priority": 1,
                    "workflow_type": "direct"
                },
                {
                    "id": "auth",
                    "name": "Authentication",
                    "depends_on": ["db"],
                    "priority": 2,
                    "workflow_type": "tdd",
                    "api_endpoints": ["POST /login"],
                    "packages": ["argon2"],
                    "env_vars": ["JWT_SECRET"]
                }
            ],
            "integration_tests": [
                { "name": "login-flow", "features": ["db", "auth"] }
            ]
        }"#
    }

    #[test]
    fn test_load_catalog() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("features.json");
        fs::write(&path, sample_catalog_json()).unwrap();

        let catalog = Catalog::load(&path).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.features[0].id, "db");
        assert_eq!(catalog.features[1].workflow_type, WorkflowType::Tdd);
        assert_eq!(catalog.features[1].depends_on, vec!["db"]);
        assert_eq!(catalog.integration_tests.len(), 1);
        assert_eq!(catalog.integration_tests[0].features, vec!["db", "auth"]);
    }

    #[test]
    fn test_defaults_applied() {
        let json = r#"{ "features": [{ "id": "a", "name": "A" }] }"#;
        let catalog: Catalog = serde_json::from_str(json).unwrap();
        let f = &catalog.features[0];
        assert!(f.depends_on.is_empty());
        assert_eq!(f.priority, 100);
        assert_eq!(f.workflow_type, WorkflowType::Direct);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let catalog = Catalog {
            features: vec![
                FeatureSpec::new("a", "A", vec![], 1),
                FeatureSpec::new("a", "A again", vec![], 2),
            ],
            integration_tests: Vec::new(),
        };
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let catalog = Catalog {
            features: vec![FeatureSpec::new("a", "A", vec!["ghost".into()], 1)],
            integration_tests: Vec::new(),
        };
        let err = catalog.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Catalog::load(Path::new("/nonexistent/features.json"));
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read catalog file")
        );
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("features.json");

        let catalog = Catalog {
            features: vec![
                FeatureSpec::new("x", "X", vec![], 1),
                FeatureSpec::new("y", "Y", vec!["x".into()], 2),
            ],
            integration_tests: Vec::new(),
        };
        catalog.save(&path).unwrap();

        let loaded = Catalog::load(&path).unwrap();
        assert_eq!(loaded.features, catalog.features);
    }
}
