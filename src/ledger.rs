//! Append-only cost ledger and daily budget gate.
//!
//! One CSV record per builder invocation, fields in fixed order:
//! ISO-8601 timestamp, worker id, feature id, input tokens, output tokens,
//! cost. The file is never rewritten in place; the daily total is computed
//! online by summing records whose timestamp falls within the current UTC
//! day, so the gate reopens on day rollover without a restart.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One ledger record.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub worker: String,
    pub feature: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

impl LedgerEntry {
    fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{},{:.6}\n",
            self.timestamp.to_rfc3339(),
            self.worker,
            self.feature,
            self.tokens_in,
            self.tokens_out,
            self.cost
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 6 {
            return None;
        }
        Some(Self {
            timestamp: DateTime::parse_from_rfc3339(parts[0])
                .ok()?
                .with_timezone(&Utc),
            worker: parts[1].to_string(),
            feature: parts[2].to_string(),
            tokens_in: parts[3].parse().ok()?,
            tokens_out: parts[4].parse().ok()?,
            cost: parts[5].parse().ok()?,
        })
    }
}

/// Append-only cost ledger with static per-token prices.
#[derive(Debug, Clone)]
pub struct CostLedger {
    path: PathBuf,
    cost_per_input_token: f64,
    cost_per_output_token: f64,
    max_daily_cost: f64,
}

impl CostLedger {
    pub fn new(
        path: &Path,
        cost_per_input_token: f64,
        cost_per_output_token: f64,
        max_daily_cost: f64,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            cost_per_input_token,
            cost_per_output_token,
            max_daily_cost,
        }
    }

    /// Compute the cost for a token count pair and append a record.
    pub fn record(
        &self,
        worker: &str,
        feature: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry {
            timestamp: Utc::now(),
            worker: worker.to_string(),
            feature: feature.to_string(),
            tokens_in,
            tokens_out,
            cost: tokens_in as f64 * self.cost_per_input_token
                + tokens_out as f64 * self.cost_per_output_token,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create ledger directory")?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open ledger: {}", self.path.display()))?
            .write_all(entry.to_line().as_bytes())
            .context("Failed to append ledger entry")?;

        Ok(entry)
    }

    /// All parseable entries, in append order. A missing file is empty.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read ledger: {}", self.path.display()))?;
        Ok(content.lines().filter_map(LedgerEntry::parse).collect())
    }

    /// Sum of today's entries (UTC day).
    pub fn daily_total(&self) -> Result<f64> {
        let today = Utc::now();
        Ok(self
            .entries()?
            .iter()
            .filter(|e| {
                e.timestamp.year() == today.year() && e.timestamp.ordinal() == today.ordinal()
            })
            .map(|e| e.cost)
            .sum())
    }

    /// True iff today's total is under the configured cap.
    ///
    /// A cap of zero (or less) disables the gate entirely.
    pub fn within_budget(&self) -> Result<bool> {
        if self.max_daily_cost <= 0.0 {
            return Ok(true);
        }
        Ok(self.daily_total()? < self.max_daily_cost)
    }

    pub fn max_daily_cost(&self) -> f64 {
        self.max_daily_cost
    }
}
