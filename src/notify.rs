//! Notification sink.
//!
//! Transport (chat platform, issue tracker) is out of scope; the core emits
//! structured events through this trait after each committed state
//! transition. Delivery failure never rolls back a state change, so every
//! method is infallible fire-and-forget.

use crate::state::{FeatureStatus, StateDocument};
use console::style;

/// Per-status feature counts for progress notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
}

impl ProgressCounts {
    pub fn from_document(doc: &StateDocument) -> Self {
        Self {
            pending: doc.count(FeatureStatus::Pending),
            in_progress: doc.count(FeatureStatus::InProgress),
            completed: doc.count(FeatureStatus::Completed),
            blocked: doc.count(FeatureStatus::Blocked),
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.blocked
    }
}

/// Sink for orchestration events.
pub trait Notifier: Send + Sync {
    fn notify_started(&self, total_features: usize);
    fn notify_claimed(&self, id: &str, worker: &str);
    fn notify_completed(&self, id: &str, pr_url: Option<&str>);
    fn notify_blocked(&self, id: &str, reason: &str);
    fn notify_released(&self, id: &str, reason: &str);
    fn notify_decision_needed(&self, decision_id: &str, question: &str, options: &[String]);
    fn notify_progress(&self, counts: &ProgressCounts);
    fn notify_cost(&self, amount: f64, cap: f64);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify_started(&self, _total_features: usize) {}
    fn notify_claimed(&self, _id: &str, _worker: &str) {}
    fn notify_completed(&self, _id: &str, _pr_url: Option<&str>) {}
    fn notify_blocked(&self, _id: &str, _reason: &str) {}
    fn notify_released(&self, _id: &str, _reason: &str) {}
    fn notify_decision_needed(&self, _decision_id: &str, _question: &str, _options: &[String]) {}
    fn notify_progress(&self, _counts: &ProgressCounts) {}
    fn notify_cost(&self, _amount: f64, _cap: f64) {}
}

/// Prints styled event lines to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify_started(&self, total_features: usize) {
        eprintln!(
            "{} run started with {} features",
            style("▶").cyan(),
            total_features
        );
    }

    fn notify_claimed(&self, id: &str, worker: &str) {
        eprintln!("{} {} claimed by {}", style("●").cyan(), style(id).bold(), worker);
    }

    fn notify_completed(&self, id: &str, pr_url: Option<&str>) {
        match pr_url {
            Some(url) => eprintln!(
                "{} {} completed ({})",
                style("✔").green(),
                style(id).bold(),
                url
            ),
            None => eprintln!("{} {} completed", style("✔").green(), style(id).bold()),
        }
    }

    fn notify_blocked(&self, id: &str, reason: &str) {
        eprintln!(
            "{} {} blocked: {}",
            style("✖").red(),
            style(id).bold(),
            reason
        );
    }

    fn notify_released(&self, id: &str, reason: &str) {
        eprintln!(
            "{} {} released back to pending ({})",
            style("↩").yellow(),
            style(id).bold(),
            reason
        );
    }

    fn notify_decision_needed(&self, decision_id: &str, question: &str, options: &[String]) {
        eprintln!(
            "{} decision {} needed: {} [{}]",
            style("?").magenta().bold(),
            decision_id,
            question,
            options.join(" / ")
        );
    }

    fn notify_progress(&self, counts: &ProgressCounts) {
        eprintln!(
            "{} {} pending, {} in progress, {} completed, {} blocked",
            style("≡").dim(),
            counts.pending,
            counts.in_progress,
            counts.completed,
            counts.blocked
        );
    }

    fn notify_cost(&self, amount: f64, cap: f64) {
        eprintln!(
            "{} daily cost ${:.2} of ${:.2} cap",
            style("$").yellow(),
            amount,
            cap
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_counts_from_document() {
        let mut doc = StateDocument::from_ids(&["a".into(), "b".into(), "c".into()]);
        let f = doc.get_mut("a").unwrap();
        f.status = FeatureStatus::Completed;
        f.completed_at = Some(Utc::now());
        let f = doc.get_mut("b").unwrap();
        f.status = FeatureStatus::Blocked;
        f.blocked_reason = Some("stuck".into());

        let counts = ProgressCounts::from_document(&doc);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.blocked, 1);
        assert_eq!(counts.in_progress, 0);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_null_notifier_is_inert() {
        let n = NullNotifier;
        n.notify_started(3);
        n.notify_claimed("a", "w1");
        n.notify_completed("a", Some("https://example.com/pr/1"));
        n.notify_blocked("a", "reason");
        n.notify_progress(&ProgressCounts::default());
    }
}
