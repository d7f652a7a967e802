//! Terminal progress display for `foreman run`, rendered via `indicatif`.
//!
//! Two bars are stacked: a features bar tracking terminal transitions and a
//! spinner carrying the latest activity line.

use crate::notify::ProgressCounts;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

pub struct RunUi {
    multi: MultiProgress,
    features_bar: ProgressBar,
    activity_bar: ProgressBar,
}

impl RunUi {
    pub fn new(total_features: u64) -> Self {
        let multi = MultiProgress::new();

        let features_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let features_bar = multi.add(ProgressBar::new(total_features));
        features_bar.set_style(features_style);
        features_bar.set_prefix("Features");

        let activity_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let activity_bar = multi.add(ProgressBar::new_spinner());
        activity_bar.set_style(activity_style);
        activity_bar.set_prefix("  Status");
        activity_bar.enable_steady_tick(Duration::from_millis(120));

        Self {
            multi,
            features_bar,
            activity_bar,
        }
    }

    pub fn update(&self, counts: &ProgressCounts) {
        self.features_bar
            .set_position((counts.completed + counts.blocked) as u64);
        self.features_bar.set_message(format!(
            "{} in progress, {} blocked",
            counts.in_progress, counts.blocked
        ));
    }

    pub fn activity(&self, message: &str) {
        self.activity_bar.set_message(message.to_string());
    }

    /// Print a line without tearing the bars.
    pub fn log(&self, message: &str) {
        if self.multi.println(message).is_err() {
            eprintln!("{}", message);
        }
    }

    pub fn finish(&self, message: &str) {
        self.activity_bar.finish_with_message(message.to_string());
        self.features_bar.finish();
    }
}
