//! Live progress line for interactive dispatch runs.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

use crate::application::orchestrator::DispatchStatus;

const SPINNER_TEMPLATE: &str = "[{elapsed_precise}] {spinner:.green} {msg}";
const SPINNER_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// One-line summary of a status snapshot.
pub fn status_line(status: &DispatchStatus) -> String {
    let mut line = format!(
        "{} | tests {}/{} | traces {}/{} | workers {}",
        status.target.as_deref().unwrap_or("-"),
        status.tests_left,
        status.tests_total,
        status.traces_left,
        status.traces_total,
        status.workers.len(),
    );
    let errors: usize = status.workers.iter().map(|w| w.status.error_count).sum();
    if errors > 0 {
        line.push_str(&format!(" | errors {errors}"));
    }
    line
}

/// Spinner that tracks the dispatcher tick by tick.
pub struct DispatchProgress {
    bar: ProgressBar,
}

impl DispatchProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template(SPINNER_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars(SPINNER_CHARS);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        bar.set_message("starting dispatcher");
        Self { bar }
    }

    /// A progress line that draws nothing.
    pub fn hidden() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden());
        Self { bar }
    }

    pub fn update(&self, status: &DispatchStatus) {
        self.bar.set_message(status_line(status));
    }

    pub fn finish(&self, targets_finished: usize) {
        self.bar
            .finish_with_message(format!("✓ {targets_finished} target(s) finished"));
    }

    pub fn fail(&self, reason: &str) {
        self.bar.abandon_with_message(format!("✗ {reason}"));
    }

    pub fn message(&self) -> String {
        self.bar.message()
    }

    pub fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

impl Default for DispatchProgress {
    fn default() -> Self {
        Self::new()
    }
}
