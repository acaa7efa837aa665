//! Table output formatting for CLI commands
//!
//! Colored status tables for the dispatcher using comfy-table.

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use std::env;

use crate::application::orchestrator::{DispatchReport, DispatchStatus};

/// Table formatter for CLI output
pub struct TableFormatter {
    /// Whether to use colors in output
    use_colors: bool,
}

impl TableFormatter {
    pub fn new() -> Self {
        Self {
            use_colors: supports_color(),
        }
    }

    pub const fn with_colors(use_colors: bool) -> Self {
        Self { use_colors }
    }

    /// One row per worker with its queues and health.
    pub fn format_status(&self, status: &DispatchStatus) -> String {
        let mut table = self.create_base_table();
        table.set_header(vec![
            Cell::new("Worker").add_attribute(Attribute::Bold),
            Cell::new("Kind").add_attribute(Attribute::Bold),
            Cell::new("Connection").add_attribute(Attribute::Bold),
            Cell::new("State").add_attribute(Attribute::Bold),
            Cell::new("Tests").add_attribute(Attribute::Bold),
            Cell::new("Traces").add_attribute(Attribute::Bold),
            Cell::new("Errors").add_attribute(Attribute::Bold),
        ]);

        for row in &status.workers {
            let errors = Cell::new(row.status.error_count);
            let errors = if self.use_colors && row.status.error_count > 0 {
                errors.fg(Color::Red)
            } else {
                errors
            };
            let state = Cell::new(row.state);
            let state = match (self.use_colors, row.status.active) {
                (true, true) => state.fg(Color::Green),
                (true, false) => state.fg(Color::DarkGrey),
                (false, _) => state,
            };
            table.add_row(vec![
                Cell::new(row.id),
                Cell::new(row.kind.label()),
                Cell::new(&row.connection),
                state,
                Cell::new(row.status.test_case_count),
                Cell::new(row.status.trace_count),
                errors,
            ]);
        }
        table.to_string()
    }

    /// Run totals.
    pub fn format_report(&self, report: &DispatchReport) -> String {
        let mut table = self.create_base_table();
        let status = &report.status;
        let rows = [
            ("Run root", report.run_root.display().to_string()),
            ("Targets finished", report.targets_finished.to_string()),
            ("Ticks", report.ticks.to_string()),
            ("Last target", status.target.clone().unwrap_or_else(|| "-".into())),
            ("Test cases", status.tests_total.to_string()),
            ("Duplicate test cases", status.duplicate_tests.to_string()),
            ("Unique traces", status.traces_total.to_string()),
        ];
        for (label, value) in rows {
            table.add_row(vec![Cell::new(label).add_attribute(Attribute::Bold), Cell::new(value)]);
        }
        table.to_string()
    }

    fn create_base_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        if !self.use_colors {
            table.force_no_tty();
        }
        table
    }
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn supports_color() -> bool {
    // Respect NO_COLOR environment variable
    if env::var("NO_COLOR").is_ok() {
        return false;
    }
    console::Term::stdout().features().colors_supported()
}
