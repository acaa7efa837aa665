//! Point-in-time view of a dispatch run.

use comfy_table::{presets, Cell, ContentArrangement, Table};
use serde::Serialize;

use crate::domain::models::worker::{WorkerId, WorkerKind, WorkerStatus};

#[derive(Debug, Clone, Serialize)]
pub struct WorkerRow {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub connection: String,
    pub state: &'static str,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStatus {
    pub target: Option<String>,
    pub elapsed_secs: u64,
    pub tests_left: usize,
    pub tests_total: u64,
    pub duplicate_tests: u64,
    pub traces_left: usize,
    pub traces_total: usize,
    pub workers: Vec<WorkerRow>,
}

impl DispatchStatus {
    /// Summary row followed by one row per worker.
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(presets::ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["worker", "state", "tc/tr", "errors", "active"]);

        table.add_row(vec![
            Cell::new(format!(
                "{} ({}s)",
                self.target.as_deref().unwrap_or("-"),
                self.elapsed_secs
            )),
            Cell::new("pools"),
            Cell::new(format!(
                "{}/{} | {}/{}",
                self.tests_left, self.tests_total, self.traces_left, self.traces_total
            )),
            Cell::new(format!("{} dup", self.duplicate_tests)),
            Cell::new(""),
        ]);

        for row in &self.workers {
            table.add_row(vec![
                Cell::new(format!("{}-[{}] {}", row.id, row.kind.label(), row.connection)),
                Cell::new(row.state),
                Cell::new(format!(
                    "{}/{}",
                    row.status.test_case_count, row.status.trace_count
                )),
                Cell::new(row.status.error_count),
                Cell::new(if row.status.active { "yes" } else { "no" }),
            ]);
        }
        table
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.table())
    }
}
