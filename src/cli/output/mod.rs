//! CLI output formatting module
//!
//! Human-readable rendering by default, JSON with `--json`.

pub mod progress;
pub mod table;

use serde::Serialize;

use crate::application::DispatchReport;

pub use table::TableFormatter;

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;
    fn to_json(&self) -> serde_json::Value;
}

pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result.to_json()).unwrap_or_default());
    } else {
        println!("{}", result.to_human());
    }
}

impl CommandOutput for DispatchReport {
    fn to_human(&self) -> String {
        TableFormatter::new().format_report(self)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
