//! Output formatting for CLI

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use edharness_common::{CompileStatus, TestRunStatus};
use edharness_runner::{InstanceHandle, ProvisionReport, ResyncOutcome};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// Plain `key: value` lines
    Plain,
}

/// Items that render as a two-column key/value table
pub trait TableDisplay {
    fn fields(&self) -> Vec<(&'static str, String)>;
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Field", "Value"]);
            for (key, value) in item.fields() {
                table.add_row(vec![key.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item).unwrap_or_default());
        }
        OutputFormat::Plain => {
            for (key, value) in item.fields() {
                println!("{}: {}", key, value);
            }
        }
    }
}

/// Print a simple message
pub fn print_message(message: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "message": message }));
        }
        _ => {
            println!("{}", message);
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

fn or_dash(value: Option<impl ToString>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

impl TableDisplay for ProvisionReport {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Path", self.path.display().to_string()),
            ("State before", format!("{:?}", self.state_before)),
            ("Files copied", self.files_copied.to_string()),
            ("Files removed", self.files_removed.to_string()),
        ]
    }
}

impl TableDisplay for InstanceHandle {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("PID", or_dash(self.pid)),
            ("Port", self.port.to_string()),
            ("State", self.state.to_string()),
            ("Log", self.log_path.display().to_string()),
            ("Started", self.started_at.to_rfc3339()),
        ]
    }
}

impl TableDisplay for ResyncOutcome {
    fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            ResyncOutcome::Skipped => vec![("Result", "skipped".to_string())],
            ResyncOutcome::Clean => vec![("Result", "clean".to_string())],
            ResyncOutcome::Refreshed { refreshes } => vec![
                ("Result", "refreshed".to_string()),
                ("Refreshes", refreshes.to_string()),
            ],
            ResyncOutcome::BestEffort { reason } => vec![
                ("Result", "best effort".to_string()),
                ("Reason", reason.clone()),
            ],
        }
    }
}

/// Both status endpoints of one editor
#[derive(Debug, Serialize)]
pub struct EditorStatusView {
    pub port: u16,
    pub compile: CompileStatus,
    pub tests: TestRunStatus,
}

impl TableDisplay for EditorStatusView {
    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("Port", self.port.to_string()),
            ("Compile status", self.compile.status.clone()),
            ("Compiling", self.compile.is_compiling.to_string()),
            ("Last compile", or_dash(self.compile.last_compile_time.as_ref())),
            ("Compile errors", self.compile.errors.len().to_string()),
            ("Test status", self.tests.status.clone()),
            ("Tests running", self.tests.is_running.to_string()),
            ("Last test run", or_dash(self.tests.last_test_time.as_ref())),
        ];
        if let Some(results) = &self.tests.test_results {
            fields.push((
                "Last results",
                format!(
                    "{} total, {} passed, {} failed, {} skipped ({:.1}s)",
                    results.total_tests,
                    results.passed_tests,
                    results.failed_tests,
                    results.skipped_tests,
                    results.duration
                ),
            ));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_fields() {
        let fields = ResyncOutcome::Refreshed { refreshes: 2 }.fields();
        assert_eq!(fields[0], ("Result", "refreshed".to_string()));
        assert_eq!(fields[1], ("Refreshes", "2".to_string()));
    }

    #[test]
    fn test_status_view_includes_totals() {
        let view = EditorStatusView {
            port: 17543,
            compile: CompileStatus {
                status: "idle".to_string(),
                ..Default::default()
            },
            tests: serde_json::from_value(serde_json::json!({
                "status": "idle",
                "isRunning": false,
                "testResults": {
                    "totalTests": 4,
                    "passedTests": 3,
                    "failedTests": 1,
                    "skippedTests": 0,
                    "duration": 2.5
                }
            }))
            .unwrap(),
        };
        let fields = view.fields();
        assert_eq!(fields[0].1, "17543");
        let (_, totals) = fields.last().unwrap();
        assert_eq!(totals, "4 total, 3 passed, 1 failed, 0 skipped (2.5s)");
    }
}
