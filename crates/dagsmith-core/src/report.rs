//! Run report schema (run_results.json v1)
//!
//! This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::node::{Materialization, Node, NodeId, ResourceKind};

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Terminal state of one node in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Executed successfully
    Success,

    /// Executed; a test returned failures at warn severity
    Warn,

    /// The backend rejected a statement, or a test failed
    Fail,

    /// Internal fault; never retried
    Error,

    /// Never ran because an ancestor failed or errored
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    /// Whether dependents of a node in this state must be skipped
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Fail | Self::Error | Self::Skipped)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one node. Created exactly once per attempted node per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub unique_id: NodeId,
    pub name: String,
    pub resource_type: ResourceKind,
    pub materialization: Option<Materialization>,

    pub status: RunStatus,

    /// Backend response text (e.g. "CREATE VIEW"), failure count for
    /// tests, or ERROR / SKIPPED
    pub status_text: String,

    pub fail: bool,
    pub warn: bool,
    pub skip: bool,

    /// Wall-clock execution time in seconds
    pub execution_time: f64,

    /// Error message or skip cause
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

impl RunResult {
    /// Create a result for `node` with flags derived from `status`
    pub fn new(node: &Node, status: RunStatus, status_text: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            unique_id: node.unique_id.clone(),
            name: node.name.clone(),
            resource_type: node.resource_type,
            materialization: node.materialization(),
            status,
            status_text: status_text.into(),
            fail: matches!(status, RunStatus::Fail | RunStatus::Error),
            warn: status == RunStatus::Warn,
            skip: status == RunStatus::Skipped,
            execution_time: elapsed.as_secs_f64(),
            message: None,
            rows_affected: None,
        }
    }

    pub fn failed(node: &Node, message: impl Into<String>, elapsed: Duration) -> Self {
        Self::new(node, RunStatus::Fail, "ERROR", elapsed).with_message(message)
    }

    pub fn errored(node: &Node, message: impl Into<String>, elapsed: Duration) -> Self {
        Self::new(node, RunStatus::Error, "ERROR", elapsed).with_message(message)
    }

    /// Result for a node whose ancestor `cause` failed
    pub fn skipped(node: &Node, cause: &str) -> Self {
        Self::new(node, RunStatus::Skipped, "SKIPPED", Duration::ZERO)
            .with_message(format!("Skipped because upstream node {} did not succeed", cause))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_rows_affected(mut self, rows: Option<u64>) -> Self {
        self.rows_affected = rows;
        self
    }
}

/// Summary statistics for a report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub success: usize,
    pub warn: usize,
    pub fail: usize,
    pub error: usize,
    pub skipped: usize,
}

impl ReportSummary {
    fn record(&mut self, status: RunStatus) {
        self.total += 1;
        match status {
            RunStatus::Success => self.success += 1,
            RunStatus::Warn => self.warn += 1,
            RunStatus::Fail => self.fail += 1,
            RunStatus::Error => self.error += 1,
            RunStatus::Skipped => self.skipped += 1,
        }
    }
}

/// Run report (run_results.json v1)
///
/// Results are kept in completion order; [`RunReport::get`] gives a stable
/// lookup by unique_id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub version: ReportVersion,

    /// Timestamp (ISO 8601)
    pub timestamp: String,

    /// Total wall-clock time of the run in seconds
    pub elapsed_time: f64,

    /// True when no result has `fail = true`
    pub success: bool,

    pub summary: ReportSummary,

    pub results: Vec<RunResult>,

    #[serde(skip)]
    index: BTreeMap<NodeId, usize>,
}

impl RunReport {
    /// Create a new empty report
    pub fn new() -> Self {
        Self::aggregate(Vec::new(), Duration::ZERO)
    }

    /// Aggregate results (in completion order) into a report
    pub fn aggregate(results: Vec<RunResult>, elapsed: Duration) -> Self {
        let mut report = Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            elapsed_time: elapsed.as_secs_f64(),
            success: true,
            summary: ReportSummary::default(),
            results: Vec::with_capacity(results.len()),
            index: BTreeMap::new(),
        };

        for result in results {
            report.add_result(result);
        }

        report
    }

    /// Append a result as it completes
    pub fn add_result(&mut self, result: RunResult) {
        self.summary.record(result.status);
        if result.fail {
            self.success = false;
        }
        self.index.insert(result.unique_id.clone(), self.results.len());
        self.results.push(result);
    }

    /// Look up a result by unique_id
    pub fn get(&self, unique_id: &str) -> Option<&RunResult> {
        match self.index.get(unique_id) {
            Some(&i) => self.results.get(i),
            // Index is not serialized; fall back after deserialization
            None => self.results.iter().find(|r| r.unique_id == unique_id),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// unique_ids in completion order
    pub fn completion_order(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.unique_id.as_str()).collect()
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self.to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}
