//! Run lifecycle hooks
//!
//! The scheduler calls these synchronously, from the task driving the run,
//! at three points: before the first node is dispatched, after each node
//! reaches a terminal state, and once the report is built.

use dagsmith_core::{RunReport, RunResult, RunStatus};

/// What is about to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStart {
    /// Nodes in the selected subgraph
    pub nodes: usize,
    pub threads: usize,
}

pub trait RunObserver: Send + Sync {
    fn on_run_start(&self, _start: &RunStart) {}

    fn on_node_complete(&self, _result: &RunResult) {}

    fn on_run_end(&self, _report: &RunReport) {}
}

/// Ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Emits run progress through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl RunObserver for LoggingObserver {
    fn on_run_start(&self, start: &RunStart) {
        tracing::info!(nodes = start.nodes, threads = start.threads, "starting run");
    }

    fn on_node_complete(&self, result: &RunResult) {
        let elapsed_ms = (result.execution_time * 1000.0) as u64;
        match result.status {
            RunStatus::Success | RunStatus::Warn => tracing::info!(
                unique_id = %result.unique_id,
                status = %result.status,
                status_text = %result.status_text,
                elapsed_ms,
                "node finished"
            ),
            RunStatus::Skipped => tracing::info!(
                unique_id = %result.unique_id,
                cause = result.message.as_deref().unwrap_or_default(),
                "node skipped"
            ),
            RunStatus::Fail | RunStatus::Error => tracing::warn!(
                unique_id = %result.unique_id,
                status = %result.status,
                message = result.message.as_deref().unwrap_or_default(),
                elapsed_ms,
                "node did not succeed"
            ),
        }
    }

    fn on_run_end(&self, report: &RunReport) {
        tracing::info!(
            total = report.summary.total,
            success = report.summary.success,
            warn = report.summary.warn,
            fail = report.summary.fail,
            error = report.summary.error,
            skipped = report.summary.skipped,
            elapsed_s = report.elapsed_time,
            "run finished"
        );
    }
}
