//! Outcome model: how each step and task ended.
//!
//! This module only defines the "shape" of results. Nothing here performs
//! I/O, so the pipeline can log and report them uniformly.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DeviceError;
use super::RunId;

/// Result of a best-effort device call.
///
/// Best-effort 呼び出しは失敗しても手順を止めない。`?` で伝播させない代わりに
/// 必ずこの型を返し、呼び出し側で `log` する。
#[derive(Debug)]
pub enum BestEffort {
    Done,
    /// Nothing to do (e.g. the process was not running).
    Skipped(String),
    Failed(DeviceError),
}

impl BestEffort {
    pub fn from_result(result: Result<(), DeviceError>) -> Self {
        match result {
            Ok(()) => Self::Done,
            Err(err) => Self::Failed(err),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Emit one log line for `action` and hand the outcome back.
    pub fn log(self, action: &str) -> Self {
        match &self {
            Self::Done => tracing::debug!(action, "ok"),
            Self::Skipped(reason) => tracing::debug!(action, %reason, "skipped"),
            Self::Failed(err) => tracing::warn!(action, error = %err, "best-effort step failed"),
        }
        self
    }
}

/// How the confirmation wait ended. Both are terminal and lead to cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitOutcome {
    Confirmed,
    TimedOut,
}

/// Final classification of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Confirmed,
    TimedOut,
    /// Task never started device work (e.g. its asset was missing).
    Skipped(String),
    /// Task started and hit a fatal-to-task error.
    Failed(String),
}

impl From<WaitOutcome> for TaskOutcome {
    fn from(value: WaitOutcome) -> Self {
        match value {
            WaitOutcome::Confirmed => Self::Confirmed,
            WaitOutcome::TimedOut => Self::TimedOut,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed => f.write_str("confirmed"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub run_id: Option<RunId>,
    pub asset: String,
    pub outcome: TaskOutcome,
}

/// Per-task reports in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn push(&mut self, report: TaskReport) {
        self.tasks.push(report);
    }

    pub fn confirmed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.outcome == TaskOutcome::Confirmed)
            .count()
    }
}
