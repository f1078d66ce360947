//! Live progress aggregation over a batch's job states.

use serde::Serialize;

use crate::classify::{classify_job_state, ResultSummary};
use crate::job::{JobState, JobStatus};
use crate::track::{BatchSnapshot, TerminalReason};

/// Machine-readable batch condition backing the status text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchCondition {
    /// No outcomes yet.
    Preparing,
    /// Some files are still being processed.
    Processing,
    /// Every file was created.
    Completed,
    /// Finished with a mix of created files and failures.
    CompletedWithFailures,
    /// Every file failed.
    Failed,
    /// Polling gave up with jobs still pending. Informational.
    TimedOut,
    /// The backend no longer knows the batch session.
    SessionExpired,
    Cancelled,
}

/// One aggregated progress reading, ready for the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub percentage: u8,
    pub status_text: String,
    pub condition: BatchCondition,
    pub summary: ResultSummary,
    pub is_complete: bool,
}

impl ProgressReport {
    /// Whether the progress indicator should render in its error state.
    /// Per-file failures and timeouts do not qualify; only losing the
    /// whole batch does.
    pub fn is_error(&self) -> bool {
        matches!(self.condition, BatchCondition::SessionExpired)
    }
}

/// Folds job-state snapshots into percentage, status text and summary.
///
/// Owns the two pieces of cross-tick memory the UI contract needs: the
/// displayed percentage never decreases for the life of a batch, and
/// completion latches exactly once.
pub struct ProgressAggregator {
    total_files: usize,
    last_percentage: u8,
    complete: bool,
}

impl ProgressAggregator {
    pub fn new(total_files: usize) -> Self {
        Self {
            total_files,
            last_percentage: 0,
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn apply_snapshot(&mut self, snapshot: &BatchSnapshot) -> ProgressReport {
        self.aggregate(
            &snapshot.jobs,
            snapshot.reported_percentage,
            snapshot.terminal,
        )
    }

    /// Computes the current progress reading.
    ///
    /// `reported` carries the percentage a push-based status stream
    /// announced for the batch; it is merged under the same monotonic
    /// clamp as the computed value so both protocols read identically.
    pub fn aggregate(
        &mut self,
        states: &[JobState],
        reported: Option<u8>,
        terminal: Option<TerminalReason>,
    ) -> ProgressReport {
        let total = self.total_files;
        let done = states.iter().filter(|s| s.is_terminal()).count();
        let created = states
            .iter()
            .filter(|s| s.status == JobStatus::Success)
            .count();
        let failed_files: Vec<_> = states.iter().filter_map(classify_job_state).collect();
        let summary = ResultSummary::new(created, failed_files);

        let mut percentage = if total == 0 {
            100
        } else {
            (100.0 * done as f64 / total as f64).round() as u8
        };
        if let Some(reported) = reported {
            percentage = percentage.max(reported.min(100));
        }
        percentage = percentage.max(self.last_percentage);
        self.last_percentage = percentage;

        let condition = match terminal {
            Some(TerminalReason::SessionExpired) => BatchCondition::SessionExpired,
            Some(TerminalReason::TimedOut) => BatchCondition::TimedOut,
            Some(TerminalReason::Cancelled) => BatchCondition::Cancelled,
            Some(TerminalReason::Completed) => finished_condition(&summary),
            None if total == 0 || done == total => finished_condition(&summary),
            None if states.is_empty() => BatchCondition::Preparing,
            None => BatchCondition::Processing,
        };

        if !matches!(
            condition,
            BatchCondition::Preparing | BatchCondition::Processing
        ) {
            self.complete = true;
        }

        let status_text = match condition {
            BatchCondition::Preparing => "Preparing upload".to_string(),
            BatchCondition::Processing => format!("Processing {} of {}", done, total),
            BatchCondition::Completed => "Completed".to_string(),
            BatchCondition::CompletedWithFailures => {
                format!("Completed with {} failures", summary.failed)
            }
            BatchCondition::Failed => "Failed".to_string(),
            BatchCondition::TimedOut => {
                format!("Timed out with {} jobs still pending", total - done)
            }
            BatchCondition::SessionExpired => "Upload session expired".to_string(),
            BatchCondition::Cancelled => "Cancelled".to_string(),
        };

        ProgressReport {
            percentage,
            status_text,
            condition,
            summary,
            is_complete: self.complete,
        }
    }
}

fn finished_condition(summary: &ResultSummary) -> BatchCondition {
    if summary.failed == 0 {
        BatchCondition::Completed
    } else if summary.created == 0 {
        BatchCondition::Failed
    } else {
        BatchCondition::CompletedWithFailures
    }
}
