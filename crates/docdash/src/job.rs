//! Core job and batch state model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::RawFailure;

/// Status of a single job.
///
/// Transitions are monotonic: once a job reaches `Success` or `Failed`
/// it never changes again. A batch whose session became unknown to the
/// backend is signalled out-of-band (see `PollError::SessionNotFound`),
/// not as a per-job status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Handle for one unit of deferred server-side work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Opaque id, unique within the batch.
    pub job_id: String,
    pub filename: String,
}

/// Reference to the record a finished job produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultRef {
    Document(String),
    Invoice(String),
}

/// Live state of one job within a batch session.
///
/// One entry exists per deferred job, plus one synthesized entry per
/// immediate success or failure, so every file in the batch is visible
/// through the same collection. Mutated only by status updates; discarded
/// with the batch session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_id: String,
    pub filename: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ResultRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Id of the pre-existing record when the backend rejected the file
    /// as a duplicate. Kept so the failure table can link to it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_fields: Option<serde_json::Value>,
    pub first_seen_at: DateTime<Utc>,
    pub last_polled_at: DateTime<Utc>,
}

/// Status update produced by a poll response or a stream event.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub result_ref: Option<ResultRef>,
    pub error_message: Option<String>,
    pub duplicate_of: Option<String>,
    pub extracted_fields: Option<serde_json::Value>,
}

impl JobState {
    /// Creates a pending state for a deferred job handle.
    pub fn pending(descriptor: &JobDescriptor) -> Self {
        let now = Utc::now();
        Self {
            job_id: descriptor.job_id.clone(),
            filename: descriptor.filename.clone(),
            status: JobStatus::Pending,
            result_ref: None,
            error_message: None,
            duplicate_of: None,
            extracted_fields: None,
            first_seen_at: now,
            last_polled_at: now,
        }
    }

    /// Synthesizes a terminal state for an outcome the submission
    /// response already resolved.
    pub fn immediate_success(filename: &str, result_ref: ResultRef) -> Self {
        let now = Utc::now();
        Self {
            job_id: format!("sync-{}", uuid::Uuid::new_v4()),
            filename: filename.to_string(),
            status: JobStatus::Success,
            result_ref: Some(result_ref),
            error_message: None,
            duplicate_of: None,
            extracted_fields: None,
            first_seen_at: now,
            last_polled_at: now,
        }
    }

    /// Synthesizes a terminal state for a file rejected before or during
    /// submission.
    pub fn immediate_failure(failure: &RawFailure) -> Self {
        let now = Utc::now();
        Self {
            job_id: format!("sync-{}", uuid::Uuid::new_v4()),
            filename: failure.filename.clone(),
            status: JobStatus::Failed,
            result_ref: None,
            error_message: failure.reason.clone(),
            duplicate_of: failure.duplicate_of.clone(),
            extracted_fields: failure.extracted_fields.clone(),
            first_seen_at: now,
            last_polled_at: now,
        }
    }

    /// Returns true if this job can no longer change.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a status update, returning whether anything changed.
    ///
    /// Terminal states never regress: updates against a finished job are
    /// ignored. Detail fields are merged option-wise so a later update
    /// cannot blank out information an earlier one carried.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.last_polled_at = now;
        let changed = self.status != update.status;
        self.status = update.status;

        if update.result_ref.is_some() {
            self.result_ref = update.result_ref.clone();
        }
        if update.error_message.is_some() {
            self.error_message = update.error_message.clone();
        }
        if update.duplicate_of.is_some() {
            self.duplicate_of = update.duplicate_of.clone();
        }
        if update.extracted_fields.is_some() {
            self.extracted_fields = update.extracted_fields.clone();
        }

        changed
    }
}

/// An outcome the submission response already resolved synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateSuccess {
    pub filename: String,
    pub result_ref: ResultRef,
}

/// Everything one batch submission produced, normalized over the three
/// shapes the backend may answer with (synchronous items, rejections,
/// deferred job handles). Immutable after creation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSubmissionResult {
    /// Deferred work to be tracked to completion.
    pub jobs: Vec<JobDescriptor>,
    /// Already-resolved successes requiring no polling.
    pub items: Vec<ImmediateSuccess>,
    /// Client-side rejections and server-side rejections, in submission order.
    pub failures: Vec<RawFailure>,
    /// Number of files the user submitted, including rejected ones.
    pub total_files: usize,
}

/// Per-file outcome of a submission, independent of which response shape
/// the backend chose.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    ImmediateSuccess(ImmediateSuccess),
    ImmediateFailure(RawFailure),
    Pending(JobDescriptor),
}

impl BatchSubmissionResult {
    /// Folds items, failures and job handles into one outcome list.
    pub fn outcomes(&self) -> Vec<JobOutcome> {
        let mut outcomes = Vec::with_capacity(self.total_files);
        outcomes.extend(
            self.items
                .iter()
                .cloned()
                .map(JobOutcome::ImmediateSuccess),
        );
        outcomes.extend(
            self.failures
                .iter()
                .cloned()
                .map(JobOutcome::ImmediateFailure),
        );
        outcomes.extend(self.jobs.iter().cloned().map(JobOutcome::Pending));
        outcomes
    }

    /// Builds the initial job-state collection for tracking: synthesized
    /// terminal states for immediate outcomes, pending states for jobs.
    pub fn initial_states(&self) -> Vec<JobState> {
        self.outcomes()
            .iter()
            .map(|outcome| match outcome {
                JobOutcome::ImmediateSuccess(item) => {
                    JobState::immediate_success(&item.filename, item.result_ref.clone())
                }
                JobOutcome::ImmediateFailure(failure) => JobState::immediate_failure(failure),
                JobOutcome::Pending(descriptor) => JobState::pending(descriptor),
            })
            .collect()
    }

    /// Returns true if nothing is left to poll.
    pub fn is_fully_resolved(&self) -> bool {
        self.jobs.is_empty()
    }
}
