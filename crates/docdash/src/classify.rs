//! Failure classification and result summaries.
//!
//! Failures reach the dashboard from three places: client-side validation,
//! server-side rejections in the submission response, and jobs that ended
//! failed during tracking. All three are folded through [`classify`] so the
//! results table renders one unified shape.

use serde::{Deserialize, Serialize};

use crate::job::{JobState, JobStatus};

/// Shown when the backend reports a failure without a reason.
pub const GENERIC_FAILURE_REASON: &str = "Processing failed";

/// A failure as it arrives from the backend (or is synthesized locally),
/// before classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFailure {
    pub filename: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Id of the pre-existing record this file duplicates, when populated.
    #[serde(default)]
    pub duplicate_of: Option<String>,
    /// Fields the backend extracted before rejecting the file.
    #[serde(default)]
    pub extracted_fields: Option<serde_json::Value>,
    /// Position within the submitted batch, when the backend reports one.
    #[serde(default)]
    pub index: Option<usize>,
}

impl RawFailure {
    /// Creates a failure record for a file rejected before submission.
    pub fn local(filename: &str, reason: &str) -> Self {
        Self {
            filename: filename.to_string(),
            reason: Some(reason.to_string()),
            duplicate_of: None,
            extracted_fields: None,
            index: None,
        }
    }
}

/// A classified failure, ready for the results table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureRecord {
    /// The backend identified an existing matching record. The duplicate
    /// id lets the UI link to it.
    #[serde(rename_all = "camelCase")]
    Duplicate {
        file: String,
        duplicate_of: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        extracted_fields: Option<serde_json::Value>,
    },
    /// Any other failure, with a plain reason.
    #[serde(rename_all = "camelCase")]
    Error { file: String, reason: String },
}

impl FailureRecord {
    pub fn file(&self) -> &str {
        match self {
            FailureRecord::Duplicate { file, .. } => file,
            FailureRecord::Error { file, .. } => file,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, FailureRecord::Duplicate { .. })
    }
}

/// Splits a raw failure into the duplicate or generic-error category.
///
/// A populated duplicate reference always wins: such a failure must never
/// end up in the `Error` bucket, whatever else the payload carries.
pub fn classify(raw: RawFailure) -> FailureRecord {
    match raw.duplicate_of {
        Some(duplicate_of) if !duplicate_of.trim().is_empty() => FailureRecord::Duplicate {
            file: raw.filename,
            duplicate_of,
            extracted_fields: raw.extracted_fields,
        },
        _ => FailureRecord::Error {
            file: raw.filename,
            reason: raw
                .reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| GENERIC_FAILURE_REASON.to_string()),
        },
    }
}

/// Classifies a tracked job that ended failed. Returns `None` for any
/// other status.
pub fn classify_job_state(state: &JobState) -> Option<FailureRecord> {
    if state.status != JobStatus::Failed {
        return None;
    }
    Some(classify(RawFailure {
        filename: state.filename.clone(),
        reason: state.error_message.clone(),
        duplicate_of: state.duplicate_of.clone(),
        extracted_fields: state.extracted_fields.clone(),
        index: None,
    }))
}

/// Final tally for a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub created: usize,
    pub failed: usize,
    pub failed_files: Vec<FailureRecord>,
}

impl ResultSummary {
    pub fn new(created: usize, failed_files: Vec<FailureRecord>) -> Self {
        Self {
            created,
            failed: failed_files.len(),
            failed_files,
        }
    }

    /// Returns true if every file was created without failures.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}
