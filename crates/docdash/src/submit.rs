//! Batch submission: client-side validation, the multipart POST, and
//! normalization of the backend's response shapes.

use std::path::{Path, PathBuf};

use log::{info, warn};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::classify::RawFailure;
use crate::config::UploadConfig;
use crate::error::SubmitError;
use crate::job::{BatchSubmissionResult, ImmediateSuccess, JobDescriptor, ResultRef};
use crate::source::create_http_client;

/// Maximum length for error bodies kept from a rejected upload, to
/// prevent log flooding.
const MAX_ERROR_BODY_LENGTH: usize = 200;

fn truncate_error_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        format!("{}... (truncated)", &body[..MAX_ERROR_BODY_LENGTH])
    } else {
        body.to_string()
    }
}

/// Direction of a document relative to the organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Per-file metadata sent alongside the upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

/// One file queued for submission.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub path: PathBuf,
    pub metadata: FileMetadata,
}

impl FileUpload {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            metadata: FileMetadata::default(),
        }
    }

    pub fn with_metadata<P: AsRef<Path>>(path: P, metadata: FileMetadata) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            metadata,
        }
    }

    /// Filename portion of the path, if one exists.
    pub fn filename(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
    }
}

/// Batch-level submission options.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Free-text remark attached to the whole batch.
    pub remark: Option<String>,
    /// Whether every file must carry a document type to be submitted.
    pub require_document_type: bool,
}

// ─── Wire types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmittedJob {
    job_id: String,
    filename: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmittedItem {
    filename: String,
    #[serde(default)]
    document_id: Option<String>,
    #[serde(default)]
    invoice_id: Option<String>,
}

impl SubmittedItem {
    fn result_ref(&self) -> Option<ResultRef> {
        if let Some(id) = &self.document_id {
            return Some(ResultRef::Document(id.clone()));
        }
        self.invoice_id.clone().map(ResultRef::Invoice)
    }
}

/// The submission response. Any mix of the three sections may be present;
/// a batch can resolve fully synchronously, fully asynchronously, or both.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(default)]
    jobs: Vec<SubmittedJob>,
    #[serde(default)]
    items: Vec<SubmittedItem>,
    #[serde(default)]
    failures: Vec<RawFailure>,
    #[serde(default)]
    total_files: Option<usize>,
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Splits the batch into submittable files and local rejections. Invalid
/// files never reach the network and never block the valid remainder.
fn validate_files<'a>(
    files: &'a [FileUpload],
    options: &BatchOptions,
) -> (Vec<&'a FileUpload>, Vec<RawFailure>) {
    let mut valid = Vec::with_capacity(files.len());
    let mut failures = Vec::new();

    for upload in files {
        let Some(filename) = upload.filename() else {
            failures.push(RawFailure::local(
                &upload.path.to_string_lossy(),
                "Invalid file path",
            ));
            continue;
        };

        if mime_guess::from_path(&upload.path).first().is_none() {
            failures.push(RawFailure::local(&filename, "Unsupported file type"));
            continue;
        }

        if options.require_document_type && upload.metadata.document_type.is_none() {
            failures.push(RawFailure::local(&filename, "Missing document type"));
            continue;
        }

        valid.push(upload);
    }

    (valid, failures)
}

// ─── Submitter ──────────────────────────────────────────────────────────────

/// Sends a batch of files to the backend and normalizes the response.
pub struct BatchSubmitter {
    client: Client,
    submit_url: String,
}

impl BatchSubmitter {
    pub fn new(config: &UploadConfig) -> Result<Self, SubmitError> {
        Ok(Self {
            client: create_http_client(config.request_timeout())?,
            submit_url: config.submit_url.clone(),
        })
    }

    /// Submits the batch in one multipart POST.
    ///
    /// Failure of the request itself is fatal: no jobs are created and no
    /// partial state is kept. Per-file problems (validation, unreadable
    /// files, server-side rejections) become failure records in the
    /// returned result instead.
    pub async fn submit(
        &self,
        files: &[FileUpload],
        options: &BatchOptions,
    ) -> Result<BatchSubmissionResult, SubmitError> {
        let total_files = files.len();
        let (valid, mut failures) = validate_files(files, options);

        if !failures.is_empty() {
            info!(
                "Excluded {} of {} files before submission",
                failures.len(),
                total_files
            );
        }

        let mut form = Form::new();
        let mut metadata = Vec::new();
        let mut attached = 0usize;

        for upload in &valid {
            // Filename presence was checked during validation.
            let filename = upload.filename().unwrap_or_default();
            let bytes = match tokio::fs::read(&upload.path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read {}: {}", upload.path.display(), e);
                    failures.push(RawFailure::local(
                        &filename,
                        &format!("Failed to read file: {}", e),
                    ));
                    continue;
                }
            };

            let mime = mime_guess::from_path(&upload.path).first_or_octet_stream();
            let part = match Part::bytes(bytes)
                .file_name(filename.clone())
                .mime_str(mime.essence_str())
            {
                Ok(part) => part,
                Err(e) => {
                    warn!("Unusable MIME type for {}: {}", filename, e);
                    failures.push(RawFailure::local(&filename, "Unrecognized MIME type"));
                    continue;
                }
            };

            form = form.part("files", part);
            metadata.push(upload.metadata.clone());
            attached += 1;
        }

        if attached == 0 {
            info!("No submittable files in batch of {}", total_files);
            return Ok(BatchSubmissionResult {
                jobs: vec![],
                items: vec![],
                failures,
                total_files,
            });
        }

        form = form.text("metadata", serde_json::to_string(&metadata)?);
        if let Some(remark) = &options.remark {
            form = form.text("remark", remark.clone());
        }

        info!(
            "Submitting batch of {} files to {}",
            attached, self.submit_url
        );

        let response = self
            .client
            .post(&self.submit_url)
            .multipart(form)
            .send()
            .await
            .map_err(|source| SubmitError::Request { source })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected {
                status,
                body: truncate_error_body(&body),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| SubmitError::Request { source })?;
        let parsed: SubmitResponse = serde_json::from_str(&body)?;

        Ok(fold_response(total_files, failures, parsed))
    }
}

/// Folds the backend's response sections and the local rejections into
/// one immutable submission result.
fn fold_response(
    total_files: usize,
    mut failures: Vec<RawFailure>,
    response: SubmitResponse,
) -> BatchSubmissionResult {
    if let Some(server_total) = response.total_files {
        let submitted = total_files - failures.len();
        if server_total != submitted {
            warn!(
                "Backend counted {} files, {} were submitted",
                server_total, submitted
            );
        }
    }

    let mut items = Vec::with_capacity(response.items.len());
    for item in response.items {
        match item.result_ref() {
            Some(result_ref) => items.push(ImmediateSuccess {
                filename: item.filename,
                result_ref,
            }),
            None => {
                warn!("Response item for {} carries no record id", item.filename);
                failures.push(RawFailure::local(
                    &item.filename,
                    "Response item missing record reference",
                ));
            }
        }
    }

    failures.extend(response.failures);

    let jobs = response
        .jobs
        .into_iter()
        .map(|job| JobDescriptor {
            job_id: job.job_id,
            filename: job.filename,
        })
        .collect();

    BatchSubmissionResult {
        jobs,
        items,
        failures,
        total_files,
    }
}
