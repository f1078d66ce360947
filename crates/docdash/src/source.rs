//! Job status sources for the polling tracker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::UploadConfig;
use crate::error::{PollError, SubmitError};
use crate::job::{JobStatus, JobUpdate, ResultRef};

/// Default connect timeout for HTTP requests (10 seconds).
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates an HTTP client with appropriate timeouts.
pub(crate) fn create_http_client(request_timeout: Duration) -> Result<Client, SubmitError> {
    Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()
        .map_err(|source| SubmitError::Client { source })
}

/// Status payload returned for a single job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPollResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub invoice_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duplicate_of: Option<String>,
    #[serde(default)]
    pub extracted_fields: Option<serde_json::Value>,
}

impl JobPollResponse {
    /// Reference to the record this job produced, if any.
    pub fn result_ref(&self) -> Option<ResultRef> {
        if let Some(id) = &self.document_id {
            return Some(ResultRef::Document(id.clone()));
        }
        self.invoice_id.clone().map(ResultRef::Invoice)
    }

    pub fn to_update(&self) -> JobUpdate {
        JobUpdate {
            status: self.status,
            result_ref: self.result_ref(),
            error_message: self.error_message.clone(),
            duplicate_of: self.duplicate_of.clone(),
            extracted_fields: self.extracted_fields.clone(),
        }
    }
}

/// Source of per-job status, one check per pending job per tick.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn poll(&self, job_id: &str) -> Result<JobPollResponse, PollError>;
}

/// Pull-based status source backed by the dashboard API.
pub struct HttpStatusSource {
    client: Client,
    status_url: String,
}

impl HttpStatusSource {
    pub fn new(config: &UploadConfig) -> Result<Self, SubmitError> {
        Ok(Self {
            client: create_http_client(config.request_timeout())?,
            status_url: config.status_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl JobStatusSource for HttpStatusSource {
    async fn poll(&self, job_id: &str) -> Result<JobPollResponse, PollError> {
        let url = format!("{}/{}", self.status_url, job_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PollError::SessionNotFound);
        }
        if !response.status().is_success() {
            return Err(PollError::Transport(format!(
                "status check returned {}",
                response.status()
            )));
        }

        response
            .json::<JobPollResponse>()
            .await
            .map_err(|e| PollError::Malformed(e.to_string()))
    }
}
