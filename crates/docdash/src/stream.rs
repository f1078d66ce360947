//! Push-based batch status streaming.
//!
//! One of the upload flows receives batch progress as a server-sent event
//! stream instead of per-job polling. Events here are translated onto the
//! same [`BatchSnapshot`] model the polling tracker publishes, so the
//! aggregator and UI never branch on which protocol fed them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::classify::RawFailure;
use crate::config::UploadConfig;
use crate::error::{DocdashError, PollError, SubmitError};
use crate::job::{JobState, JobStatus, JobUpdate};
use crate::source::DEFAULT_CONNECT_TIMEOUT;
use crate::track::{publish, BatchSnapshot, TerminalReason};

/// Phase reported by the batch status stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    Waiting,
    Processing,
    Completed,
    Error,
}

impl StreamPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamPhase::Completed | StreamPhase::Error)
    }
}

/// Batch-level tally carried by the stream's terminal event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    #[serde(default)]
    pub created: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub failed_files: Vec<RawFailure>,
}

/// One event from the batch status stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStreamEvent {
    pub status: StreamPhase,
    #[serde(default)]
    pub percentage: Option<u8>,
    #[serde(default)]
    pub current: Option<usize>,
    #[serde(default)]
    pub total: Option<usize>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub summary: Option<StreamSummary>,
}

// ─── SSE framing ────────────────────────────────────────────────────────────

/// Incremental parser for `data:`-framed JSON events. Chunk boundaries
/// need not align with lines; partial lines are buffered.
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<BatchStreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(payload) = line.strip_prefix("data:") {
                match serde_json::from_str::<BatchStreamEvent>(payload.trim_start()) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!("Skipping malformed stream event: {}", e),
                }
            }
            // Comment, `event:` and `id:` lines carry nothing we use.
        }
        events
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

// ─── HTTP stream source ─────────────────────────────────────────────────────

/// Opens batch status streams against the dashboard API.
pub struct HttpBatchStream {
    client: Client,
    stream_url: String,
}

impl HttpBatchStream {
    pub fn new(config: &UploadConfig) -> crate::error::Result<Self> {
        let stream_url = config.stream_url.clone().ok_or_else(|| {
            DocdashError::Config(crate::error::ConfigError::Validation {
                message: "stream_url is required for push-based tracking".to_string(),
            })
        })?;

        // No request timeout: the stream stays open for the whole batch.
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|source| DocdashError::Submit(SubmitError::Client { source }))?;

        Ok(Self {
            client,
            stream_url: stream_url.trim_end_matches('/').to_string(),
        })
    }

    /// Connects to the batch's event stream and forwards parsed events.
    /// The task ends on the first terminal event, a transport error, or
    /// when the receiver is dropped.
    pub fn spawn(&self, batch_id: &str) -> mpsc::Receiver<Result<BatchStreamEvent, PollError>> {
        let (tx, rx) = mpsc::channel(32);
        let client = self.client.clone();
        let url = format!("{}/{}", self.stream_url, batch_id);

        tokio::spawn(async move {
            let response = match client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    let _ = tx.send(Err(PollError::Transport(e.to_string()))).await;
                    return;
                }
            };

            if response.status() == StatusCode::NOT_FOUND {
                let _ = tx.send(Err(PollError::SessionNotFound)).await;
                return;
            }
            if !response.status().is_success() {
                let _ = tx
                    .send(Err(PollError::Transport(format!(
                        "stream returned {}",
                        response.status()
                    ))))
                    .await;
                return;
            }

            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for event in parser.push(&bytes) {
                            let terminal = event.status.is_terminal();
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                            if terminal {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(PollError::Transport(e.to_string()))).await;
                        return;
                    }
                }
            }
        });

        rx
    }
}

// ─── Stream tracker ─────────────────────────────────────────────────────────

/// Tracks a batch through a push-based status stream, publishing the same
/// [`BatchSnapshot`]s as the polling tracker.
pub struct BatchStreamTracker {
    cancelled: Arc<AtomicBool>,
    sender: broadcast::Sender<BatchSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchStreamTracker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            sender,
            task: Mutex::new(None),
        }
    }

    /// Creates a new subscriber for batch snapshots. Subscribe before
    /// calling [`BatchStreamTracker::start`] to observe the seed snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchSnapshot> {
        self.sender.subscribe()
    }

    pub fn start(
        &self,
        states: Vec<JobState>,
        events: mpsc::Receiver<Result<BatchStreamEvent, PollError>>,
    ) {
        let handle = tokio::spawn(run_stream_loop(
            states,
            events,
            Arc::clone(&self.cancelled),
            self.sender.clone(),
        ));
        if let Ok(mut guard) = self.task.lock() {
            *guard = Some(handle);
        }
    }

    /// Stops tracking and suppresses all further snapshot publications.
    /// Idempotent, and safe to call after the stream ended naturally.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        match self.task.lock() {
            Ok(guard) => guard.as_ref().map(|h| h.is_finished()).unwrap_or(true),
            Err(_) => true,
        }
    }

    pub(crate) fn cancelled_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl Default for BatchStreamTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BatchStreamTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_stream_loop(
    mut states: Vec<JobState>,
    mut events: mpsc::Receiver<Result<BatchStreamEvent, PollError>>,
    cancelled: Arc<AtomicBool>,
    sender: broadcast::Sender<BatchSnapshot>,
) {
    publish(&sender, &cancelled, BatchSnapshot::new(0, states.clone()));

    if states.iter().all(JobState::is_terminal) {
        publish(
            &sender,
            &cancelled,
            BatchSnapshot::new(0, states).with_terminal(TerminalReason::Completed),
        );
        return;
    }

    let mut tick: u32 = 0;
    while let Some(item) = events.recv().await {
        if cancelled.load(Ordering::Acquire) {
            debug!("Stream tracking cancelled after {} events", tick);
            return;
        }
        tick += 1;

        match item {
            Ok(event) => {
                let terminal = event.status.is_terminal();
                if terminal {
                    resolve_from_event(&mut states, &event);
                }
                if event.status == StreamPhase::Processing {
                    let now = Utc::now();
                    for state in states.iter_mut().filter(|s| !s.is_terminal()) {
                        state.apply(
                            &JobUpdate {
                                status: JobStatus::Running,
                                ..JobUpdate::default()
                            },
                            now,
                        );
                    }
                }

                let mut snapshot = BatchSnapshot::new(tick, states.clone());
                snapshot.reported_percentage = event.percentage;
                snapshot.status_message = event.message.clone();
                if terminal {
                    snapshot = snapshot.with_terminal(TerminalReason::Completed);
                }
                publish(&sender, &cancelled, snapshot);

                if terminal {
                    return;
                }
            }
            Err(PollError::SessionNotFound) => {
                warn!("Batch unknown to the status stream, stopping");
                publish(
                    &sender,
                    &cancelled,
                    BatchSnapshot::new(tick, states).with_terminal(TerminalReason::SessionExpired),
                );
                return;
            }
            Err(e) => {
                // A broken stream is informational: statuses stay at their
                // last known value for a later manual refresh.
                warn!("Batch status stream interrupted: {}", e);
                publish(
                    &sender,
                    &cancelled,
                    BatchSnapshot::new(tick, states).with_terminal(TerminalReason::TimedOut),
                );
                return;
            }
        }
    }

    debug!("Batch status stream ended without a terminal event");
    publish(
        &sender,
        &cancelled,
        BatchSnapshot::new(tick, states).with_terminal(TerminalReason::TimedOut),
    );
}

/// Resolves every remaining job from the stream's terminal event. Files
/// named in the summary fail with their reported detail; the rest succeed
/// on `completed` and fail with the event message on `error`.
fn resolve_from_event(states: &mut [JobState], event: &BatchStreamEvent) {
    let now = Utc::now();

    if let Some(summary) = &event.summary {
        for raw in &summary.failed_files {
            if let Some(state) = states
                .iter_mut()
                .find(|s| !s.is_terminal() && s.filename == raw.filename)
            {
                state.apply(
                    &JobUpdate {
                        status: JobStatus::Failed,
                        error_message: raw.reason.clone(),
                        duplicate_of: raw.duplicate_of.clone(),
                        extracted_fields: raw.extracted_fields.clone(),
                        ..JobUpdate::default()
                    },
                    now,
                );
            }
        }
    }

    let batch_failed = event.status == StreamPhase::Error;
    for state in states.iter_mut().filter(|s| !s.is_terminal()) {
        if batch_failed {
            state.apply(
                &JobUpdate {
                    status: JobStatus::Failed,
                    error_message: event.message.clone(),
                    ..JobUpdate::default()
                },
                now,
            );
        } else {
            state.apply(
                &JobUpdate {
                    status: JobStatus::Success,
                    ..JobUpdate::default()
                },
                now,
            );
        }
    }
}
