//! Batch upload sessions: exclusive ownership of job states, timers and
//! cancellation for one batch at a time.
//!
//! A session owns everything mutable about a batch — the tracker loop,
//! the clocks and the cancellation flag — so there is no ambient timer or
//! interval state to race against. Starting a new batch goes through
//! [`SessionSlot`], which tears the previous session down first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::{PollError, SubmitError};
use crate::job::BatchSubmissionResult;
use crate::progress::{ProgressAggregator, ProgressReport};
use crate::source::JobStatusSource;
use crate::stream::{BatchStreamEvent, BatchStreamTracker};
use crate::submit::{BatchOptions, BatchSubmitter, FileUpload};
use crate::timing::{BatchTimer, ClockReading};
use crate::track::{BatchSnapshot, JobTracker, TrackerOptions};

enum SessionTracker {
    Pull(JobTracker),
    Push(BatchStreamTracker),
}

impl SessionTracker {
    fn cancel(&self) {
        match self {
            SessionTracker::Pull(tracker) => tracker.cancel(),
            SessionTracker::Push(tracker) => tracker.cancel(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            SessionTracker::Pull(tracker) => tracker.is_finished(),
            SessionTracker::Push(tracker) => tracker.is_finished(),
        }
    }
}

/// One live batch upload: submission result, tracking loop, clocks and
/// progress fan-out, torn down together.
pub struct BatchUploadSession {
    batch_id: String,
    submission: BatchSubmissionResult,
    timer: Arc<BatchTimer>,
    tracker: SessionTracker,
    reports: broadcast::Sender<ProgressReport>,
    uploading: Arc<AtomicBool>,
}

impl BatchUploadSession {
    /// Submits the batch and starts tracking it by polling.
    ///
    /// A failed submission is fatal: the error propagates, no session and
    /// no partial state exist afterwards.
    pub async fn begin(
        submitter: &BatchSubmitter,
        source: Arc<dyn JobStatusSource>,
        files: &[FileUpload],
        options: &BatchOptions,
        tracker_options: TrackerOptions,
    ) -> Result<Arc<Self>, SubmitError> {
        let submission = submitter.submit(files, options).await?;
        Ok(Self::from_submission(submission, source, tracker_options))
    }

    /// Starts a polling session over an already-normalized submission.
    pub fn from_submission(
        submission: BatchSubmissionResult,
        source: Arc<dyn JobStatusSource>,
        tracker_options: TrackerOptions,
    ) -> Arc<Self> {
        let states = submission.initial_states();
        let timer = BatchTimer::start();
        let (reports, _) = broadcast::channel(64);
        let uploading = Arc::new(AtomicBool::new(true));

        let tracker = JobTracker::new(tracker_options);
        spawn_driver(
            tracker.subscribe(),
            reports.clone(),
            Arc::clone(&timer),
            Arc::clone(&uploading),
            tracker.cancelled_handle(),
            submission.total_files,
        );
        tracker.start(states, source);

        let session = Arc::new(Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            submission,
            timer,
            tracker: SessionTracker::Pull(tracker),
            reports,
            uploading,
        });
        info!(
            "Started batch session {} for {} files",
            session.batch_id, session.submission.total_files
        );
        session
    }

    /// Starts a session fed by a push-based status stream instead of
    /// polling. Events are translated onto the same snapshot model.
    pub fn from_stream(
        submission: BatchSubmissionResult,
        events: mpsc::Receiver<Result<BatchStreamEvent, PollError>>,
    ) -> Arc<Self> {
        let states = submission.initial_states();
        let timer = BatchTimer::start();
        let (reports, _) = broadcast::channel(64);
        let uploading = Arc::new(AtomicBool::new(true));

        let tracker = BatchStreamTracker::new();
        spawn_driver(
            tracker.subscribe(),
            reports.clone(),
            Arc::clone(&timer),
            Arc::clone(&uploading),
            tracker.cancelled_handle(),
            submission.total_files,
        );
        tracker.start(states, events);

        let session = Arc::new(Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            submission,
            timer,
            tracker: SessionTracker::Push(tracker),
            reports,
            uploading,
        });
        info!(
            "Started streamed batch session {} for {} files",
            session.batch_id, session.submission.total_files
        );
        session
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn submission(&self) -> &BatchSubmissionResult {
        &self.submission
    }

    pub fn total_files(&self) -> usize {
        self.submission.total_files
    }

    /// Creates a new subscriber for aggregated progress reports.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<ProgressReport> {
        self.reports.subscribe()
    }

    /// Creates a new subscriber for the session's clock readings.
    pub fn subscribe_clock(&self) -> broadcast::Receiver<ClockReading> {
        self.timer.subscribe()
    }

    pub fn elapsed_display(&self) -> String {
        self.timer.elapsed_display()
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading.load(Ordering::Acquire)
    }

    pub fn timer_stopped(&self) -> bool {
        self.timer.is_stopped()
    }

    pub fn is_finished(&self) -> bool {
        self.tracker.is_finished()
    }

    /// Tears the session down: stops the tracking loop, stops both clocks
    /// and suppresses every further progress publication, including from
    /// responses still in flight. Idempotent.
    pub fn cancel(&self) {
        self.tracker.cancel();
        self.timer.stop();
        self.uploading.store(false, Ordering::Release);
    }
}

impl Drop for BatchUploadSession {
    fn drop(&mut self) {
        // Covers navigation and early-drop paths; cancel is idempotent.
        self.cancel();
    }
}

/// Folds tracker snapshots through the aggregator and fans the resulting
/// reports out to the UI. Stops the clocks on the completion edge.
fn spawn_driver(
    mut snapshots: broadcast::Receiver<BatchSnapshot>,
    reports: broadcast::Sender<ProgressReport>,
    timer: Arc<BatchTimer>,
    uploading: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    total_files: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut aggregator = ProgressAggregator::new(total_files);
        let mut seen_terminal = 0usize;
        let mut last_message: Option<String> = None;

        loop {
            match snapshots.recv().await {
                Ok(snapshot) => {
                    if cancelled.load(Ordering::Acquire) {
                        break;
                    }

                    // A finished job or a new activity message signals a
                    // new unit of work; reset the per-item clock.
                    let terminal_now = snapshot.terminal_count();
                    let new_message = snapshot.status_message.is_some()
                        && snapshot.status_message != last_message;
                    if terminal_now > seen_terminal || new_message {
                        timer.mark_new_item();
                    }
                    seen_terminal = terminal_now;
                    if let Some(message) = &snapshot.status_message {
                        last_message = Some(message.clone());
                    }

                    let was_complete = aggregator.is_complete();
                    let report = aggregator.apply_snapshot(&snapshot);
                    let complete_edge = report.is_complete && !was_complete;
                    let summary = report.summary.clone();
                    // Ignore errors - no active receivers is fine
                    let _ = reports.send(report);

                    if complete_edge {
                        timer.stop();
                        uploading.store(false, Ordering::Release);
                        info!(
                            "Batch finished: {} created, {} failed, {} elapsed",
                            summary.created,
                            summary.failed,
                            timer.elapsed_display()
                        );
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Progress driver lagged, missed {} snapshots", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Holds at most one active batch session. Installing a new session
/// cancels the previous one's loop and timers first, so the shared
/// progress surface is always owned by exactly one batch.
pub struct SessionSlot {
    active: Mutex<Option<Arc<BatchUploadSession>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }

    /// Installs a new active session, tearing the previous one down first.
    pub fn install(&self, session: Arc<BatchUploadSession>) {
        if let Ok(mut guard) = self.active.lock() {
            if let Some(previous) = guard.take() {
                info!("Replacing batch session {}", previous.batch_id());
                previous.cancel();
            }
            *guard = Some(session);
        }
    }

    pub fn active(&self) -> Option<Arc<BatchUploadSession>> {
        self.active.lock().ok().and_then(|guard| guard.clone())
    }

    /// Cancels and removes the active session, if any.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.active.lock() {
            if let Some(session) = guard.take() {
                session.cancel();
            }
        }
    }
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}
