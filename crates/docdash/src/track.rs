//! Cancellable polling loop over a batch's pending jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::PollError;
use crate::job::JobState;
use crate::source::JobStatusSource;

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Delay between polling ticks.
    pub interval: Duration,
    /// Maximum number of ticks before giving up on remaining jobs.
    pub max_attempts: Option<u32>,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: None,
        }
    }
}

/// Why tracking for a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Every job reached a terminal status.
    Completed,
    /// The backend no longer knows the batch session.
    SessionExpired,
    /// The attempt cap was exhausted with jobs still pending. Informational;
    /// remaining jobs keep their last known status for a later manual refresh.
    TimedOut,
    Cancelled,
}

/// Consistent view of the whole batch after one polling tick.
///
/// Published only after every poll of the tick has been joined, so
/// consumers never observe a half-updated job set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub tick: u32,
    pub jobs: Vec<JobState>,
    /// Progress percentage as reported by a push-based status stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_percentage: Option<u8>,
    /// Activity message from a push-based status stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalReason>,
    pub timestamp: DateTime<Utc>,
}

impl BatchSnapshot {
    pub fn new(tick: u32, jobs: Vec<JobState>) -> Self {
        Self {
            tick,
            jobs,
            reported_percentage: None,
            status_message: None,
            terminal: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_terminal(mut self, reason: TerminalReason) -> Self {
        self.terminal = Some(reason);
        self
    }

    pub fn terminal_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_terminal()).count()
    }

    pub fn all_jobs_terminal(&self) -> bool {
        self.jobs.iter().all(JobState::is_terminal)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }
}

/// Publishes a snapshot unless the batch was cancelled in the meantime.
///
/// The cancellation check runs on every publication, independent of the
/// timer teardown, so responses resolving after `cancel()` cannot leak
/// state to consumers.
pub(crate) fn publish(
    sender: &broadcast::Sender<BatchSnapshot>,
    cancelled: &AtomicBool,
    snapshot: BatchSnapshot,
) {
    if cancelled.load(Ordering::Acquire) {
        return;
    }
    // Ignore errors - no active receivers is fine
    let _ = sender.send(snapshot);
}

/// Tracks a batch of deferred jobs to completion by polling.
///
/// One tracker owns one batch session. Each tick polls all still-pending
/// jobs concurrently, joins the results, applies them to the job set and
/// publishes a [`BatchSnapshot`]. The loop ends when every job is
/// terminal, the session is unknown to the backend, the attempt cap is
/// exhausted, or [`JobTracker::cancel`] is called.
pub struct JobTracker {
    options: TrackerOptions,
    cancelled: Arc<AtomicBool>,
    sender: broadcast::Sender<BatchSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobTracker {
    pub fn new(options: TrackerOptions) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
            sender,
            task: Mutex::new(None),
        }
    }

    /// Creates a new subscriber for batch snapshots. Subscribe before
    /// calling [`JobTracker::start`] to observe the seed snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchSnapshot> {
        self.sender.subscribe()
    }

    /// Starts the polling loop over the given job set.
    pub fn start(&self, states: Vec<JobState>, source: Arc<dyn JobStatusSource>) {
        let handle = tokio::spawn(run_poll_loop(
            states,
            source,
            self.options.clone(),
            Arc::clone(&self.cancelled),
            self.sender.clone(),
        ));
        if let Ok(mut guard) = self.task.lock() {
            *guard = Some(handle);
        }
    }

    /// Stops the loop and suppresses all further snapshot publications.
    /// Idempotent, and safe to call after the loop finished naturally.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
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

impl Drop for JobTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_poll_loop(
    mut states: Vec<JobState>,
    source: Arc<dyn JobStatusSource>,
    options: TrackerOptions,
    cancelled: Arc<AtomicBool>,
    sender: broadcast::Sender<BatchSnapshot>,
) {
    // Seed snapshot: immediate outcomes are visible before the first poll.
    publish(&sender, &cancelled, BatchSnapshot::new(0, states.clone()));

    if states.iter().all(JobState::is_terminal) {
        info!("Batch fully resolved by the submission response, nothing to poll");
        publish(
            &sender,
            &cancelled,
            BatchSnapshot::new(0, states).with_terminal(TerminalReason::Completed),
        );
        return;
    }

    let mut interval = tokio::time::interval(options.interval);
    interval.tick().await; // the first tick completes immediately

    let mut tick: u32 = 0;
    let mut attempts: u32 = 0;

    loop {
        interval.tick().await;
        if cancelled.load(Ordering::Acquire) {
            debug!("Batch tracking cancelled after {} ticks", tick);
            return;
        }
        tick += 1;
        attempts += 1;

        let pending: Vec<(usize, String)> = states
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(i, s)| (i, s.job_id.clone()))
            .collect();
        let pending_count = pending.len();

        let polls = pending.iter().map(|(_, job_id)| source.poll(job_id));
        let results = futures_util::future::join_all(polls).await;

        // Responses that resolved after cancellation must not write state.
        if cancelled.load(Ordering::Acquire) {
            debug!("Batch tracking cancelled mid-tick {}", tick);
            return;
        }

        let mut session_lost = false;
        let now = Utc::now();
        {
            let _span =
                tracing::info_span!("batch.tick", tick, pending = pending_count).entered();

            for ((idx, job_id), result) in pending.into_iter().zip(results) {
                match result {
                    Ok(response) => {
                        if states[idx].apply(&response.to_update(), now) {
                            debug!("Job {} is now {}", job_id, states[idx].status);
                        }
                    }
                    Err(PollError::SessionNotFound) => {
                        warn!(
                            "Batch session unknown to backend (job {}), stopping polls",
                            job_id
                        );
                        session_lost = true;
                    }
                    // A failed status check is not a failed job: keep the
                    // last known status and retry next tick.
                    Err(e) => debug!("Status unknown this tick for job {}: {}", job_id, e),
                }
            }
        }

        if session_lost {
            publish(
                &sender,
                &cancelled,
                BatchSnapshot::new(tick, states).with_terminal(TerminalReason::SessionExpired),
            );
            return;
        }

        if states.iter().all(JobState::is_terminal) {
            info!("Batch finished after {} polling ticks", tick);
            publish(
                &sender,
                &cancelled,
                BatchSnapshot::new(tick, states).with_terminal(TerminalReason::Completed),
            );
            return;
        }

        if let Some(max) = options.max_attempts {
            if attempts >= max {
                let remaining = states.iter().filter(|s| !s.is_terminal()).count();
                info!(
                    "Giving up after {} polling attempts with {} jobs still pending",
                    attempts, remaining
                );
                publish(
                    &sender,
                    &cancelled,
                    BatchSnapshot::new(tick, states).with_terminal(TerminalReason::TimedOut),
                );
                return;
            }
        }

        publish(&sender, &cancelled, BatchSnapshot::new(tick, states.clone()));
    }
}
