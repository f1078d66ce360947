//! Scoped elapsed-time and per-item clocks for a batch session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Display resolution of the clocks.
const TICK_RESOLUTION: Duration = Duration::from_millis(100);

/// One clock reading, formatted for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockReading {
    pub elapsed: String,
    pub current_item: String,
}

/// Elapsed-time and per-item timers for one batch session.
///
/// Created with [`BatchTimer::start`], which also spawns a ticker task
/// broadcasting a [`ClockReading`] every 100 ms for UI binding. The
/// ticker checks the stopped flag at the start of every tick, so a tick
/// already scheduled when [`BatchTimer::stop`] runs publishes nothing.
/// Dropping the timer stops it, covering early navigation paths.
pub struct BatchTimer {
    started: Instant,
    item_started: Mutex<Instant>,
    stopped: AtomicBool,
    stopped_at: Mutex<Option<Instant>>,
    sender: broadcast::Sender<ClockReading>,
}

impl BatchTimer {
    /// Starts the timer and its ticker task. Must be called from within a
    /// tokio runtime.
    pub fn start() -> Arc<Self> {
        let (sender, _) = broadcast::channel(16);
        let now = Instant::now();
        let timer = Arc::new(Self {
            started: now,
            item_started: Mutex::new(now),
            stopped: AtomicBool::new(false),
            stopped_at: Mutex::new(None),
            sender,
        });

        let weak: Weak<BatchTimer> = Arc::downgrade(&timer);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_RESOLUTION);
            interval.tick().await; // the first tick completes immediately
            loop {
                interval.tick().await;
                let Some(timer) = weak.upgrade() else {
                    break;
                };
                // Checked before anything else, every tick.
                if timer.stopped.load(Ordering::Acquire) {
                    break;
                }
                // Ignore errors - no active receivers is fine
                let _ = timer.sender.send(timer.reading());
            }
        });

        timer
    }

    /// Creates a new subscriber for clock readings.
    pub fn subscribe(&self) -> broadcast::Receiver<ClockReading> {
        self.sender.subscribe()
    }

    fn end_instant(&self) -> Instant {
        self.stopped_at
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .unwrap_or_else(Instant::now)
    }

    /// Time since the batch was submitted, frozen once stopped.
    pub fn elapsed(&self) -> Duration {
        self.end_instant().duration_since(self.started)
    }

    pub fn elapsed_display(&self) -> String {
        format_clock(self.elapsed())
    }

    /// Time spent on the current unit of work, frozen once stopped.
    pub fn current_item(&self) -> Duration {
        let item_started = self
            .item_started
            .lock()
            .map(|guard| *guard)
            .unwrap_or(self.started);
        self.end_instant().duration_since(item_started)
    }

    pub fn current_item_display(&self) -> String {
        format_clock(self.current_item())
    }

    /// Resets the per-item clock. Called when the orchestrator observes a
    /// new unit of work beginning; best-effort and display-only.
    pub fn mark_new_item(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut guard) = self.item_started.lock() {
            *guard = Instant::now();
        }
    }

    pub fn reading(&self) -> ClockReading {
        ClockReading {
            elapsed: self.elapsed_display(),
            current_item: self.current_item_display(),
        }
    }

    /// Stops both clocks immediately. Idempotent; later calls are no-ops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut guard) = self.stopped_at.lock() {
            *guard = Some(Instant::now());
        }
        debug!("Batch timer stopped at {}", self.elapsed_display());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for BatchTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Formats a duration as `M:SS.t`, truncated to 100 ms.
fn format_clock(duration: Duration) -> String {
    let tenths = duration.as_millis() / 100;
    let minutes = tenths / 600;
    let seconds = (tenths % 600) / 10;
    let tenth = tenths % 10;
    format!("{}:{:02}.{}", minutes, seconds, tenth)
}
