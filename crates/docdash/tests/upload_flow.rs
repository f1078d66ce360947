//! End-to-end orchestration tests: submission results tracked through a
//! session, with progress reports observed the way the UI would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use docdash::{
    BatchCondition, BatchStreamEvent, BatchSubmissionResult, BatchUploadSession, FailureRecord,
    ImmediateSuccess, JobDescriptor, JobPollResponse, JobStatusSource, PollError, ProgressReport,
    RawFailure, ResultRef, SessionSlot, TrackerOptions,
};

/// Scripted status source: per job, a sequence of poll results consumed
/// one at a time; the last entry repeats once exhausted.
struct ScriptedSource {
    scripts: Mutex<HashMap<String, Vec<Result<JobPollResponse, PollError>>>>,
    polls: AtomicUsize,
}

impl ScriptedSource {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            polls: AtomicUsize::new(0),
        }
    }

    fn script(self, job_id: &str, results: Vec<Result<JobPollResponse, PollError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_id.to_string(), results);
        self
    }
}

#[async_trait]
impl JobStatusSource for ScriptedSource {
    async fn poll(&self, job_id: &str) -> Result<JobPollResponse, PollError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .get_mut(job_id)
            .unwrap_or_else(|| panic!("unexpected poll for {}", job_id));
        if script.len() > 1 {
            script.remove(0)
        } else {
            script[0].clone()
        }
    }
}

fn poll_response(json: &str) -> JobPollResponse {
    serde_json::from_str(json).unwrap()
}

fn descriptor(job_id: &str, filename: &str) -> JobDescriptor {
    JobDescriptor {
        job_id: job_id.to_string(),
        filename: filename.to_string(),
    }
}

fn options() -> TrackerOptions {
    TrackerOptions {
        interval: Duration::from_millis(100),
        max_attempts: Some(50),
    }
}

async fn collect_until_complete(
    mut rx: broadcast::Receiver<ProgressReport>,
) -> Vec<ProgressReport> {
    let mut reports = Vec::new();
    loop {
        match rx.recv().await {
            Ok(report) => {
                let done = report.is_complete;
                reports.push(report);
                if done {
                    return reports;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return reports,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn mixed_sync_async_batch_reaches_full_completion() {
    // 3 files: one resolved synchronously, two deferred jobs.
    let submission = BatchSubmissionResult {
        jobs: vec![descriptor("job-a", "a.pdf"), descriptor("job-b", "b.pdf")],
        items: vec![ImmediateSuccess {
            filename: "c.pdf".to_string(),
            result_ref: ResultRef::Document("doc-c".to_string()),
        }],
        failures: vec![],
        total_files: 3,
    };

    let source = Arc::new(
        ScriptedSource::new()
            .script(
                "job-a",
                vec![Ok(poll_response(r#"{"status": "SUCCESS", "documentId": "doc-a"}"#))],
            )
            .script(
                "job-b",
                vec![
                    Ok(poll_response(r#"{"status": "RUNNING"}"#)),
                    Ok(poll_response(r#"{"status": "SUCCESS", "documentId": "doc-b"}"#)),
                ],
            ),
    );

    let session = BatchUploadSession::from_submission(submission, source, options());
    let reports = collect_until_complete(session.subscribe_reports()).await;

    let percentages: Vec<u8> = reports.iter().map(|r| r.percentage).collect();
    assert_eq!(percentages, vec![33, 67, 100]);
    assert!(percentages.windows(2).all(|w| w[1] >= w[0]));

    let last = reports.last().unwrap();
    assert_eq!(last.condition, BatchCondition::Completed);
    assert_eq!(last.summary.created, 3);
    assert_eq!(last.summary.failed, 0);
    assert!(last.summary.failed_files.is_empty());

    while session.is_uploading() {
        tokio::task::yield_now().await;
    }
    assert!(session.timer_stopped());
}

#[tokio::test(start_paused = true)]
async fn local_reject_and_failed_job_fill_one_failure_table() {
    // 2 files: one rejected before submission, one accepted as a job that
    // later fails.
    let submission = BatchSubmissionResult {
        jobs: vec![descriptor("job-1", "file2.pdf")],
        items: vec![],
        failures: vec![RawFailure::local("file1.pdf", "Missing document type")],
        total_files: 2,
    };

    let source = Arc::new(ScriptedSource::new().script(
        "job-1",
        vec![
            Ok(poll_response(r#"{"status": "RUNNING"}"#)),
            Ok(poll_response(
                r#"{"status": "FAILED", "errorMessage": "corrupt file"}"#,
            )),
        ],
    ));

    let session = BatchUploadSession::from_submission(submission, source, options());
    let reports = collect_until_complete(session.subscribe_reports()).await;

    let last = reports.last().unwrap();
    assert_eq!(last.condition, BatchCondition::Failed);
    assert_eq!(last.summary.created, 0);
    assert_eq!(last.summary.failed, 2);

    let reasons: Vec<&str> = last
        .summary
        .failed_files
        .iter()
        .map(|record| match record {
            FailureRecord::Error { reason, .. } => reason.as_str(),
            FailureRecord::Duplicate { .. } => panic!("no duplicates in this batch"),
        })
        .collect();
    assert!(reasons.contains(&"Missing document type"));
    assert!(reasons.contains(&"corrupt file"));

    // Per-file failures never color the batch indicator as an error.
    assert!(!last.is_error());
    assert!(!session.is_uploading());
}

#[tokio::test(start_paused = true)]
async fn duplicate_failure_from_polling_links_existing_record() {
    let submission = BatchSubmissionResult {
        jobs: vec![descriptor("job-1", "invoice.pdf")],
        items: vec![],
        failures: vec![],
        total_files: 1,
    };

    let source = Arc::new(ScriptedSource::new().script(
        "job-1",
        vec![Ok(poll_response(
            r#"{"status": "FAILED", "errorMessage": "already imported",
                "duplicateOf": "inv-77", "extractedFields": {"amount": "99.50"}}"#,
        ))],
    ));

    let session = BatchUploadSession::from_submission(submission, source, options());
    let reports = collect_until_complete(session.subscribe_reports()).await;

    let last = reports.last().unwrap();
    assert_eq!(last.summary.failed, 1);
    match &last.summary.failed_files[0] {
        FailureRecord::Duplicate {
            file,
            duplicate_of,
            extracted_fields,
        } => {
            assert_eq!(file, "invoice.pdf");
            assert_eq!(duplicate_of, "inv-77");
            assert!(extracted_fields.is_some());
        }
        FailureRecord::Error { .. } => panic!("duplicate reference lost to the error bucket"),
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_end_as_informational_timeout() {
    let submission = BatchSubmissionResult {
        jobs: vec![descriptor("job-1", "slow.pdf")],
        items: vec![],
        failures: vec![],
        total_files: 1,
    };

    let source = Arc::new(
        ScriptedSource::new()
            .script("job-1", vec![Ok(poll_response(r#"{"status": "RUNNING"}"#))]),
    );

    let tracker_options = TrackerOptions {
        interval: Duration::from_millis(100),
        max_attempts: Some(3),
    };
    let session = BatchUploadSession::from_submission(submission, source, tracker_options);
    let reports = collect_until_complete(session.subscribe_reports()).await;

    let last = reports.last().unwrap();
    assert_eq!(last.condition, BatchCondition::TimedOut);
    assert!(!last.is_error(), "timeout is informational, not an error");

    while session.is_uploading() {
        tokio::task::yield_now().await;
    }
}

/// Source that parks every poll until released, so cancellation can land
/// while a request is in flight.
struct GatedSource {
    gate: Arc<tokio::sync::Notify>,
    polls: AtomicUsize,
}

#[async_trait]
impl JobStatusSource for GatedSource {
    async fn poll(&self, _job_id: &str) -> Result<JobPollResponse, PollError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(poll_response(r#"{"status": "SUCCESS"}"#))
    }
}

#[tokio::test(start_paused = true)]
async fn cancelling_mid_poll_writes_nothing_afterwards() {
    let submission = BatchSubmissionResult {
        jobs: vec![descriptor("job-1", "a.pdf")],
        items: vec![],
        failures: vec![],
        total_files: 1,
    };

    let gate = Arc::new(tokio::sync::Notify::new());
    let source = Arc::new(GatedSource {
        gate: Arc::clone(&gate),
        polls: AtomicUsize::new(0),
    });

    let session =
        BatchUploadSession::from_submission(submission, Arc::clone(&source) as _, options());
    let mut reports = session.subscribe_reports();

    // Seed report arrives, then the first poll parks on the gate.
    let seed = reports.recv().await.unwrap();
    assert!(!seed.is_complete);
    while source.polls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    session.cancel();
    gate.notify_waiters();

    while !session.is_finished() {
        tokio::task::yield_now().await;
    }

    // The response that resolved after cancellation produced no report.
    assert!(matches!(
        reports.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
            | Err(broadcast::error::TryRecvError::Closed)
    ));
    assert!(!session.is_uploading());
    assert!(session.timer_stopped());
}

#[tokio::test(start_paused = true)]
async fn push_stream_session_matches_polling_surface() {
    let submission = BatchSubmissionResult {
        jobs: vec![descriptor("job-1", "a.pdf"), descriptor("job-2", "b.pdf")],
        items: vec![],
        failures: vec![],
        total_files: 2,
    };

    let (tx, events) = mpsc::channel::<Result<BatchStreamEvent, PollError>>(8);
    let session = BatchUploadSession::from_stream(submission, events);
    let reports_rx = session.subscribe_reports();

    tx.send(Ok(serde_json::from_str(
        r#"{"status": "processing", "percentage": 50, "current": 1, "total": 2,
            "message": "Processing a.pdf"}"#,
    )
    .unwrap()))
    .await
    .unwrap();
    tx.send(Ok(serde_json::from_str(
        r#"{"status": "completed", "percentage": 100,
            "summary": {"created": 2, "failed": 0, "failedFiles": []}}"#,
    )
    .unwrap()))
    .await
    .unwrap();

    let reports = collect_until_complete(reports_rx).await;
    let percentages: Vec<u8> = reports.iter().map(|r| r.percentage).collect();
    assert!(percentages.windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(*percentages.last().unwrap(), 100);

    let last = reports.last().unwrap();
    assert_eq!(last.condition, BatchCondition::Completed);
    assert_eq!(last.summary.created, 2);
}

#[tokio::test(start_paused = true)]
async fn starting_a_new_batch_tears_down_the_previous_session() {
    let first_submission = BatchSubmissionResult {
        jobs: vec![descriptor("job-1", "a.pdf")],
        items: vec![],
        failures: vec![],
        total_files: 1,
    };
    let second_submission = BatchSubmissionResult {
        jobs: vec![descriptor("job-2", "b.pdf")],
        items: vec![],
        failures: vec![],
        total_files: 1,
    };

    let slow = Arc::new(
        ScriptedSource::new()
            .script("job-1", vec![Ok(poll_response(r#"{"status": "RUNNING"}"#))]),
    );
    let fast = Arc::new(
        ScriptedSource::new()
            .script("job-2", vec![Ok(poll_response(r#"{"status": "SUCCESS"}"#))]),
    );

    let slot = SessionSlot::new();
    let first = BatchUploadSession::from_submission(first_submission, slow, options());
    slot.install(Arc::clone(&first));

    let second = BatchUploadSession::from_submission(second_submission, fast, options());
    let second_reports = second.subscribe_reports();
    slot.install(Arc::clone(&second));

    assert!(!first.is_uploading());
    assert!(first.timer_stopped());

    let reports = collect_until_complete(second_reports).await;
    assert_eq!(reports.last().unwrap().condition, BatchCondition::Completed);
}
