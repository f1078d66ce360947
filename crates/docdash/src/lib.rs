pub mod classify;
pub mod config;
pub mod error;
pub mod job;
pub mod progress;
pub mod session;
pub mod source;
pub mod stream;
pub mod submit;
pub mod timing;
pub mod track;

pub use classify::{classify, classify_job_state, FailureRecord, RawFailure, ResultSummary};
pub use config::UploadConfig;
pub use error::{ConfigError, DocdashError, PollError, Result, SubmitError};
pub use job::{
    BatchSubmissionResult, ImmediateSuccess, JobDescriptor, JobOutcome, JobState, JobStatus,
    JobUpdate, ResultRef,
};
pub use progress::{BatchCondition, ProgressAggregator, ProgressReport};
pub use session::{BatchUploadSession, SessionSlot};
pub use source::{HttpStatusSource, JobPollResponse, JobStatusSource};
pub use stream::{BatchStreamEvent, BatchStreamTracker, HttpBatchStream, SseParser, StreamPhase};
pub use submit::{BatchOptions, BatchSubmitter, Direction, FileMetadata, FileUpload};
pub use timing::{BatchTimer, ClockReading};
pub use track::{BatchSnapshot, JobTracker, TerminalReason, TrackerOptions};
