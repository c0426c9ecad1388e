pub mod batch_files;
pub mod checkpoint;
pub mod concurrency;
pub mod error_codes;
pub mod item;
pub mod model;
pub mod orchestrator;
pub mod pager;
pub mod retry;
pub mod retry_queue;
pub mod writer;

pub use batch_files::{BatchFileStore, CompletedMarker};
pub use checkpoint::{Checkpoint, CheckpointTracker, RunStatistics};
pub use concurrency::{ConcurrencyController, DispatchReport, Dispatched};
pub use error_codes::ErrorCode;
pub use item::{ItemOutcome, ItemProcessor};
pub use model::{
    BatchFile, ClassificationResult, PermanentFailure, RecordStatus, RetryQueueEntry,
    RetryStatus, SourceId, SourceRecord,
};
pub use orchestrator::{Orchestrator, RunOutcome, RunSummary};
pub use pager::{CursorPager, Page};
pub use retry::{ErrorClass, RetryConfig, RetryPolicy};
pub use retry_queue::{DrainReport, RetryQueueProcessor};
pub use writer::ResultWriter;
