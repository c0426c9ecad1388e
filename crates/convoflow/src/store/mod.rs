use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::pipeline::model::{ClassificationResult, RecordStatus, SourceId, SourceRecord};

pub mod postgres;

pub use postgres::PgConversationStore;

/// Source conversations and classification results.
///
/// Reads and writes share one connection pool. No cross-table transaction is
/// assumed; the pipeline's batch files and retry queue provide end-to-end
/// consistency.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Cheap round trip used to fail fast at startup.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Records with `id > after_id` ascending, at most `limit` of them.
    async fn fetch_after(
        &self,
        after_id: Option<SourceId>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError>;

    /// Number of records with `id > after_id`, for ETA estimates.
    async fn count_after(&self, after_id: Option<SourceId>) -> Result<u64, StoreError>;

    /// Persist one result. Writing a second result for the same source id is
    /// a no-op, so a retried write whose first acknowledgement was lost never
    /// produces a duplicate.
    async fn insert_result(&self, result: &ClassificationResult) -> Result<(), StoreError>;

    /// Which of `ids` already have a result.
    async fn existing_results(&self, ids: &[SourceId]) -> Result<HashSet<SourceId>, StoreError>;

    /// Advisory status update; never consulted for correctness.
    async fn mark_status(&self, id: SourceId, status: RecordStatus) -> Result<(), StoreError>;
}
