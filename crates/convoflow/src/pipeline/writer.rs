use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::pipeline::model::{ClassificationResult, RecordStatus, SourceId};
use crate::pipeline::retry::{retry_with_backoff, RetryPolicy};
use crate::store::ConversationStore;

/// Persists one result per item as soon as it is classified, over the same
/// pool used for page reads.
#[derive(Clone)]
pub struct ResultWriter {
    store: Arc<dyn ConversationStore>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ResultWriter {
    pub fn new(store: Arc<dyn ConversationStore>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            store,
            timeout,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Single attempt bounded by the write timeout.
    pub async fn write(&self, result: &ClassificationResult) -> Result<(), StoreError> {
        match tokio::time::timeout(self.timeout, self.store.insert_result(result)).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    /// [`Self::write`] retried locally for transient failures.
    pub async fn write_with_retry(&self, result: &ClassificationResult) -> Result<(), StoreError> {
        retry_with_backoff(&self.retry, "write_result", || self.write(result)).await
    }

    /// Advisory status update. Failures are logged and swallowed.
    pub async fn mark_status(&self, id: SourceId, status: RecordStatus) {
        let res = match tokio::time::timeout(self.timeout, self.store.mark_status(id, status)).await
        {
            Ok(res) => res,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        if let Err(e) = res {
            tracing::warn!(
                source_id = id,
                status = status.as_str(),
                error = %e,
                "advisory status update failed"
            );
        }
    }
}
