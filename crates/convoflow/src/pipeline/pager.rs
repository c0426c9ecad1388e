use std::sync::Arc;

use crate::error::StoreError;
use crate::pipeline::model::{SourceId, SourceRecord};
use crate::store::ConversationStore;

/// One page read by [`CursorPager::next_page`].
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<SourceRecord>,
    /// Id of the last record in the page, or the input cursor when empty.
    pub new_last_id: Option<SourceId>,
    pub has_more: bool,
}

/// Keyset pagination over the source store.
///
/// The pager is stateless: the caller owns the cursor and only advances it
/// once the batch built from a page is terminal.
#[derive(Clone)]
pub struct CursorPager {
    store: Arc<dyn ConversationStore>,
}

impl CursorPager {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    pub async fn next_page(
        &self,
        after_id: Option<SourceId>,
        size: usize,
    ) -> Result<Page, StoreError> {
        let size = size.max(1);
        let mut records = self.store.fetch_after(after_id, size).await?;

        // keep the strict `id > after_id` ascending contract even if the
        // store misbehaves
        let fetched = records.len();
        records.sort_by_key(|r| r.id);
        records.dedup_by_key(|r| r.id);
        if let Some(after) = after_id {
            records.retain(|r| r.id > after);
        }
        if records.len() != fetched {
            tracing::warn!(
                ?after_id,
                fetched,
                kept = records.len(),
                "store returned out-of-range or duplicate ids"
            );
        }

        let has_more = fetched >= size;
        let new_last_id = records.last().map(|r| r.id).or(after_id);

        tracing::debug!(
            ?after_id,
            ?new_last_id,
            count = records.len(),
            has_more,
            "page fetched"
        );

        Ok(Page {
            records,
            new_last_id,
            has_more,
        })
    }
}
