use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use crate::error::StoreError;
use crate::pipeline::model::{ClassificationResult, RecordStatus, SourceId, SourceRecord};
use crate::store::ConversationStore;

#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----------------------------
    // Seeding / operator helpers
    // ----------------------------

    pub async fn insert_conversation(&self, payload: Value) -> Result<SourceId, StoreError> {
        let id: SourceId = sqlx::query_scalar(
            r#"
            INSERT INTO conversations (payload, status)
            VALUES ($1, 'pending')
            RETURNING id
            "#,
        )
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get_result(
        &self,
        source_id: SourceId,
    ) -> Result<Option<ClassificationResult>, StoreError> {
        let row = sqlx::query_as::<_, ClassificationResult>(
            r#"
            SELECT source_id, classification, processed_at, batch_job_id, processing_duration_ms
            FROM classification_results
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)::bigint
            FROM conversations
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_after(
        &self,
        after_id: Option<SourceId>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query_as::<_, SourceRecord>(
            r#"
            SELECT id, payload, status, last_processed_at
            FROM conversations
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(after_id.unwrap_or(SourceId::MIN))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_after(&self, after_id: Option<SourceId>) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE id > $1")
            .bind(after_id.unwrap_or(SourceId::MIN))
            .fetch_one(&self.pool)
            .await?;

        Ok(n.max(0) as u64)
    }

    async fn insert_result(&self, result: &ClassificationResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO classification_results
                (source_id, classification, processed_at, batch_job_id, processing_duration_ms)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_id) DO NOTHING
            "#,
        )
        .bind(result.source_id)
        .bind(&result.classification)
        .bind(result.processed_at)
        .bind(&result.batch_job_id)
        .bind(result.processing_duration_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn existing_results(&self, ids: &[SourceId]) -> Result<HashSet<SourceId>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let found: Vec<SourceId> = sqlx::query_scalar(
            r#"
            SELECT source_id
            FROM classification_results
            WHERE source_id = ANY($1)
            "#,
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        Ok(found.into_iter().collect())
    }

    async fn mark_status(&self, id: SourceId, status: RecordStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET status = $2,
                last_processed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
