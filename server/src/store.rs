//! Durable record storage behind the relay.
//!
//! DESIGN
//! ======
//! Writes are guarded by last-write-wins on `last_modified`: an upsert whose
//! stamp is not strictly newer than the stored row is a no-op, and callers
//! only publish a change-stream event for writes that were applied. Stamps
//! are fixed-width ISO-8601 strings, so text comparison orders them.

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use boardsync::frame::ErrorCode;
use boardsync::{PersistedRecord, Timestamp};
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every record on `board_id`, ordered by stack order then id.
    async fn list(&self, board_id: &str) -> Result<Vec<PersistedRecord>, StoreError>;

    /// Insert or overwrite. Returns false when the stored row is as new or newer.
    async fn upsert(&self, record: &PersistedRecord) -> Result<bool, StoreError>;

    /// Returns false when there was nothing to delete.
    async fn delete(&self, board_id: &str, id: &str) -> Result<bool, StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

type RecordRow = (String, String, String, serde_json::Value, f64, f64, f64, f64, i64, Option<String>, String);

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: RecordRow) -> PersistedRecord {
    let (id, board_id, kind, attributes, x, y, width, height, stack_order, creator_id, last_modified) = row;
    PersistedRecord {
        id,
        board_id,
        kind,
        attributes,
        x,
        y,
        width,
        height,
        stack_order,
        creator_id,
        last_modified: Timestamp::new(last_modified),
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn list(&self, board_id: &str) -> Result<Vec<PersistedRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            "SELECT id, board_id, kind, attributes, x, y, width, height, stack_order, creator_id, last_modified \
             FROM board_objects WHERE board_id = $1 ORDER BY stack_order, id",
        )
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_record).collect())
    }

    async fn upsert(&self, record: &PersistedRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO board_objects \
                 (id, board_id, kind, attributes, x, y, width, height, stack_order, creator_id, last_modified) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (board_id, id) DO UPDATE SET \
                 kind = EXCLUDED.kind, attributes = EXCLUDED.attributes, \
                 x = EXCLUDED.x, y = EXCLUDED.y, width = EXCLUDED.width, height = EXCLUDED.height, \
                 stack_order = EXCLUDED.stack_order, last_modified = EXCLUDED.last_modified \
             WHERE board_objects.last_modified < EXCLUDED.last_modified",
        )
        .bind(&record.id)
        .bind(&record.board_id)
        .bind(&record.kind)
        .bind(&record.attributes)
        .bind(record.x)
        .bind(record.y)
        .bind(record.width)
        .bind(record.height)
        .bind(record.stack_order)
        .bind(&record.creator_id)
        .bind(record.last_modified.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, board_id: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM board_objects WHERE board_id = $1 AND id = $2")
            .bind(board_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// MEMORY
// =============================================================================

/// Process-local store for development without `DATABASE_URL` and for tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    boards: Mutex<HashMap<String, HashMap<String, PersistedRecord>>>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn boards(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, PersistedRecord>>> {
        self.boards.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list(&self, board_id: &str) -> Result<Vec<PersistedRecord>, StoreError> {
        let mut records: Vec<PersistedRecord> = self
            .boards()
            .get(board_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.stack_order.cmp(&b.stack_order).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn upsert(&self, record: &PersistedRecord) -> Result<bool, StoreError> {
        let mut boards = self.boards();
        let rows = boards.entry(record.board_id.clone()).or_default();
        let newer = rows
            .get(&record.id)
            .is_none_or(|stored| record.last_modified > stored.last_modified);
        if newer {
            // The creator is fixed by the first write.
            let creator_id = rows.get(&record.id).and_then(|stored| stored.creator_id.clone());
            let mut record = record.clone();
            if creator_id.is_some() {
                record.creator_id = creator_id;
            }
            rows.insert(record.id.clone(), record);
        }
        Ok(newer)
    }

    async fn delete(&self, board_id: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .boards()
            .get_mut(board_id)
            .is_some_and(|rows| rows.remove(id).is_some()))
    }
}
