use chrono::{NaiveDateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::models::{
    BackoffPolicy, ItemType, MealSlot, SyncStatus, SyncStatusRecord, SyncSummary, UpsertSyncStatus,
};
use crate::error::{AppError, AppResult};

const RECORD_COLUMNS: &str = r#"
    id,
    user_id,
    item_id,
    item_type,
    planned_item_id,
    event_title,
    event_description,
    event_url,
    scheduled_date,
    meal_slot,
    sync_status,
    caldav_event_uid,
    retry_count,
    error_message,
    last_sync_at,
    created_at,
    updated_at
"#;

fn decode_enum<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: TryFrom<String, Error = String>,
{
    let raw: String = row.try_get(column)?;
    T::try_from(raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.into(),
    })
}

fn map_record(row: SqliteRow) -> Result<SyncStatusRecord, sqlx::Error> {
    Ok(SyncStatusRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        item_id: row.try_get("item_id")?,
        item_type: decode_enum::<ItemType>(&row, "item_type")?,
        planned_item_id: row.try_get("planned_item_id")?,
        event_title: row.try_get("event_title")?,
        event_description: row.try_get("event_description")?,
        event_url: row.try_get("event_url")?,
        scheduled_date: row.try_get("scheduled_date")?,
        meal_slot: decode_enum::<MealSlot>(&row, "meal_slot")?,
        sync_status: decode_enum::<SyncStatus>(&row, "sync_status")?,
        caldav_event_uid: row.try_get("caldav_event_uid")?,
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
        last_sync_at: row.try_get("last_sync_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Repository for `sync_status_records`, the source of truth for the sync
/// state machine.
///
/// The store does not validate transitions; the orchestrator does. The one
/// guard it does apply: `mark_synced` and `mark_failed` are conditional
/// updates that never touch a `removed` row, so an attempt that finishes after
/// the item was deleted cannot bring it back.
pub struct SyncStatusRepository;

impl SyncStatusRepository {
    /// Create the row for `(user_id, item_id)` in `pending`, or move an
    /// existing row back to `pending` with the new title/schedule.
    ///
    /// `retry_count` and `error_message` restart only when the previous cycle
    /// had ended (`synced` or `removed`); a row that is still failing keeps its
    /// count so repeated edits cannot dodge the retry cap. The stored
    /// `caldav_event_uid` is kept so the orchestrator can delete the old
    /// remote event before creating its replacement.
    pub async fn upsert_pending(
        pool: &SqlitePool,
        upsert: UpsertSyncStatus,
    ) -> AppResult<SyncStatusRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let sql = format!(
            r#"
            INSERT INTO sync_status_records (
                id,
                user_id,
                item_id,
                item_type,
                planned_item_id,
                event_title,
                event_description,
                event_url,
                scheduled_date,
                meal_slot,
                sync_status,
                caldav_event_uid,
                retry_count,
                error_message,
                last_sync_at,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, 0, NULL, NULL, ?, ?)
            ON CONFLICT(user_id, item_id) DO UPDATE SET
                item_type = excluded.item_type,
                planned_item_id = excluded.planned_item_id,
                event_title = excluded.event_title,
                event_description = excluded.event_description,
                event_url = excluded.event_url,
                scheduled_date = excluded.scheduled_date,
                meal_slot = excluded.meal_slot,
                retry_count = CASE
                    WHEN sync_status IN ('synced', 'removed') THEN 0
                    ELSE retry_count
                END,
                error_message = CASE
                    WHEN sync_status IN ('synced', 'removed') THEN NULL
                    ELSE error_message
                END,
                sync_status = 'pending',
                updated_at = excluded.updated_at
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&upsert.user_id)
            .bind(&upsert.item_id)
            .bind(upsert.item_type.as_str())
            .bind(&upsert.planned_item_id)
            .bind(&upsert.event_title)
            .bind(&upsert.event_description)
            .bind(&upsert.event_url)
            .bind(upsert.scheduled_date)
            .bind(upsert.meal_slot.as_str())
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;

        map_record(row).map_err(AppError::Database)
    }

    /// Mark the row `synced` with the remote UID and clear the last error.
    ///
    /// Returns `None` when the row is missing or already `removed`.
    pub async fn mark_synced(
        pool: &SqlitePool,
        user_id: &str,
        item_id: &str,
        caldav_event_uid: &str,
    ) -> AppResult<Option<SyncStatusRecord>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE sync_status_records
            SET sync_status = 'synced',
                caldav_event_uid = ?,
                error_message = NULL,
                last_sync_at = ?,
                updated_at = ?
            WHERE user_id = ? AND item_id = ? AND sync_status != 'removed'
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(caldav_event_uid)
            .bind(now)
            .bind(now)
            .bind(user_id)
            .bind(item_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        row.map(map_record).transpose().map_err(AppError::Database)
    }

    /// Mark the row `failed`, bump `retry_count` and store the error.
    ///
    /// Returns `None` when the row is missing or already `removed`.
    pub async fn mark_failed(
        pool: &SqlitePool,
        user_id: &str,
        item_id: &str,
        error_message: &str,
    ) -> AppResult<Option<SyncStatusRecord>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE sync_status_records
            SET sync_status = 'failed',
                retry_count = retry_count + 1,
                error_message = ?,
                last_sync_at = ?,
                updated_at = ?
            WHERE user_id = ? AND item_id = ? AND sync_status != 'removed'
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(error_message)
            .bind(now)
            .bind(now)
            .bind(user_id)
            .bind(item_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        row.map(map_record).transpose().map_err(AppError::Database)
    }

    /// Record an attempt that had no target to go to: stamp `last_sync_at`
    /// without touching status or `retry_count`. Only `pending`/`failed` rows
    /// are stamped.
    pub async fn touch_attempt(
        pool: &SqlitePool,
        user_id: &str,
        item_id: &str,
    ) -> AppResult<Option<SyncStatusRecord>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE sync_status_records
            SET last_sync_at = ?,
                updated_at = ?
            WHERE user_id = ? AND item_id = ? AND sync_status IN ('pending', 'failed')
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(user_id)
            .bind(item_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        row.map(map_record).transpose().map_err(AppError::Database)
    }

    /// Forget a remote event UID once that event is gone from every target.
    /// Only an unsynced row still holding `uid` is changed.
    pub async fn clear_event_uid(
        pool: &SqlitePool,
        user_id: &str,
        item_id: &str,
        uid: &str,
    ) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE sync_status_records
            SET caldav_event_uid = NULL, updated_at = ?
            WHERE user_id = ? AND item_id = ? AND caldav_event_uid = ?
              AND sync_status IN ('pending', 'failed')
            "#,
        )
        .bind(now)
        .bind(user_id)
        .bind(item_id)
        .bind(uid)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark the row `removed`. Terminal; applies from any state.
    pub async fn mark_removed(
        pool: &SqlitePool,
        user_id: &str,
        item_id: &str,
    ) -> AppResult<Option<SyncStatusRecord>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            r#"
            UPDATE sync_status_records
            SET sync_status = 'removed',
                updated_at = ?
            WHERE user_id = ? AND item_id = ?
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .bind(user_id)
            .bind(item_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        row.map(map_record).transpose().map_err(AppError::Database)
    }

    /// Rows in `pending`/`failed` with `retry_count < max_retries` whose
    /// backoff has elapsed at `now`, oldest attempt first, at most `limit` rows.
    pub async fn list_retryable(
        pool: &SqlitePool,
        max_retries: i64,
        backoff: &BackoffPolicy,
        now: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<SyncStatusRecord>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM sync_status_records
            WHERE sync_status IN ('pending', 'failed')
              AND retry_count < ?
              AND CAST(strftime('%s', ?) AS INTEGER)
                  - CAST(strftime('%s', COALESCE(last_sync_at, updated_at)) AS INTEGER)
                  >= MIN(? << MIN(retry_count, ?), ?)
            ORDER BY COALESCE(last_sync_at, updated_at) ASC
            LIMIT ?
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(max_retries)
            .bind(now)
            .bind(backoff.floor_seconds)
            .bind(BackoffPolicy::MAX_DOUBLINGS)
            .bind(backoff.max_seconds)
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        rows.into_iter()
            .map(map_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::Database)
    }

    pub async fn list_by_user(pool: &SqlitePool, user_id: &str) -> AppResult<Vec<SyncStatusRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM sync_status_records
            WHERE user_id = ?
            ORDER BY scheduled_date ASC, created_at ASC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        rows.into_iter()
            .map(map_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::Database)
    }

    /// The user's `failed` rows, for the "retry all" action.
    pub async fn list_failed_by_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<SyncStatusRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM sync_status_records
            WHERE user_id = ? AND sync_status = 'failed'
            ORDER BY updated_at ASC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        rows.into_iter()
            .map(map_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::Database)
    }

    pub async fn get_by_item_id(
        pool: &SqlitePool,
        user_id: &str,
        item_id: &str,
    ) -> AppResult<Option<SyncStatusRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM sync_status_records
            WHERE user_id = ? AND item_id = ?
            "#
        );

        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(item_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        row.map(map_record).transpose().map_err(AppError::Database)
    }

    /// Count rows per status for one user. Statuses with no rows count as 0.
    pub async fn summary_by_user(pool: &SqlitePool, user_id: &str) -> AppResult<SyncSummary> {
        let rows = sqlx::query(
            r#"
            SELECT sync_status, COUNT(*) AS total
            FROM sync_status_records
            WHERE user_id = ?
            GROUP BY sync_status
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let mut summary = SyncSummary::default();
        for row in rows {
            let status = decode_enum::<SyncStatus>(&row, "sync_status").map_err(AppError::Database)?;
            let total: i64 = row.try_get("total").map_err(AppError::Database)?;
            match status {
                SyncStatus::Pending => summary.pending = total,
                SyncStatus::Synced => summary.synced = total,
                SyncStatus::Failed => summary.failed = total,
                SyncStatus::Removed => summary.removed = total,
            }
        }

        Ok(summary)
    }

    /// Detach the caller's rows from a scheduling row that no longer exists.
    /// The sync records themselves are kept for audit until purged.
    pub async fn clear_planned_item(
        pool: &SqlitePool,
        user_id: &str,
        planned_item_id: &str,
    ) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE sync_status_records
            SET planned_item_id = NULL, updated_at = ?
            WHERE planned_item_id = ? AND user_id = ?
            "#,
        )
        .bind(now)
        .bind(planned_item_id)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Delete `removed` rows last touched before `older_than`.
    pub async fn purge_removed(pool: &SqlitePool, older_than: NaiveDateTime) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_status_records
            WHERE sync_status = 'removed' AND updated_at < ?
            "#,
        )
        .bind(older_than)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}
