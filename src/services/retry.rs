use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::SyncRetryConfig;
use crate::db::models::{BackoffPolicy, SyncStatusRecord};
use crate::db::repository::SyncStatusRepository;
use crate::error::AppResult;
use crate::services::calendar_sync::{CalendarSyncService, SyncAttempt, SyncOutcome};

/// Totals for one sweep or one bulk manual retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweepSummary {
    pub total_retried: u32,
    pub total_synced: u32,
    pub total_failed: u32,
}

impl RetrySweepSummary {
    /// Attempts with no target never reached a server and are not counted.
    fn record(&mut self, attempt: &SyncAttempt) {
        match attempt.outcome {
            SyncOutcome::Synced => self.total_synced += 1,
            SyncOutcome::Failed => self.total_failed += 1,
            SyncOutcome::NoTargets => return,
        }
        self.total_retried += 1;
    }
}

/// Periodic and manual re-entry into the orchestrator for rows stuck in
/// `pending` or `failed`.
pub struct RetryScheduler {
    pool: SqlitePool,
    sync: Arc<CalendarSyncService>,
    backoff: BackoffPolicy,
    batch_size: i64,
}

impl RetryScheduler {
    pub fn new(pool: SqlitePool, sync: Arc<CalendarSyncService>, config: &SyncRetryConfig) -> Self {
        Self {
            pool,
            sync,
            backoff: BackoffPolicy::new(config.backoff_floor_seconds, config.max_backoff_seconds),
            batch_size: config.batch_size.max(1) as i64,
        }
    }

    /// Retry every row that is below `max_retries` and past its backoff at
    /// `now`. Rows that reached the cap stay `failed` and are never picked up
    /// again by a sweep.
    pub async fn run(&self, max_retries: u32, now: DateTime<Utc>) -> AppResult<RetrySweepSummary> {
        let max_retries = max_retries as i64;
        let rows = SyncStatusRepository::list_retryable(
            &self.pool,
            max_retries,
            &self.backoff,
            now.naive_utc(),
            self.batch_size,
        )
        .await?;

        let mut summary = RetrySweepSummary::default();
        if rows.is_empty() {
            tracing::debug!("No sync records due for retry");
            return Ok(summary);
        }

        for row in rows {
            if let Some(attempt) = self
                .sync
                .retry(&row.user_id, &row.item_id, Some(max_retries))
                .await
            {
                summary.record(&attempt);
            }
        }

        tracing::info!(
            "Sync retry sweep: {} retried, {} synced, {} failed",
            summary.total_retried,
            summary.total_synced,
            summary.total_failed
        );

        Ok(summary)
    }

    /// Manual "retry now" for one row, ignoring backoff and cap. `None` when
    /// the row does not exist or is not in a retryable state.
    pub async fn retry_now(&self, user_id: &str, item_id: &str) -> Option<SyncStatusRecord> {
        self.sync
            .retry(user_id, item_id, None)
            .await
            .map(|attempt| attempt.record)
    }

    /// Manual retry of all of a user's `failed` rows.
    pub async fn retry_failed_for_user(&self, user_id: &str) -> AppResult<RetrySweepSummary> {
        let rows = SyncStatusRepository::list_failed_by_user(&self.pool, user_id).await?;

        let mut summary = RetrySweepSummary::default();
        for row in rows {
            if let Some(attempt) = self.sync.retry(&row.user_id, &row.item_id, None).await {
                summary.record(&attempt);
            }
        }

        Ok(summary)
    }
}
