use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::meal_slot::{ItemType, MealSlot};

/// State of one (user, item) synchronization record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
    Removed,
}

impl SyncStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            "removed" => Some(SyncStatus::Removed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Removed => "removed",
        }
    }

    /// Rows the retry sweep may pick up.
    pub fn is_retryable(self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }
}

impl TryFrom<String> for SyncStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("Invalid sync status: {}", value))
    }
}

/// A row of `sync_status_records`.
///
/// `caldav_event_uid` is always set while `sync_status` is `synced`; the
/// migration enforces this with a CHECK constraint. The `event_*`,
/// `scheduled_date` and `meal_slot` columns are captured at sync time so the
/// retry sweep can rebuild the event without asking the scheduling module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusRecord {
    pub id: String,
    pub user_id: String,
    pub item_id: String,
    pub item_type: ItemType,
    pub planned_item_id: Option<String>,
    pub event_title: String,
    pub event_description: Option<String>,
    pub event_url: Option<String>,
    pub scheduled_date: NaiveDate,
    pub meal_slot: MealSlot,
    pub sync_status: SyncStatus,
    pub caldav_event_uid: Option<String>,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub last_sync_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data written by `upsert_pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertSyncStatus {
    pub user_id: String,
    pub item_id: String,
    pub item_type: ItemType,
    pub planned_item_id: Option<String>,
    pub event_title: String,
    pub event_description: Option<String>,
    pub event_url: Option<String>,
    pub scheduled_date: NaiveDate,
    pub meal_slot: MealSlot,
}

/// Per-status row counts for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
    pub removed: i64,
}

/// Exponential backoff used to decide when a row may be retried.
///
/// The wait after the n-th failed attempt is `floor * 2^n` seconds, capped at
/// `max`. It is measured from `last_sync_at`, or `updated_at` for rows that
/// never had an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub floor_seconds: i64,
    pub max_seconds: i64,
}

impl BackoffPolicy {
    /// Doublings beyond this are always past any sane cap.
    pub const MAX_DOUBLINGS: i64 = 30;

    pub fn new(floor_seconds: u64, max_seconds: u64) -> Self {
        Self {
            floor_seconds: floor_seconds as i64,
            max_seconds: max_seconds.max(floor_seconds) as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_cap_is_never_below_floor() {
        let policy = BackoffPolicy::new(600, 60);
        assert_eq!(policy.floor_seconds, 600);
        assert_eq!(policy.max_seconds, 600);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Synced,
            SyncStatus::Failed,
            SyncStatus::Removed,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert!(SyncStatus::Failed.is_retryable());
        assert!(!SyncStatus::Removed.is_retryable());
    }
}
