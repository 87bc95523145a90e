//! Sync orchestrator: drives a status row through
//! `pending -> synced | failed -> removed` by way of the resolver, the ICS
//! builder and the CalDAV transport.
//!
//! Every entry point holds the `(user_id, item_id)` lock for its whole run, so
//! an upstream mutation and a retry sweep never interleave on one row. Errors
//! never escape: transport and builder failures end up on the row via
//! `mark_failed`; database failures are logged and the call returns `None`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::db::models::{
    household_key, ItemType, MealSlot, SyncStatus, SyncStatusRecord, UpsertSyncStatus,
};
use crate::db::repository::SyncStatusRepository;
use crate::error::{AppError, AppResult, SyncError, TransportErrorKind};
use crate::services::caldav::CalDavTransport;
use crate::services::events::{StatusPublisher, SyncEvent};
use crate::services::households::{HouseholdDirectory, HouseholdTargetResolver};
use crate::services::ics::{build_document, EventPayload};

/// An upstream create or move of a plannable item.
#[derive(Debug, Clone)]
pub struct ItemChange {
    pub user_id: String,
    pub item_id: String,
    pub item_type: ItemType,
    pub planned_item_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub slot: MealSlot,
    pub date: NaiveDate,
}

impl From<ItemChange> for UpsertSyncStatus {
    fn from(change: ItemChange) -> Self {
        UpsertSyncStatus {
            user_id: change.user_id,
            item_id: change.item_id,
            item_type: change.item_type,
            planned_item_id: change.planned_item_id,
            event_title: change.title,
            event_description: change.description,
            event_url: change.url,
            scheduled_date: change.date,
            meal_slot: change.slot,
        }
    }
}

/// Keyed single-flight locks, one per sync identity.
///
/// Entries hold weak references and are pruned once no task holds or waits
/// for them.
#[derive(Clone, Default)]
pub struct SyncLocks {
    inner: Arc<Mutex<HashMap<(String, String), Weak<tokio::sync::Mutex<()>>>>>,
}

impl SyncLocks {
    pub async fn acquire(&self, user_id: &str, item_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, weak| weak.strong_count() > 0);

            let key = (user_id.to_string(), item_id.to_string());
            match locks.get(&key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key, Arc::downgrade(&lock));
                    lock
                }
            }
        };

        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|w| w.strong_count() > 0).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// At least one target accepted the event.
    Synced,
    /// Every target failed; the row was marked `failed`.
    Failed,
    /// No enabled remote calendar in the household. The row keeps its status;
    /// only `last_sync_at` is stamped.
    NoTargets,
}

/// Result of one attempt on one row.
#[derive(Debug, Clone)]
pub struct SyncAttempt {
    pub outcome: SyncOutcome,
    pub record: SyncStatusRecord,
}

pub struct CalendarSyncService {
    pool: SqlitePool,
    resolver: HouseholdTargetResolver,
    directory: Arc<dyn HouseholdDirectory>,
    transport: Arc<dyn CalDavTransport>,
    publisher: Arc<dyn StatusPublisher>,
    locks: SyncLocks,
}

impl CalendarSyncService {
    pub fn new(
        pool: SqlitePool,
        directory: Arc<dyn HouseholdDirectory>,
        transport: Arc<dyn CalDavTransport>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        Self {
            pool,
            resolver: HouseholdTargetResolver::new(directory.clone()),
            directory,
            transport,
            publisher,
            locks: SyncLocks::default(),
        }
    }

    /// Handle a created or moved item: refresh the row to `pending`, then push
    /// the event to every distinct server in the household.
    ///
    /// A row that was already synced starts a fresh cycle: its old remote event
    /// is deleted and a new one is created under a new UID.
    pub async fn on_item_upserted(&self, change: ItemChange) -> Option<SyncStatusRecord> {
        let _guard = self.locks.acquire(&change.user_id, &change.item_id).await;

        let user_id = change.user_id.clone();
        let item_id = change.item_id.clone();

        let record = match SyncStatusRepository::upsert_pending(&self.pool, change.into()).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    "Failed to record pending sync for item {} of user {}: {}",
                    item_id,
                    user_id,
                    e
                );
                return None;
            }
        };

        match self.attempt(&record).await {
            Ok(attempt) => {
                if attempt.outcome == SyncOutcome::NoTargets {
                    let scope = self.household_scope(&user_id).await;
                    self.publish(&attempt.record, &scope).await;
                }
                Some(attempt.record)
            }
            Err(e) => {
                tracing::error!("Sync of item {} for user {} aborted: {}", item_id, user_id, e);
                None
            }
        }
    }

    /// Handle a deleted item. The remote event is deleted best-effort; the row
    /// becomes `removed` whatever the server says. A missing row is a no-op.
    pub async fn on_item_deleted(&self, user_id: &str, item_id: &str) -> Option<SyncStatusRecord> {
        let _guard = self.locks.acquire(user_id, item_id).await;

        let record = match SyncStatusRepository::get_by_item_id(&self.pool, user_id, item_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!("No sync record for deleted item {} of user {}", item_id, user_id);
                return None;
            }
            Err(e) => {
                tracing::error!("Failed to load sync record for item {}: {}", item_id, e);
                return None;
            }
        };

        if record.sync_status == SyncStatus::Removed {
            return Some(record);
        }

        if let Some(ref uid) = record.caldav_event_uid {
            self.delete_remote(user_id, uid).await;
        }

        let removed = match SyncStatusRepository::mark_removed(&self.pool, user_id, item_id).await {
            Ok(Some(removed)) => removed,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!("Failed to mark item {} removed: {}", item_id, e);
                return None;
            }
        };

        tracing::info!("Item {} of user {} removed from calendar sync", item_id, user_id);

        let scope = self.household_scope(user_id).await;
        self.publish(&removed, &scope).await;
        Some(removed)
    }

    /// Re-run the per-target sync for an existing row from its stored event
    /// data. Used by the retry sweep and by manual retries.
    ///
    /// With `max_retries` set, rows at or above the cap are skipped; a manual
    /// retry passes `None`. Rows that are `synced` or `removed` by the time the
    /// lock is taken are skipped as well.
    pub async fn retry(
        &self,
        user_id: &str,
        item_id: &str,
        max_retries: Option<i64>,
    ) -> Option<SyncAttempt> {
        let _guard = self.locks.acquire(user_id, item_id).await;

        let record = match SyncStatusRepository::get_by_item_id(&self.pool, user_id, item_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!("Failed to load sync record for retry of item {}: {}", item_id, e);
                return None;
            }
        };

        if !record.sync_status.is_retryable() {
            tracing::debug!(
                "Skipping retry of item {}: status is {}",
                item_id,
                record.sync_status.as_str()
            );
            return None;
        }
        if let Some(max) = max_retries {
            if record.retry_count >= max {
                return None;
            }
        }

        match self.attempt(&record).await {
            Ok(attempt) => Some(attempt),
            Err(e) => {
                tracing::error!("Retry of item {} for user {} aborted: {}", item_id, user_id, e);
                None
            }
        }
    }

    /// One attempt against every resolved target. The caller holds the lock.
    async fn attempt(&self, record: &SyncStatusRecord) -> AppResult<SyncAttempt> {
        let resolved = self.resolver.resolve(&record.user_id).await?;

        if resolved.is_empty() {
            tracing::debug!(
                "No remote calendars for user {}; item {} keeps status {}",
                record.user_id,
                record.item_id,
                record.sync_status.as_str()
            );
            // Stamp the attempt so backoff applies and the sweep moves on to other rows.
            let touched =
                SyncStatusRepository::touch_attempt(&self.pool, &record.user_id, &record.item_id)
                    .await?
                    .unwrap_or_else(|| record.clone());
            return Ok(SyncAttempt {
                outcome: SyncOutcome::NoTargets,
                record: touched,
            });
        }

        if let Some(ref old_uid) = record.caldav_event_uid {
            let mut all_deleted = true;
            for (identity, resolved_target) in &resolved.targets {
                if let Err(e) = self.transport.delete_event(&resolved_target.target, old_uid).await {
                    all_deleted = false;
                    tracing::warn!(
                        "Could not delete previous event {} on {}: {}",
                        old_uid,
                        identity,
                        e
                    );
                }
            }
            // A UID that failed to delete somewhere is kept so the next attempt retries it.
            if all_deleted {
                SyncStatusRepository::clear_event_uid(
                    &self.pool,
                    &record.user_id,
                    &record.item_id,
                    old_uid,
                )
                .await?;
            }
        }

        let uid = Uuid::new_v4().to_string();
        let dtstamp = Utc::now();
        let mut synced_uid: Option<String> = None;
        let mut last_error: Option<SyncError> = None;

        for (identity, resolved_target) in &resolved.targets {
            let (start, end) = resolved_target
                .config
                .interval_for(record.meal_slot, record.scheduled_date);

            let payload = EventPayload {
                title: record.event_title.clone(),
                description: record.event_description.clone(),
                start,
                end,
                uid: Some(uid.clone()),
                url: record.event_url.clone(),
                location: None,
            };

            let document = match build_document(&payload, dtstamp) {
                Ok(document) => document,
                Err(e) => {
                    tracing::warn!("Cannot build event for item {} on {}: {}", record.item_id, identity, e);
                    last_error = Some(e);
                    continue;
                }
            };

            match self.transport.create_event(&resolved_target.target, &document).await {
                Ok(created) => {
                    tracing::info!("Synced item {} to {} as {}", record.item_id, identity, created.href);
                    synced_uid.get_or_insert(created.uid);
                }
                Err(e) if e.transport_kind() == Some(TransportErrorKind::Conflict) => {
                    tracing::warn!(
                        "Event {} may already exist on {} ({}); treating as synced",
                        document.uid,
                        identity,
                        e
                    );
                    synced_uid.get_or_insert(document.uid);
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!("Sync of item {} to {} failed: {}", record.item_id, identity, e);
                    } else {
                        tracing::error!(
                            "Sync of item {} to {} failed permanently: {}",
                            record.item_id,
                            identity,
                            e
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        let (outcome, updated) = match synced_uid {
            Some(uid) => (
                SyncOutcome::Synced,
                SyncStatusRepository::mark_synced(&self.pool, &record.user_id, &record.item_id, &uid)
                    .await?,
            ),
            None => {
                let message = last_error
                    .map(|e| e.truncated_message())
                    .unwrap_or_else(|| "No target accepted the event".to_string());
                (
                    SyncOutcome::Failed,
                    SyncStatusRepository::mark_failed(
                        &self.pool,
                        &record.user_id,
                        &record.item_id,
                        &message,
                    )
                    .await?,
                )
            }
        };

        let updated = updated.ok_or_else(|| {
            AppError::NotFound(format!("Sync record for item {} disappeared", record.item_id))
        })?;

        self.publish(&updated, &resolved.household_key).await;

        Ok(SyncAttempt {
            outcome,
            record: updated,
        })
    }

    async fn delete_remote(&self, user_id: &str, uid: &str) {
        let resolved = match self.resolver.resolve(user_id).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!("Cannot resolve targets to delete event {}: {}", uid, e);
                return;
            }
        };

        for (identity, resolved_target) in &resolved.targets {
            match self.transport.delete_event(&resolved_target.target, uid).await {
                Ok(()) => tracing::debug!("Deleted event {} on {}", uid, identity),
                Err(e) => tracing::warn!("Failed to delete event {} on {}: {}", uid, identity, e),
            }
        }
    }

    async fn household_scope(&self, user_id: &str) -> String {
        match self.directory.household_member_ids(user_id).await {
            Ok(members) => household_key(
                members.iter().find_map(|m| m.household_id.as_deref()),
                user_id,
            ),
            Err(e) => {
                tracing::warn!("Cannot resolve household of user {}: {}", user_id, e);
                household_key(None, user_id)
            }
        }
    }

    async fn publish(&self, record: &SyncStatusRecord, household_key: &str) {
        self.publisher.emit_to_household(
            household_key,
            SyncEvent::StatusUpdated {
                record: record.clone(),
            },
        );

        match SyncStatusRepository::summary_by_user(&self.pool, &record.user_id).await {
            Ok(summary) => self.publisher.emit_to_user(
                &record.user_id,
                SyncEvent::SummaryUpdated {
                    user_id: record.user_id.clone(),
                    summary,
                },
            ),
            Err(e) => tracing::warn!("Failed to compute sync summary for {}: {}", record.user_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::db::models::{MemberRole, TimeWindow};
    use crate::services::events::{Audience, StatusEventBus};
    use crate::test_support::{
        calendar, item_change, member, memory_pool, FakeTransport, StaticDirectory,
    };

    struct Harness {
        service: CalendarSyncService,
        transport: Arc<FakeTransport>,
        bus: Arc<StatusEventBus>,
        pool: SqlitePool,
    }

    async fn harness(directory: StaticDirectory) -> Harness {
        let pool = memory_pool().await;
        let transport = Arc::new(FakeTransport::default());
        let bus = Arc::new(StatusEventBus::default());
        let service = CalendarSyncService::new(
            pool.clone(),
            Arc::new(directory),
            transport.clone(),
            bus.clone(),
        );
        Harness {
            service,
            transport,
            bus,
            pool,
        }
    }

    fn solo(user: &str, url: &str) -> StaticDirectory {
        StaticDirectory::new(
            vec![member("h1", user, MemberRole::Admin)],
            vec![calendar(user, url)],
        )
    }

    fn server_error() -> SyncError {
        SyncError::transport(TransportErrorKind::Transient, Some(500), "Create event rejected")
    }

    #[tokio::test]
    async fn successful_upsert_marks_synced_and_publishes() {
        let h = harness(solo("alice", "https://dav.example.com/alice/")).await;
        let mut rx = h.bus.subscribe();

        let record = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Pancakes"))
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Synced);
        let uid = record.caldav_event_uid.clone().unwrap();
        let creates = h.transport.create_calls();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].uid, uid);
        assert!(creates[0].body.contains("SUMMARY:Pancakes"));

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.audience, Audience::Household("household:h1".to_string()));
        match envelope.event {
            SyncEvent::StatusUpdated { record } => assert_eq!(record.sync_status, SyncStatus::Synced),
            other => panic!("unexpected event {:?}", other),
        }
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.audience, Audience::User("alice".to_string()));
    }

    #[tokio::test]
    async fn all_targets_failing_marks_failed_once() {
        let h = harness(solo("alice", "https://dav.example.com/alice/")).await;
        h.transport
            .fail_creates_at("https://dav.example.com/alice/", server_error());

        let record = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Soup"))
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.error_message.unwrap().contains("HTTP 500"));
        assert!(record.caldav_event_uid.is_none());
    }

    #[tokio::test]
    async fn one_successful_target_is_enough() {
        let directory = StaticDirectory::new(
            vec![member("h1", "alice", MemberRole::Admin), member("h1", "bob", MemberRole::Member)],
            vec![
                calendar("alice", "https://dav.example.com/alice/"),
                calendar("bob", "https://cloud.example.org/bob/"),
            ],
        );
        let h = harness(directory).await;
        h.transport
            .fail_creates_at("https://cloud.example.org/bob/", server_error());

        let record = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Salad"))
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(record.caldav_event_uid.is_some());
        assert_eq!(h.transport.create_calls().len(), 2);
    }

    #[tokio::test]
    async fn shared_household_server_gets_exactly_one_event() {
        let directory = StaticDirectory::new(
            vec![member("h1", "alice", MemberRole::Admin), member("h1", "bob", MemberRole::Member)],
            vec![
                calendar("alice", "https://dav.example.com/family/"),
                calendar("bob", "https://dav.example.com/family/"),
            ],
        );
        let h = harness(directory).await;
        let mut rx = h.bus.subscribe();

        h.service
            .on_item_upserted(item_change("alice", "item-1", "Curry"))
            .await
            .unwrap();

        assert_eq!(h.transport.create_calls().len(), 1);

        // Bob's client listens on the household scope
        let envelope = rx.try_recv().unwrap();
        assert!(envelope.is_visible_to("bob", "household:h1"));
    }

    #[tokio::test]
    async fn no_targets_leaves_row_pending() {
        let h = harness(StaticDirectory::new(vec![member("h1", "alice", MemberRole::Admin)], vec![])).await;
        let mut rx = h.bus.subscribe();

        let record = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Toast"))
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(record.last_sync_at.is_some());
        assert!(h.transport.create_calls().is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn conflict_on_create_counts_as_synced() {
        let h = harness(solo("alice", "https://dav.example.com/alice/")).await;
        h.transport.fail_creates_at(
            "https://dav.example.com/alice/",
            SyncError::transport(TransportErrorKind::Conflict, Some(412), "exists"),
        );

        let record = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Stew"))
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.caldav_event_uid, Some(h.transport.create_calls()[0].uid.clone()));
    }

    #[tokio::test]
    async fn invalid_window_marks_failed() {
        let mut config = calendar("alice", "https://dav.example.com/alice/");
        let noon = chrono::NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        config.time_windows.dinner = TimeWindow { start: noon, end: noon };
        let h = harness(StaticDirectory::new(
            vec![member("h1", "alice", MemberRole::Admin)],
            vec![config],
        ))
        .await;

        let record = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Stew"))
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert!(record.error_message.unwrap().contains("Invalid event interval"));
        assert!(h.transport.create_calls().is_empty());
    }

    #[tokio::test]
    async fn resync_deletes_old_event_and_uses_new_uid() {
        let h = harness(solo("alice", "https://dav.example.com/alice/")).await;

        let first = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Chili"))
            .await
            .unwrap();
        let old_uid = first.caldav_event_uid.unwrap();

        let second = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Vegan chili"))
            .await
            .unwrap();
        let new_uid = second.caldav_event_uid.unwrap();

        assert_ne!(old_uid, new_uid);
        assert_eq!(second.id, first.id);
        assert_eq!(second.retry_count, 0);

        let deletes = h.transport.delete_calls();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].uid, old_uid);
        assert_eq!(h.transport.create_calls().len(), 2);
    }

    #[tokio::test]
    async fn failed_resync_forgets_the_deleted_uid() {
        let h = harness(solo("alice", "https://dav.example.com/alice/")).await;
        let first = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Chili"))
            .await
            .unwrap();
        assert!(first.caldav_event_uid.is_some());

        h.transport
            .fail_creates_at("https://dav.example.com/alice/", server_error());
        let failed = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Vegan chili"))
            .await
            .unwrap();

        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert!(failed.caldav_event_uid.is_none());
        assert_eq!(h.transport.delete_calls().len(), 1);
    }

    #[tokio::test]
    async fn undeleted_old_uid_is_kept_for_the_next_attempt() {
        let h = harness(solo("alice", "https://dav.example.com/alice/")).await;
        let first = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Chili"))
            .await
            .unwrap();
        let old_uid = first.caldav_event_uid.unwrap();

        h.transport.fail_deletes(server_error());
        h.transport
            .fail_creates_at("https://dav.example.com/alice/", server_error());
        let failed = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Vegan chili"))
            .await
            .unwrap();

        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.caldav_event_uid.as_deref(), Some(old_uid.as_str()));
    }

    #[tokio::test]
    async fn deleting_synced_item_removes_even_if_remote_delete_fails() {
        let h = harness(solo("alice", "https://dav.example.com/alice/")).await;
        let synced = h
            .service
            .on_item_upserted(item_change("alice", "item-1", "Ramen"))
            .await
            .unwrap();
        h.transport.fail_deletes(server_error());

        let removed = h.service.on_item_deleted("alice", "item-1").await.unwrap();

        assert_eq!(removed.sync_status, SyncStatus::Removed);
        let deletes = h.transport.delete_calls();
        assert_eq!(deletes.len(), 1);
        assert_eq!(Some(deletes[0].uid.clone()), synced.caldav_event_uid);
    }

    #[tokio::test]
    async fn deleting_pending_item_skips_remote_delete() {
        let h = harness(StaticDirectory::new(vec![member("h1", "alice", MemberRole::Admin)], vec![])).await;
        h.service
            .on_item_upserted(item_change("alice", "item-1", "Toast"))
            .await
            .unwrap();

        let removed = h.service.on_item_deleted("alice", "item-1").await.unwrap();

        assert_eq!(removed.sync_status, SyncStatus::Removed);
        assert!(h.transport.delete_calls().is_empty());
    }

    #[tokio::test]
    async fn deleting_unknown_item_is_a_no_op() {
        let h = harness(solo("alice", "https://dav.example.com/alice/")).await;
        assert!(h.service.on_item_deleted("alice", "ghost").await.is_none());
        assert!(h.transport.delete_calls().is_empty());
    }

    #[tokio::test]
    async fn retry_skips_capped_and_terminal_rows() {
        let h = harness(solo("alice", "https://dav.example.com/alice/")).await;
        h.transport
            .fail_creates_at("https://dav.example.com/alice/", server_error());

        h.service
            .on_item_upserted(item_change("alice", "item-1", "Soup"))
            .await
            .unwrap();

        // cap of 1 reached after the first failure
        assert!(h.service.retry("alice", "item-1", Some(1)).await.is_none());

        // manual retry ignores the cap
        let attempt = h.service.retry("alice", "item-1", None).await.unwrap();
        assert_eq!(attempt.outcome, SyncOutcome::Failed);
        assert_eq!(attempt.record.retry_count, 2);

        h.transport.clear_failures();
        let attempt = h.service.retry("alice", "item-1", None).await.unwrap();
        assert_eq!(attempt.outcome, SyncOutcome::Synced);

        // synced rows are not retried
        assert!(h.service.retry("alice", "item-1", None).await.is_none());

        let row = SyncStatusRepository::get_by_item_id(&h.pool, "alice", "item-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn locks_serialize_one_identity() {
        let locks = SyncLocks::default();
        let guard = locks.acquire("alice", "item-1").await;

        let other_item = tokio::time::timeout(Duration::from_millis(50), locks.acquire("alice", "item-2")).await;
        assert!(other_item.is_ok());
        drop(other_item);

        let same_item = tokio::time::timeout(Duration::from_millis(50), locks.acquire("alice", "item-1")).await;
        assert!(same_item.is_err());

        drop(guard);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.acquire("alice", "item-1")).await;
        assert!(again.is_ok());
        drop(again);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn concurrent_upserts_of_one_item_do_not_race() {
        let h = Arc::new(harness(solo("alice", "https://dav.example.com/alice/")).await);

        let a = {
            let h = h.clone();
            tokio::spawn(async move { h.service.on_item_upserted(item_change("alice", "item-1", "A")).await })
        };
        let b = {
            let h = h.clone();
            tokio::spawn(async move { h.service.on_item_upserted(item_change("alice", "item-1", "B")).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // The second run deleted the first run's event before creating its own
        assert_eq!(h.transport.create_calls().len(), 2);
        assert_eq!(h.transport.delete_calls().len(), 1);

        let rows = SyncStatusRepository::list_by_user(&h.pool, "alice").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sync_status, SyncStatus::Synced);
    }
}
