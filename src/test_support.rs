//! Fixtures shared by the unit tests: an in-memory database with the real
//! migrations, row builders and fakes for the collaborator seams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::db::models::{
    HouseholdMember, ItemType, MealSlot, MemberRole, RemoteCalendarConfig, TimeWindows,
    UpsertSyncStatus,
};
use crate::config::Config;
use crate::error::{AppResult, SyncError};
use crate::services::caldav::{CalDavTarget, CalDavTransport, CreatedEvent};
use crate::services::calendar_sync::{CalendarSyncService, ItemChange};
use crate::services::events::StatusEventBus;
use crate::services::households::HouseholdDirectory;
use crate::services::ics::EventDocument;
use crate::services::retry::RetryScheduler;
use crate::AppState;

pub const TEST_JWT_SECRET: &str = "test-secret";

/// A single-connection in-memory pool. The connection never expires, so the
/// database lives as long as the pool.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");

    pool
}

pub fn scheduled_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 10).expect("valid date")
}

pub fn upsert_input(user_id: &str, item_id: &str, title: &str) -> UpsertSyncStatus {
    UpsertSyncStatus {
        user_id: user_id.to_string(),
        item_id: item_id.to_string(),
        item_type: ItemType::Recipe,
        planned_item_id: None,
        event_title: title.to_string(),
        event_description: None,
        event_url: None,
        scheduled_date: scheduled_date(),
        meal_slot: MealSlot::Dinner,
    }
}

pub fn item_change(user_id: &str, item_id: &str, title: &str) -> ItemChange {
    ItemChange {
        user_id: user_id.to_string(),
        item_id: item_id.to_string(),
        item_type: ItemType::Recipe,
        planned_item_id: Some(format!("plan-{}", item_id)),
        title: title.to_string(),
        description: None,
        url: None,
        slot: MealSlot::Dinner,
        date: scheduled_date(),
    }
}

pub async fn insert_member(pool: &SqlitePool, household_id: &str, user_id: &str, role: &str) {
    let now = Utc::now().naive_utc();
    sqlx::query("INSERT OR IGNORE INTO households (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
        .bind(household_id)
        .bind(format!("Household {}", household_id))
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .expect("insert household");

    sqlx::query("INSERT INTO household_members (household_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)")
        .bind(household_id)
        .bind(user_id)
        .bind(role)
        .bind(now)
        .execute(pool)
        .await
        .expect("insert member");
}

pub async fn insert_calendar(pool: &SqlitePool, user_id: &str, server_url: &str, enabled: bool) {
    let now = Utc::now().naive_utc();
    sqlx::query(
        r#"
        INSERT INTO remote_calendar_configs
            (user_id, server_url, username, password, enabled, time_windows, timezone, created_at, updated_at)
        VALUES (?, ?, ?, 'pw', ?, '{}', NULL, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(server_url)
    .bind(user_id)
    .bind(enabled)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .expect("insert calendar config");
}

pub fn member(household_id: &str, user_id: &str, role: MemberRole) -> HouseholdMember {
    HouseholdMember {
        household_id: Some(household_id.to_string()),
        user_id: user_id.to_string(),
        role,
    }
}

pub fn calendar(user_id: &str, server_url: &str) -> RemoteCalendarConfig {
    RemoteCalendarConfig {
        user_id: user_id.to_string(),
        server_url: server_url.to_string(),
        username: user_id.to_string(),
        password: "pw".to_string(),
        enabled: true,
        time_windows: TimeWindows::default(),
        timezone: None,
    }
}

/// Fixed membership and configs.
pub struct StaticDirectory {
    members: Vec<HouseholdMember>,
    configs: Vec<RemoteCalendarConfig>,
}

impl StaticDirectory {
    pub fn new(members: Vec<HouseholdMember>, configs: Vec<RemoteCalendarConfig>) -> Self {
        Self { members, configs }
    }
}

#[async_trait]
impl HouseholdDirectory for StaticDirectory {
    async fn household_member_ids(&self, user_id: &str) -> AppResult<Vec<HouseholdMember>> {
        let household = self
            .members
            .iter()
            .find(|m| m.user_id == user_id)
            .and_then(|m| m.household_id.clone());

        match household {
            Some(id) => Ok(self
                .members
                .iter()
                .filter(|m| m.household_id.as_deref() == Some(id.as_str()))
                .cloned()
                .collect()),
            None => Ok(vec![HouseholdMember::solo(user_id)]),
        }
    }

    async fn enabled_remote_calendars(
        &self,
        user_ids: &[String],
    ) -> AppResult<Vec<RemoteCalendarConfig>> {
        Ok(self
            .configs
            .iter()
            .filter(|c| user_ids.contains(&c.user_id))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateCall {
    pub identity: String,
    pub uid: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCall {
    pub identity: String,
    pub uid: String,
}

/// Records every call; failures are scripted per server identity.
#[derive(Default)]
pub struct FakeTransport {
    creates: Mutex<Vec<CreateCall>>,
    deletes: Mutex<Vec<DeleteCall>>,
    create_failures: Mutex<HashMap<String, SyncError>>,
    delete_failure: Mutex<Option<SyncError>>,
}

impl FakeTransport {
    pub fn fail_creates_at(&self, identity: &str, error: SyncError) {
        self.create_failures
            .lock()
            .unwrap()
            .insert(identity.to_string(), error);
    }

    pub fn fail_deletes(&self, error: SyncError) {
        *self.delete_failure.lock().unwrap() = Some(error);
    }

    pub fn clear_failures(&self) {
        self.create_failures.lock().unwrap().clear();
        *self.delete_failure.lock().unwrap() = None;
    }

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.creates.lock().unwrap().clone()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CalDavTransport for FakeTransport {
    async fn create_event(
        &self,
        target: &CalDavTarget,
        document: &EventDocument,
    ) -> Result<CreatedEvent, SyncError> {
        self.creates.lock().unwrap().push(CreateCall {
            identity: target.identity().to_string(),
            uid: document.uid.clone(),
            body: document.body.clone(),
        });

        if let Some(error) = self.create_failures.lock().unwrap().get(target.identity()) {
            return Err(error.clone());
        }

        let href = target
            .event_url(&document.uid)
            .map(|u| u.path().to_string())?;
        Ok(CreatedEvent {
            uid: document.uid.clone(),
            href,
            etag: None,
        })
    }

    async fn delete_event(&self, target: &CalDavTarget, uid: &str) -> Result<(), SyncError> {
        self.deletes.lock().unwrap().push(DeleteCall {
            identity: target.identity().to_string(),
            uid: uid.to_string(),
        });

        match self.delete_failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Full application state over an in-memory database and a fake transport.
pub async fn test_state(directory: StaticDirectory) -> (Arc<AppState>, Arc<FakeTransport>) {
    let pool = memory_pool().await;
    let mut config = Config::default();
    config.jwt.secret = TEST_JWT_SECRET.to_string();

    let directory: Arc<dyn HouseholdDirectory> = Arc::new(directory);
    let transport = Arc::new(FakeTransport::default());
    let events = Arc::new(StatusEventBus::default());
    let sync = Arc::new(CalendarSyncService::new(
        pool.clone(),
        directory.clone(),
        transport.clone(),
        events.clone(),
    ));
    let retry = Arc::new(RetryScheduler::new(pool.clone(), sync.clone(), &config.sync_retry));

    let state = Arc::new(AppState {
        db: pool,
        config,
        sync,
        events,
        directory,
        retry,
    });

    (state, transport)
}
