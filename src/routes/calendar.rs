use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use crate::db::models::{household_key, ItemType, MealSlot, SyncStatusRecord, SyncSummary};
use crate::db::repository::SyncStatusRepository;
use crate::error::{AppError, AppResult};
use crate::routes::auth::AuthUser;
use crate::services::calendar_sync::ItemChange;
use crate::services::retry::RetrySweepSummary;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(list_status))
        .route("/status/:item_id", get(get_item_status))
        .route("/summary", get(get_summary))
        .route("/retry", post(retry_failed))
        .route("/retry/:item_id", post(retry_item))
        .route("/events", get(events))
        .route("/items/:item_id", put(item_upserted).delete(item_deleted))
        .route("/planned-items/:planned_item_id", delete(planned_item_removed))
}

// ============================================================================
// Request Types
// ============================================================================

/// Body sent by the scheduling module when an item is created or moved.
#[derive(Debug, Deserialize)]
pub struct ItemUpsertRequest {
    pub item_type: ItemType,
    pub planned_item_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub slot: MealSlot,
    pub date: NaiveDate,
}

// ============================================================================
// Status
// ============================================================================

async fn list_status(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<Vec<SyncStatusRecord>>> {
    let records = SyncStatusRepository::list_by_user(&state.db, &user_id).await?;
    Ok(Json(records))
}

async fn get_item_status(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(item_id): Path<String>,
) -> AppResult<Json<SyncStatusRecord>> {
    let record = SyncStatusRepository::get_by_item_id(&state.db, &user_id, &item_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Sync record not found".to_string()))?;
    Ok(Json(record))
}

async fn get_summary(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<SyncSummary>> {
    let summary = SyncStatusRepository::summary_by_user(&state.db, &user_id).await?;
    Ok(Json(summary))
}

// ============================================================================
// Manual retry
// ============================================================================

async fn retry_item(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(item_id): Path<String>,
) -> AppResult<Json<SyncStatusRecord>> {
    let existing = SyncStatusRepository::get_by_item_id(&state.db, &user_id, &item_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Sync record not found".to_string()))?;

    if !existing.sync_status.is_retryable() {
        return Err(AppError::Validation(format!(
            "Sync record is {} and cannot be retried",
            existing.sync_status.as_str()
        )));
    }

    let record = state
        .retry
        .retry_now(&user_id, &item_id)
        .await
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Retry of item {} did not run", item_id)))?;

    Ok(Json(record))
}

async fn retry_failed(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<RetrySweepSummary>> {
    let summary = state.retry.retry_failed_for_user(&user_id).await?;
    Ok(Json(summary))
}

// ============================================================================
// Live updates
// ============================================================================

/// Server-Sent Events of the caller's user scope and household scope.
///
/// A lagging client gets a `lagged` event and should re-fetch `/status`.
async fn events(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let members = state.directory.household_member_ids(&user_id).await?;
    let scope = household_key(
        members.iter().find_map(|m| m.household_id.as_deref()),
        &user_id,
    );

    tracing::debug!("Opening sync event stream for user {} ({})", user_id, scope);

    let receiver = state.events.subscribe();
    let stream = stream::unfold(
        (receiver, user_id, scope),
        |(mut receiver, user_id, scope)| async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if !envelope.is_visible_to(&user_id, &scope) {
                            continue;
                        }
                        let event = Event::default()
                            .event(envelope.event.kind().as_str())
                            .json_data(&envelope.event)
                            .unwrap_or_else(|e| {
                                tracing::warn!("Failed to serialize sync event: {}", e);
                                Event::default().comment("unserializable event")
                            });
                        return Some((Ok::<_, Infallible>(event), (receiver, user_id, scope)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let event = Event::default().event("lagged").data(skipped.to_string());
                        return Some((Ok::<_, Infallible>(event), (receiver, user_id, scope)));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Item lifecycle hooks
// ============================================================================

/// The sync runs in the background; the caller's mutation never waits on it.
async fn item_upserted(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(item_id): Path<String>,
    Json(request): Json<ItemUpsertRequest>,
) -> AppResult<impl IntoResponse> {
    if request.title.trim().is_empty() {
        return Err(AppError::Validation("title must not be empty".to_string()));
    }

    let change = ItemChange {
        user_id,
        item_id: item_id.clone(),
        item_type: request.item_type,
        planned_item_id: request.planned_item_id,
        title: request.title,
        description: request.description,
        url: request.url,
        slot: request.slot,
        date: request.date,
    };

    let sync = state.sync.clone();
    tokio::spawn(async move {
        sync.on_item_upserted(change).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "item_id": item_id, "accepted": true })),
    ))
}

async fn item_deleted(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(item_id): Path<String>,
) -> impl IntoResponse {
    let sync = state.sync.clone();
    let spawned_item = item_id.clone();
    tokio::spawn(async move {
        sync.on_item_deleted(&user_id, &spawned_item).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "item_id": item_id, "accepted": true })),
    )
}

async fn planned_item_removed(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(planned_item_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let cleared =
        SyncStatusRepository::clear_planned_item(&state.db, &user_id, &planned_item_id).await?;
    Ok(Json(json!({ "cleared": cleared })))
}
