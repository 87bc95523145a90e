//! In-process pub/sub for sync status changes.
//!
//! Delivery is best-effort and at-most-once. A subscriber that misses an event
//! re-fetches from the status store, which stays the source of truth.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::models::{SyncStatusRecord, SyncSummary};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusUpdated,
    SummaryUpdated,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::StatusUpdated => "status_updated",
            EventKind::SummaryUpdated => "summary_updated",
        }
    }
}

/// Closed set of payloads carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A status row changed; carries the full row.
    StatusUpdated { record: SyncStatusRecord },
    /// Fresh per-status counts for one user.
    SummaryUpdated { user_id: String, summary: SyncSummary },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::StatusUpdated { .. } => EventKind::StatusUpdated,
            SyncEvent::SummaryUpdated { .. } => EventKind::SummaryUpdated,
        }
    }
}

/// Who an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "key", rename_all = "snake_case")]
pub enum Audience {
    User(String),
    /// A household key as produced by `household_key`.
    Household(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub audience: Audience,
    pub event: SyncEvent,
}

impl Envelope {
    /// Whether a client logged in as `user_id` in `household_key` should see this.
    pub fn is_visible_to(&self, user_id: &str, household_key: &str) -> bool {
        match &self.audience {
            Audience::User(id) => id == user_id,
            Audience::Household(key) => key == household_key,
        }
    }
}

/// Publishing side of the bus, as seen by the sync orchestrator.
pub trait StatusPublisher: Send + Sync {
    fn emit_to_user(&self, user_id: &str, event: SyncEvent);
    fn emit_to_household(&self, household_key: &str, event: SyncEvent);
}

pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// The bus. Streams (`subscribe`) and synchronous handlers (`on`/`off`) both
/// see every event.
pub struct StatusEventBus {
    sender: broadcast::Sender<Envelope>,
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, EventHandler)>>>,
    next_handler_id: AtomicU64,
}

impl Default for StatusEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl StatusEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    /// A receiver for every envelope published from now on. Lagging receivers
    /// skip what they missed.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Register a handler for one kind of event. Handlers run inline on the
    /// publishing task and must not block.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false when it was not registered for `kind`.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        match handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(handler_id, _)| *handler_id != id);
                before != list.len()
            }
            None => false,
        }
    }

    fn publish(&self, envelope: Envelope) {
        let handlers: Vec<EventHandler> = {
            let registry = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            registry
                .get(&envelope.event.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(&envelope);
        }

        // Ignore send errors (no subscribers)
        let _ = self.sender.send(envelope);
    }
}

impl StatusPublisher for StatusEventBus {
    fn emit_to_user(&self, user_id: &str, event: SyncEvent) {
        tracing::trace!("Emitting {} to user {}", event.kind().as_str(), user_id);
        self.publish(Envelope {
            audience: Audience::User(user_id.to_string()),
            event,
        });
    }

    fn emit_to_household(&self, household_key: &str, event: SyncEvent) {
        tracing::trace!(
            "Emitting {} to {}",
            event.kind().as_str(),
            household_key
        );
        self.publish(Envelope {
            audience: Audience::Household(household_key.to_string()),
            event,
        });
    }
}
