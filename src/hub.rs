//! Real-time fan-out and presence.
//!
//! Every mutation is serialized once into a JSON text frame and pushed
//! through a `tokio::sync::broadcast` channel; each socket forwards what it
//! receives. No per-session filtering: every session sees every event.
//!
//! Presence is a process-local session → user map, rebuilt from nothing on
//! restart.

use crate::models::{AttachmentView, TaskView, UserSummary};
use crate::public::PublicTask;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

// ── Wire events ────────────────────────────────────────────────

/// Server → client frames: `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "task:created")]
    TaskCreated(TaskView),
    #[serde(rename = "task:updated")]
    TaskUpdated(TaskView),
    #[serde(rename = "task:deleted")]
    TaskDeleted(Uuid),
    #[serde(rename = "tasks:public_updated")]
    PublicUpdated(Vec<PublicTask>),
    #[serde(rename = "users:online")]
    UsersOnline(Vec<UserSummary>),
    #[serde(rename = "users:updated")]
    UsersUpdated,
    #[serde(rename = "attachment:created")]
    AttachmentCreated {
        #[serde(rename = "taskId")]
        task_id: Uuid,
        attachment: AttachmentView,
    },
    #[serde(rename = "attachment:deleted")]
    AttachmentDeleted {
        #[serde(rename = "attachmentId")]
        attachment_id: Uuid,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::TaskCreated(_) => "task:created",
            ServerEvent::TaskUpdated(_) => "task:updated",
            ServerEvent::TaskDeleted(_) => "task:deleted",
            ServerEvent::PublicUpdated(_) => "tasks:public_updated",
            ServerEvent::UsersOnline(_) => "users:online",
            ServerEvent::UsersUpdated => "users:updated",
            ServerEvent::AttachmentCreated { .. } => "attachment:created",
            ServerEvent::AttachmentDeleted { .. } => "attachment:deleted",
        }
    }
}

/// Client → server frames. Only `user:join` is recognized.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "user:join")]
    UserJoin(Uuid),
}

// ── Hub ────────────────────────────────────────────────────────

pub struct Hub {
    tx: broadcast::Sender<String>,
    sessions: Mutex<HashMap<Uuid, Uuid>>,
}

impl Default for Hub {
    fn default() -> Self {
        Hub::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Hub {
            tx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Fire and forget. No subscribers is not an error.
    pub fn publish(&self, event: ServerEvent) {
        match serde_json::to_string(&event) {
            Ok(frame) => {
                let receivers = self.tx.send(frame).unwrap_or(0);
                tracing::debug!(event = event.name(), receivers, "broadcast");
            }
            Err(e) => tracing::warn!(event = event.name(), error = %e, "cannot encode event"),
        }
    }

    /// Record that `session` belongs to `user`. Returns the user the session
    /// was previously bound to, if any.
    pub fn join(&self, session: Uuid, user: Uuid) -> Option<Uuid> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session, user)
    }

    /// Forget a session. Returns its user when a join had been recorded and
    /// no other session of the same user is still connected.
    pub fn leave(&self, session: Uuid) -> Option<Uuid> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let user = sessions.remove(&session)?;
        if sessions.values().any(|u| *u == user) {
            None
        } else {
            Some(user)
        }
    }

    pub fn is_connected(&self, user: Uuid) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|u| *u == user)
    }
}

// ── Tests ──────────────────────────────────────────────────────
