//! Entity types and the JSON views built from them.
//!
//! Entities are what the save file stores (postcard) and what `World` holds.
//! Views are what leaves the server over HTTP or the socket: they embed
//! related users and never carry credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Enums ──────────────────────────────────────────────────────

/// Board column: todo → doing → done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientApproval {
    #[default]
    None,
    Pending,
    Approved,
    Rejected,
}

impl ClientApproval {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientApproval::None => "none",
            ClientApproval::Pending => "pending",
            ClientApproval::Approved => "approved",
            ClientApproval::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Created,
    Updated,
    Claimed,
}

// ── Entities ───────────────────────────────────────────────────

/// A unit of work on the board.
///
/// `recurrence_rule` is only meaningful while `is_recurring` is set; a task
/// with `parent_task_id` is a generated instance and never recurs itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub due_date: Option<DateTime<Utc>>,
    pub owner_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub client_approval: ClientApproval,
    pub approval_comment: Option<String>,
    pub is_public: bool,
    pub public_summary: Option<String>,
    pub is_recurring: bool,
    pub recurrence_rule: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh `todo` task with every optional field empty.
    pub fn new(title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Task {
            id: Uuid::new_v4(),
            title: title.into(),
            status: TaskStatus::Todo,
            priority: Priority::default(),
            due_date: None,
            owner_id: None,
            assignee_id: None,
            client_approval: ClientApproval::default(),
            approval_comment: None,
            is_public: false,
            public_summary: None,
            is_recurring: false,
            recurrence_rule: None,
            parent_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The rule to expand, or None when the task is not a recurring template.
    /// A stale rule left on a non-recurring task is never returned.
    pub fn active_rule(&self) -> Option<&str> {
        if self.is_recurring {
            self.recurrence_rule.as_deref()
        } else {
            None
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.owner_id == Some(user_id) || self.assignee_id == Some(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub avatar: Option<String>,
    pub is_online: bool,
    pub is_admin: bool,
    pub notify_on_assign: bool,
    pub notify_on_complete: bool,
    pub notify_on_comment: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: impl Into<String>, avatar: Option<String>, now: DateTime<Utc>) -> Self {
        User {
            id: Uuid::new_v4(),
            name: name.into(),
            email: None,
            password_hash: None,
            avatar,
            is_online: false,
            is_admin: false,
            notify_on_assign: true,
            notify_on_complete: true,
            notify_on_comment: true,
            created_at: now,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            name: self.name.clone(),
            avatar: self.avatar.clone(),
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            is_online: self.is_online,
            is_admin: self.is_admin,
            email: self.email.clone(),
            notify_on_assign: self.notify_on_assign,
            notify_on_complete: self.notify_on_complete,
            notify_on_comment: self.notify_on_comment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub uploader_id: Option<Uuid>,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub url: String,
    /// Identifier of the stored object at the file host.
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

/// One immutable line of a task's history. `user_id` None means "system".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Views ──────────────────────────────────────────────────────

/// The public face of a user: what other people get to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
}

/// A user as seen by themselves (settings screen). No credential.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
    pub is_online: bool,
    pub is_admin: bool,
    pub email: Option<String>,
    pub notify_on_assign: bool,
    pub notify_on_complete: bool,
    pub notify_on_comment: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCounts {
    pub assigned_tasks: usize,
    pub owned_tasks: usize,
    pub comments: usize,
}

/// A row of the user list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListEntry {
    pub id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
    pub is_online: bool,
    pub is_admin: bool,
    #[serde(rename = "_count")]
    pub counts: UserCounts,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    #[serde(flatten)]
    pub comment: Comment,
    pub author: Option<UserSummary>,
}

/// A task with its people and conversation attached, as the board shows it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub owner: Option<UserSummary>,
    pub assignee: Option<UserSummary>,
    pub comments: Vec<CommentView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    #[serde(flatten)]
    pub attachment: Attachment,
    pub uploader: Option<UserSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditView {
    #[serde(flatten)]
    pub entry: AuditEntry,
    pub user: Option<UserSummary>,
}
