//! Task lifecycle: every mutation of a task goes through here.
//!
//! Each operation runs in the same order: mutate the World and commit it
//! (the only step whose failure fails the request), then append history and
//! flush it as a side effect, then release the lock and broadcast, and last
//! hand any mail to the notifier. Side effects never fail the caller.

use crate::audit::{self, FieldChange};
use crate::error::AppError;
use crate::hub::ServerEvent;
use crate::models::{
    AuditAction, ClientApproval, Comment, CommentView, Priority, Task, TaskStatus, TaskView,
    User, UserSummary,
};
use crate::public;
use crate::recurrence::rule_for_pattern;
use crate::state::AppState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Avatars handed to people who claim a task without an account.
pub const CLAIM_AVATARS: [&str; 10] = [
    "👨", "👩", "🧑", "👤", "🙋", "🙋‍♂️", "🙋‍♀️", "🧔", "👨‍💼", "👩‍💼",
];

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`).
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

// ── Requests ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewTask {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub due_date: Option<DateTime<Utc>>,
    pub owner_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub client_approval: Option<ClientApproval>,
    pub approval_comment: Option<String>,
    pub is_public: bool,
    pub public_summary: Option<String>,
    pub is_recurring: bool,
    pub recurrence_pattern: Option<String>,
}

/// A partial update. Absent fields stay as they are; `null` clears the
/// nullable ones.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    #[serde(deserialize_with = "double_option")]
    pub assignee_id: Option<Option<Uuid>>,
    #[serde(deserialize_with = "double_option")]
    pub owner_id: Option<Option<Uuid>>,
    #[serde(deserialize_with = "double_option")]
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub priority: Option<Priority>,
    pub client_approval: Option<ClientApproval>,
    #[serde(deserialize_with = "double_option")]
    pub approval_comment: Option<Option<String>>,
    pub is_public: Option<bool>,
    #[serde(deserialize_with = "double_option")]
    pub public_summary: Option<Option<String>>,
}

impl TaskPatch {
    fn apply(self, task: &mut Task) {
        if let Some(title) = self.title {
            task.title = title.trim().to_string();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(assignee) = self.assignee_id {
            task.assignee_id = assignee;
        }
        if let Some(owner) = self.owner_id {
            task.owner_id = owner;
        }
        if let Some(due) = self.due_date {
            task.due_date = due;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(approval) = self.client_approval {
            task.client_approval = approval;
        }
        if let Some(comment) = self.approval_comment {
            task.approval_comment = comment;
        }
        if let Some(is_public) = self.is_public {
            task.is_public = is_public;
        }
        if let Some(summary) = self.public_summary {
            task.public_summary = summary;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewComment {
    pub content: Option<String>,
    pub author_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Visibility {
    pub is_public: bool,
    #[serde(deserialize_with = "double_option")]
    pub public_summary: Option<Option<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Claim {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// What a visibility change answers with: the fields the public board and
/// its editor care about.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityView {
    pub id: Uuid,
    pub title: String,
    pub public_summary: Option<String>,
    pub is_public: bool,
    pub status: TaskStatus,
    pub priority: Priority,
    pub due_date: Option<DateTime<Utc>>,
    pub assignee: Option<UserSummary>,
}

fn log_side_effect<T, E: std::fmt::Display>(result: Result<T, E>, task_id: Uuid, what: &str) {
    if let Err(e) = result {
        tracing::warn!(%task_id, error = %e, side_effect = what, "side effect failed");
    }
}

// ── Operations ─────────────────────────────────────────────────

pub fn create_task(state: &AppState, input: NewTask, now: DateTime<Utc>) -> Result<TaskView, AppError> {
    let title = input.title.as_deref().map(str::trim).unwrap_or_default();
    if title.is_empty() {
        return Err(AppError::validation("Title is required"));
    }
    let recurrence_rule = if input.is_recurring {
        let pattern = input
            .recurrence_pattern
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AppError::validation("A recurring task needs a recurrence pattern"))?;
        Some(rule_for_pattern(pattern, now))
    } else {
        None
    };

    let mut task = Task::new(title, now);
    task.status = input.status.unwrap_or(TaskStatus::Todo);
    task.priority = input.priority.unwrap_or_default();
    task.due_date = input.due_date;
    task.assignee_id = input.assignee_id;
    task.owner_id = input.owner_id.or(input.assignee_id);
    task.client_approval = input.client_approval.unwrap_or_default();
    task.approval_comment = input.approval_comment.filter(|c| !c.is_empty());
    task.is_public = input.is_public;
    task.public_summary = input.public_summary.filter(|s| !s.is_empty());
    task.is_recurring = recurrence_rule.is_some();
    task.recurrence_rule = recurrence_rule;

    let (view, mail) = {
        let mut world = state.write();
        let task_id = world.insert_task(task)?.id;
        state.commit(&mut world)?;

        let actor = input.owner_id.or(input.assignee_id);
        log_side_effect(
            audit::record(&mut world, task_id, actor, AuditAction::Created, None, now),
            task_id,
            "audit",
        );
        state.commit_side_effect(&mut world, "audit");

        let view = world.task_view_by_id(task_id)?;
        let mail = match view.task.assignee_id {
            Some(assignee) if view.task.owner_id != Some(assignee) => world
                .users
                .get(&assignee)
                .and_then(|user| state.notifier.task_assigned(&view.task, user)),
            _ => None,
        };
        (view, mail)
    };

    tracing::info!(task_id = %view.task.id, title = %view.task.title, "task created");
    state.hub.publish(ServerEvent::TaskCreated(view.clone()));
    if view.task.is_public {
        publish_public(state);
    }
    state.notifier.dispatch_all(mail);
    Ok(view)
}

pub fn update_task(
    state: &AppState,
    id: Uuid,
    patch: TaskPatch,
    now: DateTime<Utc>,
) -> Result<TaskView, AppError> {
    if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(AppError::validation("Title cannot be empty"));
    }
    let newly_assigned = patch.assignee_id.flatten();

    let (view, changed, mails, touches_public) = {
        let mut world = state.write();
        let before = world.modify_task(id, now, |task| patch.apply(task))?;
        state.commit(&mut world)?;
        let after = world.task(id)?.clone();

        let changes = audit::diff_tasks(&world, &before, &after);
        let changed = !changes.is_empty();
        let actor = after.assignee_id.or(after.owner_id);
        log_side_effect(
            audit::record_changes(&mut world, id, actor, changes, now),
            id,
            "audit",
        );
        state.commit_side_effect(&mut world, "audit");

        let mut mails = Vec::new();
        if before.status != TaskStatus::Done && after.status == TaskStatus::Done {
            if let Some(owner) = after.owner_id.and_then(|o| world.users.get(&o)) {
                let assignee = after.assignee_id.and_then(|a| world.users.get(&a));
                mails.extend(state.notifier.task_completed(&after, owner, assignee));
            }
        }
        if let Some(assignee) = newly_assigned.filter(|a| before.assignee_id != Some(*a)) {
            if let Some(user) = world.users.get(&assignee) {
                mails.extend(state.notifier.task_assigned(&after, user));
            }
        }

        let touches_public = before.is_public || after.is_public;
        (world.task_view(&after), changed, mails, touches_public)
    };

    if changed {
        tracing::info!(task_id = %id, "task updated");
    }
    state.hub.publish(ServerEvent::TaskUpdated(view.clone()));
    if touches_public {
        publish_public(state);
    }
    state.notifier.dispatch_all(mails);
    Ok(view)
}

/// Hard delete. Deletion is not recorded in the history: the history goes
/// with the task.
pub fn delete_task(state: &AppState, id: Uuid) -> Result<(), AppError> {
    let removed = {
        let mut world = state.write();
        let removed = world.remove_task(id)?;
        state.commit(&mut world)?;
        removed
    };

    tracing::info!(task_id = %id, attachments = removed.attachments.len(), "task deleted");
    state.hub.publish(ServerEvent::TaskDeleted(id));
    if removed.task.is_public {
        publish_public(state);
    }

    if !removed.attachments.is_empty() {
        let files = state.files.clone();
        let attachments = removed.attachments;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for attachment in attachments {
                        if let Err(e) = files.delete(&attachment.external_id).await {
                            tracing::warn!(
                                attachment_id = %attachment.id,
                                error = %e,
                                "stored file not deleted"
                            );
                        }
                    }
                });
            }
            Err(_) => tracing::warn!(task_id = %id, "no runtime, stored files left behind"),
        }
    }
    Ok(())
}

pub fn add_comment(
    state: &AppState,
    task_id: Uuid,
    input: NewComment,
    now: DateTime<Utc>,
) -> Result<CommentView, AppError> {
    let content = input.content.as_deref().map(str::trim).unwrap_or_default();
    let (false, Some(author_id)) = (content.is_empty(), input.author_id) else {
        return Err(AppError::validation("Content and author are required"));
    };

    let (comment, view, mails) = {
        let mut world = state.write();
        let comment = world.insert_comment(Comment {
            id: Uuid::new_v4(),
            task_id,
            author_id,
            content: content.to_string(),
            created_at: now,
        })?;
        state.commit(&mut world)?;

        let view = world.task_view_by_id(task_id)?;
        let task = &view.task;
        let mut recipients: Vec<&User> = Vec::new();
        if let Some(assignee) = task.assignee_id.filter(|a| *a != author_id) {
            recipients.extend(world.users.get(&assignee));
        }
        if let Some(owner) = task
            .owner_id
            .filter(|o| *o != author_id && task.assignee_id != Some(*o))
        {
            recipients.extend(world.users.get(&owner));
        }

        let mails: Vec<_> = match world.users.get(&author_id) {
            Some(author) => recipients
                .into_iter()
                .filter_map(|r| state.notifier.new_comment(task, author, content, r))
                .collect(),
            None => Vec::new(),
        };
        (comment, view, mails)
    };

    tracing::debug!(%task_id, %author_id, "comment added");
    state.hub.publish(ServerEvent::TaskUpdated(view));
    state.notifier.dispatch_all(mails);
    Ok(comment)
}

pub fn set_visibility(
    state: &AppState,
    id: Uuid,
    input: Visibility,
    now: DateTime<Utc>,
) -> Result<VisibilityView, AppError> {
    let (view, public) = {
        let mut world = state.write();
        world.modify_task(id, now, |task| {
            task.is_public = input.is_public;
            if let Some(summary) = input.public_summary {
                task.public_summary = summary;
            }
        })?;
        state.commit(&mut world)?;

        let task = world.task(id)?;
        let view = VisibilityView {
            id: task.id,
            title: task.title.clone(),
            public_summary: task.public_summary.clone(),
            is_public: task.is_public,
            status: task.status,
            priority: task.priority,
            due_date: task.due_date,
            assignee: task.assignee_id.and_then(|a| world.user_summary(a)),
        };
        (view, public::public_tasks(&world))
    };

    tracing::info!(task_id = %id, is_public = view.is_public, "task visibility set");
    state.hub.publish(ServerEvent::PublicUpdated(public));
    Ok(view)
}

/// The first pool avatar no user has yet, else the first of the pool.
fn unused_avatar<'a>(users: impl Iterator<Item = &'a User>) -> &'static str {
    let used: std::collections::HashSet<&str> = users.filter_map(|u| u.avatar.as_deref()).collect();
    CLAIM_AVATARS
        .iter()
        .copied()
        .find(|a| !used.contains(a))
        .unwrap_or(CLAIM_AVATARS[0])
}

/// Assign a task to a person known only by name, creating their user if
/// needed.
pub fn claim_task(
    state: &AppState,
    id: Uuid,
    input: Claim,
    now: DateTime<Utc>,
) -> Result<TaskView, AppError> {
    let name = input.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(AppError::validation("Name is required"));
    }
    let email = input.email.as_deref().map(str::trim).filter(|e| !e.is_empty());

    let (view, public, created_user) = {
        let mut world = state.write();
        world.task(id)?;

        let existing = world.user_by_name(name).map(|u| u.id);
        let (user_id, created_user) = match existing {
            Some(user_id) => (user_id, false),
            None => {
                let avatar = unused_avatar(world.users.values());
                let mut user = User::new(name, Some(avatar.to_string()), now);
                user.email = email.filter(|e| !world.email_in_use(e)).map(str::to_string);
                (world.insert_user(user)?.id, true)
            }
        };
        world.modify_task(id, now, |task| task.assignee_id = Some(user_id))?;
        state.commit(&mut world)?;

        let claim = FieldChange {
            field: "assignee",
            old_value: None,
            new_value: Some(user_id.to_string()),
        };
        log_side_effect(
            audit::record(&mut world, id, Some(user_id), AuditAction::Claimed, Some(claim), now),
            id,
            "audit",
        );
        state.commit_side_effect(&mut world, "audit");

        (world.task_view_by_id(id)?, public::public_tasks(&world), created_user)
    };

    tracing::info!(task_id = %id, claimed_by = %name, created_user, "task claimed");
    state.hub.publish(ServerEvent::TaskUpdated(view.clone()));
    state.hub.publish(ServerEvent::PublicUpdated(public));
    if created_user {
        state.hub.publish(ServerEvent::UsersUpdated);
    }
    Ok(view)
}

fn publish_public(state: &AppState) {
    let public = public::public_tasks(&state.read());
    state.hub.publish(ServerEvent::PublicUpdated(public));
}

// ── Tests ──────────────────────────────────────────────────────
