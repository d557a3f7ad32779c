use crate::models::{
    Attachment, AttachmentView, AuditEntry, AuditView, Comment, CommentView, Task, TaskView,
    User, UserCounts, UserListEntry, UserSummary,
};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

// ── Change tracking ───────────────────────────────────────────

/// Which save-file table a change touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Tasks,
    Users,
    Comments,
    Attachments,
    AuditLog,
}

/// A row that must be written to (Put) or removed from (Remove) the save file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Put(Table, Uuid),
    Remove(Table, Uuid),
}

/// A row as it was before the first change of the current batch.
#[derive(Debug, Clone)]
enum Before {
    Task(Option<Task>),
    User(Option<User>),
    Comment(Option<Comment>),
    Attachment(Option<Attachment>),
    Audit(Option<AuditEntry>),
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("Task not found")]
    TaskNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("Attachment not found")]
    AttachmentNotFound,
    #[error("A user named {0} already exists")]
    DuplicateName(String),
    #[error("The email {0} is already in use")]
    DuplicateEmail(String),
}

/// What a task deletion took with it.
#[derive(Debug)]
pub struct RemovedTask {
    pub task: Task,
    pub attachments: Vec<Attachment>,
}

/// What a user deletion touched.
#[derive(Debug)]
pub struct RemovedUser {
    pub user: User,
    /// Tasks whose owner or assignee reference was cleared.
    pub detached_tasks: Vec<Uuid>,
}

// ── The World ──────────────────────────────────────────────────

/// The authoritative application state. Lives in memory, loaded from redb on
/// boot. Every mutation records the rows it touched, along with their prior
/// contents; the caller flushes them with `flush_with` before answering the
/// request, and a failed flush puts every touched row back.
#[derive(Default)]
pub struct World {
    pub tasks: HashMap<Uuid, Task>,
    pub users: HashMap<Uuid, User>,
    pub comments: HashMap<Uuid, Comment>,
    pub attachments: HashMap<Uuid, Attachment>,
    pub audit: HashMap<Uuid, AuditEntry>,
    pending: Vec<Change>,
    undo: HashMap<(Table, Uuid), Before>,
}

impl World {
    pub fn new() -> Self {
        World::default()
    }

    /// Drain the rows touched since the last flush. The batch can no longer
    /// be rolled back.
    pub fn take_pending(&mut self) -> Vec<Change> {
        self.undo.clear();
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Hand the pending batch to `write`. If it fails, every row the batch
    /// touched is restored to what it was before the batch began.
    pub fn flush_with<E>(
        &mut self,
        write: impl FnOnce(&World, &[Change]) -> Result<(), E>,
    ) -> Result<(), E> {
        let changes = std::mem::take(&mut self.pending);
        let result = write(&*self, changes.as_slice());
        let undo = std::mem::take(&mut self.undo);
        if result.is_err() {
            for ((_, id), before) in undo {
                self.restore(id, before);
            }
        }
        result
    }

    /// Must run before the row is mutated.
    fn remember(&mut self, table: Table, id: Uuid) {
        if self.undo.contains_key(&(table, id)) {
            return;
        }
        let before = match table {
            Table::Tasks => Before::Task(self.tasks.get(&id).cloned()),
            Table::Users => Before::User(self.users.get(&id).cloned()),
            Table::Comments => Before::Comment(self.comments.get(&id).cloned()),
            Table::Attachments => Before::Attachment(self.attachments.get(&id).cloned()),
            Table::AuditLog => Before::Audit(self.audit.get(&id).cloned()),
        };
        self.undo.insert((table, id), before);
    }

    fn restore(&mut self, id: Uuid, before: Before) {
        fn put_back<T>(rows: &mut HashMap<Uuid, T>, id: Uuid, row: Option<T>) {
            match row {
                Some(row) => {
                    rows.insert(id, row);
                }
                None => {
                    rows.remove(&id);
                }
            }
        }
        match before {
            Before::Task(row) => put_back(&mut self.tasks, id, row),
            Before::User(row) => put_back(&mut self.users, id, row),
            Before::Comment(row) => put_back(&mut self.comments, id, row),
            Before::Attachment(row) => put_back(&mut self.attachments, id, row),
            Before::Audit(row) => put_back(&mut self.audit, id, row),
        }
    }

    fn touch(&mut self, table: Table, id: Uuid) {
        self.remember(table, id);
        self.pending.push(Change::Put(table, id));
    }

    fn forget(&mut self, table: Table, id: Uuid) {
        self.remember(table, id);
        self.pending.push(Change::Remove(table, id));
    }

    // ── Tasks ──────────────────────────────────────────────────

    pub fn task(&self, id: Uuid) -> Result<&Task, WorldError> {
        self.tasks.get(&id).ok_or(WorldError::TaskNotFound)
    }

    pub fn insert_task(&mut self, task: Task) -> Result<&Task, WorldError> {
        for user_id in [task.owner_id, task.assignee_id].into_iter().flatten() {
            self.user(user_id)?;
        }
        let id = task.id;
        self.touch(Table::Tasks, id);
        Ok(self.tasks.entry(id).or_insert(task))
    }

    /// Apply `edit` to a task and return its state from before the edit.
    /// Owner and assignee references must still resolve afterwards, otherwise
    /// the task is left untouched. `updated_at` only moves when something
    /// actually changed.
    pub fn modify_task(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
        edit: impl FnOnce(&mut Task),
    ) -> Result<Task, WorldError> {
        let before = self.task(id)?.clone();
        let mut after = before.clone();
        edit(&mut after);
        after.id = before.id;

        for user_id in [after.owner_id, after.assignee_id].into_iter().flatten() {
            self.user(user_id)?;
        }

        if after != before {
            after.updated_at = now;
            self.touch(Table::Tasks, id);
            self.tasks.insert(id, after);
        }
        Ok(before)
    }

    /// Hard delete. Comments, attachments and history go with the task.
    pub fn remove_task(&mut self, id: Uuid) -> Result<RemovedTask, WorldError> {
        self.task(id)?;
        self.forget(Table::Tasks, id);
        let task = self.tasks.remove(&id).ok_or(WorldError::TaskNotFound)?;

        let comment_ids: Vec<Uuid> = self
            .comments
            .values()
            .filter(|c| c.task_id == id)
            .map(|c| c.id)
            .collect();
        for comment_id in comment_ids {
            self.forget(Table::Comments, comment_id);
            self.comments.remove(&comment_id);
        }

        let attachment_ids: Vec<Uuid> = self
            .attachments
            .values()
            .filter(|a| a.task_id == id)
            .map(|a| a.id)
            .collect();
        let mut attachments = Vec::with_capacity(attachment_ids.len());
        for attachment_id in attachment_ids {
            self.forget(Table::Attachments, attachment_id);
            if let Some(attachment) = self.attachments.remove(&attachment_id) {
                attachments.push(attachment);
            }
        }

        let audit_ids: Vec<Uuid> = self
            .audit
            .values()
            .filter(|e| e.task_id == id)
            .map(|e| e.id)
            .collect();
        for audit_id in audit_ids {
            self.forget(Table::AuditLog, audit_id);
            self.audit.remove(&audit_id);
        }

        Ok(RemovedTask { task, attachments })
    }

    /// Every task in board order (see `listing_order`).
    pub fn tasks_sorted(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| listing_order(a, b));
        tasks
    }

    /// Tasks owned by or assigned to a user, in board order.
    pub fn tasks_of(&self, user_id: Uuid) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().filter(|t| t.involves(user_id)).collect();
        tasks.sort_by(|a, b| listing_order(a, b));
        tasks
    }

    pub fn recurring_templates(&self) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| t.active_rule().is_some())
            .collect()
    }

    /// Has an instance of `parent` already been generated for exactly `due`?
    pub fn instance_exists(&self, parent: Uuid, due: DateTime<Utc>) -> bool {
        self.tasks
            .values()
            .any(|t| t.parent_task_id == Some(parent) && t.due_date == Some(due))
    }

    pub fn task_view(&self, task: &Task) -> TaskView {
        TaskView {
            task: task.clone(),
            owner: task.owner_id.and_then(|id| self.user_summary(id)),
            assignee: task.assignee_id.and_then(|id| self.user_summary(id)),
            comments: self.comments_for(task.id),
        }
    }

    pub fn task_view_by_id(&self, id: Uuid) -> Result<TaskView, WorldError> {
        Ok(self.task_view(self.task(id)?))
    }

    // ── Users ──────────────────────────────────────────────────

    pub fn user(&self, id: Uuid) -> Result<&User, WorldError> {
        self.users.get(&id).ok_or(WorldError::UserNotFound)
    }

    pub fn user_summary(&self, id: Uuid) -> Option<UserSummary> {
        self.users.get(&id).map(User::summary)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&User> {
        self.users.values().find(|u| u.name == name)
    }

    /// Exact match first, then a case-insensitive scan.
    pub fn user_by_name_loose(&self, name: &str) -> Option<&User> {
        self.user_by_name(name).or_else(|| {
            let lowered = name.to_lowercase();
            self.users.values().find(|u| u.name.to_lowercase() == lowered)
        })
    }

    fn check_unique(&self, candidate: &User) -> Result<(), WorldError> {
        for other in self.users.values().filter(|u| u.id != candidate.id) {
            if other.name == candidate.name {
                return Err(WorldError::DuplicateName(candidate.name.clone()));
            }
            if let (Some(mine), Some(theirs)) = (&candidate.email, &other.email) {
                if mine == theirs {
                    return Err(WorldError::DuplicateEmail(mine.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn email_in_use(&self, email: &str) -> bool {
        self.users.values().any(|u| u.email.as_deref() == Some(email))
    }

    pub fn insert_user(&mut self, user: User) -> Result<&User, WorldError> {
        self.check_unique(&user)?;
        let id = user.id;
        self.touch(Table::Users, id);
        Ok(self.users.entry(id).or_insert(user))
    }

    /// Apply `edit` to a user, enforcing name/email uniqueness. Returns the
    /// updated user.
    pub fn modify_user(
        &mut self,
        id: Uuid,
        edit: impl FnOnce(&mut User),
    ) -> Result<&User, WorldError> {
        let mut updated = self.user(id)?.clone();
        edit(&mut updated);
        updated.id = id;
        self.check_unique(&updated)?;

        self.touch(Table::Users, id);
        self.users.insert(id, updated);
        self.user(id)
    }

    /// Delete a user. Tasks survive with the reference cleared; the user's
    /// comments are removed; history and attachments keep the row but lose
    /// the reference.
    pub fn remove_user(&mut self, id: Uuid) -> Result<RemovedUser, WorldError> {
        self.user(id)?;
        self.forget(Table::Users, id);
        let user = self.users.remove(&id).ok_or(WorldError::UserNotFound)?;

        let mut detached_tasks: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.owner_id == Some(id) || t.assignee_id == Some(id))
            .map(|t| t.id)
            .collect();
        for task_id in &detached_tasks {
            self.touch(Table::Tasks, *task_id);
            if let Some(task) = self.tasks.get_mut(task_id) {
                if task.owner_id == Some(id) {
                    task.owner_id = None;
                }
                if task.assignee_id == Some(id) {
                    task.assignee_id = None;
                }
            }
        }

        let comment_ids: Vec<Uuid> = self
            .comments
            .values()
            .filter(|c| c.author_id == id)
            .map(|c| c.id)
            .collect();
        for comment_id in comment_ids {
            self.forget(Table::Comments, comment_id);
            self.comments.remove(&comment_id);
        }

        let audit_ids: Vec<Uuid> = self
            .audit
            .values()
            .filter(|e| e.user_id == Some(id))
            .map(|e| e.id)
            .collect();
        for audit_id in audit_ids {
            self.touch(Table::AuditLog, audit_id);
            if let Some(entry) = self.audit.get_mut(&audit_id) {
                entry.user_id = None;
            }
        }

        let attachment_ids: Vec<Uuid> = self
            .attachments
            .values()
            .filter(|a| a.uploader_id == Some(id))
            .map(|a| a.id)
            .collect();
        for attachment_id in attachment_ids {
            self.touch(Table::Attachments, attachment_id);
            if let Some(attachment) = self.attachments.get_mut(&attachment_id) {
                attachment.uploader_id = None;
            }
        }

        detached_tasks.sort();
        Ok(RemovedUser { user, detached_tasks })
    }

    /// Online users first, then by name.
    pub fn user_list(&self) -> Vec<UserListEntry> {
        let mut users: Vec<&User> = self.users.values().collect();
        users.sort_by(|a, b| b.is_online.cmp(&a.is_online).then_with(|| a.name.cmp(&b.name)));
        users
            .into_iter()
            .map(|u| UserListEntry {
                id: u.id,
                name: u.name.clone(),
                avatar: u.avatar.clone(),
                is_online: u.is_online,
                is_admin: u.is_admin,
                counts: UserCounts {
                    assigned_tasks: self.tasks.values().filter(|t| t.assignee_id == Some(u.id)).count(),
                    owned_tasks: self.tasks.values().filter(|t| t.owner_id == Some(u.id)).count(),
                    comments: self.comments.values().filter(|c| c.author_id == u.id).count(),
                },
            })
            .collect()
    }

    pub fn online_users(&self) -> Vec<UserSummary> {
        let mut online: Vec<UserSummary> = self
            .users
            .values()
            .filter(|u| u.is_online)
            .map(User::summary)
            .collect();
        online.sort_by(|a, b| a.name.cmp(&b.name));
        online
    }

    /// Presence does not survive a restart: mark everyone offline.
    pub fn reset_presence(&mut self) -> usize {
        let ids: Vec<Uuid> = self
            .users
            .values()
            .filter(|u| u.is_online)
            .map(|u| u.id)
            .collect();
        for id in &ids {
            self.touch(Table::Users, *id);
            if let Some(user) = self.users.get_mut(id) {
                user.is_online = false;
            }
        }
        ids.len()
    }

    // ── Comments ───────────────────────────────────────────────

    pub fn insert_comment(&mut self, comment: Comment) -> Result<CommentView, WorldError> {
        self.task(comment.task_id)?;
        let author = self.user(comment.author_id)?.summary();
        self.touch(Table::Comments, comment.id);
        self.comments.insert(comment.id, comment.clone());
        Ok(CommentView {
            comment,
            author: Some(author),
        })
    }

    /// Oldest first.
    pub fn comments_for(&self, task_id: Uuid) -> Vec<CommentView> {
        let mut comments: Vec<&Comment> = self
            .comments
            .values()
            .filter(|c| c.task_id == task_id)
            .collect();
        comments.sort_by_key(|c| c.created_at);
        comments
            .into_iter()
            .map(|c| CommentView {
                comment: c.clone(),
                author: self.user_summary(c.author_id),
            })
            .collect()
    }

    // ── Attachments ────────────────────────────────────────────

    pub fn insert_attachment(&mut self, attachment: Attachment) -> Result<AttachmentView, WorldError> {
        self.task(attachment.task_id)?;
        if let Some(uploader) = attachment.uploader_id {
            self.user(uploader)?;
        }
        self.touch(Table::Attachments, attachment.id);
        self.attachments.insert(attachment.id, attachment.clone());
        Ok(self.attachment_view(&attachment))
    }

    pub fn remove_attachment(&mut self, id: Uuid) -> Result<Attachment, WorldError> {
        if !self.attachments.contains_key(&id) {
            return Err(WorldError::AttachmentNotFound);
        }
        self.forget(Table::Attachments, id);
        self.attachments
            .remove(&id)
            .ok_or(WorldError::AttachmentNotFound)
    }

    fn attachment_view(&self, attachment: &Attachment) -> AttachmentView {
        AttachmentView {
            attachment: attachment.clone(),
            uploader: attachment.uploader_id.and_then(|id| self.user_summary(id)),
        }
    }

    /// Newest first.
    pub fn attachments_for(&self, task_id: Uuid) -> Vec<AttachmentView> {
        let mut attachments: Vec<&Attachment> = self
            .attachments
            .values()
            .filter(|a| a.task_id == task_id)
            .collect();
        attachments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        attachments
            .into_iter()
            .map(|a| self.attachment_view(a))
            .collect()
    }

    // ── Audit log ──────────────────────────────────────────────

    /// Append-only: entries are never edited except to drop a deleted user.
    pub fn append_audit(&mut self, entry: AuditEntry) -> Result<Uuid, WorldError> {
        self.task(entry.task_id)?;
        let id = entry.id;
        self.touch(Table::AuditLog, id);
        self.audit.insert(id, entry);
        Ok(id)
    }

    /// Newest first.
    pub fn history(&self, task_id: Uuid) -> Vec<AuditView> {
        let mut entries: Vec<&AuditEntry> = self
            .audit
            .values()
            .filter(|e| e.task_id == task_id)
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
            .into_iter()
            .map(|e| AuditView {
                entry: e.clone(),
                user: e.user_id.and_then(|id| self.user_summary(id)),
            })
            .collect()
    }
}

/// Board order: status ascending (by its stored name), then due date
/// ascending with undated tasks last, then newest first.
pub fn listing_order(a: &Task, b: &Task) -> Ordering {
    a.status
        .as_str()
        .cmp(b.status.as_str())
        .then_with(|| match (a.due_date, b.due_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| b.created_at.cmp(&a.created_at))
}

// ── Tests ──────────────────────────────────────────────────────
