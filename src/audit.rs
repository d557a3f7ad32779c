//! Task history: one immutable entry per creation, claim, or changed field.

use crate::models::{AuditAction, AuditEntry, Task};
use crate::world::{World, WorldError};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

const UNASSIGNED: &str = "Unassigned";

/// One field that differs between two task states, as stringified snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: &'static str,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl FieldChange {
    fn new(field: &'static str, old_value: Option<String>, new_value: Option<String>) -> Self {
        FieldChange {
            field,
            old_value,
            new_value,
        }
    }
}

fn assignee_name(world: &World, id: Option<Uuid>) -> String {
    id.and_then(|id| world.users.get(&id))
        .map(|u| u.name.clone())
        .unwrap_or_else(|| UNASSIGNED.to_string())
}

fn timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// The audited fields that differ between `before` and `after`, in a fixed
/// order. Owner, summaries and approval comments are deliberately absent.
pub fn diff_tasks(world: &World, before: &Task, after: &Task) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    if before.title != after.title {
        changes.push(FieldChange::new(
            "title",
            Some(before.title.clone()),
            Some(after.title.clone()),
        ));
    }
    if before.status != after.status {
        changes.push(FieldChange::new(
            "status",
            Some(before.status.as_str().into()),
            Some(after.status.as_str().into()),
        ));
    }
    if before.assignee_id != after.assignee_id {
        changes.push(FieldChange::new(
            "assignee",
            Some(assignee_name(world, before.assignee_id)),
            Some(assignee_name(world, after.assignee_id)),
        ));
    }
    if before.priority != after.priority {
        changes.push(FieldChange::new(
            "priority",
            Some(before.priority.as_str().into()),
            Some(after.priority.as_str().into()),
        ));
    }
    if before.due_date != after.due_date {
        changes.push(FieldChange::new(
            "dueDate",
            timestamp(before.due_date),
            timestamp(after.due_date),
        ));
    }
    if before.is_public != after.is_public {
        changes.push(FieldChange::new(
            "isPublic",
            Some(before.is_public.to_string()),
            Some(after.is_public.to_string()),
        ));
    }
    if before.client_approval != after.client_approval {
        changes.push(FieldChange::new(
            "clientApproval",
            Some(before.client_approval.as_str().into()),
            Some(after.client_approval.as_str().into()),
        ));
    }

    changes
}

pub fn record(
    world: &mut World,
    task_id: Uuid,
    user_id: Option<Uuid>,
    action: AuditAction,
    change: Option<FieldChange>,
    now: DateTime<Utc>,
) -> Result<Uuid, WorldError> {
    let (field, old_value, new_value) = match change {
        Some(c) => (Some(c.field.to_string()), c.old_value, c.new_value),
        None => (None, None, None),
    };
    world.append_audit(AuditEntry {
        id: Uuid::new_v4(),
        task_id,
        user_id,
        action,
        field,
        old_value,
        new_value,
        created_at: now,
    })
}

/// One `updated` entry per change. Returns how many were written.
pub fn record_changes(
    world: &mut World,
    task_id: Uuid,
    user_id: Option<Uuid>,
    changes: Vec<FieldChange>,
    now: DateTime<Utc>,
) -> Result<usize, WorldError> {
    let count = changes.len();
    for change in changes {
        record(world, task_id, user_id, AuditAction::Updated, Some(change), now)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientApproval, Priority, TaskStatus, User};
    use chrono::TimeZone;

    #[test]
    fn unchanged_task_has_empty_diff() {
        let world = World::new();
        let task = Task::new("Same", Utc::now());
        assert!(diff_tasks(&world, &task, &task.clone()).is_empty());
    }

    #[test]
    fn diff_covers_audited_fields_in_order() {
        let mut world = World::new();
        let ada = world.insert_user(User::new("Ada", None, Utc::now())).unwrap().id;

        let before = Task::new("Old", Utc::now());
        let mut after = before.clone();
        after.title = "New".into();
        after.status = TaskStatus::Doing;
        after.assignee_id = Some(ada);
        after.priority = Priority::Urgent;
        after.due_date = Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        after.is_public = true;
        after.client_approval = ClientApproval::Pending;
        after.approval_comment = Some("not audited".into());
        after.public_summary = Some("not audited either".into());

        let diff = diff_tasks(&world, &before, &after);
        let fields: Vec<&str> = diff.iter().map(|c| c.field).collect();
        assert_eq!(
            fields,
            vec!["title", "status", "assignee", "priority", "dueDate", "isPublic", "clientApproval"]
        );

        let assignee = &diff[2];
        assert_eq!(assignee.old_value.as_deref(), Some("Unassigned"));
        assert_eq!(assignee.new_value.as_deref(), Some("Ada"));

        let due = &diff[4];
        assert_eq!(due.old_value, None);
        assert_eq!(due.new_value.as_deref(), Some("2026-03-01T12:00:00.000Z"));

        assert_eq!(diff[5].new_value.as_deref(), Some("true"));
    }

    #[test]
    fn record_changes_writes_one_entry_each() {
        let mut world = World::new();
        let id = world.insert_task(Task::new("t", Utc::now())).unwrap().id;
        let changes = vec![
            FieldChange::new("title", Some("a".into()), Some("b".into())),
            FieldChange::new("status", Some("todo".into()), Some("done".into())),
        ];
        assert_eq!(record_changes(&mut world, id, None, changes, Utc::now()).unwrap(), 2);
        let history = world.history(id);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.entry.action == AuditAction::Updated && h.user.is_none()));
    }
}
