//! The public projection: what an unauthenticated dashboard may see.
//!
//! Only tasks flagged public, only whitelisted fields, and the summary in
//! place of the title when one is set.

use crate::models::{Priority, Task, TaskStatus, UserSummary};
use crate::world::World;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicTask {
    pub id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub due_date: Option<DateTime<Utc>>,
    pub assignee: Option<UserSummary>,
}

/// `public_summary` when non-blank, else the full title.
pub fn effective_title(task: &Task) -> &str {
    match task.public_summary.as_deref() {
        Some(summary) if !summary.trim().is_empty() => summary,
        _ => &task.title,
    }
}

pub fn project(world: &World, task: &Task) -> PublicTask {
    PublicTask {
        id: task.id,
        title: effective_title(task).to_string(),
        status: task.status,
        priority: task.priority,
        due_date: task.due_date,
        assignee: task.assignee_id.and_then(|id| world.user_summary(id)),
    }
}

/// Public tasks in board order.
pub fn public_tasks(world: &World) -> Vec<PublicTask> {
    world
        .tasks_sorted()
        .into_iter()
        .filter(|t| t.is_public)
        .map(|t| project(world, t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use chrono::Duration;

    #[test]
    fn private_tasks_never_appear() {
        let mut world = World::new();
        let mut hidden = Task::new("Secret", Utc::now());
        hidden.public_summary = Some("Looks harmless".into());
        world.insert_task(hidden).unwrap();

        assert!(public_tasks(&world).is_empty());
    }

    #[test]
    fn summary_replaces_title_unless_blank() {
        let mut task = Task::new("Fix ACME invoice #4411", Utc::now());
        assert_eq!(effective_title(&task), "Fix ACME invoice #4411");
        task.public_summary = Some("   ".into());
        assert_eq!(effective_title(&task), "Fix ACME invoice #4411");
        task.public_summary = Some("Billing fix".into());
        assert_eq!(effective_title(&task), "Billing fix");
    }

    #[test]
    fn projection_drops_private_fields() {
        let mut world = World::new();
        let mut owner = User::new("Owner", None, Utc::now());
        owner.email = Some("owner@example.com".into());
        let owner_id = world.insert_user(owner).unwrap().id;
        let mut assignee = User::new("Helper", Some("🙋".into()), Utc::now());
        assignee.email = Some("helper@example.com".into());
        let assignee_id = world.insert_user(assignee).unwrap().id;

        let mut task = Task::new("Internal title", Utc::now());
        task.is_public = true;
        task.owner_id = Some(owner_id);
        task.assignee_id = Some(assignee_id);
        task.approval_comment = Some("client hates it".into());
        world.insert_task(task).unwrap();

        let json = serde_json::to_string(&public_tasks(&world)).unwrap();
        assert!(json.contains("Helper"));
        assert!(!json.contains("approvalComment"));
        assert!(!json.contains("client hates it"));
        assert!(!json.contains("ownerId"));
        assert!(!json.contains("Owner"));
        assert!(!json.contains("email"));
    }

    #[test]
    fn keeps_board_order() {
        let mut world = World::new();
        let now = Utc::now();
        for (title, days) in [("later", 5), ("sooner", 1)] {
            let mut t = Task::new(title, now);
            t.is_public = true;
            t.due_date = Some(now + Duration::days(days));
            world.insert_task(t).unwrap();
        }
        let titles: Vec<String> = public_tasks(&world).into_iter().map(|t| t.title).collect();
        assert_eq!(titles, vec!["sooner", "later"]);
    }
}
