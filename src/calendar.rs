//! iCalendar export: one VTODO per task a user owns or is assigned.

use crate::models::{Priority, Task, TaskStatus, User};
use crate::world::World;
use chrono::{DateTime, Utc};
use icalendar::{Calendar, Component, EventLike, Todo, TodoStatus};

/// iCalendar priority scale: 1 is highest, 9 lowest.
pub fn ical_priority(priority: Priority) -> u32 {
    match priority {
        Priority::Urgent => 1,
        Priority::High => 3,
        Priority::Medium => 5,
        Priority::Low => 9,
    }
}

fn category(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "To do",
        TaskStatus::Doing => "In progress",
        TaskStatus::Done => "Done",
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

fn describe(world: &World, task: &Task) -> String {
    let person = |id: Option<uuid::Uuid>| {
        id.and_then(|id| world.users.get(&id)).map(|u| match &u.avatar {
            Some(avatar) => format!("{avatar} {}", u.name),
            None => u.name.clone(),
        })
    };

    let mut details = Vec::new();
    if let Some(assignee) = person(task.assignee_id) {
        details.push(format!("Assigned to: {assignee}"));
    }
    if let Some(owner) = person(task.owner_id) {
        details.push(format!("Owner: {owner}"));
    }
    details.push(format!("Priority: {}", task.priority.as_str()));
    details.push(format!("Status: {}", task.status.as_str()));
    if task.client_approval != crate::models::ClientApproval::None {
        details.push(format!("Client approval: {}", task.client_approval.as_str()));
    }
    if let Some(comment) = &task.approval_comment {
        details.push(format!("Comment: {comment}"));
    }
    details.join("\n")
}

/// The calendar document for `user`. Tasks come in board order.
pub fn export_user_tasks(world: &World, user: &User, client_url: &str, now: DateTime<Utc>) -> String {
    let client_url = client_url.trim_end_matches('/');
    let mut calendar = Calendar::new();
    calendar.name(&format!("Tasks of {}", user.name));
    for task in world.tasks_of(user.id) {
        calendar.push(todo_for(world, task, client_url, now));
    }
    calendar.to_string()
}

fn todo_for(world: &World, task: &Task, client_url: &str, now: DateTime<Utc>) -> Todo {
    let mut todo = Todo::new();
    todo.uid(&format!("task-{}@taskboard", task.id))
        .timestamp(now)
        .summary(&task.title)
        .description(&describe(world, task))
        .priority(ical_priority(task.priority))
        .url(&format!("{client_url}/app#task-{}", task.id))
        .add_property("CREATED", stamp(task.created_at))
        .add_property("LAST-MODIFIED", stamp(task.updated_at))
        .add_property("CATEGORIES", category(task.status));

    match task.due_date {
        Some(due) => todo.due(due),
        None => todo.starts(task.created_at),
    };
    if task.status == TaskStatus::Done {
        todo.status(TodoStatus::Completed).completed(task.updated_at);
    } else {
        todo.status(TodoStatus::NeedsAction);
    }
    todo.done()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Undo line folding so assertions can look at whole content lines.
    fn unfold(ics: &str) -> String {
        ics.replace("\r\n ", "")
    }

    #[test]
    fn priority_scale() {
        assert_eq!(ical_priority(Priority::Urgent), 1);
        assert_eq!(ical_priority(Priority::High), 3);
        assert_eq!(ical_priority(Priority::Medium), 5);
        assert_eq!(ical_priority(Priority::Low), 9);
    }

    #[test]
    fn exports_owned_and_assigned_tasks() {
        let now = Utc.with_ymd_and_hms(2026, 2, 11, 9, 0, 0).unwrap();
        let mut world = World::new();
        let ada = world.insert_user(User::new("Ada", Some("👩".into()), now)).unwrap().id;
        let bob = world.insert_user(User::new("Bob", None, now)).unwrap().id;

        let mut done = Task::new("Ship it", now);
        done.owner_id = Some(ada);
        done.status = TaskStatus::Done;
        done.priority = Priority::Urgent;
        let done_id = world.insert_task(done).unwrap().id;

        let mut assigned = Task::new("Review", now);
        assigned.owner_id = Some(bob);
        assigned.assignee_id = Some(ada);
        assigned.due_date = Some(now);
        world.insert_task(assigned).unwrap();

        let mut unrelated = Task::new("Not mine", now);
        unrelated.owner_id = Some(bob);
        world.insert_task(unrelated).unwrap();

        let user = world.users[&ada].clone();
        let ics = unfold(&export_user_tasks(&world, &user, "https://board.example.com/", now));

        assert!(ics.starts_with("BEGIN:VCALENDAR\r\n"));
        assert!(ics.trim_end().ends_with("END:VCALENDAR"));
        assert_eq!(ics.matches("BEGIN:VTODO").count(), 2);
        assert!(!ics.contains("Not mine"));
        assert!(ics.contains("SUMMARY:Ship it"));
        assert!(ics.contains("PRIORITY:1"));
        assert!(ics.contains("STATUS:COMPLETED"));
        assert!(ics.contains("COMPLETED:20260211T090000Z"));
        assert!(ics.contains("STATUS:NEEDS-ACTION"));
        assert!(ics.contains("DUE:20260211T090000Z"));
        assert!(ics.contains(&format!("UID:task-{done_id}@taskboard")));
        assert!(ics.contains(&format!("URL:https://board.example.com/app#task-{done_id}")));
        assert!(ics.contains("Tasks of Ada"));
    }

    #[test]
    fn medium_priority_and_no_due_date() {
        let now = Utc.with_ymd_and_hms(2026, 2, 11, 9, 0, 0).unwrap();
        let mut world = World::new();
        let ada = world.insert_user(User::new("Ada", None, now)).unwrap().id;
        let mut task = Task::new("Someday", now);
        task.owner_id = Some(ada);
        task.status = TaskStatus::Doing;
        world.insert_task(task).unwrap();

        let user = world.users[&ada].clone();
        let ics = unfold(&export_user_tasks(&world, &user, "http://board.test", now));
        assert!(ics.contains("PRIORITY:5"));
        assert!(ics.contains("DTSTART:20260211T090000Z"));
        assert!(!ics.contains("DUE:"));
        assert!(ics.contains("CATEGORIES:In progress"));
    }
}
