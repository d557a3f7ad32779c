//! Recurring tasks.
//!
//! A template task carries a rule string in iCalendar form:
//!
//! ```text
//! DTSTART:20260211T090000Z
//! RRULE:FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,WE
//! ```
//!
//! The scheduler expands every template over a rolling horizon and creates
//! one concrete instance per occurrence that doesn't exist yet. Occurrences
//! are anchored on DTSTART, so the same rule always yields the same
//! timestamps and re-running a tick creates nothing new.

use crate::hub::ServerEvent;
use crate::models::{Task, TaskStatus};
use crate::state::SharedState;
use crate::world::World;
use chrono::{DateTime, Duration, Utc};
use rrule::{RRuleSet, Tz};
use std::str::FromStr;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Occurrences taken from one rule per expansion.
const MAX_OCCURRENCES: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    #[error("invalid recurrence rule: {0}")]
    Invalid(String),
}

// ── Patterns ───────────────────────────────────────────────────

/// The human-friendly choices offered when creating a recurring task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Yearly,
    Weekdays,
}

impl RecurrencePattern {
    /// Unknown names fall back to weekly.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "daily" => RecurrencePattern::Daily,
            "biweekly" => RecurrencePattern::Biweekly,
            "monthly" => RecurrencePattern::Monthly,
            "yearly" => RecurrencePattern::Yearly,
            "weekdays" => RecurrencePattern::Weekdays,
            _ => RecurrencePattern::Weekly,
        }
    }

    /// The RRULE body for this pattern.
    fn rule(self) -> &'static str {
        match self {
            RecurrencePattern::Daily => "FREQ=DAILY",
            RecurrencePattern::Weekly => "FREQ=WEEKLY",
            RecurrencePattern::Biweekly => "FREQ=WEEKLY;INTERVAL=2",
            RecurrencePattern::Monthly => "FREQ=MONTHLY",
            RecurrencePattern::Yearly => "FREQ=YEARLY",
            RecurrencePattern::Weekdays => "FREQ=DAILY;BYDAY=MO,TU,WE,TH,FR",
        }
    }
}

/// Rule string for a pattern name, anchored at `now` truncated to the second.
pub fn rule_for_pattern(pattern: &str, now: DateTime<Utc>) -> String {
    format!(
        "DTSTART:{}\nRRULE:{}",
        now.format(DATE_FORMAT),
        RecurrencePattern::parse(pattern).rule()
    )
}

// ── Rules ──────────────────────────────────────────────────────

/// A parsed rule string.
#[derive(Debug, Clone)]
pub struct RecurrenceRule(RRuleSet);

impl FromStr for RecurrenceRule {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<RRuleSet>()
            .map(RecurrenceRule)
            .map_err(|e| RecurrenceError::Invalid(e.to_string()))
    }
}

impl RecurrenceRule {
    /// Every occurrence in `[after, before]`, ascending.
    pub fn between(&self, after: DateTime<Utc>, before: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        if before < after {
            return Vec::new();
        }
        // Widened by a second, then clipped, so both ends are inclusive.
        let slack = Duration::seconds(1);
        let result = self
            .0
            .clone()
            .after((after - slack).with_timezone(&Tz::UTC))
            .before((before + slack).with_timezone(&Tz::UTC))
            .all(MAX_OCCURRENCES);
        if result.limited {
            tracing::warn!(limit = MAX_OCCURRENCES, "recurrence expansion truncated");
        }
        result
            .dates
            .into_iter()
            .map(|d| d.with_timezone(&Utc))
            .filter(|d| *d >= after && *d <= before)
            .collect()
    }
}

// ── Expansion ──────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Expansion {
    pub created: Vec<Uuid>,
    pub failed: Vec<(Uuid, RecurrenceError)>,
}

fn instance_of(template: &Task, due: DateTime<Utc>, now: DateTime<Utc>) -> Task {
    let mut instance = Task::new(template.title.clone(), now);
    instance.status = TaskStatus::Todo;
    instance.due_date = Some(due);
    instance.assignee_id = template.assignee_id;
    instance.owner_id = template.owner_id;
    instance.priority = template.priority;
    instance.is_public = template.is_public;
    instance.public_summary = template.public_summary.clone();
    instance.parent_task_id = Some(template.id);
    instance.is_recurring = false;
    instance
}

/// Create the missing instances of every template for `[now, now + horizon]`.
/// A template whose rule can't be read is reported and skipped.
pub fn expand_world(world: &mut World, now: DateTime<Utc>, horizon: Duration) -> Expansion {
    let mut report = Expansion::default();
    let templates: Vec<Task> = world
        .recurring_templates()
        .into_iter()
        .filter(|t| t.parent_task_id.is_none())
        .cloned()
        .collect();

    for template in templates {
        let Some(rule) = template.active_rule() else {
            continue;
        };
        let rule: RecurrenceRule = match rule.parse() {
            Ok(rule) => rule,
            Err(e) => {
                tracing::warn!(task_id = %template.id, error = %e, "skipping recurring task");
                report.failed.push((template.id, e));
                continue;
            }
        };

        for due in rule.between(now, now + horizon) {
            if world.instance_exists(template.id, due) {
                continue;
            }
            match world.insert_task(instance_of(&template, due, now)) {
                Ok(instance) => {
                    tracing::info!(
                        task_id = %instance.id,
                        parent = %template.id,
                        due = %due,
                        title = %template.title,
                        "created recurring instance"
                    );
                    report.created.push(instance.id);
                }
                Err(e) => {
                    tracing::warn!(task_id = %template.id, error = %e, "cannot create recurring instance");
                    report
                        .failed
                        .push((template.id, RecurrenceError::Invalid(e.to_string())));
                    break;
                }
            }
        }
    }
    report
}

/// One scheduler tick: expand templates, persist, broadcast, then send
/// deadline reminders.
pub fn run_tick(state: &SharedState, now: DateTime<Utc>) -> Expansion {
    let horizon = Duration::days(state.settings.recurrence_horizon_days);

    let (report, views, reminders) = {
        let mut world = state.write();
        let report = expand_world(&mut world, now, horizon);
        state.commit_side_effect(&mut world, "recurring instances");
        let views: Vec<_> = report
            .created
            .iter()
            .filter_map(|id| world.task_view_by_id(*id).ok())
            .collect();
        let reminders = state.notifier.deadline_reminders(&world, now);
        (report, views, reminders)
    };

    for view in views {
        state.hub.publish(ServerEvent::TaskCreated(view));
    }
    for mail in reminders {
        state.notifier.dispatch(mail);
    }
    report
}

/// Run one tick now, then one every `recurrence_interval_secs`. Ticks never
/// overlap: a slow tick delays the next one.
pub fn spawn_scheduler(state: SharedState) -> JoinHandle<()> {
    let period = std::time::Duration::from_secs(state.settings.recurrence_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(every_secs = period.as_secs(), "recurring task scheduler started");
        loop {
            ticker.tick().await;
            let report = run_tick(&state, Utc::now());
            if !report.created.is_empty() || !report.failed.is_empty() {
                tracing::info!(
                    created = report.created.len(),
                    failed = report.failed.len(),
                    "recurrence tick"
                );
            }
        }
    })
}

// ── Tests ──────────────────────────────────────────────────────
