//! Email notifications.
//!
//! Mail is built synchronously from World state (so it can be composed while
//! the lock is held) and sent on a spawned task. Sending is best-effort: a
//! failure is logged and never reaches the request that caused it.

use crate::models::{Task, TaskStatus, User};
use crate::settings::EmailSettings;
use crate::world::World;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

const POSTMARK_URL: &str = "https://api.postmarkapp.com/email";
const SENDGRID_URL: &str = "https://api.sendgrid.com/v3/mail/send";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail provider {0} is missing its credentials")]
    NotConfigured(&'static str),
    #[error("unknown mail provider {0}")]
    UnknownProvider(String),
    #[error("mail transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mail provider rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<(), MailError>;
}

// ── Backends ───────────────────────────────────────────────────

/// Development backend: the message goes to the log.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        tracing::info!(to = %mail.to, subject = %mail.subject, "email (dev, not sent)");
        tracing::debug!(html = %mail.html, "email body");
        Ok(())
    }
}

pub struct PostmarkMailer {
    client: reqwest::Client,
    token: String,
}

impl PostmarkMailer {
    fn payload(mail: &Mail) -> serde_json::Value {
        json!({
            "From": mail.from,
            "To": mail.to,
            "Subject": mail.subject,
            "HtmlBody": mail.html,
            "MessageStream": "outbound",
        })
    }
}

#[async_trait]
impl Mailer for PostmarkMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        let response = self
            .client
            .post(POSTMARK_URL)
            .header("Accept", "application/json")
            .header("X-Postmark-Server-Token", &self.token)
            .json(&Self::payload(mail))
            .send()
            .await?;
        check(response).await
    }
}

pub struct SendGridMailer {
    client: reqwest::Client,
    api_key: String,
}

impl SendGridMailer {
    fn payload(mail: &Mail) -> serde_json::Value {
        json!({
            "personalizations": [{ "to": [{ "email": mail.to }] }],
            "from": { "email": mail.from },
            "subject": mail.subject,
            "content": [{ "type": "text/html", "value": mail.html }],
        })
    }
}

#[async_trait]
impl Mailer for SendGridMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        let response = self
            .client
            .post(SENDGRID_URL)
            .bearer_auth(&self.api_key)
            .json(&Self::payload(mail))
            .send()
            .await?;
        check(response).await
    }
}

async fn check(response: reqwest::Response) -> Result<(), MailError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(MailError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Pick the backend named in the settings.
pub fn mailer_from_settings(
    settings: &EmailSettings,
    client: reqwest::Client,
) -> Result<Arc<dyn Mailer>, MailError> {
    match settings.provider.as_str() {
        "dev" => Ok(Arc::new(LogMailer)),
        "postmark" => {
            let token = settings
                .postmark_token
                .clone()
                .ok_or(MailError::NotConfigured("postmark"))?;
            Ok(Arc::new(PostmarkMailer { client, token }))
        }
        "sendgrid" => {
            let api_key = settings
                .sendgrid_api_key
                .clone()
                .ok_or(MailError::NotConfigured("sendgrid"))?;
            Ok(Arc::new(SendGridMailer { client, api_key }))
        }
        other => Err(MailError::UnknownProvider(other.to_string())),
    }
}

// ── Templates ──────────────────────────────────────────────────

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "To do",
        TaskStatus::Doing => "In progress",
        TaskStatus::Done => "Done",
    }
}

// ── Notifier ───────────────────────────────────────────────────

#[derive(Clone)]
pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    from: String,
    client_url: String,
    reminded: Arc<Mutex<HashSet<Uuid>>>,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, from: impl Into<String>, client_url: impl Into<String>) -> Self {
        Notifier {
            mailer,
            from: from.into(),
            client_url: client_url.into().trim_end_matches('/').to_string(),
            reminded: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn mail(&self, to: &str, subject: String, body: String) -> Mail {
        Mail {
            from: self.from.clone(),
            to: to.to_string(),
            subject,
            html: format!(
                "{body}<p><a href=\"{}/app\">Open the board</a></p>",
                escape_html(&self.client_url)
            ),
        }
    }

    pub fn task_assigned(&self, task: &Task, assignee: &User) -> Option<Mail> {
        let to = assignee.email.as_deref().filter(|_| assignee.notify_on_assign)?;
        let due = task
            .due_date
            .map(|d| format!("<p><strong>Due:</strong> {}</p>", d.format("%Y-%m-%d")))
            .unwrap_or_default();
        Some(self.mail(
            to,
            format!("New task assigned: {}", task.title),
            format!(
                "<h2>New task assigned</h2><p>Hello {},</p><p>A task was assigned to you:</p>\
                 <h3>{}</h3><p><strong>Priority:</strong> {}</p>{due}",
                escape_html(&assignee.name),
                escape_html(&task.title),
                task.priority.as_str(),
            ),
        ))
    }

    pub fn task_completed(&self, task: &Task, owner: &User, assignee: Option<&User>) -> Option<Mail> {
        let to = owner.email.as_deref().filter(|_| owner.notify_on_complete)?;
        let by = assignee
            .map(|a| format!("<p><strong>By:</strong> {}</p>", escape_html(&a.name)))
            .unwrap_or_default();
        Some(self.mail(
            to,
            format!("Task completed: {}", task.title),
            format!(
                "<h2>Task completed</h2><p>Hello {},</p><p>This task was marked as done:</p>\
                 <h3>{}</h3>{by}",
                escape_html(&owner.name),
                escape_html(&task.title),
            ),
        ))
    }

    pub fn new_comment(&self, task: &Task, author: &User, content: &str, recipient: &User) -> Option<Mail> {
        let to = recipient.email.as_deref().filter(|_| recipient.notify_on_comment)?;
        Some(self.mail(
            to,
            format!("New comment on \"{}\"", task.title),
            format!(
                "<h2>New comment</h2><p>Hello {},</p><p>{} commented on:</p><h3>{}</h3>\
                 <blockquote style=\"border-left: 3px solid #cbd5e1; padding-left: 12px;\">{}</blockquote>",
                escape_html(&recipient.name),
                escape_html(&author.name),
                escape_html(&task.title),
                escape_html(content),
            ),
        ))
    }

    pub fn deadline_reminder(&self, task: &Task, assignee: &User) -> Option<Mail> {
        let to = assignee.email.as_deref()?;
        let due = task.due_date?;
        Some(self.mail(
            to,
            format!("Reminder: \"{}\" is due soon", task.title),
            format!(
                "<h2>Deadline reminder</h2><p>Hello {},</p><p>This task is due soon:</p><h3>{}</h3>\
                 <p><strong>Due:</strong> {}</p><p><strong>Status:</strong> {}</p>",
                escape_html(&assignee.name),
                escape_html(&task.title),
                due.format("%Y-%m-%d %H:%M UTC"),
                status_label(task.status),
            ),
        ))
    }

    /// Reminders for open tasks due within the next 24 hours. Each task is
    /// reminded at most once per process.
    pub fn deadline_reminders(&self, world: &World, now: DateTime<Utc>) -> Vec<Mail> {
        let window_end = now + Duration::hours(24);
        let mut reminded = self.reminded.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();

        for task in world.tasks.values() {
            if task.status == TaskStatus::Done || reminded.contains(&task.id) {
                continue;
            }
            let Some(due) = task.due_date else { continue };
            if due <= now || due > window_end {
                continue;
            }
            let Some(assignee) = task.assignee_id.and_then(|id| world.users.get(&id)) else {
                continue;
            };
            if let Some(mail) = self.deadline_reminder(task, assignee) {
                reminded.insert(task.id);
                out.push(mail);
            }
        }
        out
    }

    /// Send on a background task. Never fails the caller.
    pub fn dispatch(&self, mail: Mail) {
        let mailer = self.mailer.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match mailer.send(&mail).await {
                        Ok(()) => tracing::info!(to = %mail.to, subject = %mail.subject, "email sent"),
                        Err(e) => tracing::warn!(to = %mail.to, error = %e, "email failed"),
                    }
                });
            }
            Err(_) => tracing::warn!(to = %mail.to, "no runtime, email dropped"),
        }
    }

    pub fn dispatch_all(&self, mails: impl IntoIterator<Item = Mail>) {
        for mail in mails {
            self.dispatch(mail);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────
