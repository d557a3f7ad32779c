//! Freshdesk: basic auth with the API key as user, REST under `/api/v2`.

use super::{
    map_priority, Auth, Endpoint, ImportedTask, IntegrationConfig, Provider, TaskSnapshot,
    TicketOutcome, TicketingError, TicketingSystem,
};
use crate::models::TaskStatus;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

const DEFAULT_EMAIL: &str = "system@localhost";

// Freshdesk ticket status codes.
const OPEN: u64 = 2;
const PENDING: u64 = 3;
const RESOLVED: u64 = 4;
const CLOSED: u64 = 5;

pub fn status_code(status: TaskStatus) -> u64 {
    match status {
        TaskStatus::Todo => OPEN,
        TaskStatus::Doing => PENDING,
        TaskStatus::Done => CLOSED,
    }
}

pub fn status_from_code(code: u64) -> TaskStatus {
    match code {
        PENDING => TaskStatus::Doing,
        RESOLVED | CLOSED => TaskStatus::Done,
        _ => TaskStatus::Todo,
    }
}

pub struct Freshdesk {
    endpoint: Endpoint,
    email: String,
    ticket_type: Option<String>,
    agents: HashMap<Uuid, Value>,
}

impl Freshdesk {
    pub fn new(config: &IntegrationConfig, client: reqwest::Client) -> Self {
        Freshdesk {
            endpoint: Endpoint::new(
                client,
                &config.api_url,
                Provider::Freshdesk,
                Auth::BasicKey(config.api_key.clone()),
            ),
            email: config
                .custom
                .default_email
                .clone()
                .unwrap_or_else(|| DEFAULT_EMAIL.into()),
            ticket_type: config.custom.default_type.clone(),
            agents: config.custom.user_mapping.clone(),
        }
    }

    fn new_ticket(&self, task: &TaskSnapshot) -> Value {
        let mut ticket = json!({
            "subject": task.title,
            "description": task.description.as_deref().unwrap_or(&task.title),
            "email": self.email,
            "priority": map_priority(task.priority),
            "status": OPEN,
        });
        if let Some(agent) = task.assignee_id.and_then(|id| self.agents.get(&id)) {
            ticket["responder_id"] = agent.clone();
        }
        if let Some(kind) = &self.ticket_type {
            ticket["type"] = Value::String(kind.clone());
        }
        ticket
    }

    fn outcome(ticket: Value, message: &str) -> TicketOutcome {
        TicketOutcome {
            ticket_id: ticket.get("id").cloned(),
            ticket_number: ticket.get("id").cloned(),
            message: Some(message.into()),
            ticket,
        }
    }
}

#[async_trait]
impl TicketingSystem for Freshdesk {
    fn provider(&self) -> Provider {
        Provider::Freshdesk
    }

    async fn test_connection(&self) -> Result<Value, TicketingError> {
        self.endpoint.get("/api/v2/tickets?per_page=1").await?;
        Ok(json!({ "message": "Connected to Freshdesk" }))
    }

    async fn create_ticket_from_task(&self, task: &TaskSnapshot) -> Result<TicketOutcome, TicketingError> {
        let ticket = self.endpoint.post("/api/v2/tickets", &self.new_ticket(task)).await?;
        Ok(Self::outcome(ticket, "Ticket created"))
    }

    async fn sync_task_with_ticket(
        &self,
        task: &TaskSnapshot,
        ticket_id: &str,
    ) -> Result<TicketOutcome, TicketingError> {
        let updates = json!({
            "subject": task.title,
            "status": status_code(task.status),
            "priority": map_priority(task.priority),
        });
        self.update_ticket(ticket_id, &updates).await
    }

    async fn import_ticket_as_task(&self, ticket_id: &str) -> Result<ImportedTask, TicketingError> {
        let ticket = self.get_ticket_details(ticket_id).await?;
        let description = ticket["description_text"]
            .as_str()
            .or_else(|| ticket["description"].as_str())
            .unwrap_or_default();
        Ok(ImportedTask {
            title: ticket["subject"].as_str().unwrap_or_default().to_string(),
            description: description.to_string(),
            status: status_from_code(ticket["status"].as_u64().unwrap_or(OPEN)),
            external_id: ticket["id"].clone(),
            external_number: ticket.get("id").cloned(),
            provider: Provider::Freshdesk,
        })
    }

    async fn get_ticket_details(&self, ticket_id: &str) -> Result<Value, TicketingError> {
        self.endpoint.get(&format!("/api/v2/tickets/{ticket_id}")).await
    }

    async fn update_ticket(&self, ticket_id: &str, updates: &Value) -> Result<TicketOutcome, TicketingError> {
        let ticket = self
            .endpoint
            .put(&format!("/api/v2/tickets/{ticket_id}"), updates)
            .await?;
        Ok(Self::outcome(ticket, "Ticket updated"))
    }

    async fn add_comment_to_ticket(&self, ticket_id: &str, comment: &str) -> Result<TicketOutcome, TicketingError> {
        let note = json!({ "body": comment, "private": false });
        let note = self
            .endpoint
            .post(&format!("/api/v2/tickets/{ticket_id}/notes"), &note)
            .await?;
        Ok(TicketOutcome {
            ticket_id: Some(Value::String(ticket_id.to_string())),
            message: Some("Comment added".into()),
            ticket: note,
            ..TicketOutcome::default()
        })
    }
}
