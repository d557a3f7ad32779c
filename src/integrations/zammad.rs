//! Zammad: bearer-token REST API under `/api/v1`.

use super::{
    Auth, Endpoint, ImportedTask, IntegrationConfig, Provider, TaskSnapshot, TicketOutcome,
    TicketingError, TicketingSystem,
};
use crate::models::TaskStatus;
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_GROUP: &str = "Users";
const DEFAULT_CUSTOMER: &str = "system@localhost";

pub fn state_for(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "new",
        TaskStatus::Doing => "open",
        TaskStatus::Done => "closed",
    }
}

pub fn status_from_state(state: &str) -> TaskStatus {
    match state {
        "open" | "pending reminder" | "pending close" => TaskStatus::Doing,
        "closed" => TaskStatus::Done,
        _ => TaskStatus::Todo,
    }
}

/// Zammad reports the state either as a name or, expanded, as an object.
fn state_name(ticket: &Value) -> &str {
    match &ticket["state"] {
        Value::String(name) => name,
        other => other["name"].as_str().unwrap_or_default(),
    }
}

pub struct Zammad {
    endpoint: Endpoint,
    group: String,
    customer: String,
}

impl Zammad {
    pub fn new(config: &IntegrationConfig, client: reqwest::Client) -> Self {
        Zammad {
            endpoint: Endpoint::new(
                client,
                &config.api_url,
                Provider::Zammad,
                Auth::Bearer(config.api_key.clone()),
            ),
            group: config
                .custom
                .default_group
                .clone()
                .unwrap_or_else(|| DEFAULT_GROUP.into()),
            customer: config
                .custom
                .default_customer
                .clone()
                .unwrap_or_else(|| DEFAULT_CUSTOMER.into()),
        }
    }

    fn new_ticket(&self, task: &TaskSnapshot) -> Value {
        json!({
            "title": task.title,
            "group": self.group,
            "customer": self.customer,
            "article": {
                "subject": task.title,
                "body": task.description.as_deref().unwrap_or(&task.title),
                "type": "note",
                "internal": false,
            },
        })
    }
}

#[async_trait]
impl TicketingSystem for Zammad {
    fn provider(&self) -> Provider {
        Provider::Zammad
    }

    async fn test_connection(&self) -> Result<Value, TicketingError> {
        let me = self.endpoint.get("/api/v1/users/me").await?;
        Ok(json!({ "message": "Connected to Zammad", "user": me }))
    }

    async fn create_ticket_from_task(&self, task: &TaskSnapshot) -> Result<TicketOutcome, TicketingError> {
        let ticket = self.endpoint.post("/api/v1/tickets", &self.new_ticket(task)).await?;
        Ok(TicketOutcome {
            ticket_id: ticket.get("id").cloned(),
            ticket_number: ticket.get("number").cloned(),
            message: None,
            ticket,
        })
    }

    async fn sync_task_with_ticket(
        &self,
        task: &TaskSnapshot,
        ticket_id: &str,
    ) -> Result<TicketOutcome, TicketingError> {
        let updates = json!({ "title": task.title, "state": state_for(task.status) });
        self.update_ticket(ticket_id, &updates).await
    }

    async fn import_ticket_as_task(&self, ticket_id: &str) -> Result<ImportedTask, TicketingError> {
        let ticket = self.get_ticket_details(ticket_id).await?;
        Ok(ImportedTask {
            title: ticket["title"].as_str().unwrap_or_default().to_string(),
            description: ticket["article"]["body"].as_str().unwrap_or_default().to_string(),
            status: status_from_state(state_name(&ticket)),
            external_id: ticket["id"].clone(),
            external_number: ticket.get("number").cloned(),
            provider: Provider::Zammad,
        })
    }

    async fn get_ticket_details(&self, ticket_id: &str) -> Result<Value, TicketingError> {
        self.endpoint.get(&format!("/api/v1/tickets/{ticket_id}")).await
    }

    async fn update_ticket(&self, ticket_id: &str, updates: &Value) -> Result<TicketOutcome, TicketingError> {
        let ticket = self
            .endpoint
            .put(&format!("/api/v1/tickets/{ticket_id}"), updates)
            .await?;
        Ok(TicketOutcome {
            ticket_id: ticket.get("id").cloned(),
            ticket,
            ..TicketOutcome::default()
        })
    }

    async fn add_comment_to_ticket(&self, ticket_id: &str, comment: &str) -> Result<TicketOutcome, TicketingError> {
        let article = json!({
            "ticket_id": ticket_id,
            "body": comment,
            "type": "note",
            "internal": false,
        });
        let article = self.endpoint.post("/api/v1/ticket_articles", &article).await?;
        Ok(TicketOutcome {
            message: Some("Comment added".into()),
            ticket: article,
            ..TicketOutcome::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::test_server::{config, serve};
    use crate::models::Priority;
    use axum::{
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::get,
        Json, Router,
    };
    use uuid::Uuid;

    #[test]
    fn status_vocabulary() {
        assert_eq!(state_for(TaskStatus::Todo), "new");
        assert_eq!(state_for(TaskStatus::Doing), "open");
        assert_eq!(state_for(TaskStatus::Done), "closed");
        assert_eq!(status_from_state("new"), TaskStatus::Todo);
        assert_eq!(status_from_state("pending close"), TaskStatus::Doing);
        assert_eq!(status_from_state("closed"), TaskStatus::Done);
        assert_eq!(status_from_state("merged"), TaskStatus::Todo);
    }

    #[test]
    fn new_ticket_uses_configured_routing() {
        let mut cfg = config(Provider::Zammad, "https://help.example.com/");
        cfg.custom.default_group = Some("Support".into());
        let zammad = Zammad::new(&cfg, reqwest::Client::new());
        let task = TaskSnapshot {
            id: Uuid::new_v4(),
            title: "Printer jammed".into(),
            description: None,
            status: TaskStatus::Todo,
            priority: Priority::High,
            assignee_id: None,
        };
        let body = zammad.new_ticket(&task);
        assert_eq!(body["group"], "Support");
        assert_eq!(body["customer"], DEFAULT_CUSTOMER);
        assert_eq!(body["article"]["body"], "Printer jammed");
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer secret-key")
    }

    #[tokio::test]
    async fn imports_a_ticket() {
        let router = Router::new().route(
            "/api/v1/tickets/:id",
            get(|Path(id): Path<u64>, headers: HeaderMap| async move {
                if !authorized(&headers) {
                    return Err(StatusCode::UNAUTHORIZED);
                }
                Ok(Json(json!({
                    "id": id,
                    "number": "31007",
                    "title": "VPN down",
                    "state": { "name": "pending reminder" },
                    "article": { "body": "since monday" },
                })))
            }),
        );
        let base = serve(router).await;
        let zammad = Zammad::new(&config(Provider::Zammad, &base), reqwest::Client::new());

        let imported = zammad.import_ticket_as_task("7").await.unwrap();
        assert_eq!(imported.title, "VPN down");
        assert_eq!(imported.status, TaskStatus::Doing);
        assert_eq!(imported.external_id, json!(7));
        assert_eq!(imported.description, "since monday");
    }

    #[tokio::test]
    async fn failures_carry_status_and_body() {
        let router = Router::new().route(
            "/api/v1/users/me",
            get(|| async { (StatusCode::UNAUTHORIZED, "token revoked") }),
        );
        let base = serve(router).await;
        let zammad = Zammad::new(&config(Provider::Zammad, &base), reqwest::Client::new());

        match zammad.test_connection().await {
            Err(TicketingError::Upstream { provider, status, body }) => {
                assert_eq!(provider, Provider::Zammad);
                assert_eq!(status, 401);
                assert_eq!(body, "token revoked");
            }
            other => panic!("expected upstream failure, got {other:?}"),
        }
    }
}
