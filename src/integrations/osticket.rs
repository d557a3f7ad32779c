//! osTicket: `X-API-Key` header, JSON endpoints ending in `.json`.
//!
//! osTicket has no ticket update call; status sync, updates and comments all
//! post a response to the ticket thread.

use super::{
    map_priority, Auth, Endpoint, ImportedTask, IntegrationConfig, Provider, TaskSnapshot,
    TicketOutcome, TicketingError, TicketingSystem,
};
use crate::models::TaskStatus;
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_NAME: &str = "System User";
const DEFAULT_EMAIL: &str = "system@localhost";

pub fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "open",
        TaskStatus::Doing => "in progress",
        TaskStatus::Done => "resolved",
    }
}

pub fn status_from_label(label: &str) -> TaskStatus {
    match label.to_lowercase().as_str() {
        "resolved" | "closed" => TaskStatus::Done,
        _ => TaskStatus::Todo,
    }
}

pub struct OsTicket {
    endpoint: Endpoint,
    name: String,
    email: String,
    topic_id: Option<Value>,
}

impl OsTicket {
    pub fn new(config: &IntegrationConfig, client: reqwest::Client) -> Self {
        OsTicket {
            endpoint: Endpoint::new(
                client,
                &config.api_url,
                Provider::OsTicket,
                Auth::ApiKey(config.api_key.clone()),
            ),
            name: config
                .custom
                .default_name
                .clone()
                .unwrap_or_else(|| DEFAULT_NAME.into()),
            email: config
                .custom
                .default_email
                .clone()
                .unwrap_or_else(|| DEFAULT_EMAIL.into()),
            topic_id: config.custom.topic_id.clone(),
        }
    }

    fn new_ticket(&self, task: &TaskSnapshot) -> Value {
        let mut ticket = json!({
            "alert": true,
            "autorespond": true,
            "source": "API",
            "name": self.name,
            "email": self.email,
            "subject": task.title,
            "message": task.description.as_deref().unwrap_or(&task.title),
            "priority": map_priority(task.priority),
        });
        if let Some(topic) = &self.topic_id {
            ticket["topicId"] = topic.clone();
        }
        ticket
    }

    async fn respond(&self, ticket_id: &str, message: &str) -> Result<Value, TicketingError> {
        let body = json!({ "message": message, "alert": false });
        self.endpoint
            .post(&format!("/api/tickets/{ticket_id}/response.json"), &body)
            .await
    }
}

#[async_trait]
impl TicketingSystem for OsTicket {
    fn provider(&self) -> Provider {
        Provider::OsTicket
    }

    async fn test_connection(&self) -> Result<Value, TicketingError> {
        self.endpoint.get("/api/tickets.json").await?;
        Ok(json!({ "message": "Connected to osTicket" }))
    }

    async fn create_ticket_from_task(&self, task: &TaskSnapshot) -> Result<TicketOutcome, TicketingError> {
        let created = self.endpoint.post("/api/tickets.json", &self.new_ticket(task)).await?;
        // osTicket answers with the bare ticket number.
        let number = match &created {
            Value::Object(fields) => fields.get("number").or_else(|| fields.get("id")).cloned(),
            Value::Null => None,
            other => Some(other.clone()),
        };
        Ok(TicketOutcome {
            ticket_id: number.clone(),
            ticket_number: number,
            message: Some("Ticket created".into()),
            ticket: created,
        })
    }

    async fn sync_task_with_ticket(
        &self,
        task: &TaskSnapshot,
        ticket_id: &str,
    ) -> Result<TicketOutcome, TicketingError> {
        let message = format!(
            "Task \"{}\" is now {}.",
            task.title,
            status_label(task.status)
        );
        let response = self.respond(ticket_id, &message).await?;
        Ok(TicketOutcome {
            ticket_id: Some(Value::String(ticket_id.to_string())),
            message: Some("Status synced".into()),
            ticket: response,
            ..TicketOutcome::default()
        })
    }

    async fn import_ticket_as_task(&self, ticket_id: &str) -> Result<ImportedTask, TicketingError> {
        let ticket = self.get_ticket_details(ticket_id).await?;
        let external_id = match ticket.get("id") {
            Some(id) if !id.is_null() => id.clone(),
            _ => ticket["ticket_id"].clone(),
        };
        Ok(ImportedTask {
            title: ticket["subject"].as_str().unwrap_or_default().to_string(),
            description: ticket["message"].as_str().unwrap_or_default().to_string(),
            status: status_from_label(ticket["status"].as_str().unwrap_or("open")),
            external_id,
            external_number: ticket.get("number").cloned(),
            provider: Provider::OsTicket,
        })
    }

    async fn get_ticket_details(&self, ticket_id: &str) -> Result<Value, TicketingError> {
        self.endpoint.get(&format!("/api/tickets/{ticket_id}.json")).await
    }

    async fn update_ticket(&self, ticket_id: &str, updates: &Value) -> Result<TicketOutcome, TicketingError> {
        let message = match updates.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => format!("Ticket updated: {updates}"),
        };
        let response = self.respond(ticket_id, &message).await?;
        Ok(TicketOutcome {
            ticket_id: Some(Value::String(ticket_id.to_string())),
            message: Some("Ticket updated".into()),
            ticket: response,
            ..TicketOutcome::default()
        })
    }

    async fn add_comment_to_ticket(&self, ticket_id: &str, comment: &str) -> Result<TicketOutcome, TicketingError> {
        let response = self.respond(ticket_id, comment).await?;
        Ok(TicketOutcome {
            ticket_id: Some(Value::String(ticket_id.to_string())),
            message: Some("Comment added".into()),
            ticket: response,
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
        routing::{get, post},
        Json, Router,
    };
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn snapshot(title: &str) -> TaskSnapshot {
        TaskSnapshot {
            id: Uuid::new_v4(),
            title: title.into(),
            description: Some("Details".into()),
            status: TaskStatus::Done,
            priority: Priority::Low,
            assignee_id: None,
        }
    }

    #[test]
    fn status_vocabulary() {
        assert_eq!(status_from_label("Open"), TaskStatus::Todo);
        assert_eq!(status_from_label("resolved"), TaskStatus::Done);
        assert_eq!(status_from_label("closed"), TaskStatus::Done);
        assert_eq!(status_from_label("answered"), TaskStatus::Todo);
    }

    #[test]
    fn topic_is_optional() {
        let osticket = OsTicket::new(&config(Provider::OsTicket, "http://desk"), reqwest::Client::new());
        let body = osticket.new_ticket(&snapshot("Broken link"));
        assert!(body.get("topicId").is_none());
        assert_eq!(body["name"], DEFAULT_NAME);
        assert_eq!(body["priority"], 1);
        assert_eq!(body["message"], "Details");

        let mut cfg = config(Provider::OsTicket, "http://desk");
        cfg.custom.topic_id = Some(json!(12));
        let osticket = OsTicket::new(&cfg, reqwest::Client::new());
        assert_eq!(osticket.new_ticket(&snapshot("Broken link"))["topicId"], 12);
    }

    #[tokio::test]
    async fn creates_and_syncs_through_responses() {
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let responses = seen.clone();
        let router = Router::new()
            .route(
                "/api/tickets.json",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("secret-key") {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    assert_eq!(body["source"], "API");
                    Ok("548203")
                }),
            )
            .route(
                "/api/tickets/:id/response.json",
                post(move |Path(id): Path<String>, Json(body): Json<Value>| async move {
                    assert_eq!(id, "548203");
                    responses.lock().unwrap().push(body);
                    Json(json!({ "ok": true }))
                }),
            );
        let base = serve(router).await;
        let osticket = OsTicket::new(&config(Provider::OsTicket, &base), reqwest::Client::new());

        let created = osticket.create_ticket_from_task(&snapshot("Broken link")).await.unwrap();
        assert_eq!(created.ticket_number, Some(json!(548203)));

        osticket
            .sync_task_with_ticket(&snapshot("Broken link"), "548203")
            .await
            .unwrap();
        osticket.add_comment_to_ticket("548203", "Fixed it").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0]["message"].as_str().unwrap().contains("resolved"));
        assert_eq!(seen[0]["alert"], false);
        assert_eq!(seen[1]["message"], "Fixed it");
    }

    #[tokio::test]
    async fn imports_using_ticket_id_fallback() {
        let router = Router::new().route(
            "/api/tickets/:id",
            get(|| async {
                Json(json!({
                    "ticket_id": 91,
                    "number": "100091",
                    "subject": "Password reset",
                    "message": "Locked out",
                    "status": "closed",
                }))
            }),
        );
        let base = serve(router).await;
        let osticket = OsTicket::new(&config(Provider::OsTicket, &base), reqwest::Client::new());

        let imported = osticket.import_ticket_as_task("91").await.unwrap();
        assert_eq!(imported.external_id, json!(91));
        assert_eq!(imported.status, TaskStatus::Done);
        assert_eq!(imported.title, "Password reset");
    }
}
