use crate::error::AppError;
use crate::integrations::{
    CustomConfig, ImportedTask, IntegrationConfig, IntegrationSummary, Provider, TaskSnapshot,
};
use crate::lifecycle::{self, NewTask};
use crate::models::TaskView;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigureRequest {
    pub user_id: Option<Uuid>,
    pub provider: Option<String>,
    pub api_url: String,
    pub api_key: String,
    pub enabled: Option<bool>,
    pub custom_config: CustomConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestRequest {
    pub provider: Option<String>,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub custom_config: CustomConfig,
}

/// Body shared by the ticket operations. Ticket ids may arrive as numbers or
/// strings.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketRequest {
    pub user_id: Option<Uuid>,
    pub provider: Option<String>,
    pub task_id: Option<Uuid>,
    pub ticket_id: Option<Value>,
    /// Import only: also create the task.
    pub create: bool,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub success: bool,
    pub task: ImportedTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<TaskView>,
}

fn require_user(user_id: Option<Uuid>) -> Result<Uuid, AppError> {
    user_id.ok_or_else(|| AppError::validation("userId is required"))
}

fn require_provider(provider: Option<&str>) -> Result<Provider, AppError> {
    let provider = provider
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| AppError::validation("provider is required"))?;
    Ok(provider.parse()?)
}

fn ticket_ref(ticket_id: Option<&Value>) -> Result<String, AppError> {
    match ticket_id {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(AppError::validation("ticketId is required")),
    }
}

fn snapshot(state: &SharedState, task_id: Option<Uuid>) -> Result<TaskSnapshot, AppError> {
    let task_id = task_id.ok_or_else(|| AppError::validation("taskId is required"))?;
    let world = state.read();
    Ok(TaskSnapshot::from(world.task(task_id)?))
}

// GET /api/integrations?userId=
pub async fn list(
    State(state): State<SharedState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<BTreeMap<Provider, IntegrationSummary>>, AppError> {
    let user_id = require_user(query.user_id)?;
    Ok(Json(state.integrations.list(user_id)))
}

// POST /api/integrations/configure
pub async fn configure(
    State(state): State<SharedState>,
    Json(payload): Json<ConfigureRequest>,
) -> Result<Json<Value>, AppError> {
    let user_id = require_user(payload.user_id)?;
    let provider = require_provider(payload.provider.as_deref())?;

    let summary = state.integrations.configure(
        user_id,
        IntegrationConfig {
            provider,
            api_url: payload.api_url,
            api_key: payload.api_key,
            enabled: payload.enabled.unwrap_or(true),
            custom: payload.custom_config,
            last_sync: None,
        },
    );

    tracing::info!(%user_id, %provider, "integration configured");
    Ok(Json(json!({
        "success": true,
        "message": format!("{provider} integration configured"),
        "config": summary,
    })))
}

// POST /api/integrations/test
pub async fn test(
    State(state): State<SharedState>,
    Json(payload): Json<TestRequest>,
) -> Result<Json<Value>, AppError> {
    let (Some(provider), Some(api_url), Some(api_key)) = (
        payload.provider.as_deref().filter(|p| !p.is_empty()),
        payload.api_url.filter(|u| !u.is_empty()),
        payload.api_key.filter(|k| !k.is_empty()),
    ) else {
        return Err(AppError::validation("provider, apiUrl, and apiKey are required"));
    };

    let config = IntegrationConfig {
        provider: provider.parse()?,
        api_url,
        api_key,
        enabled: true,
        custom: payload.custom_config,
        last_sync: None,
    };
    let result = state.integrations.connect(&config).test_connection().await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

// POST /api/integrations/create-ticket
pub async fn create_ticket(
    State(state): State<SharedState>,
    Json(payload): Json<TicketRequest>,
) -> Result<Json<Value>, AppError> {
    let user_id = require_user(payload.user_id)?;
    let provider = require_provider(payload.provider.as_deref())?;
    let task = snapshot(&state, payload.task_id)?;
    let config = state.integrations.get_enabled(user_id, provider)?;

    let ticket = state
        .integrations
        .connect(&config)
        .create_ticket_from_task(&task)
        .await?;
    state.integrations.mark_synced(user_id, provider, Utc::now());

    tracing::info!(task_id = %task.id, %provider, ticket_id = ?ticket.ticket_id, "ticket created");
    Ok(Json(json!({ "success": true, "ticket": ticket })))
}

// POST /api/integrations/sync-ticket
pub async fn sync_ticket(
    State(state): State<SharedState>,
    Json(payload): Json<TicketRequest>,
) -> Result<Json<Value>, AppError> {
    let user_id = require_user(payload.user_id)?;
    let provider = require_provider(payload.provider.as_deref())?;
    let ticket_id = ticket_ref(payload.ticket_id.as_ref())?;
    let task = snapshot(&state, payload.task_id)?;
    let config = state.integrations.get_enabled(user_id, provider)?;

    let ticket = state
        .integrations
        .connect(&config)
        .sync_task_with_ticket(&task, &ticket_id)
        .await?;
    state.integrations.mark_synced(user_id, provider, Utc::now());

    tracing::info!(task_id = %task.id, %provider, %ticket_id, "ticket synced");
    Ok(Json(json!({ "success": true, "ticket": ticket })))
}

// POST /api/integrations/import-ticket
pub async fn import_ticket(
    State(state): State<SharedState>,
    Json(payload): Json<TicketRequest>,
) -> Result<Json<ImportResponse>, AppError> {
    let user_id = require_user(payload.user_id)?;
    let provider = require_provider(payload.provider.as_deref())?;
    let ticket_id = ticket_ref(payload.ticket_id.as_ref())?;
    let config = state.integrations.get(user_id, provider)?;

    let imported = state
        .integrations
        .connect(&config)
        .import_ticket_as_task(&ticket_id)
        .await?;

    let created = if payload.create {
        let title = if imported.title.trim().is_empty() {
            format!("{provider} ticket {ticket_id}")
        } else {
            imported.title.clone()
        };
        let input = NewTask {
            title: Some(title),
            status: Some(imported.status),
            owner_id: Some(user_id),
            ..NewTask::default()
        };
        Some(lifecycle::create_task(&state, input, Utc::now())?)
    } else {
        None
    };

    Ok(Json(ImportResponse {
        success: true,
        task: imported,
        created,
    }))
}

// DELETE /api/integrations/:provider?userId=
pub async fn remove(
    State(state): State<SharedState>,
    Path(provider): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Value>, AppError> {
    let user_id = require_user(query.user_id)?;
    let provider = require_provider(Some(&provider))?;
    if !state.integrations.remove(user_id, provider) {
        return Err(AppError::NotFound("Integration"));
    }
    tracing::info!(%user_id, %provider, "integration removed");
    Ok(Json(json!({
        "success": true,
        "message": format!("{provider} integration removed"),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::test_server::serve;
    use crate::models::{TaskStatus, User};
    use crate::state::test_support::Harness;
    use axum::{
        routing::{get, post},
        Router,
    };

    fn add_user(h: &Harness) -> Uuid {
        let mut world = h.state.write();
        let id = world.insert_user(User::new("Ada", None, Utc::now())).unwrap().id;
        h.state.commit(&mut world).unwrap();
        id
    }

    fn configure_request(user_id: Uuid, provider: &str, api_url: &str) -> Json<ConfigureRequest> {
        Json(ConfigureRequest {
            user_id: Some(user_id),
            provider: Some(provider.into()),
            api_url: api_url.into(),
            api_key: "secret-key".into(),
            ..ConfigureRequest::default()
        })
    }

    #[tokio::test]
    async fn configure_list_and_remove() {
        let h = Harness::new();
        let user = Uuid::new_v4();

        let Json(body) = configure(State(h.state.clone()), configure_request(user, "Zammad", "https://help.example.com"))
            .await
            .unwrap();
        assert_eq!(body["config"]["provider"], "zammad");
        assert_eq!(body["config"]["enabled"], true);

        let Json(listed) = list(State(h.state.clone()), Query(UserQuery { user_id: Some(user) }))
            .await
            .unwrap();
        assert!(listed.contains_key(&Provider::Zammad));
        assert!(!serde_json::to_string(&listed).unwrap().contains("secret-key"));

        assert!(matches!(
            list(State(h.state.clone()), Query(UserQuery { user_id: None })).await,
            Err(AppError::Validation(_))
        ));

        remove(State(h.state.clone()), Path("zammad".into()), Query(UserQuery { user_id: Some(user) }))
            .await
            .unwrap();
        let err = remove(State(h.state.clone()), Path("zammad".into()), Query(UserQuery { user_id: Some(user) }))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound("Integration")));
    }

    #[tokio::test]
    async fn unknown_provider_is_a_client_error() {
        let h = Harness::new();
        let err = configure(State(h.state.clone()), configure_request(Uuid::new_v4(), "jira", "https://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn create_ticket_uses_the_real_task() {
        let h = Harness::new();
        let user = add_user(&h);
        let input = NewTask {
            title: Some("Replace router".into()),
            ..NewTask::default()
        };
        let task = lifecycle::create_task(&h.state, input, Utc::now()).unwrap();

        let router = Router::new().route(
            "/api/v1/tickets",
            post(|Json(body): Json<Value>| async move {
                Json(json!({ "id": 55, "number": "10055", "title": body["title"] }))
            }),
        );
        let base = serve(router).await;
        configure(State(h.state.clone()), configure_request(user, "zammad", &base))
            .await
            .unwrap();

        let request = TicketRequest {
            user_id: Some(user),
            provider: Some("zammad".into()),
            task_id: Some(task.task.id),
            ..TicketRequest::default()
        };
        let Json(body) = create_ticket(State(h.state.clone()), Json(request)).await.unwrap();
        assert_eq!(body["ticket"]["ticketId"], 55);
        assert_eq!(body["ticket"]["ticket"]["title"], "Replace router");
        assert!(h.state.integrations.get(user, Provider::Zammad).unwrap().last_sync.is_some());
    }

    #[tokio::test]
    async fn disabled_integration_refuses_tickets() {
        let h = Harness::new();
        let user = add_user(&h);
        let task = lifecycle::create_task(
            &h.state,
            NewTask { title: Some("x".into()), ..NewTask::default() },
            Utc::now(),
        )
        .unwrap();
        let mut request = configure_request(user, "freshdesk", "http://127.0.0.1:9");
        request.0.enabled = Some(false);
        configure(State(h.state.clone()), request).await.unwrap();

        let err = create_ticket(
            State(h.state.clone()),
            Json(TicketRequest {
                user_id: Some(user),
                provider: Some("freshdesk".into()),
                task_id: Some(task.task.id),
                ..TicketRequest::default()
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn import_can_create_the_task() {
        let h = Harness::new();
        let user = add_user(&h);
        let router = Router::new().route(
            "/api/v2/tickets/:id",
            get(|| async {
                Json(json!({ "id": 8, "subject": "Refund request", "description_text": "order 991", "status": 3 }))
            }),
        );
        let base = serve(router).await;
        configure(State(h.state.clone()), configure_request(user, "freshdesk", &base))
            .await
            .unwrap();

        let Json(response) = import_ticket(
            State(h.state.clone()),
            Json(TicketRequest {
                user_id: Some(user),
                provider: Some("freshdesk".into()),
                ticket_id: Some(json!(8)),
                create: true,
                ..TicketRequest::default()
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.task.description, "order 991");
        let created = response.created.unwrap();
        assert_eq!(created.task.title, "Refund request");
        assert_eq!(created.task.status, TaskStatus::Doing);
        assert_eq!(created.task.owner_id, Some(user));
        assert_eq!(h.state.read().tasks.len(), 1);
    }

    #[test]
    fn ticket_ids_accept_numbers_and_strings() {
        assert_eq!(ticket_ref(Some(&json!(42))).unwrap(), "42");
        assert_eq!(ticket_ref(Some(&json!(" 42 "))).unwrap(), "42");
        assert!(ticket_ref(Some(&json!(""))).is_err());
        assert!(ticket_ref(None).is_err());
    }
}
