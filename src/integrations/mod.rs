//! External ticketing systems.
//!
//! Three helpdesks (Zammad, osTicket, Freshdesk) behind one capability
//! trait. Each adapter speaks its provider's REST dialect and maps task
//! priority/status to and from the provider's vocabulary. Failures carry the
//! provider's status code and body; nothing is retried.
//!
//! Configurations live in process memory only, keyed by (user, provider).
//! They are gone after a restart.

pub mod freshdesk;
pub mod osticket;
pub mod zammad;

use crate::models::{Priority, Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

// ── Providers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Zammad,
    #[serde(rename = "osticket")]
    OsTicket,
    Freshdesk,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Zammad => "zammad",
            Provider::OsTicket => "osticket",
            Provider::Freshdesk => "freshdesk",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = TicketingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "zammad" => Ok(Provider::Zammad),
            "osticket" => Ok(Provider::OsTicket),
            "freshdesk" => Ok(Provider::Freshdesk),
            _ => Err(TicketingError::UnsupportedProvider(s.to_string())),
        }
    }
}

// ── Configuration ──────────────────────────────────────────────

/// Provider-specific routing defaults. Each adapter reads the fields it
/// knows about and ignores the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomConfig {
    /// Zammad group for new tickets.
    pub default_group: Option<String>,
    /// Zammad customer for new tickets.
    pub default_customer: Option<String>,
    /// osTicket requester name.
    pub default_name: Option<String>,
    /// osTicket / Freshdesk requester email.
    pub default_email: Option<String>,
    /// osTicket help topic.
    pub topic_id: Option<Value>,
    /// Freshdesk ticket type.
    pub default_type: Option<String>,
    /// Task assignee id → Freshdesk agent id.
    pub user_mapping: HashMap<Uuid, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationConfig {
    pub provider: Provider,
    pub api_url: String,
    pub api_key: String,
    pub enabled: bool,
    pub custom: CustomConfig,
    pub last_sync: Option<DateTime<Utc>>,
}

/// What clients get to see of a configuration: never the key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationSummary {
    pub provider: Provider,
    pub api_url: String,
    pub enabled: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

impl IntegrationConfig {
    pub fn summary(&self) -> IntegrationSummary {
        IntegrationSummary {
            provider: self.provider,
            api_url: self.api_url.clone(),
            enabled: self.enabled,
            last_sync: self.last_sync,
        }
    }
}

// ── Exchange types ─────────────────────────────────────────────

/// The task fields adapters need.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assignee_id: Option<Uuid>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        TaskSnapshot {
            id: task.id,
            title: task.title.clone(),
            description: task.public_summary.clone(),
            status: task.status,
            priority: task.priority,
            assignee_id: task.assignee_id,
        }
    }
}

/// A ticket normalized into a task draft.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedTask {
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub external_id: Value,
    pub external_number: Option<Value>,
    pub provider: Provider,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketOutcome {
    pub ticket_id: Option<Value>,
    pub ticket_number: Option<Value>,
    pub message: Option<String>,
    pub ticket: Value,
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TicketingError {
    #[error("{provider} answered {status}: {body}")]
    Upstream {
        provider: Provider,
        status: u16,
        body: String,
    },
    #[error("{provider} unreachable: {message}")]
    Transport { provider: Provider, message: String },
    #[error("{provider} sent an unreadable response: {message}")]
    Decode { provider: Provider, message: String },
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("invalid integration settings: {0}")]
    InvalidConfig(String),
    #[error("{0} integration not configured")]
    NotConfigured(Provider),
    #[error("{0} integration is disabled")]
    Disabled(Provider),
}

// ── Capability ─────────────────────────────────────────────────

#[async_trait]
pub trait TicketingSystem: Send + Sync {
    fn provider(&self) -> Provider;

    async fn test_connection(&self) -> Result<Value, TicketingError>;

    async fn create_ticket_from_task(&self, task: &TaskSnapshot) -> Result<TicketOutcome, TicketingError>;

    async fn sync_task_with_ticket(
        &self,
        task: &TaskSnapshot,
        ticket_id: &str,
    ) -> Result<TicketOutcome, TicketingError>;

    async fn import_ticket_as_task(&self, ticket_id: &str) -> Result<ImportedTask, TicketingError>;

    async fn get_ticket_details(&self, ticket_id: &str) -> Result<Value, TicketingError>;

    async fn update_ticket(&self, ticket_id: &str, updates: &Value) -> Result<TicketOutcome, TicketingError>;

    async fn add_comment_to_ticket(&self, ticket_id: &str, comment: &str) -> Result<TicketOutcome, TicketingError>;
}

/// Numeric priority shared by all three helpdesks.
pub fn map_priority(priority: Priority) -> u8 {
    match priority {
        Priority::Low => 1,
        Priority::Medium => 2,
        Priority::High | Priority::Urgent => 3,
    }
}

/// The adapter for a configuration.
pub fn connect(config: &IntegrationConfig, client: reqwest::Client) -> Box<dyn TicketingSystem> {
    match config.provider {
        Provider::Zammad => Box::new(zammad::Zammad::new(config, client)),
        Provider::OsTicket => Box::new(osticket::OsTicket::new(config, client)),
        Provider::Freshdesk => Box::new(freshdesk::Freshdesk::new(config, client)),
    }
}

// ── HTTP plumbing ──────────────────────────────────────────────

pub(crate) enum Auth {
    Bearer(String),
    ApiKey(String),
    /// API key as user, "X" as password.
    BasicKey(String),
}

/// One provider base URL plus its credentials.
pub(crate) struct Endpoint {
    client: reqwest::Client,
    base: String,
    provider: Provider,
    auth: Auth,
}

impl Endpoint {
    pub(crate) fn new(client: reqwest::Client, base: &str, provider: Provider, auth: Auth) -> Self {
        Endpoint {
            client,
            base: base.trim_end_matches('/').to_string(),
            provider,
            auth,
        }
    }

    pub(crate) fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        match &self.auth {
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::ApiKey(key) => builder.header("X-API-Key", key),
            Auth::BasicKey(key) => builder.basic_auth(key, Some("X")),
        }
    }

    /// Send and read the body. Non-success statuses become `Upstream`.
    /// A body that isn't JSON comes back as a JSON string.
    pub(crate) async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, TicketingError> {
        let response = request.send().await.map_err(|e| TicketingError::Transport {
            provider: self.provider,
            message: e.to_string(),
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| TicketingError::Decode {
            provider: self.provider,
            message: e.to_string(),
        })?;

        if !status.is_success() {
            tracing::warn!(provider = %self.provider, status = status.as_u16(), "ticketing request failed");
            return Err(TicketingError::Upstream {
                provider: self.provider,
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    pub(crate) async fn get(&self, path: &str) -> Result<Value, TicketingError> {
        self.send(self.request(reqwest::Method::GET, path)).await
    }

    pub(crate) async fn post(&self, path: &str, body: &Value) -> Result<Value, TicketingError> {
        self.send(self.request(reqwest::Method::POST, path).json(body)).await
    }

    pub(crate) async fn put(&self, path: &str, body: &Value) -> Result<Value, TicketingError> {
        self.send(self.request(reqwest::Method::PUT, path).json(body)).await
    }
}

// ── Registry ───────────────────────────────────────────────────

/// Per-user integration settings, in memory for the life of the process.
pub struct IntegrationRegistry {
    client: reqwest::Client,
    configs: RwLock<HashMap<(Uuid, Provider), IntegrationConfig>>,
}

impl IntegrationRegistry {
    pub fn new(client: reqwest::Client) -> Self {
        IntegrationRegistry {
            client,
            configs: RwLock::new(HashMap::new()),
        }
    }

    pub fn configure(&self, user: Uuid, config: IntegrationConfig) -> IntegrationSummary {
        let summary = config.summary();
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((user, config.provider), config);
        summary
    }

    pub fn list(&self, user: Uuid) -> BTreeMap<Provider, IntegrationSummary> {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((owner, _), _)| *owner == user)
            .map(|((_, provider), config)| (*provider, config.summary()))
            .collect()
    }

    pub fn get(&self, user: Uuid, provider: Provider) -> Result<IntegrationConfig, TicketingError> {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(user, provider))
            .cloned()
            .ok_or(TicketingError::NotConfigured(provider))
    }

    /// Like `get`, but a disabled configuration is an error.
    pub fn get_enabled(&self, user: Uuid, provider: Provider) -> Result<IntegrationConfig, TicketingError> {
        let config = self.get(user, provider)?;
        if !config.enabled {
            return Err(TicketingError::Disabled(provider));
        }
        Ok(config)
    }

    pub fn remove(&self, user: Uuid, provider: Provider) -> bool {
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(user, provider))
            .is_some()
    }

    pub fn mark_synced(&self, user: Uuid, provider: Provider, at: DateTime<Utc>) {
        if let Some(config) = self
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&(user, provider))
        {
            config.last_sync = Some(at);
        }
    }

    pub fn connect(&self, config: &IntegrationConfig) -> Box<dyn TicketingSystem> {
        connect(config, self.client.clone())
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_server {
    //! A throwaway HTTP server standing in for a helpdesk.

    use axum::Router;

    /// Serve `router` on an ephemeral local port and return its base URL.
    pub async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub fn config(provider: super::Provider, api_url: &str) -> super::IntegrationConfig {
        super::IntegrationConfig {
            provider,
            api_url: api_url.to_string(),
            api_key: "secret-key".into(),
            enabled: true,
            custom: super::CustomConfig::default(),
            last_sync: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names() {
        assert_eq!("Zammad".parse::<Provider>().unwrap(), Provider::Zammad);
        assert_eq!("osticket".parse::<Provider>().unwrap(), Provider::OsTicket);
        assert!(matches!(
            "jira".parse::<Provider>(),
            Err(TicketingError::UnsupportedProvider(_))
        ));
        assert_eq!(serde_json::to_string(&Provider::OsTicket).unwrap(), "\"osticket\"");
    }

    #[test]
    fn priority_vocabulary() {
        assert_eq!(map_priority(Priority::Low), 1);
        assert_eq!(map_priority(Priority::Medium), 2);
        assert_eq!(map_priority(Priority::High), 3);
        assert_eq!(map_priority(Priority::Urgent), 3);
    }

    #[test]
    fn registry_is_scoped_per_user_and_hides_keys() {
        let registry = IntegrationRegistry::new(reqwest::Client::new());
        let (ada, bob) = (Uuid::new_v4(), Uuid::new_v4());
        registry.configure(ada, test_server::config(Provider::Zammad, "https://help.example.com"));

        assert!(registry.list(bob).is_empty());
        let listed = registry.list(ada);
        assert_eq!(listed.len(), 1);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(json.contains("\"zammad\""));
        assert!(!json.contains("secret-key"));

        assert!(matches!(
            registry.get(bob, Provider::Zammad),
            Err(TicketingError::NotConfigured(Provider::Zammad))
        ));

        let now = Utc::now();
        registry.mark_synced(ada, Provider::Zammad, now);
        assert_eq!(registry.get(ada, Provider::Zammad).unwrap().last_sync, Some(now));

        assert!(registry.remove(ada, Provider::Zammad));
        assert!(!registry.remove(ada, Provider::Zammad));
    }

    #[test]
    fn disabled_config_is_refused() {
        let registry = IntegrationRegistry::new(reqwest::Client::new());
        let user = Uuid::new_v4();
        let mut config = test_server::config(Provider::Freshdesk, "https://x.freshdesk.com");
        config.enabled = false;
        registry.configure(user, config);

        assert!(registry.get(user, Provider::Freshdesk).is_ok());
        assert!(matches!(
            registry.get_enabled(user, Provider::Freshdesk),
            Err(TicketingError::Disabled(Provider::Freshdesk))
        ));
    }
}
