//! Server settings.
//!
//! Loaded once at boot from `settings.json` (copied next to the binary by
//! build.rs). Secrets can be supplied through the environment instead of the
//! file so they never have to be committed.

use serde::Deserialize;
use std::{env, fs, io, path::Path};
use thiserror::Error;

const SETTINGS_FILENAME: &str = "settings.json";
const SETTINGS_ENV: &str = "TASKBOARD_SETTINGS";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_address: String,
    pub port: u16,
    pub save_file: String,
    pub static_dir: String,
    /// Base URL of the web client, used for links in mail and calendars.
    pub client_url: String,
    /// Expose internal error detail in HTTP responses and skip the `/api`
    /// rate limit.
    pub dev_mode: bool,
    /// Requests one client may make to `/api` per window, outside dev mode.
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_ms: u64,
    pub recurrence_interval_secs: u64,
    pub recurrence_horizon_days: i64,
    pub max_upload_bytes: usize,
    pub email: EmailSettings,
    pub storage: StorageSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_address: "0.0.0.0".into(),
            port: 3001,
            save_file: "tasks.redb".into(),
            static_dir: "public".into(),
            client_url: "http://localhost:5173".into(),
            dev_mode: false,
            rate_limit_max_requests: 100,
            rate_limit_window_ms: 15 * 60 * 1000,
            recurrence_interval_secs: 3600,
            recurrence_horizon_days: 30,
            max_upload_bytes: 10 * 1024 * 1024,
            email: EmailSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    /// `dev`, `postmark` or `sendgrid`.
    pub provider: String,
    pub from: String,
    pub postmark_token: Option<String>,
    pub sendgrid_api_key: Option<String>,
}

impl Default for EmailSettings {
    fn default() -> Self {
        EmailSettings {
            provider: "dev".into(),
            from: "noreply@localhost".into(),
            postmark_token: None,
            sendgrid_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// `local` or `cloudinary`.
    pub provider: String,
    pub local_dir: String,
    pub cloud_name: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub folder: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            provider: "local".into(),
            local_dir: "uploads".into(),
            cloud_name: None,
            api_key: None,
            api_secret: None,
            folder: "todo-attachments".into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("cannot parse settings file {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
    #[error("invalid value for {name}: {value}")]
    Env { name: &'static str, value: String },
}

impl Settings {
    /// Load settings from `$TASKBOARD_SETTINGS` or `./settings.json`, then
    /// apply environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Settings, SettingsError> {
        let path = env::var(SETTINGS_ENV).unwrap_or_else(|_| SETTINGS_FILENAME.to_string());
        let mut settings = if Path::new(&path).exists() {
            Settings::from_file(&path)?
        } else {
            tracing::info!(%path, "no settings file, using defaults");
            Settings::default()
        };
        settings.apply_env(|name| env::var(name).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &str) -> Result<Settings, SettingsError> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Overlay values from the environment. `lookup` is injected so tests
    /// don't have to touch the process environment.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), SettingsError> {
        if let Some(port) = lookup("PORT") {
            self.port = port.parse().map_err(|_| SettingsError::Env {
                name: "PORT",
                value: port.clone(),
            })?;
        }
        if let Some(max) = lookup("RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limit_max_requests = max.parse().map_err(|_| SettingsError::Env {
                name: "RATE_LIMIT_MAX_REQUESTS",
                value: max.clone(),
            })?;
        }
        if let Some(window) = lookup("RATE_LIMIT_WINDOW_MS") {
            self.rate_limit_window_ms = window.parse().map_err(|_| SettingsError::Env {
                name: "RATE_LIMIT_WINDOW_MS",
                value: window.clone(),
            })?;
        }
        if let Some(url) = lookup("CLIENT_URL") {
            self.client_url = url;
        }
        if let Some(provider) = lookup("EMAIL_PROVIDER") {
            self.email.provider = provider;
        }
        if let Some(from) = lookup("EMAIL_FROM") {
            self.email.from = from;
        }
        if let Some(token) = lookup("POSTMARK_API_TOKEN") {
            self.email.postmark_token = Some(token);
        }
        if let Some(key) = lookup("SENDGRID_API_KEY") {
            self.email.sendgrid_api_key = Some(key);
        }
        if let Some(name) = lookup("CLOUDINARY_CLOUD_NAME") {
            self.storage.provider = "cloudinary".into();
            self.storage.cloud_name = Some(name);
        }
        if let Some(key) = lookup("CLOUDINARY_API_KEY") {
            self.storage.api_key = Some(key);
        }
        if let Some(secret) = lookup("CLOUDINARY_API_SECRET") {
            self.storage.api_secret = Some(secret);
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
