mod api;
mod audit;
mod auth;
mod calendar;
mod error;
mod hub;
mod integrations;
mod lifecycle;
mod models;
mod notify;
mod persist;
mod public;
mod recurrence;
mod settings;
mod state;
mod storage;
mod world;
mod ws;

use hub::Hub;
use integrations::IntegrationRegistry;
use notify::{LogMailer, Mailer, Notifier};
use settings::Settings;
use state::{AppState, SharedState};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use storage::{FileStore, LocalFileStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "server stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::load()?;

    // ── Boot the World ─────────────────────────────────────────
    let save_file = persist::SaveFile::open(&settings.save_file)?;
    let mut world = save_file.load_world()?;

    let stale = world.reset_presence();
    if stale > 0 {
        world.flush_with(|world, changes| save_file.flush(world, changes))?;
        tracing::info!(users = stale, "cleared presence left over from last run");
    }

    if save_file.ensure_default_user(&mut world)? {
        tracing::info!("created default admin user (admin / admin)");
    }

    tracing::info!(
        tasks = world.tasks.len(),
        users = world.users.len(),
        comments = world.comments.len(),
        attachments = world.attachments.len(),
        "world loaded"
    );

    // ── Outbound services ──────────────────────────────────────
    let client = reqwest::Client::new();

    let mailer = notify::mailer_from_settings(&settings.email, client.clone()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "mail provider unavailable, logging mail instead");
        Arc::new(LogMailer) as Arc<dyn Mailer>
    });
    let notifier = Notifier::new(mailer, settings.email.from.clone(), settings.client_url.clone());

    let files = storage::store_from_settings(&settings.storage, client.clone()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "file storage unavailable, using local directory");
        Arc::new(LocalFileStore::new(&settings.storage.local_dir)) as Arc<dyn FileStore>
    });

    // ── Shared state ───────────────────────────────────────────
    let addr = settings.socket_addr();

    let state: SharedState = Arc::new(AppState {
        world: std::sync::RwLock::new(world),
        save_file,
        hub: Hub::new(),
        notifier,
        files,
        integrations: IntegrationRegistry::new(client),
        settings,
    });

    let scheduler = recurrence::spawn_scheduler(state.clone());
    let app = api::app(state.clone());

    // ── Start ──────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, dev_mode = state.settings.dev_mode, "server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── Stop ───────────────────────────────────────────────────
    scheduler.abort();
    let cleared = state.shut_down()?;
    tracing::info!(users = cleared, "server stopped cleanly");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested, draining connections");
}
