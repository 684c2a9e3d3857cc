//! Parley - chat-session lifecycle and task-dispatch broker
//!
//! Brokers chat sessions between upstream bot task producers and the RPA
//! workers that drive the chat platform: admission with priority preemption,
//! the session state machine, the send-task queue, and inbound message-batch
//! ingestion.

mod admission;
mod api;
mod config;
mod db;
mod dispatch;
mod ingest;
mod manager;
mod notify;
mod queue;
mod session;

use admission::AdmissionController;
use api::{create_router, AppState};
use config::BrokerConfig;
use db::Database;
use dispatch::TaskDispatcher;
use ingest::{HeuristicClassifier, MessageIngestor};
use manager::SessionManager;
use notify::{HttpNotifier, NotificationDispatcher, Notifier};
use queue::{InMemoryQueue, TaskQueue};

use chrono::Utc;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(BrokerConfig::from_env());

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryQueue::new());
    let manager = Arc::new(SessionManager::new(db.clone(), config.clone()));
    let admission = Arc::new(AdmissionController::new(
        db.clone(),
        queue.clone(),
        config.clone(),
    ));
    let dispatcher = Arc::new(TaskDispatcher::new(
        db.clone(),
        queue.clone(),
        manager.clone(),
        config.clone(),
    ));
    let ingestor = Arc::new(MessageIngestor::new(
        db.clone(),
        manager.clone(),
        config.clone(),
        Arc::new(HeuristicClassifier),
    ));
    let notifier: Option<Arc<dyn Notifier>> = config
        .notifier_endpoint
        .clone()
        .map(|endpoint| Arc::new(HttpNotifier::new(endpoint)) as Arc<dyn Notifier>);
    let notifications = Arc::new(NotificationDispatcher::new(db.clone(), notifier));

    // The queue is advisory and died with the last process; the store is
    // authoritative, so restore every pending task id.
    let restored = dispatcher.restore_queue(Utc::now())?;
    tracing::info!(restored, "Queue restored from store");

    spawn_reaper(manager.clone(), config.reap_interval_seconds);
    spawn_reconciler(dispatcher.clone(), config.reconcile_interval_seconds);
    spawn_notifier(notifications, config.reconcile_interval_seconds);

    let state = AppState {
        admission,
        manager,
        dispatcher,
        ingestor,
        db,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Parley broker listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic session timeout sweep; each pass is idempotent.
fn spawn_reaper(manager: Arc<SessionManager>, interval_seconds: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
        loop {
            interval.tick().await;
            match manager.reap(Utc::now()) {
                Ok(reaped) if !reaped.is_empty() => {
                    tracing::info!(count = reaped.len(), "Reaper expired sessions");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Reaper pass failed"),
            }
        }
    });
}

/// Periodic requeue of send tasks stuck PENDING past the grace window.
fn spawn_reconciler(dispatcher: Arc<TaskDispatcher>, interval_seconds: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
        loop {
            interval.tick().await;
            if let Err(e) = dispatcher.reconcile(Utc::now()) {
                tracing::warn!(error = %e, "Reconciliation pass failed");
            }
        }
    });
}

/// Periodic outbox drain toward the notification endpoint.
fn spawn_notifier(notifications: Arc<NotificationDispatcher>, interval_seconds: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
        loop {
            interval.tick().await;
            if let Err(e) = notifications.drain(Utc::now()).await {
                tracing::warn!(error = %e, "Notification drain failed");
            }
        }
    });
}
