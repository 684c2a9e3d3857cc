//! HTTP API for the session broker

mod handlers;
mod types;

pub use handlers::create_router;
pub use types::Envelope;

use crate::admission::AdmissionController;
use crate::db::Database;
use crate::dispatch::TaskDispatcher;
use crate::ingest::MessageIngestor;
use crate::manager::SessionManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionController>,
    pub manager: Arc<SessionManager>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub ingestor: Arc<MessageIngestor>,
    pub db: Database,
}
