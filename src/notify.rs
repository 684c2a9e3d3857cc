//! Notification delivery
//!
//! Side effects never run inside store transactions: mutations append
//! notify-flagged operation rows (the outbox), and this dispatcher delivers
//! them to the human-notification endpoint afterwards. Failures are
//! non-fatal; undelivered rows are retried on the next cycle.

use crate::db::{Database, DbResult, OperationRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// How many outbox rows one drain cycle picks up.
const DRAIN_BATCH: usize = 32;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification endpoint answered {status}")]
    Status { status: u16 },
}

/// External notification capability.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, event: &OperationRecord) -> Result<(), NotifyError>;
}

/// POSTs each event as JSON to the configured endpoint.
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(&self, event: &OperationRecord) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "session_id": event.session_id,
                "operation": event.operation,
                "detail": event.detail,
                "occurred_at": event.created_at,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Drains the outbox toward the configured notifier.
pub struct NotificationDispatcher {
    db: Database,
    notifier: Option<Arc<dyn Notifier>>,
}

impl NotificationDispatcher {
    pub fn new(db: Database, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self { db, notifier }
    }

    /// Deliver undelivered outbox rows in order. A failed delivery stops the
    /// cycle so ordering holds and the row retries next time. Returns how
    /// many rows were delivered.
    pub async fn drain(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let pending = self.db.undelivered_notifications(DRAIN_BATCH)?;
        let mut delivered = 0;

        for event in pending {
            match &self.notifier {
                Some(notifier) => match notifier.deliver(&event).await {
                    Ok(()) => {
                        self.db.mark_notification_delivered(event.id, now)?;
                        delivered += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            outbox_id = event.id,
                            session_id = %event.session_id,
                            error = %e,
                            "Notification delivery failed, will retry"
                        );
                        break;
                    }
                },
                None => {
                    tracing::info!(
                        outbox_id = event.id,
                        session_id = %event.session_id,
                        operation = %event.operation,
                        "No notifier endpoint configured, dropping notification"
                    );
                    self.db.mark_notification_delivered(event.id, now)?;
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }
}
