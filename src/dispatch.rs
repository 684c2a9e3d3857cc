//! Task dispatcher
//!
//! Couples the durable send-task record with the FIFO queue. Hand-off is
//! at-most-once: popping consumes the queue entry, and a worker that crashes
//! before fetching the payload is covered by the reconciliation scan, which
//! re-pushes ids still PENDING past the grace window.

use crate::config::BrokerConfig;
use crate::db::{Database, DbResult};
use crate::manager::SessionManager;
use crate::queue::TaskQueue;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Payload a worker needs to perform one send.
#[derive(Debug, Clone, Serialize)]
pub struct SendInfo {
    pub send_content: String,
    pub send_url: String,
    pub shop_name: String,
}

pub struct TaskDispatcher {
    db: Database,
    queue: Arc<dyn TaskQueue>,
    manager: Arc<SessionManager>,
    config: Arc<BrokerConfig>,
}

impl TaskDispatcher {
    pub fn new(
        db: Database,
        queue: Arc<dyn TaskQueue>,
        manager: Arc<SessionManager>,
        config: Arc<BrokerConfig>,
    ) -> Self {
        Self {
            db,
            queue,
            manager,
            config,
        }
    }

    /// Non-blocking pop of the next task id; `None` means the worker retries
    /// on its own schedule.
    pub fn next_task_id(&self) -> Option<i64> {
        self.queue.pop()
    }

    /// Fetch the send payload, flipping PENDING -> SENT on the first read.
    /// Repeat reads return the same payload without flipping again.
    pub fn get_send_info(&self, task_id: i64, now: DateTime<Utc>) -> DbResult<SendInfo> {
        let (task, flipped) = self.db.mark_task_sent(task_id, now)?;
        if flipped {
            tracing::info!(task_id, session_id = %task.session_id, "Task handed to worker");
        }
        Ok(SendInfo {
            send_content: task.send_content,
            send_url: task.send_url,
            shop_name: task.shop_name,
        })
    }

    /// Worker send report; delegates to the manager for the first-send
    /// coupling.
    pub fn report(
        &self,
        task_id: i64,
        success: bool,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<(crate::db::SendTask, crate::db::Session)> {
        self.manager.report_task(task_id, success, error_message, now)
    }

    /// Explicit FAILED -> PENDING retry; the id goes back on the queue.
    pub fn retry(&self, task_id: i64, now: DateTime<Utc>) -> DbResult<bool> {
        let flipped = self.db.retry_task(task_id, now)?;
        if flipped {
            self.queue.push(task_id);
            tracing::info!(task_id, "Failed task requeued for retry");
        }
        Ok(flipped)
    }

    /// Re-push ids whose status is still PENDING past the grace window.
    /// Safe against double-push (the queue is idempotent) and against queue
    /// loss (the Store is authoritative). Returns how many were pushed.
    pub fn reconcile(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let cutoff = now - Duration::seconds(self.config.pending_grace_seconds);
        self.push_pending_since(cutoff)
    }

    /// Startup pass: the in-process queue is empty after a restart, so every
    /// PENDING task goes back on regardless of age.
    pub fn restore_queue(&self, now: DateTime<Utc>) -> DbResult<usize> {
        self.push_pending_since(now)
    }

    fn push_pending_since(&self, cutoff: DateTime<Utc>) -> DbResult<usize> {
        let stale = self.db.stale_pending_task_ids(cutoff)?;
        let count = stale.len();
        for task_id in stale {
            self.queue.push(task_id);
        }
        if count > 0 {
            tracing::info!(count, "Requeued pending tasks from the store");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbError, NewSendTask, NewSession};
    use crate::queue::InMemoryQueue;
    use crate::session::{SessionState, TaskStatus, TaskType};

    fn dispatcher() -> (TaskDispatcher, Database, Arc<InMemoryQueue>) {
        let db = Database::open_in_memory().unwrap();
        let queue = Arc::new(InMemoryQueue::new());
        let config = Arc::new(BrokerConfig::default());
        let manager = Arc::new(SessionManager::new(db.clone(), config.clone()));
        (
            TaskDispatcher::new(db.clone(), queue.clone(), manager, config),
            db,
            queue,
        )
    }

    fn seed_task(db: &Database, queue: &InMemoryQueue, created_at: DateTime<Utc>) -> i64 {
        let task_id = db
            .insert_session_with_task(
                &NewSession {
                    id: "s-1".to_string(),
                    account_id: "acct".to_string(),
                    shop_id: "shop".to_string(),
                    shop_name: "Shop".to_string(),
                    platform: "taobao".to_string(),
                    task_type: TaskType::AutoBargain,
                    state: SessionState::Pending,
                    max_inactive_minutes: 60,
                    external_task_id: Some("ext-1".to_string()),
                    transfer_reason: None,
                    created_at,
                },
                Some(&NewSendTask {
                    external_task_id: "ext-1".to_string(),
                    send_content: "您好".to_string(),
                    send_url: "https://chat.example/shop".to_string(),
                    shop_name: "Shop".to_string(),
                }),
                false,
            )
            .unwrap()
            .unwrap();
        queue.push(task_id);
        task_id
    }

    #[test]
    fn pop_then_fetch_flips_exactly_once() {
        let (dsp, db, queue) = dispatcher();
        let task_id = seed_task(&db, &queue, Utc::now());

        assert_eq!(dsp.next_task_id(), Some(task_id));
        assert_eq!(dsp.next_task_id(), None);

        let info = dsp.get_send_info(task_id, Utc::now()).unwrap();
        assert_eq!(info.send_content, "您好");
        assert_eq!(db.get_task(task_id).unwrap().status, TaskStatus::Sent);

        // A second read sees the same payload; status untouched.
        let again = dsp.get_send_info(task_id, Utc::now()).unwrap();
        assert_eq!(again.send_content, "您好");
        assert_eq!(db.get_task(task_id).unwrap().status, TaskStatus::Sent);
    }

    #[test]
    fn missing_task_is_not_found() {
        let (dsp, _db, _q) = dispatcher();
        let err = dsp.get_send_info(999, Utc::now()).unwrap_err();
        assert!(matches!(err, DbError::TaskNotFound(999)));
    }

    #[test]
    fn reconcile_requeues_tasks_stuck_pending() {
        let (dsp, db, queue) = dispatcher();
        let created = Utc::now() - Duration::seconds(300);
        let task_id = seed_task(&db, &queue, created);

        // Worker popped and crashed before fetching the payload.
        assert_eq!(queue.pop(), Some(task_id));
        assert!(queue.is_empty());

        // Inside the grace window nothing happens.
        assert_eq!(dsp.reconcile(created + Duration::seconds(10)).unwrap(), 0);

        // Past the grace window the id is restored.
        assert_eq!(dsp.reconcile(Utc::now()).unwrap(), 1);
        assert_eq!(queue.pop(), Some(task_id));

        // A SENT task is never requeued.
        dsp.get_send_info(task_id, Utc::now()).unwrap();
        assert_eq!(dsp.reconcile(Utc::now() + Duration::hours(1)).unwrap(), 0);
    }

    #[test]
    fn retry_flips_failed_and_requeues() {
        let (dsp, db, queue) = dispatcher();
        let task_id = seed_task(&db, &queue, Utc::now());
        queue.pop();
        dsp.get_send_info(task_id, Utc::now()).unwrap();
        dsp.report(task_id, false, Some("send failed"), Utc::now()).unwrap();
        assert_eq!(db.get_task(task_id).unwrap().status, TaskStatus::Failed);

        assert!(dsp.retry(task_id, Utc::now()).unwrap());
        assert_eq!(db.get_task(task_id).unwrap().status, TaskStatus::Pending);
        assert_eq!(queue.pop(), Some(task_id));

        // Retry of a non-failed task is a no-op.
        assert!(!dsp.retry(task_id, Utc::now()).unwrap());
    }
}
