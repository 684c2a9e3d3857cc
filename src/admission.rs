//! Admission controller
//!
//! Decides whether a create-session request may start for its
//! `(account, shop)` pair. The single-active-session invariant lives in the
//! Store's partial unique index; this component only decides and retries,
//! so two broker instances racing on a pair resolve without any in-process
//! lock.
//!
//! Rules: bots never preempt; a human request preempts a bot session;
//! MANUAL_URGENT additionally preempts any non-urgent human session; equal
//! priority conflicts. A TRANSFERRED session is already human-handled and is
//! never preempted.

use crate::config::BrokerConfig;
use crate::db::{Database, DbError, DbResult, NewSendTask, NewSession, Session};
use crate::queue::TaskQueue;
use crate::session::{SessionState, TaskType};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// How often a losing insert is retried before answering CONFLICT.
const ADMIT_ATTEMPTS: u32 = 2;

/// A create-session request, validated at the API boundary.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub account_id: String,
    pub shop_id: String,
    pub shop_name: String,
    pub platform: String,
    pub task_type: TaskType,
    pub external_task_id: String,
    pub send_content: String,
    pub max_inactive_minutes: Option<i64>,
}

/// Outcome of an admission decision.
#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    Accepted {
        session: Session,
        /// Queue key of the send task; absent for human sessions.
        task_id: Option<i64>,
        /// Set when acceptance preempted a running session.
        preempted_session_id: Option<String>,
    },
    Conflict {
        conflict_session_id: String,
        conflict_task_type: TaskType,
    },
    /// Idempotent replay of a known `external_task_id`.
    Duplicate { session: Session },
}

pub struct AdmissionController {
    db: Database,
    queue: Arc<dyn TaskQueue>,
    config: Arc<BrokerConfig>,
}

impl AdmissionController {
    pub fn new(db: Database, queue: Arc<dyn TaskQueue>, config: Arc<BrokerConfig>) -> Self {
        Self { db, queue, config }
    }

    /// Evaluate a create-session request.
    ///
    /// The decision and the session insert are one atomic unit: the insert
    /// itself re-checks the slot via the store's unique index, and a lost
    /// race re-reads and re-decides.
    pub fn admit(
        &self,
        req: &AdmissionRequest,
        now: DateTime<Utc>,
    ) -> DbResult<AdmissionDecision> {
        if let Some(session) = self.db.find_session_by_external_id(&req.external_task_id)? {
            tracing::info!(
                session_id = %session.id,
                external_task_id = %req.external_task_id,
                "Admission replay, returning original session"
            );
            return Ok(AdmissionDecision::Duplicate { session });
        }

        for _ in 0..ADMIT_ATTEMPTS {
            match self.try_admit(req, now) {
                Ok(decision) => return Ok(decision),
                // Lost the slot race: re-read and re-decide.
                Err(DbError::SlotTaken) => {}
                // Concurrent replay of the same external id.
                Err(DbError::DuplicateExternalTask(_)) => {
                    if let Some(session) =
                        self.db.find_session_by_external_id(&req.external_task_id)?
                    {
                        return Ok(AdmissionDecision::Duplicate { session });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Retries exhausted; whatever holds the slot now wins.
        match self.db.find_slot_session(&req.account_id, &req.shop_id)? {
            Some(current) => Ok(AdmissionDecision::Conflict {
                conflict_session_id: current.id,
                conflict_task_type: current.task_type,
            }),
            None => Err(DbError::SlotTaken),
        }
    }

    fn try_admit(
        &self,
        req: &AdmissionRequest,
        now: DateTime<Utc>,
    ) -> DbResult<AdmissionDecision> {
        let current = self
            .db
            .find_slot_session(&req.account_id, &req.shop_id)?;

        let Some(current) = current else {
            let (session, task) = self.build_session(req, now);
            let task_id = self
                .db
                .insert_session_with_task(&session, task.as_ref(), false)?;
            return self.accepted(&session.id, task_id, None);
        };

        if !preempts(req.task_type, &current) {
            tracing::info!(
                conflict_session_id = %current.id,
                task_type = %req.task_type,
                account_id = %req.account_id,
                shop_id = %req.shop_id,
                "Admission rejected, slot held"
            );
            return Ok(AdmissionDecision::Conflict {
                conflict_session_id: current.id,
                conflict_task_type: current.task_type,
            });
        }

        let (session, task) = self.build_session(req, now);
        let reason = format!("preempted_by:{}", req.task_type);
        let task_id =
            self.db
                .pause_and_insert_session(&current.id, &reason, &session, task.as_ref())?;
        tracing::info!(
            session_id = %session.id,
            preempted = %current.id,
            task_type = %req.task_type,
            "Admission preempted running session"
        );
        self.accepted(&session.id, task_id, Some(current.id.clone()))
    }

    fn accepted(
        &self,
        session_id: &str,
        task_id: Option<i64>,
        preempted_session_id: Option<String>,
    ) -> DbResult<AdmissionDecision> {
        let session = self.db.get_session(session_id)?;
        if let Some(task_id) = task_id {
            self.queue.push(task_id);
        }
        tracing::info!(
            session_id = %session.id,
            task_id = ?task_id,
            priority = session.priority,
            "Session admitted"
        );
        Ok(AdmissionDecision::Accepted {
            session,
            task_id,
            preempted_session_id,
        })
    }

    fn build_session(
        &self,
        req: &AdmissionRequest,
        now: DateTime<Utc>,
    ) -> (NewSession, Option<NewSendTask>) {
        let max_inactive = req
            .max_inactive_minutes
            .unwrap_or_else(|| {
                self.config
                    .default_max_inactive_minutes(req.task_type.is_bot())
            });
        let session = NewSession {
            id: Uuid::new_v4().to_string(),
            account_id: req.account_id.clone(),
            shop_id: req.shop_id.clone(),
            shop_name: req.shop_name.clone(),
            platform: req.platform.clone(),
            task_type: req.task_type,
            state: SessionState::Pending,
            max_inactive_minutes: max_inactive,
            external_task_id: Some(req.external_task_id.clone()),
            transfer_reason: None,
            created_at: now,
        };
        let task = req.task_type.is_bot().then(|| NewSendTask {
            external_task_id: req.external_task_id.clone(),
            send_content: req.send_content.clone(),
            send_url: self.config.send_url(&req.platform, &req.shop_id),
            shop_name: req.shop_name.clone(),
        });
        (session, task)
    }
}

/// Whether a new request of `new_type` preempts the current slot holder.
fn preempts(new_type: TaskType, current: &Session) -> bool {
    if new_type.is_bot() {
        return false;
    }
    // Already in human hands; nothing to take over.
    if current.state == SessionState::Transferred {
        return false;
    }
    if current.task_type.is_bot() {
        return true;
    }
    new_type == TaskType::ManualUrgent && current.task_type != TaskType::ManualUrgent
}
