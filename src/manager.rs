//! Session manager
//!
//! Sole writer of session state and task status. Components request
//! transitions here; the manager drives the pure state machine through the
//! Store's transactional primitives and handles the follow-on effects
//! (paused-session release, reaping).

use crate::config::BrokerConfig;
use crate::db::{CompletionOutcome, Database, DbResult, NewSession, Session};
use crate::session::{SessionState, TaskType};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub struct SessionManager {
    db: Database,
    config: Arc<BrokerConfig>,
}

impl SessionManager {
    pub fn new(db: Database, config: Arc<BrokerConfig>) -> Self {
        Self { db, config }
    }

    pub fn get(&self, session_id: &str) -> DbResult<Session> {
        self.db.get_session(session_id)
    }

    /// Complete a session. Task completion and the state transition are one
    /// transaction (a completed first send activates a PENDING session on
    /// the way out; a failed one leaves it PENDING for retry).
    pub fn complete(
        &self,
        session_id: &str,
        success: bool,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<CompletionOutcome> {
        let outcome = self
            .db
            .complete_session(session_id, success, error_message, now)?;
        tracing::info!(
            session_id = %session_id,
            success,
            state = %outcome.session.state,
            "Session completion processed"
        );
        if outcome.session.state.is_terminal() {
            self.release_paused_sibling(&outcome.session, now)?;
        }
        Ok(outcome)
    }

    /// A worker's send report: flips the SENT task and, on the first
    /// successful send, activates the PENDING session in the same
    /// transaction.
    pub fn report_task(
        &self,
        task_id: i64,
        success: bool,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<(crate::db::SendTask, Session)> {
        let (task, session) = self
            .db
            .report_task_result(task_id, success, error_message, now)?;
        tracing::info!(
            task_id,
            session_id = %session.id,
            success,
            state = %session.state,
            "Send report processed"
        );
        Ok((task, session))
    }

    /// Explicit or detected human takeover: ACTIVE -> TRANSFERRED, with a
    /// transfer record and a notification.
    pub fn transfer(
        &self,
        session_id: &str,
        reason: &str,
        urgency: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Session> {
        let session = self.db.transfer_session(session_id, reason, urgency, now)?;
        tracing::info!(session_id = %session_id, reason, urgency, "Session transferred");
        Ok(session)
    }

    /// Cancel a PENDING or PAUSED session.
    pub fn cancel(&self, session_id: &str, now: DateTime<Utc>) -> DbResult<Session> {
        let session = self.db.cancel_session(session_id, now)?;
        tracing::info!(session_id = %session_id, "Session cancelled");
        self.release_paused_sibling(&session, now)?;
        Ok(session)
    }

    /// Advance `last_activity_at` monotonically.
    pub fn touch(&self, session_id: &str, at: DateTime<Utc>) -> DbResult<()> {
        self.db.touch_session(session_id, at)
    }

    /// Put a paused session back into the active slot. Returns false when
    /// the slot is still held.
    pub fn release(&self, session_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let released = self.db.release_session(session_id, now)?;
        if released {
            tracing::info!(session_id = %session_id, "Paused session released");
        }
        Ok(released)
    }

    /// Open a session for observed human activity that bypassed the bot
    /// pipeline (ingest found no current session, or the silence gap
    /// elapsed). Born TRANSFERRED; a notification goes out.
    pub fn open_observed_session(
        &self,
        account_id: &str,
        shop_name: &str,
        platform: &str,
        max_inactive_minutes: Option<i64>,
        now: DateTime<Utc>,
    ) -> DbResult<Session> {
        let session = NewSession {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            // Batches carry the display name only; it stands in for the id
            // until an admission for the pair provides a real one.
            shop_id: shop_name.to_string(),
            shop_name: shop_name.to_string(),
            platform: platform.to_string(),
            task_type: TaskType::ManualCustomerService,
            state: SessionState::Transferred,
            max_inactive_minutes: max_inactive_minutes
                .unwrap_or(self.config.human_max_inactive_minutes),
            external_task_id: None,
            transfer_reason: Some("observed_human_activity".to_string()),
            created_at: now,
        };
        self.db.insert_session_with_task(&session, None, true)?;
        tracing::info!(
            session_id = %session.id,
            account_id,
            shop_name,
            "Opened session for observed human activity"
        );
        self.db.get_session(&session.id)
    }

    /// Expire overdue sessions in one idempotent batch. Two clocks apply:
    /// bot sessions stuck PENDING past the activation grace, and any
    /// non-terminal session silent past its inactivity budget.
    pub fn reap(&self, now: DateTime<Utc>) -> DbResult<Vec<String>> {
        let grace = Duration::seconds(self.config.pending_grace_seconds);
        let mut reaped = Vec::new();

        for session in self.db.list_non_terminal_sessions()? {
            let stuck_pending = session.state == SessionState::Pending
                && session.task_type.is_bot()
                && now - session.created_at > grace;
            let inactive =
                now - session.last_activity_at > Duration::minutes(session.max_inactive_minutes);
            if !(stuck_pending || inactive) {
                continue;
            }
            if self.db.expire_session(&session.id, now)? {
                tracing::warn!(
                    session_id = %session.id,
                    state = %session.state,
                    stuck_pending,
                    "Session reaped"
                );
                self.release_paused_sibling(&session, now)?;
                reaped.push(session.id);
            }
        }
        Ok(reaped)
    }

    /// After a slot holder terminates, the most recently paused session for
    /// the pair gets the slot back. A lost race leaves it paused for the
    /// next terminal event or the reaper.
    fn release_paused_sibling(&self, terminated: &Session, now: DateTime<Utc>) -> DbResult<()> {
        if let Some(paused) = self
            .db
            .latest_paused_session(&terminated.account_id, &terminated.shop_id)?
        {
            self.release(&paused.id, now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewSendTask, NewSession};
    use crate::session::TaskStatus;

    fn manager() -> (SessionManager, Database) {
        let db = Database::open_in_memory().unwrap();
        let config = Arc::new(BrokerConfig::default());
        (SessionManager::new(db.clone(), config), db)
    }

    fn seed_bot_session(db: &Database, id: &str, created_at: DateTime<Utc>) -> i64 {
        db.insert_session_with_task(
            &NewSession {
                id: id.to_string(),
                account_id: "acct".to_string(),
                shop_id: "shop".to_string(),
                shop_name: "Shop".to_string(),
                platform: "taobao".to_string(),
                task_type: TaskType::AutoBargain,
                state: SessionState::Pending,
                max_inactive_minutes: 60,
                external_task_id: Some(format!("ext-{id}")),
                transfer_reason: None,
                created_at,
            },
            Some(&NewSendTask {
                external_task_id: format!("ext-{id}"),
                send_content: "hello".to_string(),
                send_url: "https://chat.example/shop".to_string(),
                shop_name: "Shop".to_string(),
            }),
            false,
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn complete_happy_path_flips_task_and_session() {
        let (mgr, db) = manager();
        let task_id = seed_bot_session(&db, "s-1", Utc::now());
        db.mark_task_sent(task_id, Utc::now()).unwrap();

        let outcome = mgr.complete("s-1", true, None, Utc::now()).unwrap();
        assert_eq!(outcome.session.state, SessionState::Completed);
        assert_eq!(outcome.task.unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn send_report_activates_pending_session() {
        let (mgr, db) = manager();
        let task_id = seed_bot_session(&db, "s-1", Utc::now());
        db.mark_task_sent(task_id, Utc::now()).unwrap();

        let (task, session) = mgr.report_task(task_id, true, None, Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(session.state, SessionState::Active);

        // Replay is a no-op.
        let (task, session) = mgr.report_task(task_id, true, None, Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(session.state, SessionState::Active);
    }

    #[test]
    fn failed_send_report_leaves_session_pending() {
        let (mgr, db) = manager();
        let task_id = seed_bot_session(&db, "s-1", Utc::now());
        db.mark_task_sent(task_id, Utc::now()).unwrap();

        let (task, session) = mgr
            .report_task(task_id, false, Some("login expired"), Utc::now())
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(session.state, SessionState::Pending);
    }

    #[test]
    fn transfer_from_active_then_complete() {
        let (mgr, db) = manager();
        let task_id = seed_bot_session(&db, "s-1", Utc::now());
        db.mark_task_sent(task_id, Utc::now()).unwrap();
        mgr.report_task(task_id, true, None, Utc::now()).unwrap();

        let session = mgr
            .transfer("s-1", "human_intervention_detected", "high", Utc::now())
            .unwrap();
        assert_eq!(session.state, SessionState::Transferred);

        // An append-only transfer record attests the handover.
        let transfers = db.transfers_for_session("s-1").unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].reason, "human_intervention_detected");
        assert_eq!(transfers[0].from_type, TaskType::AutoBargain);
        assert!(transfers[0].accepted_at.is_none());

        let outcome = mgr.complete("s-1", true, None, Utc::now()).unwrap();
        assert_eq!(outcome.session.state, SessionState::Completed);

        // The transfer left an outbox notification behind.
        let outbox = db.undelivered_notifications(10).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].operation, "transferred");
    }

    #[test]
    fn reap_expires_stuck_pending_bot_session() {
        let (mgr, db) = manager();
        seed_bot_session(&db, "s-1", Utc::now() - Duration::seconds(120));

        let reaped = mgr.reap(Utc::now()).unwrap();
        assert_eq!(reaped, vec!["s-1".to_string()]);
        assert_eq!(db.get_session("s-1").unwrap().state, SessionState::Timeout);

        // Idempotent: a second pass finds nothing.
        assert!(mgr.reap(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn reap_expires_inactive_sessions_only_past_budget() {
        let (mgr, db) = manager();
        let task_id = seed_bot_session(&db, "s-1", Utc::now());
        db.mark_task_sent(task_id, Utc::now()).unwrap();
        // Activate so the pending grace no longer applies.
        let flip = db.complete_session("s-1", true, None, Utc::now());
        assert!(flip.is_ok());

        // Completed is terminal; nothing to reap.
        assert!(mgr.reap(Utc::now() + Duration::hours(5)).unwrap().is_empty());
    }

    #[test]
    fn terminal_completion_releases_paused_sibling() {
        let (mgr, db) = manager();
        seed_bot_session(&db, "s-1", Utc::now());
        db.pause_and_insert_session(
            "s-1",
            "preempted_by:manual_urgent",
            &NewSession {
                id: "s-2".to_string(),
                account_id: "acct".to_string(),
                shop_id: "shop".to_string(),
                shop_name: "Shop".to_string(),
                platform: "taobao".to_string(),
                task_type: TaskType::ManualUrgent,
                state: SessionState::Pending,
                max_inactive_minutes: 480,
                external_task_id: Some("ext-u".to_string()),
                transfer_reason: None,
                created_at: Utc::now(),
            },
            None,
        )
        .unwrap();

        mgr.cancel("s-2", Utc::now()).unwrap();
        assert_eq!(db.get_session("s-1").unwrap().state, SessionState::Active);
    }

    #[test]
    fn observed_session_is_born_transferred_with_notification() {
        let (mgr, db) = manager();
        let session = mgr
            .open_observed_session("acct", "Shop Z", "taobao", None, Utc::now())
            .unwrap();
        assert_eq!(session.state, SessionState::Transferred);
        assert_eq!(session.task_type, TaskType::ManualCustomerService);
        assert_eq!(session.max_inactive_minutes, 480);

        let outbox = db.undelivered_notifications(10).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].session_id, session.id);
    }
}
