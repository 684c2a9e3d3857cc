//! Database module for the session broker
//!
//! Owns all persisted state: sessions, send tasks, messages, transfer
//! records, and the operation log. The single-active-session invariant is
//! enforced here through a partial unique index, so concurrent admission
//! races resolve inside SQLite rather than in process memory.

mod schema;

pub use schema::*;

use crate::session::{transition, SessionEvent, SessionState, TaskStatus, TaskType, TransitionError};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Task not found: {0}")]
    TaskNotFound(i64),
    #[error("Active slot already held for this (account, shop) pair")]
    SlotTaken,
    #[error("External task id already exists: {0}")]
    DuplicateExternalTask(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Database busy after retries")]
    Busy,
}

pub type DbResult<T> = Result<T, DbError>;

/// Outcome of completing a session (§ first-send coupling).
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub session: Session,
    /// The task flipped by this call, if the session had one in flight.
    pub task: Option<SendTask>,
}

const BUSY_ATTEMPTS: u32 = 3;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run an operation against the connection, retrying `SQLITE_BUSY` with
    /// bounded exponential backoff. Exhausted retries surface as [`DbError::Busy`].
    fn with_conn<T>(&self, op: impl Fn(&mut Connection) -> DbResult<T>) -> DbResult<T> {
        for attempt in 1..=BUSY_ATTEMPTS {
            let mut conn = self.conn.lock().unwrap();
            match op(&mut conn) {
                Err(DbError::Sqlite(e)) if is_busy(&e) => {
                    drop(conn);
                    if attempt == BUSY_ATTEMPTS {
                        return Err(DbError::Busy);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(25 << attempt));
                }
                other => return other,
            }
        }
        Err(DbError::Busy)
    }

    // ==================== Session Operations ====================

    /// Insert a session (and its send task, for bot sessions) atomically.
    ///
    /// The partial unique index on the slot-holding states rejects a second
    /// slot holder for the pair; that surfaces as [`DbError::SlotTaken`] so
    /// admission can re-read and decide. An `created` operation row is
    /// appended in the same transaction.
    pub fn insert_session_with_task(
        &self,
        session: &NewSession,
        task: Option<&NewSendTask>,
        notify_created: bool,
    ) -> DbResult<Option<i64>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            insert_session(&tx, session)?;
            let task_id = match task {
                Some(t) => Some(insert_task(&tx, &session.id, t, session.created_at)?),
                None => None,
            };
            append_operation(
                &tx,
                &session.id,
                "created",
                Some(serde_json::json!({
                    "task_type": session.task_type.to_string(),
                    "account_id": session.account_id,
                    "shop_id": session.shop_id,
                })),
                notify_created,
                session.created_at,
            )?;
            tx.commit()?;
            Ok(task_id)
        })
    }

    /// Preempt the current slot holder and insert the new session in one
    /// transaction. The conditional pause reports zero rows when the current
    /// session moved under us, which maps to [`DbError::SlotTaken`] so the
    /// caller re-evaluates.
    pub fn pause_and_insert_session(
        &self,
        current_id: &str,
        reason: &str,
        session: &NewSession,
        task: Option<&NewSendTask>,
    ) -> DbResult<Option<i64>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let paused = tx.execute(
                "UPDATE sessions SET state = 'paused', transfer_reason = ?1
                 WHERE id = ?2 AND state IN ('pending', 'active')",
                params![reason, current_id],
            )?;
            if paused == 0 {
                return Err(DbError::SlotTaken);
            }
            append_operation(
                &tx,
                current_id,
                "preempted",
                Some(serde_json::json!({ "reason": reason })),
                false,
                session.created_at,
            )?;
            insert_session(&tx, session)?;
            let task_id = match task {
                Some(t) => Some(insert_task(&tx, &session.id, t, session.created_at)?),
                None => None,
            };
            append_operation(
                &tx,
                &session.id,
                "created",
                Some(serde_json::json!({
                    "task_type": session.task_type.to_string(),
                    "preempted_session_id": current_id,
                })),
                false,
                session.created_at,
            )?;
            tx.commit()?;
            Ok(task_id)
        })
    }

    /// Get session by ID
    pub fn get_session(&self, id: &str) -> DbResult<Session> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
                params![id],
                map_session,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })
        })
    }

    /// Find the slot-holding session for an `(account, shop)` pair, if any.
    pub fn find_slot_session(&self, account_id: &str, shop_id: &str) -> DbResult<Option<Session>> {
        self.query_slot_session(
            "account_id = ?1 AND shop_id = ?2",
            params![account_id, shop_id],
        )
    }

    /// Slot lookup keyed on the shop display name; message batches carry no
    /// shop id.
    pub fn find_slot_session_by_shop_name(
        &self,
        account_id: &str,
        shop_name: &str,
    ) -> DbResult<Option<Session>> {
        self.query_slot_session(
            "account_id = ?1 AND shop_name = ?2",
            params![account_id, shop_name],
        )
    }

    fn query_slot_session(
        &self,
        predicate: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> DbResult<Option<Session>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLS} FROM sessions
                 WHERE {predicate} AND state IN ('pending', 'active', 'transferred')"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query_map(args, map_session)?;
            rows.next().transpose().map_err(DbError::from)
        })
    }

    /// Most recently paused session for a pair, for release after the slot
    /// holder reaches a terminal state.
    pub fn latest_paused_session(
        &self,
        account_id: &str,
        shop_id: &str,
    ) -> DbResult<Option<Session>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLS} FROM sessions
                 WHERE account_id = ?1 AND shop_id = ?2 AND state = 'paused'
                 ORDER BY created_at DESC LIMIT 1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query_map(params![account_id, shop_id], map_session)?;
            rows.next().transpose().map_err(DbError::from)
        })
    }

    /// All non-terminal sessions, for the reaper scan.
    pub fn list_non_terminal_sessions(&self) -> DbResult<Vec<Session>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLS} FROM sessions
                 WHERE state IN ('pending', 'active', 'paused', 'transferred')"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], map_session)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
        })
    }

    /// Complete a session, coupling task completion with the state machine
    /// in one transaction:
    /// - the most recent SENT task flips to COMPLETED (success) or FAILED;
    /// - a completed first send activates a PENDING session before the
    ///   session itself completes;
    /// - a failed send leaves a PENDING session in place for retry.
    pub fn complete_session(
        &self,
        id: &str,
        success: bool,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<CompletionOutcome> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut session = load_session(&tx, id)?;

            let task = flip_latest_sent_task(&tx, id, success, error_message, now)?;

            if success {
                if task.is_some() && session.state == SessionState::Pending {
                    session.state = transition(session.state, SessionEvent::FirstSendCompleted)?;
                }
                session.state = transition(session.state, SessionEvent::Complete)?;
            } else if session.state == SessionState::Pending {
                // Failed first send: session stays pending, retry may follow.
                if task.is_none() {
                    return Err(DbError::Transition(TransitionError::InvalidState {
                        from: session.state,
                        event: SessionEvent::Complete,
                    }));
                }
            } else {
                session.state = transition(session.state, SessionEvent::Complete)?;
            }

            store_session_state(&tx, &mut session, now, None)?;
            append_operation(
                &tx,
                id,
                "completed",
                Some(serde_json::json!({
                    "success": success,
                    "error_message": error_message,
                    "state": session.state.to_string(),
                })),
                false,
                now,
            )?;
            tx.commit()?;
            Ok(CompletionOutcome { session, task })
        })
    }

    /// Transfer ACTIVE -> TRANSFERRED, writing the transfer record and a
    /// notify-flagged operation row in the same transaction.
    pub fn transfer_session(
        &self,
        id: &str,
        reason: &str,
        urgency: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Session> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut session = load_session(&tx, id)?;
            session.state = transition(session.state, SessionEvent::Transfer)?;
            session.transfer_reason = Some(reason.to_string());
            session.transferred_at = Some(now);
            store_session_state(&tx, &mut session, now, Some(reason))?;
            tx.execute(
                "INSERT INTO session_transfers
                 (session_id, from_type, to_type, reason, urgency, transferred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    session.task_type.to_string(),
                    TaskType::ManualCustomerService.to_string(),
                    reason,
                    urgency,
                    fmt_ts(now),
                ],
            )?;
            append_operation(
                &tx,
                id,
                "transferred",
                Some(serde_json::json!({ "reason": reason, "urgency": urgency })),
                true,
                now,
            )?;
            tx.commit()?;
            Ok(session)
        })
    }

    /// Cancel a PENDING or PAUSED session; any pending send task fails with it.
    pub fn cancel_session(&self, id: &str, now: DateTime<Utc>) -> DbResult<Session> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut session = load_session(&tx, id)?;
            session.state = transition(session.state, SessionEvent::Cancel)?;
            store_session_state(&tx, &mut session, now, None)?;
            fail_pending_tasks(&tx, id, "session cancelled", now)?;
            append_operation(&tx, id, "cancelled", None, false, now)?;
            tx.commit()?;
            Ok(session)
        })
    }

    /// Expire a session if it is still non-terminal; idempotent. Pending
    /// send tasks fail alongside it.
    pub fn expire_session(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let expired = tx.execute(
                "UPDATE sessions SET state = 'timeout'
                 WHERE id = ?1 AND state IN ('pending', 'active', 'paused', 'transferred')",
                params![id],
            )?;
            if expired == 0 {
                return Ok(false);
            }
            fail_pending_tasks(&tx, id, "session timed out", now)?;
            append_operation(&tx, id, "timeout", None, false, now)?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Release a paused session back into the active slot. Returns false if
    /// another session holds the slot (the unique index rejects the update)
    /// or the session is no longer paused.
    pub fn release_session(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let released = tx.execute(
                "UPDATE sessions SET state = 'active',
                        last_activity_at = MAX(last_activity_at, ?2)
                 WHERE id = ?1 AND state = 'paused'",
                params![id, fmt_ts(now)],
            );
            let released = match released {
                Ok(n) => n,
                Err(e) if constraint_kind(&e) == Some(Constraint::ActiveSlot) => return Ok(false),
                Err(e) => return Err(DbError::Sqlite(e)),
            };
            if released == 0 {
                return Ok(false);
            }
            append_operation(&tx, id, "released", None, false, now)?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Advance `last_activity_at` monotonically (no-op when the candidate is
    /// not newer).
    pub fn touch_session(&self, id: &str, at: DateTime<Utc>) -> DbResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE sessions SET last_activity_at = MAX(last_activity_at, ?2)
                 WHERE id = ?1",
                params![id, fmt_ts(at)],
            )?;
            if updated == 0 {
                return Err(DbError::SessionNotFound(id.to_string()));
            }
            Ok(())
        })
    }

    // ==================== Task Operations ====================

    /// Get task by ID
    pub fn get_task(&self, task_id: i64) -> DbResult<SendTask> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLS} FROM session_tasks WHERE task_id = ?1"),
                params![task_id],
                map_task,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::TaskNotFound(task_id),
                other => DbError::Sqlite(other),
            })
        })
    }

    /// Idempotency lookup for admission replays.
    pub fn find_session_by_external_id(
        &self,
        external_task_id: &str,
    ) -> DbResult<Option<Session>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {SESSION_COLS} FROM sessions WHERE external_task_id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query_map(params![external_task_id], map_session)?;
            rows.next().transpose().map_err(DbError::from)
        })
    }

    /// Conditional PENDING -> SENT flip. Returns the task and whether this
    /// call performed the flip; repeat reads see the same payload but never
    /// flip twice.
    pub fn mark_task_sent(&self, task_id: i64, now: DateTime<Utc>) -> DbResult<(SendTask, bool)> {
        self.with_conn(|conn| {
            let flipped = conn.execute(
                "UPDATE session_tasks SET status = 'sent', updated_at = ?2
                 WHERE task_id = ?1 AND status = 'pending'",
                params![task_id, fmt_ts(now)],
            )?;
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLS} FROM session_tasks WHERE task_id = ?1"),
                    params![task_id],
                    map_task,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => DbError::TaskNotFound(task_id),
                    other => DbError::Sqlite(other),
                })?;
            Ok((task, flipped > 0))
        })
    }

    /// Record a worker's send report. The status flip and the first-send
    /// coupling are one transaction: a completed first send activates a
    /// PENDING session (no-op if already active); a failed send leaves it
    /// PENDING. Replays are no-ops.
    pub fn report_task_result(
        &self,
        task_id: i64,
        success: bool,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<(SendTask, Session)> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let task = tx
                .query_row(
                    &format!("SELECT {TASK_COLS} FROM session_tasks WHERE task_id = ?1"),
                    params![task_id],
                    map_task,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => DbError::TaskNotFound(task_id),
                    other => DbError::Sqlite(other),
                })?;

            if task.status == TaskStatus::Sent {
                let status = if success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                tx.execute(
                    "UPDATE session_tasks SET status = ?2, error_message = ?3, updated_at = ?4
                     WHERE task_id = ?1 AND status = 'sent'",
                    params![task_id, status.to_string(), error_message, fmt_ts(now)],
                )?;
            }

            let mut session = load_session(&tx, &task.session_id)?;
            if success && session.state == SessionState::Pending {
                session.state = transition(session.state, SessionEvent::FirstSendCompleted)?;
            }
            // Terminal sessions are read-only; a late report only lands on
            // the task record.
            if !session.state.is_terminal() {
                store_session_state(&tx, &mut session, now, None)?;
            }

            let task = tx.query_row(
                &format!("SELECT {TASK_COLS} FROM session_tasks WHERE task_id = ?1"),
                params![task_id],
                map_task,
            )?;
            tx.commit()?;
            Ok((task, session))
        })
    }

    /// Explicit FAILED -> PENDING retry, the only backward status move.
    pub fn retry_task(&self, task_id: i64, now: DateTime<Utc>) -> DbResult<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE session_tasks
                 SET status = 'pending', error_message = NULL, updated_at = ?2
                 WHERE task_id = ?1 AND status = 'failed'",
                params![task_id, fmt_ts(now)],
            )?;
            Ok(updated > 0)
        })
    }

    /// Task ids still PENDING with no status movement since `cutoff`; the
    /// reconciliation scan re-pushes these onto the queue.
    pub fn stale_pending_task_ids(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id FROM session_tasks
                 WHERE status = 'pending' AND updated_at < ?1
                 ORDER BY task_id ASC",
            )?;
            let rows = stmt.query_map(params![fmt_ts(cutoff)], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
        })
    }

    /// Send contents of the session's tasks that moved since `since`, for
    /// the intervention content match.
    pub fn recent_send_contents(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> DbResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT send_content FROM session_tasks
                 WHERE session_id = ?1
                   AND status IN ('sent', 'completed')
                   AND updated_at >= ?2",
            )?;
            let rows = stmt.query_map(params![session_id, fmt_ts(since)], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
        })
    }

    // ==================== Message Operations ====================

    /// Which of the given message ids are already stored (the dedup barrier).
    pub fn existing_message_ids(&self, ids: &[String]) -> DbResult<HashSet<String>> {
        self.with_conn(|conn| {
            let mut found = HashSet::new();
            let mut stmt =
                conn.prepare("SELECT message_id FROM messages WHERE message_id = ?1")?;
            for id in ids {
                let mut rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
                if let Some(hit) = rows.next().transpose()? {
                    found.insert(hit);
                }
            }
            Ok(found)
        })
    }

    /// Persist a batch of messages for a session in `sent_at` order, skipping
    /// duplicates; returns (inserted, skipped).
    pub fn insert_messages(
        &self,
        session_id: &str,
        messages: &[NewMessage],
        now: DateTime<Utc>,
    ) -> DbResult<(usize, usize)> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            for m in messages {
                let n = tx.execute(
                    "INSERT OR IGNORE INTO messages
                     (message_id, session_id, content, sender_nick, from_source, sent_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        m.message_id,
                        session_id,
                        m.content,
                        m.sender_nick,
                        m.from_source.to_string(),
                        fmt_ts(m.sent_at),
                        fmt_ts(now),
                    ],
                )?;
                inserted += n;
            }
            tx.commit()?;
            Ok((inserted, messages.len() - inserted))
        })
    }

    /// Stored messages of a session in conversation order.
    pub fn messages_for_session(&self, session_id: &str) -> DbResult<Vec<MessageRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, session_id, content, sender_nick, from_source,
                        sent_at, created_at
                 FROM messages WHERE session_id = ?1
                 ORDER BY sent_at ASC, message_id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], map_message)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
        })
    }

    /// Transfer records of a session, oldest first.
    pub fn transfers_for_session(&self, session_id: &str) -> DbResult<Vec<TransferRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, from_type, to_type, reason, urgency,
                        transferred_at, accepted_at
                 FROM session_transfers WHERE session_id = ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], map_transfer)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
        })
    }

    /// Latest stored message time across all sessions of an
    /// `(account, shop_name)` pair, for the session-gap rule.
    pub fn latest_message_time_for_pair(
        &self,
        account_id: &str,
        shop_name: &str,
    ) -> DbResult<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let max: Option<String> = conn.query_row(
                "SELECT MAX(m.sent_at) FROM messages m
                 JOIN sessions s ON s.id = m.session_id
                 WHERE s.account_id = ?1 AND s.shop_name = ?2",
                params![account_id, shop_name],
                |row| row.get(0),
            )?;
            Ok(max.as_deref().map(parse_datetime))
        })
    }

    // ==================== Operation Log / Outbox ====================

    /// Append a standalone operation row (outside a composite transaction).
    pub fn append_operation_row(
        &self,
        session_id: &str,
        operation: &str,
        detail: Option<serde_json::Value>,
        notify: bool,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            append_operation(&tx, session_id, operation, detail.clone(), notify, now)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Undelivered notify-flagged operation rows, oldest first.
    pub fn undelivered_notifications(&self, limit: usize) -> DbResult<Vec<OperationRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, operation, detail, notify, delivered_at, created_at
                 FROM session_operations
                 WHERE notify = 1 AND delivered_at IS NULL
                 ORDER BY id ASC LIMIT ?1",
            )?;
            #[allow(clippy::cast_possible_wrap)]
            let rows = stmt.query_map(params![limit as i64], map_operation)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
        })
    }

    pub fn mark_notification_delivered(&self, id: i64, now: DateTime<Utc>) -> DbResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE session_operations SET delivered_at = ?2 WHERE id = ?1",
                params![id, fmt_ts(now)],
            )?;
            Ok(())
        })
    }
}

// ==================== Transaction Helpers ====================

const SESSION_COLS: &str = "id, account_id, shop_id, shop_name, platform, task_type, priority, \
     state, max_inactive_minutes, external_task_id, transfer_reason, transferred_at, created_at, \
     last_activity_at";

const TASK_COLS: &str = "task_id, session_id, external_task_id, send_content, send_url, \
     shop_name, status, error_message, created_at, updated_at";

fn insert_session(tx: &Transaction<'_>, s: &NewSession) -> DbResult<()> {
    let result = tx.execute(
        "INSERT INTO sessions
         (id, account_id, shop_id, shop_name, platform, task_type, priority, state,
          max_inactive_minutes, external_task_id, transfer_reason, created_at, last_activity_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            s.id,
            s.account_id,
            s.shop_id,
            s.shop_name,
            s.platform,
            s.task_type.to_string(),
            s.task_type.priority(),
            s.state.to_string(),
            s.max_inactive_minutes,
            s.external_task_id,
            s.transfer_reason,
            fmt_ts(s.created_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) => match constraint_kind(&e) {
            Some(Constraint::ActiveSlot) => Err(DbError::SlotTaken),
            Some(Constraint::ExternalTask) => Err(DbError::DuplicateExternalTask(
                s.external_task_id.clone().unwrap_or_default(),
            )),
            None => Err(DbError::Sqlite(e)),
        },
    }
}

fn insert_task(
    tx: &Transaction<'_>,
    session_id: &str,
    t: &NewSendTask,
    now: DateTime<Utc>,
) -> DbResult<i64> {
    let result = tx.execute(
        "INSERT INTO session_tasks
         (session_id, external_task_id, send_content, send_url, shop_name, status,
          created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
        params![
            session_id,
            t.external_task_id,
            t.send_content,
            t.send_url,
            t.shop_name,
            fmt_ts(now),
        ],
    );
    match result {
        Ok(_) => Ok(tx.last_insert_rowid()),
        Err(e) if constraint_kind(&e) == Some(Constraint::ExternalTask) => {
            Err(DbError::DuplicateExternalTask(t.external_task_id.clone()))
        }
        Err(e) => Err(DbError::Sqlite(e)),
    }
}

fn load_session(tx: &Transaction<'_>, id: &str) -> DbResult<Session> {
    tx.query_row(
        &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
        params![id],
        map_session,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id.to_string()),
        other => DbError::Sqlite(other),
    })
}

/// Persist the (already transitioned) state and stamp activity monotonically.
fn store_session_state(
    tx: &Transaction<'_>,
    session: &mut Session,
    now: DateTime<Utc>,
    transfer_reason: Option<&str>,
) -> DbResult<()> {
    let transferred_at = session.transferred_at.map(fmt_ts);
    tx.execute(
        "UPDATE sessions SET state = ?2,
                last_activity_at = MAX(last_activity_at, ?3),
                transfer_reason = COALESCE(?4, transfer_reason),
                transferred_at = COALESCE(?5, transferred_at)
         WHERE id = ?1",
        params![
            session.id,
            session.state.to_string(),
            fmt_ts(now),
            transfer_reason,
            transferred_at,
        ],
    )?;
    if now > session.last_activity_at {
        session.last_activity_at = now;
    }
    Ok(())
}

/// Flip the session's most recent SENT task, if it has one.
fn flip_latest_sent_task(
    tx: &Transaction<'_>,
    session_id: &str,
    success: bool,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> DbResult<Option<SendTask>> {
    let latest: Option<i64> = tx
        .query_row(
            "SELECT task_id FROM session_tasks
             WHERE session_id = ?1 AND status = 'sent'
             ORDER BY task_id DESC LIMIT 1",
            params![session_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    let Some(task_id) = latest else {
        return Ok(None);
    };

    let status = if success {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    };
    tx.execute(
        "UPDATE session_tasks SET status = ?2, error_message = ?3, updated_at = ?4
         WHERE task_id = ?1",
        params![task_id, status.to_string(), error_message, fmt_ts(now)],
    )?;
    tx.query_row(
        &format!("SELECT {TASK_COLS} FROM session_tasks WHERE task_id = ?1"),
        params![task_id],
        map_task,
    )
    .map(Some)
    .map_err(DbError::from)
}

fn fail_pending_tasks(
    tx: &Transaction<'_>,
    session_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> DbResult<()> {
    tx.execute(
        "UPDATE session_tasks SET status = 'failed', error_message = ?2, updated_at = ?3
         WHERE session_id = ?1 AND status = 'pending'",
        params![session_id, reason, fmt_ts(now)],
    )?;
    Ok(())
}

fn append_operation(
    tx: &Transaction<'_>,
    session_id: &str,
    operation: &str,
    detail: Option<serde_json::Value>,
    notify: bool,
    now: DateTime<Utc>,
) -> DbResult<()> {
    let detail_str = detail.map(|v| v.to_string());
    tx.execute(
        "INSERT INTO session_operations (session_id, operation, detail, notify, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![session_id, operation, detail_str, notify, fmt_ts(now)],
    )?;
    Ok(())
}

// ==================== Row Mapping ====================

fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        account_id: row.get(1)?,
        shop_id: row.get(2)?,
        shop_name: row.get(3)?,
        platform: row.get(4)?,
        task_type: parse_task_type(&row.get::<_, String>(5)?),
        priority: row.get(6)?,
        state: parse_state(&row.get::<_, String>(7)?),
        max_inactive_minutes: row.get(8)?,
        external_task_id: row.get(9)?,
        transfer_reason: row.get(10)?,
        transferred_at: row.get::<_, Option<String>>(11)?.as_deref().map(parse_datetime),
        created_at: parse_datetime(&row.get::<_, String>(12)?),
        last_activity_at: parse_datetime(&row.get::<_, String>(13)?),
    })
}

fn map_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<SendTask> {
    Ok(SendTask {
        task_id: row.get(0)?,
        session_id: row.get(1)?,
        external_task_id: row.get(2)?,
        send_content: row.get(3)?,
        send_url: row.get(4)?,
        shop_name: row.get(5)?,
        status: parse_task_status(&row.get::<_, String>(6)?),
        error_message: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        message_id: row.get(0)?,
        session_id: row.get(1)?,
        content: row.get(2)?,
        sender_nick: row.get(3)?,
        from_source: crate::session::FromSource::parse(&row.get::<_, String>(4)?)
            .unwrap_or(crate::session::FromSource::Shop),
        sent_at: parse_datetime(&row.get::<_, String>(5)?),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn map_transfer(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRecord> {
    Ok(TransferRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        from_type: parse_task_type(&row.get::<_, String>(2)?),
        to_type: parse_task_type(&row.get::<_, String>(3)?),
        reason: row.get(4)?,
        urgency: row.get(5)?,
        transferred_at: parse_datetime(&row.get::<_, String>(6)?),
        accepted_at: row.get::<_, Option<String>>(7)?.as_deref().map(parse_datetime),
    })
}

fn map_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationRecord> {
    Ok(OperationRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        operation: row.get(2)?,
        detail: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        notify: row.get(4)?,
        delivered_at: row.get::<_, Option<String>>(5)?.as_deref().map(parse_datetime),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Constraint {
    ActiveSlot,
    ExternalTask,
}

fn constraint_kind(e: &rusqlite::Error) -> Option<Constraint> {
    if let rusqlite::Error::SqliteFailure(err, Some(msg)) = e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            if msg.contains("idx_sessions_active_pair") {
                return Some(Constraint::ActiveSlot);
            }
            if msg.contains("external_task_id") {
                return Some(Constraint::ExternalTask);
            }
        }
    }
    None
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Uniform millisecond precision so lexicographic comparison in SQL matches
/// chronological order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_task_type(s: &str) -> TaskType {
    TaskType::parse(s).unwrap_or(TaskType::ManualCustomerService)
}

fn parse_state(s: &str) -> SessionState {
    SessionState::parse(s).unwrap_or(SessionState::Pending)
}

fn parse_task_status(s: &str) -> TaskStatus {
    TaskStatus::parse(s).unwrap_or(TaskStatus::Pending)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
