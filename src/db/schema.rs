//! Database schema and row types

use crate::session::{FromSource, SessionState, TaskStatus, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    shop_id TEXT NOT NULL,
    shop_name TEXT NOT NULL,
    platform TEXT NOT NULL,
    task_type TEXT NOT NULL,
    priority INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    max_inactive_minutes INTEGER NOT NULL,
    external_task_id TEXT UNIQUE,
    transfer_reason TEXT,
    transferred_at TEXT,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);

-- At most one slot-holding session per (account, shop). Paused sessions are
-- parked outside the slot and re-acquire it on release.
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_pair
    ON sessions(account_id, shop_id)
    WHERE state IN ('pending', 'active', 'transferred');

CREATE INDEX IF NOT EXISTS idx_sessions_pair_state
    ON sessions(account_id, shop_id, state);

CREATE TABLE IF NOT EXISTS session_tasks (
    task_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    external_task_id TEXT NOT NULL UNIQUE,
    send_content TEXT NOT NULL,
    send_url TEXT NOT NULL,
    shop_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_session ON session_tasks(session_id, task_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON session_tasks(status, updated_at);

CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    content TEXT NOT NULL,
    sender_nick TEXT NOT NULL,
    from_source TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, sent_at);

CREATE TABLE IF NOT EXISTS session_transfers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    from_type TEXT NOT NULL,
    to_type TEXT NOT NULL,
    reason TEXT NOT NULL,
    urgency TEXT NOT NULL,
    transferred_at TEXT NOT NULL,
    accepted_at TEXT,

    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE TABLE IF NOT EXISTS session_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    detail TEXT,
    notify INTEGER NOT NULL DEFAULT 0,
    delivered_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_operations_outbox
    ON session_operations(notify, delivered_at, id);
";

/// Session record — a logical conversation bound to an `(account, shop)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub account_id: String,
    pub shop_id: String,
    pub shop_name: String,
    pub platform: String,
    pub task_type: TaskType,
    pub priority: u8,
    pub state: SessionState,
    pub max_inactive_minutes: i64,
    /// Caller idempotency key; absent for sessions opened by ingestion.
    pub external_task_id: Option<String>,
    pub transfer_reason: Option<String>,
    pub transferred_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Fields required to insert a session. Priority is derived from the task
/// type at insert time.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub account_id: String,
    pub shop_id: String,
    pub shop_name: String,
    pub platform: String,
    pub task_type: TaskType,
    pub state: SessionState,
    pub max_inactive_minutes: i64,
    pub external_task_id: Option<String>,
    pub transfer_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Send-task record — one unit of outbound send work for a bot session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTask {
    pub task_id: i64,
    pub session_id: String,
    pub external_task_id: String,
    pub send_content: String,
    pub send_url: String,
    pub shop_name: String,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to insert a send task alongside its session.
#[derive(Debug, Clone)]
pub struct NewSendTask {
    pub external_task_id: String,
    pub send_content: String,
    pub send_url: String,
    pub shop_name: String,
}

/// Persisted inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub session_id: String,
    pub content: String,
    pub sender_nick: String,
    pub from_source: FromSource,
    pub sent_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// An inbound message before attribution.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub content: String,
    pub sender_nick: String,
    pub from_source: FromSource,
    pub sent_at: DateTime<Utc>,
}

/// Append-only record attesting a bot -> human transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: i64,
    pub session_id: String,
    pub from_type: TaskType,
    pub to_type: TaskType,
    pub reason: String,
    pub urgency: String,
    pub transferred_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Audit-log row, doubling as the notification outbox when `notify` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: i64,
    pub session_id: String,
    pub operation: String,
    pub detail: Option<serde_json::Value>,
    pub notify: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
