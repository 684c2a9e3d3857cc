//! Message-batch ingestion
//!
//! Attributes inbound message batches to sessions, detects human takeover of
//! bot conversations, and requests the resulting state transitions through
//! the session manager. Dedup rides on the store's `message_id` uniqueness,
//! so replaying a batch is always a no-op.

use crate::config::BrokerConfig;
use crate::db::{Database, DbError, NewMessage};
use crate::manager::SessionManager;
use crate::session::{FromSource, SessionState};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Nick prefix that marks the bot/operator account side of a conversation.
const ACCOUNT_NICK_PREFIX: &str = "t-";

#[derive(Error, Debug)]
pub enum IngestError {
    /// Batch carries no `t-` nick and no account override.
    #[error("no account identity in batch")]
    NoAccount,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// One scraped message as the RPA receiver posts it.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub content: String,
    pub nick: String,
    pub sent_at: DateTime<Utc>,
}

/// A batch addressed to a single `(account, shop)` pair.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub shop_name: String,
    pub platform: String,
    pub max_inactive_minutes: Option<i64>,
    /// Batch-level account override for batches with no `t-` nick.
    pub account_id: Option<String>,
    pub messages: Vec<InboundMessage>,
}

/// What ingestion did to session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOperation {
    Created,
    Updated,
    Transferred,
}

/// Ingest summary returned to the receiver.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub processed: usize,
    pub skipped: usize,
    pub active_session_id: Option<String>,
    pub session_operations: Vec<SessionOperation>,
    pub errors: Vec<String>,
}

/// Context handed to the intervention classifier.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub account_id: String,
    pub is_bot: bool,
    /// Send contents of the session's recent tasks; an account message
    /// matching none of these did not come from the bot.
    pub expected_contents: Vec<String>,
}

/// Classifier verdict.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub transfer: bool,
    pub reason: String,
}

/// Pluggable human-takeover detector. The default is the heuristic below;
/// semantic implementations replace it without touching the pipeline.
pub trait InterventionClassifier: Send + Sync {
    fn classify(&self, messages: &[NewMessage], ctx: &SessionContext) -> Verdict;
}

/// Default heuristic: an account-sourced message flags takeover when its
/// nick resolves to a different account, or when its content matches none of
/// the session's recent sends.
pub struct HeuristicClassifier;

impl InterventionClassifier for HeuristicClassifier {
    fn classify(&self, messages: &[NewMessage], ctx: &SessionContext) -> Verdict {
        if !ctx.is_bot {
            return Verdict {
                transfer: false,
                reason: String::new(),
            };
        }
        for m in messages {
            if m.from_source != FromSource::Account {
                continue;
            }
            let nick_account = extract_account(&m.sender_nick);
            if nick_account.as_deref() != Some(ctx.account_id.as_str()) {
                return Verdict {
                    transfer: true,
                    reason: "human_intervention_detected".to_string(),
                };
            }
            if !ctx.expected_contents.iter().any(|c| c == &m.content) {
                return Verdict {
                    transfer: true,
                    reason: "human_intervention_detected".to_string(),
                };
            }
        }
        Verdict {
            transfer: false,
            reason: String::new(),
        }
    }
}

pub struct MessageIngestor {
    db: Database,
    manager: Arc<SessionManager>,
    config: Arc<BrokerConfig>,
    classifier: Arc<dyn InterventionClassifier>,
}

impl MessageIngestor {
    pub fn new(
        db: Database,
        manager: Arc<SessionManager>,
        config: Arc<BrokerConfig>,
        classifier: Arc<dyn InterventionClassifier>,
    ) -> Self {
        Self {
            db,
            manager,
            config,
            classifier,
        }
    }

    /// Process one batch: classify, dedup, sort, resolve the session,
    /// persist, and detect human intervention.
    pub fn ingest(
        &self,
        req: &IngestRequest,
        now: DateTime<Utc>,
    ) -> Result<IngestSummary, IngestError> {
        let account_id = resolve_account(req)?;
        let total = req.messages.len();

        // Normalize and drop duplicates, both within the batch and against
        // the store.
        let all_ids: Vec<String> = req.messages.iter().map(|m| m.message_id.clone()).collect();
        let stored = self.db.existing_message_ids(&all_ids)?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut fresh: Vec<NewMessage> = req
            .messages
            .iter()
            .filter(|m| !stored.contains(&m.message_id) && seen.insert(m.message_id.clone()))
            .map(|m| NewMessage {
                message_id: m.message_id.clone(),
                content: m.content.clone(),
                sender_nick: m.nick.clone(),
                from_source: classify_nick(&m.nick),
                sent_at: m.sent_at,
            })
            .collect();

        if fresh.is_empty() {
            // Full replay: no state change, no touch, no notification.
            let current = self
                .db
                .find_slot_session_by_shop_name(&account_id, &req.shop_name)?;
            return Ok(IngestSummary {
                processed: 0,
                skipped: total,
                active_session_id: current.map(|s| s.id),
                session_operations: vec![],
                errors: vec![],
            });
        }

        fresh.sort_by(|a, b| {
            a.sent_at
                .cmp(&b.sent_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });

        let mut operations = Vec::new();
        let mut errors = Vec::new();

        let session = self.resolve_session(req, &account_id, &fresh, now, &mut operations)?;

        let (processed, skipped_on_insert) = self.db.insert_messages(&session.id, &fresh, now)?;
        let latest_sent = fresh.last().map_or(now, |m| m.sent_at);
        self.manager.touch(&session.id, latest_sent)?;

        // Human-intervention detection applies to running bot sessions only.
        if session.task_type.is_bot() && session.state == SessionState::Active {
            let window = Duration::minutes(self.config.intervention_window_minutes);
            let ctx = SessionContext {
                account_id: account_id.clone(),
                is_bot: true,
                expected_contents: self.db.recent_send_contents(&session.id, now - window)?,
            };
            let verdict = self.classifier.classify(&fresh, &ctx);
            if verdict.transfer {
                match self.manager.transfer(&session.id, &verdict.reason, "high", now) {
                    Ok(_) => operations.push(SessionOperation::Transferred),
                    // A concurrent transition beat us; the batch itself is fine.
                    Err(e) => errors.push(format!("transfer failed: {e}")),
                }
            }
        }

        if operations.is_empty() {
            operations.push(SessionOperation::Updated);
        }

        tracing::info!(
            session_id = %session.id,
            account_id = %account_id,
            shop_name = %req.shop_name,
            processed,
            skipped = total - fresh.len() + skipped_on_insert,
            operations = ?operations,
            "Message batch ingested"
        );

        Ok(IngestSummary {
            processed,
            skipped: total - fresh.len() + skipped_on_insert,
            active_session_id: Some(session.id.clone()),
            session_operations: operations,
            errors,
        })
    }

    /// Find the session this batch belongs to, opening a fresh one when the
    /// pair has no slot holder or the silence gap elapsed.
    fn resolve_session(
        &self,
        req: &IngestRequest,
        account_id: &str,
        fresh: &[NewMessage],
        now: DateTime<Utc>,
        operations: &mut Vec<SessionOperation>,
    ) -> Result<crate::db::Session, IngestError> {
        let current = self
            .db
            .find_slot_session_by_shop_name(account_id, &req.shop_name)?;
        let gap = Duration::minutes(self.config.session_gap_minutes);
        let first_new = fresh.iter().map(|m| m.sent_at).min().unwrap_or(now);
        let latest_stored = self
            .db
            .latest_message_time_for_pair(account_id, &req.shop_name)?;

        // The gap baseline is the newest sign of life for the pair: stored
        // messages, or the current session's own activity (a just-admitted
        // session has no messages yet and must not inherit stale history).
        let baseline = match (&current, latest_stored) {
            (Some(cur), Some(stored)) => Some(stored.max(cur.last_activity_at)),
            (Some(cur), None) => Some(cur.last_activity_at),
            (None, stored) => stored,
        };
        let gap_elapsed = baseline.is_some_and(|b| first_new - b > gap);

        if let Some(current) = current {
            if !gap_elapsed {
                return Ok(current);
            }
            // The old conversation went silent past the gap; it expires and
            // the batch opens a fresh session.
            self.db.expire_session(&current.id, now)?;
            tracing::info!(
                session_id = %current.id,
                "Session expired by silence gap during ingest"
            );
        }

        let session = self.manager.open_observed_session(
            account_id,
            &req.shop_name,
            &req.platform,
            req.max_inactive_minutes,
            now,
        )?;
        operations.push(SessionOperation::Created);
        Ok(session)
    }
}

/// `t-` nicks are the account side; everything else is the shop side.
fn classify_nick(nick: &str) -> FromSource {
    if nick.starts_with(ACCOUNT_NICK_PREFIX) {
        FromSource::Account
    } else {
        FromSource::Shop
    }
}

/// Account identity carried by a `t-` nick.
fn extract_account(nick: &str) -> Option<String> {
    nick.strip_prefix(ACCOUNT_NICK_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(ToString::to_string)
}

/// Batch account: explicit override first, else the first `t-` nick.
fn resolve_account(req: &IngestRequest) -> Result<String, IngestError> {
    if let Some(account) = &req.account_id {
        return Ok(account.clone());
    }
    req.messages
        .iter()
        .find_map(|m| extract_account(&m.nick))
        .ok_or(IngestError::NoAccount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionController, AdmissionDecision, AdmissionRequest};
    use crate::queue::InMemoryQueue;
    use crate::session::TaskType;

    struct Fixture {
        ingestor: MessageIngestor,
        manager: Arc<SessionManager>,
        db: Database,
        admission: AdmissionController,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let config = Arc::new(BrokerConfig::default());
        let queue = Arc::new(InMemoryQueue::new());
        let manager = Arc::new(SessionManager::new(db.clone(), config.clone()));
        let admission = AdmissionController::new(db.clone(), queue, config.clone());
        let ingestor = MessageIngestor::new(
            db.clone(),
            manager.clone(),
            config,
            Arc::new(HeuristicClassifier),
        );
        Fixture {
            ingestor,
            manager,
            db,
            admission,
        }
    }

    /// Admit a bot session and activate it via a confirmed send.
    fn active_bot_session(fx: &Fixture, content: &str) -> String {
        let decision = fx
            .admission
            .admit(
                &AdmissionRequest {
                    account_id: "acct".to_string(),
                    shop_id: "shop".to_string(),
                    shop_name: "Shop".to_string(),
                    platform: "taobao".to_string(),
                    task_type: TaskType::AutoBargain,
                    external_task_id: "ext-1".to_string(),
                    send_content: content.to_string(),
                    max_inactive_minutes: None,
                },
                Utc::now(),
            )
            .unwrap();
        let AdmissionDecision::Accepted { session, task_id, .. } = decision else {
            panic!("expected acceptance");
        };
        let task_id = task_id.unwrap();
        fx.db.mark_task_sent(task_id, Utc::now()).unwrap();
        fx.manager.report_task(task_id, true, None, Utc::now()).unwrap();
        session.id
    }

    fn msg(id: &str, nick: &str, content: &str, sent_at: DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            message_id: id.to_string(),
            content: content.to_string(),
            nick: nick.to_string(),
            sent_at,
        }
    }

    fn batch(messages: Vec<InboundMessage>) -> IngestRequest {
        IngestRequest {
            shop_name: "Shop".to_string(),
            platform: "taobao".to_string(),
            max_inactive_minutes: None,
            account_id: None,
            messages,
        }
    }

    #[test]
    fn nick_classification() {
        assert_eq!(classify_nick("t-acct"), FromSource::Account);
        assert_eq!(classify_nick("buyer88"), FromSource::Shop);
        assert_eq!(extract_account("t-acct").as_deref(), Some("acct"));
        assert_eq!(extract_account("buyer88"), None);
        assert_eq!(extract_account("t-"), None);
    }

    #[test]
    fn batch_without_account_identity_fails() {
        let fx = fixture();
        let err = fx
            .ingestor
            .ingest(&batch(vec![msg("m-1", "buyer88", "hi", Utc::now())]), Utc::now())
            .unwrap_err();
        assert!(matches!(err, IngestError::NoAccount));

        // The batch-level override unblocks it.
        let mut req = batch(vec![msg("m-1", "buyer88", "hi", Utc::now())]);
        req.account_id = Some("acct".to_string());
        let summary = fx.ingestor.ingest(&req, Utc::now()).unwrap();
        assert_eq!(summary.processed, 1);
    }

    #[test]
    fn batch_attaches_to_running_bot_session() {
        let fx = fixture();
        let session_id = active_bot_session(&fx, "您好，请问还有优惠吗");

        let now = Utc::now();
        let summary = fx
            .ingestor
            .ingest(
                &batch(vec![
                    msg("m-1", "t-acct", "您好，请问还有优惠吗", now),
                    msg("m-2", "buyer88", "可以便宜点", now + Duration::seconds(30)),
                ]),
                now + Duration::minutes(1),
            )
            .unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.active_session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(summary.session_operations, vec![SessionOperation::Updated]);
        assert!(summary.errors.is_empty());

        // The bot's own expected send does not look like intervention.
        let session = fx.db.get_session(&session_id).unwrap();
        assert_eq!(session.state, SessionState::Active);

        // Messages land attributed and in sent_at order.
        let stored = fx.db.messages_for_session(&session_id).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].message_id, "m-1");
        assert_eq!(stored[0].from_source, FromSource::Account);
        assert_eq!(stored[1].message_id, "m-2");
        assert_eq!(stored[1].from_source, FromSource::Shop);
    }

    #[test]
    fn foreign_account_nick_triggers_transfer() {
        let fx = fixture();
        let session_id = active_bot_session(&fx, "您好，请问还有优惠吗");

        let now = Utc::now();
        let summary = fx
            .ingestor
            .ingest(
                &batch(vec![
                    msg("m-1", "buyer88", "在吗", now),
                    msg("m-2", "t-other-op", "马上给您处理", now + Duration::seconds(5)),
                ]),
                now + Duration::minutes(1),
            )
            .unwrap();

        assert!(summary
            .session_operations
            .contains(&SessionOperation::Transferred));
        let session = fx.db.get_session(&session_id).unwrap();
        assert_eq!(session.state, SessionState::Transferred);
        assert_eq!(
            session.transfer_reason.as_deref(),
            Some("human_intervention_detected")
        );

        // Exactly one notification left for dispatch.
        let outbox = fx.db.undelivered_notifications(10).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].operation, "transferred");
    }

    #[test]
    fn unexpected_account_content_triggers_transfer() {
        let fx = fixture();
        let session_id = active_bot_session(&fx, "您好，请问还有优惠吗");

        let now = Utc::now();
        let summary = fx
            .ingestor
            .ingest(
                &batch(vec![msg(
                    "m-1",
                    "t-acct",
                    "我是人工客服，这边帮您看下",
                    now,
                )]),
                now,
            )
            .unwrap();

        assert!(summary
            .session_operations
            .contains(&SessionOperation::Transferred));
        assert_eq!(
            fx.db.get_session(&session_id).unwrap().state,
            SessionState::Transferred
        );
    }

    #[test]
    fn gap_opens_new_transferred_session() {
        let fx = fixture();

        // Seed history through an observed session, then complete it so the
        // pair has stored messages but no slot holder.
        let now = Utc::now();
        let first = fx
            .ingestor
            .ingest(
                &batch(vec![msg("m-1", "t-acct", "您好", now - Duration::minutes(50))]),
                now - Duration::minutes(50),
            )
            .unwrap();
        let old_id = first.active_session_id.unwrap();
        fx.manager.complete(&old_id, true, None, now - Duration::minutes(46)).unwrap();

        // 45 minutes of silence later a new batch arrives.
        let summary = fx
            .ingestor
            .ingest(
                &batch(vec![msg("m-2", "t-acct", "还在吗", now - Duration::minutes(5))]),
                now,
            )
            .unwrap();

        assert_eq!(summary.session_operations, vec![SessionOperation::Created]);
        let new_id = summary.active_session_id.unwrap();
        assert_ne!(new_id, old_id);
        let session = fx.db.get_session(&new_id).unwrap();
        assert_eq!(session.state, SessionState::Transferred);
        assert_eq!(session.task_type, TaskType::ManualCustomerService);
    }

    #[test]
    fn replayed_batch_is_a_no_op() {
        let fx = fixture();
        let session_id = active_bot_session(&fx, "您好，请问还有优惠吗");

        let now = Utc::now();
        let req = batch(vec![
            msg("m-1", "t-acct", "您好，请问还有优惠吗", now),
            msg("m-2", "buyer88", "可以便宜点", now + Duration::seconds(30)),
        ]);

        let first = fx.ingestor.ingest(&req, now + Duration::minutes(1)).unwrap();
        assert_eq!(first.processed, 2);
        let activity_after_first = fx.db.get_session(&session_id).unwrap().last_activity_at;

        let second = fx.ingestor.ingest(&req, now + Duration::minutes(2)).unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 2);
        assert!(second.session_operations.is_empty());
        assert_eq!(
            fx.db.get_session(&session_id).unwrap().last_activity_at,
            activity_after_first
        );
    }

    #[test]
    fn within_batch_duplicates_count_as_skipped() {
        let fx = fixture();
        active_bot_session(&fx, "您好");

        let now = Utc::now();
        let summary = fx
            .ingestor
            .ingest(
                &batch(vec![
                    msg("m-1", "buyer88", "在吗", now),
                    msg("m-1", "buyer88", "在吗", now),
                ]),
                now,
            )
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 1);
    }
}
