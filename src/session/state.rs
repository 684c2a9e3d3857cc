//! Session domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a session was opened for.
///
/// `Auto*` types are driven by the bot pipeline and carry exactly one send
/// task; `Manual*` types represent a human operator on the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AutoBargain,
    AutoFollowUp,
    ManualCustomerService,
    ManualComplaint,
    ManualUrgent,
}

impl TaskType {
    /// Numeric priority, 1 = emergency .. 4 = low. Lower wins.
    pub fn priority(self) -> u8 {
        match self {
            TaskType::ManualUrgent => 1,
            TaskType::ManualComplaint => 2,
            TaskType::ManualCustomerService => 3,
            TaskType::AutoBargain | TaskType::AutoFollowUp => 4,
        }
    }

    /// Whether sessions of this type are driven by the bot pipeline.
    pub fn is_bot(self) -> bool {
        matches!(self, TaskType::AutoBargain | TaskType::AutoFollowUp)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_bargain" => Some(TaskType::AutoBargain),
            "auto_follow_up" => Some(TaskType::AutoFollowUp),
            "manual_customer_service" => Some(TaskType::ManualCustomerService),
            "manual_complaint" => Some(TaskType::ManualComplaint),
            "manual_urgent" => Some(TaskType::ManualUrgent),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::AutoBargain => write!(f, "auto_bargain"),
            TaskType::AutoFollowUp => write!(f, "auto_follow_up"),
            TaskType::ManualCustomerService => write!(f, "manual_customer_service"),
            TaskType::ManualComplaint => write!(f, "manual_complaint"),
            TaskType::ManualUrgent => write!(f, "manual_urgent"),
        }
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, first send not yet confirmed
    Pending,
    /// First send confirmed, conversation in progress
    Active,
    /// Finished by the caller
    Completed,
    /// Handed over to a human
    Transferred,
    /// Parked by a higher-priority creation
    Paused,
    /// Abandoned before completion
    Cancelled,
    /// Expired by the reaper
    Timeout,
}

impl SessionState {
    /// Terminal states are read-only except for message back-references.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Timeout
        )
    }

    /// Whether this state occupies the single active slot for its
    /// `(account, shop)` pair. Paused sessions are parked and must
    /// re-acquire the slot on release.
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            SessionState::Pending | SessionState::Active | SessionState::Transferred
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionState::Pending),
            "active" => Some(SessionState::Active),
            "completed" => Some(SessionState::Completed),
            "transferred" => Some(SessionState::Transferred),
            "paused" => Some(SessionState::Paused),
            "cancelled" => Some(SessionState::Cancelled),
            "timeout" => Some(SessionState::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Pending => write!(f, "pending"),
            SessionState::Active => write!(f, "active"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Transferred => write!(f, "transferred"),
            SessionState::Paused => write!(f, "paused"),
            SessionState::Cancelled => write!(f, "cancelled"),
            SessionState::Timeout => write!(f, "timeout"),
        }
    }
}

/// Send-task statuses. Forward-only except Failed -> Pending on explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "sent" => Some(TaskStatus::Sent),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Sent => write!(f, "sent"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Which side of the conversation a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FromSource {
    /// The bot/operator account (`t-` nick prefix)
    Account,
    /// The shop counterparty
    Shop,
}

impl FromSource {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "account" => Some(FromSource::Account),
            "shop" => Some(FromSource::Shop),
            _ => None,
        }
    }
}

impl fmt::Display for FromSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FromSource::Account => write!(f, "account"),
            FromSource::Shop => write!(f, "shop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_preemption_rules() {
        assert!(TaskType::ManualUrgent.priority() < TaskType::ManualComplaint.priority());
        assert!(TaskType::ManualComplaint.priority() < TaskType::ManualCustomerService.priority());
        assert!(TaskType::ManualCustomerService.priority() < TaskType::AutoBargain.priority());
        assert_eq!(
            TaskType::AutoBargain.priority(),
            TaskType::AutoFollowUp.priority()
        );
    }

    #[test]
    fn bot_predicate_splits_on_prefix() {
        assert!(TaskType::AutoBargain.is_bot());
        assert!(TaskType::AutoFollowUp.is_bot());
        assert!(!TaskType::ManualCustomerService.is_bot());
        assert!(!TaskType::ManualComplaint.is_bot());
        assert!(!TaskType::ManualUrgent.is_bot());
    }

    #[test]
    fn display_and_parse_round_trip() {
        for state in [
            SessionState::Pending,
            SessionState::Active,
            SessionState::Completed,
            SessionState::Transferred,
            SessionState::Paused,
            SessionState::Cancelled,
            SessionState::Timeout,
        ] {
            assert_eq!(SessionState::parse(&state.to_string()), Some(state));
        }
        for ty in [
            TaskType::AutoBargain,
            TaskType::AutoFollowUp,
            TaskType::ManualCustomerService,
            TaskType::ManualComplaint,
            TaskType::ManualUrgent,
        ] {
            assert_eq!(TaskType::parse(&ty.to_string()), Some(ty));
        }
    }

    #[test]
    fn paused_does_not_hold_the_slot() {
        assert!(SessionState::Pending.holds_slot());
        assert!(SessionState::Active.holds_slot());
        assert!(SessionState::Transferred.holds_slot());
        assert!(!SessionState::Paused.holds_slot());
        assert!(!SessionState::Completed.holds_slot());
    }
}
