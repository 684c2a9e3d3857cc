//! Pure state transition function
//!
//! Every session state change in the service goes through [`transition`];
//! the manager persists the result. Illegal pairs return a typed error that
//! surfaces as `INVALID_STATE` at the API boundary.

use super::state::SessionState;
use std::fmt;
use thiserror::Error;

/// Events that drive the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A worker confirmed the first send task
    FirstSendCompleted,
    /// The caller finished the session
    Complete,
    /// Explicit cancellation
    Cancel,
    /// Human takeover, explicit or detected from a message batch
    Transfer,
    /// A higher-priority creation parked this session
    Preempt,
    /// The parked session re-acquired the active slot
    Release,
    /// The reaper expired this session (grace or inactivity)
    Expire,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::FirstSendCompleted => write!(f, "first_send_completed"),
            SessionEvent::Complete => write!(f, "complete"),
            SessionEvent::Cancel => write!(f, "cancel"),
            SessionEvent::Transfer => write!(f, "transfer"),
            SessionEvent::Preempt => write!(f, "preempt"),
            SessionEvent::Release => write!(f, "release"),
            SessionEvent::Expire => write!(f, "expire"),
        }
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {from} does not accept {event}")]
    InvalidState {
        from: SessionState,
        event: SessionEvent,
    },
}

/// Pure transition function over the allowed lifecycle graph.
///
/// Preemption is legal from Pending as well as Active: admission pauses
/// whatever non-terminal session holds the slot, activated or not.
pub fn transition(
    state: SessionState,
    event: SessionEvent,
) -> Result<SessionState, TransitionError> {
    use self::SessionEvent as E;
    use self::SessionState as S;

    match (state, event) {
        (S::Pending | S::Active, E::FirstSendCompleted) => Ok(S::Active),

        (S::Active | S::Transferred, E::Complete) => Ok(S::Completed),

        (S::Pending | S::Paused, E::Cancel) => Ok(S::Cancelled),

        (S::Active, E::Transfer) => Ok(S::Transferred),

        (S::Pending | S::Active, E::Preempt) => Ok(S::Paused),

        (S::Paused, E::Release) => Ok(S::Active),

        (s, E::Expire) if !s.is_terminal() => Ok(S::Timeout),

        (from, event) => Err(TransitionError::InvalidState { from, event }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::SessionEvent as E;
    use super::SessionState as S;

    #[test]
    fn happy_bot_path() {
        let s = transition(S::Pending, E::FirstSendCompleted).unwrap();
        assert_eq!(s, S::Active);
        let s = transition(s, E::Complete).unwrap();
        assert_eq!(s, S::Completed);
    }

    #[test]
    fn first_send_is_idempotent_on_active() {
        assert_eq!(transition(S::Active, E::FirstSendCompleted), Ok(S::Active));
    }

    #[test]
    fn transfer_then_complete() {
        let s = transition(S::Active, E::Transfer).unwrap();
        assert_eq!(s, S::Transferred);
        assert_eq!(transition(s, E::Complete), Ok(S::Completed));
    }

    #[test]
    fn preempt_release_cycle() {
        let s = transition(S::Active, E::Preempt).unwrap();
        assert_eq!(s, S::Paused);
        assert_eq!(transition(s, E::Release), Ok(S::Active));
    }

    #[test]
    fn pending_session_can_be_preempted() {
        assert_eq!(transition(S::Pending, E::Preempt), Ok(S::Paused));
    }

    #[test]
    fn every_non_terminal_state_expires() {
        for s in [S::Pending, S::Active, S::Paused, S::Transferred] {
            assert_eq!(transition(s, E::Expire), Ok(S::Timeout));
        }
    }

    #[test]
    fn terminal_states_reject_all_events() {
        for s in [S::Completed, S::Cancelled, S::Timeout] {
            for e in [
                E::FirstSendCompleted,
                E::Complete,
                E::Cancel,
                E::Transfer,
                E::Preempt,
                E::Release,
                E::Expire,
            ] {
                assert!(
                    transition(s, e).is_err(),
                    "terminal {s} accepted {e}"
                );
            }
        }
    }

    #[test]
    fn complete_requires_active_or_transferred() {
        assert!(transition(S::Pending, E::Complete).is_err());
        assert!(transition(S::Paused, E::Complete).is_err());
    }

    #[test]
    fn transferred_is_not_preemptible() {
        assert!(transition(S::Transferred, E::Preempt).is_err());
    }
}
