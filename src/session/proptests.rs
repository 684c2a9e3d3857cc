//! Property-based tests for the session state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::state::SessionState;
use super::transition::{transition, SessionEvent};
use proptest::prelude::*;

fn arb_state() -> impl Strategy<Value = SessionState> {
    prop_oneof![
        Just(SessionState::Pending),
        Just(SessionState::Active),
        Just(SessionState::Completed),
        Just(SessionState::Transferred),
        Just(SessionState::Paused),
        Just(SessionState::Cancelled),
        Just(SessionState::Timeout),
    ]
}

fn arb_event() -> impl Strategy<Value = SessionEvent> {
    prop_oneof![
        Just(SessionEvent::FirstSendCompleted),
        Just(SessionEvent::Complete),
        Just(SessionEvent::Cancel),
        Just(SessionEvent::Transfer),
        Just(SessionEvent::Preempt),
        Just(SessionEvent::Release),
        Just(SessionEvent::Expire),
    ]
}

proptest! {
    // Terminal immutability: no event ever leaves a terminal state.
    #[test]
    fn prop_terminal_states_are_immutable(state in arb_state(), event in arb_event()) {
        if state.is_terminal() {
            prop_assert!(transition(state, event).is_err());
        }
    }

    // Every successful transition lands in a state of the lifecycle graph,
    // and only Expire may produce Timeout.
    #[test]
    fn prop_transitions_stay_in_graph(state in arb_state(), event in arb_event()) {
        if let Ok(next) = transition(state, event) {
            match event {
                SessionEvent::FirstSendCompleted | SessionEvent::Release => {
                    prop_assert_eq!(next, SessionState::Active);
                }
                SessionEvent::Complete => prop_assert_eq!(next, SessionState::Completed),
                SessionEvent::Cancel => prop_assert_eq!(next, SessionState::Cancelled),
                SessionEvent::Transfer => prop_assert_eq!(next, SessionState::Transferred),
                SessionEvent::Preempt => prop_assert_eq!(next, SessionState::Paused),
                SessionEvent::Expire => prop_assert_eq!(next, SessionState::Timeout),
            }
        }
    }

    // Applying random event sequences never escapes the graph: once a
    // terminal state is reached, the walk is stuck there.
    #[test]
    fn prop_event_walks_respect_terminality(
        events in proptest::collection::vec(arb_event(), 0..16)
    ) {
        let mut state = SessionState::Pending;
        let mut terminal_seen = false;
        for event in events {
            match transition(state, event) {
                Ok(next) => {
                    prop_assert!(!terminal_seen, "left terminal state {state}");
                    state = next;
                    terminal_seen = state.is_terminal();
                }
                Err(_) => {}
            }
        }
    }

    // Expire succeeds from exactly the non-terminal states.
    #[test]
    fn prop_expire_matches_terminality(state in arb_state()) {
        let expired = transition(state, SessionEvent::Expire);
        prop_assert_eq!(expired.is_ok(), !state.is_terminal());
    }
}
