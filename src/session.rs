//! Core session state machine
//!
//! Pure state transitions over the session lifecycle; all persistence is
//! applied by the manager after a transition succeeds.

mod state;
mod transition;

#[cfg(test)]
mod proptests;

pub use state::{FromSource, SessionState, TaskStatus, TaskType};
pub use transition::{transition, SessionEvent, TransitionError};
