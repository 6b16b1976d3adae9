//! Session lifecycle on top of the token layer.
//!
//! [`SessionManager`] owns the observable [`SessionState`] and moves it
//! through the pure [`transition`] function. [`GuardedAccess`] answers
//! "may this protected view render?" from that state and a live token check.

mod guard;
mod machine;
mod manager;

pub use guard::{AccessDecision, GuardedAccess};
pub use machine::{transition, SessionEvent, SessionPhase, SessionState};
pub use manager::{SessionManager, SideEffectFailure, SideEffects};
