//! Session reconciliation engine for the Clanfit client.
//!
//! Owns the process-wide session state (current user, settling flag,
//! pending registration, generation counter) and the state machine that
//! reconciles identity-service notifications with profile store rows.

mod reconciler;
mod state;

pub use reconciler::Reconciler;
pub use state::SharedSessionState;
