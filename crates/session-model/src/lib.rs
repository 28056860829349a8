//! Shared data model for the Clanfit session engine.
//!
//! Defines the user/profile records, the view-facing session snapshot, the
//! error taxonomy, and the capability traits for the two external
//! collaborators (identity service, profile store). Also exports in-memory
//! and scripted collaborator implementations for downstream crates' tests.

mod error;
mod identity;
mod profile;
mod state;
mod testing;

pub use error::{AuthError, AuthResult, StoreError, StoreResult};
pub use identity::{AuthSession, Credential, IdentityClient, SessionEvent, UserId};
pub use profile::{CurrentUser, ProfileRecord, ProfileStore, ProfileUpdate};
pub use state::{PendingRegistration, SessionSnapshot};
pub use testing::{InMemoryProfileStore, ScriptedIdentityClient, ScriptedProfileStore, StoreReply};
