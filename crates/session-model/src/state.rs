//! View-facing session state types.

use crate::profile::CurrentUser;
use serde::Serialize;

/// Registration data staged by sign-up before the identity service confirms
/// the new identity.
///
/// One slot process-wide; a second sign-up before resolution overwrites it
/// (last write wins). Consumed by the first signed-in notification that
/// follows; left in place when the profile insert fails so the next sign-in
/// can retry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRegistration {
    pub display_name: String,
}

/// The process-wide session state the view layer observes.
///
/// Replaced atomically as a whole on every change; consumers never see a
/// partially updated snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// The reconciled user, absent when signed out or not yet settled.
    pub current_user: Option<CurrentUser>,
    /// True from the moment an auth call or notification begins until the
    /// user is replaced or the attempt is abandoned. The view layer must
    /// not assume a user is available while this is set.
    pub is_settling: bool,
    /// Terminal failure from the notification-driven path (profile insert
    /// failure, retry exhaustion). There is no caller to return these to.
    pub last_error: Option<String>,
}
