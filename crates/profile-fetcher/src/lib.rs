//! Bounded-retry profile lookup.
//!
//! The identity service and the profile store are eventually consistent
//! with each other after a write: a profile row inserted moments ago (or by
//! another reconciliation step) may not be visible to a point lookup yet.
//! [`fetch_with_retry`] masks that read-after-write gap with a small fixed
//! number of fixed-interval attempts.
//!
//! Fixed interval, not exponential backoff: the gap being masked is a short
//! propagation delay, and the bound keeps worst-case onboarding latency at
//! `max_attempts * retry_interval` (2.5s with defaults).

use session_model::{ProfileRecord, ProfileStore, UserId};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of point-lookup attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default fixed delay between attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for the bounded retry loop.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Maximum number of lookups before giving up.
    pub max_attempts: u32,
    /// Fixed delay between attempts (no backoff growth).
    pub retry_interval: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Failure to materialize a profile within the retry budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Every attempt came back empty (or errored). The caller maps this to
    /// a surfaced failure, never a silent empty state.
    #[error("Profile not visible after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Look up a profile row, retrying while it is not visible yet.
///
/// Each attempt is a point lookup by identity id. A lookup error counts the
/// same as "not found yet" — the store may be momentarily unreachable for
/// the same transient reasons the row may be missing — so it never aborts
/// the loop early. A hit returns immediately.
pub async fn fetch_with_retry<S: ProfileStore + ?Sized>(
    store: &S,
    id: &UserId,
    config: &FetchConfig,
) -> Result<ProfileRecord, FetchError> {
    for attempt in 1..=config.max_attempts {
        match store.find_by_id(id).await {
            Ok(Some(record)) => {
                debug!(user_id = %id, attempt, "profile lookup succeeded");
                return Ok(record);
            }
            Ok(None) => {
                debug!(user_id = %id, attempt, "profile not visible yet");
            }
            Err(err) => {
                warn!(user_id = %id, attempt, error = %err, "profile lookup failed, treating as not visible");
            }
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(config.retry_interval).await;
        }
    }

    Err(FetchError::Exhausted {
        attempts: config.max_attempts,
    })
}
