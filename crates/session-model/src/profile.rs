//! Profile records and the profile store capability trait.

use crate::error::StoreResult;
use crate::identity::UserId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The application profile row stored per identity.
///
/// Created exactly once per identity, by the reconciler, after the first
/// sign-in that follows a sign-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    /// Identity this profile belongs to (the store's key).
    pub id: UserId,
    /// Display name chosen at sign-up.
    pub display_name: String,
    /// Clan the user joined during onboarding, if any.
    pub clan_id: Option<String>,
    /// Completed program days, monotonically increasing.
    pub total_days_completed: i64,
}

impl ProfileRecord {
    /// Build the initial profile for a freshly signed-up identity.
    pub fn initial(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            clan_id: None,
            total_days_completed: 0,
        }
    }
}

/// The reconciled, view-facing projection of a [`ProfileRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentUser {
    pub id: UserId,
    pub name: String,
    pub clan: Option<String>,
    pub total_days_completed: i64,
}

impl From<ProfileRecord> for CurrentUser {
    fn from(record: ProfileRecord) -> Self {
        Self {
            id: record.id,
            name: record.display_name,
            clan: record.clan_id,
            total_days_completed: record.total_days_completed,
        }
    }
}

/// A single-field profile patch.
///
/// The write-through surface accepts one field at a time; the accepted
/// value is merged into the in-memory user only after the remote write
/// succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileUpdate {
    DisplayName(String),
    Clan(Option<String>),
    DaysCompleted(i64),
}

impl ProfileUpdate {
    /// Merge the accepted field into a view projection.
    pub fn apply(&self, user: &mut CurrentUser) {
        match self {
            Self::DisplayName(name) => user.name = name.clone(),
            Self::Clan(clan) => user.clan = clan.clone(),
            Self::DaysCompleted(days) => user.total_days_completed = *days,
        }
    }

    /// Merge the field into a stored record.
    pub fn apply_to_record(&self, record: &mut ProfileRecord) {
        match self {
            Self::DisplayName(name) => record.display_name = name.clone(),
            Self::Clan(clan) => record.clan_id = clan.clone(),
            Self::DaysCompleted(days) => record.total_days_completed = *days,
        }
    }
}

/// Capability trait for the external profile store.
///
/// A keyed record store with one row per identity. The store is eventually
/// consistent with the identity service after a write; readers mask the
/// read-after-write gap with bounded retries, not here.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Insert a new profile row. Fails with a conflict if one exists.
    async fn insert(&self, record: &ProfileRecord) -> StoreResult<()>;

    /// Point lookup by identity id. `Ok(None)` means not visible (yet).
    async fn find_by_id(&self, id: &UserId) -> StoreResult<Option<ProfileRecord>>;

    /// Patch a single field of an existing row.
    async fn update(&self, id: &UserId, update: &ProfileUpdate) -> StoreResult<()>;
}
