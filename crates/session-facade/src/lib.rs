//! The session surface the view layer calls.
//!
//! [`SessionManager`] translates user intent (sign-in, sign-up, sign-out,
//! profile edits) into identity-service calls and staged reconciler state.
//! It never materializes a user itself: after a successful auth call,
//! everything is driven by the identity service's notification feed through
//! the reconciler.
//!
//! Lifecycle: one instance per process, [`SessionManager::start`] on first
//! mount, [`SessionManager::shutdown`] at app shutdown.

use session_model::{IdentityClient, PendingRegistration, ProfileStore};
use session_reconciler::{Reconciler, SharedSessionState};

// Re-exported so view-layer code can depend on this crate alone.
pub use profile_fetcher::FetchConfig;
pub use session_model::{
    AuthError, AuthResult, Credential, CurrentUser, ProfileUpdate, SessionSnapshot, StoreError,
};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors from profile field updates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileUpdateError {
    /// There is no settled user to update.
    #[error("Not signed in")]
    NotSignedIn,
    /// The write-through to the profile store failed.
    #[error("Profile update failed: {0}")]
    Store(#[from] StoreError),
}

/// Process-wide session manager.
pub struct SessionManager {
    identity: Arc<dyn IdentityClient>,
    store: Arc<dyn ProfileStore>,
    state: SharedSessionState,
    reconciler: Arc<Reconciler>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a manager over the given collaborators with default retry
    /// configuration.
    pub fn new(identity: Arc<dyn IdentityClient>, store: Arc<dyn ProfileStore>) -> Self {
        Self::with_fetch_config(identity, store, FetchConfig::default())
    }

    /// Create a manager with explicit retry configuration.
    pub fn with_fetch_config(
        identity: Arc<dyn IdentityClient>,
        store: Arc<dyn ProfileStore>,
        fetch: FetchConfig,
    ) -> Self {
        let state = SharedSessionState::new();
        let reconciler = Arc::new(Reconciler::new(
            identity.clone(),
            store.clone(),
            state.clone(),
            fetch,
        ));
        Self {
            identity,
            store,
            state,
            reconciler,
            event_loop: Mutex::new(None),
        }
    }

    /// Start the engine: subscribe to the notification feed, then resolve
    /// the boot-time session.
    ///
    /// The subscription is taken before the boot query so a notification
    /// racing the query is not lost. Calling again while running is a
    /// no-op.
    pub async fn start(&self) {
        {
            let mut slot = self.event_loop.lock().expect("lock poisoned");
            if slot.is_some() {
                warn!("session manager already started");
                return;
            }
            *slot = Some(self.reconciler.spawn());
        }
        self.reconciler.bootstrap().await;
        info!("session manager started");
    }

    /// Stop consuming notifications. Local state is left as-is.
    pub fn shutdown(&self) {
        if let Some(handle) = self.event_loop.lock().expect("lock poisoned").take() {
            handle.abort();
            debug!("session event loop stopped");
        }
    }

    /// Current session state, cloned.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.snapshot()
    }

    /// Subscribe to session state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Authenticate with a credential.
    ///
    /// On rejection the error surfaces to the caller and the current user
    /// is untouched. On success nothing is materialized here — the
    /// signed-in notification drives reconciliation.
    pub async fn sign_in(&self, credential: &Credential) -> AuthResult<()> {
        self.state.begin_settling();
        match self.identity.sign_in(credential).await {
            Ok(session) => {
                debug!(user_id = %session.user_id, "sign-in accepted, awaiting notification");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "sign-in rejected");
                self.state.abandon_settling();
                Err(err)
            }
        }
    }

    /// Create an account.
    ///
    /// The registration is staged *before* the identity call: the service
    /// may emit its signed-in notification arbitrarily soon after (or
    /// during) the call, and the reconciler must find the display name
    /// already in place. A rejected call leaves the stage as-is — no
    /// notification will follow, and the next sign-up overwrites it.
    pub async fn sign_up(&self, display_name: &str, credential: &Credential) -> AuthResult<()> {
        self.state.stage_registration(PendingRegistration {
            display_name: display_name.to_string(),
        });
        self.state.begin_settling();

        match self.identity.sign_up(credential).await {
            Ok(session) => {
                debug!(
                    auto_signed_in = session.is_some(),
                    "sign-up accepted, awaiting notification"
                );
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "sign-up rejected");
                self.state.abandon_settling();
                Err(err)
            }
        }
    }

    /// Sign out.
    ///
    /// Local state is cleared unconditionally — the priority is to stop
    /// presenting stale authenticated state — so a remote failure is
    /// logged, never surfaced, and an in-flight reconciliation is
    /// superseded.
    pub async fn sign_out(&self) {
        if let Err(err) = self.identity.sign_out().await {
            warn!(error = %err, "remote sign-out failed, clearing local state anyway");
        }
        self.state.reset_signed_out();
        info!("signed out");
    }

    /// Update one profile field of the settled user.
    ///
    /// Write-through: the store write happens first, and the field is
    /// merged into the in-memory user only after it succeeds, never
    /// before. The merge is keyed to the identity the write was made for,
    /// so a sign-out or a different sign-in settling during the write
    /// leaves the new state untouched (the accepted row update stands).
    pub async fn update_profile_field(
        &self,
        update: ProfileUpdate,
    ) -> Result<(), ProfileUpdateError> {
        let user_id = self
            .snapshot()
            .current_user
            .map(|user| user.id)
            .ok_or(ProfileUpdateError::NotSignedIn)?;

        self.store.update(&user_id, &update).await?;

        if !self.state.merge_user_update(&user_id, &update) {
            debug!(user_id = %user_id, "settled user changed during the write, merge skipped");
        }
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
