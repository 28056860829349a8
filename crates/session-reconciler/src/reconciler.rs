//! The session reconciliation state machine.
//!
//! Turns the identity service's notification feed plus the staged pending
//! registration into the materialized current user, handling the
//! signup/first-sign-in race and the store's read-after-write gap.
//!
//! A reconciliation moves through `AwaitingProfile` (and, when a
//! registration is staged, `CreatingProfile` first) toward one of the two
//! resting states — settled or unauthenticated — or records a terminal
//! failure. Each attempt captures the generation assigned to its
//! notification; a newer notification or a sign-out bumps the generation,
//! so a superseded attempt's eventual result is discarded at commit time
//! rather than cancelled.

use crate::state::SharedSessionState;
use profile_fetcher::{fetch_with_retry, FetchConfig};
use session_model::{
    AuthSession, CurrentUser, IdentityClient, PendingRegistration, ProfileRecord, ProfileStore,
    SessionEvent,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The notification-driven reconciler.
pub struct Reconciler {
    identity: Arc<dyn IdentityClient>,
    store: Arc<dyn ProfileStore>,
    state: SharedSessionState,
    fetch: FetchConfig,
}

impl Reconciler {
    pub fn new(
        identity: Arc<dyn IdentityClient>,
        store: Arc<dyn ProfileStore>,
        state: SharedSessionState,
        fetch: FetchConfig,
    ) -> Self {
        Self {
            identity,
            store,
            state,
            fetch,
        }
    }

    /// Resolve the boot-time session state.
    ///
    /// No existing session leaves the state signed out; an existing session
    /// is reconciled in place (no registration is consumed — a staged slot
    /// belongs to a sign-up, and boot is not one).
    pub async fn bootstrap(&self) {
        match self.identity.current_session().await {
            Ok(Some(session)) => {
                debug!(user_id = %session.user_id, "existing session found at boot");
                let generation = self.state.bump_generation();
                self.state.begin_settling();
                self.reconcile(generation, session, None).await;
            }
            Ok(None) => {
                debug!("no session at boot");
                self.state.reset_signed_out();
            }
            Err(err) => {
                warn!(error = %err, "boot session query failed");
                let generation = self.state.bump_generation();
                self.state
                    .commit_failure(generation, format!("session query failed: {err}"));
            }
        }
    }

    /// Subscribe to the notification feed and spawn the event loop.
    ///
    /// The subscription is taken synchronously, so no notification emitted
    /// after this call returns can be missed. Teardown = aborting or
    /// dropping the returned handle.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        let events = reconciler.identity.subscribe();
        tokio::spawn(async move { reconciler.run(events).await })
    }

    /// Process notifications in delivery order.
    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            match events.recv().await {
                Ok(SessionEvent::SignedIn(session)) => {
                    // Generation bump and slot consumption happen here, in
                    // delivery order, before the attempt goes async.
                    let generation = self.state.bump_generation();
                    self.state.begin_settling();
                    let registration = self.state.take_registration();

                    debug!(
                        user_id = %session.user_id,
                        generation,
                        fresh_signup = registration.is_some(),
                        "signed-in notification"
                    );

                    // Reconcile on its own task so a newer notification can
                    // preempt the attempt instead of queuing behind it.
                    let reconciler = Arc::clone(&self);
                    tokio::spawn(async move {
                        reconciler.reconcile(generation, session, registration).await;
                    });
                }
                Ok(SessionEvent::SignedOut) => {
                    debug!("signed-out notification");
                    self.state.reset_signed_out();
                }
                Ok(SessionEvent::TokenRefreshed(session)) => {
                    debug!(user_id = %session.user_id, "token refreshed");
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // A dropped signed-out (or signed-in) must not leave
                    // stale state behind; fall back to querying the
                    // service directly.
                    warn!(missed, "session notification feed lagged, resyncing");
                    self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("session notification feed closed");
                    break;
                }
            }
        }
    }

    /// Recover from missed notifications by querying the session directly.
    ///
    /// Unlike boot, a staged registration is consumed here: the missed
    /// notification may have been the signed-in that follows a sign-up,
    /// and its profile still needs creating. A failed query changes
    /// nothing; the next notification or resync tries again.
    async fn resync(&self) {
        match self.identity.current_session().await {
            Ok(Some(session)) => {
                debug!(user_id = %session.user_id, "resync found a session");
                let generation = self.state.bump_generation();
                self.state.begin_settling();
                let registration = self.state.take_registration();
                self.reconcile(generation, session, registration).await;
            }
            Ok(None) => {
                debug!("resync found no session");
                self.state.reset_signed_out();
            }
            Err(err) => {
                warn!(error = %err, "resync session query failed");
            }
        }
    }

    /// One reconciliation attempt for one signed-in identity.
    async fn reconcile(
        &self,
        generation: u64,
        session: AuthSession,
        registration: Option<PendingRegistration>,
    ) {
        let user_id = session.user_id;

        if let Some(registration) = registration {
            let record = ProfileRecord::initial(user_id.clone(), registration.display_name.clone());
            if let Err(err) = self.store.insert(&record).await {
                error!(user_id = %user_id, error = %err, "profile insert failed");
                // Keep the registration for the next sign-in attempt.
                self.state.restore_registration(registration);
                self.state
                    .commit_failure(generation, format!("profile creation failed: {err}"));
                return;
            }
            debug!(user_id = %user_id, "profile created");
        }

        match fetch_with_retry(self.store.as_ref(), &user_id, &self.fetch).await {
            Ok(record) => {
                if self.state.commit_user(generation, CurrentUser::from(record)) {
                    info!(user_id = %user_id, "session settled");
                } else {
                    debug!(user_id = %user_id, generation, "superseded reconciliation discarded");
                }
            }
            Err(err) => {
                if self.state.commit_failure(generation, err.to_string()) {
                    error!(user_id = %user_id, error = %err, "reconciliation failed");
                } else {
                    debug!(user_id = %user_id, generation, "superseded failure discarded");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_model::{
        InMemoryProfileStore, ProfileRecord, ScriptedIdentityClient, ScriptedProfileStore,
        SessionSnapshot, StoreError, StoreReply, UserId,
    };
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn session(id: &str) -> AuthSession {
        AuthSession {
            user_id: UserId::from_string(id),
            access_token: format!("token-{id}"),
        }
    }

    fn record(id: &str, name: &str) -> ProfileRecord {
        ProfileRecord::initial(UserId::from_string(id), name)
    }

    fn fast_fetch() -> FetchConfig {
        FetchConfig {
            max_attempts: 5,
            retry_interval: Duration::from_millis(20),
        }
    }

    struct Harness {
        identity: Arc<ScriptedIdentityClient>,
        state: SharedSessionState,
        _loop_handle: JoinHandle<()>,
    }

    fn start(store: Arc<dyn ProfileStore>) -> Harness {
        let identity = Arc::new(ScriptedIdentityClient::new());
        let state = SharedSessionState::new();
        let reconciler = Arc::new(Reconciler::new(
            identity.clone(),
            store,
            state.clone(),
            fast_fetch(),
        ));
        let handle = reconciler.spawn();
        Harness {
            identity,
            state,
            _loop_handle: handle,
        }
    }

    async fn wait_until(
        changes: &mut broadcast::Receiver<SessionSnapshot>,
        pred: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = changes.recv().await.expect("state feed closed");
                if pred(&snapshot) {
                    return snapshot;
                }
            }
        })
        .await
        .expect("timed out waiting for session state")
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    #[tokio::test]
    async fn bootstrap_with_session_and_profile_settles() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.seed(record("u1", "Alice"));

        let identity = Arc::new(ScriptedIdentityClient::new());
        identity.set_current_session(Ok(Some(session("u1"))));

        let state = SharedSessionState::new();
        let reconciler = Reconciler::new(identity, store, state.clone(), fast_fetch());
        reconciler.bootstrap().await;

        let snapshot = state.snapshot();
        assert!(!snapshot.is_settling);
        assert!(snapshot.last_error.is_none());
        let user = snapshot.current_user.unwrap();
        assert_eq!(user.id.as_str(), "u1");
        assert_eq!(user.name, "Alice");
    }

    #[tokio::test]
    async fn bootstrap_without_session_is_signed_out() {
        let identity = Arc::new(ScriptedIdentityClient::new());
        let state = SharedSessionState::new();
        let reconciler = Reconciler::new(
            identity,
            Arc::new(InMemoryProfileStore::new()),
            state.clone(),
            fast_fetch(),
        );
        reconciler.bootstrap().await;

        assert_eq!(state.snapshot(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn bootstrap_does_not_consume_a_staged_registration() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.seed(record("u1", "Alice"));

        let identity = Arc::new(ScriptedIdentityClient::new());
        identity.set_current_session(Ok(Some(session("u1"))));

        let state = SharedSessionState::new();
        state.stage_registration(PendingRegistration {
            display_name: "Leftover".to_string(),
        });

        let reconciler = Reconciler::new(identity, store.clone(), state.clone(), fast_fetch());
        reconciler.bootstrap().await;

        assert_eq!(
            state.pending_registration().unwrap().display_name,
            "Leftover"
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_query_failure_is_recorded() {
        let identity = Arc::new(ScriptedIdentityClient::new());
        identity.set_current_session(Err(session_model::AuthError::Network(
            "down".to_string(),
        )));

        let state = SharedSessionState::new();
        let reconciler = Reconciler::new(
            identity,
            Arc::new(InMemoryProfileStore::new()),
            state.clone(),
            fast_fetch(),
        );
        reconciler.bootstrap().await;

        let snapshot = state.snapshot();
        assert!(snapshot.current_user.is_none());
        assert!(snapshot.last_error.unwrap().contains("down"));
    }

    // =========================================================================
    // Sign-in reconciliation
    // =========================================================================

    #[tokio::test]
    async fn plain_sign_in_settles_without_creating_a_profile() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.seed(record("u1", "Alice"));
        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.identity.emit(SessionEvent::SignedIn(session("u1")));

        let snapshot = wait_until(&mut changes, |s| s.current_user.is_some()).await;
        assert_eq!(snapshot.current_user.unwrap().name, "Alice");
        assert!(!snapshot.is_settling);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn signup_notification_creates_profile_then_settles() {
        let store = Arc::new(InMemoryProfileStore::new());
        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.state.stage_registration(PendingRegistration {
            display_name: "Alice".to_string(),
        });
        harness.identity.emit(SessionEvent::SignedIn(session("u2")));

        let snapshot = wait_until(&mut changes, |s| s.current_user.is_some()).await;
        let user = snapshot.current_user.unwrap();
        assert_eq!(user.id.as_str(), "u2");
        assert_eq!(user.name, "Alice");

        // Exactly the initial record was inserted, slot consumed
        let stored = store
            .find_by_id(&UserId::from_string("u2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, record("u2", "Alice"));
        assert!(harness.state.pending_registration().is_none());
    }

    #[tokio::test]
    async fn insert_failure_surfaces_and_keeps_the_registration() {
        let store = Arc::new(ScriptedProfileStore::new());
        store.queue_insert(Err(StoreError::Network("store down".to_string())));
        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.state.stage_registration(PendingRegistration {
            display_name: "Alice".to_string(),
        });
        harness.identity.emit(SessionEvent::SignedIn(session("u2")));

        let snapshot = wait_until(&mut changes, |s| s.last_error.is_some()).await;
        assert!(snapshot.last_error.unwrap().contains("profile creation failed"));
        assert!(snapshot.current_user.is_none());
        assert!(!snapshot.is_settling);

        // Kept for the next sign-in; no fetch was attempted
        assert_eq!(
            harness.state.pending_registration().unwrap().display_name,
            "Alice"
        );
        assert_eq!(store.find_count(), 0);
    }

    #[tokio::test]
    async fn retry_exhaustion_surfaces_a_failure() {
        let store = Arc::new(ScriptedProfileStore::new());
        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.identity.emit(SessionEvent::SignedIn(session("u1")));

        let snapshot = wait_until(&mut changes, |s| s.last_error.is_some()).await;
        assert!(snapshot.last_error.unwrap().contains("5 attempts"));
        assert!(snapshot.current_user.is_none());
        assert!(!snapshot.is_settling);
        assert_eq!(store.find_count(), 5);
    }

    // =========================================================================
    // Ordering and supersession
    // =========================================================================

    #[tokio::test]
    async fn newer_sign_in_wins_over_a_slow_earlier_one() {
        let store = Arc::new(ScriptedProfileStore::new());
        // First lookup (u1's attempt) resolves late; everything after finds u2.
        store.queue_find(StoreReply::FoundAfter(
            Duration::from_millis(150),
            record("u1", "Old"),
        ));
        store.set_default_find(StoreReply::Found(record("u2", "New")));

        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.identity.emit(SessionEvent::SignedIn(session("u1")));
        // Let u1's attempt issue its (delayed) lookup before u2 arrives.
        sleep(Duration::from_millis(40)).await;
        harness.identity.emit(SessionEvent::SignedIn(session("u2")));

        let snapshot = wait_until(&mut changes, |s| s.current_user.is_some()).await;
        assert_eq!(snapshot.current_user.unwrap().id.as_str(), "u2");

        // u1's attempt resolves afterwards and must be discarded.
        sleep(Duration::from_millis(200)).await;
        let snapshot = harness.state.snapshot();
        assert_eq!(snapshot.current_user.unwrap().id.as_str(), "u2");
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn sign_out_during_retry_loop_is_not_overwritten() {
        let store = Arc::new(ScriptedProfileStore::new());
        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.identity.emit(SessionEvent::SignedIn(session("u1")));
        let _ = wait_until(&mut changes, |s| s.is_settling).await;

        harness.identity.emit(SessionEvent::SignedOut);
        let snapshot = wait_until(&mut changes, |s| !s.is_settling).await;
        assert!(snapshot.current_user.is_none());

        // Let the retry loop for u1 run to exhaustion; its failure result
        // must be discarded, not recorded.
        sleep(Duration::from_millis(200)).await;
        let snapshot = harness.state.snapshot();
        assert!(snapshot.current_user.is_none());
        assert!(snapshot.last_error.is_none());
        assert!(!snapshot.is_settling);
    }

    #[tokio::test]
    async fn stale_sign_in_after_sign_out_does_not_resurrect_the_user() {
        let store = Arc::new(ScriptedProfileStore::new());
        store.queue_find(StoreReply::FoundAfter(
            Duration::from_millis(100),
            record("u1", "Ghost"),
        ));
        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.identity.emit(SessionEvent::SignedIn(session("u1")));
        sleep(Duration::from_millis(30)).await;
        harness.identity.emit(SessionEvent::SignedOut);
        let _ = wait_until(&mut changes, |s| !s.is_settling).await;

        // u1's lookup completes after sign-out; the commit must be discarded.
        sleep(Duration::from_millis(150)).await;
        assert!(harness.state.snapshot().current_user.is_none());
    }

    #[tokio::test]
    async fn lagged_feed_resyncs_from_the_session_query() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.seed(record("u1", "Alice"));
        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.identity.emit(SessionEvent::SignedIn(session("u1")));
        let _ = wait_until(&mut changes, |s| s.current_user.is_some()).await;

        // The user signed out elsewhere, and the notification is lost in
        // a flood: overflow the feed without yielding so the loop sees a
        // lag instead of the individual events.
        harness.identity.set_current_session(Ok(None));
        for _ in 0..80 {
            harness
                .identity
                .emit(SessionEvent::TokenRefreshed(session("u1")));
        }

        let snapshot = wait_until(&mut changes, |s| s.current_user.is_none()).await;
        assert_eq!(snapshot, SessionSnapshot::default());
    }

    #[tokio::test]
    async fn resync_consumes_a_staged_registration() {
        let store = Arc::new(InMemoryProfileStore::new());
        let identity = Arc::new(ScriptedIdentityClient::new());
        identity.set_current_session(Ok(Some(session("u2"))));

        let state = SharedSessionState::new();
        state.stage_registration(PendingRegistration {
            display_name: "Alice".to_string(),
        });

        let reconciler = Reconciler::new(identity, store.clone(), state.clone(), fast_fetch());
        reconciler.resync().await;

        // The missed notification was the sign-in after a sign-up: the
        // profile gets created and the slot is cleared.
        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_user.unwrap().name, "Alice");
        assert_eq!(store.len(), 1);
        assert!(state.pending_registration().is_none());
    }

    #[tokio::test]
    async fn token_refresh_changes_nothing() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.seed(record("u1", "Alice"));
        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.identity.emit(SessionEvent::SignedIn(session("u1")));
        let settled = wait_until(&mut changes, |s| s.current_user.is_some()).await;

        harness.state.stage_registration(PendingRegistration {
            display_name: "Unconsumed".to_string(),
        });
        harness
            .identity
            .emit(SessionEvent::TokenRefreshed(session("u1")));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.state.snapshot(), settled);
        // A refresh never consumes the registration slot
        assert!(harness.state.pending_registration().is_some());
    }

    #[tokio::test]
    async fn sign_out_clears_a_settled_user_and_the_slot() {
        let store = Arc::new(InMemoryProfileStore::new());
        store.seed(record("u1", "Alice"));
        let harness = start(store.clone());
        let mut changes = harness.state.subscribe();

        harness.identity.emit(SessionEvent::SignedIn(session("u1")));
        let _ = wait_until(&mut changes, |s| s.current_user.is_some()).await;

        harness.state.stage_registration(PendingRegistration {
            display_name: "Pending".to_string(),
        });
        harness.identity.emit(SessionEvent::SignedOut);

        let snapshot = wait_until(&mut changes, |s| s.current_user.is_none()).await;
        assert_eq!(snapshot, SessionSnapshot::default());
        assert!(harness.state.pending_registration().is_none());
    }
}
