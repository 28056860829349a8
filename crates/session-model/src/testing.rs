//! Collaborator implementations for tests and local development.
//!
//! Downstream crates exercise the reconciler and facade against these
//! doubles: an in-memory profile store that behaves like the real thing,
//! a scripted store with queued per-call replies (for failure and
//! interleaving scenarios), and a scripted identity client that drives the
//! notification feed by hand.

use crate::error::{AuthError, AuthResult, StoreError, StoreResult};
use crate::identity::{AuthSession, Credential, IdentityClient, SessionEvent, UserId};
use crate::profile::{ProfileRecord, ProfileStore, ProfileUpdate};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the scripted identity client's notification feed.
const EVENT_FEED_CAPACITY: usize = 64;

/// A profile store backed by an in-memory map.
///
/// Enforces the one-record-per-identity invariant the way a real store
/// would: inserts collide, updates require an existing row.
#[derive(Default)]
pub struct InMemoryProfileStore {
    rows: Mutex<HashMap<UserId, ProfileRecord>>,
}

impl InMemoryProfileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing insert semantics.
    pub fn seed(&self, record: ProfileRecord) {
        self.rows
            .lock()
            .expect("lock poisoned")
            .insert(record.id.clone(), record);
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.lock().expect("lock poisoned").len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn insert(&self, record: &ProfileRecord) -> StoreResult<()> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        if rows.contains_key(&record.id) {
            return Err(StoreError::Conflict(record.id.as_str().to_string()));
        }
        rows.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &UserId) -> StoreResult<Option<ProfileRecord>> {
        Ok(self.rows.lock().expect("lock poisoned").get(id).cloned())
    }

    async fn update(&self, id: &UserId, update: &ProfileUpdate) -> StoreResult<()> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        let record = rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.as_str().to_string()))?;
        update.apply_to_record(record);
        Ok(())
    }
}

/// One scripted reply for a `find_by_id` call.
#[derive(Debug, Clone)]
pub enum StoreReply {
    /// Return the record.
    Found(ProfileRecord),
    /// Return `Ok(None)` — row not visible yet.
    Missing,
    /// Return a store error.
    Fail(StoreError),
    /// Sleep, then return the record. For interleaving tests.
    FoundAfter(Duration, ProfileRecord),
}

/// A profile store with queued per-call outcomes.
///
/// `find_by_id` pops from the reply queue, falling back to the default
/// reply (initially [`StoreReply::Missing`]) once the queue is drained.
/// Inserts and updates pop from their own result queues, defaulting to
/// `Ok(())`. Every call is recorded for assertions.
#[derive(Default)]
pub struct ScriptedProfileStore {
    find_replies: Mutex<VecDeque<StoreReply>>,
    default_find: Mutex<Option<StoreReply>>,
    insert_results: Mutex<VecDeque<StoreResult<()>>>,
    update_results: Mutex<VecDeque<(Duration, StoreResult<()>)>>,
    find_calls: Mutex<Vec<UserId>>,
    inserted: Mutex<Vec<ProfileRecord>>,
    updates: Mutex<Vec<(UserId, ProfileUpdate)>>,
}

impl ScriptedProfileStore {
    /// Create a store that answers every lookup with "not visible yet".
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next unanswered `find_by_id` call.
    pub fn queue_find(&self, reply: StoreReply) {
        self.find_replies
            .lock()
            .expect("lock poisoned")
            .push_back(reply);
    }

    /// Set the reply used once the queue is drained.
    pub fn set_default_find(&self, reply: StoreReply) {
        *self.default_find.lock().expect("lock poisoned") = Some(reply);
    }

    /// Queue a result for the next `insert` call.
    pub fn queue_insert(&self, result: StoreResult<()>) {
        self.insert_results
            .lock()
            .expect("lock poisoned")
            .push_back(result);
    }

    /// Queue a result for the next `update` call.
    pub fn queue_update(&self, result: StoreResult<()>) {
        self.queue_update_after(Duration::ZERO, result);
    }

    /// Queue a result for the next `update` call, delivered after a delay.
    /// For interleaving tests.
    pub fn queue_update_after(&self, delay: Duration, result: StoreResult<()>) {
        self.update_results
            .lock()
            .expect("lock poisoned")
            .push_back((delay, result));
    }

    /// Number of `find_by_id` calls observed.
    pub fn find_count(&self) -> usize {
        self.find_calls.lock().expect("lock poisoned").len()
    }

    /// Records passed to `insert`, in call order.
    pub fn inserted(&self) -> Vec<ProfileRecord> {
        self.inserted.lock().expect("lock poisoned").clone()
    }

    /// Updates passed to `update`, in call order.
    pub fn updates(&self) -> Vec<(UserId, ProfileUpdate)> {
        self.updates.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ProfileStore for ScriptedProfileStore {
    async fn insert(&self, record: &ProfileRecord) -> StoreResult<()> {
        self.inserted
            .lock()
            .expect("lock poisoned")
            .push(record.clone());
        self.insert_results
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn find_by_id(&self, id: &UserId) -> StoreResult<Option<ProfileRecord>> {
        self.find_calls
            .lock()
            .expect("lock poisoned")
            .push(id.clone());

        // Pop outside the sleep so the lock is never held across an await.
        let reply = {
            let mut queue = self.find_replies.lock().expect("lock poisoned");
            queue.pop_front().unwrap_or_else(|| {
                self.default_find
                    .lock()
                    .expect("lock poisoned")
                    .clone()
                    .unwrap_or(StoreReply::Missing)
            })
        };

        match reply {
            StoreReply::Found(record) => Ok(Some(record)),
            StoreReply::Missing => Ok(None),
            StoreReply::Fail(err) => Err(err),
            StoreReply::FoundAfter(delay, record) => {
                tokio::time::sleep(delay).await;
                Ok(Some(record))
            }
        }
    }

    async fn update(&self, id: &UserId, update: &ProfileUpdate) -> StoreResult<()> {
        self.updates
            .lock()
            .expect("lock poisoned")
            .push((id.clone(), update.clone()));
        let (delay, result) = self
            .update_results
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or((Duration::ZERO, Ok(())));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

/// An identity client with queued call results and a hand-driven feed.
///
/// Tests script the outcome of each auth call and emit notifications
/// explicitly, so delivery order is fully under the test's control.
pub struct ScriptedIdentityClient {
    events: broadcast::Sender<SessionEvent>,
    current_session: Mutex<AuthResult<Option<AuthSession>>>,
    sign_in_results: Mutex<VecDeque<AuthResult<AuthSession>>>,
    sign_up_results: Mutex<VecDeque<AuthResult<Option<AuthSession>>>>,
    sign_out_results: Mutex<VecDeque<AuthResult<()>>>,
    sign_out_calls: Mutex<usize>,
}

impl ScriptedIdentityClient {
    /// Create a client with no existing session and empty result queues.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        Self {
            events,
            current_session: Mutex::new(Ok(None)),
            sign_in_results: Mutex::new(VecDeque::new()),
            sign_up_results: Mutex::new(VecDeque::new()),
            sign_out_results: Mutex::new(VecDeque::new()),
            sign_out_calls: Mutex::new(0),
        }
    }

    /// Set the result of `current_session` queries.
    pub fn set_current_session(&self, result: AuthResult<Option<AuthSession>>) {
        *self.current_session.lock().expect("lock poisoned") = result;
    }

    /// Queue a result for the next `sign_in` call.
    pub fn queue_sign_in(&self, result: AuthResult<AuthSession>) {
        self.sign_in_results
            .lock()
            .expect("lock poisoned")
            .push_back(result);
    }

    /// Queue a result for the next `sign_up` call.
    pub fn queue_sign_up(&self, result: AuthResult<Option<AuthSession>>) {
        self.sign_up_results
            .lock()
            .expect("lock poisoned")
            .push_back(result);
    }

    /// Queue a result for the next `sign_out` call.
    pub fn queue_sign_out(&self, result: AuthResult<()>) {
        self.sign_out_results
            .lock()
            .expect("lock poisoned")
            .push_back(result);
    }

    /// Deliver a notification on the feed.
    pub fn emit(&self, event: SessionEvent) {
        // Send fails only when no receiver is subscribed yet.
        let _ = self.events.send(event);
    }

    /// Number of `sign_out` calls observed.
    pub fn sign_out_count(&self) -> usize {
        *self.sign_out_calls.lock().expect("lock poisoned")
    }
}

impl Default for ScriptedIdentityClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityClient for ScriptedIdentityClient {
    async fn current_session(&self) -> AuthResult<Option<AuthSession>> {
        self.current_session.lock().expect("lock poisoned").clone()
    }

    async fn sign_in(&self, _credential: &Credential) -> AuthResult<AuthSession> {
        self.sign_in_results
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or(Err(AuthError::Network("unscripted sign_in".to_string())))
    }

    async fn sign_up(&self, _credential: &Credential) -> AuthResult<Option<AuthSession>> {
        self.sign_up_results
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or(Err(AuthError::Network("unscripted sign_up".to_string())))
    }

    async fn sign_out(&self) -> AuthResult<()> {
        *self.sign_out_calls.lock().expect("lock poisoned") += 1;
        self.sign_out_results
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
