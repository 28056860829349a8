//! The process-wide session state holder.
//!
//! [`SharedSessionState`] owns the single [`SessionSnapshot`] the view layer
//! observes, the pending-registration slot, and the generation counter used
//! to discard superseded reconciliation attempts.
//!
//! Mutation contract: every change swaps in a whole new snapshot under one
//! lock and broadcasts it; no partial update is ever observable, and no
//! lock is held across an await.

use session_model::{CurrentUser, PendingRegistration, ProfileUpdate, SessionSnapshot, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Capacity of the snapshot change feed.
const STATE_FEED_CAPACITY: usize = 64;

/// Cheap-clone handle to the process-wide session state.
#[derive(Clone)]
pub struct SharedSessionState {
    inner: Arc<StateInner>,
}

struct StateInner {
    snapshot: Mutex<SessionSnapshot>,
    pending: Mutex<Option<PendingRegistration>>,
    /// Generation of the latest auth-affecting event. A reconciliation
    /// commits only while its captured generation is still the latest.
    generation: AtomicU64,
    changes: broadcast::Sender<SessionSnapshot>,
}

impl SharedSessionState {
    /// Create a signed-out, quiescent state.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(STATE_FEED_CAPACITY);
        Self {
            inner: Arc::new(StateInner {
                snapshot: Mutex::new(SessionSnapshot::default()),
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
                changes,
            }),
        }
    }

    /// Current snapshot, cloned.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.lock().expect("lock poisoned").clone()
    }

    /// Subscribe to snapshot changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.inner.changes.subscribe()
    }

    /// Stage registration data for the next signed-in notification.
    /// A second stage before consumption overwrites (last write wins).
    pub fn stage_registration(&self, registration: PendingRegistration) {
        *self.inner.pending.lock().expect("lock poisoned") = Some(registration);
    }

    /// Read and clear the staged registration in one step.
    pub fn take_registration(&self) -> Option<PendingRegistration> {
        self.inner.pending.lock().expect("lock poisoned").take()
    }

    /// Put a taken registration back after a failed profile insert, unless
    /// a newer one was staged in the meantime (the newer one wins).
    pub fn restore_registration(&self, registration: PendingRegistration) {
        let mut slot = self.inner.pending.lock().expect("lock poisoned");
        if slot.is_none() {
            *slot = Some(registration);
        }
    }

    /// Currently staged registration, if any.
    pub fn pending_registration(&self) -> Option<PendingRegistration> {
        self.inner.pending.lock().expect("lock poisoned").clone()
    }

    /// Advance the generation, superseding any in-flight reconciliation.
    /// Returns the new generation for the attempt that caused the bump.
    pub fn bump_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Mark a settling attempt as started. Clears a previous terminal
    /// failure; the user, if any, stays visible until replaced.
    pub fn begin_settling(&self) {
        self.replace(|snapshot| SessionSnapshot {
            current_user: snapshot.current_user.clone(),
            is_settling: true,
            last_error: None,
        });
    }

    /// Mark a settling attempt as abandoned without touching the user
    /// (explicit auth call rejected; the error went to the caller).
    pub fn abandon_settling(&self) {
        self.replace(|snapshot| SessionSnapshot {
            is_settling: false,
            ..snapshot.clone()
        });
    }

    /// Commit a reconciled user. Returns false (and changes nothing) when
    /// the attempt's generation has been superseded.
    pub fn commit_user(&self, generation: u64, user: CurrentUser) -> bool {
        self.replace_if_current(generation, |_| SessionSnapshot {
            current_user: Some(user),
            is_settling: false,
            last_error: None,
        })
    }

    /// Record a terminal failure from the notification-driven path.
    /// Returns false (and changes nothing) when superseded.
    pub fn commit_failure(&self, generation: u64, message: impl Into<String>) -> bool {
        let message = message.into();
        self.replace_if_current(generation, |_| SessionSnapshot {
            current_user: None,
            is_settling: false,
            last_error: Some(message),
        })
    }

    /// Clear everything back to signed-out: user, staged registration,
    /// error. Bumps the generation so in-flight attempts are discarded.
    pub fn reset_signed_out(&self) {
        self.bump_generation();
        *self.inner.pending.lock().expect("lock poisoned") = None;
        self.replace(|_| SessionSnapshot::default());
    }

    /// Merge an accepted profile field into the current user, but only
    /// while that user is still the identity the write was made for.
    /// Returns false when no user is present or a different identity has
    /// settled since; the caller's store row is fine either way, and the
    /// new user's row never carried the field.
    pub fn merge_user_update(&self, id: &UserId, update: &ProfileUpdate) -> bool {
        let changed = {
            let mut snapshot = self.inner.snapshot.lock().expect("lock poisoned");
            match snapshot.current_user.as_ref() {
                Some(user) if user.id == *id => {
                    let mut user = user.clone();
                    update.apply(&mut user);
                    let next = SessionSnapshot {
                        current_user: Some(user),
                        ..snapshot.clone()
                    };
                    *snapshot = next.clone();
                    Some(next)
                }
                _ => None,
            }
        };

        match changed {
            Some(snapshot) => {
                let _ = self.inner.changes.send(snapshot);
                true
            }
            None => false,
        }
    }

    fn replace(&self, build: impl FnOnce(&SessionSnapshot) -> SessionSnapshot) {
        let next = {
            let mut snapshot = self.inner.snapshot.lock().expect("lock poisoned");
            let next = build(&snapshot);
            *snapshot = next.clone();
            next
        };
        let _ = self.inner.changes.send(next);
    }

    fn replace_if_current(
        &self,
        generation: u64,
        build: impl FnOnce(&SessionSnapshot) -> SessionSnapshot,
    ) -> bool {
        let next = {
            let mut snapshot = self.inner.snapshot.lock().expect("lock poisoned");
            // Checked under the snapshot lock so a concurrent bump-and-reset
            // cannot interleave between the check and the swap.
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            let next = build(&snapshot);
            *snapshot = next.clone();
            next
        };
        let _ = self.inner.changes.send(next);
        true
    }
}

impl Default for SharedSessionState {
    fn default() -> Self {
        Self::new()
    }
}
