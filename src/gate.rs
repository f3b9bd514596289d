//! Authorization gate.
//!
//! Keeps a capability snapshot for the current session: whether the principal
//! is an admin, whether they are an overseer, and their display name. The two
//! flags are independent lookups; there is no rank between them.
//!
//! Sessions arrive from two places, the one-off existing-session check at
//! startup and the session-change subscription, and both go through
//! [`AuthGate::apply_session`]. Applying a session only updates state and
//! spawns the lookups, so the notifier is never held up by network I/O.
//! Every application bumps a generation; a resolution that finishes after a
//! newer session (or a sign-out) has been applied is discarded.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{join3, FutureExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::data_service::DataService;
use crate::error::{Error, Result};
use crate::models::{AuthEvent, Capability, Principal, Session};

/// Read-only view handed to consumers.
///
/// While `loading` is true the flags are defaults, not answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub principal: Option<Principal>,
    pub session: Option<Session>,
    pub is_admin: bool,
    pub is_overseer: bool,
    pub loading: bool,
    pub display_name: Option<String>,
}

impl CapabilitySnapshot {
    fn unresolved() -> Self {
        Self {
            principal: None,
            session: None,
            is_admin: false,
            is_overseer: false,
            loading: true,
            display_name: None,
        }
    }

    fn signed_out() -> Self {
        Self {
            loading: false,
            ..Self::unresolved()
        }
    }

    pub fn is_signed_in(&self) -> bool {
        self.principal.is_some()
    }

    pub fn can_access_admin_panel(&self) -> bool {
        self.is_admin || self.is_overseer
    }

    pub fn can_manage_content(&self) -> bool {
        self.is_admin || self.is_overseer
    }

    pub fn can_manage_roles(&self) -> bool {
        self.is_overseer
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::AdminPanel => self.can_access_admin_panel(),
            Capability::ManageContent => self.can_manage_content(),
            Capability::ManageRoles => self.can_manage_roles(),
        }
    }

    /// Fails with `Unresolved` while loading so a default `false` is never read as a denial.
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.loading {
            return Err(Error::Unresolved);
        }
        if !self.is_signed_in() {
            return Err(Error::NotSignedIn);
        }
        if !self.has(capability) {
            return Err(Error::Forbidden(capability));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct GateState {
    snapshot: CapabilitySnapshot,
    generation: u64,
}

struct Inner {
    service: Arc<dyn DataService>,
    state: watch::Sender<GateState>,
}

/// Cheap to clone; all clones share one snapshot.
#[derive(Clone)]
pub struct AuthGate {
    inner: Arc<Inner>,
}

/// Owns the subscription task. Dropping it unsubscribes.
pub struct GateHandle {
    task: JoinHandle<()>,
}

impl GateHandle {
    pub fn stop(self) {}
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Receives every snapshot change.
pub struct SnapshotWatcher {
    rx: watch::Receiver<GateState>,
}

impl SnapshotWatcher {
    pub fn current(&self) -> CapabilitySnapshot {
        self.rx.borrow().snapshot.clone()
    }

    /// Next changed snapshot, or `None` once the gate is gone.
    pub async fn changed(&mut self) -> Option<CapabilitySnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().snapshot.clone())
    }
}

impl AuthGate {
    pub fn new(service: Arc<dyn DataService>) -> Self {
        let (state, _) = watch::channel(GateState {
            snapshot: CapabilitySnapshot::unresolved(),
            generation: 0,
        });
        Self {
            inner: Arc::new(Inner { service, state }),
        }
    }

    /// Subscribe to session changes and check for an existing session.
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) -> GateHandle {
        // subscribe first so nothing published during the initial check is missed
        let events = self.inner.service.subscribe();
        let gate = self.clone();
        let task = tokio::spawn(async move {
            gate.check_existing_session().await;
            gate.listen(events).await;
        });
        GateHandle { task }
    }

    pub fn snapshot(&self) -> CapabilitySnapshot {
        self.inner.state.borrow().snapshot.clone()
    }

    pub fn watch(&self) -> SnapshotWatcher {
        SnapshotWatcher {
            rx: self.inner.state.subscribe(),
        }
    }

    /// Wait until the current snapshot is no longer loading.
    pub async fn wait_resolved(&self) -> CapabilitySnapshot {
        let mut rx = self.inner.state.subscribe();
        let snapshot = match rx.wait_for(|state| !state.snapshot.loading).await {
            Ok(state) => state.snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        snapshot
    }

    pub async fn check_existing_session(&self) {
        let session = match self.inner.service.current_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!("existing session check failed: {e}");
                None
            }
        };
        self.on_session_change(AuthEvent::InitialSession(session));
    }

    /// Session-change entry point. Returns without waiting on any lookup.
    pub fn on_session_change(&self, event: AuthEvent) {
        debug!(event = event.name(), "session change");
        self.apply_session(event.session().cloned());
    }

    /// Shared by both entry points: reset on no session, otherwise record the
    /// session and resolve capabilities in the background.
    pub fn apply_session(&self, session: Option<Session>) {
        let (session, principal) = match session {
            Some(session) => match session.principal().cloned() {
                Some(principal) => (session, principal),
                // a session without a user is kept but grants nothing
                None => return self.reset(Some(session)),
            },
            None => return self.reset(None),
        };

        let mut generation = 0;
        self.inner.state.send_modify(|state| {
            state.generation += 1;
            generation = state.generation;

            let snapshot = &mut state.snapshot;
            let same_principal = snapshot.principal.as_ref().map(|p| &p.id) == Some(&principal.id);
            if !same_principal {
                // a token refresh keeps the current answers while re-resolving
                snapshot.is_admin = false;
                snapshot.is_overseer = false;
                snapshot.display_name = None;
                snapshot.loading = true;
            }
            snapshot.principal = Some(principal.clone());
            snapshot.session = Some(session.clone());
        });

        let gate = self.clone();
        tokio::spawn(async move { gate.resolve(generation, session, principal).await });
    }

    fn reset(&self, session: Option<Session>) {
        self.inner.state.send_modify(|state| {
            state.generation += 1;
            state.snapshot = CapabilitySnapshot {
                session,
                ..CapabilitySnapshot::signed_out()
            };
        });
    }

    async fn listen(&self, mut events: broadcast::Receiver<AuthEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.on_session_change(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed session changes, re-reading current session");
                    self.check_existing_session().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Issue the three lookups together and wait for all of them. Each one
    /// that fails (or panics) falls back to denied / no name on its own.
    async fn resolve(&self, generation: u64, session: Session, principal: Principal) {
        let service = &self.inner.service;
        let (admin, overseer, profile) = join3(
            AssertUnwindSafe(service.is_admin(&session)).catch_unwind(),
            AssertUnwindSafe(service.is_overseer(&session)).catch_unwind(),
            AssertUnwindSafe(service.profile(&session, &principal.id)).catch_unwind(),
        )
        .await;

        let is_admin = settle(admin, "is_admin", &principal).unwrap_or(false);
        let is_overseer = settle(overseer, "is_overseer", &principal).unwrap_or(false);
        let display_name = settle(profile, "profile", &principal)
            .flatten()
            .and_then(|p| p.display_name);

        let applied = self.inner.state.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            let snapshot = &mut state.snapshot;
            snapshot.is_admin = is_admin;
            snapshot.is_overseer = is_overseer;
            snapshot.display_name = display_name.clone();
            snapshot.loading = false;
            true
        });

        if applied {
            info!(principal = %principal.id, is_admin, is_overseer, "capabilities resolved");
        } else {
            debug!(principal = %principal.id, generation, "discarding superseded resolution");
        }
    }
}

fn settle<T>(
    outcome: std::thread::Result<Result<T>>,
    lookup: &str,
    principal: &Principal,
) -> Option<T> {
    match outcome {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(principal = %principal.id, lookup, "lookup failed: {e}");
            None
        }
        Err(_) => {
            warn!(principal = %principal.id, lookup, "lookup panicked");
            None
        }
    }
}
