//! Session controller.
//!
//! Owns the authentication session and the signed-in user's profile, keeps
//! them in sync with the identity provider, and hands consumers read-only
//! [`AuthView`] snapshots through a watch channel.
//!
//! Session identity is only ever established by the provider's change
//! notifications (or a revalidation result); `sign_in` just starts the remote
//! call. Every background task shares one cancellation token, and every state
//! mutation checks it first, so nothing lands after `dispose`.

mod state;
#[cfg(test)]
mod tests;

pub use state::{
    AuthPhase, AuthView, ControllerState, FetchTicket, ProfileApply, RefreshApply, RefreshStart,
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{
    matches_storage_key, ActivityClock, Decision, HostSignal, RevalidationPolicy, SkipReason,
    Trigger, Visibility,
};
use crate::config::SessionConfig;
use crate::error::{AuthError, ControllerError, ProfileError, SignUpError};
use crate::identity::{ChangeKind, IdentityService, Session, SessionChange};
use crate::profile::{
    fetch_with_retry, FetchOutcome, NewProfile, Profile, ProfileStore, ProfileUpdate,
    RetryPolicy, SignUpRequest,
};
use crate::telemetry;
use crate::validation::{validate_email, validate_name};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Notable transitions, for consumers that react to edges rather than state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEvent {
    SessionRefreshed,
    /// The provider dropped the session; the user has to sign in again
    SessionExpired,
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidateOutcome {
    /// A fresh session replaced the current one
    Refreshed,
    /// No local session, but the provider had one (e.g. set by another tab)
    Restored,
    /// The provider confirmed the session is gone; state was cleared
    Invalidated,
    /// Transient failure; the next trigger will try again
    Deferred,
    /// Signed out, and the provider has nothing to restore
    NoSession,
    AlreadyRunning,
    /// The state moved on while the call was in flight; result dropped
    Superseded,
    Disposed,
}

impl RevalidateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevalidateOutcome::Refreshed => "refreshed",
            RevalidateOutcome::Restored => "restored",
            RevalidateOutcome::Invalidated => "invalidated",
            RevalidateOutcome::Deferred => "deferred",
            RevalidateOutcome::NoSession => "no_session",
            RevalidateOutcome::AlreadyRunning => "already_running",
            RevalidateOutcome::Superseded => "superseded",
            RevalidateOutcome::Disposed => "disposed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Bookkeeping only (activity or visibility recorded)
    Recorded,
    /// Not relevant to the session
    Ignored,
    Skipped(SkipReason),
    /// A later storage notification took over
    Debounced,
    Revalidated(RevalidateOutcome),
}

pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<dyn IdentityService>,
    profiles: Arc<dyn ProfileStore>,
    config: SessionConfig,
    policy: RevalidationPolicy,
    retry: RetryPolicy,
    state: Mutex<ControllerState>,
    view_tx: watch::Sender<AuthView>,
    events_tx: broadcast::Sender<AuthEvent>,
    activity: Mutex<ActivityClock>,
    visibility: Mutex<Visibility>,
    storage_seq: AtomicU64,
    /// Generation of the live change subscription. Read and bumped only
    /// while holding `state`.
    subscription: AtomicU64,
    revalidation: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum ChangeApply {
    /// Received on a subscription that a local sign-out replaced
    Replaced,
    Ignored,
    Applied {
        signed_out: bool,
        ticket: Option<FetchTicket>,
    },
}

impl SessionController {
    /// Create the controller and start its background tasks. Must be called
    /// from within a Tokio runtime.
    pub fn start(
        identity: Arc<dyn IdentityService>,
        profiles: Arc<dyn ProfileStore>,
        config: SessionConfig,
    ) -> Self {
        let initial = ControllerState::new();
        let (view_tx, _view_rx) = watch::channel(initial.view());
        let (events_tx, _events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            policy: RevalidationPolicy::from_session_config(&config),
            retry: RetryPolicy::from_session_config(&config),
            identity,
            profiles,
            config,
            state: Mutex::new(initial),
            view_tx,
            events_tx,
            activity: Mutex::new(ActivityClock::new()),
            visibility: Mutex::new(Visibility::Visible),
            storage_seq: AtomicU64::new(0),
            subscription: AtomicU64::new(0),
            revalidation: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        // Subscribe before the initial check so nothing pushed in between is lost
        let changes = inner.identity.subscribe();
        inner.spawn_tracked(Arc::clone(&inner).listen_for_changes(changes, 0));
        inner.spawn_tracked(Arc::clone(&inner).initialize());
        inner.spawn_tracked(Arc::clone(&inner).run_periodic());

        info!(
            init_timeout_secs = inner.config.init_timeout_secs,
            focus_threshold_secs = inner.config.focus_threshold_secs,
            periodic_interval_secs = inner.config.periodic_interval_secs,
            "Session controller started"
        );

        Self { inner }
    }

    /// Current state
    pub fn snapshot(&self) -> AuthView {
        self.inner.view_tx.borrow().clone()
    }

    /// Watch state changes. The receiver sees the latest view, not every step.
    pub fn subscribe(&self) -> watch::Receiver<AuthView> {
        self.inner.view_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Wait for the initial session check to settle. The profile may still
    /// be loading when this returns.
    pub async fn ready(&self) -> AuthView {
        let mut rx = self.subscribe();
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => self.snapshot(),
            view = rx.wait_for(|view| view.phase != AuthPhase::Initializing) => {
                view.map(|view| view.clone()).unwrap_or_else(|_| self.snapshot())
            }
        }
    }

    /// Start a sign-in. On success the provider's notification moves the
    /// controller to authenticated; the returned session is informational.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        validate_email(email).map_err(AuthError::Validation)?;
        if password.is_empty() {
            return Err(AuthError::validation("Password is required"));
        }

        match self.inner.identity.sign_in(email, password).await {
            Ok(session) => {
                telemetry::record_sign_in(true);
                info!(user_id = session.user_id().unwrap_or_default(), "Signed in");
                Ok(session)
            }
            Err(e) => {
                telemetry::record_sign_in(false);
                warn!(error = %e, "Sign-in failed");
                Err(e)
            }
        }
    }

    /// Create an account and its profile. Returns the new user id.
    pub async fn sign_up(&self, request: &SignUpRequest) -> Result<String, SignUpError> {
        request.validate()?;

        if let Some(username) = request.student_username() {
            match self.inner.profiles.student_username_exists(&username).await {
                Ok(false) => {}
                Ok(true) => {
                    debug!(username = %username, "Sign-up rejected, username taken");
                    return Err(AuthError::validation("Username already exists").into());
                }
                Err(e) => {
                    warn!(error = %e, "Could not check username availability");
                    return Err(AuthError::transient(format!(
                        "Could not check username availability: {}",
                        e
                    ))
                    .into());
                }
            }
        }

        let user_id = self
            .inner
            .identity
            .sign_up(&request.email, &request.password)
            .await
            .inspect_err(|e| warn!(error = %e, "Sign-up rejected by identity provider"))?;

        let new_profile = request.to_new_profile(&user_id);
        match self.inner.profiles.create(&new_profile).await {
            Ok(profile) => {
                info!(
                    user_id = %user_id,
                    user_type = profile.user_type.as_str(),
                    "Account created"
                );
                self.inner.mutate(|state| state.adopt_profile(profile));
                Ok(user_id)
            }
            Err(source) => {
                error!(
                    user_id = %user_id,
                    error = %source,
                    "Account created but profile creation failed"
                );
                Err(SignUpError::ProfileIncomplete { user_id, source })
            }
        }
    }

    /// Retry the profile-creation step after a partial sign-up
    pub async fn complete_profile(&self, profile: &NewProfile) -> Result<Profile, ControllerError> {
        validate_name(&profile.first_name, "First name").map_err(ProfileError::Validation)?;
        validate_name(&profile.last_name, "Last name").map_err(ProfileError::Validation)?;

        let created = self.inner.profiles.create(profile).await?;
        info!(user_id = %created.id, "Profile created");
        self.inner.mutate(|state| state.adopt_profile(created.clone()));
        Ok(created)
    }

    /// Edit the signed-in user's profile
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<Profile, ControllerError> {
        if update.is_empty() {
            return Err(ProfileError::Validation("Nothing to update".to_string()).into());
        }
        update.validate()?;

        if self.is_disposed() {
            return Err(ControllerError::Disposed);
        }
        let user_id = self
            .inner
            .state
            .lock()
            .user_id()
            .map(str::to_string)
            .ok_or(ControllerError::NotAuthenticated)?;

        let updated = self.inner.profiles.update(&user_id, update).await?;
        match self.inner.mutate(|state| state.adopt_profile(updated.clone())) {
            None => return Err(ControllerError::Disposed),
            Some(false) => {
                telemetry::record_stale_result("profile_update");
                debug!(user_id = %user_id, "User changed during profile update");
            }
            Some(true) => debug!(user_id = %user_id, "Profile updated"),
        }
        Ok(updated)
    }

    /// Fetch the signed-in user's profile again, bypassing the cache
    pub async fn refresh_profile(&self) -> Result<Option<Profile>, ControllerError> {
        let ticket = self
            .inner
            .mutate(|state| state.force_profile_fetch())
            .ok_or(ControllerError::Disposed)?
            .ok_or(ControllerError::NotAuthenticated)?;

        let outcome = fetch_with_retry(
            self.inner.profiles.as_ref(),
            &ticket.user_id,
            self.inner.retry,
            &self.inner.shutdown,
        )
        .await;

        let failure = match &outcome {
            FetchOutcome::Failed(e) => Some(e.clone()),
            FetchOutcome::Cancelled => return Err(ControllerError::Disposed),
            _ => None,
        };
        self.inner.finish_profile_fetch(&ticket, outcome);
        if let Some(e) = failure {
            return Err(e.into());
        }

        Ok(self
            .snapshot()
            .profile
            .filter(|profile| profile.id == ticket.user_id))
    }

    /// Sign out. Local state is cleared before the provider is contacted;
    /// a failing remote call is logged and otherwise ignored.
    ///
    /// Changes already queued on the current subscription predate the
    /// sign-out, so the subscription is replaced and its backlog dropped.
    pub async fn sign_out(&self) {
        let inner = &self.inner;
        let signed_out = inner.mutate(|state| {
            let had_user = state.user_id().is_some();
            let changes = inner.identity.subscribe();
            let generation = inner.subscription.fetch_add(1, Ordering::SeqCst) + 1;
            state.sign_out();
            (had_user, state.epoch(), changes, generation)
        });

        let mut epoch = None;
        if let Some((had_user, signed_out_epoch, changes, generation)) = signed_out {
            inner.spawn_tracked(Arc::clone(inner).listen_for_changes(changes, generation));
            epoch = Some(signed_out_epoch);
            if had_user {
                inner.emit(AuthEvent::SignedOut);
                info!("Signed out locally");
            }
        }

        match inner.identity.sign_out().await {
            Ok(()) => {
                telemetry::record_sign_out(true);
                // The provider dropped its session too; later ones are new
                if let Some(epoch) = epoch {
                    inner.mutate(|state| state.confirm_sign_out(epoch));
                }
            }
            Err(e) => {
                telemetry::record_sign_out(false);
                warn!(error = %e, "Remote sign-out failed, local session already cleared");
            }
        }
    }

    /// Re-check the session with the provider now, without gating
    pub async fn revalidate(&self) -> RevalidateOutcome {
        self.inner.revalidate(false).await
    }

    /// Feed a host environment event through the revalidation gate
    pub async fn handle_signal(&self, signal: HostSignal) -> SignalOutcome {
        self.inner.handle_signal(signal).await
    }

    /// Consume host signals from a channel for the lifetime of the controller
    pub fn attach_signals(&self, mut signals: mpsc::Receiver<HostSignal>) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    signal = signals.recv() => signal,
                };
                let Some(signal) = signal else {
                    debug!("Host signal channel closed");
                    break;
                };

                if let HostSignal::Interaction { .. } = signal {
                    inner.activity.lock().touch();
                    continue;
                }

                // Storage signals wait out their debounce; keep the loop free
                let worker = Arc::clone(&inner);
                tokio::spawn(async move {
                    worker.handle_signal(signal).await;
                });
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    /// Stop all timers and listeners. Results that arrive afterwards are dropped.
    pub fn dispose(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        info!("Session controller disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks.lock().push(handle);
    }

    /// Run `f` against the state and publish the new view. Returns `None`
    /// once the controller is disposed.
    fn mutate<R>(&self, f: impl FnOnce(&mut ControllerState) -> R) -> Option<R> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        let mut state = self.state.lock();
        let result = f(&mut state);
        let view = state.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
        Some(result)
    }

    fn emit(&self, event: AuthEvent) {
        if self.events_tx.send(event).is_err() {
            debug!(event = ?event, "No subscribers for auth event");
        }
    }

    async fn initialize(self: Arc<Self>) {
        let timeout = self.config.init_timeout();
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            result = tokio::time::timeout(timeout, self.identity.get_session()) => result,
        };

        let session = match result {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(error = %e, "Initial session check failed, continuing signed out");
                None
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Initial session check timed out, continuing signed out"
                );
                self.mutate(|state| state.expire_initialization());
                return;
            }
        };

        match self.mutate(|state| state.apply_initial(session)) {
            Some(Some(Some(ticket))) => {
                info!(user_id = %ticket.user_id, "Existing session found");
                self.spawn_profile_fetch(ticket);
            }
            Some(Some(None)) => debug!("No existing session"),
            Some(None) => debug!("Initial session check superseded by a pushed change"),
            None => {}
        }
    }

    async fn listen_for_changes(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<SessionChange>,
        generation: u64,
    ) {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = changes.recv() => received,
            };

            match received {
                Ok(change) => {
                    if !self.apply_change(change, generation) {
                        debug!(generation, "Subscription replaced, stopping listener");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_))
                    if self.subscription.load(Ordering::SeqCst) != generation =>
                {
                    debug!(generation, "Subscription replaced, stopping listener");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed session changes, resynchronizing");
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move {
                        inner.revalidate(true).await;
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Session change channel closed");
                    break;
                }
            }
        }
    }

    /// Returns false once `generation` is no longer the live subscription
    fn apply_change(self: &Arc<Self>, change: SessionChange, generation: u64) -> bool {
        let kind = change.kind;
        let session = change.session;
        debug!(
            kind = ?kind,
            user_id = session.as_ref().and_then(Session::user_id).unwrap_or_default(),
            "Session change received"
        );

        let applied = self.mutate(|state| {
            if self.subscription.load(Ordering::SeqCst) != generation {
                return ChangeApply::Replaced;
            }
            // After a local sign-out only an explicit sign-in counts
            if state.is_signed_out_locally() && session.is_some() && kind != ChangeKind::SignedIn {
                return ChangeApply::Ignored;
            }
            let had_user = state.user_id().is_some();
            let ticket = state.apply_session(session);
            ChangeApply::Applied {
                signed_out: had_user && state.user_id().is_none(),
                ticket,
            }
        });

        match applied {
            None => false,
            Some(ChangeApply::Replaced) => {
                debug!(kind = ?kind, "Dropping change queued before local sign-out");
                false
            }
            Some(ChangeApply::Ignored) => {
                debug!(kind = ?kind, "Ignoring pushed session after local sign-out");
                true
            }
            Some(ChangeApply::Applied { signed_out, ticket }) => {
                if signed_out {
                    info!("Signed out by provider");
                    self.emit(AuthEvent::SignedOut);
                }
                if let Some(ticket) = ticket {
                    self.spawn_profile_fetch(ticket);
                }
                true
            }
        }
    }

    fn spawn_profile_fetch(self: &Arc<Self>, ticket: FetchTicket) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = fetch_with_retry(
                inner.profiles.as_ref(),
                &ticket.user_id,
                inner.retry,
                &inner.shutdown,
            )
            .await;
            inner.finish_profile_fetch(&ticket, outcome);
        });
    }

    fn finish_profile_fetch(&self, ticket: &FetchTicket, outcome: FetchOutcome) {
        let label = match &outcome {
            FetchOutcome::Found(_) => "found",
            FetchOutcome::Missing => "missing",
            FetchOutcome::Failed(_) => "failed",
            FetchOutcome::Cancelled => return,
        };
        telemetry::record_profile_fetch(label);

        match self.mutate(|state| state.finish_profile_fetch(ticket, outcome)) {
            None => debug!(user_id = %ticket.user_id, "Controller disposed, dropping profile"),
            Some(ProfileApply::Stale) => {
                telemetry::record_stale_result("profile");
                debug!(user_id = %ticket.user_id, "Dropping stale profile result");
            }
            Some(ProfileApply::Applied) => info!(user_id = %ticket.user_id, "Profile loaded"),
            Some(ProfileApply::Settled) => {
                debug!(user_id = %ticket.user_id, outcome = label, "Continuing without a profile")
            }
        }
    }

    /// Only one revalidation runs at a time. With `wait_if_busy` the caller
    /// queues behind the one in flight instead of getting `AlreadyRunning`.
    async fn revalidate(self: &Arc<Self>, wait_if_busy: bool) -> RevalidateOutcome {
        if self.shutdown.is_cancelled() {
            return RevalidateOutcome::Disposed;
        }
        let _running = match self.revalidation.try_lock() {
            Ok(guard) => guard,
            Err(_) if wait_if_busy => {
                debug!("Revalidation in flight, queueing another");
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return RevalidateOutcome::Disposed,
                    guard = self.revalidation.lock() => guard,
                }
            }
            Err(_) => return RevalidateOutcome::AlreadyRunning,
        };

        let outcome = self.run_revalidation().await;
        telemetry::record_revalidation(outcome.as_str());
        outcome
    }

    async fn run_revalidation(self: &Arc<Self>) -> RevalidateOutcome {
        let Some(start) = self.mutate(|state| state.begin_refresh()) else {
            return RevalidateOutcome::Disposed;
        };
        if !start.has_session {
            return self.restore_session(start).await;
        }

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return RevalidateOutcome::Disposed,
            result = self.identity.refresh_session() => result,
        };

        match result {
            Ok(Some(session)) => {
                let expires_at = session.expires_at;
                match self.mutate(|state| state.finish_refresh(start.epoch, session)) {
                    None => RevalidateOutcome::Disposed,
                    Some(RefreshApply::Stale) => {
                        telemetry::record_stale_result("refresh");
                        debug!("Dropping refresh result, session changed meanwhile");
                        RevalidateOutcome::Superseded
                    }
                    Some(RefreshApply::Applied(ticket)) => {
                        if let Some(ticket) = ticket {
                            self.spawn_profile_fetch(ticket);
                        }
                        debug!(expires_at = %expires_at, "Session refreshed");
                        self.emit(AuthEvent::SessionRefreshed);
                        RevalidateOutcome::Refreshed
                    }
                }
            }
            Ok(None) => self.invalidate(start.epoch, "provider reports no session"),
            Err(e) if e.is_authoritative() => self.invalidate(start.epoch, &e.to_string()),
            Err(e) => {
                self.mutate(|state| state.abort_refresh(start.epoch));
                warn!(error = %e, "Session refresh failed, will retry on next check");
                RevalidateOutcome::Deferred
            }
        }
    }

    async fn restore_session(self: &Arc<Self>, start: RefreshStart) -> RevalidateOutcome {
        if start.restore_blocked {
            return RevalidateOutcome::NoSession;
        }

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return RevalidateOutcome::Disposed,
            result = self.identity.get_session() => result,
        };

        match result {
            Ok(Some(session)) if session.user_id().is_some() => {
                match self.mutate(|state| state.restore(start.epoch, session)) {
                    None => RevalidateOutcome::Disposed,
                    Some(RefreshApply::Stale) => {
                        telemetry::record_stale_result("restore");
                        RevalidateOutcome::Superseded
                    }
                    Some(RefreshApply::Applied(ticket)) => {
                        if let Some(ticket) = ticket {
                            info!(user_id = %ticket.user_id, "Session restored");
                            self.spawn_profile_fetch(ticket);
                        }
                        RevalidateOutcome::Restored
                    }
                }
            }
            Ok(_) => RevalidateOutcome::NoSession,
            Err(e) => {
                warn!(error = %e, "Session lookup failed, will retry on next check");
                RevalidateOutcome::Deferred
            }
        }
    }

    fn invalidate(&self, epoch: u64, reason: &str) -> RevalidateOutcome {
        match self.mutate(|state| state.invalidate(epoch)) {
            None => RevalidateOutcome::Disposed,
            Some(false) => {
                telemetry::record_stale_result("invalidation");
                RevalidateOutcome::Superseded
            }
            Some(true) => {
                warn!(reason = %reason, "Session invalidated by provider, please sign in again");
                self.emit(AuthEvent::SessionExpired);
                RevalidateOutcome::Invalidated
            }
        }
    }

    async fn handle_signal(self: &Arc<Self>, signal: HostSignal) -> SignalOutcome {
        if self.shutdown.is_cancelled() {
            return SignalOutcome::Ignored;
        }

        match signal {
            HostSignal::Interaction { .. } => {
                self.activity.lock().touch();
                SignalOutcome::Recorded
            }
            HostSignal::VisibilityChanged { visibility } => {
                let previous = std::mem::replace(&mut *self.visibility.lock(), visibility);
                if visibility == Visibility::Visible && previous == Visibility::Hidden {
                    self.gate(Trigger::BecameVisible).await
                } else {
                    SignalOutcome::Recorded
                }
            }
            HostSignal::Focus => self.gate(Trigger::Focus).await,
            HostSignal::StorageChanged { key } => {
                if !matches_storage_key(&self.config.storage_key_pattern, &key) {
                    return SignalOutcome::Ignored;
                }

                let seq = self.storage_seq.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return SignalOutcome::Ignored,
                    _ = tokio::time::sleep(self.config.storage_debounce()) => {}
                }
                if self.storage_seq.load(Ordering::SeqCst) != seq {
                    return SignalOutcome::Debounced;
                }

                debug!(key = %key, "Auth token changed in another tab");
                self.gate(Trigger::CrossTab).await
            }
        }
    }

    async fn gate(self: &Arc<Self>, trigger: Trigger) -> SignalOutcome {
        let idle = self.activity.lock().idle_for(Instant::now());
        let visibility = *self.visibility.lock();
        let (has_session, expiring) = {
            let state = self.state.lock();
            match state.session() {
                Some(session) if state.user_id().is_some() => (
                    true,
                    session.expires_within(Utc::now(), self.config.refresh_margin()),
                ),
                _ => (false, false),
            }
        };

        let decision = if trigger == Trigger::Periodic && !has_session {
            Decision::Skip(SkipReason::SignedOut)
        } else {
            self.policy.decide(trigger, idle, visibility, expiring)
        };

        match decision {
            Decision::Revalidate => {
                let wait_if_busy = trigger == Trigger::CrossTab;
                SignalOutcome::Revalidated(self.revalidate(wait_if_busy).await)
            }
            Decision::Skip(reason) => {
                telemetry::record_revalidation_skipped(reason.as_str());
                debug!(
                    trigger = ?trigger,
                    reason = reason.as_str(),
                    idle_secs = idle.as_secs(),
                    "Revalidation skipped"
                );
                SignalOutcome::Skipped(reason)
            }
        }
    }

    async fn run_periodic(self: Arc<Self>) {
        let period = self.config.periodic_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.gate(Trigger::Periodic).await;
        }
    }
}
