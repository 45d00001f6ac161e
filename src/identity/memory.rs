//! In-process identity provider.
//!
//! Behaves like the hosted service from the controller's point of view:
//! credentials are checked against salted digests, every sign-in, refresh and
//! sign-out is pushed to subscribers, and the current session lives on the
//! provider side. Failure hooks let callers simulate outages and server-side
//! revocation.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ChangeKind, IdentityService, IdentityUser, Session, SessionChange};
use crate::error::AuthError;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

struct Account {
    id: String,
    email: String,
    salt: String,
    password_digest: String,
}

#[derive(Default)]
struct ProviderState {
    /// Keyed by lowercased email
    accounts: HashMap<String, Account>,
    current: Option<Session>,
    offline: bool,
    refresh_failures: VecDeque<AuthError>,
    sign_out_failure: Option<AuthError>,
    latency: Duration,
}

#[derive(Default)]
struct CallCounters {
    sign_in: AtomicUsize,
    sign_up: AtomicUsize,
    sign_out: AtomicUsize,
    get_session: AtomicUsize,
    refresh_session: AtomicUsize,
}

pub struct MemoryIdentityService {
    state: Mutex<ProviderState>,
    changes: broadcast::Sender<SessionChange>,
    session_ttl: Duration,
    calls: CallCounters,
}

impl Default for MemoryIdentityService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityService {
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(ProviderState::default()),
            changes,
            session_ttl: Duration::from_secs(3600),
            calls: CallCounters::default(),
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Register an account directly, bypassing validation. Returns the user id.
    pub fn register(&self, email: &str, password: &str) -> String {
        let account = new_account(email, password);
        let id = account.id.clone();
        self.state
            .lock()
            .accounts
            .insert(email.to_lowercase(), account);
        id
    }

    /// Simulate a network outage: every call fails with a transient error
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Delay `get_session` and `refresh_session` responses
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Make the next `refresh_session` call fail with `error`
    pub fn fail_next_refresh(&self, error: AuthError) {
        self.state.lock().refresh_failures.push_back(error);
    }

    /// Make the next `sign_out` call fail with `error`
    pub fn fail_next_sign_out(&self, error: AuthError) {
        self.state.lock().sign_out_failure = Some(error);
    }

    /// Drop the provider-side session without notifying anyone, as when a
    /// token is revoked or expires while the tab sleeps
    pub fn revoke_session(&self) {
        self.state.lock().current = None;
    }

    /// Sign `email` in as if it happened in another tab: the provider session
    /// is replaced and subscribers are notified.
    pub fn sign_in_elsewhere(&self, email: &str) -> Option<Session> {
        let session = self.store_session_silently(email)?;
        self.publish(ChangeKind::SignedIn, Some(session.clone()));
        Some(session)
    }

    /// Replace the provider session without a notification, as when another
    /// tab writes the shared token and only a storage event reaches us
    pub fn store_session_silently(&self, email: &str) -> Option<Session> {
        let mut state = self.state.lock();
        let account = state.accounts.get(&email.to_lowercase())?;
        let session = issue_session(account.id.clone(), account.email.clone(), self.session_ttl);
        state.current = Some(session.clone());
        Some(session)
    }

    /// Push an arbitrary notification to subscribers
    pub fn push_change(&self, change: SessionChange) {
        if self.changes.send(change).is_err() {
            debug!("No subscribers for session change");
        }
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state.lock().current.clone()
    }

    pub fn sign_in_calls(&self) -> usize {
        self.calls.sign_in.load(Ordering::SeqCst)
    }

    pub fn sign_up_calls(&self) -> usize {
        self.calls.sign_up.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.calls.sign_out.load(Ordering::SeqCst)
    }

    pub fn get_session_calls(&self) -> usize {
        self.calls.get_session.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.calls.refresh_session.load(Ordering::SeqCst)
    }

    pub fn account_count(&self) -> usize {
        self.state.lock().accounts.len()
    }

    fn publish(&self, kind: ChangeKind, session: Option<Session>) {
        self.push_change(SessionChange::new(kind, session));
    }

    fn check_online(&self) -> Result<Duration, AuthError> {
        let state = self.state.lock();
        if state.offline {
            return Err(AuthError::transient("Failed to fetch"));
        }
        Ok(state.latency)
    }

    async fn simulate_latency(&self) -> Result<(), AuthError> {
        let latency = self.check_online()?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityService for MemoryIdentityService {
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        self.calls.sign_in.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let session = {
            let mut state = self.state.lock();
            let account = state
                .accounts
                .get(&email.to_lowercase())
                .filter(|account| verify_password(password, &account.salt, &account.password_digest))
                .ok_or_else(|| AuthError::validation("Invalid login credentials"))?;

            let session = issue_session(account.id.clone(), account.email.clone(), self.session_ttl);
            state.current = Some(session.clone());
            session
        };

        self.publish(ChangeKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<String, AuthError> {
        self.calls.sign_up.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let mut state = self.state.lock();
        let key = email.to_lowercase();
        if state.accounts.contains_key(&key) {
            return Err(AuthError::validation("User already registered"));
        }

        let account = new_account(email, password);
        let id = account.id.clone();
        state.accounts.insert(key, account);
        Ok(id)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.calls.sign_out.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        if let Some(error) = self.state.lock().sign_out_failure.take() {
            return Err(error);
        }

        self.state.lock().current = None;
        self.publish(ChangeKind::SignedOut, None);
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, AuthError> {
        self.calls.get_session.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await?;

        let state = self.state.lock();
        Ok(state
            .current
            .clone()
            .filter(|session| !session.is_expired(Utc::now())))
    }

    async fn refresh_session(&self) -> Result<Option<Session>, AuthError> {
        self.calls.refresh_session.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await?;

        let refreshed = {
            let mut state = self.state.lock();
            if let Some(error) = state.refresh_failures.pop_front() {
                return Err(error);
            }

            let Some(user) = state.current.as_ref().and_then(|s| s.user.clone()) else {
                return Ok(None);
            };

            let session = issue_session(user.id, user.email, self.session_ttl);
            state.current = Some(session.clone());
            session
        };

        self.publish(ChangeKind::TokenRefreshed, Some(refreshed.clone()));
        Ok(Some(refreshed))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }
}

fn new_account(email: &str, password: &str) -> Account {
    let salt = generate_token();
    Account {
        id: uuid::Uuid::new_v4().to_string(),
        email: email.to_string(),
        password_digest: digest_password(password, &salt),
        salt,
    }
}

fn issue_session(user_id: String, email: String, ttl: Duration) -> Session {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
    Session {
        access_token: generate_token(),
        refresh_token: generate_token(),
        expires_at: Utc::now() + ttl,
        user: Some(IdentityUser { id: user_id, email }),
    }
}

/// Generate a random token
fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

fn digest_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn verify_password(password: &str, salt: &str, expected: &str) -> bool {
    let actual = digest_password(password, salt);
    actual.as_bytes().ct_eq(expected.as_bytes()).into()
}
