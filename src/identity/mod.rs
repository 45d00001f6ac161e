//! Identity provider boundary.
//!
//! The hosted auth service is consumed through [`IdentityService`]. Whatever
//! the provider returns is normalized into [`Session`] values and
//! [`AuthError`] variants here, so the controller never sees raw provider
//! error shapes.

mod memory;

pub use memory::MemoryIdentityService;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::AuthError;

/// The account behind a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityUser {
    pub id: String,
    pub email: String,
}

/// Time-bounded proof of authentication issued by the provider.
///
/// Sessions are replaced wholesale on refresh, never edited in place.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: Option<IdentityUser>,
}

impl Session {
    /// Id of the authenticated user. Empty ids count as absent.
    pub fn user_id(&self) -> Option<&str> {
        self.user
            .as_ref()
            .map(|u| u.id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn email(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.email.as_str())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True if the session expires within `margin` of `now` (or already has)
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match chrono::Duration::from_std(margin) {
            Ok(margin) => self.expires_at - now <= margin,
            Err(_) => true,
        }
    }
}

// Keep tokens out of logs
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

/// What caused a pushed session notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    InitialSession,
    SignedIn,
    TokenRefreshed,
    SignedOut,
    UserUpdated,
}

/// A session notification pushed by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub kind: ChangeKind,
    pub session: Option<Session>,
}

impl SessionChange {
    pub fn new(kind: ChangeKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }

    pub fn signed_out() -> Self {
        Self::new(ChangeKind::SignedOut, None)
    }
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Exchange credentials for a session. Success is also pushed to subscribers.
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;
    /// Create an account and return its user id
    async fn sign_up(&self, email: &str, password: &str) -> Result<String, AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
    /// The provider's current session, if any
    async fn get_session(&self) -> Result<Option<Session>, AuthError>;
    /// Issue a fresh session. `Ok(None)` means the provider holds no session
    /// any more, which is authoritative.
    async fn refresh_session(&self) -> Result<Option<Session>, AuthError>;
    /// Subscribe to pushed session changes. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<SessionChange>;
}
