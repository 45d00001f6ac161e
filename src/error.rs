//! Error taxonomy shared by the identity and profile boundaries and the controller.
//!
//! Provider responses are normalized into these closed sets before they reach
//! any transition logic. Nothing in this crate panics on a collaborator error;
//! the worst case is being treated as signed out.

use thiserror::Error;

/// Errors reported by an identity provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Bad credentials, malformed input, duplicate username and similar.
    /// Shown inline to the user; never escalated.
    #[error("{0}")]
    Validation(String),

    /// Network or provider hiccup. Left to the next scheduled revalidation.
    #[error("Identity provider unreachable: {0}")]
    Transient(String),

    /// The provider confirmed the session no longer exists.
    #[error("Session is no longer valid: {0}")]
    Invalidated(String),
}

impl AuthError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn invalidated(message: impl Into<String>) -> Self {
        Self::Invalidated(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Transient(_))
    }

    /// True when the current session must be dropped immediately
    pub fn is_authoritative(&self) -> bool {
        matches!(self, AuthError::Invalidated(_))
    }
}

/// Errors reported by a profile store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// No profile row for the requested user (yet)
    #[error("Profile not found")]
    NotFound,

    /// A unique constraint was violated (duplicate id or username)
    #[error("{0}")]
    Conflict(String),

    /// The submitted attributes were rejected
    #[error("{0}")]
    Validation(String),

    /// The store could not be reached
    #[error("Profile store unreachable: {0}")]
    Transport(String),
}

/// Outcome of a failed sign-up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignUpError {
    /// Nothing was created; the caller may fix the input and sign up again
    #[error(transparent)]
    Rejected(#[from] AuthError),

    /// The identity exists but its profile row does not. Retry with
    /// `SessionController::complete_profile`, not a second sign-up.
    #[error("Account {user_id} was created but its profile was not: {source}")]
    ProfileIncomplete {
        user_id: String,
        #[source]
        source: ProfileError,
    },
}

impl SignUpError {
    /// Id of the identity left behind by a partial failure, if any
    pub fn orphaned_user_id(&self) -> Option<&str> {
        match self {
            SignUpError::ProfileIncomplete { user_id, .. } => Some(user_id),
            SignUpError::Rejected(_) => None,
        }
    }
}

/// Errors from controller operations that act on the signed-in user's profile
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Session controller has been disposed")]
    Disposed,

    #[error(transparent)]
    Profile(#[from] ProfileError),
}
