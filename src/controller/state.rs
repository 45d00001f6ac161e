//! The session state machine, free of any I/O.
//!
//! Every transition is a synchronous method on [`ControllerState`]; the
//! controller calls them under its lock and publishes the resulting
//! [`AuthView`]. Results of remote calls carry the epoch or fetch ticket they
//! were started under and are dropped if the state has moved on since.

use serde::Serialize;

use crate::identity::{IdentityUser, Session};
use crate::profile::{FetchOutcome, Profile, UserType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Initializing,
    Authenticated,
    Refreshing,
    Unauthenticated,
}

/// Read-only snapshot handed to consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthView {
    pub phase: AuthPhase,
    pub user: Option<IdentityUser>,
    pub profile: Option<Profile>,
    pub session: Option<Session>,
    pub is_loading: bool,
    pub is_authenticated: bool,
}

impl AuthView {
    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().and_then(Session::user_id)
    }

    pub fn user_type(&self) -> Option<UserType> {
        self.profile.as_ref().map(|p| p.user_type)
    }

    /// Name to show in the header. Falls back to the local part of the
    /// session email while the profile is missing.
    pub fn display_name(&self) -> Option<String> {
        if let Some(profile) = &self.profile {
            return Some(profile.display_name());
        }
        let email = self.user.as_ref()?.email.as_str();
        let local = email.split('@').next().unwrap_or(email);
        if local.is_empty() {
            None
        } else {
            Some(local.to_string())
        }
    }
}

/// Identifies one profile fetch. Only the latest ticket may write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub user_id: String,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileApply {
    Applied,
    /// Fetch settled without a profile (missing or failed)
    Settled,
    /// The session moved on; the result was dropped
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshApply {
    Applied(Option<FetchTicket>),
    Stale,
}

/// Snapshot taken when a revalidation starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStart {
    pub epoch: u64,
    pub has_session: bool,
    pub restore_blocked: bool,
}

#[derive(Debug)]
pub struct ControllerState {
    phase: AuthPhase,
    session: Option<Session>,
    profile: Option<Profile>,
    pending_fetch: Option<FetchTicket>,
    next_ticket: u64,
    /// Bumped whenever the identity changes or the session is dropped
    epoch: u64,
    /// Set by a local sign-out; only an explicit sign-in may establish a
    /// session afterwards
    signed_out_locally: bool,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerState {
    pub fn new() -> Self {
        Self {
            phase: AuthPhase::Initializing,
            session: None,
            profile: None,
            pending_fetch: None,
            next_ticket: 0,
            epoch: 0,
            signed_out_locally: false,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().and_then(Session::user_id)
    }

    pub fn is_signed_out_locally(&self) -> bool {
        self.signed_out_locally
    }

    pub fn view(&self) -> AuthView {
        AuthView {
            phase: self.phase,
            user: self.session.as_ref().and_then(|s| s.user.clone()),
            profile: self.profile.clone(),
            session: self.session.clone(),
            // A refetch over a loaded profile is background work
            is_loading: self.phase == AuthPhase::Initializing
                || (self.pending_fetch.is_some() && self.profile.is_none()),
            is_authenticated: self.user_id().is_some(),
        }
    }

    /// Adopt `session` as the current one. Returns a ticket when the profile
    /// for the new user has to be fetched.
    pub fn apply_session(&mut self, session: Option<Session>) -> Option<FetchTicket> {
        let new_user = session.as_ref().and_then(Session::user_id).map(str::to_string);
        if new_user.as_deref() != self.user_id() {
            self.epoch += 1;
        }
        self.session = session;

        let Some(user_id) = new_user else {
            self.phase = AuthPhase::Unauthenticated;
            self.profile = None;
            self.pending_fetch = None;
            return None;
        };

        self.phase = AuthPhase::Authenticated;
        self.signed_out_locally = false;

        if self.profile.as_ref().is_some_and(|p| p.id == user_id) {
            return None;
        }
        self.profile = None;

        if self
            .pending_fetch
            .as_ref()
            .is_some_and(|t| t.user_id == user_id)
        {
            return None;
        }
        Some(self.issue_ticket(user_id))
    }

    /// Result of the initial session check. Ignored if a pushed change
    /// already settled the state.
    pub fn apply_initial(&mut self, session: Option<Session>) -> Option<Option<FetchTicket>> {
        if self.phase != AuthPhase::Initializing {
            return None;
        }
        Some(self.apply_session(session))
    }

    /// The initial check did not answer in time
    pub fn expire_initialization(&mut self) -> bool {
        if self.phase != AuthPhase::Initializing {
            return false;
        }
        self.phase = AuthPhase::Unauthenticated;
        true
    }

    /// Drop session and profile. Used for sign-out and authoritative
    /// invalidation.
    pub fn clear(&mut self) {
        self.epoch += 1;
        self.phase = AuthPhase::Unauthenticated;
        self.session = None;
        self.profile = None;
        self.pending_fetch = None;
    }

    pub fn sign_out(&mut self) {
        self.clear();
        self.signed_out_locally = true;
    }

    /// The provider confirmed the sign-out; sessions it reports from now on
    /// were created after it. No-op if anything happened since `epoch`.
    pub fn confirm_sign_out(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || !self.signed_out_locally {
            return false;
        }
        self.signed_out_locally = false;
        true
    }

    /// Start a fetch for the current user regardless of what is cached
    pub fn force_profile_fetch(&mut self) -> Option<FetchTicket> {
        let user_id = self.user_id()?.to_string();
        Some(self.issue_ticket(user_id))
    }

    pub fn finish_profile_fetch(
        &mut self,
        ticket: &FetchTicket,
        outcome: FetchOutcome,
    ) -> ProfileApply {
        if self.pending_fetch.as_ref() != Some(ticket)
            || self.user_id() != Some(ticket.user_id.as_str())
        {
            return ProfileApply::Stale;
        }
        self.pending_fetch = None;

        match outcome {
            FetchOutcome::Found(profile) if profile.id == ticket.user_id => {
                self.profile = Some(profile);
                ProfileApply::Applied
            }
            FetchOutcome::Found(_) => ProfileApply::Stale,
            FetchOutcome::Missing | FetchOutcome::Failed(_) | FetchOutcome::Cancelled => {
                ProfileApply::Settled
            }
        }
    }

    /// Install a profile obtained outside the fetch path (create, update).
    /// Any in-flight fetch is superseded.
    pub fn adopt_profile(&mut self, profile: Profile) -> bool {
        if self.user_id() != Some(profile.id.as_str()) {
            return false;
        }
        self.pending_fetch = None;
        self.profile = Some(profile);
        true
    }

    pub fn begin_refresh(&mut self) -> RefreshStart {
        let has_session = self.user_id().is_some();
        if has_session && self.phase == AuthPhase::Authenticated {
            self.phase = AuthPhase::Refreshing;
        }
        RefreshStart {
            epoch: self.epoch,
            has_session,
            restore_blocked: self.signed_out_locally,
        }
    }

    pub fn finish_refresh(&mut self, epoch: u64, session: Session) -> RefreshApply {
        if epoch != self.epoch {
            return RefreshApply::Stale;
        }
        RefreshApply::Applied(self.apply_session(Some(session)))
    }

    /// Session restored by a `get_session` while signed out
    pub fn restore(&mut self, epoch: u64, session: Session) -> RefreshApply {
        if epoch != self.epoch || self.signed_out_locally {
            return RefreshApply::Stale;
        }
        RefreshApply::Applied(self.apply_session(Some(session)))
    }

    /// Refresh failed transiently; keep the session as it is
    pub fn abort_refresh(&mut self, epoch: u64) {
        if epoch == self.epoch && self.phase == AuthPhase::Refreshing {
            self.phase = AuthPhase::Authenticated;
        }
    }

    /// The provider confirmed there is no session. Returns false if the
    /// state already moved on.
    pub fn invalidate(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.clear();
        true
    }

    fn issue_ticket(&mut self, user_id: String) -> FetchTicket {
        self.next_ticket += 1;
        let ticket = FetchTicket {
            user_id,
            id: self.next_ticket,
        };
        self.pending_fetch = Some(ticket.clone());
        ticket
    }
}
