//! Activity tracking and the revalidation gate.
//!
//! Host signals (input, visibility, focus, cross-tab storage changes) arrive
//! from the embedding UI. The policy here decides, from the time since the
//! user last interacted, whether a signal is worth a round trip to the
//! identity provider.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Pointer,
    Key,
    Scroll,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

/// An environment event delivered by the host platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostSignal {
    Interaction { kind: InteractionKind },
    VisibilityChanged { visibility: Visibility },
    Focus,
    /// A storage key changed in another tab
    StorageChanged { key: String },
}

/// What prompted a revalidation check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Focus,
    BecameVisible,
    Periodic,
    CrossTab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The user interacted too recently for a check to be useful
    RecentActivity,
    /// Periodic tick for a user who has wandered off
    IdleTab,
    /// Periodic tick while the tab is in the background
    Hidden,
    /// Periodic tick with no session to keep alive
    SignedOut,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RecentActivity => "recent_activity",
            SkipReason::IdleTab => "idle_tab",
            SkipReason::Hidden => "hidden",
            SkipReason::SignedOut => "signed_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Revalidate,
    Skip(SkipReason),
}

/// Last time the user touched the page. Not persisted.
#[derive(Debug, Clone, Copy)]
pub struct ActivityClock {
    last_activity: Instant,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(at: Instant) -> Self {
        Self { last_activity: at }
    }

    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&mut self, at: Instant) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Thresholds for the revalidation gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevalidationPolicy {
    /// Focus and visibility only revalidate after this much idle time
    pub focus_threshold: Duration,
    /// Periodic ticks only revalidate for users active within this window
    pub activity_window: Duration,
}

impl RevalidationPolicy {
    pub fn from_session_config(config: &SessionConfig) -> Self {
        Self {
            focus_threshold: config.focus_threshold(),
            activity_window: config.periodic_activity_window(),
        }
    }

    /// `idle` is the time since the last interaction. `expiring` is true when
    /// the current session is inside the refresh margin; it lets a periodic
    /// tick refresh an idle user's session before it lapses.
    pub fn decide(
        &self,
        trigger: Trigger,
        idle: Duration,
        visibility: Visibility,
        expiring: bool,
    ) -> Decision {
        match trigger {
            Trigger::Focus | Trigger::BecameVisible => {
                if idle >= self.focus_threshold {
                    Decision::Revalidate
                } else {
                    Decision::Skip(SkipReason::RecentActivity)
                }
            }
            Trigger::Periodic => {
                if visibility == Visibility::Hidden {
                    Decision::Skip(SkipReason::Hidden)
                } else if idle <= self.activity_window || expiring {
                    Decision::Revalidate
                } else {
                    Decision::Skip(SkipReason::IdleTab)
                }
            }
            Trigger::CrossTab => Decision::Revalidate,
        }
    }
}

impl Default for RevalidationPolicy {
    fn default() -> Self {
        Self::from_session_config(&SessionConfig::default())
    }
}

/// Whether a storage key belongs to the auth token
pub fn matches_storage_key(pattern: &str, key: &str) -> bool {
    !pattern.is_empty() && key.contains(pattern)
}
