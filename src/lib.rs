pub mod activity;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod profile;
pub mod telemetry;
pub mod validation;

pub use activity::{HostSignal, InteractionKind, Visibility};
pub use config::{Config, SessionConfig};
pub use controller::{
    AuthEvent, AuthPhase, AuthView, RevalidateOutcome, SessionController, SignalOutcome,
};
pub use error::{AuthError, ControllerError, ProfileError, SignUpError};
pub use identity::{IdentityService, MemoryIdentityService, Session};
pub use profile::{MemoryProfileStore, Profile, ProfileStore, SignUpRequest, UserType};
