//! Profile records and the store that holds them.

mod fetch;
mod memory;

pub use fetch::{fetch_with_retry, FetchOutcome, RetryPolicy};
pub use memory::MemoryProfileStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, ProfileError};
use crate::validation::{
    normalize_username, validate_email, validate_name, validate_password, validate_username,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Student,
    Donor,
    Admin,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Student => "student",
            UserType::Donor => "donor",
            UserType::Admin => "admin",
        }
    }
}

/// Application-level user record, keyed by the identity user id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub user_type: UserType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let full = full.trim();
        if full.is_empty() {
            self.email.clone()
        } else {
            full.to_string()
        }
    }
}

/// Attributes for a new profile row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProfile {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub user_type: UserType,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Partial profile edit. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.avatar_url.is_none()
            && self.username.is_none()
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if let Some(first_name) = &self.first_name {
            validate_name(first_name, "First name").map_err(ProfileError::Validation)?;
        }
        if let Some(last_name) = &self.last_name {
            validate_name(last_name, "Last name").map_err(ProfileError::Validation)?;
        }
        if let Some(username) = &self.username {
            validate_username(username).map_err(ProfileError::Validation)?;
        }
        Ok(())
    }
}

/// Everything needed to create an account and its profile
#[derive(Debug, Clone, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub user_type: UserType,
    /// Required for students, ignored for everyone else
    #[serde(default)]
    pub username: Option<String>,
}

impl SignUpRequest {
    /// Check the form, returning the first problem found
    pub fn validate(&self) -> Result<(), AuthError> {
        validate_email(&self.email).map_err(AuthError::Validation)?;
        validate_password(&self.password).map_err(AuthError::Validation)?;
        validate_name(&self.first_name, "First name").map_err(AuthError::Validation)?;
        validate_name(&self.last_name, "Last name").map_err(AuthError::Validation)?;
        if self.user_type == UserType::Student {
            validate_username(self.username.as_deref().unwrap_or_default())
                .map_err(AuthError::Validation)?;
        }
        Ok(())
    }

    /// Normalized username for students, `None` for other user types
    pub fn student_username(&self) -> Option<String> {
        match self.user_type {
            UserType::Student => self.username.as_deref().map(normalize_username),
            _ => None,
        }
    }

    pub fn to_new_profile(&self, user_id: &str) -> NewProfile {
        NewProfile {
            id: user_id.to_string(),
            email: self.email.clone(),
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            user_type: self.user_type,
            avatar_url: None,
            username: self.student_username(),
        }
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch the profile for `user_id`. A missing row is `ProfileError::NotFound`.
    async fn fetch(&self, user_id: &str) -> Result<Profile, ProfileError>;
    async fn create(&self, profile: &NewProfile) -> Result<Profile, ProfileError>;
    async fn update(&self, user_id: &str, update: &ProfileUpdate) -> Result<Profile, ProfileError>;
    /// Whether a student profile already uses `username` (case-insensitive)
    async fn student_username_exists(&self, username: &str) -> Result<bool, ProfileError>;
}
