//! In-process profile store.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{NewProfile, Profile, ProfileStore, ProfileUpdate, UserType};
use crate::error::ProfileError;
use crate::validation::normalize_username;

/// A row that exists but is not yet visible to readers
struct LaggedRow {
    profile: Profile,
    misses_left: u32,
}

#[derive(Default)]
struct StoreState {
    rows: HashMap<String, Profile>,
    lagged: HashMap<String, LaggedRow>,
    offline: bool,
    create_failures: VecDeque<ProfileError>,
    fetch_delay: Duration,
}

#[derive(Default)]
pub struct MemoryProfileStore {
    state: RwLock<StoreState>,
    fetch_calls: AtomicUsize,
    create_calls: AtomicUsize,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a profile that is immediately visible
    pub fn insert(&self, profile: NewProfile) -> Profile {
        let profile = materialize(profile);
        self.state
            .write()
            .rows
            .insert(profile.id.clone(), profile.clone());
        profile
    }

    /// Insert a profile that reads as not-found for the next `misses` fetches,
    /// like a row written by a trigger that lags behind account creation
    pub fn insert_lagged(&self, profile: NewProfile, misses: u32) {
        let profile = materialize(profile);
        self.state.write().lagged.insert(
            profile.id.clone(),
            LaggedRow {
                profile,
                misses_left: misses,
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.write().offline = offline;
    }

    /// Delay every fetch response
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.write().fetch_delay = delay;
    }

    pub fn fail_next_create(&self, error: ProfileError) {
        self.state.write().create_failures.push_back(error);
    }

    pub fn get(&self, user_id: &str) -> Option<Profile> {
        self.state.read().rows.get(user_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), ProfileError> {
        if self.state.read().offline {
            return Err(ProfileError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    fn lookup(&self, user_id: &str) -> Result<Profile, ProfileError> {
        let mut state = self.state.write();
        if let Some(profile) = state.rows.get(user_id) {
            return Ok(profile.clone());
        }

        let Some(lagged) = state.lagged.get_mut(user_id) else {
            return Err(ProfileError::NotFound);
        };
        if lagged.misses_left > 0 {
            lagged.misses_left -= 1;
            return Err(ProfileError::NotFound);
        }

        let profile = state
            .lagged
            .remove(user_id)
            .map(|row| row.profile)
            .ok_or(ProfileError::NotFound)?;
        state.rows.insert(profile.id.clone(), profile.clone());
        Ok(profile)
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn fetch(&self, user_id: &str) -> Result<Profile, ProfileError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let delay = self.state.read().fetch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.lookup(user_id)
    }

    async fn create(&self, profile: &NewProfile) -> Result<Profile, ProfileError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let mut state = self.state.write();
        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }
        if state.rows.contains_key(&profile.id) || state.lagged.contains_key(&profile.id) {
            return Err(ProfileError::Conflict(
                "A profile for this user already exists".to_string(),
            ));
        }
        if profile.user_type == UserType::Student {
            if let Some(username) = &profile.username {
                if state.username_taken(username, &profile.id) {
                    return Err(ProfileError::Conflict("Username already exists".to_string()));
                }
            }
        }

        let created = materialize(profile.clone());
        state.rows.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn update(&self, user_id: &str, update: &ProfileUpdate) -> Result<Profile, ProfileError> {
        self.check_online()?;

        let mut state = self.state.write();
        if let Some(username) = &update.username {
            if state.username_taken(username, user_id) {
                return Err(ProfileError::Conflict("Username already exists".to_string()));
            }
        }

        let profile = state.rows.get_mut(user_id).ok_or(ProfileError::NotFound)?;
        if let Some(first_name) = &update.first_name {
            profile.first_name = first_name.trim().to_string();
        }
        if let Some(last_name) = &update.last_name {
            profile.last_name = last_name.trim().to_string();
        }
        if let Some(avatar_url) = &update.avatar_url {
            profile.avatar_url = Some(avatar_url.clone());
        }
        if let Some(username) = &update.username {
            profile.username = Some(normalize_username(username));
        }
        profile.updated_at = Utc::now();
        Ok(profile.clone())
    }

    async fn student_username_exists(&self, username: &str) -> Result<bool, ProfileError> {
        self.check_online()?;

        let wanted = normalize_username(username);
        let state = self.state.read();
        let exists = state
            .rows
            .values()
            .chain(state.lagged.values().map(|row| &row.profile))
            .any(|p| {
                p.user_type == UserType::Student && p.username.as_deref() == Some(wanted.as_str())
            });
        Ok(exists)
    }
}

impl StoreState {
    /// Whether a student other than `owner` already holds `username`
    fn username_taken(&self, username: &str, owner: &str) -> bool {
        let wanted = normalize_username(username);
        self.rows
            .values()
            .chain(self.lagged.values().map(|row| &row.profile))
            .any(|p| {
                p.id != owner
                    && p.user_type == UserType::Student
                    && p.username.as_deref() == Some(wanted.as_str())
            })
    }
}

fn materialize(profile: NewProfile) -> Profile {
    let now = Utc::now();
    Profile {
        id: profile.id,
        email: profile.email,
        first_name: profile.first_name,
        last_name: profile.last_name,
        user_type: profile.user_type,
        avatar_url: profile.avatar_url,
        username: profile.username.as_deref().map(normalize_username),
        created_at: now,
        updated_at: now,
    }
}
