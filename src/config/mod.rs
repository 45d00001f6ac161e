use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on the initial session check before giving up (default: 8)
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    /// Minimum idle time before focus or visibility triggers a revalidation (default: 30)
    #[serde(default = "default_focus_threshold_secs")]
    pub focus_threshold_secs: u64,
    /// Period of the background revalidation timer (default: 300)
    #[serde(default = "default_periodic_interval_secs")]
    pub periodic_interval_secs: u64,
    /// The periodic timer only fires for users active within this window (default: 300)
    #[serde(default = "default_periodic_activity_window_secs")]
    pub periodic_activity_window_secs: u64,
    /// Sessions expiring within this margin are refreshed even for idle users (default: 300)
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    /// Quiet period applied to cross-tab storage notifications (default: 100)
    #[serde(default = "default_storage_debounce_ms")]
    pub storage_debounce_ms: u64,
    /// Substring identifying auth-token keys in storage change notifications
    #[serde(default = "default_storage_key_pattern")]
    pub storage_key_pattern: String,
    /// Total profile fetch attempts when the record is not there yet (default: 3)
    #[serde(default = "default_profile_fetch_attempts")]
    pub profile_fetch_attempts: u32,
    /// Fixed delay between profile fetch attempts (default: 1000)
    #[serde(default = "default_profile_retry_delay_ms")]
    pub profile_retry_delay_ms: u64,
}

fn default_init_timeout_secs() -> u64 {
    8
}

fn default_focus_threshold_secs() -> u64 {
    30
}

fn default_periodic_interval_secs() -> u64 {
    300
}

fn default_periodic_activity_window_secs() -> u64 {
    300
}

fn default_refresh_margin_secs() -> u64 {
    300
}

fn default_storage_debounce_ms() -> u64 {
    100
}

fn default_storage_key_pattern() -> String {
    "auth-token".to_string()
}

fn default_profile_fetch_attempts() -> u32 {
    3
}

fn default_profile_retry_delay_ms() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: default_init_timeout_secs(),
            focus_threshold_secs: default_focus_threshold_secs(),
            periodic_interval_secs: default_periodic_interval_secs(),
            periodic_activity_window_secs: default_periodic_activity_window_secs(),
            refresh_margin_secs: default_refresh_margin_secs(),
            storage_debounce_ms: default_storage_debounce_ms(),
            storage_key_pattern: default_storage_key_pattern(),
            profile_fetch_attempts: default_profile_fetch_attempts(),
            profile_retry_delay_ms: default_profile_retry_delay_ms(),
        }
    }
}

impl SessionConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn focus_threshold(&self) -> Duration {
        Duration::from_secs(self.focus_threshold_secs)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    pub fn periodic_activity_window(&self) -> Duration {
        Duration::from_secs(self.periodic_activity_window_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn storage_debounce(&self) -> Duration {
        Duration::from_millis(self.storage_debounce_ms)
    }

    pub fn profile_retry_delay(&self) -> Duration {
        Duration::from_millis(self.profile_retry_delay_ms)
    }

    /// Reject settings that would stall the controller or spin its timers.
    pub fn validate(&self) -> Result<()> {
        if self.init_timeout_secs == 0 {
            bail!("session.init_timeout_secs must be greater than zero");
        }
        if self.periodic_interval_secs == 0 {
            bail!("session.periodic_interval_secs must be greater than zero");
        }
        if self.profile_fetch_attempts == 0 {
            bail!("session.profile_fetch_attempts must be at least 1");
        }
        if self.storage_key_pattern.is_empty() {
            bail!("session.storage_key_pattern must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };
        config.session.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse configuration file")
    }
}
