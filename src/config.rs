use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Refresh interval in minutes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub boxes: Vec<BoxConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_refresh_interval() -> u64 {
    15
}

/// Where the remote news API lives and how to talk to it.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token for the premium endpoints (post generator, recommendations)
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_fresh_minutes")]
    pub fresh_minutes: u64,
    #[serde(default = "default_stale_hours")]
    pub stale_hours: u64,
    #[serde(default = "default_write_debounce_ms")]
    pub write_debounce_ms: u64,
}

fn default_fresh_minutes() -> u64 {
    15
}

fn default_stale_hours() -> u64 {
    24
}

fn default_write_debounce_ms() -> u64 {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_minutes: default_fresh_minutes(),
            stale_hours: default_stale_hours(),
            write_debounce_ms: default_write_debounce_ms(),
        }
    }
}

impl CacheConfig {
    pub fn fresh_window(&self) -> Duration {
        Duration::from_secs(self.fresh_minutes.saturating_mul(60))
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_hours.saturating_mul(60 * 60))
    }

    pub fn write_debounce(&self) -> Duration {
        Duration::from_millis(self.write_debounce_ms)
    }
}

/// A box seeded from the config file on startup.
#[derive(Debug, Deserialize, Clone)]
pub struct BoxConfig {
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

fn default_color() -> String {
    "#000000".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.refresh_interval == 0 || self.refresh_interval.checked_mul(60).is_none() {
            anyhow::bail!("refresh_interval must be between 1 and {} minutes", u64::MAX / 60);
        }
        if self.cache.fresh_minutes.checked_mul(60).is_none()
            || self.cache.stale_hours.checked_mul(60 * 60).is_none()
        {
            anyhow::bail!("cache windows are too large");
        }
        if self.cache.fresh_window() > self.cache.stale_window() {
            anyhow::bail!(
                "cache.fresh_minutes ({}) exceeds the stale window of {} hours",
                self.cache.fresh_minutes,
                self.cache.stale_hours
            );
        }
        if self.boxes.iter().any(|b| b.name.trim().is_empty()) {
            anyhow::bail!("boxes must have a non-empty name");
        }
        Ok(())
    }
}
