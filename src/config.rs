//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `relay.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides (credentials and port usually live in `.env`).
//!
//! structure:
//!     - ServerConfig: listen port and static asset directory.
//!     - UpstreamConfig: station feed url, credentials, connect timeout, backoff.
//!     - TrendConfig: pressure trend window / sample policy (see trend.rs).
//!     - SubscriberConfig: per-connection outbound queue depth.
//!     - LoggingConfig: default log level and reading echo.
//!
//! ==============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::hub::JOIN_REPLAY_LEN;
use crate::trend::{TrendConfig, MAX_WINDOW_HOURS};

pub const API_KEY_ENV: &str = "AMBIENT_API_KEY";
pub const APP_KEY_ENV: &str = "AMBIENT_APP_KEY";
pub const PORT_ENV: &str = "PORT";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub trend: TrendConfig,
    pub subscribers: SubscriberConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: String,
    pub application_key: String,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SubscriberConfig {
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_readings: bool,
}

/// Both keys are required before anything connects upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub application_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            static_dir: PathBuf::from("public"),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "https://rt2.ambientweather.net".to_string(),
            api_key: String::new(),
            application_key: String::new(),
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            connect_timeout_secs: 30,
        }
    }
}

impl UpstreamConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self { queue_depth: 32 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_readings: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: RelayConfig = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback. Returns the config and where it came from.
    pub fn load_or_default() -> Result<(Self, Option<PathBuf>)> {
        let paths = [
            PathBuf::from("config").join("relay.toml"),
            PathBuf::from("..").join("config").join("relay.toml"),
        ];

        for path in paths {
            if path.exists() {
                let config = Self::load(&path)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((Self::default(), None))
    }

    /// Apply `AMBIENT_API_KEY`, `AMBIENT_APP_KEY` and `PORT` from the process env.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(key) = lookup(API_KEY_ENV) {
            self.upstream.api_key = key;
        }
        if let Some(key) = lookup(APP_KEY_ENV) {
            self.upstream.application_key = key;
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("{PORT_ENV} is not a valid port: {port:?}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let trend = &self.trend;
        if !(trend.window_hours.is_finite() && trend.window_hours > 0.0) {
            bail!("trend.window_hours must be a positive number, got {}", trend.window_hours);
        }
        if trend.window_hours > MAX_WINDOW_HOURS {
            bail!(
                "trend.window_hours must be at most {}, got {}",
                MAX_WINDOW_HOURS,
                trend.window_hours
            );
        }
        if trend.min_samples == 0 {
            bail!("trend.min_samples must be at least 1");
        }
        if trend.capacity == 0 {
            bail!("trend.capacity must be at least 1");
        }
        if !(trend.steady_threshold.is_finite() && trend.steady_threshold >= 0.0) {
            bail!("trend.steady_threshold must be a non-negative number");
        }
        // a new subscriber is replayed the snapshot and the status in one go
        if self.subscribers.queue_depth < JOIN_REPLAY_LEN {
            bail!("subscribers.queue_depth must be at least {}", JOIN_REPLAY_LEN);
        }
        if self.upstream.initial_backoff_ms == 0 {
            bail!("upstream.initial_backoff_ms must be at least 1");
        }
        if self.upstream.connect_timeout_secs == 0 {
            bail!("upstream.connect_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Fails unless both upstream keys are present and non-blank.
    pub fn credentials(&self) -> Result<Credentials> {
        let api_key = self.upstream.api_key.trim();
        let application_key = self.upstream.application_key.trim();

        let mut missing = Vec::new();
        if api_key.is_empty() {
            missing.push(API_KEY_ENV);
        }
        if application_key.is_empty() {
            missing.push(APP_KEY_ENV);
        }
        if !missing.is_empty() {
            return Err(anyhow!("please set {} (environment or .env)", missing.join(" and ")));
        }

        Ok(Credentials {
            api_key: api_key.to_string(),
            application_key: application_key.to_string(),
        })
    }

    /// Log configuration summary
    pub fn log_summary(&self, source: Option<&Path>) {
        match source {
            Some(path) => tracing::info!("[CONFIG] Loaded from {}", path.display()),
            None => tracing::info!("[CONFIG] No config file found - using defaults"),
        }
        tracing::info!(
            port = self.server.port,
            upstream = %self.upstream.url,
            window_hours = self.trend.window_hours,
            min_samples = self.trend.min_samples,
            capacity = self.trend.capacity,
            "[CONFIG] relay settings"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = RelayConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.trend, TrendConfig::default());
        assert_eq!(config.upstream.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.subscribers.queue_depth, 32);
    }

    #[test]
    fn parses_partial_sections() {
        let config = RelayConfig::parse(
            r#"
            [server]
            port = 8080

            [upstream]
            connect_timeout_secs = 10
            max_backoff_ms = 5000

            [trend]
            window_hours = 6.0
            steady_threshold = 0.01

            [logging]
            level = "debug"
            show_readings = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.static_dir, PathBuf::from("public"));
        assert_eq!(config.upstream.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.upstream.max_backoff(), Duration::from_millis(5000));
        assert_eq!(config.trend.window_hours, 6.0);
        assert_eq!(config.trend.min_samples, 6);
        assert_eq!(config.trend.steady_threshold, 0.01);
        assert!(config.logging.show_readings);
    }

    #[test]
    fn rejects_bad_policy() {
        assert!(RelayConfig::parse("[trend]\ncapacity = 0").is_err());
        assert!(RelayConfig::parse("[trend]\nwindow_hours = -1.0").is_err());
        assert!(RelayConfig::parse("[subscribers]\nqueue_depth = 0").is_err());
        assert!(RelayConfig::parse("[upstream]\nconnect_timeout_secs = 0").is_err());
    }

    #[test]
    fn queue_must_hold_a_join_replay() {
        assert!(RelayConfig::parse("[subscribers]\nqueue_depth = 1").is_err());
        let config = RelayConfig::parse("[subscribers]\nqueue_depth = 2").unwrap();
        assert_eq!(config.subscribers.queue_depth, 2);
    }

    #[test]
    fn window_is_bounded() {
        assert!(RelayConfig::parse("[trend]\nwindow_hours = 1.0e10").is_err());
        assert!(RelayConfig::parse("[trend]\nwindow_hours = inf").is_err());
        let config = RelayConfig::parse(&format!("[trend]\nwindow_hours = {MAX_WINDOW_HOURS:?}")).unwrap();
        assert_eq!(config.trend.window_hours, MAX_WINDOW_HOURS);
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let config = RelayConfig::default();
        let err = config.credentials().unwrap_err().to_string();
        assert!(err.contains(API_KEY_ENV));
        assert!(err.contains(APP_KEY_ENV));

        let mut config = RelayConfig::default();
        config
            .apply_overrides(env(&[(API_KEY_ENV, "abc"), (APP_KEY_ENV, "   ")]))
            .unwrap();
        let err = config.credentials().unwrap_err().to_string();
        assert!(err.contains(APP_KEY_ENV));
        assert!(!err.contains(API_KEY_ENV));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = RelayConfig::parse("[upstream]\napi_key = \"from-file\"\n").unwrap();
        config
            .apply_overrides(env(&[(API_KEY_ENV, "from-env"), (APP_KEY_ENV, "app"), (PORT_ENV, "4000")]))
            .unwrap();

        assert_eq!(
            config.credentials().unwrap(),
            Credentials {
                api_key: "from-env".to_string(),
                application_key: "app".to_string(),
            }
        );
        assert_eq!(config.server.port, 4000);
    }

    #[test]
    fn shipped_config_file_parses() {
        let config = RelayConfig::parse(include_str!("../config/relay.toml")).unwrap();
        assert_eq!(config.trend, TrendConfig::default());
        assert!(config.credentials().is_err());
    }

    #[test]
    fn bad_port_is_rejected() {
        let mut config = RelayConfig::default();
        assert!(config.apply_overrides(env(&[(PORT_ENV, "http")])).is_err());
    }
}
