//! Settings for calls to the cards service.

use std::time::Duration;
use tally_runtime::config::{ConfigError, Vars};

/// Where the cards service lives and how hard to try reaching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Base URL, without a trailing slash
    pub card_service_url: String,
    /// Per-request deadline in milliseconds
    pub request_timeout_ms: u64,
    /// Attempts of a transport-failed request
    pub request_attempts: usize,
    /// Attempts of linking new cards to an account
    pub link_attempts: usize,
    /// Pause between link attempts in milliseconds
    pub link_delay_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            card_service_url: "http://card-service:8083".to_string(),
            request_timeout_ms: 3_000,
            request_attempts: 2,
            link_attempts: 5,
            link_delay_ms: 2_000,
        }
    }
}

impl ResolverConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is unparseable or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`ResolverConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars::new(&lookup);
        let defaults = Self::default();
        let config = Self {
            card_service_url: vars
                .get("CARD_SERVICE_URL")
                .map_or(defaults.card_service_url, |url| url.trim_end_matches('/').to_string()),
            request_timeout_ms: vars.parse_or("CARD_SERVICE_TIMEOUT_MS", defaults.request_timeout_ms)?,
            request_attempts: vars.parse_or("CARD_SERVICE_ATTEMPTS", defaults.request_attempts)?,
            link_attempts: vars.parse_or("CARD_LINK_ATTEMPTS", defaults.link_attempts)?,
            link_delay_ms: vars.parse_or("CARD_LINK_DELAY_MS", defaults.link_delay_ms)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a non-HTTP URL, a zero
    /// timeout or zero attempts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.card_service_url.starts_with("http://") && !self.card_service_url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "CARD_SERVICE_URL must be an http(s) URL, got '{}'",
                self.card_service_url
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError("CARD_SERVICE_TIMEOUT_MS must be > 0".into()));
        }
        if self.request_attempts == 0 || self.link_attempts == 0 {
            return Err(ConfigError::ValidationError("card service attempts must be > 0".into()));
        }
        Ok(())
    }

    /// Per-request deadline.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Pause between link attempts.
    #[must_use]
    pub const fn link_delay(&self) -> Duration {
        Duration::from_millis(self.link_delay_ms)
    }
}
