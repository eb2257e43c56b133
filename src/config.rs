//! Engine configuration.
//!
//! Values come from the process environment (optionally seeded from `.env`
//! files, see [`crate::serve::env_loader`]) and fall back to the defaults
//! below.

use std::time::Duration;

use crate::error::LiveError;

/// Deadline applied to every outbound write on a duplex connection.
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Capacity of the per-socket outbound and event-error queues.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 32;

/// Cookie carrying the session id.
pub const DEFAULT_SESSION_COOKIE: &str = "live_session";

/// Session lifetime since last access (24 hours).
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub const ENV_WRITE_DEADLINE_MS: &str = "LIVE_WRITE_DEADLINE_MS";
pub const ENV_OUTBOUND_CAPACITY: &str = "LIVE_OUTBOUND_CAPACITY";
pub const ENV_SESSION_COOKIE: &str = "LIVE_SESSION_COOKIE";
pub const ENV_SESSION_MAX_AGE_SECS: &str = "LIVE_SESSION_MAX_AGE_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConfig {
    pub write_deadline: Duration,
    pub outbound_capacity: usize,
    pub session_cookie: String,
    pub session_max_age: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            write_deadline: DEFAULT_WRITE_DEADLINE,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            session_max_age: DEFAULT_SESSION_MAX_AGE,
        }
    }
}

impl LiveConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, LiveError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Unset keys keep
    /// their defaults, malformed values are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LiveError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_WRITE_DEADLINE_MS) {
            let millis = parse_number(ENV_WRITE_DEADLINE_MS, &raw)?;
            if millis == 0 {
                return Err(LiveError::config(format!(
                    "{} must be greater than zero",
                    ENV_WRITE_DEADLINE_MS
                )));
            }
            config.write_deadline = Duration::from_millis(millis);
        }

        if let Some(raw) = lookup(ENV_OUTBOUND_CAPACITY) {
            let capacity = parse_number(ENV_OUTBOUND_CAPACITY, &raw)?;
            if capacity == 0 {
                return Err(LiveError::config(format!(
                    "{} must be greater than zero",
                    ENV_OUTBOUND_CAPACITY
                )));
            }
            config.outbound_capacity = capacity as usize;
        }

        if let Some(raw) = lookup(ENV_SESSION_COOKIE) {
            let name = raw.trim();
            if name.is_empty() || name.contains([';', '=', ' ']) {
                return Err(LiveError::config(format!(
                    "{} is not a valid cookie name: '{}'",
                    ENV_SESSION_COOKIE, raw
                )));
            }
            config.session_cookie = name.to_string();
        }

        if let Some(raw) = lookup(ENV_SESSION_MAX_AGE_SECS) {
            config.session_max_age =
                Duration::from_secs(parse_number(ENV_SESSION_MAX_AGE_SECS, &raw)?);
        }

        Ok(config)
    }

    pub fn with_write_deadline(mut self, deadline: Duration) -> Self {
        self.write_deadline = deadline;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64, LiveError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| LiveError::config(format!("{} = '{}': {}", key, raw, e)))
}
