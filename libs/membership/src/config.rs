//! Construction parameters for watchers and registrations.
//!
//! Parsed from YAML or built in code. Durations are kept as integer
//! seconds/milliseconds so the file format stays flat.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{MembershipError, MembershipResult};

/// Default capacity of the change notification channel.
pub const DEFAULT_CHANGE_BUFFER: usize = 100;

/// Fixed delay between bootstrap read attempts.
pub const DEFAULT_BOOTSTRAP_BACKOFF_MS: u64 = 1_000;

/// Maximum conditional-create attempts before registration gives up.
pub const DEFAULT_MAX_REGISTER_ATTEMPTS: u32 = 10;

/// Default substrate dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Smallest keepalive period used when deriving it from the TTL.
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

fn default_change_buffer() -> usize {
    DEFAULT_CHANGE_BUFFER
}

fn default_bootstrap_backoff_ms() -> u64 {
    DEFAULT_BOOTSTRAP_BACKOFF_MS
}

fn default_max_register_attempts() -> u32 {
    DEFAULT_MAX_REGISTER_ATTEMPTS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Membership configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Substrate endpoints, e.g. `http://127.0.0.1:2379`.
    pub endpoints: Vec<String>,
    /// Key prefix members register under. Used verbatim.
    pub prefix: String,
    /// Member name. `None` selects queue mode (name derived from the store revision).
    #[serde(default)]
    pub name: Option<String>,
    /// Payload stored under the member key.
    #[serde(default)]
    pub value: String,
    /// Lease TTL in seconds. Also bounds bootstrap and registration retries.
    pub ttl_secs: i64,
    #[serde(default = "default_change_buffer")]
    pub change_buffer: usize,
    /// Delay between bootstrap reads and between named registration attempts.
    #[serde(default = "default_bootstrap_backoff_ms")]
    pub bootstrap_backoff_ms: u64,
    #[serde(default = "default_max_register_attempts")]
    pub max_register_attempts: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Keepalive period. Defaults to a third of the TTL.
    #[serde(default)]
    pub keepalive_interval_ms: Option<u64>,
}

impl MembershipConfig {
    pub fn new(endpoints: Vec<String>, prefix: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            endpoints,
            prefix: prefix.into(),
            name: None,
            value: String::new(),
            ttl_secs,
            change_buffer: DEFAULT_CHANGE_BUFFER,
            bootstrap_backoff_ms: DEFAULT_BOOTSTRAP_BACKOFF_MS,
            max_register_attempts: DEFAULT_MAX_REGISTER_ATTEMPTS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            keepalive_interval_ms: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_change_buffer(mut self, change_buffer: usize) -> Self {
        self.change_buffer = change_buffer;
        self
    }

    /// Parse a YAML document and validate it.
    pub fn parse_str(yaml: &str) -> MembershipResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| MembershipError::Config(format!("invalid membership config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML config file.
    pub fn parse<P: AsRef<Path>>(path: P) -> MembershipResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MembershipError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::parse_str(&contents)
    }

    /// Reject parameters the watcher or registrar cannot run with.
    pub fn validate(&self) -> MembershipResult<()> {
        if self.endpoints.is_empty() {
            return Err(MembershipError::Config(
                "at least one endpoint is required".into(),
            ));
        }
        if self.prefix.is_empty() {
            return Err(MembershipError::Config("prefix must not be empty".into()));
        }
        if self.ttl_secs < 1 {
            return Err(MembershipError::Config(format!(
                "ttl_secs must be at least 1, got {}",
                self.ttl_secs
            )));
        }
        if self.change_buffer == 0 {
            return Err(MembershipError::Config(
                "change_buffer must be greater than 0".into(),
            ));
        }
        if self.max_register_attempts == 0 {
            return Err(MembershipError::Config(
                "max_register_attempts must be greater than 0".into(),
            ));
        }
        if matches!(&self.name, Some(name) if name.is_empty()) {
            return Err(MembershipError::Config(
                "name must not be empty, omit it for queue mode".into(),
            ));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(0) as u64)
    }

    pub fn bootstrap_backoff(&self) -> Duration {
        Duration::from_millis(self.bootstrap_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        match self.keepalive_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => (self.ttl() / 3).max(MIN_KEEPALIVE_INTERVAL),
        }
    }
}
