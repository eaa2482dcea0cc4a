//! Office configuration.

use kiln_core::{KernelError, KernelResult};
use kiln_team::TeamConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_monitor_interval_ms() -> u64 {
    100
}

/// Office configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficeConfig {
    /// Office name
    pub name: String,
    /// Timeout for sourcing and asynchronous operations, unless a managed
    /// object overrides it. Zero disables the timeout.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Period of the timeout monitor thread. Zero disables the monitor.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Teams built and registered by name
    #[serde(default)]
    pub teams: Vec<TeamConfig>,
}

impl OfficeConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_timeout_ms: default_timeout_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            teams: Vec::new(),
        }
    }

    /// Parse from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the configuration invalid
    pub fn from_json(json: &str) -> KernelResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> KernelResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| KernelError::Config {
            reason: format!("{}: {}", path.display(), err),
        })?;
        Self::from_json(&json)
    }

    /// Set the default timeout
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the monitor interval
    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Add a team
    #[must_use]
    pub fn with_team(mut self, team: TeamConfig) -> Self {
        self.teams.push(team);
        self
    }

    /// Default timeout, if enabled
    #[must_use]
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }

    /// Monitor interval, if enabled
    #[must_use]
    pub fn monitor_interval(&self) -> Option<Duration> {
        (self.monitor_interval_ms > 0).then(|| Duration::from_millis(self.monitor_interval_ms))
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error on an empty office name or duplicated team names
    pub fn validate(&self) -> KernelResult<()> {
        if self.name.is_empty() {
            return Err(KernelError::Config {
                reason: "office name must not be empty".to_string(),
            });
        }
        for (i, team) in self.teams.iter().enumerate() {
            if self.teams[..i].iter().any(|other| other.name == team.name) {
                return Err(KernelError::Duplicate {
                    kind: "Team".to_string(),
                    name: team.name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Default for OfficeConfig {
    fn default() -> Self {
        Self::new("office")
    }
}
