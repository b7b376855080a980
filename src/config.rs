// Configuration, loaded from TOML. Every field has a default so an empty file
// is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::{Environment, RequestKind};
use crate::error::{Error, Result};
use crate::safety::EnforcementMode;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deployment environment; violations raise in `test`
    pub environment: Environment,

    /// Identifier of this process in lease holder tokens
    pub instance_id: Option<String>,

    /// Lease timing and retry behaviour
    pub leases: LeaseConfig,

    /// Consistency auditing
    pub safety: SafetyConfig,
}

/// Timeouts, deadlines and retry counts for the lease manager.
///
/// The hold timeout should match the longest a request can run, and the wait
/// timeout must stay well under the interactive request deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub interactive_hold_secs: u64,
    pub batch_hold_secs: u64,
    pub interactive_wait_secs: u64,
    pub batch_wait_secs: u64,

    /// Deadline for lease-store reads
    pub get_deadline_ms: u64,
    /// Deadline for lease-store add/set/delete
    pub set_deadline_ms: u64,
    /// Deadline for the batch caller's read of the interactive marker
    pub fairness_check_deadline_ms: u64,

    /// How long an interactive acquire keeps batch callers yielding
    pub interactive_grace_secs: u64,
    /// How long a batch caller yields when interactive callers are active.
    /// Must exceed `poll_interval_ms` so a waiting interactive caller gets a
    /// poll in first.
    pub batch_yield_ms: u64,
    pub poll_interval_ms: u64,

    pub add_attempts: u32,
    pub release_attempts: u32,
    pub release_backoff_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            interactive_hold_secs: 60,
            batch_hold_secs: 60,
            interactive_wait_secs: 10,
            batch_wait_secs: 60,
            get_deadline_ms: 75,
            set_deadline_ms: 300,
            fairness_check_deadline_ms: 200,
            interactive_grace_secs: 300,
            batch_yield_ms: 1050,
            poll_interval_ms: 1000,
            add_attempts: 2,
            release_attempts: 3,
            release_backoff_ms: 500,
        }
    }
}

impl LeaseConfig {
    pub fn hold_timeout(&self, kind: &RequestKind) -> Duration {
        if kind.is_interactive() {
            Duration::from_secs(self.interactive_hold_secs)
        } else {
            Duration::from_secs(self.batch_hold_secs)
        }
    }

    pub fn wait_timeout(&self, kind: &RequestKind) -> Duration {
        if kind.is_interactive() {
            Duration::from_secs(self.interactive_wait_secs)
        } else {
            Duration::from_secs(self.batch_wait_secs)
        }
    }

    pub fn get_deadline(&self) -> Duration {
        Duration::from_millis(self.get_deadline_ms)
    }

    pub fn set_deadline(&self) -> Duration {
        Duration::from_millis(self.set_deadline_ms)
    }

    pub fn fairness_check_deadline(&self) -> Duration {
        Duration::from_millis(self.fairness_check_deadline_ms)
    }

    pub fn interactive_grace(&self) -> Duration {
        Duration::from_secs(self.interactive_grace_secs)
    }

    pub fn batch_yield(&self) -> Duration {
        Duration::from_millis(self.batch_yield_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn release_backoff(&self) -> Duration {
        Duration::from_millis(self.release_backoff_ms)
    }
}

/// Consistency auditing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Enforcement mode every request starts with
    pub default_enforcement: EnforcementMode,
    /// Raise violations outside the test environment too
    pub raise_on_violation: bool,
    /// Capture a backtrace for every audited put (expensive)
    pub capture_backtraces: bool,
}

impl SafetyConfig {
    /// Whether violations are returned as errors rather than logged
    pub fn raises_in(&self, environment: Environment) -> bool {
        self.raise_on_violation || environment == Environment::Test
    }
}

impl Config {
    /// Configuration for tests: violations raise
    pub fn for_tests() -> Self {
        Self {
            environment: Environment::Test,
            ..Self::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.leases.add_attempts == 0 {
            return Err(Error::Config("leases.add_attempts must be at least 1".into()));
        }
        if self.leases.release_attempts == 0 {
            return Err(Error::Config(
                "leases.release_attempts must be at least 1".into(),
            ));
        }
        if self.leases.poll_interval_ms == 0 {
            return Err(Error::Config("leases.poll_interval_ms must be non-zero".into()));
        }
        Ok(())
    }
}
