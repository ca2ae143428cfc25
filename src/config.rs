// Lease manager configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default lease TTL (10 seconds)
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Default bound on a single consensus round-trip (1 second)
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings shared by the lease manager and every lease it hands out.
///
/// Durations are stored in milliseconds so the file form stays flat:
///
/// ```json
/// { "ttl_ms": 10000, "apply_timeout_ms": 1000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a lease stays valid after its last successful renewal.
    pub ttl_ms: u64,

    /// Bound on acquire, release and reset commands submitted to the log.
    pub apply_timeout_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: millis(DEFAULT_TTL),
            apply_timeout_ms: millis(DEFAULT_APPLY_TIMEOUT),
        }
    }
}

impl LeaseConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = millis(ttl);
        self
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout_ms = millis(timeout);
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    /// Reads a JSON config file and validates it. Missing fields fall back
    /// to their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let config: LeaseConfig = serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_ms == 0 {
            return Err(Error::Config("ttl_ms must be greater than zero".into()));
        }
        if self.apply_timeout_ms == 0 {
            return Err(Error::Config("apply_timeout_ms must be greater than zero".into()));
        }
        // A lease that expires before its own acquire round-trip can finish is useless.
        if self.apply_timeout_ms >= self.ttl_ms {
            return Err(Error::Config(format!(
                "apply_timeout_ms ({}) must be shorter than ttl_ms ({})",
                self.apply_timeout_ms, self.ttl_ms
            )));
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
