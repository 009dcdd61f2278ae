//! Orchestrator configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SliceError};
use crate::pricing::PriceTable;

/// What to do when a slice is requested while another is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the running slice, first come first served.
    #[default]
    Queue,
    /// Fail immediately with `EngineBusy`.
    Reject,
}

/// Orchestrator settings, usually read from `slicebay.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicerConfig {
    /// How long to wait for the engine's `init_done` (ms).
    pub init_timeout_ms: u64,
    /// Caller-side deadline for one composite slice (ms).
    pub slice_timeout_ms: u64,
    /// Concurrent slice policy.
    pub busy_policy: BusyPolicy,
    /// Status events buffered per subscriber.
    pub status_capacity: usize,
    /// URL fragments short-circuited while the engine bootstraps.
    pub stub_patterns: Vec<String>,
    /// Price lookup.
    pub pricing: PriceTable,
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: 10_000,
            slice_timeout_ms: 120_000,
            busy_policy: BusyPolicy::Queue,
            status_capacity: 64,
            stub_patterns: vec!["/fonts/".into(), ".woff".into()],
            pricing: PriceTable::default(),
        }
    }
}

impl SlicerConfig {
    /// Parse from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SliceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SliceError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject values that would stall or break the orchestrator.
    pub fn validate(&self) -> Result<()> {
        if self.init_timeout_ms == 0 || self.slice_timeout_ms == 0 {
            return Err(SliceError::Config("timeouts must be non-zero".into()));
        }
        if self.status_capacity == 0 {
            return Err(SliceError::Config("status_capacity must be non-zero".into()));
        }
        self.pricing.validate()
    }

    /// Handshake timeout.
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Composite slice timeout.
    pub fn slice_timeout(&self) -> Duration {
        Duration::from_millis(self.slice_timeout_ms)
    }
}
