//! Controller configuration.
//!
//! The control law has two calibration parameters: the analysis period, which
//! is both the tick interval and the upper bound of the recommended pause, and
//! the smoothing factor α of the error signal.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ThrottleError};

/// Default analysis period: 1 second.
pub const DEFAULT_ANALYSIS_PERIOD_MS: u64 = 1_000;

/// Default smoothing factor α.
///
/// With 0.5 a single all-failure period raises the signal to one half, and
/// every quiet period afterwards halves it again.
pub const DEFAULT_SMOOTHING_FACTOR: f64 = 0.5;

/// Name of the TOML table the configuration may be nested under.
const CONFIG_TABLE: &str = "throttle";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ThrottleConfig {
    /// Interval between analysis ticks, in milliseconds.
    pub analysis_period_ms: u64,
    /// Weight of the newest period in the smoothed error signal, in (0, 1).
    pub smoothing_factor: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            analysis_period_ms: DEFAULT_ANALYSIS_PERIOD_MS,
            smoothing_factor: DEFAULT_SMOOTHING_FACTOR,
        }
    }
}

impl ThrottleConfig {
    pub fn analysis_period(&self) -> Duration {
        Duration::from_millis(self.analysis_period_ms)
    }

    pub fn with_analysis_period(mut self, period: Duration) -> Self {
        self.analysis_period_ms = period.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_smoothing_factor(mut self, alpha: f64) -> Self {
        self.smoothing_factor = alpha;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis_period_ms == 0 {
            return Err(ThrottleError::InvalidPeriod);
        }
        validate_smoothing_factor(self.smoothing_factor)
    }

    /// Parse a configuration from TOML, either at the top level or nested
    /// under a `[throttle]` table. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(content)?;
        let config = match table.remove(CONFIG_TABLE) {
            Some(nested @ toml::Value::Table(_)) => nested.try_into::<ThrottleConfig>()?,
            Some(other) => {
                return Err(ThrottleError::Config(format!(
                    "`{CONFIG_TABLE}` must be a table, found {}",
                    other.type_str()
                )))
            }
            None => toml::Value::Table(table).try_into::<ThrottleConfig>()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = ?path, "Reading throttle configuration file");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

pub(crate) fn validate_smoothing_factor(alpha: f64) -> Result<()> {
    if alpha > 0.0 && alpha < 1.0 {
        Ok(())
    } else {
        Err(ThrottleError::InvalidSmoothingFactor(alpha))
    }
}

/// Command line and environment overrides, meant to be flattened into the
/// argument parser of a host binary.
#[derive(clap::Parser, Debug, Default, Clone, Serialize, Deserialize)]
pub struct ThrottleConfigArgs {
    /// Interval between throttling analysis ticks, in milliseconds.
    #[arg(long, env = "THROTTLE_ANALYSIS_PERIOD_MS")]
    #[serde(
        rename = "analysis-period-ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub analysis_period_ms: Option<u64>,

    /// Weight of the newest period in the smoothed error signal, in (0, 1).
    #[arg(long, env = "THROTTLE_SMOOTHING_FACTOR")]
    #[serde(rename = "smoothing-factor", skip_serializing_if = "Option::is_none")]
    pub smoothing_factor: Option<f64>,
}

impl ThrottleConfigArgs {
    /// Apply the overrides that were set on top of `base` and validate the
    /// result.
    pub fn merge_into(self, base: ThrottleConfig) -> Result<ThrottleConfig> {
        let config = ThrottleConfig {
            analysis_period_ms: self.analysis_period_ms.unwrap_or(base.analysis_period_ms),
            smoothing_factor: self.smoothing_factor.unwrap_or(base.smoothing_factor),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn build(self) -> Result<ThrottleConfig> {
        self.merge_into(ThrottleConfig::default())
    }
}
