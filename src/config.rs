// 12.0 config.rs: all settings in one place. tolerances, schedules, solver bounds.
// each module owns its params struct with defaults; SpineConfig just aggregates them.
// 12.1 the tighter of the two tolerances governs: attribution may never be looser than
// reconciliation, validate() refuses that combination.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::attribution::AttributionParams;
use crate::gate::GateParams;
use crate::metrics::MetricsParams;
use crate::reconcile::ReconciliationParams;
use crate::rolling::{RollingParams, RollingWindow};
use crate::snapshot::SnapshotParams;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpineConfig {
    pub snapshot: SnapshotParams,
    pub gate: GateParams,
    pub reconciliation: ReconciliationParams,
    pub attribution: AttributionParams,
    pub metrics: MetricsParams,
    pub rolling: RollingParams,
    pub engine: EngineParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineParams {
    /// Maximum number of events kept in memory.
    pub max_events: usize,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self { max_events: 100_000 }
    }
}

impl SpineConfig {
    // staging carries prices and fx one business weekend forward so monday builds don't stall
    pub fn staging() -> Self {
        let mut config = Self::default();
        config.snapshot.price_lookback_days = 3;
        config.snapshot.fx_lookback_days = 3;
        config.gate.expected_build_ms = 5 * 60 * 1000;
        config
    }

    // production: exact-date prices, tighter aggregate schedules, more solver headroom
    pub fn production() -> Self {
        let mut config = Self::default();
        config.metrics.irr_max_iterations = 200;
        config.rolling.warning_multiple = 3;
        config.rolling.intervals_ms.insert(RollingWindow::D30, 30 * 60 * 1000);
        config.engine.max_events = 1_000_000;
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconciliation.tolerance_bps <= Decimal::ZERO {
            return Err(ConfigError::InvalidTolerance {
                reason: "Reconciliation tolerance must be positive".to_string(),
            });
        }
        if self.attribution.tolerance_bps <= Decimal::ZERO {
            return Err(ConfigError::InvalidTolerance {
                reason: "Attribution tolerance must be positive".to_string(),
            });
        }
        if self.attribution.tolerance_bps > self.reconciliation.tolerance_bps {
            return Err(ConfigError::InvalidTolerance {
                reason: format!(
                    "Attribution tolerance {}bp looser than reconciliation tolerance {}bp",
                    self.attribution.tolerance_bps, self.reconciliation.tolerance_bps
                ),
            });
        }

        if self.gate.expected_build_ms <= 0 {
            return Err(ConfigError::InvalidGate {
                reason: "Expected build time must be positive".to_string(),
            });
        }

        if self.metrics.periods_per_year == 0 {
            return Err(ConfigError::InvalidMetrics {
                reason: "Periods per year must be positive".to_string(),
            });
        }
        if self.metrics.irr_max_iterations == 0 || self.metrics.irr_tolerance <= Decimal::ZERO {
            return Err(ConfigError::InvalidMetrics {
                reason: "IRR solver needs iterations and a positive tolerance".to_string(),
            });
        }
        if self.metrics.irr_initial_guess <= dec!(-1) {
            return Err(ConfigError::InvalidMetrics {
                reason: "IRR initial guess must be above -100%".to_string(),
            });
        }
        if self.metrics.volatility_windows_days.contains(&0) || self.metrics.return_windows_days.contains(&0) {
            return Err(ConfigError::InvalidMetrics {
                reason: "Windows must span at least one day".to_string(),
            });
        }

        if self.rolling.warning_multiple < 1 {
            return Err(ConfigError::InvalidRolling {
                reason: "Warning multiple must be at least 1".to_string(),
            });
        }
        for window in RollingWindow::ALL {
            if self.rolling.interval_ms(window) <= 0 {
                return Err(ConfigError::InvalidRolling {
                    reason: format!("Refresh interval for {window} must be positive"),
                });
            }
        }

        if self.engine.max_events == 0 {
            return Err(ConfigError::InvalidEngine {
                reason: "Event log needs room for at least one event".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid tolerance: {reason}")]
    InvalidTolerance { reason: String },

    #[error("Invalid gate settings: {reason}")]
    InvalidGate { reason: String },

    #[error("Invalid metrics settings: {reason}")]
    InvalidMetrics { reason: String },

    #[error("Invalid rolling aggregate settings: {reason}")]
    InvalidRolling { reason: String },

    #[error("Invalid engine settings: {reason}")]
    InvalidEngine { reason: String },
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn config(&self) -> SpineConfig {
        match self {
            Environment::Development => SpineConfig::default(),
            Environment::Staging => SpineConfig::staging(),
            Environment::Production => SpineConfig::production(),
        }
    }
}
