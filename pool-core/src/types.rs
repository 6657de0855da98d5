//! Core types for the pool controller
//!
//! All types are designed for:
//! - Lossless JSON persistence (`f64` values re-parse to identical bits)
//! - Deterministic canonical encoding for the audit chain
//! - Memory safety (no unsafe code)

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of traces retained in [`PoolState::history`]
pub const HISTORY_LIMIT: usize = 365;

/// Control formula parameters
///
/// Immutable once loaded. See [`FormulaParameters::validate`] for the
/// accepted ranges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormulaParameters {
    /// Target load ratio, in (0, 1)
    pub target_utilization: f64,

    /// Lower edge of the hysteresis band (minting below it)
    pub band_low: f64,

    /// Upper edge of the hysteresis band (exclusive)
    pub band_high: f64,

    /// Base fraction of volume depleted per step
    pub base_depletion_rate: f64,

    /// How strongly velocity deviation modulates depletion
    pub velocity_sensitivity: f64,

    /// Floor applied to supply when computing velocity
    pub min_supply_floor: f64,

    /// Floor applied to the utilization observation
    pub min_observation_floor: f64,
}

impl FormulaParameters {
    /// Default parameters scaled to a pool capacity
    pub fn for_capacity(capacity: f64) -> Self {
        Self {
            target_utilization: 0.618,
            band_low: 0.60,
            band_high: 0.62,
            base_depletion_rate: 0.000618,
            velocity_sensitivity: 0.1,
            min_supply_floor: 1e-9 * capacity,
            min_observation_floor: 1e-6,
        }
    }

    /// Check parameter ranges
    ///
    /// Requires `0 < target < 1`, `0 ≤ band_low < band_high ≤ 1`,
    /// positive base depletion and floors, and non-negative sensitivity.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("target_utilization", self.target_utilization),
            ("band_low", self.band_low),
            ("band_high", self.band_high),
            ("base_depletion_rate", self.base_depletion_rate),
            ("velocity_sensitivity", self.velocity_sensitivity),
            ("min_supply_floor", self.min_supply_floor),
            ("min_observation_floor", self.min_observation_floor),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::InvalidParameters(format!("{} must be finite", name)));
        }

        if !(self.target_utilization > 0.0 && self.target_utilization < 1.0) {
            return Err(Error::InvalidParameters(
                "target_utilization must be in (0, 1)".to_string(),
            ));
        }
        if !(0.0 <= self.band_low && self.band_low < self.band_high && self.band_high <= 1.0) {
            return Err(Error::InvalidParameters(format!(
                "band must satisfy 0 <= band_low < band_high <= 1 (got [{}, {}))",
                self.band_low, self.band_high
            )));
        }
        if self.base_depletion_rate <= 0.0 {
            return Err(Error::InvalidParameters(
                "base_depletion_rate must be > 0".to_string(),
            ));
        }
        if self.velocity_sensitivity < 0.0 {
            return Err(Error::InvalidParameters(
                "velocity_sensitivity must be >= 0".to_string(),
            ));
        }
        if self.min_supply_floor <= 0.0 {
            return Err(Error::InvalidParameters(
                "min_supply_floor must be > 0".to_string(),
            ));
        }
        if self.min_observation_floor <= 0.0 {
            return Err(Error::InvalidParameters(
                "min_observation_floor must be > 0".to_string(),
            ));
        }

        if self.target_utilization < self.band_low || self.target_utilization >= self.band_high {
            tracing::warn!(
                target_utilization = self.target_utilization,
                band_low = self.band_low,
                band_high = self.band_high,
                "target utilization lies outside the hysteresis band"
            );
        }

        Ok(())
    }
}

/// Full record of one step computation
///
/// Created once per step by [`crate::engine::step`], linked by
/// [`crate::chain::append`], never mutated after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    /// Wall-clock time of the computation (metadata only)
    pub timestamp: DateTime<Utc>,

    // Inputs
    /// Supply before the step
    pub prior_supply: f64,

    /// Observation actually used (after flooring)
    pub observation: f64,

    /// True when the raw observation was below the floor
    pub observation_floored: bool,

    /// Transaction volume for the interval
    pub volume: f64,

    /// Capacity ceiling
    pub capacity: f64,

    /// Parameters in force for this step
    pub parameters: FormulaParameters,

    // Intermediates
    /// `volume / max(prior_supply, min_supply_floor)`
    pub velocity: f64,

    /// Velocity-adjusted depletion multiplier (never negative)
    pub depletion_rate: f64,

    /// Amount removed from supply before minting
    pub depletion_amount: f64,

    /// Supply after depletion, clamped at zero
    pub supply_after_depletion: f64,

    /// `supply_after_depletion / observation`
    pub load_ratio: f64,

    /// Undamped mint amount (zero outside the mint branch)
    pub raw_mint: f64,

    /// Damped mint amount (zero outside the mint branch)
    pub damped_mint: f64,

    /// Net change applied after depletion
    pub delta: f64,

    // Outputs
    /// Supply after the step
    pub new_supply: f64,

    /// Depletion exceeded prior supply
    pub depletion_clamped: bool,

    /// Minting would have exceeded capacity
    pub capacity_clamped: bool,

    /// Reported step error (supply left unchanged)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Hex SHA-256 audit fingerprint, empty until linked
    #[serde(default)]
    pub fingerprint: String,
}

impl StepTrace {
    /// Name of the first numeric field that is NaN or infinite.
    ///
    /// JSON has no encoding for such values, so a trace carrying one could
    /// not be restored from the snapshot.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        let p = &self.parameters;
        [
            ("prior_supply", self.prior_supply),
            ("observation", self.observation),
            ("volume", self.volume),
            ("capacity", self.capacity),
            ("target_utilization", p.target_utilization),
            ("band_low", p.band_low),
            ("band_high", p.band_high),
            ("base_depletion_rate", p.base_depletion_rate),
            ("velocity_sensitivity", p.velocity_sensitivity),
            ("min_supply_floor", p.min_supply_floor),
            ("min_observation_floor", p.min_observation_floor),
            ("velocity", self.velocity),
            ("depletion_rate", self.depletion_rate),
            ("depletion_amount", self.depletion_amount),
            ("supply_after_depletion", self.supply_after_depletion),
            ("load_ratio", self.load_ratio),
            ("raw_mint", self.raw_mint),
            ("damped_mint", self.damped_mint),
            ("delta", self.delta),
            ("new_supply", self.new_supply),
        ]
        .into_iter()
        .find(|(_, value)| !value.is_finite())
        .map(|(name, _)| name)
    }
}

/// Pool state: current supply plus bounded trace history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    /// Current supply
    pub supply: f64,

    /// Capacity ceiling
    pub capacity: f64,

    /// Formula parameters
    pub parameters: FormulaParameters,

    /// Fingerprint of the last evicted trace ("" while nothing was evicted)
    #[serde(default)]
    pub chain_anchor: String,

    /// Most recent traces, oldest first
    #[serde(default)]
    pub history: Vec<StepTrace>,
}

impl PoolState {
    /// Fresh state for a pool with no history
    pub fn bootstrap(
        initial_supply: f64,
        capacity: f64,
        parameters: FormulaParameters,
    ) -> Result<Self> {
        let state = Self {
            supply: initial_supply,
            capacity,
            parameters,
            chain_anchor: String::new(),
            history: Vec::new(),
        };
        state.check_invariants()?;
        Ok(state)
    }

    /// Most recent trace, if any
    pub fn latest(&self) -> Option<&StepTrace> {
        self.history.last()
    }

    /// Fingerprint the next trace must link to
    pub fn chain_head(&self) -> &str {
        self.latest()
            .map(|t| t.fingerprint.as_str())
            .unwrap_or(&self.chain_anchor)
    }

    /// Apply a committed step and evict beyond [`HISTORY_LIMIT`]
    pub(crate) fn record(&mut self, new_supply: f64, trace: StepTrace) {
        self.supply = new_supply;
        self.history.push(trace);

        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            if let Some(last_evicted) = self.history.drain(..excess).last() {
                self.chain_anchor = last_evicted.fingerprint;
            }
        }
    }

    /// Check structural invariants of the state
    pub fn check_invariants(&self) -> Result<()> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(Error::InvariantViolation(format!(
                "capacity must be > 0 (got {})",
                self.capacity
            )));
        }
        if !(self.supply.is_finite() && self.supply >= 0.0 && self.supply <= self.capacity) {
            return Err(Error::InvariantViolation(format!(
                "supply {} outside [0, {}]",
                self.supply, self.capacity
            )));
        }
        if self.history.len() > HISTORY_LIMIT {
            return Err(Error::InvariantViolation(format!(
                "history holds {} traces (limit {})",
                self.history.len(),
                HISTORY_LIMIT
            )));
        }
        self.parameters.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters_are_valid() {
        let params = FormulaParameters::for_capacity(10_000.0);
        assert!(params.validate().is_ok());
        assert_eq!(params.min_supply_floor, 1e-9 * 10_000.0);
    }

    #[test]
    fn test_band_ordering_rejected() {
        let mut params = FormulaParameters::for_capacity(100.0);
        params.band_low = 0.7;
        params.band_high = 0.6;
        assert!(matches!(params.validate(), Err(Error::InvalidParameters(_))));

        params.band_low = 0.6;
        params.band_high = 0.6;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_non_finite_parameter_rejected() {
        let mut params = FormulaParameters::for_capacity(100.0);
        params.velocity_sensitivity = f64::NAN;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_bootstrap_checks_supply_bounds() {
        let params = FormulaParameters::for_capacity(100.0);
        assert!(PoolState::bootstrap(50.0, 100.0, params).is_ok());
        assert!(PoolState::bootstrap(150.0, 100.0, params).is_err());
        assert!(PoolState::bootstrap(-1.0, 100.0, params).is_err());
        assert!(PoolState::bootstrap(0.0, 0.0, params).is_err());
    }

    #[test]
    fn test_chain_head_falls_back_to_anchor() {
        let params = FormulaParameters::for_capacity(100.0);
        let mut state = PoolState::bootstrap(10.0, 100.0, params).unwrap();
        assert_eq!(state.chain_head(), "");

        state.chain_anchor = "abc".to_string();
        assert_eq!(state.chain_head(), "abc");
    }

    #[test]
    fn test_trace_error_field_omitted_when_none() {
        let params = FormulaParameters::for_capacity(100.0);
        let (_, trace) = crate::engine::step(10.0, 20.0, 1.0, 100.0, &params);
        let json = serde_json::to_string(&trace).unwrap();
        assert!(json.contains("\"fingerprint\""));
        assert!(!json.contains("\"error\""));
    }
}
