//! Supply control formula
//!
//! One step = depletion proportional to volume (modulated by velocity),
//! followed by damped minting when the load ratio drops below the band.
//!
//! # Formula
//!
//! ```text
//! safe       = max(S, min_supply_floor)
//! velocity   = V / safe
//! rate       = max(0, 1 − k · (velocity − φ))
//! S'         = max(0, S − base · rate · V)
//! L          = S' / max(O, min_observation_floor)
//! L <  low   → Δ = (φ·O − S') · φ^(S'/C)
//! L ≥  low   → Δ = 0            (dead zone below high, no-op above)
//! S_new      = min(S' + Δ, C)
//! ```
//!
//! The engine never fails: invalid inputs produce a trace carrying the
//! error and leave supply unchanged.

use crate::types::{FormulaParameters, StepTrace};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Recoverable step errors, recorded in [`StepTrace::error`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    /// Capacity is not a positive finite number
    #[error("capacity must be > 0 (got {capacity})")]
    InvalidCapacity {
        /// Offending capacity
        capacity: f64,
    },

    /// An input is NaN, infinite, or a negative volume
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Compute one step using the current wall-clock time as trace metadata
pub fn step(
    prior_supply: f64,
    observation: f64,
    volume: f64,
    capacity: f64,
    params: &FormulaParameters,
) -> (f64, StepTrace) {
    step_at(Utc::now(), prior_supply, observation, volume, capacity, params)
}

/// Compute one step with an explicit timestamp
///
/// The timestamp is recorded in the trace only; it never enters the
/// arithmetic, so identical inputs give identical traces up to `timestamp`.
pub fn step_at(
    timestamp: DateTime<Utc>,
    prior_supply: f64,
    observation: f64,
    volume: f64,
    capacity: f64,
    params: &FormulaParameters,
) -> (f64, StepTrace) {
    let mut trace = StepTrace {
        timestamp,
        prior_supply,
        observation,
        observation_floored: false,
        volume,
        capacity,
        parameters: *params,
        velocity: 0.0,
        depletion_rate: 0.0,
        depletion_amount: 0.0,
        supply_after_depletion: 0.0,
        load_ratio: 0.0,
        raw_mint: 0.0,
        damped_mint: 0.0,
        delta: 0.0,
        new_supply: prior_supply,
        depletion_clamped: false,
        capacity_clamped: false,
        error: None,
        fingerprint: String::new(),
    };

    if let Err(err) = check_inputs(prior_supply, observation, volume, capacity) {
        tracing::warn!(error = %err, "step rejected, supply unchanged");
        trace.error = Some(err.to_string());
        return (prior_supply, trace);
    }

    let unchanged = trace.clone();

    let observation = if observation < params.min_observation_floor {
        trace.observation = params.min_observation_floor;
        trace.observation_floored = true;
        params.min_observation_floor
    } else {
        observation
    };

    // Depletion
    let safe_supply = prior_supply.max(params.min_supply_floor);
    let velocity = volume / safe_supply;
    let deviation = velocity - params.target_utilization;
    let depletion_rate = (1.0 - params.velocity_sensitivity * deviation).max(0.0);
    let depletion_amount = params.base_depletion_rate * depletion_rate * volume;

    let mut after = prior_supply - depletion_amount;
    if after < 0.0 {
        trace.depletion_clamped = true;
        after = 0.0;
    }

    trace.velocity = velocity;
    trace.depletion_rate = depletion_rate;
    trace.depletion_amount = depletion_amount;
    trace.supply_after_depletion = after;

    // Band policy
    let load_ratio = after / observation;
    trace.load_ratio = load_ratio;

    let mut delta = if load_ratio < params.band_low {
        let raw_mint = params.target_utilization * observation - after;
        let damping = params.target_utilization.powf(after / capacity);
        let damped = raw_mint * damping;
        trace.raw_mint = raw_mint;
        trace.damped_mint = damped;
        damped
    } else {
        // Dead zone [band_low, band_high) and the region above the band
        // both leave supply where depletion put it.
        0.0
    };

    let mut new_supply = after + delta;
    if new_supply > capacity {
        trace.capacity_clamped = true;
        delta = capacity - after;
        new_supply = capacity;
    }

    trace.delta = delta;
    trace.new_supply = new_supply;

    // Finite inputs can still overflow, e.g. a huge volume over a floored supply
    if let Some(field) = trace.non_finite_field() {
        let err = StepError::InvalidInput(format!("{} overflowed to a non-finite value", field));
        tracing::warn!(error = %err, "step rejected, supply unchanged");
        let mut rejected = unchanged;
        rejected.error = Some(err.to_string());
        return (prior_supply, rejected);
    }

    (new_supply, trace)
}

fn check_inputs(
    prior_supply: f64,
    observation: f64,
    volume: f64,
    capacity: f64,
) -> Result<(), StepError> {
    if !(capacity.is_finite() && capacity > 0.0) {
        return Err(StepError::InvalidCapacity { capacity });
    }
    if !prior_supply.is_finite() || prior_supply < 0.0 {
        return Err(StepError::InvalidInput(format!(
            "prior supply must be finite and >= 0 (got {})",
            prior_supply
        )));
    }
    // A NaN observation would slip past the floor comparison
    if observation.is_nan() || observation.is_infinite() {
        return Err(StepError::InvalidInput(format!(
            "observation must be finite (got {})",
            observation
        )));
    }
    if !volume.is_finite() || volume < 0.0 {
        return Err(StepError::InvalidInput(format!(
            "volume must be finite and >= 0 (got {})",
            volume
        )));
    }
    Ok(())
}
