//! Canonical serialization for audit fingerprints
//!
//! Ensures a deterministic byte representation of a [`StepTrace`].
//! Uses fixed field order, big-endian integers, IEEE-754 bit patterns for
//! floats, length-prefixed strings and explicit presence markers.
//!
//! Changing anything here invalidates every stored fingerprint; bump
//! [`CANONICAL_VERSION`] when doing so.

use crate::types::{FormulaParameters, StepTrace};

/// Leading version byte of every canonical encoding
pub const CANONICAL_VERSION: u8 = 1;

/// Canonical serializer
#[derive(Debug, Default)]
pub struct CanonicalSerializer {
    buffer: Vec<u8>,
}

impl CanonicalSerializer {
    /// Create new serializer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn write_u8(&mut self, n: u8) {
        self.buffer.push(n);
    }

    fn write_u32(&mut self, n: u32) {
        self.write_bytes(&n.to_be_bytes());
    }

    fn write_i64(&mut self, n: i64) {
        self.write_bytes(&n.to_be_bytes());
    }

    /// Raw bit pattern, so -0.0 and 0.0 encode differently
    fn write_f64(&mut self, x: f64) {
        self.write_bytes(&x.to_bits().to_be_bytes());
    }

    fn write_bool(&mut self, b: bool) {
        self.write_u8(b as u8);
    }

    /// Length-prefixed UTF-8
    fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    fn write_option_string(&mut self, opt: &Option<String>) {
        match opt {
            Some(s) => {
                self.write_u8(1);
                self.write_string(s);
            }
            None => self.write_u8(0),
        }
    }

    /// Finalize and return bytes
    pub fn finalize(self) -> Vec<u8> {
        self.buffer
    }
}

impl FormulaParameters {
    fn write_canonical(&self, ser: &mut CanonicalSerializer) {
        ser.write_f64(self.target_utilization);
        ser.write_f64(self.band_low);
        ser.write_f64(self.band_high);
        ser.write_f64(self.base_depletion_rate);
        ser.write_f64(self.velocity_sensitivity);
        ser.write_f64(self.min_supply_floor);
        ser.write_f64(self.min_observation_floor);
    }
}

impl StepTrace {
    /// Canonical bytes of the trace, excluding `fingerprint`
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut ser = CanonicalSerializer::new();
        ser.write_u8(CANONICAL_VERSION);

        // Seconds and sub-second nanos separately: timestamp_nanos overflows past 2262
        ser.write_i64(self.timestamp.timestamp());
        ser.write_u32(self.timestamp.timestamp_subsec_nanos());

        // Inputs
        ser.write_f64(self.prior_supply);
        ser.write_f64(self.observation);
        ser.write_bool(self.observation_floored);
        ser.write_f64(self.volume);
        ser.write_f64(self.capacity);
        self.parameters.write_canonical(&mut ser);

        // Intermediates
        ser.write_f64(self.velocity);
        ser.write_f64(self.depletion_rate);
        ser.write_f64(self.depletion_amount);
        ser.write_f64(self.supply_after_depletion);
        ser.write_f64(self.load_ratio);
        ser.write_f64(self.raw_mint);
        ser.write_f64(self.damped_mint);
        ser.write_f64(self.delta);

        // Outputs
        ser.write_f64(self.new_supply);
        ser.write_bool(self.depletion_clamped);
        ser.write_bool(self.capacity_clamped);
        ser.write_option_string(&self.error);

        ser.finalize()
    }
}
