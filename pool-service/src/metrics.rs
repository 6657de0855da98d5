//! Prometheus metrics for the pool service
//!
//! # Metrics
//!
//! - `pool_steps_total` - Steps committed
//! - `pool_step_errors_total` - Steps whose trace carries an engine error
//! - `pool_persist_failures_total` - Commits kept in memory but not on disk
//! - `pool_telemetry_fallbacks_total` - Steps run on the zero reading
//! - `pool_telemetry_updates_total` - Readings accepted over HTTP
//! - `pool_capacity_clamps_total` - Steps clamped at capacity
//! - `pool_supply` - Supply after the latest step
//! - `pool_step_duration_seconds` - Step latency including persistence

use pool_core::{Durability, StepTrace};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder,
};
use std::fmt;

/// Metrics collector with its own registry
#[derive(Clone)]
pub struct Metrics {
    /// Steps committed
    pub steps_total: IntCounter,

    /// Steps recorded with an engine error
    pub step_errors_total: IntCounter,

    /// Persistence failures after commit
    pub persist_failures_total: IntCounter,

    /// Steps that fell back to the zero reading
    pub telemetry_fallbacks_total: IntCounter,

    /// Readings accepted by POST /telemetry
    pub telemetry_updates_total: IntCounter,

    /// Steps clamped at capacity
    pub capacity_clamps_total: IntCounter,

    /// Current supply
    pub supply: Gauge,

    /// Step duration histogram
    pub step_duration: Histogram,

    registry: Registry,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("steps_total", &self.steps_total.get())
            .field("supply", &self.supply.get())
            .finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create a collector registered in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let steps_total = counter(&registry, "pool_steps_total", "Total number of steps committed")?;
        let step_errors_total = counter(
            &registry,
            "pool_step_errors_total",
            "Steps recorded with an engine error",
        )?;
        let persist_failures_total = counter(
            &registry,
            "pool_persist_failures_total",
            "Commits that could not be persisted",
        )?;
        let telemetry_fallbacks_total = counter(
            &registry,
            "pool_telemetry_fallbacks_total",
            "Steps that used the zero reading after a telemetry failure",
        )?;
        let telemetry_updates_total = counter(
            &registry,
            "pool_telemetry_updates_total",
            "Telemetry readings accepted over HTTP",
        )?;
        let capacity_clamps_total = counter(
            &registry,
            "pool_capacity_clamps_total",
            "Steps clamped at capacity",
        )?;

        let supply = Gauge::new("pool_supply", "Supply after the latest step")?;
        registry.register(Box::new(supply.clone()))?;

        let step_duration = Histogram::with_opts(
            HistogramOpts::new("pool_step_duration_seconds", "Histogram of step latencies")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(step_duration.clone()))?;

        Ok(Self {
            steps_total,
            step_errors_total,
            persist_failures_total,
            telemetry_fallbacks_total,
            telemetry_updates_total,
            capacity_clamps_total,
            supply,
            step_duration,
            registry,
        })
    }

    /// Record a committed step
    pub fn record_step(&self, trace: &StepTrace, durability: &Durability, duration_seconds: f64) {
        self.steps_total.inc();
        if trace.error.is_some() {
            self.step_errors_total.inc();
        }
        if trace.capacity_clamped {
            self.capacity_clamps_total.inc();
        }
        if !durability.is_persisted() {
            self.persist_failures_total.inc();
        }
        self.supply.set(trace.new_supply);
        self.step_duration.observe(duration_seconds);
    }

    /// Record a step that ran on the zero reading
    pub fn record_telemetry_fallback(&self) {
        self.telemetry_fallbacks_total.inc();
    }

    /// Record an accepted telemetry push
    pub fn record_telemetry_update(&self) {
        self.telemetry_updates_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric
    pub fn export(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
