//! Pool Core
//!
//! Deterministic supply controller for a single resource pool, with a
//! hash-chained audit trail and crash-safe persistence.
//!
//! # Architecture
//!
//! - **StepEngine** ([`engine`]): pure control formula, no I/O
//! - **HashChain** ([`chain`]): SHA-256 fingerprint linking each trace to the previous one
//! - **StateStore** ([`store`]): lock-guarded state, atomic snapshot file, append-only CSV log
//!
//! # Invariants
//!
//! - Bounded supply: `0 ≤ supply ≤ capacity` after every commit
//! - Deterministic replay: same inputs → same trace, bit for bit
//! - Append-only: traces are never modified once committed
//! - Bounded history: at most [`HISTORY_LIMIT`] traces retained
//!
//! # Example
//!
//! ```
//! use pool_core::{chain, engine, FormulaParameters};
//!
//! let params = FormulaParameters::for_capacity(10_000.0);
//! let (supply, trace) = engine::step(1_000.0, 2_000.0, 50.0, 10_000.0, &params);
//! let (fingerprint, trace) = chain::append(chain::GENESIS, trace);
//!
//! assert!(supply > trace.supply_after_depletion);
//! assert_eq!(fingerprint.len(), 64);
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod canonical;
pub mod chain;
pub mod engine;
pub mod error;
pub mod store;
pub mod types;

// Re-exports
pub use chain::AuditChain;
pub use engine::StepError;
pub use error::{Error, Result};
pub use store::{Durability, LoadOutcome, StateStore, StorePaths};
pub use types::{FormulaParameters, PoolState, StepTrace, HISTORY_LIMIT};
