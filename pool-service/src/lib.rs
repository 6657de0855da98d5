//! Pool Service
//!
//! Runs the pool controller as a long-lived process: loads configuration,
//! restores or bootstraps state, advances the pool once a day and serves
//! a small JSON API.
//!
//! # Components
//!
//! 1. **Config**: TOML file plus environment overrides, validated at startup
//! 2. **Telemetry**: one [`telemetry::TelemetryPort`] per mode (manual, csv, webhook)
//! 3. **Scheduler**: sleeps until the configured local time, then runs one step
//! 4. **API**: axum router over the shared [`pool_core::StateStore`]
//!
//! # Example
//!
//! ```no_run
//! use pool_service::{Config, Service};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let service = Service::from_config(config)?;
//!     service.serve().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod telemetry;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use scheduler::{Schedule, Scheduler};
pub use service::Service;
