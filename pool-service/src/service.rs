//! Service wiring and lifecycle
//!
//! Startup: validate config → restore or bootstrap state → build telemetry,
//! metrics and scheduler. Shutdown: mark unhealthy, save state once more.

use crate::api::{self, AppState, Health};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::scheduler::{Schedule, Scheduler};
use crate::telemetry::{self, TelemetryPort};
use crate::{Error, Result};
use axum::Router;
use pool_core::{StateStore, StorePaths};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Every long-lived handle the process owns
#[derive(Debug)]
pub struct Service {
    config: Config,
    store: Arc<StateStore>,
    telemetry: Arc<dyn TelemetryPort>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<Metrics>,
    health: Arc<Health>,
}

impl Service {
    /// Build every component from a validated config
    pub fn from_config(config: Config) -> Result<Self> {
        let schedule = Schedule::resolve(&config.schedule.run_time, &config.schedule.timezone);

        let store = Arc::new(StateStore::open_or_bootstrap(
            StorePaths::new(&config.storage.data_dir),
            || config.bootstrap_state(),
        )?);

        let metrics = Arc::new(Metrics::new()?);
        metrics.supply.set(store.read(|s| s.supply));

        let telemetry = telemetry::from_config(&config.telemetry, schedule.timezone());
        let scheduler = Arc::new(Scheduler::new(
            schedule,
            Arc::clone(&store),
            Arc::clone(&telemetry),
            Arc::clone(&metrics),
        ));

        info!(
            pool = %config.pool.name,
            mode = config.telemetry.mode.as_str(),
            run_time = %schedule.run_time(),
            timezone = %schedule.timezone(),
            data_dir = %config.storage.data_dir.display(),
            "Pool service initialized"
        );

        Ok(Self {
            config,
            store,
            telemetry,
            scheduler,
            metrics,
            health: Arc::new(Health::new()),
        })
    }

    /// State owner
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Scheduler handle
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Liveness flag
    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }

    /// HTTP router over this service's handles
    pub fn router(&self) -> Router {
        let state = AppState {
            store: Arc::clone(&self.store),
            telemetry: Arc::clone(&self.telemetry),
            scheduler: Arc::clone(&self.scheduler),
            metrics: Arc::clone(&self.metrics),
            health: Arc::clone(&self.health),
            config: Arc::new(self.config.summary()),
            auth_token: self.config.auth_token().map(Arc::from),
        };
        api::router(state, self.config.dashboard.static_dir.clone())
    }

    /// Mark unhealthy and save state one final time
    pub fn shutdown(&self) -> Result<()> {
        self.health.mark_shutting_down();
        self.store.persist()?;
        info!("Shutting down gracefully, state saved");
        Ok(())
    }

    /// Spawn the scheduler, serve HTTP until ctrl-c or SIGTERM, then shut down
    pub async fn serve(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.dashboard.port));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Dashboard listening");

        let scheduler = tokio::spawn(Arc::clone(&self.scheduler).run());

        axum::serve(listener, self.router())
            .with_graceful_shutdown(on_shutdown(
                shutdown_signal(),
                Arc::clone(&self.health),
            ))
            .await
            .map_err(|e| Error::Server(e.to_string()))?;

        scheduler.abort();
        if let Err(e) = self.shutdown() {
            error!(error = %e, "Final state save failed");
            return Err(e);
        }
        Ok(())
    }
}

/// Await `signal`, then report unhealthy before connections drain
async fn on_shutdown<F>(signal: F, health: Arc<Health>)
where
    F: std::future::Future<Output = ()>,
{
    signal.await;
    health.mark_shutting_down();
    info!("Health set to shutting_down, draining connections");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
