//! Daily step scheduler
//!
//! Sleeps until the configured local wall-clock time, runs one step and
//! commits it. The scheduler task is the only writer of pool state.

use crate::config::RUN_TIME_FORMAT;
use crate::metrics::Metrics;
use crate::telemetry::{self, TelemetryPort};
use crate::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use pool_core::{chain, engine, Durability, StateStore, StepTrace};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Longest DST gap we search across, in minutes
const MAX_GAP_MINUTES: i64 = 180;

/// When the daily step runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    run_time: NaiveTime,
    timezone: Tz,
}

impl Schedule {
    /// Schedule at `run_time` local time in `timezone`
    pub fn new(run_time: NaiveTime, timezone: Tz) -> Self {
        Self { run_time, timezone }
    }

    /// Parse config strings, falling back to UTC and 00:00 with a warning
    pub fn resolve(run_time: &str, timezone: &str) -> Self {
        let timezone = timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(timezone, "Unknown timezone, falling back to UTC");
            chrono_tz::UTC
        });
        let run_time = NaiveTime::parse_from_str(run_time, RUN_TIME_FORMAT).unwrap_or_else(|_| {
            warn!(run_time, "Invalid run time, falling back to 00:00");
            NaiveTime::MIN
        });
        Self::new(run_time, timezone)
    }

    /// Local run time
    pub fn run_time(&self) -> NaiveTime {
        self.run_time
    }

    /// Schedule timezone
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Next run instant at or after `now`.
    ///
    /// Today's run time if it is not yet past, otherwise tomorrow's.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.timezone).date_naive();
        let candidate = self.at_local(today);
        if candidate < now {
            self.at_local(today.succ_opt().unwrap_or(today))
        } else {
            candidate
        }
    }

    /// Next run instant given the slot that last ran.
    ///
    /// A wall clock that lags the timer must not fire the same slot twice,
    /// so the search starts at least one second after `last_run`.
    pub fn next_slot(
        &self,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        let from = last_run.map_or(now, |t| now.max(t + Duration::seconds(1)));
        self.next_run_after(from)
    }

    /// Resolve the run time on `date`.
    ///
    /// Ambiguous local times take the earlier instant. Local times that do
    /// not exist move forward to the first minute that does.
    fn at_local(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(self.run_time);
        (0..=MAX_GAP_MINUTES)
            .find_map(|shift| {
                self.timezone
                    .from_local_datetime(&(local + Duration::minutes(shift)))
                    .earliest()
            })
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local))
    }
}

/// Scheduler state, reported by /health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Phase {
    /// Sleeping until `next_run`
    Waiting {
        /// Next scheduled step
        next_run: DateTime<Utc>,
    },
    /// Executing a step
    Running,
}

/// Outcome of one step
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Committed trace
    pub trace: StepTrace,

    /// Whether the commit reached disk
    pub durability: Durability,

    /// Telemetry failure that forced the zero reading
    pub telemetry_error: Option<String>,
}

/// Runs the daily step
#[derive(Debug)]
pub struct Scheduler {
    schedule: Schedule,
    store: Arc<StateStore>,
    telemetry: Arc<dyn TelemetryPort>,
    metrics: Arc<Metrics>,
    phase: RwLock<Phase>,
}

impl Scheduler {
    /// Create a scheduler waiting for its first run
    pub fn new(
        schedule: Schedule,
        store: Arc<StateStore>,
        telemetry: Arc<dyn TelemetryPort>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let next_run = schedule.next_run_after(Utc::now());
        Self {
            schedule,
            store,
            telemetry,
            metrics,
            phase: RwLock::new(Phase::Waiting { next_run }),
        }
    }

    /// Schedule in use
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    /// Fetch telemetry, step, link and commit.
    ///
    /// Telemetry failures degrade to a zero reading and engine errors are
    /// recorded in the trace; only a rejected commit returns `Err`.
    pub fn run_once(&self) -> Result<StepReport> {
        let started = Instant::now();

        let (reading, telemetry_error) = telemetry::fetch_or_default(self.telemetry.as_ref());
        if telemetry_error.is_some() {
            self.metrics.record_telemetry_fallback();
        }
        if reading.observation == 0.0 {
            warn!("Observation is zero, step will use the observation floor");
        }
        if reading.volume == 0.0 {
            warn!("Volume is zero, no depletion this step");
        }

        let (prior, capacity, params, head) = self.store.read(|s| {
            (s.supply, s.capacity, s.parameters, s.chain_head().to_string())
        });

        let (new_supply, trace) =
            engine::step(prior, reading.observation, reading.volume, capacity, &params);
        let (_, trace) = chain::append(&head, trace);

        let durability = self.store.commit(new_supply, trace.clone())?;
        self.metrics
            .record_step(&trace, &durability, started.elapsed().as_secs_f64());

        info!(
            prior_supply = prior,
            new_supply,
            observation = trace.observation,
            volume = trace.volume,
            load_ratio = trace.load_ratio,
            delta = trace.delta,
            persisted = durability.is_persisted(),
            "Step committed"
        );

        Ok(StepReport {
            trace,
            durability,
            telemetry_error: telemetry_error.map(|e| e.to_string()),
        })
    }

    /// Run forever: wait for the next run time, step, repeat
    pub async fn run(self: Arc<Self>) {
        let mut last_run: Option<DateTime<Utc>> = None;

        loop {
            let now = Utc::now();
            let next_run = self.schedule.next_slot(now, last_run);
            *self.phase.write() = Phase::Waiting { next_run };

            let wait = (next_run - now).to_std().unwrap_or_default();
            info!(
                next_run = %next_run.with_timezone(&self.schedule.timezone),
                wait_secs = wait.as_secs(),
                "Next step scheduled"
            );
            tokio::time::sleep(wait).await;

            *self.phase.write() = Phase::Running;
            last_run = Some(next_run);

            let this = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || this.run_once()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Step commit rejected, state unchanged"),
                Err(e) => error!(error = %e, "Step task failed"),
            }
        }
    }
}
