//! Configuration for the pool service

use crate::{Error, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use pool_core::{FormulaParameters, PoolState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "POOL_CONFIG";

/// Default config locations, tried in order
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./pool.toml", "/etc/pool-controller/pool.toml"];

/// Days of history the dashboard shows when unset
pub const DEFAULT_HISTORY_DAYS: u32 = 30;

/// Run time format (24h clock)
pub const RUN_TIME_FORMAT: &str = "%H:%M";

/// Pool service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pool identity and bounds
    pub pool: PoolConfig,

    /// Display unit of the managed resource
    #[serde(default)]
    pub resource: ResourceConfig,

    /// Telemetry acquisition
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Daily step schedule
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// HTTP dashboard
    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// Persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// Optional formula parameter overrides
    #[serde(default)]
    pub formula: FormulaOverrides,
}

/// Pool identity and bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Display name
    pub name: String,

    /// Hard upper bound on supply
    pub capacity: f64,

    /// Supply used when no persisted state exists
    pub initial_supply: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            capacity: 10_000.0,
            initial_supply: 1_000.0,
        }
    }
}

/// Resource display settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Unit label, e.g. "credits"
    pub unit: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            unit: "units".to_string(),
        }
    }
}

/// Telemetry acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Operator pushes readings over HTTP
    #[default]
    Manual,
    /// Readings are looked up by date in a CSV file
    Csv,
    /// An external system pushes readings over HTTP
    Webhook,
}

impl TelemetryMode {
    /// Lowercase name as it appears in config
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryMode::Manual => "manual",
            TelemetryMode::Csv => "csv",
            TelemetryMode::Webhook => "webhook",
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Acquisition mode
    #[serde(default)]
    pub mode: TelemetryMode,

    /// CSV file (required in csv mode)
    #[serde(default)]
    pub csv_path: Option<PathBuf>,

    /// Shared secret for POST /telemetry
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Daily schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local wall-clock time "HH:MM"
    pub run_time: String,

    /// IANA timezone name
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            run_time: "00:00".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Dashboard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// HTTP listen port
    pub port: u16,

    /// Days of history shown by the dashboard (0 means default)
    #[serde(default)]
    pub show_history_days: u32,

    /// Directory of static dashboard files
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            show_history_days: DEFAULT_HISTORY_DAYS,
            static_dir: None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding state.json and history.csv
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Optional overrides of the capacity-derived formula defaults
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FormulaOverrides {
    /// Target load ratio
    pub target_utilization: Option<f64>,
    /// Lower edge of the dead zone
    pub band_low: Option<f64>,
    /// Upper edge of the dead zone
    pub band_high: Option<f64>,
    /// Depletion rate at zero velocity
    pub base_depletion_rate: Option<f64>,
    /// Extra depletion per unit of velocity
    pub velocity_sensitivity: Option<f64>,
    /// Supply floor used in velocity
    pub min_supply_floor: Option<f64>,
    /// Observation floor used in the load ratio
    pub min_observation_floor: Option<f64>,
}

impl FormulaOverrides {
    /// Apply overrides on top of `base`
    pub fn apply(&self, base: FormulaParameters) -> FormulaParameters {
        FormulaParameters {
            target_utilization: self.target_utilization.unwrap_or(base.target_utilization),
            band_low: self.band_low.unwrap_or(base.band_low),
            band_high: self.band_high.unwrap_or(base.band_high),
            base_depletion_rate: self.base_depletion_rate.unwrap_or(base.base_depletion_rate),
            velocity_sensitivity: self
                .velocity_sensitivity
                .unwrap_or(base.velocity_sensitivity),
            min_supply_floor: self.min_supply_floor.unwrap_or(base.min_supply_floor),
            min_observation_floor: self
                .min_observation_floor
                .unwrap_or(base.min_observation_floor),
        }
    }
}

/// Public view of the configuration served at GET /config
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSummary {
    /// Pool display name
    pub pool_name: String,
    /// Resource unit
    pub unit: String,
    /// Days of history to chart
    pub show_history_days: u32,
    /// Local step time "HH:MM"
    pub schedule_run_time: String,
    /// IANA timezone of the schedule
    pub schedule_timezone: String,
    /// Whether POST /telemetry needs a token
    pub telemetry_auth_required: bool,
    /// Active telemetry mode
    pub telemetry_mode: TelemetryMode,
}

impl Config {
    /// Load from file, apply environment overrides and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without validating
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults plus environment overrides, validated
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file and load it.
    ///
    /// Lookup order: `explicit` → `$POOL_CONFIG` → `./pool.toml` →
    /// `/etc/pool-controller/pool.toml`. Finding none is an error.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self> {
        let path = Self::locate(explicit, std::env::var_os(CONFIG_ENV).map(PathBuf::from))?;
        info!(path = %path.display(), "Loading configuration");
        Self::from_file(path)
    }

    fn locate(explicit: Option<PathBuf>, from_env: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = explicit.or(from_env) {
            return Ok(path);
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no config file found (tried {})",
                    DEFAULT_CONFIG_PATHS.join(", ")
                ))
            })
    }

    /// Apply `POOL_DATA_DIR`, `POOL_PORT` and `POOL_TELEMETRY_TOKEN`
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(data_dir) = lookup("POOL_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(data_dir);
        }

        if let Some(port) = lookup("POOL_PORT") {
            match port.parse() {
                Ok(port) => self.dashboard.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid POOL_PORT"),
            }
        }

        if let Some(token) = lookup("POOL_TELEMETRY_TOKEN") {
            self.telemetry.auth_token = Some(token);
        }
    }

    /// Validate and normalize. Every failure here is fatal at startup.
    pub fn validate(&mut self) -> Result<()> {
        let pool = &self.pool;
        if !pool.capacity.is_finite() || pool.capacity <= 0.0 {
            return Err(Error::Config(format!(
                "pool.capacity must be > 0 (got {})",
                pool.capacity
            )));
        }
        if !pool.initial_supply.is_finite()
            || pool.initial_supply < 0.0
            || pool.initial_supply > pool.capacity
        {
            return Err(Error::Config(format!(
                "pool.initial_supply must be in [0, {}] (got {})",
                pool.capacity, pool.initial_supply
            )));
        }

        if self.telemetry.mode == TelemetryMode::Csv
            && self
                .telemetry
                .csv_path
                .as_ref()
                .map_or(true, |p| p.as_os_str().is_empty())
        {
            return Err(Error::Config(
                "telemetry.csv_path is required when mode is csv".to_string(),
            ));
        }

        self.run_time()?;
        self.timezone()?;

        if self.dashboard.port < 1024 {
            return Err(Error::Config(format!(
                "dashboard.port must be in 1024-65535 (got {})",
                self.dashboard.port
            )));
        }
        if self.dashboard.show_history_days == 0 {
            self.dashboard.show_history_days = DEFAULT_HISTORY_DAYS;
        }

        self.formula_parameters()
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(())
    }

    /// Parsed run time
    pub fn run_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.schedule.run_time, RUN_TIME_FORMAT).map_err(|_| {
            Error::Config(format!(
                "schedule.run_time must be HH:MM (got {:?})",
                self.schedule.run_time
            ))
        })
    }

    /// Parsed timezone
    pub fn timezone(&self) -> Result<Tz> {
        self.schedule.timezone.parse::<Tz>().map_err(|_| {
            Error::Config(format!(
                "schedule.timezone is not a known IANA zone: {:?}",
                self.schedule.timezone
            ))
        })
    }

    /// Formula parameters: capacity-derived defaults with overrides applied
    pub fn formula_parameters(&self) -> FormulaParameters {
        self.formula
            .apply(FormulaParameters::for_capacity(self.pool.capacity))
    }

    /// Fresh state for first start
    pub fn bootstrap_state(&self) -> pool_core::Result<PoolState> {
        PoolState::bootstrap(
            self.pool.initial_supply,
            self.pool.capacity,
            self.formula_parameters(),
        )
    }

    /// Configured token, if non-empty
    pub fn auth_token(&self) -> Option<&str> {
        self.telemetry
            .auth_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Public summary for the dashboard
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            pool_name: self.pool.name.clone(),
            unit: self.resource.unit.clone(),
            show_history_days: self.dashboard.show_history_days,
            schedule_run_time: self.schedule.run_time.clone(),
            schedule_timezone: self.schedule.timezone.clone(),
            telemetry_auth_required: self.auth_token().is_some(),
            telemetry_mode: self.telemetry.mode,
        }
    }
}
