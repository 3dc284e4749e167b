//! ---
//! pvsim_section: "01-core-functionality"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Shared primitives and utilities for the meter and PV services."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;
use crate::time::{total_iterations, SECONDS_PER_DAY};

fn default_environment() -> String {
    "DEV".to_owned()
}

fn default_broker_host() -> String {
    "rabbitmq".to_owned()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_queue() -> String {
    "meter_simulator".to_owned()
}

fn default_broker_credential() -> String {
    "guest".to_owned()
}

fn default_broker_vhost() -> String {
    "/".to_owned()
}

fn default_broker_initial_delay() -> u64 {
    20
}

fn default_retry_attempts() -> usize {
    5
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_retry_jitter_ms() -> u64 {
    50
}

fn default_pv_max() -> i64 {
    9000
}

fn default_iteration() -> u32 {
    60
}

fn default_delimiter() -> String {
    ";".to_owned()
}

fn default_sunrise_start() -> f64 {
    6.0
}

fn default_sunrise_end() -> f64 {
    8.0
}

fn default_zenith() -> f64 {
    14.0
}

fn default_sundown_start() -> f64 {
    20.0
}

fn default_sundown_end() -> f64 {
    21.0
}

fn default_light_eff_lw() -> f64 {
    0.1
}

fn default_light_eff_std() -> f64 {
    0.8125
}

fn default_max_power() -> f64 {
    9000.0
}

fn default_max_consume() -> u32 {
    18
}

fn default_day_pause() -> u64 {
    3
}

fn default_output_file() -> PathBuf {
    PathBuf::from("output.csv")
}

fn default_max_execution_time() -> u64 {
    3600
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}

/// Flat key/value settings, keyed exactly like the service environment
/// variables (`BROKER_HOST` becomes `broker_host`). A TOML config file uses
/// the same lowercase keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_environment")]
    pub environment_pv: String,
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_broker_queue")]
    pub broker_queue: String,
    #[serde(default = "default_broker_credential")]
    pub broker_username: String,
    #[serde(default = "default_broker_credential")]
    pub broker_password: String,
    #[serde(default = "default_broker_vhost")]
    pub broker_vhost: String,
    #[serde(default = "default_broker_initial_delay")]
    pub broker_initial_delay: u64,
    #[serde(default = "default_retry_attempts")]
    pub broker_retry_attempts: usize,
    #[serde(default = "default_retry_base_ms")]
    pub broker_retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub broker_retry_max_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub broker_retry_jitter_ms: u64,
    #[serde(default)]
    pub pv_min: i64,
    #[serde(default = "default_pv_max")]
    pub pv_max: i64,
    #[serde(default = "default_iteration")]
    pub iteration: u32,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub reading_strategy: StrategyKind,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_sunrise_start")]
    pub sunrise_start: f64,
    #[serde(default = "default_sunrise_end")]
    pub sunrise_end: f64,
    #[serde(default = "default_zenith")]
    pub zenith: f64,
    #[serde(default = "default_sundown_start")]
    pub sundown_start: f64,
    #[serde(default = "default_sundown_end")]
    pub sundown_end: f64,
    #[serde(default = "default_light_eff_lw")]
    pub light_eff_lw: f64,
    #[serde(default = "default_light_eff_std")]
    pub light_eff_std: f64,
    #[serde(default = "default_max_power")]
    pub max_power: f64,
    #[serde(default = "default_max_consume")]
    pub max_consume: u32,
    #[serde(default = "default_day_pause")]
    pub day_pause: u64,
    #[serde(default)]
    pub initial_day: u64,
    #[serde(default)]
    pub max_days: Option<u64>,
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,
    #[serde(default)]
    pub execution_log: Option<PathBuf>,
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,
    #[serde(default)]
    pub sign_convention: SignConvention,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub log_file_prefix: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment_pv: default_environment(),
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            broker_queue: default_broker_queue(),
            broker_username: default_broker_credential(),
            broker_password: default_broker_credential(),
            broker_vhost: default_broker_vhost(),
            broker_initial_delay: default_broker_initial_delay(),
            broker_retry_attempts: default_retry_attempts(),
            broker_retry_base_ms: default_retry_base_ms(),
            broker_retry_max_ms: default_retry_max_ms(),
            broker_retry_jitter_ms: default_retry_jitter_ms(),
            pv_min: 0,
            pv_max: default_pv_max(),
            iteration: default_iteration(),
            delimiter: default_delimiter(),
            reading_strategy: StrategyKind::default(),
            seed: None,
            sunrise_start: default_sunrise_start(),
            sunrise_end: default_sunrise_end(),
            zenith: default_zenith(),
            sundown_start: default_sundown_start(),
            sundown_end: default_sundown_end(),
            light_eff_lw: default_light_eff_lw(),
            light_eff_std: default_light_eff_std(),
            max_power: default_max_power(),
            max_consume: default_max_consume(),
            day_pause: default_day_pause(),
            initial_day: 0,
            max_days: None,
            output_file: default_output_file(),
            execution_log: None,
            max_execution_time: default_max_execution_time(),
            sign_convention: SignConvention::default(),
            log_dir: default_log_dir(),
            log_format: LogFormat::default(),
            log_file_prefix: None,
        }
    }
}

/// How a reading is produced: from the piecewise curves or uniformly at random.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Curve,
    Random,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "curve" => Ok(StrategyKind::Curve),
            "random" => Ok(StrategyKind::Random),
            other => Err(format!("unknown reading strategy: {}", other)),
        }
    }
}

/// Sign applied to the consumption column of the persisted record.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignConvention {
    /// `meter` is stored as received and `sum = meter + pv`.
    #[default]
    Positive,
    /// `meter` is stored negated and `sum = pv - |meter|`.
    Negated,
}

impl FromStr for SignConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "positive" => Ok(SignConvention::Positive),
            "negated" => Ok(SignConvention::Negated),
            other => Err(format!("unknown sign convention: {}", other)),
        }
    }
}

/// Connection details for the message broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub queue: String,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Delay before the first connection attempt, giving the broker time to boot.
    pub initial_delay: Duration,
}

impl BrokerConfig {
    /// Broker location suitable for logs (credentials omitted).
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.queue)
    }
}

/// Reconnect/retry backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

/// Shared reading parameters used by both services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingConfig {
    pub pv_min: i64,
    pub pv_max: i64,
    /// Length of one iteration, in simulated seconds.
    pub time_iter: u32,
    pub delimiter: String,
    pub strategy: StrategyKind,
    pub seed: Option<u64>,
}

impl ReadingConfig {
    /// Iterations per simulated day.
    pub fn total_iterations(&self) -> u32 {
        total_iterations(self.time_iter)
    }

    /// Delimiter as a single byte, for the CSV writer.
    pub fn delimiter_byte(&self) -> Option<u8> {
        match self.delimiter.as_bytes() {
            [byte] => Some(*byte),
            _ => None,
        }
    }
}

/// Calibration points of the solar and meter curves, in hours of the day.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveConfig {
    pub sunrise_start: f64,
    pub sunrise_end: f64,
    pub zenith: f64,
    pub sundown_start: f64,
    pub sundown_end: f64,
    pub light_eff_lw: f64,
    pub light_eff_std: f64,
    pub max_power: f64,
    /// Hour around which consumption peaks; the boundary is drawn from `max_consume ± 2`.
    pub max_consume: u32,
}

/// Meter-side loop parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterConfig {
    pub day_pause: Duration,
    pub initial_day: u64,
    pub max_days: Option<u64>,
}

/// PV-side output parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub output_file: PathBuf,
    pub execution_log: PathBuf,
    pub max_execution_time: Duration,
    pub sign_convention: SignConvention,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub format: LogFormat,
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_dir(),
            format: LogFormat::default(),
            file_prefix: None,
        }
    }
}

/// Primary configuration object shared by the meter and PV services.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Deployment label (`DEV`, `TEST`, ...), attached to startup logs.
    pub environment: String,
    pub broker: BrokerConfig,
    pub retry: RetryConfig,
    pub reading: ReadingConfig,
    pub curve: CurveConfig,
    pub emitter: EmitterConfig,
    pub aggregator: AggregatorConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "PVSIM_CONFIG";

    /// Load configuration from an optional TOML file (or `PVSIM_CONFIG`) and
    /// the process environment, then validate it.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var(Self::ENV_CONFIG_PATH)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let file = file.map(Path::to_path_buf).or(from_env);
        Self::load_from(file.as_deref(), None)
    }

    /// Load configuration from an optional file and an explicit environment
    /// map. `None` reads the process environment.
    pub fn load_from(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            debug!(config_path = %path.display(), "loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(Environment::default().try_parsing(true).source(env));

        let settings: Settings = builder
            .build()
            .context("failed to assemble configuration sources")?
            .try_deserialize()
            .context("failed to parse configuration")?;
        let config = AppConfig::from(settings);
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        let reading = &self.reading;
        if reading.pv_min > reading.pv_max {
            return Err(anyhow!(
                "pv_min ({}) must not exceed pv_max ({})",
                reading.pv_min,
                reading.pv_max
            ));
        }
        if reading.time_iter == 0 || reading.time_iter > SECONDS_PER_DAY {
            return Err(anyhow!(
                "iteration must be between 1 and {} seconds, got {}",
                SECONDS_PER_DAY,
                reading.time_iter
            ));
        }
        match reading.delimiter_byte() {
            Some(byte) if byte.is_ascii() && !byte.is_ascii_digit() && !matches!(byte, b'-' | b':') => {}
            _ => {
                return Err(anyhow!(
                    "delimiter must be a single ASCII character other than a digit, '-' or ':', got {:?}",
                    reading.delimiter
                ))
            }
        }

        let curve = &self.curve;
        let points = [
            ("sunrise_start", curve.sunrise_start),
            ("sunrise_end", curve.sunrise_end),
            ("zenith", curve.zenith),
            ("sundown_start", curve.sundown_start),
            ("sundown_end", curve.sundown_end),
        ];
        if curve.sunrise_start < 0.0 || curve.sundown_end > 24.0 {
            return Err(anyhow!("solar calibration points must lie within 0..=24 hours"));
        }
        for pair in points.windows(2) {
            let (left_name, left) = pair[0];
            let (right_name, right) = pair[1];
            if left >= right {
                return Err(anyhow!(
                    "{} ({}) must be earlier than {} ({})",
                    left_name,
                    left,
                    right_name,
                    right
                ));
            }
        }
        if curve.max_consume < 3 || curve.max_consume > 21 {
            return Err(anyhow!(
                "max_consume must be between 3 and 21 so that max_consume ± 2 stays inside the day, got {}",
                curve.max_consume
            ));
        }
        if curve.max_power <= 0.0 {
            return Err(anyhow!("max_power must be positive"));
        }

        if self.retry.max_attempts == 0 {
            return Err(anyhow!("broker_retry_attempts must be at least 1"));
        }
        if self.broker.queue.trim().is_empty() {
            return Err(anyhow!("broker_queue must not be empty"));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig::from(Settings::default())
    }
}

impl From<Settings> for AppConfig {
    fn from(s: Settings) -> Self {
        let execution_log = s.execution_log.unwrap_or_else(|| {
            s.output_file
                .parent()
                .map(|dir| dir.join("execution_time.log"))
                .unwrap_or_else(|| PathBuf::from("execution_time.log"))
        });
        Self {
            environment: s.environment_pv,
            broker: BrokerConfig {
                host: s.broker_host,
                port: s.broker_port,
                queue: s.broker_queue,
                username: s.broker_username,
                password: s.broker_password,
                vhost: s.broker_vhost,
                initial_delay: Duration::from_secs(s.broker_initial_delay),
            },
            retry: RetryConfig {
                max_attempts: s.broker_retry_attempts,
                base_delay: Duration::from_millis(s.broker_retry_base_ms),
                max_delay: Duration::from_millis(s.broker_retry_max_ms),
                jitter: Duration::from_millis(s.broker_retry_jitter_ms),
            },
            reading: ReadingConfig {
                pv_min: s.pv_min,
                pv_max: s.pv_max,
                time_iter: s.iteration,
                delimiter: s.delimiter,
                strategy: s.reading_strategy,
                seed: s.seed,
            },
            curve: CurveConfig {
                sunrise_start: s.sunrise_start,
                sunrise_end: s.sunrise_end,
                zenith: s.zenith,
                sundown_start: s.sundown_start,
                sundown_end: s.sundown_end,
                light_eff_lw: s.light_eff_lw,
                light_eff_std: s.light_eff_std,
                max_power: s.max_power,
                max_consume: s.max_consume,
            },
            emitter: EmitterConfig {
                day_pause: Duration::from_secs(s.day_pause),
                initial_day: s.initial_day,
                max_days: s.max_days,
            },
            aggregator: AggregatorConfig {
                output_file: s.output_file,
                execution_log,
                max_execution_time: Duration::from_secs(s.max_execution_time),
                sign_convention: s.sign_convention,
            },
            logging: LoggingConfig {
                directory: s.log_dir,
                format: s.log_format,
                file_prefix: s.log_file_prefix,
            },
        }
    }
}
