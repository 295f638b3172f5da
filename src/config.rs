//! Controller configuration loading from environment variables.
//!
//! All values are loaded from `CADENCE_*` environment variables with safe
//! defaults; invalid values fall back to defaults without crashing. A TOML
//! file can overlay the environment for deployments that prefer files.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `CADENCE_SLO_NS` | 100000000 | Default request SLO (ns) |
//! | `CADENCE_BUFFER_NS` | 5000000 | Safety margin before deadlines (ns) |
//! | `CADENCE_SCHEDULE_AHEAD_NS` | 10000000 | Dispatch lookahead (ns) |
//! | `CADENCE_LATEST_DELTA_NS` | 3000000 | Action lateness allowance (ns) |
//! | `CADENCE_MAX_EXEC_NS` | 18000000 | Largest batch exec time considered (ns) |
//! | `CADENCE_ESTIMATE_WINDOW` | 10 | Samples kept per estimator |
//! | `CADENCE_ESTIMATE_PERCENTILE` | 0.99 | Estimator percentile |
//! | `CADENCE_DEFAULT_CLOCK` | 1380 | Reference GPU memory clock (MHz) |
//! | `CADENCE_PRINT_INTERVAL_NS` | 10000000000 | Status cadence (ns) |
//! | `CADENCE_REQUEST_COST_FACTOR` | 1.0 | Demand charged per request, in units of estimate(1) |
//! | `CADENCE_RESULT_GRACE_NS` | 100000000 | Grace past `latest` before a result is presumed lost (ns) |
//! | `CADENCE_ACTION_LOG` | cadence_action_log.tsv | Per-action TSV path |
//! | `CADENCE_REQUEST_LOG` | cadence_request_log.tsv | Per-request TSV path |

use std::path::PathBuf;

use serde::Deserialize;

use crate::telemetry::LogConfig;

/// Scheduler tunables; compile-time constants in spirit, configurable for
/// experimentation.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Default SLO applied when a request does not carry one, ns.
    pub slo_ns: u64,
    /// Aim to finish this far ahead of every deadline, ns.
    pub buffer_ns: u64,
    /// How far into the future dispatch will commit actions, ns.
    pub schedule_ahead_ns: u64,
    /// How far behind schedule a worker may run an action, ns.
    pub latest_delta_ns: u64,
    /// Batch sizes whose exec estimate exceeds this are never dispatched, ns.
    pub max_exec_ns: u64,
    /// Samples per sliding-window estimator.
    pub estimate_window: usize,
    /// Percentile reported by the estimators.
    pub estimate_percentile: f64,
    /// Reference GPU memory clock all estimates are normalized to.
    pub default_clock: u32,
    /// Cadence of the status and throughput summaries, ns.
    pub print_interval_ns: u64,
    /// Demand charged per admitted request, in units of estimate(1).
    pub request_cost_factor: f64,
    /// Grace past `latest` before an unanswered action is presumed lost, ns.
    pub result_grace_ns: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slo_ns: 100_000_000,
            buffer_ns: 5_000_000,
            schedule_ahead_ns: 10_000_000,
            latest_delta_ns: 3_000_000,
            max_exec_ns: 18_000_000,
            estimate_window: 10,
            estimate_percentile: 0.99,
            default_clock: 1380,
            print_interval_ns: 10_000_000_000,
            request_cost_factor: 1.0,
            result_grace_ns: 100_000_000,
        }
    }
}

/// Telemetry output locations.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub action_log: PathBuf,
    pub request_log: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            action_log: PathBuf::from("cadence_action_log.tsv"),
            request_log: PathBuf::from("cadence_request_log.tsv"),
        }
    }
}

/// Full controller configuration.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
    pub log: LogConfig,
}

/// Effective configuration summary for logging at startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EffectiveConfig {
    pub slo_ns: u64,
    pub buffer_ns: u64,
    pub schedule_ahead_ns: u64,
    pub latest_delta_ns: u64,
    pub max_exec_ns: u64,
    pub estimate_window: usize,
    pub estimate_percentile: f64,
    pub default_clock: u32,
    pub print_interval_ns: u64,
    pub request_cost_factor: f64,
    pub result_grace_ns: u64,
    pub action_log: String,
    pub request_log: String,
}

fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<f64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn load_scheduler_config() -> SchedulerConfig {
    let d = SchedulerConfig::default();
    SchedulerConfig {
        slo_ns: parse_u64("CADENCE_SLO_NS", d.slo_ns).max(1_000_000),
        buffer_ns: parse_u64("CADENCE_BUFFER_NS", d.buffer_ns),
        schedule_ahead_ns: parse_u64("CADENCE_SCHEDULE_AHEAD_NS", d.schedule_ahead_ns).max(1),
        latest_delta_ns: parse_u64("CADENCE_LATEST_DELTA_NS", d.latest_delta_ns),
        max_exec_ns: parse_u64("CADENCE_MAX_EXEC_NS", d.max_exec_ns).max(1),
        estimate_window: parse_usize("CADENCE_ESTIMATE_WINDOW", d.estimate_window).max(1),
        estimate_percentile: parse_f64("CADENCE_ESTIMATE_PERCENTILE", d.estimate_percentile)
            .clamp(0.0, 1.0),
        default_clock: parse_u64("CADENCE_DEFAULT_CLOCK", d.default_clock as u64).max(1) as u32,
        print_interval_ns: parse_u64("CADENCE_PRINT_INTERVAL_NS", d.print_interval_ns).max(1),
        request_cost_factor: parse_f64("CADENCE_REQUEST_COST_FACTOR", d.request_cost_factor)
            .max(0.0),
        result_grace_ns: parse_u64("CADENCE_RESULT_GRACE_NS", d.result_grace_ns),
    }
}

fn load_telemetry_config() -> TelemetryConfig {
    let d = TelemetryConfig::default();
    TelemetryConfig {
        action_log: std::env::var("CADENCE_ACTION_LOG")
            .map(PathBuf::from)
            .unwrap_or(d.action_log),
        request_log: std::env::var("CADENCE_REQUEST_LOG")
            .map(PathBuf::from)
            .unwrap_or(d.request_log),
    }
}

/// Load all configuration from environment variables. Missing or invalid
/// values fall back to safe defaults without panicking.
pub fn load() -> ControllerConfig {
    ControllerConfig {
        scheduler: load_scheduler_config(),
        telemetry: load_telemetry_config(),
        log: LogConfig::default(),
    }
}

/// Optional TOML overlay. Only the fields present in the file override the
/// base configuration.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    slo_ns: Option<u64>,
    buffer_ns: Option<u64>,
    schedule_ahead_ns: Option<u64>,
    latest_delta_ns: Option<u64>,
    max_exec_ns: Option<u64>,
    estimate_window: Option<usize>,
    estimate_percentile: Option<f64>,
    default_clock: Option<u32>,
    print_interval_ns: Option<u64>,
    request_cost_factor: Option<f64>,
    result_grace_ns: Option<u64>,
    action_log: Option<PathBuf>,
    request_log: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Overlay a TOML file onto `base`.
pub fn overlay_file(
    mut base: ControllerConfig,
    path: &std::path::Path,
) -> Result<ControllerConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let file: FileConfig = toml::from_str(&text)?;
    let s = &mut base.scheduler;
    if let Some(v) = file.slo_ns {
        s.slo_ns = v.max(1_000_000);
    }
    if let Some(v) = file.buffer_ns {
        s.buffer_ns = v;
    }
    if let Some(v) = file.schedule_ahead_ns {
        s.schedule_ahead_ns = v.max(1);
    }
    if let Some(v) = file.latest_delta_ns {
        s.latest_delta_ns = v;
    }
    if let Some(v) = file.max_exec_ns {
        s.max_exec_ns = v.max(1);
    }
    if let Some(v) = file.estimate_window {
        s.estimate_window = v.max(1);
    }
    if let Some(v) = file.estimate_percentile {
        s.estimate_percentile = v.clamp(0.0, 1.0);
    }
    if let Some(v) = file.default_clock {
        s.default_clock = v.max(1);
    }
    if let Some(v) = file.print_interval_ns {
        s.print_interval_ns = v.max(1);
    }
    if let Some(v) = file.request_cost_factor {
        s.request_cost_factor = v.max(0.0);
    }
    if let Some(v) = file.result_grace_ns {
        s.result_grace_ns = v;
    }
    if let Some(v) = file.action_log {
        base.telemetry.action_log = v;
    }
    if let Some(v) = file.request_log {
        base.telemetry.request_log = v;
    }
    Ok(base)
}

impl ControllerConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            slo_ns: self.scheduler.slo_ns,
            buffer_ns: self.scheduler.buffer_ns,
            schedule_ahead_ns: self.scheduler.schedule_ahead_ns,
            latest_delta_ns: self.scheduler.latest_delta_ns,
            max_exec_ns: self.scheduler.max_exec_ns,
            estimate_window: self.scheduler.estimate_window,
            estimate_percentile: self.scheduler.estimate_percentile,
            default_clock: self.scheduler.default_clock,
            print_interval_ns: self.scheduler.print_interval_ns,
            request_cost_factor: self.scheduler.request_cost_factor,
            result_grace_ns: self.scheduler.result_grace_ns,
            action_log: self.telemetry.action_log.display().to_string(),
            request_log: self.telemetry.request_log.display().to_string(),
        }
    }
}
