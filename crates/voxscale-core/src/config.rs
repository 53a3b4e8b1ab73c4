//! voxscale.toml configuration parser.
//!
//! ```toml
//! [queue]
//! name = "story-tasks"
//! sample_interval = "60s"
//!
//! [fleet]
//! name = "gpu-workers"
//! min = 0
//! max = 2
//!
//! [[schedule]]
//! name = "evening-peak"
//! min = 1
//! max = 2
//! desired = 1
//! recurrence = "0 18 * * Mon-Fri"
//! timezone = "-05:00"
//! duration = "4h"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::{duration_or, parse_duration};
use crate::schedule::WindowSet;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub queue: QueueConfig,
    pub fleet: FleetConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedule: Vec<ScheduleEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackConfig>,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_sample_interval")]
    pub sample_interval: String,
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout: String,
    /// Consecutive stale samples before HealthDegraded.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold: u32,
    /// Consecutive stale samples before the operator alarm.
    #[serde(default = "default_alarm_threshold")]
    pub alarm_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub name: String,
    pub min: u32,
    pub max: u32,
    #[serde(default = "default_warmup")]
    pub estimated_instance_warmup: String,
    #[serde(default = "default_cooldown")]
    pub default_cooldown: String,
    #[serde(default = "default_grace_period")]
    pub health_check_grace_period: String,
    /// Largest single scale-out step the provider accepts.
    pub max_scale_out_step: Option<u32>,
    /// Active-job reports older than this are ignored.
    #[serde(default = "default_active_job_ttl")]
    pub active_job_ttl: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    #[serde(default = "default_target_age")]
    pub target_age_secs: f64,
    #[serde(default = "default_scale_out_periods")]
    pub scale_out_periods: u32,
    #[serde(default = "default_scale_in_periods")]
    pub scale_in_periods: u32,
    /// Queue messages one worker drains per sampling interval.
    #[serde(default = "default_per_worker_throughput")]
    pub per_worker_throughput: f64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            target_age_secs: default_target_age(),
            scale_out_periods: default_scale_out_periods(),
            scale_in_periods: default_scale_in_periods(),
            per_worker_throughput: default_per_worker_throughput(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyConfig {
    #[serde(default = "default_latency_threshold")]
    pub threshold_ms: f64,
    #[serde(default = "default_slo")]
    pub slo_ms: f64,
    #[serde(default = "default_evaluation_periods")]
    pub evaluation_periods: u32,
    #[serde(default = "default_latency_window")]
    pub window: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_metric_name")]
    pub metric_name: String,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            threshold_ms: default_latency_threshold(),
            slo_ms: default_slo(),
            evaluation_periods: default_evaluation_periods(),
            window: default_latency_window(),
            namespace: default_namespace(),
            metric_name: default_metric_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub desired: u32,
    /// 5- or 6-field cron expression.
    pub recurrence: String,
    /// "UTC" or a fixed offset like "+02:00".
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub duration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    /// In-process CPU mock that fakes renders.
    CpuMock,
    /// An external consumer toggled over HTTP.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub kind: FallbackKind,
    /// `host:port` of the fallback switch when `kind = "http"`.
    pub address: Option<String>,
    #[serde(default = "default_mock_min_ms")]
    pub mock_min_ms: u64,
    #[serde(default = "default_mock_max_ms")]
    pub mock_max_ms: u64,
}

/// Collaborator endpoints (`host:port`). Unset sources run simulated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub queue: Option<String>,
    pub telemetry: Option<String>,
    pub fleet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Feed entries kept per table.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            retention: default_retention(),
        }
    }
}

fn default_sample_interval() -> String {
    "60s".to_string()
}
fn default_scrape_timeout() -> String {
    "5s".to_string()
}
fn default_stale_threshold() -> u32 {
    3
}
fn default_alarm_threshold() -> u32 {
    10
}
fn default_warmup() -> String {
    "120s".to_string()
}
fn default_cooldown() -> String {
    "300s".to_string()
}
fn default_grace_period() -> String {
    "300s".to_string()
}
fn default_active_job_ttl() -> String {
    "180s".to_string()
}
fn default_target_age() -> f64 {
    4.0
}
fn default_scale_out_periods() -> u32 {
    2
}
fn default_scale_in_periods() -> u32 {
    3
}
fn default_per_worker_throughput() -> f64 {
    20.0
}
fn default_latency_threshold() -> f64 {
    800.0
}
fn default_slo() -> f64 {
    1000.0
}
fn default_evaluation_periods() -> u32 {
    5
}
fn default_latency_window() -> String {
    "5m".to_string()
}
fn default_namespace() -> String {
    "voxscale".to_string()
}
fn default_metric_name() -> String {
    "ttfa".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_mock_min_ms() -> u64 {
    300
}
fn default_mock_max_ms() -> u64 {
    800
}
fn default_listen() -> String {
    "0.0.0.0:8460".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/voxscale".to_string()
}
fn default_retention() -> usize {
    1440
}

impl ControlConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ControlConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check bounds, durations, and schedule entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.min > self.fleet.max {
            return Err(invalid(
                "fleet",
                format!("min {} exceeds max {}", self.fleet.min, self.fleet.max),
            ));
        }
        if self.fleet.max_scale_out_step == Some(0) {
            return Err(invalid("fleet.max_scale_out_step", "must be positive"));
        }

        require_nonzero("queue.sample_interval", &self.queue.sample_interval)?;
        require_nonzero("queue.scrape_timeout", &self.queue.scrape_timeout)?;
        require_nonzero("latency.window", &self.latency.window)?;
        require_parsable(
            "fleet.estimated_instance_warmup",
            &self.fleet.estimated_instance_warmup,
        )?;
        require_parsable("fleet.default_cooldown", &self.fleet.default_cooldown)?;
        require_parsable(
            "fleet.health_check_grace_period",
            &self.fleet.health_check_grace_period,
        )?;
        require_nonzero("fleet.active_job_ttl", &self.fleet.active_job_ttl)?;

        if self.queue.stale_threshold == 0 {
            return Err(invalid("queue.stale_threshold", "must be positive"));
        }
        if self.queue.alarm_threshold < self.queue.stale_threshold {
            return Err(invalid(
                "queue.alarm_threshold",
                "must not be lower than stale_threshold",
            ));
        }
        if self.backlog.target_age_secs <= 0.0 {
            return Err(invalid("backlog.target_age_secs", "must be positive"));
        }
        if self.backlog.per_worker_throughput <= 0.0 {
            return Err(invalid("backlog.per_worker_throughput", "must be positive"));
        }
        if self.backlog.scale_out_periods == 0 || self.backlog.scale_in_periods == 0 {
            return Err(invalid("backlog", "periods must be positive"));
        }
        if self.latency.evaluation_periods == 0 {
            return Err(invalid("latency.evaluation_periods", "must be positive"));
        }
        if self.latency.threshold_ms > self.latency.slo_ms {
            return Err(invalid("latency.threshold_ms", "must not exceed slo_ms"));
        }

        if let Some(fallback) = &self.fallback {
            if fallback.kind == FallbackKind::Http && fallback.address.is_none() {
                return Err(invalid("fallback.address", "required for kind = \"http\""));
            }
            if fallback.mock_min_ms > fallback.mock_max_ms {
                return Err(invalid("fallback", "mock_min_ms exceeds mock_max_ms"));
            }
        }

        WindowSet::compile(&self.schedule)?;
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        duration_or(&self.queue.sample_interval, Duration::from_secs(60))
    }

    pub fn scrape_timeout(&self) -> Duration {
        duration_or(&self.queue.scrape_timeout, Duration::from_secs(5))
    }

    pub fn instance_warmup(&self) -> Duration {
        duration_or(&self.fleet.estimated_instance_warmup, Duration::from_secs(120))
    }

    pub fn scale_in_cooldown(&self) -> Duration {
        duration_or(&self.fleet.default_cooldown, Duration::from_secs(300))
    }

    pub fn grace_period(&self) -> Duration {
        duration_or(&self.fleet.health_check_grace_period, Duration::from_secs(300))
    }

    pub fn active_job_ttl(&self) -> Duration {
        duration_or(&self.fleet.active_job_ttl, Duration::from_secs(180))
    }

    pub fn latency_window(&self) -> Duration {
        duration_or(&self.latency.window, Duration::from_secs(300))
    }

    /// Minimal config for the given queue and fleet.
    pub fn scaffold(queue: &str, fleet: &str, min: u32, max: u32) -> Self {
        ControlConfig {
            queue: QueueConfig {
                name: queue.to_string(),
                sample_interval: default_sample_interval(),
                scrape_timeout: default_scrape_timeout(),
                stale_threshold: default_stale_threshold(),
                alarm_threshold: default_alarm_threshold(),
            },
            fleet: FleetConfig {
                name: fleet.to_string(),
                min,
                max,
                estimated_instance_warmup: default_warmup(),
                default_cooldown: default_cooldown(),
                health_check_grace_period: default_grace_period(),
                max_scale_out_step: None,
                active_job_ttl: default_active_job_ttl(),
            },
            backlog: BacklogConfig::default(),
            latency: LatencyConfig::default(),
            schedule: Vec::new(),
            fallback: None,
            sources: SourcesConfig::default(),
            api: ApiConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn require_parsable(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| invalid(field, format!("invalid duration {value:?}")))
}

fn require_nonzero(field: &str, value: &str) -> Result<Duration, ConfigError> {
    let d = require_parsable(field, value)?;
    if d.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(d)
}
