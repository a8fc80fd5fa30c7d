use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::core::error::PipelineError;

pub const CONFIG_FILE_NAME: &str = "alert-relay.toml";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 17900;

/// Typed pipeline configuration, loaded once at startup and validated
/// before any event is accepted.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub compensation: CompensationConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MergeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_merge_window")]
    pub merge_window_seconds: f64,
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: f64,
    /// Cap used for levels at or below `video.critical_level_threshold`.
    #[serde(default = "default_critical_max_duration")]
    pub critical_max_duration_seconds: f64,
    #[serde(default = "default_quick_send_threshold")]
    pub quick_send_threshold: u32,
    #[serde(default = "default_immediate_levels")]
    pub immediate_dispatch_levels: Vec<u8>,
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: f64,
    #[serde(default = "default_level_delay_factor")]
    pub level_delay_factor: f64,
    #[serde(default = "default_minimal_delay")]
    pub minimal_delay_seconds: f64,
    #[serde(default = "default_handoff_attempts")]
    pub handoff_attempts: u32,
    #[serde(default = "default_handoff_backoff_base_ms")]
    pub handoff_backoff_base_ms: u64,
    #[serde(default = "default_handoff_backoff_cap_ms")]
    pub handoff_backoff_cap_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VideoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_video_buffer")]
    pub buffer_seconds: f64,
    #[serde(default = "default_video_fps")]
    pub fps: f64,
    #[serde(default = "default_pre_buffer")]
    pub pre_buffer_seconds: f64,
    #[serde(default = "default_post_buffer")]
    pub post_buffer_seconds: f64,
    #[serde(default = "default_critical_pre_buffer")]
    pub critical_pre_buffer_seconds: f64,
    #[serde(default = "default_critical_post_buffer")]
    pub critical_post_buffer_seconds: f64,
    #[serde(default = "default_critical_level_threshold")]
    pub critical_level_threshold: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory for the local object store, relative to the data dir.
    #[serde(default = "default_object_dir")]
    pub object_dir: String,
    #[serde(default = "default_video_prefix")]
    pub video_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
    #[serde(default = "default_queue_ttl_ms")]
    pub queue_ttl_ms: u64,
    #[serde(default = "default_queue_max_length")]
    pub queue_max_length: u64,
    #[serde(default = "default_dlq_ttl_ms")]
    pub dead_letter_ttl_ms: u64,
    #[serde(default = "default_dlq_max_length")]
    pub dead_letter_max_length: u64,
    /// Consumer-side retry budget carried in the `retryCount` header.
    #[serde(default = "default_transport_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
    #[serde(default = "default_consumer_workers")]
    pub consumer_workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_unhealthy_probe_threshold")]
    pub unhealthy_probe_threshold: u32,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LaneConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_lane_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lane_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeadLetterPolicy {
    #[serde(default = "default_max_death_count")]
    pub max_death_count: u32,
    #[serde(default = "default_dead_letter_max_retries")]
    pub max_retry_count: u32,
    /// Levels at or below this value get `high_severity_allowance` extra deaths.
    #[serde(default = "default_high_severity_level")]
    pub high_severity_level: u8,
    #[serde(default = "default_high_severity_allowance")]
    pub high_severity_allowance: u32,
    #[serde(default = "default_reprocess_time_limit")]
    pub reprocess_time_limit_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompensationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_seconds: u64,
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_seconds: u64,
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_seconds: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    #[serde(default)]
    pub producer: LaneConfig,
    #[serde(default)]
    pub consumer: LaneConfig,
    #[serde(default)]
    pub notification: LaneConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterPolicy,
}

/// Preset tuning for the push channel. Explicit values in the file win
/// over the preset only for `production`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotifyProfile {
    #[default]
    Production,
    Security,
    Highload,
    Development,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub profile: NotifyProfile,
    #[serde(default = "default_true")]
    pub ack_required: bool,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_seconds: u64,
    #[serde(default = "default_notification_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_seconds: f64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_seconds: u64,
    #[serde(default = "default_suspicious_threshold")]
    pub suspicious_threshold_seconds: u64,
    #[serde(default = "default_dead_threshold")]
    pub dead_threshold_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u32,
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
    /// Empty list disables the allow-list.
    #[serde(default)]
    pub ip_allow_list: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}
fn default_merge_window() -> f64 {
    4.0
}
fn default_max_duration() -> f64 {
    15.0
}
fn default_critical_max_duration() -> f64 {
    8.0
}
fn default_quick_send_threshold() -> u32 {
    5
}
fn default_immediate_levels() -> Vec<u8> {
    vec![1]
}
fn default_base_delay() -> f64 {
    3.0
}
fn default_level_delay_factor() -> f64 {
    0.5
}
fn default_minimal_delay() -> f64 {
    0.5
}
fn default_handoff_attempts() -> u32 {
    3
}
fn default_handoff_backoff_base_ms() -> u64 {
    200
}
fn default_handoff_backoff_cap_ms() -> u64 {
    2_000
}
fn default_video_buffer() -> f64 {
    60.0
}
fn default_video_fps() -> f64 {
    10.0
}
fn default_pre_buffer() -> f64 {
    3.0
}
fn default_post_buffer() -> f64 {
    3.0
}
fn default_critical_pre_buffer() -> f64 {
    6.0
}
fn default_critical_post_buffer() -> f64 {
    6.0
}
fn default_critical_level_threshold() -> u8 {
    2
}
fn default_object_dir() -> String {
    "objects".to_string()
}
fn default_video_prefix() -> String {
    "alert-videos/".to_string()
}
fn default_queue_name() -> String {
    "alert_queue".to_string()
}
fn default_dead_letter_queue() -> String {
    "alert_queue.dlq".to_string()
}
fn default_queue_ttl_ms() -> u64 {
    86_400_000
}
fn default_queue_max_length() -> u64 {
    100_000
}
fn default_dlq_ttl_ms() -> u64 {
    604_800_000
}
fn default_dlq_max_length() -> u64 {
    10_000
}
fn default_transport_max_retries() -> u32 {
    3
}
fn default_publish_attempts() -> u32 {
    3
}
fn default_publish_backoff_ms() -> u64 {
    250
}
fn default_consumer_workers() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    200
}
fn default_unhealthy_probe_threshold() -> u32 {
    3
}
fn default_probe_interval() -> u64 {
    15
}
fn default_lane_interval() -> u64 {
    30
}
fn default_batch_size() -> usize {
    20
}
fn default_lane_max_retries() -> u32 {
    3
}
fn default_max_death_count() -> u32 {
    3
}
fn default_dead_letter_max_retries() -> u32 {
    5
}
fn default_high_severity_level() -> u8 {
    3
}
fn default_high_severity_allowance() -> u32 {
    1
}
fn default_reprocess_time_limit() -> u64 {
    86_400
}
fn default_cycle_interval() -> u64 {
    30
}
fn default_backoff_ceiling() -> u64 {
    3_600
}
fn default_claim_timeout() -> u64 {
    300
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_max_age_hours() -> u64 {
    24
}
fn default_ack_timeout() -> u64 {
    30
}
fn default_notification_max_retries() -> u32 {
    5
}
fn default_max_queue_size() -> usize {
    1_000
}
fn default_send_timeout() -> f64 {
    2.0
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_stale_threshold() -> u64 {
    300
}
fn default_suspicious_threshold() -> u64 {
    600
}
fn default_dead_threshold() -> u64 {
    1_800
}
fn default_cleanup_interval() -> u64 {
    60
}
fn default_max_error_count() -> u32 {
    5
}
fn default_max_connections_per_ip() -> usize {
    10
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            merge_window_seconds: default_merge_window(),
            max_duration_seconds: default_max_duration(),
            critical_max_duration_seconds: default_critical_max_duration(),
            quick_send_threshold: default_quick_send_threshold(),
            immediate_dispatch_levels: default_immediate_levels(),
            base_delay_seconds: default_base_delay(),
            level_delay_factor: default_level_delay_factor(),
            minimal_delay_seconds: default_minimal_delay(),
            handoff_attempts: default_handoff_attempts(),
            handoff_backoff_base_ms: default_handoff_backoff_base_ms(),
            handoff_backoff_cap_ms: default_handoff_backoff_cap_ms(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_seconds: default_video_buffer(),
            fps: default_video_fps(),
            pre_buffer_seconds: default_pre_buffer(),
            post_buffer_seconds: default_post_buffer(),
            critical_pre_buffer_seconds: default_critical_pre_buffer(),
            critical_post_buffer_seconds: default_critical_post_buffer(),
            critical_level_threshold: default_critical_level_threshold(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            object_dir: default_object_dir(),
            video_prefix: default_video_prefix(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_name: default_queue_name(),
            dead_letter_queue: default_dead_letter_queue(),
            queue_ttl_ms: default_queue_ttl_ms(),
            queue_max_length: default_queue_max_length(),
            dead_letter_ttl_ms: default_dlq_ttl_ms(),
            dead_letter_max_length: default_dlq_max_length(),
            max_retries: default_transport_max_retries(),
            publish_attempts: default_publish_attempts(),
            publish_backoff_ms: default_publish_backoff_ms(),
            consumer_workers: default_consumer_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            unhealthy_probe_threshold: default_unhealthy_probe_threshold(),
            probe_interval_seconds: default_probe_interval(),
        }
    }
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_lane_interval(),
            batch_size: default_batch_size(),
            max_retries: default_lane_max_retries(),
            exponential_backoff: true,
        }
    }
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            max_death_count: default_max_death_count(),
            max_retry_count: default_dead_letter_max_retries(),
            high_severity_level: default_high_severity_level(),
            high_severity_allowance: default_high_severity_allowance(),
            reprocess_time_limit_seconds: default_reprocess_time_limit(),
        }
    }
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle_interval_seconds: default_cycle_interval(),
            backoff_ceiling_seconds: default_backoff_ceiling(),
            claim_timeout_seconds: default_claim_timeout(),
            shutdown_grace_seconds: default_shutdown_grace(),
            max_age_hours: default_max_age_hours(),
            producer: LaneConfig::default(),
            consumer: LaneConfig::default(),
            notification: LaneConfig {
                max_retries: default_notification_max_retries(),
                ..LaneConfig::default()
            },
            dead_letter: DeadLetterPolicy::default(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            profile: NotifyProfile::Production,
            ack_required: true,
            ack_timeout_seconds: default_ack_timeout(),
            max_retries: default_notification_max_retries(),
            max_queue_size: default_max_queue_size(),
            send_timeout_seconds: default_send_timeout(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            stale_threshold_seconds: default_stale_threshold(),
            suspicious_threshold_seconds: default_suspicious_threshold(),
            dead_threshold_seconds: default_dead_threshold(),
            cleanup_interval_seconds: default_cleanup_interval(),
            max_error_count: default_max_error_count(),
            max_connections_per_ip: default_max_connections_per_ip(),
            ip_allow_list: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl MergeConfig {
    pub fn merge_window(&self) -> Duration {
        Duration::from_secs_f64(self.merge_window_seconds)
    }

    pub fn minimal_delay(&self) -> Duration {
        Duration::from_secs_f64(self.minimal_delay_seconds)
    }

    pub fn is_immediate(&self, level: u8) -> bool {
        self.immediate_dispatch_levels.contains(&level)
    }
}

impl VideoConfig {
    pub fn is_critical(&self, level: u8) -> bool {
        level <= self.critical_level_threshold
    }

    /// Seconds captured before the first and after the last detection.
    pub fn clip_window(&self, level: u8) -> (f64, f64) {
        if self.is_critical(level) {
            (
                self.critical_pre_buffer_seconds,
                self.critical_post_buffer_seconds,
            )
        } else {
            (self.pre_buffer_seconds, self.post_buffer_seconds)
        }
    }
}

impl NotifyConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.send_timeout_seconds)
    }

    fn apply_profile(&mut self) {
        match self.profile {
            NotifyProfile::Production => {}
            NotifyProfile::Security => {
                self.heartbeat_interval_seconds = 15;
                self.stale_threshold_seconds = 180;
                self.suspicious_threshold_seconds = 300;
                self.dead_threshold_seconds = 600;
                self.cleanup_interval_seconds = 30;
                self.max_error_count = 3;
                self.send_timeout_seconds = 1.0;
            }
            NotifyProfile::Highload => {
                self.heartbeat_interval_seconds = 60;
                self.max_queue_size = 500;
                self.cleanup_interval_seconds = 120;
                self.send_timeout_seconds = 3.0;
            }
            NotifyProfile::Development => {
                self.heartbeat_interval_seconds = 5;
                self.stale_threshold_seconds = 10;
                self.suspicious_threshold_seconds = 20;
                self.dead_threshold_seconds = 30;
                self.cleanup_interval_seconds = 10;
            }
        }
    }
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// Upper bound for every seconds-valued float setting (one week).
const MAX_SECONDS_SETTING: f64 = 604_800.0;
const MAX_FPS: f64 = 240.0;

fn invalid(msg: impl Into<String>) -> PipelineError {
    PipelineError::Configuration(msg.into())
}

fn check_bounded(name: &str, value: f64, max: f64) -> Result<(), PipelineError> {
    if !value.is_finite() || value > max {
        return Err(invalid(format!(
            "{name} must be a finite number no greater than {max}"
        )));
    }
    Ok(())
}

impl PipelineConfig {
    /// Load from an explicit path, or from `alert-relay.toml` in the data
    /// directory. A missing default file yields the built-in defaults; a
    /// missing explicit file is an error.
    pub async fn load(explicit: Option<&Path>, data_dir: &Path) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(invalid(format!("config file {} not found", path.display())).into());
                }
                path.to_path_buf()
            }
            None => {
                let path = data_dir.join(CONFIG_FILE_NAME);
                if !path.exists() {
                    info!("No {} found, using defaults.", CONFIG_FILE_NAME);
                    let mut config = Self::default();
                    config.notify.apply_profile();
                    config.validate()?;
                    return Ok(config);
                }
                path
            }
        };

        let content = tokio::fs::read_to_string(&config_path).await?;
        let config = Self::from_toml(&content)?;
        info!(
            "Loaded pipeline config from {}: merge_window={}s, quick_send={}, cycle={}s, notify_profile={:?}",
            config_path.display(),
            config.merge.merge_window_seconds,
            config.merge.quick_send_threshold,
            config.compensation.cycle_interval_seconds,
            config.notify.profile
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, PipelineError> {
        let mut config: PipelineConfig =
            toml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        config.notify.apply_profile();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let m = &self.merge;
        let v = &self.video;
        for (name, value) in [
            ("merge.merge_window_seconds", m.merge_window_seconds),
            ("merge.max_duration_seconds", m.max_duration_seconds),
            (
                "merge.critical_max_duration_seconds",
                m.critical_max_duration_seconds,
            ),
            ("merge.base_delay_seconds", m.base_delay_seconds),
            ("merge.level_delay_factor", m.level_delay_factor),
            ("merge.minimal_delay_seconds", m.minimal_delay_seconds),
            ("video.buffer_seconds", v.buffer_seconds),
            ("video.pre_buffer_seconds", v.pre_buffer_seconds),
            ("video.post_buffer_seconds", v.post_buffer_seconds),
            ("video.critical_pre_buffer_seconds", v.critical_pre_buffer_seconds),
            (
                "video.critical_post_buffer_seconds",
                v.critical_post_buffer_seconds,
            ),
            ("notify.send_timeout_seconds", self.notify.send_timeout_seconds),
        ] {
            check_bounded(name, value, MAX_SECONDS_SETTING)?;
        }
        check_bounded("video.fps", v.fps, MAX_FPS)?;

        if m.merge_window_seconds <= 0.0 {
            return Err(invalid("merge.merge_window_seconds must be positive"));
        }
        if m.max_duration_seconds < m.merge_window_seconds {
            return Err(invalid(
                "merge.max_duration_seconds must be at least merge_window_seconds",
            ));
        }
        if m.critical_max_duration_seconds <= 0.0
            || m.critical_max_duration_seconds > m.max_duration_seconds
        {
            return Err(invalid(
                "merge.critical_max_duration_seconds must be in (0, max_duration_seconds]",
            ));
        }
        if m.quick_send_threshold < 1 {
            return Err(invalid("merge.quick_send_threshold must be >= 1"));
        }
        if m.base_delay_seconds <= 0.0 || m.minimal_delay_seconds <= 0.0 {
            return Err(invalid("merge delays must be positive"));
        }
        if m.minimal_delay_seconds > m.base_delay_seconds {
            return Err(invalid(
                "merge.minimal_delay_seconds must not exceed base_delay_seconds",
            ));
        }
        if m.level_delay_factor < 0.0 {
            return Err(invalid("merge.level_delay_factor must not be negative"));
        }
        if m.handoff_attempts < 1 {
            return Err(invalid("merge.handoff_attempts must be >= 1"));
        }

        if v.fps <= 0.0 || v.buffer_seconds <= 0.0 {
            return Err(invalid("video.fps and video.buffer_seconds must be positive"));
        }
        if v.pre_buffer_seconds < 0.0
            || v.post_buffer_seconds < 0.0
            || v.critical_pre_buffer_seconds < 0.0
            || v.critical_post_buffer_seconds < 0.0
        {
            return Err(invalid("video buffer windows must not be negative"));
        }

        let t = &self.transport;
        if t.queue_name.trim().is_empty() || t.dead_letter_queue.trim().is_empty() {
            return Err(invalid("transport queue names must not be empty"));
        }
        if t.queue_name == t.dead_letter_queue {
            return Err(invalid(
                "transport.dead_letter_queue must differ from queue_name",
            ));
        }
        if t.queue_ttl_ms == 0 || t.queue_max_length == 0 || t.dead_letter_max_length == 0 {
            return Err(invalid("transport TTL and max lengths must be positive"));
        }
        if t.publish_attempts < 1 || t.consumer_workers < 1 {
            return Err(invalid(
                "transport.publish_attempts and consumer_workers must be >= 1",
            ));
        }
        if t.unhealthy_probe_threshold < 1 {
            return Err(invalid("transport.unhealthy_probe_threshold must be >= 1"));
        }

        let c = &self.compensation;
        if c.cycle_interval_seconds == 0 {
            return Err(invalid("compensation.cycle_interval_seconds must be positive"));
        }
        for (name, lane) in [
            ("producer", &c.producer),
            ("consumer", &c.consumer),
            ("notification", &c.notification),
        ] {
            if lane.batch_size == 0 || lane.interval_seconds == 0 {
                return Err(invalid(format!(
                    "compensation.{name}: batch_size and interval_seconds must be positive"
                )));
            }
            if lane.max_retries < 1 {
                return Err(invalid(format!(
                    "compensation.{name}.max_retries must be >= 1"
                )));
            }
            if c.backoff_ceiling_seconds < lane.interval_seconds {
                return Err(invalid(format!(
                    "compensation.backoff_ceiling_seconds must be >= {name}.interval_seconds"
                )));
            }
        }
        if c.dead_letter.max_death_count < 1 {
            return Err(invalid("compensation.dead_letter.max_death_count must be >= 1"));
        }

        let n = &self.notify;
        if n.max_queue_size == 0 {
            return Err(invalid("notify.max_queue_size must be positive"));
        }
        if n.send_timeout_seconds <= 0.0 || n.ack_timeout_seconds == 0 {
            return Err(invalid("notify timeouts must be positive"));
        }
        if !(n.stale_threshold_seconds < n.suspicious_threshold_seconds
            && n.suspicious_threshold_seconds < n.dead_threshold_seconds)
        {
            return Err(invalid(
                "notify thresholds must satisfy stale < suspicious < dead",
            ));
        }
        if n.max_connections_per_ip == 0 {
            return Err(invalid("notify.max_connections_per_ip must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.notify.ack_timeout_seconds, 30);
        assert_eq!(config.notify.max_retries, 5);
        assert_eq!(config.compensation.notification.max_retries, 5);
        assert_eq!(config.transport.queue_ttl_ms, 86_400_000);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [merge]
            merge_window_seconds = 2.5
            quick_send_threshold = 3

            [compensation.producer]
            batch_size = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.merge.merge_window_seconds, 2.5);
        assert_eq!(config.merge.quick_send_threshold, 3);
        assert_eq!(config.merge.base_delay_seconds, 3.0);
        assert_eq!(config.compensation.producer.batch_size, 7);
        assert!(config.compensation.producer.exponential_backoff);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = PipelineConfig::from_toml(
            r#"
            [notify]
            stale_threshold_seconds = 900
            suspicious_threshold_seconds = 600
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn rejects_max_duration_below_window() {
        let err = PipelineConfig::from_toml(
            r#"
            [merge]
            merge_window_seconds = 10.0
            max_duration_seconds = 5.0
            critical_max_duration_seconds = 4.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_duration_seconds"));
    }

    #[test]
    fn rejects_non_finite_durations() {
        for toml in [
            "[merge]\nbase_delay_seconds = inf\n",
            "[merge]\nmerge_window_seconds = nan\n",
            "[merge]\nmax_duration_seconds = 1e300\n",
            "[notify]\nsend_timeout_seconds = inf\n",
            "[video]\nfps = nan\n",
        ] {
            let err = PipelineConfig::from_toml(toml).unwrap_err();
            assert!(
                matches!(err, PipelineError::Configuration(_)),
                "accepted {toml:?}"
            );
        }

        let mut config = PipelineConfig::default();
        config.merge.level_delay_factor = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = PipelineConfig::from_toml("[merge\nfoo = ").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn security_profile_tightens_timeouts() {
        let config = PipelineConfig::from_toml(
            r#"
            [notify]
            profile = "security"
            "#,
        )
        .unwrap();
        assert_eq!(config.notify.send_timeout_seconds, 1.0);
        assert_eq!(config.notify.max_error_count, 3);
        assert_eq!(config.notify.dead_threshold_seconds, 600);
    }

    #[test]
    fn clip_window_depends_on_level() {
        let video = VideoConfig::default();
        assert_eq!(video.clip_window(1), (6.0, 6.0));
        assert_eq!(video.clip_window(4), (3.0, 3.0));
    }

    #[tokio::test]
    async fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(PipelineConfig::load(Some(&missing), dir.path()).await.is_err());
        let config = PipelineConfig::load(None, dir.path()).await.unwrap();
        assert_eq!(config.server.port, 17900);
    }
}
