//! Configuration management for the camera node
//!
//! Every value the workers depend on (credentials, endpoints, pacing
//! intervals, pool and client limits) is injected from here rather than
//! hardcoded, so tests can shrink intervals and bound retries.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Wireless link credentials and attach policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfig {
    #[serde(default = "default_ssid")]
    pub ssid: String,

    #[serde(default = "default_password")]
    pub password: String,

    /// Link status poll period while attaching
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Log attach progress every N polls
    #[serde(default = "default_progress_every")]
    pub progress_every: u32,

    /// Force a full detach/reattach every N polls
    #[serde(default = "default_restart_every")]
    pub restart_every: u32,

    /// Pause between detach and reattach on a forced restart
    #[serde(default = "default_restart_pause_ms")]
    pub restart_pause_ms: u64,

    /// Address the host link driver routes towards to decide whether the
    /// link is up. Defaults to the broker endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_addr: Option<String>,
}

/// Message broker endpoint and command-channel pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BrokerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_command_topic")]
    pub command_topic: String,

    #[serde(default = "default_status_topic")]
    pub status_topic: String,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

/// How frames travel to the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadMode {
    /// One long-lived multipart request carrying every frame
    Stream,
    /// One request and connection per frame
    PerFrame,
}

/// Remote frame collector endpoint and upload pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CollectorConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_collector_port")]
    pub port: u16,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_upload_mode")]
    pub mode: UploadMode,

    #[serde(default = "default_upload_frame_interval_ms")]
    pub frame_interval_ms: u64,

    #[serde(default = "default_upload_idle_interval_ms")]
    pub idle_interval_ms: u64,

    #[serde(default = "default_link_down_interval_ms")]
    pub link_down_interval_ms: u64,

    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on one write to the collector
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Camera warm-up delay before the first upload cycle
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
}

/// RTSP-style streaming responder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamingConfig {
    /// Initial value of the process-wide streaming toggle
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_streaming_port")]
    pub port: u16,

    #[serde(default = "default_stream_path")]
    pub path: String,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_streaming_frame_interval_ms")]
    pub frame_interval_ms: u64,

    /// Upper bound on one write to a viewer
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Delay between attempts to bind the listening port
    #[serde(default = "default_bind_retry_ms")]
    pub bind_retry_ms: u64,
}

/// Camera source and frame-buffer pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    /// `synthetic` for generated frames, otherwise a directory of JPEG files
    #[serde(default = "default_camera_source")]
    pub source: String,

    /// Number of frame buffers the driver can hand out at once
    #[serde(default = "default_fb_count")]
    pub fb_count: usize,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Sensor JPEG quality (0-63, lower is better)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// Health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SupervisorConfig {
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,

    #[serde(default = "default_low_memory_threshold_kb")]
    pub low_memory_threshold_kb: u64,
}

// Default value functions
fn default_ssid() -> String {
    "ESP32".to_string()
}

fn default_password() -> String {
    "12345678".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_progress_every() -> u32 {
    20
}

fn default_restart_every() -> u32 {
    60
}

fn default_restart_pause_ms() -> u64 {
    1000
}

fn default_server_host() -> String {
    "192.168.4.6".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "ESP32CAM_RI1".to_string()
}

fn default_command_topic() -> String {
    "esp32cam/commands".to_string()
}

fn default_status_topic() -> String {
    "esp32cam/status".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_loop_interval_ms() -> u64 {
    100
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_collector_port() -> u16 {
    8080
}

fn default_device_id() -> String {
    "RI1".to_string()
}

fn default_upload_mode() -> UploadMode {
    UploadMode::Stream
}

fn default_upload_frame_interval_ms() -> u64 {
    50
}

fn default_upload_idle_interval_ms() -> u64 {
    500
}

fn default_link_down_interval_ms() -> u64 {
    1000
}

fn default_connect_retry_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_start_delay_ms() -> u64 {
    2000
}

fn default_write_timeout_ms() -> u64 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_streaming_port() -> u16 {
    554
}

fn default_stream_path() -> String {
    "/stream".to_string()
}

fn default_max_clients() -> usize {
    3
}

fn default_streaming_frame_interval_ms() -> u64 {
    33
}

fn default_bind_retry_ms() -> u64 {
    5000
}

fn default_camera_source() -> String {
    "synthetic".to_string()
}

fn default_fb_count() -> usize {
    2
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_jpeg_quality() -> u8 {
    10
}

fn default_report_interval_secs() -> u64 {
    5
}

fn default_low_memory_threshold_kb() -> u64 {
    32
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: default_ssid(),
            password: default_password(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_every: default_progress_every(),
            restart_every: default_restart_every(),
            restart_pause_ms: default_restart_pause_ms(),
            probe_addr: None,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
            command_topic: default_command_topic(),
            status_topic: default_status_topic(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            loop_interval_ms: default_loop_interval_ms(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_collector_port(),
            device_id: default_device_id(),
            mode: default_upload_mode(),
            frame_interval_ms: default_upload_frame_interval_ms(),
            idle_interval_ms: default_upload_idle_interval_ms(),
            link_down_interval_ms: default_link_down_interval_ms(),
            connect_retry_ms: default_connect_retry_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            start_delay_ms: default_start_delay_ms(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_ip: default_bind_ip(),
            port: default_streaming_port(),
            path: default_stream_path(),
            max_clients: default_max_clients(),
            frame_interval_ms: default_streaming_frame_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            bind_retry_ms: default_bind_retry_ms(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_camera_source(),
            fb_count: default_fb_count(),
            width: default_width(),
            height: default_height(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval_secs(),
            low_memory_threshold_kb: default_low_memory_threshold_kb(),
        }
    }
}

impl NetworkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

impl BrokerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl CollectorConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn link_down_interval(&self) -> Duration {
        Duration::from_millis(self.link_down_interval_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl StreamingConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn bind_retry(&self) -> Duration {
        Duration::from_millis(self.bind_retry_ms)
    }
}

impl SupervisorConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Address the link driver probes, falling back to the broker endpoint
    pub fn probe_addr(&self) -> String {
        self.network
            .probe_addr
            .clone()
            .unwrap_or_else(|| self.broker.endpoint())
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        if net.ssid.is_empty() {
            return Err(invalid("network.ssid must not be empty"));
        }
        if net.poll_interval_ms == 0 {
            return Err(invalid("network.poll-interval-ms must be > 0"));
        }
        if net.restart_pause_ms == 0 {
            return Err(invalid("network.restart-pause-ms must be > 0"));
        }
        if net.progress_every == 0 {
            return Err(invalid("network.progress-every must be > 0"));
        }
        if net.restart_every <= net.progress_every {
            return Err(ConfigError::Invalid(format!(
                "network.restart-every ({}) must be greater than progress-every ({})",
                net.restart_every, net.progress_every
            )));
        }

        let broker = &self.broker;
        if broker.client_id.is_empty() {
            return Err(invalid("broker.client-id must not be empty"));
        }
        if broker.command_topic.is_empty() || broker.status_topic.is_empty() {
            return Err(invalid("broker topics must not be empty"));
        }
        if broker.port == 0 {
            return Err(invalid("broker.port must be > 0"));
        }
        if broker.heartbeat_secs == 0 || broker.loop_interval_ms == 0 {
            return Err(invalid("broker heartbeat and loop intervals must be > 0"));
        }
        if broker.reconnect_delay_secs == 0 {
            return Err(invalid("broker.reconnect-delay-secs must be > 0"));
        }
        if broker.keep_alive_secs < 5 {
            return Err(invalid("broker.keep-alive-secs must be at least 5"));
        }

        let collector = &self.collector;
        if collector.port == 0 {
            return Err(invalid("collector.port must be > 0"));
        }
        if collector.device_id.is_empty() {
            return Err(invalid("collector.device-id must not be empty"));
        }
        if collector.frame_interval_ms == 0
            || collector.idle_interval_ms == 0
            || collector.link_down_interval_ms == 0
            || collector.connect_retry_ms == 0
            || collector.connect_timeout_ms == 0
            || collector.write_timeout_ms == 0
        {
            return Err(invalid("collector intervals must be > 0"));
        }

        let streaming = &self.streaming;
        if streaming.max_clients == 0 {
            return Err(invalid("streaming.max-clients must be > 0"));
        }
        if streaming.frame_interval_ms == 0
            || streaming.write_timeout_ms == 0
            || streaming.bind_retry_ms == 0
        {
            return Err(invalid("streaming intervals must be > 0"));
        }
        if !streaming.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "streaming.path must start with '/', got {}",
                streaming.path
            )));
        }

        let camera = &self.camera;
        if camera.fb_count == 0 {
            return Err(invalid("camera.fb-count must be > 0"));
        }
        if camera.width == 0 || camera.height == 0 {
            return Err(invalid("camera width and height must be > 0"));
        }
        if camera.jpeg_quality > 63 {
            return Err(ConfigError::Invalid(format!(
                "camera.jpeg-quality must be between 0 and 63, got {}",
                camera.jpeg_quality
            )));
        }

        if self.supervisor.report_interval_secs == 0 {
            return Err(invalid("supervisor.report-interval-secs must be > 0"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.broker.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.collector.mode, UploadMode::Stream);
        assert_eq!(config.streaming.max_clients, 3);
        assert_eq!(config.probe_addr(), "192.168.4.6:1883");
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[network]
ssid = "lab"
password = "secret"
probe-addr = "10.0.0.1:80"

[broker]
host = "10.0.0.2"
command-topic = "cam/cmd"

[collector]
host = "10.0.0.3"
port = 9000
mode = "per-frame"

[streaming]
enabled = false
port = 8554
max-clients = 5

[camera]
source = "/var/lib/camnode/frames"
fb-count = 1
        "#;

        let config = Config::from_str(toml).unwrap();

        assert_eq!(config.network.ssid, "lab");
        assert_eq!(config.probe_addr(), "10.0.0.1:80");
        assert_eq!(config.broker.command_topic, "cam/cmd");
        assert_eq!(config.broker.status_topic, "esp32cam/status");
        assert_eq!(config.collector.endpoint(), "10.0.0.3:9000");
        assert_eq!(config.collector.mode, UploadMode::PerFrame);
        assert!(!config.streaming.enabled);
        assert_eq!(config.streaming.max_clients, 5);
        assert_eq!(config.camera.fb_count, 1);
    }

    #[test]
    fn test_restart_must_exceed_progress() {
        let toml = r#"
[network]
progress-every = 20
restart-every = 20
        "#;

        assert_matches!(Config::from_str(toml), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn test_invalid_limits() {
        assert!(Config::from_str("[streaming]\nmax-clients = 0").is_err());
        assert!(Config::from_str("[camera]\nfb-count = 0").is_err());
        assert!(Config::from_str("[camera]\njpeg-quality = 64").is_err());
        assert!(Config::from_str("[streaming]\npath = \"stream\"").is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for toml in [
            "[broker]\nreconnect-delay-secs = 0",
            "[collector]\nconnect-timeout-ms = 0",
            "[collector]\nwrite-timeout-ms = 0",
            "[network]\nrestart-pause-ms = 0",
            "[streaming]\nwrite-timeout-ms = 0",
            "[streaming]\nbind-retry-ms = 0",
        ] {
            assert_matches!(Config::from_str(toml), Err(ConfigError::Invalid(_)), "{}", toml);
        }
    }

    #[test]
    fn test_unknown_mode_is_parse_error() {
        let result = Config::from_str("[collector]\nmode = \"carrier-pigeon\"");
        assert_matches!(result, Err(ConfigError::Parse(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camnode.toml");

        let mut config = Config::default();
        config.collector.device_id = "RI9".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.collector.device_id, "RI9");
        assert_eq!(loaded.network.restart_every, config.network.restart_every);
    }
}
