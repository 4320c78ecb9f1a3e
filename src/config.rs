use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub device_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// RS-232 source. `None` runs the service without a serial reader, which is
    /// useful together with the inject command.
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Silence after the last byte before a dump is considered complete.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    /// Bytes beyond this are discarded; the indicator's largest print dumps
    /// run to roughly 40 KB.
    #[serde(default = "default_max_dump_bytes")]
    pub max_dump_bytes: usize,
    #[serde(default = "default_preview_lines")]
    pub preview_lines: usize,
    #[serde(default = "default_state_dir")]
    pub state_directory: String,
    #[serde(default = "default_queue_dir")]
    pub queue_directory: String,
    #[serde(default = "default_max_queued_dumps")]
    pub max_queued_dumps: usize,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    #[serde(default = "default_ap_ssid")]
    pub ap_ssid: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Deadline for a single station connection attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Timed-out attempts before the access point comes up alongside retries.
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_silence_timeout_ms() -> u64 {
    2000
}

fn default_max_dump_bytes() -> usize {
    50_000
}

fn default_preview_lines() -> usize {
    3
}

fn default_state_dir() -> String {
    "./deployment/state".to_string()
}

fn default_queue_dir() -> String {
    "./deployment/queue".to_string()
}

fn default_max_queued_dumps() -> usize {
    10
}

fn default_retry_base_ms() -> u64 {
    30_000
}

fn default_retry_cap_ms() -> u64 {
    300_000
}

fn default_ap_ssid() -> String {
    "weighbridge-setup".to_string()
}

fn default_hostname() -> String {
    "weighbridge".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_max_connect_attempts() -> u32 {
    3
}

fn default_reconnect_base_ms() -> u64 {
    5_000
}

fn default_reconnect_cap_ms() -> u64 {
    60_000
}

fn default_tick_ms() -> u64 {
    50
}

impl AppConfig {
    pub fn default_path() -> &'static str {
        "config/weighbridge.toml"
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read configuration from {}", path_ref.display()))?;
        let mut config: Self = toml::from_str(&raw).with_context(|| {
            format!("failed to parse configuration from {}", path_ref.display())
        })?;
        if config.device_name.trim().is_empty() {
            config.device_name = "weighbridge".to_string();
        }
        Ok(config)
    }
}
