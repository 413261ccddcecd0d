//! Gateway configuration (serde, explicit normative defaults).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment tag used to resolve `known_firmware/<app>_<env>.bin`.
    pub environment: String,
    pub log_api_messages: bool,
    pub show_verbose_device_logs: bool,
    pub logging: LoggingConfig,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            log_api_messages: false,
            show_verbose_device_logs: false,
            logging: LoggingConfig::default(),
            limits: Limits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            format: LogFormat::Compact,
        }
    }
}

/// Protocol limits and timers.
///
/// Values are explicit about their units to avoid confusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Message ids wrap at this value; must fit the 16-bit id field.
    pub message_counter_max: u32,
    pub keepalive_ms: u64,
    pub socket_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub raise_hand_timeout_ms: u64,
    pub max_binary_size: usize,
    pub flash_chunk_size: usize,
    pub max_chunk_retries: u32,
    pub max_frame_bytes: usize,
    pub max_event_name_bytes: usize,
    pub default_event_ttl_secs: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            message_counter_max: 65_536,
            keepalive_ms: 15_000,
            socket_timeout_ms: 31_000,
            request_timeout_ms: 30_000,
            raise_hand_timeout_ms: 30_000,
            max_binary_size: 108_000,
            flash_chunk_size: 512,
            max_chunk_retries: 3,
            max_frame_bytes: 65_535,
            max_event_name_bytes: 63,
            default_event_ttl_secs: 60,
        }
    }
}
