//! Engine configuration
//!
//! Serde-deserializable knobs for the locator, pid engine, and command
//! runner. Defaults match the production firmware timings.

use serde::{Deserialize, Serialize};

/// Gateway locator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Well-known beacon port. Zero binds an ephemeral port (tests).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// How long a bridge stays listed without a fresh beacon
    #[serde(default = "default_record_ttl_ms")]
    pub record_ttl_ms: u64,
    /// Period of the expiry sweep
    #[serde(default = "default_second_ms")]
    pub sweep_interval_ms: u64,
    /// Receive race window; shutdown is re-checked each time it elapses
    #[serde(default = "default_second_ms")]
    pub receive_poll_ms: u64,
    /// Pause after a malformed packet or socket error
    #[serde(default = "default_second_ms")]
    pub receive_backoff_ms: u64,
}

fn default_listen_port() -> u16 {
    47664
}

fn default_record_ttl_ms() -> u64 {
    10_000
}

fn default_second_ms() -> u64 {
    1000
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            record_ttl_ms: default_record_ttl_ms(),
            sweep_interval_ms: default_second_ms(),
            receive_poll_ms: default_second_ms(),
            receive_backoff_ms: default_second_ms(),
        }
    }
}

/// Per-pid engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    /// How long a read stays fresh before `current_value` refreshes it
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Debounce window for setter-style writes
    #[serde(default = "default_write_debounce_ms")]
    pub write_debounce_ms: u64,
}

fn default_cache_ttl_ms() -> u64 {
    250
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn default_write_timeout_ms() -> u64 {
    6000
}

fn default_write_debounce_ms() -> u64 {
    250
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            write_debounce_ms: default_write_debounce_ms(),
        }
    }
}

/// Command runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Keep-alive requested when activating the remote-control session;
    /// zero means the transport default
    #[serde(default)]
    pub session_keep_alive_ms: u32,
    #[serde(default = "default_session_get_timeout_ms")]
    pub session_get_timeout_ms: u32,
    /// Hard cap on total processing time across retries
    #[serde(default = "default_processing_time_ms")]
    pub max_processing_time_ms: u64,
    /// Fixed wait between poll-callback retries
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_session_get_timeout_ms() -> u32 {
    3000
}

fn default_processing_time_ms() -> u64 {
    3000
}

fn default_retry_interval_ms() -> u64 {
    50
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            session_keep_alive_ms: 0,
            session_get_timeout_ms: default_session_get_timeout_ms(),
            max_processing_time_ms: default_processing_time_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_firmware_timings() {
        let pid = PidConfig::default();
        assert_eq!(pid.cache_ttl_ms, 250);
        assert_eq!(pid.write_debounce_ms, 250);
        assert_eq!(pid.read_timeout_ms, 3000);

        let cmd = CommandConfig::default();
        assert_eq!(cmd.retry_interval_ms, 50);
        assert_eq!(cmd.max_processing_time_ms, 3000);

        let loc = LocatorConfig::default();
        assert_eq!(loc.listen_port, 47664);
    }

    #[test]
    fn locator_config_deserializes_with_defaults() {
        let cfg: LocatorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.listen_port, 47664);
        assert_eq!(cfg.record_ttl_ms, 10_000);
    }
}
