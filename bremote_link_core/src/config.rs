// Test configuration structures

use crate::error::LinkError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Pass/fail limits applied by the analyzer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VerdictThresholds {
    pub max_packet_loss_percent: f64,
    pub max_value_diff: u32,     // Largest tolerated |tx - rx| on throttle or steering
    pub min_avg_rssi_dbm: f64,   // Average RSSI below this is a weak link
    pub min_matched_pairs: usize,
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        VerdictThresholds {
            max_packet_loss_percent: 20.0,
            max_value_diff: 5,
            min_avg_rssi_dbm: -100.0,
            min_matched_pairs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkTestConfig {
    pub duration_secs: u64,

    // Correlation tuning. Both values are carried over unchanged from the
    // bench setup; treat them as knobs, not derived quantities.
    pub match_window_ms: u64,
    pub match_scan_depth: usize,

    pub poll_interval_ms: u64,  // Listener idle backoff when no bytes are pending
    pub join_timeout_ms: u64,   // How long stop() waits for each listener

    pub command_timeout_ms: u64,   // Response collection window for synchronous commands
    pub command_delay_ms: u64,     // Settle time between writing a command and reading
    pub stream_start_gap_ms: u64,  // Pause between enabling TX and RX streaming

    pub tx_stream_command: String,
    pub rx_stream_command: String,

    pub baud_rate: u32, // Serial devices only, the port is opened raw at this rate

    pub device_checks: bool,        // Per-device checks before the link test
    pub charge_exit_settle_ms: u64, // Wait after `?exitchg` before the first check

    pub thresholds: VerdictThresholds,
}

impl Default for LinkTestConfig {
    fn default() -> Self {
        LinkTestConfig {
            duration_secs: 10,
            match_window_ms: 200,
            match_scan_depth: 50,
            poll_interval_ms: 10,
            join_timeout_ms: 1000,
            command_timeout_ms: 2000,
            command_delay_ms: 100,
            stream_start_gap_ms: 200,
            tx_stream_command: "?printInputs".to_string(),
            rx_stream_command: "?printReceived".to_string(),
            baud_rate: 115_200,
            device_checks: true,
            charge_exit_settle_ms: 500,
            thresholds: VerdictThresholds::default(),
        }
    }
}

impl LinkTestConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, LinkError> {
        let config: LinkTestConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.match_scan_depth == 0 {
            return Err(LinkError::Config("match_scan_depth must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(LinkError::Config("poll_interval_ms must be non-zero".to_string()));
        }
        if self.tx_stream_command.trim().is_empty() || self.rx_stream_command.trim().is_empty() {
            return Err(LinkError::Config("stream commands must not be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(LinkError::Config("baud_rate must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn match_window(&self) -> Duration {
        Duration::from_millis(self.match_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn stream_start_gap(&self) -> Duration {
        Duration::from_millis(self.stream_start_gap_ms)
    }

    pub fn charge_exit_settle(&self) -> Duration {
        Duration::from_millis(self.charge_exit_settle_ms)
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            command_delay: Duration::from_millis(self.command_delay_ms),
            poll_interval: self.poll_interval(),
            baud_rate: self.baud_rate,
        }
    }
}

/// Per-channel timing, derived from [`LinkTestConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub command_timeout: Duration,
    pub command_delay: Duration,
    pub poll_interval: Duration,
    pub baud_rate: u32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        LinkTestConfig::default().channel_settings()
    }
}
