//! Application configuration.
//!
//! Loaded with `figment` from a TOML file layered with environment-variable
//! overrides (`figment = { features = ["toml", "env"] }`). Every runtime
//! tunable (poll intervals, debounce, streaming floors, error budgets,
//! timeouts, library size limits) lives here with its documented default.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings for a running `lab-controller` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Device session polling / reconnection tunables.
    pub session: SessionSettings,
    /// Oscilloscope streaming tunables.
    pub scope: ScopeSettings,
    /// Transport timeout tunables.
    pub transport: TransportSettings,
    /// Sequence library validation limits.
    pub sequence: SequenceSettings,
    /// Directory backing the persistent key-value store.
    pub store_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            scope: ScopeSettings::default(),
            transport: TransportSettings::default(),
            sequence: SequenceSettings::default(),
            store_dir: "./lab-controller-data".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if present) layered under defaults, with
    /// `LAB_CONTROLLER_*` environment variables taking final precedence.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::from(figment::providers::Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LAB_CONTROLLER_").split("__"))
            .extract()
    }
}

/// Session polling/debounce/reconnection tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Interval between `get_status` polls for continuous (PSU/load) sessions. Default 250ms.
    pub poll_interval_ms: u64,
    /// Debounce quiescence window for non-immediate `set_value` calls. Default 100ms.
    pub debounce_ms: u64,
    /// Consecutive failures before a continuous session is declared `disconnected`. Default 5.
    pub max_consecutive_errors: u32,
    /// Capacity of each session's history ring buffer. Default 10,000.
    pub history_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            debounce_ms: 100,
            max_consecutive_errors: 5,
            history_capacity: 10_000,
        }
    }
}

/// Oscilloscope streaming tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    /// Idle-mode status poll interval. Default 500ms.
    pub status_poll_interval_ms: u64,
    /// Minimum waveform-fetch interval when streaming one channel. Default 200ms.
    pub single_channel_floor_ms: u64,
    /// Minimum waveform-fetch interval when streaming two or more channels. Default 350ms.
    pub multi_channel_floor_ms: u64,
    /// Consecutive transport errors before a scope session is declared `disconnected`. Default 3.
    pub max_consecutive_errors: u32,
    /// Settling delay enforced after `auto_setup` before the next status poll. Default 1.5s.
    pub auto_setup_settle_ms: u64,
    /// Cap on the DFT size used for local `FREQ`/`PER` computation.
    pub max_dft_points: usize,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: 500,
            single_channel_floor_ms: 200,
            multi_channel_floor_ms: 350,
            max_consecutive_errors: 3,
            auto_setup_settle_ms: 1_500,
            max_dft_points: 4096,
        }
    }
}

impl ScopeSettings {
    /// The waveform-fetch floor for a channel set of the given size.
    pub fn floor_for_channel_count(&self, channel_count: usize) -> Duration {
        let ms = if channel_count <= 1 {
            self.single_channel_floor_ms
        } else {
            self.multi_channel_floor_ms
        };
        Duration::from_millis(ms)
    }
}

/// Transport timeout tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Serial transport default timeout. Default 2s.
    pub serial_timeout_ms: u64,
    /// USB-TMC transport default timeout. Default 5s.
    pub usbtmc_timeout_ms: u64,
    /// Waveform fetch timeout. Default 10s.
    pub waveform_timeout_ms: u64,
    /// Screenshot fetch timeout. Default 15s.
    pub screenshot_timeout_ms: u64,
    /// Per-command minimum delay for serial devices. Default 50ms.
    pub serial_min_command_delay_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            serial_timeout_ms: 2_000,
            usbtmc_timeout_ms: 5_000,
            waveform_timeout_ms: 10_000,
            screenshot_timeout_ms: 15_000,
            serial_min_command_delay_ms: 50,
        }
    }
}

/// Sequence library validation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceSettings {
    /// Maximum number of sequences the library may hold.
    pub max_library_size: usize,
    /// Minimum accepted `pointsPerCycle`.
    pub min_points_per_cycle: u32,
    /// Maximum accepted `pointsPerCycle`.
    pub max_points_per_cycle: u32,
    /// Minimum accepted `intervalMs`.
    pub min_interval_ms: u64,
    /// Maximum accepted `intervalMs`.
    pub max_interval_ms: u64,
    /// Maximum accepted arbitrary-waveform step count.
    pub max_arbitrary_steps: usize,
    /// Maximum accepted sequence/script name length.
    pub max_name_len: usize,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            max_library_size: 256,
            min_points_per_cycle: 2,
            max_points_per_cycle: 10_000,
            min_interval_ms: 10,
            max_interval_ms: 3_600_000,
            max_arbitrary_steps: 10_000,
            max_name_len: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let s = Settings::default();
        assert_eq!(s.session.poll_interval_ms, 250);
        assert_eq!(s.session.debounce_ms, 100);
        assert_eq!(s.session.max_consecutive_errors, 5);
        assert_eq!(s.session.history_capacity, 10_000);
        assert_eq!(s.scope.max_consecutive_errors, 3);
        assert_eq!(s.sequence.min_points_per_cycle, 2);
        assert_eq!(s.sequence.max_points_per_cycle, 10_000);
    }

    #[test]
    fn scope_floor_depends_on_channel_count() {
        let s = ScopeSettings::default();
        assert_eq!(s.floor_for_channel_count(1), Duration::from_millis(200));
        assert_eq!(s.floor_for_channel_count(2), Duration::from_millis(350));
        assert_eq!(s.floor_for_channel_count(4), Duration::from_millis(350));
    }
}
