//! Device and session configuration.
//!
//! A [`RelayConfig`] document lists the devices to relay and the tuning shared
//! by all of their sessions. It is plain JSON so it can be produced by any
//! registry or admin tool.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkShape, SAMPLES_PER_CHANNEL};
use crate::error::ConfigError;

/// Channel count assumed for a replay file when none is configured.
pub const DEFAULT_REPLAY_CHANNELS: usize = 128;

/// Channels requested from a device whose channel list is empty.
pub const DEFAULT_CHANNEL_COUNT: u32 = 32;

fn default_replay_channels() -> usize {
    DEFAULT_REPLAY_CHANNELS
}

/// Static configuration of one acquisition device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable device identifier.
    pub id: String,

    /// Human-readable label used in logs.
    #[serde(default)]
    pub name: String,

    /// `host:port` of the device's acquisition service, optionally with a scheme.
    pub address: String,

    /// Channel numbers to request. Empty means channels `0..32`.
    #[serde(default)]
    pub channels: Vec<u32>,

    /// Recorded data to replay when the device cannot be reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_file: Option<PathBuf>,

    /// Number of channels stored in the replay file.
    #[serde(default = "default_replay_channels")]
    pub replay_channels: usize,
}

impl DeviceConfig {
    /// Creates a config with default channels and no replay file.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            channels: Vec::new(),
            replay_file: None,
            replay_channels: DEFAULT_REPLAY_CHANNELS,
        }
    }

    /// Sets the human-readable name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the channel numbers to request.
    #[must_use]
    pub fn with_channels(mut self, channels: impl IntoIterator<Item = u32>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    /// Sets the replay file and its channel count.
    #[must_use]
    pub fn with_replay_file(mut self, path: impl Into<PathBuf>, channels: usize) -> Self {
        self.replay_file = Some(path.into());
        self.replay_channels = channels;
        self
    }

    /// Channel numbers actually requested from the device.
    #[must_use]
    pub fn requested_channels(&self) -> Vec<u32> {
        if self.channels.is_empty() {
            (0..DEFAULT_CHANNEL_COUNT).collect()
        } else {
            self.channels.clone()
        }
    }

    /// Number of channels every chunk of this device's session carries.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.channels.is_empty() {
            DEFAULT_CHANNEL_COUNT as usize
        } else {
            self.channels.len()
        }
    }

    /// Validates identity, address and replay geometry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceId);
        }
        validate_address(&self.address)?;
        if self.replay_channels == 0 {
            return Err(ConfigError::ZeroValue {
                field: "replay_channels".to_string(),
            });
        }
        Ok(())
    }
}

/// `address` with an `http://` scheme prepended when none is given.
#[must_use]
pub fn endpoint_uri(address: &str) -> String {
    let address = address.trim();
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Checks that `count` consecutive ports starting at `base_port` all exist.
pub fn check_port_range(base_port: u16, count: u16) -> Result<(), ConfigError> {
    match base_port.checked_add(count.saturating_sub(1)) {
        Some(_) => Ok(()),
        None => Err(ConfigError::PortRangeOverflow { base_port, count }),
    }
}

fn validate_address(address: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = address.trim();
    let authority = match trimmed.split_once("://") {
        Some(("http" | "https", rest)) => rest,
        Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme '{scheme}'"))),
        None => trimmed,
    };
    let authority = authority.trim_end_matches('/');

    let Some((host, port)) = authority.rsplit_once(':') else {
        return Err(invalid("expected host:port"));
    };
    if host.is_empty() || host.chars().any(char::is_whitespace) || host.contains('/') {
        return Err(invalid("invalid host"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid("invalid port")),
        Ok(_) => Ok(()),
    }
}

/// Thresholds of the signal monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// A sample counts as an anomaly when its magnitude exceeds this.
    pub amplitude_threshold: f32,
    /// Anomaly count above which the device becomes unhealthy.
    pub enter_threshold: usize,
    /// Anomaly count below which an unhealthy device recovers.
    pub exit_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            amplitude_threshold: 50.0,
            enter_threshold: 800,
            exit_threshold: 200,
        }
    }
}

impl MonitorConfig {
    /// The exit threshold must sit strictly below the enter threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exit_threshold >= self.enter_threshold {
            return Err(ConfigError::InvalidHysteresis {
                enter: self.enter_threshold,
                exit: self.exit_threshold,
            });
        }
        Ok(())
    }
}

/// Timing and batching shared by every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTuning {
    /// Production cadence of local sources.
    pub chunk_interval_ms: u64,
    /// Samples per channel in one chunk.
    pub samples_per_channel: usize,
    /// Chunks accumulated before a consumer delivery.
    pub batch_size: usize,
    /// Delay before re-opening a dropped remote stream.
    pub reconnect_delay_ms: u64,
    /// Per-stream buffer of health events.
    pub health_stream_capacity: usize,
    /// Signal monitor thresholds.
    pub monitor: MonitorConfig,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 100,
            samples_per_channel: SAMPLES_PER_CHANNEL,
            batch_size: 10,
            reconnect_delay_ms: 5_000,
            health_stream_capacity: 64,
            monitor: MonitorConfig::default(),
        }
    }
}

impl SessionTuning {
    /// Production cadence as a `Duration`.
    #[must_use]
    pub const fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    /// Reconnect delay as a `Duration`.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Chunk geometry of a session for `device`.
    #[must_use]
    pub fn shape_for(&self, device: &DeviceConfig) -> ChunkShape {
        ChunkShape::new(device.channel_count(), self.samples_per_channel)
    }

    /// Rejects zero intervals, sizes and inverted hysteresis.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("chunk_interval_ms", self.chunk_interval_ms == 0),
            ("samples_per_channel", self.samples_per_channel == 0),
            ("batch_size", self.batch_size == 0),
            ("reconnect_delay_ms", self.reconnect_delay_ms == 0),
            ("health_stream_capacity", self.health_stream_capacity == 0),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::ZeroValue {
                field: (*field).to_string(),
            });
        }
        self.monitor.validate()
    }
}

/// Top-level relay configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Tuning shared by every session.
    #[serde(default)]
    pub tuning: SessionTuning,
    /// Devices to relay, in configuration order.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl RelayConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    /// `count` simulated devices on consecutive ports starting at `base_port`,
    /// 32 channels each, replaying `wavelet_signal.bin` when present.
    pub fn simulated(count: u16, base_port: u16) -> Result<Self, ConfigError> {
        check_port_range(base_port, count)?;
        let devices = (0..count)
            .map(|i| {
                let first = u32::from(i) * DEFAULT_CHANNEL_COUNT;
                DeviceConfig::new(format!("sim-{i}"), format!("localhost:{}", base_port + i))
                    .with_name(format!("MEA {}", i + 1))
                    .with_channels(first..first + DEFAULT_CHANNEL_COUNT)
                    .with_replay_file("wavelet_signal.bin", DEFAULT_REPLAY_CHANNELS)
            })
            .collect();
        Ok(Self {
            tuning: SessionTuning::default(),
            devices,
        })
    }

    /// Validates tuning, every device, and id uniqueness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tuning.validate()?;
        let mut seen = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateDevice {
                    id: device.id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// In-memory registry of device configurations, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceConfig>,
}

impl DeviceRegistry {
    /// Builds a registry, rejecting invalid or duplicate devices.
    pub fn new(devices: Vec<DeviceConfig>) -> Result<Self, ConfigError> {
        let config = RelayConfig {
            tuning: SessionTuning::default(),
            devices,
        };
        config.validate()?;
        Ok(Self {
            devices: config.devices,
        })
    }

    /// Looks a device up by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Devices in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter()
    }

    /// Number of registered devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns true when no device is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl TryFrom<&RelayConfig> for DeviceRegistry {
    type Error = ConfigError;

    fn try_from(config: &RelayConfig) -> Result<Self, Self::Error> {
        Self::new(config.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_channels() {
        let device = DeviceConfig::new("sim-0", "localhost:5051");
        assert_eq!(device.channel_count(), 32);
        assert_eq!(device.requested_channels(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_explicit_channels() {
        let device = DeviceConfig::new("sim-1", "localhost:5052").with_channels(32..40);
        assert_eq!(device.channel_count(), 8);
        assert_eq!(device.requested_channels()[0], 32);
    }

    #[test]
    fn test_address_validation() {
        assert!(DeviceConfig::new("a", "localhost:5051").validate().is_ok());
        assert!(DeviceConfig::new("a", "http://172.30.2.132:5051").validate().is_ok());
        assert!(DeviceConfig::new("a", "[::1]:5051").validate().is_ok());

        for bad in ["", "localhost", "localhost:", "localhost:99999", "ftp://h:1", "bad host:1"] {
            let err = DeviceConfig::new("a", bad).validate().unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidAddress { .. }),
                "{bad:?} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_empty_id_rejected() {
        let err = DeviceConfig::new("  ", "localhost:5051").validate().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyDeviceId));
    }

    #[test]
    fn test_endpoint_uri() {
        assert_eq!(endpoint_uri("localhost:5051"), "http://localhost:5051");
        assert_eq!(endpoint_uri(" https://dev:443 "), "https://dev:443");
    }

    #[test]
    fn test_port_range_overflow() {
        assert!(check_port_range(65_535, 1).is_ok());
        assert!(check_port_range(65_534, 2).is_ok());
        assert!(check_port_range(5051, 0).is_ok());
        assert!(matches!(
            check_port_range(65_535, 2),
            Err(ConfigError::PortRangeOverflow { base_port: 65_535, count: 2 })
        ));
        assert!(matches!(
            RelayConfig::simulated(2, 65_535),
            Err(ConfigError::PortRangeOverflow { .. })
        ));
    }

    #[test]
    fn test_tuning_defaults() {
        let tuning = SessionTuning::default();
        assert_eq!(tuning.chunk_interval(), Duration::from_millis(100));
        assert_eq!(tuning.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(tuning.samples_per_channel, 160);
        assert_eq!(tuning.batch_size, 10);
        assert!(tuning.validate().is_ok());
    }

    #[test]
    fn test_tuning_rejects_zero_and_inverted_hysteresis() {
        let tuning = SessionTuning {
            batch_size: 0,
            ..SessionTuning::default()
        };
        assert!(matches!(
            tuning.validate(),
            Err(ConfigError::ZeroValue { field }) if field == "batch_size"
        ));

        let tuning = SessionTuning {
            monitor: MonitorConfig {
                enter_threshold: 200,
                exit_threshold: 200,
                ..MonitorConfig::default()
            },
            ..SessionTuning::default()
        };
        assert!(matches!(
            tuning.validate(),
            Err(ConfigError::InvalidHysteresis { .. })
        ));
    }

    #[test]
    fn test_relay_config_from_json() {
        let json = r#"{
            "tuning": { "batch_size": 5 },
            "devices": [
                { "id": "sim-0", "address": "localhost:5051", "channels": [0, 1, 2] },
                { "id": "sim-1", "address": "localhost:5052", "replay_file": "rec.bin" }
            ]
        }"#;
        let config = RelayConfig::from_json_str(json).unwrap();
        assert_eq!(config.tuning.batch_size, 5);
        assert_eq!(config.tuning.chunk_interval_ms, 100);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].channel_count(), 3);
        assert_eq!(config.devices[1].replay_channels, 128);
        assert_eq!(config.devices[1].replay_file, Some(PathBuf::from("rec.bin")));
    }

    #[test]
    fn test_relay_config_rejects_duplicates() {
        let json = r#"{ "devices": [
            { "id": "sim-0", "address": "localhost:5051" },
            { "id": "sim-0", "address": "localhost:5052" }
        ] }"#;
        let err = RelayConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDevice { id } if id == "sim-0"));
    }

    #[test]
    fn test_relay_config_parse_error() {
        let err = RelayConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_simulated_config() {
        let config = RelayConfig::simulated(4, 5051).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.devices[3].address, "localhost:5054");
        assert_eq!(config.devices[3].channels[0], 96);
        assert_eq!(config.devices[3].name, "MEA 4");
    }

    #[test]
    fn test_registry_lookup() {
        let registry = DeviceRegistry::try_from(&RelayConfig::simulated(2, 6000).unwrap()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("sim-1").unwrap().address, "localhost:6001");
        assert!(registry.get("sim-7").is_none());
    }
}
