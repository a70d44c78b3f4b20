use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::classifier::Thresholds;
use crate::error::ConfigError;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub device: TrackedDevice,
    #[serde(default)]
    pub proximity: ProximityConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub lock: LockConfig,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

/// The one device whose presence keeps the session unlocked.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TrackedDevice {
    pub address: MacAddress,
    pub name: Option<String>,
}

impl TrackedDevice {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.address.to_string())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProximityConfig {
    pub near_threshold: i16,
    pub far_threshold: i16,
    pub hysteresis_margin: i16,
    pub trigger_count: u32,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        ProximityConfig {
            near_threshold: -60,
            far_threshold: -80,
            hysteresis_margin: 3,
            trigger_count: 3,
        }
    }
}

impl ProximityConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            near: self.near_threshold,
            far: self.far_threshold,
            margin: self.hysteresis_margin,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SamplerBackend {
    /// Watch BLE advertisements through the system Bluetooth stack.
    #[default]
    Ble,
    /// Ask `hcitool` for the RSSI of an already connected device.
    Hcitool,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    pub interval_seconds: u64,
    pub sample_timeout_seconds: u64,
    pub backend: SamplerBackend,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            interval_seconds: 10,
            sample_timeout_seconds: 8,
            backend: SamplerBackend::Ble,
        }
    }
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.sample_timeout_seconds)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub command_timeout_seconds: u64,
    pub skip_if_locked: bool,
    pub dry_run: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            command_timeout_seconds: 5,
            skip_if_locked: true,
            dry_run: false,
        }
    }
}

impl LockConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents, &path.display().to_string())
    }

    /// Parses a TOML config, or a file holding nothing but the device address.
    pub fn parse(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let config = match toml::de::from_str::<AppConfig>(contents) {
            Ok(config) => config,
            Err(source) => match MacAddress::from_str(contents.trim()) {
                Ok(address) => AppConfig::for_address(address),
                Err(_) => {
                    return Err(ConfigError::Parse {
                        path: origin.to_string(),
                        source,
                    });
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn for_address(address: MacAddress) -> Self {
        AppConfig {
            device: TrackedDevice {
                address,
                name: None,
            },
            proximity: ProximityConfig::default(),
            scan: ScanConfig::default(),
            lock: LockConfig::default(),
            mqtt: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { field, reason })
        };

        if self.device.address.bytes() == [0; 6] {
            return invalid("device.address", "address must not be all zeroes".into());
        }

        let p = &self.proximity;
        if p.near_threshold <= p.far_threshold {
            return invalid(
                "proximity.near_threshold",
                format!(
                    "must be greater than far_threshold ({} <= {})",
                    p.near_threshold, p.far_threshold
                ),
            );
        }
        if p.hysteresis_margin < 0 {
            return invalid("proximity.hysteresis_margin", "must not be negative".into());
        }
        if 2 * i32::from(p.hysteresis_margin)
            >= i32::from(p.near_threshold) - i32::from(p.far_threshold)
        {
            return invalid(
                "proximity.hysteresis_margin",
                "twice the margin must be smaller than the gap between thresholds".into(),
            );
        }
        if p.trigger_count == 0 {
            return invalid("proximity.trigger_count", "must be at least 1".into());
        }

        let s = &self.scan;
        if s.interval_seconds == 0 {
            return invalid("scan.interval_seconds", "must be at least 1".into());
        }
        if s.sample_timeout_seconds == 0 || s.sample_timeout_seconds >= s.interval_seconds {
            return invalid(
                "scan.sample_timeout_seconds",
                format!(
                    "must be between 1 and interval_seconds - 1 ({})",
                    s.interval_seconds - 1
                ),
            );
        }

        if self.lock.command_timeout_seconds == 0 {
            return invalid("lock.command_timeout_seconds", "must be at least 1".into());
        }

        Ok(())
    }
}
