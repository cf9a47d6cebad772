use std::fs;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{CoilId, DeviceId, SwitchId};
use crate::device::{DEFAULT_EJECT_TIMEOUT_MS, Mechanism};
use crate::events::EVENT_QUEUE_CAPACITY;
use crate::transfer::DEFAULT_MAX_ATTEMPTS;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    #[serde(default)]
    pub rotation: LogRotation,
    /// Emit per-event `EVENT` target logs
    #[serde(default)]
    pub enable_tracing: bool,
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
    pub machine: MachineConfig,
}

fn default_event_queue_size() -> usize {
    EVENT_QUEUE_CAPACITY
}

/// How often the log file rolls over
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

/// Ball devices, coils and transfer policy of one machine
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MachineConfig {
    /// Balls physically installed; checked against the boot scan
    #[serde(default)]
    pub balls_installed: Option<u32>,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub coils: Vec<CoilConfig>,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransferConfig {
    pub max_attempts: u32,
    pub eject_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            eject_timeout_ms: DEFAULT_EJECT_TIMEOUT_MS,
        }
    }
}

/// Driver variant behind a coil
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    #[default]
    Virtual,
    Logging,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoilConfig {
    pub id: CoilId,
    #[serde(default)]
    pub driver: DriverKind,
    pub pulse_ms: u32,
    #[serde(default = "default_power")]
    pub pulse_power: f32,
    /// Required for hold-mode ejects
    #[serde(default)]
    pub hold_power: Option<f32>,
    #[serde(default)]
    pub recycle_factor: Option<u32>,
}

fn default_power() -> f32 {
    1.0
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EjectMode {
    #[default]
    Pulse,
    Hold,
}

/// Hardware reflex: the device coil fires on its own when `switch` activates
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HardwareRuleConfig {
    pub switch: SwitchId,
    #[serde(default)]
    pub recycle: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConfig {
    pub id: DeviceId,
    /// Omitted = unbounded
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub mechanisms: Vec<Mechanism>,
    #[serde(default)]
    pub eject_targets: Vec<DeviceId>,
    /// Omitted = mechanical eject (player-operated plunger)
    #[serde(default)]
    pub coil: Option<CoilId>,
    #[serde(default)]
    pub eject_mode: EjectMode,
    #[serde(default)]
    pub hardware_rule: Option<HardwareRuleConfig>,
    /// Keep balls until requested (trough)
    #[serde(default)]
    pub hold_balls: bool,
    /// Device whose balls can drain straight into this one
    #[serde(default)]
    pub captures_from: Option<DeviceId>,
    #[serde(default)]
    pub initial_balls: u32,
    /// Overrides `transfer.eject_timeout_ms`
    #[serde(default)]
    pub eject_timeout_ms: Option<u64>,
}

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Duplicate device id: {0}")]
    DuplicateDevice(DeviceId),

    #[error("Duplicate coil id: {0}")]
    DuplicateCoil(CoilId),

    #[error("Device {device} targets unknown device {target}")]
    UnknownTarget { device: DeviceId, target: DeviceId },

    #[error("Device {0} lists itself as an eject target")]
    SelfTarget(DeviceId),

    #[error("Device {device} uses unknown coil {coil}")]
    UnknownCoil { device: DeviceId, coil: CoilId },

    #[error("Switch {switch} is used by both {first} and {second}")]
    SwitchReused {
        switch: SwitchId,
        first: DeviceId,
        second: DeviceId,
    },

    #[error("Device {device} starts with {balls} balls but holds at most {capacity}")]
    InitialBallsExceedCapacity {
        device: DeviceId,
        balls: u32,
        capacity: u32,
    },

    #[error("No driver for coil {0}")]
    MissingDriver(CoilId),

    #[error("Conflicting switch rules for coil {0}")]
    ConflictingRule(CoilId),

    #[error("Device {device} captures from unknown device {source_device}")]
    UnknownCaptureSource {
        device: DeviceId,
        source_device: DeviceId,
    },

    #[error("Device {0} has a hardware rule but no coil")]
    HardwareRuleWithoutCoil(DeviceId),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "CONFIG_IO",
            ConfigError::Parse(_) => "CONFIG_PARSE",
            ConfigError::DuplicateDevice(_) => "DUPLICATE_DEVICE",
            ConfigError::DuplicateCoil(_) => "DUPLICATE_COIL",
            ConfigError::UnknownTarget { .. } => "UNKNOWN_TARGET",
            ConfigError::SelfTarget(_) => "SELF_TARGET",
            ConfigError::UnknownCoil { .. } => "UNKNOWN_COIL",
            ConfigError::SwitchReused { .. } => "SWITCH_REUSED",
            ConfigError::InitialBallsExceedCapacity { .. } => "INITIAL_BALLS_EXCEED_CAPACITY",
            ConfigError::MissingDriver(_) => "MISSING_DRIVER",
            ConfigError::ConflictingRule(_) => "CONFLICTING_RULE",
            ConfigError::UnknownCaptureSource { .. } => "UNKNOWN_CAPTURE_SOURCE",
            ConfigError::HardwareRuleWithoutCoil(_) => "HARDWARE_RULE_WITHOUT_COIL",
            ConfigError::InvalidSetting(_) => "INVALID_SETTING",
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.machine.validate()?;
        Ok(config)
    }
}

impl MachineConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: MachineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn coil(&self, id: &str) -> Option<&CoilConfig> {
        self.coils.iter().find(|c| c.id == id)
    }

    /// Check cross references. Everything here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting(
                "transfer.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.transfer.eject_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting(
                "transfer.eject_timeout_ms must be positive".to_string(),
            ));
        }

        let mut coil_ids = FxHashSet::default();
        for coil in &self.coils {
            if !coil_ids.insert(coil.id.as_str()) {
                return Err(ConfigError::DuplicateCoil(coil.id.clone()));
            }
            if coil.pulse_ms == 0 {
                return Err(ConfigError::InvalidSetting(format!(
                    "coil {} has a zero pulse_ms",
                    coil.id
                )));
            }
        }

        let mut device_ids = FxHashSet::default();
        for device in &self.devices {
            if !device_ids.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.id.clone()));
            }
        }

        let mut switch_owner: FxHashMap<&str, &str> = FxHashMap::default();
        let mut rules_by_coil: FxHashMap<&str, &HardwareRuleConfig> = FxHashMap::default();

        for device in &self.devices {
            for target in &device.eject_targets {
                if target == &device.id {
                    return Err(ConfigError::SelfTarget(device.id.clone()));
                }
                if !device_ids.contains(target.as_str()) {
                    return Err(ConfigError::UnknownTarget {
                        device: device.id.clone(),
                        target: target.clone(),
                    });
                }
            }

            if let Some(coil) = &device.coil {
                let Some(coil_config) = self.coil(coil) else {
                    return Err(ConfigError::UnknownCoil {
                        device: device.id.clone(),
                        coil: coil.clone(),
                    });
                };
                if device.eject_mode == EjectMode::Hold && coil_config.hold_power.is_none() {
                    return Err(ConfigError::InvalidSetting(format!(
                        "device {} ejects in hold mode but coil {} has no hold_power",
                        device.id, coil
                    )));
                }
            }

            for mechanism in &device.mechanisms {
                if let Some(first) = switch_owner.insert(&mechanism.switch, &device.id)
                    && first != device.id
                {
                    return Err(ConfigError::SwitchReused {
                        switch: mechanism.switch.clone(),
                        first: first.to_string(),
                        second: device.id.clone(),
                    });
                }
            }

            if let Some(capacity) = device.capacity
                && device.initial_balls > capacity
            {
                return Err(ConfigError::InitialBallsExceedCapacity {
                    device: device.id.clone(),
                    balls: device.initial_balls,
                    capacity,
                });
            }

            if let Some(source) = &device.captures_from
                && !device_ids.contains(source.as_str())
            {
                return Err(ConfigError::UnknownCaptureSource {
                    device: device.id.clone(),
                    source_device: source.clone(),
                });
            }

            if let Some(rule) = &device.hardware_rule {
                let Some(coil) = &device.coil else {
                    return Err(ConfigError::HardwareRuleWithoutCoil(device.id.clone()));
                };
                match rules_by_coil.get(coil.as_str()) {
                    Some(existing) if *existing != rule => {
                        return Err(ConfigError::ConflictingRule(coil.clone()));
                    }
                    _ => {
                        rules_by_coil.insert(coil, rule);
                    }
                }
            }
        }

        Ok(())
    }
}
