//! Smartcard configuration loaded from TOML.
//!
//! ```toml
//! [smartcard]
//! device = "/dev/ttyS1"
//!
//! [smartcard.pcsc]
//! device = "cherry"
//!
//! [smartcard.i2c]
//! device = "1:50"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::constants::NXP_FALLBACK_DEVICE;

/// Default I2C card location.
pub const I2C_FALLBACK_DEVICE: &str = "/dev/i2c-1:50";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid I2C device '{0}', expected <bus>:<slave-hex>")]
    I2cDevice(String),
}

/// Top-level configuration file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Absent when the file has no `[smartcard]` section.
    pub smartcard: Option<SmartcardConfig>,
}

/// `[smartcard]` section.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartcardConfig {
    /// Serial device of the NXP reader.
    pub device: Option<String>,
    pub pcsc: PcscConfig,
    pub i2c: I2cConfig,
}

/// `[smartcard.pcsc]` section.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcscConfig {
    /// Case-insensitive substring of the reader name.
    pub device: Option<String>,
}

/// `[smartcard.i2c]` section.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct I2cConfig {
    /// `<bus>:<slave-hex>` or `<path>:<slave-hex>`.
    pub device: Option<String>,
}

/// Parsed I2C card location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cAddress {
    pub path: String,
    pub slave: u16,
}

impl I2cAddress {
    pub fn parse(device: &str) -> Result<Self, ConfigError> {
        let bad = || ConfigError::I2cDevice(device.to_string());
        let (bus, slave) = device.rsplit_once(':').ok_or_else(bad)?;
        let slave = u16::from_str_radix(slave.trim(), 16).map_err(|_| bad())?;
        let bus = bus.trim();
        let path = if !bus.is_empty() && bus.chars().all(|c| c.is_ascii_digit()) {
            format!("/dev/i2c-{bus}")
        } else if bus.starts_with('/') {
            bus.to_string()
        } else {
            return Err(bad());
        };
        Ok(Self { path, slave })
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The `[smartcard]` section, or defaults when it is missing.
    pub fn smartcard_or_default(&self) -> SmartcardConfig {
        self.smartcard.clone().unwrap_or_default()
    }
}

impl SmartcardConfig {
    /// NXP serial device, falling back to the compiled-in path.
    pub fn nxp_device(&self) -> &str {
        self.device.as_deref().unwrap_or(NXP_FALLBACK_DEVICE)
    }

    pub fn i2c_address(&self) -> Result<I2cAddress, ConfigError> {
        I2cAddress::parse(self.i2c.device.as_deref().unwrap_or(I2C_FALLBACK_DEVICE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            [smartcard]
            device = "/dev/ttyS1"

            [smartcard.pcsc]
            device = "Cherry"

            [smartcard.i2c]
            device = "2:51"
            "#,
        )
        .unwrap();
        let sc = config.smartcard_or_default();
        assert_eq!(sc.nxp_device(), "/dev/ttyS1");
        assert_eq!(sc.pcsc.device.as_deref(), Some("Cherry"));
        assert_eq!(
            sc.i2c_address().unwrap(),
            I2cAddress {
                path: "/dev/i2c-2".into(),
                slave: 0x51
            }
        );
    }

    #[test]
    fn test_missing_section_uses_fallbacks() {
        let config = Config::from_toml("").unwrap();
        assert!(config.smartcard.is_none());
        let sc = config.smartcard_or_default();
        assert_eq!(sc.nxp_device(), NXP_FALLBACK_DEVICE);
        assert_eq!(sc.i2c_address().unwrap().path, "/dev/i2c-1");
        assert_eq!(sc.i2c_address().unwrap().slave, 0x50);
    }

    #[test]
    fn test_i2c_address_forms() {
        assert_eq!(I2cAddress::parse("/dev/i2c-7:A0").unwrap().path, "/dev/i2c-7");
        assert_eq!(I2cAddress::parse("/dev/i2c-7:A0").unwrap().slave, 0xA0);
        assert!(I2cAddress::parse("1").is_err());
        assert!(I2cAddress::parse("1:zz").is_err());
        assert!(I2cAddress::parse("bus:50").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("scard-config-{}.toml", std::process::id()));
        let config = Config {
            smartcard: Some(SmartcardConfig {
                device: Some("/dev/ttyUSB3".into()),
                ..Default::default()
            }),
        };
        config.save_to_file(&path).unwrap();
        let loaded = Config::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unreadable_file() {
        assert!(matches!(
            Config::load_from_file("/nonexistent/scard.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
