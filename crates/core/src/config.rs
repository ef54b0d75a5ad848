//! Configuration management for keyburn.
//!
//! Every field carries a serde default, so an empty TOML file yields the
//! stock badge layout. Addresses may be written as TOML hex integers
//! (`flash_base = 0x0800_0000`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// Top-level provisioning configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub paths: PathConfig,
    #[serde(default)]
    pub memory: MemoryMap,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Filesystem layout of the key store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathConfig {
    /// Directory holding unused key files
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    /// Directory receiving key files once committed to a device
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Append-only provisioning database (CSV)
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

/// Device memory map. Must match the target silicon bit-exact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryMap {
    /// Start of main flash
    #[serde(default = "default_flash_base")]
    pub flash_base: u32,
    /// Offset of the key region from `flash_base`
    #[serde(default = "default_key_flash_offset")]
    pub key_flash_offset: u32,
    /// Minimum erasable unit in bytes
    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
    /// Address of the 12-byte silicon UID
    #[serde(default = "default_uid_address")]
    pub uid_address: u32,
    /// Two marker bytes at the start of a programmed key region, as hex
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
}

/// Debug probe connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// OpenOCD TCL-RPC host
    #[serde(default = "default_probe_host")]
    pub host: String,
    /// OpenOCD TCL-RPC port
    #[serde(default = "default_probe_port")]
    pub port: u16,
    /// Per-operation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ask the debug server to exit when the session ends
    #[serde(default)]
    pub shutdown_on_disconnect: bool,
}

/// How a key is drawn from the pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolSelection {
    /// Directory listing order
    #[default]
    Arbitrary,
    /// Ascending key name, for reproducible fixtures
    Sorted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    #[serde(default)]
    pub selection: PoolSelection,
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("keys")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("keys/used")
}

fn default_database() -> PathBuf {
    PathBuf::from("keys/used_keys.csv")
}

fn default_flash_base() -> u32 {
    0x0800_0000
}

fn default_key_flash_offset() -> u32 {
    0xFFD4
}

fn default_sector_size() -> u32 {
    0x400
}

fn default_uid_address() -> u32 {
    0x1FFF_F7E8
}

fn default_sentinel() -> String {
    "DCDC".to_string()
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

fn default_probe_port() -> u16 {
    6666
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            key_dir: default_key_dir(),
            archive_dir: default_archive_dir(),
            database: default_database(),
        }
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self {
            flash_base: default_flash_base(),
            key_flash_offset: default_key_flash_offset(),
            sector_size: default_sector_size(),
            uid_address: default_uid_address(),
            sentinel: default_sentinel(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: default_probe_host(),
            port: default_probe_port(),
            timeout_ms: default_timeout_ms(),
            shutdown_on_disconnect: false,
        }
    }
}

impl MemoryMap {
    /// Absolute address of the key region.
    pub fn key_address(&self) -> Result<u32> {
        self.flash_base
            .checked_add(self.key_flash_offset)
            .ok_or_else(|| CoreError::Config("key region address overflows u32".to_string()))
    }

    /// Decoded sentinel marker.
    pub fn sentinel_bytes(&self) -> Result<[u8; 2]> {
        let bytes = hex::decode(&self.sentinel)
            .map_err(|e| CoreError::Config(format!("sentinel is not hex: {}", e)))?;
        bytes.as_slice().try_into().map_err(|_| {
            CoreError::Config(format!(
                "sentinel must be exactly 2 bytes, got {}",
                bytes.len()
            ))
        })
    }
}

impl ProvisionConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject configurations that would mis-address or mis-erase the device.
    pub fn validate(&self) -> Result<()> {
        let memory = &self.memory;
        if memory.sector_size == 0 || !memory.sector_size.is_power_of_two() {
            return Err(CoreError::Config(format!(
                "sector_size must be a non-zero power of two, got {:#x}",
                memory.sector_size
            )));
        }
        memory.key_address()?;
        memory.sentinel_bytes()?;

        if self.paths.key_dir == self.paths.archive_dir {
            return Err(CoreError::Config(
                "key_dir and archive_dir must be different directories".to_string(),
            ));
        }
        if self.probe.timeout_ms == 0 {
            return Err(CoreError::Config("probe timeout_ms must be non-zero".to_string()));
        }
        Ok(())
    }
}
