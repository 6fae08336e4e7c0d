//! Per-instance configuration.
//!
//! Deserialized from the server's instance section; only the keys that
//! affect this store are modeled. `validate` rejects combinations the
//! engine cannot honor before any storage is touched.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How persistent memory is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScmClass {
    /// Emulate PM on tmpfs with a fixed-size arena.
    Ram,
    /// Real DCPM behind a DAX mount.
    Dcpm,
}

/// Backing class for bulk payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BdevClass {
    Nvme,
    Malloc,
    Kdev,
    File,
}

/// Instance configuration for one storage target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub scm_class: ScmClass,
    /// Arena size in GiB; only meaningful with `scm_class = ram`.
    pub scm_size: Option<u64>,
    pub scm_mount: PathBuf,
    pub bdev_class: BdevClass,
    pub bdev_list: Vec<PathBuf>,
    /// Number of storage targets (xstreams) on this instance.
    pub targets: u32,
    pub nr_xs_helpers: u32,
    pub first_core: u32,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            scm_class: ScmClass::Ram,
            scm_size: Some(1),
            scm_mount: PathBuf::from("/mnt/verso"),
            bdev_class: BdevClass::Malloc,
            bdev_list: Vec::new(),
            targets: 1,
            nr_xs_helpers: 0,
            first_core: 0,
        }
    }
}

/// Configuration validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `scm_size` is required with `scm_class = ram` and forbidden otherwise.
    ScmSize,
    /// `bdev_list` must name at least one device for file-backed classes.
    EmptyBdevList,
    /// `targets` must be non-zero.
    ZeroTargets,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScmSize => f.write_str("scm_size is required for ram and forbidden for dcpm"),
            Self::EmptyBdevList => f.write_str("bdev_list must not be empty for this bdev_class"),
            Self::ZeroTargets => f.write_str("targets must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl InstanceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.scm_class, self.scm_size) {
            (ScmClass::Ram, None) | (ScmClass::Dcpm, Some(_)) => return Err(ConfigError::ScmSize),
            _ => {}
        }
        match self.bdev_class {
            BdevClass::Malloc => {}
            BdevClass::Nvme | BdevClass::Kdev | BdevClass::File => {
                if self.bdev_list.is_empty() {
                    return Err(ConfigError::EmptyBdevList);
                }
            }
        }
        if self.targets == 0 {
            return Err(ConfigError::ZeroTargets);
        }
        Ok(())
    }

    /// Arena quota in bytes implied by `scm_size`.
    pub fn scm_bytes(&self) -> u64 {
        self.scm_size.unwrap_or(1) << 30
    }
}
