//! Format/mount parameters and tool configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::FormatOptions;
use crate::error::{FsError, Result};

/// Highest partition index accepted by `mkfs` (0 means the whole drive).
pub const MAX_PARTITION: u8 = 4;

/// Parameters for formatting a device.
#[derive(Debug)]
pub struct MkfsParams<'a> {
    /// Filesystem type and layout.
    pub options: FormatOptions,
    /// Partition to format; 0 formats the whole drive.
    pub partition: u8,
    /// Allocation unit (cluster) size in bytes; 0 picks a default.
    pub au_size: u32,
    /// Scratch memory for the engine.
    pub work: &'a mut [u8],
}

impl<'a> MkfsParams<'a> {
    /// Default parameters using `work` as scratch memory.
    pub fn new(work: &'a mut [u8]) -> Self {
        Self {
            options: FormatOptions::default(),
            partition: 0,
            au_size: 0,
            work,
        }
    }

    /// Sets the format options.
    pub fn options(mut self, options: FormatOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the partition index.
    pub fn partition(mut self, partition: u8) -> Self {
        self.partition = partition;
        self
    }

    /// Sets the allocation unit size.
    pub fn au_size(mut self, au_size: u32) -> Self {
        self.au_size = au_size;
        self
    }

    /// Checks the fields that can be rejected without the engine.
    pub fn validate(&self) -> Result<()> {
        if self.partition > MAX_PARTITION {
            return Err(FsError::InvalidArgument {
                msg: format!("partition {} out of range 0..={}", self.partition, MAX_PARTITION),
            });
        }
        if self.au_size != 0 && !self.au_size.is_power_of_two() {
            return Err(FsError::InvalidArgument {
                msg: format!("allocation unit {} is not a power of two", self.au_size),
            });
        }
        if self.work.is_empty() {
            return Err(FsError::InvalidArgument {
                msg: "empty mkfs scratch buffer".to_string(),
            });
        }
        Ok(())
    }
}

/// Parameters for mounting a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Logical volume index; `None` lets the engine pick volume 0.
    pub volume: Option<u8>,
}

impl MountOptions {
    /// Mounts a specific logical volume.
    pub fn volume(volume: u8) -> Self {
        Self {
            volume: Some(volume),
        }
    }

    /// The volume index handed to the engine.
    pub fn volume_index(&self) -> u8 {
        self.volume.unwrap_or(0)
    }
}

/// Settings for the command line tool and for building a volume from an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FatPosixConfig {
    /// Image file backing the block device.
    pub image: PathBuf,
    /// Logical sector size in bytes.
    pub sector_size: u32,
    /// Sector count used when a new image is created.
    pub sectors: u64,
    /// Allocation unit size in bytes; 0 picks a default.
    pub au_size: u32,
    /// Format options for `mkfs`.
    pub format: FormatOptions,
    /// Maximum number of simultaneously open files and directories.
    pub max_open_files: usize,
    /// Mount options.
    pub mount: MountOptions,
}

impl Default for FatPosixConfig {
    fn default() -> Self {
        Self {
            image: PathBuf::from("fat.img"),
            sector_size: 512,
            sectors: 8192,
            au_size: 0,
            format: FormatOptions::default(),
            max_open_files: 16,
            mount: MountOptions::default(),
        }
    }
}

impl FatPosixConfig {
    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: FatPosixConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: FatPosixConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Rejects geometry the block device and engine cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(512..=4096).contains(&self.sector_size) || !self.sector_size.is_power_of_two() {
            anyhow::bail!(
                "sector_size {} must be a power of two in 512..=4096",
                self.sector_size
            );
        }
        if self.au_size != 0 && !self.au_size.is_power_of_two() {
            anyhow::bail!("au_size {} is not a power of two", self.au_size);
        }
        if self.sectors == 0 {
            anyhow::bail!("sectors must be non-zero");
        }
        if self.max_open_files == 0 {
            anyhow::bail!("max_open_files must be non-zero");
        }
        Ok(())
    }
}
