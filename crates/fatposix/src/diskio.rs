//! Disk access glue between an engine and a [`BlockDevice`].
//!
//! Engines speak in status flags and sector-level result codes; these
//! functions translate block device calls into that vocabulary.

use bitflags::bitflags;
use tracing::{trace, warn};

use crate::device::BlockDevice;
use crate::engine::FatCode;

bitflags! {
    /// Drive status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        /// Drive not initialized.
        const NOINIT = 0x01;
        /// No medium in the drive.
        const NODISK = 0x02;
        /// Medium is write protected.
        const PROTECT = 0x04;
    }
}

/// Result of a sector-level call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskResult {
    /// Succeeded.
    Ok,
    /// Read/write error.
    Error,
    /// Write protected.
    WriteProtected,
    /// Not ready.
    NotReady,
    /// Invalid parameter.
    ParameterError,
}

impl DiskResult {
    /// Engine code a failed sector call surfaces as.
    pub fn into_engine(self) -> Result<(), FatCode> {
        match self {
            DiskResult::Ok => Ok(()),
            DiskResult::Error => Err(FatCode::DiskErr),
            DiskResult::WriteProtected => Err(FatCode::WriteProtected),
            DiskResult::NotReady => Err(FatCode::NotReady),
            DiskResult::ParameterError => Err(FatCode::InvalidParameter),
        }
    }
}

/// Control commands understood by [`disk_ioctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    /// Complete pending writes.
    Sync,
    /// Number of sectors on the drive.
    GetSectorCount,
    /// Sector size in bytes.
    GetSectorSize,
    /// Erase block size in bytes.
    GetBlockSize,
}

/// Current drive status.
pub fn disk_status(device: &dyn BlockDevice) -> DiskStatus {
    let mut status = DiskStatus::empty();
    if !device.is_open() {
        status |= DiskStatus::NOINIT;
    }
    if device.is_write_protected() {
        status |= DiskStatus::PROTECT;
    }
    status
}

/// Opens the drive; reports `NOINIT` if that fails.
pub fn disk_initialize(device: &dyn BlockDevice) -> DiskStatus {
    match device.open() {
        Ok(()) => disk_status(device),
        Err(e) => {
            warn!("disk_initialize failed: {}", e);
            DiskStatus::NOINIT
        }
    }
}

/// Closes the drive.
pub fn disk_deinitialize(device: &dyn BlockDevice) -> DiskStatus {
    match device.close() {
        Ok(()) => DiskStatus::NOINIT,
        Err(e) => {
            warn!("disk_deinitialize failed: {}", e);
            disk_status(device) | DiskStatus::NOINIT
        }
    }
}

/// Reads `count` sectors starting at `sector`.
pub fn disk_read(device: &dyn BlockDevice, buf: &mut [u8], sector: u64, count: usize) -> DiskResult {
    if !device.is_open() {
        return DiskResult::NotReady;
    }
    trace!("disk_read sector={} count={}", sector, count);
    match device.read_blocks(buf, sector, count) {
        Ok(n) if n > 0 => DiskResult::Ok,
        Ok(_) => DiskResult::Error,
        Err(e) => {
            warn!("disk_read sector={} count={} failed: {}", sector, count, e);
            DiskResult::Error
        }
    }
}

/// Writes `count` sectors starting at `sector`.
pub fn disk_write(device: &dyn BlockDevice, buf: &[u8], sector: u64, count: usize) -> DiskResult {
    if !device.is_open() {
        return DiskResult::NotReady;
    }
    if device.is_write_protected() {
        return DiskResult::WriteProtected;
    }
    trace!("disk_write sector={} count={}", sector, count);
    match device.write_blocks(buf, sector, count) {
        Ok(n) if n > 0 => DiskResult::Ok,
        Ok(_) => DiskResult::Error,
        Err(e) => {
            warn!("disk_write sector={} count={} failed: {}", sector, count, e);
            DiskResult::Error
        }
    }
}

/// Geometry queries and sync.
///
/// Returns the queried value; `Sync` returns 0.
pub fn disk_ioctl(device: &dyn BlockDevice, cmd: IoctlCmd) -> Result<u64, DiskResult> {
    match cmd {
        IoctlCmd::GetSectorCount => Ok(device.blocks()),
        IoctlCmd::GetSectorSize => Ok(device.logical_block_size() as u64),
        IoctlCmd::GetBlockSize => Ok(device.physical_block_size() as u64),
        IoctlCmd::Sync => match device.sync() {
            Ok(()) => Ok(0),
            Err(e) => {
                warn!("disk sync failed: {}", e);
                Err(DiskResult::Error)
            }
        },
    }
}
