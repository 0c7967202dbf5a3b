//! The narrow call surface this crate needs from a FAT storage engine.
//!
//! Cluster allocation, FAT maintenance, directory entry layout and long file
//! names all live behind [`FatEngine`]. The adapter only hands the engine
//! paths, modes and opaque per-object state, and gets a [`FatCode`] back.

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::device::BlockDevice;

/// Result of an engine call. The error arm never carries [`FatCode::Ok`].
pub type EngineResult<T> = std::result::Result<T, FatCode>;

/// Shared handle to the block device an engine formats and mounts.
pub type SharedDevice = Arc<dyn BlockDevice>;

/// Result codes reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatCode {
    /// Succeeded.
    Ok,
    /// A hard error occurred in the low level disk I/O layer.
    DiskErr,
    /// Assertion failed inside the engine.
    IntErr,
    /// The physical drive cannot work.
    NotReady,
    /// Could not find the file.
    NoFile,
    /// Could not find the path.
    NoPath,
    /// The path name format is invalid.
    InvalidName,
    /// Access denied due to prohibited access or directory full.
    Denied,
    /// Access denied due to prohibited access.
    Exist,
    /// The file/directory object is invalid.
    InvalidObject,
    /// The physical drive is write protected.
    WriteProtected,
    /// The logical drive number is invalid.
    InvalidDrive,
    /// The volume has no work area.
    NotEnabled,
    /// There is no valid FAT volume.
    NoFilesystem,
    /// The format was aborted due to a parameter error.
    MkfsAborted,
    /// Could not get a grant to access the volume within the defined period.
    Timeout,
    /// The operation is rejected according to the file sharing policy.
    Locked,
    /// A working buffer could not be allocated.
    NotEnoughCore,
    /// Number of open files exceeds the engine limit.
    TooManyOpenFiles,
    /// A given parameter is invalid.
    InvalidParameter,
    /// A raw code this crate does not know about.
    Unknown(u32),
}

impl FatCode {
    /// Decodes a raw engine result value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => FatCode::Ok,
            1 => FatCode::DiskErr,
            2 => FatCode::IntErr,
            3 => FatCode::NotReady,
            4 => FatCode::NoFile,
            5 => FatCode::NoPath,
            6 => FatCode::InvalidName,
            7 => FatCode::Denied,
            8 => FatCode::Exist,
            9 => FatCode::InvalidObject,
            10 => FatCode::WriteProtected,
            11 => FatCode::InvalidDrive,
            12 => FatCode::NotEnabled,
            13 => FatCode::NoFilesystem,
            14 => FatCode::MkfsAborted,
            15 => FatCode::Timeout,
            16 => FatCode::Locked,
            17 => FatCode::NotEnoughCore,
            18 => FatCode::TooManyOpenFiles,
            19 => FatCode::InvalidParameter,
            other => FatCode::Unknown(other),
        }
    }

    /// The raw engine value for this code.
    pub fn raw(&self) -> u32 {
        match *self {
            FatCode::Ok => 0,
            FatCode::DiskErr => 1,
            FatCode::IntErr => 2,
            FatCode::NotReady => 3,
            FatCode::NoFile => 4,
            FatCode::NoPath => 5,
            FatCode::InvalidName => 6,
            FatCode::Denied => 7,
            FatCode::Exist => 8,
            FatCode::InvalidObject => 9,
            FatCode::WriteProtected => 10,
            FatCode::InvalidDrive => 11,
            FatCode::NotEnabled => 12,
            FatCode::NoFilesystem => 13,
            FatCode::MkfsAborted => 14,
            FatCode::Timeout => 15,
            FatCode::Locked => 16,
            FatCode::NotEnoughCore => 17,
            FatCode::TooManyOpenFiles => 18,
            FatCode::InvalidParameter => 19,
            FatCode::Unknown(raw) => raw,
        }
    }

    /// Converts a status-style code into a `Result`.
    pub fn into_result(self) -> EngineResult<()> {
        match self {
            FatCode::Ok => Ok(()),
            code => Err(code),
        }
    }
}

bitflags! {
    /// Access and creation mode passed to [`FatEngine::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMode: u8 {
        /// Read access.
        const READ = 0x01;
        /// Write access.
        const WRITE = 0x02;
        /// Open the file; fail if it does not exist.
        const OPEN_EXISTING = 0x00;
        /// Create a new file; fail if it exists.
        const CREATE_NEW = 0x04;
        /// Create a new file; truncate an existing one.
        const CREATE_ALWAYS = 0x08;
        /// Open the file, creating it if needed.
        const OPEN_ALWAYS = 0x10;
        /// Same as `OPEN_ALWAYS`, with the pointer placed at the end of file.
        const OPEN_APPEND = 0x30;
    }
}

impl AccessMode {
    /// The creation disposition bits, with the access bits masked off.
    pub fn disposition(&self) -> AccessMode {
        AccessMode::from_bits_truncate(self.bits() & 0x3C)
    }
}

bitflags! {
    /// Directory entry attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Attributes: u8 {
        /// Read only.
        const READ_ONLY = 0x01;
        /// Hidden.
        const HIDDEN = 0x02;
        /// System.
        const SYSTEM = 0x04;
        /// Directory.
        const DIRECTORY = 0x10;
        /// Archive.
        const ARCHIVE = 0x20;
    }
}

bitflags! {
    /// Format options for [`FatEngine::mkfs`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FormatOptions: u8 {
        /// FAT12/16.
        const FAT = 0x01;
        /// FAT32.
        const FAT32 = 0x02;
        /// exFAT.
        const EXFAT = 0x04;
        /// Any of the above, chosen by volume size.
        const ANY = 0x07;
        /// Super-floppy layout, no partition table.
        const SFD = 0x08;
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions::ANY | FormatOptions::SFD
    }
}

/// File information as reported by stat and directory reads.
///
/// An empty `name` returned by [`FatEngine::readdir`] marks the end of the
/// directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Size in bytes.
    pub size: u64,
    /// Packed modification date (high half of the timestamp word).
    pub fdate: u16,
    /// Packed modification time (low half of the timestamp word).
    pub ftime: u16,
    /// Attribute bits.
    pub attrib: Attributes,
    /// Entry name.
    pub name: String,
}

impl FileInfo {
    /// Whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.attrib.contains(Attributes::DIRECTORY)
    }

    /// The packed modification timestamp.
    pub fn packed_mtime(&self) -> u32 {
        crate::timestamp::join(self.fdate, self.ftime)
    }
}

/// Free space report of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeClusters {
    /// Number of free clusters.
    pub free: u32,
    /// Sectors per cluster.
    pub sectors_per_cluster: u32,
}

/// Operations the adapter consumes from a FAT engine.
///
/// Volume, file and directory state are opaque values owned by the adapter
/// and passed back on every call. The engine must tolerate being called
/// from several threads as long as no single state value is shared.
pub trait FatEngine: Send + Sync {
    /// Per-volume state (mount table entry and working window).
    type Volume: Default + Send + Sync;
    /// Per-open-file state.
    type File: Send;
    /// Per-open-directory state.
    type Dir: Send;

    /// Maximum length of a file name, in bytes.
    const MAX_NAME_LEN: usize;

    /// Resets the volume type discriminator so the engine treats the state as
    /// not mounted.
    fn clear_volume(&self, volume: &mut Self::Volume);

    /// Creates a filesystem on `device`, using `work` as scratch memory.
    fn mkfs(
        &self,
        device: &SharedDevice,
        partition: u8,
        options: FormatOptions,
        au_bytes: u32,
        work: &mut [u8],
    ) -> EngineResult<()>;

    /// Registers `volume` for `device`.
    fn mount(
        &self,
        device: &SharedDevice,
        volume_index: u8,
        volume: &mut Self::Volume,
    ) -> EngineResult<()>;

    /// Unregisters `volume`, flushing any cached state.
    fn unmount(&self, volume: &mut Self::Volume) -> EngineResult<()>;

    /// Flushes all cached volume state to the device.
    fn sync_volume(&self, volume: &Self::Volume) -> EngineResult<()>;

    /// Counts free clusters.
    fn getfree(&self, volume: &Self::Volume) -> EngineResult<FreeClusters>;

    /// Opens or creates a file.
    fn open(&self, volume: &Self::Volume, path: &str, mode: AccessMode)
        -> EngineResult<Self::File>;

    /// Reads from the current position; returns the number of bytes read.
    fn read(&self, file: &mut Self::File, buf: &mut [u8]) -> EngineResult<usize>;

    /// Writes at the current position; returns the number of bytes written.
    fn write(&self, file: &mut Self::File, buf: &[u8]) -> EngineResult<usize>;

    /// Moves the file pointer to an absolute offset.
    fn lseek(&self, file: &mut Self::File, offset: u64) -> EngineResult<()>;

    /// Truncates the file at the current position.
    fn truncate(&self, file: &mut Self::File) -> EngineResult<()>;

    /// Flushes cached data of an open file.
    fn sync(&self, file: &mut Self::File) -> EngineResult<()>;

    /// Closes an open file. The state must not be used afterwards.
    fn close(&self, file: &mut Self::File) -> EngineResult<()>;

    /// Opens a directory stream.
    fn opendir(&self, volume: &Self::Volume, path: &str) -> EngineResult<Self::Dir>;

    /// Reads the next entry into `out`. With `out == None` the stream is
    /// rewound to its first entry.
    fn readdir(&self, dir: &mut Self::Dir, out: Option<&mut FileInfo>) -> EngineResult<()>;

    /// Closes a directory stream.
    fn closedir(&self, dir: &mut Self::Dir) -> EngineResult<()>;

    /// Looks up one entry.
    fn stat(&self, volume: &Self::Volume, path: &str) -> EngineResult<FileInfo>;

    /// Removes a file or an empty directory.
    fn unlink(&self, volume: &Self::Volume, path: &str) -> EngineResult<()>;

    /// Renames or moves an entry.
    fn rename(&self, volume: &Self::Volume, from: &str, to: &str) -> EngineResult<()>;

    /// Creates a directory.
    fn mkdir(&self, volume: &Self::Volume, path: &str) -> EngineResult<()>;

    /// Sets the attribute bits selected by `mask` to the values in `attr`.
    fn chmod(
        &self,
        volume: &Self::Volume,
        path: &str,
        attr: Attributes,
        mask: Attributes,
    ) -> EngineResult<()>;

    /// Sets the modification timestamp.
    fn utime(&self, volume: &Self::Volume, path: &str, fdate: u16, ftime: u16)
        -> EngineResult<()>;
}
