#![warn(missing_docs)]

//! fatposix: POSIX file-I/O adapter over a sector-based FAT engine
//!
//! This crate exposes a FAT volume through POSIX-shaped file, directory and
//! filesystem operations. It translates open flags to engine access modes,
//! engine result codes to errno values and Unix times to packed FAT
//! timestamps. A [`LockableFileSystem`] variant lets several threads open
//! files through one mounted volume.

pub mod arena;
pub mod cli;
pub mod config;
pub mod device;
pub mod directory;
pub mod diskio;
pub mod engine;
pub mod error;
pub mod file;
pub mod filesystem;
pub mod lockable;
pub mod mode;
pub mod posix;
pub mod ramfat;
pub mod timestamp;

pub use arena::{HandleArena, HandleId, HandleKind};
pub use config::{FatPosixConfig, MkfsParams, MountOptions, MAX_PARTITION};
pub use device::{BlockDevice, FileDisk, RamDisk};
pub use directory::{DirEntry, FatDir, DIRENT_NAME_CAP};
pub use engine::{
    AccessMode, Attributes, EngineResult, FatCode, FatEngine, FileInfo, FormatOptions,
    FreeClusters, SharedDevice,
};
pub use error::{compute_errno, ErrorKind, FsError, Result};
pub use file::FatFile;
pub use filesystem::FatFileSystem;
pub use lockable::{Lockable, LockableFileSystem};
pub use mode::compute_mode;
pub use posix::{FileStat, PosixDirectory, PosixFile, PosixFileSystem, StatVfs, UtimBuf};
pub use ramfat::{RamDir, RamFatEngine, RamFile, RamVolume};
pub use timestamp::{fat_time_now, from_packed, to_packed, UnixTime};
