//! POSIX-shaped capability traits and the records they fill in.
//!
//! [`PosixFileSystem`] is implemented by both the unlocked
//! [`crate::FatFileSystem`] and the [`crate::LockableFileSystem`] decorator,
//! so callers can be written once against either.

use crate::config::{MkfsParams, MountOptions};
use crate::directory::DirEntry;
use crate::error::Result;
use crate::timestamp::UnixTime;

/// Result of a path-based `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes; 0 for directories.
    pub size: u64,
    /// File type and owner permission bits.
    pub mode: u32,
    /// Modification time.
    pub mtime: UnixTime,
    /// Access time. Not tracked by FAT.
    pub atime: Option<UnixTime>,
    /// Creation time. Not tracked by FAT.
    pub ctime: Option<UnixTime>,
}

impl FileStat {
    /// Whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }

    /// Whether the owner-write bit is set.
    pub fn is_writable(&self) -> bool {
        (self.mode & libc::S_IWUSR as u32) != 0
    }
}

/// Result of `statvfs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatVfs {
    /// Filesystem block size.
    pub f_bsize: u64,
    /// Fragment size.
    pub f_frsize: u64,
    /// Size of the filesystem in `f_frsize` units.
    pub f_blocks: u64,
    /// Free blocks.
    pub f_bfree: u64,
    /// Free blocks available to unprivileged users.
    pub f_bavail: u64,
    /// Inodes.
    pub f_files: u64,
    /// Free inodes.
    pub f_ffree: u64,
    /// Free inodes available to unprivileged users.
    pub f_favail: u64,
    /// Filesystem id.
    pub f_fsid: u64,
    /// Mount flags.
    pub f_flag: u64,
    /// Maximum file name length.
    pub f_namemax: u64,
}

/// Times for `utime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtimBuf {
    /// Access time; ignored, FAT has none to set.
    pub actime: UnixTime,
    /// Modification time.
    pub modtime: UnixTime,
}

impl UtimBuf {
    /// Both times set to `time`.
    pub fn at(time: UnixTime) -> Self {
        Self {
            actime: time,
            modtime: time,
        }
    }
}

/// Operations on one open file.
pub trait PosixFile {
    /// Whether the handle is bound to a live volume.
    fn is_open(&self) -> bool;

    /// Reads at the current position. A short count is not an error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes at the current position. A short count means the volume is full.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Repositions the file pointer. Only `SEEK_SET` with a non-negative
    /// offset is supported.
    fn lseek(&mut self, offset: i64, whence: i32) -> Result<i64>;

    /// Truncates or extends the file to `length`.
    fn ftruncate(&mut self, length: i64) -> Result<()>;

    /// Flushes cached data.
    fn fsync(&mut self) -> Result<()>;

    /// Not supported; use [`PosixFileSystem::stat`].
    fn fstat(&self) -> Result<FileStat>;

    /// Closes the file. The handle is released even when this fails.
    fn close(&mut self) -> Result<()>;
}

/// Operations on one open directory stream.
pub trait PosixDirectory {
    /// Next entry, or `Ok(None)` at the end of the directory. The entry is
    /// valid until the next call on this stream.
    fn readdir(&mut self) -> Result<Option<&DirEntry>>;

    /// Restarts iteration from the first entry.
    fn rewinddir(&mut self) -> Result<()>;

    /// Closes the stream. The handle is released even when this fails.
    fn closedir(&mut self) -> Result<()>;
}

/// Filesystem-level operations.
pub trait PosixFileSystem {
    /// Open file type.
    type File: PosixFile;
    /// Open directory type.
    type Dir: PosixDirectory;

    /// Formats the device. Any mounted volume is torn down first.
    fn mkfs(&mut self, params: MkfsParams<'_>) -> Result<()>;

    /// Mounts the volume.
    fn mount(&mut self, options: MountOptions) -> Result<()>;

    /// Unmounts the volume and invalidates every outstanding handle.
    fn unmount(&mut self) -> Result<()>;

    /// Opens a file with POSIX `open()` flags.
    fn open(&self, path: &str, oflag: i32) -> Result<Self::File>;

    /// Opens a directory stream.
    fn opendir(&self, path: &str) -> Result<Self::Dir>;

    /// Creates a directory. `mode` is ignored.
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;

    /// Removes an empty directory; a path naming a file is not found.
    fn rmdir(&self, path: &str) -> Result<()>;

    /// Removes a file; a path naming a directory is not found.
    fn unlink(&self, path: &str) -> Result<()>;

    /// Renames or moves an entry.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Looks up one entry.
    fn stat(&self, path: &str) -> Result<FileStat>;

    /// Reports volume geometry and free space.
    fn statvfs(&self) -> Result<StatVfs>;

    /// Sets or clears the read-only attribute from the owner-write bit.
    fn chmod(&self, path: &str, mode: u32) -> Result<()>;

    /// Sets the modification time.
    fn utime(&self, path: &str, times: &UtimBuf) -> Result<()>;

    /// Not supported; open the file and use [`PosixFile::ftruncate`].
    fn truncate(&self, path: &str, length: i64) -> Result<()>;

    /// Flushes the whole volume.
    fn sync(&self) -> Result<()>;
}
