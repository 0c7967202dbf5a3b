//! Thread-shareable filesystem: serializes handle allocation through a
//! caller-supplied lock.

use tracing::trace;

use crate::config::{MkfsParams, MountOptions};
use crate::directory::FatDir;
use crate::engine::{FatEngine, SharedDevice};
use crate::error::Result;
use crate::file::FatFile;
use crate::filesystem::FatFileSystem;
use crate::posix::{FileStat, PosixFileSystem, StatVfs, UtimBuf};

/// A mutual-exclusion primitive the decorator can hold across an allocation.
pub trait Lockable: Sync {
    /// Guard that releases the lock when dropped.
    type Guard<'a>
    where
        Self: 'a;

    /// Blocks until the lock is held.
    fn lock(&self) -> Self::Guard<'_>;
}

impl Lockable for parking_lot::Mutex<()> {
    type Guard<'a> = parking_lot::MutexGuard<'a, ()>;

    fn lock(&self) -> Self::Guard<'_> {
        parking_lot::Mutex::lock(self)
    }
}

impl Lockable for std::sync::Mutex<()> {
    type Guard<'a> = std::sync::MutexGuard<'a, ()>;

    fn lock(&self) -> Self::Guard<'_> {
        // The guarded value is `()`, a panicking holder cannot leave it torn.
        std::sync::Mutex::lock(self).unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// [`FatFileSystem`] whose `open` and `opendir` run under `locker`.
///
/// Everything else is delegated unchanged. Operations on already opened
/// files and directory streams are not serialized; each handle must be used
/// from one thread at a time.
pub struct LockableFileSystem<'l, E: FatEngine, L: Lockable> {
    inner: FatFileSystem<E>,
    locker: &'l L,
}

impl<'l, E: FatEngine, L: Lockable> LockableFileSystem<'l, E, L> {
    /// Creates an unmounted filesystem for `device` guarded by `locker`.
    pub fn new(engine: E, device: SharedDevice, locker: &'l L) -> Self {
        Self::wrap(FatFileSystem::new(engine, device), locker)
    }

    /// Guards an existing filesystem.
    pub fn wrap(inner: FatFileSystem<E>, locker: &'l L) -> Self {
        Self { inner, locker }
    }

    /// The unlocked filesystem.
    pub fn inner(&self) -> &FatFileSystem<E> {
        &self.inner
    }

    /// The lock serializing allocations.
    pub fn locker(&self) -> &'l L {
        self.locker
    }

    /// Releases the lock reference and returns the unlocked filesystem.
    pub fn into_inner(self) -> FatFileSystem<E> {
        self.inner
    }
}

impl<'l, E: FatEngine, L: Lockable> PosixFileSystem for LockableFileSystem<'l, E, L> {
    type File = FatFile<E>;
    type Dir = FatDir<E>;

    fn mkfs(&mut self, params: MkfsParams<'_>) -> Result<()> {
        self.inner.mkfs(params)
    }

    fn mount(&mut self, options: MountOptions) -> Result<()> {
        self.inner.mount(options)
    }

    fn unmount(&mut self) -> Result<()> {
        self.inner.unmount()
    }

    fn open(&self, path: &str, oflag: i32) -> Result<FatFile<E>> {
        let _guard = self.locker.lock();
        trace!("open {} under lock", path);
        self.inner.open(path, oflag)
    }

    fn opendir(&self, path: &str) -> Result<FatDir<E>> {
        let _guard = self.locker.lock();
        trace!("opendir {} under lock", path);
        self.inner.opendir(path)
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.inner.mkdir(path, mode)
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.inner.rmdir(path)
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.inner.unlink(path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        self.inner.stat(path)
    }

    fn statvfs(&self) -> Result<StatVfs> {
        self.inner.statvfs()
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.inner.chmod(path, mode)
    }

    fn utime(&self, path: &str, times: &UtimBuf) -> Result<()> {
        self.inner.utime(path, times)
    }

    fn truncate(&self, path: &str, length: i64) -> Result<()> {
        self.inner.truncate(path, length)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
