//! Filesystem adapter: owns the mounted volume and hands out files and
//! directory streams bound to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::arena::{HandleArena, HandleKind};
use crate::config::{MkfsParams, MountOptions};
use crate::directory::FatDir;
use crate::engine::{Attributes, FatEngine, SharedDevice};
use crate::error::{EngineContext, FsError, Result};
use crate::file::FatFile;
use crate::mode::compute_mode;
use crate::posix::{FileStat, PosixFileSystem, StatVfs, UtimBuf};
use crate::timestamp::{from_packed, split, to_packed};

static NEXT_FSID: AtomicU64 = AtomicU64::new(1);

/// POSIX adapter over one FAT volume.
///
/// `mount`, `unmount` and `mkfs` take `&mut self`; everything else takes
/// `&self`. Allocation through `open`/`opendir` is not serialized here:
/// share one mounted volume between threads through
/// [`crate::LockableFileSystem`].
pub struct FatFileSystem<E: FatEngine> {
    engine: Arc<E>,
    device: SharedDevice,
    volume: E::Volume,
    mounted: bool,
    arena: Arc<HandleArena>,
    fsid: u64,
}

impl<E: FatEngine> FatFileSystem<E> {
    /// Creates an unmounted adapter for `device`.
    pub fn new(engine: E, device: SharedDevice) -> Self {
        Self::with_shared_engine(Arc::new(engine), device)
    }

    /// Creates an unmounted adapter around an engine shared with other volumes.
    pub fn with_shared_engine(engine: Arc<E>, device: SharedDevice) -> Self {
        Self {
            engine,
            device,
            volume: E::Volume::default(),
            mounted: false,
            arena: Arc::new(HandleArena::new()),
            fsid: NEXT_FSID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// The block device.
    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    /// Whether a volume is mounted.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Filesystem id reported by `statvfs`.
    pub fn fsid(&self) -> u64 {
        self.fsid
    }

    /// Number of open files allocated from this filesystem.
    pub fn open_files(&self) -> usize {
        self.arena.live(HandleKind::File)
    }

    /// Number of open directory streams allocated from this filesystem.
    pub fn open_dirs(&self) -> usize {
        self.arena.live(HandleKind::Directory)
    }

    fn invalidate_handles(&self, reason: &str) {
        let dropped = self.arena.invalidate_all();
        if dropped > 0 {
            warn!("{}: {} open handles invalidated", reason, dropped);
        }
    }
}

impl<E: FatEngine> PosixFileSystem for FatFileSystem<E> {
    type File = FatFile<E>;
    type Dir = FatDir<E>;

    fn mkfs(&mut self, params: MkfsParams<'_>) -> Result<()> {
        params.validate()?;
        if self.mounted {
            warn!("mkfs on a mounted volume, tearing it down");
            self.invalidate_handles("mkfs");
            self.mounted = false;
        }
        debug!(
            "mkfs options={:?} partition={} au_size={} work={}",
            params.options,
            params.partition,
            params.au_size,
            params.work.len()
        );
        self.engine.clear_volume(&mut self.volume);
        self.engine
            .mkfs(
                &self.device,
                params.partition,
                params.options,
                params.au_size,
                params.work,
            )
            .context("mkfs")
    }

    fn mount(&mut self, options: MountOptions) -> Result<()> {
        if self.mounted {
            return Err(FsError::AlreadyMounted);
        }
        self.engine.clear_volume(&mut self.volume);
        self.engine
            .mount(&self.device, options.volume_index(), &mut self.volume)
            .context("mount")?;
        self.mounted = true;
        info!("Mounted volume {} (fsid {})", options.volume_index(), self.fsid);
        Ok(())
    }

    fn unmount(&mut self) -> Result<()> {
        self.invalidate_handles("unmount");
        self.mounted = false;
        debug!("unmount fsid {}", self.fsid);
        self.engine.unmount(&mut self.volume).context("unmount")
    }

    fn open(&self, path: &str, oflag: i32) -> Result<FatFile<E>> {
        let mode = compute_mode(oflag);
        debug!("open {} oflag={:#o} mode={:?}", path, oflag, mode);
        let handle = self.engine.open(&self.volume, path, mode).context("open")?;
        let id = self.arena.insert(HandleKind::File);
        Ok(FatFile::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.arena),
            id,
            handle,
        ))
    }

    fn opendir(&self, path: &str) -> Result<FatDir<E>> {
        debug!("opendir {}", path);
        let handle = self.engine.opendir(&self.volume, path).context("opendir")?;
        let id = self.arena.insert(HandleKind::Directory);
        Ok(FatDir::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.arena),
            id,
            handle,
        ))
    }

    fn mkdir(&self, path: &str, _mode: u32) -> Result<()> {
        debug!("mkdir {}", path);
        self.engine.mkdir(&self.volume, path).context("mkdir")
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        debug!("rmdir {}", path);
        let info = self.engine.stat(&self.volume, path).context("rmdir")?;
        if !info.is_dir() {
            return Err(FsError::NotFound {
                op: "rmdir",
                path: path.to_string(),
            });
        }
        self.engine.unlink(&self.volume, path).context("rmdir")
    }

    fn unlink(&self, path: &str) -> Result<()> {
        debug!("unlink {}", path);
        let info = self.engine.stat(&self.volume, path).context("unlink")?;
        if info.is_dir() {
            return Err(FsError::NotFound {
                op: "unlink",
                path: path.to_string(),
            });
        }
        self.engine.unlink(&self.volume, path).context("unlink")
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        debug!("rename {} -> {}", from, to);
        self.engine.rename(&self.volume, from, to).context("rename")
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        let info = self.engine.stat(&self.volume, path).context("stat")?;
        let mut mode = if info.is_dir() {
            libc::S_IFDIR as u32
        } else {
            libc::S_IFREG as u32
        };
        mode |= libc::S_IRUSR as u32;
        if !info.attrib.contains(Attributes::READ_ONLY) {
            mode |= libc::S_IWUSR as u32;
        }
        Ok(FileStat {
            size: info.size,
            mode,
            mtime: from_packed(info.packed_mtime()),
            atime: None,
            ctime: None,
        })
    }

    fn statvfs(&self) -> Result<StatVfs> {
        let free = self.engine.getfree(&self.volume).context("statvfs")?;
        let bsize = self.device.logical_block_size() as u64;
        let bfree = free.free as u64 * free.sectors_per_cluster as u64;
        Ok(StatVfs {
            f_bsize: bsize,
            f_frsize: bsize,
            f_blocks: self.device.blocks(),
            f_bfree: bfree,
            f_bavail: bfree,
            f_files: 0,
            f_ffree: 0,
            f_favail: 0,
            f_fsid: self.fsid,
            f_flag: 0,
            f_namemax: E::MAX_NAME_LEN as u64,
        })
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let attr = if (mode & libc::S_IWUSR as u32) == 0 {
            Attributes::READ_ONLY
        } else {
            Attributes::empty()
        };
        debug!("chmod {} {:#o} -> {:?}", path, mode, attr);
        self.engine
            .chmod(&self.volume, path, attr, Attributes::READ_ONLY)
            .context("chmod")
    }

    fn utime(&self, path: &str, times: &UtimBuf) -> Result<()> {
        let (fdate, ftime) = split(to_packed(times.modtime));
        debug!("utime {} mtime={}", path, times.modtime);
        self.engine
            .utime(&self.volume, path, fdate, ftime)
            .context("utime")
    }

    fn truncate(&self, _path: &str, _length: i64) -> Result<()> {
        Err(FsError::NotSupported { op: "truncate" })
    }

    fn sync(&self) -> Result<()> {
        self.engine.sync_volume(&self.volume).context("sync")
    }
}

impl<E: FatEngine> Drop for FatFileSystem<E> {
    fn drop(&mut self) {
        self.invalidate_handles("drop");
        if self.mounted {
            self.mounted = false;
            if let Err(code) = self.engine.unmount(&mut self.volume) {
                warn!("Unmount on drop failed: {:?}", code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;
    use crate::posix::{PosixDirectory, PosixFile};
    use crate::ramfat::RamFatEngine;
    use libc::{O_CREAT, O_RDONLY, O_RDWR, O_WRONLY};

    fn mounted() -> FatFileSystem<RamFatEngine> {
        let device: SharedDevice = Arc::new(RamDisk::new(512, 1024));
        let mut fs = FatFileSystem::new(RamFatEngine::new(), device);
        let mut work = vec![0u8; 4096];
        fs.mkfs(MkfsParams::new(&mut work)).unwrap();
        fs.mount(MountOptions::default()).unwrap();
        fs
    }

    #[test]
    fn test_mount_unformatted_reports_no_filesystem() {
        let device: SharedDevice = Arc::new(RamDisk::new(512, 1024));
        let mut fs = FatFileSystem::new(RamFatEngine::new(), device);
        let err = fs.mount(MountOptions::default()).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENODATA);
        assert!(!fs.is_mounted());
    }

    #[test]
    fn test_bad_sector_size_is_io_error() {
        for ss in [0, 16] {
            let device: SharedDevice = Arc::new(RamDisk::new(ss, 1024));
            let mut fs = FatFileSystem::new(RamFatEngine::new(), device);
            let mut work = vec![0u8; 4096];
            let err = fs.mkfs(MkfsParams::new(&mut work).au_size(1024)).unwrap_err();
            assert_eq!(err.to_errno(), libc::EIO);
            let err = fs.mount(MountOptions::default()).unwrap_err();
            assert_eq!(err.to_errno(), libc::EIO);
            assert!(!fs.is_mounted());
        }
    }

    #[test]
    fn test_double_mount_is_busy() {
        let mut fs = mounted();
        assert_eq!(
            fs.mount(MountOptions::default()).unwrap_err().to_errno(),
            libc::EBUSY
        );
    }

    #[test]
    fn test_mkfs_rejects_bad_params_before_engine() {
        let device: SharedDevice = Arc::new(RamDisk::new(512, 1024));
        let mut fs = FatFileSystem::new(RamFatEngine::new(), device);
        let mut work = vec![0u8; 512];
        let err = fs.mkfs(MkfsParams::new(&mut work).partition(7)).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument { .. }));
    }

    #[test]
    fn test_open_missing_file() {
        let fs = mounted();
        let err = fs.open("/nope", O_RDONLY).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert_eq!(fs.open_files(), 0);
    }

    #[test]
    fn test_open_before_mount_is_invalid() {
        let device: SharedDevice = Arc::new(RamDisk::new(512, 1024));
        let fs = FatFileSystem::new(RamFatEngine::new(), device);
        assert_eq!(fs.open("/a", O_RDONLY).unwrap_err().to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_stat_mode_bits() {
        let fs = mounted();
        let mut f = fs.open("/f.txt", O_WRONLY | O_CREAT).unwrap();
        f.write(b"abc").unwrap();
        f.close().unwrap();
        fs.mkdir("/d", 0o755).unwrap();

        let st = fs.stat("/f.txt").unwrap();
        assert_eq!(st.size, 3);
        assert_eq!(
            st.mode,
            libc::S_IFREG as u32 | libc::S_IRUSR as u32 | libc::S_IWUSR as u32
        );
        assert!(st.atime.is_none() && st.ctime.is_none());
        assert!(fs.stat("/d").unwrap().is_dir());
    }

    #[test]
    fn test_chmod_toggles_read_only() {
        let fs = mounted();
        fs.open("/f", O_WRONLY | O_CREAT).unwrap().close().unwrap();
        fs.chmod("/f", 0o444).unwrap();
        assert!(!fs.stat("/f").unwrap().is_writable());
        assert_eq!(fs.open("/f", O_RDWR).unwrap_err().to_errno(), libc::EACCES);
        fs.chmod("/f", 0o644).unwrap();
        assert!(fs.stat("/f").unwrap().is_writable());
    }

    #[test]
    fn test_utime_round_trips_even_seconds() {
        let fs = mounted();
        fs.open("/t", O_WRONLY | O_CREAT).unwrap().close().unwrap();
        // 2021-06-15 12:34:57 UTC
        fs.utime("/t", &UtimBuf::at(1_623_760_497)).unwrap();
        assert_eq!(fs.stat("/t").unwrap().mtime, 1_623_760_496);
    }

    #[test]
    fn test_truncate_path_not_supported() {
        let fs = mounted();
        assert_eq!(fs.truncate("/x", 0).unwrap_err().to_errno(), libc::ENOSYS);
    }

    #[test]
    fn test_statvfs() {
        let fs = mounted();
        let before = fs.statvfs().unwrap();
        assert_eq!(before.f_bsize, 512);
        assert_eq!(before.f_blocks, 1024);
        assert_eq!(before.f_files, 0);
        assert_eq!(before.f_namemax, 255);
        assert_eq!(before.f_fsid, fs.fsid());
        assert!(before.f_bfree > 0 && before.f_bfree <= before.f_blocks);

        let mut f = fs.open("/big", O_WRONLY | O_CREAT).unwrap();
        f.write(&[7u8; 20_000]).unwrap();
        f.close().unwrap();
        assert!(fs.statvfs().unwrap().f_bfree < before.f_bfree);
    }

    #[test]
    fn test_distinct_fsids() {
        let a = mounted();
        let b = mounted();
        assert_ne!(a.fsid(), b.fsid());
    }

    #[test]
    fn test_unmount_invalidates_handles() {
        let mut fs = mounted();
        let mut f = fs.open("/x", O_WRONLY | O_CREAT).unwrap();
        let mut d = fs.opendir("/").unwrap();
        assert_eq!((fs.open_files(), fs.open_dirs()), (1, 1));
        fs.unmount().unwrap();
        assert!(!f.is_open());
        assert!(!d.is_open());
        assert_eq!(f.write(b"x").unwrap_err().to_errno(), libc::EBADF);
        assert_eq!(d.readdir().unwrap_err().to_errno(), libc::EBADF);
        assert_eq!((fs.open_files(), fs.open_dirs()), (0, 0));
    }

    #[test]
    fn test_remount_after_unmount_keeps_data() {
        let mut fs = mounted();
        fs.mkdir("/keep", 0).unwrap();
        fs.unmount().unwrap();
        fs.mount(MountOptions::default()).unwrap();
        assert!(fs.stat("/keep").unwrap().is_dir());
    }

    #[test]
    fn test_mkfs_while_mounted_wipes_and_unmounts() {
        let mut fs = mounted();
        let f = fs.open("/old", O_WRONLY | O_CREAT).unwrap();
        let mut work = vec![0u8; 4096];
        fs.mkfs(MkfsParams::new(&mut work)).unwrap();
        assert!(!fs.is_mounted());
        assert!(!f.is_open());
        fs.mount(MountOptions::default()).unwrap();
        assert_eq!(fs.stat("/old").unwrap_err().to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_rename_and_sync() {
        let fs = mounted();
        fs.open("/a", O_WRONLY | O_CREAT).unwrap().close().unwrap();
        fs.rename("/a", "/b").unwrap();
        assert!(fs.stat("/b").is_ok());
        assert_eq!(fs.stat("/a").unwrap_err().to_errno(), libc::ENOENT);
        fs.sync().unwrap();
    }

    #[test]
    fn test_open_read_only_file_for_read() {
        let fs = mounted();
        fs.open("/r", O_WRONLY | O_CREAT).unwrap().close().unwrap();
        let mut f = fs.open("/r", O_RDONLY).unwrap();
        assert_eq!(f.write(b"x").unwrap_err().to_errno(), libc::EACCES);
    }
}
