//! Directory adapter: one open engine directory stream.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::arena::{bound_mut, HandleArena, HandleId};
use crate::engine::{FatEngine, FileInfo};
use crate::error::{EngineContext, FsError, Result};
use crate::posix::PosixDirectory;

/// Capacity of the entry name buffer, terminator included.
pub const DIRENT_NAME_CAP: usize = 256;

/// One directory entry, overwritten by each read on its stream.
#[derive(Clone)]
pub struct DirEntry {
    d_name: [u8; DIRENT_NAME_CAP],
}

impl Default for DirEntry {
    fn default() -> Self {
        Self {
            d_name: [0; DIRENT_NAME_CAP],
        }
    }
}

impl DirEntry {
    /// Entry name, up to the terminator.
    pub fn name(&self) -> &str {
        let len = self
            .d_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(DIRENT_NAME_CAP);
        // set_name only stores whole characters.
        std::str::from_utf8(&self.d_name[..len]).unwrap_or_default()
    }

    /// Raw nul-terminated name buffer.
    pub fn as_bytes(&self) -> &[u8; DIRENT_NAME_CAP] {
        &self.d_name
    }

    /// Copies `name` in, truncated at a character boundary so the buffer
    /// always keeps a terminator.
    fn set_name(&mut self, name: &str) {
        let mut len = name.len().min(DIRENT_NAME_CAP - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.d_name.fill(0);
        self.d_name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }
}

impl fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntry").field("name", &self.name()).finish()
    }
}

/// An open directory stream on a [`crate::FatFileSystem`].
pub struct FatDir<E: FatEngine> {
    engine: Arc<E>,
    arena: Arc<HandleArena>,
    id: HandleId,
    handle: Option<E::Dir>,
    entry: DirEntry,
}

impl<E: FatEngine> FatDir<E> {
    pub(crate) fn new(engine: Arc<E>, arena: Arc<HandleArena>, id: HandleId, handle: E::Dir) -> Self {
        Self {
            engine,
            arena,
            id,
            handle: Some(handle),
            entry: DirEntry::default(),
        }
    }

    /// Arena id of this stream.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Whether the stream is bound to a live volume.
    pub fn is_open(&self) -> bool {
        self.handle.is_some() && self.arena.is_live(self.id)
    }
}

impl<E: FatEngine> PosixDirectory for FatDir<E> {
    fn readdir(&mut self) -> Result<Option<&DirEntry>> {
        let handle = bound_mut(&self.arena, self.id, &mut self.handle)?;
        let mut info = FileInfo::default();
        self.engine
            .readdir(handle, Some(&mut info))
            .context("readdir")?;
        if info.name.is_empty() {
            trace!("readdir {}: end", self.id);
            return Ok(None);
        }
        trace!("readdir {}: {}", self.id, info.name);
        self.entry.set_name(&info.name);
        Ok(Some(&self.entry))
    }

    fn rewinddir(&mut self) -> Result<()> {
        let handle = bound_mut(&self.arena, self.id, &mut self.handle)?;
        self.engine.readdir(handle, None).context("rewinddir")
    }

    fn closedir(&mut self) -> Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Err(FsError::StaleHandle { handle: self.id });
        };
        if !self.arena.release(self.id) {
            return Err(FsError::StaleHandle { handle: self.id });
        }
        debug!("closedir {}", self.id);
        self.engine.closedir(&mut handle).context("closedir")
    }
}

impl<E: FatEngine> Drop for FatDir<E> {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.closedir() {
                warn!("Dropping directory {} failed to close: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::HandleKind;
    use crate::engine::{
        AccessMode, Attributes, EngineResult, FatCode, FormatOptions, FreeClusters, SharedDevice,
    };
    use parking_lot::Mutex;

    /// Engine serving a fixed listing, recording directory calls and
    /// failing them on demand.
    #[derive(Default)]
    struct MockEngine {
        entries: Vec<&'static str>,
        calls: Mutex<Vec<&'static str>>,
        fail_read: Option<FatCode>,
        fail_rewind: bool,
        fail_close: bool,
    }

    impl MockEngine {
        fn listing(entries: &[&'static str]) -> Self {
            Self {
                entries: entries.to_vec(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    impl FatEngine for MockEngine {
        type Volume = ();
        type File = ();
        type Dir = usize;

        const MAX_NAME_LEN: usize = 12;

        fn clear_volume(&self, _volume: &mut ()) {}
        fn mkfs(&self, _: &SharedDevice, _: u8, _: FormatOptions, _: u32, _: &mut [u8]) -> EngineResult<()> {
            Ok(())
        }
        fn mount(&self, _: &SharedDevice, _: u8, _: &mut ()) -> EngineResult<()> {
            Ok(())
        }
        fn unmount(&self, _: &mut ()) -> EngineResult<()> {
            Ok(())
        }
        fn sync_volume(&self, _: &()) -> EngineResult<()> {
            Ok(())
        }
        fn getfree(&self, _: &()) -> EngineResult<FreeClusters> {
            Err(FatCode::NotEnabled)
        }
        fn open(&self, _: &(), _: &str, _: AccessMode) -> EngineResult<()> {
            Ok(())
        }
        fn read(&self, _: &mut (), _: &mut [u8]) -> EngineResult<usize> {
            Ok(0)
        }
        fn write(&self, _: &mut (), buf: &[u8]) -> EngineResult<usize> {
            Ok(buf.len())
        }
        fn lseek(&self, _: &mut (), _: u64) -> EngineResult<()> {
            Ok(())
        }
        fn truncate(&self, _: &mut ()) -> EngineResult<()> {
            Ok(())
        }
        fn sync(&self, _: &mut ()) -> EngineResult<()> {
            Ok(())
        }
        fn close(&self, _: &mut ()) -> EngineResult<()> {
            Ok(())
        }
        fn opendir(&self, _: &(), _: &str) -> EngineResult<usize> {
            Ok(0)
        }
        fn readdir(&self, cursor: &mut usize, out: Option<&mut FileInfo>) -> EngineResult<()> {
            let Some(info) = out else {
                self.calls.lock().push("rewind");
                if self.fail_rewind {
                    return Err(FatCode::DiskErr);
                }
                *cursor = 0;
                return Ok(());
            };
            self.calls.lock().push("readdir");
            if let Some(code) = self.fail_read {
                return Err(code);
            }
            match self.entries.get(*cursor) {
                Some(name) => {
                    info.name = name.to_string();
                    *cursor += 1;
                }
                None => info.name.clear(),
            }
            Ok(())
        }
        fn closedir(&self, _: &mut usize) -> EngineResult<()> {
            self.calls.lock().push("closedir");
            if self.fail_close {
                return Err(FatCode::DiskErr);
            }
            Ok(())
        }
        fn stat(&self, _: &(), _: &str) -> EngineResult<FileInfo> {
            Err(FatCode::NoFile)
        }
        fn unlink(&self, _: &(), _: &str) -> EngineResult<()> {
            Ok(())
        }
        fn rename(&self, _: &(), _: &str, _: &str) -> EngineResult<()> {
            Ok(())
        }
        fn mkdir(&self, _: &(), _: &str) -> EngineResult<()> {
            Ok(())
        }
        fn chmod(&self, _: &(), _: &str, _: Attributes, _: Attributes) -> EngineResult<()> {
            Ok(())
        }
        fn utime(&self, _: &(), _: &str, _: u16, _: u16) -> EngineResult<()> {
            Ok(())
        }
    }

    fn open_with(engine: MockEngine) -> (Arc<MockEngine>, Arc<HandleArena>, FatDir<MockEngine>) {
        let engine = Arc::new(engine);
        let arena = Arc::new(HandleArena::new());
        let id = arena.insert(HandleKind::Directory);
        let dir = FatDir::new(Arc::clone(&engine), Arc::clone(&arena), id, 0);
        (engine, arena, dir)
    }

    #[test]
    fn test_readdir_lists_then_ends() {
        let (_engine, _arena, mut dir) = open_with(MockEngine::listing(&["a.txt", "sub"]));
        assert_eq!(dir.readdir().unwrap().unwrap().name(), "a.txt");
        assert_eq!(dir.readdir().unwrap().unwrap().name(), "sub");
        assert!(dir.readdir().unwrap().is_none());
        assert!(dir.readdir().unwrap().is_none());
    }

    #[test]
    fn test_readdir_failure_is_not_end_of_directory() {
        for (code, errno) in [
            (FatCode::DiskErr, libc::EIO),
            (FatCode::InvalidObject, libc::EINVAL),
            (FatCode::IntErr, libc::EINVAL),
        ] {
            let (engine, _arena, mut dir) = open_with(MockEngine {
                fail_read: Some(code),
                ..MockEngine::listing(&["a.txt"])
            });
            let err = dir.readdir().unwrap_err();
            assert_eq!(err.to_errno(), errno, "{:?}", code);
            assert_eq!(engine.calls(), vec!["readdir"]);
        }
    }

    #[test]
    fn test_rewinddir_restarts_listing() {
        let (engine, _arena, mut dir) = open_with(MockEngine::listing(&["a.txt", "b.txt"]));
        assert_eq!(dir.readdir().unwrap().unwrap().name(), "a.txt");
        dir.rewinddir().unwrap();
        assert_eq!(dir.readdir().unwrap().unwrap().name(), "a.txt");
        assert_eq!(engine.calls(), vec!["readdir", "rewind", "readdir"]);
    }

    #[test]
    fn test_rewinddir_failure_translated() {
        let (engine, _arena, mut dir) = open_with(MockEngine {
            fail_rewind: true,
            ..MockEngine::listing(&["a.txt"])
        });
        assert_eq!(dir.rewinddir().unwrap_err().to_errno(), libc::EIO);
        assert_eq!(engine.calls(), vec!["rewind"]);
    }

    #[test]
    fn test_failed_closedir_still_releases() {
        let (engine, arena, mut dir) = open_with(MockEngine {
            fail_close: true,
            ..Default::default()
        });
        assert_eq!(dir.closedir().unwrap_err().to_errno(), libc::EIO);
        assert!(!dir.is_open());
        assert_eq!(arena.live(HandleKind::Directory), 0);
        assert!(matches!(dir.closedir(), Err(FsError::StaleHandle { .. })));
        drop(dir);
        assert_eq!(engine.calls(), vec!["closedir"]);
    }

    #[test]
    fn test_drop_closes_open_dir() {
        let (engine, arena, dir) = open_with(MockEngine::default());
        drop(dir);
        assert_eq!(engine.calls(), vec!["closedir"]);
        assert_eq!(arena.live(HandleKind::Directory), 0);
    }

    #[test]
    fn test_stale_dir_never_reaches_engine() {
        let (engine, arena, mut dir) = open_with(MockEngine::listing(&["a.txt"]));
        arena.invalidate_all();
        assert_eq!(dir.readdir().unwrap_err().to_errno(), libc::EBADF);
        assert_eq!(dir.rewinddir().unwrap_err().to_errno(), libc::EBADF);
        drop(dir);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_set_name_round_trip() {
        let mut entry = DirEntry::default();
        entry.set_name("readme.txt");
        assert_eq!(entry.name(), "readme.txt");
        assert_eq!(entry.as_bytes()[10], 0);
    }

    #[test]
    fn test_shorter_name_clears_previous() {
        let mut entry = DirEntry::default();
        entry.set_name("a-long-name");
        entry.set_name("ab");
        assert_eq!(entry.name(), "ab");
    }

    #[test]
    fn test_long_name_truncated_and_terminated() {
        let mut entry = DirEntry::default();
        let long = "x".repeat(400);
        entry.set_name(&long);
        assert_eq!(entry.name().len(), DIRENT_NAME_CAP - 1);
        assert_eq!(entry.as_bytes()[DIRENT_NAME_CAP - 1], 0);
    }

    #[test]
    fn test_truncation_keeps_whole_characters() {
        let mut entry = DirEntry::default();
        // 254 ASCII bytes then a 3-byte character straddling the limit.
        let name = format!("{}\u{20ac}", "y".repeat(254));
        entry.set_name(&name);
        assert_eq!(entry.name(), "y".repeat(254));
    }

    #[test]
    fn test_default_entry_is_empty() {
        assert_eq!(DirEntry::default().name(), "");
    }
}
