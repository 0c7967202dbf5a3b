//! File adapter: one open engine file behind the POSIX file operations.

use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::arena::{bound_mut, HandleArena, HandleId};
use crate::engine::FatEngine;
use crate::error::{EngineContext, FsError, Result};
use crate::posix::{FileStat, PosixFile};

/// An open file on a [`crate::FatFileSystem`].
///
/// The adapter owns its engine handle. It stays usable until it is closed or
/// the filesystem it came from is unmounted, re-formatted or dropped; after
/// that every operation fails with a stale-handle error.
pub struct FatFile<E: FatEngine> {
    engine: Arc<E>,
    arena: Arc<HandleArena>,
    id: HandleId,
    handle: Option<E::File>,
}

impl<E: FatEngine> fmt::Debug for FatFile<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatFile")
            .field("id", &self.id)
            .field("open", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl<E: FatEngine> FatFile<E> {
    pub(crate) fn new(engine: Arc<E>, arena: Arc<HandleArena>, id: HandleId, handle: E::File) -> Self {
        Self {
            engine,
            arena,
            id,
            handle: Some(handle),
        }
    }

    /// Arena id of this file.
    pub fn id(&self) -> HandleId {
        self.id
    }
}

impl<E: FatEngine> PosixFile for FatFile<E> {
    fn is_open(&self) -> bool {
        self.handle.is_some() && self.arena.is_live(self.id)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let handle = bound_mut(&self.arena, self.id, &mut self.handle)?;
        let n = self.engine.read(handle, buf).context("read")?;
        trace!("read {}: {} of {} bytes", self.id, n, buf.len());
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let handle = bound_mut(&self.arena, self.id, &mut self.handle)?;
        let n = self.engine.write(handle, buf).context("write")?;
        trace!("write {}: {} of {} bytes", self.id, n, buf.len());
        Ok(n)
    }

    fn lseek(&mut self, offset: i64, whence: i32) -> Result<i64> {
        if whence != libc::SEEK_SET || offset < 0 {
            return Err(FsError::InvalidArgument {
                msg: format!("lseek offset {} whence {}", offset, whence),
            });
        }
        let handle = bound_mut(&self.arena, self.id, &mut self.handle)?;
        self.engine.lseek(handle, offset as u64).context("lseek")?;
        trace!("lseek {}: {}", self.id, offset);
        Ok(offset)
    }

    fn ftruncate(&mut self, length: i64) -> Result<()> {
        if length < 0 {
            return Err(FsError::InvalidArgument {
                msg: format!("ftruncate length {}", length),
            });
        }
        let handle = bound_mut(&self.arena, self.id, &mut self.handle)?;
        self.engine.lseek(handle, length as u64).context("ftruncate")?;
        self.engine.truncate(handle).context("ftruncate")?;
        debug!("ftruncate {}: {}", self.id, length);
        Ok(())
    }

    fn fsync(&mut self) -> Result<()> {
        let handle = bound_mut(&self.arena, self.id, &mut self.handle)?;
        self.engine.sync(handle).context("fsync")
    }

    fn fstat(&self) -> Result<FileStat> {
        Err(FsError::NotSupported { op: "fstat" })
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Err(FsError::StaleHandle { handle: self.id });
        };
        if !self.arena.release(self.id) {
            // The volume went away under us; the engine state is already dead.
            return Err(FsError::StaleHandle { handle: self.id });
        }
        debug!("close {}", self.id);
        self.engine.close(&mut handle).context("close")
    }
}

impl<E: FatEngine> Drop for FatFile<E> {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!("Dropping file {} failed to close: {}", self.id, e);
            }
        }
    }
}

impl<E: FatEngine> io::Read for FatFile<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(PosixFile::read(self, buf)?)
    }
}

impl<E: FatEngine> io::Write for FatFile<E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(PosixFile::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.fsync()?)
    }
}

impl<E: FatEngine> io::Seek for FatFile<E> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            io::SeekFrom::Start(n) => (i64::try_from(n).unwrap_or(-1), libc::SEEK_SET),
            io::SeekFrom::Current(n) => (n, libc::SEEK_CUR),
            io::SeekFrom::End(n) => (n, libc::SEEK_END),
        };
        Ok(self.lseek(offset, whence)? as u64)
    }
}
