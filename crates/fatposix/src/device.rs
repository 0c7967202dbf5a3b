//! Sector-addressed block devices consumed by engines.
//!
//! The adapter itself only queries geometry (for `statvfs`); sector I/O is
//! done by the engine through [`crate::diskio`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

/// A block device addressed in logical sectors.
pub trait BlockDevice: Send + Sync {
    /// Prepares the device for I/O.
    fn open(&self) -> io::Result<()>;

    /// Releases the device.
    fn close(&self) -> io::Result<()>;

    /// Whether [`BlockDevice::open`] succeeded and the device was not closed since.
    fn is_open(&self) -> bool;

    /// Reads `count` sectors starting at `lba`; returns the number of bytes read.
    fn read_blocks(&self, buf: &mut [u8], lba: u64, count: usize) -> io::Result<usize>;

    /// Writes `count` sectors starting at `lba`; returns the number of bytes written.
    fn write_blocks(&self, buf: &[u8], lba: u64, count: usize) -> io::Result<usize>;

    /// Flushes device caches.
    fn sync(&self) -> io::Result<()>;

    /// Number of logical sectors.
    fn blocks(&self) -> u64;

    /// Logical sector size in bytes.
    fn logical_block_size(&self) -> u32;

    /// Erase block size in bytes.
    fn physical_block_size(&self) -> u32 {
        self.logical_block_size()
    }

    /// Whether writes are refused by the medium.
    fn is_write_protected(&self) -> bool {
        false
    }
}

fn check_block_size(block_size: u32) -> io::Result<()> {
    if block_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "block size must be non-zero",
        ));
    }
    Ok(())
}

fn check_range(
    blocks: u64,
    block_size: u32,
    buf_len: usize,
    lba: u64,
    count: usize,
) -> io::Result<(usize, usize)> {
    lba.checked_add(count as u64)
        .filter(|end| *end <= blocks)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sectors {}..+{} beyond device end {}", lba, count, blocks),
            )
        })?;
    let len = count * block_size as usize;
    if buf_len < len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer of {} bytes too small for {} sectors", buf_len, count),
        ));
    }
    Ok((lba as usize * block_size as usize, len))
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device not open")
}

/// Memory-backed block device.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    block_size: u32,
    blocks: u64,
    open: AtomicBool,
    write_protected: AtomicBool,
}

impl RamDisk {
    /// Creates a zero-filled disk of `blocks` sectors of `block_size` bytes.
    pub fn new(block_size: u32, blocks: u64) -> Self {
        debug!("Creating RAM disk: {} x {} bytes", blocks, block_size);
        Self {
            data: Mutex::new(vec![0u8; block_size as usize * blocks as usize]),
            block_size,
            blocks,
            open: AtomicBool::new(false),
            write_protected: AtomicBool::new(false),
        }
    }

    /// Makes subsequent writes fail the way a protected medium does.
    pub fn set_write_protected(&self, protected: bool) {
        self.write_protected.store(protected, Ordering::SeqCst);
    }
}

impl BlockDevice for RamDisk {
    fn open(&self) -> io::Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn read_blocks(&self, buf: &mut [u8], lba: u64, count: usize) -> io::Result<usize> {
        if !self.is_open() {
            return Err(not_open());
        }
        let (start, len) = check_range(self.blocks, self.block_size, buf.len(), lba, count)?;
        let data = self.data.lock();
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write_blocks(&self, buf: &[u8], lba: u64, count: usize) -> io::Result<usize> {
        if !self.is_open() {
            return Err(not_open());
        }
        if self.is_write_protected() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "medium is write protected",
            ));
        }
        let (start, len) = check_range(self.blocks, self.block_size, buf.len(), lba, count)?;
        let mut data = self.data.lock();
        data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(len)
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn blocks(&self) -> u64 {
        self.blocks
    }

    fn logical_block_size(&self) -> u32 {
        self.block_size
    }

    fn is_write_protected(&self) -> bool {
        self.write_protected.load(Ordering::SeqCst)
    }
}

/// Block device backed by an image file on the host filesystem.
pub struct FileDisk {
    path: PathBuf,
    file: Mutex<Option<File>>,
    block_size: u32,
    blocks: u64,
}

impl FileDisk {
    /// Creates (or resizes) an image file of `blocks` sectors.
    pub fn create(path: &Path, block_size: u32, blocks: u64) -> io::Result<Self> {
        check_block_size(block_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(block_size as u64 * blocks)?;
        debug!("Created image {}: {} x {} bytes", path.display(), blocks, block_size);
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(None),
            block_size,
            blocks,
        })
    }

    /// Uses an existing image file; its length determines the sector count.
    pub fn existing(path: &Path, block_size: u32) -> io::Result<Self> {
        check_block_size(block_size)?;
        let len = std::fs::metadata(path)?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(None),
            block_size,
            blocks: len / block_size as u64,
        })
    }

    /// Path of the backing image.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDisk {
    fn open(&self) -> io::Result<()> {
        let mut slot = self.file.lock();
        if slot.is_none() {
            let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            *slot = Some(file);
        }
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if let Some(file) = self.file.lock().take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    fn read_blocks(&self, buf: &mut [u8], lba: u64, count: usize) -> io::Result<usize> {
        let (start, len) = check_range(self.blocks, self.block_size, buf.len(), lba, count)?;
        let mut slot = self.file.lock();
        let file = slot.as_mut().ok_or_else(not_open)?;
        file.seek(SeekFrom::Start(start as u64))?;
        file.read_exact(&mut buf[..len])?;
        Ok(len)
    }

    fn write_blocks(&self, buf: &[u8], lba: u64, count: usize) -> io::Result<usize> {
        let (start, len) = check_range(self.blocks, self.block_size, buf.len(), lba, count)?;
        let mut slot = self.file.lock();
        let file = slot.as_mut().ok_or_else(not_open)?;
        file.seek(SeekFrom::Start(start as u64))?;
        file.write_all(&buf[..len])?;
        Ok(len)
    }

    fn sync(&self) -> io::Result<()> {
        match self.file.lock().as_ref() {
            Some(file) => file.sync_data(),
            None => Err(not_open()),
        }
    }

    fn blocks(&self) -> u64 {
        self.blocks
    }

    fn logical_block_size(&self) -> u32 {
        self.block_size
    }
}
