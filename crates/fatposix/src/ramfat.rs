//! Reference engine keeping the directory tree in memory.
//!
//! The tree is persisted to the block device as a one-sector header followed
//! by a bincode image, rewritten on file sync/close, directory changes,
//! volume sync and unmount. Cluster accounting follows the allocation unit
//! chosen at format time so free-space queries and disk-full short writes
//! behave like a real FAT volume. Open objects are tracked per volume for
//! the sharing rules (one writer or many readers) and the open limit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diskio::{disk_initialize, disk_ioctl, disk_read, disk_write, DiskStatus, IoctlCmd};
use crate::engine::{
    AccessMode, Attributes, EngineResult, FatCode, FatEngine, FileInfo, FormatOptions,
    FreeClusters, SharedDevice,
};
use crate::timestamp::{fat_time_now, join, split};

const MAGIC: [u8; 8] = *b"RAMFAT01";
const ROOT: u64 = 0;
const MIN_SECTORS: u64 = 64;
const MAX_SECTORS_PER_CLUSTER: u32 = 128;
const DEFAULT_AU_BYTES: u32 = 4096;
const MIN_SECTOR_SIZE: u32 = 512;
const MAX_SECTOR_SIZE: u32 = 4096;
const NAME_MAX: usize = 255;
const CHMOD_MASK: Attributes = Attributes::READ_ONLY
    .union(Attributes::HIDDEN)
    .union(Attributes::SYSTEM)
    .union(Attributes::ARCHIVE);

static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
enum NodeKind {
    File(Vec<u8>),
    Dir(Vec<u64>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    name: String,
    parent: u64,
    attr: Attributes,
    mtime: u32,
    kind: NodeKind,
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }

    fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Dir(_) => 0,
        }
    }

    fn info(&self) -> FileInfo {
        let (fdate, ftime) = split(self.mtime);
        FileInfo {
            size: self.size(),
            fdate,
            ftime,
            attrib: self.attr,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Image {
    sectors_per_cluster: u32,
    next_id: u64,
    nodes: BTreeMap<u64, Node>,
}

impl Image {
    fn empty(sectors_per_cluster: u32) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT,
            Node {
                name: String::new(),
                parent: ROOT,
                attr: Attributes::DIRECTORY,
                mtime: fat_time_now(),
                kind: NodeKind::Dir(Vec::new()),
            },
        );
        Self {
            sectors_per_cluster,
            next_id: ROOT + 1,
            nodes,
        }
    }
}

#[derive(Debug, Default)]
struct Opens {
    readers: u32,
    writers: u32,
}

struct VolumeState {
    device: SharedDevice,
    id: u64,
    mounted: bool,
    dirty: bool,
    sector_size: u32,
    total_sectors: u64,
    data_clusters: u64,
    image: Image,
    opens: HashMap<u64, Opens>,
    open_total: usize,
    max_open: usize,
}

fn data_clusters(total_sectors: u64, sectors_per_cluster: u32) -> u64 {
    // A quarter of the device is kept for the directory image.
    let reserved = 1 + total_sectors / 4;
    total_sectors.saturating_sub(reserved) / sectors_per_cluster as u64
}

/// Sector size of `device`; anything but a power of two in 512..=4096 is a
/// disk error.
fn sector_size(device: &SharedDevice) -> EngineResult<u32> {
    let ss = disk_ioctl(&**device, IoctlCmd::GetSectorSize).map_err(|_| FatCode::DiskErr)?;
    match u32::try_from(ss) {
        Ok(ss) if (MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&ss) && ss.is_power_of_two() => {
            Ok(ss)
        }
        _ => {
            warn!("Unsupported sector size {}", ss);
            Err(FatCode::DiskErr)
        }
    }
}

fn write_header(sector: &mut [u8], sectors_per_cluster: u32, payload_len: u64) {
    sector.fill(0);
    sector[0..8].copy_from_slice(&MAGIC);
    sector[8..12].copy_from_slice(&sectors_per_cluster.to_le_bytes());
    sector[12..20].copy_from_slice(&payload_len.to_le_bytes());
}

fn read_header(sector: &[u8]) -> Option<(u32, u64)> {
    if sector.len() < 20 || sector[0..8] != MAGIC {
        return None;
    }
    let spc = u32::from_le_bytes(sector[8..12].try_into().ok()?);
    let len = u64::from_le_bytes(sector[12..20].try_into().ok()?);
    Some((spc, len))
}

fn validate_name(name: &str) -> EngineResult<()> {
    if name.len() > NAME_MAX {
        return Err(FatCode::InvalidName);
    }
    if name
        .chars()
        .any(|c| c < ' ' || matches!(c, '"' | '*' | ':' | '<' | '>' | '?' | '|'))
    {
        return Err(FatCode::InvalidName);
    }
    Ok(())
}

/// Splits a path into validated components. Accepts an optional `0:` drive
/// prefix and both separators; `.` is skipped and `..` steps up.
fn components(path: &str) -> EngineResult<Vec<&str>> {
    let path = match path.split_once(':') {
        Some(("0", rest)) => rest,
        Some(_) => return Err(FatCode::InvalidDrive),
        None => path,
    };
    let mut out = Vec::new();
    for part in path.split(&['/', '\\'][..]) {
        match part {
            "" | "." => continue,
            ".." => {
                out.pop();
            }
            name => {
                validate_name(name)?;
                out.push(name);
            }
        }
    }
    Ok(out)
}

impl VolumeState {
    fn cluster_bytes(&self) -> u64 {
        self.image.sectors_per_cluster as u64 * self.sector_size as u64
    }

    fn clusters_for(&self, len: u64) -> u64 {
        len.div_ceil(self.cluster_bytes())
    }

    fn used_clusters(&self) -> u64 {
        self.image
            .nodes
            .values()
            .map(|node| match &node.kind {
                NodeKind::File(data) => self.clusters_for(data.len() as u64),
                NodeKind::Dir(_) => 1,
            })
            .sum()
    }

    fn free_clusters(&self) -> u64 {
        self.data_clusters.saturating_sub(self.used_clusters())
    }

    fn node(&self, id: u64) -> EngineResult<&Node> {
        self.image.nodes.get(&id).ok_or(FatCode::IntErr)
    }

    fn node_mut(&mut self, id: u64) -> EngineResult<&mut Node> {
        self.image.nodes.get_mut(&id).ok_or(FatCode::IntErr)
    }

    fn children(&self, dir: u64) -> EngineResult<&[u64]> {
        match &self.node(dir)?.kind {
            NodeKind::Dir(children) => Ok(children.as_slice()),
            NodeKind::File(_) => Err(FatCode::NoPath),
        }
    }

    fn lookup(&self, dir: u64, name: &str) -> EngineResult<Option<u64>> {
        let found = self.children(dir)?.iter().copied().find(|id| {
            self.image
                .nodes
                .get(id)
                .map(|n| n.name.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        });
        Ok(found)
    }

    fn walk_dirs(&self, comps: &[&str]) -> EngineResult<u64> {
        let mut current = ROOT;
        for name in comps {
            current = self.lookup(current, name)?.ok_or(FatCode::NoPath)?;
            if !self.node(current)?.is_dir() {
                return Err(FatCode::NoPath);
            }
        }
        Ok(current)
    }

    fn resolve(&self, path: &str) -> EngineResult<u64> {
        let comps = components(path)?;
        let Some((last, dirs)) = comps.split_last() else {
            return Ok(ROOT);
        };
        let parent = self.walk_dirs(dirs)?;
        self.lookup(parent, last)?.ok_or(FatCode::NoFile)
    }

    /// Resolves a path that must not name the root directory.
    fn resolve_entry(&self, path: &str) -> EngineResult<u64> {
        match self.resolve(path)? {
            ROOT => Err(FatCode::InvalidName),
            id => Ok(id),
        }
    }

    fn resolve_parent(&self, path: &str) -> EngineResult<(u64, String)> {
        let comps = components(path)?;
        let Some((last, dirs)) = comps.split_last() else {
            return Err(FatCode::InvalidName);
        };
        Ok((self.walk_dirs(dirs)?, last.to_string()))
    }

    fn is_open(&self, id: u64) -> bool {
        self.opens.contains_key(&id)
    }

    fn is_ancestor(&self, ancestor: u64, mut id: u64) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            if id == ROOT {
                return false;
            }
            match self.image.nodes.get(&id) {
                Some(node) => id = node.parent,
                None => return false,
            }
        }
    }

    fn add_node(&mut self, parent: u64, name: String, attr: Attributes, kind: NodeKind) -> EngineResult<u64> {
        let id = self.image.next_id;
        self.image.next_id += 1;
        self.image.nodes.insert(
            id,
            Node {
                name,
                parent,
                attr,
                mtime: fat_time_now(),
                kind,
            },
        );
        match &mut self.node_mut(parent)?.kind {
            NodeKind::Dir(children) => children.push(id),
            NodeKind::File(_) => return Err(FatCode::IntErr),
        }
        self.dirty = true;
        Ok(id)
    }

    fn detach(&mut self, id: u64) -> EngineResult<()> {
        let parent = self.node(id)?.parent;
        if let NodeKind::Dir(children) = &mut self.node_mut(parent)?.kind {
            children.retain(|c| *c != id);
        }
        self.dirty = true;
        Ok(())
    }

    fn register_open(&mut self, id: u64, write: bool) -> EngineResult<()> {
        if self.open_total >= self.max_open {
            return Err(FatCode::TooManyOpenFiles);
        }
        if let Some(opens) = self.opens.get(&id) {
            if write || opens.writers > 0 {
                return Err(FatCode::Locked);
            }
        }
        let opens = self.opens.entry(id).or_default();
        if write {
            opens.writers += 1;
        } else {
            opens.readers += 1;
        }
        self.open_total += 1;
        Ok(())
    }

    fn release_open(&mut self, id: u64, write: bool) {
        if let Some(opens) = self.opens.get_mut(&id) {
            if write {
                opens.writers = opens.writers.saturating_sub(1);
            } else {
                opens.readers = opens.readers.saturating_sub(1);
            }
            if opens.readers == 0 && opens.writers == 0 {
                self.opens.remove(&id);
            }
        }
        self.open_total = self.open_total.saturating_sub(1);
    }

    fn persist(&mut self) -> EngineResult<()> {
        let payload = bincode::serialize(&self.image).map_err(|e| {
            warn!("Failed to encode volume image: {}", e);
            FatCode::IntErr
        })?;
        let ss = self.sector_size as usize;
        let sectors = 1 + payload.len().div_ceil(ss);
        if sectors as u64 > self.total_sectors {
            warn!(
                "Volume image of {} bytes does not fit {} sectors",
                payload.len(),
                self.total_sectors
            );
            return Err(FatCode::Denied);
        }
        let mut buf = vec![0u8; sectors * ss];
        write_header(&mut buf[..ss], self.image.sectors_per_cluster, payload.len() as u64);
        buf[ss..ss + payload.len()].copy_from_slice(&payload);
        disk_write(&*self.device, &buf, 0, sectors).into_engine()?;
        self.dirty = false;
        Ok(())
    }

    fn flush(&mut self) -> EngineResult<()> {
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }
}

/// Volume state for [`RamFatEngine`]. The default value is not mounted.
#[derive(Default)]
pub struct RamVolume {
    state: Option<Arc<Mutex<VolumeState>>>,
}

impl RamVolume {
    /// Whether the volume is currently registered with the engine.
    pub fn is_mounted(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| s.lock().mounted)
            .unwrap_or(false)
    }

    fn live(&self) -> EngineResult<MutexGuard<'_, VolumeState>> {
        let state = self.state.as_ref().ok_or(FatCode::NotEnabled)?;
        let guard = state.lock();
        if !guard.mounted {
            return Err(FatCode::NotEnabled);
        }
        Ok(guard)
    }
}

fn live_object(vol: &Option<Arc<Mutex<VolumeState>>>) -> EngineResult<MutexGuard<'_, VolumeState>> {
    let state = vol.as_ref().ok_or(FatCode::InvalidObject)?;
    let guard = state.lock();
    if !guard.mounted {
        return Err(FatCode::InvalidObject);
    }
    Ok(guard)
}

/// Open file state for [`RamFatEngine`].
pub struct RamFile {
    vol: Option<Arc<Mutex<VolumeState>>>,
    node: u64,
    pos: u64,
    mode: AccessMode,
}

impl RamFile {
    /// Current file pointer.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

/// Open directory state for [`RamFatEngine`].
pub struct RamDir {
    vol: Option<Arc<Mutex<VolumeState>>>,
    node: u64,
    index: usize,
}

/// In-memory FAT engine.
#[derive(Debug, Clone)]
pub struct RamFatEngine {
    max_open: usize,
}

impl Default for RamFatEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFatEngine {
    /// Engine allowing 16 simultaneously open objects per volume.
    pub fn new() -> Self {
        Self { max_open: 16 }
    }

    /// Engine with a custom open-object limit.
    pub fn with_max_open(max_open: usize) -> Self {
        Self { max_open }
    }

    fn modify<T>(
        &self,
        volume: &RamVolume,
        f: impl FnOnce(&mut VolumeState) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut state = volume.live()?;
        let out = f(&mut *state)?;
        state.flush()?;
        Ok(out)
    }
}

impl FatEngine for RamFatEngine {
    type Volume = RamVolume;
    type File = RamFile;
    type Dir = RamDir;

    const MAX_NAME_LEN: usize = NAME_MAX;

    fn clear_volume(&self, volume: &mut RamVolume) {
        if let Some(state) = volume.state.take() {
            state.lock().mounted = false;
        }
    }

    fn mkfs(
        &self,
        device: &SharedDevice,
        partition: u8,
        options: FormatOptions,
        au_bytes: u32,
        work: &mut [u8],
    ) -> EngineResult<()> {
        if !options.intersects(FormatOptions::ANY) || partition != 0 {
            return Err(FatCode::InvalidParameter);
        }
        let status = disk_initialize(&**device);
        if status.contains(DiskStatus::NOINIT) {
            return Err(FatCode::NotReady);
        }
        if status.contains(DiskStatus::PROTECT) {
            return Err(FatCode::WriteProtected);
        }

        let ss = sector_size(device)?;
        let total = disk_ioctl(&**device, IoctlCmd::GetSectorCount).map_err(|_| FatCode::DiskErr)?;
        if work.len() < ss as usize {
            return Err(FatCode::NotEnoughCore);
        }

        let au = if au_bytes == 0 { DEFAULT_AU_BYTES.max(ss) } else { au_bytes };
        if au % ss != 0 || au / ss > MAX_SECTORS_PER_CLUSTER {
            return Err(FatCode::InvalidParameter);
        }
        let spc = au / ss;
        if total < MIN_SECTORS || data_clusters(total, spc) == 0 {
            return Err(FatCode::MkfsAborted);
        }

        let payload = bincode::serialize(&Image::empty(spc)).map_err(|_| FatCode::IntErr)?;
        let ss = ss as usize;

        write_header(&mut work[..ss], spc, payload.len() as u64);
        disk_write(&**device, &work[..ss], 0, 1).into_engine()?;

        let per_chunk = work.len() / ss;
        for (i, chunk) in payload.chunks(per_chunk * ss).enumerate() {
            let sectors = chunk.len().div_ceil(ss);
            work[..sectors * ss].fill(0);
            work[..chunk.len()].copy_from_slice(chunk);
            let lba = 1 + (i * per_chunk) as u64;
            disk_write(&**device, &work[..sectors * ss], lba, sectors).into_engine()?;
        }
        disk_ioctl(&**device, IoctlCmd::Sync).map_err(|_| FatCode::DiskErr)?;

        info!(
            "Formatted {} sectors of {} bytes, {} sectors per cluster, {} data clusters",
            total,
            ss,
            spc,
            data_clusters(total, spc)
        );
        Ok(())
    }

    fn mount(
        &self,
        device: &SharedDevice,
        volume_index: u8,
        volume: &mut RamVolume,
    ) -> EngineResult<()> {
        if volume_index != 0 {
            return Err(FatCode::InvalidDrive);
        }
        if disk_initialize(&**device).contains(DiskStatus::NOINIT) {
            return Err(FatCode::NotReady);
        }
        let ss = sector_size(device)? as usize;
        let total = device.blocks();

        let mut sector = vec![0u8; ss];
        disk_read(&**device, &mut sector, 0, 1).into_engine()?;
        let (spc, len) = read_header(&sector).ok_or(FatCode::NoFilesystem)?;
        if spc == 0 || spc > MAX_SECTORS_PER_CLUSTER {
            return Err(FatCode::NoFilesystem);
        }

        let sectors = (len as usize).div_ceil(ss);
        if 1 + sectors as u64 > total {
            return Err(FatCode::NoFilesystem);
        }
        let mut payload = vec![0u8; sectors * ss];
        if sectors > 0 {
            disk_read(&**device, &mut payload, 1, sectors).into_engine()?;
        }
        let image: Image = bincode::deserialize(&payload[..len as usize]).map_err(|e| {
            warn!("Volume image does not decode: {}", e);
            FatCode::NoFilesystem
        })?;

        let id = NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Mounted volume {} with {} entries", id, image.nodes.len());
        volume.state = Some(Arc::new(Mutex::new(VolumeState {
            device: Arc::clone(device),
            id,
            mounted: true,
            dirty: false,
            sector_size: ss as u32,
            total_sectors: total,
            data_clusters: data_clusters(total, image.sectors_per_cluster),
            image,
            opens: HashMap::new(),
            open_total: 0,
            max_open: self.max_open,
        })));
        Ok(())
    }

    fn unmount(&self, volume: &mut RamVolume) -> EngineResult<()> {
        let Some(state) = volume.state.take() else {
            return Ok(());
        };
        let mut state = state.lock();
        if !state.mounted {
            return Ok(());
        }
        state.mounted = false;
        debug!("Unmounting volume {}", state.id);
        state.flush()
    }

    fn sync_volume(&self, volume: &RamVolume) -> EngineResult<()> {
        let mut state = volume.live()?;
        state.flush()?;
        disk_ioctl(&*state.device, IoctlCmd::Sync).map_err(|_| FatCode::DiskErr)?;
        Ok(())
    }

    fn getfree(&self, volume: &RamVolume) -> EngineResult<FreeClusters> {
        let state = volume.live()?;
        Ok(FreeClusters {
            free: state.free_clusters() as u32,
            sectors_per_cluster: state.image.sectors_per_cluster,
        })
    }

    fn open(&self, volume: &RamVolume, path: &str, mode: AccessMode) -> EngineResult<RamFile> {
        let shared = volume.state.as_ref().ok_or(FatCode::NotEnabled)?;
        let mut state = volume.live()?;
        let write = mode.contains(AccessMode::WRITE);
        let disposition = mode.disposition();
        let creating = disposition.intersects(
            AccessMode::CREATE_NEW | AccessMode::CREATE_ALWAYS | AccessMode::OPEN_ALWAYS,
        );

        let node = match state.resolve(path) {
            Ok(id) => {
                let node = state.node(id)?;
                if node.is_dir() {
                    return Err(FatCode::NoFile);
                }
                if disposition == AccessMode::CREATE_NEW {
                    return Err(FatCode::Exist);
                }
                let read_only = node.attr.contains(Attributes::READ_ONLY);
                if read_only && (write || disposition == AccessMode::CREATE_ALWAYS) {
                    return Err(FatCode::Denied);
                }
                state.register_open(id, write)?;
                if disposition == AccessMode::CREATE_ALWAYS {
                    let node = state.node_mut(id)?;
                    node.kind = NodeKind::File(Vec::new());
                    node.mtime = fat_time_now();
                    state.dirty = true;
                }
                id
            }
            Err(FatCode::NoFile) if creating => {
                let (parent, name) = state.resolve_parent(path)?;
                if state.open_total >= state.max_open {
                    return Err(FatCode::TooManyOpenFiles);
                }
                let id = state.add_node(parent, name, Attributes::ARCHIVE, NodeKind::File(Vec::new()))?;
                state.register_open(id, write)?;
                id
            }
            Err(code) => return Err(code),
        };

        if let Err(code) = state.flush() {
            state.release_open(node, write);
            return Err(code);
        }
        let pos = if disposition == AccessMode::OPEN_APPEND {
            state.node(node)?.size()
        } else {
            0
        };
        Ok(RamFile {
            vol: Some(Arc::clone(shared)),
            node,
            pos,
            mode,
        })
    }

    fn read(&self, file: &mut RamFile, buf: &mut [u8]) -> EngineResult<usize> {
        let state = live_object(&file.vol)?;
        if !file.mode.contains(AccessMode::READ) {
            return Err(FatCode::Denied);
        }
        let NodeKind::File(data) = &state.node(file.node)?.kind else {
            return Err(FatCode::IntErr);
        };
        let start = (file.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        file.pos += n as u64;
        Ok(n)
    }

    fn write(&self, file: &mut RamFile, buf: &[u8]) -> EngineResult<usize> {
        let mut state = live_object(&file.vol)?;
        if !file.mode.contains(AccessMode::WRITE) {
            return Err(FatCode::Denied);
        }
        let size = state.node(file.node)?.size();
        let capacity = (state.clusters_for(size) + state.free_clusters()) * state.cluster_bytes();
        let pos = file.pos;
        let n = (buf.len() as u64).min(capacity.saturating_sub(pos)) as usize;
        if n == 0 {
            return Ok(0);
        }

        let node = state.node_mut(file.node)?;
        let NodeKind::File(data) = &mut node.kind else {
            return Err(FatCode::IntErr);
        };
        let end = pos as usize + n;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[pos as usize..end].copy_from_slice(&buf[..n]);
        node.mtime = fat_time_now();
        state.dirty = true;
        file.pos += n as u64;
        Ok(n)
    }

    fn lseek(&self, file: &mut RamFile, offset: u64) -> EngineResult<()> {
        let mut state = live_object(&file.vol)?;
        let size = state.node(file.node)?.size();
        if offset <= size {
            file.pos = offset;
            return Ok(());
        }
        if !file.mode.contains(AccessMode::WRITE) {
            file.pos = size;
            return Ok(());
        }
        // Seeking past the end in write mode extends the file.
        let capacity = (state.clusters_for(size) + state.free_clusters()) * state.cluster_bytes();
        let target = offset.min(capacity);
        let node = state.node_mut(file.node)?;
        if let NodeKind::File(data) = &mut node.kind {
            data.resize(target as usize, 0);
        }
        node.mtime = fat_time_now();
        state.dirty = true;
        file.pos = target;
        Ok(())
    }

    fn truncate(&self, file: &mut RamFile) -> EngineResult<()> {
        let mut state = live_object(&file.vol)?;
        if !file.mode.contains(AccessMode::WRITE) {
            return Err(FatCode::Denied);
        }
        let pos = file.pos as usize;
        let node = state.node_mut(file.node)?;
        if let NodeKind::File(data) = &mut node.kind {
            if pos < data.len() {
                data.truncate(pos);
                node.mtime = fat_time_now();
                state.dirty = true;
            }
        }
        Ok(())
    }

    fn sync(&self, file: &mut RamFile) -> EngineResult<()> {
        let mut state = live_object(&file.vol)?;
        state.flush()
    }

    fn close(&self, file: &mut RamFile) -> EngineResult<()> {
        let result = {
            let mut state = live_object(&file.vol)?;
            state.release_open(file.node, file.mode.contains(AccessMode::WRITE));
            state.flush()
        };
        file.vol = None;
        result
    }

    fn opendir(&self, volume: &RamVolume, path: &str) -> EngineResult<RamDir> {
        let shared = volume.state.as_ref().ok_or(FatCode::NotEnabled)?;
        let mut state = volume.live()?;
        let node = match state.resolve(path) {
            Ok(id) => id,
            Err(FatCode::NoFile) => return Err(FatCode::NoPath),
            Err(code) => return Err(code),
        };
        if !state.node(node)?.is_dir() {
            return Err(FatCode::NoPath);
        }
        state.register_open(node, false)?;
        Ok(RamDir {
            vol: Some(Arc::clone(shared)),
            node,
            index: 0,
        })
    }

    fn readdir(&self, dir: &mut RamDir, out: Option<&mut FileInfo>) -> EngineResult<()> {
        let state = live_object(&dir.vol)?;
        let Some(out) = out else {
            dir.index = 0;
            return Ok(());
        };
        let children = state.children(dir.node)?;
        match children.get(dir.index) {
            Some(id) => {
                *out = state.node(*id)?.info();
                dir.index += 1;
            }
            None => *out = FileInfo::default(),
        }
        Ok(())
    }

    fn closedir(&self, dir: &mut RamDir) -> EngineResult<()> {
        {
            let mut state = live_object(&dir.vol)?;
            state.release_open(dir.node, false);
        }
        dir.vol = None;
        Ok(())
    }

    fn stat(&self, volume: &RamVolume, path: &str) -> EngineResult<FileInfo> {
        let state = volume.live()?;
        let id = state.resolve_entry(path)?;
        Ok(state.node(id)?.info())
    }

    fn unlink(&self, volume: &RamVolume, path: &str) -> EngineResult<()> {
        self.modify(volume, |state| {
            let id = state.resolve_entry(path)?;
            if state.is_open(id) {
                return Err(FatCode::Locked);
            }
            let node = state.node(id)?;
            if node.attr.contains(Attributes::READ_ONLY) {
                return Err(FatCode::Denied);
            }
            if let NodeKind::Dir(children) = &node.kind {
                if !children.is_empty() {
                    return Err(FatCode::Denied);
                }
            }
            state.detach(id)?;
            state.image.nodes.remove(&id);
            Ok(())
        })
    }

    fn rename(&self, volume: &RamVolume, from: &str, to: &str) -> EngineResult<()> {
        self.modify(volume, |state| {
            let id = state.resolve_entry(from)?;
            if state.is_open(id) {
                return Err(FatCode::Locked);
            }
            let (parent, name) = state.resolve_parent(to)?;
            if let Some(existing) = state.lookup(parent, &name)? {
                if existing != id {
                    return Err(FatCode::Exist);
                }
            }
            if state.node(id)?.is_dir() && state.is_ancestor(id, parent) {
                return Err(FatCode::InvalidName);
            }
            state.detach(id)?;
            let node = state.node_mut(id)?;
            node.name = name;
            node.parent = parent;
            if let NodeKind::Dir(children) = &mut state.node_mut(parent)?.kind {
                children.push(id);
            }
            Ok(())
        })
    }

    fn mkdir(&self, volume: &RamVolume, path: &str) -> EngineResult<()> {
        self.modify(volume, |state| {
            let (parent, name) = state.resolve_parent(path)?;
            if state.lookup(parent, &name)?.is_some() {
                return Err(FatCode::Exist);
            }
            if state.free_clusters() == 0 {
                return Err(FatCode::Denied);
            }
            state.add_node(parent, name, Attributes::DIRECTORY, NodeKind::Dir(Vec::new()))?;
            Ok(())
        })
    }

    fn chmod(
        &self,
        volume: &RamVolume,
        path: &str,
        attr: Attributes,
        mask: Attributes,
    ) -> EngineResult<()> {
        self.modify(volume, |state| {
            let id = state.resolve_entry(path)?;
            let mask = mask & CHMOD_MASK;
            let node = state.node_mut(id)?;
            node.attr = (attr & mask) | (node.attr & !mask);
            state.dirty = true;
            Ok(())
        })
    }

    fn utime(&self, volume: &RamVolume, path: &str, fdate: u16, ftime: u16) -> EngineResult<()> {
        self.modify(volume, |state| {
            let id = state.resolve_entry(path)?;
            state.node_mut(id)?.mtime = join(fdate, ftime);
            state.dirty = true;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;

    fn formatted(sectors: u64) -> (RamFatEngine, SharedDevice, RamVolume) {
        let engine = RamFatEngine::new();
        let device: SharedDevice = Arc::new(RamDisk::new(512, sectors));
        let mut work = vec![0u8; 1024];
        engine
            .mkfs(&device, 0, FormatOptions::default(), 1024, &mut work)
            .unwrap();
        let mut volume = RamVolume::default();
        engine.mount(&device, 0, &mut volume).unwrap();
        (engine, device, volume)
    }

    fn create(engine: &RamFatEngine, volume: &RamVolume, path: &str, data: &[u8]) {
        let mut f = engine
            .open(volume, path, AccessMode::WRITE | AccessMode::CREATE_ALWAYS)
            .unwrap();
        assert_eq!(engine.write(&mut f, data).unwrap(), data.len());
        engine.close(&mut f).unwrap();
    }

    #[test]
    fn test_components() {
        assert_eq!(components("/a/b/../c").unwrap(), vec!["a", "c"]);
        assert_eq!(components("0:/x").unwrap(), vec!["x"]);
        assert_eq!(components("1:/x"), Err(FatCode::InvalidDrive));
        assert_eq!(components("/bad?name"), Err(FatCode::InvalidName));
        assert!(components("/").unwrap().is_empty());
    }

    #[test]
    fn test_mount_unformatted_device() {
        let engine = RamFatEngine::new();
        let device: SharedDevice = Arc::new(RamDisk::new(512, 128));
        let mut volume = RamVolume::default();
        assert_eq!(
            engine.mount(&device, 0, &mut volume),
            Err(FatCode::NoFilesystem)
        );
        assert!(!volume.is_mounted());
    }

    #[test]
    fn test_mkfs_parameter_checks() {
        let engine = RamFatEngine::new();
        let device: SharedDevice = Arc::new(RamDisk::new(512, 128));
        let mut small = vec![0u8; 100];
        assert_eq!(
            engine.mkfs(&device, 0, FormatOptions::default(), 0, &mut small),
            Err(FatCode::NotEnoughCore)
        );
        let mut work = vec![0u8; 512];
        assert_eq!(
            engine.mkfs(&device, 0, FormatOptions::SFD, 0, &mut work),
            Err(FatCode::InvalidParameter)
        );
        assert_eq!(
            engine.mkfs(&device, 0, FormatOptions::default(), 768, &mut work),
            Err(FatCode::InvalidParameter)
        );
        let tiny: SharedDevice = Arc::new(RamDisk::new(512, 16));
        assert_eq!(
            engine.mkfs(&tiny, 0, FormatOptions::default(), 0, &mut work),
            Err(FatCode::MkfsAborted)
        );
    }

    #[test]
    fn test_bad_sector_size_is_disk_error() {
        let engine = RamFatEngine::new();
        let mut work = vec![0u8; 8192];
        for ss in [0, 16, 768, 8192] {
            let device: SharedDevice = Arc::new(RamDisk::new(ss, 1024));
            assert_eq!(
                engine.mkfs(&device, 0, FormatOptions::default(), 1024, &mut work),
                Err(FatCode::DiskErr),
                "sector size {}",
                ss
            );
            let mut volume = RamVolume::default();
            assert_eq!(
                engine.mount(&device, 0, &mut volume),
                Err(FatCode::DiskErr),
                "sector size {}",
                ss
            );
            assert!(!volume.is_mounted());
        }
    }

    #[test]
    fn test_4k_sectors() {
        let engine = RamFatEngine::new();
        let device: SharedDevice = Arc::new(RamDisk::new(4096, 256));
        let mut work = vec![0u8; 4096];
        engine
            .mkfs(&device, 0, FormatOptions::default(), 0, &mut work)
            .unwrap();
        let mut volume = RamVolume::default();
        engine.mount(&device, 0, &mut volume).unwrap();
        assert!(volume.is_mounted());
    }

    #[test]
    fn test_mkfs_with_single_sector_work_buffer() {
        let engine = RamFatEngine::new();
        let device: SharedDevice = Arc::new(RamDisk::new(512, 128));
        let mut work = vec![0u8; 512];
        engine
            .mkfs(&device, 0, FormatOptions::FAT32, 512, &mut work)
            .unwrap();
        let mut volume = RamVolume::default();
        engine.mount(&device, 0, &mut volume).unwrap();
        assert!(volume.is_mounted());
    }

    #[test]
    fn test_write_read_back() {
        let (engine, _dev, volume) = formatted(256);
        create(&engine, &volume, "/hello.txt", b"hello world");
        let mut f = engine.open(&volume, "/HELLO.TXT", AccessMode::READ).unwrap();
        let mut buf = [0u8; 64];
        let n = engine.read(&mut f, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(engine.read(&mut f, &mut buf).unwrap(), 0);
        engine.close(&mut f).unwrap();
    }

    #[test]
    fn test_data_survives_remount() {
        let (engine, device, mut volume) = formatted(256);
        engine.mkdir(&volume, "/docs").unwrap();
        create(&engine, &volume, "/docs/a.bin", &[9u8; 3000]);
        engine.unmount(&mut volume).unwrap();

        let mut again = RamVolume::default();
        engine.mount(&device, 0, &mut again).unwrap();
        let info = engine.stat(&again, "/docs/a.bin").unwrap();
        assert_eq!(info.size, 3000);
        assert!(engine.stat(&again, "/docs").unwrap().is_dir());
    }

    #[test]
    fn test_open_dispositions() {
        let (engine, _dev, volume) = formatted(256);
        assert!(matches!(
            engine.open(&volume, "/missing", AccessMode::READ),
            Err(FatCode::NoFile)
        ));
        assert!(matches!(
            engine.open(&volume, "/nodir/x", AccessMode::WRITE | AccessMode::CREATE_ALWAYS),
            Err(FatCode::NoPath)
        ));
        create(&engine, &volume, "/a", b"abc");
        assert!(matches!(
            engine.open(&volume, "/a", AccessMode::WRITE | AccessMode::CREATE_NEW),
            Err(FatCode::Exist)
        ));
        let mut f = engine
            .open(&volume, "/a", AccessMode::WRITE | AccessMode::OPEN_APPEND)
            .unwrap();
        assert_eq!(f.position(), 3);
        engine.write(&mut f, b"def").unwrap();
        engine.close(&mut f).unwrap();
        assert_eq!(engine.stat(&volume, "/a").unwrap().size, 6);

        let mut f = engine
            .open(&volume, "/a", AccessMode::WRITE | AccessMode::CREATE_ALWAYS)
            .unwrap();
        engine.close(&mut f).unwrap();
        assert_eq!(engine.stat(&volume, "/a").unwrap().size, 0);
    }

    #[test]
    fn test_sharing_rules() {
        let (engine, _dev, volume) = formatted(256);
        create(&engine, &volume, "/s", b"x");
        let mut r1 = engine.open(&volume, "/s", AccessMode::READ).unwrap();
        let mut r2 = engine.open(&volume, "/s", AccessMode::READ).unwrap();
        assert!(matches!(
            engine.open(&volume, "/s", AccessMode::WRITE),
            Err(FatCode::Locked)
        ));
        assert_eq!(engine.unlink(&volume, "/s"), Err(FatCode::Locked));
        engine.close(&mut r1).unwrap();
        engine.close(&mut r2).unwrap();
        engine.unlink(&volume, "/s").unwrap();
    }

    #[test]
    fn test_open_limit() {
        let engine = RamFatEngine::with_max_open(2);
        let device: SharedDevice = Arc::new(RamDisk::new(512, 256));
        let mut work = vec![0u8; 512];
        engine
            .mkfs(&device, 0, FormatOptions::default(), 0, &mut work)
            .unwrap();
        let mut volume = RamVolume::default();
        engine.mount(&device, 0, &mut volume).unwrap();
        let mode = AccessMode::WRITE | AccessMode::CREATE_ALWAYS;
        let _a = engine.open(&volume, "/a", mode).unwrap();
        let _b = engine.open(&volume, "/b", mode).unwrap();
        assert!(matches!(
            engine.open(&volume, "/c", mode),
            Err(FatCode::TooManyOpenFiles)
        ));
    }

    #[test]
    fn test_read_only_attribute() {
        let (engine, _dev, volume) = formatted(256);
        create(&engine, &volume, "/ro", b"x");
        engine
            .chmod(&volume, "/ro", Attributes::READ_ONLY, Attributes::READ_ONLY)
            .unwrap();
        assert!(matches!(
            engine.open(&volume, "/ro", AccessMode::WRITE),
            Err(FatCode::Denied)
        ));
        assert_eq!(engine.unlink(&volume, "/ro"), Err(FatCode::Denied));
        engine
            .chmod(&volume, "/ro", Attributes::empty(), Attributes::READ_ONLY)
            .unwrap();
        engine.unlink(&volume, "/ro").unwrap();
    }

    #[test]
    fn test_directory_iteration_and_end_sentinel() {
        let (engine, _dev, volume) = formatted(256);
        engine.mkdir(&volume, "/d").unwrap();
        create(&engine, &volume, "/d/one", b"1");
        create(&engine, &volume, "/d/two", b"22");
        let mut dir = engine.opendir(&volume, "/d").unwrap();
        let mut info = FileInfo::default();
        let mut names = Vec::new();
        loop {
            engine.readdir(&mut dir, Some(&mut info)).unwrap();
            if info.name.is_empty() {
                break;
            }
            names.push(info.name.clone());
        }
        assert_eq!(names, vec!["one", "two"]);
        engine.readdir(&mut dir, Some(&mut info)).unwrap();
        assert!(info.name.is_empty());
        engine.readdir(&mut dir, None).unwrap();
        engine.readdir(&mut dir, Some(&mut info)).unwrap();
        assert_eq!(info.name, "one");
        engine.closedir(&mut dir).unwrap();
    }

    #[test]
    fn test_rmdir_non_empty_denied() {
        let (engine, _dev, volume) = formatted(256);
        engine.mkdir(&volume, "/d").unwrap();
        create(&engine, &volume, "/d/f", b"1");
        assert_eq!(engine.unlink(&volume, "/d"), Err(FatCode::Denied));
        assert_eq!(engine.mkdir(&volume, "/d"), Err(FatCode::Exist));
    }

    #[test]
    fn test_rename_rules() {
        let (engine, _dev, volume) = formatted(256);
        engine.mkdir(&volume, "/a").unwrap();
        engine.mkdir(&volume, "/a/b").unwrap();
        create(&engine, &volume, "/f", b"x");
        create(&engine, &volume, "/g", b"y");
        assert_eq!(engine.rename(&volume, "/f", "/g"), Err(FatCode::Exist));
        assert_eq!(engine.rename(&volume, "/a", "/a/b/c"), Err(FatCode::InvalidName));
        engine.rename(&volume, "/f", "/a/b/moved").unwrap();
        assert_eq!(engine.stat(&volume, "/a/b/moved").unwrap().size, 1);
        assert_eq!(engine.stat(&volume, "/f"), Err(FatCode::NoFile));
    }

    #[test]
    fn test_stat_root_is_invalid_name() {
        let (engine, _dev, volume) = formatted(256);
        assert_eq!(engine.stat(&volume, "/"), Err(FatCode::InvalidName));
    }

    #[test]
    fn test_disk_full_short_write() {
        let (engine, _dev, volume) = formatted(64);
        let free = engine.getfree(&volume).unwrap();
        let capacity = free.free as usize * 1024;
        let mut f = engine
            .open(&volume, "/big", AccessMode::WRITE | AccessMode::CREATE_ALWAYS)
            .unwrap();
        let data = vec![1u8; capacity + 5000];
        assert_eq!(engine.write(&mut f, &data).unwrap(), capacity);
        assert_eq!(engine.write(&mut f, b"more").unwrap(), 0);
        engine.close(&mut f).unwrap();
        assert_eq!(engine.getfree(&volume).unwrap().free, 0);
    }

    #[test]
    fn test_handles_invalid_after_unmount() {
        let (engine, _dev, mut volume) = formatted(256);
        let mut f = engine
            .open(&volume, "/x", AccessMode::WRITE | AccessMode::CREATE_ALWAYS)
            .unwrap();
        engine.unmount(&mut volume).unwrap();
        assert_eq!(engine.write(&mut f, b"x"), Err(FatCode::InvalidObject));
        assert!(matches!(
            engine.open(&volume, "/x", AccessMode::READ),
            Err(FatCode::NotEnabled)
        ));
    }

    #[test]
    fn test_utime_sets_packed_time() {
        let (engine, _dev, volume) = formatted(256);
        create(&engine, &volume, "/t", b"");
        engine.utime(&volume, "/t", 0x5021, 0x1234).unwrap();
        let info = engine.stat(&volume, "/t").unwrap();
        assert_eq!((info.fdate, info.ftime), (0x5021, 0x1234));
    }

    #[test]
    fn test_seek_past_end_extends_in_write_mode_only() {
        let (engine, _dev, volume) = formatted(256);
        create(&engine, &volume, "/s", b"abc");
        let mut r = engine.open(&volume, "/s", AccessMode::READ).unwrap();
        engine.lseek(&mut r, 100).unwrap();
        assert_eq!(r.position(), 3);
        engine.close(&mut r).unwrap();

        let mut w = engine
            .open(&volume, "/s", AccessMode::READ | AccessMode::WRITE)
            .unwrap();
        engine.lseek(&mut w, 100).unwrap();
        assert_eq!(w.position(), 100);
        engine.close(&mut w).unwrap();
        assert_eq!(engine.stat(&volume, "/s").unwrap().size, 100);
    }
}
