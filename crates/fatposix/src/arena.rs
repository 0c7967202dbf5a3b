//! Generation-checked slots for open files and directories.
//!
//! A filesystem owns one arena and registers every File/Directory adapter it
//! hands out. Adapters validate their [`HandleId`] before each engine call,
//! so tearing down the volume invalidates all outstanding handles at once.

use std::fmt;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{FsError, Result};

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// An open file.
    File,
    /// An open directory stream.
    Directory,
}

/// Index of a slot plus the generation it was issued with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl HandleId {
    /// Slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the slot had when this id was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    kind: Option<HandleKind>,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Slots {
    fn vacate(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.kind = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }
}

/// Arena of live handle slots.
#[derive(Debug, Default)]
pub struct HandleArena {
    inner: Mutex<Slots>,
}

impl HandleArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a slot for a newly opened object.
    pub fn insert(&self, kind: HandleKind) -> HandleId {
        let mut inner = self.inner.lock();
        let id = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.kind = Some(kind);
                HandleId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: 0,
                    kind: Some(kind),
                });
                HandleId {
                    index,
                    generation: 0,
                }
            }
        };
        debug!("Handle {} issued for {:?}", id, kind);
        id
    }

    /// Whether `id` still names a live slot.
    pub fn is_live(&self, id: HandleId) -> bool {
        let inner = self.inner.lock();
        inner
            .slots
            .get(id.index as usize)
            .map(|slot| slot.generation == id.generation && slot.kind.is_some())
            .unwrap_or(false)
    }

    /// Releases the slot named by `id`. Returns false if it was already stale.
    pub fn release(&self, id: HandleId) -> bool {
        let mut inner = self.inner.lock();
        let live = inner
            .slots
            .get(id.index as usize)
            .map(|slot| slot.generation == id.generation && slot.kind.is_some())
            .unwrap_or(false);
        if live {
            inner.vacate(id.index);
            debug!("Handle {} released", id);
        }
        live
    }

    /// Invalidates every live slot; returns how many there were.
    pub fn invalidate_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let live: Vec<u32> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.kind.is_some())
            .map(|(index, _)| index as u32)
            .collect();
        for index in &live {
            inner.vacate(*index);
        }
        if !live.is_empty() {
            debug!("Invalidated {} outstanding handles", live.len());
        }
        live.len()
    }

    /// Number of live slots of `kind`.
    pub fn live(&self, kind: HandleKind) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.kind == Some(kind))
            .count()
    }
}

/// Borrows an adapter's engine handle if it is bound and `id` is still live.
pub(crate) fn bound_mut<'a, T>(
    arena: &HandleArena,
    id: HandleId,
    handle: &'a mut Option<T>,
) -> Result<&'a mut T> {
    match handle {
        Some(handle) if arena.is_live(id) => Ok(handle),
        _ => Err(FsError::StaleHandle { handle: id }),
    }
}
