use parking_lot::{Mutex, MutexGuard};

use crate::common::types::{DataIndex, RuId, SectionId};

/// A change waiting for the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRecord {
    Insert { ru_id: RuId, section_id: SectionId, index: DataIndex, data: Vec<u8> },
    /// Overwrite of a single-data item
    Update { ru_id: RuId, section_id: SectionId, data: Vec<u8> },
    /// Delete of every row of a unit
    Remove { ru_id: RuId },
}

/// Row written to the table by an insert or an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionWrite {
    pub ru_id: RuId,
    pub section_id: SectionId,
    pub index: DataIndex,
    pub data: Vec<u8>,
}

/// Pending changes, split by the statement that will apply them.
#[derive(Debug, Default)]
pub struct CacheBuffer {
    pub inserts: Vec<SectionWrite>,
    pub updates: Vec<SectionWrite>,
    pub removes: Vec<RuId>,
}

impl CacheBuffer {
    pub fn push(&mut self, record: CacheRecord) {
        match record {
            CacheRecord::Insert { ru_id, section_id, index, data } => {
                self.inserts.push(SectionWrite { ru_id, section_id, index, data })
            }
            CacheRecord::Update { ru_id, section_id, data } => {
                self.updates.push(SectionWrite { ru_id, section_id, index: 0, data })
            }
            CacheRecord::Remove { ru_id } => self.removes.push(ru_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.removes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.removes.len()
    }

    pub fn clear(&mut self) {
        self.inserts.clear();
        self.updates.clear();
        self.removes.clear();
    }
}

/// One of the two cache buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSide {
    A,
    B,
}

impl CacheSide {
    fn index(self) -> usize {
        match self {
            CacheSide::A => 0,
            CacheSide::B => 1,
        }
    }

    pub fn other(self) -> Self {
        match self {
            CacheSide::A => CacheSide::B,
            CacheSide::B => CacheSide::A,
        }
    }
}

/// Double-buffered write cache. Writers fill the active side while a
/// flush drains the other one; the owner of the cache tracks which side is
/// active.
#[derive(Debug, Default)]
pub struct WriteCache {
    sides: [Mutex<CacheBuffer>; 2],
}

impl WriteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn side(&self, side: CacheSide) -> MutexGuard<'_, CacheBuffer> {
        self.sides[side.index()].lock()
    }

    pub fn clear(&self) {
        for side in &self.sides {
            side.lock().clear();
        }
    }

    pub fn pending(&self) -> usize {
        self.sides.iter().map(|side| side.lock().len()).sum()
    }
}
