// Recoverable units and their sections
//
// In-memory model only. Sections hand their pending items to the store as
// cache records and move them to `written` once the store accepted them.

use std::collections::{BTreeMap, HashSet};

use crate::common::types::{DataIndex, FailureScope, RuId, SectionId, SINGLE_DATA_INDEX};
use crate::recovery::cache::CacheRecord;
use crate::recovery::error::{LogError, Result};

/// A section of a recoverable unit: an ordered list of data items, or a
/// single item that is overwritten in place.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverableUnitSection {
    id: SectionId,
    single_data: bool,
    /// Persisted items by slot; multi-data index `i` lives in slot `i - 1`.
    /// `None` marks a gap left by recovery.
    written: Vec<Option<Vec<u8>>>,
    unwritten: Vec<Vec<u8>>,
    /// The single-data row exists in the table, or is queued to be inserted
    single_data_stored: bool,
}

impl RecoverableUnitSection {
    pub fn new(id: SectionId, single_data: bool) -> Self {
        Self {
            id,
            single_data,
            written: Vec::new(),
            unwritten: Vec::new(),
            single_data_stored: false,
        }
    }

    pub fn identity(&self) -> SectionId {
        self.id
    }

    pub fn is_single_data(&self) -> bool {
        self.single_data
    }

    pub fn add_data(&mut self, data: Vec<u8>) {
        if self.single_data {
            self.unwritten.clear();
        }
        self.unwritten.push(data);
    }

    /// Every item, written before unwritten. A single-data section yields at
    /// most its latest item.
    pub fn data(&self) -> Vec<&[u8]> {
        if self.single_data {
            return self.last_data().into_iter().collect();
        }
        self.written
            .iter()
            .flatten()
            .chain(self.unwritten.iter())
            .map(Vec::as_slice)
            .collect()
    }

    pub fn last_data(&self) -> Option<&[u8]> {
        self.unwritten
            .last()
            .or_else(|| self.written.iter().rev().flatten().next())
            .map(Vec::as_slice)
    }

    pub fn has_unwritten(&self) -> bool {
        !self.unwritten.is_empty()
    }

    pub fn written_count(&self) -> usize {
        self.written.iter().flatten().count()
    }

    pub fn unwritten_count(&self) -> usize {
        self.unwritten.len()
    }

    /// Places an item read back from the table at its persisted index.
    pub(crate) fn recover_item(&mut self, index: DataIndex, data: Vec<u8>) -> Result<()> {
        if index == SINGLE_DATA_INDEX {
            self.written = vec![Some(data)];
            self.single_data_stored = true;
            return Ok(());
        }
        if index < 0 {
            return Err(LogError::Internal(format!("section {} has invalid data index {}", self.id, index)));
        }
        let slot = index as usize - 1;
        if self.written.len() <= slot {
            self.written.resize(slot + 1, None);
        }
        self.written[slot] = Some(data);
        Ok(())
    }

    /// Cache records for the unwritten items, without changing the section.
    pub(crate) fn pending_records(&self, ru_id: RuId) -> Result<Vec<CacheRecord>> {
        if self.single_data {
            let Some(data) = self.unwritten.last() else {
                return Ok(Vec::new());
            };
            let record = if self.single_data_stored {
                CacheRecord::Update { ru_id, section_id: self.id, data: data.clone() }
            } else {
                CacheRecord::Insert { ru_id, section_id: self.id, index: SINGLE_DATA_INDEX, data: data.clone() }
            };
            return Ok(vec![record]);
        }

        let first = self.written.len() + 1;
        self.unwritten
            .iter()
            .enumerate()
            .map(|(offset, data)| {
                let index = DataIndex::try_from(first + offset).map_err(|_| {
                    LogError::Internal(format!("section {} of unit {} has too many data items", self.id, ru_id))
                })?;
                Ok(CacheRecord::Insert { ru_id, section_id: self.id, index, data: data.clone() })
            })
            .collect()
    }

    /// Moves the unwritten items to written after the store accepted them.
    pub(crate) fn mark_written(&mut self) {
        if self.single_data {
            if let Some(data) = self.unwritten.pop() {
                self.written = vec![Some(data)];
                self.single_data_stored = true;
            }
            self.unwritten.clear();
        } else {
            self.written.extend(self.unwritten.drain(..).map(Some));
        }
    }
}

/// A recoverable unit: a set of sections owned by one failure scope.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverableUnit {
    id: RuId,
    failure_scope: FailureScope,
    recovered: bool,
    sections: BTreeMap<SectionId, RecoverableUnitSection>,
}

impl RecoverableUnit {
    pub fn new(id: RuId, failure_scope: FailureScope) -> Self {
        Self { id, failure_scope, recovered: false, sections: BTreeMap::new() }
    }

    pub(crate) fn recovered(id: RuId, failure_scope: FailureScope) -> Self {
        Self { recovered: true, ..Self::new(id, failure_scope) }
    }

    pub fn identity(&self) -> RuId {
        self.id
    }

    pub fn failure_scope(&self) -> &FailureScope {
        &self.failure_scope
    }

    /// Whether the unit was rebuilt from the table at open time.
    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn create_section(&mut self, id: SectionId, single_data: bool) -> Result<&mut RecoverableUnitSection> {
        if self.sections.contains_key(&id) {
            return Err(LogError::SectionExists { unit: self.id, section: id });
        }
        Ok(self.sections.entry(id).or_insert_with(|| RecoverableUnitSection::new(id, single_data)))
    }

    pub fn lookup_section(&self, id: SectionId) -> Option<&RecoverableUnitSection> {
        self.sections.get(&id)
    }

    pub fn lookup_section_mut(&mut self, id: SectionId) -> Option<&mut RecoverableUnitSection> {
        self.sections.get_mut(&id)
    }

    pub fn sections(&self) -> impl Iterator<Item = &RecoverableUnitSection> {
        self.sections.values()
    }

    pub fn section_ids(&self) -> Vec<SectionId> {
        self.sections.keys().copied().collect()
    }

    pub fn has_unwritten(&self) -> bool {
        self.sections.values().any(RecoverableUnitSection::has_unwritten)
    }

    /// Drops every section. The table rows are removed by the store.
    pub fn remove(&mut self) {
        self.sections.clear();
    }

    /// Pending records of one section, or of every section when `section` is `None`.
    pub(crate) fn pending_records(&self, section: Option<SectionId>) -> Result<Vec<CacheRecord>> {
        match section {
            Some(id) => self
                .sections
                .get(&id)
                .ok_or(LogError::InvalidSection { unit: self.id, section: id })?
                .pending_records(self.id),
            None => {
                let mut records = Vec::new();
                for section in self.sections.values() {
                    records.extend(section.pending_records(self.id)?);
                }
                Ok(records)
            }
        }
    }

    pub(crate) fn mark_written(&mut self, section: Option<SectionId>) {
        match section {
            Some(id) => {
                if let Some(section) = self.sections.get_mut(&id) {
                    section.mark_written();
                }
            }
            None => self.sections.values_mut().for_each(RecoverableUnitSection::mark_written),
        }
    }
}

/// Hands out recoverable unit ids, monotonically from 1, skipping ids in use.
///
/// Reserving an id moves the counter past it, so recovered ids are never
/// handed out again. A removed id stays retired until its removal has been
/// flushed.
#[derive(Debug, Clone)]
pub struct RecoverableUnitIdTable {
    next: RuId,
    in_use: HashSet<RuId>,
    retired: HashSet<RuId>,
}

impl Default for RecoverableUnitIdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoverableUnitIdTable {
    pub fn new() -> Self {
        Self { next: 1, in_use: HashSet::new(), retired: HashSet::new() }
    }

    pub fn next_id(&mut self) -> RuId {
        loop {
            let id = self.next;
            self.next = if self.next == RuId::MAX { 1 } else { self.next + 1 };
            if !self.retired.contains(&id) && self.in_use.insert(id) {
                return id;
            }
        }
    }

    /// Marks `id` as in use. Returns false if it already was, or if its
    /// removal has not been flushed yet.
    pub fn reserve_id(&mut self, id: RuId) -> bool {
        if self.retired.contains(&id) || !self.in_use.insert(id) {
            return false;
        }
        if id >= self.next && id < RuId::MAX {
            self.next = id + 1;
        }
        true
    }

    pub fn remove_id(&mut self, id: RuId) {
        if self.in_use.remove(&id) {
            self.retired.insert(id);
        }
    }

    /// Called once the removals of `ids` are in the table.
    pub fn release_retired(&mut self, ids: &[RuId]) {
        for id in ids {
            self.retired.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }
}
