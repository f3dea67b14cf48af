use crate::common::types::{FailureScope, RuId, SectionId};
use crate::recovery::error::{LogError, Result};
use crate::recovery::store::SqlRecoveryLog;
use crate::recovery::unit::RecoverableUnit;

/// Handle to a recoverable unit held by a log.
///
/// The unit itself lives in the log; a handle outliving the unit's removal
/// fails with `InvalidRecoverableUnit`.
#[derive(Debug, Clone, Copy)]
pub struct RecoverableUnitHandle<'a> {
    log: &'a SqlRecoveryLog,
    id: RuId,
}

impl<'a> RecoverableUnitHandle<'a> {
    pub(crate) fn new(log: &'a SqlRecoveryLog, id: RuId) -> Self {
        Self { log, id }
    }

    pub fn identity(&self) -> RuId {
        self.id
    }

    pub fn create_section(&self, id: SectionId, single_data: bool) -> Result<SectionHandle<'a>> {
        self.log.with_unit_mut(self.id, |unit| unit.create_section(id, single_data).map(|_| ()))?;
        Ok(SectionHandle { log: self.log, ru_id: self.id, id })
    }

    pub fn lookup_section(&self, id: SectionId) -> Option<SectionHandle<'a>> {
        let exists = self.log.with_unit(self.id, |unit| unit.lookup_section(id).is_some()).unwrap_or(false);
        exists.then(|| SectionHandle { log: self.log, ru_id: self.id, id })
    }

    pub fn section_ids(&self) -> Vec<SectionId> {
        self.log.with_unit(self.id, RecoverableUnit::section_ids).unwrap_or_default()
    }

    pub fn failure_scope(&self) -> Option<FailureScope> {
        self.log.with_unit(self.id, |unit| unit.failure_scope().clone())
    }

    pub fn is_recovered(&self) -> bool {
        self.log.with_unit(self.id, RecoverableUnit::is_recovered).unwrap_or(false)
    }

    /// Queues the unwritten items of every section.
    pub fn write_sections(&self) -> Result<()> {
        self.log.write_unit(self.id, None)
    }

    /// Queues the unwritten items of every section and flushes the log.
    pub fn force_sections(&self) -> Result<()> {
        self.write_sections()?;
        self.log.force_sections()
    }

    pub fn snapshot(&self) -> Option<RecoverableUnit> {
        self.log.snapshot_unit(self.id)
    }
}

/// Handle to one section of a recoverable unit.
#[derive(Debug, Clone, Copy)]
pub struct SectionHandle<'a> {
    log: &'a SqlRecoveryLog,
    ru_id: RuId,
    id: SectionId,
}

impl SectionHandle<'_> {
    pub fn identity(&self) -> SectionId {
        self.id
    }

    pub fn unit_identity(&self) -> RuId {
        self.ru_id
    }

    /// Adds an item in memory. Nothing reaches the log until the section or
    /// its unit is written.
    pub fn add_data(&self, data: &[u8]) -> Result<()> {
        self.log.with_unit_mut(self.ru_id, |unit| {
            let section = unit
                .lookup_section_mut(self.id)
                .ok_or(LogError::InvalidSection { unit: self.ru_id, section: self.id })?;
            section.add_data(data.to_vec());
            Ok(())
        })
    }

    pub fn write(&self) -> Result<()> {
        self.log.write_unit(self.ru_id, Some(self.id))
    }

    pub fn force(&self) -> Result<()> {
        self.write()?;
        self.log.force_sections()
    }

    pub fn data(&self) -> Vec<Vec<u8>> {
        self.log
            .with_unit(self.ru_id, |unit| {
                unit.lookup_section(self.id)
                    .map(|section| section.data().into_iter().map(<[u8]>::to_vec).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn last_data(&self) -> Option<Vec<u8>> {
        self.log
            .with_unit(self.ru_id, |unit| {
                unit.lookup_section(self.id).and_then(|section| section.last_data().map(<[u8]>::to_vec))
            })
            .flatten()
    }

    pub fn is_single_data(&self) -> bool {
        self.log
            .with_unit(self.ru_id, |unit| unit.lookup_section(self.id).is_some_and(|s| s.is_single_data()))
            .unwrap_or(false)
    }
}
