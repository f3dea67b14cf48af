// Recovery Log Round Trip Tests

use std::collections::BTreeMap;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rlsdb::{FailureScope, LogError, LogIdentity, LogType, ServerContext, SqlRecoveryLog, SqliteConnectionProvider};

#[path = "../common/mod.rs"]
mod common;
use common::*;

#[test]
fn test_unit_written_then_recovered() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let scope = FailureScope::new(HOME);

    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    let unit = log.create_recoverable_unit_with_id(7, scope.clone())?;
    let section = unit.create_section(1, false)?;
    for i in 0..3 {
        section.add_data(&generate_test_data(16, i))?;
    }
    unit.force_sections()?;
    log.close_log()?;

    // A fresh instance reads everything back from the table.
    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    assert_eq!(log.recoverable_units(None)?, vec![7]);
    let unit = log.lookup_recoverable_unit(7).expect("unit 7 recovered");
    assert!(unit.is_recovered());
    assert_eq!(unit.failure_scope(), Some(scope));

    let section = unit.lookup_section(1).expect("section 1 recovered");
    assert!(!section.is_single_data());
    let expected: Vec<Vec<u8>> = (0..3).map(|i| generate_test_data(16, i)).collect();
    assert_eq!(section.data(), expected);

    // New items continue the index sequence after recovery.
    section.add_data(b"fourth")?;
    section.force()?;
    log.recovery_complete()?;
    log.close_log()?;

    let indexes: Vec<i64> = read_rows(&path, TABLE)?.into_iter().map(|(_, _, index, _)| index).collect();
    assert_eq!(indexes, vec![1, 2, 3, 4]);

    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    let section = log.lookup_recoverable_unit(7).and_then(|u| u.lookup_section(1)).expect("section");
    assert_eq!(section.data().len(), 4);
    assert_eq!(section.last_data(), Some(b"fourth".to_vec()));
    log.close_log()?;
    Ok(())
}

#[test]
fn test_single_data_last_write_wins() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;

    let unit = log.create_recoverable_unit(FailureScope::new(HOME))?;
    let section = unit.create_section(3, true)?;
    section.add_data(b"v1")?;
    section.force()?;
    section.add_data(b"v2")?;
    section.add_data(b"v3")?;
    section.force()?;
    let ru_id = unit.identity();
    log.close_log()?;

    let rows = read_rows(&path, TABLE)?;
    assert_eq!(rows, vec![(ru_id, 3, 0, b"v3".to_vec())]);

    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    let section = log.lookup_recoverable_unit(ru_id).and_then(|u| u.lookup_section(3)).expect("section");
    assert!(section.is_single_data());
    assert_eq!(section.data(), vec![b"v3".to_vec()]);

    // An update after recovery overwrites the recovered row.
    section.add_data(b"v4")?;
    section.force()?;
    log.close_log()?;
    assert_eq!(read_rows(&path, TABLE)?, vec![(ru_id, 3, 0, b"v4".to_vec())]);
    Ok(())
}

#[test]
fn test_removed_unit_is_not_recovered() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let scope = FailureScope::new(HOME);
    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;

    let first = log.create_recoverable_unit(scope.clone())?;
    first.create_section(1, false)?.add_data(b"first")?;
    let second = log.create_recoverable_unit(scope.clone())?;
    second.create_section(1, false)?.add_data(b"second")?;
    first.write_sections()?;
    second.force_sections()?;
    let (first_id, second_id) = (first.identity(), second.identity());

    log.remove_recoverable_unit(first_id)?;
    assert!(log.lookup_recoverable_unit(first_id).is_none());
    assert!(matches!(log.remove_recoverable_unit(first_id), Err(LogError::InvalidRecoverableUnit(_))));
    log.force_sections()?;
    log.close_log()?;

    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    assert_eq!(log.recoverable_units(None)?, vec![second_id]);
    let fresh = log.create_recoverable_unit(scope)?.identity();
    assert_ne!(fresh, second_id);
    log.close_log()?;
    Ok(())
}

#[test]
fn test_close_flushes_written_sections_only() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;

    let unit = log.create_recoverable_unit(FailureScope::new(HOME))?;
    let section = unit.create_section(1, false)?;
    section.add_data(b"written")?;
    section.write()?;
    section.add_data(b"only in memory")?;
    log.close_log()?;

    let rows = read_rows(&path, TABLE)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].3, b"written".to_vec());
    Ok(())
}

#[test]
fn test_nested_opens_share_state() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    let unit = log.create_recoverable_unit(FailureScope::new(HOME))?;
    unit.create_section(1, false)?.add_data(b"kept")?;
    unit.write_sections()?;
    let ru_id = unit.identity();

    log.open_log()?;
    assert_eq!(log.unit_count(), 1);
    log.close_log()?;

    // Still open: the unit is untouched and nothing was flushed yet.
    assert!(log.lookup_recoverable_unit(ru_id).is_some());
    assert!(read_rows(&path, TABLE)?.is_empty());

    log.close_log()?;
    assert!(!log.is_open());
    assert_eq!(read_rows(&path, TABLE)?.len(), 1);
    Ok(())
}

#[test]
fn test_services_share_a_table() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let open = |service_id: i16| -> Result<std::sync::Arc<SqlRecoveryLog>> {
        let log = SqlRecoveryLog::new(
            LogIdentity::new(HOME, LogType::Partner, "jdbc/tranlog").with_service_id(service_id),
            quick_config(),
            std::sync::Arc::new(SqliteConnectionProvider::new(&path)),
            std::sync::Arc::new(ServerContext::new(HOME)),
        );
        log.open_log()?;
        Ok(log)
    };

    let first = open(1)?;
    let unit = first.create_recoverable_unit(FailureScope::new(HOME))?;
    unit.create_section(1, false)?.add_data(b"service 1")?;
    unit.force_sections()?;
    first.close_log()?;

    let second = open(2)?;
    assert_eq!(second.table_name(), "RLS_PARTNER_LOG");
    assert!(second.recoverable_units(None)?.is_empty());
    second.close_log()?;

    let first = open(1)?;
    assert_eq!(first.unit_count(), 1);
    first.close_log()?;
    Ok(())
}

#[test]
fn test_removed_recovered_id_not_reused() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    for data in [b"one", b"two", b"six"] {
        let unit = log.create_recoverable_unit(FailureScope::new(HOME))?;
        unit.create_section(1, false)?.add_data(data)?;
        unit.write_sections()?;
    }
    log.force_sections()?;
    log.close_log()?;

    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    assert_eq!(log.recoverable_units(None)?, vec![1, 2, 3]);
    log.remove_recoverable_unit(2)?;

    // The removal is still cached when the new unit is forced with it.
    let unit = log.create_recoverable_unit(FailureScope::new(HOME))?;
    assert_eq!(unit.identity(), 4);
    unit.create_section(1, false)?.add_data(b"new")?;
    unit.force_sections()?;
    // Flushed, so the id may be chosen explicitly again.
    log.create_recoverable_unit_with_id(2, FailureScope::new(HOME))?;
    log.close_log()?;

    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    assert_eq!(log.recoverable_units(None)?, vec![1, 3, 4]);
    let section = log.lookup_recoverable_unit(4).and_then(|u| u.lookup_section(1)).expect("section");
    assert_eq!(section.data(), vec![b"new".to_vec()]);
    log.close_log()?;
    Ok(())
}

#[test]
fn test_removed_id_held_until_flushed() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let log = new_log(&path, HOME, HOME, quick_config());
    log.open_log()?;
    let unit = log.create_recoverable_unit_with_id(5, FailureScope::new(HOME))?;
    unit.create_section(1, true)?.add_data(b"old")?;
    unit.force_sections()?;

    log.remove_recoverable_unit(5)?;
    assert!(matches!(
        log.create_recoverable_unit_with_id(5, FailureScope::new(HOME)),
        Err(LogError::DuplicateRecoverableUnit(5))
    ));

    log.force_sections()?;
    let unit = log.create_recoverable_unit_with_id(5, FailureScope::new(HOME))?;
    unit.create_section(1, true)?.add_data(b"new")?;
    unit.force_sections()?;
    log.close_log()?;

    assert_eq!(read_rows(&path, TABLE)?, vec![(5, 1, 0, b"new".to_vec())]);
    Ok(())
}

#[test]
fn test_random_operations_recover_exactly() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let scope = FailureScope::new(HOME);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    // Expected contents: unit -> section -> (single data, items)
    let mut model: BTreeMap<i64, BTreeMap<i64, (bool, Vec<Vec<u8>>)>> = BTreeMap::new();

    for round in 0..3 {
        let log = new_log(&path, HOME, HOME, quick_config());
        log.open_log()?;

        for _ in 0..40 {
            match rng.gen_range(0..10) {
                0..=2 => {
                    let unit = log.create_recoverable_unit(scope.clone())?;
                    model.insert(unit.identity(), BTreeMap::new());
                }
                3..=7 if !model.is_empty() => {
                    let ids: Vec<i64> = model.keys().copied().collect();
                    let ru_id = ids[rng.gen_range(0..ids.len())];
                    let section_id = rng.gen_range(1..4);
                    let unit = log.lookup_recoverable_unit(ru_id).expect("unit in model");
                    let sections = model.get_mut(&ru_id).expect("unit in model");

                    let section = match unit.lookup_section(section_id) {
                        Some(section) => section,
                        None => {
                            let single = rng.gen_bool(0.3);
                            sections.insert(section_id, (single, Vec::new()));
                            unit.create_section(section_id, single)?
                        }
                    };
                    let data = generate_test_data(rng.gen_range(1..64), rng.r#gen());
                    section.add_data(&data)?;
                    let (single, items) = sections.get_mut(&section_id).expect("section in model");
                    if *single {
                        items.clear();
                    }
                    items.push(data);

                    if rng.gen_bool(0.5) {
                        unit.write_sections()?;
                    } else {
                        unit.force_sections()?;
                    }
                }
                8 if !model.is_empty() => {
                    let ids: Vec<i64> = model.keys().copied().collect();
                    let ru_id = ids[rng.gen_range(0..ids.len())];
                    log.remove_recoverable_unit(ru_id)?;
                    model.remove(&ru_id);
                }
                _ => log.force_sections()?,
            }
        }
        log.close_log()?;

        let log = new_log(&path, HOME, HOME, quick_config());
        log.open_log()?;
        // Units without sections have no rows and are not recovered.
        let expected_ids: Vec<i64> = model.iter().filter(|(_, s)| !s.is_empty()).map(|(id, _)| *id).collect();
        assert_eq!(log.recoverable_units(None)?, expected_ids, "round {}", round);

        for ru_id in &expected_ids {
            let unit = log.lookup_recoverable_unit(*ru_id).expect("recovered unit");
            for (section_id, (single, items)) in &model[ru_id] {
                let section = unit.lookup_section(*section_id).expect("recovered section");
                assert_eq!(section.is_single_data(), *single);
                assert_eq!(&section.data(), items, "unit {} section {}", ru_id, section_id);
            }
        }
        model.retain(|_, sections| !sections.is_empty());
        log.close_log()?;
    }
    Ok(())
}
