// Log Ownership Integration Tests

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use rlsdb::ownership::{LATCH_SET, LATCH_UNSET};
use rlsdb::{FailureScope, LogError};

#[path = "../common/mod.rs"]
mod common;
use common::*;

fn write_unit(log: &rlsdb::SqlRecoveryLog, data: &[u8]) -> Result<i64> {
    let unit = log.create_recoverable_unit(FailureScope::new(log.server_name()))?;
    unit.create_section(1, false)?.add_data(data)?;
    unit.force_sections()?;
    Ok(unit.identity())
}

#[test]
fn test_latch_handoff_at_shutdown() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let home = new_log(&path, HOME, HOME, quick_config());
    home.open_log()?;
    let ru_id = write_unit(&home, b"in flight")?;

    home.server_stopping();
    let row = home.inspect_control_row()?.expect("control row");
    assert_eq!((row.owner.as_str(), row.marker), (HOME, LATCH_SET));

    let peer_path = path.clone();
    let peer_open = thread::spawn(move || -> Result<Arc<rlsdb::SqlRecoveryLog>> {
        let config = rlsdb::RecoveryLogConfig { latch_wait: Duration::from_millis(100), ..quick_config() };
        let peer = new_log(&peer_path, HOME, PEER, config);
        peer.open_log()?;
        Ok(peer)
    });

    thread::sleep(Duration::from_millis(30));
    home.close_log()?;

    let peer = peer_open.join().expect("peer thread")?;
    let row = peer.inspect_control_row()?.expect("control row");
    assert_eq!((row.owner.as_str(), row.marker), (PEER, LATCH_UNSET));
    assert_eq!(peer.recoverable_units(None)?, vec![ru_id]);
    peer.close_log()?;
    Ok(())
}

#[test]
fn test_restart_clears_own_latch() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let home = new_log(&path, HOME, HOME, quick_config());
    home.open_log()?;
    home.server_stopping();
    // Simulate a crash after the latch was set: no close.
    drop(home);

    let restarted = new_log(&path, HOME, HOME, quick_config());
    restarted.open_log()?;
    let row = restarted.inspect_control_row()?.expect("control row");
    assert_eq!((row.owner.as_str(), row.marker), (HOME, LATCH_UNSET));
    restarted.close_log()?;
    Ok(())
}

#[test]
fn test_peer_takeover_fails_home_loudly() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let home = new_log(&path, HOME, HOME, quick_config());
    home.open_log()?;

    let peer = new_log(&path, HOME, PEER, quick_config());
    peer.open_log()?;

    let err = write_unit(&home, b"late").unwrap_err();
    assert!(matches!(err.downcast_ref::<LogError>(), Some(LogError::OwnershipLost { owner }) if owner == PEER));
    assert!(home.is_failed());
    assert!(!home.failure().expect("failure").is_quiet());
    assert!(matches!(home.open_log(), Err(LogError::Failed(_))));
    assert!(matches!(home.close_log(), Err(LogError::Failed(_))));

    peer.close_log()?;
    Ok(())
}

#[test]
fn test_live_lease_refuses_peer() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let home = new_log(&path, HOME, HOME, lease_config(Duration::from_secs(30)));
    home.open_log()?;

    let peer = new_log(&path, HOME, PEER, lease_config(Duration::from_secs(30)));
    assert!(!peer.claim_ownership()?);
    assert!(matches!(peer.open_log(), Err(LogError::OwnershipRefused { owner }) if owner == HOME));
    assert!(!peer.is_failed());
    assert!(!peer.is_open());

    write_unit(&home, b"still mine")?;
    home.close_log()?;
    Ok(())
}

#[test]
fn test_expired_lease_taken_by_peer() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let timeout = Duration::from_millis(200);
    let home = new_log(&path, HOME, HOME, lease_config(timeout));
    home.open_log()?;
    let ru_id = write_unit(&home, b"before expiry")?;

    thread::sleep(timeout * 2);
    let peer = new_log(&path, HOME, PEER, lease_config(timeout));
    assert!(peer.claim_ownership()?);
    peer.open_log()?;
    assert_eq!(peer.recoverable_units(None)?, vec![ru_id]);

    // The home server finds out at its next flush.
    let err = write_unit(&home, b"after expiry").unwrap_err();
    assert!(matches!(err.downcast_ref::<LogError>(), Some(LogError::OwnershipLost { .. })));
    peer.close_log()?;
    Ok(())
}

#[test]
fn test_home_reclaim_fails_peer_quietly() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let config = lease_config(Duration::from_secs(30));

    let peer = new_log(&path, HOME, PEER, config.clone());
    assert!(peer.claim_ownership()?);
    peer.open_log()?;

    let home = new_log(&path, HOME, HOME, config);
    home.open_log()?;
    assert_eq!(home.inspect_control_row()?.expect("control row").owner, HOME);

    let err = write_unit(&peer, b"recovering").unwrap_err();
    assert!(matches!(err.downcast_ref::<LogError>(), Some(LogError::PeerLostLogOwnership { .. })));
    let failure = peer.failure().expect("failure");
    assert!(failure.is_quiet());

    // A quietly failed log may be reopened; the home lease is live.
    assert!(matches!(peer.open_log(), Err(LogError::OwnershipRefused { .. })));
    home.close_log()?;
    Ok(())
}

#[test]
fn test_reopen_after_quiet_loss_starts_fresh() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let timeout = Duration::from_millis(200);

    let peer = new_log(&path, HOME, PEER, lease_config(timeout));
    assert!(peer.claim_ownership()?);
    peer.open_log()?;

    let home = new_log(&path, HOME, HOME, lease_config(timeout));
    home.open_log()?;
    assert!(write_unit(&peer, b"recovering").is_err());
    assert!(peer.failure().expect("failure").is_quiet());
    home.close_log()?;

    // The home lease runs out without a heartbeat.
    thread::sleep(timeout * 2);
    peer.open_log()?;
    assert!(!peer.is_failed());
    assert_eq!(peer.closes_required(), 1);
    assert_eq!(peer.inspect_control_row()?.expect("control row").owner, PEER);

    peer.close_log()?;
    assert!(!peer.is_open());
    Ok(())
}

#[test]
fn test_peer_precedence_refuses_home() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let config = rlsdb::RecoveryLogConfig {
        peer_recovery_precedence: true,
        ..lease_config(Duration::from_secs(30))
    };

    let peer = new_log(&path, HOME, PEER, config.clone());
    assert!(peer.claim_ownership()?);

    let home = new_log(&path, HOME, HOME, config);
    assert!(matches!(home.open_log(), Err(LogError::OwnershipRefused { owner }) if owner == PEER));
    assert!(!home.is_failed());
    Ok(())
}

#[test]
fn test_concurrent_claims_have_one_winner() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let timeout = Duration::from_secs(1);
    let home = new_log(&path, HOME, HOME, lease_config(timeout));
    home.open_log()?;
    home.close_log()?;
    thread::sleep(timeout + Duration::from_millis(200));

    let claimants = 4;
    let barrier = Arc::new(Barrier::new(claimants));
    let handles: Vec<_> = (0..claimants)
        .map(|i| {
            let path = path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> Result<bool> {
                let peer = new_log(&path, HOME, &format!("peer{}", i), lease_config(timeout));
                barrier.wait();
                Ok(peer.claim_ownership()?)
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.join().expect("claimant thread")? {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    Ok(())
}

#[test]
fn test_expired_server_lease_claimed_by_one_peer() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let timeout = Duration::from_millis(300);
    let lease_log = |server: &str| {
        rlsdb::ServerLeaseLog::new(
            lease_config(timeout),
            Arc::new(rlsdb::SqliteConnectionProvider::new(&path)),
            "jdbc/leases",
            Arc::new(rlsdb::ServerContext::new(server)),
        )
    };

    lease_log(HOME).update_server_lease(HOME, "cluster", true)?;
    thread::sleep(timeout * 2);

    let claimants = 4;
    let barrier = Arc::new(Barrier::new(claimants));
    let peers: Vec<_> = (0..claimants).map(|i| Arc::new(lease_log(&format!("peer{}", i)))).collect();
    let handles: Vec<_> = peers
        .iter()
        .enumerate()
        .map(|(i, peer)| {
            let peer = Arc::clone(peer);
            let barrier = barrier.clone();
            thread::spawn(move || -> Result<bool> {
                barrier.wait();
                Ok(peer.claim_peer_lease(HOME, &format!("peer{}", i))?)
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.join().expect("claimant thread")? {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    let (owner, backend) = peers[0].lease_owner(HOME)?.expect("lease row");
    assert!(owner.starts_with("peer"));
    assert_eq!(backend.as_deref(), Some("jdbc/leases"));
    Ok(())
}

#[test]
fn test_heartbeat_renews_lease() -> Result<()> {
    let (_dir, path) = create_temp_db()?;
    let config = rlsdb::RecoveryLogConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..lease_config(Duration::from_secs(30))
    };
    let home = new_log(&path, HOME, HOME, config);
    home.open_log()?;

    let first = home.inspect_control_row()?.expect("control row").marker;
    thread::sleep(Duration::from_millis(300));
    let later = home.inspect_control_row()?.expect("control row").marker;
    assert!(later > first, "lease marker {} did not advance past {}", later, first);

    home.close_log()?;
    Ok(())
}
