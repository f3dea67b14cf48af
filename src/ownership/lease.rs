use std::time::Duration;

use crate::ownership::ControlRow;

/// What a server may do with a lease it has just read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    /// Already ours; refresh the timestamp
    Renew,
    /// The home server takes its log back from a live peer
    Reclaim,
    /// The owner stopped renewing; anyone may take it
    TakeExpired,
    Refuse,
}

/// Decides a lease claim by `local` against the control row `row`.
pub fn decide(
    row: &ControlRow,
    local: &str,
    home: bool,
    now_ms: i64,
    lease_timeout: Duration,
    peer_recovery_precedence: bool,
) -> LeaseDecision {
    if row.owner.eq_ignore_ascii_case(local) {
        return LeaseDecision::Renew;
    }
    if is_expired(row, now_ms, lease_timeout) {
        return LeaseDecision::TakeExpired;
    }
    if home && !peer_recovery_precedence {
        return LeaseDecision::Reclaim;
    }
    LeaseDecision::Refuse
}

pub fn is_expired(row: &ControlRow, now_ms: i64, lease_timeout: Duration) -> bool {
    now_ms.saturating_sub(row.marker) > lease_timeout.as_millis() as i64
}
