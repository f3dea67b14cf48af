use crate::ownership::{ControlRow, LATCH_SET};

/// What a server opening a log under the latch scheme does with the row it read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchDecision {
    /// Ours already; clear a latch left by our own previous shutdown
    Owned { clear_latch: bool },
    /// Another server is shutting down and still closing the log
    AwaitHandoff,
    /// Take the log
    Claim,
}

pub fn decide(row: &ControlRow, local: &str, waits: u32, max_waits: u32) -> LatchDecision {
    if row.owner.eq_ignore_ascii_case(local) {
        return LatchDecision::Owned { clear_latch: row.marker == LATCH_SET };
    }
    if row.marker == LATCH_SET && waits < max_waits {
        return LatchDecision::AwaitHandoff;
    }
    LatchDecision::Claim
}
