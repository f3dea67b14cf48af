use log::debug;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct ThrottleState {
    waiters: usize,
    engaged: bool,
}

/// Holds writers back while too many callers are queued to flush.
///
/// Each flush caller registers for the duration of its flush. When the
/// count reaches the threshold the throttle engages and writers wait until
/// the last registered flusher has left.
#[derive(Debug)]
pub struct Throttle {
    threshold: usize,
    state: Mutex<ThrottleState>,
    released: Condvar,
}

impl Throttle {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            state: Mutex::new(ThrottleState::default()),
            released: Condvar::new(),
        }
    }

    /// Blocks the calling writer while the throttle is engaged.
    pub fn wait_if_engaged(&self) {
        let mut state = self.state.lock();
        while state.engaged {
            self.released.wait(&mut state);
        }
    }

    /// Registers a flush caller until the guard is dropped.
    pub fn enter(&self) -> ThrottleGuard<'_> {
        let mut state = self.state.lock();
        state.waiters += 1;
        if state.waiters >= self.threshold && !state.engaged {
            debug!("{} callers waiting to flush, throttling writers", state.waiters);
            state.engaged = true;
        }
        ThrottleGuard { throttle: self }
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
        if state.waiters == 0 && state.engaged {
            debug!("Flush queue drained, releasing writers");
            state.engaged = false;
            self.released.notify_all();
        }
    }

    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    pub fn is_engaged(&self) -> bool {
        self.state.lock().engaged
    }
}

#[must_use]
pub struct ThrottleGuard<'a> {
    throttle: &'a Throttle,
}

impl Drop for ThrottleGuard<'_> {
    fn drop(&mut self) {
        self.throttle.leave();
    }
}
