//! Host scheduling priority while a session is open.
//!
//! Raising the priority shortens the time the host spends away from the serial line,
//! which matters for long transfers at high baud rates. The state is process wide, only
//! one session can hold it at a time.
//!
//! This module only tracks which session holds the request. Changing the operating
//! system priority is left to the front end, which can check [`is_elevated`].

use std::sync::atomic::{AtomicBool, Ordering};

static ELEVATED: AtomicBool = AtomicBool::new(false);

/// Returns `true` while a [`PriorityGuard`] is alive.
pub fn is_elevated() -> bool {
    ELEVATED.load(Ordering::Acquire)
}

/// Holds the raised host priority. The normal priority is restored on drop.
#[derive(Debug)]
pub struct PriorityGuard {
    owner: bool,
}

impl PriorityGuard {
    /// Raises the host priority for the lifetime of the returned guard.
    ///
    /// If another guard already holds the raised priority, the new guard does nothing.
    pub fn acquire() -> Self {
        let owner = ELEVATED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if owner {
            tracing::debug!("Elevated host priority requested");
        }

        Self { owner }
    }
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        if self.owner {
            tracing::debug!("Elevated host priority released");
            ELEVATED.store(false, Ordering::Release);
        }
    }
}

/// Serializes tests that observe the process wide state.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
