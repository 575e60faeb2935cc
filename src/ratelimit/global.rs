//! Process-wide global rate limit state.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A single deadline that blocks every route while it lies in the future.
#[derive(Debug, Default)]
pub struct GlobalLimitState {
    until: Mutex<Option<Instant>>,
    changed: Notify,
}

impl GlobalLimitState {
    /// Create a state with no active global limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global deadline and wake every waiter so it re-evaluates.
    pub fn set(&self, until: Instant) {
        *self.until.lock() = Some(until);
        self.changed.notify_waiters();
    }

    /// The raw stored deadline, elapsed or not.
    pub fn deadline(&self) -> Option<Instant> {
        *self.until.lock()
    }

    /// The deadline if it is still in the future at `now`.
    pub fn active_at(&self, now: Instant) -> Option<Instant> {
        self.deadline().filter(|until| *until > now)
    }

    /// Notification fired whenever the deadline changes.
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_global_limit_activity() {
        let state = GlobalLimitState::new();
        let now = Instant::now();
        assert_eq!(state.active_at(now), None);

        let until = now + Duration::from_secs(2);
        state.set(until);
        assert_eq!(state.active_at(now), Some(until));
        assert_eq!(state.active_at(until), None);
        assert_eq!(state.deadline(), Some(until));
    }
}
