//! Shared state between the namespace controller and the control loop.
//!
//! The namespace controller watches namespace events and flags when a
//! dynamic namespace selector may now match a different set of namespaces.
//! The control loop polls the flag on its namespace-resync events.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct NamespaceControllerState {
    sync_pending: AtomicBool,
}

impl NamespaceControllerState {
    /// Called by the namespace controller when a namespace event requires a
    /// re-sync.
    pub fn request_sync(&self) {
        self.sync_pending.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending sync request. Returns false if none is pending.
    pub fn schedule_sync(&self) -> bool {
        self.sync_pending.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_requests_are_consumed_once() {
        let state = NamespaceControllerState::default();
        assert!(!state.schedule_sync());

        state.request_sync();
        assert!(state.schedule_sync());
        assert!(!state.schedule_sync());
    }
}
