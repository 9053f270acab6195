//! Per-connection lock state machine over the shared five-state arbiter.

use std::sync::Arc;

use ferro_error::Result;
use ferro_types::{ReadLockVariant, WalLockState};
use ferro_vfs::{ShmConnectionId, ShmHandle};

/// Tracks one connection's lock state and drives transitions through the
/// shared arbiter.
///
/// Transitions used by the rest of the module: open -> `Read`; writer
/// begin -> `Read -> Write`; writer end -> `Write -> Read`; close ->
/// `Read -> Unlock`; checkpoint -> `Unlock -> Checkpoint -> Unlock`;
/// recovery -> `Read -> Recover -> Read`.
#[derive(Debug)]
pub(crate) struct LockManager {
    shm: Arc<ShmHandle>,
    conn: ShmConnectionId,
    state: WalLockState,
    read_variant: ReadLockVariant,
}

impl LockManager {
    pub(crate) fn new(shm: Arc<ShmHandle>) -> Self {
        let conn = shm.register();
        Self {
            shm,
            conn,
            state: WalLockState::Unlock,
            read_variant: ReadLockVariant::Full,
        }
    }

    pub(crate) fn state(&self) -> WalLockState {
        self.state
    }

    /// Variant of the most recent `Read` grant.
    pub(crate) fn read_variant(&self) -> ReadLockVariant {
        self.read_variant
    }

    /// Request a transition to `desired`.
    ///
    /// No-op when already in that state. On `Busy` the previous state is
    /// retained.
    pub(crate) fn set(&mut self, desired: WalLockState) -> Result<()> {
        if self.state == desired {
            return Ok(());
        }
        let variant = self.shm.lock(self.conn, desired)?;
        self.state = desired;
        if desired == WalLockState::Read {
            self.read_variant = variant;
        }
        Ok(())
    }

    /// Drop to `Unlock`. Releasing never conflicts, so this cannot fail.
    pub(crate) fn unlock(&mut self) {
        if self.state != WalLockState::Unlock {
            // Unlock transitions are always granted.
            let _ = self.shm.lock(self.conn, WalLockState::Unlock);
            self.state = WalLockState::Unlock;
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shm.deregister(self.conn);
    }
}
