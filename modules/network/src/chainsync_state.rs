//! Server-side chainsync session state: one cursor per downstream client,
//! plus the slot recording which outbound connection currently owns the
//! single upstream chainsync-client role.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dingo_chain::{ChainError, ChainIter, ChainStore};
use dingo_common::{ConnectionId, Point};
use tracing::debug;

/// Cursor state for one downstream chainsync client
pub struct ChainSyncClientState {
    pub cursor: Point,
    pub needs_initial_rollback: bool,
    pub iter: ChainIter,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<ConnectionId, Arc<tokio::sync::Mutex<ChainSyncClientState>>>,
    /// The outbound connection currently running our upstream chainsync
    /// client, if any
    primary_client: Option<ConnectionId>,
}

#[derive(Default)]
pub struct ChainSyncState {
    inner: Mutex<Inner>,
}

impl ChainSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or reposition the cursor for a downstream client. A
    /// repeated registration (a fresh FindIntersect) resets the cursor and
    /// re-arms the initial rollback.
    pub fn add_client(
        &self,
        id: ConnectionId,
        cursor: Point,
        chain: &Arc<ChainStore>,
    ) -> Result<Arc<tokio::sync::Mutex<ChainSyncClientState>>, ChainError> {
        let iter = chain.iterator(cursor)?;
        let state = Arc::new(tokio::sync::Mutex::new(ChainSyncClientState {
            cursor,
            needs_initial_rollback: true,
            iter,
        }));
        let mut inner = self.inner.lock().expect("chainsync state lock poisoned");
        inner.clients.insert(id, state.clone());
        debug!(connection_id = %id, cursor = %cursor, "chainsync client registered");
        Ok(state)
    }

    pub fn get_client(
        &self,
        id: ConnectionId,
    ) -> Option<Arc<tokio::sync::Mutex<ChainSyncClientState>>> {
        let inner = self.inner.lock().expect("chainsync state lock poisoned");
        inner.clients.get(&id).cloned()
    }

    /// Drop a client's cursor state; idempotent
    pub fn remove_client(&self, id: ConnectionId) {
        let mut inner = self.inner.lock().expect("chainsync state lock poisoned");
        inner.clients.remove(&id);
    }

    pub fn client_count(&self) -> usize {
        let inner = self.inner.lock().expect("chainsync state lock poisoned");
        inner.clients.len()
    }

    /// Claim the upstream chainsync-client role. Returns false if another
    /// connection already holds it.
    pub fn claim_primary(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock().expect("chainsync state lock poisoned");
        match inner.primary_client {
            Some(owner) if owner != id => false,
            _ => {
                inner.primary_client = Some(id);
                true
            }
        }
    }

    /// Release the role if `id` holds it; idempotent
    pub fn release_primary(&self, id: ConnectionId) {
        let mut inner = self.inner.lock().expect("chainsync state lock poisoned");
        if inner.primary_client == Some(id) {
            inner.primary_client = None;
        }
    }

    pub fn primary(&self) -> Option<ConnectionId> {
        let inner = self.inner.lock().expect("chainsync state lock poisoned");
        inner.primary_client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_slot_is_exclusive_until_released() {
        let state = ChainSyncState::new();
        let first = ConnectionId(1);
        let second = ConnectionId(2);

        assert!(state.claim_primary(first));
        // Re-claiming by the owner is fine, another connection is refused
        assert!(state.claim_primary(first));
        assert!(!state.claim_primary(second));
        assert_eq!(state.primary(), Some(first));

        // Releasing by a non-owner changes nothing
        state.release_primary(second);
        assert_eq!(state.primary(), Some(first));

        // Once vacant, the next connection may assume the role
        state.release_primary(first);
        assert_eq!(state.primary(), None);
        assert!(state.claim_primary(second));
        assert_eq!(state.primary(), Some(second));
    }
}
