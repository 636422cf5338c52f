//! Bounded set of pending transactions.
//!
//! Entries are keyed by hash and traversed in insertion order so every
//! peer is served fairly. Re-inserting a known hash only refreshes its
//! `last_seen` timestamp. Eviction removes expired entries first and falls
//! back to oldest-first; entries sitting in a peer's unacknowledged
//! delivery window are pinned until that peer acknowledges them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dingo_common::messages::{topics, Event, MempoolAddTransactionEvent};
use dingo_common::{ConnectionId, Era, TxHash};
use dingo_event_bus::EventBus;
use tokio::sync::Notify;
use tracing::debug;

const DEFAULT_MAX_ENTRIES: usize = 1024;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("mempool is full")]
    Full,
}

/// A pending transaction
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub hash: TxHash,
    pub era: Era,
    pub bytes: Vec<u8>,
    pub last_seen: Instant,
}

/// Per-peer delivery window: ids we have announced to that peer but which
/// it has not acknowledged yet, oldest first
#[derive(Debug, Default)]
struct PeerWindow {
    delivered: VecDeque<TxHash>,
    /// Position in the mempool insertion sequence this peer has consumed
    cursor: u64,
}

struct Inner {
    entries: HashMap<TxHash, MempoolEntry>,
    /// Insertion sequence; (sequence number, hash) pairs, oldest first
    order: VecDeque<(u64, TxHash)>,
    next_seq: u64,
    windows: HashMap<ConnectionId, PeerWindow>,
}

impl Inner {
    fn pinned(&self, hash: &TxHash) -> bool {
        self.windows.values().any(|w| w.delivered.contains(hash))
    }
}

pub struct MempoolConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_TTL,
        }
    }
}

pub struct Mempool {
    inner: Mutex<Inner>,
    config: MempoolConfig,
    added: Notify,
    bus: Arc<EventBus<Event>>,
}

impl Mempool {
    pub fn new(config: MempoolConfig, bus: Arc<EventBus<Event>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
                windows: HashMap::new(),
            }),
            config,
            added: Notify::new(),
            bus,
        }
    }

    /// Insert a transaction, refreshing `last_seen` if the hash is already
    /// present
    pub fn add_transaction(&self, hash: TxHash, era: Era, bytes: Vec<u8>) -> Result<(), MempoolError> {
        let mut inner = self.inner.lock().expect("mempool lock poisoned");
        let now = Instant::now();
        if let Some(entry) = inner.entries.get_mut(&hash) {
            entry.last_seen = now;
            debug!(%hash, "refreshed known transaction");
            return Ok(());
        }

        if inner.entries.len() >= self.config.max_entries {
            self.evict(&mut inner, now);
        }
        if inner.entries.len() >= self.config.max_entries {
            return Err(MempoolError::Full);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.push_back((seq, hash));
        inner.entries.insert(
            hash,
            MempoolEntry {
                hash,
                era,
                bytes,
                last_seen: now,
            },
        );
        drop(inner);

        debug!(%hash, "added transaction");
        self.added.notify_waiters();
        self.bus.publish(
            topics::MEMPOOL_ADD_TX,
            Arc::new(Event::MempoolAddTransaction(MempoolAddTransactionEvent {
                hash,
                era,
            })),
        );
        Ok(())
    }

    /// TTL expiry first, then oldest-first while still over the limit.
    /// Pinned entries survive both passes.
    fn evict(&self, inner: &mut Inner, now: Instant) {
        let expired: Vec<TxHash> = inner
            .entries
            .values()
            .filter(|e| now.duration_since(e.last_seen) >= self.config.ttl)
            .map(|e| e.hash)
            .collect();
        for hash in expired {
            if !inner.pinned(&hash) {
                Self::remove_locked(inner, &hash);
            }
        }
        let mut index = 0;
        while inner.entries.len() >= self.config.max_entries && index < inner.order.len() {
            let (_, hash) = inner.order[index];
            if inner.pinned(&hash) {
                index += 1;
                continue;
            }
            Self::remove_locked(inner, &hash);
        }
    }

    fn remove_locked(inner: &mut Inner, hash: &TxHash) {
        inner.entries.remove(hash);
        inner.order.retain(|(_, h)| h != hash);
    }

    /// Drop a transaction that has been consumed into a block
    pub fn remove_transaction(&self, hash: &TxHash) {
        let mut inner = self.inner.lock().expect("mempool lock poisoned");
        Self::remove_locked(&mut inner, hash);
        for window in inner.windows.values_mut() {
            window.delivered.retain(|h| h != hash);
        }
    }

    pub fn get(&self, hash: &TxHash) -> Option<MempoolEntry> {
        let inner = self.inner.lock().expect("mempool lock poisoned");
        inner.entries.get(hash).cloned()
    }

    /// Snapshot in insertion order
    pub fn transactions(&self) -> Vec<MempoolEntry> {
        let inner = self.inner.lock().expect("mempool lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|(_, hash)| inner.entries.get(hash))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("mempool lock poisoned");
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await the next added transaction
    pub async fn wait_for_transaction(&self) {
        self.added.notified().await;
    }

    // -- Per-peer delivery windows --

    pub fn register_peer(&self, id: ConnectionId) {
        let mut inner = self.inner.lock().expect("mempool lock poisoned");
        inner.windows.entry(id).or_default();
    }

    /// Release a peer's window, unpinning everything it had not
    /// acknowledged
    pub fn unregister_peer(&self, id: ConnectionId) {
        let mut inner = self.inner.lock().expect("mempool lock poisoned");
        inner.windows.remove(&id);
    }

    /// Next transactions to announce to `id`, up to `count`, in insertion
    /// order. The returned entries move into the peer's unacknowledged
    /// window and become pinned.
    pub fn deliver_ids(&self, id: ConnectionId, count: usize) -> Vec<MempoolEntry> {
        let mut inner = self.inner.lock().expect("mempool lock poisoned");
        let window = inner.windows.entry(id).or_default();
        let cursor = window.cursor;
        let picked: Vec<(u64, TxHash)> = inner
            .order
            .iter()
            .filter(|(seq, _)| *seq >= cursor)
            .take(count)
            .copied()
            .collect();
        let mut delivered = vec![];
        for (seq, hash) in picked {
            let Some(entry) = inner.entries.get(&hash).cloned() else {
                continue;
            };
            let window = inner.windows.get_mut(&id).expect("window registered");
            window.delivered.push_back(hash);
            window.cursor = seq + 1;
            delivered.push(entry);
        }
        delivered
    }

    /// The peer acknowledged `count` previously delivered transactions
    pub fn acknowledge(&self, id: ConnectionId, count: usize) {
        let mut inner = self.inner.lock().expect("mempool lock poisoned");
        let Some(window) = inner.windows.get_mut(&id) else {
            return;
        };
        for _ in 0..count {
            if window.delivered.pop_front().is_none() {
                break;
            }
        }
    }

    /// Body of a transaction sitting in the peer's window; `None` once it
    /// has been evicted or consumed
    pub fn window_tx(&self, id: ConnectionId, hash: &TxHash) -> Option<MempoolEntry> {
        let inner = self.inner.lock().expect("mempool lock poisoned");
        let window = inner.windows.get(&id)?;
        if !window.delivered.contains(hash) {
            return None;
        }
        inner.entries.get(hash).cloned()
    }
}
