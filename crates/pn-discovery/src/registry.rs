//! Peer registry — the local view of who else is on the network.
//!
//! A fixed number of slots behind one lock. A slot is either empty or holds
//! the live record for exactly one identity; an identity → slot index makes
//! lookups by identity constant time. New identities take the first empty
//! slot, so scan order is slot order, not arrival order.
//!
//! Every method holds the lock for its whole body and returns detached
//! copies. Nothing here calls back into user code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A peer as last announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Instance identity — the sole dedup key.
    pub id: String,
    /// Service-type tag, e.g. `sdr_server`.
    pub service: String,
    /// Address the peer reported, or the datagram source if it reported none.
    pub ip: String,
    pub ctrl_port: u16,
    /// 0 = no data port.
    pub data_port: u16,
    pub caps: String,
    /// The peer's own send timestamp (unix seconds). Display only.
    pub sent_at: u64,
    /// When the last presence message for this peer arrived here.
    pub last_seen: Instant,
}

/// Fields of one presence message, as applied to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub id: String,
    pub service: String,
    pub ip: String,
    pub ctrl_port: u16,
    pub data_port: u16,
    pub caps: String,
    pub sent_at: u64,
}

impl PeerUpdate {
    pub fn into_record(self, last_seen: Instant) -> PeerRecord {
        PeerRecord {
            id: self.id,
            service: self.service,
            ip: self.ip,
            ctrl_port: self.ctrl_port,
            data_port: self.data_port,
            caps: self.caps,
            sent_at: self.sent_at,
            last_seen,
        }
    }
}

/// Outcome of a successful upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub slot: usize,
    /// True if the identity was not active before this update.
    pub is_new: bool,
    pub last_seen: Instant,
}

struct Slots {
    slots: Vec<Option<PeerRecord>>,
    index: HashMap<String, usize>,
}

/// Bounded peer store. Share it as [`PeerRegistry`].
pub struct Registry {
    inner: Mutex<Slots>,
}

/// The registry shared between the listener, the context and callers.
pub type PeerRegistry = Arc<Registry>;

/// Create an empty registry with `capacity` slots.
pub fn new_registry(capacity: usize) -> PeerRegistry {
    Arc::new(Registry::new(capacity))
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: vec![None; capacity],
                index: HashMap::with_capacity(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Insert a new peer or refresh a known one.
    ///
    /// A known identity is overwritten in place. An unknown one takes the
    /// first empty slot. Returns `None` when the registry is full; the update
    /// is dropped.
    pub fn upsert(&self, update: &PeerUpdate) -> Option<Upserted> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let known = inner.index.get(&update.id).copied();
        let (slot, is_new) = match known {
            Some(slot) => (slot, false),
            None => {
                let slot = inner.slots.iter().position(Option::is_none)?;
                inner.index.insert(update.id.clone(), slot);
                (slot, true)
            }
        };

        inner.slots[slot] = Some(update.clone().into_record(now));
        Some(Upserted {
            slot,
            is_new,
            last_seen: now,
        })
    }

    /// Mark `id` inactive. Returns its last-known record, or `None` if it
    /// was not active.
    pub fn remove(&self, id: &str) -> Option<PeerRecord> {
        let mut inner = self.inner.lock();
        let slot = inner.index.remove(id)?;
        inner.slots[slot].take()
    }

    /// First active peer of `service`, in slot order.
    pub fn find_by_type(&self, service: &str) -> Option<PeerRecord> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .flatten()
            .find(|r| r.service == service)
            .cloned()
    }

    pub fn find_by_id(&self, id: &str) -> Option<PeerRecord> {
        let inner = self.inner.lock();
        let slot = *inner.index.get(id)?;
        inner.slots[slot].clone()
    }

    /// Up to `max` active peers in slot order.
    pub fn snapshot(&self, max: usize) -> Vec<PeerRecord> {
        let inner = self.inner.lock();
        inner.slots.iter().flatten().take(max).cloned().collect()
    }

    /// Number of active peers.
    pub fn count(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Remove every peer not refreshed within `ttl` and return them.
    pub fn expire(&self, ttl: Duration) -> Vec<PeerRecord> {
        self.expire_at(Instant::now(), ttl)
    }

    pub(crate) fn expire_at(&self, now: Instant, ttl: Duration) -> Vec<PeerRecord> {
        let mut inner = self.inner.lock();
        let Slots { slots, index } = &mut *inner;

        let mut expired = Vec::new();
        for slot in slots.iter_mut() {
            let stale = slot
                .as_ref()
                .is_some_and(|r| now.saturating_duration_since(r.last_seen) >= ttl);
            if stale {
                if let Some(record) = slot.take() {
                    index.remove(&record.id);
                    expired.push(record);
                }
            }
        }
        expired
    }
}
