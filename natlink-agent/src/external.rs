//! Learned external bindings.
//!
//! Maps a peer's signalled (remote address, port) to the contact address
//! observed on inbound traffic, so other components can reach the peer's
//! real post-NAT address. Lookups vastly outnumber mutations, so entries
//! live behind a read/write lock; the blocking lookup waits on a
//! generation counter + condvar that every upsert bumps, which gives
//! "ask before the traffic has arrived" callers a wakeup without polling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use natlink_core::SocketHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExternalKey {
    socket: SocketHandle,
    remote: SocketAddr,
}

#[derive(Debug, Clone)]
struct ExternalEntry {
    contact: SocketAddr,
    expires_at: Instant,
}

/// Table of learned (remote → contact) mappings with TTL expiry.
pub struct ExternalBindingTable {
    entries: RwLock<HashMap<ExternalKey, ExternalEntry>>,
    generation: Mutex<u64>,
    inserted: Condvar,
    ttl: Duration,
}

impl ExternalBindingTable {
    /// Create an empty table whose entries live for `ttl` per refresh.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            generation: Mutex::new(0),
            inserted: Condvar::new(),
            ttl,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ExternalKey, ExternalEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ExternalKey, ExternalEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_generation(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.inserted.notify_all();
    }

    /// Upsert the contact learned for (`socket`, `remote`), refreshing the
    /// expiration. Wakes any caller blocked in [`find`](Self::find).
    pub fn add(&self, socket: SocketHandle, remote: SocketAddr, contact: SocketAddr) {
        let entry = ExternalEntry { contact, expires_at: Instant::now() + self.ttl };
        self.write().insert(ExternalKey { socket, remote }, entry);
        debug!(%socket, %remote, %contact, "external binding recorded");
        self.bump_generation();
    }

    /// Remove the binding `socket` holds for `remote`.
    ///
    /// With `only_if_last`, the call is a no-op while any other socket
    /// still holds a binding for the same remote endpoint; the mapping is
    /// only dropped together with its last reference.
    pub fn clear(&self, socket: SocketHandle, remote: SocketAddr, only_if_last: bool) -> bool {
        let mut entries = self.write();
        let key = ExternalKey { socket, remote };
        if !entries.contains_key(&key) {
            return false;
        }
        if only_if_last {
            let others = entries
                .keys()
                .filter(|k| k.remote == remote && k.socket != socket)
                .count();
            if others > 0 {
                debug!(%socket, %remote, others, "external binding still referenced; not cleared");
                return false;
            }
        }
        entries.remove(&key).is_some()
    }

    fn lookup(&self, remote: SocketAddr) -> Option<SocketAddr> {
        let now = Instant::now();
        self.read()
            .iter()
            .find(|(key, entry)| key.remote == remote && entry.expires_at > now)
            .map(|(_, entry)| entry.contact)
    }

    /// Look up the contact address for `remote`.
    ///
    /// A zero `timeout` is a non-blocking point lookup. Otherwise the
    /// calling thread blocks until a matching entry appears or the timeout
    /// elapses; a concurrent [`add`](Self::add) for the key wakes it
    /// immediately. Only the caller blocks, never the processor.
    pub fn find(&self, remote: SocketAddr, timeout: Duration) -> Option<SocketAddr> {
        if let Some(contact) = self.lookup(remote) {
            return Some(contact);
        }
        if timeout.is_zero() {
            return None;
        }

        let deadline = std::time::Instant::now() + timeout;
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            // Re-check while holding the generation lock: add() bumps the
            // counter under this lock, so an insert between the initial
            // miss and this point cannot be lost.
            if let Some(contact) = self.lookup(remote) {
                return Some(contact);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let seen = *generation;
            let (guard, wait) = self
                .inserted
                .wait_timeout_while(generation, deadline - now, |g| *g == seen)
                .unwrap_or_else(PoisonError::into_inner);
            generation = guard;
            if wait.timed_out() && *generation == seen {
                return None;
            }
        }
    }

    /// Drop every binding owned by `socket`. Returns how many were removed.
    pub fn remove_socket(&self, socket: SocketHandle) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|key, _| key.socket != socket);
        before - entries.len()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "expired external bindings swept");
        }
        removed
    }

    /// Drop everything and wake any blocked lookups so they re-check.
    pub fn clear_all(&self) {
        self.write().clear();
        self.bump_generation();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
