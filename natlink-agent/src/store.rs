//! Binding context store.
//!
//! Single source of truth for every in-flight and steady-state binding.
//! Contexts are keyed by (socket, kind, destination); a transaction-id
//! index routes inbound responses back to their context, including ids
//! that have already been superseded so late duplicates can be recognized
//! and discarded instead of reported as unmatched.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

use natlink_core::{SocketHandle, TransactionId};

use crate::context::{BindingContext, BindingKind, BindingStatus};

/// Identity of one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingKey {
    /// Owning socket.
    pub socket: SocketHandle,
    /// Binding kind.
    pub kind: BindingKind,
    /// Destination of the protocol exchange.
    pub remote: SocketAddr,
}

/// Outcome of inserting a context.
#[derive(Debug)]
pub enum InsertOutcome {
    /// The context was stored.
    Inserted,
    /// A terminal context at the same key was replaced; the old context is
    /// returned so its timer can be reaped.
    Replaced(BindingContext),
    /// A live context already covers this key (or kind, for singletons).
    Rejected,
}

/// Mapping from binding identity (and transaction id) to mutable state.
pub struct BindingStore {
    contexts: HashMap<BindingKey, BindingContext>,
    by_transaction: HashMap<TransactionId, BindingKey>,
}

impl BindingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self { contexts: HashMap::new(), by_transaction: HashMap::new() }
    }

    /// Insert a freshly created context.
    ///
    /// StunDiscovery and TurnAllocation are singletons per socket: a second
    /// enable is rejected outright and the caller must disable first.
    /// Probes and keepalives are keyed by destination; a live context at
    /// the same key rejects the insert, a terminal one is replaced.
    pub fn insert(&mut self, key: BindingKey, ctx: BindingContext) -> InsertOutcome {
        let replaced = match key.kind {
            BindingKind::StunDiscovery | BindingKind::TurnAllocation => {
                if self.contains_kind(key.socket, key.kind) {
                    debug!(socket = %key.socket, kind = ?key.kind, "duplicate binding rejected");
                    return InsertOutcome::Rejected;
                }
                None
            }
            _ => match self.contexts.get(&key) {
                Some(existing) => {
                    // A keepalive stays live between rounds (Success), so
                    // only a Failed one may be replaced; a probe is done
                    // once it reaches either terminal status.
                    let replaceable = if existing.kind.is_keepalive() {
                        existing.status == BindingStatus::Failed
                    } else {
                        !existing.is_outstanding()
                    };
                    if !replaceable {
                        debug!(socket = %key.socket, kind = ?key.kind, remote = %key.remote, "duplicate binding rejected");
                        return InsertOutcome::Rejected;
                    }
                    self.remove(&key)
                }
                None => None,
            },
        };

        if key.kind.uses_transactions() {
            self.by_transaction.insert(ctx.transactions.current(), key);
        }
        self.contexts.insert(key, ctx);

        match replaced {
            Some(old) => InsertOutcome::Replaced(old),
            None => InsertOutcome::Inserted,
        }
    }

    /// Shared access to a context.
    pub fn get(&self, key: &BindingKey) -> Option<&BindingContext> {
        self.contexts.get(key)
    }

    /// Exclusive access to a context.
    pub fn get_mut(&mut self, key: &BindingKey) -> Option<&mut BindingContext> {
        self.contexts.get_mut(key)
    }

    /// The singleton context of `kind` on `socket`, if any.
    pub fn get_kind(&self, socket: SocketHandle, kind: BindingKind) -> Option<(&BindingKey, &BindingContext)> {
        self.contexts
            .iter()
            .find(|(k, _)| k.socket == socket && k.kind == kind)
    }

    /// Whether any context of `kind` exists on `socket`.
    pub fn contains_kind(&self, socket: SocketHandle, kind: BindingKind) -> bool {
        self.get_kind(socket, kind).is_some()
    }

    /// Current transaction id of a context.
    pub fn current_transaction(&self, key: &BindingKey) -> Option<TransactionId> {
        self.contexts.get(key).map(|ctx| ctx.transactions.current())
    }

    /// Rotate a context's transaction id, keeping the routing index in
    /// sync: the fresh id is registered, an evicted historical id is
    /// dropped, and the superseded id stays routable for stale-response
    /// detection.
    pub fn rotate_transaction(&mut self, key: &BindingKey) -> Option<TransactionId> {
        let ctx = self.contexts.get_mut(key)?;
        let (fresh, evicted) = ctx.transactions.rotate();
        self.by_transaction.insert(fresh, *key);
        if let Some(old) = evicted {
            self.by_transaction.remove(&old);
        }
        Some(fresh)
    }

    /// Route a transaction id to its binding. The flag reports whether the
    /// id is the live one; a `false` means a superseded attempt.
    pub fn find_by_transaction(&self, id: &TransactionId) -> Option<(BindingKey, bool)> {
        let key = self.by_transaction.get(id)?;
        let ctx = self.contexts.get(key)?;
        Some((*key, ctx.transactions.is_current(id)))
    }

    /// Remove a context, deregistering every transaction id it answers
    /// for. The context is returned so the caller can reap its timer and
    /// notify its listener.
    pub fn remove(&mut self, key: &BindingKey) -> Option<BindingContext> {
        let ctx = self.contexts.remove(key)?;
        for id in ctx.transactions.all_ids() {
            self.by_transaction.remove(&id);
        }
        Some(ctx)
    }

    /// Remove the singleton context of `kind` on `socket`.
    pub fn remove_kind(
        &mut self,
        socket: SocketHandle,
        kind: BindingKind,
    ) -> Option<(BindingKey, BindingContext)> {
        let key = *self.get_kind(socket, kind)?.0;
        self.remove(&key).map(|ctx| (key, ctx))
    }

    /// Remove every context owned by `socket`, optionally filtered by a
    /// kind predicate. Used on socket teardown and bulk keepalive removal.
    pub fn remove_socket_where(
        &mut self,
        socket: SocketHandle,
        mut keep_kind: impl FnMut(BindingKind) -> bool,
    ) -> Vec<(BindingKey, BindingContext)> {
        let keys: Vec<BindingKey> = self
            .contexts
            .keys()
            .filter(|k| k.socket == socket && keep_kind(k.kind))
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.remove(&key).map(|ctx| (key, ctx)))
            .collect()
    }

    /// Whether any probe of at least `min_priority` is still awaiting a
    /// verdict on `socket`.
    pub fn probes_outstanding(&self, socket: SocketHandle, min_priority: u32) -> bool {
        self.contexts.iter().any(|(key, ctx)| {
            key.socket == socket
                && key.kind == BindingKind::StunProbe
                && ctx.priority >= min_priority
                && ctx.is_outstanding()
        })
    }

    /// Drain every context, e.g. at shutdown.
    pub fn drain(&mut self) -> Vec<(BindingKey, BindingContext)> {
        self.by_transaction.clear();
        self.contexts.drain().collect()
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether the store holds no contexts.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl Default for BindingStore {
    fn default() -> Self {
        Self::new()
    }
}
