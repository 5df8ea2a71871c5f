//! Per-binding mutable state.
//!
//! One [`BindingContext`] exists per STUN discovery, STUN probe, TURN
//! allocation, or keepalive registration. The processor task is the only
//! mutator once a context is started; manipulator threads only create,
//! remove, and snapshot contexts under the store lock.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use natlink_core::{AgentConfig, SocketHandle, TransactionId};

use crate::codec::{StunOptions, TurnAuth};
use crate::keepalive::KeepaliveListener;
use crate::timer::TimerKey;

/// What a binding is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Discover this socket's NAT mapping via a STUN server.
    StunDiscovery,
    /// Priority-tagged STUN attempt racing candidate paths.
    StunProbe,
    /// TURN relay allocation with periodic refresh.
    TurnAllocation,
    /// Transport-level CRLF ping on a fixed cadence.
    CrlfKeepalive,
    /// STUN request rounds on a fixed cadence.
    StunKeepalive,
}

impl BindingKind {
    /// Whether this kind registers transaction ids for response routing.
    pub fn uses_transactions(self) -> bool {
        !matches!(self, BindingKind::CrlfKeepalive)
    }

    /// Whether this kind is a keepalive registration.
    pub fn is_keepalive(self) -> bool {
        matches!(self, BindingKind::CrlfKeepalive | BindingKind::StunKeepalive)
    }
}

/// Transaction lifecycle status of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
    /// First attempt of a round is in flight.
    Sending,
    /// First attempt hit a local send error; retried on timeout.
    SendingError,
    /// A retransmission is in flight.
    Resending,
    /// A retransmission hit a local send error; retried on timeout.
    ResendingError,
    /// The last round completed.
    Success,
    /// The attempt ceiling was exhausted; terminal.
    Failed,
}

impl BindingStatus {
    /// Whether a response is still owed for the current round.
    pub fn is_outstanding(self) -> bool {
        !matches!(self, BindingStatus::Success | BindingStatus::Failed)
    }
}

const TRANSACTION_HISTORY_DEPTH: usize = 3;

/// Current transaction id plus a bounded ring of superseded ids.
///
/// Superseded ids are kept only so a late or duplicate response to an
/// earlier attempt is recognized and discarded instead of being treated as
/// an unmatched message; they are never used to schedule new work.
#[derive(Debug, Clone)]
pub struct TransactionHistory {
    current: TransactionId,
    prior: VecDeque<TransactionId>,
}

impl TransactionHistory {
    /// Start a history with a fresh current id and no priors.
    pub fn new() -> Self {
        Self {
            current: TransactionId::generate(),
            prior: VecDeque::with_capacity(TRANSACTION_HISTORY_DEPTH),
        }
    }

    /// The id the next response must carry to be acted on.
    pub fn current(&self) -> TransactionId {
        self.current
    }

    /// Supersede the current id with a fresh one.
    ///
    /// The old id joins the ring; when the ring is full the oldest entry is
    /// evicted and returned so the caller can drop it from any index.
    pub fn rotate(&mut self) -> (TransactionId, Option<TransactionId>) {
        let evicted = if self.prior.len() == TRANSACTION_HISTORY_DEPTH {
            self.prior.pop_front()
        } else {
            None
        };
        self.prior.push_back(self.current);
        self.current = TransactionId::generate();
        (self.current, evicted)
    }

    /// Whether `id` is the live transaction.
    pub fn is_current(&self, id: &TransactionId) -> bool {
        self.current == *id
    }

    /// All ids this history answers for, current first.
    pub fn all_ids(&self) -> impl Iterator<Item = TransactionId> + '_ {
        std::iter::once(self.current).chain(self.prior.iter().copied())
    }
}

impl Default for TransactionHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable state of one NAT binding.
pub struct BindingContext {
    /// What this binding is for.
    pub kind: BindingKind,
    /// Transaction lifecycle status.
    pub status: BindingStatus,
    /// Owning socket, as a non-owning handle.
    pub socket: SocketHandle,
    /// Destination of the protocol exchange.
    pub remote: SocketAddr,
    /// Discovery request options.
    pub options: StunOptions,
    /// Live and superseded transaction ids.
    pub transactions: TransactionHistory,
    /// The single outstanding timer, while one is scheduled.
    pub timer: Option<TimerKey>,
    /// Cadence for keepalive rounds or discovery refresh.
    pub keepalive_interval: Option<Duration>,
    /// Sends issued in the current round.
    pub abort_count: u32,
    /// TURN refresh attempts that went unanswered.
    pub refresh_error_count: u32,
    /// Server-reflexive address learned on success.
    pub mapped: Option<SocketAddr>,
    /// Relayed address granted by a TURN allocation.
    pub relay: Option<SocketAddr>,
    /// Requested, then granted, TURN allocation lifetime in seconds.
    pub lifetime: u32,
    /// TURN account username.
    pub username: Option<String>,
    /// TURN account password.
    pub password: Option<String>,
    /// Realm learned from a TURN authentication challenge.
    pub realm: Option<String>,
    /// Nonce learned from a TURN authentication challenge.
    pub nonce: Option<String>,
    /// Probe priority for racing comparisons.
    pub priority: u32,
    /// Whether the current TURN round is a refresh of a live allocation.
    pub refreshing: bool,
    /// Callback target for keepalive lifecycle events.
    pub listener: Option<Arc<dyn KeepaliveListener>>,
}

impl BindingContext {
    fn new(kind: BindingKind, socket: SocketHandle, remote: SocketAddr) -> Self {
        Self {
            kind,
            status: BindingStatus::Sending,
            socket,
            remote,
            options: StunOptions::default(),
            transactions: TransactionHistory::new(),
            timer: None,
            keepalive_interval: None,
            abort_count: 0,
            refresh_error_count: 0,
            mapped: None,
            relay: None,
            lifetime: 0,
            username: None,
            password: None,
            realm: None,
            nonce: None,
            priority: 0,
            refreshing: false,
            listener: None,
        }
    }

    /// Context for STUN discovery against `server`.
    pub fn discovery(
        socket: SocketHandle,
        server: SocketAddr,
        options: StunOptions,
        keepalive_interval: Option<Duration>,
    ) -> Self {
        Self {
            options,
            keepalive_interval,
            ..Self::new(BindingKind::StunDiscovery, socket, server)
        }
    }

    /// Context for a priority-tagged probe towards `dest`.
    pub fn probe(socket: SocketHandle, dest: SocketAddr, priority: u32) -> Self {
        Self { priority, ..Self::new(BindingKind::StunProbe, socket, dest) }
    }

    /// Context for a TURN allocation against `server`.
    pub fn turn(
        socket: SocketHandle,
        server: SocketAddr,
        keepalive_interval: Option<Duration>,
        username: String,
        password: String,
        lifetime: u32,
    ) -> Self {
        Self {
            keepalive_interval,
            username: Some(username),
            password: Some(password),
            lifetime,
            ..Self::new(BindingKind::TurnAllocation, socket, server)
        }
    }

    /// Context for a keepalive registration towards `dest`.
    pub fn keepalive(
        kind: BindingKind,
        socket: SocketHandle,
        dest: SocketAddr,
        interval: Duration,
        listener: Option<Arc<dyn KeepaliveListener>>,
    ) -> Self {
        debug_assert!(kind.is_keepalive());
        Self {
            keepalive_interval: Some(interval),
            listener,
            ..Self::new(kind, socket, dest)
        }
    }

    /// Attempt ceiling for this binding's kind.
    pub fn max_attempts(&self, config: &AgentConfig) -> u32 {
        match self.kind {
            BindingKind::StunProbe => config.probe_max_attempts,
            _ => config.discovery_max_attempts,
        }
    }

    /// Reset per-round attempt accounting at the start of a round.
    pub fn begin_round(&mut self) {
        self.abort_count = 0;
    }

    /// Whether a response is still owed for this binding.
    pub fn is_outstanding(&self) -> bool {
        self.status.is_outstanding()
    }

    /// Whether this binding schedules further rounds after a success.
    pub fn has_cadence(&self) -> bool {
        match self.kind {
            BindingKind::TurnAllocation => true,
            BindingKind::CrlfKeepalive | BindingKind::StunKeepalive => true,
            BindingKind::StunDiscovery => self.keepalive_interval.is_some(),
            BindingKind::StunProbe => false,
        }
    }

    /// TURN credentials once a challenge has been answered.
    pub fn turn_auth(&self) -> Option<TurnAuth<'_>> {
        match (&self.username, &self.password, &self.realm, &self.nonce) {
            (Some(username), Some(password), Some(realm), Some(nonce)) => Some(TurnAuth {
                username,
                password,
                realm,
                nonce,
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for BindingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingContext")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("socket", &self.socket)
            .field("remote", &self.remote)
            .field("abort_count", &self.abort_count)
            .field("mapped", &self.mapped)
            .field("relay", &self.relay)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
