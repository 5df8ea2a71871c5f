//! The NAT binding agent: public API and processor task.
//!
//! ## Architecture
//! ```text
//! caller threads                      processor task
//! ─────────────────                   ────────────────────────────
//! NatAgent::enable_stun ──┐
//! NatAgent::send_probe  ──┤ command   ┌─ drain due timers (biased)
//! inbound message events ─┼──queue───▶│  handle one command
//! NatAgent::synchronize ──┘           └─ mutate store / arm timers
//!                                          │
//!                        Transport::send_to◀┘
//! ```
//!
//! One tokio task serializes every mutation of binding state and timers.
//! Manipulator calls take effect in two steps: the context is inserted or
//! removed synchronously under the store lock (so duplicate-enable checks
//! and probe queries answer immediately), and the protocol work is
//! enqueued for the processor. `synchronize()` is the barrier that makes
//! the asynchronous half observable.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use natlink_core::{AgentConfig, SocketHandle, TransactionId};

use crate::codec::{self, CodecResult, MessageClass, ParsedMessage, StunOptions};
use crate::context::{BindingContext, BindingKind, BindingStatus};
use crate::external::ExternalBindingTable;
use crate::keepalive::{KeepaliveEvent, KeepaliveListener};
use crate::store::{BindingKey, BindingStore, InsertOutcome};
use crate::timer::{TimerEvent, TimerKey, TimerPool, TimerPurpose};
use crate::transport::{resolve_host_port, Transport};

/// Work items drained by the processor task.
enum Command {
    /// Drive a freshly inserted binding.
    Start(BindingKey),
    /// Inbound pre-decoded protocol message.
    Inbound { socket: SocketHandle, message: ParsedMessage },
    /// Cancel timers whose contexts were removed by a manipulator.
    ReapTimers(Vec<TimerKey>),
    /// Deliver a listener event from the processor task.
    Notify { listener: Arc<dyn KeepaliveListener>, event: KeepaliveEvent },
    /// Rendezvous barrier; acked once everything enqueued before it ran.
    Barrier(oneshot::Sender<()>),
    /// Tear everything down deterministically.
    Shutdown(oneshot::Sender<()>),
}

/// Read-only view of one binding's state, for callers and tests.
#[derive(Debug, Clone)]
pub struct BindingSnapshot {
    /// Binding kind.
    pub kind: BindingKind,
    /// Transaction lifecycle status.
    pub status: BindingStatus,
    /// Destination of the protocol exchange.
    pub remote: SocketAddr,
    /// Learned server-reflexive address.
    pub mapped: Option<SocketAddr>,
    /// Learned TURN relay address.
    pub relay: Option<SocketAddr>,
    /// Sends issued in the current round.
    pub abort_count: u32,
    /// Unanswered TURN refresh attempts.
    pub refresh_error_count: u32,
    /// Probe priority.
    pub priority: u32,
    /// Whether a timer is currently scheduled for this binding.
    pub has_timer: bool,
    /// Live transaction id.
    pub transaction_id: TransactionId,
}

impl BindingSnapshot {
    fn of(ctx: &BindingContext) -> Self {
        Self {
            kind: ctx.kind,
            status: ctx.status,
            remote: ctx.remote,
            mapped: ctx.mapped,
            relay: ctx.relay,
            abort_count: ctx.abort_count,
            refresh_error_count: ctx.refresh_error_count,
            priority: ctx.priority,
            has_timer: ctx.timer.is_some(),
            transaction_id: ctx.transactions.current(),
        }
    }
}

/// Thread-safe handle to the binding agent.
///
/// Cheap to clone; all clones talk to the same processor task. Must be
/// created from within a tokio runtime (the processor is spawned onto it).
#[derive(Clone)]
pub struct NatAgent {
    tx: mpsc::UnboundedSender<Command>,
    bindings: Arc<Mutex<BindingStore>>,
    externals: Arc<ExternalBindingTable>,
    config: AgentConfig,
}

impl NatAgent {
    /// Spawn a processor task and return the handle callers use.
    pub fn spawn(transport: Arc<dyn Transport>, config: AgentConfig) -> Self {
        let bindings = Arc::new(Mutex::new(BindingStore::new()));
        let externals = Arc::new(ExternalBindingTable::new(config.external_binding_ttl()));
        let (tx, rx) = mpsc::unbounded_channel();

        let processor = Processor {
            rx,
            bindings: Arc::clone(&bindings),
            externals: Arc::clone(&externals),
            transport,
            config: config.clone(),
            timers: TimerPool::new(),
        };
        tokio::spawn(processor.run());
        info!("nat agent started");

        Self { tx, bindings, externals, config }
    }

    fn store(&self) -> MutexGuard<'_, BindingStore> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Insert a context and hand it to the processor; unwinds the insert
    /// if the processor is gone.
    fn start_binding(&self, key: BindingKey, ctx: BindingContext) -> bool {
        match self.store().insert(key, ctx) {
            InsertOutcome::Rejected => return false,
            InsertOutcome::Replaced(old) => self.reap(&old),
            InsertOutcome::Inserted => {}
        }
        if !self.submit(Command::Start(key)) {
            self.store().remove(&key);
            return false;
        }
        true
    }

    /// Reap the processor-side leftovers of a removed context.
    fn reap(&self, ctx: &BindingContext) {
        if let Some(timer) = ctx.timer {
            let _ = self.tx.send(Command::ReapTimers(vec![timer]));
        }
    }

    fn reap_and_notify_stopped(&self, key: &BindingKey, ctx: &BindingContext) {
        self.reap(ctx);
        if let Some(listener) = &ctx.listener {
            let _ = self.tx.send(Command::Notify {
                listener: Arc::clone(listener),
                event: KeepaliveEvent::Stopped {
                    socket: key.socket,
                    kind: key.kind,
                    remote: key.remote,
                },
            });
        }
    }

    // ------------------------------------------------------------------
    // STUN discovery
    // ------------------------------------------------------------------

    /// Enable STUN binding discovery on `socket` against `server`.
    ///
    /// With `keepalive_secs > 0` the discovery re-runs on that cadence to
    /// keep the NAT mapping fresh. Returns `false` if discovery is already
    /// active on the socket (disable first) or the agent is shut down.
    pub fn enable_stun(
        &self,
        socket: SocketHandle,
        server: SocketAddr,
        options: StunOptions,
        keepalive_secs: u32,
    ) -> bool {
        let key = BindingKey { socket, kind: BindingKind::StunDiscovery, remote: server };
        let ctx = BindingContext::discovery(socket, server, options, interval(keepalive_secs));
        let accepted = self.start_binding(key, ctx);
        if !accepted {
            warn!(%socket, %server, "enable_stun rejected");
        }
        accepted
    }

    /// Disable STUN discovery on `socket`. Returns whether it was active.
    pub fn disable_stun(&self, socket: SocketHandle) -> bool {
        self.remove_singleton(socket, BindingKind::StunDiscovery)
    }

    /// Learned server-reflexive address of `socket`, if discovery
    /// succeeded.
    pub fn mapped_address(&self, socket: SocketHandle) -> Option<SocketAddr> {
        self.store().get_kind(socket, BindingKind::StunDiscovery)?.1.mapped
    }

    // ------------------------------------------------------------------
    // TURN allocation
    // ------------------------------------------------------------------

    /// Enable a TURN relay allocation on `socket` against `server`.
    ///
    /// Returns `false` if an allocation is already active on the socket.
    pub fn enable_turn(
        &self,
        socket: SocketHandle,
        server: SocketAddr,
        keepalive_secs: u32,
        username: &str,
        password: &str,
    ) -> bool {
        let key = BindingKey { socket, kind: BindingKind::TurnAllocation, remote: server };
        let ctx = BindingContext::turn(
            socket,
            server,
            interval(keepalive_secs),
            username.to_owned(),
            password.to_owned(),
            self.config.turn_lifetime_secs,
        );
        let accepted = self.start_binding(key, ctx);
        if !accepted {
            warn!(%socket, %server, "enable_turn rejected");
        }
        accepted
    }

    /// Disable the TURN allocation on `socket`. Returns whether it was
    /// active.
    pub fn disable_turn(&self, socket: SocketHandle) -> bool {
        self.remove_singleton(socket, BindingKind::TurnAllocation)
    }

    /// Learned relay address of `socket`, if an allocation is live.
    pub fn relay_address(&self, socket: SocketHandle) -> Option<SocketAddr> {
        self.store().get_kind(socket, BindingKind::TurnAllocation)?.1.relay
    }

    // ------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------

    /// Race a priority-tagged STUN probe from `socket` towards `dest`.
    ///
    /// Returns `false` while a probe to the same destination is still
    /// outstanding.
    pub fn send_stun_probe(&self, socket: SocketHandle, dest: SocketAddr, priority: u32) -> bool {
        let key = BindingKey { socket, kind: BindingKind::StunProbe, remote: dest };
        self.start_binding(key, BindingContext::probe(socket, dest, priority))
    }

    /// Whether probes of priority ≥ `min_priority` are still awaiting a
    /// verdict on `socket`. Used to hold off committing to a
    /// lower-priority candidate while a better one might still win.
    pub fn are_probes_outstanding(&self, socket: SocketHandle, min_priority: u32) -> bool {
        self.store().probes_outstanding(socket, min_priority)
    }

    // ------------------------------------------------------------------
    // Keepalives
    // ------------------------------------------------------------------

    /// Register a CRLF transport keepalive towards `dest`.
    pub fn add_crlf_keepalive(
        &self,
        socket: SocketHandle,
        dest: SocketAddr,
        interval_secs: u32,
        listener: Option<Arc<dyn KeepaliveListener>>,
    ) -> bool {
        self.add_keepalive(BindingKind::CrlfKeepalive, socket, dest, interval_secs, listener)
    }

    /// Register a STUN keepalive towards `dest`.
    pub fn add_stun_keepalive(
        &self,
        socket: SocketHandle,
        dest: SocketAddr,
        interval_secs: u32,
        listener: Option<Arc<dyn KeepaliveListener>>,
    ) -> bool {
        self.add_keepalive(BindingKind::StunKeepalive, socket, dest, interval_secs, listener)
    }

    fn add_keepalive(
        &self,
        kind: BindingKind,
        socket: SocketHandle,
        dest: SocketAddr,
        interval_secs: u32,
        listener: Option<Arc<dyn KeepaliveListener>>,
    ) -> bool {
        let Some(interval) = interval(interval_secs) else {
            warn!(%socket, %dest, "keepalive interval must be positive");
            return false;
        };
        let key = BindingKey { socket, kind, remote: dest };
        self.start_binding(key, BindingContext::keepalive(kind, socket, dest, interval, listener))
    }

    /// Remove the CRLF keepalive towards `dest`, if registered.
    pub fn remove_crlf_keepalive(&self, socket: SocketHandle, dest: SocketAddr) -> bool {
        self.remove_exact(BindingKey { socket, kind: BindingKind::CrlfKeepalive, remote: dest })
    }

    /// Remove the STUN keepalive towards `dest`, if registered.
    pub fn remove_stun_keepalive(&self, socket: SocketHandle, dest: SocketAddr) -> bool {
        self.remove_exact(BindingKey { socket, kind: BindingKind::StunKeepalive, remote: dest })
    }

    /// Remove every keepalive registered on `socket`, e.g. on teardown.
    /// Safe to call when none are registered; returns how many were
    /// removed.
    pub fn remove_keepalives(&self, socket: SocketHandle) -> usize {
        let removed = self.store().remove_socket_where(socket, BindingKind::is_keepalive);
        for (key, ctx) in &removed {
            self.reap_and_notify_stopped(key, ctx);
        }
        removed.len()
    }

    // ------------------------------------------------------------------
    // External bindings
    // ------------------------------------------------------------------

    /// Record the contact address observed for (`socket`, `remote`).
    pub fn add_external_binding(
        &self,
        socket: SocketHandle,
        remote: SocketAddr,
        contact: SocketAddr,
    ) {
        self.externals.add(socket, remote, contact);
    }

    /// Look up the real contact address for a peer known as `host:port`.
    ///
    /// A zero timeout is a point lookup. A positive timeout blocks the
    /// calling thread until the entry appears (e.g. a probe in flight
    /// populates it) or the deadline passes.
    pub fn find_external_binding(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Option<(IpAddr, u16)> {
        let remote = match resolve_host_port(host, port) {
            Ok(addr) => addr,
            Err(e) => {
                debug!(host, port, error = %e, "external binding lookup for unresolvable peer");
                return None;
            }
        };
        self.externals.find(remote, timeout).map(|contact| (contact.ip(), contact.port()))
    }

    /// Clear the external binding `socket` holds for `remote`. With
    /// `only_if_last`, a no-op while other sockets still reference the
    /// same remote endpoint.
    pub fn clear_external_binding(
        &self,
        socket: SocketHandle,
        remote: SocketAddr,
        only_if_last: bool,
    ) -> bool {
        self.externals.clear(socket, remote, only_if_last)
    }

    // ------------------------------------------------------------------
    // Socket lifecycle, inbound events, synchronization
    // ------------------------------------------------------------------

    /// Remove every binding and external entry owned by `socket`.
    ///
    /// Call when the socket is torn down so nothing keeps referring to a
    /// dead handle.
    pub fn socket_closed(&self, socket: SocketHandle) {
        let removed = self.store().remove_socket_where(socket, |_| true);
        for (key, ctx) in &removed {
            if key.kind.is_keepalive() {
                self.reap_and_notify_stopped(key, ctx);
            } else {
                self.reap(ctx);
            }
        }
        let externals = self.externals.remove_socket(socket);
        if !removed.is_empty() || externals > 0 {
            debug!(%socket, bindings = removed.len(), externals, "socket bindings removed");
        }
    }

    /// Feed a pre-decoded inbound message to the processor.
    pub fn handle_inbound_message(&self, socket: SocketHandle, message: ParsedMessage) {
        let _ = self.submit(Command::Inbound { socket, message });
    }

    /// Decode and feed a raw inbound datagram. Returns whether it parsed
    /// as a STUN/TURN message; CRLF keepalive echoes and garbage are
    /// dropped here.
    pub fn handle_datagram(&self, socket: SocketHandle, data: &[u8], from: SocketAddr) -> bool {
        if data == codec::CRLF_KEEPALIVE {
            trace!(%socket, %from, "crlf echo ignored");
            return false;
        }
        match ParsedMessage::from_bytes(data) {
            Ok(message) => {
                self.handle_inbound_message(socket, message);
                true
            }
            Err(e) => {
                debug!(%socket, %from, error = %e, "undecodable datagram dropped");
                false
            }
        }
    }

    /// Block the calling thread until every request enqueued before this
    /// call has taken effect.
    ///
    /// Must not be called from the processor's own runtime context (a
    /// listener callback, or any task on the same runtime): the blocking
    /// receive panics there by design rather than deadlocking silently.
    pub fn synchronize(&self) {
        let (ack, done) = oneshot::channel();
        if self.submit(Command::Barrier(ack)) {
            let _ = done.blocking_recv();
        }
    }

    /// Async variant of [`synchronize`](Self::synchronize) for callers
    /// already running on the runtime.
    pub async fn synchronize_async(&self) {
        let (ack, done) = oneshot::channel();
        if self.submit(Command::Barrier(ack)) {
            let _ = done.await;
        }
    }

    /// Shut the processor down, cancelling all timers and releasing all
    /// binding state. Blocks until teardown finished.
    pub fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.submit(Command::Shutdown(ack)) {
            let _ = done.blocking_recv();
        }
    }

    /// Async variant of [`shutdown`](Self::shutdown).
    pub async fn shutdown_async(&self) {
        let (ack, done) = oneshot::channel();
        if self.submit(Command::Shutdown(ack)) {
            let _ = done.await;
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Snapshot the singleton binding of `kind` on `socket`.
    pub fn inspect(&self, socket: SocketHandle, kind: BindingKind) -> Option<BindingSnapshot> {
        self.store().get_kind(socket, kind).map(|(_, ctx)| BindingSnapshot::of(ctx))
    }

    /// Snapshot the binding of `kind` on `socket` towards `remote`.
    pub fn inspect_at(
        &self,
        socket: SocketHandle,
        kind: BindingKind,
        remote: SocketAddr,
    ) -> Option<BindingSnapshot> {
        self.store()
            .get(&BindingKey { socket, kind, remote })
            .map(BindingSnapshot::of)
    }

    /// Number of live binding contexts, across all sockets.
    pub fn binding_count(&self) -> usize {
        self.store().len()
    }

    fn remove_singleton(&self, socket: SocketHandle, kind: BindingKind) -> bool {
        let removed = self.store().remove_kind(socket, kind);
        match removed {
            Some((key, ctx)) => {
                self.reap_and_notify_stopped(&key, &ctx);
                debug!(%socket, ?kind, "binding disabled");
                true
            }
            None => false,
        }
    }

    fn remove_exact(&self, key: BindingKey) -> bool {
        let removed = self.store().remove(&key);
        match removed {
            Some(ctx) => {
                self.reap_and_notify_stopped(&key, &ctx);
                true
            }
            None => false,
        }
    }
}

fn interval(secs: u32) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(u64::from(secs)))
}

/// Lock the binding store through the field reference, so processor code
/// can hold the guard while mutating its (disjoint) timer pool.
fn lock_store(store: &Mutex<BindingStore>) -> MutexGuard<'_, BindingStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Processor task
// ============================================================================

struct Processor {
    rx: mpsc::UnboundedReceiver<Command>,
    bindings: Arc<Mutex<BindingStore>>,
    externals: Arc<ExternalBindingTable>,
    transport: Arc<dyn Transport>,
    config: AgentConfig,
    timers: TimerPool,
}

impl Processor {
    async fn run(mut self) {
        // The sweep timer is always armed, which also keeps the timer
        // branch below from ever observing an empty pool.
        self.timers.arm(TimerEvent::SweepExternal, self.config.sweep_interval());

        loop {
            tokio::select! {
                biased;
                Some(event) = self.timers.next_due() => self.on_timer(event),
                command = self.rx.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.teardown();
                        break;
                    }
                },
            }
        }
        debug!("processor exited");
    }

    /// Handle one command; returns `false` on shutdown.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(key) => self.start_binding(key),
            Command::Inbound { socket, message } => self.on_inbound(socket, message),
            Command::ReapTimers(keys) => {
                for key in keys {
                    self.timers.cancel(&key);
                }
            }
            Command::Notify { listener, event } => listener.on_keepalive_event(&event),
            Command::Barrier(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown(ack) => {
                self.teardown();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Outbound driving
    // ------------------------------------------------------------------

    fn start_binding(&mut self, key: BindingKey) {
        self.notify_started(&key);
        match key.kind {
            BindingKind::CrlfKeepalive => self.send_crlf(key),
            _ => self.send_attempt(key, false, false),
        }
    }

    fn notify_started(&mut self, key: &BindingKey) {
        if !key.kind.is_keepalive() {
            return;
        }
        let listener = lock_store(&self.bindings).get(key).and_then(|ctx| ctx.listener.clone());
        if let Some(listener) = listener {
            listener.on_keepalive_event(&KeepaliveEvent::Started {
                socket: key.socket,
                kind: key.kind,
                remote: key.remote,
            });
        }
    }

    /// Fire the CRLF ping and reschedule. No transaction, no retries:
    /// a send error is logged and the cadence simply continues.
    fn send_crlf(&mut self, key: BindingKey) {
        let mut store = lock_store(&self.bindings);
        let Some(ctx) = store.get_mut(&key) else { return };
        let Some(interval) = ctx.keepalive_interval else { return };

        match self.transport.send_to(key.socket, codec::CRLF_KEEPALIVE, key.remote) {
            Ok(_) => {
                ctx.status = BindingStatus::Success;
                trace!(socket = %key.socket, remote = %key.remote, "crlf keepalive sent");
            }
            Err(e) => {
                ctx.status = BindingStatus::SendingError;
                warn!(socket = %key.socket, remote = %key.remote, error = %e, "crlf keepalive send failed");
            }
        }

        if let Some(old) = ctx.timer.take() {
            self.timers.cancel(&old);
        }
        ctx.timer = Some(self.timers.arm(
            TimerEvent::Binding { key, purpose: TimerPurpose::KeepaliveTick },
            interval,
        ));
    }

    /// Issue one transaction attempt.
    ///
    /// `rotate` supersedes the current transaction id (retransmissions and
    /// new rounds); `resend` marks the attempt as a retransmission for
    /// status accounting. Local send failures are not terminal: the
    /// response timer is armed regardless and the timeout path retries.
    fn send_attempt(&mut self, key: BindingKey, rotate: bool, resend: bool) {
        let timeout = self.config.response_timeout();
        let mut store = lock_store(&self.bindings);

        let txid = if rotate {
            store.rotate_transaction(&key)
        } else {
            store.current_transaction(&key)
        };
        let Some(txid) = txid else { return };
        let Some(ctx) = store.get_mut(&key) else { return };

        ctx.abort_count += 1;
        let sent = match build_request(ctx, txid) {
            Ok(payload) => self.transport.send_to(key.socket, &payload, key.remote).map(|_| ()),
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
        };

        ctx.status = match (&sent, resend) {
            (Ok(()), false) => BindingStatus::Sending,
            (Ok(()), true) => BindingStatus::Resending,
            (Err(_), false) => BindingStatus::SendingError,
            (Err(_), true) => BindingStatus::ResendingError,
        };
        match &sent {
            Ok(()) => trace!(
                socket = %key.socket,
                remote = %key.remote,
                kind = ?key.kind,
                attempt = ctx.abort_count,
                %txid,
                "request sent"
            ),
            Err(e) => warn!(
                socket = %key.socket,
                remote = %key.remote,
                kind = ?key.kind,
                error = %e,
                "request send failed; retrying on timeout"
            ),
        }

        if let Some(old) = ctx.timer.take() {
            self.timers.cancel(&old);
        }
        ctx.timer = Some(self.timers.arm(
            TimerEvent::Binding { key, purpose: TimerPurpose::ResponseTimeout },
            timeout,
        ));
    }

    // ------------------------------------------------------------------
    // Timer events
    // ------------------------------------------------------------------

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::SweepExternal => {
                self.externals.sweep();
                self.timers.arm(TimerEvent::SweepExternal, self.config.sweep_interval());
            }
            TimerEvent::Binding { key, purpose } => match purpose {
                TimerPurpose::ResponseTimeout => self.on_response_timeout(key),
                TimerPurpose::KeepaliveTick => self.on_keepalive_tick(key),
                TimerPurpose::RefreshDue => self.on_refresh_due(key),
            },
        }
    }

    fn on_response_timeout(&mut self, key: BindingKey) {
        let exhausted = {
            let mut store = lock_store(&self.bindings);
            let Some(ctx) = store.get_mut(&key) else {
                trace!(?key, "timeout for removed binding ignored");
                return;
            };
            ctx.timer = None;
            if key.kind == BindingKind::TurnAllocation && ctx.refreshing {
                ctx.refresh_error_count += 1;
            }
            ctx.abort_count > ctx.max_attempts(&self.config)
        };

        if exhausted {
            self.fail_binding(key, "attempt ceiling exhausted");
        } else {
            self.send_attempt(key, true, true);
        }
    }

    fn on_keepalive_tick(&mut self, key: BindingKey) {
        match key.kind {
            BindingKind::CrlfKeepalive => self.send_crlf(key),
            BindingKind::StunKeepalive | BindingKind::StunDiscovery => {
                {
                    let mut store = lock_store(&self.bindings);
                    let Some(ctx) = store.get_mut(&key) else { return };
                    ctx.timer = None;
                    ctx.begin_round();
                }
                self.send_attempt(key, true, false);
            }
            _ => {}
        }
    }

    fn on_refresh_due(&mut self, key: BindingKey) {
        {
            let mut store = lock_store(&self.bindings);
            let Some(ctx) = store.get_mut(&key) else { return };
            ctx.timer = None;
            ctx.begin_round();
            ctx.refreshing = true;
        }
        debug!(socket = %key.socket, "refreshing TURN allocation");
        self.send_attempt(key, true, false);
    }

    /// Terminal failure: clear the timer, invalidate learned addresses for
    /// TURN, and notify the listener.
    fn fail_binding(&mut self, key: BindingKey, reason: &str) {
        let listener = {
            let mut store = lock_store(&self.bindings);
            let Some(ctx) = store.get_mut(&key) else { return };
            ctx.status = BindingStatus::Failed;
            if let Some(timer) = ctx.timer.take() {
                self.timers.cancel(&timer);
            }
            if key.kind == BindingKind::TurnAllocation {
                ctx.relay = None;
                ctx.refreshing = false;
            }
            warn!(
                socket = %key.socket,
                remote = %key.remote,
                kind = ?key.kind,
                attempts = ctx.abort_count,
                reason,
                "binding failed"
            );
            ctx.listener.clone()
        };
        // Outside the store lock: listeners may call back into the agent.
        if let Some(listener) = listener {
            listener.on_keepalive_event(&KeepaliveEvent::Failed {
                socket: key.socket,
                kind: key.kind,
                remote: key.remote,
            });
        }
    }

    // ------------------------------------------------------------------
    // Inbound responses
    // ------------------------------------------------------------------

    fn on_inbound(&mut self, socket: SocketHandle, message: ParsedMessage) {
        let route = lock_store(&self.bindings).find_by_transaction(&message.transaction_id);
        let Some((key, current)) = route else {
            debug!(%socket, txid = %message.transaction_id, "unmatched message discarded");
            return;
        };
        if !current {
            debug!(
                %socket,
                txid = %message.transaction_id,
                "late response to superseded transaction discarded"
            );
            return;
        }
        if key.socket != socket {
            debug!(%socket, expected = %key.socket, "response arrived on foreign socket; discarded");
            return;
        }

        match message.class {
            MessageClass::SuccessResponse => self.on_success(key, message),
            MessageClass::ErrorResponse => self.on_error(key, message),
            _ => trace!(%socket, "non-response message ignored"),
        }
    }

    fn on_success(&mut self, key: BindingKey, message: ParsedMessage) {
        let event = {
            let mut store = lock_store(&self.bindings);
            let Some(ctx) = store.get_mut(&key) else { return };
            if ctx.status == BindingStatus::Failed {
                debug!(socket = %key.socket, "response after failure dropped");
                return;
            }

            if let Some(timer) = ctx.timer.take() {
                self.timers.cancel(&timer);
            }
            ctx.abort_count = 0;

            if let Some(mapped) = message.mapped {
                if ctx.mapped.is_some() && ctx.mapped != Some(mapped) {
                    info!(
                        socket = %key.socket,
                        old = ?ctx.mapped,
                        new = %mapped,
                        "NAT mapping changed"
                    );
                }
                ctx.mapped = Some(mapped);
            }
            if key.kind == BindingKind::TurnAllocation {
                if let Some(relayed) = message.relayed {
                    ctx.relay = Some(relayed);
                }
                if let Some(lifetime) = message.lifetime {
                    ctx.lifetime = lifetime;
                }
                if ctx.refreshing {
                    ctx.refreshing = false;
                    ctx.refresh_error_count = 0;
                    debug!(socket = %key.socket, lifetime = ctx.lifetime, "TURN allocation refreshed");
                } else {
                    info!(
                        socket = %key.socket,
                        relay = ?ctx.relay,
                        lifetime = ctx.lifetime,
                        "TURN allocation established"
                    );
                }
            }
            ctx.status = BindingStatus::Success;

            let next = match key.kind {
                BindingKind::TurnAllocation => Some((
                    TimerPurpose::RefreshDue,
                    self.config.refresh_delay(ctx.lifetime, ctx.keepalive_interval),
                )),
                BindingKind::StunDiscovery | BindingKind::StunKeepalive => ctx
                    .keepalive_interval
                    .map(|i| (TimerPurpose::KeepaliveTick, i)),
                _ => None,
            };
            if let Some((purpose, delay)) = next {
                ctx.timer = Some(self.timers.arm(TimerEvent::Binding { key, purpose }, delay));
            }

            trace!(socket = %key.socket, kind = ?key.kind, mapped = ?ctx.mapped, "binding succeeded");
            ctx.listener.clone().map(|listener| {
                (
                    listener,
                    KeepaliveEvent::Succeeded {
                        socket: key.socket,
                        kind: key.kind,
                        remote: key.remote,
                        mapped: ctx.mapped,
                    },
                )
            })
        };
        if let Some((listener, event)) = event {
            listener.on_keepalive_event(&event);
        }
    }

    fn on_error(&mut self, key: BindingKey, message: ParsedMessage) {
        // A TURN challenge (realm + nonce, no credentials accepted yet) is
        // answered once with an authenticated retry; anything else is
        // terminal.
        let challenge = {
            let mut store = lock_store(&self.bindings);
            let Some(ctx) = store.get_mut(&key) else { return };
            if key.kind == BindingKind::TurnAllocation
                && ctx.realm.is_none()
                && message.realm.is_some()
                && message.nonce.is_some()
            {
                ctx.realm = message.realm.clone();
                ctx.nonce = message.nonce.clone();
                if let Some(timer) = ctx.timer.take() {
                    self.timers.cancel(&timer);
                }
                info!(
                    socket = %key.socket,
                    realm = ?ctx.realm,
                    "TURN allocation challenged; retrying with credentials"
                );
                true
            } else {
                false
            }
        };

        if challenge {
            self.send_attempt(key, true, false);
        } else {
            let code = message.error_code.unwrap_or(0);
            self.fail_binding(key, &format!("server error {code}"));
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn teardown(&mut self) {
        let drained = lock_store(&self.bindings).drain();
        self.timers.clear();
        self.externals.clear_all();

        let mut stopped = Vec::new();
        for (key, ctx) in &drained {
            if let (true, Some(listener)) = (key.kind.is_keepalive(), &ctx.listener) {
                stopped.push((
                    Arc::clone(listener),
                    KeepaliveEvent::Stopped {
                        socket: key.socket,
                        kind: key.kind,
                        remote: key.remote,
                    },
                ));
            }
        }
        for (listener, event) in stopped {
            listener.on_keepalive_event(&event);
        }
        info!(bindings = drained.len(), "agent shut down; all timers and contexts released");
    }
}

/// Build the wire request for one attempt of `ctx`.
fn build_request(ctx: &BindingContext, txid: TransactionId) -> CodecResult<Bytes> {
    match ctx.kind {
        BindingKind::StunDiscovery => Ok(codec::binding_request(txid, None, ctx.options)),
        BindingKind::StunKeepalive => {
            Ok(codec::binding_request(txid, None, StunOptions::default()))
        }
        BindingKind::StunProbe => {
            Ok(codec::binding_request(txid, Some(ctx.priority), StunOptions::default()))
        }
        BindingKind::TurnAllocation => {
            let auth = ctx.turn_auth();
            if ctx.refreshing {
                codec::refresh_request(txid, ctx.lifetime, auth.as_ref())
            } else {
                codec::allocate_request(txid, ctx.lifetime, auth.as_ref())
            }
        }
        BindingKind::CrlfKeepalive => Ok(Bytes::from_static(codec::CRLF_KEEPALIVE)),
    }
}
