//! Keepalive callback surface.
//!
//! Two keepalive variants exist per (socket, destination): a CRLF
//! transport ping with no protocol semantics, and STUN request rounds that
//! go through the transaction engine and report the learned mapping.
//! Both deliver lifecycle events to a caller-supplied listener; events are
//! always invoked from the processor task, never from manipulator threads.

use std::net::SocketAddr;

use natlink_core::SocketHandle;

use crate::context::BindingKind;

/// Lifecycle event of a keepalive registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// The registration was accepted and its first send is underway.
    Started {
        /// Owning socket.
        socket: SocketHandle,
        /// Keepalive variant.
        kind: BindingKind,
        /// Destination of the keepalive traffic.
        remote: SocketAddr,
    },
    /// A STUN keepalive round completed; carries the current mapping.
    Succeeded {
        /// Owning socket.
        socket: SocketHandle,
        /// Keepalive variant.
        kind: BindingKind,
        /// Destination of the keepalive traffic.
        remote: SocketAddr,
        /// Server-reflexive address reported by the last round.
        mapped: Option<SocketAddr>,
    },
    /// The keepalive exhausted its attempt ceiling; terminal.
    Failed {
        /// Owning socket.
        socket: SocketHandle,
        /// Keepalive variant.
        kind: BindingKind,
        /// Destination of the keepalive traffic.
        remote: SocketAddr,
    },
    /// The registration was removed.
    Stopped {
        /// Owning socket.
        socket: SocketHandle,
        /// Keepalive variant.
        kind: BindingKind,
        /// Destination of the keepalive traffic.
        remote: SocketAddr,
    },
}

/// Caller-supplied callback for keepalive lifecycle events.
///
/// Implementations must not block: they run on the processor task, and
/// anything slow here stalls every binding. Calling back into blocking
/// agent APIs (`synchronize`, timed `find_external_binding`) from a
/// listener is a programming error.
pub trait KeepaliveListener: Send + Sync {
    /// Observe one lifecycle event.
    fn on_keepalive_event(&self, event: &KeepaliveEvent);
}
