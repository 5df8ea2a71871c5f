//! STUN/TURN NAT binding agent for real-time media endpoints.
//!
//! This crate keeps UDP sockets reachable across NATs:
//! - STUN binding discovery with optional refresh cadence
//! - priority-tagged STUN probes for racing candidate paths
//! - TURN relay allocation with authentication and periodic refresh
//! - CRLF and STUN keepalives with listener callbacks
//! - a blocking-lookup table of learned external (peer) bindings
//!
//! All binding state and timers are owned by one serialized processor
//! task; callers on any thread drive it through the [`NatAgent`] handle
//! and observe results with [`NatAgent::synchronize`] or the snapshot
//! accessors. See the `agent` module for the threading model.

#![forbid(unsafe_code)]

pub mod agent;
pub mod codec;
pub mod context;
pub mod external;
pub mod keepalive;
pub mod store;
pub mod timer;
pub mod transport;

pub use agent::{BindingSnapshot, NatAgent};
pub use codec::{CodecError, MessageClass, Method, ParsedMessage, StunOptions};
pub use context::{BindingKind, BindingStatus};
pub use keepalive::{KeepaliveEvent, KeepaliveListener};
pub use transport::{resolve_host_port, Transport, UdpSocketPool};

// Re-export the shared core types for convenience.
pub use natlink_core::{AgentConfig, SocketHandle, TransactionId};
