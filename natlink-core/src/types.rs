//! Shared identifier types.

use std::fmt;

/// Default STUN/TURN server port.
pub const STUN_DEFAULT_PORT: u16 = 3478;

/// Largest datagram the agent expects to handle.
pub const MAX_DATAGRAM: usize = 1500;

/// Non-owning handle to a socket in an externally owned socket table.
///
/// The agent never owns sockets; it refers to them through handles so a
/// socket can be torn down independently and its bindings removed
/// proactively instead of dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub u64);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// 96-bit STUN transaction id (RFC 5389).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a fresh random transaction id.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Wrap raw id bytes, e.g. taken from a decoded message header.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Raw id bytes in wire order.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", hex::encode(self.0))
    }
}
