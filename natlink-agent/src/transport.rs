//! Outbound send seam and the externally owned socket table.
//!
//! The agent never owns sockets. It addresses them through
//! [`SocketHandle`]s handed out by a socket table the embedding layer
//! controls, and sends through the [`Transport`] trait so tests can swap
//! the network out entirely.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use natlink_core::SocketHandle;

/// Outbound datagram path.
///
/// Implementations must be cheap and non-blocking in the common case; the
/// processor calls this inline while driving binding state.
pub trait Transport: Send + Sync {
    /// Send `payload` from the socket behind `socket` to `dest`.
    fn send_to(&self, socket: SocketHandle, payload: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

/// UDP socket table keyed by [`SocketHandle`].
///
/// Owns the actual sockets; the agent only ever sees handles, so closing a
/// socket here and telling the agent via `socket_closed` leaves nothing
/// dangling.
pub struct UdpSocketPool {
    sockets: RwLock<HashMap<SocketHandle, UdpSocket>>,
    next_id: AtomicU64,
}

impl UdpSocketPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self { sockets: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SocketHandle, UdpSocket>> {
        self.sockets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SocketHandle, UdpSocket>> {
        self.sockets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a new UDP socket and register it, returning its handle.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<SocketHandle> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_nonblocking(false)?;

        let handle = SocketHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().insert(handle, socket);
        debug!(%handle, "socket registered");
        Ok(handle)
    }

    /// Local address of a registered socket.
    pub fn local_addr(&self, handle: SocketHandle) -> io::Result<SocketAddr> {
        self.read()
            .get(&handle)
            .ok_or_else(|| unknown_handle(handle))?
            .local_addr()
    }

    /// Set the read timeout of a registered socket.
    pub fn set_read_timeout(&self, handle: SocketHandle, timeout: Option<Duration>) -> io::Result<()> {
        self.read()
            .get(&handle)
            .ok_or_else(|| unknown_handle(handle))?
            .set_read_timeout(timeout)
    }

    /// Receive a datagram on a registered socket.
    pub fn recv_from(&self, handle: SocketHandle, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.read()
            .get(&handle)
            .ok_or_else(|| unknown_handle(handle))?
            .recv_from(buf)
    }

    /// Close and unregister a socket. Returns whether it existed.
    ///
    /// The caller is responsible for telling the agent via `socket_closed`
    /// so its bindings are removed as well.
    pub fn close(&self, handle: SocketHandle) -> bool {
        let existed = self.write().remove(&handle).is_some();
        if existed {
            debug!(%handle, "socket closed");
        }
        existed
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for UdpSocketPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UdpSocketPool {
    fn send_to(&self, socket: SocketHandle, payload: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.read()
            .get(&socket)
            .ok_or_else(|| unknown_handle(socket))?
            .send_to(payload, dest)
    }
}

fn unknown_handle(handle: SocketHandle) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("unknown socket handle {handle}"))
}

/// Validate a host:port pair and return a resolved `SocketAddr`.
/// Plain IP literals resolve without touching DNS.
pub fn resolve_host_port(host: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::from((ip, port)));
    }
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unable to resolve {host}:{port}"))
        })
}
