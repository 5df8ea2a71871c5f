//! Shared harness for natlink integration tests.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use natlink_agent::codec::ParsedMessage;
use natlink_agent::{KeepaliveEvent, KeepaliveListener, SocketHandle, TransactionId, Transport};

/// Result alias for test functions.
pub type TestResult<T = ()> = anyhow::Result<T>;

/// Install a test-writer tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .try_init();
}

/// One datagram captured by [`RecordingTransport`].
#[derive(Debug, Clone)]
pub struct SentFrame {
    /// Sending socket handle.
    pub socket: SocketHandle,
    /// Destination address.
    pub dest: SocketAddr,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl SentFrame {
    /// Decode the frame as a STUN/TURN message, if it is one.
    pub fn parsed(&self) -> Option<ParsedMessage> {
        ParsedMessage::from_bytes(&self.payload).ok()
    }

    /// Whether the frame is a bare CRLF keepalive ping.
    pub fn is_crlf(&self) -> bool {
        self.payload == b"\r\n"
    }
}

/// Transport that records every outbound frame instead of touching the
/// network. Send failures can be injected to exercise the local-error
/// retry path.
pub struct RecordingTransport {
    frames: Mutex<Vec<SentFrame>>,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    /// Create a fresh recording transport.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { frames: Mutex::new(Vec::new()), fail_sends: AtomicBool::new(false) })
    }

    /// All frames sent so far (including ones that "failed").
    pub fn frames(&self) -> Vec<SentFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// Number of send attempts so far.
    pub fn sent_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Transaction id of the most recent STUN frame.
    pub fn last_transaction_id(&self) -> Option<TransactionId> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|frame| frame.parsed())
            .map(|msg| msg.transaction_id)
    }

    /// Transaction ids of every STUN frame, in send order.
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| frame.parsed())
            .map(|msg| msg.transaction_id)
            .collect()
    }

    /// Make subsequent sends fail with an I/O error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Transport for RecordingTransport {
    fn send_to(&self, socket: SocketHandle, payload: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.frames
            .lock()
            .unwrap()
            .push(SentFrame { socket, dest, payload: payload.to_vec() });
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected send failure"));
        }
        Ok(payload.len())
    }
}

/// Listener that records every keepalive event it sees.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<KeepaliveEvent>>,
}

impl RecordingListener {
    /// Create a fresh recording listener.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events observed so far.
    pub fn events(&self) -> Vec<KeepaliveEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Count events matching a predicate.
    pub fn count(&self, pred: impl Fn(&KeepaliveEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl KeepaliveListener for RecordingListener {
    fn on_keepalive_event(&self, event: &KeepaliveEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
