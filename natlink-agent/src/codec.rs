//! STUN/TURN wire codec (RFC 5389 / RFC 5766 subset).
//!
//! Covers exactly what the agent speaks: binding requests and indications
//! for discovery, probing, and keepalive, plus TURN allocate/refresh with
//! long-term-credential authentication. Outbound messages are built with
//! the free functions at the bottom of this module; inbound datagrams are
//! decoded into [`ParsedMessage`], the pre-digested event form the
//! processor consumes.
//!
//! # Security
//! - MESSAGE-INTEGRITY attribute using HMAC-SHA1
//! - Constant-time verification via the `hmac` crate

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

use natlink_core::TransactionId;

/// Codec errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Inbound bytes do not form a STUN message the agent understands.
    #[error("message parse error: {0}")]
    Parse(String),
    /// Outbound message could not be assembled.
    #[error("message build error: {0}")]
    Build(String),
    /// Address attribute carried an unknown family byte.
    #[error("unsupported address family")]
    UnsupportedAddressFamily,
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// STUN message magic cookie (RFC 5389).
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Fixed STUN header length.
pub const HEADER_LEN: usize = 20;

/// Payload of a CRLF transport keepalive; no STUN semantics at all.
pub const CRLF_KEEPALIVE: &[u8] = b"\r\n";

// Attribute types (RFC 5389 / RFC 5766 / RFC 5245).
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_LIFETIME: u16 = 0x000D;
const ATTR_REALM: u16 = 0x0014;
const ATTR_NONCE: u16 = 0x0015;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;

const CHANGE_IP_FLAG: u32 = 0x4;
const CHANGE_PORT_FLAG: u32 = 0x2;
const TRANSPORT_UDP: u8 = 17;

/// STUN methods the agent uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Binding discovery, probe, or keepalive.
    Binding,
    /// TURN relay allocation.
    Allocate,
    /// TURN allocation refresh.
    Refresh,
}

impl Method {
    fn to_bits(self) -> u16 {
        match self {
            Method::Binding => 0x0001,
            Method::Allocate => 0x0003,
            Method::Refresh => 0x0004,
        }
    }

    fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            0x0001 => Some(Method::Binding),
            0x0003 => Some(Method::Allocate),
            0x0004 => Some(Method::Refresh),
            _ => None,
        }
    }
}

/// STUN message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Request expecting a response.
    Request,
    /// One-shot indication, no response expected.
    Indication,
    /// Success response.
    SuccessResponse,
    /// Error response.
    ErrorResponse,
}

impl MessageClass {
    fn to_bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
}

/// Compose the 14-bit method and 2-bit class into a wire message type
/// (RFC 5389 §6: class bits live at positions 4 and 8).
fn compose_type(method: u16, class: u16) -> u16 {
    ((method & 0x0F80) << 2)
        | ((method & 0x0070) << 1)
        | (method & 0x000F)
        | ((class & 0b10) << 7)
        | ((class & 0b01) << 4)
}

/// Split a wire message type back into (method, class) bits.
fn decompose_type(raw: u16) -> (u16, u16) {
    let method = ((raw & 0x3E00) >> 2) | ((raw & 0x00E0) >> 1) | (raw & 0x000F);
    let class = ((raw & 0x0100) >> 7) | ((raw & 0x0010) >> 4);
    (method, class)
}

/// Optional attributes on discovery binding requests (RFC 3489
/// CHANGE-REQUEST; used to ask the server to answer from another
/// address/port when probing NAT behavior).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StunOptions {
    /// Ask the server to respond from a different IP.
    pub change_ip: bool,
    /// Ask the server to respond from a different port.
    pub change_port: bool,
}

impl StunOptions {
    fn any(self) -> bool {
        self.change_ip || self.change_port
    }
}

/// Long-term TURN credentials plus the realm/nonce learned from the
/// server's authentication challenge.
#[derive(Debug, Clone)]
pub struct TurnAuth<'a> {
    /// Account username.
    pub username: &'a str,
    /// Account password (HMAC key for MESSAGE-INTEGRITY).
    pub password: &'a str,
    /// Realm echoed from the challenge.
    pub realm: &'a str,
    /// Nonce echoed from the challenge.
    pub nonce: &'a str,
}

/// A decoded STUN message: header plus raw attributes.
#[derive(Debug, Clone)]
pub struct StunMessage {
    /// Message method.
    pub method: Method,
    /// Message class.
    pub class: MessageClass,
    /// Transaction id from the header.
    pub transaction_id: TransactionId,
    attributes: Vec<(u16, Bytes)>,
}

impl StunMessage {
    /// Start a message with the given header fields and no attributes.
    pub fn new(method: Method, class: MessageClass, transaction_id: TransactionId) -> Self {
        Self { method, class, transaction_id, attributes: Vec::new() }
    }

    /// Append a raw attribute.
    pub fn add_attribute(&mut self, attr_type: u16, value: Bytes) {
        self.attributes.push((attr_type, value));
    }

    fn add_u32(&mut self, attr_type: u16, value: u32) {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(value);
        self.add_attribute(attr_type, buf.freeze());
    }

    fn add_str(&mut self, attr_type: u16, value: &str) {
        self.add_attribute(attr_type, Bytes::copy_from_slice(value.as_bytes()));
    }

    /// Add an XOR-MAPPED-ADDRESS attribute.
    pub fn add_xor_mapped_address(&mut self, addr: SocketAddr) {
        let value = encode_xor_address(addr, &self.transaction_id);
        self.add_attribute(ATTR_XOR_MAPPED_ADDRESS, value);
    }

    /// Add an XOR-RELAYED-ADDRESS attribute (TURN).
    pub fn add_xor_relayed_address(&mut self, addr: SocketAddr) {
        let value = encode_xor_address(addr, &self.transaction_id);
        self.add_attribute(ATTR_XOR_RELAYED_ADDRESS, value);
    }

    /// Add a LIFETIME attribute (TURN).
    pub fn add_lifetime(&mut self, seconds: u32) {
        self.add_u32(ATTR_LIFETIME, seconds);
    }

    /// Add an ERROR-CODE attribute.
    pub fn add_error_code(&mut self, code: u16, reason: &str) {
        let mut buf = BytesMut::with_capacity(4 + reason.len());
        buf.put_u16(0);
        buf.put_u8((code / 100) as u8);
        buf.put_u8((code % 100) as u8);
        buf.put_slice(reason.as_bytes());
        self.add_attribute(ATTR_ERROR_CODE, buf.freeze());
    }

    /// Add a REALM attribute.
    pub fn add_realm(&mut self, realm: &str) {
        self.add_str(ATTR_REALM, realm);
    }

    /// Add a NONCE attribute.
    pub fn add_nonce(&mut self, nonce: &str) {
        self.add_str(ATTR_NONCE, nonce);
    }

    fn get_attribute(&self, attr_type: u16) -> Option<&Bytes> {
        self.attributes.iter().find(|(t, _)| *t == attr_type).map(|(_, v)| v)
    }

    /// Whether the message carries the given attribute type.
    pub fn has_attribute(&self, attr_type: u16) -> bool {
        self.get_attribute(attr_type).is_some()
    }

    /// Whether the message carries a MESSAGE-INTEGRITY attribute.
    pub fn is_authenticated(&self) -> bool {
        self.has_attribute(ATTR_MESSAGE_INTEGRITY)
    }

    /// XOR-MAPPED-ADDRESS, if present.
    pub fn xor_mapped_address(&self) -> CodecResult<Option<SocketAddr>> {
        match self.get_attribute(ATTR_XOR_MAPPED_ADDRESS) {
            Some(v) => decode_xor_address(v, &self.transaction_id).map(Some),
            None => Ok(None),
        }
    }

    /// XOR-RELAYED-ADDRESS, if present.
    pub fn xor_relayed_address(&self) -> CodecResult<Option<SocketAddr>> {
        match self.get_attribute(ATTR_XOR_RELAYED_ADDRESS) {
            Some(v) => decode_xor_address(v, &self.transaction_id).map(Some),
            None => Ok(None),
        }
    }

    /// Plain MAPPED-ADDRESS fallback used by pre-RFC5389 servers.
    pub fn mapped_address(&self) -> CodecResult<Option<SocketAddr>> {
        match self.get_attribute(ATTR_MAPPED_ADDRESS) {
            Some(v) => decode_plain_address(v).map(Some),
            None => Ok(None),
        }
    }

    /// LIFETIME in seconds, if present.
    pub fn lifetime(&self) -> CodecResult<Option<u32>> {
        match self.get_attribute(ATTR_LIFETIME) {
            Some(v) if v.len() == 4 => {
                let mut cursor = v.clone();
                Ok(Some(cursor.get_u32()))
            }
            Some(_) => Err(CodecError::Parse("invalid LIFETIME length".into())),
            None => Ok(None),
        }
    }

    /// Error code (class * 100 + number), if present.
    pub fn error_code(&self) -> Option<u16> {
        let v = self.get_attribute(ATTR_ERROR_CODE)?;
        if v.len() < 4 {
            return None;
        }
        Some(u16::from(v[2] & 0x07) * 100 + u16::from(v[3]))
    }

    /// REALM as UTF-8, if present.
    pub fn realm(&self) -> Option<String> {
        self.get_attribute(ATTR_REALM).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// NONCE as UTF-8, if present.
    pub fn nonce(&self) -> Option<String> {
        self.get_attribute(ATTR_NONCE).map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let attrs_len: usize = self.attributes.iter().map(|(_, v)| 4 + pad4(v.len())).sum();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + attrs_len);

        buf.put_u16(compose_type(self.method.to_bits(), self.class.to_bits()));
        buf.put_u16(attrs_len as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for (attr_type, value) in &self.attributes {
            buf.put_u16(*attr_type);
            buf.put_u16(value.len() as u16);
            buf.put_slice(value);
            buf.put_bytes(0, pad4(value.len()) - value.len());
        }

        buf.freeze()
    }

    /// Parse wire bytes into a message.
    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Parse("message too short".into()));
        }

        let mut cursor = data;
        let raw_type = cursor.get_u16();
        let (method_bits, class_bits) = decompose_type(raw_type);
        let method = Method::from_bits(method_bits)
            .ok_or_else(|| CodecError::Parse(format!("unknown method 0x{method_bits:03x}")))?;
        let class = MessageClass::from_bits(class_bits);

        let length = cursor.get_u16() as usize;
        if cursor.get_u32() != MAGIC_COOKIE {
            return Err(CodecError::Parse("invalid magic cookie".into()));
        }
        let mut id = [0u8; 12];
        cursor.copy_to_slice(&mut id);
        let transaction_id = TransactionId::from_bytes(id);

        let mut attributes = Vec::new();
        let mut remaining = length.min(cursor.len());
        while remaining >= 4 {
            let attr_type = cursor.get_u16();
            let attr_len = cursor.get_u16() as usize;
            if cursor.len() < attr_len {
                return Err(CodecError::Parse("truncated attribute".into()));
            }
            attributes.push((attr_type, Bytes::copy_from_slice(&cursor[..attr_len])));
            cursor.advance(attr_len);

            let padding = (pad4(attr_len) - attr_len).min(cursor.len());
            cursor.advance(padding);
            remaining = remaining.saturating_sub(4 + attr_len + padding);
        }

        Ok(Self { method, class, transaction_id, attributes })
    }

    /// Append a MESSAGE-INTEGRITY attribute over the current content.
    pub fn add_message_integrity(&mut self, password: &str) -> CodecResult<()> {
        type HmacSha1 = Hmac<Sha1>;
        let mut mac = HmacSha1::new_from_slice(password.as_bytes())
            .map_err(|e| CodecError::Build(e.to_string()))?;
        mac.update(&self.encode());
        let digest = mac.finalize().into_bytes();
        self.add_attribute(ATTR_MESSAGE_INTEGRITY, Bytes::copy_from_slice(&digest));
        Ok(())
    }

    /// Verify a MESSAGE-INTEGRITY attribute in constant time.
    pub fn verify_message_integrity(&self, password: &str) -> CodecResult<bool> {
        let Some(integrity) = self.get_attribute(ATTR_MESSAGE_INTEGRITY).cloned() else {
            return Err(CodecError::Parse("no MESSAGE-INTEGRITY attribute".into()));
        };
        let mut stripped = self.clone();
        stripped.attributes.retain(|(t, _)| *t != ATTR_MESSAGE_INTEGRITY);

        type HmacSha1 = Hmac<Sha1>;
        let mut mac = HmacSha1::new_from_slice(password.as_bytes())
            .map_err(|e| CodecError::Build(e.to_string()))?;
        mac.update(&stripped.encode());
        Ok(mac.verify_slice(&integrity).is_ok())
    }

    /// Digest into the event form the processor consumes.
    pub fn into_parsed(self) -> CodecResult<ParsedMessage> {
        let mapped = match self.xor_mapped_address()? {
            Some(addr) => Some(addr),
            None => self.mapped_address()?,
        };
        Ok(ParsedMessage {
            transaction_id: self.transaction_id,
            method: self.method,
            class: self.class,
            mapped,
            relayed: self.xor_relayed_address()?,
            lifetime: self.lifetime()?,
            error_code: self.error_code(),
            realm: self.realm(),
            nonce: self.nonce(),
        })
    }
}

/// Pre-decoded STUN/TURN message event.
///
/// This is the shape inbound traffic takes once it crosses into the agent:
/// only the fields the binding state machine acts on, copied out of the
/// wire message.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Transaction id used to route the event to a binding.
    pub transaction_id: TransactionId,
    /// Message method.
    pub method: Method,
    /// Message class.
    pub class: MessageClass,
    /// Server-reflexive address (XOR-MAPPED-ADDRESS or MAPPED-ADDRESS).
    pub mapped: Option<SocketAddr>,
    /// Relayed address granted by a TURN allocation.
    pub relayed: Option<SocketAddr>,
    /// Granted allocation lifetime in seconds.
    pub lifetime: Option<u32>,
    /// Error code for error responses.
    pub error_code: Option<u16>,
    /// Realm from an authentication challenge.
    pub realm: Option<String>,
    /// Nonce from an authentication challenge.
    pub nonce: Option<String>,
}

impl ParsedMessage {
    /// Decode raw datagram bytes into an event.
    pub fn from_bytes(data: &[u8]) -> CodecResult<Self> {
        StunMessage::decode(data)?.into_parsed()
    }

    /// Success response skeleton, mainly for tests and local servers.
    pub fn success(method: Method, transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            method,
            class: MessageClass::SuccessResponse,
            mapped: None,
            relayed: None,
            lifetime: None,
            error_code: None,
            realm: None,
            nonce: None,
        }
    }

    /// Error response skeleton.
    pub fn error(method: Method, transaction_id: TransactionId, code: u16) -> Self {
        Self { error_code: Some(code), class: MessageClass::ErrorResponse, ..Self::success(method, transaction_id) }
    }

    /// Attach a mapped address.
    pub fn with_mapped(mut self, addr: SocketAddr) -> Self {
        self.mapped = Some(addr);
        self
    }

    /// Attach a relayed address.
    pub fn with_relayed(mut self, addr: SocketAddr) -> Self {
        self.relayed = Some(addr);
        self
    }

    /// Attach a granted lifetime.
    pub fn with_lifetime(mut self, seconds: u32) -> Self {
        self.lifetime = Some(seconds);
        self
    }

    /// Attach an authentication challenge.
    pub fn with_auth_challenge(mut self, realm: &str, nonce: &str) -> Self {
        self.realm = Some(realm.into());
        self.nonce = Some(nonce.into());
        self
    }
}

// ============================================================================
// Request builders used by the transaction engine
// ============================================================================

/// Binding request for discovery, probing, or keepalive rounds.
pub fn binding_request(
    transaction_id: TransactionId,
    priority: Option<u32>,
    options: StunOptions,
) -> Bytes {
    let mut msg = StunMessage::new(Method::Binding, MessageClass::Request, transaction_id);
    if options.any() {
        let mut flags = 0u32;
        if options.change_ip {
            flags |= CHANGE_IP_FLAG;
        }
        if options.change_port {
            flags |= CHANGE_PORT_FLAG;
        }
        msg.add_u32(ATTR_CHANGE_REQUEST, flags);
    }
    if let Some(p) = priority {
        msg.add_u32(ATTR_PRIORITY, p);
    }
    msg.encode()
}

/// Binding indication; keeps a mapping warm without soliciting a response.
pub fn binding_indication(transaction_id: TransactionId) -> Bytes {
    StunMessage::new(Method::Binding, MessageClass::Indication, transaction_id).encode()
}

/// TURN allocate request, authenticated once a challenge has been seen.
pub fn allocate_request(
    transaction_id: TransactionId,
    lifetime_secs: u32,
    auth: Option<&TurnAuth<'_>>,
) -> CodecResult<Bytes> {
    let mut msg = StunMessage::new(Method::Allocate, MessageClass::Request, transaction_id);
    let mut transport = BytesMut::with_capacity(4);
    transport.put_u8(TRANSPORT_UDP);
    transport.put_bytes(0, 3);
    msg.add_attribute(ATTR_REQUESTED_TRANSPORT, transport.freeze());
    msg.add_lifetime(lifetime_secs);
    apply_auth(&mut msg, auth)?;
    Ok(msg.encode())
}

/// TURN refresh request for an existing allocation.
pub fn refresh_request(
    transaction_id: TransactionId,
    lifetime_secs: u32,
    auth: Option<&TurnAuth<'_>>,
) -> CodecResult<Bytes> {
    let mut msg = StunMessage::new(Method::Refresh, MessageClass::Request, transaction_id);
    msg.add_lifetime(lifetime_secs);
    apply_auth(&mut msg, auth)?;
    Ok(msg.encode())
}

fn apply_auth(msg: &mut StunMessage, auth: Option<&TurnAuth<'_>>) -> CodecResult<()> {
    if let Some(auth) = auth {
        msg.add_str(ATTR_USERNAME, auth.username);
        msg.add_realm(auth.realm);
        msg.add_nonce(auth.nonce);
        msg.add_message_integrity(auth.password)?;
    }
    Ok(())
}

// ============================================================================
// Address attribute helpers
// ============================================================================

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id.as_bytes());
    key
}

/// Encode a socket address with XOR obfuscation (RFC 5389 §15.2).
fn encode_xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(0);
    buf.put_u8(match addr {
        SocketAddr::V4(_) => 0x01,
        SocketAddr::V6(_) => 0x02,
    });
    buf.put_u16(addr.port() ^ (MAGIC_COOKIE >> 16) as u16);

    let key = xor_key(transaction_id);
    match addr.ip() {
        IpAddr::V4(ip) => {
            for (octet, k) in ip.octets().iter().zip(&key) {
                buf.put_u8(octet ^ k);
            }
        }
        IpAddr::V6(ip) => {
            for (octet, k) in ip.octets().iter().zip(&key) {
                buf.put_u8(octet ^ k);
            }
        }
    }
    buf.freeze()
}

/// Decode an XOR-obfuscated socket address.
fn decode_xor_address(data: &[u8], transaction_id: &TransactionId) -> CodecResult<SocketAddr> {
    if data.len() < 8 {
        return Err(CodecError::Parse("XOR address too short".into()));
    }
    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let key = xor_key(transaction_id);

    match family {
        0x01 => {
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = data[4 + i] ^ key[i];
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if data.len() < 20 {
                return Err(CodecError::Parse("IPv6 XOR address truncated".into()));
            }
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = data[4 + i] ^ key[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(CodecError::UnsupportedAddressFamily),
    }
}

/// Decode a plain MAPPED-ADDRESS attribute.
fn decode_plain_address(data: &[u8]) -> CodecResult<SocketAddr> {
    if data.len() < 8 {
        return Err(CodecError::Parse("MAPPED-ADDRESS too short".into()));
    }
    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]);
    match family {
        0x01 => {
            let octets: [u8; 4] = data[4..8].try_into().map_err(|_| {
                CodecError::Parse("IPv4 MAPPED-ADDRESS truncated".into())
            })?;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            let octets: [u8; 16] = data
                .get(4..20)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| CodecError::Parse("IPv6 MAPPED-ADDRESS truncated".into()))?;
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(CodecError::UnsupportedAddressFamily),
    }
}
