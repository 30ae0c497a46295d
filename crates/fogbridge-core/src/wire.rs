//! fogbridge wire format — what travels between devices and the gateway.
//!
//! Message framing and option encoding belong to the `coap-lite` codec.
//! This module fixes the gateway's resource paths, the fixed payloads it
//! answers with, the unsigned-varint encoding of the `/req` payload, and
//! the handful of packet builders every CoAP exchange in the gateway uses.

use coap_lite::{
    CoapOption, ContentFormat, MessageClass, MessageType, Packet, ResponseType,
};

// ── Paths & payloads ──────────────────────────────────────────────────────────

/// Well-known CoAP UDP port.
pub const COAP_DEFAULT_PORT: u16 = 5683;

/// Liveness-check resource on the gateway.
pub const PATH_HELLO: &str = "hello";

/// Link request resource on the gateway.
pub const PATH_REQ: &str = "req";

/// Key delivery resource on the device.
pub const PATH_KEY: &str = "/key";

/// Body of every confirmable `/hello` reply.
pub const HELLO_PAYLOAD: &[u8] = b"hello to you too";

/// Body of a confirmable `/req` reply once the platform accepted the link request.
pub const LINK_REQUESTED_PAYLOAD: &[u8] = b"link request forwarded";

/// Entity tag attached to every outbound request.
pub const OUTBOUND_ETAG: &[u8] = b"weetag";

/// Max-age (seconds) attached to every outbound request.
pub const OUTBOUND_MAX_AGE: u8 = 3;

/// Length of the token on outbound requests.
pub const TOKEN_LEN: usize = 4;

/// Longest varint accepted. Ten groups of seven bits cover a u64.
const MAX_VARINT_LEN: usize = 10;

// ── Information-exchange type ─────────────────────────────────────────────────

/// Requested information-exchange type. Always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfType(u64);

impl InfType {
    /// Information type a freshly registered device is announced with.
    pub const DEFAULT: InfType = InfType(1);

    pub fn new(value: u64) -> Result<Self, WireError> {
        if value < 1 {
            return Err(WireError::InfTypeOutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Decode the `/req` payload. Bytes after the varint are ignored.
    pub fn from_payload(payload: &[u8]) -> Result<Self, WireError> {
        let (value, _) = decode_uvarint(payload)?;
        Self::new(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InfType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Varint ────────────────────────────────────────────────────────────────────

/// Decode an unsigned LEB128 varint from the front of `buf`.
/// Returns the value and the number of bytes consumed.
pub fn decode_uvarint(buf: &[u8]) -> Result<(u64, usize), WireError> {
    if buf.is_empty() {
        return Err(WireError::EmptyPayload);
    }
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(WireError::VarintOverflow);
        }
        if i >= MAX_VARINT_LEN {
            return Err(WireError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(WireError::VarintTruncated)
}

/// Encode `value` as an unsigned LEB128 varint.
pub fn encode_uvarint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_VARINT_LEN);
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out
}

// ── Packet helpers ────────────────────────────────────────────────────────────

/// Decode a datagram into a CoAP packet.
pub fn parse_packet(buf: &[u8]) -> Result<Packet, WireError> {
    Packet::from_bytes(buf).map_err(|e| WireError::Malformed(format!("{e:?}")))
}

/// Encode a CoAP packet for the wire.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, WireError> {
    packet
        .to_bytes()
        .map_err(|e| WireError::Malformed(format!("{e:?}")))
}

/// The Uri-Path options of `packet`, joined with '/' and without a leading slash.
pub fn request_path(packet: &Packet) -> String {
    packet
        .get_option(CoapOption::UriPath)
        .map(|segments| {
            segments
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

/// Replace the Uri-Path options of `packet` with the segments of `path`.
pub fn set_path(packet: &mut Packet, path: &str) {
    packet.clear_option(CoapOption::UriPath);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
}

/// Is this a request (as opposed to a response or empty message)?
pub fn is_request(packet: &Packet) -> bool {
    matches!(packet.header.code, MessageClass::Request(_))
}

pub fn is_confirmable(packet: &Packet) -> bool {
    packet.header.get_type() == MessageType::Confirmable
}

/// Piggybacked acknowledgement for `request`.
///
/// Echoes the message id and token.
pub fn ack_for(request: &Packet, code: ResponseType, payload: &[u8]) -> Packet {
    let mut response = Packet::new();
    response.header.set_type(MessageType::Acknowledgement);
    response.header.message_id = request.header.message_id;
    response.header.code = MessageClass::Response(code);
    response.set_token(request.get_token().to_vec());
    if !payload.is_empty() {
        response.set_content_format(ContentFormat::TextPlain);
        response.payload = payload.to_vec();
    }
    response
}

/// Empty acknowledgement, used to accept a separate confirmable response.
pub fn empty_ack(message_id: u16) -> Packet {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.message_id = message_id;
    ack.header.code = MessageClass::Empty;
    ack
}

/// Reset for `message_id`; the answer to a CoAP ping.
pub fn reset_for(message_id: u16) -> Packet {
    let mut rst = Packet::new();
    rst.header.set_type(MessageType::Reset);
    rst.header.message_id = message_id;
    rst.header.code = MessageClass::Empty;
    rst
}

/// Confirmable request carrying the gateway's conformance options.
pub fn confirmable_request(
    code: MessageClass,
    path: &str,
    payload: &[u8],
    message_id: u16,
    token: &[u8],
) -> Packet {
    let mut request = Packet::new();
    request.header.set_type(MessageType::Confirmable);
    request.header.code = code;
    request.header.message_id = message_id;
    request.set_token(token.to_vec());
    request.add_option(CoapOption::ETag, OUTBOUND_ETAG.to_vec());
    request.add_option(CoapOption::MaxAge, vec![OUTBOUND_MAX_AGE]);
    set_path(&mut request, path);
    request.payload = payload.to_vec();
    request
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed CoAP message: {0}")]
    Malformed(String),

    #[error("payload is empty")]
    EmptyPayload,

    #[error("varint is truncated")]
    VarintTruncated,

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("information type {0} is out of range (must be >= 1)")]
    InfTypeOutOfRange(u64),

    #[error("session key must be {expected} bytes, got {got}")]
    KeyLength { expected: usize, got: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
