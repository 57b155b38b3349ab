//! Wire messages and frame codec.
//!
//! Wire format: MAGIC (4) + LENGTH (4, LE) + CHECKSUM (4) + PAYLOAD
//!
//! PAYLOAD is a postcard-encoded [`WireMessage`]. The checksum is the first
//! four bytes of SHA3-256 over the payload.

use crate::types::{sha3, Nonce, PeerId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROTOCOL_MAGIC: [u8; 4] = *b"PoR\x01";
pub const PROTOCOL_VERSION: u32 = 1;

/// Announced in the handshake
pub const AGENT: &str = concat!("porlink/", env!("CARGO_PKG_VERSION"));

pub const HEADER_SIZE: usize = 12;
pub const CHECKSUM_SIZE: usize = 4;

/// Hard cap on any payload, whatever the configured `max_message_size`.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("invalid checksum")]
    InvalidChecksum,
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("length mismatch: header says {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("message too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),
    #[error("serialization error: {0}")]
    Serialize(#[from] postcard::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
    /// Initiator's acknowledgment of a received echo
    Ack,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Envelope for everything that travels between peers after the handshake.
///
/// `(source, sent_at_ms, nonce)` identifies a request; `attempt` tells
/// retries of the same nonce apart and is echoed back in the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub kind: MessageKind,
    pub nonce: Nonce,
    pub attempt: u32,
    pub source: PeerId,
    pub destination: PeerId,
    /// Remaining hop budget
    pub ttl: u8,
    /// When the source created the message
    pub sent_at_ms: u64,
    /// Restamped by every node that hands the message to a link
    pub hop_sent_at_ms: u64,
    /// Sum of the link latencies observed so far
    pub total_latency_ms: u64,
    /// Intermediate peers that forwarded the message, in order
    pub path: Vec<PeerId>,
    pub payload: Vec<u8>,
}

impl RoutedMessage {
    fn new(kind: MessageKind, source: PeerId, destination: PeerId, nonce: Nonce, ttl: u8, payload: Vec<u8>) -> Self {
        let now = unix_millis();
        Self {
            kind,
            nonce,
            attempt: 1,
            source,
            destination,
            ttl,
            sent_at_ms: now,
            hop_sent_at_ms: now,
            total_latency_ms: 0,
            path: Vec::new(),
            payload,
        }
    }

    pub fn request(source: PeerId, destination: PeerId, nonce: Nonce, ttl: u8, payload: Vec<u8>) -> Self {
        Self::new(MessageKind::Request, source, destination, nonce, ttl, payload)
    }

    pub fn response(source: PeerId, destination: PeerId, nonce: Nonce, ttl: u8, payload: Vec<u8>) -> Self {
        Self::new(MessageKind::Response, source, destination, nonce, ttl, payload)
    }

    pub fn ack(source: PeerId, destination: PeerId, nonce: Nonce, ttl: u8) -> Self {
        Self::new(MessageKind::Ack, source, destination, nonce, ttl, Vec::new())
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Spend one hop. Returns false once the budget is gone; such a message
    /// must be dropped, never forwarded.
    pub fn decrement_ttl(&mut self) -> bool {
        self.ttl = self.ttl.saturating_sub(1);
        self.ttl > 0
    }

    /// Account for the link the message just crossed.
    pub fn record_arrival(&mut self, now_ms: u64) {
        let link = now_ms.saturating_sub(self.hop_sent_at_ms);
        self.total_latency_ms = self.total_latency_ms.saturating_add(link);
    }
}

/// Handshake payload exchanged once per connection, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: u32,
    pub peer_id: PeerId,
    /// Random per connection. Seeing our own nonce come back means we dialed ourselves.
    pub nonce: u64,
    pub listen_port: u16,
    pub por_enabled: bool,
    /// Implementation name and version, e.g. `porlink/0.1.0`
    pub agent: String,
}

impl HelloPayload {
    pub fn new(peer_id: PeerId, listen_port: u16, por_enabled: bool) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            peer_id,
            nonce: rand::random(),
            listen_port,
            por_enabled,
            agent: AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Hello(HelloPayload),
    Routed(RoutedMessage),
}

impl WireMessage {
    pub fn command(&self) -> &'static str {
        match self {
            WireMessage::Hello(_) => "hello",
            WireMessage::Routed(m) => match m.kind {
                MessageKind::Request => "por_request",
                MessageKind::Response => "por_response",
                MessageKind::Ack => "por_ack",
            },
        }
    }
}

fn compute_checksum(data: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let hash = sha3(data);
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, FrameError> {
    let data = postcard::to_allocvec(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(data.len(), MAX_FRAME_SIZE));
    }

    let checksum = compute_checksum(&data);

    let mut frame = Vec::with_capacity(HEADER_SIZE + data.len());
    frame.extend_from_slice(&PROTOCOL_MAGIC);
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum);
    frame.extend_from_slice(&data);
    Ok(frame)
}

/// Validate a frame header and return the payload length it announces.
///
/// `max_frame` bounds the whole frame, header included. Stream readers call
/// this before allocating the payload buffer.
pub fn parse_header(header: &[u8; HEADER_SIZE], max_frame: usize) -> Result<usize, FrameError> {
    if header[0..4] != PROTOCOL_MAGIC {
        return Err(FrameError::InvalidMagic);
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let limit = max_frame.min(HEADER_SIZE + MAX_FRAME_SIZE);
    if HEADER_SIZE + len > limit {
        return Err(FrameError::TooLarge(HEADER_SIZE + len, limit));
    }
    Ok(len)
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, FrameError> {
    if frame.len() < HEADER_SIZE {
        return Err(FrameError::Truncated(frame.len()));
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&frame[..HEADER_SIZE]);
    let len = parse_header(&header, HEADER_SIZE + MAX_FRAME_SIZE)?;

    let data = &frame[HEADER_SIZE..];
    if data.len() != len {
        return Err(FrameError::LengthMismatch { declared: len, actual: data.len() });
    }

    let checksum = [header[8], header[9], header[10], header[11]];
    if compute_checksum(data) != checksum {
        return Err(FrameError::InvalidChecksum);
    }

    Ok(postcard::from_bytes(data)?)
}
