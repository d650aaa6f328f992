//! Link framing
//!
//! Gives a byte stream message boundaries. Each link message is a 13-byte
//! header followed by its payload:
//!
//! ```text
//! magic(4) | kind(1) | length(4, BE) | sequence(4, BE) | payload
//! ```
//!
//! Text payloads carry one encoded FlatKV frame; ping and pong carry a
//! big-endian u64 nonce; close carries a UTF-8 reason.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

/// Identifies a flatlink stream
pub const MAGIC_BYTES: [u8; 4] = *b"FLK1";

/// Header size: magic(4) + kind(1) + length(4) + sequence(4) = 13 bytes
const HEADER_SIZE: usize = 13;

const KIND_TEXT: u8 = 0x01;
const KIND_PING: u8 = 0x02;
const KIND_PONG: u8 = 0x03;
const KIND_CLOSE: u8 = 0x04;

/// Framing errors
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One message on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    /// An encoded FlatKV frame
    Text(String),
    Ping(u64),
    Pong(u64),
    /// Graceful shutdown with a reason
    Close(String),
}

impl LinkMessage {
    fn kind(&self) -> u8 {
        match self {
            LinkMessage::Text(_) => KIND_TEXT,
            LinkMessage::Ping(_) => KIND_PING,
            LinkMessage::Pong(_) => KIND_PONG,
            LinkMessage::Close(_) => KIND_CLOSE,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            LinkMessage::Text(text) | LinkMessage::Close(text) => text.as_bytes().to_vec(),
            LinkMessage::Ping(nonce) | LinkMessage::Pong(nonce) => nonce.to_be_bytes().to_vec(),
        }
    }

    fn from_parts(kind: u8, payload: &[u8]) -> Result<Self, FramingError> {
        let text = |name| {
            String::from_utf8(payload.to_vec()).map_err(|_| FramingError::MalformedPayload(name))
        };
        let nonce = |name| {
            <[u8; 8]>::try_from(payload)
                .map(u64::from_be_bytes)
                .map_err(|_| FramingError::MalformedPayload(name))
        };

        match kind {
            KIND_TEXT => text("text").map(LinkMessage::Text),
            KIND_PING => nonce("ping").map(LinkMessage::Ping),
            KIND_PONG => nonce("pong").map(LinkMessage::Pong),
            KIND_CLOSE => text("close").map(LinkMessage::Close),
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

/// A decoded link message with its sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    pub sequence: u32,
    pub message: LinkMessage,
}

/// Encodes link messages into the wire format
pub struct Encoder {
    sequence: u32,
    max_payload: usize,
}

impl Encoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            sequence: 0,
            max_payload,
        }
    }

    /// Encode a message into a buffer
    pub fn encode(&mut self, message: &LinkMessage, buf: &mut BytesMut) -> Result<(), FramingError> {
        let payload = message.payload();

        if payload.len() > self.max_payload {
            return Err(FramingError::MessageTooLarge(payload.len(), self.max_payload));
        }

        buf.reserve(HEADER_SIZE + payload.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(message.kind());
        buf.put_u32(payload.len() as u32);
        buf.put_u32(self.sequence);
        buf.put_slice(&payload);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}

/// Decodes link messages from the wire format
pub struct Decoder {
    state: DecodeState,
    max_payload: usize,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        kind: u8,
        length: usize,
        sequence: u32,
    },
}

impl Decoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_payload,
        }
    }

    /// Attempt to decode a message from the buffer.
    /// Returns Ok(None) if more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<LinkFrame>, FramingError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MAGIC_BYTES {
                        return Err(FramingError::InvalidMagic);
                    }

                    let kind = buf[4];
                    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                    let sequence = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);

                    if length > self.max_payload {
                        return Err(FramingError::MessageTooLarge(length, self.max_payload));
                    }

                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Payload {
                        kind,
                        length,
                        sequence,
                    };
                }
                DecodeState::Payload {
                    kind,
                    length,
                    sequence,
                } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let payload = buf.split_to(length);
                    self.state = DecodeState::Header;

                    let message = LinkMessage::from_parts(kind, &payload)?;
                    return Ok(Some(LinkFrame { sequence, message }));
                }
            }
        }
    }
}
