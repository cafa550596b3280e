//! Wire framing for the ish socket protocol.
//!
//! Wire format: `[kind: u8][length: u8][payload: length bytes]`
//!
//! Data packets carry raw terminal bytes; Resize packets carry four
//! big-endian `u16` fields (`rows, cols, x_pixels, y_pixels`). The
//! server → client direction is an unframed byte relay, so only the
//! client ever encodes packets.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the `[kind][length]` header.
pub const HEADER_LEN: usize = 2;

/// Maximum payload carried by a single packet.
///
/// Deliberately small to bound per-read work on the server. Payloads larger
/// than this are rejected, never truncated.
pub const MAX_PAYLOAD_LEN: usize = 32;

/// Maximum size of one encoded frame.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// Length of a Resize payload: four `u16` fields.
pub const RESIZE_PAYLOAD_LEN: usize = 8;

/// Packet kind byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0,
    Resize = 1,
}

impl PacketKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Data),
            1 => Some(Self::Resize),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty read")]
    Empty,

    #[error("frame header truncated: {available} byte(s)")]
    Truncated { available: usize },

    #[error("payload of {declared} bytes exceeds maximum of {max}", max = MAX_PAYLOAD_LEN)]
    TooLarge { declared: usize },

    #[error("incomplete payload: header declares {declared} bytes, {available} available")]
    Incomplete { declared: usize, available: usize },

    #[error("unknown packet kind: {kind}")]
    UnknownKind { kind: u8, declared: usize },

    #[error("resize payload must be {expected} bytes, got {len}", expected = RESIZE_PAYLOAD_LEN)]
    InvalidResize { len: usize },
}

/// Terminal geometry carried by a Resize packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub x_pixels: u16,
    pub y_pixels: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            x_pixels: 0,
            y_pixels: 0,
        }
    }

    /// Parse a Resize payload. Field order is part of the wire contract.
    pub fn from_payload(mut payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() != RESIZE_PAYLOAD_LEN {
            return Err(PacketError::InvalidResize { len: payload.len() });
        }
        Ok(Self {
            rows: payload.get_u16(),
            cols: payload.get_u16(),
            x_pixels: payload.get_u16(),
            y_pixels: payload.get_u16(),
        })
    }

    pub fn to_payload(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESIZE_PAYLOAD_LEN);
        buf.put_u16(self.rows);
        buf.put_u16(self.cols);
        buf.put_u16(self.x_pixels);
        buf.put_u16(self.y_pixels);
        buf.freeze()
    }
}

/// A decoded protocol unit. `payload.len()` is the header's length byte.
///
/// Fields are private so every packet goes through a constructor that keeps
/// the payload within [`MAX_PAYLOAD_LEN`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    payload: Bytes,
}

impl Packet {
    /// Create a packet, rejecting payloads over [`MAX_PAYLOAD_LEN`].
    pub fn new(kind: PacketKind, payload: Bytes) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::TooLarge {
                declared: payload.len(),
            });
        }
        Ok(Self { kind, payload })
    }

    /// Create a Data packet.
    pub fn data(payload: impl Into<Bytes>) -> Result<Self, PacketError> {
        Self::new(PacketKind::Data, payload.into())
    }

    /// Create a Resize packet.
    pub fn resize(size: WindowSize) -> Self {
        Self {
            kind: PacketKind::Resize,
            payload: size.to_payload(),
        }
    }

    /// Split arbitrary input into the fewest Data packets that carry it.
    pub fn data_chunks(data: &[u8]) -> impl Iterator<Item = Packet> + '_ {
        data.chunks(MAX_PAYLOAD_LEN).map(|chunk| Self {
            kind: PacketKind::Data,
            payload: Bytes::copy_from_slice(chunk),
        })
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Encoded size of this packet.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode this packet into bytes.
    pub fn encode(&self) -> Bytes {
        debug_assert!(
            self.payload.len() <= MAX_PAYLOAD_LEN,
            "payload of {} bytes does not fit one frame",
            self.payload.len()
        );
        let mut buf = BytesMut::with_capacity(self.frame_len());
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.payload.len() as u8);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    /// Decode the first frame in `buf`, the valid bytes of one read.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.is_empty() {
            return Err(PacketError::Empty);
        }
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated {
                available: buf.len(),
            });
        }

        let kind_byte = buf[0];
        let declared = buf[1] as usize;
        if declared > MAX_PAYLOAD_LEN {
            return Err(PacketError::TooLarge { declared });
        }

        let available = buf.len() - HEADER_LEN;
        if declared > available {
            return Err(PacketError::Incomplete {
                declared,
                available,
            });
        }

        let kind = PacketKind::from_u8(kind_byte).ok_or(PacketError::UnknownKind {
            kind: kind_byte,
            declared,
        })?;

        Ok(Self {
            kind,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + declared]),
        })
    }

    /// Iterate over every frame packed into one read buffer.
    pub fn frames(buf: &[u8]) -> Frames<'_> {
        Frames { buf, done: false }
    }
}

/// Iterator over consecutive frames in one read buffer.
///
/// A frame of unknown kind is skipped on its own; any other decode error is
/// yielded once and the rest of the buffer is dropped, since framing can no
/// longer be trusted.
pub struct Frames<'a> {
    buf: &'a [u8],
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Packet, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.buf.is_empty() {
            return None;
        }
        match Packet::decode(self.buf) {
            Ok(packet) => {
                self.buf = &self.buf[packet.frame_len()..];
                Some(Ok(packet))
            }
            Err(e @ PacketError::UnknownKind { declared, .. }) => {
                self.buf = &self.buf[HEADER_LEN + declared..];
                Some(Err(e))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
