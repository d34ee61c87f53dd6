//! MySQL packet framing
//!
//! Every MySQL packet starts with a 4-byte header: a 3-byte little-endian
//! payload length followed by a sequence id. Payloads of 16 MiB or more are
//! split into frames of `MAX_PAYLOAD_LEN` bytes followed by a shorter
//! terminating frame; the frames after the first are continuation frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProxyError, Result};

/// Packet header length
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FF_FF;

/// MySQL packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length
    pub payload_length: u32,

    /// Sequence id
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Parse a header
    pub fn parse(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    /// Encode the header
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// One framed MySQL packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence id from the header
    pub sequence_id: u8,

    /// Payload bytes
    pub payload: Bytes,

    /// Whether the frame continues a payload split over several frames
    pub continuation: bool,
}

impl Packet {
    /// Create a packet that starts a new payload
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
            continuation: false,
        }
    }

    /// Header describing this packet
    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            payload_length: self.payload.len() as u32,
            sequence_id: self.sequence_id,
        }
    }

    /// Wire encoding of the packet, header included
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&self.header().to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// First payload byte of a packet that starts a new payload
    pub fn command(&self) -> Option<u8> {
        if self.continuation {
            return None;
        }
        self.payload.first().copied()
    }
}

/// Frames MySQL packets on a byte stream
///
/// The codec only splits the stream into frames; it never interprets
/// payloads.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_payload_len: usize,
    in_continuation: bool,
}

impl PacketCodec {
    /// Create a codec accepting frames of any valid length
    pub fn new() -> Self {
        Self::with_max_payload_len(MAX_PAYLOAD_LEN)
    }

    /// Create a codec rejecting frames with payloads above `max_payload_len`
    pub fn with_max_payload_len(max_payload_len: usize) -> Self {
        Self {
            max_payload_len: max_payload_len.min(MAX_PAYLOAD_LEN),
            in_continuation: false,
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let header = PacketHeader::parse([src[0], src[1], src[2], src[3]]);
        let len = header.payload_length as usize;
        if len > self.max_payload_len {
            return Err(ProxyError::Protocol(format!(
                "packet of {} bytes exceeds the {} byte limit",
                len, self.max_payload_len
            )));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        let continuation = self.in_continuation;
        self.in_continuation = len == MAX_PAYLOAD_LEN;

        Ok(Some(Packet {
            sequence_id: header.sequence_id,
            payload,
            continuation,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProxyError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        if packet.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProxyError::Protocol(format!(
                "payload of {} bytes does not fit in one frame",
                packet.payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + packet.payload.len());
        dst.put_slice(&packet.header().to_bytes());
        dst.put_slice(&packet.payload);
        Ok(())
    }
}

/// Read one packet, used during the connection phase before framing starts
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let header = PacketHeader::parse(header);

    let mut payload = vec![0u8; header.payload_length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Packet::new(header.sequence_id, payload))
}

/// Write one packet and flush it
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    if packet.payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProxyError::Protocol("packet payload too large".into()));
    }
    writer.write_all(&packet.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
