//! Length-delimited packet framing for every Lanthing stream (server link,
//! signaling, worker pipe, TCP transport).
//!
//! 12-byte header, little-endian:
//! ```text
//! [0..4]   magic: 0x474E544C ("LTNG")
//! [4..8]   payload_size (u32)
//! [8..12]  flags (u32): bit 0 = encrypted payload
//! [12..]   payload: u32 msg_type (LE) + body
//! ```
//!
//! The payload body is opaque at this layer; `Message::decode` interprets it
//! by `msg_type`.

use bytes::{Buf, Bytes, BytesMut};

pub const PACKET_HEADER_SIZE: usize = 12;
pub const PACKET_MAGIC: u32 = 0x474E_544C; // "LTNG" in LE

pub const FLAG_ENCRYPTED: u32 = 0x01;

/// Hard cap on a single payload. Anything larger is a corrupt or hostile
/// stream, not a real message.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// One whole frame popped off a stream: type tag + opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_type: u32,
    pub body: Bytes,
    pub encrypted: bool,
}

impl Packet {
    pub fn new(msg_type: u32, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            body: body.into(),
            encrypted: false,
        }
    }

    /// Serialize header + payload into a single buffer ready for the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let payload_size = 4 + self.body.len();
        let mut buf = Vec::with_capacity(PACKET_HEADER_SIZE + payload_size);
        buf.extend_from_slice(&PACKET_MAGIC.to_le_bytes());
        buf.extend_from_slice(&(payload_size as u32).to_le_bytes());
        let flags = if self.encrypted { FLAG_ENCRYPTED } else { 0 };
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&self.msg_type.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad magic: 0x{0:08x} (expected 0x{PACKET_MAGIC:08x})")]
    BadMagic(u32),
    #[error("payload size {0} exceeds limit {MAX_PAYLOAD_SIZE}")]
    Oversized(usize),
    #[error("payload shorter than its type tag: {0} bytes")]
    Truncated(usize),
}

/// Incremental frame parser.
///
/// Bytes are appended as they arrive; `next()` pops whole frames and stops at
/// the first partial one. Partial input is retained verbatim for the next
/// read, so any split of the byte stream yields the same packet sequence.
#[derive(Default)]
pub struct Parser {
    buf: BytesMut,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if any.
    ///
    /// An error means the stream is unrecoverable and the caller must close
    /// the connection.
    pub fn next(&mut self) -> Result<Option<Packet>, FrameError> {
        if self.buf.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }
        let magic = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if magic != PACKET_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let payload_size =
            u32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(FrameError::Oversized(payload_size));
        }
        if payload_size < 4 {
            return Err(FrameError::Truncated(payload_size));
        }
        if self.buf.len() < PACKET_HEADER_SIZE + payload_size {
            return Ok(None);
        }
        let flags = u32::from_le_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]);
        self.buf.advance(PACKET_HEADER_SIZE);
        let msg_type = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        self.buf.advance(4);
        let body = self.buf.split_to(payload_size - 4).freeze();
        Ok(Some(Packet {
            msg_type,
            body,
            encrypted: flags & FLAG_ENCRYPTED != 0,
        }))
    }

    /// Drop any buffered partial frame. Called when the underlying stream
    /// reconnects and the old byte position is meaningless.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(parser: &mut Parser) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(pkt) = parser.next().unwrap() {
            out.push(pkt);
        }
        out
    }

    #[test]
    fn packet_roundtrip() {
        let pkt = Packet::new(42, b"hello".as_slice());
        let wire = pkt.serialize();
        assert_eq!(wire.len(), PACKET_HEADER_SIZE + 4 + 5);

        let mut parser = Parser::new();
        parser.push(&wire);
        let parsed = parser.next().unwrap().unwrap();
        assert_eq!(parsed, pkt);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn magic_bytes_spell_ltng() {
        assert_eq!(&PACKET_MAGIC.to_le_bytes(), b"LTNG");
    }

    #[test]
    fn encrypted_flag_roundtrip() {
        let mut pkt = Packet::new(7, b"secret".as_slice());
        pkt.encrypted = true;
        let wire = pkt.serialize();

        let mut parser = Parser::new();
        parser.push(&wire);
        let parsed = parser.next().unwrap().unwrap();
        assert!(parsed.encrypted);
        assert_eq!(&parsed.body[..], b"secret");
    }

    #[test]
    fn empty_body_is_valid() {
        let pkt = Packet::new(9, Vec::new());
        let mut parser = Parser::new();
        parser.push(&pkt.serialize());
        let parsed = parser.next().unwrap().unwrap();
        assert_eq!(parsed.msg_type, 9);
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn same_stream_for_any_split() {
        let packets = vec![
            Packet::new(1, b"first".as_slice()),
            Packet::new(2, vec![0u8; 300]),
            Packet::new(3, Vec::new()),
            Packet::new(4, b"last".as_slice()),
        ];
        let mut wire = Vec::new();
        for pkt in &packets {
            wire.extend_from_slice(&pkt.serialize());
        }

        // One shot.
        let mut parser = Parser::new();
        parser.push(&wire);
        let whole = drain(&mut parser);
        assert_eq!(whole, packets);

        // Byte at a time.
        let mut parser = Parser::new();
        let mut dribble = Vec::new();
        for byte in &wire {
            parser.push(std::slice::from_ref(byte));
            dribble.extend(drain(&mut parser));
        }
        assert_eq!(dribble, packets);

        // Every split point of the first packet boundary region.
        for split in 0..wire.len() {
            let mut parser = Parser::new();
            parser.push(&wire[..split]);
            let mut got = drain(&mut parser);
            parser.push(&wire[split..]);
            got.extend(drain(&mut parser));
            assert_eq!(got, packets, "split at {split}");
        }
    }

    #[test]
    fn partial_frame_retained() {
        let pkt = Packet::new(5, b"payload".as_slice());
        let wire = pkt.serialize();

        let mut parser = Parser::new();
        parser.push(&wire[..PACKET_HEADER_SIZE + 2]);
        assert_eq!(parser.next().unwrap(), None);
        assert_eq!(parser.buffered(), PACKET_HEADER_SIZE + 2);

        parser.push(&wire[PACKET_HEADER_SIZE + 2..]);
        assert_eq!(parser.next().unwrap().unwrap(), pkt);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut wire = Packet::new(1, b"x".as_slice()).serialize();
        wire[0] = 0xFF;
        let mut parser = Parser::new();
        parser.push(&wire);
        match parser.next() {
            Err(FrameError::BadMagic(_)) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_is_fatal() {
        let mut wire = Packet::new(1, b"x".as_slice()).serialize();
        wire[4..8].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes());
        let mut parser = Parser::new();
        parser.push(&wire);
        assert!(matches!(parser.next(), Err(FrameError::Oversized(_))));
    }

    #[test]
    fn payload_without_type_tag_is_fatal() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&PACKET_MAGIC.to_le_bytes());
        wire.extend_from_slice(&2u32.to_le_bytes()); // smaller than the tag
        wire.extend_from_slice(&0u32.to_le_bytes());
        wire.extend_from_slice(&[0, 0]);
        let mut parser = Parser::new();
        parser.push(&wire);
        assert!(matches!(parser.next(), Err(FrameError::Truncated(2))));
    }

    #[test]
    fn clear_drops_partial_input() {
        let wire = Packet::new(5, b"payload".as_slice()).serialize();
        let mut parser = Parser::new();
        parser.push(&wire[..6]);
        parser.clear();
        assert_eq!(parser.buffered(), 0);

        // A fresh complete frame parses normally afterwards.
        parser.push(&wire);
        assert!(parser.next().unwrap().is_some());
    }
}
