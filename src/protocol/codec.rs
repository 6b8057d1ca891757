//! Frame codec
//!
//! Encoding and decoding of single frames on a byte stream.
//!
//! ## Wire Format
//! ```text
//! ┌──────────┬─────────────────────────────┐
//! │ Len (2)  │      Payload (Len bytes)    │
//! └──────────┴─────────────────────────────┘
//! ```
//! `Len` is an unsigned big-endian 16-bit integer, so a payload carries at
//! most 65535 bytes. Short reads and short writes are errors; a partial frame
//! is never returned.

use std::io::{self, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{NetError, Result};

/// Header size: 2 bytes payload length
pub const HEADER_SIZE: usize = 2;

/// Maximum payload size carried by one frame
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Reads and writes one frame at a time.
///
/// A connection owns one codec for its whole lifetime. The reader thread calls
/// `decode` and the writer thread calls `encode`, so implementations must be
/// `Send + Sync` but never see concurrent calls of the same kind.
pub trait Codec: Send + Sync + 'static {
    /// Read exactly one full frame, or fail. End of stream is an error.
    fn decode(&self, reader: &mut dyn Read) -> Result<Bytes>;

    /// Write exactly one frame as a unit
    fn encode(&self, writer: &mut dyn Write, frame: &[u8]) -> Result<()>;

    /// Largest payload this codec can carry
    fn max_frame_len(&self) -> usize {
        usize::MAX
    }
}

/// The default codec: 2-byte big-endian length prefix + payload
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedCodec;

impl Codec for LengthPrefixedCodec {
    fn decode(&self, reader: &mut dyn Read) -> Result<Bytes> {
        read_frame(reader)
    }

    fn encode(&self, writer: &mut dyn Write, frame: &[u8]) -> Result<()> {
        write_frame(writer, frame)
    }

    fn max_frame_len(&self) -> usize {
        MAX_FRAME_LEN
    }
}

// =============================================================================
// Buffer Encoding/Decoding
// =============================================================================

/// Encode a frame to bytes
///
/// Format: payload_len (2) + payload
pub fn encode_frame(frame: &[u8]) -> Result<Bytes> {
    let len = check_len(frame)?;

    let mut message = BytesMut::with_capacity(HEADER_SIZE + frame.len());
    message.put_u16(len);
    message.put_slice(frame);

    Ok(message.freeze())
}

/// Decode one frame from the front of a buffer
///
/// Returns the payload and the number of bytes consumed, or `None` if the
/// buffer does not yet hold a complete frame.
pub fn decode_frame(bytes: &[u8]) -> Option<(Bytes, usize)> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }

    let payload_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let total_len = HEADER_SIZE + payload_len;
    if bytes.len() < total_len {
        return None;
    }

    let payload = Bytes::copy_from_slice(&bytes[HEADER_SIZE..total_len]);
    Some((payload, total_len))
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete frame from a stream
///
/// Blocks until a complete frame is received or an error occurs. End of
/// stream before the first header byte is `io::ErrorKind::UnexpectedEof`
/// (the peer closed between frames); end of stream anywhere after it is a
/// truncated frame and reported as `NetError::Protocol`.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Bytes> {
    // Read header first
    let mut header = [0u8; HEADER_SIZE];
    match fill(reader, &mut header)? {
        0 => {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream").into());
        }
        HEADER_SIZE => {}
        _ => return Err(truncated()),
    }

    let payload_len = u16::from_be_bytes(header) as usize;

    // Read payload
    let mut payload = vec![0u8; payload_len];
    if fill(reader, &mut payload)? < payload_len {
        return Err(truncated());
    }

    Ok(Bytes::from(payload))
}

/// Read until `buf` is full or the stream ends; returns the bytes read
fn fill<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn truncated() -> NetError {
    NetError::Protocol("truncated frame".to_string())
}

/// Write a frame to a stream
///
/// Header and payload go out in a single `write_all`, so a buffered writer
/// never holds half a frame between calls.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, frame: &[u8]) -> Result<()> {
    let message = encode_frame(frame)?;
    writer.write_all(&message)?;
    Ok(())
}

fn check_len(frame: &[u8]) -> Result<u16> {
    u16::try_from(frame.len()).map_err(|_| NetError::FrameTooLarge {
        len: frame.len(),
        max: MAX_FRAME_LEN,
    })
}
