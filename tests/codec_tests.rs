//! Codec Tests
//!
//! Tests for frame encoding/decoding.

use std::io::{Cursor, ErrorKind};

use netloop::protocol::{
    decode_frame, encode_frame, read_frame, write_frame, Codec, LengthPrefixedCodec, HEADER_SIZE,
    MAX_FRAME_LEN,
};
use netloop::NetError;

// =============================================================================
// Buffer Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_layout() {
    let encoded = encode_frame(b"hello").unwrap();
    assert_eq!(&encoded[..], &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
}

#[test]
fn test_encode_decode_empty_frame() {
    let encoded = encode_frame(b"").unwrap();
    assert_eq!(&encoded[..], &[0x00, 0x00]);

    let (payload, consumed) = decode_frame(&encoded).unwrap();
    assert!(payload.is_empty());
    assert_eq!(consumed, HEADER_SIZE);
}

#[test]
fn test_encode_max_frame() {
    let payload = vec![7u8; MAX_FRAME_LEN];
    let encoded = encode_frame(&payload).unwrap();
    assert_eq!(encoded.len(), HEADER_SIZE + MAX_FRAME_LEN);
    assert_eq!(&encoded[..2], &[0xFF, 0xFF]);
}

#[test]
fn test_encode_too_large() {
    let payload = vec![0u8; MAX_FRAME_LEN + 1];
    match encode_frame(&payload) {
        Err(NetError::FrameTooLarge { len, max }) => {
            assert_eq!(len, MAX_FRAME_LEN + 1);
            assert_eq!(max, MAX_FRAME_LEN);
        }
        other => panic!("Expected FrameTooLarge, got {:?}", other),
    }
}

#[test]
fn test_decode_incomplete() {
    assert!(decode_frame(&[]).is_none());
    assert!(decode_frame(&[0x00]).is_none());
    assert!(decode_frame(&[0x00, 0x05, b'h', b'e']).is_none());
}

#[test]
fn test_decode_consecutive_frames() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&encode_frame(b"first").unwrap());
    buf.extend_from_slice(&encode_frame(b"second").unwrap());

    let (one, used) = decode_frame(&buf).unwrap();
    assert_eq!(&one[..], b"first");

    let (two, rest) = decode_frame(&buf[used..]).unwrap();
    assert_eq!(&two[..], b"second");
    assert_eq!(used + rest, buf.len());
}

// =============================================================================
// Stream I/O Tests
// =============================================================================

#[test]
fn test_stream_write_read() {
    let mut buffer = Vec::new();
    write_frame(&mut buffer, b"ping").unwrap();
    write_frame(&mut buffer, b"").unwrap();
    write_frame(&mut buffer, b"pong").unwrap();

    let mut cursor = Cursor::new(buffer);
    assert_eq!(&read_frame(&mut cursor).unwrap()[..], b"ping");
    assert!(read_frame(&mut cursor).unwrap().is_empty());
    assert_eq!(&read_frame(&mut cursor).unwrap()[..], b"pong");
}

#[test]
fn test_read_at_end_of_stream() {
    let mut cursor = Cursor::new(Vec::new());
    match read_frame(&mut cursor) {
        Err(NetError::Io(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
        other => panic!("Expected EOF error, got {:?}", other),
    }
}

#[test]
fn test_read_truncated_payload() {
    // Header promises 5 bytes, only 2 arrive
    let mut cursor = Cursor::new(vec![0x00, 0x05, b'h', b'e']);
    match read_frame(&mut cursor) {
        Err(NetError::Protocol(msg)) => assert!(msg.contains("truncated")),
        other => panic!("Expected truncated frame, got {:?}", other),
    }
}

#[test]
fn test_read_truncated_header() {
    let mut cursor = Cursor::new(vec![0x00]);
    assert!(matches!(read_frame(&mut cursor), Err(NetError::Protocol(_))));
}

#[test]
fn test_read_stops_cleanly_between_frames() {
    let mut buffer = Vec::new();
    write_frame(&mut buffer, b"only").unwrap();

    let mut cursor = Cursor::new(buffer);
    assert_eq!(&read_frame(&mut cursor).unwrap()[..], b"only");
    match read_frame(&mut cursor) {
        Err(NetError::Io(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
        other => panic!("Expected EOF error, got {:?}", other),
    }
}

#[test]
fn test_write_too_large_writes_nothing() {
    let mut buffer = Vec::new();
    let payload = vec![0u8; MAX_FRAME_LEN + 1];
    assert!(matches!(
        write_frame(&mut buffer, &payload),
        Err(NetError::FrameTooLarge { .. })
    ));
    assert!(buffer.is_empty());
}

// =============================================================================
// Codec Trait Tests
// =============================================================================

#[test]
fn test_length_prefixed_codec_as_trait_object() {
    let codec: Box<dyn Codec> = Box::new(LengthPrefixedCodec);
    assert_eq!(codec.max_frame_len(), MAX_FRAME_LEN);

    let mut buffer = Vec::new();
    codec.encode(&mut buffer, b"framed").unwrap();
    assert_eq!(buffer, encode_frame(b"framed").unwrap().to_vec());

    let mut cursor = Cursor::new(buffer);
    assert_eq!(&codec.decode(&mut cursor).unwrap()[..], b"framed");
}
