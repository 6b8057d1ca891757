//! Protocol Module
//!
//! Defines how frames are delimited on the wire.
//!
//! ## Frame Format (default codec)
//!
//! ```text
//! ┌──────────┬─────────────────────────────┐
//! │ Len (2)  │         Payload             │
//! └──────────┴─────────────────────────────┘
//! ```
//!
//! Other framings plug in through the `Codec` trait.

mod codec;

pub use codec::{
    decode_frame, encode_frame, read_frame, write_frame, Codec, LengthPrefixedCodec,
    HEADER_SIZE, MAX_FRAME_LEN,
};
