//! Wire codec for tunnel stream messages.
//!
//! Every [`TunnelMessage`] is serialized with bincode and carried in a
//! length-prefixed frame produced by `tokio_util`'s [`LengthDelimitedCodec`]
//! (4-byte big-endian prefix). The same encoding is used by the in-memory
//! loopback connection so both transports exercise identical bytes.

use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::message::TunnelMessage;

/// Minimum frame length in bytes.
///
/// Frame lengths passed to codec constructors are clamped to at least this
/// value to leave room for message headers.
pub const MIN_FRAME_LENGTH: usize = 64;

/// Maximum frame length in bytes (16 MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Frame limit used when none is configured (1 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Frame bytes set aside for the fields wrapped around a data payload.
pub const DATA_HEADER_ALLOWANCE: usize = MIN_FRAME_LENGTH;

pub(crate) fn clamp_frame_length(value: usize) -> usize {
    value.clamp(MIN_FRAME_LENGTH, MAX_FRAME_LENGTH)
}

/// Largest fragment payload whose data message fits in a frame of
/// `max_frame_length` bytes.
#[must_use]
pub fn max_fragment_for(max_frame_length: usize) -> usize {
    clamp_frame_length(max_frame_length).saturating_sub(DATA_HEADER_ALLOWANCE)
}

/// Errors raised while encoding or decoding messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    /// A frame held more bytes than its message consumed.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("frame error: {0}")]
    Io(#[from] io::Error),
}

/// Serialize a message without framing.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if bincode cannot serialize the message.
pub fn encode_message(message: &TunnelMessage) -> Result<Bytes, CodecError> {
    let bytes = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
    Ok(Bytes::from(bytes))
}

/// Deserialize one message occupying the whole of `bytes`.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed input and
/// [`CodecError::TrailingBytes`] if the message does not fill the buffer.
pub fn decode_message(bytes: &[u8]) -> Result<TunnelMessage, CodecError> {
    let (message, used): (TunnelMessage, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    if used != bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - used));
    }
    Ok(message)
}

/// Length-delimited bincode codec for [`TunnelMessage`].
#[derive(Debug)]
pub struct TunnelCodec {
    framing: LengthDelimitedCodec,
    max_frame_length: usize,
}

impl TunnelCodec {
    /// Construct a codec accepting frames up to `max_frame_length` bytes,
    /// clamped to [`MIN_FRAME_LENGTH`]..=[`MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        let max_frame_length = clamp_frame_length(max_frame_length);
        Self {
            framing: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
        }
    }

    /// Return the maximum frame length accepted by this codec.
    #[must_use]
    pub fn max_frame_length(&self) -> usize { self.max_frame_length }
}

impl Default for TunnelCodec {
    fn default() -> Self { Self::new(DEFAULT_MAX_FRAME_LENGTH) }
}

impl Decoder for TunnelCodec {
    type Item = TunnelMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing.decode(src)? {
            Some(frame) => decode_message(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<TunnelMessage> for TunnelCodec {
    type Error = CodecError;

    fn encode(&mut self, item: TunnelMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = encode_message(&item)?;
        self.framing.encode(payload, dst)?;
        Ok(())
    }
}
