//! Inbound helper that stitches fragments back into complete payloads.
//!
//! [`Reassembler`] mirrors the outbound [`Fragmenter`](crate::fragment::Fragmenter).
//! Fragments arrive in sequence order, so at most one payload is ever in
//! progress. The announced total length is checked against the negotiated
//! maximum before anything is buffered, and again when the last fragment
//! lands.

use std::num::NonZeroUsize;

use bytes::{Bytes, BytesMut};

use super::{FragmentHeader, FragmentSeries, FragmentStatus, MessageId, ReassemblyError};

#[derive(Debug)]
struct PartialMessage {
    series: FragmentSeries,
    total_len: u32,
    buffer: BytesMut,
}

impl PartialMessage {
    fn new(series: FragmentSeries, total_len: u32, payload: &[u8]) -> Self {
        let mut buffer = BytesMut::with_capacity(total_len as usize);
        buffer.extend_from_slice(payload);
        Self {
            series,
            total_len,
            buffer,
        }
    }
}

/// Container for a fully re-assembled payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReassembledMessage {
    message_id: MessageId,
    payload: Bytes,
}

impl ReassembledMessage {
    /// Construct a new [`ReassembledMessage`].
    #[must_use]
    pub fn new(message_id: MessageId, payload: Bytes) -> Self {
        Self {
            message_id,
            payload,
        }
    }

    /// Identifier shared by the fragments that formed this payload.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Borrow the re-assembled payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Consume the message, returning the payload bytes.
    #[must_use]
    pub fn into_payload(self) -> Bytes { self.payload }
}

/// Stateful fragment re-assembler for one direction of one stream.
#[derive(Debug)]
pub struct Reassembler {
    max_message_size: NonZeroUsize,
    in_progress: Option<PartialMessage>,
}

impl Reassembler {
    /// Create a re-assembler that rejects payloads above `max_message_size`.
    #[must_use]
    pub fn new(max_message_size: NonZeroUsize) -> Self {
        Self {
            max_message_size,
            in_progress: None,
        }
    }

    /// Process the next fragment in sequence order.
    ///
    /// Returns `Ok(Some(_))` when the fragment completes the payload and
    /// `Ok(None)` while more fragments are required. A single-fragment payload
    /// is returned without copying.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError`] when the fragment does not continue the
    /// payload in progress, starts a payload while another is incomplete,
    /// or breaks the announced length. Partial state is discarded on error.
    pub fn push(
        &mut self,
        header: FragmentHeader,
        payload: Bytes,
    ) -> Result<Option<ReassembledMessage>, ReassemblyError> {
        let result = self.push_inner(header, payload);
        if result.is_err() {
            self.in_progress = None;
        }
        result
    }

    fn push_inner(
        &mut self,
        header: FragmentHeader,
        payload: Bytes,
    ) -> Result<Option<ReassembledMessage>, ReassemblyError> {
        let message_id = header.message_id();

        let Some(partial) = self.in_progress.as_mut() else {
            return self.start(header, payload);
        };

        if partial.series.message_id() != message_id {
            return Err(ReassemblyError::Interleaved {
                in_progress: partial.series.message_id(),
                found: message_id,
            });
        }
        if header.total_len() != partial.total_len {
            return Err(ReassemblyError::TotalLengthMismatch {
                message_id,
                expected: partial.total_len,
                found: header.total_len(),
            });
        }

        let status = partial.series.accept(header)?;
        let expected = partial.total_len as usize;
        let received = partial.buffer.len() + payload.len();
        if received > expected {
            return Err(ReassemblyError::LengthMismatch {
                message_id,
                expected,
                received,
            });
        }
        partial.buffer.extend_from_slice(&payload);

        match status {
            FragmentStatus::Incomplete => Ok(None),
            FragmentStatus::Complete => {
                let Some(done) = self.in_progress.take() else {
                    return Ok(None);
                };
                Self::finish(message_id, expected, done.buffer.freeze()).map(Some)
            }
        }
    }

    fn start(
        &mut self,
        header: FragmentHeader,
        payload: Bytes,
    ) -> Result<Option<ReassembledMessage>, ReassemblyError> {
        let message_id = header.message_id();
        if header.fragment_index().get() != 0 {
            return Err(ReassemblyError::MissingFirstFragment {
                message_id,
                index: header.fragment_index(),
            });
        }
        let total_len = header.total_len() as usize;
        self.assert_within_limit(message_id, total_len)?;

        let mut series = FragmentSeries::new(message_id);
        match series.accept(header)? {
            FragmentStatus::Complete => Self::finish(message_id, total_len, payload).map(Some),
            FragmentStatus::Incomplete => {
                if payload.len() > total_len {
                    return Err(ReassemblyError::LengthMismatch {
                        message_id,
                        expected: total_len,
                        received: payload.len(),
                    });
                }
                self.in_progress = Some(PartialMessage::new(series, header.total_len(), &payload));
                Ok(None)
            }
        }
    }

    fn finish(
        message_id: MessageId,
        expected: usize,
        payload: Bytes,
    ) -> Result<ReassembledMessage, ReassemblyError> {
        if payload.len() != expected {
            return Err(ReassemblyError::LengthMismatch {
                message_id,
                expected,
                received: payload.len(),
            });
        }
        Ok(ReassembledMessage::new(message_id, payload))
    }

    fn assert_within_limit(&self, message_id: MessageId, total_len: usize) -> Result<(), ReassemblyError> {
        let limit = self.max_message_size.get();
        if total_len > limit {
            return Err(ReassemblyError::MessageTooLarge {
                message_id,
                total_len,
                limit,
            });
        }
        Ok(())
    }

    /// Whether a payload is partially assembled.
    #[must_use]
    pub fn is_in_progress(&self) -> bool { self.in_progress.is_some() }

    /// Bytes buffered for the payload in progress.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.in_progress
            .as_ref()
            .map_or(0, |partial| partial.buffer.len())
    }

    /// Discard any partially assembled payload.
    pub fn clear(&mut self) { self.in_progress = None; }
}
