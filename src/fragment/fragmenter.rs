//! Outbound helper that splits payloads into fragments.
//!
//! [`Fragmenter`] slices a [`Bytes`] payload without copying, tagging each
//! piece with a [`FragmentHeader`]. It owns the stream's [`MessageId`]
//! counter so each payload gets a fresh identifier.

use std::num::NonZeroUsize;

use bytes::Bytes;

use super::{FragmentHeader, FragmentIndex, FragmentationError, MessageId};

/// Splits payloads into fragment-sized pieces.
#[derive(Debug)]
pub struct Fragmenter {
    max_fragment_size: NonZeroUsize,
    last_message_id: MessageId,
}

impl Fragmenter {
    /// Create a fragmenter that caps fragment payloads at `max_fragment_size`
    /// bytes. The first payload is tagged with message id 1.
    #[must_use]
    pub const fn new(max_fragment_size: NonZeroUsize) -> Self {
        Self {
            max_fragment_size,
            last_message_id: MessageId::new(0),
        }
    }

    /// Return the maximum fragment payload size in bytes.
    #[must_use]
    pub const fn max_fragment_size(&self) -> NonZeroUsize { self.max_fragment_size }

    /// Advance and return the message id counter.
    pub fn next_message_id(&mut self) -> MessageId {
        self.last_message_id = self.last_message_id.next();
        self.last_message_id
    }

    /// Split `payload` into fragments under a fresh [`MessageId`].
    ///
    /// An empty payload yields a single empty fragment.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentationError::PayloadTooLarge`] if the length does not
    /// fit in a `u32`, or [`FragmentationError::IndexOverflow`] if the
    /// fragment index would overflow.
    pub fn fragment(&mut self, payload: Bytes) -> Result<FragmentBatch, FragmentationError> {
        let message_id = self.next_message_id();
        self.fragment_with_id(message_id, payload)
    }

    /// Split `payload` into fragments tagged with `message_id`.
    ///
    /// # Errors
    ///
    /// See [`Fragmenter::fragment`].
    pub fn fragment_with_id(
        &self,
        message_id: MessageId,
        payload: Bytes,
    ) -> Result<FragmentBatch, FragmentationError> {
        let fragments = self.build_fragments(message_id, payload)?;
        Ok(FragmentBatch::new(message_id, fragments))
    }

    fn build_fragments(
        &self,
        message_id: MessageId,
        payload: Bytes,
    ) -> Result<Vec<FragmentFrame>, FragmentationError> {
        let total = payload.len();
        let total_len = u32::try_from(total)
            .map_err(|_| FragmentationError::PayloadTooLarge { len: total })?;
        if payload.is_empty() {
            let header = FragmentHeader::single(message_id, 0);
            return Ok(vec![FragmentFrame::new(header, payload)]);
        }

        let max = self.max_fragment_size.get();
        let mut fragments = Vec::with_capacity(total.div_ceil(max));
        let mut index = FragmentIndex::zero();
        let mut offset = 0usize;

        while offset < total {
            let end = (offset + max).min(total);
            let is_last = end == total;
            fragments.push(FragmentFrame::new(
                FragmentHeader::new(message_id, index, total_len, is_last),
                payload.slice(offset..end),
            ));

            if is_last {
                break;
            }

            offset = end;
            index = index
                .checked_increment()
                .ok_or(FragmentationError::IndexOverflow { last: index })?;
        }

        Ok(fragments)
    }
}

/// Metadata and payload for a single outbound fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentFrame {
    header: FragmentHeader,
    payload: Bytes,
}

impl FragmentFrame {
    /// Construct a new fragment frame.
    #[must_use]
    pub fn new(header: FragmentHeader, payload: Bytes) -> Self { Self { header, payload } }

    /// Return the fragment header.
    #[must_use]
    pub fn header(&self) -> &FragmentHeader { &self.header }

    /// Return the fragment payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Consume the frame, returning its components.
    #[must_use]
    pub fn into_parts(self) -> (FragmentHeader, Bytes) { (self.header, self.payload) }
}

/// Fragments produced for a single payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentBatch {
    message_id: MessageId,
    fragments: Vec<FragmentFrame>,
}

impl FragmentBatch {
    fn new(message_id: MessageId, fragments: Vec<FragmentFrame>) -> Self {
        debug_assert!(!fragments.is_empty(), "fragment batches must not be empty");
        Self {
            message_id,
            fragments,
        }
    }

    /// Return the [`MessageId`] shared by all fragments.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Return the fragments as a slice.
    #[must_use]
    pub fn fragments(&self) -> &[FragmentFrame] { self.fragments.as_slice() }

    /// Number of fragments in the batch.
    #[expect(
        clippy::len_without_is_empty,
        reason = "batches are guaranteed non-empty"
    )]
    #[must_use]
    pub fn len(&self) -> usize { self.fragments.len() }

    /// Whether the payload required more than one fragment.
    #[must_use]
    pub fn is_fragmented(&self) -> bool { self.len() > 1 }
}

impl IntoIterator for FragmentBatch {
    type Item = FragmentFrame;
    type IntoIter = std::vec::IntoIter<FragmentFrame>;

    fn into_iter(self) -> Self::IntoIter { self.fragments.into_iter() }
}
