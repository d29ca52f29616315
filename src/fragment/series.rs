//! Ordering tracker for the fragments of a single payload.

use super::{FragmentError, FragmentHeader, FragmentIndex, FragmentStatus, MessageId};

/// Track the expected ordering of fragments for a single payload.
///
/// Fragments reach the series already ordered and de-duplicated by the
/// reliability layer, so any gap or repeat is an error.
#[derive(Clone, Debug)]
pub struct FragmentSeries {
    message_id: MessageId,
    next_index: FragmentIndex,
    complete: bool,
}

impl FragmentSeries {
    /// Create a new series for `message_id`, expecting the first fragment.
    #[must_use]
    pub const fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            next_index: FragmentIndex::zero(),
            complete: false,
        }
    }

    /// Return the message identifier tracked by this series.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Return whether the series has consumed the final fragment.
    #[must_use]
    pub const fn is_complete(&self) -> bool { self.complete }

    /// Accept a fragment and update the expected index.
    ///
    /// # Examples
    ///
    /// ```
    /// use tunnelframe::fragment::{
    ///     FragmentHeader,
    ///     FragmentIndex,
    ///     FragmentSeries,
    ///     FragmentStatus,
    ///     MessageId,
    /// };
    /// let id = MessageId::new(99);
    /// let mut series = FragmentSeries::new(id);
    /// let first = FragmentHeader::new(id, FragmentIndex::zero(), 8, false);
    /// let last = FragmentHeader::new(id, FragmentIndex::new(1), 8, true);
    /// assert_eq!(series.accept(first), Ok(FragmentStatus::Incomplete));
    /// assert_eq!(series.accept(last), Ok(FragmentStatus::Complete));
    /// assert!(series.is_complete());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError::MessageMismatch`] when the fragment belongs to
    /// a different payload, [`FragmentError::IndexMismatch`] when the index is
    /// not the expected one, [`FragmentError::SeriesComplete`] after the final
    /// fragment, and [`FragmentError::IndexOverflow`] when the index cannot
    /// advance further.
    pub fn accept(&mut self, fragment: FragmentHeader) -> Result<FragmentStatus, FragmentError> {
        if fragment.message_id() != self.message_id {
            return Err(FragmentError::MessageMismatch {
                expected: self.message_id,
                found: fragment.message_id(),
            });
        }

        if self.complete {
            return Err(FragmentError::SeriesComplete);
        }

        if fragment.fragment_index() != self.next_index {
            return Err(FragmentError::IndexMismatch {
                expected: self.next_index,
                found: fragment.fragment_index(),
            });
        }

        if fragment.is_last_fragment() {
            self.complete = true;
            return Ok(FragmentStatus::Complete);
        }

        let Some(incremented) = fragment.fragment_index().checked_increment() else {
            return Err(FragmentError::IndexOverflow {
                last: fragment.fragment_index(),
            });
        };

        self.next_index = incremented;
        Ok(FragmentStatus::Incomplete)
    }
}
