use serde::{Deserialize, Serialize};

use super::{FragmentIndex, MessageId};

/// Header describing a single fragment.
///
/// Every fragment repeats the total payload length so the receiver can size
/// its buffer from the first fragment and verify the result on the last.
///
/// # Examples
///
/// ```
/// use tunnelframe::fragment::{FragmentHeader, FragmentIndex, MessageId};
/// let header = FragmentHeader::new(MessageId::new(7), FragmentIndex::zero(), 12, false);
/// assert_eq!(header.message_id().get(), 7);
/// assert_eq!(header.total_len(), 12);
/// assert!(!header.is_last_fragment());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentHeader {
    message_id: MessageId,
    fragment_index: FragmentIndex,
    total_len: u32,
    is_last_fragment: bool,
}

impl FragmentHeader {
    /// Create a new fragment header.
    #[must_use]
    pub const fn new(
        message_id: MessageId,
        fragment_index: FragmentIndex,
        total_len: u32,
        is_last_fragment: bool,
    ) -> Self {
        Self {
            message_id,
            fragment_index,
            total_len,
            is_last_fragment,
        }
    }

    /// Header for a payload that fits in one fragment.
    #[must_use]
    pub const fn single(message_id: MessageId, total_len: u32) -> Self {
        Self::new(message_id, FragmentIndex::zero(), total_len, true)
    }

    /// Return the payload identifier.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Return the fragment position relative to the payload.
    #[must_use]
    pub const fn fragment_index(&self) -> FragmentIndex { self.fragment_index }

    /// Return the length of the complete payload in bytes.
    #[must_use]
    pub const fn total_len(&self) -> u32 { self.total_len }

    /// Report whether this is the final fragment.
    #[must_use]
    pub const fn is_last_fragment(&self) -> bool { self.is_last_fragment }
}
