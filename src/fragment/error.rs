//! Error and status types emitted by the fragmentation layer.

use thiserror::Error;

use super::{FragmentIndex, MessageId};

/// Result of feeding a fragment into a [`FragmentSeries`](crate::fragment::FragmentSeries).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentStatus {
    /// The payload still expects more fragments.
    Incomplete,
    /// The fragment completed the payload.
    Complete,
}

/// Errors produced by [`FragmentSeries`](crate::fragment::FragmentSeries).
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    /// The fragment belongs to a different payload.
    #[error("fragment message mismatch: expected {expected}, found {found}")]
    MessageMismatch {
        expected: MessageId,
        found: MessageId,
    },
    /// A fragment arrived out of order or repeated an earlier index.
    #[error("fragment index mismatch: expected {expected}, found {found}")]
    IndexMismatch {
        expected: FragmentIndex,
        found: FragmentIndex,
    },
    /// The series already consumed a last fragment.
    #[error("fragment series already complete")]
    SeriesComplete,
    /// The fragment index overflowed `u32::MAX`.
    #[error("fragment index overflow after {last}")]
    IndexOverflow { last: FragmentIndex },
}

/// Errors produced while fragmenting outbound payloads.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FragmentationError {
    /// The payload length does not fit the header's length field.
    #[error("payload of {len} bytes cannot be described by a fragment header")]
    PayloadTooLarge { len: usize },
    /// The fragment index cannot advance because it would overflow `u32`.
    #[error("fragment index overflow after {last}")]
    IndexOverflow { last: FragmentIndex },
}

/// Errors produced while reassembling inbound fragments.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    /// The fragment broke the ordering of its series.
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    /// A continuation fragment arrived without its first fragment.
    #[error("fragment {index} of message {message_id} arrived without a first fragment")]
    MissingFirstFragment {
        message_id: MessageId,
        index: FragmentIndex,
    },
    /// A new payload started while another was still incomplete.
    #[error("message {found} started while message {in_progress} is incomplete")]
    Interleaved {
        in_progress: MessageId,
        found: MessageId,
    },
    /// The advertised total exceeds the negotiated maximum message size.
    #[error("message {message_id} declares {total_len} bytes; limit is {limit}")]
    MessageTooLarge {
        message_id: MessageId,
        total_len: usize,
        limit: usize,
    },
    /// A fragment disagreed with the total length announced earlier.
    #[error("message {message_id} changed its total length from {expected} to {found}")]
    TotalLengthMismatch {
        message_id: MessageId,
        expected: u32,
        found: u32,
    },
    /// Fragments carried more or fewer bytes than announced.
    #[error("message {message_id} carried {received} bytes; {expected} were announced")]
    LengthMismatch {
        message_id: MessageId,
        expected: usize,
        received: usize,
    },
}
