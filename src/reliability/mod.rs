//! Sequencing, retransmission, and credit accounting for one stream.
//!
//! The send side is a [`SendWindow`]: every data unit gets the next
//! sequence number and stays in the retransmission buffer until an
//! acknowledgment covers it. The receive side is a [`ReceiveWindow`], which
//! delivers units in sequence order, buffers early arrivals, and builds the
//! acknowledgments that drive the peer's send window.

use bytes::Bytes;

use crate::{fragment::FragmentHeader, message::ContainerTag};

pub mod receiver;
pub mod sender;

pub use receiver::ReceiveWindow;
pub use sender::{AckOutcome, RetransmitExhausted, RetransmitPolicy, SendWindow, Transmit};

/// Payload occupying one sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unit {
    /// One fragment of an application or login payload.
    Data {
        fragment: FragmentHeader,
        tag: ContainerTag,
        payload: Bytes,
    },
    /// End of the sender's data.
    Fin,
}

impl Unit {
    /// Whether the unit is a FIN marker.
    #[must_use]
    pub fn is_fin(&self) -> bool { matches!(self, Self::Fin) }
}
