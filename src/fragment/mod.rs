//! Fragmentation and reassembly of application payloads.
//!
//! Payloads larger than the negotiated fragment size are split into a
//! numbered run of fragments sharing one [`MessageId`]. The receive side
//! rebuilds them with a [`Reassembler`], which relies on the reliability
//! layer for ordering and rejects anything that breaks the run.

pub mod error;
pub mod fragmenter;
pub mod header;
pub mod id;
pub mod index;
pub mod reassembler;
pub mod series;

pub use error::{FragmentError, FragmentStatus, FragmentationError, ReassemblyError};
pub use fragmenter::{FragmentBatch, FragmentFrame, Fragmenter};
pub use header::FragmentHeader;
pub use id::MessageId;
pub use index::FragmentIndex;
pub use reassembler::{ReassembledMessage, Reassembler};
pub use series::FragmentSeries;
