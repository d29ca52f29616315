//! Error types surfaced by the tunnel stream engine.
//!
//! Application-facing operations return one of the narrow enums below so
//! callers can match on the failure that is relevant to them. Protocol
//! violations committed by the peer never reach the caller as `Err`; the
//! owning stream closes and reports a status instead.

use thiserror::Error;

use crate::{
    connection::ConnectionError,
    fragment::{FragmentationError, ReassemblyError},
    message::{SeqNum, StreamId},
    stream::LifecycleState,
};

/// Invalid parameters supplied when building a stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConstructionError {
    /// The stream name was empty.
    #[error("stream name must not be empty")]
    EmptyName,
    /// The stream name exceeded the wire limit.
    #[error("stream name is {len} bytes; at most {max} are allowed")]
    NameTooLong { len: usize, max: usize },
    /// The class of service contradicts itself.
    #[error("invalid class of service: {0}")]
    InvalidClassOfService(&'static str),
    /// Authentication was requested without credentials to present.
    #[error("authentication requires login credentials")]
    MissingCredentials,
}

/// Failures raised by the buffer pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AllocationError {
    /// The requested buffer exceeds the negotiated maximum message size.
    #[error("requested {requested} bytes exceeds maximum message size {limit}")]
    TooLarge { requested: usize, limit: usize },
    /// The stream already holds its guaranteed share and the shared pool is full.
    #[error("stream {stream} has no buffers left (limit {limit})")]
    StreamLimit { stream: StreamId, limit: usize },
    /// Every buffer on the connection is in use.
    #[error("buffer pool exhausted ({limit} buffers in use)")]
    Exhausted { limit: usize },
    /// A buffer was returned to the pool more than once.
    #[error("buffer {token} released twice")]
    DoubleRelease { token: u64 },
    /// The buffer belongs to another pool.
    #[error("buffer was not issued by this pool")]
    ForeignBuffer,
    /// The stream handle does not refer to a live stream.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
}

/// Reasons an open request cannot be issued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum OpenError {
    /// The supplied parameters are invalid.
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    /// The connection cannot carry traffic.
    #[error("connection is not usable")]
    ConnectionUnavailable,
    /// An open request for the same identity is still outstanding.
    #[error("an open request for this stream is already outstanding as {existing}")]
    Duplicate { existing: StreamId },
    /// No further stream identifiers can be allocated.
    #[error("stream identifiers exhausted")]
    StreamIdsExhausted,
}

/// Reasons a payload cannot be submitted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubmitError {
    /// The stream handle does not refer to a live stream.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
    /// The stream is not accepting application data.
    #[error("stream {stream} is {state:?}")]
    NotOpen {
        stream: StreamId,
        state: LifecycleState,
    },
    /// The payload exceeds the negotiated maximum message size.
    #[error("payload of {len} bytes exceeds maximum message size {limit}")]
    TooLarge { len: usize, limit: usize },
    /// The container tag is reserved for the login exchange.
    #[error("container tag is reserved")]
    ReservedTag,
    /// The buffer was allocated for a different stream.
    #[error("buffer belongs to stream {owner}, not {stream}")]
    ForeignBuffer { owner: StreamId, stream: StreamId },
    /// The payload could not be split into fragments.
    #[error(transparent)]
    Fragmentation(#[from] FragmentationError),
    /// The outbound sequence space is exhausted.
    #[error("sequence numbers exhausted")]
    SequenceExhausted,
    /// No pool slot is free to hold the payload until it is acknowledged.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// Ways a peer can break the tunnel stream protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolViolation {
    /// An acknowledgment covered data that was never sent.
    #[error("acknowledgment for {seq} which was never sent")]
    UnsentSequence { seq: SeqNum },
    /// Ack or nak ranges were unordered, overlapping, or too numerous.
    #[error("malformed acknowledgment ranges")]
    MalformedRanges,
    /// A data unit arrived outside the advertised receive window.
    #[error("sequence {seq} outside receive window [{expected}, +{window})")]
    OutOfWindow {
        seq: SeqNum,
        expected: SeqNum,
        window: u32,
    },
    /// Too many out-of-order data units are buffered.
    #[error("out-of-order limit of {limit} reached at sequence {seq}")]
    OutOfOrderLimit { seq: SeqNum, limit: usize },
    /// The sequence space wrapped.
    #[error("sequence numbers exhausted")]
    SequenceExhausted,
    /// Fragments could not be reassembled.
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    /// A message arrived in a state that does not accept it.
    #[error("unexpected {opcode} message while {state:?}")]
    UnexpectedMessage {
        opcode: &'static str,
        state: LifecycleState,
    },
    /// The login exchange payload could not be decoded.
    #[error("malformed login response: {0}")]
    MalformedLogin(String),
    /// The negotiated class of service was unacceptable.
    #[error("negotiation failed: {0}")]
    Negotiation(ConstructionError),
}

/// Umbrella error for callers that prefer a single type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TunnelError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
