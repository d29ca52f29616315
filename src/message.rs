//! Protocol messages exchanged between tunnel stream endpoints.
//!
//! Each opcode is its own variant of [`TunnelMessage`] and carries only the
//! fields that opcode needs. Identifiers are small newtypes so sequence
//! numbers, stream ids, and fragment ids cannot be mixed up.

use bytes::Bytes;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

use crate::{cos::ClassOfService, fragment::FragmentHeader, range::RangeList};

/// Identifier of a tunnel stream, scoped to one connection.
///
/// Streams opened by the consumer role use positive ids; streams opened by
/// the provider role use negative ids so both sides can allocate without
/// coordination.
///
/// # Examples
///
/// ```
/// use tunnelframe::message::StreamId;
/// let id = StreamId::new(5);
/// assert_eq!(id.get(), 5);
/// ```
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct StreamId(i32);

impl StreamId {
    /// Create a stream identifier.
    #[must_use]
    pub const fn new(value: i32) -> Self { Self(value) }

    /// Return the numeric identifier.
    #[must_use]
    pub const fn get(self) -> i32 { self.0 }
}

/// Per-stream, per-direction sequence number assigned to every data unit.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct SeqNum(u32);

impl SeqNum {
    /// Create a sequence number.
    #[must_use]
    pub const fn new(value: u32) -> Self { Self(value) }

    /// The first sequence number assigned on a stream.
    #[must_use]
    pub const fn zero() -> Self { Self(0) }

    /// Return the numeric value.
    #[must_use]
    pub const fn get(self) -> u32 { self.0 }

    /// Return the following sequence number, or `None` once the space is exhausted.
    #[must_use]
    pub fn checked_next(self) -> Option<Self> { self.0.checked_add(1).map(Self) }

    /// Return the preceding sequence number, or `None` for zero.
    #[must_use]
    pub fn checked_prev(self) -> Option<Self> { self.0.checked_sub(1).map(Self) }
}

/// Describes how a payload carried by a data message is encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerTag {
    /// Raw application bytes.
    Opaque,
    /// An encoded message of the outer message format.
    Message,
    /// JSON text.
    Json,
    /// Embedded login exchange used by stream authentication. Applications
    /// cannot submit payloads with this tag.
    Login,
}

/// Stream-level component of a [`State`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// The stream is open.
    Open,
    /// The stream closed; the application may open it again.
    ClosedRecover,
    /// The stream closed for good.
    Closed,
}

/// Data-level component of a [`State`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataState {
    /// Data is flowing normally.
    Ok,
    /// Data may be stale or incomplete.
    Suspect,
}

/// Reason attached to a [`State`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateCode {
    /// No specific reason.
    None,
    /// A response did not arrive in time.
    Timeout,
    /// The peer refused the open request or the login.
    NotEntitled,
    /// The peer broke the tunnel stream protocol.
    ProtocolError,
    /// The underlying connection went down.
    ConnectionLost,
}

/// Status reported for a stream, both on the wire and to the application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Stream state.
    pub stream: StreamState,
    /// Data state.
    pub data: DataState,
    /// Reason code.
    pub code: StateCode,
    /// Human-readable explanation.
    pub text: String,
}

impl State {
    /// Build a state from its parts.
    #[must_use]
    pub fn new(stream: StreamState, data: DataState, code: StateCode, text: impl Into<String>) -> Self {
        Self {
            stream,
            data,
            code,
            text: text.into(),
        }
    }

    /// Open stream with healthy data.
    #[must_use]
    pub fn open_ok(text: impl Into<String>) -> Self {
        Self::new(StreamState::Open, DataState::Ok, StateCode::None, text)
    }

    /// Open stream whose data is suspect.
    #[must_use]
    pub fn open_suspect(code: StateCode, text: impl Into<String>) -> Self {
        Self::new(StreamState::Open, DataState::Suspect, code, text)
    }

    /// Recoverable closure.
    #[must_use]
    pub fn closed_recover(code: StateCode, text: impl Into<String>) -> Self {
        Self::new(StreamState::ClosedRecover, DataState::Suspect, code, text)
    }

    /// Final closure.
    #[must_use]
    pub fn closed(code: StateCode, text: impl Into<String>) -> Self {
        Self::new(StreamState::Closed, DataState::Suspect, code, text)
    }

    /// Whether the stream state is [`StreamState::Open`].
    #[must_use]
    pub fn is_open(&self) -> bool { self.stream == StreamState::Open }
}

/// Request to open a tunnel stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub stream_id: StreamId,
    pub domain: u8,
    pub service_id: u16,
    pub name: Bytes,
    pub cos: ClassOfService,
    /// Bitmask of the class-of-service sections present in `cos`.
    pub filter: u32,
}

/// Provider's answer to an [`OpenRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenResponse {
    pub stream_id: StreamId,
    pub state: State,
    /// Negotiated class of service. Its flow-control window is the
    /// responder's receive window.
    pub cos: ClassOfService,
}

/// A sequenced data unit: one fragment of an application payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub stream_id: StreamId,
    pub seq: SeqNum,
    pub fragment: FragmentHeader,
    pub tag: ContainerTag,
    pub payload: Bytes,
}

/// Acknowledgment, credit update, and FIN carrier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub stream_id: StreamId,
    /// Highest contiguous sequence number received, if any.
    pub seq: Option<SeqNum>,
    /// Absolute number of data units the sender of this ack can still accept.
    pub window: u32,
    /// Present when the sender has finished sending: the sequence number
    /// occupied by its FIN.
    pub fin: Option<SeqNum>,
    /// Selectively acknowledged ranges beyond `seq`.
    pub acks: RangeList,
    /// Ranges the sender of this ack is missing.
    pub naks: RangeList,
}

/// Out-of-band state change for a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub stream_id: StreamId,
    pub state: State,
}

/// Final teardown of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMessage {
    pub stream_id: StreamId,
}

/// Every message understood by the tunnel stream protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelMessage {
    OpenRequest(OpenRequest),
    OpenResponse(OpenResponse),
    Data(DataMessage),
    Ack(AckMessage),
    /// A data unit sent again with its original sequence number.
    Retransmission(DataMessage),
    Status(StatusMessage),
    Close(CloseMessage),
}

impl TunnelMessage {
    /// Stream this message belongs to.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::OpenRequest(m) => m.stream_id,
            Self::OpenResponse(m) => m.stream_id,
            Self::Data(m) | Self::Retransmission(m) => m.stream_id,
            Self::Ack(m) => m.stream_id,
            Self::Status(m) => m.stream_id,
            Self::Close(m) => m.stream_id,
        }
    }

    /// Short opcode name for logs.
    #[must_use]
    pub fn opcode(&self) -> &'static str {
        match self {
            Self::OpenRequest(_) => "open-request",
            Self::OpenResponse(_) => "open-response",
            Self::Data(_) => "data",
            Self::Ack(_) => "ack",
            Self::Retransmission(_) => "retransmission",
            Self::Status(_) => "status",
            Self::Close(_) => "close",
        }
    }
}
