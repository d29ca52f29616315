#![doc(html_root_url = "https://docs.rs/tunnelframe/latest")]
//! Public API for the `tunnelframe` library.
//!
//! This crate implements reliable tunnel streams: ordered, flow-controlled
//! virtual channels multiplexed over a single message-oriented connection.
//! Each stream negotiates its own class of service, fragments large payloads,
//! retransmits lost data, and closes through a symmetric FIN handshake.
//!
//! The protocol engine is sans-IO. A [`Multiplexer`] owns a [`Connection`],
//! and every call to [`Multiplexer::dispatch`] processes whatever input is
//! available, runs due timers, flushes output, and returns the resulting
//! [`Event`]s.

pub mod codec;
pub mod config;
pub mod connection;
pub mod cos;
pub mod error;
pub mod fragment;
pub mod listener;
pub mod message;
pub mod metrics;
pub mod multiplexer;
pub mod pool;
pub mod range;
pub mod reliability;
pub mod stream;
pub mod transport;

pub use codec::{CodecError, TunnelCodec};
pub use config::{AckPolicy, TunnelConfig};
pub use connection::{Connection, ConnectionError, ConnectionEvent, LoopbackConnection};
pub use cos::{Authentication, ClassOfService, DataIntegrity, FlowControl, Guarantee};
pub use error::{
    AllocationError,
    ConstructionError,
    OpenError,
    ProtocolViolation,
    SubmitError,
    TunnelError,
};
pub use fragment::{
    FragmentBatch,
    FragmentFrame,
    FragmentHeader,
    FragmentIndex,
    Fragmenter,
    MessageId,
    ReassembledMessage,
    Reassembler,
    ReassemblyError,
};
pub use listener::{AcceptAll, AuthDecision, Listener, ListenerDecision, RejectAll};
pub use message::{
    AckMessage,
    ContainerTag,
    DataMessage,
    DataState,
    OpenRequest,
    OpenResponse,
    SeqNum,
    State,
    StateCode,
    StatusMessage,
    StreamId,
    StreamState,
    TunnelMessage,
};
pub use multiplexer::{Event, Multiplexer, OpenParams, Role, StreamHandle};
pub use pool::{BufferPool, PooledBuffer};
pub use range::{Range, RangeList};
pub use stream::{LifecycleState, Origin, StreamInfo};
pub use transport::FramedConnection;

/// Result type alias used by fallible crate-level operations.
pub type Result<T> = std::result::Result<T, TunnelError>;
