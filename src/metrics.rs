//! Metric helpers for `tunnelframe`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! the helpers compile to nothing.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking live tunnel streams.
pub const STREAMS_ACTIVE: &str = "tunnelframe_streams_active";
/// Name of the counter tracking protocol messages.
pub const MESSAGES_PROCESSED: &str = "tunnelframe_messages_processed_total";
/// Name of the counter tracking retransmitted data units.
pub const RETRANSMISSIONS: &str = "tunnelframe_retransmissions_total";
/// Name of the counter tracking streams closed for protocol violations.
pub const PROTOCOL_VIOLATIONS: &str = "tunnelframe_protocol_violations_total";

/// Direction of message processing.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Messages received from the peer.
    Inbound,
    /// Messages sent to the peer.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active streams gauge.
pub fn inc_streams() {
    #[cfg(feature = "metrics")]
    gauge!(STREAMS_ACTIVE).increment(1.0);
}

/// Decrement the active streams gauge.
pub fn dec_streams() {
    #[cfg(feature = "metrics")]
    gauge!(STREAMS_ACTIVE).decrement(1.0);
}

/// Record a processed message for the given direction.
pub fn inc_messages(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_PROCESSED, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record a retransmitted data unit.
pub fn inc_retransmissions() {
    #[cfg(feature = "metrics")]
    counter!(RETRANSMISSIONS).increment(1);
}

/// Record a stream torn down by a protocol violation.
pub fn inc_protocol_violations() {
    #[cfg(feature = "metrics")]
    counter!(PROTOCOL_VIOLATIONS).increment(1);
}
