//! Connection-wide tunnel stream configuration.
//!
//! [`TunnelConfig`] collects the timers, windows, and buffer limits shared by
//! every stream on a multiplexer. It deserializes from any serde format with
//! missing fields taking their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the receive side schedules acknowledgments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge after every inbound message that carries data.
    #[default]
    Immediate,
    /// Coalesce acknowledgments and send at most one per interval.
    Periodic(Duration),
}

/// Settings shared by every stream on a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// How long to wait for an open response or login response.
    pub response_timeout: Duration,
    /// Initial retransmission timeout; doubles on every retry.
    pub retransmit_timeout: Duration,
    /// Retries per data unit before the stream gives up.
    pub retransmit_max_attempts: u32,
    /// Receive window, in data units, when the class of service names none.
    pub default_recv_window: u32,
    /// Out-of-order units buffered when flow control is off.
    pub max_out_of_order: usize,
    pub ack_policy: AckPolicy,
    /// Buffers that may be outstanding across the whole connection.
    pub max_buffers: usize,
    /// Buffers each stream may always hold regardless of connection pressure.
    pub guaranteed_output_buffers: usize,
    /// Keep streams open, with suspect data, when the connection drops.
    pub reconnect: bool,
    /// Largest encoded frame accepted by the codec.
    pub max_frame_length: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(60),
            retransmit_timeout: Duration::from_millis(150),
            retransmit_max_attempts: 4,
            default_recv_window: 64,
            max_out_of_order: 1024,
            ack_policy: AckPolicy::Immediate,
            max_buffers: 1024,
            guaranteed_output_buffers: 50,
            reconnect: false,
            max_frame_length: crate::codec::DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl TunnelConfig {
    /// Set the open and login response timeout.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the initial retransmission timeout.
    #[must_use]
    pub fn with_retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.retransmit_timeout = timeout;
        self
    }

    /// Set the retry limit per data unit.
    #[must_use]
    pub fn with_retransmit_max_attempts(mut self, attempts: u32) -> Self {
        self.retransmit_max_attempts = attempts;
        self
    }

    /// Set the default receive window. Values below one are raised to one.
    #[must_use]
    pub fn with_default_recv_window(mut self, window: u32) -> Self {
        self.default_recv_window = window.max(1);
        self
    }

    /// Set the out-of-order buffer limit used without flow control.
    #[must_use]
    pub fn with_max_out_of_order(mut self, limit: usize) -> Self {
        self.max_out_of_order = limit;
        self
    }

    /// Set the acknowledgment policy.
    #[must_use]
    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// Set the connection-wide buffer ceiling.
    #[must_use]
    pub fn with_max_buffers(mut self, max: usize) -> Self {
        self.max_buffers = max;
        self
    }

    /// Set the per-stream guaranteed buffer count.
    #[must_use]
    pub fn with_guaranteed_output_buffers(mut self, count: usize) -> Self {
        self.guaranteed_output_buffers = count;
        self
    }

    /// Keep streams alive across connection loss.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the codec frame limit. The value is clamped to the codec's bounds.
    #[must_use]
    pub fn with_max_frame_length(mut self, length: usize) -> Self {
        self.max_frame_length = crate::codec::clamp_frame_length(length);
        self
    }
}
