//! Class of service negotiated for each tunnel stream.
//!
//! The consumer proposes a [`ClassOfService`] in its open request. The
//! provider answers with the negotiated result, which never exceeds either
//! side's sizes and never upgrades a best-effort request to reliable.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::{codec, error::ConstructionError};

/// Default maximum application message size in bytes.
pub const DEFAULT_MAX_MSG_SIZE: usize = 6144;
/// Default maximum fragment payload size in bytes.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 6144;

/// Filter bit: common section (sizes) present.
pub const FILTER_COMMON: u32 = 0x01;
/// Filter bit: authentication section present.
pub const FILTER_AUTHENTICATION: u32 = 0x02;
/// Filter bit: flow-control section present.
pub const FILTER_FLOW_CONTROL: u32 = 0x04;
/// Filter bit: data-integrity section present.
pub const FILTER_DATA_INTEGRITY: u32 = 0x08;
/// Filter bit: guarantee section present.
pub const FILTER_GUARANTEE: u32 = 0x10;

/// Delivery guarantee for data units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataIntegrity {
    /// Data is delivered in order; lost units are skipped.
    BestEffort,
    /// Data is delivered in order without gaps.
    #[default]
    Reliable,
}

/// Credit-based flow control.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    /// The sender is not limited by the receiver.
    None,
    /// Each side limits the other to its advertised receive window, counted in
    /// data units. `None` uses the configured default.
    Bidirectional { recv_window: Option<NonZeroU32> },
}

impl Default for FlowControl {
    fn default() -> Self { Self::Bidirectional { recv_window: None } }
}

/// Authentication performed after the open handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authentication {
    #[default]
    None,
    /// The consumer presents login credentials over the stream before it opens.
    EmbeddedLogin,
}

/// Persistence guarantee.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guarantee {
    #[default]
    None,
    /// Queue messaging backed by provider-side persistence. Recognised on the
    /// wire so requests can be refused cleanly; no persistent store exists,
    /// so [`ClassOfService::validate`] rejects it.
    PersistentQueue,
}

/// Negotiated parameters of a tunnel stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassOfService {
    /// Largest application payload, in bytes.
    pub max_msg_size: usize,
    /// Largest fragment payload, in bytes.
    pub max_fragment_size: usize,
    pub data_integrity: DataIntegrity,
    pub flow_control: FlowControl,
    pub authentication: Authentication,
    pub guarantee: Guarantee,
}

impl Default for ClassOfService {
    fn default() -> Self {
        Self {
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            data_integrity: DataIntegrity::default(),
            flow_control: FlowControl::default(),
            authentication: Authentication::default(),
            guarantee: Guarantee::default(),
        }
    }
}

impl ClassOfService {
    /// Set the maximum message size.
    #[must_use]
    pub fn with_max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = size;
        self
    }

    /// Set the maximum fragment size.
    #[must_use]
    pub fn with_max_fragment_size(mut self, size: usize) -> Self {
        self.max_fragment_size = size;
        self
    }

    /// Set the data integrity level.
    #[must_use]
    pub fn with_data_integrity(mut self, integrity: DataIntegrity) -> Self {
        self.data_integrity = integrity;
        self
    }

    /// Set the flow-control mode.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Set the authentication mode.
    #[must_use]
    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    /// Set the persistence guarantee.
    #[must_use]
    pub fn with_guarantee(mut self, guarantee: Guarantee) -> Self {
        self.guarantee = guarantee;
        self
    }

    /// Reject self-contradictory settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::InvalidClassOfService`] when a size is
    /// zero or a persistent queue is requested.
    pub fn validate(&self) -> Result<(), ConstructionError> {
        if self.max_msg_size == 0 {
            return Err(ConstructionError::InvalidClassOfService(
                "maximum message size must be positive",
            ));
        }
        if self.max_fragment_size == 0 {
            return Err(ConstructionError::InvalidClassOfService(
                "maximum fragment size must be positive",
            ));
        }
        if self.guarantee == Guarantee::PersistentQueue {
            return Err(ConstructionError::InvalidClassOfService(
                "persistent queue guarantee is not supported",
            ));
        }
        Ok(())
    }

    /// Check that a full fragment fits in one frame of `max_frame_length`
    /// bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::InvalidClassOfService`] when
    /// `max_fragment_size` leaves no room for the data message header.
    pub fn validate_frame_fit(&self, max_frame_length: usize) -> Result<(), ConstructionError> {
        if self.max_fragment_size > codec::max_fragment_for(max_frame_length) {
            return Err(ConstructionError::InvalidClassOfService(
                "maximum fragment size exceeds the connection frame limit",
            ));
        }
        Ok(())
    }

    /// Whether data units are retransmitted until acknowledged.
    #[must_use]
    pub fn is_reliable(&self) -> bool { self.data_integrity == DataIntegrity::Reliable }

    /// Whether the peer's advertised window limits transmission.
    #[must_use]
    pub fn is_flow_controlled(&self) -> bool {
        matches!(self.flow_control, FlowControl::Bidirectional { .. })
    }

    /// Receive window carried by this class of service, falling back to `default`.
    #[must_use]
    pub fn recv_window_or(&self, default: u32) -> u32 {
        match self.flow_control {
            FlowControl::Bidirectional {
                recv_window: Some(window),
            } => window.get(),
            _ => default,
        }
    }

    /// Bitmask describing which sections differ from their defaults.
    #[must_use]
    pub fn filter(&self) -> u32 {
        let mut filter = FILTER_COMMON;
        if self.authentication != Authentication::None {
            filter |= FILTER_AUTHENTICATION;
        }
        if self.flow_control != FlowControl::None {
            filter |= FILTER_FLOW_CONTROL;
        }
        if self.data_integrity != DataIntegrity::BestEffort {
            filter |= FILTER_DATA_INTEGRITY;
        }
        if self.guarantee != Guarantee::None {
            filter |= FILTER_GUARANTEE;
        }
        filter
    }

    /// Combine a consumer's request with a provider's offer.
    ///
    /// Sizes take the smaller value. Reliable integrity and flow control
    /// survive only if both sides want them; authentication is required if
    /// either side requires it. The resulting flow-control window is the
    /// offer's receive window, and the guarantee is always `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tunnelframe::{ClassOfService, DataIntegrity};
    /// let request = ClassOfService::default().with_data_integrity(DataIntegrity::BestEffort);
    /// let offer = ClassOfService::default().with_max_msg_size(1000);
    /// let agreed = request.negotiate(&offer);
    /// assert_eq!(agreed.max_msg_size, 1000);
    /// assert_eq!(agreed.data_integrity, DataIntegrity::BestEffort);
    /// ```
    #[must_use]
    pub fn negotiate(&self, offer: &Self) -> Self {
        let data_integrity = if self.is_reliable() && offer.is_reliable() {
            DataIntegrity::Reliable
        } else {
            DataIntegrity::BestEffort
        };
        let flow_control = match (self.flow_control, offer.flow_control) {
            (FlowControl::Bidirectional { .. }, FlowControl::Bidirectional { recv_window }) => {
                FlowControl::Bidirectional { recv_window }
            }
            _ => FlowControl::None,
        };
        let authentication = if self.authentication == Authentication::EmbeddedLogin
            || offer.authentication == Authentication::EmbeddedLogin
        {
            Authentication::EmbeddedLogin
        } else {
            Authentication::None
        };
        Self {
            max_msg_size: self.max_msg_size.min(offer.max_msg_size),
            max_fragment_size: self.max_fragment_size.min(offer.max_fragment_size),
            data_integrity,
            flow_control,
            authentication,
            guarantee: Guarantee::None,
        }
    }
}
