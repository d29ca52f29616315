//! Acceptance policy for inbound open requests and logins.
//!
//! A [`Listener`] decides whether the provider accepts a stream and with
//! which class of service. Closures taking an [`OpenRequest`] implement the
//! trait directly, which covers the common case of a single decision
//! function.

use crate::{
    cos::{ClassOfService, FlowControl},
    message::OpenRequest,
    stream::StreamInfo,
};

/// Answer to an inbound open request.
///
/// The accepted class of service is negotiated against the request before
/// use, so a listener can only downgrade what the consumer asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerDecision {
    /// Accept with this class of service.
    Accept(ClassOfService),
    /// Refuse with the given reason.
    Reject(String),
}

/// Answer to a login presented on an accepted stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject(String),
}

/// Decides how inbound streams are handled.
pub trait Listener {
    /// Decide whether to accept a stream the peer wants to open.
    fn on_open_request(&mut self, request: &OpenRequest) -> ListenerDecision;

    /// Judge the credentials presented on a stream that requires login.
    ///
    /// The default accepts every login.
    fn on_auth_request(&mut self, _info: &StreamInfo, _credentials: &[u8]) -> AuthDecision {
        AuthDecision::Accept
    }
}

impl<F> Listener for F
where
    F: FnMut(&OpenRequest) -> ListenerDecision,
{
    fn on_open_request(&mut self, request: &OpenRequest) -> ListenerDecision { self(request) }
}

/// Accepts every request, optionally negotiating against a fixed offer.
#[derive(Clone, Debug, Default)]
pub struct AcceptAll {
    offer: Option<ClassOfService>,
}

impl AcceptAll {
    /// Accept requests as they were made, advertising the configured
    /// default receive window.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Accept requests after negotiating them against `offer`.
    #[must_use]
    pub fn with_offer(offer: ClassOfService) -> Self { Self { offer: Some(offer) } }
}

impl Listener for AcceptAll {
    fn on_open_request(&mut self, request: &OpenRequest) -> ListenerDecision {
        let cos = match &self.offer {
            Some(offer) => request.cos.negotiate(offer),
            None => {
                let mut cos = request.cos.clone();
                if let FlowControl::Bidirectional { recv_window } = &mut cos.flow_control {
                    *recv_window = None;
                }
                cos
            }
        };
        ListenerDecision::Accept(cos)
    }
}

/// Refuses every request. Used by multiplexers that only open streams.
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectAll;

impl Listener for RejectAll {
    fn on_open_request(&mut self, _request: &OpenRequest) -> ListenerDecision {
        ListenerDecision::Reject("This endpoint does not accept tunnel streams.".to_owned())
    }
}
