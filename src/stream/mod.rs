//! Tunnel stream state machine.
//!
//! A [`TunnelStream`] owns one direction pair of reliability state, the
//! fragmenter and reassembler, and the open, login, and close handshakes.
//! It never touches the connection: inbound messages are handed to it by the
//! multiplexer, and everything it wants to send or report is pushed into an
//! [`Effects`] value that the multiplexer drains.

pub mod auth;

use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use bytes::Bytes;
use log::{debug, error, info, warn};

use self::auth::LoginResponse;
use crate::{
    config::{AckPolicy, TunnelConfig},
    cos::{Authentication, ClassOfService, FlowControl},
    error::{ConstructionError, ProtocolViolation, SubmitError},
    fragment::{FragmentHeader, Fragmenter, Reassembler},
    listener::{AuthDecision, Listener},
    message::{
        AckMessage,
        CloseMessage,
        ContainerTag,
        DataMessage,
        OpenRequest,
        OpenResponse,
        SeqNum,
        State,
        StateCode,
        StatusMessage,
        StreamId,
        StreamState,
        TunnelMessage,
    },
    metrics,
    multiplexer::{Event, OpenParams, StreamHandle},
    pool::{BufferPool, PoolSlot},
    reliability::{ReceiveWindow, RetransmitPolicy, SendWindow, Unit},
};

/// Longest stream name accepted, in bytes.
pub const MAX_NAME_LEN: usize = 255;

const TEXT_ESTABLISHED: &str = "Tunnel stream established.";
const TEXT_REMOTE_FIN: &str = "Received final message for stream, closing it.";
const TEXT_CLOSED: &str = "Tunnel stream closed.";
const TEXT_REMOTE_CLOSED: &str = "Tunnel stream closed by the remote end.";
const TEXT_CLOSE_RECEIVED: &str = "Received close message from the remote end.";
const TEXT_OPEN_TIMEOUT: &str = "Timed out waiting for provider response.";
const TEXT_AUTH_TIMEOUT: &str = "Timed out waiting for authentication response.";
const TEXT_RETRANSMIT: &str = "No acknowledgment after maximum retransmissions.";
const TEXT_CONNECTION_SUSPECT: &str = "Connection lost; awaiting recovery.";
const TEXT_CONNECTION_LOST: &str = "Connection lost.";

/// Check a stream name against the wire limits.
///
/// # Errors
///
/// Returns [`ConstructionError::EmptyName`] or
/// [`ConstructionError::NameTooLong`].
pub fn validate_name(name: &[u8]) -> Result<(), ConstructionError> {
    if name.is_empty() {
        return Err(ConstructionError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ConstructionError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

/// Lifecycle of a tunnel stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Open request sent or accepted; negotiation not finished.
    Initiated,
    /// Login exchange in progress.
    AwaitingAuth,
    /// Data flows in both directions.
    Open,
    /// Local FIN sent; waiting for it to be acknowledged and for the peer's FIN.
    ClosingLocal,
    /// Peer's FIN received before any local close.
    ClosingRemote,
    /// Terminal.
    Closed,
}

/// Which side sent the open request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// This side opened the stream and presents credentials.
    Local,
    /// The peer opened the stream and the listener accepted it.
    Remote,
}

/// Snapshot of a stream for applications and listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    pub name: Bytes,
    pub domain: u8,
    pub service_id: u16,
    pub origin: Origin,
    pub state: LifecycleState,
    pub cos: ClassOfService,
    /// Pool buffers currently held for this stream.
    pub buffers_used: usize,
}

/// Output produced while a stream handles input or timers.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub(crate) outbound: Vec<TunnelMessage>,
    pub(crate) events: Vec<Event>,
}

#[derive(Clone, Copy, Debug)]
struct StreamSettings {
    response_timeout: Duration,
    retransmit: RetransmitPolicy,
    default_recv_window: u32,
    max_out_of_order: usize,
    ack_policy: AckPolicy,
}

impl From<&TunnelConfig> for StreamSettings {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            response_timeout: config.response_timeout,
            retransmit: RetransmitPolicy {
                timeout: config.retransmit_timeout,
                max_attempts: config.retransmit_max_attempts,
            },
            default_recv_window: config.default_recv_window.max(1),
            max_out_of_order: config.max_out_of_order,
            ack_policy: config.ack_policy,
        }
    }
}

/// Submitted payload occupying sequence numbers `first..=last`.
#[derive(Debug)]
struct HeldPayload {
    first: SeqNum,
    last: SeqNum,
    _slot: PoolSlot,
}

#[derive(Clone, Copy, Debug)]
struct CloseProgress {
    app_active: bool,
    started_locally: bool,
    want_final_status: bool,
    fin_received: bool,
}

/// One tunnel stream and its protocol state.
#[derive(Debug)]
pub(crate) struct TunnelStream {
    id: StreamId,
    name: Bytes,
    domain: u8,
    service_id: u16,
    origin: Origin,
    state: LifecycleState,
    cos: ClassOfService,
    settings: StreamSettings,
    recv_window: u32,
    sender: SendWindow,
    receiver: ReceiveWindow,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    pool: BufferPool,
    held: VecDeque<HeldPayload>,
    credentials: Option<Bytes>,
    response_deadline: Option<Instant>,
    last_ack_at: Option<Instant>,
    close: CloseProgress,
}

fn non_zero(value: usize) -> NonZeroUsize { NonZeroUsize::new(value).unwrap_or(NonZeroUsize::MIN) }

/// Record `window` in a bidirectional class of service so the peer learns it.
fn with_window(mut cos: ClassOfService, window: u32) -> ClassOfService {
    if let FlowControl::Bidirectional { recv_window } = &mut cos.flow_control {
        *recv_window = std::num::NonZeroU32::new(window);
    }
    cos
}

impl TunnelStream {
    #[expect(clippy::too_many_arguments, reason = "private constructor shared by both origins")]
    fn new(
        id: StreamId,
        name: Bytes,
        domain: u8,
        service_id: u16,
        origin: Origin,
        cos: ClassOfService,
        peer_window: u32,
        settings: StreamSettings,
        pool: BufferPool,
    ) -> Self {
        let recv_window = cos.recv_window_or(settings.default_recv_window);
        Self {
            id,
            name,
            domain,
            service_id,
            origin,
            state: LifecycleState::Initiated,
            sender: SendWindow::new(&cos, peer_window, settings.retransmit),
            receiver: ReceiveWindow::new(&cos, recv_window, settings.max_out_of_order),
            fragmenter: Fragmenter::new(non_zero(cos.max_fragment_size)),
            reassembler: Reassembler::new(non_zero(cos.max_msg_size)),
            cos,
            settings,
            recv_window,
            pool,
            held: VecDeque::new(),
            credentials: None,
            response_deadline: None,
            last_ack_at: None,
            close: CloseProgress {
                app_active: true,
                started_locally: false,
                want_final_status: false,
                fin_received: false,
            },
        }
    }

    /// Build a locally opened stream and the request that announces it.
    pub(crate) fn open_local(
        id: StreamId,
        params: &OpenParams,
        config: &TunnelConfig,
        pool: BufferPool,
        now: Instant,
    ) -> Result<(Self, TunnelMessage), ConstructionError> {
        validate_name(&params.name)?;
        params.cos.validate()?;
        params.cos.validate_frame_fit(config.max_frame_length)?;
        if params.cos.authentication == Authentication::EmbeddedLogin && params.credentials.is_none() {
            return Err(ConstructionError::MissingCredentials);
        }

        let settings = StreamSettings::from(config);
        let cos = with_window(
            params.cos.clone(),
            params.cos.recv_window_or(settings.default_recv_window),
        );
        let mut stream = Self::new(
            id,
            params.name.clone(),
            params.domain,
            params.service_id,
            Origin::Local,
            cos.clone(),
            settings.default_recv_window,
            settings,
            pool,
        );
        stream.credentials = params.credentials.clone();
        stream.response_deadline = Some(now + settings.response_timeout);

        let request = OpenRequest {
            stream_id: id,
            domain: params.domain,
            service_id: params.service_id,
            name: params.name.clone(),
            filter: cos.filter(),
            cos,
        };
        info!(
            "opening tunnel stream: id={id}, service={}, domain={}",
            params.service_id, params.domain
        );
        Ok((stream, TunnelMessage::OpenRequest(request)))
    }

    /// Build a stream for an open request the listener accepted, together
    /// with the response to send.
    pub(crate) fn accept_remote(
        request: &OpenRequest,
        negotiated: ClassOfService,
        config: &TunnelConfig,
        pool: BufferPool,
        now: Instant,
    ) -> Result<(Self, TunnelMessage), ConstructionError> {
        validate_name(&request.name)?;
        negotiated.validate()?;
        negotiated.validate_frame_fit(config.max_frame_length)?;

        let settings = StreamSettings::from(config);
        let cos = with_window(
            negotiated.clone(),
            negotiated.recv_window_or(settings.default_recv_window),
        );
        let peer_window = request.cos.recv_window_or(settings.default_recv_window);
        let mut stream = Self::new(
            request.stream_id,
            request.name.clone(),
            request.domain,
            request.service_id,
            Origin::Remote,
            cos.clone(),
            peer_window,
            settings,
            pool,
        );

        if cos.authentication == Authentication::EmbeddedLogin {
            stream.state = LifecycleState::AwaitingAuth;
            stream.response_deadline = Some(now + settings.response_timeout);
        } else {
            stream.state = LifecycleState::Open;
        }

        let response = OpenResponse {
            stream_id: request.stream_id,
            state: State::open_ok(TEXT_ESTABLISHED),
            cos,
        };
        info!(
            "accepted tunnel stream: id={}, state={:?}",
            request.stream_id, stream.state
        );
        Ok((stream, TunnelMessage::OpenResponse(response)))
    }

    pub(crate) fn id(&self) -> StreamId { self.id }

    pub(crate) fn state(&self) -> LifecycleState { self.state }

    pub(crate) fn cos(&self) -> &ClassOfService { &self.cos }

    pub(crate) fn is_retired(&self) -> bool { self.state == LifecycleState::Closed }

    /// Whether this stream is a local open still waiting to become usable
    /// for the given identity.
    pub(crate) fn is_pending_open_for(&self, name: &[u8], domain: u8, service_id: u16) -> bool {
        self.origin == Origin::Local
            && matches!(
                self.state,
                LifecycleState::Initiated | LifecycleState::AwaitingAuth
            )
            && self.name.as_ref() == name
            && self.domain == domain
            && self.service_id == service_id
    }

    pub(crate) fn info(&self) -> StreamInfo {
        StreamInfo {
            stream_id: self.id,
            name: self.name.clone(),
            domain: self.domain,
            service_id: self.service_id,
            origin: self.origin,
            state: self.state,
            cos: self.cos.clone(),
            buffers_used: self.pool.usage(self.id),
        }
    }

    fn handle(&self) -> StreamHandle { StreamHandle::new(self.id) }

    fn emit_status(&self, state: State, fx: &mut Effects) {
        fx.events.push(Event::Status {
            handle: self.handle(),
            state,
        });
    }

    /// Emit the open status for a stream that became usable on acceptance.
    pub(crate) fn announce(&self, fx: &mut Effects) {
        if self.state == LifecycleState::Open {
            self.emit_status(State::open_ok(TEXT_ESTABLISHED), fx);
        }
    }

    /// Queue an application payload.
    ///
    /// The payload occupies `slot`, or a slot reserved here when none is
    /// given, until the peer acknowledges every fragment.
    pub(crate) fn submit(
        &mut self,
        payload: Bytes,
        slot: Option<PoolSlot>,
        tag: ContainerTag,
    ) -> Result<(), SubmitError> {
        if tag == ContainerTag::Login {
            return Err(SubmitError::ReservedTag);
        }
        if self.state != LifecycleState::Open || !self.close.app_active {
            return Err(SubmitError::NotOpen {
                stream: self.id,
                state: self.state,
            });
        }
        if payload.len() > self.cos.max_msg_size {
            return Err(SubmitError::TooLarge {
                len: payload.len(),
                limit: self.cos.max_msg_size,
            });
        }
        let slot = match slot {
            Some(slot) => slot,
            None => self.pool.reserve(self.id)?,
        };
        let (first, last) = self.enqueue_payload(payload, tag)?;
        self.held.push_back(HeldPayload {
            first,
            last,
            _slot: slot,
        });
        Ok(())
    }

    /// Fragment `payload` onto the send window, returning the sequence
    /// numbers of its first and last fragments.
    fn enqueue_payload(
        &mut self,
        payload: Bytes,
        tag: ContainerTag,
    ) -> Result<(SeqNum, SeqNum), SubmitError> {
        let batch = self.fragmenter.fragment(payload)?;
        if batch.len() as u64 > self.sender.remaining_seqs() {
            return Err(SubmitError::SequenceExhausted);
        }
        debug!(
            "payload queued: stream={}, message={}, fragments={}",
            self.id,
            batch.message_id(),
            batch.len()
        );
        let mut span = None;
        for frame in batch {
            let (fragment, payload) = frame.into_parts();
            let unit = Unit::Data {
                fragment,
                tag,
                payload,
            };
            let seq = self
                .sender
                .enqueue(unit)
                .ok_or(SubmitError::SequenceExhausted)?;
            span = Some(span.map_or((seq, seq), |(first, _)| (first, seq)));
        }
        span.ok_or(SubmitError::SequenceExhausted)
    }

    /// Return the pool slots of payloads the peer has fully acknowledged.
    fn release_acknowledged(&mut self) {
        let before = self.held.len();
        self.held
            .retain(|held| self.sender.holds_any(held.first, held.last));
        if self.held.len() < before {
            debug!(
                "acknowledged payloads released: stream={}, count={}",
                self.id,
                before - self.held.len()
            );
        }
    }

    /// Begin the close handshake. Repeated calls are no-ops.
    pub(crate) fn close(&mut self, want_final_status: bool, fx: &mut Effects) {
        if !self.close.app_active || self.state == LifecycleState::Closed {
            debug!("close ignored: stream={}, state={:?}", self.id, self.state);
            return;
        }
        self.close.app_active = false;
        self.close.want_final_status = want_final_status;

        match self.state {
            LifecycleState::Initiated => {
                self.close.started_locally = true;
                fx.outbound.push(self.close_message());
                let status = self.final_status();
                self.terminate(status, fx);
            }
            LifecycleState::AwaitingAuth | LifecycleState::Open => {
                self.close.started_locally = true;
                self.begin_fin(fx);
            }
            LifecycleState::ClosingLocal
            | LifecycleState::ClosingRemote
            | LifecycleState::Closed => {
                debug!("close joins handshake in progress: stream={}", self.id);
            }
        }
    }

    /// Handle a message addressed to this stream.
    pub(crate) fn on_message(
        &mut self,
        message: TunnelMessage,
        listener: &mut dyn Listener,
        now: Instant,
        fx: &mut Effects,
    ) {
        if self.state == LifecycleState::Closed {
            return;
        }
        let opcode = message.opcode();
        let result = match message {
            TunnelMessage::OpenRequest(_) => {
                warn!("open request for existing stream {} ignored", self.id);
                Ok(())
            }
            TunnelMessage::OpenResponse(response) => self.on_open_response(response, now, fx),
            TunnelMessage::Data(data) | TunnelMessage::Retransmission(data) => {
                self.on_data(data, listener, fx)
            }
            TunnelMessage::Ack(ack) => self.on_ack(ack, listener, fx),
            TunnelMessage::Status(status) => {
                self.on_status(status, fx);
                Ok(())
            }
            TunnelMessage::Close(_) => {
                self.on_close(fx);
                Ok(())
            }
        };
        if let Err(violation) = result {
            error!(
                "protocol violation on stream {} handling {opcode}: {violation}",
                self.id
            );
            self.fail(&violation, fx);
        }
    }

    fn on_open_response(
        &mut self,
        response: OpenResponse,
        now: Instant,
        fx: &mut Effects,
    ) -> Result<(), ProtocolViolation> {
        if self.state != LifecycleState::Initiated || self.origin != Origin::Local {
            return Err(ProtocolViolation::UnexpectedMessage {
                opcode: "open-response",
                state: self.state,
            });
        }
        if !response.state.is_open() {
            debug!("open refused: stream={}, text={}", self.id, response.state.text);
            self.terminate(Some(response.state), fx);
            return Ok(());
        }

        let offered = response.cos;
        offered.validate().map_err(ProtocolViolation::Negotiation)?;
        let upgraded = offered.max_msg_size > self.cos.max_msg_size
            || offered.max_fragment_size > self.cos.max_fragment_size
            || (offered.is_reliable() && !self.cos.is_reliable());
        if upgraded {
            return Err(ProtocolViolation::Negotiation(
                ConstructionError::InvalidClassOfService("provider exceeded the requested class of service"),
            ));
        }
        if offered.authentication == Authentication::EmbeddedLogin && self.credentials.is_none() {
            return Err(ProtocolViolation::Negotiation(ConstructionError::MissingCredentials));
        }

        let peer_window = offered.recv_window_or(self.settings.default_recv_window);
        self.sender = SendWindow::new(&offered, peer_window, self.settings.retransmit);
        self.receiver = ReceiveWindow::new(&offered, self.recv_window, self.settings.max_out_of_order);
        self.fragmenter = Fragmenter::new(non_zero(offered.max_fragment_size));
        self.reassembler = Reassembler::new(non_zero(offered.max_msg_size));
        self.cos = offered;

        if self.cos.authentication == Authentication::EmbeddedLogin {
            let credentials = self.credentials.take().unwrap_or_default();
            self.enqueue_payload(credentials, ContainerTag::Login)
                .map_err(|_| ProtocolViolation::SequenceExhausted)?;
            self.state = LifecycleState::AwaitingAuth;
            self.response_deadline = Some(now + self.settings.response_timeout);
            debug!("login sent: stream={}", self.id);
        } else {
            self.establish(fx);
        }
        Ok(())
    }

    fn on_data(
        &mut self,
        data: DataMessage,
        listener: &mut dyn Listener,
        fx: &mut Effects,
    ) -> Result<(), ProtocolViolation> {
        if self.state == LifecycleState::Initiated {
            return Err(ProtocolViolation::UnexpectedMessage {
                opcode: "data",
                state: self.state,
            });
        }
        let unit = Unit::Data {
            fragment: data.fragment,
            tag: data.tag,
            payload: data.payload,
        };
        let delivered = self.receiver.on_unit(data.seq, unit)?;
        self.deliver(delivered, listener, fx)?;
        // A buffered FIN can be released by data filling the gap before it.
        self.maybe_finish(fx);
        Ok(())
    }

    fn on_ack(
        &mut self,
        ack: AckMessage,
        listener: &mut dyn Listener,
        fx: &mut Effects,
    ) -> Result<(), ProtocolViolation> {
        if self.state == LifecycleState::Initiated {
            return Err(ProtocolViolation::UnexpectedMessage {
                opcode: "ack",
                state: self.state,
            });
        }
        self.sender.on_ack(&ack)?;
        self.release_acknowledged();
        if let Some(fin) = ack.fin {
            let delivered = self.receiver.on_unit(fin, Unit::Fin)?;
            self.deliver(delivered, listener, fx)?;
        }
        self.maybe_finish(fx);
        Ok(())
    }

    fn deliver(
        &mut self,
        units: Vec<Unit>,
        listener: &mut dyn Listener,
        fx: &mut Effects,
    ) -> Result<(), ProtocolViolation> {
        for unit in units {
            match unit {
                Unit::Fin => self.on_peer_fin(fx),
                Unit::Data {
                    fragment,
                    tag,
                    payload,
                } => {
                    if !self.cos.is_reliable()
                        && fragment.fragment_index().get() == 0
                        && self.reassembler.is_in_progress()
                    {
                        debug!(
                            "partial payload abandoned: stream={}, next message={}",
                            self.id,
                            fragment.message_id()
                        );
                        self.reassembler.clear();
                    }
                    self.reassemble(fragment, tag, payload, listener, fx)?;
                }
            }
        }
        Ok(())
    }

    fn reassemble(
        &mut self,
        fragment: FragmentHeader,
        tag: ContainerTag,
        payload: Bytes,
        listener: &mut dyn Listener,
        fx: &mut Effects,
    ) -> Result<(), ProtocolViolation> {
        match self.reassembler.push(fragment, payload) {
            Ok(Some(message)) => self.on_payload(tag, message.into_payload(), listener, fx),
            Ok(None) => Ok(()),
            Err(err) if !self.cos.is_reliable() => {
                debug!("fragment dropped: stream={}, reason={err}", self.id);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn on_payload(
        &mut self,
        tag: ContainerTag,
        payload: Bytes,
        listener: &mut dyn Listener,
        fx: &mut Effects,
    ) -> Result<(), ProtocolViolation> {
        if tag == ContainerTag::Login {
            return self.on_login(&payload, listener, fx);
        }
        let deliverable = matches!(
            self.state,
            LifecycleState::Open | LifecycleState::ClosingLocal | LifecycleState::ClosingRemote
        );
        if deliverable && self.close.app_active {
            fx.events.push(Event::Message {
                handle: self.handle(),
                tag,
                payload,
            });
        } else {
            debug!(
                "payload dropped: stream={}, state={:?}, app_active={}",
                self.id, self.state, self.close.app_active
            );
        }
        Ok(())
    }

    fn on_login(
        &mut self,
        payload: &[u8],
        listener: &mut dyn Listener,
        fx: &mut Effects,
    ) -> Result<(), ProtocolViolation> {
        if self.state != LifecycleState::AwaitingAuth {
            debug!("login payload outside authentication ignored: stream={}", self.id);
            return Ok(());
        }
        match self.origin {
            Origin::Remote => match listener.on_auth_request(&self.info(), payload) {
                AuthDecision::Accept => {
                    let response = LoginResponse::accepted()
                        .to_bytes()
                        .map_err(|err| ProtocolViolation::MalformedLogin(err.to_string()))?;
                    self.enqueue_payload(response, ContainerTag::Login)
                        .map_err(|_| ProtocolViolation::SequenceExhausted)?;
                    self.establish(fx);
                }
                AuthDecision::Reject(reason) => {
                    warn!("login rejected: stream={}, reason={reason}", self.id);
                    let state = State::closed(StateCode::NotEntitled, reason);
                    fx.outbound.push(TunnelMessage::Status(StatusMessage {
                        stream_id: self.id,
                        state: state.clone(),
                    }));
                    self.terminate(Some(state), fx);
                }
            },
            Origin::Local => {
                let response = LoginResponse::from_bytes(payload)?;
                if response.accepted {
                    self.establish(fx);
                } else {
                    warn!("login refused by provider: stream={}", self.id);
                    fx.outbound.push(self.close_message());
                    let status = (self.close.app_active || self.close.want_final_status)
                        .then(|| State::closed(StateCode::NotEntitled, response.text));
                    self.terminate(status, fx);
                }
            }
        }
        Ok(())
    }

    fn establish(&mut self, fx: &mut Effects) {
        self.state = LifecycleState::Open;
        self.response_deadline = None;
        info!("tunnel stream open: id={}", self.id);
        if self.close.app_active {
            self.emit_status(State::open_ok(TEXT_ESTABLISHED), fx);
        } else {
            // Closed by the application while the handshake was running.
            self.close.started_locally = true;
            self.begin_fin(fx);
        }
    }

    fn on_peer_fin(&mut self, fx: &mut Effects) {
        self.close.fin_received = true;
        debug!("peer FIN delivered: stream={}", self.id);
        if self.sender.fin_queued() {
            return;
        }
        self.state = LifecycleState::ClosingRemote;
        if self.close.app_active {
            self.emit_status(State::open_suspect(StateCode::None, TEXT_REMOTE_FIN), fx);
        }
        self.begin_fin(fx);
    }

    fn begin_fin(&mut self, fx: &mut Effects) {
        match self.sender.enqueue(Unit::Fin) {
            Some(seq) => {
                debug!("FIN queued: stream={}, seq={seq}", self.id);
                self.state = LifecycleState::ClosingLocal;
            }
            None => self.abandon(fx),
        }
    }

    fn maybe_finish(&mut self, fx: &mut Effects) {
        if self.state != LifecycleState::ClosingLocal
            || !self.close.fin_received
            || !self.sender.fin_acked()
        {
            return;
        }
        if self.receiver.is_ack_due() {
            self.last_ack_at = None;
            fx.outbound
                .push(TunnelMessage::Ack(self.receiver.build_ack(self.id, None)));
        }
        if self.close.started_locally {
            fx.outbound.push(self.close_message());
        }
        info!("tunnel stream closed: id={}", self.id);
        let status = self.final_status();
        self.terminate(status, fx);
    }

    /// Terminal status owed to the application, if any.
    fn final_status(&self) -> Option<State> {
        if self.close.app_active {
            Some(State::closed_recover(StateCode::None, TEXT_REMOTE_CLOSED))
        } else if self.close.want_final_status {
            Some(State::closed(StateCode::None, TEXT_CLOSED))
        } else {
            None
        }
    }

    fn on_status(&mut self, status: StatusMessage, fx: &mut Effects) {
        if status.state.stream == StreamState::Open {
            if self.close.app_active {
                self.emit_status(status.state, fx);
            }
            return;
        }
        debug!("peer closed stream {}: {}", self.id, status.state.text);
        let report = (self.close.app_active || self.close.want_final_status).then_some(status.state);
        self.terminate(report, fx);
    }

    fn on_close(&mut self, fx: &mut Effects) {
        debug!("close received: stream={}", self.id);
        let report = (self.close.app_active || self.close.want_final_status)
            .then(|| State::closed(StateCode::None, TEXT_CLOSE_RECEIVED));
        self.terminate(report, fx);
    }

    fn fail(&mut self, violation: &ProtocolViolation, fx: &mut Effects) {
        metrics::inc_protocol_violations();
        fx.outbound.push(self.close_message());
        let report = (self.close.app_active || self.close.want_final_status)
            .then(|| State::closed(StateCode::ProtocolError, violation.to_string()));
        self.terminate(report, fx);
    }

    /// Give up on the close handshake.
    fn abandon(&mut self, fx: &mut Effects) {
        warn!("abandoning close handshake: stream={}", self.id);
        fx.outbound.push(self.close_message());
        let status = self.final_status();
        self.terminate(status, fx);
    }

    fn close_message(&self) -> TunnelMessage { TunnelMessage::Close(CloseMessage { stream_id: self.id }) }

    fn terminate(&mut self, status: Option<State>, fx: &mut Effects) {
        self.state = LifecycleState::Closed;
        self.response_deadline = None;
        self.sender.clear();
        self.receiver.clear();
        self.reassembler.clear();
        self.held.clear();
        if let Some(state) = status {
            self.emit_status(state, fx);
        }
    }

    /// Handle the underlying connection going down.
    pub(crate) fn on_connection_lost(&mut self, reconnect: bool, fx: &mut Effects) {
        if self.state == LifecycleState::Closed {
            return;
        }
        if reconnect {
            if self.close.app_active {
                self.emit_status(
                    State::open_suspect(StateCode::ConnectionLost, TEXT_CONNECTION_SUSPECT),
                    fx,
                );
            }
            return;
        }
        let report = (self.close.app_active || self.close.want_final_status)
            .then(|| State::closed_recover(StateCode::ConnectionLost, TEXT_CONNECTION_LOST));
        self.terminate(report, fx);
    }

    /// Fire any due response or retransmission timers.
    pub(crate) fn on_timers(&mut self, now: Instant, fx: &mut Effects) {
        if self.state == LifecycleState::Closed {
            return;
        }
        if let Some(deadline) = self.response_deadline
            && now >= deadline
        {
            let text = match self.state {
                LifecycleState::Initiated => TEXT_OPEN_TIMEOUT,
                _ => TEXT_AUTH_TIMEOUT,
            };
            warn!("response timeout: stream={}, state={:?}", self.id, self.state);
            fx.outbound.push(self.close_message());
            let report = (self.close.app_active || self.close.want_final_status)
                .then(|| State::closed_recover(StateCode::Timeout, text));
            self.terminate(report, fx);
            return;
        }

        if let Err(exhausted) = self.sender.on_timeout(now) {
            warn!("stream {}: {exhausted}", self.id);
            if exhausted.fin {
                self.abandon(fx);
            } else {
                fx.outbound.push(self.close_message());
                let report = (self.close.app_active || self.close.want_final_status)
                    .then(|| State::closed_recover(StateCode::Timeout, TEXT_RETRANSMIT));
                self.terminate(report, fx);
            }
        }
    }

    /// Move queued units and due acknowledgments into `fx`.
    pub(crate) fn flush(&mut self, now: Instant, fx: &mut Effects) {
        if self.state == LifecycleState::Closed {
            return;
        }
        while let Some(transmit) = self.sender.poll_transmit(now) {
            if transmit.retransmission {
                metrics::inc_retransmissions();
            }
            let message = match transmit.unit {
                Unit::Data {
                    fragment,
                    tag,
                    payload,
                } => {
                    let data = DataMessage {
                        stream_id: self.id,
                        seq: transmit.seq,
                        fragment,
                        tag,
                        payload,
                    };
                    if transmit.retransmission {
                        TunnelMessage::Retransmission(data)
                    } else {
                        TunnelMessage::Data(data)
                    }
                }
                Unit::Fin => {
                    self.last_ack_at = Some(now);
                    TunnelMessage::Ack(self.receiver.build_ack(self.id, Some(transmit.seq)))
                }
            };
            fx.outbound.push(message);
        }

        if self.receiver.is_ack_due() && self.ack_deadline().is_none_or(|due| now >= due) {
            self.last_ack_at = Some(now);
            fx.outbound
                .push(TunnelMessage::Ack(self.receiver.build_ack(self.id, None)));
        }
    }

    fn ack_deadline(&self) -> Option<Instant> {
        match self.settings.ack_policy {
            AckPolicy::Immediate => None,
            AckPolicy::Periodic(interval) => self.last_ack_at.map(|last| last + interval),
        }
    }

    /// Earliest instant at which [`TunnelStream::on_timers`] or
    /// [`TunnelStream::flush`] has work to do.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        if self.state == LifecycleState::Closed {
            return None;
        }
        let ack = if self.receiver.is_ack_due() {
            self.ack_deadline()
        } else {
            None
        };
        [self.response_deadline, self.sender.next_deadline(), ack]
            .into_iter()
            .flatten()
            .min()
    }

    #[cfg(test)]
    pub(crate) fn sender(&self) -> &SendWindow { &self.sender }
}

#[cfg(test)]
mod tests;
