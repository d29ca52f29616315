//! Stream registry multiplexing tunnel streams over one connection.
//!
//! The [`Multiplexer`] owns the [`Connection`], the buffer pool, and every
//! live [`TunnelStream`]. Application calls queue work; each call to
//! [`Multiplexer::dispatch`] drains the connection, routes inbound messages
//! by stream id, fires due timers, sends whatever the streams produced, and
//! returns the resulting [`Event`]s. Nothing inside a dispatch pass blocks.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    time::Instant,
};

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::{
    config::TunnelConfig,
    connection::{Connection, ConnectionError, ConnectionEvent},
    cos::ClassOfService,
    error::{AllocationError, OpenError, SubmitError},
    listener::{AcceptAll, Listener, ListenerDecision, RejectAll},
    message::{
        ContainerTag,
        OpenRequest,
        State,
        StateCode,
        StatusMessage,
        StreamId,
        TunnelMessage,
    },
    metrics::{self, Direction},
    pool::{BufferPool, PooledBuffer},
    stream::{Effects, StreamInfo, TunnelStream, validate_name},
};

/// Which side of the tunnel this multiplexer plays.
///
/// The role fixes the sign of locally allocated stream ids and the default
/// listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Opens streams; ids count up from 1. Refuses inbound opens by default.
    Consumer,
    /// Accepts streams; ids count down from -1. Accepts inbound opens by default.
    Provider,
}

/// Application-side reference to a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(StreamId);

impl StreamHandle {
    pub(crate) fn new(id: StreamId) -> Self { Self(id) }

    /// Identifier of the stream on the wire.
    #[must_use]
    pub fn id(self) -> StreamId { self.0 }
}

/// Something the application needs to know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The stream's state changed.
    Status { handle: StreamHandle, state: State },
    /// A complete application payload arrived.
    Message {
        handle: StreamHandle,
        tag: ContainerTag,
        payload: Bytes,
    },
    /// The listener accepted a stream opened by the peer.
    Accepted { handle: StreamHandle, info: StreamInfo },
}

impl Event {
    /// Stream the event concerns.
    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        match self {
            Self::Status { handle, .. }
            | Self::Message { handle, .. }
            | Self::Accepted { handle, .. } => *handle,
        }
    }
}

/// Parameters for opening a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenParams {
    /// Name identifying the requested stream; 1 to 255 bytes.
    pub name: Bytes,
    pub domain: u8,
    pub service_id: u16,
    /// Requested class of service. The provider may downgrade it.
    pub cos: ClassOfService,
    /// Login presented when the class of service requires authentication.
    pub credentials: Option<Bytes>,
}

impl OpenParams {
    /// Parameters for `name` with the default class of service.
    #[must_use]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            domain: 0,
            service_id: 0,
            cos: ClassOfService::default(),
            credentials: None,
        }
    }

    #[must_use]
    pub fn with_domain(mut self, domain: u8) -> Self {
        self.domain = domain;
        self
    }

    #[must_use]
    pub fn with_service_id(mut self, service_id: u16) -> Self {
        self.service_id = service_id;
        self
    }

    #[must_use]
    pub fn with_cos(mut self, cos: ClassOfService) -> Self {
        self.cos = cos;
        self
    }

    /// Set the login presented during authentication.
    #[must_use]
    pub fn with_credentials(mut self, credentials: impl Into<Bytes>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }
}

/// Registry and dispatcher for the streams on one connection.
pub struct Multiplexer<C> {
    connection: C,
    config: TunnelConfig,
    role: Role,
    streams: BTreeMap<StreamId, TunnelStream>,
    listener: Box<dyn Listener + Send>,
    pool: BufferPool,
    next_stream_id: Option<StreamId>,
    outbound: VecDeque<TunnelMessage>,
    events: Vec<Event>,
    connection_up: bool,
}

impl<C> fmt::Debug for Multiplexer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.role)
            .field("streams", &self.streams.len())
            .field("connection_up", &self.connection_up)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Multiplexer<C> {
    /// Create a multiplexer over `connection`.
    #[must_use]
    pub fn new(connection: C, role: Role, config: TunnelConfig) -> Self {
        let listener: Box<dyn Listener + Send> = match role {
            Role::Consumer => Box::new(RejectAll),
            Role::Provider => Box::new(AcceptAll::new()),
        };
        let first_id = match role {
            Role::Consumer => StreamId::new(1),
            Role::Provider => StreamId::new(-1),
        };
        Self {
            connection,
            pool: BufferPool::new(config.max_buffers, config.guaranteed_output_buffers),
            config,
            role,
            streams: BTreeMap::new(),
            listener,
            next_stream_id: Some(first_id),
            outbound: VecDeque::new(),
            events: Vec::new(),
            connection_up: true,
        }
    }

    /// Replace the listener that decides on inbound open requests.
    #[must_use]
    pub fn with_listener<L>(mut self, listener: L) -> Self
    where
        L: Listener + Send + 'static,
    {
        self.listener = Box::new(listener);
        self
    }

    #[must_use]
    pub fn role(&self) -> Role { self.role }

    #[must_use]
    pub fn config(&self) -> &TunnelConfig { &self.config }

    #[must_use]
    pub fn connection(&self) -> &C { &self.connection }

    pub fn connection_mut(&mut self) -> &mut C { &mut self.connection }

    /// Buffer pool shared by every stream on this connection.
    #[must_use]
    pub fn pool(&self) -> &BufferPool { &self.pool }

    /// Number of streams not yet retired.
    #[must_use]
    pub fn stream_count(&self) -> usize { self.streams.len() }

    /// Open a stream. The request is sent immediately; the outcome arrives
    /// as an [`Event::Status`] from a later dispatch pass.
    ///
    /// # Errors
    ///
    /// Returns [`OpenError`] if the parameters are invalid, the connection is
    /// down, or an open for the same name, domain, and service is still
    /// outstanding.
    pub fn open(&mut self, params: &OpenParams) -> Result<StreamHandle, OpenError> {
        self.open_at(params, Instant::now())
    }

    /// [`Multiplexer::open`] with an explicit clock reading.
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::open`].
    pub fn open_at(&mut self, params: &OpenParams, now: Instant) -> Result<StreamHandle, OpenError> {
        if !self.connection_up || !self.connection.is_usable() {
            return Err(OpenError::ConnectionUnavailable);
        }
        if let Some(existing) = self
            .streams
            .values()
            .find(|s| s.is_pending_open_for(&params.name, params.domain, params.service_id))
        {
            return Err(OpenError::Duplicate {
                existing: existing.id(),
            });
        }

        let id = self.next_stream_id.ok_or(OpenError::StreamIdsExhausted)?;
        let (stream, request) =
            TunnelStream::open_local(id, params, &self.config, self.pool.clone(), now)?;
        self.next_stream_id = match self.role {
            Role::Consumer => id.get().checked_add(1),
            Role::Provider => id.get().checked_sub(1),
        }
        .map(StreamId::new);

        self.streams.insert(id, stream);
        metrics::inc_streams();
        self.outbound.push_back(request);
        self.send_outbound();
        Ok(StreamHandle::new(id))
    }

    /// Queue the contents of a pooled buffer on a stream.
    ///
    /// The buffer is consumed. A refused payload returns its pool slot at
    /// once; an accepted one keeps the slot until the peer acknowledges it.
    /// Data is sent on the next dispatch pass.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] if the stream is unknown or not open, the
    /// buffer was issued for another stream or pool, the tag is reserved, or
    /// the payload exceeds the negotiated maximum message size.
    pub fn submit(
        &mut self,
        handle: StreamHandle,
        buffer: PooledBuffer,
        tag: ContainerTag,
    ) -> Result<(), SubmitError> {
        let stream = self
            .streams
            .get_mut(&handle.id())
            .ok_or(SubmitError::UnknownStream(handle.id()))?;
        if buffer.stream_id() != handle.id() || !buffer.belongs_to(&self.pool) {
            return Err(SubmitError::ForeignBuffer {
                owner: buffer.stream_id(),
                stream: handle.id(),
            });
        }
        let (payload, slot) = buffer.into_parts();
        stream.submit(payload, Some(slot), tag)
    }

    /// Queue a payload that was not built in a pooled buffer.
    ///
    /// The payload still takes a pool slot until the peer acknowledges it.
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::submit`]. Also returns [`SubmitError::Allocation`]
    /// when the stream's buffer allowance or the pool is used up.
    pub fn submit_bytes(
        &mut self,
        handle: StreamHandle,
        payload: impl Into<Bytes>,
        tag: ContainerTag,
    ) -> Result<(), SubmitError> {
        self.streams
            .get_mut(&handle.id())
            .ok_or(SubmitError::UnknownStream(handle.id()))?
            .submit(payload.into(), None, tag)
    }

    /// Reserve a buffer of `size` bytes for a stream.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError`] if the stream is unknown, `size` exceeds
    /// its negotiated maximum message size, or the pool limits are reached.
    pub fn get_buffer(&self, handle: StreamHandle, size: usize) -> Result<PooledBuffer, AllocationError> {
        let stream = self
            .streams
            .get(&handle.id())
            .ok_or(AllocationError::UnknownStream(handle.id()))?;
        self.pool.acquire(handle.id(), size, stream.cos().max_msg_size)
    }

    /// Return an unused buffer to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::ForeignBuffer`] for buffers from another pool.
    pub fn release_buffer(&self, buffer: PooledBuffer) -> Result<(), AllocationError> {
        self.pool.release(buffer)
    }

    /// Begin closing a stream.
    ///
    /// With `want_final_status` the application receives a final
    /// [`Event::Status`] once the handshake finishes. Closing an unknown,
    /// closing, or closed stream does nothing.
    pub fn close(&mut self, handle: StreamHandle, want_final_status: bool) {
        let Some(stream) = self.streams.get_mut(&handle.id()) else {
            debug!("close for unknown stream {} ignored", handle.id());
            return;
        };
        let mut fx = Effects::default();
        stream.close(want_final_status, &mut fx);
        self.absorb(fx);
        self.send_outbound();
    }

    /// Snapshot of a live stream.
    #[must_use]
    pub fn info(&self, handle: StreamHandle) -> Option<StreamInfo> {
        self.streams.get(&handle.id()).map(TunnelStream::info)
    }

    /// Run one dispatch pass using the current time.
    pub fn dispatch(&mut self) -> Vec<Event> { self.dispatch_at(Instant::now()) }

    /// Run one dispatch pass at `now`.
    ///
    /// Polls the connection until it has nothing more, routes every message,
    /// fires due timers, sends pending output, retires closed streams, and
    /// returns the events produced since the previous pass.
    pub fn dispatch_at(&mut self, now: Instant) -> Vec<Event> {
        loop {
            match self.connection.poll() {
                Ok(Some(ConnectionEvent::Message(message))) => {
                    metrics::inc_messages(Direction::Inbound);
                    self.route(message, now);
                }
                Ok(Some(ConnectionEvent::Down)) => self.on_connection_down(),
                Err(ConnectionError::Closed) => {
                    self.on_connection_down();
                    break;
                }
                Ok(Some(ConnectionEvent::Up)) => {
                    if !self.connection_up {
                        info!("connection restored");
                    }
                    self.connection_up = true;
                }
                Ok(None) => break,
                Err(err) => warn!("discarding undecodable inbound frame: {err}"),
            }
        }

        if self.connection_up {
            let mut fx = Effects::default();
            for stream in self.streams.values_mut() {
                stream.on_timers(now, &mut fx);
                stream.flush(now, &mut fx);
            }
            self.absorb(fx);
            self.send_outbound();
        }
        self.retire_closed();
        std::mem::take(&mut self.events)
    }

    /// Earliest instant at which a dispatch pass has timer work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.streams.values().filter_map(TunnelStream::next_deadline).min()
    }

    fn route(&mut self, message: TunnelMessage, now: Instant) {
        let id = message.stream_id();
        if let Some(stream) = self.streams.get_mut(&id) {
            let mut fx = Effects::default();
            stream.on_message(message, self.listener.as_mut(), now, &mut fx);
            self.absorb(fx);
            return;
        }
        match message {
            TunnelMessage::OpenRequest(request) => self.on_open_request(&request, now),
            other => debug!("dropping {} for unknown stream {id}", other.opcode()),
        }
    }

    fn on_open_request(&mut self, request: &OpenRequest, now: Instant) {
        let id = request.stream_id;
        if let Err(err) = validate_name(&request.name).and_then(|()| request.cos.validate()) {
            warn!("refusing invalid open request for stream {id}: {err}");
            self.reject(id, err.to_string());
            return;
        }

        let offered = match self.listener.on_open_request(request) {
            ListenerDecision::Accept(cos) => cos,
            ListenerDecision::Reject(reason) => {
                info!("listener refused stream {id}: {reason}");
                self.reject(id, reason);
                return;
            }
        };
        let negotiated = request.cos.negotiate(&offered);
        let (stream, response) =
            match TunnelStream::accept_remote(request, negotiated, &self.config, self.pool.clone(), now) {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("listener accepted stream {id} with an unusable class of service: {err}");
                    self.reject(id, err.to_string());
                    return;
                }
            };

        let handle = StreamHandle::new(id);
        self.outbound.push_back(response);
        self.events.push(Event::Accepted {
            handle,
            info: stream.info(),
        });
        let mut fx = Effects::default();
        stream.announce(&mut fx);
        self.absorb(fx);
        self.streams.insert(id, stream);
        metrics::inc_streams();
    }

    fn reject(&mut self, stream_id: StreamId, text: String) {
        self.outbound.push_back(TunnelMessage::Status(StatusMessage {
            stream_id,
            state: State::closed(StateCode::NotEntitled, text),
        }));
    }

    fn on_connection_down(&mut self) {
        if !self.connection_up {
            return;
        }
        self.connection_up = false;
        self.outbound.clear();
        warn!(
            "connection lost: streams={}, reconnect={}",
            self.streams.len(),
            self.config.reconnect
        );
        let mut fx = Effects::default();
        for stream in self.streams.values_mut() {
            stream.on_connection_lost(self.config.reconnect, &mut fx);
        }
        fx.outbound.clear();
        self.absorb(fx);
    }

    fn absorb(&mut self, fx: Effects) {
        self.outbound.extend(fx.outbound);
        self.events.extend(fx.events);
    }

    fn send_outbound(&mut self) {
        while let Some(message) = self.outbound.pop_front() {
            let opcode = message.opcode();
            match self.connection.send(message) {
                Ok(()) => metrics::inc_messages(Direction::Outbound),
                Err(ConnectionError::Closed) => {
                    self.on_connection_down();
                    return;
                }
                Err(err) => error!("failed to send {opcode} message: {err}"),
            }
        }
    }

    fn retire_closed(&mut self) {
        let before = self.streams.len();
        self.streams.retain(|id, stream| {
            let retired = stream.is_retired();
            if retired {
                debug!("retiring stream {id}");
            }
            !retired
        });
        for _ in self.streams.len()..before {
            metrics::dec_streams();
        }
    }
}
