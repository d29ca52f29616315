//! Tokio transport for tunnel stream traffic.
//!
//! [`FramedConnection`] runs a background task that pumps a
//! [`Framed`] byte stream using [`TunnelCodec`]. The protocol engine talks to
//! the task through unbounded channels, so [`Connection::poll`] and
//! [`Connection::send`] never block.

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError},
    task::JoinHandle,
};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::{
    codec::TunnelCodec,
    connection::{Connection, ConnectionError, ConnectionEvent},
    message::TunnelMessage,
    multiplexer::{Event, Multiplexer},
};

/// Connection backed by a framed async byte stream.
#[derive(Debug)]
pub struct FramedConnection {
    outbound: UnboundedSender<TunnelMessage>,
    inbound: UnboundedReceiver<ConnectionEvent>,
    pending: Option<ConnectionEvent>,
    usable: bool,
    task: JoinHandle<()>,
}

impl FramedConnection {
    /// Start pumping `io` on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn spawn<T>(io: T, codec: TunnelCodec) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(Framed::new(io, codec), outbound_rx, inbound_tx));
        Self {
            outbound,
            inbound,
            pending: None,
            usable: true,
            task,
        }
    }

    /// Wait until an event is ready to be polled.
    ///
    /// Returns immediately once the connection has shut down.
    pub async fn readable(&mut self) {
        if self.pending.is_some() || !self.usable {
            return;
        }
        self.pending = Some(self.inbound.recv().await.unwrap_or(ConnectionEvent::Down));
    }

    /// Whether the background task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool { self.task.is_finished() }

    fn observe(&mut self, event: ConnectionEvent) -> ConnectionEvent {
        if event == ConnectionEvent::Down {
            self.usable = false;
        }
        event
    }
}

impl Connection for FramedConnection {
    fn send(&mut self, message: TunnelMessage) -> Result<(), ConnectionError> {
        if !self.usable {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(message)
            .map_err(|_| ConnectionError::Closed)
    }

    fn poll(&mut self) -> Result<Option<ConnectionEvent>, ConnectionError> {
        if let Some(event) = self.pending.take() {
            return Ok(Some(self.observe(event)));
        }
        match self.inbound.try_recv() {
            Ok(event) => Ok(Some(self.observe(event))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) if self.usable => {
                Ok(Some(self.observe(ConnectionEvent::Down)))
            }
            Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn is_usable(&self) -> bool { self.usable }
}

async fn pump<T>(
    framed: Framed<T, TunnelCodec>,
    mut outbound: UnboundedReceiver<TunnelMessage>,
    inbound: UnboundedSender<ConnectionEvent>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = framed.split();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(message)) => {
                    if inbound.send(ConnectionEvent::Message(message)).is_err() {
                        debug!("connection handle dropped");
                        break;
                    }
                }
                Some(Err(error)) => {
                    warn!(%error, "closing connection after codec error");
                    break;
                }
                None => {
                    debug!("peer closed connection");
                    break;
                }
            },
            message = outbound.recv() => {
                let Some(message) = message else {
                    debug!("connection handle dropped");
                    break;
                };
                if let Err(error) = sink.send(message).await {
                    warn!(%error, "failed to write frame");
                    break;
                }
            }
        }
    }
    let _ = inbound.send(ConnectionEvent::Down);
}

impl Multiplexer<FramedConnection> {
    /// Run a dispatch pass, first waiting for input or for the next timer
    /// if there is nothing to report straight away.
    pub async fn wait(&mut self) -> Vec<Event> {
        let events = self.dispatch();
        if !events.is_empty() {
            return events;
        }
        match self.next_deadline() {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                // Timing out only means the deadline passed.
                let _ = tokio::time::timeout_at(deadline, self.connection_mut().readable()).await;
            }
            None => self.connection_mut().readable().await,
        }
        self.dispatch()
    }
}
