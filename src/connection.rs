//! Message-oriented connections carrying tunnel stream traffic.
//!
//! The multiplexer only needs to send a message and to poll for the next
//! inbound event, so [`Connection`] is a small synchronous trait. The
//! [`LoopbackConnection`] pair links two multiplexers in memory and can
//! simulate loss and outages; [`crate::transport::FramedConnection`] carries
//! the same messages over any async byte stream.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use log::{debug, trace};
use thiserror::Error;

use crate::{
    codec::{CodecError, decode_message, encode_message},
    message::TunnelMessage,
};

/// Something a connection reports when polled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A message from the peer.
    Message(TunnelMessage),
    /// The connection went down.
    Down,
    /// The connection came back after going down.
    Up,
}

/// Errors raised by a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The connection is closed and cannot carry traffic.
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A bidirectional, message-oriented link to the peer.
pub trait Connection {
    /// Queue a message for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the message cannot be encoded or the
    /// connection is down.
    fn send(&mut self, message: TunnelMessage) -> Result<(), ConnectionError>;

    /// Return the next pending event without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if inbound data cannot be decoded or the
    /// connection failed.
    fn poll(&mut self) -> Result<Option<ConnectionEvent>, ConnectionError>;

    /// Whether the connection can currently carry traffic.
    fn is_usable(&self) -> bool { true }
}

enum Item {
    Frame(Bytes),
    Down,
    Up,
}

struct Link {
    up: bool,
    queues: [VecDeque<Item>; 2],
}

type DropFilter = Box<dyn FnMut(&TunnelMessage) -> bool + Send>;

/// One end of an in-memory connection pair.
///
/// Messages are encoded with the wire codec on send and decoded on poll, so
/// the loopback exercises the same serialization as a socket.
pub struct LoopbackConnection {
    link: Arc<Mutex<Link>>,
    side: usize,
    drop_filter: Option<DropFilter>,
}

impl fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("side", &self.side)
            .field("usable", &self.is_usable())
            .finish_non_exhaustive()
    }
}

impl LoopbackConnection {
    /// Create two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(Mutex::new(Link {
            up: true,
            queues: [VecDeque::new(), VecDeque::new()],
        }));
        let end = |side| Self {
            link: Arc::clone(&link),
            side,
            drop_filter: None,
        };
        (end(0), end(1))
    }

    fn lock(&self) -> MutexGuard<'_, Link> { self.link.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Silently discard messages sent from this end for which `filter`
    /// returns `true`.
    pub fn set_drop_filter<F>(&mut self, filter: F)
    where
        F: FnMut(&TunnelMessage) -> bool + Send + 'static,
    {
        self.drop_filter = Some(Box::new(filter));
    }

    /// Stop discarding messages.
    pub fn clear_drop_filter(&mut self) { self.drop_filter = None; }

    /// Take the link down. Undelivered messages are lost and both ends
    /// observe [`ConnectionEvent::Down`].
    pub fn sever(&self) {
        let mut link = self.lock();
        if !link.up {
            return;
        }
        link.up = false;
        for queue in &mut link.queues {
            queue.clear();
            queue.push_back(Item::Down);
        }
        debug!("loopback link severed");
    }

    /// Bring the link back up. Both ends observe [`ConnectionEvent::Up`].
    pub fn restore(&self) {
        let mut link = self.lock();
        if link.up {
            return;
        }
        link.up = true;
        for queue in &mut link.queues {
            queue.push_back(Item::Up);
        }
        debug!("loopback link restored");
    }

    /// Number of items waiting to be polled by the peer.
    #[must_use]
    pub fn in_flight(&self) -> usize { self.lock().queues[1 - self.side].len() }
}

impl Connection for LoopbackConnection {
    fn send(&mut self, message: TunnelMessage) -> Result<(), ConnectionError> {
        if !self.is_usable() {
            return Err(ConnectionError::Closed);
        }
        if let Some(filter) = self.drop_filter.as_mut()
            && filter(&message)
        {
            trace!("loopback dropped {} message", message.opcode());
            return Ok(());
        }
        let frame = encode_message(&message)?;
        self.lock().queues[1 - self.side].push_back(Item::Frame(frame));
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<ConnectionEvent>, ConnectionError> {
        let item = self.lock().queues[self.side].pop_front();
        match item {
            None => Ok(None),
            Some(Item::Down) => Ok(Some(ConnectionEvent::Down)),
            Some(Item::Up) => Ok(Some(ConnectionEvent::Up)),
            Some(Item::Frame(frame)) => Ok(Some(ConnectionEvent::Message(decode_message(&frame)?))),
        }
    }

    fn is_usable(&self) -> bool { self.lock().up }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CloseMessage, StreamId};

    fn close(id: i32) -> TunnelMessage { TunnelMessage::Close(CloseMessage { stream_id: StreamId::new(id) }) }

    #[test]
    fn messages_cross_the_pair_in_order() {
        let (mut a, mut b) = LoopbackConnection::pair();
        a.send(close(1)).expect("send");
        a.send(close(2)).expect("send");
        assert_eq!(a.in_flight(), 2);
        assert_eq!(b.poll().expect("poll"), Some(ConnectionEvent::Message(close(1))));
        assert_eq!(b.poll().expect("poll"), Some(ConnectionEvent::Message(close(2))));
        assert_eq!(b.poll().expect("poll"), None);
    }

    #[test]
    fn drop_filter_discards_matching_messages() {
        let (mut a, mut b) = LoopbackConnection::pair();
        a.set_drop_filter(|m: &TunnelMessage| m.stream_id() == StreamId::new(1));
        a.send(close(1)).expect("send");
        a.send(close(2)).expect("send");
        assert_eq!(b.poll().expect("poll"), Some(ConnectionEvent::Message(close(2))));
    }

    #[test]
    fn sever_and_restore_are_observed_by_both_ends() {
        let (mut a, mut b) = LoopbackConnection::pair();
        a.send(close(1)).expect("send");
        b.sever();
        assert!(matches!(a.send(close(2)), Err(ConnectionError::Closed)));
        assert_eq!(b.poll().expect("poll"), Some(ConnectionEvent::Down));
        assert_eq!(a.poll().expect("poll"), Some(ConnectionEvent::Down));

        a.restore();
        assert!(b.is_usable());
        assert_eq!(b.poll().expect("poll"), Some(ConnectionEvent::Up));
    }
}
