//! Shared utilities for integration tests.
//!
//! Provides a connected consumer/provider pair over the in-memory loopback
//! connection, a helper that runs dispatch passes until traffic settles, and
//! serialised access to the global log capture.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{
    sync::{Mutex, MutexGuard, OnceLock},
    time::Instant,
};

use logtest::Logger;
use rstest::fixture;
use tunnelframe::{
    DataState,
    Event,
    LoopbackConnection,
    Multiplexer,
    Role,
    StateCode,
    StreamHandle,
    StreamState,
    TunnelConfig,
};

/// Shared result type for integration tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub type Endpoint = Multiplexer<LoopbackConnection>;

/// Consumer and provider joined by a loopback connection.
pub struct Endpoints {
    pub consumer: Endpoint,
    pub provider: Endpoint,
}

impl Endpoints {
    pub fn new(config: &TunnelConfig) -> Self {
        let (a, b) = LoopbackConnection::pair();
        Self {
            consumer: Multiplexer::new(a, Role::Consumer, config.clone()),
            provider: Multiplexer::new(b, Role::Provider, config.clone()),
        }
    }

    /// Run dispatch passes on both sides at `now` until neither side has
    /// anything left in flight. Returns the consumer's and the provider's
    /// events in order.
    pub fn settle(&mut self, now: Instant) -> (Vec<Event>, Vec<Event>) {
        let mut consumer_events = Vec::new();
        let mut provider_events = Vec::new();
        for _ in 0..32 {
            provider_events.extend(self.provider.dispatch_at(now));
            consumer_events.extend(self.consumer.dispatch_at(now));
            if self.consumer.connection().in_flight() == 0
                && self.provider.connection().in_flight() == 0
            {
                break;
            }
        }
        (consumer_events, provider_events)
    }
}

#[fixture]
pub fn endpoints() -> Endpoints { Endpoints::new(&TunnelConfig::default()) }

/// Stream and data state of every status event, in order.
pub fn statuses(events: &[Event]) -> Vec<(StreamState, DataState, StateCode)> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Status { state, .. } => Some((state.stream, state.data, state.code)),
            _ => None,
        })
        .collect()
}

/// Payloads delivered to the application, in order.
pub fn payloads(events: &[Event]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Message { payload, .. } => Some(payload.to_vec()),
            _ => None,
        })
        .collect()
}

/// Handle of the first stream the provider accepted.
pub fn accepted(events: &[Event]) -> Option<StreamHandle> {
    events.iter().find_map(|event| match event {
        Event::Accepted { handle, .. } => Some(*handle),
        _ => None,
    })
}

/// Handle to the global logger with exclusive access.
///
/// This guard ensures tests do not interfere with each other's log capture by
/// serialising access to a [`logtest::Logger`].
pub struct LoggerHandle {
    guard: MutexGuard<'static, Logger>,
}

impl LoggerHandle {
    /// Acquire the global [`Logger`] instance.
    pub fn new() -> Self {
        static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

        let logger = LOGGER.get_or_init(|| Mutex::new(Logger::start()));
        let guard = logger.lock().expect("logger poisoned");

        Self { guard }
    }
}

impl std::ops::Deref for LoggerHandle {
    type Target = Logger;

    fn deref(&self) -> &Self::Target { &self.guard }
}

impl std::ops::DerefMut for LoggerHandle {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.guard }
}

#[fixture]
pub fn logger() -> LoggerHandle { LoggerHandle::new() }
