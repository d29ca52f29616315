//! End-to-end stream scenarios between a consumer and a provider.
//!
//! Both multiplexers run over the in-memory loopback connection and are
//! driven by explicit dispatch passes, so every exchange is deterministic.

mod common;

use std::time::{Duration, Instant};

use common::{Endpoints, TestResult, accepted, endpoints, payloads, statuses};
use rstest::rstest;
use tunnelframe::{
    AllocationError,
    AuthDecision,
    Authentication,
    ClassOfService,
    ConstructionError,
    ContainerTag,
    DataIntegrity,
    DataState,
    FlowControl,
    Listener,
    ListenerDecision,
    OpenError,
    OpenParams,
    OpenRequest,
    StateCode,
    StreamInfo,
    SeqNum,
    StreamState,
    SubmitError,
    TunnelConfig,
    TunnelMessage,
};

const PAYLOAD: &[u8] = b"PETER CAPALDI";

fn basic_cos() -> ClassOfService {
    ClassOfService::default()
        .with_max_msg_size(614_400)
        .with_max_fragment_size(6144)
        .with_data_integrity(DataIntegrity::Reliable)
        .with_flow_control(FlowControl::Bidirectional { recv_window: None })
}

#[rstest]
fn basic_exchange_and_peer_close(mut endpoints: Endpoints) -> TestResult {
    let now = Instant::now();
    let handle = endpoints
        .consumer
        .open_at(&OpenParams::new("TUNNEL").with_cos(basic_cos()), now)?;
    let (consumer_events, provider_events) = endpoints.settle(now);
    assert_eq!(
        statuses(&consumer_events),
        vec![(StreamState::Open, DataState::Ok, StateCode::None)]
    );
    let remote = accepted(&provider_events).ok_or("provider did not accept the stream")?;

    endpoints
        .consumer
        .submit_bytes(handle, PAYLOAD, ContainerTag::Opaque)?;
    let (_, provider_events) = endpoints.settle(now);
    assert_eq!(payloads(&provider_events), vec![PAYLOAD.to_vec()]);
    assert!(matches!(
        provider_events.as_slice(),
        [tunnelframe::Event::Message { tag: ContainerTag::Opaque, .. }]
    ));

    endpoints
        .provider
        .submit_bytes(remote, PAYLOAD, ContainerTag::Opaque)?;
    endpoints.provider.close(remote, false);
    let (consumer_events, provider_events) = endpoints.settle(now);

    assert_eq!(payloads(&consumer_events), vec![PAYLOAD.to_vec()]);
    assert_eq!(
        statuses(&consumer_events),
        vec![
            (StreamState::Open, DataState::Suspect, StateCode::None),
            (StreamState::ClosedRecover, DataState::Suspect, StateCode::None),
        ]
    );
    assert!(statuses(&provider_events).is_empty());
    assert_eq!(endpoints.consumer.stream_count(), 0);
    assert_eq!(endpoints.provider.stream_count(), 0);
    Ok(())
}

#[rstest]
fn buffer_ceiling_applies_on_both_sides(mut endpoints: Endpoints) -> TestResult {
    let now = Instant::now();
    let cos = ClassOfService::default().with_max_msg_size(1000);
    let handle = endpoints
        .consumer
        .open_at(&OpenParams::new("TUNNEL").with_cos(cos), now)?;
    let (_, provider_events) = endpoints.settle(now);
    let remote = accepted(&provider_events).ok_or("provider did not accept the stream")?;

    for (side, stream) in [(&endpoints.consumer, handle), (&endpoints.provider, remote)] {
        assert!(matches!(
            side.get_buffer(stream, 1001),
            Err(AllocationError::TooLarge {
                requested: 1001,
                limit: 1000
            })
        ));
        let buffer = side.get_buffer(stream, 1000)?;
        assert_eq!(side.info(stream).ok_or("stream missing")?.buffers_used, 1);
        side.release_buffer(buffer)?;
        assert_eq!(side.info(stream).ok_or("stream missing")?.buffers_used, 0);
    }
    Ok(())
}

#[rstest]
fn pooled_buffer_is_held_until_acknowledged(mut endpoints: Endpoints) -> TestResult {
    let now = Instant::now();
    let handle = endpoints.consumer.open_at(&OpenParams::new("TUNNEL"), now)?;
    endpoints.settle(now);

    let mut buffer = endpoints.consumer.get_buffer(handle, PAYLOAD.len())?;
    buffer.put_slice(PAYLOAD)?;
    endpoints
        .consumer
        .submit(handle, buffer, ContainerTag::Message)?;
    assert_eq!(endpoints.consumer.pool().usage(handle.id()), 1);

    let (_, provider_events) = endpoints.settle(now);
    assert_eq!(payloads(&provider_events), vec![PAYLOAD.to_vec()]);
    assert_eq!(endpoints.consumer.pool().usage(handle.id()), 0);
    Ok(())
}

#[rstest]
fn unacknowledged_output_exhausts_the_stream_allowance() -> TestResult {
    let config = TunnelConfig::default().with_guaranteed_output_buffers(2);
    let mut endpoints = Endpoints::new(&config);
    let now = Instant::now();
    let handle = endpoints.consumer.open_at(&OpenParams::new("TUNNEL"), now)?;
    endpoints.settle(now);

    endpoints.consumer.submit_bytes(handle, "one", ContainerTag::Opaque)?;
    endpoints.consumer.submit_bytes(handle, "two", ContainerTag::Opaque)?;
    assert!(matches!(
        endpoints
            .consumer
            .submit_bytes(handle, "three", ContainerTag::Opaque),
        Err(SubmitError::Allocation(AllocationError::StreamLimit { limit: 2, .. }))
    ));
    assert!(matches!(
        endpoints.consumer.get_buffer(handle, 8),
        Err(AllocationError::StreamLimit { limit: 2, .. })
    ));
    assert_eq!(endpoints.consumer.info(handle).ok_or("stream missing")?.buffers_used, 2);

    let (_, provider_events) = endpoints.settle(now);
    assert_eq!(
        payloads(&provider_events),
        vec![b"one".to_vec(), b"two".to_vec()]
    );
    assert_eq!(endpoints.consumer.pool().usage(handle.id()), 0);
    endpoints.consumer.submit_bytes(handle, "three", ContainerTag::Opaque)?;
    Ok(())
}

#[rstest]
#[case(255, true)]
#[case(256, false)]
fn stream_name_bounds(mut endpoints: Endpoints, #[case] len: usize, #[case] valid: bool) {
    let result = endpoints.consumer.open(&OpenParams::new(vec![b'x'; len]));
    if valid {
        assert!(result.is_ok());
    } else {
        assert_eq!(
            result,
            Err(OpenError::Construction(ConstructionError::NameTooLong {
                len: 256,
                max: 255
            }))
        );
    }
}

#[rstest]
fn repeated_close_reports_one_final_status(mut endpoints: Endpoints) -> TestResult {
    let now = Instant::now();
    let handle = endpoints.consumer.open_at(&OpenParams::new("TUNNEL"), now)?;
    endpoints.settle(now);

    endpoints.consumer.close(handle, true);
    endpoints.consumer.close(handle, false);
    endpoints.consumer.close(handle, true);
    let (consumer_events, provider_events) = endpoints.settle(now);

    assert_eq!(
        statuses(&consumer_events),
        vec![(StreamState::Closed, DataState::Suspect, StateCode::None)]
    );
    assert_eq!(
        statuses(&provider_events),
        vec![
            (StreamState::Open, DataState::Suspect, StateCode::None),
            (StreamState::ClosedRecover, DataState::Suspect, StateCode::None),
        ]
    );
    endpoints.consumer.close(handle, true);
    assert!(endpoints.consumer.dispatch_at(now).is_empty());
    Ok(())
}

#[rstest]
fn listener_rejection_is_reported() -> TestResult {
    let mut endpoints = Endpoints::new(&TunnelConfig::default());
    endpoints.provider = endpoints.provider.with_listener(|_: &OpenRequest| {
        ListenerDecision::Reject("Service unavailable.".to_owned())
    });
    let now = Instant::now();
    endpoints.consumer.open_at(&OpenParams::new("TUNNEL"), now)?;

    let (consumer_events, provider_events) = endpoints.settle(now);

    assert!(provider_events.is_empty());
    let [tunnelframe::Event::Status { state, .. }] = consumer_events.as_slice() else {
        return Err("expected a single status".into());
    };
    assert_eq!(state.stream, StreamState::Closed);
    assert_eq!(state.code, StateCode::NotEntitled);
    assert_eq!(state.text, "Service unavailable.");
    assert_eq!(endpoints.consumer.stream_count(), 0);
    Ok(())
}

struct PasswordListener;

impl Listener for PasswordListener {
    fn on_open_request(&mut self, request: &OpenRequest) -> ListenerDecision {
        ListenerDecision::Accept(
            request
                .cos
                .clone()
                .with_authentication(Authentication::EmbeddedLogin),
        )
    }

    fn on_auth_request(&mut self, _info: &StreamInfo, credentials: &[u8]) -> AuthDecision {
        if credentials == b"letmein" {
            AuthDecision::Accept
        } else {
            AuthDecision::Reject("Login rejected.".to_owned())
        }
    }
}

#[rstest]
#[case(b"letmein", StreamState::Open, StateCode::None)]
#[case(b"guess", StreamState::Closed, StateCode::NotEntitled)]
fn provider_required_login(
    #[case] password: &'static [u8],
    #[case] stream: StreamState,
    #[case] code: StateCode,
) -> TestResult {
    let mut endpoints = Endpoints::new(&TunnelConfig::default());
    endpoints.provider = endpoints.provider.with_listener(PasswordListener);
    let now = Instant::now();
    endpoints.consumer.open_at(
        &OpenParams::new("SECURE").with_credentials(password),
        now,
    )?;

    let (consumer_events, _) = endpoints.settle(now);

    let observed = statuses(&consumer_events);
    let &(last_stream, _, last_code) = observed.last().ok_or("no status reported")?;
    assert_eq!((last_stream, last_code), (stream, code));
    assert_eq!(observed.len(), 1);
    Ok(())
}

#[rstest]
fn lost_data_is_resent_after_timeout(mut endpoints: Endpoints) -> TestResult {
    let now = Instant::now();
    let handle = endpoints.consumer.open_at(&OpenParams::new("TUNNEL"), now)?;
    endpoints.settle(now);

    let mut dropped = false;
    endpoints.consumer.connection_mut().set_drop_filter(move |message| {
        let drop_it = !dropped && matches!(message, TunnelMessage::Data(_));
        dropped |= drop_it;
        drop_it
    });
    endpoints
        .consumer
        .submit_bytes(handle, PAYLOAD, ContainerTag::Opaque)?;
    let (_, provider_events) = endpoints.settle(now);
    assert!(payloads(&provider_events).is_empty());

    let retry_at = endpoints
        .consumer
        .next_deadline()
        .ok_or("no retransmission scheduled")?;
    assert_eq!(retry_at, now + Duration::from_millis(150));
    let (_, provider_events) = endpoints.settle(retry_at);
    assert_eq!(payloads(&provider_events), vec![PAYLOAD.to_vec()]);
    assert_eq!(endpoints.consumer.next_deadline(), None);
    Ok(())
}

#[rstest]
fn nak_triggers_retransmission_in_order(mut endpoints: Endpoints) -> TestResult {
    let now = Instant::now();
    let handle = endpoints.consumer.open_at(&OpenParams::new("TUNNEL"), now)?;
    endpoints.settle(now);

    let mut dropped = false;
    endpoints.consumer.connection_mut().set_drop_filter(move |message| {
        let drop_it = !dropped && matches!(message, TunnelMessage::Data(_));
        dropped |= drop_it;
        drop_it
    });
    endpoints.consumer.submit_bytes(handle, "one", ContainerTag::Opaque)?;
    endpoints.consumer.submit_bytes(handle, "two", ContainerTag::Opaque)?;
    let (_, provider_events) = endpoints.settle(now);

    assert_eq!(
        payloads(&provider_events),
        vec![b"one".to_vec(), b"two".to_vec()]
    );
    Ok(())
}

#[rstest]
fn best_effort_skips_lost_data() -> TestResult {
    let mut endpoints = Endpoints::new(&TunnelConfig::default());
    let now = Instant::now();
    let cos = ClassOfService::default().with_data_integrity(DataIntegrity::BestEffort);
    let handle = endpoints
        .consumer
        .open_at(&OpenParams::new("TUNNEL").with_cos(cos), now)?;
    endpoints.settle(now);

    let mut dropped = false;
    endpoints.consumer.connection_mut().set_drop_filter(move |message| {
        let drop_it = !dropped && matches!(message, TunnelMessage::Data(_));
        dropped |= drop_it;
        drop_it
    });
    endpoints.consumer.submit_bytes(handle, "one", ContainerTag::Opaque)?;
    endpoints.consumer.submit_bytes(handle, "two", ContainerTag::Opaque)?;
    let (_, provider_events) = endpoints.settle(now);
    let (_, later_events) = endpoints.settle(now + Duration::from_secs(5));

    assert_eq!(payloads(&provider_events), vec![b"two".to_vec()]);
    assert!(payloads(&later_events).is_empty());
    Ok(())
}

#[rstest]
#[case(false, StreamState::ClosedRecover, 0)]
#[case(true, StreamState::Open, 1)]
fn connection_loss(
    #[case] reconnect: bool,
    #[case] expected: StreamState,
    #[case] remaining: usize,
) -> TestResult {
    let mut endpoints = Endpoints::new(&TunnelConfig::default().with_reconnect(reconnect));
    let now = Instant::now();
    endpoints.consumer.open_at(&OpenParams::new("TUNNEL"), now)?;
    endpoints.settle(now);

    endpoints.consumer.connection().sever();
    let (consumer_events, provider_events) = endpoints.settle(now);

    for events in [&consumer_events, &provider_events] {
        assert_eq!(
            statuses(events),
            vec![(expected, DataState::Suspect, StateCode::ConnectionLost)]
        );
    }
    assert_eq!(endpoints.consumer.stream_count(), remaining);
    assert_eq!(endpoints.provider.stream_count(), remaining);
    Ok(())
}

#[rstest]
fn stream_survives_reconnection() -> TestResult {
    let mut endpoints = Endpoints::new(&TunnelConfig::default().with_reconnect(true));
    let now = Instant::now();
    let handle = endpoints.consumer.open_at(&OpenParams::new("TUNNEL"), now)?;
    endpoints.settle(now);

    endpoints.consumer.connection().sever();
    endpoints.settle(now);
    assert!(endpoints.consumer.open(&OpenParams::new("OTHER")).is_err());
    endpoints.consumer.connection().restore();
    endpoints.settle(now);

    endpoints
        .consumer
        .submit_bytes(handle, PAYLOAD, ContainerTag::Opaque)?;
    let (_, provider_events) = endpoints.settle(now);
    assert_eq!(payloads(&provider_events), vec![PAYLOAD.to_vec()]);
    Ok(())
}

#[rstest]
fn large_payload_is_fragmented_under_flow_control() -> TestResult {
    let config = TunnelConfig::default().with_default_recv_window(8);
    let mut endpoints = Endpoints::new(&config);
    let now = Instant::now();
    let handle = endpoints
        .consumer
        .open_at(&OpenParams::new("TUNNEL").with_cos(basic_cos()), now)?;
    endpoints.settle(now);

    let payload: Vec<u8> = (0..614_400u32).map(|i| (i % 251) as u8).collect();
    endpoints
        .consumer
        .submit_bytes(handle, payload.clone(), ContainerTag::Opaque)?;
    let (_, provider_events) = endpoints.settle(now);

    assert_eq!(payloads(&provider_events), vec![payload]);
    Ok(())
}

#[rstest]
fn close_after_loss_waits_for_the_resent_data() -> TestResult {
    let config = TunnelConfig::default().with_default_recv_window(1);
    let mut endpoints = Endpoints::new(&config);
    let now = Instant::now();
    let handle = endpoints.consumer.open_at(&OpenParams::new("TUNNEL"), now)?;
    endpoints.settle(now);

    let mut dropped = false;
    endpoints.consumer.connection_mut().set_drop_filter(move |message| {
        let drop_it = !dropped && matches!(message, TunnelMessage::Data(_));
        dropped |= drop_it;
        drop_it
    });
    endpoints.consumer.submit_bytes(handle, "one", ContainerTag::Opaque)?;
    endpoints.consumer.close(handle, true);
    let (consumer_events, provider_events) = endpoints.settle(now);

    assert_eq!(payloads(&provider_events), vec![b"one".to_vec()]);
    assert_eq!(
        statuses(&provider_events),
        vec![
            (StreamState::Open, DataState::Suspect, StateCode::None),
            (StreamState::ClosedRecover, DataState::Suspect, StateCode::None),
        ]
    );
    assert_eq!(
        statuses(&consumer_events),
        vec![(StreamState::Closed, DataState::Suspect, StateCode::None)]
    );
    assert_eq!(endpoints.consumer.stream_count(), 0);
    assert_eq!(endpoints.provider.stream_count(), 0);
    Ok(())
}

#[rstest]
fn best_effort_keeps_the_message_after_a_lost_fragment() -> TestResult {
    let mut endpoints = Endpoints::new(&TunnelConfig::default());
    let now = Instant::now();
    let cos = ClassOfService::default()
        .with_data_integrity(DataIntegrity::BestEffort)
        .with_max_fragment_size(4);
    let handle = endpoints
        .consumer
        .open_at(&OpenParams::new("TUNNEL").with_cos(cos), now)?;
    endpoints.settle(now);

    endpoints.consumer.connection_mut().set_drop_filter(|message| {
        matches!(message, TunnelMessage::Data(data) if data.seq == SeqNum::new(1))
    });
    endpoints.consumer.submit_bytes(handle, "AAAAaaaa", ContainerTag::Opaque)?;
    endpoints.consumer.submit_bytes(handle, "BBBBbbbb", ContainerTag::Opaque)?;
    let (_, provider_events) = endpoints.settle(now);

    assert_eq!(payloads(&provider_events), vec![b"BBBBbbbb".to_vec()]);
    assert!(statuses(&provider_events).is_empty());
    Ok(())
}
