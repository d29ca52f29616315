//! Tests for the tunnel stream state machine, driven without a connection.

use std::time::Instant;

use bytes::Bytes;
use rstest::rstest;

use super::*;
use crate::{
    listener::ListenerDecision,
    message::{DataState, StreamState},
};

struct Gate {
    password: &'static [u8],
}

impl Listener for Gate {
    fn on_open_request(&mut self, request: &OpenRequest) -> ListenerDecision {
        ListenerDecision::Accept(request.cos.clone())
    }

    fn on_auth_request(&mut self, _info: &StreamInfo, credentials: &[u8]) -> AuthDecision {
        if credentials == self.password {
            AuthDecision::Accept
        } else {
            AuthDecision::Reject("bad password".to_owned())
        }
    }
}

fn gate() -> Gate { Gate { password: b"hunter2" } }

fn pool() -> BufferPool { BufferPool::new(16, 4) }

fn consumer(params: &OpenParams, now: Instant) -> (TunnelStream, OpenRequest) {
    let (stream, request) =
        TunnelStream::open_local(StreamId::new(1), params, &TunnelConfig::default(), pool(), now)
            .expect("open local");
    let TunnelMessage::OpenRequest(request) = request else {
        panic!("expected an open request");
    };
    (stream, request)
}

fn provider(request: &OpenRequest, now: Instant) -> (TunnelStream, TunnelMessage) {
    TunnelStream::accept_remote(request, request.cos.clone(), &TunnelConfig::default(), pool(), now)
        .expect("accept remote")
}

fn open_provider(now: Instant) -> TunnelStream {
    let (_, request) = consumer(&OpenParams::new("TUNNEL"), now);
    let (stream, _) = provider(&request, now);
    assert_eq!(stream.state(), LifecycleState::Open);
    stream
}

fn shuttle(
    to: &mut TunnelStream,
    listener: &mut dyn Listener,
    messages: Vec<TunnelMessage>,
    now: Instant,
) -> Effects {
    let mut fx = Effects::default();
    for message in messages {
        to.on_message(message, listener, now, &mut fx);
    }
    to.flush(now, &mut fx);
    fx
}

fn statuses(fx: &Effects) -> Vec<&State> {
    fx.events
        .iter()
        .filter_map(|event| match event {
            Event::Status { state, .. } => Some(state),
            _ => None,
        })
        .collect()
}

#[rstest]
#[case(1, true)]
#[case(MAX_NAME_LEN, true)]
#[case(MAX_NAME_LEN + 1, false)]
#[case(0, false)]
fn name_length_bounds(#[case] len: usize, #[case] valid: bool) {
    assert_eq!(validate_name(&vec![b'n'; len]).is_ok(), valid);
}

#[test]
fn login_without_credentials_is_a_construction_error() {
    let params = OpenParams::new("TUNNEL")
        .with_cos(ClassOfService::default().with_authentication(Authentication::EmbeddedLogin));
    let err = TunnelStream::open_local(
        StreamId::new(1),
        &params,
        &TunnelConfig::default(),
        pool(),
        Instant::now(),
    )
    .expect_err("credentials are required");
    assert_eq!(err, ConstructionError::MissingCredentials);
}

#[test]
fn open_request_advertises_local_receive_window() {
    let (_, request) = consumer(&OpenParams::new("TUNNEL"), Instant::now());
    assert_eq!(
        request.cos.recv_window_or(0),
        TunnelConfig::default().default_recv_window
    );
    assert_eq!(request.filter, request.cos.filter());
}

#[test]
fn close_is_idempotent() {
    let now = Instant::now();
    let mut stream = open_provider(now);

    let mut fx = Effects::default();
    stream.close(false, &mut fx);
    assert_eq!(stream.state(), LifecycleState::ClosingLocal);
    assert_eq!(stream.sender().retained(), 1);

    let mut again = Effects::default();
    stream.close(true, &mut again);
    assert!(again.outbound.is_empty());
    assert!(again.events.is_empty());
    assert_eq!(stream.sender().retained(), 1);
}

#[rstest]
#[case(false, 0)]
#[case(true, 1)]
fn close_before_response_sends_close(#[case] want_final: bool, #[case] expected_statuses: usize) {
    let (mut stream, _) = consumer(&OpenParams::new("TUNNEL"), Instant::now());
    let mut fx = Effects::default();
    stream.close(want_final, &mut fx);

    assert!(stream.is_retired());
    assert!(matches!(fx.outbound.as_slice(), [TunnelMessage::Close(_)]));
    assert_eq!(statuses(&fx).len(), expected_statuses);
}

#[test]
fn refused_open_reports_provider_state() {
    let now = Instant::now();
    let (mut stream, _) = consumer(&OpenParams::new("TUNNEL"), now);
    let refusal = TunnelMessage::OpenResponse(OpenResponse {
        stream_id: StreamId::new(1),
        state: State::closed(StateCode::NotEntitled, "no"),
        cos: ClassOfService::default(),
    });

    let fx = shuttle(&mut stream, &mut gate(), vec![refusal], now);

    assert!(stream.is_retired());
    assert_eq!(statuses(&fx), vec![&State::closed(StateCode::NotEntitled, "no")]);
}

#[test]
fn upgraded_response_is_a_protocol_violation() {
    let now = Instant::now();
    let params = OpenParams::new("TUNNEL").with_cos(ClassOfService::default().with_max_msg_size(100));
    let (mut stream, _) = consumer(&params, now);
    let response = TunnelMessage::OpenResponse(OpenResponse {
        stream_id: StreamId::new(1),
        state: State::open_ok("ok"),
        cos: ClassOfService::default().with_max_msg_size(200),
    });

    let fx = shuttle(&mut stream, &mut gate(), vec![response], now);

    assert!(stream.is_retired());
    assert!(matches!(fx.outbound.as_slice(), [TunnelMessage::Close(_)]));
    let [state] = statuses(&fx)[..] else {
        panic!("expected one status");
    };
    assert_eq!(state.code, StateCode::ProtocolError);
}

#[test]
fn data_before_open_response_is_a_protocol_violation() {
    let now = Instant::now();
    let (mut stream, _) = consumer(&OpenParams::new("TUNNEL"), now);
    let data = TunnelMessage::Data(DataMessage {
        stream_id: StreamId::new(1),
        seq: crate::message::SeqNum::zero(),
        fragment: crate::fragment::FragmentHeader::single(crate::fragment::MessageId::new(1), 1),
        tag: ContainerTag::Opaque,
        payload: Bytes::from_static(b"x"),
    });

    let fx = shuttle(&mut stream, &mut gate(), vec![data], now);

    assert!(stream.is_retired());
    assert_eq!(statuses(&fx)[0].code, StateCode::ProtocolError);
}

fn login_params(password: &'static [u8]) -> OpenParams {
    OpenParams::new("SECURE")
        .with_cos(ClassOfService::default().with_authentication(Authentication::EmbeddedLogin))
        .with_credentials(password)
}

#[test]
fn login_exchange_opens_both_sides() {
    let now = Instant::now();
    let (mut local, request) = consumer(&login_params(b"hunter2"), now);
    let (mut remote, response) = provider(&request, now);
    assert_eq!(remote.state(), LifecycleState::AwaitingAuth);

    let login = shuttle(&mut local, &mut gate(), vec![response], now);
    assert_eq!(local.state(), LifecycleState::AwaitingAuth);
    assert!(matches!(
        login.outbound.as_slice(),
        [TunnelMessage::Data(DataMessage { tag: ContainerTag::Login, .. })]
    ));

    let verdict = shuttle(&mut remote, &mut gate(), login.outbound, now);
    assert_eq!(remote.state(), LifecycleState::Open);
    assert_eq!(statuses(&verdict), vec![&State::open_ok(TEXT_ESTABLISHED)]);

    let opened = shuttle(&mut local, &mut gate(), verdict.outbound, now);
    assert_eq!(local.state(), LifecycleState::Open);
    assert_eq!(statuses(&opened), vec![&State::open_ok(TEXT_ESTABLISHED)]);
}

#[test]
fn rejected_login_closes_both_sides() {
    let now = Instant::now();
    let (mut local, request) = consumer(&login_params(b"wrong"), now);
    let (mut remote, response) = provider(&request, now);

    let login = shuttle(&mut local, &mut gate(), vec![response], now);
    let verdict = shuttle(&mut remote, &mut gate(), login.outbound, now);
    assert!(remote.is_retired());

    let closed = shuttle(&mut local, &mut gate(), verdict.outbound, now);
    assert!(local.is_retired());
    assert_eq!(
        statuses(&closed),
        vec![&State::closed(StateCode::NotEntitled, "bad password")]
    );
}

#[test]
fn connection_loss_with_reconnect_keeps_stream() {
    let now = Instant::now();
    let mut stream = open_provider(now);
    let mut fx = Effects::default();

    stream.on_connection_lost(true, &mut fx);
    assert_eq!(stream.state(), LifecycleState::Open);
    let [state] = statuses(&fx)[..] else {
        panic!("expected one status");
    };
    assert_eq!(
        (state.stream, state.data, state.code),
        (StreamState::Open, DataState::Suspect, StateCode::ConnectionLost)
    );

    let mut fx = Effects::default();
    stream.on_connection_lost(false, &mut fx);
    assert!(stream.is_retired());
    assert_eq!(statuses(&fx)[0].stream, StreamState::ClosedRecover);
}

#[test]
fn exhausted_retransmissions_close_the_stream() {
    let now = Instant::now();
    let mut stream = open_provider(now);
    stream
        .submit(Bytes::from_static(b"lost"), None, ContainerTag::Opaque)
        .expect("submit");

    let mut fx = Effects::default();
    stream.flush(now, &mut fx);
    let mut guard = 0;
    while let Some(deadline) = stream.next_deadline() {
        stream.on_timers(deadline, &mut fx);
        stream.flush(deadline, &mut fx);
        guard += 1;
        assert!(guard < 16, "retransmission never gave up");
    }

    let resent = fx
        .outbound
        .iter()
        .filter(|message| matches!(message, TunnelMessage::Retransmission(_)))
        .count();
    assert_eq!(resent, 4);
    assert!(stream.is_retired());
    assert!(matches!(fx.outbound.last(), Some(TunnelMessage::Close(_))));
    assert_eq!(
        statuses(&fx),
        vec![&State::closed_recover(StateCode::Timeout, TEXT_RETRANSMIT)]
    );
}

#[test]
fn login_timeout_runs_from_the_login_not_the_open() {
    let now = Instant::now();
    let timeout = TunnelConfig::default().response_timeout;
    let (mut local, request) = consumer(&login_params(b"hunter2"), now);
    let (_, response) = provider(&request, now);

    let later = now + timeout / 2;
    shuttle(&mut local, &mut gate(), vec![response], later);
    assert_eq!(local.state(), LifecycleState::AwaitingAuth);

    let mut fx = Effects::default();
    local.on_timers(now + timeout, &mut fx);
    assert_eq!(local.state(), LifecycleState::AwaitingAuth);
    assert!(statuses(&fx).is_empty());

    local.on_timers(later + timeout, &mut fx);
    assert!(local.is_retired());
    assert!(matches!(fx.outbound.last(), Some(TunnelMessage::Close(_))));
    assert_eq!(
        statuses(&fx),
        vec![&State::closed_recover(StateCode::Timeout, TEXT_AUTH_TIMEOUT)]
    );
}

#[test]
fn unanswered_login_times_out_on_the_provider() {
    let now = Instant::now();
    let (_, request) = consumer(&login_params(b"hunter2"), now);
    let (mut remote, _) = provider(&request, now);
    assert_eq!(remote.state(), LifecycleState::AwaitingAuth);

    let mut fx = Effects::default();
    remote.on_timers(now + TunnelConfig::default().response_timeout, &mut fx);

    assert!(remote.is_retired());
    assert_eq!(
        statuses(&fx),
        vec![&State::closed_recover(StateCode::Timeout, TEXT_AUTH_TIMEOUT)]
    );
}

fn fragment(
    message: u16,
    seq: u32,
    index: u32,
    last: bool,
    payload: &'static [u8],
) -> TunnelMessage {
    TunnelMessage::Data(DataMessage {
        stream_id: StreamId::new(1),
        seq: SeqNum::new(seq),
        fragment: FragmentHeader::new(
            crate::fragment::MessageId::new(message),
            crate::fragment::FragmentIndex::new(index),
            8,
            last,
        ),
        tag: ContainerTag::Opaque,
        payload: Bytes::from_static(payload),
    })
}

fn messages(fx: &Effects) -> usize {
    fx.events
        .iter()
        .filter(|event| matches!(event, Event::Message { .. }))
        .count()
}

#[test]
fn changed_total_length_closes_the_stream() {
    let now = Instant::now();
    let mut stream = open_provider(now);
    let TunnelMessage::Data(mut longer) = fragment(1, 1, 1, true, b"aaaa") else {
        unreachable!("fragment builds data messages");
    };
    longer.fragment = FragmentHeader::new(
        longer.fragment.message_id(),
        longer.fragment.fragment_index(),
        9,
        true,
    );
    let longer = TunnelMessage::Data(longer);

    let fx = shuttle(
        &mut stream,
        &mut gate(),
        vec![fragment(1, 0, 0, false, b"AAAA"), longer],
        now,
    );

    assert!(stream.is_retired());
    assert_eq!(messages(&fx), 0);
    assert!(fx.outbound.iter().any(|m| matches!(m, TunnelMessage::Close(_))));
    let [state] = statuses(&fx)[..] else {
        panic!("expected one status");
    };
    assert_eq!(
        (state.stream, state.code),
        (StreamState::Closed, StateCode::ProtocolError)
    );
}

#[test]
fn local_close_drops_a_payload_still_in_flight() {
    let now = Instant::now();
    let mut stream = open_provider(now);
    shuttle(&mut stream, &mut gate(), vec![fragment(1, 0, 0, false, b"AAAA")], now);
    assert!(stream.reassembler.is_in_progress());

    let mut fx = Effects::default();
    stream.close(false, &mut fx);
    let rest = shuttle(&mut stream, &mut gate(), vec![fragment(1, 1, 1, true, b"aaaa")], now);

    assert_eq!(messages(&rest), 0);
    assert_eq!(stream.state(), LifecycleState::ClosingLocal);
}

#[test]
fn close_message_discards_partial_reassembly() {
    let now = Instant::now();
    let mut stream = open_provider(now);
    shuttle(&mut stream, &mut gate(), vec![fragment(1, 0, 0, false, b"AAAA")], now);

    let close = TunnelMessage::Close(CloseMessage {
        stream_id: StreamId::new(1),
    });
    let fx = shuttle(&mut stream, &mut gate(), vec![close], now);

    assert!(stream.is_retired());
    assert!(!stream.reassembler.is_in_progress());
    assert_eq!(messages(&fx), 0);
}

#[test]
fn best_effort_restarts_reassembly_on_a_new_first_fragment() {
    let now = Instant::now();
    let params = OpenParams::new("TUNNEL")
        .with_cos(ClassOfService::default().with_data_integrity(crate::cos::DataIntegrity::BestEffort));
    let (_, request) = consumer(&params, now);
    let (mut stream, _) = provider(&request, now);

    let fx = shuttle(
        &mut stream,
        &mut gate(),
        vec![
            fragment(1, 0, 0, false, b"AAAA"),
            fragment(2, 2, 0, false, b"BBBB"),
            fragment(2, 3, 1, true, b"bbbb"),
        ],
        now,
    );

    assert!(!stream.is_retired());
    let payloads: Vec<&Bytes> = fx
        .events
        .iter()
        .filter_map(|event| match event {
            Event::Message { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(payloads, vec![&Bytes::from_static(b"BBBBbbbb")]);
}
