//! End-to-end call and registration flows over the in-memory channel
//! transport, with a scripted SIP edge standing in for the server.

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, SipMessage, StatusCode};
use sipua::config::UserAgentConfig;
use sipua::media::MediaConnectionState;
use sipua::media::MediaEvent;
use sipua::transport::channel::ChannelConnection;
use sipua::transport::{SipAddr, SipConnection, TransportEvent, TransportLayer};
use sipua::useragent::account::{AccountConfig, AccountKey, RegistrationState};
use sipua::useragent::dtmf::DtmfMode;
use sipua::useragent::state::{CallOutcome, CallState, CallStateInfo, HoldState};
use sipua::useragent::AppEvent;
use sipua::{UserAgent, UserAgentBuilder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(3);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();
}

fn edge_addr() -> SipAddr {
    SipAddr::tcp("edge.ex.test", 5060)
}

fn test_config() -> UserAgentConfig {
    UserAgentConfig {
        invite_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(2),
        register_retry_base: Duration::from_millis(100),
        register_retry_cap: Duration::from_secs(1),
        terminal_linger: Duration::from_millis(300),
        shutdown_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn alice() -> AccountConfig {
    AccountConfig {
        user: "alice".into(),
        domain: "ex.test".into(),
        password: "secret".into(),
        display_name: Some("Alice".into()),
        edge: edge_addr(),
        expires: None,
        push: None,
    }
}

const ANSWER_SDP: &str = "v=0\r\n\
    o=- 99 99 IN IP4 192.0.2.20\r\n\
    s=-\r\n\
    c=IN IP4 192.0.2.20\r\n\
    t=0 0\r\n\
    m=audio 4100 RTP/AVP 0\r\n\
    a=sendrecv\r\n";

/// An INVITE the way the edge would deliver one for alice.
fn incoming_invite(call_id: &str, branch: &str) -> rsip::Request {
    rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from("sip:alice@ex.test").expect("uri"),
        headers: vec![
            rsip::headers::Via::new(format!("SIP/2.0/TCP edge.ex.test:5060;branch={}", branch))
                .into(),
            rsip::headers::CSeq::new("1 INVITE").into(),
            rsip::headers::From::new("\"Carol\" <sip:carol@ex.test>;tag=carol-tag").into(),
            rsip::headers::To::new("<sip:alice@ex.test>").into(),
            rsip::headers::CallId::new(call_id).into(),
            rsip::headers::Contact::new("<sip:carol@edge.ex.test:5060>").into(),
            rsip::headers::ContentType::new("application/sdp").into(),
            rsip::headers::ContentLength::new(ANSWER_SDP.len().to_string()).into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: ANSWER_SDP.as_bytes().to_vec(),
    }
}

/// Scripted remote edge: reads what the agent sends, injects whatever
/// the script calls for.
struct MockEdge {
    addr: SipAddr,
    connection: SipConnection,
    inbound: Option<sipua::transport::TransportSender>,
    outbound: UnboundedReceiver<TransportEvent>,
}

impl MockEdge {
    async fn attach(layer: &TransportLayer) -> Self {
        let addr = edge_addr();
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let (outbound_tx, outbound_rx) = unbounded_channel();
        let connection =
            ChannelConnection::create_connection(inbound_rx, outbound_tx, addr.clone())
                .await
                .expect("channel connection");
        let connection = SipConnection::Channel(connection);
        layer.add_connection(connection.clone());
        MockEdge {
            addr,
            connection,
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
        }
    }

    fn inject(&self, msg: SipMessage) {
        self.inbound
            .as_ref()
            .expect("edge closed")
            .send(TransportEvent::Incoming(
                msg,
                self.connection.clone(),
                self.addr.clone(),
            ))
            .expect("inject");
    }

    /// Drop the read loop's sender: the agent observes a closed
    /// connection.
    fn close(&mut self) {
        self.inbound.take();
    }

    async fn recv_request(&mut self) -> rsip::Request {
        loop {
            match timeout(WAIT, self.outbound.recv())
                .await
                .expect("edge timed out waiting for a request")
                .expect("transport gone")
            {
                TransportEvent::Incoming(SipMessage::Request(req), _, _) => return req,
                _ => continue,
            }
        }
    }

    async fn recv_response(&mut self) -> rsip::Response {
        loop {
            match timeout(WAIT, self.outbound.recv())
                .await
                .expect("edge timed out waiting for a response")
                .expect("transport gone")
            {
                TransportEvent::Incoming(SipMessage::Response(resp), _, _) => return resp,
                _ => continue,
            }
        }
    }

    fn respond(&self, req: &rsip::Request, status: StatusCode, to_tag: Option<&str>) {
        self.respond_with(req, status, to_tag, None, vec![])
    }

    fn respond_with(
        &self,
        req: &rsip::Request,
        status: StatusCode,
        to_tag: Option<&str>,
        body: Option<(&str, &str)>,
        extra_headers: Vec<Header>,
    ) {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
            )
        });
        if let Some(tag) = to_tag {
            if let Ok(to) = req.to_header() {
                let has_tag = to.tag().ok().flatten().is_some();
                if !has_tag {
                    if let Ok(typed) = to.typed() {
                        headers.unique_push(Header::To(typed.with_tag(tag.into()).into()));
                    }
                }
            }
        }
        headers.unique_push(Header::Contact("<sip:edge@edge.ex.test:5060>".into()));
        for header in extra_headers {
            headers.unique_push(header);
        }
        let body_bytes = match body {
            Some((content_type, body)) => {
                headers.unique_push(Header::ContentType(content_type.into()));
                body.as_bytes().to_vec()
            }
            None => vec![],
        };
        headers.unique_push(Header::ContentLength((body_bytes.len() as u32).into()));
        self.inject(
            rsip::Response {
                status_code: status,
                version: rsip::Version::V2,
                headers,
                body: body_bytes,
            }
            .into(),
        );
    }
}

struct Harness {
    ua: UserAgent,
    edge: MockEdge,
    layer: TransportLayer,
    call_state: watch::Receiver<Arc<CallStateInfo>>,
    registration: watch::Receiver<sipua::useragent::account::RegistrationSnapshot>,
}

async fn harness() -> Harness {
    init_tracing();
    let cancel = CancellationToken::new();
    let layer = TransportLayer::new(cancel.child_token());
    let edge = MockEdge::attach(&layer).await;

    let ua = UserAgentBuilder::new()
        .with_config(test_config())
        .with_transport_layer(layer.clone())
        .with_cancel_token(cancel)
        .build();
    let serve_ua = ua.clone();
    tokio::spawn(async move { serve_ua.serve().await });

    let call_state = ua.call_state();
    let registration = ua.registration_states();
    Harness {
        ua,
        edge,
        layer,
        call_state,
        registration,
    }
}

async fn wait_for_state(rx: &mut watch::Receiver<Arc<CallStateInfo>>, want: CallState) {
    timeout(WAIT, async {
        loop {
            if rx.borrow_and_update().state == want {
                return;
            }
            rx.changed().await.expect("state publisher gone");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for call state {}", want));
}

async fn wait_for_registration(
    rx: &mut watch::Receiver<sipua::useragent::account::RegistrationSnapshot>,
    key: &AccountKey,
    want: RegistrationState,
) {
    timeout(WAIT, async {
        loop {
            if rx.borrow_and_update().states.get(key) == Some(&want) {
                return;
            }
            rx.changed().await.expect("registration publisher gone");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for registration {}", want));
}

/// Register alice with a plain 200.
async fn register_alice(h: &mut Harness) {
    h.ua.register_account(alice()).expect("register");
    let register = h.edge.recv_request().await;
    assert_eq!(register.method, rsip::Method::Register);
    h.edge.respond(&register, StatusCode::OK, None);
    wait_for_registration(&mut h.registration, &alice().key(), RegistrationState::Ok).await;
}

/// Drive an outgoing call up to STREAMS_RUNNING; returns (call_id, the
/// INVITE as the edge saw it).
async fn establish_outgoing(h: &mut Harness) -> (String, rsip::Request) {
    let call_id = h
        .ua
        .make_call(&alice().key(), "bob@ex.test")
        .await
        .expect("make call");

    let invite = h.edge.recv_request().await;
    assert_eq!(invite.method, rsip::Method::Invite);
    assert!(!invite.body.is_empty(), "INVITE must carry the SDP offer");

    h.edge.respond(&invite, StatusCode::Trying, None);
    wait_for_state(&mut h.call_state, CallState::OutgoingProgress).await;

    h.edge.respond(&invite, StatusCode::Ringing, Some("edge-tag"));
    wait_for_state(&mut h.call_state, CallState::OutgoingRinging).await;

    h.edge.respond_with(
        &invite,
        StatusCode::OK,
        Some("edge-tag"),
        Some(("application/sdp", ANSWER_SDP)),
        vec![],
    );
    wait_for_state(&mut h.call_state, CallState::Connected).await;

    let ack = h.edge.recv_request().await;
    assert_eq!(ack.method, rsip::Method::Ack);
    assert_eq!(
        ack.cseq_header().expect("cseq").seq().expect("seq"),
        invite.cseq_header().expect("cseq").seq().expect("seq"),
    );

    h.ua.media_event(
        &call_id,
        MediaEvent::ConnectionState(MediaConnectionState::Connected),
    );
    wait_for_state(&mut h.call_state, CallState::StreamsRunning).await;
    (call_id, invite)
}

// S1: outgoing success with local hangup after the streams ran.
#[tokio::test]
async fn test_outgoing_call_success() {
    let mut h = harness().await;
    let mut call_log = h.ua.take_call_log();
    register_alice(&mut h).await;

    let (_call_id, _invite) = establish_outgoing(&mut h).await;

    // let the duration timer see some wall clock
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(h.ua.call_duration() >= Duration::from_millis(1000));

    h.ua.hangup().expect("hangup");
    let bye = h.edge.recv_request().await;
    assert_eq!(bye.method, rsip::Method::Bye);
    h.edge.respond(&bye, StatusCode::OK, None);
    wait_for_state(&mut h.call_state, CallState::Ended).await;

    let entry = timeout(WAIT, call_log.recv())
        .await
        .expect("log timeout")
        .expect("log entry");
    assert_eq!(entry.outcome, CallOutcome::Success);
    assert!(entry.duration_secs >= 1);
}

// S2: outgoing call answered 486.
#[tokio::test]
async fn test_outgoing_call_busy() {
    let mut h = harness().await;
    let mut call_log = h.ua.take_call_log();
    register_alice(&mut h).await;

    h.ua.make_call(&alice().key(), "bob@ex.test")
        .await
        .expect("make call");
    let invite = h.edge.recv_request().await;

    h.edge.respond(&invite, StatusCode::Trying, None);
    wait_for_state(&mut h.call_state, CallState::OutgoingProgress).await;

    h.edge.respond(&invite, StatusCode::BusyHere, Some("edge-tag"));
    wait_for_state(&mut h.call_state, CallState::Error).await;

    let info = h.call_state.borrow().clone();
    assert_eq!(
        info.error_reason,
        sipua::useragent::state::CallErrorReason::Busy
    );
    assert_eq!(info.last_sip_code, Some(486));

    // non-2xx finals are ACKed by the transaction layer
    let ack = h.edge.recv_request().await;
    assert_eq!(ack.method, rsip::Method::Ack);

    let entry = timeout(WAIT, call_log.recv())
        .await
        .expect("log timeout")
        .expect("log entry");
    assert_eq!(entry.outcome, CallOutcome::Aborted);
    assert_eq!(entry.duration_secs, 0);
}

// S3: REGISTER challenged with Digest, answered exactly once.
#[tokio::test]
async fn test_register_with_digest_challenge() {
    let mut h = harness().await;
    h.ua.register_account(alice()).expect("register");

    let first = h.edge.recv_request().await;
    assert_eq!(first.method, rsip::Method::Register);
    assert!(!first
        .headers
        .iter()
        .any(|hdr| matches!(hdr, Header::Authorization(_))));

    h.edge.respond_with(
        &first,
        StatusCode::Unauthorized,
        None,
        None,
        vec![Header::WwwAuthenticate(
            r#"Digest realm="ex.test", nonce="abc", qop="auth", algorithm=MD5"#.into(),
        )],
    );

    let second = h.edge.recv_request().await;
    assert_eq!(second.method, rsip::Method::Register);
    let auth = second
        .headers
        .iter()
        .find_map(|hdr| match hdr {
            Header::Authorization(a) => Some(a.typed().expect("authorization")),
            _ => None,
        })
        .expect("authorized retry");

    // retry is a fresh transaction with a bumped CSeq
    assert_ne!(
        first.via_header().expect("via").typed().expect("via").branch().map(|b| b.to_string()),
        second.via_header().expect("via").typed().expect("via").branch().map(|b| b.to_string()),
    );
    assert!(
        second.cseq_header().expect("cseq").seq().expect("seq")
            > first.cseq_header().expect("cseq").seq().expect("seq")
    );

    // digest response per RFC 2617 with nc=00000001
    let qop = auth.qop.clone().expect("qop");
    match &qop {
        rsip::headers::auth::AuthQop::Auth { nc, .. } => assert_eq!(*nc, 1),
        other => panic!("unexpected qop: {:?}", other),
    }
    let expected = rsip::services::DigestGenerator {
        username: "alice",
        password: "secret",
        algorithm: auth.algorithm.unwrap_or_default(),
        nonce: "abc",
        method: &rsip::Method::Register,
        qop: Some(&qop),
        uri: &second.uri,
        realm: "ex.test",
    }
    .compute();
    assert_eq!(auth.response, expected);

    h.edge.respond_with(
        &second,
        StatusCode::OK,
        None,
        None,
        vec![Header::Expires("3600".into())],
    );
    wait_for_registration(&mut h.registration, &alice().key(), RegistrationState::Ok).await;
    assert_eq!(h.registration.borrow().summary, "1/1 registered");
}

// S4: incoming call declined locally with 603.
#[tokio::test]
async fn test_incoming_call_declined() {
    let mut h = harness().await;
    let mut call_log = h.ua.take_call_log();
    register_alice(&mut h).await;

    let invite = incoming_invite("incoming-1@edge.ex.test", "z9hG4bKincoming1");
    h.edge.inject(invite.into());

    let trying = h.edge.recv_response().await;
    assert_eq!(trying.status_code, StatusCode::Trying);
    let ringing = h.edge.recv_response().await;
    assert_eq!(ringing.status_code, StatusCode::Ringing);
    // our side announced a to-tag on the 180
    assert!(ringing
        .to_header()
        .expect("to")
        .tag()
        .expect("tag parse")
        .is_some());
    wait_for_state(&mut h.call_state, CallState::IncomingReceived).await;

    h.ua.decline().expect("decline");
    let decline = h.edge.recv_response().await;
    assert_eq!(decline.status_code, StatusCode::Decline);
    wait_for_state(&mut h.call_state, CallState::Ended).await;

    let entry = timeout(WAIT, call_log.recv())
        .await
        .expect("log timeout")
        .expect("log entry");
    assert_eq!(entry.outcome, CallOutcome::Declined);
    assert_eq!(entry.duration_secs, 0);
}

// Remote abandons a ringing incoming call: 200 to the CANCEL, 487 to
// the INVITE, logged as missed.
#[tokio::test]
async fn test_incoming_call_cancelled_is_missed() {
    let mut h = harness().await;
    let mut call_log = h.ua.take_call_log();
    register_alice(&mut h).await;

    let invite = incoming_invite("incoming-2@edge.ex.test", "z9hG4bKincoming2");
    h.edge.inject(invite.clone().into());

    let trying = h.edge.recv_response().await;
    assert_eq!(trying.status_code, StatusCode::Trying);
    let ringing = h.edge.recv_response().await;
    assert_eq!(ringing.status_code, StatusCode::Ringing);
    wait_for_state(&mut h.call_state, CallState::IncomingReceived).await;

    // CANCEL mirrors the INVITE: same branch, CSeq number with method
    // CANCEL, no body
    let mut cancel = invite;
    cancel.method = rsip::Method::Cancel;
    cancel
        .headers
        .unique_push(rsip::headers::CSeq::new("1 CANCEL").into());
    cancel
        .headers
        .retain(|hdr| !matches!(hdr, Header::ContentType(_)));
    cancel.headers.unique_push(Header::ContentLength(0.into()));
    cancel.body = vec![];
    h.edge.inject(cancel.into());

    let ok = h.edge.recv_response().await;
    assert_eq!(ok.status_code, StatusCode::OK);
    assert_eq!(
        ok.cseq_header().expect("cseq").method().expect("method"),
        rsip::Method::Cancel
    );

    let terminated = h.edge.recv_response().await;
    assert_eq!(terminated.status_code, StatusCode::RequestTerminated);
    assert_eq!(
        terminated
            .cseq_header()
            .expect("cseq")
            .method()
            .expect("method"),
        rsip::Method::Invite
    );
    wait_for_state(&mut h.call_state, CallState::Ended).await;

    let entry = timeout(WAIT, call_log.recv())
        .await
        .expect("log timeout")
        .expect("log entry");
    assert_eq!(entry.outcome, CallOutcome::Missed);
    assert_eq!(entry.duration_secs, 0);
}

// S5: DTMF over INFO, strict order, paced, bodies per dtmf-relay.
#[tokio::test]
async fn test_dtmf_info_ordering_and_pacing() {
    let mut h = harness().await;
    register_alice(&mut h).await;
    let _ = establish_outgoing(&mut h).await;

    for digit in ['1', '2', '3'] {
        h.ua.send_dtmf(digit, Some(Duration::from_millis(120)), Some(DtmfMode::Info))
            .expect("enqueue");
    }

    let mut stamps = Vec::new();
    let mut cseqs = Vec::new();
    for expected in ["Signal=1\nDuration=120\n", "Signal=2\nDuration=120\n", "Signal=3\nDuration=120\n"] {
        let info = h.edge.recv_request().await;
        assert_eq!(info.method, rsip::Method::Info);
        stamps.push(Instant::now());
        cseqs.push(info.cseq_header().expect("cseq").seq().expect("seq"));
        assert_eq!(info.body, expected.as_bytes());
        h.edge.respond(&info, StatusCode::OK, None);
    }

    for pair in stamps.windows(2) {
        let spacing = pair[1].duration_since(pair[0]);
        assert!(
            spacing >= Duration::from_millis(150),
            "digits spaced only {:?} apart",
            spacing
        );
    }
    // CSeq stays monotonic across in-dialog requests
    assert!(cseqs.windows(2).all(|w| w[1] > w[0]));
    assert_eq!(h.ua.dtmf_queue_status().borrow().pending, 0);
}

// Hold then resume returns to STREAMS_RUNNING on the same Call-ID,
// with the CSeq moving forward on every round trip.
#[tokio::test]
async fn test_hold_resume_round_trip() {
    let mut h = harness().await;
    register_alice(&mut h).await;
    let (call_id, invite) = establish_outgoing(&mut h).await;
    let invite_cseq = invite.cseq_header().expect("cseq").seq().expect("seq");

    h.ua.hold().expect("hold");
    let hold_reinvite = h.edge.recv_request().await;
    assert_eq!(hold_reinvite.method, rsip::Method::Invite);
    let hold_cseq = hold_reinvite
        .cseq_header()
        .expect("cseq")
        .seq()
        .expect("seq");
    assert!(hold_cseq > invite_cseq);
    let body = String::from_utf8_lossy(&hold_reinvite.body);
    assert!(body.contains("a=sendonly"), "hold offer: {}", body);
    assert!(!body.contains("a=sendrecv"));

    h.edge.respond_with(
        &hold_reinvite,
        StatusCode::OK,
        None,
        Some(("application/sdp", ANSWER_SDP)),
        vec![],
    );

    // the 2xx to a re-INVITE is ACKed at the re-INVITE's CSeq
    let ack = h.edge.recv_request().await;
    assert_eq!(ack.method, rsip::Method::Ack);
    assert_eq!(
        ack.cseq_header().expect("cseq").seq().expect("seq"),
        hold_cseq
    );
    wait_for_state(&mut h.call_state, CallState::Paused).await;
    assert_eq!(h.call_state.borrow().hold, HoldState::LocalHold);
    assert_eq!(h.call_state.borrow().call_id, call_id);

    h.ua.resume().expect("resume");
    let resume_reinvite = h.edge.recv_request().await;
    assert_eq!(resume_reinvite.method, rsip::Method::Invite);
    let resume_cseq = resume_reinvite
        .cseq_header()
        .expect("cseq")
        .seq()
        .expect("seq");
    assert!(resume_cseq > hold_cseq);
    let body = String::from_utf8_lossy(&resume_reinvite.body);
    assert!(body.contains("a=sendrecv"), "resume offer: {}", body);

    h.edge.respond_with(
        &resume_reinvite,
        StatusCode::OK,
        None,
        Some(("application/sdp", ANSWER_SDP)),
        vec![],
    );
    let ack = h.edge.recv_request().await;
    assert_eq!(ack.method, rsip::Method::Ack);
    assert_eq!(
        ack.cseq_header().expect("cseq").seq().expect("seq"),
        resume_cseq
    );

    wait_for_state(&mut h.call_state, CallState::StreamsRunning).await;
    assert_eq!(h.call_state.borrow().call_id, call_id);
    assert_eq!(h.call_state.borrow().hold, HoldState::NotOnHold);
}

// S6: transport drops mid-call; the call errors, registration recovers
// over a fresh connection.
#[tokio::test]
async fn test_network_drop_recovers_registration() {
    let mut h = harness().await;
    register_alice(&mut h).await;
    let _ = establish_outgoing(&mut h).await;

    h.edge.close();
    wait_for_state(&mut h.call_state, CallState::Error).await;
    assert_eq!(
        h.call_state.borrow().error_reason,
        sipua::useragent::state::CallErrorReason::NetworkError
    );
    wait_for_registration(
        &mut h.registration,
        &alice().key(),
        RegistrationState::Failed,
    )
    .await;

    // a new connection comes up; nudge the accounts to re-register
    let mut edge2 = MockEdge::attach(&h.layer).await;
    h.ua.set_app_state(AppEvent::DataAvailable);

    let register = edge2.recv_request().await;
    assert_eq!(register.method, rsip::Method::Register);
    edge2.respond(&register, StatusCode::OK, None);
    wait_for_registration(&mut h.registration, &alice().key(), RegistrationState::Ok).await;
}

// register → unregister → register leaves no residue but the nc cache.
#[tokio::test]
async fn test_register_unregister_register_cycle() {
    let mut h = harness().await;
    register_alice(&mut h).await;

    h.ua.unregister_account(&alice().key()).expect("unregister");
    let clear = h.edge.recv_request().await;
    assert_eq!(clear.method, rsip::Method::Register);
    let expires = clear
        .headers
        .iter()
        .find_map(|hdr| match hdr {
            Header::Expires(e) => Some(e.value().trim().to_string()),
            _ => None,
        })
        .expect("expires header");
    assert_eq!(expires, "0");
    h.edge.respond(&clear, StatusCode::OK, None);
    wait_for_registration(
        &mut h.registration,
        &alice().key(),
        RegistrationState::Cleared,
    )
    .await;

    // same account key registers again cleanly
    register_alice(&mut h).await;
}
