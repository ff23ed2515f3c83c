//! Session-level scenarios driven over in-process duplex pipes: the test
//! plays the peer and talks raw FIX to the engine.

use std::{cell::RefCell, net::SocketAddr, rc::Rc};

use fixlink_core::{
    codec::{raw_message, RawMessageError},
    fields::FixString,
    message::{Body, FieldMap, FixMessage, MsgType},
};
use fixlink_session::{
    acceptor::Acceptor,
    application::{AsEvent, FixEvent},
    initiator::{Connector, Initiator},
    session_id::SessionId,
    settings::{ConnectionType, ReconnectSettings, SessionSettings, Settings, StoreSettings},
    store::{Direction, FileStore, MemoryStore, MessageStore},
    Sender,
};
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    task::LocalSet,
    time::{timeout, Duration},
};
use tokio_stream::StreamExt;

const SENDING_TIME: &str = "20190605-11:51:27";

fn acceptor_settings() -> Settings {
    Settings {
        connection_type: ConnectionType::Acceptor,
        host: "127.0.0.1".parse().unwrap(),
        port: 0,
        sender_comp_id: "EXEC".try_into().unwrap(),
        heart_bt_int: Duration::from_secs(30),
        logon_timeout: Duration::from_secs(5),
        logout_timeout: Duration::from_secs(5),
        test_request_grace: 1,
        reconnect: ReconnectSettings::disabled(),
        use_ssl: false,
        ssl_certificate: None,
        ssl_private_key: None,
        store: StoreSettings::memory(),
    }
}

fn initiator_settings() -> Settings {
    Settings {
        connection_type: ConnectionType::Initiator,
        sender_comp_id: "BANZAI".try_into().unwrap(),
        ..acceptor_settings()
    }
}

fn acceptor_session_id() -> SessionId {
    SessionId::new(
        "FIX.4.4".try_into().unwrap(),
        "EXEC".try_into().unwrap(),
        "BANZAI".try_into().unwrap(),
    )
}

fn peer_addr() -> SocketAddr {
    "127.0.0.1:9876".parse().unwrap()
}

/// Frames a `|`-delimited message given without BodyLength<9>/CheckSum<10>.
fn framed(text: &str) -> Vec<u8> {
    let raw = text.replace('|', "\x01");
    let after_begin = raw.find('\x01').unwrap() + 1;
    let body = &raw[after_begin..];
    let mut out = raw[..after_begin].to_string();
    out.push_str(&format!("9={}\x01", body.len()));
    out.push_str(body);
    let check_sum = out.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
    out.push_str(&format!("10={check_sum:03}\x01"));
    out.into_bytes()
}

async fn read_message(peer: &mut DuplexStream, buf: &mut Vec<u8>) -> Box<FixMessage> {
    loop {
        let consumed = match raw_message(buf) {
            Ok((leftover, _)) => Some(buf.len() - leftover.len()),
            Err(RawMessageError::Incomplete) => None,
            Err(err) => panic!("garbled stream from engine: {err}"),
        };
        if let Some(consumed) = consumed {
            let frame: Vec<u8> = buf.drain(..consumed).collect();
            return FixMessage::from_bytes(&frame).expect("engine sent an undecodable frame");
        }

        let mut chunk = [0u8; 4096];
        let n = timeout(Duration::from_secs(60), peer.read(&mut chunk))
            .await
            .expect("timed out waiting for the engine")
            .expect("read failed");
        assert!(n > 0, "engine closed the connection unexpectedly");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Waits until the pump recorded an entry matching `predicate`; the pump
/// runs on the same thread, so yielding is enough to let it catch up.
async fn wait_for_entry(log: &Log, predicate: impl Fn(&str) -> bool) {
    loop {
        if log.borrow().iter().any(|entry| predicate(entry)) {
            return;
        }
        tokio::task::yield_now().await;
    }
}

async fn expect_closed(peer: &mut DuplexStream) {
    let mut chunk = [0u8; 4096];
    loop {
        let n = timeout(Duration::from_secs(60), peer.read(&mut chunk))
            .await
            .expect("timed out waiting for close")
            .expect("read failed");
        if n == 0 {
            return;
        }
    }
}

type Log = Rc<RefCell<Vec<String>>>;
type SenderSlot = Rc<RefCell<Option<Sender>>>;

/// Consumes the acceptor's event stream; without a consumer the outbound
/// application hook would stall.
fn spawn_pump<S: MessageStore + 'static>(mut acceptor: Acceptor<S>, log: Log, sender_slot: SenderSlot) {
    tokio::task::spawn_local(async move {
        while let Some(mut event) = acceptor.next().await {
            let entry = match event.as_event() {
                FixEvent::Created(_) => "created".to_string(),
                FixEvent::Logon(_, sender) => {
                    *sender_slot.borrow_mut() = Some(sender);
                    "logon".to_string()
                }
                FixEvent::Logout(_, reason) => format!("logout:{reason:?}"),
                FixEvent::StatusChanged(_, old, new) => format!("status:{old:?}->{new:?}"),
                FixEvent::AppMsgIn(msg, _responder) => {
                    format!("app_in:{}", msg.header.msg_seq_num)
                }
                FixEvent::AdmMsgIn(msg, _responder) => {
                    format!("adm_in:{}:{}", msg.msg_type().as_fix_str(), msg.header.msg_seq_num)
                }
                FixEvent::AppMsgOut(msg, _responder) => {
                    format!("app_out:{}", msg.header.msg_seq_num)
                }
                FixEvent::DecodeError(_, error) => format!("decode_error:{error}"),
            };
            log.borrow_mut().push(entry);
        }
    });
}

struct AcceptorHarness {
    peer: DuplexStream,
    buf: Vec<u8>,
    log: Log,
    sender_slot: SenderSlot,
}

/// Boots an acceptor engine with one registered session and connects the
/// returned peer stream to it.
fn start_acceptor(mut session_settings_fn: impl FnMut(&mut SessionSettings)) -> AcceptorHarness {
    let mut acceptor = Acceptor::new(acceptor_settings(), Box::new(|_| MemoryStore::new()));
    let session_id = acceptor_session_id();
    let mut session_settings = SessionSettings::new(session_id.clone());
    session_settings_fn(&mut session_settings);
    acceptor.register_session(session_id, session_settings);

    let (peer, server) = duplex(1 << 16);
    let (server_rd, server_wr) = tokio::io::split(server);
    let connection = acceptor.run_session_task(peer_addr(), server_rd, server_wr);
    tokio::task::spawn_local(connection);

    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sender_slot: SenderSlot = Rc::new(RefCell::new(None));
    spawn_pump(acceptor, log.clone(), sender_slot.clone());

    AcceptorHarness {
        peer,
        buf: Vec::new(),
        log,
        sender_slot,
    }
}

async fn logon_exchange(harness: &mut AcceptorHarness, reset: bool) {
    let reset_field = if reset { "141=Y|" } else { "" };
    harness
        .peer
        .write_all(&framed(&format!(
            "8=FIX.4.4|35=A|34=1|49=BANZAI|56=EXEC|52={SENDING_TIME}|98=0|108=30|{reset_field}"
        )))
        .await
        .unwrap();
    let response = read_message(&mut harness.peer, &mut harness.buf).await;
    assert_eq!(response.msg_type(), MsgType::Logon);
    assert_eq!(response.header.msg_seq_num, 1);
}

fn app_fields() -> String {
    "11=ORD-1|21=1|55=MSFT|54=1|38=100|40=1|".to_string()
}

#[tokio::test(flavor = "current_thread")]
async fn clean_logon_with_reset() {
    LocalSet::new()
        .run_until(async {
            let mut harness = start_acceptor(|_| {});
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=A|34=1|49=BANZAI|56=EXEC|52={SENDING_TIME}|98=0|108=30|141=Y|"
                )))
                .await
                .unwrap();

            let response = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(response.header.msg_seq_num, 1);
            assert_eq!(response.header.sender_comp_id, "EXEC");
            assert_eq!(response.header.target_comp_id, "BANZAI");
            let Body::Logon(logon) = &response.body else {
                panic!("expected a Logon response, got {response:?}");
            };
            assert_eq!(logon.heart_bt_int, 30);
            assert_eq!(logon.reset_seq_num_flag, Some(true));

            // next outbound is 2, next inbound is 2: a TestRequest at seq 2
            // is accepted and the Heartbeat reply carries seq 2
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=1|34=2|49=BANZAI|56=EXEC|52={SENDING_TIME}|112=PING-1|"
                )))
                .await
                .unwrap();
            let heartbeat = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(heartbeat.msg_type(), MsgType::Heartbeat);
            assert_eq!(heartbeat.header.msg_seq_num, 2);
            let Body::Heartbeat(heartbeat) = &heartbeat.body else {
                panic!("expected a Heartbeat");
            };
            assert_eq!(heartbeat.test_req_id.as_deref().unwrap(), "PING-1");

            wait_for_entry(&harness.log, |entry| entry == "logon").await;
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn heartbeat_cadence_and_test_request_challenge() {
    LocalSet::new()
        .run_until(async {
            let mut harness = start_acceptor(|_| {});
            logon_exchange(&mut harness, false).await;

            // 30s of silence: exactly one Heartbeat
            let heartbeat = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(heartbeat.msg_type(), MsgType::Heartbeat);
            assert_eq!(heartbeat.header.msg_seq_num, 2);

            // 36s of inbound silence: a TestRequest challenge
            let challenge = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(challenge.msg_type(), MsgType::TestRequest);
            let Body::TestRequest(test_request) = &challenge.body else {
                panic!("expected a TestRequest");
            };

            // echoing the TestReqID clears the challenge and the session
            // stays up: the next message is an ordinary Heartbeat again
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=0|34=2|49=BANZAI|56=EXEC|52={SENDING_TIME}|112={}|",
                    test_request.test_req_id,
                )))
                .await
                .unwrap();
            let next = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(next.msg_type(), MsgType::Heartbeat);
            let Body::Heartbeat(heartbeat) = &next.body else {
                panic!("expected a Heartbeat");
            };
            assert_eq!(heartbeat.test_req_id, None);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unanswered_test_request_tears_the_session_down() {
    LocalSet::new()
        .run_until(async {
            let mut harness = start_acceptor(|_| {});
            logon_exchange(&mut harness, false).await;

            let mut saw_logout = false;
            // silence: Heartbeats and one TestRequest, then a Logout once
            // the challenge expires unanswered
            for _ in 0..8 {
                let msg = read_message(&mut harness.peer, &mut harness.buf).await;
                if msg.msg_type() == MsgType::Logout {
                    saw_logout = true;
                    break;
                }
                assert!(matches!(
                    msg.msg_type(),
                    MsgType::Heartbeat | MsgType::TestRequest
                ));
            }
            assert!(saw_logout, "engine never gave up on the dead peer");
            expect_closed(&mut harness.peer).await;
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn gap_detection_resend_and_in_order_delivery() {
    LocalSet::new()
        .run_until(async {
            let mut harness = start_acceptor(|_| {});
            logon_exchange(&mut harness, false).await;

            // expected inbound is 2; jump to 5
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=D|34=5|49=BANZAI|56=EXEC|52={SENDING_TIME}|{}",
                    app_fields()
                )))
                .await
                .unwrap();

            let resend_request = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(resend_request.msg_type(), MsgType::ResendRequest);
            let Body::ResendRequest(resend_request) = &resend_request.body else {
                panic!("expected a ResendRequest");
            };
            assert_eq!(resend_request.begin_seq_no, 2);
            assert_eq!(resend_request.end_seq_no, 4);

            // replay: 2 application, 3 gap-filled, 4 application
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=D|34=2|49=BANZAI|56=EXEC|43=Y|52={SENDING_TIME}|122={SENDING_TIME}|{}",
                    app_fields()
                )))
                .await
                .unwrap();
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=4|34=3|49=BANZAI|56=EXEC|43=Y|52={SENDING_TIME}|123=Y|36=4|"
                )))
                .await
                .unwrap();
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=D|34=4|49=BANZAI|56=EXEC|43=Y|52={SENDING_TIME}|122={SENDING_TIME}|{}",
                    app_fields()
                )))
                .await
                .unwrap();

            // prove the gap closed: inbound 6 is accepted and answered
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=1|34=6|49=BANZAI|56=EXEC|52={SENDING_TIME}|112=PING-2|"
                )))
                .await
                .unwrap();
            let heartbeat = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(heartbeat.msg_type(), MsgType::Heartbeat);

            wait_for_entry(&harness.log, |entry| entry == "app_in:5").await;
            let deliveries: Vec<String> = harness
                .log
                .borrow()
                .iter()
                .filter(|entry| entry.starts_with("app_in"))
                .cloned()
                .collect();
            assert_eq!(deliveries, ["app_in:2", "app_in:4", "app_in:5"]);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn resend_request_replays_with_poss_dup_and_gap_fills_admin() {
    LocalSet::new()
        .run_until(async {
            let mut harness = start_acceptor(|_| {});
            logon_exchange(&mut harness, false).await;

            // have the application send two orders
            let sender = loop {
                if let Some(sender) = harness.sender_slot.borrow().clone() {
                    break sender;
                }
                tokio::task::yield_now().await;
            };
            for cl_ord_id in ["ORD-1", "ORD-2"] {
                let mut fields = FieldMap::new();
                fields.push(11, cl_ord_id.try_into().unwrap());
                fields.push(55, "MSFT".try_into().unwrap());
                fields.push(54, "1".try_into().unwrap());
                sender
                    .send(Body::Application {
                        msg_type: "D".try_into().unwrap(),
                        fields,
                    })
                    .unwrap();
            }
            let first = read_message(&mut harness.peer, &mut harness.buf).await;
            let second = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(first.header.msg_seq_num, 2);
            assert_eq!(second.header.msg_seq_num, 3);

            // ask for everything from the beginning; EndSeqNo=0 means
            // "through the latest"
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=2|34=2|49=BANZAI|56=EXEC|52={SENDING_TIME}|7=1|16=0|"
                )))
                .await
                .unwrap();

            // seq 1 was the Logon: coalesced into one gap fill pointing at 2
            let gap_fill = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(gap_fill.msg_type(), MsgType::SequenceReset);
            assert_eq!(gap_fill.header.msg_seq_num, 1);
            assert_eq!(gap_fill.header.poss_dup_flag, Some(true));
            let Body::SequenceReset(gap_fill) = &gap_fill.body else {
                panic!("expected a SequenceReset");
            };
            assert_eq!(gap_fill.gap_fill_flag, Some(true));
            assert_eq!(gap_fill.new_seq_no, 2);

            for expected_seq in [2u32, 3] {
                let replay = read_message(&mut harness.peer, &mut harness.buf).await;
                assert_eq!(replay.header.msg_seq_num, expected_seq);
                assert_eq!(replay.header.poss_dup_flag, Some(true));
                assert!(replay.header.orig_sending_time.is_some());
                assert!(matches!(replay.body, Body::Application { .. }));
            }
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn logoff_handshake_completes_the_waiter() {
    LocalSet::new()
        .run_until(async {
            let (mut peer, server) = duplex(1 << 16);
            let mut buf = Vec::new();

            let session_id = SessionId::new(
                "FIX.4.4".try_into().unwrap(),
                "BANZAI".try_into().unwrap(),
                "EXEC".try_into().unwrap(),
            );
            let mut initiator = Initiator::new(
                initiator_settings(),
                SessionSettings::new(session_id),
                MemoryStore::new(),
            );
            let _lifecycle = initiator.start(OneShotConnector(Some(server)));

            let logon = read_message(&mut peer, &mut buf).await;
            assert_eq!(logon.msg_type(), MsgType::Logon);
            assert_eq!(logon.header.sender_comp_id, "BANZAI");
            peer.write_all(&framed(&format!(
                "8=FIX.4.4|35=A|34=1|49=EXEC|56=BANZAI|52={SENDING_TIME}|98=0|108=30|"
            )))
            .await
            .unwrap();

            // wait for the session to come up
            loop {
                let mut event = initiator.next().await.expect("event stream ended");
                if matches!(event.as_event(), FixEvent::Logon(..)) {
                    break;
                }
            }

            let (confirmed, ()) = tokio::join!(
                initiator.request_logoff(
                    Some(FixString::try_from("Operator requested logout").unwrap()),
                    Duration::from_secs(5),
                ),
                async {
                    let logout = read_message(&mut peer, &mut buf).await;
                    assert_eq!(logout.msg_type(), MsgType::Logout);
                    let Body::Logout(logout) = &logout.body else {
                        panic!("expected a Logout");
                    };
                    assert_eq!(
                        logout.text.as_deref().unwrap(),
                        "Operator requested logout"
                    );
                    peer.write_all(&framed(&format!(
                        "8=FIX.4.4|35=5|34=2|49=EXEC|56=BANZAI|52={SENDING_TIME}|"
                    )))
                    .await
                    .unwrap();
                }
            );
            assert!(confirmed, "peer confirmation did not reach the waiter");

            let mut saw_logout_event = false;
            while let Ok(Some(mut event)) =
                timeout(Duration::from_secs(1), initiator.next()).await
            {
                if matches!(event.as_event(), FixEvent::Logout(..)) {
                    saw_logout_event = true;
                    break;
                }
            }
            assert!(saw_logout_event);
            expect_closed(&mut peer).await;
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn sequence_reset_decrease_is_rejected() {
    LocalSet::new()
        .run_until(async {
            let mut harness = start_acceptor(|_| {});
            logon_exchange(&mut harness, false).await;

            // expected inbound is 2; an admin reset trying to move it back
            // to 1 must be answered with a Reject and change nothing
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=4|34=2|49=BANZAI|56=EXEC|52={SENDING_TIME}|123=N|36=1|"
                )))
                .await
                .unwrap();

            let reject = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(reject.msg_type(), MsgType::Reject);
            let Body::Reject(reject) = &reject.body else {
                panic!("expected a Reject");
            };
            assert_eq!(reject.ref_tag_id, Some(36));
            assert_eq!(
                reject.session_reject_reason,
                Some(fixlink_core::message::SessionRejectReason::ValueIsIncorrect)
            );
            assert_eq!(
                reject.text.as_deref().unwrap(),
                "Sequence Reset attempted to decrease sequence number"
            );

            // next inbound is still 2
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=1|34=2|49=BANZAI|56=EXEC|52={SENDING_TIME}|112=PING-3|"
                )))
                .await
                .unwrap();
            let heartbeat = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(heartbeat.msg_type(), MsgType::Heartbeat);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn seq_num_too_low_without_poss_dup_is_fatal() {
    LocalSet::new()
        .run_until(async {
            let mut harness = start_acceptor(|_| {});
            logon_exchange(&mut harness, false).await;

            // heartbeat bumps expected inbound to 3
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=0|34=2|49=BANZAI|56=EXEC|52={SENDING_TIME}|"
                )))
                .await
                .unwrap();
            // ...and then the peer falls back to 2 without PossDup
            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=D|34=2|49=BANZAI|56=EXEC|52={SENDING_TIME}|{}",
                    app_fields()
                )))
                .await
                .unwrap();

            let logout = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(logout.msg_type(), MsgType::Logout);
            let Body::Logout(logout) = &logout.body else {
                panic!("expected a Logout");
            };
            assert!(logout
                .text
                .as_deref()
                .unwrap()
                .as_utf8()
                .contains("MsgSeqNum too low"));
            expect_closed(&mut harness.peer).await;
            wait_for_entry(&harness.log, |entry| entry.starts_with("logout:MsgSeqNumTooLow"))
                .await;
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn comp_id_mismatch_is_fatal() {
    LocalSet::new()
        .run_until(async {
            let mut harness = start_acceptor(|_| {});
            logon_exchange(&mut harness, false).await;

            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=D|34=2|49=INTRUDER|56=EXEC|52={SENDING_TIME}|{}",
                    app_fields()
                )))
                .await
                .unwrap();

            let reject = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(reject.msg_type(), MsgType::Reject);
            let Body::Reject(reject) = &reject.body else {
                panic!("expected a Reject");
            };
            assert_eq!(
                reject.session_reject_reason,
                Some(fixlink_core::message::SessionRejectReason::CompIdProblem)
            );

            let logout = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(logout.msg_type(), MsgType::Logout);
            expect_closed(&mut harness.peer).await;
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn logon_without_expected_credentials_is_refused() {
    LocalSet::new()
        .run_until(async {
            let mut harness = start_acceptor(|session_settings| {
                session_settings.credentials = Some(fixlink_session::settings::Credentials {
                    username: "trader".try_into().unwrap(),
                    password: "hunter2".try_into().unwrap(),
                });
            });

            harness
                .peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=A|34=1|49=BANZAI|56=EXEC|52={SENDING_TIME}|98=0|108=30|\
                     553=trader|554=wrong|"
                )))
                .await
                .unwrap();

            let logout = read_message(&mut harness.peer, &mut harness.buf).await;
            assert_eq!(logout.msg_type(), MsgType::Logout);
            let Body::Logout(logout) = &logout.body else {
                panic!("expected a Logout");
            };
            assert_eq!(logout.text.as_deref().unwrap(), "invalid credentials");
            expect_closed(&mut harness.peer).await;
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn send_outside_active_session_fails() {
    LocalSet::new()
        .run_until(async {
            let mut acceptor = Acceptor::new(acceptor_settings(), Box::new(|_| MemoryStore::new()));
            let session_id = acceptor_session_id();
            acceptor.register_session(session_id.clone(), SessionSettings::new(session_id.clone()));
            assert!(acceptor
                .send(
                    &session_id,
                    Body::Application {
                        msg_type: "D".try_into().unwrap(),
                        fields: FieldMap::new(),
                    }
                )
                .is_err());

            let initiator_session_id = SessionId::new(
                "FIX.4.4".try_into().unwrap(),
                "BANZAI".try_into().unwrap(),
                "EXEC".try_into().unwrap(),
            );
            let initiator = Initiator::new(
                initiator_settings(),
                SessionSettings::new(initiator_session_id),
                MemoryStore::new(),
            );
            assert!(initiator
                .send(Body::Application {
                    msg_type: "D".try_into().unwrap(),
                    fields: FieldMap::new(),
                })
                .is_err());
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn file_store_survives_session_traffic() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::TempDir::new().unwrap();
            let base = dir.path().join("session");

            let mut acceptor = {
                let base = base.clone();
                Acceptor::new(
                    acceptor_settings(),
                    Box::new(move |session_id| FileStore::open(&base, session_id).unwrap()),
                )
            };
            let session_id = acceptor_session_id();
            acceptor.register_session(session_id.clone(), SessionSettings::new(session_id.clone()));

            let (peer, server) = duplex(1 << 16);
            let (server_rd, server_wr) = tokio::io::split(server);
            tokio::task::spawn_local(acceptor.run_session_task(peer_addr(), server_rd, server_wr));
            let log: Log = Rc::new(RefCell::new(Vec::new()));
            let sender_slot: SenderSlot = Rc::new(RefCell::new(None));
            spawn_pump(acceptor, log, sender_slot);

            let mut harness_peer = peer;
            let mut buf = Vec::new();
            harness_peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=A|34=1|49=BANZAI|56=EXEC|52={SENDING_TIME}|98=0|108=30|"
                )))
                .await
                .unwrap();
            let _logon = read_message(&mut harness_peer, &mut buf).await;

            harness_peer
                .write_all(&framed(&format!(
                    "8=FIX.4.4|35=5|34=2|49=BANZAI|56=EXEC|52={SENDING_TIME}|"
                )))
                .await
                .unwrap();
            let logout = read_message(&mut harness_peer, &mut buf).await;
            assert_eq!(logout.msg_type(), MsgType::Logout);
            expect_closed(&mut harness_peer).await;

            // a fresh process sees the same sequence state and messages
            let mut store = FileStore::open(&base, &acceptor_session_id()).unwrap();
            assert_eq!(store.next_sender_msg_seq_num(), 3);
            assert_eq!(store.next_target_msg_seq_num(), 3);
            let outbound_logon = store.fetch(1, Direction::Outbound).unwrap().unwrap();
            assert!(outbound_logon.data.starts_with(b"8=FIX.4.4"));
            let inbound_logout = store.fetch(2, Direction::Inbound).unwrap().unwrap();
            assert!(inbound_logout.data.windows(5).any(|w| w == b"35=5\x01"));
        })
        .await;
}

struct OneShotConnector(Option<DuplexStream>);

impl Connector for OneShotConnector {
    async fn connect(
        &mut self,
    ) -> Result<
        (
            impl tokio::io::AsyncRead + Unpin + 'static,
            impl tokio::io::AsyncWrite + Unpin + 'static,
        ),
        std::io::Error,
    > {
        let stream = self
            .0
            .take()
            .ok_or_else(|| std::io::Error::other("connector exhausted"))?;
        Ok(tokio::io::split(stream))
    }
}
