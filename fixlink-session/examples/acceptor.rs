use std::time::Duration;

use fixlink_core::message::Header;
use fixlink_session::{
    acceptor::{Acceptor, TcpConnection},
    application::{AsEvent, FixEvent},
    session_id::SessionId,
    settings::{ConnectionType, ReconnectSettings, SessionSettings, Settings, StoreSettings},
    store::MemoryStore,
};
use tokio::{runtime::Builder, task::LocalSet};
use tokio_stream::StreamExt;
use tracing::{error, info};

async fn acceptor() -> anyhow::Result<()> {
    let settings = Settings {
        connection_type: ConnectionType::Acceptor,
        host: "127.0.0.1".parse()?,
        port: 10050,
        sender_comp_id: "EXEC".try_into().unwrap(),
        heart_bt_int: Duration::from_secs(10),
        logon_timeout: Duration::from_secs(3),
        logout_timeout: Duration::from_secs(5),
        test_request_grace: 1,
        reconnect: ReconnectSettings::disabled(),
        use_ssl: false,
        ssl_certificate: None,
        ssl_private_key: None,
        store: StoreSettings::memory(),
    };

    let mut acceptor = Acceptor::new(settings.clone(), Box::new(|_| MemoryStore::new()));
    let begin_string = || "FIX.4.4".try_into().unwrap();
    let mut register_session = |target_id: &str| {
        let session_id = SessionId::new(
            begin_string(),
            settings.sender_comp_id.clone(),
            target_id.try_into().unwrap(),
        );
        acceptor.register_session(session_id.clone(), SessionSettings::new(session_id));
    };

    register_session("client_1");
    register_session("client_2");
    register_session("BANZAI");

    acceptor.register_status_listener(Box::new(|session_id, old, new, event| {
        info!("{session_id}: {old:?} -> {new:?} ({event:?})");
    }));

    let connection = TcpConnection::new((settings.host, settings.port)).await?;
    acceptor.start(connection);

    let mut senders = std::collections::HashMap::new();
    while let Some(mut entry) = acceptor.next().await {
        match entry.as_event() {
            FixEvent::Created(session_id) => info!("Session created: {session_id}"),
            FixEvent::Logon(session_id, sender) => {
                info!("Logon: {session_id}");
                senders.insert(session_id.clone(), sender);
            }
            FixEvent::Logout(session_id, reason) => {
                info!("Logout: {session_id}, reason: {reason:?}");
                senders.remove(session_id);
            }
            FixEvent::AppMsgIn(mut msg, _responder) => {
                info!("App input msg: {:?}", msg.msg_type());
                let session_id = SessionId::from_input_msg(&msg);
                // echo the message back
                reverse_route(&mut msg.header);
                if let Some(sender) = senders.get(&session_id) {
                    let _ = sender.send_raw(msg);
                }
            }
            FixEvent::AdmMsgIn(msg, _responder) => info!("Adm input msg: {:?}", msg.msg_type()),
            FixEvent::AppMsgOut(msg, _responder) => {
                info!("App output msg: {:?}", msg.msg_type());
            }
            FixEvent::StatusChanged(session_id, old, new) => {
                info!("{session_id}: {old:?} -> {new:?}");
            }
            FixEvent::DecodeError(session_id, error) => {
                error!("{session_id}: {error}");
            }
        }
    }
    Ok(())
}

fn reverse_route(header: &mut Header) {
    std::mem::swap(&mut header.sender_comp_id, &mut header.target_comp_id);
    // re-stamped on the way out
    header.msg_seq_num = 0;
    header.sending_time = fixlink_core::fields::UtcTimestamp::MIN_UTC;
}

fn main() -> anyhow::Result<()> {
    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt::init();

    let runtime = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;

    let local_set = LocalSet::new();
    local_set.block_on(&runtime, acceptor())
}
