use std::time::Duration;

use fixlink_core::message::{Body, FieldMap};
use fixlink_session::{
    application::{AsEvent, FixEvent},
    initiator::{Initiator, TcpConnector},
    session_id::SessionId,
    settings::{ConnectionType, ReconnectSettings, SessionSettings, Settings, StoreSettings},
    store::MemoryStore,
};
use tokio::{runtime::Builder, task::LocalSet};
use tokio_stream::StreamExt;
use tracing::{error, info};

async fn initiator() -> anyhow::Result<()> {
    let settings = Settings {
        connection_type: ConnectionType::Initiator,
        host: "127.0.0.1".parse()?,
        port: 10050,
        sender_comp_id: "BANZAI".try_into().unwrap(),
        heart_bt_int: Duration::from_secs(10),
        logon_timeout: Duration::from_secs(10),
        logout_timeout: Duration::from_secs(5),
        test_request_grace: 1,
        reconnect: ReconnectSettings {
            enabled: true,
            ..ReconnectSettings::disabled()
        },
        use_ssl: false,
        ssl_certificate: None,
        ssl_private_key: None,
        store: StoreSettings::memory(),
    };

    let session_id = SessionId::new(
        "FIX.4.4".try_into().unwrap(),
        settings.sender_comp_id.clone(),
        "EXEC".try_into().unwrap(),
    );
    let mut initiator = Initiator::new(
        settings.clone(),
        SessionSettings::new(session_id),
        MemoryStore::new(),
    );
    initiator.register_status_listener(Box::new(|session_id, old, new, event| {
        info!("{session_id}: {old:?} -> {new:?} ({event:?})");
    }));

    let lifecycle = initiator.start(TcpConnector::new((settings.host, settings.port)));

    while let Some(mut entry) = initiator.next().await {
        match entry.as_event() {
            FixEvent::Created(session_id) => info!("Session created: {session_id}"),
            FixEvent::Logon(session_id, sender) => {
                info!("Logon: {session_id}, sending an order");
                let mut fields = FieldMap::new();
                fields.push(11, "ORD-1".try_into().unwrap());
                fields.push(21, "1".try_into().unwrap());
                fields.push(55, "EUR/USD".try_into().unwrap());
                fields.push(54, "1".try_into().unwrap());
                fields.push(38, "100".try_into().unwrap());
                fields.push(40, "1".try_into().unwrap());
                let _ = sender.send(Body::Application {
                    msg_type: "D".try_into().unwrap(),
                    fields,
                });
            }
            FixEvent::Logout(session_id, reason) => {
                info!("Logout: {session_id}, reason: {reason:?}");
            }
            FixEvent::AppMsgIn(msg, _responder) => {
                info!("App input msg: {:?}", msg.msg_type());
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

    lifecycle.await?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let runtime = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;

    let local_set = LocalSet::new();
    local_set.block_on(&runtime, initiator())
}
