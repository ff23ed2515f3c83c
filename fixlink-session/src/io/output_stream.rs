use std::rc::Rc;

use async_stream::stream;
use futures_util::Stream;
use tokio::{sync::mpsc::UnboundedReceiver, time::Duration};
use tokio_stream::{Elapsed, StreamExt};
use tracing::error;

use crate::{session::Session, store::MessageStore, DisconnectReason, SenderMsg};

pub(crate) enum OutputEvent {
    /// Serialized and persisted, ready for the wire.
    Message(Vec<u8>),
    Timeout,
    Disconnect(DisconnectReason),
    StoreError,
}

/// Drains the session's outbound queue: every message passes the
/// application hook, gets its header filled, is serialized and persisted,
/// and only then reaches the connection as bytes. A quiet period of
/// `timeout_duration` yields [`OutputEvent::Timeout`] so the connection
/// can emit a Heartbeat.
pub(crate) fn output_stream<S: MessageStore>(
    session: Rc<Session<S>>,
    timeout_duration: Duration,
    mut receiver: UnboundedReceiver<SenderMsg>,
) -> impl Stream<Item = OutputEvent> {
    let stream = stream! {
        while let Some(sender_msg) = receiver.recv().await {
            match sender_msg {
                SenderMsg::Msg(msg) => {
                    if let Some(msg) = session.on_message_out(msg).await {
                        match session.encode_outbound(msg) {
                            Ok(bytes) => yield OutputEvent::Message(bytes),
                            Err(err) => {
                                error!("message store failure: {err}");
                                yield OutputEvent::StoreError;
                                break;
                            }
                        }
                    }
                }
                SenderMsg::Disconnect(reason) => {
                    yield OutputEvent::Disconnect(reason);
                    break;
                },
            }
        }
    };
    stream.timeout(timeout_duration).map(|res| match res {
        Ok(event) => event,
        Err(Elapsed { .. }) => OutputEvent::Timeout,
    })
}
