//! Application-facing event stream.
//!
//! The engine does not call back into user code; it emits [`FixEvent`]s
//! through a stream the application drains. Outbound application messages
//! pass the application as `AppMsgOut` right before serialization, so the
//! hook can adjust or withdraw them.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use fixlink_core::{
    codec::DecodeError,
    fields::{FixString, SeqNum},
    message::{Body, FixMessage, Logout, Reject, SessionRejectReason},
};
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use crate::{
    session_id::SessionId, state::SessionStatus, DisconnectReason, Sender,
};

/// What the outbound hook decided about a message. A dropped sender (the
/// event went away without a verdict, i.e. [`Responder::do_not_send`])
/// means the message is withdrawn.
#[derive(Debug)]
pub(crate) enum OutboundVerdict {
    Send(Box<FixMessage>),
    /// Replace the message with a SequenceReset-GapFill over its sequence
    /// number; used when withdrawing an already-sequenced retransmission.
    GapFill(Box<FixMessage>),
}

/// Controls the fate of an outbound message from the `AppMsgOut` hook.
#[derive(Debug)]
pub struct Responder {
    sender: Option<oneshot::Sender<OutboundVerdict>>,
    change_to_gap_fill: bool,
}

impl Responder {
    pub(crate) fn new(sender: oneshot::Sender<OutboundVerdict>) -> Responder {
        Responder {
            sender: Some(sender),
            change_to_gap_fill: false,
        }
    }

    /// Withdraw the message. An unsequenced message simply never goes
    /// out; a sequenced retransmission is replaced with a gap fill.
    pub fn do_not_send(&mut self) {
        self.sender.take();
    }

    /// Send a SequenceReset-GapFill instead of the message.
    pub fn change_to_gap_fill(&mut self) {
        self.change_to_gap_fill = true;
    }
}

/// Lets the application answer an inbound message with a session-level
/// response without having to build it by hand.
#[derive(Debug)]
pub struct InputResponder {
    sender: Sender,
}

impl InputResponder {
    pub(crate) fn new(sender: Sender) -> InputResponder {
        InputResponder { sender }
    }

    pub fn reject(
        self,
        ref_msg_type: Option<FixString>,
        ref_seq_num: SeqNum,
        reason: SessionRejectReason,
        text: Option<FixString>,
    ) {
        let _ = self.sender.send(Body::Reject(Reject {
            ref_seq_num,
            ref_tag_id: None,
            ref_msg_type,
            session_reject_reason: Some(reason),
            text,
        }));
    }

    pub fn logout(self, text: Option<FixString>) {
        let _ = self.sender.send(Body::Logout(Logout { text }));
    }

    pub fn disconnect(self) {
        self.sender.disconnect(DisconnectReason::UserForcedDisconnect);
    }
}

#[derive(Debug)]
pub(crate) enum EventInner {
    Created(SessionId),
    Logon(SessionId, Option<Sender>),
    Logout(SessionId, DisconnectReason),
    StatusChanged(SessionId, SessionStatus, SessionStatus),
    AppMsgIn(Option<Box<FixMessage>>, Option<InputResponder>),
    AdmMsgIn(Option<Box<FixMessage>>, Option<InputResponder>),
    AppMsgOut(Option<Box<FixMessage>>, Responder),
    DecodeError(SessionId, DecodeError),
}

/// An engine event; view it with [`AsEvent::as_event`].
#[derive(Debug)]
pub struct Event {
    inner: EventInner,
}

impl Drop for Event {
    fn drop(&mut self) {
        // Outbound messages return to the output loop when the event goes
        // out of scope, so merely observing the stream never stalls sends.
        if let EventInner::AppMsgOut(msg, responder) = &mut self.inner {
            if let (Some(sender), Some(msg)) = (responder.sender.take(), msg.take()) {
                let verdict = if responder.change_to_gap_fill {
                    OutboundVerdict::GapFill(msg)
                } else {
                    OutboundVerdict::Send(msg)
                };
                let _ = sender.send(verdict);
            }
        }
    }
}

/// FIX protocol events.
#[derive(Debug)]
pub enum FixEvent<'a> {
    /// Session created.
    Created(&'a SessionId),

    /// Successful Logon<A> message exchange.
    ///
    /// Use `Sender` to send messages to the connected peer.
    Logon(&'a SessionId, Sender),

    /// Session disconnected.
    Logout(&'a SessionId, DisconnectReason),

    /// The lifecycle state machine moved.
    StatusChanged(&'a SessionId, SessionStatus, SessionStatus),

    /// New application message received, in sequence order.
    AppMsgIn(Box<FixMessage>, InputResponder),

    /// New administrative message received.
    AdmMsgIn(Box<FixMessage>, InputResponder),

    /// Application message about to be sent; may be mutated, withdrawn or
    /// turned into a gap fill through the responder. Administrative
    /// messages are generated internally and never pass this hook.
    AppMsgOut(&'a mut FixMessage, &'a mut Responder),

    /// Failed to decode an input message.
    DecodeError(&'a SessionId, &'a DecodeError),
}

#[derive(Debug)]
pub struct EventStream {
    receiver: ReceiverStream<Event>,
}

#[derive(Clone, Debug)]
pub struct Emitter {
    inner: mpsc::Sender<Event>,
}

impl Emitter {
    pub(crate) async fn send(&self, event: EventInner) {
        if self.inner.send(Event { inner: event }).await.is_err() {
            error!("failed to emit event, stream dropped");
        }
    }

    /// The event stream is gone; hooks should be skipped instead of
    /// stalling the message path.
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

pub(crate) fn events_channel() -> (Emitter, EventStream) {
    let (sender, receiver) = mpsc::channel(16);

    (
        Emitter { inner: sender },
        EventStream {
            receiver: receiver.into(),
        },
    )
}

mod private {
    pub trait Sealed {}

    impl Sealed for super::Event {}
}

/// This trait is sealed and not meant to be implemented outside of the
/// current crate.
pub trait AsEvent: private::Sealed {
    fn as_event(&mut self) -> FixEvent<'_>;
}

impl AsEvent for Event {
    fn as_event(&mut self) -> FixEvent<'_> {
        match &mut self.inner {
            EventInner::Created(id) => FixEvent::Created(id),
            EventInner::Logon(id, sender) => FixEvent::Logon(id, sender.take().unwrap()),
            EventInner::Logout(id, reason) => FixEvent::Logout(id, *reason),
            EventInner::StatusChanged(id, old, new) => FixEvent::StatusChanged(id, *old, *new),
            EventInner::AppMsgIn(msg, responder) => {
                FixEvent::AppMsgIn(msg.take().unwrap(), responder.take().unwrap())
            }
            EventInner::AdmMsgIn(msg, responder) => {
                FixEvent::AdmMsgIn(msg.take().unwrap(), responder.take().unwrap())
            }
            EventInner::AppMsgOut(msg, responder) => {
                FixEvent::AppMsgOut(msg.as_mut().unwrap(), responder)
            }
            EventInner::DecodeError(session_id, decode_error) => {
                FixEvent::DecodeError(session_id, decode_error)
            }
        }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.receiver.size_hint()
    }
}
