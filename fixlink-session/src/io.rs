use std::{
    cell::RefCell,
    collections::{hash_map::Entry, HashMap},
    rc::Rc,
    sync::Mutex,
};

use fixlink_core::message::{Body, FixMessage};
use futures_util::{pin_mut, Stream};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, info_span, Instrument, Span};

use crate::{
    acceptor::{ActiveSessionsMap, SessionsMap},
    application::{Emitter, EventInner},
    session::Session,
    session_id::SessionId,
    settings::{SessionSettings, Settings},
    state::State,
    store::MessageStore,
    DisconnectReason, Sender, SessionError, StatusEvent, NO_INBOUND_TIMEOUT_PADDING,
    TEST_REQUEST_THRESHOLD,
};

mod input_stream;
pub use input_stream::{input_stream, InputEvent};

mod output_stream;
use output_stream::{output_stream, OutputEvent};

pub mod time;
use time::timeout_stream;

use bytes::Bytes;

static SENDERS: Mutex<Option<HashMap<SessionId, Sender>>> = Mutex::new(None);

pub fn register_sender(session_id: SessionId, sender: Sender) {
    if let Entry::Vacant(entry) = SENDERS
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .entry(session_id)
    {
        entry.insert(sender);
    }
}

pub fn unregister_sender(session_id: &SessionId) {
    SENDERS
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .remove(session_id);
}

pub fn sender(session_id: &SessionId) -> Option<Sender> {
    SENDERS
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .get(session_id)
        .cloned()
}

/// Sends a message body over the session registered under `session_id`.
pub fn send(session_id: &SessionId, body: Body) -> Result<(), Body> {
    if let Some(sender) = sender(session_id) {
        sender.send(body).map_err(|msg| msg.body)
    } else {
        Err(body)
    }
}

pub fn send_raw(msg: Box<FixMessage>) -> Result<(), Box<FixMessage>> {
    if let Some(sender) = sender(&SessionId::from_output_msg(&msg)) {
        sender.send_raw(msg)
    } else {
        Err(msg)
    }
}

async fn first_msg(
    stream: &mut (impl Stream<Item = InputEvent> + Unpin),
    logon_timeout: tokio::time::Duration,
) -> Result<(Box<FixMessage>, Bytes), crate::Error> {
    match time::timeout(logon_timeout, stream.next()).await {
        Ok(Some(InputEvent::Message(msg, raw))) => Ok((msg, raw)),
        Ok(Some(InputEvent::IoError(error))) => Err(error.into()),
        Ok(Some(InputEvent::DecodeError(error))) => {
            error!("failed to decode first message: {error}");
            Err(crate::Error::SessionError(SessionError::LogonNeverReceived))
        }
        _ => Err(crate::Error::SessionError(SessionError::LogonNeverReceived)),
    }
}

#[derive(Debug)]
struct Connection<S> {
    session: Rc<Session<S>>,
}

pub(crate) async fn acceptor_connection<S>(
    reader: impl AsyncRead + Unpin,
    writer: impl AsyncWrite + Unpin,
    settings: Settings,
    sessions: Rc<RefCell<SessionsMap<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    emitter: Emitter,
) where
    S: MessageStore,
{
    let stream = input_stream(reader);
    let logon_timeout = settings.logon_timeout + NO_INBOUND_TIMEOUT_PADDING;
    pin_mut!(stream);
    let (msg, raw) = match first_msg(&mut stream, logon_timeout).await {
        Ok(msg) => msg,
        Err(err) => {
            error!("failed to establish new session: {err}");
            return;
        }
    };
    let session_id = SessionId::from_input_msg(&msg);
    debug!("first message: {msg:?}");

    let (sender, receiver) = mpsc::unbounded_channel();
    let sender = Sender::new(sender);

    let Some((session_settings, session_state)) = sessions.borrow().get_session(&session_id)
    else {
        error!("failed to establish new session: unknown session id {session_id}");
        return;
    };
    if !session_state.borrow().disconnected()
        || active_sessions.borrow().contains_key(&session_id)
    {
        error!(%session_id, "Session already active");
        return;
    }
    {
        let mut state = session_state.borrow_mut();
        state.set_disconnected(false);
        state.set_initiate(false);
        state.apply_status_event(StatusEvent::StartAcceptor);
    }
    register_sender(session_id.clone(), sender.clone());
    let session = Rc::new(Session::new(
        settings,
        session_settings,
        session_state,
        sender,
        emitter.clone(),
    ));
    active_sessions
        .borrow_mut()
        .insert(session_id.clone(), session.clone());

    let session_span = info_span!(
        parent: None,
        "session",
        id = %session_id
    );
    session_span.follows_from(Span::current());

    let input_loop_span = info_span!(parent: &session_span, "in");
    let output_loop_span = info_span!(parent: &session_span, "out");

    emitter
        .send(EventInner::Created(session_id.clone()))
        .await;

    let force_disconnection = session
        .on_message_in(msg, raw)
        .instrument(input_loop_span.clone())
        .await;

    let input_timeout_duration = session.heartbeat_interval().mul_f32(TEST_REQUEST_THRESHOLD);
    let input_stream =
        timeout_stream(input_timeout_duration, stream).map(|res| res.unwrap_or(InputEvent::Timeout));
    pin_mut!(input_stream);

    let output_stream = output_stream(session.clone(), session.heartbeat_interval(), receiver);
    pin_mut!(output_stream);

    let connection = Connection::new(session);
    let (input_closed_tx, input_closed_rx) = oneshot::channel();

    tokio::join!(
        connection
            .input_loop(input_stream, input_closed_tx, force_disconnection)
            .instrument(input_loop_span),
        connection
            .output_loop(writer, output_stream, input_closed_rx)
            .instrument(output_loop_span),
    );
    session_span.in_scope(|| {
        info!("connection closed");
    });
    unregister_sender(&session_id);
    active_sessions.borrow_mut().remove(&session_id);
}

pub(crate) async fn initiator_connection<S>(
    reader: impl AsyncRead + Unpin,
    writer: impl AsyncWrite + Unpin,
    settings: Settings,
    session_settings: SessionSettings,
    state: Rc<RefCell<State<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    emitter: Emitter,
) -> DisconnectReason
where
    S: MessageStore,
{
    let session_id = session_settings.session_id.clone();
    {
        let mut state = state.borrow_mut();
        state.set_disconnected(false);
        state.set_initiate(true);
    }

    let (sender, receiver) = mpsc::unbounded_channel();
    let sender = Sender::new(sender);

    register_sender(session_id.clone(), sender.clone());
    let session = Rc::new(Session::new(
        settings,
        session_settings,
        state,
        sender,
        emitter.clone(),
    ));
    active_sessions
        .borrow_mut()
        .insert(session_id.clone(), session.clone());

    let session_span = info_span!(
        "session",
        id = %session_id
    );

    let input_loop_span = info_span!(parent: &session_span, "in");
    let output_loop_span = info_span!(parent: &session_span, "out");

    emitter
        .send(EventInner::Created(session_id.clone()))
        .await;

    session.send_logon_request(&mut session.state().borrow_mut());

    let input_timeout_duration = session.heartbeat_interval().mul_f32(TEST_REQUEST_THRESHOLD);
    let input_stream = timeout_stream(input_timeout_duration, input_stream(reader))
        .map(|res| res.unwrap_or(InputEvent::Timeout));
    pin_mut!(input_stream);

    let output_stream = output_stream(session.clone(), session.heartbeat_interval(), receiver);
    pin_mut!(output_stream);

    let connection = Connection::new(session);
    let (input_closed_tx, input_closed_rx) = oneshot::channel();

    let (disconnect_reason, ()) = tokio::join!(
        connection
            .input_loop(input_stream, input_closed_tx, None)
            .instrument(input_loop_span),
        connection
            .output_loop(writer, output_stream, input_closed_rx)
            .instrument(output_loop_span),
    );
    session_span.in_scope(|| {
        info!("connection closed");
    });
    unregister_sender(&session_id);
    active_sessions.borrow_mut().remove(&session_id);
    disconnect_reason
}

impl<S: MessageStore> Connection<S> {
    fn new(session: Rc<Session<S>>) -> Connection<S> {
        Connection { session }
    }

    async fn input_loop(
        &self,
        mut input_stream: impl Stream<Item = InputEvent> + Unpin,
        input_closed_tx: oneshot::Sender<()>,
        force_disconnection_with_reason: Option<DisconnectReason>,
    ) -> DisconnectReason {
        if let Some(disconnect_reason) = force_disconnection_with_reason {
            self.session
                .disconnect(&mut self.session.state().borrow_mut(), disconnect_reason);

            // Notify output loop that all input is processed so the output
            // queue can be safely closed.
            let _ = input_closed_tx.send(());
            return disconnect_reason;
        }

        let mut disconnect_reason = DisconnectReason::Disconnected;

        loop {
            // While a Logout confirmation or a Logon response is pending the
            // wait is bounded by the corresponding timeout.
            let deadline = self
                .session
                .logout_timeout()
                .map(|timeout| (timeout, InputEvent::LogoutTimeout))
                .or_else(|| {
                    self.session
                        .logon_deadline()
                        .map(|timeout| (timeout, InputEvent::Timeout))
                });
            let event = match deadline {
                Some((duration, timeout_event)) => time::timeout(duration, input_stream.next())
                    .await
                    .unwrap_or(Some(timeout_event)),
                None => input_stream.next().await,
            };
            let Some(event) = event else { break };

            // Don't accept new messages if session is disconnected.
            if self.session.state().borrow().disconnected() {
                info!("session disconnected, exit input processing");
                let _ = input_closed_tx.send(());
                return disconnect_reason;
            }
            match event {
                InputEvent::Message(msg, raw) => {
                    if let Some(reason) = self.session.on_message_in(msg, raw).await {
                        info!(?reason, "disconnect, exit input processing");
                        disconnect_reason = reason;
                        break;
                    }
                }
                InputEvent::DecodeError(error) => {
                    if let Some(reason) = self.session.on_decode_error(error).await {
                        info!(?reason, "disconnect, exit input processing");
                        disconnect_reason = reason;
                        break;
                    }
                }
                InputEvent::IoError(error) => {
                    disconnect_reason = self.session.on_io_error(error).await;
                    break;
                }
                InputEvent::Timeout => {
                    if self.session.on_in_timeout().await {
                        let logged_on =
                            Session::is_logged_on(&self.session.state().borrow());
                        if logged_on {
                            self.session.send_logout(Some(
                                fixlink_core::fields::FixString::from_ascii_lossy(
                                    b"TestRequest grace period exhausted".to_vec(),
                                ),
                            ));
                            disconnect_reason = DisconnectReason::TestRequestTimeout;
                        } else {
                            disconnect_reason = DisconnectReason::LogonTimeout;
                        }
                        break;
                    }
                }
                InputEvent::LogoutTimeout => {
                    info!("Logout timeout");
                    disconnect_reason = DisconnectReason::LogoutTimeout;
                    break;
                }
            }
        }
        self.session
            .disconnect(&mut self.session.state().borrow_mut(), disconnect_reason);

        // Notify output loop that all input is processed so the output
        // queue can be safely closed.
        let _ = input_closed_tx.send(());
        disconnect_reason
    }

    async fn output_loop(
        &self,
        mut sink: impl AsyncWrite + Unpin,
        mut output_stream: impl Stream<Item = OutputEvent> + Unpin,
        input_closed_rx: oneshot::Receiver<()>,
    ) {
        let mut sink_closed = false;
        let mut disconnect_reason = DisconnectReason::Disconnected;
        while let Some(event) = output_stream.next().await {
            match event {
                OutputEvent::Message(msg) => {
                    if sink_closed {
                        // Sink is closed - ignore the message, but do not
                        // break the loop. The output stream has to process
                        // all enqueued messages so they stay available for
                        // ResendRequest<2>.
                        info!("peer disconnected, message stored for further resend");
                    } else if let Err(error) = sink.write_all(&msg).await {
                        sink_closed = true;
                        error!(%error, "Output write error");
                        // XXX: Don't disconnect now. If an I/O error happened
                        //      here it will also happen in the input loop and
                        //      the input loop triggers the disconnection.
                        //      Disconnecting from here would close the output
                        //      queue while the input handler may still need
                        //      to enqueue something.
                    }
                }
                OutputEvent::Timeout => self.session.on_out_timeout().await,
                OutputEvent::StoreError => {
                    self.session.disconnect(
                        &mut self.session.state().borrow_mut(),
                        DisconnectReason::StoreError,
                    );
                    disconnect_reason = DisconnectReason::StoreError;
                }
                OutputEvent::Disconnect(reason) => {
                    // The internal channel is closed by the output stream at
                    // this point, no new message can be sent.
                    info!("session output closed");
                    if !sink_closed {
                        if let Err(error) = sink.flush().await {
                            error!(%error, "final flush failed");
                        }
                    }
                    disconnect_reason = reason;
                }
            }
        }
        // XXX: Emit logout here instead of Session::disconnect, so the
        //      Logout event is delivered after the Logout message instead of
        //      randomly before or after.
        self.session.emit_logout(disconnect_reason).await;

        // Don't wait for any specific value, it's just a notification that
        // input_loop finished, so no more messages can be added to the
        // output queue.
        let _ = input_closed_rx.await;
        if let Err(error) = sink.shutdown().await {
            error!(%error, "connection shutdown failed")
        }
        info!("disconnect, exit output processing");
    }
}
