use std::{
    cell::RefCell,
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use fixlink_core::{
    fields::{FixStr, FixString, SeqNum, TagNum},
    message::Body,
};
use futures::Stream;
use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinHandle,
    time::Duration,
};
use tracing::{error, info, info_span, instrument, Instrument};

use crate::{
    application::{events_channel, Emitter, Event, EventStream},
    io::{acceptor_connection, sender},
    session::Session,
    session_id::SessionId,
    settings::{SessionSettings, Settings},
    state::{State as SessionState, StatusListener, StatusListeners},
    store::{MessageStore, StoredMessage},
    DisconnectReason, Error, SessionError,
};

#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    #[error("Unknown session")]
    UnknownSession,
    #[error("Session active")]
    SessionActive,
    #[error("Message store failure: {0}")]
    Store(String),
}

#[allow(async_fn_in_trait)]
pub trait Connection {
    async fn accept(
        &mut self,
    ) -> Result<
        (
            impl AsyncRead + Unpin + 'static,
            impl AsyncWrite + Unpin + 'static,
            SocketAddr,
        ),
        io::Error,
    >;
}

pub struct TcpConnection {
    listener: TcpListener,
}

impl TcpConnection {
    pub async fn new(socket_addr: impl Into<SocketAddr>) -> Result<TcpConnection, io::Error> {
        let socket_addr = socket_addr.into();
        let listener = TcpListener::bind(&socket_addr).await?;
        Ok(TcpConnection { listener })
    }
}

impl Connection for TcpConnection {
    async fn accept(
        &mut self,
    ) -> Result<
        (
            impl AsyncRead + Unpin + 'static,
            impl AsyncWrite + Unpin + 'static,
            SocketAddr,
        ),
        io::Error,
    > {
        let (tcp_stream, peer_addr) = self.listener.accept().await?;
        tcp_stream.set_nodelay(true)?;
        let (reader, writer) = tcp_stream.into_split();
        Ok((reader, writer, peer_addr))
    }
}

type SessionMapInternal<S> = HashMap<SessionId, (SessionSettings, Rc<RefCell<SessionState<S>>>)>;

pub struct SessionsMap<S> {
    map: SessionMapInternal<S>,
    message_store_builder: Box<dyn Fn(&SessionId) -> S>,
    listeners: StatusListeners,
}

impl<S: MessageStore> SessionsMap<S> {
    fn new(
        message_store_builder: Box<dyn Fn(&SessionId) -> S>,
        listeners: StatusListeners,
    ) -> SessionsMap<S> {
        SessionsMap {
            map: HashMap::new(),
            message_store_builder,
            listeners,
        }
    }

    pub fn register_session(&mut self, session_id: SessionId, session_settings: SessionSettings) {
        let store = (self.message_store_builder)(&session_id);
        self.map.insert(
            session_id.clone(),
            (
                session_settings,
                Rc::new(RefCell::new(SessionState::new(
                    session_id,
                    store,
                    self.listeners.clone(),
                ))),
            ),
        );
    }

    pub(crate) fn get_session(
        &self,
        session_id: &SessionId,
    ) -> Option<(SessionSettings, Rc<RefCell<SessionState<S>>>)> {
        self.map.get(session_id).cloned()
    }

    fn contains(&self, session_id: &SessionId) -> bool {
        self.map.contains_key(session_id)
    }
}

pub struct SessionTask<S> {
    settings: Settings,
    sessions: Rc<RefCell<SessionsMap<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    emitter: Emitter,
}

impl<S> Clone for SessionTask<S> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            sessions: self.sessions.clone(),
            active_sessions: self.active_sessions.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

impl<S: MessageStore + 'static> SessionTask<S> {
    fn new(
        settings: Settings,
        sessions: Rc<RefCell<SessionsMap<S>>>,
        active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
        emitter: Emitter,
    ) -> SessionTask<S> {
        SessionTask {
            settings,
            sessions,
            active_sessions,
            emitter,
        }
    }

    pub async fn run(
        self,
        peer_addr: SocketAddr,
        reader: impl AsyncRead + Unpin + 'static,
        writer: impl AsyncWrite + Unpin + 'static,
    ) {
        let span = info_span!("connection", %peer_addr);

        span.in_scope(|| {
            info!("New connection");
        });

        acceptor_connection(
            reader,
            writer,
            self.settings,
            self.sessions,
            self.active_sessions,
            self.emitter,
        )
        .instrument(span.clone())
        .await;

        span.in_scope(|| {
            info!("Connection closed");
        });
    }
}

pub(crate) type ActiveSessionsMap<S> = HashMap<SessionId, Rc<Session<S>>>;

#[pin_project]
pub struct Acceptor<S> {
    sessions: Rc<RefCell<SessionsMap<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    session_task: SessionTask<S>,
    listeners: StatusListeners,
    #[pin]
    event_stream: EventStream,
}

impl<S: MessageStore + 'static> Acceptor<S> {
    pub fn new(
        settings: Settings,
        message_store_builder: Box<dyn Fn(&SessionId) -> S>,
    ) -> Acceptor<S> {
        let (emitter, event_stream) = events_channel();
        let listeners = StatusListeners::new();
        let sessions = Rc::new(RefCell::new(SessionsMap::new(
            message_store_builder,
            listeners.clone(),
        )));
        let active_sessions = Rc::new(RefCell::new(HashMap::new()));
        let session_task = SessionTask::new(
            settings,
            sessions.clone(),
            active_sessions.clone(),
            emitter,
        );

        Acceptor {
            sessions,
            active_sessions,
            session_task,
            listeners,
            event_stream,
        }
    }

    pub fn register_session(&mut self, session_id: SessionId, session_settings: SessionSettings) {
        self.sessions
            .borrow_mut()
            .register_session(session_id, session_settings);
    }

    /// Observes every state machine transition of every session. Register
    /// listeners before `start`.
    pub fn register_status_listener(&self, listener: StatusListener) {
        self.listeners.register(listener);
    }

    pub fn sessions_map(&self) -> Rc<RefCell<SessionsMap<S>>> {
        self.sessions.clone()
    }

    pub fn start(&self, connection: impl Connection + 'static) -> JoinHandle<()> {
        tokio::task::spawn_local(Self::server_task(connection, self.session_task.clone()))
    }

    pub fn is_session_active(&self, session_id: &SessionId) -> Result<bool, AcceptorError> {
        if self.active_sessions.borrow().contains_key(session_id) {
            Ok(true)
        } else if self.sessions.borrow().contains(session_id) {
            Ok(false)
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    /// Sends a message body over an active session. Fails when the
    /// session is not logged on: nothing is queued and nothing reaches
    /// the wire.
    pub fn send(&self, session_id: &SessionId, body: Body) -> Result<(), Error> {
        let active_sessions = self.active_sessions.borrow();
        let session = active_sessions
            .get(session_id)
            .ok_or(Error::SessionError(SessionError::NotLoggedOn))?;
        if !Session::is_logged_on(&session.state().borrow()) {
            return Err(Error::SessionError(SessionError::NotLoggedOn));
        }
        session
            .sender()
            .send(body)
            .map_err(|_| Error::SessionError(SessionError::NotLoggedOn))
    }

    /// Sends a Logout and waits up to `timeout` for the confirmation,
    /// then disconnects regardless. Returns whether the peer confirmed.
    pub async fn request_logoff(
        &self,
        session_id: &SessionId,
        text: Option<FixString>,
        timeout: Duration,
    ) -> Result<bool, AcceptorError> {
        let session = {
            let active_sessions = self.active_sessions.borrow();
            match active_sessions.get(session_id) {
                Some(session) => session.clone(),
                None if self.sessions.borrow().contains(session_id) => {
                    // already logged out
                    return Ok(true);
                }
                None => return Err(AcceptorError::UnknownSession),
            }
        };
        let confirmation = session.initiate_logoff(text);
        let confirmed = crate::io::time::timeout(timeout, confirmation)
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        session.disconnect(
            &mut session.state().borrow_mut(),
            DisconnectReason::LocalRequestedLogout,
        );
        Ok(confirmed)
    }

    /// Sends a Logout and refuses further logons until [`Self::reset`]
    /// re-enables the session.
    pub fn logout(
        &self,
        session_id: &SessionId,
        reason: Option<FixString>,
    ) -> Result<(), AcceptorError> {
        if let Some(session) = self.active_sessions.borrow().get(session_id) {
            {
                let mut state = session.state().borrow_mut();
                state.set_enabled(false);
                state.set_logout_reason(reason.clone());
            }
            session.send_logout(reason);
            Ok(())
        } else if self.sessions.borrow().contains(session_id) {
            // Already logged out
            Ok(())
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    pub fn disconnect(&self, session_id: &SessionId) -> Result<(), AcceptorError> {
        if let Some(session) = self.active_sessions.borrow_mut().remove(session_id) {
            session.disconnect(
                &mut session.state().borrow_mut(),
                DisconnectReason::UserForcedDisconnect,
            );
            Ok(())
        } else if self.sessions.borrow().contains(session_id) {
            // Already disconnected
            Ok(())
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    /// Force reset of the session sequence numbers.
    ///
    /// Functionally equivalent to the `reset_*` settings but triggered
    /// manually. Returns [`AcceptorError::SessionActive`] if the session
    /// is still active; disconnect or log it out first.
    #[instrument(skip_all, fields(session_id=%session_id) ret)]
    pub fn reset(&self, session_id: &SessionId) -> Result<(), AcceptorError> {
        if self.active_sessions.borrow().contains_key(session_id) {
            Err(AcceptorError::SessionActive)
        } else if let Some((_, session_state)) = self.sessions.borrow().get_session(session_id) {
            let mut state = session_state.borrow_mut();
            state.set_enabled(true);
            state
                .reset_sequence_numbers()
                .map_err(|err| AcceptorError::Store(err.to_string()))
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    /// Sender seq_num getter
    #[instrument(skip_all, fields(session_id=%session_id) ret)]
    pub fn next_sender_msg_seq_num(&self, session_id: &SessionId) -> Result<SeqNum, AcceptorError> {
        if let Some((_, session_state)) = self.sessions.borrow().get_session(session_id) {
            Ok(session_state.borrow().next_sender_msg_seq_num())
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    #[instrument(skip_all, fields(session_id=%session_id) ret)]
    pub fn next_target_msg_seq_num(&self, session_id: &SessionId) -> Result<SeqNum, AcceptorError> {
        if let Some((_, session_state)) = self.sessions.borrow().get_session(session_id) {
            Ok(session_state.borrow().next_target_msg_seq_num())
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    /// Override the sender's next seq_num; meant for operator use while
    /// the session is down.
    #[instrument(skip_all, fields(session_id=%session_id, seq_num) ret)]
    pub fn set_next_sender_msg_seq_num(
        &self,
        session_id: &SessionId,
        seq_num: SeqNum,
    ) -> Result<(), AcceptorError> {
        if let Some((_, session_state)) = self.sessions.borrow().get_session(session_id) {
            session_state
                .borrow_mut()
                .set_next_sender_msg_seq_num(seq_num)
                .map_err(|err| AcceptorError::Store(err.to_string()))
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    #[instrument(skip_all, fields(session_id=%session_id, seq_num) ret)]
    pub fn set_next_target_msg_seq_num(
        &self,
        session_id: &SessionId,
        seq_num: SeqNum,
    ) -> Result<(), AcceptorError> {
        if let Some((_, session_state)) = self.sessions.borrow().get_session(session_id) {
            session_state
                .borrow_mut()
                .set_next_target_msg_seq_num(seq_num)
                .map_err(|err| AcceptorError::Store(err.to_string()))
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    /// Store lookup by body field; inspection tooling.
    pub fn find_by_field(
        &self,
        session_id: &SessionId,
        tag: TagNum,
        value: &FixStr,
    ) -> Result<Vec<StoredMessage>, AcceptorError> {
        if let Some((_, session_state)) = self.sessions.borrow().get_session(session_id) {
            session_state
                .borrow_mut()
                .find_by_field(tag, value)
                .map_err(|err| AcceptorError::Store(err.to_string()))
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    /// Sender handle for an active session, if it is up.
    pub fn sender(&self, session_id: &SessionId) -> Option<crate::Sender> {
        sender(session_id)
    }

    async fn server_task(mut connection: impl Connection, session_task: SessionTask<S>) {
        info!("Acceptor started");
        loop {
            match connection.accept().await {
                Ok((reader, writer, peer_addr)) => {
                    tokio::task::spawn_local(session_task.clone().run(peer_addr, reader, writer));
                }
                Err(err) => error!("server task failed to accept incoming connection: {err}"),
            }
        }
    }

    pub fn session_task(&self) -> SessionTask<S> {
        self.session_task.clone()
    }

    /// Runs a single connection over externally provided stream halves;
    /// the seam for in-process tests and externally built TLS streams.
    pub fn run_session_task(
        &self,
        peer_addr: SocketAddr,
        reader: impl AsyncRead + Unpin + 'static,
        writer: impl AsyncWrite + Unpin + 'static,
    ) -> impl Future<Output = ()> {
        self.session_task.clone().run(peer_addr, reader, writer)
    }
}

impl<S: MessageStore> Stream for Acceptor<S> {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().event_stream.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.event_stream.size_hint()
    }
}
