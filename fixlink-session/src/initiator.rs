use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    net::SocketAddr,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use fixlink_core::{
    fields::{FixString, SeqNum},
    message::Body,
};
use futures::Stream;
use pin_project::pin_project;
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    task::JoinHandle,
    time::Duration,
};
use tracing::{error, info, info_span, Instrument};

use crate::{
    acceptor::ActiveSessionsMap,
    application::{events_channel, Emitter, Event, EventStream},
    io::initiator_connection,
    session::Session,
    session_id::SessionId,
    settings::{SessionSettings, Settings},
    state::{State, StatusListener, StatusListeners},
    store::MessageStore,
    DisconnectReason, Error, SessionError, StatusEvent,
};

/// Outbound connection factory; the seam through which an externally
/// built TLS connector plugs in.
#[allow(async_fn_in_trait)]
pub trait Connector {
    async fn connect(
        &mut self,
    ) -> Result<
        (
            impl AsyncRead + Unpin + 'static,
            impl AsyncWrite + Unpin + 'static,
        ),
        io::Error,
    >;
}

pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: impl Into<SocketAddr>) -> TcpConnector {
        TcpConnector { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    async fn connect(
        &mut self,
    ) -> Result<
        (
            impl AsyncRead + Unpin + 'static,
            impl AsyncWrite + Unpin + 'static,
        ),
        io::Error,
    > {
        let tcp_stream = TcpStream::connect(self.addr).await?;
        tcp_stream.set_nodelay(true)?;
        Ok(tcp_stream.into_split())
    }
}

/// Capped exponential backoff with ±20% jitter. A successful logon resets
/// it to the initial interval.
struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, cap: Duration) -> Backoff {
        Backoff {
            initial,
            cap,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.cap);
        base.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[pin_project]
pub struct Initiator<S: MessageStore> {
    id: SessionId,
    settings: Settings,
    session_settings: SessionSettings,
    state: Rc<RefCell<State<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    listeners: StatusListeners,
    emitter: Emitter,
    #[pin]
    event_stream: EventStream,
}

impl<S: MessageStore + 'static> Initiator<S> {
    pub fn new(
        settings: Settings,
        session_settings: SessionSettings,
        message_store: S,
    ) -> Initiator<S> {
        let (emitter, event_stream) = events_channel();
        let listeners = StatusListeners::new();
        let id = session_settings.session_id.clone();
        Initiator {
            id: id.clone(),
            settings,
            session_settings,
            state: Rc::new(RefCell::new(State::new(id, message_store, listeners.clone()))),
            active_sessions: Rc::new(RefCell::new(HashMap::new())),
            listeners,
            emitter,
            event_stream,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Observes every state machine transition. Register listeners before
    /// `start`.
    pub fn register_status_listener(&self, listener: StatusListener) {
        self.listeners.register(listener);
    }

    /// Overrides the sequence counters; valid only while disconnected.
    pub fn set_sequence_numbers(
        &self,
        next_sender: SeqNum,
        next_target: SeqNum,
    ) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        if !state.disconnected() {
            return Err(Error::SessionError(SessionError::NotLoggedOn));
        }
        state
            .set_next_sender_msg_seq_num(next_sender)
            .and_then(|()| state.set_next_target_msg_seq_num(next_target))
            .map_err(|err| {
                Error::Io(io::Error::other(err.to_string()))
            })
    }

    pub fn next_sender_msg_seq_num(&self) -> SeqNum {
        self.state.borrow().next_sender_msg_seq_num()
    }

    pub fn next_target_msg_seq_num(&self) -> SeqNum {
        self.state.borrow().next_target_msg_seq_num()
    }

    /// Sends a message body. Fails when the session is not logged on:
    /// nothing is queued and nothing reaches the wire.
    pub fn send(&self, body: Body) -> Result<(), Error> {
        let active_sessions = self.active_sessions.borrow();
        let session = active_sessions
            .get(&self.id)
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
    pub async fn request_logoff(&self, text: Option<FixString>, timeout: Duration) -> bool {
        let session = {
            let active_sessions = self.active_sessions.borrow();
            match active_sessions.get(&self.id) {
                Some(session) => session.clone(),
                None => return true,
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
        confirmed
    }

    pub fn disconnect(&self) {
        if let Some(session) = self.active_sessions.borrow().get(&self.id) {
            session.disconnect(
                &mut session.state().borrow_mut(),
                DisconnectReason::UserForcedDisconnect,
            );
        }
    }

    /// Runs the connect / session / reconnect lifecycle until it reaches
    /// the terminal Disconnected state.
    pub fn start(&self, connector: impl Connector + 'static) -> JoinHandle<()> {
        let settings = self.settings.clone();
        let session_settings = self.session_settings.clone();
        let state = self.state.clone();
        let active_sessions = self.active_sessions.clone();
        let emitter = self.emitter.clone();
        tokio::task::spawn_local(run_initiator(
            connector,
            settings,
            session_settings,
            state,
            active_sessions,
            emitter,
        ))
    }
}

async fn run_initiator<S: MessageStore>(
    mut connector: impl Connector,
    settings: Settings,
    session_settings: SessionSettings,
    state: Rc<RefCell<State<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    emitter: Emitter,
) {
    info!("Initiator started");
    state
        .borrow_mut()
        .apply_status_event(StatusEvent::StartInitiator);

    let reconnect = settings.reconnect.clone();
    let mut backoff = Backoff::new(reconnect.interval, reconnect.interval_cap);
    let mut attempts: u32 = 0;

    loop {
        match connector.connect().await {
            Ok((reader, writer)) => {
                state
                    .borrow_mut()
                    .apply_status_event(StatusEvent::Connected);

                let connection_span = info_span!("connection");
                let reason = initiator_connection(
                    reader,
                    writer,
                    settings.clone(),
                    session_settings.clone(),
                    state.clone(),
                    active_sessions.clone(),
                    emitter.clone(),
                )
                .instrument(connection_span)
                .await;

                if state.borrow_mut().take_logged_on_marker() {
                    backoff.reset();
                    attempts = 0;
                }
                if !reconnect.enabled || !reason.allows_reconnect() {
                    info!(?reason, "not reconnecting");
                    break;
                }
                state
                    .borrow_mut()
                    .apply_status_event(StatusEvent::RetryEnabled);
            }
            Err(err) => {
                error!("failed to connect: {err}");
                state
                    .borrow_mut()
                    .apply_status_event(StatusEvent::ConnectFailed);
                if !reconnect.enabled {
                    state
                        .borrow_mut()
                        .apply_status_event(StatusEvent::MaxRetriesReached);
                    break;
                }
            }
        }

        attempts += 1;
        if reconnect.max_attempts != 0 && attempts > reconnect.max_attempts {
            error!("reconnect attempts exhausted, giving up");
            state
                .borrow_mut()
                .apply_status_event(StatusEvent::MaxRetriesReached);
            break;
        }
        let delay = backoff.next_delay();
        info!(?delay, attempt = attempts, "scheduling reconnect");
        tokio::time::sleep(delay).await;
        state
            .borrow_mut()
            .apply_status_event(StatusEvent::RetryAttempt);
    }
    info!("Initiator stopped");
}

impl<S: MessageStore> Stream for Initiator<S> {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().event_stream.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.event_stream.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap_with_bounded_jitter() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut expected_base = 1.0f64;
        for _ in 0..8 {
            let delay = backoff.next_delay().as_secs_f64();
            assert!(
                delay >= expected_base * 0.8 - 1e-9 && delay <= expected_base * 1.2 + 1e-9,
                "delay {delay} outside jitter window around {expected_base}"
            );
            expected_base = (expected_base * 2.0).min(30.0);
        }

        backoff.reset();
        let delay = backoff.next_delay().as_secs_f64();
        assert!((0.8..=1.2).contains(&delay));
    }
}
