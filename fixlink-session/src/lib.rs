pub mod acceptor;
pub mod application;
pub mod initiator;
pub mod io;
mod session;
pub mod session_id;
pub mod settings;
mod state;
pub mod store;

use std::time::Duration;

use fixlink_core::{
    fields::{FixString, UtcTimestamp},
    message::{Body, FixMessage, Header, Trailer},
};
use tokio::sync::mpsc;
use tracing::error;

pub use state::{transition, SessionStatus, StatusEvent, StatusListener};

/// Extra slack added on top of the negotiated heartbeat interval before an
/// inbound timeout fires, to absorb transmission delay.
pub(crate) const NO_INBOUND_TIMEOUT_PADDING: Duration = Duration::from_millis(250);

/// Inbound silence is challenged after `HeartBtInt` multiplied by this
/// factor ("reasonable transmission time" of 20%).
pub(crate) const TEST_REQUEST_THRESHOLD: f32 = 1.2;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Never received logon from new connection.")]
    LogonNeverReceived,
    #[error("Message does not point to any session.")]
    UnknownSession,
    #[error("Session is not active.")]
    NotLoggedOn,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Session error: {0}")]
    SessionError(SessionError),
}

/// Disconnection reasons.
#[derive(Clone, Copy, Debug)]
pub enum DisconnectReason {
    /// Logout requested locally
    LocalRequestedLogout,
    /// Logout requested remotely
    RemoteRequestedLogout,
    /// Disconnect forced by user code
    UserForcedDisconnect,
    /// Received message without MsgSeqNum
    MsgSeqNumNotFound,
    /// Received message with MsgSeqNum too low
    MsgSeqNumTooLow,
    /// Invalid logon state
    InvalidLogonState,
    /// CompID validation failed
    CompIdProblem,
    /// Logon credentials rejected
    InvalidCredentials,
    /// Fatal protocol violation other than the dedicated variants
    ProtocolViolation,
    /// No response to Logon
    LogonTimeout,
    /// No response to Logout
    LogoutTimeout,
    /// No response to TestRequest
    TestRequestTimeout,
    /// Message store failure
    StoreError,
    /// Remote side disconnected
    Disconnected,
    /// I/O Error
    IoError,
}

impl DisconnectReason {
    /// Whether the initiator retry policy may re-dial after this
    /// disconnection. Protocol violations never reconnect.
    pub fn allows_reconnect(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Disconnected
                | DisconnectReason::IoError
                | DisconnectReason::LogonTimeout
                | DisconnectReason::TestRequestTimeout
        )
    }
}

#[derive(Debug)]
pub(crate) enum SenderMsg {
    Msg(Box<FixMessage>),
    Disconnect(DisconnectReason),
}

/// Handle for submitting outbound messages to a session.
///
/// Obtained from the `Logon` event. Header fields left at their defaults
/// ([`new_header`]) are filled right before serialization: BeginString,
/// comp ids, SendingTime and MsgSeqNum. CheckSum<10> and BodyLength<9>
/// are always computed during serialization.
#[derive(Clone, Debug)]
pub struct Sender {
    inner: mpsc::UnboundedSender<SenderMsg>,
}

impl Sender {
    pub(crate) fn new(writer: mpsc::UnboundedSender<SenderMsg>) -> Sender {
        Sender { inner: writer }
    }

    /// Send a complete message.
    pub fn send_raw(&self, msg: Box<FixMessage>) -> Result<(), Box<FixMessage>> {
        if let Err(msg) = self.inner.send(SenderMsg::Msg(msg)) {
            match msg.0 {
                SenderMsg::Msg(msg) => {
                    error!(
                        "failed to send {:?} message, receiver closed or dropped",
                        msg.msg_type(),
                    );
                    Err(msg)
                }
                SenderMsg::Disconnect(_) => unreachable!(),
            }
        } else {
            Ok(())
        }
    }

    /// Send a message body; header and trailer are constructed with
    /// defaults and filled during serialization.
    pub fn send(&self, body: Body) -> Result<(), Box<FixMessage>> {
        self.send_raw(Box::new(FixMessage {
            header: new_header(),
            body,
            trailer: new_trailer(),
        }))
    }

    /// Close the output queue; no more messages can be sent after this one.
    pub(crate) fn disconnect(&self, reason: DisconnectReason) {
        if self.inner.send(SenderMsg::Disconnect(reason)).is_err() {
            error!("failed to disconnect, receiver closed or dropped");
        }
    }
}

/// Header with every auto-filled field left at its sentinel value.
pub fn new_header() -> Header {
    Header {
        begin_string: FixString::new(),
        sender_comp_id: FixString::new(),
        target_comp_id: FixString::new(),
        msg_seq_num: 0,
        poss_dup_flag: None,
        poss_resend: None,
        sending_time: UtcTimestamp::MIN_UTC,
        orig_sending_time: None,
    }
}

pub fn new_trailer() -> Trailer {
    Trailer::default()
}
