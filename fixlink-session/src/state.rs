//! Session lifecycle state machine and per-session bookkeeping.
//!
//! [`transition`] is the authoritative transition table; every status
//! change flows through [`State::apply_status_event`], which rejects
//! combinations the table does not list and notifies the registered
//! status listeners otherwise.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashSet},
    fmt,
    ops::RangeInclusive,
    rc::Rc,
};

use fixlink_core::{
    fields::{FixStr, FixString, Int, SeqNum, TagNum},
    message::FixMessage,
};
use tokio::{sync::oneshot, time::Instant};
use tracing::{info, warn};

use crate::{
    session_id::SessionId,
    store::{Direction, MessageStore, StoredMessage},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    /// Acceptor only: bound and waiting for the peer's Logon.
    AwaitingLogon,
    /// Initiator only: Logon sent, awaiting the response.
    LogonInProgress,
    Active,
    LogoutInProgress,
    Reconnecting,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusEvent {
    StartInitiator,
    StartAcceptor,
    Connected,
    ConnectFailed,
    LogonReceived,
    LogonAccepted,
    LogonRejected,
    LogoutRequested,
    LogoutReceived,
    LogoutConfirmed,
    NetworkError,
    FatalError,
    Timeout,
    RetryEnabled,
    RetryAttempt,
    MaxRetriesReached,
}

/// The transition table. `None` marks an invalid transition; callers log
/// and ignore those.
pub fn transition(from: SessionStatus, event: StatusEvent) -> Option<SessionStatus> {
    use SessionStatus::*;
    use StatusEvent::*;

    Some(match (from, event) {
        (Disconnected, StartInitiator) => Connecting,
        (Disconnected, StartAcceptor) => AwaitingLogon,
        (Disconnected, RetryEnabled) => Reconnecting,
        (Connecting, Connected) => LogonInProgress,
        (Connecting, ConnectFailed) => Reconnecting,
        (AwaitingLogon, LogonReceived) => Active,
        (LogonInProgress, LogonAccepted) => Active,
        (LogonInProgress, LogonRejected | Timeout) => Disconnected,
        (Active, LogoutRequested | LogoutReceived) => LogoutInProgress,
        (Active, NetworkError | FatalError) => Disconnected,
        (LogoutInProgress, LogoutConfirmed | Timeout) => Disconnected,
        (Reconnecting, RetryAttempt) => Connecting,
        (Reconnecting, MaxRetriesReached) => Disconnected,
        // a connection can die in any non-terminal phase
        (AwaitingLogon | LogonInProgress | LogoutInProgress, NetworkError | FatalError) => {
            Disconnected
        }
        (AwaitingLogon, Timeout) => Disconnected,
        _ => return None,
    })
}

pub type StatusListener = Box<dyn Fn(&SessionId, SessionStatus, SessionStatus, StatusEvent)>;

/// Listeners registered at engine construction; shared between the engine
/// handle and every session state it creates.
#[derive(Clone, Default)]
pub(crate) struct StatusListeners {
    inner: Rc<RefCell<Vec<StatusListener>>>,
}

impl StatusListeners {
    pub(crate) fn new() -> StatusListeners {
        StatusListeners::default()
    }

    pub(crate) fn register(&self, listener: StatusListener) {
        self.inner.borrow_mut().push(listener);
    }

    fn notify(
        &self,
        session_id: &SessionId,
        old: SessionStatus,
        new: SessionStatus,
        event: StatusEvent,
    ) {
        for listener in self.inner.borrow().iter() {
            listener(session_id, old, new, event);
        }
    }
}

impl fmt::Debug for StatusListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusListeners")
            .field("len", &self.inner.borrow().len())
            .finish()
    }
}

/// Messages received ahead of the expected sequence number, waiting for
/// the gap to be filled. `None` marks a sequence number that was already
/// consumed out of order (e.g. a Logon dispatched immediately).
#[derive(Debug)]
struct PendingQueue(BTreeMap<SeqNum, Option<Box<FixMessage>>>);

impl PendingQueue {
    fn new() -> PendingQueue {
        PendingQueue(BTreeMap::new())
    }

    fn enqueue(&mut self, seq_num: SeqNum, msg: Box<FixMessage>) {
        self.0.insert(seq_num, Some(msg));
    }

    fn mark_consumed(&mut self, seq_num: SeqNum) {
        self.0.insert(seq_num, None);
    }

    fn retrieve(&mut self, seq_num: SeqNum) -> Option<Option<Box<FixMessage>>> {
        self.0.remove(&seq_num)
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

#[derive(Debug)]
pub(crate) struct State<S> {
    session_id: SessionId,
    status: SessionStatus,
    listeners: StatusListeners,

    enabled: bool,
    received_logon: bool,
    sent_logon: bool,
    sent_logout: bool,
    sent_reset: bool,
    reset_received: bool,
    initiate: bool,

    /// 0 until negotiated at Logon; the configured interval applies then.
    heart_bt_int: Int,
    last_sent_time: Instant,
    last_received_time: Instant,

    disconnected: bool,

    /// Set on a successful logon exchange; survives disconnection so the
    /// initiator retry loop can reset its backoff. Cleared by the reader.
    was_logged_on: bool,

    logout_reason: Option<FixString>,
    resend_range: Option<RangeInclusive<SeqNum>>,
    queue: PendingQueue,
    store: S,

    /// Waiter completed when the peer confirms our Logout.
    logoff_waiter: Option<oneshot::Sender<()>>,

    /// TestReqIDs challenged and not yet answered.
    outstanding_test_req_ids: HashSet<FixString>,
}

impl<S: MessageStore> State<S> {
    pub(crate) fn new(session_id: SessionId, store: S, listeners: StatusListeners) -> State<S> {
        State {
            session_id,
            status: SessionStatus::Disconnected,
            listeners,
            enabled: true,
            received_logon: false,
            sent_logon: false,
            sent_logout: false,
            sent_reset: false,
            reset_received: false,
            initiate: false,
            heart_bt_int: 0,
            last_sent_time: Instant::now(),
            last_received_time: Instant::now(),
            disconnected: true,
            was_logged_on: false,
            logout_reason: None,
            resend_range: None,
            queue: PendingQueue::new(),
            store,
            logoff_waiter: None,
            outstanding_test_req_ids: HashSet::new(),
        }
    }

    ////

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Drives the transition table. Invalid transitions are logged and
    /// leave the status untouched.
    pub fn apply_status_event(
        &mut self,
        event: StatusEvent,
    ) -> Option<(SessionStatus, SessionStatus)> {
        match transition(self.status, event) {
            Some(next) => {
                let old = self.status;
                self.status = next;
                info!(?old, ?next, ?event, "session status change");
                self.listeners.notify(&self.session_id, old, next, event);
                Some((old, next))
            }
            None => {
                warn!(status = ?self.status, ?event, "invalid status transition ignored");
                None
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn logon_received(&self) -> bool {
        self.received_logon
    }

    pub fn set_logon_received(&mut self, logon_received: bool) {
        self.received_logon = logon_received;
    }

    pub fn logout_sent(&self) -> bool {
        self.sent_logout
    }

    pub fn set_logout_sent(&mut self, logout_sent: bool) {
        self.sent_logout = logout_sent;
    }

    pub fn logon_sent(&self) -> bool {
        self.sent_logon
    }

    pub fn set_logon_sent(&mut self, logon_sent: bool) {
        self.sent_logon = logon_sent;
    }

    pub fn reset_received(&self) -> bool {
        self.reset_received
    }

    pub fn set_reset_received(&mut self, reset_received: bool) {
        self.reset_received = reset_received;
    }

    pub fn reset_sent(&self) -> bool {
        self.sent_reset
    }

    pub fn set_reset_sent(&mut self, reset_sent: bool) {
        self.sent_reset = reset_sent;
    }

    pub fn initiate(&self) -> bool {
        self.initiate
    }

    pub fn set_initiate(&mut self, initiate: bool) {
        self.initiate = initiate;
    }

    pub fn should_send_logon(&self) -> bool {
        self.initiate() && !self.logon_sent()
    }

    pub fn logout_reason(&self) -> Option<&FixString> {
        self.logout_reason.as_ref()
    }

    pub fn set_logout_reason(&mut self, reason: Option<FixString>) {
        self.logout_reason = reason;
    }

    pub fn heart_bt_int(&self) -> Int {
        self.heart_bt_int
    }

    pub fn set_heart_bt_int(&mut self, heart_bt_int: Int) {
        self.heart_bt_int = heart_bt_int;
    }

    pub fn set_last_sent_time(&mut self, last_sent_time: Instant) {
        self.last_sent_time = last_sent_time;
    }

    pub fn last_sent_time(&self) -> Instant {
        self.last_sent_time
    }

    pub fn set_last_received_time(&mut self, last_received_time: Instant) {
        self.last_received_time = last_received_time;
    }

    pub fn last_received_time(&self) -> Instant {
        self.last_received_time
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn set_disconnected(&mut self, disconnected: bool) {
        self.disconnected = disconnected;
    }

    pub fn mark_logged_on(&mut self) {
        self.was_logged_on = true;
    }

    pub fn take_logged_on_marker(&mut self) -> bool {
        std::mem::take(&mut self.was_logged_on)
    }

    ////

    pub fn set_resend_range(&mut self, resend_range: Option<RangeInclusive<SeqNum>>) {
        self.resend_range = resend_range;
    }

    pub fn resend_range(&self) -> Option<RangeInclusive<SeqNum>> {
        self.resend_range.clone()
    }

    pub fn enqueue_msg(&mut self, msg: Box<FixMessage>) {
        self.queue.enqueue(msg.header.msg_seq_num, msg);
    }

    /// Marks a sequence number as already processed even though it arrived
    /// ahead of the expected one.
    pub fn mark_seq_num_consumed(&mut self, seq_num: SeqNum) {
        self.queue.mark_consumed(seq_num);
    }

    /// Next queued entry, if the head of the queue matches the expected
    /// inbound sequence number. `Some(None)` means the number was consumed
    /// ahead of time and only needs to be skipped.
    pub fn retrieve_msg(&mut self) -> Option<Option<Box<FixMessage>>> {
        self.queue.retrieve(self.next_target_msg_seq_num())
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    ////

    pub fn set_logoff_waiter(&mut self, waiter: oneshot::Sender<()>) {
        self.logoff_waiter = Some(waiter);
    }

    /// Completes the logoff waiter if one is armed. Safe to call when the
    /// receiving side has already been cancelled.
    pub fn complete_logoff_waiter(&mut self) {
        if let Some(waiter) = self.logoff_waiter.take() {
            let _ = waiter.send(());
        }
    }

    pub fn drop_logoff_waiter(&mut self) {
        self.logoff_waiter = None;
    }

    ////

    pub fn register_test_request(&mut self, test_req_id: FixString) {
        self.outstanding_test_req_ids.insert(test_req_id);
    }

    pub fn outstanding_test_requests(&self) -> usize {
        self.outstanding_test_req_ids.len()
    }

    /// Clears the outstanding challenges if `test_req_id` matches one.
    pub fn validate_test_req_id(&mut self, test_req_id: &FixString) {
        if self.outstanding_test_req_ids.contains(test_req_id) {
            self.clear_test_requests();
        }
    }

    pub fn clear_test_requests(&mut self) {
        self.outstanding_test_req_ids.clear();
    }

    ////

    pub fn store_message(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
        data: &[u8],
    ) -> Result<(), S::Error> {
        self.store.store(seq_num, direction, data)
    }

    pub fn fetch_outbound(&mut self, seq_num: SeqNum) -> Result<Option<StoredMessage>, S::Error> {
        self.store.fetch(seq_num, Direction::Outbound)
    }

    pub fn fetch_outbound_range(
        &mut self,
        range: RangeInclusive<SeqNum>,
    ) -> Result<Vec<StoredMessage>, S::Error> {
        self.store.fetch_range(range)
    }

    pub fn find_by_field(
        &mut self,
        tag: TagNum,
        value: &FixStr,
    ) -> Result<Vec<StoredMessage>, S::Error> {
        self.store.find_by_field(tag, value)
    }

    pub fn next_sender_msg_seq_num(&self) -> SeqNum {
        self.store.next_sender_msg_seq_num()
    }

    pub fn next_target_msg_seq_num(&self) -> SeqNum {
        self.store.next_target_msg_seq_num()
    }

    pub fn set_next_sender_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), S::Error> {
        self.store.set_next_sender_msg_seq_num(seq_num)
    }

    pub fn set_next_target_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), S::Error> {
        self.store.set_next_target_msg_seq_num(seq_num)
    }

    pub fn incr_next_sender_msg_seq_num(&mut self) -> Result<(), S::Error> {
        self.store.incr_next_sender_msg_seq_num()
    }

    pub fn incr_next_target_msg_seq_num(&mut self) -> Result<(), S::Error> {
        self.store.incr_next_target_msg_seq_num()
    }

    pub fn reset_sequence_numbers(&mut self) -> Result<(), S::Error> {
        self.store.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_the_documented_lifecycle() {
        use SessionStatus::*;
        use StatusEvent::*;

        let path = [
            (Disconnected, StartInitiator, Connecting),
            (Connecting, Connected, LogonInProgress),
            (LogonInProgress, LogonAccepted, Active),
            (Active, LogoutRequested, LogoutInProgress),
            (LogoutInProgress, LogoutConfirmed, Disconnected),
        ];
        for (from, event, to) in path {
            assert_eq!(transition(from, event), Some(to), "{from:?} --{event:?}");
        }

        let acceptor_path = [
            (Disconnected, StartAcceptor, AwaitingLogon),
            (AwaitingLogon, LogonReceived, Active),
            (Active, LogoutReceived, LogoutInProgress),
        ];
        for (from, event, to) in acceptor_path {
            assert_eq!(transition(from, event), Some(to), "{from:?} --{event:?}");
        }

        let retry_path = [
            (Connecting, ConnectFailed, Reconnecting),
            (Reconnecting, RetryAttempt, Connecting),
            (Reconnecting, MaxRetriesReached, Disconnected),
            (Disconnected, RetryEnabled, Reconnecting),
        ];
        for (from, event, to) in retry_path {
            assert_eq!(transition(from, event), Some(to), "{from:?} --{event:?}");
        }
    }

    #[test]
    fn unlisted_transitions_are_rejected() {
        use SessionStatus::*;
        use StatusEvent::*;

        assert_eq!(transition(Disconnected, LogonReceived), None);
        assert_eq!(transition(Active, Connected), None);
        assert_eq!(transition(Active, RetryAttempt), None);
        assert_eq!(transition(Reconnecting, LogonAccepted), None);
        assert_eq!(transition(LogoutInProgress, LogoutRequested), None);
    }

    #[test]
    fn failures_force_disconnected() {
        use SessionStatus::*;
        use StatusEvent::*;

        for from in [Active, AwaitingLogon, LogonInProgress, LogoutInProgress] {
            assert_eq!(transition(from, NetworkError), Some(Disconnected));
            assert_eq!(transition(from, FatalError), Some(Disconnected));
        }
        assert_eq!(transition(LogonInProgress, Timeout), Some(Disconnected));
        assert_eq!(transition(LogoutInProgress, Timeout), Some(Disconnected));
    }
}
