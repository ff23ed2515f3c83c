use std::{cell::RefCell, ops::RangeInclusive, rc::Rc};

use bytes::Bytes;
use fixlink_core::{
    codec::DecodeError,
    fields::{FixStr, FixString, Int, SeqNum, TagNum, Utc, UtcTimestamp},
    message::{
        Body, FixMessage, Heartbeat, Logout, MsgCat, MsgType, Reject, ResendRequest,
        SequenceReset, SessionRejectReason, TestRequest,
    },
};
use tokio::{
    sync::oneshot,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    application::{Emitter, EventInner, InputResponder, OutboundVerdict, Responder},
    new_header, new_trailer,
    session_id::SessionId,
    settings::{SessionSettings, Settings},
    state::State,
    store::{Direction, MessageStore},
    DisconnectReason, Sender, SessionStatus, StatusEvent,
};

#[derive(Debug, thiserror::Error)]
enum VerifyError {
    #[error("Message already received")]
    Duplicate,
    #[error("Reject due to {reason:?} (tag={tag:?}, logout={logout})")]
    Reject {
        reason: SessionRejectReason,
        tag: Option<TagNum>,
        text: Option<FixString>,
        logout: bool,
    },
    #[error("Logout: {text:?}, disconnect: {disconnect}")]
    Logout {
        text: Option<FixString>,
        disconnect: bool,
        reason: DisconnectReason,
    },
    #[error("Disconnect: {0}")]
    Disconnect(String),
    #[error("Message store failure: {0}")]
    StoreFatal(String),
}

impl VerifyError {
    fn invalid_logon_state() -> VerifyError {
        VerifyError::Disconnect("invalid logon state".to_owned())
    }

    fn invalid_time() -> VerifyError {
        VerifyError::Reject {
            reason: SessionRejectReason::SendingTimeAccuracyProblem,
            tag: None,
            text: None,
            logout: false,
        }
    }

    fn invalid_comp_id() -> VerifyError {
        VerifyError::Reject {
            reason: SessionRejectReason::CompIdProblem,
            tag: None,
            text: None,
            logout: true,
        }
    }

    fn missing_orig_time() -> VerifyError {
        VerifyError::Reject {
            reason: SessionRejectReason::RequiredTagMissing,
            tag: Some(122),
            text: None,
            logout: false,
        }
    }

    fn invalid_orig_time() -> VerifyError {
        VerifyError::Reject {
            reason: SessionRejectReason::SendingTimeAccuracyProblem,
            tag: Some(122),
            text: None,
            logout: true,
        }
    }

    fn seq_num_too_low(msg_seq_num: SeqNum, next_target_msg_seq_num: SeqNum) -> VerifyError {
        VerifyError::Logout {
            text: Some(FixString::from_ascii_lossy(
                format!(
                    "MsgSeqNum too low, expecting {}, but received {}",
                    next_target_msg_seq_num, msg_seq_num
                )
                .into_bytes(),
            )),
            disconnect: true,
            reason: DisconnectReason::MsgSeqNumTooLow,
        }
    }

    fn seq_num_decrease(new_seq_no: SeqNum, next_target_msg_seq_num: SeqNum) -> VerifyError {
        debug!(new_seq_no, next_target_msg_seq_num, "rejecting decrease");
        VerifyError::Reject {
            reason: SessionRejectReason::ValueIsIncorrect,
            tag: Some(36),
            text: Some(FixString::from_ascii_lossy(
                b"Sequence Reset attempted to decrease sequence number".to_vec(),
            )),
            logout: false,
        }
    }

    fn store_fatal(err: impl std::error::Error) -> VerifyError {
        VerifyError::StoreFatal(err.to_string())
    }
}

#[derive(Debug)]
pub(crate) struct Session<S> {
    state: Rc<RefCell<State<S>>>,
    sender: Sender,
    settings: Settings,
    session_settings: SessionSettings,
    emitter: Emitter,
}

impl<S: MessageStore> Session<S> {
    pub(crate) fn new(
        settings: Settings,
        session_settings: SessionSettings,
        state: Rc<RefCell<State<S>>>,
        sender: Sender,
        emitter: Emitter,
    ) -> Session<S> {
        Session {
            state,
            settings,
            session_settings,
            sender,
            emitter,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_settings.session_id
    }

    pub(crate) fn state(&self) -> &Rc<RefCell<State<S>>> {
        &self.state
    }

    pub(crate) fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn is_logged_on(state: &State<S>) -> bool {
        state.logon_received() && state.logon_sent()
    }

    fn is_good_time(&self, sending_time: UtcTimestamp) -> bool {
        if !self.session_settings.check_latency {
            return true;
        }
        let latency = Utc::now() - sending_time;
        latency <= chrono::Duration::from_std(self.session_settings.max_latency).expect("duration")
            && latency >= -chrono::Duration::from_std(self.session_settings.max_latency).expect("duration")
    }

    fn is_correct_comp_id(&self, sender_comp_id: &FixStr, target_comp_id: &FixStr) -> bool {
        if !self.session_settings.check_comp_id {
            return true;
        }

        self.session_settings.session_id.sender_comp_id() == target_comp_id
            && self.session_settings.session_id.target_comp_id() == sender_comp_id
    }

    fn valid_logon_state(state: &State<S>, msg_type: &MsgType) -> bool {
        let is_logon = *msg_type == MsgType::Logon;
        if (is_logon && state.reset_sent()) || state.reset_received() {
            return true;
        }
        if (is_logon && !state.logon_received()) || (!is_logon && state.logon_received()) {
            return true;
        }
        if *msg_type == MsgType::Logout && state.logon_sent() {
            return true;
        }
        if *msg_type != MsgType::Logout && state.logon_sent() {
            return true;
        }
        if *msg_type == MsgType::SequenceReset {
            return true;
        }
        if *msg_type == MsgType::Reject {
            return true;
        }

        false
    }

    /// Header and sequence validation shared by every handler.
    ///
    /// Ahead-of-sequence messages never reach the handlers (the gap queue
    /// intercepts them), so only the too-low side is checked here; callers
    /// whose message type ignores its own MsgSeqNum pass
    /// `check_too_low = false`.
    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(msg_type = ?msg.msg_type(), msg_seq_num = msg.header.msg_seq_num),
        err
    )]
    fn verify(&self, msg: &FixMessage, check_too_low: bool) -> Result<(), VerifyError> {
        let msg_type = msg.msg_type();
        let header = &msg.header;
        let state = self.state.borrow();

        if !Self::valid_logon_state(&state, &msg_type) {
            return Err(VerifyError::invalid_logon_state());
        }
        if !self.is_good_time(header.sending_time) {
            warn!("SendingTime<52> verification failed");
            return Err(VerifyError::invalid_time());
        }
        if !self.is_correct_comp_id(&header.sender_comp_id, &header.target_comp_id) {
            warn!("CompID verification failed");
            return Err(VerifyError::invalid_comp_id());
        }
        let next_target = state.next_target_msg_seq_num();
        if check_too_low && header.msg_seq_num < next_target {
            return if header.poss_dup_flag.unwrap_or(false) {
                if msg_type != MsgType::SequenceReset {
                    let orig_sending_time = header
                        .orig_sending_time
                        .ok_or_else(VerifyError::missing_orig_time)?;
                    if orig_sending_time > header.sending_time {
                        return Err(VerifyError::invalid_orig_time());
                    }
                }
                Err(VerifyError::Duplicate)
            } else {
                Err(VerifyError::seq_num_too_low(header.msg_seq_num, next_target))
            };
        }
        Ok(())
    }

    fn persist_inbound(&self, seq_num: SeqNum, raw: Option<&[u8]>) -> Result<(), VerifyError> {
        if !self.session_settings.persist {
            return Ok(());
        }
        if let Some(raw) = raw {
            self.state
                .borrow_mut()
                .store_message(seq_num, Direction::Inbound, raw)
                .map_err(VerifyError::store_fatal)?;
        }
        Ok(())
    }

    fn incr_next_target(&self) -> Result<(), VerifyError> {
        self.state
            .borrow_mut()
            .incr_next_target_msg_seq_num()
            .map_err(VerifyError::store_fatal)
    }

    ////

    /// Entry point of the inbound pipeline: one freshly framed message,
    /// followed by draining whatever queued messages it unblocked.
    pub async fn on_message_in(
        &self,
        msg: Box<FixMessage>,
        raw: Bytes,
    ) -> Option<DisconnectReason> {
        self.state.borrow_mut().set_last_received_time(Instant::now());

        let mut disconnect = self.process_one(msg, Some(&raw)).await;
        while disconnect.is_none() {
            let queued = self.state.borrow_mut().retrieve_msg();
            match queued {
                None => break,
                Some(None) => {
                    // the number was consumed ahead of sequence
                    if let Err(err) = self.incr_next_target() {
                        error!("{err}");
                        disconnect = Some(self.force_disconnect(DisconnectReason::StoreError));
                    }
                }
                Some(Some(msg)) => {
                    debug!(
                        msg_seq_num = msg.header.msg_seq_num,
                        "processing queued message"
                    );
                    // persisted when it was queued
                    disconnect = self.process_one(msg, None).await;
                }
            }
        }
        disconnect
    }

    async fn process_one(
        &self,
        msg: Box<FixMessage>,
        raw: Option<&[u8]>,
    ) -> Option<DisconnectReason> {
        let msg_type = msg.msg_type();
        let msg_seq_num = msg.header.msg_seq_num;
        trace!(?msg_type, msg_seq_num, "processing message");

        // Comp ids are validated before the sequence number so a misdirected
        // message is answered immediately instead of sitting in the queue.
        if !self.is_correct_comp_id(&msg.header.sender_comp_id, &msg.header.target_comp_id) {
            warn!("CompID verification failed");
            self.send_reject(
                &msg_type,
                msg_seq_num,
                SessionRejectReason::CompIdProblem,
                None,
                None,
            );
            self.send_logout(None);
            return Some(self.force_disconnect(DisconnectReason::CompIdProblem));
        }

        // Logon, Logout and SequenceReset bypass the gap queue.
        let bypasses_queue = matches!(
            msg_type,
            MsgType::Logon | MsgType::Logout | MsgType::SequenceReset
        );
        if !bypasses_queue
            && msg_seq_num > self.state.borrow().next_target_msg_seq_num()
        {
            if let Err(err) = self.do_target_too_high(msg, raw) {
                error!("{err}");
                return Some(self.force_disconnect(DisconnectReason::StoreError));
            }
            return None;
        }

        let result = match &msg.body {
            Body::Heartbeat(_) => self.on_heartbeat(msg, raw).await.map(|_| None),
            Body::TestRequest(_) => self.on_test_request(msg, raw).await.map(|_| None),
            Body::ResendRequest(_) => self.on_resend_request(msg, raw).await.map(|_| None),
            Body::Reject(_) => self.on_reject(msg, raw).await.map(|_| None),
            Body::SequenceReset(_) => self.on_sequence_reset(msg, raw).await.map(|_| None),
            Body::Logout(_) => self.on_logout(msg, raw).await,
            Body::Logon(_) => self.on_logon(msg, raw).await,
            Body::Application { .. } => self.on_app_message(msg, raw).await.map(|_| None),
        };

        match result {
            Ok(maybe_disconnect) => {
                self.check_resend_range_satisfied();
                maybe_disconnect
            }
            Err(VerifyError::Duplicate) => {
                debug!(msg_seq_num, "duplicate message ignored");
                None
            }
            Err(VerifyError::Reject {
                reason,
                tag,
                text,
                logout,
            }) => {
                self.send_reject(&msg_type, msg_seq_num, reason, tag, text);
                if logout {
                    self.send_logout(None);
                    let disconnect_reason = if reason == SessionRejectReason::CompIdProblem {
                        DisconnectReason::CompIdProblem
                    } else {
                        DisconnectReason::ProtocolViolation
                    };
                    Some(self.force_disconnect(disconnect_reason))
                } else {
                    None
                }
            }
            Err(VerifyError::Logout {
                text,
                disconnect,
                reason,
            }) => {
                self.send_logout(text);
                if disconnect {
                    Some(self.force_disconnect(reason))
                } else {
                    None
                }
            }
            Err(VerifyError::Disconnect(why)) => {
                error!("disconnecting because of {why}");
                Some(self.force_disconnect(DisconnectReason::InvalidLogonState))
            }
            Err(VerifyError::StoreFatal(why)) => {
                // no protocol response: the inbound message may not have been
                // acknowledged and the counters must not advance
                error!("message store failure: {why}");
                Some(self.force_disconnect(DisconnectReason::StoreError))
            }
        }
    }

    fn do_target_too_high(
        &self,
        msg: Box<FixMessage>,
        raw: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        let msg_seq_num = msg.header.msg_seq_num;
        let expected = self.state.borrow().next_target_msg_seq_num();
        warn!(
            "MsgSeqNum too high, expecting {expected}, but received {msg_seq_num}; queueing"
        );

        self.persist_inbound(msg_seq_num, raw)?;
        let mut state = self.state.borrow_mut();
        state.enqueue_msg(msg);

        if state.resend_range().is_none() {
            drop(state);
            self.send_resend_request(msg_seq_num);
        } else {
            debug!("resend request already in flight");
        }
        Ok(())
    }

    fn check_resend_range_satisfied(&self) {
        let mut state = self.state.borrow_mut();
        if let Some(range) = state.resend_range() {
            if state.next_target_msg_seq_num() > *range.end() {
                info!(
                    "ResendRequest for messages FROM: {} TO: {} has been satisfied",
                    range.start(),
                    range.end()
                );
                state.set_resend_range(None);
            }
        }
    }

    ////

    async fn on_heartbeat(
        &self,
        msg: Box<FixMessage>,
        raw: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        trace!("got heartbeat");
        self.verify(&msg, true)?;
        self.persist_inbound(msg.header.msg_seq_num, raw)?;

        if let Body::Heartbeat(Heartbeat {
            test_req_id: Some(test_req_id),
        }) = &msg.body
        {
            self.state.borrow_mut().validate_test_req_id(test_req_id);
        }

        self.incr_next_target()?;
        self.emit_admin_in(msg).await;
        Ok(())
    }

    /// Got TestRequest, answer with Heartbeat echoing TestReqID<112>.
    async fn on_test_request(
        &self,
        msg: Box<FixMessage>,
        raw: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        trace!("on_test_request");
        self.verify(&msg, true)?;
        self.persist_inbound(msg.header.msg_seq_num, raw)?;

        let Body::TestRequest(TestRequest { test_req_id }) = &msg.body else {
            unreachable!()
        };
        self.send_heartbeat(Some(test_req_id.clone()));

        self.incr_next_target()?;
        self.emit_admin_in(msg).await;
        Ok(())
    }

    async fn on_resend_request(
        &self,
        msg: Box<FixMessage>,
        raw: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        trace!("on_resend_request");
        self.verify(&msg, true)?;
        self.persist_inbound(msg.header.msg_seq_num, raw)?;
        self.incr_next_target()?;

        let Body::ResendRequest(ResendRequest {
            begin_seq_no,
            end_seq_no,
        }) = &msg.body
        else {
            unreachable!()
        };
        let (begin_seq_no, end_seq_no) = (*begin_seq_no, *end_seq_no);

        let next_sender = self.state.borrow().next_sender_msg_seq_num();
        let begin = begin_seq_no.max(1);
        // EndSeqNo=0 means "through the latest outbound"
        let end = if end_seq_no == 0 || end_seq_no >= next_sender {
            next_sender.saturating_sub(1)
        } else {
            end_seq_no
        };
        info!("Received ResendRequest for [{begin_seq_no}, {end_seq_no}], replaying [{begin}, {end}]");

        if begin <= end {
            self.resend_range(begin..=end)?;
        } else {
            warn!("nothing to resend");
        }

        self.emit_admin_in(msg).await;
        Ok(())
    }

    /// Replays stored outbound messages. Application messages go out again
    /// with `PossDupFlag<43>=Y` and the original SendingTime preserved in
    /// `OrigSendingTime<122>`; administrative or missing messages coalesce
    /// into one SequenceReset-GapFill per contiguous run.
    fn resend_range(&self, range: RangeInclusive<SeqNum>) -> Result<(), VerifyError> {
        let mut gap_fill_start: Option<SeqNum> = None;

        for seq_num in range.clone() {
            let record = self
                .state
                .borrow_mut()
                .fetch_outbound(seq_num)
                .map_err(VerifyError::store_fatal)?;
            let replay = record
                .and_then(|record| FixMessage::from_bytes(&record.data).ok())
                .filter(|stored| stored.msg_cat() == MsgCat::App);

            match replay {
                Some(mut replay) => {
                    if let Some(start) = gap_fill_start.take() {
                        self.send_gap_fill(start, seq_num);
                    }
                    info!(seq_num, "resending stored message");
                    replay.header.poss_dup_flag = Some(true);
                    replay.header.orig_sending_time = Some(replay.header.sending_time);
                    replay.header.sending_time = Utc::now();
                    let _ = self.sender.send_raw(replay);
                }
                None => {
                    gap_fill_start.get_or_insert(seq_num);
                }
            }
        }

        if let Some(start) = gap_fill_start {
            self.send_gap_fill(start, *range.end() + 1);
        }
        Ok(())
    }

    async fn on_reject(&self, msg: Box<FixMessage>, raw: Option<&[u8]>) -> Result<(), VerifyError> {
        trace!("on_reject");
        self.verify(&msg, true)?;
        self.persist_inbound(msg.header.msg_seq_num, raw)?;

        if let Body::Reject(Reject {
            ref_seq_num, text, ..
        }) = &msg.body
        {
            // audit trail only, nothing is retransmitted
            warn!(ref_seq_num, ?text, "peer rejected message");
        }

        self.incr_next_target()?;
        self.emit_admin_in(msg).await;
        Ok(())
    }

    async fn on_sequence_reset(
        &self,
        msg: Box<FixMessage>,
        raw: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        trace!("on_sequence_reset");
        let Body::SequenceReset(SequenceReset {
            gap_fill_flag,
            new_seq_no,
        }) = &msg.body
        else {
            unreachable!()
        };
        let (gap_fill, new_seq_no) = (gap_fill_flag.unwrap_or(false), *new_seq_no);

        // A gap fill is part of the sequenced stream; an administrative
        // reset (123=N) is processed regardless of its own MsgSeqNum.
        self.verify(&msg, gap_fill)?;
        self.persist_inbound(msg.header.msg_seq_num, raw)?;

        let next_target = self.state.borrow().next_target_msg_seq_num();
        if new_seq_no > next_target {
            info!(
                "SequenceReset{} moves next expected inbound from {next_target} to {new_seq_no}",
                if gap_fill { "-GapFill" } else { "" },
            );
            self.state
                .borrow_mut()
                .set_next_target_msg_seq_num(new_seq_no)
                .map_err(VerifyError::store_fatal)?;
        } else if new_seq_no < next_target {
            if msg.header.poss_dup_flag.unwrap_or(false) {
                debug!("stale SequenceReset to {new_seq_no} ignored");
            } else {
                return Err(VerifyError::seq_num_decrease(new_seq_no, next_target));
            }
        }

        self.emit_admin_in(msg).await;
        Ok(())
    }

    async fn on_logout(
        &self,
        msg: Box<FixMessage>,
        raw: Option<&[u8]>,
    ) -> Result<Option<DisconnectReason>, VerifyError> {
        self.verify(&msg, false)?;
        self.persist_inbound(msg.header.msg_seq_num, raw)?;

        let logout_sent = self.state.borrow().logout_sent();
        let reason = if logout_sent {
            info!("received logout response");
            DisconnectReason::LocalRequestedLogout
        } else {
            info!("received logout request");
            self.apply_status(StatusEvent::LogoutReceived).await;
            self.send_logout(None);
            info!("sending logout response");
            DisconnectReason::RemoteRequestedLogout
        };

        self.incr_next_target()?;
        self.state.borrow_mut().complete_logoff_waiter();
        if self.session_settings.reset_on_logout {
            self.state
                .borrow_mut()
                .reset_sequence_numbers()
                .map_err(VerifyError::store_fatal)?;
        }

        self.emit_admin_in(msg).await;
        self.disconnect(&mut self.state.borrow_mut(), reason);
        Ok(Some(reason))
    }

    async fn on_logon(
        &self,
        msg: Box<FixMessage>,
        raw: Option<&[u8]>,
    ) -> Result<Option<DisconnectReason>, VerifyError> {
        let msg_seq_num = msg.header.msg_seq_num;
        let Body::Logon(ref logon) = msg.body else {
            unreachable!()
        };
        let reset_seq_num_flag = logon.reset_seq_num_flag.unwrap_or(false);
        let heart_bt_int = logon.heart_bt_int;
        let username = logon.username.clone();
        let password = logon.password.clone();

        {
            let mut state = self.state.borrow_mut();

            if !state.enabled() {
                error!("Session is not enabled for logon");
                self.disconnect(&mut state, DisconnectReason::InvalidLogonState);
                return Ok(Some(DisconnectReason::InvalidLogonState));
            }

            if reset_seq_num_flag {
                state.set_reset_received(true);
                info!("Logon contains ResetSeqNumFlag=Y, resetting sequence numbers to 1");
                if !state.reset_sent() {
                    state
                        .reset_sequence_numbers()
                        .map_err(VerifyError::store_fatal)?;
                }
            }

            if state.should_send_logon() && !state.reset_received() {
                error!("Received logon response before sending request");
                self.disconnect(&mut state, DisconnectReason::InvalidLogonState);
                return Ok(Some(DisconnectReason::InvalidLogonState));
            }

            if !state.initiate() && self.session_settings.reset_seq_num_on_logon {
                state
                    .reset_sequence_numbers()
                    .map_err(VerifyError::store_fatal)?;
            }
        }

        // acceptor-side credential validation
        let is_initiator = self.state.borrow().initiate();
        if !is_initiator {
            if let Some(expected) = &self.session_settings.credentials {
                let presented = username.as_deref().zip(password.as_deref());
                if presented
                    != Some((
                        expected.username.as_fix_str(),
                        expected.password.as_fix_str(),
                    ))
                {
                    warn!("Logon credentials rejected");
                    return Err(VerifyError::Logout {
                        text: Some(FixString::from_ascii_lossy(
                            b"invalid credentials".to_vec(),
                        )),
                        disconnect: true,
                        reason: DisconnectReason::InvalidCredentials,
                    });
                }
            }
        }

        self.verify(&msg, true)?;
        self.persist_inbound(msg_seq_num, raw)?;

        {
            let mut state = self.state.borrow_mut();
            state.set_logon_received(true);

            if !state.initiate() || (state.reset_received() && !state.reset_sent()) {
                info!("Received logon request");
                state.set_heart_bt_int(heart_bt_int);
            } else {
                info!("Received logon response");
                let configured = self.settings.heart_bt_int.as_secs() as Int;
                if heart_bt_int != configured {
                    warn!(
                        "peer HeartBtInt {heart_bt_int} differs from configured {configured}, \
                         adopting peer value"
                    );
                }
                state.set_heart_bt_int(heart_bt_int);
            }
        }

        if !is_initiator {
            self.send_logon_response();
            info!("Responding to logon request");
        }

        let mut resend_for = None;
        {
            let mut state = self.state.borrow_mut();
            state.set_reset_sent(false);
            state.set_reset_received(false);

            if msg_seq_num > state.next_target_msg_seq_num() {
                // accept and recover the gap; the logon itself is consumed
                state.mark_seq_num_consumed(msg_seq_num);
                resend_for = Some(msg_seq_num);
            } else {
                state
                    .incr_next_target_msg_seq_num()
                    .map_err(VerifyError::store_fatal)?;
            }
        }
        if let Some(msg_seq_num) = resend_for {
            self.send_resend_request(msg_seq_num);
        }

        self.apply_status(if is_initiator {
            StatusEvent::LogonAccepted
        } else {
            StatusEvent::LogonReceived
        })
        .await;

        let logged_on = {
            let mut state = self.state.borrow_mut();
            let logged_on = Self::is_logged_on(&state);
            if logged_on {
                state.mark_logged_on();
                state.clear_test_requests();
            }
            logged_on
        };

        self.emit_admin_in(msg).await;
        if logged_on {
            self.emitter
                .send(EventInner::Logon(
                    self.session_id().clone(),
                    Some(self.sender.clone()),
                ))
                .await;
        }

        Ok(None)
    }

    async fn on_app_message(
        &self,
        msg: Box<FixMessage>,
        raw: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        self.verify(&msg, true)?;
        self.persist_inbound(msg.header.msg_seq_num, raw)?;
        self.incr_next_target()?;

        self.emitter
            .send(EventInner::AppMsgIn(
                Some(msg),
                Some(InputResponder::new(self.sender.clone())),
            ))
            .await;
        Ok(())
    }

    async fn emit_admin_in(&self, msg: Box<FixMessage>) {
        self.emitter
            .send(EventInner::AdmMsgIn(
                Some(msg),
                Some(InputResponder::new(self.sender.clone())),
            ))
            .await;
    }

    async fn apply_status(&self, event: StatusEvent) {
        let change = self.state.borrow_mut().apply_status_event(event);
        if let Some((old, new)) = change {
            self.emitter
                .send(EventInner::StatusChanged(self.session_id().clone(), old, new))
                .await;
        }
    }

    ////

    pub(crate) fn send_logon_request(&self, state: &mut State<S>) {
        let reset = self.session_settings.reset_seq_num_on_logon;
        if reset {
            info!("resetting sequence numbers before logon");
            if let Err(err) = state.reset_sequence_numbers() {
                error!("message store failure: {err}");
                self.disconnect(state, DisconnectReason::StoreError);
                return;
            }
            state.set_reset_sent(true);
        }
        let logon = Body::Logon(fixlink_core::message::Logon {
            encrypt_method: 0,
            heart_bt_int: self.settings.heart_bt_int.as_secs() as Int,
            reset_seq_num_flag: reset.then_some(true),
            username: self
                .session_settings
                .credentials
                .as_ref()
                .map(|c| c.username.clone()),
            password: self
                .session_settings
                .credentials
                .as_ref()
                .map(|c| c.password.clone()),
        });
        state.set_logon_sent(true);
        state.set_last_sent_time(Instant::now());
        self.send_body(logon);
    }

    fn send_logon_response(&self) {
        let (heart_bt_int, reset) = {
            let mut state = self.state.borrow_mut();
            state.set_last_received_time(Instant::now());
            state.set_logon_sent(true);
            (state.heart_bt_int(), state.reset_received())
        };
        self.send_body(Body::Logon(fixlink_core::message::Logon {
            encrypt_method: 0,
            heart_bt_int,
            reset_seq_num_flag: reset.then_some(true),
            username: None,
            password: None,
        }));
    }

    pub(crate) fn send_logout(&self, text: Option<FixString>) {
        if self.state.borrow().logout_sent() {
            debug!("logout already sent");
            return;
        }
        if self.state.borrow().status() == SessionStatus::Active {
            self.state
                .borrow_mut()
                .apply_status_event(StatusEvent::LogoutRequested);
        }
        let text = text.or_else(|| self.state.borrow().logout_reason().cloned());
        self.send_body(Body::Logout(Logout { text }));
        self.state.borrow_mut().set_logout_sent(true);
    }

    fn send_reject(
        &self,
        msg_type: &MsgType,
        msg_seq_num: SeqNum,
        reason: SessionRejectReason,
        tag: Option<TagNum>,
        text: Option<FixString>,
    ) {
        if *msg_type != MsgType::Logon
            && *msg_type != MsgType::SequenceReset
            && msg_seq_num == self.state.borrow().next_target_msg_seq_num()
        {
            if let Err(err) = self.state.borrow_mut().incr_next_target_msg_seq_num() {
                error!("message store failure: {err}");
            }
        }

        info!(
            "Message {} Rejected: {:?} (tag={:?})",
            msg_seq_num, reason, tag
        );

        self.send_body(Body::Reject(Reject {
            ref_seq_num: msg_seq_num,
            ref_tag_id: tag.map(Int::from),
            ref_msg_type: Some(msg_type.as_fix_str().to_owned()),
            session_reject_reason: Some(reason),
            text: text.or_else(|| Some(FixString::from_ascii_lossy(reason.text().into()))),
        }));
    }

    fn send_resend_request(&self, msg_seq_num: SeqNum) {
        let begin_seq_no = self.state.borrow().next_target_msg_seq_num();
        let end_seq_no = msg_seq_num - 1;
        info!("requesting resend of [{begin_seq_no}, {end_seq_no}]");

        self.send_body(Body::ResendRequest(ResendRequest {
            begin_seq_no,
            end_seq_no,
        }));

        self.state
            .borrow_mut()
            .set_resend_range(Some(begin_seq_no..=end_seq_no));
    }

    /// SequenceReset-GapFill occupying `seq_num` and pointing the peer at
    /// `new_seq_no`.
    fn send_gap_fill(&self, seq_num: SeqNum, new_seq_no: SeqNum) {
        info!(seq_num, new_seq_no, "sending gap fill");
        let mut header = new_header();
        header.msg_seq_num = seq_num;
        header.poss_dup_flag = Some(true);
        let _ = self.sender.send_raw(Box::new(FixMessage {
            header,
            body: Body::SequenceReset(SequenceReset {
                gap_fill_flag: Some(true),
                new_seq_no,
            }),
            trailer: new_trailer(),
        }));
    }

    fn send_heartbeat(&self, test_req_id: Option<FixString>) {
        self.send_body(Body::Heartbeat(Heartbeat { test_req_id }));
    }

    fn send_test_request(&self) {
        // Use current time as TestReqID as recommended in FIX Session
        // Protocol (FIX) Version 1.1 Errata March 2008
        let test_req_id = FixString::from_ascii_lossy(
            format!("{}", Utc::now().format("%Y%m%d-%H:%M:%S.%f")).into_bytes(),
        );
        self.state
            .borrow_mut()
            .register_test_request(test_req_id.clone());
        self.send_body(Body::TestRequest(TestRequest { test_req_id }));
    }

    fn send_body(&self, body: Body) {
        let _ = self.sender.send_raw(Box::new(FixMessage {
            header: new_header(),
            body,
            trailer: new_trailer(),
        }));
    }

    ////

    /// Outbound hook: hand the message to the application event stream
    /// before serialization. Returns the (possibly replaced) message to
    /// serialize, or `None` when it was withdrawn.
    pub(crate) async fn on_message_out(&self, msg: Box<FixMessage>) -> Option<Box<FixMessage>> {
        let msg_cat = msg.msg_cat();
        let msg_seq_num = msg.header.msg_seq_num;

        {
            let state = self.state.borrow();
            let logged_on = Self::is_logged_on(&state);
            match msg_cat {
                MsgCat::Admin => {
                    let drives_transition = matches!(
                        msg.msg_type(),
                        MsgType::Logon
                            | MsgType::Logout
                            | MsgType::ResendRequest
                            | MsgType::SequenceReset
                            | MsgType::Reject
                    );
                    if !drives_transition && !logged_on {
                        debug!("dropping {:?}, session not active", msg.msg_type());
                        return None;
                    }
                }
                MsgCat::App => {
                    if !logged_on {
                        error!("dropping application message, session not active");
                        return None;
                    }
                }
            }
        }

        // administrative messages are generated internally, only
        // application traffic passes the pre-send hook
        if msg_cat == MsgCat::Admin || self.emitter.is_closed() {
            return Some(msg);
        }

        let (tx, rx) = oneshot::channel();
        self.emitter
            .send(EventInner::AppMsgOut(Some(msg), Responder::new(tx)))
            .await;

        match rx.await {
            Ok(OutboundVerdict::Send(msg)) => Some(msg),
            Ok(OutboundVerdict::GapFill(msg)) => {
                let seq_num = msg.header.msg_seq_num;
                if seq_num == 0 {
                    // not sequenced yet, withdrawing leaves no hole
                    None
                } else {
                    Some(self.gap_fill_replacement(seq_num))
                }
            }
            Err(_) => {
                // do_not_send; a sequenced message leaves a hole that must
                // be filled
                if msg_seq_num == 0 {
                    None
                } else {
                    Some(self.gap_fill_replacement(msg_seq_num))
                }
            }
        }
    }

    fn gap_fill_replacement(&self, seq_num: SeqNum) -> Box<FixMessage> {
        info!(seq_num, "message withdrawn, substituting gap fill");
        let mut header = new_header();
        header.msg_seq_num = seq_num;
        header.poss_dup_flag = Some(true);
        Box::new(FixMessage {
            header,
            body: Body::SequenceReset(SequenceReset {
                gap_fill_flag: Some(true),
                new_seq_no: seq_num + 1,
            }),
            trailer: new_trailer(),
        })
    }

    /// Fills the header, serializes and persists one outbound message.
    /// Persistence strictly precedes the write; the caller only gets bytes
    /// for the wire after the store accepted them.
    pub(crate) fn encode_outbound(&self, mut msg: Box<FixMessage>) -> Result<Vec<u8>, String> {
        let mut state = self.state.borrow_mut();

        let header = &mut msg.header;
        if header.begin_string.is_empty() {
            header.begin_string = self.session_id().begin_string().to_owned();
        }
        if header.sender_comp_id.is_empty() {
            header.sender_comp_id = self.session_id().sender_comp_id().to_owned();
        }
        if header.target_comp_id.is_empty() {
            header.target_comp_id = self.session_id().target_comp_id().to_owned();
        }
        if header.sending_time == UtcTimestamp::MIN_UTC {
            header.sending_time = Utc::now();
        }
        if header.msg_seq_num == 0 {
            header.msg_seq_num = state.next_sender_msg_seq_num();
            state
                .incr_next_sender_msg_seq_num()
                .map_err(|err| err.to_string())?;
        }

        let buffer = msg.serialize();
        if !msg.header.poss_dup_flag.unwrap_or(false) && self.session_settings.persist {
            state
                .store_message(msg.header.msg_seq_num, Direction::Outbound, &buffer)
                .map_err(|err| err.to_string())?;
        }
        state.set_last_sent_time(Instant::now());

        debug!(
            "Encoded raw data: {}",
            String::from_utf8_lossy(&buffer).replace('\x01', "|")
        );
        Ok(buffer)
    }

    ////

    pub async fn on_decode_error(&self, error: DecodeError) -> Option<DisconnectReason> {
        trace!("on_decode_error");
        error!(decode_error = %error);

        let disconnect = match &error {
            // Failed to frame the message; the input stream already
            // resynchronized. Processing of the next valid message will
            // detect any sequence gap and request a resend.
            DecodeError::GarbledMessage(_) => None,
            DecodeError::Logout => {
                self.send_logout(Some(FixString::from_ascii_lossy(
                    b"MsgSeqNum missing".to_vec(),
                )));
                Some(self.force_disconnect(DisconnectReason::MsgSeqNumNotFound))
            }
            DecodeError::Reject {
                msg_type,
                seq_num,
                tag,
                reason,
            } => {
                let msg_type = msg_type
                    .as_ref()
                    .map(|value| MsgType::from_fix_str(value))
                    .unwrap_or(MsgType::Application(FixString::new()));
                self.send_reject(&msg_type, *seq_num, *reason, *tag, None);
                None
            }
        };

        self.emitter
            .send(EventInner::DecodeError(self.session_id().clone(), error))
            .await;
        disconnect
    }

    pub async fn on_io_error(&self, error: std::io::Error) -> DisconnectReason {
        error!(%error, "I/O error");
        DisconnectReason::IoError
    }

    /// Inbound silence. Returns `true` when the grace period is exhausted
    /// and the connection should be torn down.
    pub async fn on_in_timeout(&self) -> bool {
        trace!("on_in_timeout");
        let state = self.state.borrow();
        if !Self::is_logged_on(&state) {
            warn!("no messages before logon completion, closing");
            return true;
        }
        if state.logout_sent() {
            // logout timeout handling owns the clock now
            return false;
        }
        if state.outstanding_test_requests() >= self.settings.test_request_grace as usize {
            error!("peer did not answer TestRequest, considering it dead");
            return true;
        }
        drop(state);
        self.send_test_request();
        false
    }

    /// Outbound silence; keep the session alive with a Heartbeat.
    pub async fn on_out_timeout(&self) {
        trace!("on_out_timeout");
        if Self::is_logged_on(&self.state.borrow()) {
            self.send_heartbeat(None);
        }
    }

    ////

    /// Arms the logoff waiter and sends a Logout. The returned receiver
    /// completes when the peer confirms; dropping it is safe.
    pub(crate) fn initiate_logoff(&self, text: Option<FixString>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.state.borrow_mut().set_logoff_waiter(tx);
        self.send_logout(text);
        rx
    }

    pub(crate) fn logout_timeout(&self) -> Option<Duration> {
        if self.state.borrow().logout_sent() {
            Some(self.settings.logout_timeout)
        } else {
            None
        }
    }

    /// Bounded wait for the Logon response after our Logon went out.
    pub(crate) fn logon_deadline(&self) -> Option<Duration> {
        let state = self.state.borrow();
        if state.logon_sent() && !state.logon_received() {
            Some(self.settings.logon_timeout)
        } else {
            None
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        let negotiated = self.state.borrow().heart_bt_int();
        if negotiated > 0 {
            Duration::from_secs(negotiated as u64)
        } else {
            self.settings.heart_bt_int
        }
    }

    fn force_disconnect(&self, reason: DisconnectReason) -> DisconnectReason {
        self.disconnect(&mut self.state.borrow_mut(), reason);
        reason
    }

    pub(crate) fn disconnect(&self, state: &mut State<S>, reason: DisconnectReason) {
        if state.disconnected() {
            return;
        }
        info!(?reason, "disconnecting");

        state.set_logon_received(false);
        state.set_logon_sent(false);
        state.set_logout_sent(false);
        state.set_reset_received(false);
        state.set_reset_sent(false);
        state.set_logout_reason(None);
        state.set_resend_range(None);
        state.clear_queue();
        state.clear_test_requests();
        state.drop_logoff_waiter();
        if self.session_settings.reset_on_disconnect {
            if let Err(err) = state.reset_sequence_numbers() {
                error!("message store failure during disconnect: {err}");
            }
        }
        state.set_disconnected(true);

        state.apply_status_event(status_event_for(reason));
        self.sender.disconnect(reason);
    }

    pub(crate) async fn emit_logout(&self, reason: DisconnectReason) {
        self.emitter
            .send(EventInner::Logout(self.session_id().clone(), reason))
            .await;
    }
}

fn status_event_for(reason: DisconnectReason) -> StatusEvent {
    match reason {
        DisconnectReason::LocalRequestedLogout | DisconnectReason::RemoteRequestedLogout => {
            StatusEvent::LogoutConfirmed
        }
        DisconnectReason::Disconnected
        | DisconnectReason::IoError
        | DisconnectReason::TestRequestTimeout => StatusEvent::NetworkError,
        DisconnectReason::LogonTimeout | DisconnectReason::LogoutTimeout => StatusEvent::Timeout,
        DisconnectReason::UserForcedDisconnect
        | DisconnectReason::MsgSeqNumNotFound
        | DisconnectReason::MsgSeqNumTooLow
        | DisconnectReason::InvalidLogonState
        | DisconnectReason::CompIdProblem
        | DisconnectReason::InvalidCredentials
        | DisconnectReason::ProtocolViolation
        | DisconnectReason::StoreError => StatusEvent::FatalError,
    }
}

pub(crate) fn format_soh(data: &[u8]) -> String {
    String::from_utf8_lossy(data).replace('\x01', "|")
}
