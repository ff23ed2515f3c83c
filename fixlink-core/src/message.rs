//! Session-level message model.
//!
//! The seven administrative message types are fully typed; every other
//! MsgType is carried as an [`Application`](Body::Application) body whose
//! fields stay an ordered tag=value list. Repeating groups inside
//! application bodies pass through untouched.

use crate::fields::{Boolean, FixStr, FixString, Int, SeqNum, TagNum, UtcTimestamp};

/// Field delimiter within a FIX message.
pub const SOH: u8 = 0x01;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MsgCat {
    Admin,
    App,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum MsgType {
    Heartbeat,
    TestRequest,
    ResendRequest,
    Reject,
    SequenceReset,
    Logout,
    Logon,
    /// Any message type outside the session layer.
    Application(FixString),
}

impl MsgType {
    pub fn from_fix_str(value: &FixStr) -> MsgType {
        match value.as_bytes() {
            b"0" => MsgType::Heartbeat,
            b"1" => MsgType::TestRequest,
            b"2" => MsgType::ResendRequest,
            b"3" => MsgType::Reject,
            b"4" => MsgType::SequenceReset,
            b"5" => MsgType::Logout,
            b"A" => MsgType::Logon,
            _ => MsgType::Application(value.to_owned()),
        }
    }

    pub fn as_fix_str(&self) -> &FixStr {
        let bytes: &[u8] = match self {
            MsgType::Heartbeat => b"0",
            MsgType::TestRequest => b"1",
            MsgType::ResendRequest => b"2",
            MsgType::Reject => b"3",
            MsgType::SequenceReset => b"4",
            MsgType::Logout => b"5",
            MsgType::Logon => b"A",
            MsgType::Application(value) => return value.as_fix_str(),
        };
        // SAFETY: literals above are printable ASCII
        unsafe { FixStr::from_ascii_unchecked(bytes) }
    }

    pub fn msg_cat(&self) -> MsgCat {
        match self {
            MsgType::Application(_) => MsgCat::App,
            _ => MsgCat::Admin,
        }
    }
}

/// SessionRejectReason<373> values emitted by the session layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionRejectReason {
    InvalidTagNumber,
    RequiredTagMissing,
    TagSpecifiedWithoutAValue,
    ValueIsIncorrect,
    IncorrectDataFormat,
    CompIdProblem,
    SendingTimeAccuracyProblem,
    InvalidMsgType,
    Other,
}

impl SessionRejectReason {
    pub fn as_tag_value(&self) -> Int {
        match self {
            SessionRejectReason::InvalidTagNumber => 0,
            SessionRejectReason::RequiredTagMissing => 1,
            SessionRejectReason::TagSpecifiedWithoutAValue => 4,
            SessionRejectReason::ValueIsIncorrect => 5,
            SessionRejectReason::IncorrectDataFormat => 6,
            SessionRejectReason::CompIdProblem => 9,
            SessionRejectReason::SendingTimeAccuracyProblem => 10,
            SessionRejectReason::InvalidMsgType => 11,
            SessionRejectReason::Other => 99,
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            SessionRejectReason::InvalidTagNumber => "Invalid tag number",
            SessionRejectReason::RequiredTagMissing => "Required tag missing",
            SessionRejectReason::TagSpecifiedWithoutAValue => "Tag specified without a value",
            SessionRejectReason::ValueIsIncorrect => "Value is incorrect",
            SessionRejectReason::IncorrectDataFormat => "Incorrect data format for value",
            SessionRejectReason::CompIdProblem => "CompID problem",
            SessionRejectReason::SendingTimeAccuracyProblem => "SendingTime accuracy problem",
            SessionRejectReason::InvalidMsgType => "Invalid MsgType",
            SessionRejectReason::Other => "Other",
        }
    }
}

/// Standard header. BeginString<8> and BodyLength<9> frame the message;
/// BodyLength and CheckSum<10> are recomputed on serialization.
#[derive(Clone, Debug)]
pub struct Header {
    pub begin_string: FixString,
    pub sender_comp_id: FixString,
    pub target_comp_id: FixString,
    pub msg_seq_num: SeqNum,
    pub poss_dup_flag: Option<Boolean>,
    pub poss_resend: Option<Boolean>,
    pub sending_time: UtcTimestamp,
    pub orig_sending_time: Option<UtcTimestamp>,
}

#[derive(Clone, Debug, Default)]
pub struct Trailer {
    /// Ignored on serialization; always recomputed.
    pub check_sum: FixString,
}

/// Ordered tag=value list; the body of an application message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldMap {
    fields: Vec<(TagNum, FixString)>,
}

impl FieldMap {
    pub fn new() -> FieldMap {
        FieldMap { fields: Vec::new() }
    }

    pub fn push(&mut self, tag: TagNum, value: FixString) {
        self.fields.push((tag, value));
    }

    /// First value for `tag`, if any.
    pub fn get(&self, tag: TagNum) -> Option<&FixStr> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_fix_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (TagNum, &FixStr)> {
        self.fields.iter().map(|(t, v)| (*t, v.as_fix_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(TagNum, FixString)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (TagNum, FixString)>>(iter: I) -> FieldMap {
        FieldMap {
            fields: iter.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Logon {
    /// EncryptMethod<98>, always 0 (none) in practice.
    pub encrypt_method: Int,
    /// HeartBtInt<108> in seconds.
    pub heart_bt_int: Int,
    pub reset_seq_num_flag: Option<Boolean>,
    pub username: Option<FixString>,
    pub password: Option<FixString>,
}

#[derive(Clone, Debug, Default)]
pub struct Logout {
    pub text: Option<FixString>,
}

#[derive(Clone, Debug, Default)]
pub struct Heartbeat {
    pub test_req_id: Option<FixString>,
}

#[derive(Clone, Debug)]
pub struct TestRequest {
    pub test_req_id: FixString,
}

#[derive(Clone, Debug)]
pub struct ResendRequest {
    pub begin_seq_no: SeqNum,
    /// 0 means "up to and including the latest".
    pub end_seq_no: SeqNum,
}

#[derive(Clone, Debug)]
pub struct SequenceReset {
    pub gap_fill_flag: Option<Boolean>,
    pub new_seq_no: SeqNum,
}

#[derive(Clone, Debug)]
pub struct Reject {
    pub ref_seq_num: SeqNum,
    pub ref_tag_id: Option<Int>,
    pub ref_msg_type: Option<FixString>,
    pub session_reject_reason: Option<SessionRejectReason>,
    pub text: Option<FixString>,
}

#[derive(Clone, Debug)]
pub enum Body {
    Heartbeat(Heartbeat),
    TestRequest(TestRequest),
    ResendRequest(ResendRequest),
    Reject(Reject),
    SequenceReset(SequenceReset),
    Logout(Logout),
    Logon(Logon),
    Application {
        msg_type: FixString,
        fields: FieldMap,
    },
}

impl Body {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Body::Heartbeat(_) => MsgType::Heartbeat,
            Body::TestRequest(_) => MsgType::TestRequest,
            Body::ResendRequest(_) => MsgType::ResendRequest,
            Body::Reject(_) => MsgType::Reject,
            Body::SequenceReset(_) => MsgType::SequenceReset,
            Body::Logout(_) => MsgType::Logout,
            Body::Logon(_) => MsgType::Logon,
            Body::Application { msg_type, .. } => MsgType::Application(msg_type.clone()),
        }
    }

    pub fn msg_cat(&self) -> MsgCat {
        match self {
            Body::Application { .. } => MsgCat::App,
            _ => MsgCat::Admin,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FixMessage {
    pub header: Header,
    pub body: Body,
    pub trailer: Trailer,
}

impl FixMessage {
    pub fn msg_type(&self) -> MsgType {
        self.body.msg_type()
    }

    pub fn msg_cat(&self) -> MsgCat {
        self.body.msg_cat()
    }
}
