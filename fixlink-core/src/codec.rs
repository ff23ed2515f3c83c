//! Tag=value codec: streaming framing, message decoding and serialization.
//!
//! Framing recognizes `8=<BeginString>\x019=<BodyLength>\x01`, consumes
//! BodyLength bytes of body and the 7-byte `10=NNN\x01` trailer.
//! [`RawMessageError::Incomplete`] signals that more input is needed, so
//! the functions here can run directly against a growing read buffer.

use memchr::memchr;
use tracing::debug;

use crate::{
    fields::{timestamp, FixStr, FixString, Int, SeqNum, TagNum},
    message::{
        Body, FieldMap, FixMessage, Header, Heartbeat, Logon, Logout, MsgType, Reject,
        ResendRequest, SequenceReset, SessionRejectReason, TestRequest, Trailer, SOH,
    },
};

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RawMessageError {
    #[error("need more input")]
    Incomplete,
    #[error("input does not start with a message")]
    NotAMessage,
    #[error("invalid BodyLength<9>")]
    BadBodyLength,
    #[error("invalid CheckSum<10> format")]
    BadCheckSum,
}

/// A framed but not yet decoded message.
#[derive(Debug)]
pub struct RawMessage<'a> {
    pub begin_string: &'a FixStr,
    /// Everything between the SOH after BodyLength<9> and `10=`.
    pub body: &'a [u8],
    /// CheckSum<10> as declared on the wire.
    pub check_sum: u8,
    /// Sum of all bytes preceding the CheckSum field, mod 256.
    pub computed_check_sum: u8,
}

/// Extracts one message frame from `input`.
///
/// On success returns the unconsumed leftover together with the frame.
pub fn raw_message(input: &[u8]) -> Result<(&[u8], RawMessage<'_>), RawMessageError> {
    if input.len() < 2 {
        return if b"8=".starts_with(input) {
            Err(RawMessageError::Incomplete)
        } else {
            Err(RawMessageError::NotAMessage)
        };
    }
    if &input[..2] != b"8=" {
        return Err(RawMessageError::NotAMessage);
    }
    let soh1 = memchr(SOH, input).ok_or(RawMessageError::Incomplete)?;
    let begin_string =
        FixStr::from_ascii(&input[2..soh1]).map_err(|_| RawMessageError::NotAMessage)?;

    let rest = &input[soh1 + 1..];
    if rest.len() < 2 {
        return if b"9=".starts_with(rest) {
            Err(RawMessageError::Incomplete)
        } else {
            Err(RawMessageError::BadBodyLength)
        };
    }
    if &rest[..2] != b"9=" {
        return Err(RawMessageError::BadBodyLength);
    }
    let soh2 = memchr(SOH, rest).ok_or(RawMessageError::Incomplete)?;
    let body_len = parse_digits(&rest[2..soh2]).ok_or(RawMessageError::BadBodyLength)?;

    let body_start = soh1 + 1 + soh2 + 1;
    let body_end = body_start
        .checked_add(body_len as usize)
        .ok_or(RawMessageError::BadBodyLength)?;
    // body plus "10=NNN\x01"
    if input.len() < body_end + 7 {
        return Err(RawMessageError::Incomplete);
    }
    let trailer = &input[body_end..body_end + 7];
    if &trailer[..3] != b"10=" || trailer[6] != SOH {
        return Err(RawMessageError::BadCheckSum);
    }
    let check_sum = parse_digits(&trailer[3..6]).ok_or(RawMessageError::BadCheckSum)?;
    if check_sum > u8::MAX as u32 {
        return Err(RawMessageError::BadCheckSum);
    }

    let computed_check_sum = input[..body_end]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));

    Ok((
        &input[body_end + 7..],
        RawMessage {
            begin_string,
            body: &input[body_start..body_end],
            check_sum: check_sum as u8,
            computed_check_sum,
        },
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Framing-level damage; the message cannot be attributed to a sequence
    /// number and is dropped.
    #[error("garbled message: {0}")]
    GarbledMessage(String),
    /// MsgSeqNum<34> missing; the FIX session protocol requires a Logout.
    #[error("MsgSeqNum missing")]
    Logout,
    /// A well-framed message with an invalid field; answered with Reject<3>.
    #[error("{reason:?} (tag={tag:?})")]
    Reject {
        msg_type: Option<FixString>,
        seq_num: SeqNum,
        tag: Option<TagNum>,
        reason: SessionRejectReason,
    },
}

struct FieldIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = Result<(TagNum, &'a [u8]), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let soh = match memchr(SOH, self.buf) {
            Some(idx) => idx,
            None => {
                self.buf = &[];
                return Some(Err(DecodeError::GarbledMessage(
                    "field not terminated with SOH".into(),
                )));
            }
        };
        let field = &self.buf[..soh];
        self.buf = &self.buf[soh + 1..];
        let eq = match memchr(b'=', field) {
            Some(idx) => idx,
            None => {
                return Some(Err(DecodeError::GarbledMessage(
                    "field without '=' separator".into(),
                )))
            }
        };
        let tag = match parse_digits(&field[..eq]) {
            Some(tag) if tag <= TagNum::MAX as u32 => tag as TagNum,
            _ => {
                return Some(Err(DecodeError::GarbledMessage(
                    "field with malformed tag number".into(),
                )))
            }
        };
        Some(Ok((tag, &field[eq + 1..])))
    }
}

fn parse_digits(buf: &[u8]) -> Option<u32> {
    if buf.is_empty() || buf.len() > 9 {
        return None;
    }
    let mut value: u32 = 0;
    for b in buf {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + u32::from(b - b'0');
    }
    Some(value)
}

fn parse_int(value: &FixStr) -> Option<Int> {
    value.as_utf8().parse().ok()
}

fn parse_seq_num(value: &FixStr) -> Option<SeqNum> {
    parse_digits(value.as_bytes())
}

fn parse_boolean(value: &FixStr) -> Option<bool> {
    match value.as_bytes() {
        b"Y" => Some(true),
        b"N" => Some(false),
        _ => None,
    }
}

impl SessionRejectReason {
    fn from_tag_value(value: Int) -> SessionRejectReason {
        match value {
            0 => SessionRejectReason::InvalidTagNumber,
            1 => SessionRejectReason::RequiredTagMissing,
            4 => SessionRejectReason::TagSpecifiedWithoutAValue,
            5 => SessionRejectReason::ValueIsIncorrect,
            6 => SessionRejectReason::IncorrectDataFormat,
            9 => SessionRejectReason::CompIdProblem,
            10 => SessionRejectReason::SendingTimeAccuracyProblem,
            11 => SessionRejectReason::InvalidMsgType,
            _ => SessionRejectReason::Other,
        }
    }
}

/// Decoder state threaded through header and body extraction so rejects can
/// reference the offending message.
struct Decoder {
    msg_type: FixString,
    seq_num: SeqNum,
    fields: FieldMap,
}

impl Decoder {
    fn reject(&self, tag: Option<TagNum>, reason: SessionRejectReason) -> DecodeError {
        DecodeError::Reject {
            msg_type: Some(self.msg_type.clone()),
            seq_num: self.seq_num,
            tag,
            reason,
        }
    }

    fn required(&self, tag: TagNum) -> Result<FixString, DecodeError> {
        self.optional(tag)
            .ok_or_else(|| self.reject(Some(tag), SessionRejectReason::RequiredTagMissing))
    }

    fn optional(&self, tag: TagNum) -> Option<FixString> {
        self.fields.get(tag).map(|v| v.to_owned())
    }

    fn required_seq_num(&self, tag: TagNum) -> Result<SeqNum, DecodeError> {
        parse_seq_num(&self.required(tag)?)
            .ok_or_else(|| self.reject(Some(tag), SessionRejectReason::IncorrectDataFormat))
    }

    fn optional_int(&self, tag: TagNum) -> Result<Option<Int>, DecodeError> {
        match self.optional(tag) {
            Some(value) => parse_int(&value)
                .map(Some)
                .ok_or_else(|| self.reject(Some(tag), SessionRejectReason::IncorrectDataFormat)),
            None => Ok(None),
        }
    }

    fn optional_boolean(&self, tag: TagNum) -> Result<Option<bool>, DecodeError> {
        match self.optional(tag) {
            Some(value) => parse_boolean(&value)
                .map(Some)
                .ok_or_else(|| self.reject(Some(tag), SessionRejectReason::IncorrectDataFormat)),
            None => Ok(None),
        }
    }
}

impl FixMessage {
    /// Decodes a single complete message.
    ///
    /// Intended for tests and tooling; connection code frames with
    /// [`raw_message`] first and calls [`FixMessage::from_raw_message`].
    pub fn from_bytes(input: &[u8]) -> Result<Box<FixMessage>, DecodeError> {
        let (_, raw) = raw_message(input)
            .map_err(|err| DecodeError::GarbledMessage(format!("framing failed: {err}")))?;
        FixMessage::from_raw_message(raw)
    }

    pub fn from_raw_message(raw: RawMessage<'_>) -> Result<Box<FixMessage>, DecodeError> {
        if raw.check_sum != raw.computed_check_sum {
            debug!(
                declared = raw.check_sum,
                computed = raw.computed_check_sum,
                "CheckSum mismatch"
            );
            return Err(DecodeError::GarbledMessage(format!(
                "CheckSum mismatch, declared {:03}, computed {:03}",
                raw.check_sum, raw.computed_check_sum
            )));
        }

        let mut iter = FieldIter { buf: raw.body };
        let msg_type = match iter.next() {
            Some(Ok((35, value))) if !value.is_empty() => {
                FixString::from_ascii(value.to_vec()).map_err(|_| {
                    DecodeError::GarbledMessage("MsgType with non-ASCII value".into())
                })?
            }
            Some(Err(err)) => return Err(err),
            _ => {
                return Err(DecodeError::GarbledMessage(
                    "MsgType<35> not the first body field".into(),
                ))
            }
        };

        let mut decoder = Decoder {
            msg_type,
            seq_num: 0,
            fields: FieldMap::new(),
        };

        let mut msg_seq_num = None;
        let mut sender_comp_id = None;
        let mut target_comp_id = None;
        let mut sending_time_raw = None;
        let mut orig_sending_time_raw = None;
        let mut poss_dup_raw = None;
        let mut poss_resend_raw = None;

        for field in iter {
            let (tag, value) = field?;
            if value.is_empty() {
                return Err(
                    decoder.reject(Some(tag), SessionRejectReason::TagSpecifiedWithoutAValue)
                );
            }
            let value = FixString::from_ascii(value.to_vec())
                .map_err(|_| decoder.reject(Some(tag), SessionRejectReason::IncorrectDataFormat))?;
            match tag {
                34 => {
                    let seq_num = parse_seq_num(&value).ok_or_else(|| {
                        decoder.reject(Some(34), SessionRejectReason::IncorrectDataFormat)
                    })?;
                    decoder.seq_num = seq_num;
                    msg_seq_num = Some(seq_num);
                }
                49 => sender_comp_id = Some(value),
                56 => target_comp_id = Some(value),
                52 => sending_time_raw = Some(value),
                122 => orig_sending_time_raw = Some(value),
                43 => poss_dup_raw = Some(value),
                97 => poss_resend_raw = Some(value),
                _ => decoder.fields.push(tag, value),
            }
        }

        // FIX session rule: a message without MsgSeqNum cannot be recovered
        // through a resend, the session must be logged out.
        let msg_seq_num = msg_seq_num.ok_or(DecodeError::Logout)?;

        let sender_comp_id = sender_comp_id
            .ok_or_else(|| decoder.reject(Some(49), SessionRejectReason::RequiredTagMissing))?;
        let target_comp_id = target_comp_id
            .ok_or_else(|| decoder.reject(Some(56), SessionRejectReason::RequiredTagMissing))?;
        let sending_time_raw = sending_time_raw
            .ok_or_else(|| decoder.reject(Some(52), SessionRejectReason::RequiredTagMissing))?;
        let sending_time = timestamp::parse(&sending_time_raw)
            .ok_or_else(|| decoder.reject(Some(52), SessionRejectReason::IncorrectDataFormat))?;
        let orig_sending_time = match orig_sending_time_raw {
            Some(raw) => Some(timestamp::parse(&raw).ok_or_else(|| {
                decoder.reject(Some(122), SessionRejectReason::IncorrectDataFormat)
            })?),
            None => None,
        };
        let poss_dup_flag = match poss_dup_raw {
            Some(raw) => Some(parse_boolean(&raw).ok_or_else(|| {
                decoder.reject(Some(43), SessionRejectReason::IncorrectDataFormat)
            })?),
            None => None,
        };
        let poss_resend = match poss_resend_raw {
            Some(raw) => Some(parse_boolean(&raw).ok_or_else(|| {
                decoder.reject(Some(97), SessionRejectReason::IncorrectDataFormat)
            })?),
            None => None,
        };

        let header = Header {
            begin_string: raw.begin_string.to_owned(),
            sender_comp_id,
            target_comp_id,
            msg_seq_num,
            poss_dup_flag,
            poss_resend,
            sending_time,
            orig_sending_time,
        };

        let body = decode_body(&decoder)?;

        Ok(Box::new(FixMessage {
            header,
            body,
            trailer: Trailer {
                check_sum: FixString::from_ascii_lossy(
                    format!("{:03}", raw.check_sum).into_bytes(),
                ),
            },
        }))
    }
}

fn decode_body(decoder: &Decoder) -> Result<Body, DecodeError> {
    let body = match MsgType::from_fix_str(decoder.msg_type.as_fix_str()) {
        MsgType::Heartbeat => Body::Heartbeat(Heartbeat {
            test_req_id: decoder.optional(112),
        }),
        MsgType::TestRequest => Body::TestRequest(TestRequest {
            test_req_id: decoder.required(112)?,
        }),
        MsgType::ResendRequest => Body::ResendRequest(ResendRequest {
            begin_seq_no: decoder.required_seq_num(7)?,
            end_seq_no: decoder.required_seq_num(16)?,
        }),
        MsgType::Reject => Body::Reject(Reject {
            ref_seq_num: decoder.required_seq_num(45)?,
            ref_tag_id: decoder.optional_int(371)?,
            ref_msg_type: decoder.optional(372),
            session_reject_reason: decoder
                .optional_int(373)?
                .map(SessionRejectReason::from_tag_value),
            text: decoder.optional(58),
        }),
        MsgType::SequenceReset => Body::SequenceReset(SequenceReset {
            gap_fill_flag: decoder.optional_boolean(123)?,
            new_seq_no: decoder.required_seq_num(36)?,
        }),
        MsgType::Logout => Body::Logout(Logout {
            text: decoder.optional(58),
        }),
        MsgType::Logon => Body::Logon(Logon {
            encrypt_method: decoder.optional_int(98)?.unwrap_or(0),
            heart_bt_int: {
                let raw = decoder.required(108)?;
                parse_int(&raw).ok_or_else(|| {
                    decoder.reject(Some(108), SessionRejectReason::IncorrectDataFormat)
                })?
            },
            reset_seq_num_flag: decoder.optional_boolean(141)?,
            username: decoder.optional(553),
            password: decoder.optional(554),
        }),
        MsgType::Application(msg_type) => Body::Application {
            msg_type,
            fields: decoder.fields.clone(),
        },
    };
    Ok(body)
}

/// Byte-level message writer; BodyLength and CheckSum are derived from the
/// serialized content, never from the message.
struct Serializer {
    output: Vec<u8>,
}

impl Serializer {
    fn new() -> Serializer {
        Serializer { output: Vec::with_capacity(256) }
    }

    fn put_tag(&mut self, tag: TagNum) {
        let mut buffer = itoa::Buffer::new();
        self.output.extend_from_slice(buffer.format(tag).as_bytes());
        self.output.push(b'=');
    }

    fn field_str(&mut self, tag: TagNum, value: &FixStr) {
        self.put_tag(tag);
        self.output.extend_from_slice(value.as_bytes());
        self.output.push(SOH);
    }

    fn field_int(&mut self, tag: TagNum, value: Int) {
        self.put_tag(tag);
        let mut buffer = itoa::Buffer::new();
        self.output
            .extend_from_slice(buffer.format(value).as_bytes());
        self.output.push(SOH);
    }

    fn field_seq_num(&mut self, tag: TagNum, value: SeqNum) {
        self.put_tag(tag);
        let mut buffer = itoa::Buffer::new();
        self.output
            .extend_from_slice(buffer.format(value).as_bytes());
        self.output.push(SOH);
    }

    fn field_boolean(&mut self, tag: TagNum, value: bool) {
        self.put_tag(tag);
        self.output.push(if value { b'Y' } else { b'N' });
        self.output.push(SOH);
    }

    fn field_timestamp(&mut self, tag: TagNum, value: crate::fields::UtcTimestamp) {
        self.put_tag(tag);
        self.output
            .extend_from_slice(timestamp::format(value).as_bytes());
        self.output.push(SOH);
    }
}

impl FixMessage {
    pub fn serialize(&self) -> Vec<u8> {
        let mut body = Serializer::new();
        let header = &self.header;
        body.field_str(35, self.msg_type().as_fix_str());
        body.field_seq_num(34, header.msg_seq_num);
        body.field_str(49, &header.sender_comp_id);
        body.field_str(56, &header.target_comp_id);
        if let Some(poss_dup_flag) = header.poss_dup_flag {
            body.field_boolean(43, poss_dup_flag);
        }
        if let Some(poss_resend) = header.poss_resend {
            body.field_boolean(97, poss_resend);
        }
        body.field_timestamp(52, header.sending_time);
        if let Some(orig_sending_time) = header.orig_sending_time {
            body.field_timestamp(122, orig_sending_time);
        }

        match &self.body {
            Body::Heartbeat(heartbeat) => {
                if let Some(test_req_id) = &heartbeat.test_req_id {
                    body.field_str(112, test_req_id);
                }
            }
            Body::TestRequest(test_request) => {
                body.field_str(112, &test_request.test_req_id);
            }
            Body::ResendRequest(resend_request) => {
                body.field_seq_num(7, resend_request.begin_seq_no);
                body.field_seq_num(16, resend_request.end_seq_no);
            }
            Body::Reject(reject) => {
                body.field_seq_num(45, reject.ref_seq_num);
                if let Some(ref_tag_id) = reject.ref_tag_id {
                    body.field_int(371, ref_tag_id);
                }
                if let Some(ref_msg_type) = &reject.ref_msg_type {
                    body.field_str(372, ref_msg_type);
                }
                if let Some(reason) = reject.session_reject_reason {
                    body.field_int(373, reason.as_tag_value());
                }
                if let Some(text) = &reject.text {
                    body.field_str(58, text);
                }
            }
            Body::SequenceReset(sequence_reset) => {
                if let Some(gap_fill_flag) = sequence_reset.gap_fill_flag {
                    body.field_boolean(123, gap_fill_flag);
                }
                body.field_seq_num(36, sequence_reset.new_seq_no);
            }
            Body::Logout(logout) => {
                if let Some(text) = &logout.text {
                    body.field_str(58, text);
                }
            }
            Body::Logon(logon) => {
                body.field_int(98, logon.encrypt_method);
                body.field_int(108, logon.heart_bt_int);
                if let Some(reset_seq_num_flag) = logon.reset_seq_num_flag {
                    body.field_boolean(141, reset_seq_num_flag);
                }
                if let Some(username) = &logon.username {
                    body.field_str(553, username);
                }
                if let Some(password) = &logon.password {
                    body.field_str(554, password);
                }
            }
            Body::Application { fields, .. } => {
                for (tag, value) in fields.iter() {
                    body.field_str(tag, value);
                }
            }
        }

        let mut message = Serializer::new();
        message.field_str(8, &header.begin_string);
        message.field_int(9, body.output.len() as Int);
        message.output.extend_from_slice(&body.output);
        let check_sum = message
            .output
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        message.put_tag(10);
        message
            .output
            .extend_from_slice(format!("{check_sum:03}").as_bytes());
        message.output.push(SOH);
        message.output
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn soh(input: &str) -> Vec<u8> {
        input.replace('|', "\x01").into_bytes()
    }

    #[test]
    fn frame_complete_message() {
        let input = soh("8=FIX.4.4|9=19|<lots of tags here>10=198|");
        let (leftover, raw) = raw_message(&input).unwrap();
        assert!(leftover.is_empty());
        assert_eq!(raw.begin_string, "FIX.4.4");
        assert_eq!(raw.body, b"<lots of tags here>");
        assert_eq!(raw.check_sum, raw.computed_check_sum);
    }

    #[test]
    fn frame_from_chunks() {
        let chunks: &[&[u8]] = &[
            b"8=FIX.4.",
            b"4\x019=19\x01<lots",
            b" of tags here>10=198\x01",
            b"leftover",
        ];
        let mut buf = Vec::new();

        buf.extend_from_slice(chunks[0]);
        assert_matches!(raw_message(&buf), Err(RawMessageError::Incomplete));
        buf.extend_from_slice(chunks[1]);
        assert_matches!(raw_message(&buf), Err(RawMessageError::Incomplete));
        buf.extend_from_slice(chunks[2]);
        assert_matches!(raw_message(&buf), Ok((leftover, _)) if leftover.is_empty());
        buf.extend_from_slice(chunks[3]);
        assert_matches!(raw_message(&buf), Ok((b"leftover", _)));
    }

    #[test]
    fn frame_rejects_garbage_prefix() {
        assert_matches!(
            raw_message(b"garbage in front"),
            Err(RawMessageError::NotAMessage)
        );
    }

    #[test]
    fn decode_logon() {
        let input = framed(
            "8=FIX.4.4|35=A|34=1|49=BANZAI|56=EXEC|52=20190605-11:51:27.848|98=0|108=30|141=Y|",
        );
        let msg = FixMessage::from_bytes(&input).unwrap();
        assert_eq!(msg.header.msg_seq_num, 1);
        assert_eq!(msg.header.sender_comp_id, "BANZAI");
        assert_eq!(msg.header.target_comp_id, "EXEC");
        let logon = assert_matches!(&msg.body, Body::Logon(logon) => logon);
        assert_eq!(logon.heart_bt_int, 30);
        assert_eq!(logon.reset_seq_num_flag, Some(true));
    }

    #[test]
    fn decode_rejects_check_sum_mismatch() {
        let mut input = framed(
            "8=FIX.4.4|35=A|34=1|49=BANZAI|56=EXEC|52=20190605-11:51:27.848|98=0|108=30|141=Y|",
        );
        // corrupt the declared checksum
        let len = input.len();
        input[len - 2] = if input[len - 2] == b'0' { b'1' } else { b'0' };
        assert_matches!(
            FixMessage::from_bytes(&input),
            Err(DecodeError::GarbledMessage(_))
        );
    }

    #[test]
    fn decode_missing_seq_num_requires_logout() {
        let input = framed("8=FIX.4.4|35=0|49=BANZAI|56=EXEC|52=20190605-11:51:27|");
        assert_matches!(FixMessage::from_bytes(&input), Err(DecodeError::Logout));
    }

    #[test]
    fn decode_missing_heart_bt_int_rejects() {
        let input = framed("8=FIX.4.4|35=A|34=1|49=BANZAI|56=EXEC|52=20190605-11:51:27|98=0|");
        assert_matches!(
            FixMessage::from_bytes(&input),
            Err(DecodeError::Reject {
                tag: Some(108),
                reason: SessionRejectReason::RequiredTagMissing,
                ..
            })
        );
    }

    #[test]
    fn roundtrip_admin_and_application() {
        let logon = logon_fixture();
        let bytes = logon.serialize();
        let decoded = FixMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.serialize(), bytes);

        let order = FixMessage {
            header: logon.header.clone(),
            body: Body::Application {
                msg_type: "D".try_into().unwrap(),
                fields: [
                    (11u16, FixString::try_from("ORD-1").unwrap()),
                    (55u16, FixString::try_from("EUR/USD").unwrap()),
                    (54u16, FixString::try_from("1").unwrap()),
                ]
                .into_iter()
                .collect(),
            },
            trailer: Trailer::default(),
        };
        let bytes = order.serialize();
        let decoded = FixMessage::from_bytes(&bytes).unwrap();
        let fields = assert_matches!(&decoded.body, Body::Application { fields, .. } => fields);
        assert_eq!(fields.get(55).unwrap(), "EUR/USD");
        assert_eq!(decoded.serialize(), bytes);
    }

    #[test]
    fn serialized_body_length_and_check_sum_are_consistent() {
        let bytes = logon_fixture().serialize();
        // reframe and verify the decoder agrees with the serializer
        let (_, raw) = raw_message(&bytes).unwrap();
        assert_eq!(raw.check_sum, raw.computed_check_sum);
    }

    fn logon_fixture() -> FixMessage {
        FixMessage {
            header: Header {
                begin_string: "FIX.4.4".try_into().unwrap(),
                sender_comp_id: "BANZAI".try_into().unwrap(),
                target_comp_id: "EXEC".try_into().unwrap(),
                msg_seq_num: 1,
                poss_dup_flag: None,
                poss_resend: None,
                sending_time: timestamp::parse(
                    FixStr::from_ascii(b"20190605-11:51:27.848").unwrap(),
                )
                .unwrap(),
                orig_sending_time: None,
            },
            body: Body::Logon(Logon {
                encrypt_method: 0,
                heart_bt_int: 30,
                reset_seq_num_flag: Some(true),
                username: None,
                password: None,
            }),
            trailer: Trailer::default(),
        }
    }

    /// Frames a `|`-flavored message given without BodyLength<9> and
    /// CheckSum<10>; both are computed here so literals stay readable.
    fn framed(text: &str) -> Vec<u8> {
        let raw = text.replace('|', "\x01");
        let after_begin = raw.find('\x01').unwrap() + 1;
        let body = &raw[after_begin..];
        let mut out = raw[..after_begin].to_string();
        out.push_str(&format!("9={}\x01", body.len()));
        out.push_str(body);
        let check_sum = out.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        out.push_str(&format!("10={check_sum:03}\x01"));
        out.into_bytes()
    }
}
