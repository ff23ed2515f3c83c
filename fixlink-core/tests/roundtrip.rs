//! Encode/decode round-trip checks over wire-captured literals.

use assert_matches::assert_matches;
use fixlink_core::{Body, DecodeError, FixMessage, MsgType};

fn soh(input: &str) -> Vec<u8> {
    input.replace('|', "\x01").into_bytes()
}

fn pipes(input: &[u8]) -> String {
    String::from_utf8_lossy(input).replace('\x01', "|")
}

/// Frames a `|`-delimited message given without BodyLength<9>/CheckSum<10>.
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

#[test]
fn admin_messages_roundtrip() {
    let messages = [
        "8=FIX.4.4|35=A|34=1|49=BANZAI|56=EXEC|52=20190605-11:51:27.848|98=0|108=30|141=Y|",
        "8=FIX.4.4|35=0|34=7|49=BANZAI|56=EXEC|52=20190605-11:51:27.848|112=TEST-17|",
        "8=FIX.4.4|35=1|34=8|49=EXEC|56=BANZAI|52=20190605-11:51:27.848|112=TEST-17|",
        "8=FIX.4.4|35=2|34=9|49=BANZAI|56=EXEC|52=20190605-11:51:27.848|7=5|16=7|",
        "8=FIX.4.4|35=4|34=6|49=EXEC|56=BANZAI|43=Y|52=20190605-11:51:27.848|123=Y|36=8|",
        "8=FIX.4.4|35=5|34=12|49=BANZAI|56=EXEC|52=20190605-11:51:27.848|58=Operator requested logout|",
        "8=FIX.4.4|35=3|34=13|49=EXEC|56=BANZAI|52=20190605-11:51:27.848|45=20|371=36|373=5|58=Value is incorrect|",
    ];

    for text in messages {
        let bytes = framed(text);
        let msg = FixMessage::from_bytes(&bytes)
            .unwrap_or_else(|err| panic!("failed to decode {text}: {err}"));
        let reencoded = msg.serialize();
        assert_eq!(
            pipes(&reencoded),
            pipes(&bytes),
            "round trip changed the wire image of {text}"
        );
    }
}

#[test]
fn application_message_preserves_field_order() {
    let bytes = framed(
        "8=FIX.4.4|35=D|34=3|49=BANZAI|56=EXEC|52=20190605-11:51:27.848|\
         11=ORD-1|21=1|55=MSFT|54=1|60=20190605-11:51:27.848|38=100|40=1|",
    );
    let msg = FixMessage::from_bytes(&bytes).unwrap();
    assert_eq!(msg.msg_type(), MsgType::Application("D".try_into().unwrap()));
    let fields = assert_matches!(&msg.body, Body::Application { fields, .. } => fields);
    let tags: Vec<u16> = fields.iter().map(|(tag, _)| tag).collect();
    assert_eq!(tags, [11, 21, 55, 54, 60, 38, 40]);
    assert_eq!(pipes(&msg.serialize()), pipes(&bytes));
}

#[test]
fn repeating_group_passes_through_opaquely() {
    // MarketDataRequest with a two-entry NoRelatedSym<146> group
    let bytes = framed(
        "8=FIX.4.4|35=V|34=4|49=BANZAI|56=EXEC|52=20190605-11:51:27.848|\
         262=REQ-1|263=1|264=0|146=2|55=MSFT|55=AAPL|",
    );
    let msg = FixMessage::from_bytes(&bytes).unwrap();
    assert_eq!(pipes(&msg.serialize()), pipes(&bytes));
}

#[test]
fn garbage_between_messages_is_an_error_not_a_panic() {
    assert_matches!(
        FixMessage::from_bytes(&soh("not a fix message|at all|")),
        Err(DecodeError::GarbledMessage(_))
    );
}
