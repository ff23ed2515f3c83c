use std::io;

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use fixlink_core::{
    codec::{raw_message, DecodeError, RawMessageError},
    message::FixMessage,
};
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::session::format_soh;

pub enum InputEvent {
    /// One framed message together with its wire image.
    Message(Box<FixMessage>, Bytes),
    DecodeError(DecodeError),
    IoError(io::Error),
    Timeout,
    LogoutTimeout,
}

struct Disconnect;

/// Drops bytes until the buffer starts at something that frames like a
/// message again, so one garbled frame does not kill the session.
fn process_garbled_data(buf: &mut BytesMut) {
    let len = buf.len();
    for i in 1..buf.len() {
        if matches!(
            raw_message(&buf[i..]),
            Ok(_) | Err(RawMessageError::Incomplete)
        ) {
            buf.split_to(i);
            info!("dropped {i} bytes of garbled message");
            return;
        }
    }
    buf.clear();
    info!("dropped {len} bytes of garbled message");
}

fn parse_message(
    bytes: &mut BytesMut,
) -> Result<Option<(Box<FixMessage>, Bytes)>, DecodeError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    debug!("Raw data input :: {}", format_soh(bytes));

    let src_len = bytes.len();

    match raw_message(bytes) {
        Ok((leftover, raw_msg)) => {
            let consumed = src_len - leftover.len();
            let result = FixMessage::from_raw_message(raw_msg);
            let frame = bytes.split_to(consumed).freeze();
            result.map(|msg| Some((msg, frame)))
        }
        Err(RawMessageError::Incomplete) => Ok(None),
        Err(err) => {
            process_garbled_data(bytes);
            Err(DecodeError::GarbledMessage(err.to_string()))
        }
    }
}

async fn input_handler(
    stream: &mut (impl AsyncRead + Unpin),
    buffer: &mut BytesMut,
) -> Result<Option<InputEvent>, Disconnect> {
    // Attempt to parse a frame from the buffered data. If enough data
    // has been buffered, the frame is returned.
    match parse_message(buffer) {
        Ok(Some((msg, frame))) => return Ok(Some(InputEvent::Message(msg, frame))),
        Ok(None) => {}
        Err(error) => return Ok(Some(InputEvent::DecodeError(error))),
    }

    // There is not enough buffered data to read a frame. Attempt to
    // read more data from the socket.
    //
    // On success, the number of bytes is returned. `0` indicates "end
    // of stream".
    match stream.read_buf(buffer).await {
        Ok(0) => {
            // The remote closed the connection. For this to be a clean
            // shutdown, there should be no data in the read buffer. If
            // there is, this means that the peer closed the socket while
            // sending a frame.
            if !buffer.is_empty() {
                warn!("Connection reset by peer");
            }
            Err(Disconnect)
        }
        Ok(_) => Ok(None),
        Err(error) => Ok(Some(InputEvent::IoError(error))),
    }
}

pub fn input_stream(mut source: impl AsyncRead + Unpin) -> impl Stream<Item = InputEvent> {
    let mut buffer = BytesMut::with_capacity(4096);
    stream! {
        loop {
            match input_handler(&mut source, &mut buffer).await {
                Ok(Some(event)) => yield event,
                Ok(None) => {},
                Err(Disconnect) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

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
    fn parse_keeps_the_wire_image() {
        let frame = framed("8=FIX.4.4|35=0|34=2|49=EXEC|56=BANZAI|52=20190605-11:51:27|");
        let mut buf = BytesMut::from(frame.as_slice());
        let (msg, raw) = parse_message(&mut buf).unwrap().unwrap();
        assert_eq!(msg.header.msg_seq_num, 2);
        assert_eq!(raw.as_ref(), frame.as_slice());
        assert!(buf.is_empty());
    }

    #[test]
    fn garbled_prefix_is_skipped_up_to_the_next_frame() {
        let mut data = b"rubbish ".to_vec();
        let frame = framed("8=FIX.4.4|35=0|34=2|49=EXEC|56=BANZAI|52=20190605-11:51:27|");
        data.extend_from_slice(&frame);
        let mut buf = BytesMut::from(data.as_slice());

        assert_matches!(parse_message(&mut buf), Err(DecodeError::GarbledMessage(_)));
        // the retry after resynchronization parses the embedded frame
        let (msg, _) = parse_message(&mut buf).unwrap().unwrap();
        assert_eq!(msg.header.msg_seq_num, 2);
    }

    #[test]
    fn incomplete_input_waits_for_more() {
        let frame = framed("8=FIX.4.4|35=0|34=2|49=EXEC|56=BANZAI|52=20190605-11:51:27|");
        let mut buf = BytesMut::from(&frame[..10]);
        assert_matches!(parse_message(&mut buf), Ok(None));
        buf.extend_from_slice(&frame[10..]);
        assert_matches!(parse_message(&mut buf), Ok(Some(_)));
    }
}
