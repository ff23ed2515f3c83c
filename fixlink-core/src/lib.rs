//! Wire-level model for the fixlink session engine.
//!
//! The crate covers three concerns:
//! - [`fields`]: printable-ASCII string types and scalar aliases used in
//!   FIX tag values;
//! - [`message`]: the typed administrative messages plus opaque
//!   application bodies;
//! - [`codec`]: streaming framing and the tag=value encode/decode pair.
//!
//! Validation against a FIX dictionary is explicitly not handled here;
//! the session layer depends only on `FixMessage::from_bytes`,
//! `FixMessage::serialize` and the framing entry points, so a
//! dictionary-driven codec can replace this one behind the same seam.

pub mod codec;
pub mod fields;
pub mod message;

pub use codec::{raw_message, DecodeError, RawMessage, RawMessageError};
pub use fields::{FixStr, FixString, Int, SeqNum, TagNum, UtcTimestamp};
pub use message::{
    Body, FieldMap, FixMessage, Header, Heartbeat, Logon, Logout, MsgCat, MsgType, Reject,
    ResendRequest, SequenceReset, SessionRejectReason, TestRequest, Trailer, SOH,
};
