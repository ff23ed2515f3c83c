//! Field-level types shared by the codec and the session layer.
//!
//! FIX field values are printable ASCII (0x20..=0x7E). [`FixString`] and
//! [`FixStr`] enforce that at the boundary so the rest of the crate can
//! treat values as text without re-validating.

use std::{borrow::Borrow, fmt, mem, ops};

pub use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

pub type Int = i64;
pub type TagNum = u16;
pub type SeqNum = u32;
pub type Length = u16;

pub type Boolean = bool;

pub type UtcTimestamp = DateTime<Utc>;

/// Owned printable-ASCII string.
#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FixString(Vec<u8>);

/// Borrowed printable-ASCII string slice.
#[derive(Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct FixStr([u8]);

#[derive(Debug)]
pub struct FixStringError {
    idx: usize,
    value: u8,
}

impl fmt::Display for FixStringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unexpected character '{:#04x}' at idx {}",
            self.value, self.idx
        )
    }
}

impl std::error::Error for FixStringError {}

fn check_ascii_printable(buf: &[u8]) -> Result<(), FixStringError> {
    for (idx, &value) in buf.iter().enumerate() {
        if !(0x20..=0x7e).contains(&value) {
            return Err(FixStringError { idx, value });
        }
    }
    Ok(())
}

impl FixStr {
    pub fn from_ascii(buf: &[u8]) -> Result<&FixStr, FixStringError> {
        check_ascii_printable(buf)?;
        // SAFETY: content checked above
        Ok(unsafe { FixStr::from_ascii_unchecked(buf) })
    }

    /// # Safety
    ///
    /// The caller must guarantee `buf` holds printable ASCII only.
    pub unsafe fn from_ascii_unchecked(buf: &[u8]) -> &FixStr {
        // SAFETY: relies on `&FixStr` and `&[u8]` having the same layout.
        mem::transmute(buf)
    }

    pub fn as_utf8(&self) -> &str {
        // SAFETY: ASCII is always valid UTF-8
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FixStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_utf8().fmt(f)
    }
}

impl fmt::Debug for FixStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixStr(\"{}\")", self)
    }
}

impl AsRef<FixStr> for FixStr {
    fn as_ref(&self) -> &FixStr {
        self
    }
}

impl AsRef<[u8]> for FixStr {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ToOwned for FixStr {
    type Owned = FixString;

    fn to_owned(&self) -> FixString {
        // SAFETY: self is already validated
        unsafe { FixString::from_ascii_unchecked(self.as_bytes().to_owned()) }
    }
}

impl PartialEq<[u8]> for FixStr {
    fn eq(&self, other: &[u8]) -> bool {
        self.0.eq(other)
    }
}

impl<const N: usize> PartialEq<[u8; N]> for FixStr {
    fn eq(&self, other: &[u8; N]) -> bool {
        self.0.eq(other)
    }
}

impl PartialEq<str> for FixStr {
    fn eq(&self, other: &str) -> bool {
        self.0.eq(other.as_bytes())
    }
}

impl PartialEq<&str> for FixStr {
    fn eq(&self, other: &&str) -> bool {
        self.0.eq(other.as_bytes())
    }
}

impl FixString {
    pub fn new() -> FixString {
        FixString(Vec::new())
    }

    pub fn from_ascii(buf: Vec<u8>) -> Result<FixString, FixStringError> {
        check_ascii_printable(&buf)?;
        Ok(FixString(buf))
    }

    /// Replaces every non-printable byte with `?` instead of failing.
    pub fn from_ascii_lossy(mut buf: Vec<u8>) -> FixString {
        for b in buf.iter_mut() {
            if !(0x20..=0x7e).contains(b) {
                *b = b'?';
            }
        }
        FixString(buf)
    }

    /// # Safety
    ///
    /// The caller must guarantee `buf` holds printable ASCII only.
    pub unsafe fn from_ascii_unchecked(buf: Vec<u8>) -> FixString {
        FixString(buf)
    }

    pub fn as_fix_str(&self) -> &FixStr {
        // SAFETY: content validated at construction
        unsafe { FixStr::from_ascii_unchecked(&self.0) }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for FixString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_fix_str().fmt(f)
    }
}

impl fmt::Debug for FixString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixString(\"{}\")", self)
    }
}

impl ops::Deref for FixString {
    type Target = FixStr;

    fn deref(&self) -> &FixStr {
        self.as_fix_str()
    }
}

impl Borrow<FixStr> for FixString {
    fn borrow(&self) -> &FixStr {
        self.as_fix_str()
    }
}

impl AsRef<FixStr> for FixString {
    fn as_ref(&self) -> &FixStr {
        self.as_fix_str()
    }
}

impl TryFrom<&str> for FixString {
    type Error = FixStringError;

    fn try_from(value: &str) -> Result<FixString, FixStringError> {
        FixString::from_ascii(value.as_bytes().to_vec())
    }
}

impl TryFrom<Vec<u8>> for FixString {
    type Error = FixStringError;

    fn try_from(value: Vec<u8>) -> Result<FixString, FixStringError> {
        FixString::from_ascii(value)
    }
}

impl TryFrom<&[u8]> for FixString {
    type Error = FixStringError;

    fn try_from(value: &[u8]) -> Result<FixString, FixStringError> {
        FixString::from_ascii(value.to_vec())
    }
}

impl PartialEq<FixStr> for FixString {
    fn eq(&self, other: &FixStr) -> bool {
        self.as_fix_str().eq(other)
    }
}

impl PartialEq<&str> for FixString {
    fn eq(&self, other: &&str) -> bool {
        self.as_fix_str().eq(other)
    }
}

impl serde::Serialize for FixString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_utf8())
    }
}

impl<'de> serde::Deserialize<'de> for FixString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<FixString, D::Error> {
        let value = <String as serde::Deserialize>::deserialize(deserializer)?;
        FixString::from_ascii(value.into_bytes()).map_err(serde::de::Error::custom)
    }
}

/// FIX timestamp handling (`YYYYMMDD-HH:MM:SS` with optional `.sss`).
pub mod timestamp {
    use chrono::{NaiveDateTime, TimeZone};

    use super::{FixStr, Utc, UtcTimestamp};

    pub const FORMAT_MILLIS: &str = "%Y%m%d-%H:%M:%S%.3f";
    // `%.f` accepts an absent fraction as well as any precision on input
    const PARSE_FORMAT: &str = "%Y%m%d-%H:%M:%S%.f";

    pub fn format(ts: UtcTimestamp) -> String {
        ts.format(FORMAT_MILLIS).to_string()
    }

    pub fn parse(value: &FixStr) -> Option<UtcTimestamp> {
        let naive = NaiveDateTime::parse_from_str(value.as_utf8(), PARSE_FORMAT).ok()?;
        Some(Utc.from_utc_datetime(&naive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_string_rejects_control_chars() {
        assert!(FixString::from_ascii(b"BANZAI".to_vec()).is_ok());
        assert!(FixString::from_ascii(b"BAN\x01ZAI".to_vec()).is_err());
        assert_eq!(
            FixString::from_ascii_lossy(b"BAN\x01ZAI".to_vec()),
            "BAN?ZAI"
        );
    }

    #[test]
    fn timestamp_roundtrip() {
        let ts = timestamp::parse(FixStr::from_ascii(b"20190605-11:51:27.848").unwrap()).unwrap();
        assert_eq!(timestamp::format(ts), "20190605-11:51:27.848");
        assert!(timestamp::parse(FixStr::from_ascii(b"20190605-11:51:27").unwrap()).is_some());
        assert!(timestamp::parse(FixStr::from_ascii(b"not a timestamp").unwrap()).is_none());
    }
}
