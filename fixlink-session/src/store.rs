//! Durable, sequence-keyed message log backing resend and audit.
//!
//! One store instance serves one session; the acceptor builds them through
//! a `Fn(&SessionId) -> S` factory. Records are keyed by (seq_num,
//! direction) and an overwrite never destroys data: the displaced record
//! moves to an append-only archive first. Sequence counters are persisted
//! together with the messages so a restart resumes exactly where the
//! previous process stopped.

use std::ops::RangeInclusive;

use chrono::Utc;
use fixlink_core::{
    fields::{FixStr, SeqNum, TagNum, UtcTimestamp},
    message::SOH,
};

use crate::{session_id::SessionId, settings::{StoreBackend, StoreSettings}};

mod file;
mod memory;
mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredMessage {
    pub seq_num: SeqNum,
    pub direction: Direction,
    pub data: Vec<u8>,
    pub timestamp: UtcTimestamp,
}

/// A record displaced by an overwrite of its (seq_num, direction) key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchivedMessage {
    pub message: StoredMessage,
    pub archived_at: UtcTimestamp,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("corrupted journal: {0}")]
    CorruptedJournal(String),
    #[error("store configuration error: {0}")]
    Configuration(String),
}

pub trait MessageStore {
    type Error: std::error::Error + 'static;

    /// Stores one message. Idempotent on (seq_num, direction): an existing
    /// record with the same key is archived, then replaced, atomically.
    fn store(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
        data: &[u8],
    ) -> Result<(), Self::Error>;

    fn fetch(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Option<StoredMessage>, Self::Error>;

    /// Live outbound records within `range`, ordered by sequence number.
    /// Callers translate the protocol's `EndSeqNo=0` to a concrete upper
    /// bound before calling.
    fn fetch_range(
        &mut self,
        range: RangeInclusive<SeqNum>,
    ) -> Result<Vec<StoredMessage>, Self::Error>;

    /// Live records whose body contains `tag=value`. Inspection tooling
    /// only; not on the message path.
    fn find_by_field(
        &mut self,
        tag: TagNum,
        value: &FixStr,
    ) -> Result<Vec<StoredMessage>, Self::Error>;

    /// Audit trail for one key, in archive order.
    fn archived(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Vec<ArchivedMessage>, Self::Error>;

    fn next_sender_msg_seq_num(&self) -> SeqNum;
    fn next_target_msg_seq_num(&self) -> SeqNum;

    fn set_next_sender_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), Self::Error>;
    fn set_next_target_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), Self::Error>;

    fn incr_next_sender_msg_seq_num(&mut self) -> Result<(), Self::Error> {
        self.set_next_sender_msg_seq_num(self.next_sender_msg_seq_num() + 1)
    }

    fn incr_next_target_msg_seq_num(&mut self) -> Result<(), Self::Error> {
        self.set_next_target_msg_seq_num(self.next_target_msg_seq_num() + 1)
    }

    /// Resets both counters to 1. Stored messages stay in place; sequence
    /// reuse after a reset archives the old records on overwrite.
    fn reset(&mut self) -> Result<(), Self::Error>;

    /// Flush and release. Further calls are undefined.
    fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Settings-driven backend chosen at runtime.
pub enum AnyStore {
    Memory(MemoryStore),
    File(FileStore),
    Sqlite(SqliteStore),
}

impl AnyStore {
    pub fn open(settings: &StoreSettings, session_id: &SessionId) -> Result<AnyStore, StoreError> {
        match settings.backend {
            StoreBackend::Memory => Ok(AnyStore::Memory(MemoryStore::new())),
            StoreBackend::File => {
                let path = settings.path.as_deref().ok_or_else(|| {
                    StoreError::Configuration("file store requires a path".into())
                })?;
                Ok(AnyStore::File(FileStore::open(path, session_id)?))
            }
            StoreBackend::Sqlite => {
                let path = settings.path.as_deref().ok_or_else(|| {
                    StoreError::Configuration("sqlite store requires a path".into())
                })?;
                Ok(AnyStore::Sqlite(SqliteStore::open(path, session_id)?))
            }
        }
    }
}

macro_rules! dispatch {
    ($self:expr, $store:ident => $call:expr) => {
        match $self {
            AnyStore::Memory($store) => $call,
            AnyStore::File($store) => $call,
            AnyStore::Sqlite($store) => $call,
        }
    };
}

impl MessageStore for AnyStore {
    type Error = StoreError;

    fn store(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
        data: &[u8],
    ) -> Result<(), StoreError> {
        dispatch!(self, store => store.store(seq_num, direction, data))
    }

    fn fetch(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Option<StoredMessage>, StoreError> {
        dispatch!(self, store => store.fetch(seq_num, direction))
    }

    fn fetch_range(
        &mut self,
        range: RangeInclusive<SeqNum>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        dispatch!(self, store => store.fetch_range(range))
    }

    fn find_by_field(
        &mut self,
        tag: TagNum,
        value: &FixStr,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        dispatch!(self, store => store.find_by_field(tag, value))
    }

    fn archived(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Vec<ArchivedMessage>, StoreError> {
        dispatch!(self, store => store.archived(seq_num, direction))
    }

    fn next_sender_msg_seq_num(&self) -> SeqNum {
        dispatch!(self, store => store.next_sender_msg_seq_num())
    }

    fn next_target_msg_seq_num(&self) -> SeqNum {
        dispatch!(self, store => store.next_target_msg_seq_num())
    }

    fn set_next_sender_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        dispatch!(self, store => store.set_next_sender_msg_seq_num(seq_num))
    }

    fn set_next_target_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        dispatch!(self, store => store.set_next_target_msg_seq_num(seq_num))
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        dispatch!(self, store => store.reset())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        dispatch!(self, store => store.close())
    }
}

pub(crate) fn now() -> UtcTimestamp {
    Utc::now()
}

/// Whether a serialized message contains a `tag=value` field.
fn message_contains_field(data: &[u8], tag: TagNum, value: &FixStr) -> bool {
    let mut needle = Vec::with_capacity(8 + value.len());
    needle.push(SOH);
    needle.extend_from_slice(tag.to_string().as_bytes());
    needle.push(b'=');
    needle.extend_from_slice(value.as_bytes());
    needle.push(SOH);
    if data.len() + 1 >= needle.len() && data.starts_with(&needle[1..]) {
        return true;
    }
    data.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use fixlink_core::fields::FixStr;
    use tempfile::TempDir;

    use super::*;

    fn session_id() -> SessionId {
        SessionId::new(
            "FIX.4.4".try_into().unwrap(),
            "EXEC".try_into().unwrap(),
            "BANZAI".try_into().unwrap(),
        )
    }

    fn stores(dir: &TempDir) -> Vec<AnyStore> {
        let id = session_id();
        vec![
            AnyStore::Memory(MemoryStore::new()),
            AnyStore::File(FileStore::open(&dir.path().join("journal"), &id).unwrap()),
            AnyStore::Sqlite(SqliteStore::open(&dir.path().join("store.db"), &id).unwrap()),
        ]
    }

    #[test]
    fn archive_on_overwrite() {
        let dir = TempDir::new().unwrap();
        for mut store in stores(&dir) {
            store.store(10, Direction::Outbound, b"B1").unwrap();
            store.store(10, Direction::Outbound, b"B2").unwrap();

            let live = store.fetch(10, Direction::Outbound).unwrap().unwrap();
            assert_eq!(live.data, b"B2");

            let archived = store.archived(10, Direction::Outbound).unwrap();
            assert_eq!(archived.len(), 1);
            assert_eq!(archived[0].message.data, b"B1");
        }
    }

    #[test]
    fn one_archive_row_per_overwrite_event() {
        let dir = TempDir::new().unwrap();
        for mut store in stores(&dir) {
            for generation in 0..4u8 {
                store
                    .store(5, Direction::Inbound, &[b'g', b'0' + generation])
                    .unwrap();
            }
            assert_eq!(store.archived(5, Direction::Inbound).unwrap().len(), 3);
        }
    }

    #[test]
    fn directions_do_not_collide() {
        let dir = TempDir::new().unwrap();
        for mut store in stores(&dir) {
            store.store(5, Direction::Inbound, b"in").unwrap();
            store.store(5, Direction::Outbound, b"out").unwrap();
            assert_eq!(
                store.fetch(5, Direction::Inbound).unwrap().unwrap().data,
                b"in"
            );
            assert_eq!(
                store.fetch(5, Direction::Outbound).unwrap().unwrap().data,
                b"out"
            );
            assert!(store.archived(5, Direction::Inbound).unwrap().is_empty());
        }
    }

    #[test]
    fn fetch_range_is_outbound_only_and_ordered() {
        let dir = TempDir::new().unwrap();
        for mut store in stores(&dir) {
            store.store(1, Direction::Outbound, b"m1").unwrap();
            store.store(3, Direction::Outbound, b"m3").unwrap();
            store.store(2, Direction::Outbound, b"m2").unwrap();
            store.store(2, Direction::Inbound, b"noise").unwrap();

            let range = store.fetch_range(1..=3).unwrap();
            let bodies: Vec<&[u8]> = range.iter().map(|r| r.data.as_slice()).collect();
            assert_eq!(bodies, [b"m1" as &[u8], b"m2", b"m3"]);

            assert_eq!(store.fetch_range(2..=2).unwrap().len(), 1);
        }
    }

    #[test]
    fn counters_roundtrip_and_reset() {
        let dir = TempDir::new().unwrap();
        for mut store in stores(&dir) {
            assert_eq!(store.next_sender_msg_seq_num(), 1);
            assert_eq!(store.next_target_msg_seq_num(), 1);
            store.incr_next_sender_msg_seq_num().unwrap();
            store.set_next_target_msg_seq_num(42).unwrap();
            assert_eq!(store.next_sender_msg_seq_num(), 2);
            assert_eq!(store.next_target_msg_seq_num(), 42);
            store.reset().unwrap();
            assert_eq!(store.next_sender_msg_seq_num(), 1);
            assert_eq!(store.next_target_msg_seq_num(), 1);
        }
    }

    #[test]
    fn durable_backends_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = session_id();

        {
            let mut store = FileStore::open(&dir.path().join("journal"), &id).unwrap();
            store.store(7, Direction::Outbound, b"persisted").unwrap();
            store.store(7, Direction::Outbound, b"persisted-v2").unwrap();
            store.set_next_sender_msg_seq_num(8).unwrap();
            store.set_next_target_msg_seq_num(3).unwrap();
            store.close().unwrap();
        }
        {
            let mut store = FileStore::open(&dir.path().join("journal"), &id).unwrap();
            assert_eq!(
                store.fetch(7, Direction::Outbound).unwrap().unwrap().data,
                b"persisted-v2"
            );
            assert_eq!(store.archived(7, Direction::Outbound).unwrap().len(), 1);
            assert_eq!(store.next_sender_msg_seq_num(), 8);
            assert_eq!(store.next_target_msg_seq_num(), 3);
        }

        {
            let mut store = SqliteStore::open(&dir.path().join("store.db"), &id).unwrap();
            store.store(7, Direction::Outbound, b"persisted").unwrap();
            store.store(7, Direction::Outbound, b"persisted-v2").unwrap();
            store.set_next_sender_msg_seq_num(8).unwrap();
            store.close().unwrap();
        }
        {
            let mut store = SqliteStore::open(&dir.path().join("store.db"), &id).unwrap();
            assert_eq!(
                store.fetch(7, Direction::Outbound).unwrap().unwrap().data,
                b"persisted-v2"
            );
            assert_eq!(store.archived(7, Direction::Outbound).unwrap().len(), 1);
            assert_eq!(store.next_sender_msg_seq_num(), 8);
        }
    }

    #[test]
    fn sqlite_sessions_are_isolated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let other = SessionId::new(
            "FIX.4.4".try_into().unwrap(),
            "EXEC".try_into().unwrap(),
            "OTHER".try_into().unwrap(),
        );

        let mut first = SqliteStore::open(&path, &session_id()).unwrap();
        first.store(1, Direction::Outbound, b"first").unwrap();
        first.set_next_sender_msg_seq_num(9).unwrap();
        first.close().unwrap();

        let mut second = SqliteStore::open(&path, &other).unwrap();
        assert_matches!(second.fetch(1, Direction::Outbound).unwrap(), None);
        assert_eq!(second.next_sender_msg_seq_num(), 1);
    }

    #[test]
    fn find_by_field_scans_bodies() {
        let dir = TempDir::new().unwrap();
        for mut store in stores(&dir) {
            store
                .store(1, Direction::Outbound, b"35=D\x0111=ORD-1\x0155=MSFT\x01")
                .unwrap();
            store
                .store(2, Direction::Outbound, b"35=D\x0111=ORD-2\x0155=AAPL\x01")
                .unwrap();

            let hits = store
                .find_by_field(11, FixStr::from_ascii(b"ORD-2").unwrap())
                .unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].seq_num, 2);

            let misses = store
                .find_by_field(11, FixStr::from_ascii(b"ORD-3").unwrap())
                .unwrap();
            assert!(misses.is_empty());
        }
    }
}
