use std::{ops::RangeInclusive, path::Path};

use fixlink_core::fields::{FixStr, SeqNum, TagNum, UtcTimestamp};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{
    message_contains_field, now, ArchivedMessage, Direction, MessageStore, StoreError,
    StoredMessage,
};
use crate::session_id::SessionId;

/// Durable SQLite-backed store; multiple sessions may share one database
/// file, rows are keyed by the session id columns.
///
/// Durability settings applied at open: WAL, synchronous=FULL. A
/// `PRAGMA integrity_check` runs at open and failing it refuses the store.
pub struct SqliteStore {
    conn: Connection,
    begin_string: String,
    sender_comp_id: String,
    target_comp_id: String,
    next_sender_msg_seq_num: SeqNum,
    next_target_msg_seq_num: SeqNum,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    begin_string    TEXT    NOT NULL,
    sender_comp_id  TEXT    NOT NULL,
    target_comp_id  TEXT    NOT NULL,
    direction       INTEGER NOT NULL,
    msg_seq_num     INTEGER NOT NULL,
    body            BLOB    NOT NULL,
    created_at      TEXT    NOT NULL,
    PRIMARY KEY (begin_string, sender_comp_id, target_comp_id, direction, msg_seq_num)
);
CREATE TABLE IF NOT EXISTS messages_archive (
    begin_string    TEXT    NOT NULL,
    sender_comp_id  TEXT    NOT NULL,
    target_comp_id  TEXT    NOT NULL,
    direction       INTEGER NOT NULL,
    msg_seq_num     INTEGER NOT NULL,
    body            BLOB    NOT NULL,
    created_at      TEXT    NOT NULL,
    archived_at     TEXT    NOT NULL,
    PRIMARY KEY (begin_string, sender_comp_id, target_comp_id, direction, msg_seq_num, archived_at)
);
CREATE TABLE IF NOT EXISTS sequence_numbers (
    begin_string             TEXT    NOT NULL,
    sender_comp_id           TEXT    NOT NULL,
    target_comp_id           TEXT    NOT NULL,
    next_sender_msg_seq_num  INTEGER NOT NULL,
    next_target_msg_seq_num  INTEGER NOT NULL,
    PRIMARY KEY (begin_string, sender_comp_id, target_comp_id)
);
";

// nanosecond precision keeps (key, archived_at) unique across rapid overwrites
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

fn encode_timestamp(ts: UtcTimestamp) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn decode_timestamp(value: &str) -> Result<UtcTimestamp, StoreError> {
    use chrono::TimeZone;
    let naive = chrono::NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map_err(|err| StoreError::CorruptedJournal(format!("bad timestamp {value}: {err}")))?;
    Ok(chrono::Utc.from_utc_datetime(&naive))
}

fn direction_to_i64(direction: Direction) -> i64 {
    match direction {
        Direction::Inbound => 0,
        Direction::Outbound => 1,
    }
}

fn direction_from_i64(value: i64) -> Result<Direction, StoreError> {
    match value {
        0 => Ok(Direction::Inbound),
        1 => Ok(Direction::Outbound),
        other => Err(StoreError::CorruptedJournal(format!(
            "unknown direction marker {other}"
        ))),
    }
}

impl SqliteStore {
    pub fn open(path: &Path, session_id: &SessionId) -> Result<SqliteStore, StoreError> {
        debug!(%session_id, path = %path.display(), "opening sqlite store");
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA foreign_keys=ON;",
        )?;
        let integrity: String =
            conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if integrity != "ok" {
            return Err(StoreError::IntegrityCheckFailed(integrity));
        }
        conn.execute_batch(SCHEMA)?;

        let begin_string = session_id.begin_string().as_utf8().to_owned();
        let sender_comp_id = session_id.sender_comp_id().as_utf8().to_owned();
        let target_comp_id = session_id.target_comp_id().as_utf8().to_owned();

        conn.execute(
            "INSERT OR IGNORE INTO sequence_numbers
                 (begin_string, sender_comp_id, target_comp_id,
                  next_sender_msg_seq_num, next_target_msg_seq_num)
             VALUES (?1, ?2, ?3, 1, 1)",
            params![begin_string, sender_comp_id, target_comp_id],
        )?;
        let (next_sender_msg_seq_num, next_target_msg_seq_num) = conn.query_row(
            "SELECT next_sender_msg_seq_num, next_target_msg_seq_num
             FROM sequence_numbers
             WHERE begin_string = ?1 AND sender_comp_id = ?2 AND target_comp_id = ?3",
            params![begin_string, sender_comp_id, target_comp_id],
            |row| Ok((row.get::<_, i64>(0)? as SeqNum, row.get::<_, i64>(1)? as SeqNum)),
        )?;

        Ok(SqliteStore {
            conn,
            begin_string,
            sender_comp_id,
            target_comp_id,
            next_sender_msg_seq_num,
            next_target_msg_seq_num,
        })
    }

    fn persist_seq_nums(&self) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE sequence_numbers
             SET next_sender_msg_seq_num = ?4, next_target_msg_seq_num = ?5
             WHERE begin_string = ?1 AND sender_comp_id = ?2 AND target_comp_id = ?3",
            params![
                self.begin_string,
                self.sender_comp_id,
                self.target_comp_id,
                self.next_sender_msg_seq_num as i64,
                self.next_target_msg_seq_num as i64,
            ],
        )?;
        Ok(())
    }

    fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, Vec<u8>, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }
}

impl MessageStore for SqliteStore {
    type Error = StoreError;

    fn store(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
        data: &[u8],
    ) -> Result<(), StoreError> {
        // archive-on-overwrite and the upsert commit or roll back together
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO messages_archive
                 (begin_string, sender_comp_id, target_comp_id, direction, msg_seq_num,
                  body, created_at, archived_at)
             SELECT begin_string, sender_comp_id, target_comp_id, direction, msg_seq_num,
                    body, created_at, ?6
             FROM messages
             WHERE begin_string = ?1 AND sender_comp_id = ?2 AND target_comp_id = ?3
               AND direction = ?4 AND msg_seq_num = ?5",
            params![
                self.begin_string,
                self.sender_comp_id,
                self.target_comp_id,
                direction_to_i64(direction),
                seq_num as i64,
                encode_timestamp(now()),
            ],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO messages
                 (begin_string, sender_comp_id, target_comp_id, direction, msg_seq_num,
                  body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.begin_string,
                self.sender_comp_id,
                self.target_comp_id,
                direction_to_i64(direction),
                seq_num as i64,
                data,
                encode_timestamp(now()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn fetch(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT direction, msg_seq_num, body, created_at FROM messages
                 WHERE begin_string = ?1 AND sender_comp_id = ?2 AND target_comp_id = ?3
                   AND direction = ?4 AND msg_seq_num = ?5",
                params![
                    self.begin_string,
                    self.sender_comp_id,
                    self.target_comp_id,
                    direction_to_i64(direction),
                    seq_num as i64,
                ],
                Self::map_message,
            )
            .optional()?;
        match row {
            Some((direction, seq_num, data, created_at)) => Ok(Some(StoredMessage {
                seq_num: seq_num as SeqNum,
                direction: direction_from_i64(direction)?,
                data,
                timestamp: decode_timestamp(&created_at)?,
            })),
            None => Ok(None),
        }
    }

    fn fetch_range(
        &mut self,
        range: RangeInclusive<SeqNum>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT direction, msg_seq_num, body, created_at FROM messages
             WHERE begin_string = ?1 AND sender_comp_id = ?2 AND target_comp_id = ?3
               AND direction = 1 AND msg_seq_num BETWEEN ?4 AND ?5
             ORDER BY msg_seq_num ASC",
        )?;
        let rows = stmt.query_map(
            params![
                self.begin_string,
                self.sender_comp_id,
                self.target_comp_id,
                *range.start() as i64,
                *range.end() as i64,
            ],
            Self::map_message,
        )?;
        let mut messages = Vec::new();
        for row in rows {
            let (direction, seq_num, data, created_at) = row?;
            messages.push(StoredMessage {
                seq_num: seq_num as SeqNum,
                direction: direction_from_i64(direction)?,
                data,
                timestamp: decode_timestamp(&created_at)?,
            });
        }
        Ok(messages)
    }

    fn find_by_field(
        &mut self,
        tag: TagNum,
        value: &FixStr,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT direction, msg_seq_num, body, created_at FROM messages
             WHERE begin_string = ?1 AND sender_comp_id = ?2 AND target_comp_id = ?3
             ORDER BY direction ASC, msg_seq_num ASC",
        )?;
        let rows = stmt.query_map(
            params![self.begin_string, self.sender_comp_id, self.target_comp_id],
            Self::map_message,
        )?;
        let mut messages = Vec::new();
        for row in rows {
            let (direction, seq_num, data, created_at) = row?;
            if !message_contains_field(&data, tag, value) {
                continue;
            }
            messages.push(StoredMessage {
                seq_num: seq_num as SeqNum,
                direction: direction_from_i64(direction)?,
                data,
                timestamp: decode_timestamp(&created_at)?,
            });
        }
        Ok(messages)
    }

    fn archived(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Vec<ArchivedMessage>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT direction, msg_seq_num, body, created_at, archived_at FROM messages_archive
             WHERE begin_string = ?1 AND sender_comp_id = ?2 AND target_comp_id = ?3
               AND direction = ?4 AND msg_seq_num = ?5
             ORDER BY archived_at ASC",
        )?;
        let rows = stmt.query_map(
            params![
                self.begin_string,
                self.sender_comp_id,
                self.target_comp_id,
                direction_to_i64(direction),
                seq_num as i64,
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )?;
        let mut entries = Vec::new();
        for row in rows {
            let (direction, seq_num, data, created_at, archived_at) = row?;
            entries.push(ArchivedMessage {
                message: StoredMessage {
                    seq_num: seq_num as SeqNum,
                    direction: direction_from_i64(direction)?,
                    data,
                    timestamp: decode_timestamp(&created_at)?,
                },
                archived_at: decode_timestamp(&archived_at)?,
            });
        }
        Ok(entries)
    }

    fn next_sender_msg_seq_num(&self) -> SeqNum {
        self.next_sender_msg_seq_num
    }

    fn next_target_msg_seq_num(&self) -> SeqNum {
        self.next_target_msg_seq_num
    }

    fn set_next_sender_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        self.next_sender_msg_seq_num = seq_num;
        self.persist_seq_nums()
    }

    fn set_next_target_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        self.next_target_msg_seq_num = seq_num;
        self.persist_seq_nums()
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.next_sender_msg_seq_num = 1;
        self.next_target_msg_seq_num = 1;
        self.persist_seq_nums()
    }

    fn close(&mut self) -> Result<(), StoreError> {
        // checkpoint returns a (busy, log, checkpointed) row
        let _busy: i64 = self
            .conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))?;
        Ok(())
    }
}
