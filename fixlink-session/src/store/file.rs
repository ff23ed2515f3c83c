use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    ops::RangeInclusive,
    path::{Path, PathBuf},
};

use chrono::TimeZone;
use fixlink_core::fields::{FixStr, SeqNum, TagNum, Utc};
use tracing::debug;

use super::{
    message_contains_field, now, ArchivedMessage, Direction, MessageStore, StoreError,
    StoredMessage,
};
use crate::session_id::SessionId;

/// Append-only journal for development use.
///
/// Two files are derived from the configured base path: `<base>.log` holds
/// length-prefixed message records, `<base>.seq` the two sequence
/// counters. The journal itself is the audit trail: every store appends,
/// so for a given key the last record is live and the earlier ones are
/// the archive.
pub struct FileStore {
    journal: File,
    seq_path: PathBuf,
    next_sender_msg_seq_num: SeqNum,
    next_target_msg_seq_num: SeqNum,
    // all generations per key, oldest first
    index: BTreeMap<(Direction, SeqNum), Vec<StoredMessage>>,
}

const RECORD_HEADER_LEN: usize = 1 + 4 + 8 + 4;

impl FileStore {
    pub fn open(base: &Path, session_id: &SessionId) -> Result<FileStore, StoreError> {
        let journal_path = base.with_extension("log");
        let seq_path = base.with_extension("seq");
        debug!(%session_id, journal = %journal_path.display(), "opening file store");

        let mut journal = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&journal_path)?;
        let index = replay(&mut journal)?;
        journal.seek(SeekFrom::End(0))?;

        let (next_sender_msg_seq_num, next_target_msg_seq_num) = read_seq_nums(&seq_path)?;

        Ok(FileStore {
            journal,
            seq_path,
            next_sender_msg_seq_num,
            next_target_msg_seq_num,
            index,
        })
    }

    fn write_seq_nums(&self) -> Result<(), StoreError> {
        let mut file = File::create(&self.seq_path)?;
        writeln!(
            file,
            "{} {}",
            self.next_sender_msg_seq_num, self.next_target_msg_seq_num
        )?;
        file.sync_data()?;
        Ok(())
    }
}

fn read_seq_nums(path: &Path) -> Result<(SeqNum, SeqNum), StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok((1, 1)),
        Err(err) => return Err(err.into()),
    };
    let mut parts = content.split_whitespace();
    let sender = parts.next().and_then(|v| v.parse().ok());
    let target = parts.next().and_then(|v| v.parse().ok());
    match (sender, target) {
        (Some(sender), Some(target)) => Ok((sender, target)),
        _ => Err(StoreError::CorruptedJournal(format!(
            "malformed sequence number file {}",
            path.display()
        ))),
    }
}

fn replay(journal: &mut File) -> Result<BTreeMap<(Direction, SeqNum), Vec<StoredMessage>>, StoreError> {
    let mut buf = Vec::new();
    journal.read_to_end(&mut buf)?;

    let mut index: BTreeMap<(Direction, SeqNum), Vec<StoredMessage>> = BTreeMap::new();
    let mut pos = 0;
    while pos < buf.len() {
        if buf.len() - pos < RECORD_HEADER_LEN {
            return Err(StoreError::CorruptedJournal(
                "truncated record header".into(),
            ));
        }
        let direction = match buf[pos] {
            0 => Direction::Inbound,
            1 => Direction::Outbound,
            other => {
                return Err(StoreError::CorruptedJournal(format!(
                    "unknown direction marker {other}"
                )))
            }
        };
        let seq_num = u32::from_be_bytes(buf[pos + 1..pos + 5].try_into().unwrap());
        let millis = i64::from_be_bytes(buf[pos + 5..pos + 13].try_into().unwrap());
        let len = u32::from_be_bytes(buf[pos + 13..pos + 17].try_into().unwrap()) as usize;
        pos += RECORD_HEADER_LEN;
        if buf.len() - pos < len {
            return Err(StoreError::CorruptedJournal("truncated record body".into()));
        }
        let timestamp = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| StoreError::CorruptedJournal("invalid record timestamp".into()))?;
        index.entry((direction, seq_num)).or_default().push(StoredMessage {
            seq_num,
            direction,
            data: buf[pos..pos + len].to_vec(),
            timestamp,
        });
        pos += len;
    }
    Ok(index)
}

impl MessageStore for FileStore {
    type Error = StoreError;

    fn store(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let timestamp = now();
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
        record.push(match direction {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        });
        record.extend_from_slice(&seq_num.to_be_bytes());
        record.extend_from_slice(&timestamp.timestamp_millis().to_be_bytes());
        record.extend_from_slice(&(data.len() as u32).to_be_bytes());
        record.extend_from_slice(data);
        self.journal.write_all(&record)?;
        self.journal.flush()?;

        self.index
            .entry((direction, seq_num))
            .or_default()
            .push(StoredMessage {
                seq_num,
                direction,
                data: data.to_vec(),
                timestamp,
            });
        Ok(())
    }

    fn fetch(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self
            .index
            .get(&(direction, seq_num))
            .and_then(|generations| generations.last())
            .cloned())
    }

    fn fetch_range(
        &mut self,
        range: RangeInclusive<SeqNum>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let range = (Direction::Outbound, *range.start())..=(Direction::Outbound, *range.end());
        Ok(self
            .index
            .range(range)
            .filter_map(|(_, generations)| generations.last())
            .cloned()
            .collect())
    }

    fn find_by_field(
        &mut self,
        tag: TagNum,
        value: &FixStr,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .index
            .values()
            .filter_map(|generations| generations.last())
            .filter(|msg| message_contains_field(&msg.data, tag, value))
            .cloned()
            .collect())
    }

    fn archived(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Vec<ArchivedMessage>, StoreError> {
        let Some(generations) = self.index.get(&(direction, seq_num)) else {
            return Ok(Vec::new());
        };
        // every generation but the last was displaced by its successor
        Ok(generations
            .windows(2)
            .map(|pair| ArchivedMessage {
                message: pair[0].clone(),
                archived_at: pair[1].timestamp,
            })
            .collect())
    }

    fn next_sender_msg_seq_num(&self) -> SeqNum {
        self.next_sender_msg_seq_num
    }

    fn next_target_msg_seq_num(&self) -> SeqNum {
        self.next_target_msg_seq_num
    }

    fn set_next_sender_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        self.next_sender_msg_seq_num = seq_num;
        self.write_seq_nums()
    }

    fn set_next_target_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        self.next_target_msg_seq_num = seq_num;
        self.write_seq_nums()
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.next_sender_msg_seq_num = 1;
        self.next_target_msg_seq_num = 1;
        self.write_seq_nums()
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.journal.sync_data()?;
        Ok(())
    }
}
