use std::{collections::BTreeMap, ops::RangeInclusive};

use fixlink_core::fields::{FixStr, SeqNum, TagNum};

use super::{
    message_contains_field, now, ArchivedMessage, Direction, MessageStore, StoreError,
    StoredMessage,
};

/// Volatile store; the reference backend for the test suite.
#[derive(Debug, Default)]
pub struct MemoryStore {
    next_sender_msg_seq_num: SeqNum,
    next_target_msg_seq_num: SeqNum,
    live: BTreeMap<(Direction, SeqNum), StoredMessage>,
    archive: Vec<ArchivedMessage>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            next_sender_msg_seq_num: 1,
            next_target_msg_seq_num: 1,
            live: BTreeMap::new(),
            archive: Vec::new(),
        }
    }
}

impl MessageStore for MemoryStore {
    type Error = StoreError;

    fn store(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let record = StoredMessage {
            seq_num,
            direction,
            data: data.to_vec(),
            timestamp: now(),
        };
        if let Some(displaced) = self.live.insert((direction, seq_num), record) {
            self.archive.push(ArchivedMessage {
                message: displaced,
                archived_at: now(),
            });
        }
        Ok(())
    }

    fn fetch(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self.live.get(&(direction, seq_num)).cloned())
    }

    fn fetch_range(
        &mut self,
        range: RangeInclusive<SeqNum>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let range = (Direction::Outbound, *range.start())..=(Direction::Outbound, *range.end());
        Ok(self.live.range(range).map(|(_, msg)| msg.clone()).collect())
    }

    fn find_by_field(
        &mut self,
        tag: TagNum,
        value: &FixStr,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .live
            .values()
            .filter(|msg| message_contains_field(&msg.data, tag, value))
            .cloned()
            .collect())
    }

    fn archived(
        &mut self,
        seq_num: SeqNum,
        direction: Direction,
    ) -> Result<Vec<ArchivedMessage>, StoreError> {
        Ok(self
            .archive
            .iter()
            .filter(|entry| entry.message.seq_num == seq_num && entry.message.direction == direction)
            .cloned()
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
        Ok(())
    }

    fn set_next_target_msg_seq_num(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        self.next_target_msg_seq_num = seq_num;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.next_sender_msg_seq_num = 1;
        self.next_target_msg_seq_num = 1;
        Ok(())
    }
}
