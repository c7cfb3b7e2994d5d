// In-memory storage backends. Clones share state, so a test can hand one
// clone to a topic and keep another to inspect or to inject failures.
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use keel_common::FIRST_MESSAGE_ID;
use keel_common::ids::SubscriptionId;
use parking_lot::Mutex;

use crate::catalog::{SubscriptionCatalog, SubscriptionRecord};
use crate::checkpoint::CheckpointStore;
use crate::message::Message;
use crate::segment_log::MessageLog;
use crate::{Result, StorageError};

#[derive(Debug, Default)]
struct MemoryLogState {
    durable: Vec<Message>,
    pending: Vec<Message>,
    next_id: Option<i64>,
    failing_flushes: usize,
    flushes: u64,
    freed_to: i64,
    closed: bool,
}

/// Message log kept in memory. Unflushed messages are lost on `restore`, like
/// a process crash would lose them.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<MemoryLogState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` flushes fail with an I/O error.
    pub fn fail_next_flushes(&self, count: usize) {
        self.state.lock().failing_flushes = count;
    }

    pub fn durable_messages(&self) -> Vec<Message> {
        self.state.lock().durable.clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.state.lock().flushes
    }

    /// Highest id passed to `free_to` so far.
    pub fn freed_to(&self) -> i64 {
        self.state.lock().freed_to
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl MessageLog for MemoryLog {
    fn restore(&mut self) -> Result<Box<dyn Iterator<Item = Result<Message>> + '_>> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.closed = false;
        let next_id = state
            .durable
            .last()
            .map(|message| message.id + 1)
            .unwrap_or(state.freed_to.max(FIRST_MESSAGE_ID - 1) + 1);
        state.next_id = Some(next_id);
        let messages = state.durable.clone();
        Ok(Box::new(messages.into_iter().map(Ok)))
    }

    fn next_id(&self) -> i64 {
        self.state.lock().next_id.unwrap_or(FIRST_MESSAGE_ID)
    }

    fn write(&mut self, message: &Message) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }
        let Some(expected) = state.next_id else {
            return Err(StorageError::NotRestored);
        };
        if message.id != expected {
            return Err(StorageError::Sequence {
                expected,
                actual: message.id,
            });
        }
        state.pending.push(message.clone());
        state.next_id = Some(message.id + 1);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }
        if state.failing_flushes > 0 {
            state.failing_flushes -= 1;
            return Err(io::Error::other("injected flush failure").into());
        }
        let pending = std::mem::take(&mut state.pending);
        state.durable.extend(pending);
        state.flushes += 1;
        Ok(())
    }

    fn free_to(&mut self, message_id: i64) -> Result<()> {
        let mut state = self.state.lock();
        if message_id <= state.freed_to {
            return Ok(());
        }
        state.freed_to = message_id;
        state.durable.retain(|message| message.id > message_id);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.state.lock().closed = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CheckpointState {
    durable: HashMap<SubscriptionId, i64>,
    pending: HashMap<SubscriptionId, i64>,
    removed: Vec<SubscriptionId>,
    failing_flushes: usize,
    restored: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<CheckpointState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_flushes(&self, count: usize) {
        self.state.lock().failing_flushes = count;
    }

    /// Checkpoints that survived the last flush.
    pub fn durable(&self) -> HashMap<SubscriptionId, i64> {
        self.state.lock().durable.clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn restore(&mut self) -> Result<HashMap<SubscriptionId, i64>> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.removed.clear();
        state.restored = true;
        Ok(state.durable.clone())
    }

    fn write(&mut self, id: SubscriptionId, completed_message_id: i64) -> Result<()> {
        let mut state = self.state.lock();
        if !state.restored {
            return Err(StorageError::NotRestored);
        }
        state.pending.insert(id, completed_message_id);
        Ok(())
    }

    fn remove(&mut self, id: SubscriptionId) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.remove(&id);
        state.removed.push(id);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_flushes > 0 {
            state.failing_flushes -= 1;
            return Err(io::Error::other("injected checkpoint flush failure").into());
        }
        for id in std::mem::take(&mut state.removed) {
            state.durable.remove(&id);
        }
        let pending = std::mem::take(&mut state.pending);
        state.durable.extend(pending);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.state.lock().restored = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySubscriptionCatalog {
    records: Arc<Mutex<Vec<SubscriptionRecord>>>,
}

impl MemorySubscriptionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SubscriptionRecord> {
        self.records.lock().clone()
    }
}

impl SubscriptionCatalog for MemorySubscriptionCatalog {
    fn load(&self) -> Result<Vec<SubscriptionRecord>> {
        Ok(self.records.lock().clone())
    }

    fn store(&mut self, records: &[SubscriptionRecord]) -> Result<()> {
        *self.records.lock() = records.to_vec();
        Ok(())
    }
}
