use keel_storage::{BlockView, GrowableLogBuffer, Message};

/// Immutable view of a topic's durable in-memory region.
///
/// Published once per persistence tick and shared without locking by every
/// confirmation and delivery loop of the topic.
#[derive(Debug, Clone)]
pub struct DataSnapshot {
    start_message_id: i64,
    blocks: Vec<BlockView<Message>>,
}

impl DataSnapshot {
    pub fn empty(start_message_id: i64) -> Self {
        Self {
            start_message_id,
            blocks: Vec::new(),
        }
    }

    /// Captures the live region of `buffer` up to and including `durable_id`.
    pub(crate) fn capture(buffer: &GrowableLogBuffer<Message>, durable_id: i64) -> Self {
        let start_message_id = buffer.first_index();
        let mut remaining = (durable_id + 1 - start_message_id).max(0) as usize;
        let mut blocks = Vec::new();
        for view in buffer.data_blocks() {
            if remaining == 0 {
                break;
            }
            if view.is_empty() {
                continue;
            }
            let take = view.len().min(remaining);
            remaining -= take;
            blocks.push(view.range(0, take));
        }
        Self {
            start_message_id,
            blocks,
        }
    }

    pub fn start_message_id(&self) -> i64 {
        self.start_message_id
    }

    pub fn blocks(&self) -> &[BlockView<Message>] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.iter().map(BlockView::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the last message in the snapshot, `start_message_id - 1` if empty.
    pub fn last_message_id(&self) -> i64 {
        self.start_message_id + self.len() as i64 - 1
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> + '_ {
        self.blocks.iter().flat_map(|view| view.iter())
    }

    /// Views over the messages with ids greater than `after`. Only the block
    /// straddling `after + 1` is trimmed; following blocks are shared as is.
    pub fn tail_after(&self, after: i64) -> Vec<BlockView<Message>> {
        let mut skip = (after + 1 - self.start_message_id).max(0) as usize;
        let mut tail = Vec::new();
        for view in &self.blocks {
            if skip >= view.len() {
                skip -= view.len();
                continue;
            }
            tail.push(view.slice_from(skip));
            skip = 0;
        }
        tail
    }
}
