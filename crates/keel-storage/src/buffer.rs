// Block-structured, append-only buffer indexed by a logical offset.
//
// Items live in fixed-size blocks held by a block directory. Freeing only moves
// the "first busy" pointer forward; whole blocks behind it are recycled for new
// appends or dropped, and the directory itself is compacted once it has grown
// large and mostly dead. Blocks are shared (`Arc`) with published views so a
// reader can keep iterating a view after the buffer has moved on.
use std::sync::{Arc, OnceLock};

use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    /// Items per block.
    pub block_len: usize,
    /// Directory size at which a mostly dead directory is compacted.
    pub directory_capacity: usize,
    /// Freed blocks retained for reuse when trimming the free pool.
    pub min_free_blocks: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            block_len: 100_000,
            directory_capacity: 128,
            min_free_blocks: 2,
        }
    }
}

struct Block<T> {
    slots: Box<[OnceLock<T>]>,
}

impl<T> Block<T> {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.take();
        }
    }
}

/// Read-only view over a contiguous run of items inside one block.
pub struct BlockView<T> {
    block: Arc<Block<T>>,
    start: usize,
    end: usize,
}

impl<T> Clone for BlockView<T> {
    fn clone(&self) -> Self {
        Self {
            block: Arc::clone(&self.block),
            start: self.start,
            end: self.end,
        }
    }
}

impl<T> std::fmt::Debug for BlockView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockView")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

impl<T> BlockView<T> {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len() {
            return None;
        }
        self.block.slots[self.start + index].get()
    }

    pub fn first(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn last(&self) -> Option<&T> {
        self.len().checked_sub(1).and_then(|index| self.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.block.slots[self.start..self.end]
            .iter()
            .filter_map(OnceLock::get)
    }

    /// Narrows the view to `[from, to)` relative to its current start.
    pub fn range(&self, from: usize, to: usize) -> BlockView<T> {
        let to = to.min(self.len());
        let from = from.min(to);
        Self {
            block: Arc::clone(&self.block),
            start: self.start + from,
            end: self.start + to,
        }
    }

    /// Drops the first `from` items of the view.
    pub fn slice_from(&self, from: usize) -> BlockView<T> {
        self.range(from, self.len())
    }
}

/// Growable log buffer addressed by logical index.
///
/// ```
/// use keel_storage::{BufferOptions, GrowableLogBuffer};
///
/// let options = BufferOptions { block_len: 2, ..BufferOptions::default() };
/// let mut buffer = GrowableLogBuffer::new(1, options);
/// assert_eq!(buffer.add_slice(["a", "b", "c"]), 3);
/// buffer.free_to(1).expect("free");
/// assert_eq!(buffer.first_index(), 2);
/// let items: Vec<_> = buffer.data_blocks().iter().flat_map(|b| b.iter().copied().collect::<Vec<_>>()).collect();
/// assert_eq!(items, vec!["b", "c"]);
/// ```
pub struct GrowableLogBuffer<T> {
    options: BufferOptions,
    // Logical index of slot 0 in directory entry 0.
    offset: i64,
    // Entries before `first_free_block` were dropped; [first_free, first_busy)
    // are freed blocks kept for reuse; the rest hold live items.
    blocks: Vec<Option<Arc<Block<T>>>>,
    first_free_block: usize,
    first_busy_block: usize,
    first_item_in_block: usize,
    next_free_in_block: usize,
    block_allocations: u64,
    directory_allocations: u64,
}

impl<T> GrowableLogBuffer<T> {
    pub fn new(initial_index: i64, options: BufferOptions) -> Self {
        let options = BufferOptions {
            block_len: options.block_len.max(1),
            directory_capacity: options.directory_capacity.max(1),
            min_free_blocks: options.min_free_blocks,
        };
        let mut blocks = Vec::with_capacity(options.directory_capacity);
        blocks.push(Some(Arc::new(Block::new(options.block_len))));
        Self {
            options,
            offset: initial_index,
            blocks,
            first_free_block: 0,
            first_busy_block: 0,
            first_item_in_block: 0,
            next_free_in_block: 0,
            block_allocations: 1,
            directory_allocations: 1,
        }
    }

    pub fn options(&self) -> BufferOptions {
        self.options
    }

    /// Logical index of the first live item (one past `last_index` when empty).
    pub fn first_index(&self) -> i64 {
        self.offset
            + (self.first_busy_block * self.options.block_len + self.first_item_in_block) as i64
    }

    /// Logical index of the last written item.
    pub fn last_index(&self) -> i64 {
        self.offset
            + ((self.blocks.len() - 1) * self.options.block_len + self.next_free_in_block) as i64
            - 1
    }

    pub fn len(&self) -> usize {
        (self.last_index() + 1 - self.first_index()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_allocations(&self) -> u64 {
        self.block_allocations
    }

    pub fn directory_allocations(&self) -> u64 {
        self.directory_allocations
    }

    /// Number of directory entries still holding a block, freed or live.
    pub fn retained_blocks(&self) -> usize {
        self.blocks.len() - self.first_free_block
    }

    /// Appends one item and returns its logical index.
    pub fn add(&mut self, item: T) -> i64 {
        if self.next_free_in_block == self.options.block_len {
            self.start_new_block();
        }
        let slot = self.next_free_in_block;
        let stored = self.tail().slots[slot].set(item);
        debug_assert!(stored.is_ok(), "buffer slot written twice");
        self.next_free_in_block += 1;
        self.last_index()
    }

    /// Appends every item in order and returns the new last index.
    pub fn add_slice<I>(&mut self, items: I) -> i64
    where
        I: IntoIterator<Item = T>,
    {
        for item in items {
            self.add(item);
        }
        self.last_index()
    }

    /// Frees every item up to and including `index`.
    pub fn free_to(&mut self, index: i64) -> Result<()> {
        if index < self.first_index() {
            return Ok(());
        }
        let last = self.last_index();
        if index > last {
            return Err(StorageError::OutOfRange {
                index,
                first: self.first_index(),
                last,
            });
        }
        let next = (index + 1 - self.offset) as usize;
        let previous_busy = self.first_busy_block;
        let block = next / self.options.block_len;
        if block >= self.blocks.len() {
            // Everything is freed and the tail block is full.
            self.first_busy_block = self.blocks.len() - 1;
            self.first_item_in_block = self.options.block_len;
        } else {
            self.first_busy_block = block;
            self.first_item_in_block = next % self.options.block_len;
        }
        if previous_busy != self.first_busy_block {
            self.check_for_cleanup();
        }
        Ok(())
    }

    /// Live region as ordered views, trimmed at both ends.
    pub fn data_blocks(&self) -> Vec<BlockView<T>> {
        let last_block = self.blocks.len() - 1;
        if self.first_busy_block == last_block {
            return vec![self.view(
                last_block,
                self.first_item_in_block,
                self.next_free_in_block,
            )];
        }
        let mut views = Vec::with_capacity(last_block - self.first_busy_block + 1);
        views.push(self.view(
            self.first_busy_block,
            self.first_item_in_block,
            self.options.block_len,
        ));
        for block in self.first_busy_block + 1..last_block {
            views.push(self.view(block, 0, self.options.block_len));
        }
        views.push(self.view(last_block, 0, self.next_free_in_block));
        views
    }

    fn view(&self, block: usize, start: usize, end: usize) -> BlockView<T> {
        BlockView {
            block: Arc::clone(self.block(block)),
            start,
            end,
        }
    }

    fn block(&self, index: usize) -> &Arc<Block<T>> {
        self.blocks[index]
            .as_ref()
            .expect("live directory entries always hold a block")
    }

    fn tail(&self) -> &Arc<Block<T>> {
        self.block(self.blocks.len() - 1)
    }

    fn start_new_block(&mut self) {
        let block = if self.first_free_block < self.first_busy_block {
            let recycled = self.blocks[self.first_free_block].take();
            self.first_free_block += 1;
            match recycled.map(|block| self.recycle(block)) {
                Some(Some(block)) => block,
                _ => self.allocate_block(),
            }
        } else {
            self.allocate_block()
        };
        self.blocks.push(Some(block));
        self.next_free_in_block = 0;
        self.check_for_cleanup();
    }

    // A block still referenced by a published view cannot be overwritten.
    fn recycle(&self, mut block: Arc<Block<T>>) -> Option<Arc<Block<T>>> {
        Arc::get_mut(&mut block)?.reset();
        Some(block)
    }

    fn allocate_block(&mut self) -> Arc<Block<T>> {
        self.block_allocations += 1;
        Arc::new(Block::new(self.options.block_len))
    }

    fn check_for_cleanup(&mut self) {
        let busy = self.blocks.len() - self.first_busy_block;
        let free = self.first_busy_block - self.first_free_block;
        if free > busy / 2 && free > self.options.min_free_blocks {
            let keep_from = self.first_busy_block - self.options.min_free_blocks;
            for entry in &mut self.blocks[self.first_free_block..keep_from] {
                *entry = None;
            }
            self.first_free_block = keep_from;
        }

        let retained = self.blocks.len() - self.first_free_block;
        if self.blocks.len() >= self.options.directory_capacity && retained < self.blocks.len() / 2
        {
            let shift = self.first_free_block;
            let mut blocks = Vec::with_capacity(self.options.directory_capacity.max(retained));
            blocks.extend(self.blocks.drain(shift..));
            self.blocks = blocks;
            self.first_busy_block -= shift;
            self.first_free_block = 0;
            self.offset += (shift * self.options.block_len) as i64;
            self.directory_allocations += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(block_len: usize) -> BufferOptions {
        BufferOptions {
            block_len,
            directory_capacity: 8,
            min_free_blocks: 1,
        }
    }

    fn collect(buffer: &GrowableLogBuffer<i64>) -> Vec<i64> {
        buffer
            .data_blocks()
            .iter()
            .flat_map(|view| view.iter().copied().collect::<Vec<_>>())
            .collect()
    }

    #[test]
    fn empty_buffer_reports_bounds_around_initial_index() {
        let buffer: GrowableLogBuffer<i64> = GrowableLogBuffer::new(10, small(4));
        assert_eq!(buffer.first_index(), 10);
        assert_eq!(buffer.last_index(), 9);
        assert!(buffer.is_empty());
        let views = buffer.data_blocks();
        assert_eq!(views.len(), 1);
        assert!(views[0].is_empty());
    }

    #[test]
    fn add_returns_logical_indices_across_blocks() {
        let mut buffer = GrowableLogBuffer::new(1, small(3));
        for value in 1..=7 {
            assert_eq!(buffer.add(value), value);
        }
        assert_eq!(buffer.add_slice([8, 9]), 9);
        assert_eq!(collect(&buffer), (1..=9).collect::<Vec<_>>());
        let lens: Vec<_> = buffer.data_blocks().iter().map(BlockView::len).collect();
        assert_eq!(lens, vec![3, 3, 3]);
    }

    #[test]
    fn free_to_is_inclusive_idempotent_and_monotonic() {
        let mut buffer = GrowableLogBuffer::new(1, small(3));
        buffer.add_slice(1..=10);
        buffer.free_to(5).expect("free");
        assert_eq!(buffer.first_index(), 6);
        buffer.free_to(5).expect("repeat");
        buffer.free_to(2).expect("smaller");
        buffer.free_to(-4).expect("negative");
        assert_eq!(buffer.first_index(), 6);
        assert_eq!(collect(&buffer), (6..=10).collect::<Vec<_>>());
        let views = buffer.data_blocks();
        assert_eq!(views[0].first(), Some(&6));
        assert_eq!(views.last().and_then(BlockView::last), Some(&10));
    }

    #[test]
    fn free_to_beyond_last_item_is_out_of_range() {
        let mut buffer = GrowableLogBuffer::new(1, small(3));
        buffer.add_slice(1..=4);
        let err = buffer.free_to(5).expect_err("out of range");
        assert!(matches!(
            err,
            StorageError::OutOfRange {
                index: 5,
                first: 1,
                last: 4
            }
        ));
    }

    #[test]
    fn freeing_a_full_tail_leaves_an_empty_live_region() {
        let mut buffer = GrowableLogBuffer::new(1, small(3));
        buffer.add_slice(1..=6);
        buffer.free_to(6).expect("free all");
        assert!(buffer.is_empty());
        assert_eq!(buffer.first_index(), 7);
        assert_eq!(buffer.add(7), 7);
        assert_eq!(collect(&buffer), vec![7]);
    }

    #[test]
    fn freed_blocks_are_reused_when_no_view_holds_them() {
        let mut buffer = GrowableLogBuffer::new(1, small(2));
        buffer.add_slice(1..=4);
        buffer.free_to(2).expect("free first block");
        let allocations = buffer.block_allocations();
        buffer.add_slice(5..=6);
        assert_eq!(buffer.block_allocations(), allocations);
        assert_eq!(collect(&buffer), vec![3, 4, 5, 6]);
    }

    #[test]
    fn views_stay_valid_after_their_block_is_freed() {
        let mut buffer = GrowableLogBuffer::new(1, small(2));
        buffer.add_slice(1..=4);
        let held = buffer.data_blocks();
        buffer.free_to(2).expect("free first block");
        let allocations = buffer.block_allocations();
        buffer.add_slice(5..=6);
        // The held view pins the freed block, so a fresh one is allocated.
        assert_eq!(buffer.block_allocations(), allocations + 1);
        assert_eq!(held[0].iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(collect(&buffer), vec![3, 4, 5, 6]);
    }

    #[test]
    fn directory_compaction_keeps_logical_indices_stable() {
        let options = BufferOptions {
            block_len: 2,
            directory_capacity: 4,
            min_free_blocks: 0,
        };
        let mut buffer = GrowableLogBuffer::new(1, options);
        let mut next = 1i64;
        for _ in 0..20 {
            buffer.add_slice(next..next + 4);
            next += 4;
            buffer.free_to(next - 2).expect("free");
        }
        assert!(buffer.directory_allocations() > 1);
        assert_eq!(buffer.first_index(), next - 1);
        assert_eq!(buffer.last_index(), next - 1);
        assert_eq!(collect(&buffer), vec![next - 1]);
        assert!(buffer.retained_blocks() <= 4);
    }

    #[test]
    fn free_pool_is_trimmed_to_minimum() {
        let options = BufferOptions {
            block_len: 1,
            directory_capacity: 1_000,
            min_free_blocks: 2,
        };
        let mut buffer = GrowableLogBuffer::new(1, options);
        buffer.add_slice(1..=10);
        buffer.free_to(9).expect("free");
        // One busy block plus at most two retained free blocks.
        assert_eq!(buffer.retained_blocks(), 3);
        assert_eq!(collect(&buffer), vec![10]);
    }
}
