use std::sync::Arc;

use crate::buffer::{BasicPageGuard, BufferPoolManager, PageId, INVALID_PAGE_ID};
use crate::error::TidepoolResult;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::page::{BPlusTreeLeafPage, Key, RecordId};

/// Forward scan over the leaf chain. The current leaf stays pinned through a
/// basic guard while a decoded snapshot serves the entries; advancing past
/// the last slot pins the next leaf before the old pin is released.
#[derive(Debug)]
pub struct TreeIndexIterator {
    buffer_pool: Arc<BufferPoolManager>,
    _leaf_guard: Option<BasicPageGuard>,
    leaf_page_id: PageId,
    leaf: BPlusTreeLeafPage,
    slot: usize,
}

impl TreeIndexIterator {
    /// Iterator over an empty tree: already at the end.
    pub(crate) fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        TreeIndexIterator {
            buffer_pool,
            _leaf_guard: None,
            leaf_page_id: INVALID_PAGE_ID,
            leaf: BPlusTreeLeafPage::new(0),
            slot: 0,
        }
    }

    /// Iterator positioned at `slot` of the leaf at `leaf_page_id`. A slot
    /// one past the end steps to the next leaf immediately.
    pub(crate) fn at(
        buffer_pool: Arc<BufferPoolManager>,
        leaf_page_id: PageId,
        slot: usize,
    ) -> TidepoolResult<Self> {
        let guard = buffer_pool.fetch_page_basic(leaf_page_id)?;
        let (leaf, _) = guard.with_data(BPlusTreeLeafPageCodec::decode)?;
        let mut iterator = TreeIndexIterator {
            buffer_pool,
            _leaf_guard: Some(guard),
            leaf_page_id,
            leaf,
            slot,
        };
        if iterator.slot >= iterator.leaf.size() {
            iterator.step_to_next_leaf()?;
        }
        Ok(iterator)
    }

    /// True once the scan has moved past the last entry of the last leaf.
    pub fn is_end(&self) -> bool {
        self.leaf.next_page_id == INVALID_PAGE_ID && self.slot >= self.leaf.size()
    }

    /// The `(key, record id)` under the cursor, or None at the end.
    pub fn entry(&self) -> Option<(&[u8], RecordId)> {
        self.leaf.array.get(self.slot).map(|(k, rid)| (&k[..], *rid))
    }

    /// Move the cursor one entry forward.
    pub fn advance(&mut self) -> TidepoolResult<()> {
        if self.slot + 1 < self.leaf.size() {
            self.slot += 1;
            return Ok(());
        }
        self.slot += 1;
        self.step_to_next_leaf()
    }

    /// Return the current entry and advance.
    pub fn next(&mut self) -> TidepoolResult<Option<(Key, RecordId)>> {
        let Some((key, rid)) = self.entry().map(|(k, rid)| (k.to_vec(), rid)) else {
            return Ok(None);
        };
        self.advance()?;
        Ok(Some((key, rid)))
    }

    fn step_to_next_leaf(&mut self) -> TidepoolResult<()> {
        while self.slot >= self.leaf.size() {
            let next_page_id = self.leaf.next_page_id;
            if next_page_id == INVALID_PAGE_ID {
                self.slot = self.leaf.size();
                return Ok(());
            }
            let guard = self.buffer_pool.fetch_page_basic(next_page_id)?;
            let (leaf, _) = guard.with_data(BPlusTreeLeafPageCodec::decode)?;
            // Old pin is released only now, after the next leaf is pinned.
            self._leaf_guard = Some(guard);
            self.leaf_page_id = next_page_id;
            self.leaf = leaf;
            self.slot = 0;
        }
        Ok(())
    }
}

impl PartialEq for TreeIndexIterator {
    fn eq(&self, other: &Self) -> bool {
        self.leaf_page_id == other.leaf_page_id && self.slot == other.slot
    }
}

impl Eq for TreeIndexIterator {}
