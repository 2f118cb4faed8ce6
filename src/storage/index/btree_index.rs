use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;

use crate::buffer::{BufferPoolManager, PageId, WritePageGuard, INVALID_PAGE_ID};
use crate::config::BTreeConfig;
use crate::error::{TidepoolError, TidepoolResult};
use crate::storage::codec::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec,
};
use crate::storage::index::btree_iterator::TreeIndexIterator;
use crate::storage::index::comparator::KeyComparator;
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, Key, RecordId,
};

/// Crabbing state for one mutating descent: the exclusively-latched header
/// page, the root id read under it, and the retained ancestor guards. The
/// deque of owned guards is the back-reference chain; popping releases in
/// leaf-to-root order.
struct Context {
    header: WritePageGuard,
    root_page_id: PageId,
    write_set: VecDeque<WritePageGuard>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteIntent {
    Insert,
    Delete,
}

/// Concurrent unique-key B+Tree over buffer pool pages. Readers crab with
/// shared latches (at most two held at a time); writers crab with exclusive
/// latches, releasing ancestors once the current child is safe for the
/// intended mutation.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    buffer_pool: Arc<BufferPoolManager>,
    comparator: KeyComparator,
    header_page_id: PageId,
    leaf_max_size: u32,
    internal_max_size: u32,
}

impl BPlusTreeIndex {
    pub fn new_with_config(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        header_page_id: PageId,
        config: BTreeConfig,
    ) -> TidepoolResult<Self> {
        Self::new(
            buffer_pool,
            comparator,
            header_page_id,
            config.leaf_max_size,
            config.internal_max_size,
        )
    }

    /// Set up a fresh index whose header lives at `header_page_id`. The
    /// header is rewritten to mark the tree empty.
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        header_page_id: PageId,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> TidepoolResult<Self> {
        debug_assert!(leaf_max_size >= 2 && internal_max_size >= 3);
        let mut header_guard = buffer_pool.fetch_page_write(header_page_id)?;
        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(
            &BPlusTreeHeaderPage::empty(),
        ));
        drop(header_guard);
        Ok(BPlusTreeIndex {
            buffer_pool,
            comparator,
            header_page_id,
            leaf_max_size,
            internal_max_size,
        })
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.buffer_pool
    }

    pub fn get_root_page_id(&self) -> TidepoolResult<PageId> {
        let guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(guard.data())?;
        Ok(header.root_page_id)
    }

    pub fn is_empty(&self) -> TidepoolResult<bool> {
        Ok(self.get_root_page_id()? == INVALID_PAGE_ID)
    }

    /// Point lookup. Shared-latch crabbing: the child latch is taken before
    /// the parent latch is released.
    pub fn get(&self, key: &[u8]) -> TidepoolResult<Option<RecordId>> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(header.root_page_id)?;
        drop(header_guard);

        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            match page {
                BPlusTreePage::Internal(node) => {
                    let child_id = node.look_up(key, self.comparator);
                    // Assignment acquires the child before the parent drops.
                    guard = self.buffer_pool.fetch_page_read(child_id)?;
                }
                BPlusTreePage::Leaf(leaf) => {
                    return Ok(leaf.look_up(key, self.comparator));
                }
            }
        }
    }

    /// Unique-key insert. Returns false (no side effects) for a duplicate.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> TidepoolResult<bool> {
        let mut header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;

        if header.root_page_id == INVALID_PAGE_ID {
            return self.start_new_tree(&mut header_guard, key, rid);
        }

        let mut ctx = Context {
            header: header_guard,
            root_page_id: header.root_page_id,
            write_set: VecDeque::new(),
        };
        let mut guard = self.find_leaf_write(&mut ctx, key, WriteIntent::Insert)?;

        let (mut leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data())?;
        if !leaf.insert(key.to_vec(), rid, self.comparator) {
            return Ok(false);
        }

        if leaf.size() >= self.leaf_max_size as usize {
            let mut sibling_guard = self.buffer_pool.new_page()?.upgrade_write();
            let (risen_key, mut sibling) = leaf.split();
            sibling.next_page_id = leaf.next_page_id;
            leaf.next_page_id = sibling_guard.page_id();
            sibling_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&sibling));
            guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));

            let old_id = guard.page_id();
            let new_id = sibling_guard.page_id();
            debug!("leaf {} split, new sibling {}", old_id, new_id);
            drop(sibling_guard);
            drop(guard);
            self.insert_into_parent(&mut ctx, old_id, risen_key, new_id)?;
        } else {
            guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
        }
        Ok(true)
    }

    /// Remove a key. Absent keys are a no-op.
    pub fn remove(&self, key: &[u8]) -> TidepoolResult<()> {
        let header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut ctx = Context {
            header: header_guard,
            root_page_id: header.root_page_id,
            write_set: VecDeque::new(),
        };
        let mut guard = self.find_leaf_write(&mut ctx, key, WriteIntent::Delete)?;

        let (mut leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data())?;
        if !leaf.remove(key, self.comparator) {
            return Ok(());
        }
        guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));

        let is_root = guard.page_id() == ctx.root_page_id;
        let underflow = if is_root {
            leaf.size() == 0
        } else {
            leaf.size() < leaf.min_size() as usize
        };
        if underflow {
            self.rebalance(&mut ctx, guard, BPlusTreePage::Leaf(leaf))?;
        }
        Ok(())
    }

    /// Iterator over the whole key range, positioned at the leftmost entry.
    pub fn begin(&self) -> TidepoolResult<TreeIndexIterator> {
        let root_page_id = self.get_root_page_id()?;
        if root_page_id == INVALID_PAGE_ID {
            return Ok(TreeIndexIterator::empty(self.buffer_pool.clone()));
        }

        let mut guard = self.buffer_pool.fetch_page_read(root_page_id)?;
        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            match page {
                BPlusTreePage::Internal(node) => {
                    guard = self.buffer_pool.fetch_page_read(node.value_at(0))?;
                }
                BPlusTreePage::Leaf(_) => {
                    // Pin through the iterator before the latch goes away.
                    let iterator =
                        TreeIndexIterator::at(self.buffer_pool.clone(), guard.page_id(), 0)?;
                    drop(guard);
                    return Ok(iterator);
                }
            }
        }
    }

    /// Iterator positioned at the first entry with key >= `key`.
    pub fn begin_at(&self, key: &[u8]) -> TidepoolResult<TreeIndexIterator> {
        let root_page_id = self.get_root_page_id()?;
        if root_page_id == INVALID_PAGE_ID {
            return Ok(TreeIndexIterator::empty(self.buffer_pool.clone()));
        }

        let mut guard = self.buffer_pool.fetch_page_read(root_page_id)?;
        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            match page {
                BPlusTreePage::Internal(node) => {
                    let child_id = node.look_up(key, self.comparator);
                    guard = self.buffer_pool.fetch_page_read(child_id)?;
                }
                BPlusTreePage::Leaf(leaf) => {
                    let slot = leaf.lower_bound(key, self.comparator);
                    let iterator =
                        TreeIndexIterator::at(self.buffer_pool.clone(), guard.page_id(), slot)?;
                    drop(guard);
                    return Ok(iterator);
                }
            }
        }
    }

    fn start_new_tree(
        &self,
        header_guard: &mut WritePageGuard,
        key: &[u8],
        rid: RecordId,
    ) -> TidepoolResult<bool> {
        let mut root_guard = self.buffer_pool.new_page()?.upgrade_write();
        let mut leaf = BPlusTreeLeafPage::new(self.leaf_max_size);
        leaf.insert(key.to_vec(), rid, self.comparator);
        root_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));

        let root_page_id = root_guard.page_id();
        header_guard.overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
            root_page_id,
        }));
        debug!("started new tree with root {}", root_page_id);
        Ok(true)
    }

    /// Exclusive-latch descent to the leaf responsible for `key`. Ancestors
    /// are released as soon as the child below them is safe for `intent`;
    /// whatever remains in the write set may be mutated without interference.
    fn find_leaf_write(
        &self,
        ctx: &mut Context,
        key: &[u8],
        intent: WriteIntent,
    ) -> TidepoolResult<WritePageGuard> {
        let mut guard = self.buffer_pool.fetch_page_write(ctx.root_page_id)?;
        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            let BPlusTreePage::Internal(node) = page else {
                return Ok(guard);
            };
            let child_id = node.look_up(key, self.comparator);
            let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
            let (child_page, _) = BPlusTreePageCodec::decode(child_guard.data())?;
            let child_safe = match intent {
                WriteIntent::Insert => child_page.is_safe_for_insert(),
                WriteIntent::Delete => child_page.is_safe_for_delete(),
            };
            ctx.write_set.push_back(guard);
            if child_safe {
                ctx.write_set.clear();
            }
            guard = child_guard;
        }
    }

    /// Propagate a split: insert `(risen_key, new_id)` above `old_id`,
    /// splitting ancestors as needed, growing a new root at the top.
    fn insert_into_parent(
        &self,
        ctx: &mut Context,
        mut old_id: PageId,
        mut risen_key: Key,
        mut new_id: PageId,
    ) -> TidepoolResult<()> {
        loop {
            let Some(mut parent_guard) = ctx.write_set.pop_back() else {
                // The split node was the root.
                let mut root_guard = self.buffer_pool.new_page()?.upgrade_write();
                let mut root = BPlusTreeInternalPage::new(self.internal_max_size);
                root.populate_new_root(old_id, risen_key, new_id);
                root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&root));
                let root_page_id = root_guard.page_id();
                drop(root_guard);
                debug!("grew new root {}", root_page_id);
                self.set_root(ctx, root_page_id);
                return Ok(());
            };

            let (mut parent, _) = BPlusTreeInternalPageCodec::decode(parent_guard.data())?;
            parent.insert(risen_key, new_id, self.comparator);
            if parent.size() < self.internal_max_size as usize {
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }

            let mut sibling_guard = self.buffer_pool.new_page()?.upgrade_write();
            let (next_risen, sibling) = parent.split();
            sibling_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&sibling));
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));

            old_id = parent_guard.page_id();
            new_id = sibling_guard.page_id();
            risen_key = next_risen;
            debug!("internal {} split, new sibling {}", old_id, new_id);
            drop(sibling_guard);
            drop(parent_guard);
        }
    }

    /// Fix an underflowing node after removal: borrow from the preferred
    /// sibling when it can spare an entry, otherwise merge and recurse.
    fn rebalance(
        &self,
        ctx: &mut Context,
        mut node_guard: WritePageGuard,
        mut node: BPlusTreePage,
    ) -> TidepoolResult<()> {
        loop {
            let node_id = node_guard.page_id();
            if node_id == ctx.root_page_id {
                return self.adjust_root(ctx, node_guard, node);
            }

            let mut parent_guard = ctx.write_set.pop_back().ok_or_else(|| {
                TidepoolError::Internal(format!("no parent retained for page {}", node_id))
            })?;
            let (mut parent, _) = BPlusTreeInternalPageCodec::decode(parent_guard.data())?;
            let node_index = parent.value_index(node_id).ok_or_else(|| {
                TidepoolError::Internal(format!("page {} missing from its parent", node_id))
            })?;

            if parent.size() == 1 {
                // An only child has no sibling to lean on. It stays as it is
                // and the single-child parent, itself below minimum,
                // rebalances one level up.
                node_guard = parent_guard;
                node = BPlusTreePage::Internal(parent);
                continue;
            }

            // The leftmost child leans on its right sibling, everyone else on
            // the left one.
            let sibling_is_right = node_index == 0;
            let sibling_index = if sibling_is_right {
                node_index + 1
            } else {
                node_index - 1
            };
            let sibling_id = parent.value_at(sibling_index);
            let mut sibling_guard = self.buffer_pool.fetch_page_write(sibling_id)?;
            let (sibling_page, _) = BPlusTreePageCodec::decode(sibling_guard.data())?;

            if sibling_page.can_spare() {
                let mut sibling_page = sibling_page;
                self.borrow_from_sibling(
                    &mut parent,
                    &mut node,
                    &mut sibling_page,
                    node_index,
                    sibling_is_right,
                )?;
                node_guard.overwrite(&BPlusTreePageCodec::encode(&node));
                sibling_guard.overwrite(&BPlusTreePageCodec::encode(&sibling_page));
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }

            // Merge right-into-left, then drop the separator from the parent.
            let separator_index = if sibling_is_right {
                node_index + 1
            } else {
                node_index
            };
            let separator = parent.key_at(separator_index).to_vec();
            let (left_guard, left_page, right_guard, right_page) = if sibling_is_right {
                (node_guard, node, sibling_guard, sibling_page)
            } else {
                (sibling_guard, sibling_page, node_guard, node)
            };
            let mut left_guard = left_guard;
            let right_id = right_guard.page_id();
            let merged = match (left_page, right_page) {
                (BPlusTreePage::Leaf(mut left), BPlusTreePage::Leaf(right)) => {
                    left.merge_right(right);
                    BPlusTreePage::Leaf(left)
                }
                (BPlusTreePage::Internal(mut left), BPlusTreePage::Internal(right)) => {
                    left.merge_right(separator, right);
                    BPlusTreePage::Internal(left)
                }
                _ => {
                    return Err(TidepoolError::Internal(
                        "siblings disagree on node kind".to_string(),
                    ))
                }
            };
            left_guard.overwrite(&BPlusTreePageCodec::encode(&merged));
            parent.remove_at(separator_index);
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            debug!("merged page {} into {}", right_id, left_guard.page_id());

            drop(right_guard);
            drop(left_guard);
            if !self.buffer_pool.delete_page(right_id)? {
                debug!("page {} still pinned, left to the pool", right_id);
            }

            if parent_guard.page_id() == ctx.root_page_id {
                return self.adjust_root(ctx, parent_guard, BPlusTreePage::Internal(parent));
            }
            if parent.size() < parent.min_size() as usize {
                node_guard = parent_guard;
                node = BPlusTreePage::Internal(parent);
                continue;
            }
            return Ok(());
        }
    }

    fn borrow_from_sibling(
        &self,
        parent: &mut BPlusTreeInternalPage,
        node: &mut BPlusTreePage,
        sibling: &mut BPlusTreePage,
        node_index: usize,
        sibling_is_right: bool,
    ) -> TidepoolResult<()> {
        match (node, sibling) {
            (BPlusTreePage::Leaf(node), BPlusTreePage::Leaf(sibling)) => {
                if sibling_is_right {
                    // Move the sibling's smallest entry over; the separator
                    // follows the sibling's new first key.
                    let kv = sibling.array.remove(0);
                    node.array.push(kv);
                    parent.set_key_at(node_index + 1, sibling.key_at(0).to_vec());
                } else {
                    let kv = sibling
                        .array
                        .pop()
                        .ok_or_else(|| TidepoolError::Internal("empty sibling".to_string()))?;
                    node.array.insert(0, kv);
                }
                if node_index > 0 {
                    // Re-anchor the node's own separator on its new first key.
                    parent.set_key_at(node_index, node.key_at(0).to_vec());
                }
            }
            (BPlusTreePage::Internal(node), BPlusTreePage::Internal(sibling)) => {
                if sibling_is_right {
                    // Rotate through the parent: the separator comes down as
                    // the moved child's key, the sibling's next key goes up.
                    let separator = parent.key_at(node_index + 1).to_vec();
                    let (_, child) = sibling.remove_at(0);
                    node.array.push((separator, child));
                    let new_separator = std::mem::take(&mut sibling.array[0].0);
                    parent.set_key_at(node_index + 1, new_separator);
                } else {
                    let separator = parent.key_at(node_index).to_vec();
                    let (key, child) = sibling
                        .array
                        .pop()
                        .ok_or_else(|| TidepoolError::Internal("empty sibling".to_string()))?;
                    node.array[0].0 = separator;
                    node.array.insert(0, (Key::new(), child));
                    parent.set_key_at(node_index, key);
                }
            }
            _ => {
                return Err(TidepoolError::Internal(
                    "siblings disagree on node kind".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn set_root(&self, ctx: &mut Context, root_page_id: PageId) {
        ctx.header
            .overwrite(&BPlusTreeHeaderPageCodec::encode(&BPlusTreeHeaderPage {
                root_page_id,
            }));
        ctx.root_page_id = root_page_id;
    }

    /// Shrink the tree at the top: an empty root leaf empties the tree, an
    /// internal root with a single child hands the root to that child. The
    /// handover repeats while the new root is collapsible too.
    fn adjust_root(
        &self,
        ctx: &mut Context,
        root_guard: WritePageGuard,
        root_page: BPlusTreePage,
    ) -> TidepoolResult<()> {
        let mut guard = root_guard;
        let mut page = root_page;
        loop {
            let root_id = guard.page_id();
            match page {
                BPlusTreePage::Leaf(leaf) if leaf.size() == 0 => {
                    drop(guard);
                    self.set_root(ctx, INVALID_PAGE_ID);
                    self.buffer_pool.delete_page(root_id)?;
                    debug!("tree is empty, root {} deleted", root_id);
                    return Ok(());
                }
                BPlusTreePage::Internal(node) if node.size() == 1 => {
                    let new_root = node.value_at(0);
                    drop(guard);
                    self.set_root(ctx, new_root);
                    self.buffer_pool.delete_page(root_id)?;
                    debug!("root collapsed from {} to {}", root_id, new_root);
                    guard = self.buffer_pool.fetch_page_write(new_root)?;
                    page = BPlusTreePageCodec::decode(guard.data())?.0;
                }
                _ => return Ok(()),
            }
        }
    }
}
