//! The B+ tree index and its range iterator.
//!
//! Internal pages direct the search and leaf pages hold the data. Keys are
//! unique; the tree grows and shrinks dynamically and persists its root
//! page id in the header page. Concurrent operations use latch crabbing:
//! a descent latches the child before releasing anything above it, and
//! drops all ancestor latches once the child is proven safe for the
//! operation.

use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::btree_page::{BTreeKey, BTreeValue};
use crate::buffer_pool::{BufferPoolManager, Frame};
use crate::errors::{EngineError, EngineResult};
use crate::header_page::HeaderPage;
use crate::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};

/// The intent an operation descends with; it decides latch modes and the
/// safety predicate for releasing ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOp {
    Search,
    Insert,
    Remove,
}

/// Latches and pins held by one tree operation, released on every exit
/// path. Pages that became empty are deferred here and freed only after
/// all latches are dropped.
struct LatchContext {
    op: TreeOp,
    pages: Vec<Arc<Frame>>,
    deleted: Vec<PageId>,
}

impl LatchContext {
    fn new(op: TreeOp) -> Self {
        Self {
            op,
            pages: Vec::new(),
            deleted: Vec::new(),
        }
    }

    fn frame_for(&self, page_id: PageId) -> Option<Arc<Frame>> {
        self.pages
            .iter()
            .find(|frame| frame.read().tree_page_id() == page_id)
            .cloned()
    }
}

pub struct BPlusTree<K, V> {
    index_name: String,
    /// Guards root page id transitions (tree grow/shrink).
    root_page_id: Mutex<PageId>,
    bpm: Arc<BufferPoolManager>,
    leaf_max_size: i32,
    internal_max_size: i32,
    _marker: PhantomData<(K, V)>,
}

impl<K: BTreeKey, V: BTreeValue> BPlusTree<K, V> {
    pub fn new(index_name: &str, bpm: Arc<BufferPoolManager>) -> Self {
        Self::new_with_max_sizes(index_name, bpm, 0, 0)
    }

    /// A tree with explicit page occupancy limits; 0 derives the limit from
    /// the page size.
    pub fn new_with_max_sizes(
        index_name: &str,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: i32,
        internal_max_size: i32,
    ) -> Self {
        Self {
            index_name: index_name.to_string(),
            root_page_id: Mutex::new(INVALID_PAGE_ID),
            bpm,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.lock() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.lock()
    }

    /// Point query.
    pub fn get_value(&self, key: &K) -> EngineResult<Option<V>> {
        let mut ctx = LatchContext::new(TreeOp::Search);
        let Some(leaf) = self.find_leaf(Some(key), &mut ctx)? else {
            return Ok(None);
        };
        let result = leaf.read().leaf_lookup::<K, V>(key);
        self.release_all(&mut ctx, false);
        Ok(result)
    }

    /// Inserts a key/value pair. Returns false if the key already exists.
    pub fn insert(&self, key: &K, value: &V) -> EngineResult<bool> {
        loop {
            {
                let mut root = self.root_page_id.lock();
                if *root == INVALID_PAGE_ID {
                    self.start_new_tree(&mut root, key, value)?;
                    return Ok(true);
                }
            }
            let mut ctx = LatchContext::new(TreeOp::Insert);
            match self.find_leaf(Some(key), &mut ctx)? {
                // Lost a race with a remove that emptied the tree.
                None => continue,
                Some(leaf) => return self.insert_into_leaf(&leaf, key, value, &mut ctx),
            }
        }
    }

    /// Deletes `key` and rebalances. A no-op if the tree is empty or the
    /// key is absent.
    pub fn remove(&self, key: &K) -> EngineResult<()> {
        let mut ctx = LatchContext::new(TreeOp::Remove);
        let Some(leaf) = self.find_leaf(Some(key), &mut ctx)? else {
            return Ok(());
        };
        let (new_size, min_size) = {
            let mut page = leaf.write();
            let new_size = page.leaf_remove::<K, V>(key);
            (new_size, page.tree_min_size())
        };
        if new_size < min_size {
            if let Err(e) = self.coalesce_or_redistribute(&leaf, &mut ctx) {
                self.release_all(&mut ctx, true);
                return Err(e);
            }
        }
        self.release_all(&mut ctx, true);
        self.drain_deleted(&mut ctx)
    }

    /// A forward iterator positioned at the left-most entry.
    pub fn iter(&self) -> EngineResult<TreeIterator<K, V>> {
        let mut ctx = LatchContext::new(TreeOp::Search);
        match self.find_leaf(None, &mut ctx)? {
            None => Ok(TreeIterator::at_end(self.bpm.clone())),
            Some(leaf) => {
                self.detach_for_iterator(&leaf, &mut ctx);
                Ok(TreeIterator::new(self.bpm.clone(), leaf, 0))
            }
        }
    }

    /// A forward iterator positioned at the first entry with key >= `key`.
    pub fn iter_from(&self, key: &K) -> EngineResult<TreeIterator<K, V>> {
        let mut ctx = LatchContext::new(TreeOp::Search);
        match self.find_leaf(Some(key), &mut ctx)? {
            None => Ok(TreeIterator::at_end(self.bpm.clone())),
            Some(leaf) => {
                let position = leaf.read().leaf_key_index::<K, V>(key);
                self.detach_for_iterator(&leaf, &mut ctx);
                Ok(TreeIterator::new(self.bpm.clone(), leaf, position))
            }
        }
    }

    /// Hands the leaf's pin to the iterator: the latch is released, the pin
    /// is kept.
    fn detach_for_iterator(&self, leaf: &Arc<Frame>, ctx: &mut LatchContext) {
        debug_assert_eq!(ctx.pages.len(), 1);
        debug_assert!(Arc::ptr_eq(&ctx.pages[0], leaf));
        leaf.latch.runlatch();
        ctx.pages.clear();
    }

    fn start_new_tree(
        &self,
        root: &mut parking_lot::MutexGuard<'_, PageId>,
        key: &K,
        value: &V,
    ) -> EngineResult<()> {
        let (page_id, frame) = self.bpm.new_page()?;
        {
            let mut page = frame.write();
            page.init_leaf_node::<K, V>(page_id, INVALID_PAGE_ID, self.leaf_max_size);
            page.leaf_insert::<K, V>(key, value);
        }
        **root = page_id;
        self.update_root_record(page_id)?;
        self.bpm.unpin_page(page_id, true);
        debug!("started new tree '{}' at page {}", self.index_name, page_id);
        Ok(())
    }

    /// Latches the root page for the operation, retrying while a racing
    /// operation moves the root.
    fn latch_root(&self, op: TreeOp) -> EngineResult<Option<Arc<Frame>>> {
        loop {
            let root_id = *self.root_page_id.lock();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let frame = self.bpm.fetch_page(root_id)?;
            match op {
                TreeOp::Search => frame.latch.rlatch(),
                _ => frame.latch.wlatch(),
            }
            if *self.root_page_id.lock() == root_id {
                return Ok(Some(frame));
            }
            match op {
                TreeOp::Search => frame.latch.runlatch(),
                _ => frame.latch.wunlatch(),
            }
            self.bpm.unpin_page(root_id, false);
        }
    }

    /// Descends to the leaf for `key` (the left-most leaf when `key` is
    /// `None`), crabbing latches. On return the context holds the leaf and
    /// every ancestor that is still unsafe for the operation. Latches are
    /// drained if the descent itself fails.
    fn find_leaf(&self, key: Option<&K>, ctx: &mut LatchContext) -> EngineResult<Option<Arc<Frame>>> {
        match self.descend(key, ctx) {
            Ok(leaf) => Ok(leaf),
            Err(e) => {
                self.release_all(ctx, false);
                Err(e)
            }
        }
    }

    fn descend(&self, key: Option<&K>, ctx: &mut LatchContext) -> EngineResult<Option<Arc<Frame>>> {
        let Some(root) = self.latch_root(ctx.op)? else {
            return Ok(None);
        };
        ctx.pages.push(root);
        loop {
            let current = ctx.pages.last().expect("descent holds a page").clone();
            let child_id = {
                let page = current.read();
                if page.is_leaf_node() {
                    return Ok(Some(current.clone()));
                }
                match key {
                    Some(key) => page.internal_lookup::<K>(key),
                    None => page.internal_value_at::<K>(0),
                }
            };
            let child = self.bpm.fetch_page(child_id)?;
            match ctx.op {
                TreeOp::Search => child.latch.rlatch(),
                _ => child.latch.wlatch(),
            }
            let safe = {
                let page = child.read();
                match ctx.op {
                    TreeOp::Search => true,
                    TreeOp::Insert => page.tree_size() < page.tree_max_size() - 1,
                    TreeOp::Remove => page.tree_size() > page.tree_min_size(),
                }
            };
            if safe {
                self.release_all(ctx, false);
            }
            ctx.pages.push(child);
        }
    }

    fn insert_into_leaf(
        &self,
        leaf: &Arc<Frame>,
        key: &K,
        value: &V,
        ctx: &mut LatchContext,
    ) -> EngineResult<bool> {
        if leaf.read().leaf_lookup::<K, V>(key).is_some() {
            self.release_all(ctx, false);
            return Ok(false);
        }
        let overflow = {
            let mut page = leaf.write();
            page.leaf_insert::<K, V>(key, value);
            page.tree_size() >= page.tree_max_size()
        };
        if overflow {
            let propagated = self.split(leaf).and_then(|(separator, new_frame)| {
                let new_page_id = new_frame.read().tree_page_id();
                self.insert_into_parent(leaf, &separator, &new_frame, ctx)?;
                self.bpm.unpin_page(new_page_id, true);
                Ok(())
            });
            if let Err(e) = propagated {
                self.release_all(ctx, true);
                return Err(e);
            }
        }
        self.release_all(ctx, true);
        Ok(true)
    }

    /// Allocates a sibling and moves the upper half of `frame`'s entries
    /// into it. Returns the separator key for the parent and the pinned new
    /// frame.
    fn split(&self, frame: &Arc<Frame>) -> EngineResult<(K, Arc<Frame>)> {
        let (new_page_id, new_frame) = self.bpm.new_page()?;
        let (separator, is_leaf) = {
            let mut old_page = frame.write();
            let mut new_page = new_frame.write();
            if old_page.is_leaf_node() {
                new_page.init_leaf_node::<K, V>(
                    new_page_id,
                    old_page.tree_parent_page_id(),
                    self.leaf_max_size,
                );
                old_page.leaf_move_half_to::<K, V>(&mut new_page);
                (new_page.leaf_entry::<K, V>(0).key, true)
            } else {
                new_page.init_internal_node::<K>(
                    new_page_id,
                    old_page.tree_parent_page_id(),
                    self.internal_max_size,
                );
                old_page.internal_move_half_to::<K>(&mut new_page);
                (new_page.internal_key_at::<K>(0), false)
            }
        };
        if !is_leaf {
            self.adopt_children(&new_frame)?;
        }
        debug!(
            "split page {} into {}",
            frame.read().tree_page_id(),
            new_page_id
        );
        Ok((separator, new_frame))
    }

    /// Re-points the parent page id of every child of `frame` at `frame`.
    fn adopt_children(&self, frame: &Arc<Frame>) -> EngineResult<()> {
        let (parent_id, children) = {
            let page = frame.read();
            (page.tree_page_id(), page.internal_children::<K>())
        };
        for child_id in children {
            self.reparent(child_id, parent_id)?;
        }
        Ok(())
    }

    fn reparent(&self, child_id: PageId, parent_id: PageId) -> EngineResult<()> {
        let child = self.bpm.fetch_page(child_id)?;
        child.write().set_tree_parent_page_id(parent_id);
        self.bpm.unpin_page(child_id, true);
        Ok(())
    }

    /// Links a freshly split node into the tree, growing a new root when
    /// the split reached the top and recursing when the parent overflows.
    fn insert_into_parent(
        &self,
        old_frame: &Arc<Frame>,
        key: &K,
        new_frame: &Arc<Frame>,
        ctx: &mut LatchContext,
    ) -> EngineResult<()> {
        let (old_page_id, parent_id) = {
            let page = old_frame.read();
            (page.tree_page_id(), page.tree_parent_page_id())
        };
        let new_page_id = new_frame.read().tree_page_id();

        if parent_id == INVALID_PAGE_ID {
            let (root_id, root_frame) = self.bpm.new_page()?;
            {
                let mut root_page = root_frame.write();
                root_page.init_internal_node::<K>(root_id, INVALID_PAGE_ID, self.internal_max_size);
                root_page.internal_populate_new_root::<K>(old_page_id, key, new_page_id);
            }
            old_frame.write().set_tree_parent_page_id(root_id);
            new_frame.write().set_tree_parent_page_id(root_id);
            *self.root_page_id.lock() = root_id;
            self.update_root_record(root_id)?;
            self.bpm.unpin_page(root_id, true);
            debug!("tree '{}' grew a new root {}", self.index_name, root_id);
            return Ok(());
        }

        let parent_frame = ctx
            .frame_for(parent_id)
            .expect("parent latched on the mutator path");
        let overflow = {
            let mut parent = parent_frame.write();
            parent.internal_insert_node_after::<K>(old_page_id, key, new_page_id)?;
            parent.tree_size() >= parent.tree_max_size()
        };
        if overflow {
            let (separator, new_parent) = self.split(&parent_frame)?;
            let new_parent_id = new_parent.read().tree_page_id();
            self.insert_into_parent(&parent_frame, &separator, &new_parent, ctx)?;
            self.bpm.unpin_page(new_parent_id, true);
        }
        Ok(())
    }

    /// Restores the occupancy invariant of an underflowing node by stealing
    /// from or merging with the nearest sibling (left when one exists).
    fn coalesce_or_redistribute(
        &self,
        node_frame: &Arc<Frame>,
        ctx: &mut LatchContext,
    ) -> EngineResult<()> {
        let (node_id, parent_id, node_size, node_max, is_leaf) = {
            let page = node_frame.read();
            (
                page.tree_page_id(),
                page.tree_parent_page_id(),
                page.tree_size(),
                page.tree_max_size(),
                page.is_leaf_node(),
            )
        };
        if parent_id == INVALID_PAGE_ID {
            return self.adjust_root(node_frame, ctx);
        }

        let parent_frame = ctx
            .frame_for(parent_id)
            .expect("parent latched on the remove path");
        let (index, sibling_id) = {
            let parent = parent_frame.read();
            let index = parent
                .internal_value_index::<K>(node_id)
                .expect("node is linked under its parent");
            let sibling_index = if index == 0 { 1 } else { index - 1 };
            (index, parent.internal_value_at::<K>(sibling_index))
        };
        let sibling_frame = self.bpm.fetch_page(sibling_id)?;
        sibling_frame.latch.wlatch();

        let sibling_size = sibling_frame.read().tree_size();
        if sibling_size + node_size >= node_max {
            self.redistribute(&sibling_frame, node_frame, &parent_frame, index, is_leaf)?;
            sibling_frame.latch.wunlatch();
            self.bpm.unpin_page(sibling_id, true);
            return Ok(());
        }

        // Coalesce; the sibling joins the context so its latch and pin are
        // drained with everything else.
        ctx.pages.push(sibling_frame.clone());
        let (left, right, right_index) = if index == 0 {
            (node_frame.clone(), sibling_frame.clone(), 1)
        } else {
            (sibling_frame.clone(), node_frame.clone(), index)
        };
        let right_id = right.read().tree_page_id();
        let moved_children = if is_leaf {
            Vec::new()
        } else {
            right.read().internal_children::<K>()
        };
        {
            let mut left_page = left.write();
            let mut right_page = right.write();
            let mut parent = parent_frame.write();
            if is_leaf {
                right_page.leaf_move_all_to::<K, V>(&mut left_page, &mut parent, right_index)?;
            } else {
                right_page.internal_move_all_to::<K>(&mut left_page, &mut parent, right_index)?;
            }
        }
        let left_id = left.read().tree_page_id();
        for child_id in moved_children {
            self.reparent(child_id, left_id)?;
        }
        ctx.deleted.push(right_id);
        debug!("coalesced page {} into {}", right_id, left_id);

        let parent_underflow = {
            let parent = parent_frame.read();
            parent.tree_size() < parent.tree_min_size()
        };
        if parent_underflow {
            self.coalesce_or_redistribute(&parent_frame, ctx)?;
        }
        Ok(())
    }

    /// Moves one entry from the sibling into the underflowing node and
    /// fixes the separator in the parent. `index` is the node's slot in the
    /// parent; index 0 means the sibling is on the right.
    fn redistribute(
        &self,
        sibling_frame: &Arc<Frame>,
        node_frame: &Arc<Frame>,
        parent_frame: &Arc<Frame>,
        index: i32,
        is_leaf: bool,
    ) -> EngineResult<()> {
        let moved_child = {
            let mut sibling = sibling_frame.write();
            let mut node = node_frame.write();
            let mut parent = parent_frame.write();
            if index == 0 {
                let moved = if is_leaf {
                    sibling.leaf_move_first_to_end_of::<K, V>(&mut node, &mut parent, 1);
                    INVALID_PAGE_ID
                } else {
                    let child = sibling.internal_value_at::<K>(0);
                    sibling.internal_move_first_to_end_of::<K>(&mut node, &mut parent, 1);
                    child
                };
                moved
            } else if is_leaf {
                sibling.leaf_move_last_to_front_of::<K, V>(&mut node, &mut parent, index);
                INVALID_PAGE_ID
            } else {
                let child = sibling.internal_value_at::<K>(sibling.tree_size() - 1);
                sibling.internal_move_last_to_front_of::<K>(&mut node, &mut parent, index);
                child
            }
        };
        if moved_child != INVALID_PAGE_ID {
            let node_id = node_frame.read().tree_page_id();
            self.reparent(moved_child, node_id)?;
        }
        Ok(())
    }

    /// Promotes the only child when the root is an internal page of size
    /// 1; clears the tree when the root is an empty leaf.
    fn adjust_root(&self, root_frame: &Arc<Frame>, ctx: &mut LatchContext) -> EngineResult<()> {
        let (root_id, size, is_leaf) = {
            let page = root_frame.read();
            (page.tree_page_id(), page.tree_size(), page.is_leaf_node())
        };
        if !is_leaf && size == 1 {
            let child_id = root_frame
                .write()
                .internal_remove_and_return_only_child::<K>();
            self.reparent(child_id, INVALID_PAGE_ID)?;
            *self.root_page_id.lock() = child_id;
            self.update_root_record(child_id)?;
            ctx.deleted.push(root_id);
            debug!("tree '{}' root collapsed to page {}", self.index_name, child_id);
        } else if is_leaf && size == 0 {
            *self.root_page_id.lock() = INVALID_PAGE_ID;
            self.update_root_record(INVALID_PAGE_ID)?;
            ctx.deleted.push(root_id);
            debug!("tree '{}' is now empty", self.index_name);
        }
        Ok(())
    }

    /// Persists the root page id under the index name in the header page.
    /// Called on every root transition.
    fn update_root_record(&self, root_page_id: PageId) -> EngineResult<()> {
        let frame = self.bpm.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page = frame.write();
            let mut header = HeaderPage::new(&mut page);
            if !header.update_record(&self.index_name, root_page_id) {
                header.insert_record(&self.index_name, root_page_id);
            }
        }
        self.bpm.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }

    /// Releases, in reverse acquisition order, every latch and pin the
    /// context still holds.
    fn release_all(&self, ctx: &mut LatchContext, is_dirty: bool) {
        while let Some(frame) = ctx.pages.pop() {
            let page_id = frame.read().id;
            match ctx.op {
                TreeOp::Search => frame.latch.runlatch(),
                _ => frame.latch.wunlatch(),
            }
            self.bpm.unpin_page(page_id, is_dirty);
        }
    }

    /// Frees pages emptied by this operation. Runs only after all latches
    /// are dropped.
    fn drain_deleted(&self, ctx: &mut LatchContext) -> EngineResult<()> {
        for page_id in ctx.deleted.drain(..) {
            if !self.bpm.delete_page(page_id)? {
                return Err(EngineError::PagePinned);
            }
        }
        Ok(())
    }

    /// Walks the whole tree checking the structural invariants: occupancy
    /// bounds on every non-root page, strictly increasing keys, parent
    /// pointer agreement, and a leaf chain that visits every leaf in key
    /// order exactly once. Intended for tests; call at a quiescent point.
    pub fn check_integrity(&self) -> EngineResult<()> {
        let root_id = *self.root_page_id.lock();
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut leaves = Vec::new();
        self.check_subtree(root_id, INVALID_PAGE_ID, None, None, &mut leaves)?;

        // The chain from the left-most leaf must visit exactly the leaves
        // the downward walk found, in order.
        let mut chained = Vec::new();
        let mut current = *leaves.first().expect("non-empty tree has a leaf");
        while current != INVALID_PAGE_ID {
            chained.push(current);
            let frame = self.bpm.fetch_page(current)?;
            let next = frame.read().leaf_next_page_id();
            self.bpm.unpin_page(current, false);
            current = next;
        }
        assert_eq!(leaves, chained, "leaf chain disagrees with tree structure");
        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<K>,
        upper: Option<K>,
        leaves: &mut Vec<PageId>,
    ) -> EngineResult<()> {
        let frame = self.bpm.fetch_page(page_id)?;
        let page = frame.read();
        let size = page.tree_size();
        assert_eq!(page.tree_parent_page_id(), expected_parent);
        if expected_parent != INVALID_PAGE_ID {
            assert!(
                size >= page.tree_min_size() && size < page.tree_max_size(),
                "page {} occupancy {} outside [{}, {})",
                page_id,
                size,
                page.tree_min_size(),
                page.tree_max_size()
            );
        }

        // Separator keys are inclusive lower bounds: a split pushes the
        // right page's first key up, so the subtree minimum may equal it.
        if page.is_leaf_node() {
            let mut previous: Option<K> = None;
            for i in 0..size {
                let key = page.leaf_key_at::<K, V>(i);
                if let Some(p) = previous {
                    assert!(p < key, "leaf {} keys not strictly increasing", page_id);
                }
                if let Some(l) = lower {
                    assert!(key >= l, "leaf {} key below separator", page_id);
                }
                if let Some(u) = upper {
                    assert!(key < u, "leaf {} key above separator", page_id);
                }
                previous = Some(key);
            }
            leaves.push(page_id);
            drop(page);
            self.bpm.unpin_page(page_id, false);
            return Ok(());
        }

        let mut children = Vec::new();
        for i in 0..size {
            let child_lower = if i == 0 { lower } else { Some(page.internal_key_at::<K>(i)) };
            let child_upper = if i + 1 < size {
                Some(page.internal_key_at::<K>(i + 1))
            } else {
                upper
            };
            children.push((page.internal_value_at::<K>(i), child_lower, child_upper));
        }
        for i in 2..size {
            assert!(
                page.internal_key_at::<K>(i - 1) < page.internal_key_at::<K>(i),
                "internal {} keys not strictly increasing",
                page_id
            );
        }
        for i in 1..size {
            let key = page.internal_key_at::<K>(i);
            if let Some(l) = lower {
                assert!(key >= l, "internal {} key below separator", page_id);
            }
            if let Some(u) = upper {
                assert!(key < u, "internal {} key above separator", page_id);
            }
        }
        drop(page);
        self.bpm.unpin_page(page_id, false);
        for (child_id, child_lower, child_upper) in children {
            self.check_subtree(child_id, page_id, child_lower, child_upper, leaves)?;
        }
        Ok(())
    }
}

/// Forward iterator over the leaf chain. Holds a pin (no latch) on the
/// current leaf; the pin moves with the iterator and is dropped at the end.
pub struct TreeIterator<K, V> {
    bpm: Arc<BufferPoolManager>,
    frame: Option<Arc<Frame>>,
    position: i32,
    _marker: PhantomData<(K, V)>,
}

impl<K: BTreeKey, V: BTreeValue> TreeIterator<K, V> {
    fn new(bpm: Arc<BufferPoolManager>, frame: Arc<Frame>, position: i32) -> Self {
        let mut iterator = Self {
            bpm,
            frame: Some(frame),
            position,
            _marker: PhantomData,
        };
        iterator.skip_exhausted_leaves();
        iterator
    }

    fn at_end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            frame: None,
            position: 0,
            _marker: PhantomData,
        }
    }

    pub fn is_end(&self) -> bool {
        self.frame.is_none()
    }

    /// The entry under the cursor. Panics at the end of the scan.
    pub fn entry(&self) -> (K, V) {
        let frame = self.frame.as_ref().expect("iterator is not at the end");
        let entry = frame.read().leaf_entry::<K, V>(self.position);
        (entry.key, entry.value)
    }

    pub fn next(&mut self) {
        self.position += 1;
        self.skip_exhausted_leaves();
    }

    /// Hops leaves until the cursor rests on a live entry, dropping the
    /// iterator's pin when the chain runs out.
    fn skip_exhausted_leaves(&mut self) {
        loop {
            let Some(frame) = self.frame.clone() else {
                return;
            };
            let (size, next_id, current_id) = {
                let page = frame.read();
                (page.tree_size(), page.leaf_next_page_id(), page.id)
            };
            if self.position < size {
                return;
            }
            if next_id == INVALID_PAGE_ID {
                self.bpm.unpin_page(current_id, false);
                self.frame = None;
                return;
            }
            let next = self
                .bpm
                .fetch_page(next_id)
                .expect("leaf chain page fetch");
            self.bpm.unpin_page(current_id, false);
            self.frame = Some(next);
            self.position = 0;
        }
    }
}

impl<K, V> Drop for TreeIterator<K, V> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            let page_id = frame.read().id;
            self.bpm.unpin_page(page_id, false);
        }
    }
}
