//! The row-store B+-tree.
//!
//! Rows live in leaf cells keyed by the engine row-id; internal nodes hold
//! only pivots. Leaves chain through `next_leaf` so sequential scans never
//! touch internal nodes. All page access goes through the transactional
//! pager, so every structural change is rollback-safe.
//!
//! Pivot keys are upper bounds: every key under pivot `i` is `<= key_i`,
//! and everything under the right child is greater than the last pivot.
//! Plain deletes may leave a pivot key above its subtree's actual maximum;
//! that keeps lookups correct and avoids touching the parent on every
//! removal.

use super::cursor::Cursor;
use super::page::{
    half_capacity, internal_capacity, leaf_capacity, InternalNode, LeafCell, LeafNode, Page,
    Pivot, RIGHT_CHILD_NOT_SET,
};
use super::txn::TxPager;
use crate::errors::Error;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// A per-table view of the tree: it knows the row size and therefore the
/// cell capacity of every page, including the reduced capacity of page 0.
pub struct BTree<'a> {
    txn: &'a mut TxPager,
    root_page: u32,
    row_size: usize,
    page_size: usize,
    reserve: usize,
}

impl<'a> BTree<'a> {
    pub fn new(
        txn: &'a mut TxPager,
        root_page: u32,
        row_size: usize,
        page_size: usize,
        reserve: usize,
    ) -> Self {
        BTree {
            txn,
            root_page,
            row_size,
            page_size,
            reserve,
        }
    }

    pub fn root_page(&self) -> u32 {
        self.root_page
    }

    fn reserve_for(&self, page: u32) -> usize {
        if page == 0 {
            self.reserve
        } else {
            0
        }
    }

    /// Max cells for a leaf at `page`; page 0 loses the header reserve.
    pub fn leaf_max_cells(&self, page: u32) -> usize {
        leaf_capacity(self.page_size, self.reserve_for(page), self.row_size)
    }

    /// Max pivots for an internal node at `page`.
    pub fn internal_max_keys(&self, page: u32) -> usize {
        internal_capacity(self.page_size, self.reserve_for(page))
    }

    fn get_leaf(&mut self, page: u32) -> Result<LeafNode, Error> {
        self.txn.get_node(page, self.row_size)?.into_leaf()
    }

    fn get_internal(&mut self, page: u32) -> Result<InternalNode, Error> {
        self.txn.get_node(page, self.row_size)?.into_internal()
    }

    fn put_leaf(&mut self, page: u32, node: LeafNode) -> Result<(), Error> {
        self.txn.write_page(page, Page::Leaf(node))
    }

    fn put_internal(&mut self, page: u32, node: InternalNode) -> Result<(), Error> {
        self.txn.write_page(page, Page::Internal(node))
    }

    fn set_parent(&mut self, page: u32, parent: u32) -> Result<(), Error> {
        match self.txn.get_node(page, self.row_size)? {
            Page::Leaf(mut node) => {
                node.parent = parent;
                self.put_leaf(page, node)
            }
            Page::Internal(mut node) => {
                node.parent = parent;
                self.put_internal(page, node)
            }
            other => Err(err!(
                InvalidNodeKind,
                "page {} is a {} page, not a tree node",
                page,
                other.kind_name()
            )),
        }
    }

    /// Largest key in the subtree rooted at `page`.
    fn node_max_key(&mut self, page: u32) -> Result<u64, Error> {
        match self.txn.get_node(page, self.row_size)? {
            Page::Leaf(node) => node
                .max_key()
                .ok_or_else(|| err!(CorruptPage, "leaf {} has no cells", page)),
            Page::Internal(node) => {
                if node.right_child == RIGHT_CHILD_NOT_SET {
                    return Err(err!(CorruptPage, "internal {} has no children", page));
                }
                self.node_max_key(node.right_child)
            }
            other => Err(err!(
                InvalidNodeKind,
                "page {} is a {} page, not a tree node",
                page,
                other.kind_name()
            )),
        }
    }

    /// Descends to where `key` lives or would be inserted. Pure read.
    pub fn seek(&mut self, key: u64) -> Result<Cursor, Error> {
        let mut page = self.root_page;
        loop {
            match self.txn.get_node(page, self.row_size)? {
                Page::Internal(node) => {
                    let child = node.child_for(key);
                    if child == RIGHT_CHILD_NOT_SET {
                        return Err(err!(CorruptPage, "internal {} has no children", page));
                    }
                    page = child;
                }
                Page::Leaf(leaf) => {
                    let cell = leaf.position_of(key);
                    if leaf.cells.is_empty() {
                        return Ok(Cursor::at_end(page, 0));
                    }
                    return Ok(Cursor::at(page, cell));
                }
                other => {
                    return Err(err!(
                        InvalidNodeKind,
                        "page {} is a {} page, not a tree node",
                        page,
                        other.kind_name()
                    ))
                }
            }
        }
    }

    /// Positions at the first cell of the leftmost leaf.
    pub fn seek_first(&mut self) -> Result<Cursor, Error> {
        let mut page = self.root_page;
        loop {
            match self.txn.get_node(page, self.row_size)? {
                Page::Internal(node) => {
                    let child = match node.pivots.first() {
                        Some(pivot) => pivot.child,
                        None => node.right_child,
                    };
                    if child == RIGHT_CHILD_NOT_SET {
                        return Ok(Cursor::at_end(page, 0));
                    }
                    page = child;
                }
                Page::Leaf(leaf) => {
                    if leaf.cells.is_empty() {
                        return Ok(Cursor::at_end(page, 0));
                    }
                    return Ok(Cursor::at(page, 0));
                }
                other => {
                    return Err(err!(
                        InvalidNodeKind,
                        "page {} is a {} page, not a tree node",
                        page,
                        other.kind_name()
                    ))
                }
            }
        }
    }

    /// Walks to the end of the table and returns the cursor there plus the
    /// next row-id to assign (last key + 1, or 0 for an empty table).
    pub fn seek_next_row_id(&mut self) -> Result<(Cursor, u64), Error> {
        let mut page = self.root_page;
        loop {
            match self.txn.get_node(page, self.row_size)? {
                Page::Internal(node) => {
                    if node.right_child == RIGHT_CHILD_NOT_SET {
                        return Ok((Cursor::at_end(page, 0), 0));
                    }
                    page = node.right_child;
                }
                Page::Leaf(leaf) => {
                    let next_id = leaf.max_key().map(|k| k + 1).unwrap_or(0);
                    return Ok((Cursor::at_end(page, leaf.cells.len()), next_id));
                }
                other => {
                    return Err(err!(
                        InvalidNodeKind,
                        "page {} is a {} page, not a tree node",
                        page,
                        other.kind_name()
                    ))
                }
            }
        }
    }

    /// Returns the cell under the cursor and advances it, crossing to the
    /// next leaf in the sibling chain when the current one is exhausted.
    pub fn fetch_cell(&mut self, cursor: &mut Cursor) -> Result<Option<LeafCell>, Error> {
        if cursor.end_of_table {
            return Ok(None);
        }
        let leaf = self.get_leaf(cursor.page)?;
        let cell = match leaf.cells.get(cursor.cell) {
            Some(cell) => cell.clone(),
            None => {
                cursor.end_of_table = true;
                return Ok(None);
            }
        };
        cursor.cell += 1;
        if cursor.cell >= leaf.cells.len() {
            if leaf.next_leaf == 0 {
                cursor.end_of_table = true;
            } else {
                cursor.page = leaf.next_leaf;
                cursor.cell = 0;
            }
        }
        Ok(Some(cell))
    }

    /// Inserts a cell. The key must be new; splits propagate upward as far
    /// as needed.
    pub fn insert(&mut self, key: u64, null_mask: u64, payload: Vec<u8>) -> Result<(), Error> {
        if payload.len() != self.row_size {
            return Err(err!(
                CorruptPage,
                "payload of {} bytes does not match row size {}",
                payload.len(),
                self.row_size
            ));
        }
        let cursor = self.seek(key)?;
        let mut leaf = self.get_leaf(cursor.page)?;
        if let Some(existing) = leaf.cells.get(cursor.cell) {
            if existing.key == key {
                return Err(err!(DuplicateKey, "row id {} already exists", key));
            }
        }
        let cell = LeafCell {
            null_mask,
            key,
            payload,
        };
        if leaf.cells.len() < self.leaf_max_cells(cursor.page) {
            leaf.cells.insert(cursor.cell, cell);
            self.put_leaf(cursor.page, leaf)?;
            trace!(key, page = cursor.page, "Inserted leaf cell");
            return Ok(());
        }
        warn!(
            page = cursor.page,
            max_cells = self.leaf_max_cells(cursor.page),
            "Leaf full, splitting"
        );
        self.leaf_split_insert(cursor.page, leaf, cursor.cell, cell)
    }

    /// Splits a full leaf around a pending cell. The right half moves to a
    /// fresh page that takes over the sibling link; the root case clones
    /// itself into a new left child first so the root page never moves.
    fn leaf_split_insert(
        &mut self,
        page: u32,
        mut leaf: LeafNode,
        pos: usize,
        cell: LeafCell,
    ) -> Result<(), Error> {
        let new_page = self.txn.get_free_page()?;
        leaf.cells.insert(pos, cell);
        let total = leaf.cells.len();
        let right_count = total.div_ceil(2);
        let left_count = total - right_count;
        let right_cells = leaf.cells.split_off(left_count);

        let right = LeafNode {
            is_root: false,
            parent: leaf.parent,
            next_leaf: leaf.next_leaf,
            cells: right_cells,
        };
        leaf.next_leaf = new_page;
        debug!(page, new_page, left_count, right_count, "Split leaf");

        if leaf.is_root {
            // The root page stays put: its content becomes a fresh left
            // child and the root is reborn as an internal node over both.
            let left_page = self.txn.get_free_page()?;
            let left = LeafNode {
                is_root: false,
                parent: page,
                next_leaf: leaf.next_leaf,
                cells: leaf.cells,
            };
            let left_max = left
                .max_key()
                .ok_or_else(|| err!(CorruptPage, "split produced an empty left leaf"))?;
            let right = LeafNode {
                parent: page,
                ..right
            };
            self.put_leaf(left_page, left)?;
            self.put_leaf(new_page, right)?;
            let root = InternalNode {
                is_root: true,
                parent: 0,
                right_child: new_page,
                pivots: vec![Pivot {
                    key: left_max,
                    child: left_page,
                }],
            };
            self.put_internal(page, root)?;
            debug!(root = page, left_page, right_page = new_page, "Created new root");
            return Ok(());
        }

        let parent_page = leaf.parent;
        let new_left_max = leaf
            .max_key()
            .ok_or_else(|| err!(CorruptPage, "split produced an empty left leaf"))?;
        self.put_leaf(page, leaf)?;
        self.put_leaf(new_page, right)?;

        // The split page kept the lower half, so its pivot key shrinks.
        let mut parent = self.get_internal(parent_page)?;
        if let Some(idx) = parent.pivots.iter().position(|p| p.child == page) {
            parent.pivots[idx].key = new_left_max;
            self.put_internal(parent_page, parent)?;
        }
        self.internal_insert(parent_page, new_page)
    }

    /// Links `child_page` into `parent_page` at the position its max key
    /// dictates, splitting the parent when it is at capacity.
    fn internal_insert(&mut self, parent_page: u32, child_page: u32) -> Result<(), Error> {
        let child_max = self.node_max_key(child_page)?;
        let mut parent = self.get_internal(parent_page)?;
        trace!(parent_page, child_page, child_max, "Internal insert");

        if parent.right_child == RIGHT_CHILD_NOT_SET {
            parent.right_child = child_page;
            self.put_internal(parent_page, parent)?;
            return self.set_parent(child_page, parent_page);
        }
        if parent.pivots.len() >= self.internal_max_keys(parent_page) {
            warn!(parent_page, "Internal node full, splitting");
            return self.internal_split_insert(parent_page, child_page);
        }

        let right_max = self.node_max_key(parent.right_child)?;
        if child_max > right_max {
            // The new child outranks the right child; the old right child
            // is demoted into the pivot array.
            parent.pivots.push(Pivot {
                key: right_max,
                child: parent.right_child,
            });
            parent.right_child = child_page;
        } else {
            let pos = parent.pivots.partition_point(|p| p.key < child_max);
            parent.pivots.insert(
                pos,
                Pivot {
                    key: child_max,
                    child: child_page,
                },
            );
        }
        self.put_internal(parent_page, parent)?;
        self.set_parent(child_page, parent_page)
    }

    /// Splits a full internal node, then inserts the pending child into
    /// whichever half its max key selects, and finally links the new
    /// sibling into the parent (which may split recursively).
    fn internal_split_insert(&mut self, old_page: u32, child_page: u32) -> Result<(), Error> {
        let child_max = self.node_max_key(child_page)?;
        let old = self.get_internal(old_page)?;

        let (split_page, parent_page) = if old.is_root {
            // Move the root's content into a fresh left child; the root
            // page itself becomes an empty internal above it.
            let left_page = self.txn.get_free_page()?;
            let moved = InternalNode {
                is_root: false,
                parent: old_page,
                right_child: old.right_child,
                pivots: old.pivots.clone(),
            };
            let children = moved.children();
            self.put_internal(left_page, moved)?;
            for child in children {
                self.set_parent(child, left_page)?;
            }
            let root = InternalNode {
                is_root: true,
                parent: 0,
                right_child: left_page,
                pivots: Vec::new(),
            };
            self.put_internal(old_page, root)?;
            debug!(root = old_page, left_page, "Created new internal root");
            (left_page, old_page)
        } else {
            (old_page, old.parent)
        };

        let mut node = self.get_internal(split_page)?;
        let keep = (node.pivots.len() - 1) / 2;
        let new_page = self.txn.get_free_page()?;
        let right_pivots = node.pivots.split_off(keep + 1);
        let promoted = node
            .pivots
            .pop()
            .ok_or_else(|| err!(CorruptPage, "splitting an empty internal node"))?;

        let sibling = InternalNode {
            is_root: false,
            parent: parent_page,
            right_child: node.right_child,
            pivots: right_pivots,
        };
        node.right_child = promoted.child;
        debug!(
            split_page,
            new_page,
            left_keys = node.pivots.len(),
            right_keys = sibling.pivots.len(),
            "Split internal node"
        );

        let moved_children = sibling.children();
        self.put_internal(split_page, node)?;
        self.put_internal(new_page, sibling)?;
        for child in moved_children {
            self.set_parent(child, new_page)?;
        }

        // Refresh the parent's pivot for the shrunken left node.
        let left_max = self.node_max_key(split_page)?;
        let mut parent = self.get_internal(parent_page)?;
        if let Some(idx) = parent.pivots.iter().position(|p| p.child == split_page) {
            parent.pivots[idx].key = left_max;
            self.put_internal(parent_page, parent)?;
        }

        if child_max < left_max {
            self.internal_insert(split_page, child_page)?;
        } else {
            self.internal_insert(new_page, child_page)?;
        }
        self.internal_insert(parent_page, new_page)
    }

    /// Replaces the payload of an existing cell without moving it.
    pub fn update_in_place(
        &mut self,
        key: u64,
        null_mask: u64,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        if payload.len() != self.row_size {
            return Err(err!(
                CorruptPage,
                "payload of {} bytes does not match row size {}",
                payload.len(),
                self.row_size
            ));
        }
        let cursor = self.seek(key)?;
        let mut leaf = self.get_leaf(cursor.page)?;
        match leaf.cells.get_mut(cursor.cell) {
            Some(cell) if cell.key == key => {
                cell.null_mask = null_mask;
                cell.payload = payload;
            }
            _ => return Err(err!(KeyNotFound, "row id {} not found", key)),
        }
        self.put_leaf(cursor.page, leaf)
    }

    /// Reads a single cell by key.
    pub fn get(&mut self, key: u64) -> Result<Option<LeafCell>, Error> {
        let cursor = self.seek(key)?;
        if cursor.end_of_table {
            return Ok(None);
        }
        let leaf = self.get_leaf(cursor.page)?;
        Ok(leaf
            .cells
            .get(cursor.cell)
            .filter(|cell| cell.key == key)
            .cloned())
    }

    /// Removes a cell and rebalances the leaf if it drops below half full.
    pub fn delete(&mut self, key: u64) -> Result<(), Error> {
        let cursor = self.seek(key)?;
        let mut leaf = self.get_leaf(cursor.page)?;
        match leaf.cells.get(cursor.cell) {
            Some(cell) if cell.key == key => {}
            _ => return Err(err!(KeyNotFound, "row id {} not found", key)),
        }
        leaf.cells.remove(cursor.cell);
        trace!(key, page = cursor.page, "Deleted leaf cell");

        let is_root = leaf.is_root;
        let remaining = leaf.cells.len();
        let parent = leaf.parent;
        self.put_leaf(cursor.page, leaf)?;

        if is_root || remaining >= half_capacity(self.leaf_max_cells(cursor.page)) {
            return Ok(());
        }
        self.rebalance_leaf(cursor.page, parent)
    }

    /// Restores the half-full invariant on a leaf: borrow from the fuller
    /// sibling (left preferred), otherwise merge (right preferred).
    fn rebalance_leaf(&mut self, page: u32, parent_page: u32) -> Result<(), Error> {
        let parent = self.get_internal(parent_page)?;
        let pos = parent.position_of_child(page).ok_or_else(|| {
            err!(
                CorruptPage,
                "leaf {} not found under parent {}",
                page,
                parent_page
            )
        })?;
        let left_page = if pos > 0 { parent.child_at(pos - 1) } else { None };
        let right_page = if pos < parent.pivots.len() {
            parent.child_at(pos + 1)
        } else {
            None
        };
        let half = half_capacity(self.leaf_max_cells(page));

        if let Some(lp) = left_page {
            if self.get_leaf(lp)?.cells.len() > half {
                return self.leaf_borrow_left(page, lp, parent_page, pos);
            }
        }
        if let Some(rp) = right_page {
            if self.get_leaf(rp)?.cells.len() > half {
                return self.leaf_borrow_right(page, rp, parent_page, pos);
            }
        }
        if let Some(rp) = right_page {
            return self.merge_leaves(page, rp, parent_page, pos);
        }
        if let Some(lp) = left_page {
            return self.merge_leaves(lp, page, parent_page, pos - 1);
        }
        Ok(())
    }

    /// Rotates the left sibling's last cell through the parent.
    fn leaf_borrow_left(
        &mut self,
        page: u32,
        left_page: u32,
        parent_page: u32,
        pos: usize,
    ) -> Result<(), Error> {
        let mut left = self.get_leaf(left_page)?;
        let mut leaf = self.get_leaf(page)?;
        let moved = left
            .cells
            .pop()
            .ok_or_else(|| err!(CorruptPage, "borrowing from an empty leaf {}", left_page))?;
        leaf.cells.insert(0, moved);
        let new_left_max = left
            .max_key()
            .ok_or_else(|| err!(CorruptPage, "borrow emptied leaf {}", left_page))?;
        debug!(page, left_page, "Borrowed cell from left sibling");
        self.put_leaf(left_page, left)?;
        self.put_leaf(page, leaf)?;

        let mut parent = self.get_internal(parent_page)?;
        parent.pivots[pos - 1].key = new_left_max;
        self.put_internal(parent_page, parent)
    }

    /// Rotates the right sibling's first cell through the parent.
    fn leaf_borrow_right(
        &mut self,
        page: u32,
        right_page: u32,
        parent_page: u32,
        pos: usize,
    ) -> Result<(), Error> {
        let mut right = self.get_leaf(right_page)?;
        let mut leaf = self.get_leaf(page)?;
        if right.cells.is_empty() {
            return Err(err!(CorruptPage, "borrowing from an empty leaf {}", right_page));
        }
        let moved = right.cells.remove(0);
        let moved_key = moved.key;
        leaf.cells.push(moved);
        debug!(page, right_page, "Borrowed cell from right sibling");
        self.put_leaf(right_page, right)?;
        self.put_leaf(page, leaf)?;

        // The separator must stay >= everything in this leaf and below the
        // right sibling's remaining keys; the moved key is exactly that.
        let mut parent = self.get_internal(parent_page)?;
        parent.pivots[pos].key = moved_key;
        self.put_internal(parent_page, parent)
    }

    /// Concatenates the right leaf into the left, drops the separator from
    /// the parent, frees the emptied page and rebalances upward.
    fn merge_leaves(
        &mut self,
        left_page: u32,
        right_page: u32,
        parent_page: u32,
        left_pos: usize,
    ) -> Result<(), Error> {
        let mut left = self.get_leaf(left_page)?;
        let right = self.get_leaf(right_page)?;
        debug!(
            left_page,
            right_page,
            cells = left.cells.len() + right.cells.len(),
            "Merging leaves"
        );
        left.cells.extend(right.cells);
        left.next_leaf = right.next_leaf;
        self.put_leaf(left_page, left)?;

        let mut parent = self.get_internal(parent_page)?;
        if left_pos + 1 < parent.pivots.len() {
            parent.pivots[left_pos].key = parent.pivots[left_pos + 1].key;
            parent.pivots.remove(left_pos + 1);
        } else {
            parent.right_child = left_page;
            parent.pivots.remove(left_pos);
        }
        let parent_is_root = parent.is_root;
        let parent_keys = parent.pivots.len();
        let grandparent = parent.parent;
        self.put_internal(parent_page, parent)?;
        self.txn.add_free_page(right_page)?;

        if parent_is_root {
            if parent_keys == 0 {
                return self.collapse_root();
            }
            return Ok(());
        }
        if parent_keys < half_capacity(self.internal_max_keys(parent_page)) {
            return self.rebalance_internal(parent_page, grandparent);
        }
        Ok(())
    }

    /// Same policy as leaves, one level up: borrow through the parent or
    /// merge with a sibling, recursing toward the root.
    fn rebalance_internal(&mut self, page: u32, parent_page: u32) -> Result<(), Error> {
        let parent = self.get_internal(parent_page)?;
        let pos = parent.position_of_child(page).ok_or_else(|| {
            err!(
                CorruptPage,
                "internal {} not found under parent {}",
                page,
                parent_page
            )
        })?;
        let left_page = if pos > 0 { parent.child_at(pos - 1) } else { None };
        let right_page = if pos < parent.pivots.len() {
            parent.child_at(pos + 1)
        } else {
            None
        };
        let half = half_capacity(self.internal_max_keys(page));
        let max = self.internal_max_keys(page);
        let own = self.get_internal(page)?.pivots.len();

        if let Some(lp) = left_page {
            if self.get_internal(lp)?.pivots.len() > half {
                return self.internal_borrow_left(page, lp, parent_page, pos);
            }
        }
        if let Some(rp) = right_page {
            if self.get_internal(rp)?.pivots.len() > half {
                return self.internal_borrow_right(page, rp, parent_page, pos);
            }
        }
        // Merge only when both halves plus the separator fit; with an odd
        // capacity the sum can exceed it by one, in which case a borrow
        // still makes progress.
        if let Some(rp) = right_page {
            if own + self.get_internal(rp)?.pivots.len() + 1 <= max {
                return self.merge_internals(page, rp, parent_page, pos);
            }
        }
        if let Some(lp) = left_page {
            if own + self.get_internal(lp)?.pivots.len() + 1 <= max {
                return self.merge_internals(lp, page, parent_page, pos - 1);
            }
        }
        if let Some(lp) = left_page {
            if !self.get_internal(lp)?.pivots.is_empty() {
                return self.internal_borrow_left(page, lp, parent_page, pos);
            }
        }
        if let Some(rp) = right_page {
            if !self.get_internal(rp)?.pivots.is_empty() {
                return self.internal_borrow_right(page, rp, parent_page, pos);
            }
        }
        Ok(())
    }

    fn internal_borrow_left(
        &mut self,
        page: u32,
        left_page: u32,
        parent_page: u32,
        pos: usize,
    ) -> Result<(), Error> {
        let mut left = self.get_internal(left_page)?;
        let mut node = self.get_internal(page)?;
        let mut parent = self.get_internal(parent_page)?;

        let separator = parent.pivots[pos - 1].key;
        let moved_child = left.right_child;
        let last = left
            .pivots
            .pop()
            .ok_or_else(|| err!(CorruptPage, "borrowing from an empty internal {}", left_page))?;
        left.right_child = last.child;
        node.pivots.insert(
            0,
            Pivot {
                key: separator,
                child: moved_child,
            },
        );
        parent.pivots[pos - 1].key = last.key;
        debug!(page, left_page, "Borrowed subtree from left sibling");

        self.put_internal(left_page, left)?;
        self.put_internal(page, node)?;
        self.put_internal(parent_page, parent)?;
        self.set_parent(moved_child, page)
    }

    fn internal_borrow_right(
        &mut self,
        page: u32,
        right_page: u32,
        parent_page: u32,
        pos: usize,
    ) -> Result<(), Error> {
        let mut right = self.get_internal(right_page)?;
        let mut node = self.get_internal(page)?;
        let mut parent = self.get_internal(parent_page)?;

        if right.pivots.is_empty() {
            return Err(err!(
                CorruptPage,
                "borrowing from an empty internal {}",
                right_page
            ));
        }
        let separator = parent.pivots[pos].key;
        node.pivots.push(Pivot {
            key: separator,
            child: node.right_child,
        });
        let first = right.pivots.remove(0);
        node.right_child = first.child;
        parent.pivots[pos].key = first.key;
        debug!(page, right_page, "Borrowed subtree from right sibling");

        self.put_internal(right_page, right)?;
        self.put_internal(page, node)?;
        self.put_internal(parent_page, parent)?;
        self.set_parent(first.child, page)
    }

    /// Merges two internal siblings, reconstituting the separator key from
    /// the parent between them.
    fn merge_internals(
        &mut self,
        left_page: u32,
        right_page: u32,
        parent_page: u32,
        left_pos: usize,
    ) -> Result<(), Error> {
        let mut left = self.get_internal(left_page)?;
        let right = self.get_internal(right_page)?;
        let mut parent = self.get_internal(parent_page)?;

        let separator = parent.pivots[left_pos].key;
        left.pivots.push(Pivot {
            key: separator,
            child: left.right_child,
        });
        let absorbed = right.children();
        left.pivots.extend(right.pivots.iter().copied());
        left.right_child = right.right_child;
        debug!(
            left_page,
            right_page,
            keys = left.pivots.len(),
            "Merging internal nodes"
        );

        if left_pos + 1 < parent.pivots.len() {
            parent.pivots[left_pos].key = parent.pivots[left_pos + 1].key;
            parent.pivots.remove(left_pos + 1);
        } else {
            parent.right_child = left_page;
            parent.pivots.remove(left_pos);
        }
        let parent_is_root = parent.is_root;
        let parent_keys = parent.pivots.len();
        let grandparent = parent.parent;

        self.put_internal(left_page, left)?;
        self.put_internal(parent_page, parent)?;
        for child in absorbed {
            self.set_parent(child, left_page)?;
        }
        self.txn.add_free_page(right_page)?;

        if parent_is_root {
            if parent_keys == 0 {
                return self.collapse_root();
            }
            return Ok(());
        }
        if parent_keys < half_capacity(self.internal_max_keys(parent_page)) {
            return self.rebalance_internal(parent_page, grandparent);
        }
        Ok(())
    }

    /// When the root holds no pivots, its sole child takes its place. The
    /// child's content is copied into the root page (the root page index is
    /// permanent) and the child's page is freed.
    fn collapse_root(&mut self) -> Result<(), Error> {
        let root = self.get_internal(self.root_page)?;
        if !root.pivots.is_empty() {
            return Ok(());
        }
        let child_page = root.right_child;
        if child_page == RIGHT_CHILD_NOT_SET {
            return Ok(());
        }
        debug!(root = self.root_page, child_page, "Collapsing root");
        match self.txn.get_node(child_page, self.row_size)? {
            Page::Leaf(mut leaf) => {
                leaf.is_root = true;
                leaf.parent = 0;
                self.put_leaf(self.root_page, leaf)?;
            }
            Page::Internal(mut node) => {
                node.is_root = true;
                node.parent = 0;
                let children = node.children();
                self.put_internal(self.root_page, node)?;
                for child in children {
                    self.set_parent(child, self.root_page)?;
                }
            }
            other => {
                return Err(err!(
                    InvalidNodeKind,
                    "page {} is a {} page, not a tree node",
                    child_page,
                    other.kind_name()
                ))
            }
        }
        self.txn.add_free_page(child_page)
    }

    /// Level-order walk over every page of the tree.
    pub fn bfs(
        &mut self,
        visit: &mut dyn FnMut(u32, &Page) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut queue = VecDeque::from([self.root_page]);
        while let Some(page) = queue.pop_front() {
            let node = self.txn.get_node(page, self.row_size)?;
            if let Page::Internal(internal) = &node {
                queue.extend(internal.children());
            }
            visit(page, &node)?;
        }
        Ok(())
    }

    /// Every page index reachable from the root, root first.
    pub fn pages(&mut self) -> Result<Vec<u32>, Error> {
        let mut out = Vec::new();
        self.bfs(&mut |page, _| {
            out.push(page);
            Ok(())
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::pager::Pager;
    use std::sync::{Arc, Mutex};
    use tempfile::NamedTempFile;

    const PAGE_SIZE: usize = 4096;
    const RESERVE: usize = 100;

    /// Root-leaf capacity (4096-114)/(16+780) = 5 cells, same off-root.
    const SMALL_ROW: usize = 780;
    /// One row per leaf: (4096-14)/(16+2048) = 1.
    const BIG_ROW: usize = 2048;

    fn new_tree(_row_size: usize) -> (NamedTempFile, TxPager) {
        let file = NamedTempFile::new().unwrap();
        let pager = Pager::open(file.path(), &EngineConfig::default()).unwrap();
        let mut txn = TxPager::new(Arc::new(Mutex::new(pager)));
        txn.begin(true).unwrap();
        let root = txn.get_free_page().unwrap();
        assert_eq!(root, 0);
        txn.write_page(0, Page::Leaf(LeafNode::empty(true, 0))).unwrap();
        (file, txn)
    }

    fn tree(txn: &mut TxPager, row_size: usize) -> BTree<'_> {
        BTree::new(txn, 0, row_size, PAGE_SIZE, RESERVE)
    }

    fn payload(row_size: usize, key: u64) -> Vec<u8> {
        let mut buf = vec![(key % 251) as u8; row_size];
        buf[0] = (key >> 8) as u8;
        buf
    }

    fn insert_keys(txn: &mut TxPager, row_size: usize, keys: impl Iterator<Item = u64>) {
        for key in keys {
            tree(txn, row_size)
                .insert(key, 0, payload(row_size, key))
                .unwrap();
        }
    }

    fn scan_keys(txn: &mut TxPager, row_size: usize) -> Vec<u64> {
        let mut t = tree(txn, row_size);
        let mut cursor = t.seek_first().unwrap();
        let mut keys = Vec::new();
        while let Some(cell) = t.fetch_cell(&mut cursor).unwrap() {
            keys.push(cell.key);
        }
        keys
    }

    /// Checks occupancy and pivot ordering over the whole tree.
    fn check_invariants(txn: &mut TxPager, row_size: usize) {
        let mut t = tree(txn, row_size);
        let leaf_half = half_capacity(t.leaf_max_cells(1));
        let internal_half = half_capacity(t.internal_max_keys(1));
        let mut checks: Vec<(u32, u64)> = Vec::new();
        t.bfs(&mut |page, node| {
            match node {
                Page::Leaf(leaf) => {
                    if !leaf.is_root {
                        assert!(
                            leaf.cells.len() >= leaf_half,
                            "leaf {} has {} cells, half is {}",
                            page,
                            leaf.cells.len(),
                            leaf_half
                        );
                    }
                    let keys: Vec<u64> = leaf.cells.iter().map(|c| c.key).collect();
                    let mut sorted = keys.clone();
                    sorted.sort_unstable();
                    sorted.dedup();
                    assert_eq!(keys, sorted, "leaf {} keys out of order", page);
                }
                Page::Internal(internal) => {
                    if !internal.is_root {
                        assert!(
                            internal.pivots.len() >= internal_half,
                            "internal {} has {} pivots, half is {}",
                            page,
                            internal.pivots.len(),
                            internal_half
                        );
                    }
                    for window in internal.pivots.windows(2) {
                        assert!(window[0].key < window[1].key);
                    }
                    for pivot in &internal.pivots {
                        checks.push((pivot.child, pivot.key));
                    }
                }
                other => panic!("unexpected {} page in tree", other.kind_name()),
            }
            Ok(())
        })
        .unwrap();
        // Every key under a pivot's subtree stays at or below the pivot key.
        for (child, bound) in checks {
            let max = t.node_max_key(child).unwrap();
            assert!(max <= bound, "child {} max {} above pivot {}", child, max, bound);
        }
    }

    #[test]
    fn test_insert_and_scan_ascending() {
        let (_file, mut txn) = new_tree(SMALL_ROW);
        insert_keys(&mut txn, SMALL_ROW, [5, 1, 9, 0, 7, 3, 8, 2, 6, 4].into_iter());
        assert_eq!(scan_keys(&mut txn, SMALL_ROW), (0..10).collect::<Vec<_>>());
        check_invariants(&mut txn, SMALL_ROW);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (_file, mut txn) = new_tree(SMALL_ROW);
        insert_keys(&mut txn, SMALL_ROW, 0..3);
        let err = tree(&mut txn, SMALL_ROW)
            .insert(1, 0, payload(SMALL_ROW, 1))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
        assert_eq!(scan_keys(&mut txn, SMALL_ROW), vec![0, 1, 2]);
    }

    #[test]
    fn test_root_leaf_split_layout() {
        // Six rows into a five-cell root leaf: the root becomes internal,
        // the original cells land on a fresh left child.
        let (_file, mut txn) = new_tree(SMALL_ROW);
        insert_keys(&mut txn, SMALL_ROW, 0..6);

        assert_eq!(txn.total_pages().unwrap(), 3);
        let root = tree(&mut txn, SMALL_ROW).get_internal(0).unwrap();
        assert!(root.is_root);
        assert_eq!(root.pivots, vec![Pivot { key: 2, child: 2 }]);
        assert_eq!(root.right_child, 1);

        let left = tree(&mut txn, SMALL_ROW).get_leaf(2).unwrap();
        let right = tree(&mut txn, SMALL_ROW).get_leaf(1).unwrap();
        assert_eq!(left.cells.iter().map(|c| c.key).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(right.cells.iter().map(|c| c.key).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(left.next_leaf, 1);
        assert_eq!(right.next_leaf, 0);
        assert_eq!(left.parent, 0);
        assert_eq!(right.parent, 0);
    }

    #[test]
    fn test_delete_merges_leftmost_leaves() {
        // Twenty sequential rows build a six-leaf tree; deleting row 0
        // underflows the first leaf, which merges with its right sibling.
        let (_file, mut txn) = new_tree(SMALL_ROW);
        insert_keys(&mut txn, SMALL_ROW, 0..20);
        assert_eq!(txn.total_pages().unwrap(), 7);

        tree(&mut txn, SMALL_ROW).delete(0).unwrap();

        let merged = tree(&mut txn, SMALL_ROW).get_leaf(2).unwrap();
        assert_eq!(
            merged.cells.iter().map(|c| c.key).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        let header = txn.header().unwrap();
        assert_eq!(header.first_free_page, 1);
        assert_eq!(header.free_page_count, 1);
        assert_eq!(scan_keys(&mut txn, SMALL_ROW), (1..20).collect::<Vec<_>>());
        check_invariants(&mut txn, SMALL_ROW);
    }

    #[test]
    fn test_root_internal_split() {
        // One row per leaf; the page-0 root internal holds 331 pivots, so
        // the 333rd leaf forces a root split into two internal children.
        let (_file, mut txn) = new_tree(BIG_ROW);
        assert_eq!(tree(&mut txn, BIG_ROW).leaf_max_cells(1), 1);
        assert_eq!(tree(&mut txn, BIG_ROW).internal_max_keys(0), 331);

        insert_keys(&mut txn, BIG_ROW, 0..333);

        assert_eq!(txn.total_pages().unwrap(), 336);
        let root = tree(&mut txn, BIG_ROW).get_internal(0).unwrap();
        assert_eq!(root.pivots.len(), 1);
        assert_eq!(root.pivots[0].key, 165);

        let left = tree(&mut txn, BIG_ROW).get_internal(root.pivots[0].child).unwrap();
        let right = tree(&mut txn, BIG_ROW).get_internal(root.right_child).unwrap();
        assert_eq!(left.pivots.len(), 165);
        assert_eq!(right.pivots.len(), 166);
        assert_ne!(left.right_child, RIGHT_CHILD_NOT_SET);
        assert_ne!(right.right_child, RIGHT_CHILD_NOT_SET);

        assert_eq!(scan_keys(&mut txn, BIG_ROW), (0..333).collect::<Vec<_>>());
        check_invariants(&mut txn, BIG_ROW);
    }

    #[test]
    fn test_delete_all_returns_pages_to_free_list() {
        let (_file, mut txn) = new_tree(SMALL_ROW);
        insert_keys(&mut txn, SMALL_ROW, 0..60);
        let peak = txn.total_pages().unwrap();
        assert!(peak > 3);

        for key in 0..60 {
            tree(&mut txn, SMALL_ROW).delete(key).unwrap();
        }
        assert_eq!(scan_keys(&mut txn, SMALL_ROW), Vec::<u64>::new());

        // Everything except the permanent root is on the free list, once.
        let header = txn.header().unwrap();
        assert_eq!(header.free_page_count, peak - 1);
        let mut free = Vec::new();
        let mut idx = header.first_free_page;
        while idx != 0 {
            assert!(!free.contains(&idx), "page {} freed twice", idx);
            free.push(idx);
            idx = txn.get_free(idx).unwrap().next_free;
        }
        assert_eq!(free.len() as u32, peak - 1);

        // Reinsertion reuses recycled pages instead of growing the file.
        insert_keys(&mut txn, SMALL_ROW, 0..60);
        assert_eq!(txn.total_pages().unwrap(), peak);
        check_invariants(&mut txn, SMALL_ROW);
    }

    #[test]
    fn test_borrow_from_right_sibling() {
        // Leaves {0,1,2} and {3..7}: deleting from the left leaf borrows
        // the right sibling's first cell and rotates the separator.
        let (_file, mut txn) = new_tree(SMALL_ROW);
        insert_keys(&mut txn, SMALL_ROW, 0..8);

        tree(&mut txn, SMALL_ROW).delete(0).unwrap();

        let left = tree(&mut txn, SMALL_ROW).get_leaf(2).unwrap();
        let right = tree(&mut txn, SMALL_ROW).get_leaf(1).unwrap();
        assert_eq!(left.cells.iter().map(|c| c.key).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(
            right.cells.iter().map(|c| c.key).collect::<Vec<_>>(),
            vec![4, 5, 6, 7]
        );
        let root = tree(&mut txn, SMALL_ROW).get_internal(0).unwrap();
        assert_eq!(root.pivots[0].key, 3);
        assert_eq!(txn.header().unwrap().free_page_count, 0);
        check_invariants(&mut txn, SMALL_ROW);
    }

    #[test]
    fn test_borrow_from_left_sibling() {
        // Fill the left leaf fuller than the right, then drain the right.
        let (_file, mut txn) = new_tree(SMALL_ROW);
        insert_keys(&mut txn, SMALL_ROW, 0..6);
        insert_keys(&mut txn, SMALL_ROW, [20, 21].into_iter());
        // Leaves now {0,1,2} and {3,4,5,20,21}.
        tree(&mut txn, SMALL_ROW).delete(20).unwrap();
        tree(&mut txn, SMALL_ROW).delete(21).unwrap();
        tree(&mut txn, SMALL_ROW).delete(5).unwrap();
        // Right leaf {3,4} underflowed; left {0,1,2} has exactly half, so
        // the two merge instead of borrowing.
        assert_eq!(scan_keys(&mut txn, SMALL_ROW), vec![0, 1, 2, 3, 4]);
        check_invariants(&mut txn, SMALL_ROW);
    }

    #[test]
    fn test_update_in_place_preserves_structure() {
        let (_file, mut txn) = new_tree(SMALL_ROW);
        insert_keys(&mut txn, SMALL_ROW, 0..10);
        let pages_before = txn.total_pages().unwrap();

        let new_payload = payload(SMALL_ROW, 99);
        tree(&mut txn, SMALL_ROW)
            .update_in_place(4, 0b1, new_payload.clone())
            .unwrap();

        assert_eq!(txn.total_pages().unwrap(), pages_before);
        let cell = tree(&mut txn, SMALL_ROW).get(4).unwrap().unwrap();
        assert_eq!(cell.null_mask, 0b1);
        assert_eq!(cell.payload, new_payload);
        assert!(matches!(
            tree(&mut txn, SMALL_ROW).update_in_place(404, 0, payload(SMALL_ROW, 0)),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_seek_next_row_id() {
        let (_file, mut txn) = new_tree(SMALL_ROW);
        let (_, id) = tree(&mut txn, SMALL_ROW).seek_next_row_id().unwrap();
        assert_eq!(id, 0);

        insert_keys(&mut txn, SMALL_ROW, 0..12);
        let (cursor, id) = tree(&mut txn, SMALL_ROW).seek_next_row_id().unwrap();
        assert!(cursor.end_of_table);
        assert_eq!(id, 12);

        // Row-ids never recycle: the basis is the highest key present.
        tree(&mut txn, SMALL_ROW).delete(11).unwrap();
        let (_, id) = tree(&mut txn, SMALL_ROW).seek_next_row_id().unwrap();
        assert_eq!(id, 11);
    }

    #[test]
    fn test_interleaved_inserts_and_deletes_keep_invariants() {
        let (_file, mut txn) = new_tree(SMALL_ROW);
        // Deterministic pseudo-random order via a multiplicative stride;
        // 73 is invertible mod 199, so the 199 keys are distinct.
        let keys: Vec<u64> = (0..199u64).map(|i| (i * 73) % 199).collect();
        insert_keys(&mut txn, SMALL_ROW, keys.iter().copied());
        check_invariants(&mut txn, SMALL_ROW);

        for key in keys.iter().filter(|k| *k % 3 != 0) {
            tree(&mut txn, SMALL_ROW).delete(*key).unwrap();
        }
        check_invariants(&mut txn, SMALL_ROW);

        let mut expected: Vec<u64> = keys.iter().copied().filter(|k| k % 3 == 0).collect();
        expected.sort_unstable();
        assert_eq!(scan_keys(&mut txn, SMALL_ROW), expected);
    }
}
