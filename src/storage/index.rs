//! The unique-key B-tree index used for primary keys.
//!
//! Unlike the row store this is a classical B-tree: keys live in every
//! node, leaves carry an explicit `is_leaf` flag, and each cell maps a
//! typed key to the row-id that owns it. Inserts split full nodes from the
//! root downward about their median; deletes follow the textbook casework,
//! restoring occupancy with a borrow or merge before descending. The root
//! page never moves, so the catalog can keep pointing at it.
//!
//! Cell `i`'s child holds keys below `key_i`; the header's right child
//! holds keys above the last cell. The child slot is unused (zero) on
//! leaves. The occupancy floor is the classical ⌊(max−1)/2⌋, which
//! guarantees two floors plus a separator always fit back into one node.

use super::page::{index_capacity, IndexCell, IndexKey, IndexKeyKind, IndexNode, Page,
    RIGHT_CHILD_NOT_SET};
use super::txn::TxPager;
use crate::errors::Error;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// A per-index view of the tree: root page, key kind and page capacity.
pub struct IndexTree<'a> {
    txn: &'a mut TxPager,
    root_page: u32,
    kind: IndexKeyKind,
    page_size: usize,
}

impl<'a> IndexTree<'a> {
    pub fn new(txn: &'a mut TxPager, root_page: u32, kind: IndexKeyKind, page_size: usize) -> Self {
        IndexTree {
            txn,
            root_page,
            kind,
            page_size,
        }
    }

    pub fn root_page(&self) -> u32 {
        self.root_page
    }

    pub fn max_keys(&self) -> usize {
        index_capacity(self.page_size, self.kind.width())
    }

    fn min_keys(&self) -> usize {
        (self.max_keys() - 1) / 2
    }

    fn get(&mut self, page: u32) -> Result<IndexNode, Error> {
        self.txn.get_index(page, self.kind)
    }

    fn put(&mut self, page: u32, node: IndexNode) -> Result<(), Error> {
        self.txn.write_page(page, Page::Index(node))
    }

    fn set_parent(&mut self, page: u32, parent: u32) -> Result<(), Error> {
        let mut node = self.get(page)?;
        node.parent = parent;
        self.put(page, node)
    }

    /// Looks a key up, returning its row-id when present.
    pub fn seek(&mut self, key: &IndexKey) -> Result<Option<u64>, Error> {
        let mut page = self.root_page;
        loop {
            let node = self.get(page)?;
            let pos = node.cells.partition_point(|c| c.key < *key);
            if let Some(cell) = node.cells.get(pos) {
                if cell.key == *key {
                    return Ok(Some(cell.row_id));
                }
            }
            if node.is_leaf {
                return Ok(None);
            }
            page = node.child_at(pos);
            if page == RIGHT_CHILD_NOT_SET {
                return Ok(None);
            }
        }
    }

    /// Rightmost key in the index, the autoincrement basis.
    pub fn seek_last_key(&mut self) -> Result<Option<IndexKey>, Error> {
        let mut page = self.root_page;
        loop {
            let node = self.get(page)?;
            if node.is_leaf {
                return Ok(node.cells.last().map(|c| c.key.clone()));
            }
            if node.right_child == RIGHT_CHILD_NOT_SET {
                return Ok(None);
            }
            page = node.right_child;
        }
    }

    /// Inserts a key. An existing key fails with `DuplicateKey` before any
    /// page is touched.
    pub fn insert(&mut self, key: IndexKey, row_id: u64) -> Result<(), Error> {
        if self.seek(&key)?.is_some() {
            return Err(err!(DuplicateKey, "key {:?} already exists", key));
        }
        let root = self.get(self.root_page)?;
        if root.cells.len() >= self.max_keys() {
            self.split_root()?;
        }
        self.insert_nonfull(self.root_page, key, row_id)
    }

    /// Moves the root's content into a fresh child and splits that child,
    /// keeping the root page in place.
    fn split_root(&mut self) -> Result<(), Error> {
        let root = self.get(self.root_page)?;
        let moved_page = self.txn.get_free_page()?;
        let moved = IndexNode {
            kind: self.kind,
            is_root: false,
            is_leaf: root.is_leaf,
            parent: self.root_page,
            right_child: root.right_child,
            cells: root.cells.clone(),
        };
        let children = moved.children();
        self.put(moved_page, moved)?;
        for child in children {
            self.set_parent(child, moved_page)?;
        }
        let new_root = IndexNode {
            kind: self.kind,
            is_root: true,
            is_leaf: false,
            parent: 0,
            right_child: moved_page,
            cells: Vec::new(),
        };
        self.put(self.root_page, new_root)?;
        debug!(root = self.root_page, moved_page, "Split index root");
        self.split_child(self.root_page, 0)
    }

    /// Splits the full child at position `pos` of `parent_page` about its
    /// median, promoting the median cell into the parent.
    fn split_child(&mut self, parent_page: u32, pos: usize) -> Result<(), Error> {
        let mut parent = self.get(parent_page)?;
        let child_page = parent.child_at(pos);
        let mut child = self.get(child_page)?;

        let median = child.cells.len() / 2;
        let right_cells = child.cells.split_off(median + 1);
        let promoted = child
            .cells
            .pop()
            .ok_or_else(|| err!(CorruptPage, "splitting an empty index node {}", child_page))?;

        let right_page = self.txn.get_free_page()?;
        let right = IndexNode {
            kind: self.kind,
            is_root: false,
            is_leaf: child.is_leaf,
            parent: parent_page,
            right_child: child.right_child,
            cells: right_cells,
        };
        if !child.is_leaf {
            child.right_child = promoted.child;
        }
        debug!(
            child_page,
            right_page,
            promoted_row = promoted.row_id,
            "Split index node"
        );

        let promoted_cell = IndexCell {
            key: promoted.key,
            row_id: promoted.row_id,
            child: child_page,
        };
        if pos < parent.cells.len() {
            parent.cells[pos].child = right_page;
            parent.cells.insert(pos, promoted_cell);
        } else {
            parent.right_child = right_page;
            parent.cells.push(promoted_cell);
        }

        let moved_children = right.children();
        self.put(child_page, child)?;
        self.put(right_page, right)?;
        self.put(parent_page, parent)?;
        for child in moved_children {
            self.set_parent(child, right_page)?;
        }
        Ok(())
    }

    /// Descends to a leaf, splitting any full child met along the way.
    fn insert_nonfull(&mut self, page: u32, key: IndexKey, row_id: u64) -> Result<(), Error> {
        let mut page = page;
        loop {
            let node = self.get(page)?;
            let pos = node.cells.partition_point(|c| c.key < key);
            if let Some(cell) = node.cells.get(pos) {
                if cell.key == key {
                    return Err(err!(DuplicateKey, "key {:?} already exists", key));
                }
            }
            if node.is_leaf {
                let mut node = node;
                node.cells.insert(
                    pos,
                    IndexCell {
                        key,
                        row_id,
                        child: 0,
                    },
                );
                trace!(page, row_id, "Inserted index cell");
                return self.put(page, node);
            }
            let child_page = node.child_at(pos);
            if self.get(child_page)?.cells.len() >= self.max_keys() {
                self.split_child(page, pos)?;
                // The promoted median changed this node; re-route.
                let node = self.get(page)?;
                let pos = node.cells.partition_point(|c| c.key < key);
                if let Some(cell) = node.cells.get(pos) {
                    if cell.key == key {
                        return Err(err!(DuplicateKey, "key {:?} already exists", key));
                    }
                }
                page = node.child_at(pos);
            } else {
                page = child_page;
            }
        }
    }

    /// Removes a key, collapsing the root when it runs out of cells.
    pub fn delete(&mut self, key: &IndexKey) -> Result<(), Error> {
        self.delete_from(self.root_page, key)?;

        let root = self.get(self.root_page)?;
        if !root.is_leaf && root.cells.is_empty() {
            let child_page = root.right_child;
            let mut child = self.get(child_page)?;
            child.is_root = true;
            child.parent = 0;
            let grandchildren = child.children();
            self.put(self.root_page, child)?;
            for child in grandchildren {
                self.set_parent(child, self.root_page)?;
            }
            self.txn.add_free_page(child_page)?;
            debug!(root = self.root_page, child_page, "Collapsed index root");
        }
        Ok(())
    }

    fn delete_from(&mut self, page: u32, key: &IndexKey) -> Result<(), Error> {
        let node = self.get(page)?;
        let pos = node.cells.partition_point(|c| c.key < *key);
        let found = node
            .cells
            .get(pos)
            .map(|c| c.key == *key)
            .unwrap_or(false);

        if node.is_leaf {
            if !found {
                return Err(err!(KeyNotFound, "key {:?} not in the index", key));
            }
            let mut node = node;
            node.cells.remove(pos);
            trace!(page, "Deleted index cell");
            return self.put(page, node);
        }

        if found {
            let left_page = node.child_at(pos);
            let right_page = node.child_at(pos + 1);
            let min = self.min_keys();

            if self.get(left_page)?.cells.len() > min {
                // Replace with the predecessor and delete it below.
                let (pred_key, pred_row) = self.max_cell_of(left_page)?;
                let mut node = self.get(page)?;
                node.cells[pos].key = pred_key.clone();
                node.cells[pos].row_id = pred_row;
                self.put(page, node)?;
                return self.delete_from(left_page, &pred_key);
            }
            if self.get(right_page)?.cells.len() > min {
                let (succ_key, succ_row) = self.min_cell_of(right_page)?;
                let mut node = self.get(page)?;
                node.cells[pos].key = succ_key.clone();
                node.cells[pos].row_id = succ_row;
                self.put(page, node)?;
                return self.delete_from(right_page, &succ_key);
            }
            // Both children at the floor: pull the separator down into a
            // merged node and delete the key there.
            self.merge_children(page, pos)?;
            return self.delete_from(left_page, key);
        }

        let child_page = node.child_at(pos);
        if self.get(child_page)?.cells.len() <= self.min_keys() {
            let child_page = self.fill_child(page, pos)?;
            return self.delete_from(child_page, key);
        }
        self.delete_from(child_page, key)
    }

    /// Brings the child at `pos` above the floor before a descent, by
    /// borrowing (left sibling first) or merging (right sibling first).
    /// Returns the page to descend into.
    fn fill_child(&mut self, parent_page: u32, pos: usize) -> Result<u32, Error> {
        let parent = self.get(parent_page)?;
        let child_page = parent.child_at(pos);
        let min = self.min_keys();

        if pos > 0 {
            let left_page = parent.child_at(pos - 1);
            if self.get(left_page)?.cells.len() > min {
                self.borrow_left(parent_page, pos)?;
                return Ok(child_page);
            }
        }
        if pos < parent.cells.len() {
            let right_page = parent.child_at(pos + 1);
            if self.get(right_page)?.cells.len() > min {
                self.borrow_right(parent_page, pos)?;
                return Ok(child_page);
            }
        }
        if pos < parent.cells.len() {
            self.merge_children(parent_page, pos)?;
            Ok(child_page)
        } else {
            self.merge_children(parent_page, pos - 1)?;
            Ok(parent.child_at(pos - 1))
        }
    }

    /// Rotates the left sibling's last cell through the separator.
    fn borrow_left(&mut self, parent_page: u32, pos: usize) -> Result<(), Error> {
        let mut parent = self.get(parent_page)?;
        let child_page = parent.child_at(pos);
        let left_page = parent.child_at(pos - 1);
        let mut child = self.get(child_page)?;
        let mut left = self.get(left_page)?;

        let last = left
            .cells
            .pop()
            .ok_or_else(|| err!(CorruptPage, "borrowing from an empty index node {}", left_page))?;
        let moved_subtree = if child.is_leaf { 0 } else { left.right_child };
        if !left.is_leaf {
            left.right_child = last.child;
        }
        let separator = &mut parent.cells[pos - 1];
        child.cells.insert(
            0,
            IndexCell {
                key: separator.key.clone(),
                row_id: separator.row_id,
                child: moved_subtree,
            },
        );
        separator.key = last.key;
        separator.row_id = last.row_id;
        debug!(child_page, left_page, "Borrowed index cell from left sibling");

        let reparent = !child.is_leaf;
        self.put(left_page, left)?;
        self.put(child_page, child)?;
        self.put(parent_page, parent)?;
        if reparent {
            self.set_parent(moved_subtree, child_page)?;
        }
        Ok(())
    }

    /// Rotates the right sibling's first cell through the separator.
    fn borrow_right(&mut self, parent_page: u32, pos: usize) -> Result<(), Error> {
        let mut parent = self.get(parent_page)?;
        let child_page = parent.child_at(pos);
        let right_page = parent.child_at(pos + 1);
        let mut child = self.get(child_page)?;
        let mut right = self.get(right_page)?;

        if right.cells.is_empty() {
            return Err(err!(
                CorruptPage,
                "borrowing from an empty index node {}",
                right_page
            ));
        }
        let first = right.cells.remove(0);
        let moved_subtree = first.child;
        let separator = &mut parent.cells[pos];
        child.cells.push(IndexCell {
            key: separator.key.clone(),
            row_id: separator.row_id,
            child: if child.is_leaf { 0 } else { child.right_child },
        });
        if !child.is_leaf {
            child.right_child = moved_subtree;
        }
        separator.key = first.key;
        separator.row_id = first.row_id;
        debug!(child_page, right_page, "Borrowed index cell from right sibling");

        let reparent = !child.is_leaf;
        self.put(right_page, right)?;
        self.put(child_page, child)?;
        self.put(parent_page, parent)?;
        if reparent {
            self.set_parent(moved_subtree, child_page)?;
        }
        Ok(())
    }

    /// Merges child(pos), the separator cell, and child(pos+1) into the
    /// left child; frees the right page.
    fn merge_children(&mut self, parent_page: u32, pos: usize) -> Result<(), Error> {
        let mut parent = self.get(parent_page)?;
        let left_page = parent.child_at(pos);
        let right_page = parent.child_at(pos + 1);
        let mut left = self.get(left_page)?;
        let right = self.get(right_page)?;

        let separator = parent.cells.remove(pos);
        if pos < parent.cells.len() {
            parent.cells[pos].child = left_page;
        } else {
            parent.right_child = left_page;
        }

        let separator_child = if left.is_leaf { 0 } else { left.right_child };
        left.cells.push(IndexCell {
            key: separator.key,
            row_id: separator.row_id,
            child: separator_child,
        });
        let absorbed = right.children();
        left.cells.extend(right.cells);
        if !left.is_leaf {
            left.right_child = right.right_child;
        }
        debug!(left_page, right_page, "Merged index nodes");

        self.put(left_page, left)?;
        self.put(parent_page, parent)?;
        for child in absorbed {
            self.set_parent(child, left_page)?;
        }
        self.txn.add_free_page(right_page)
    }

    fn max_cell_of(&mut self, page: u32) -> Result<(IndexKey, u64), Error> {
        let mut page = page;
        loop {
            let node = self.get(page)?;
            if node.is_leaf {
                let cell = node
                    .cells
                    .last()
                    .ok_or_else(|| err!(CorruptPage, "index node {} has no cells", page))?;
                return Ok((cell.key.clone(), cell.row_id));
            }
            page = node.right_child;
        }
    }

    fn min_cell_of(&mut self, page: u32) -> Result<(IndexKey, u64), Error> {
        let mut page = page;
        loop {
            let node = self.get(page)?;
            if node.is_leaf {
                let cell = node
                    .cells
                    .first()
                    .ok_or_else(|| err!(CorruptPage, "index node {} has no cells", page))?;
                return Ok((cell.key.clone(), cell.row_id));
            }
            page = node.child_at(0);
        }
    }

    /// Level-order walk, used by table drop and tests.
    pub fn bfs(
        &mut self,
        visit: &mut dyn FnMut(u32, &IndexNode) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut queue = VecDeque::from([self.root_page]);
        while let Some(page) = queue.pop_front() {
            let node = self.get(page)?;
            queue.extend(node.children());
            visit(page, &node)?;
        }
        Ok(())
    }

    /// Every page of the index, root first.
    pub fn pages(&mut self) -> Result<Vec<u32>, Error> {
        let mut out = Vec::new();
        self.bfs(&mut |page, _| {
            out.push(page);
            Ok(())
        })?;
        Ok(out)
    }
}
