//! Cursor positions over the row-store tree.

/// A position within a table: a leaf page, a cell index inside it, and a
/// flag marking one-past-the-last-row. Movement happens through
/// [`BTree`](super::btree::BTree), which owns the pager access.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cursor {
    pub page: u32,
    pub cell: usize,
    /// Set when the cursor points past the last cell of the last leaf.
    pub end_of_table: bool,
}

impl Cursor {
    pub fn at(page: u32, cell: usize) -> Self {
        Cursor {
            page,
            cell,
            end_of_table: false,
        }
    }

    pub fn at_end(page: u32, cell: usize) -> Self {
        Cursor {
            page,
            cell,
            end_of_table: true,
        }
    }
}
