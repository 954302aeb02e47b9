//! Copy-on-write transaction overlay on top of the base pager.
//!
//! Each connection owns one of these. While a transaction is active, every
//! page written lands in the overlay map; reads consult the overlay before
//! the base pager. The database header and the page count are overlaid the
//! same way, so free-list mutations and file growth commit atomically and
//! disappear on rollback.

use super::page::{FreePage, IndexKeyKind, IndexNode, OverflowPage, Page};
use super::pager::{DatabaseHeader, Pager};
use crate::errors::Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

#[derive(Debug)]
struct Overlay {
    pages: HashMap<u32, Page>,
    header: DatabaseHeader,
    total_pages: u32,
    explicit: bool,
}

#[derive(Debug)]
pub struct TxPager {
    base: Arc<Mutex<Pager>>,
    overlay: Option<Overlay>,
}

impl TxPager {
    pub fn new(base: Arc<Mutex<Pager>>) -> Self {
        TxPager {
            base,
            overlay: None,
        }
    }

    fn base(&self) -> Result<MutexGuard<'_, Pager>, Error> {
        self.base
            .lock()
            .map_err(|_| err!(CorruptPage, "base pager mutex poisoned"))
    }

    pub fn in_transaction(&self) -> bool {
        self.overlay.is_some()
    }

    /// Whether the active transaction was opened by an explicit BEGIN (as
    /// opposed to statement autocommit).
    pub fn is_explicit(&self) -> bool {
        self.overlay.as_ref().map(|ov| ov.explicit).unwrap_or(false)
    }

    /// Starts a transaction. Only one can be active per connection.
    pub fn begin(&mut self, explicit: bool) -> Result<(), Error> {
        if self.overlay.is_some() {
            return Err(err!(
                UnrecognizedStatement,
                "a transaction is already in progress"
            ));
        }
        let (header, total_pages) = {
            let base = self.base()?;
            (base.header(), base.total_pages())
        };
        self.overlay = Some(Overlay {
            pages: HashMap::new(),
            header,
            total_pages,
            explicit,
        });
        trace!(explicit, "Began transaction");
        Ok(())
    }

    /// Installs the overlay into the base pager. Pages become visible (and
    /// dirty) together with the header and page count.
    pub fn commit(&mut self) -> Result<(), Error> {
        let overlay = self.overlay.take().ok_or_else(|| {
            err!(UnrecognizedStatement, "no transaction is in progress")
        })?;
        let mut base = self.base()?;
        let pages = overlay.pages.len();
        for (idx, page) in overlay.pages {
            base.write_page(idx, page);
        }
        base.set_header(overlay.header);
        base.set_total_pages(overlay.total_pages);
        debug!(pages, "Committed transaction");
        Ok(())
    }

    /// Discards the overlay; the base pager is untouched.
    pub fn rollback(&mut self) -> Result<(), Error> {
        let overlay = self.overlay.take().ok_or_else(|| {
            err!(UnrecognizedStatement, "no transaction is in progress")
        })?;
        debug!(pages = overlay.pages.len(), "Rolled back transaction");
        Ok(())
    }

    /// Discards the overlay if one is active. Used when unwinding failed
    /// statements.
    pub fn rollback_if_active(&mut self) {
        if self.overlay.take().is_some() {
            debug!("Rolled back transaction after a failed statement");
        }
    }

    pub fn total_pages(&self) -> Result<u32, Error> {
        if let Some(ov) = &self.overlay {
            return Ok(ov.total_pages);
        }
        Ok(self.base()?.total_pages())
    }

    pub fn header(&self) -> Result<DatabaseHeader, Error> {
        if let Some(ov) = &self.overlay {
            return Ok(ov.header);
        }
        Ok(self.base()?.header())
    }

    pub fn get_node(&mut self, idx: u32, row_size: usize) -> Result<Page, Error> {
        if let Some(ov) = &self.overlay {
            if let Some(page) = ov.pages.get(&idx) {
                return match page {
                    Page::Leaf(_) | Page::Internal(_) => Ok(page.clone()),
                    other => Err(err!(
                        InvalidNodeKind,
                        "page {} is a {} page, not a tree node",
                        idx,
                        other.kind_name()
                    )),
                };
            }
        }
        self.base()?.get_node(idx, row_size)
    }

    pub fn get_overflow(&mut self, idx: u32) -> Result<OverflowPage, Error> {
        if let Some(ov) = &self.overlay {
            if let Some(page) = ov.pages.get(&idx) {
                return match page {
                    Page::Overflow(p) => Ok(p.clone()),
                    other => Err(err!(
                        InvalidNodeKind,
                        "page {} is a {} page, not overflow",
                        idx,
                        other.kind_name()
                    )),
                };
            }
        }
        self.base()?.get_overflow(idx)
    }

    pub fn get_index(&mut self, idx: u32, kind: IndexKeyKind) -> Result<IndexNode, Error> {
        if let Some(ov) = &self.overlay {
            if let Some(page) = ov.pages.get(&idx) {
                return match page {
                    Page::Index(p) => Ok(p.clone()),
                    other => Err(err!(
                        InvalidNodeKind,
                        "page {} is a {} page, not an index node",
                        idx,
                        other.kind_name()
                    )),
                };
            }
        }
        self.base()?.get_index(idx, kind)
    }

    pub fn get_free(&mut self, idx: u32) -> Result<FreePage, Error> {
        if let Some(ov) = &self.overlay {
            if let Some(page) = ov.pages.get(&idx) {
                return match page {
                    Page::Free(p) => Ok(*p),
                    other => Err(err!(
                        InvalidNodeKind,
                        "page {} is a {} page, not free",
                        idx,
                        other.kind_name()
                    )),
                };
            }
        }
        self.base()?.get_free(idx)
    }

    /// Installs a page image. Inside a transaction it lands in the overlay;
    /// outside it goes straight to the base pager.
    pub fn write_page(&mut self, idx: u32, page: Page) -> Result<(), Error> {
        if let Some(ov) = &mut self.overlay {
            ov.pages.insert(idx, page);
            return Ok(());
        }
        self.base()?.write_page(idx, page);
        Ok(())
    }

    /// Pops the free-list head or grows the page count, all against the
    /// overlay when a transaction is active.
    pub fn get_free_page(&mut self) -> Result<u32, Error> {
        let first = match &self.overlay {
            None => return self.base()?.get_free_page(),
            Some(ov) => ov.header.first_free_page,
        };
        if first != 0 {
            let next_free = self.get_free(first)?.next_free;
            if let Some(ov) = &mut self.overlay {
                ov.header.first_free_page = next_free;
                ov.header.free_page_count = ov.header.free_page_count.saturating_sub(1);
                ov.pages.remove(&first);
            }
            debug!(page = first, "Recycled page from the free list");
            return Ok(first);
        }
        if let Some(ov) = &mut self.overlay {
            let idx = ov.total_pages;
            ov.total_pages += 1;
            debug!(page = idx, "Allocated fresh page");
            return Ok(idx);
        }
        self.base()?.get_free_page()
    }

    /// Pushes a page onto the free list. Refuses page 0.
    pub fn add_free_page(&mut self, idx: u32) -> Result<(), Error> {
        if self.overlay.is_none() {
            return self.base()?.add_free_page(idx);
        }
        if idx == 0 {
            return Err(err!(CorruptPage, "refusing to free page 0"));
        }
        if let Some(ov) = &mut self.overlay {
            let next_free = ov.header.first_free_page;
            ov.pages.insert(idx, Page::Free(FreePage { next_free }));
            ov.header.first_free_page = idx;
            ov.header.free_page_count += 1;
        }
        debug!(page = idx, "Pushed page onto the free list");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::page::{LeafCell, LeafNode};
    use tempfile::NamedTempFile;

    fn shared_pager() -> (NamedTempFile, Arc<Mutex<Pager>>) {
        let file = NamedTempFile::new().unwrap();
        let pager = Pager::open(file.path(), &EngineConfig::default()).unwrap();
        (file, Arc::new(Mutex::new(pager)))
    }

    fn leaf_with_key(key: u64) -> Page {
        let mut node = LeafNode::empty(true, 0);
        node.cells.push(LeafCell {
            null_mask: 0,
            key,
            payload: vec![0u8; 8],
        });
        Page::Leaf(node)
    }

    #[test]
    fn test_overlay_reads_own_writes() {
        let (_file, base) = shared_pager();
        let mut txn = TxPager::new(base.clone());

        txn.begin(true).unwrap();
        let idx = txn.get_free_page().unwrap();
        txn.write_page(idx, leaf_with_key(42)).unwrap();

        let page = txn.get_node(idx, 8).unwrap();
        match page {
            Page::Leaf(node) => assert_eq!(node.cells[0].key, 42),
            other => panic!("unexpected {}", other.kind_name()),
        }

        // Base pager still knows nothing about the page.
        assert_eq!(base.lock().unwrap().total_pages(), 0);
    }

    #[test]
    fn test_rollback_leaves_base_untouched() {
        let (_file, base) = shared_pager();
        {
            let mut pager = base.lock().unwrap();
            let idx = pager.get_free_page().unwrap();
            pager.write_page(idx, leaf_with_key(1));
        }

        let mut txn = TxPager::new(base.clone());
        txn.begin(true).unwrap();
        txn.write_page(0, leaf_with_key(99)).unwrap();
        let extra = txn.get_free_page().unwrap();
        txn.write_page(extra, leaf_with_key(100)).unwrap();
        txn.add_free_page(extra).unwrap();
        txn.rollback().unwrap();

        let mut pager = base.lock().unwrap();
        assert_eq!(pager.total_pages(), 1);
        assert_eq!(pager.header(), DatabaseHeader::default());
        match pager.get_node(0, 8).unwrap() {
            Page::Leaf(node) => assert_eq!(node.cells[0].key, 1),
            other => panic!("unexpected {}", other.kind_name()),
        }
    }

    #[test]
    fn test_commit_installs_pages_header_and_growth() {
        let (_file, base) = shared_pager();
        let mut txn = TxPager::new(base.clone());

        txn.begin(false).unwrap();
        let a = txn.get_free_page().unwrap();
        let b = txn.get_free_page().unwrap();
        txn.write_page(a, leaf_with_key(7)).unwrap();
        txn.write_page(b, leaf_with_key(8)).unwrap();
        txn.add_free_page(b).unwrap();
        txn.commit().unwrap();

        let mut pager = base.lock().unwrap();
        assert_eq!(pager.total_pages(), 2);
        assert_eq!(pager.header().first_free_page, b);
        assert_eq!(pager.header().free_page_count, 1);
        assert_eq!(pager.free_list().unwrap(), vec![b]);
        match pager.get_node(a, 8).unwrap() {
            Page::Leaf(node) => assert_eq!(node.cells[0].key, 7),
            other => panic!("unexpected {}", other.kind_name()),
        }
    }

    #[test]
    fn test_free_list_pop_within_transaction() {
        let (_file, base) = shared_pager();
        {
            let mut pager = base.lock().unwrap();
            for _ in 0..3 {
                pager.get_free_page().unwrap();
            }
            pager.write_page(0, leaf_with_key(1));
            pager.write_page(1, leaf_with_key(2));
            pager.write_page(2, leaf_with_key(3));
            pager.add_free_page(2).unwrap();
        }

        let mut txn = TxPager::new(base.clone());
        txn.begin(true).unwrap();
        // Pops the freed page first, then grows.
        assert_eq!(txn.get_free_page().unwrap(), 2);
        assert_eq!(txn.get_free_page().unwrap(), 3);
        assert_eq!(txn.header().unwrap().free_page_count, 0);

        // Until commit, the base free list is unchanged.
        assert_eq!(base.lock().unwrap().header().free_page_count, 1);
        txn.commit().unwrap();
        assert_eq!(base.lock().unwrap().header().free_page_count, 0);
        assert_eq!(base.lock().unwrap().total_pages(), 4);
    }

    #[test]
    fn test_only_one_transaction_per_connection() {
        let (_file, base) = shared_pager();
        let mut txn = TxPager::new(base);
        txn.begin(true).unwrap();
        assert!(txn.begin(true).is_err());
        txn.rollback().unwrap();
        assert!(txn.rollback().is_err());
        assert!(txn.commit().is_err());
    }
}
