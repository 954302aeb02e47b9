//! File-backed page manager.
//!
//! The file is a contiguous run of fixed-size pages. Page 0 starts with the
//! reserved database-header region (free-list anchor) and always holds the
//! schema table's root node after it. Pages are cached decoded; reads hand
//! out owned copies and mutation is write-back through [`Pager::write_page`],
//! which marks the page dirty for the next flush.

use super::encoding::{ByteReader, ByteWriter};
use super::page::{FreePage, IndexKeyKind, IndexNode, OverflowPage, Page};
use crate::config::EngineConfig;
use crate::errors::Error;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info, trace};

/// Fields persisted in the reserved prefix of page 0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DatabaseHeader {
    /// Head of the free-page list; 0 means the list is empty.
    pub first_free_page: u32,
    pub free_page_count: u32,
}

impl DatabaseHeader {
    pub fn encode(&self, w: &mut ByteWriter, reserve: usize) {
        w.put_u32(self.first_free_page);
        w.put_u32(self.free_page_count);
        w.pad(reserve - 8);
    }

    pub fn decode(r: &mut ByteReader) -> Result<Self, Error> {
        Ok(DatabaseHeader {
            first_free_page: r.get_u32()?,
            free_page_count: r.get_u32()?,
        })
    }
}

#[derive(Debug)]
pub struct Pager {
    file: File,
    page_size: usize,
    reserve: usize,
    /// Pages the database occupies, including ones not yet flushed.
    total_pages: u32,
    /// Pages present in the file on disk.
    file_pages: u32,
    header: DatabaseHeader,
    header_dirty: bool,
    cache: HashMap<u32, Page>,
    dirty: HashSet<u32>,
}

impl Pager {
    /// Opens (or creates) a page file. A non-empty file must be a whole
    /// number of pages and yields its header from page 0.
    pub fn open(path: &Path, config: &EngineConfig) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let page_size = config.page_size;
        if len % page_size as u64 != 0 {
            return Err(err!(
                CorruptPage,
                "file length {} is not a multiple of the page size {}",
                len,
                page_size
            ));
        }
        let total_pages = (len / page_size as u64) as u32;

        let header = if total_pages > 0 {
            let mut buf = vec![0u8; config.root_page_config_size];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            DatabaseHeader::decode(&mut ByteReader::new(&buf))?
        } else {
            DatabaseHeader::default()
        };

        info!(
            path = %path.display(),
            total_pages,
            first_free_page = header.first_free_page,
            "Opened page file"
        );

        Ok(Pager {
            file,
            page_size,
            reserve: config.root_page_config_size,
            total_pages,
            file_pages: total_pages,
            header,
            header_dirty: total_pages == 0,
            cache: HashMap::new(),
            dirty: HashSet::new(),
        })
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn set_total_pages(&mut self, total: u32) {
        self.total_pages = total;
    }

    pub fn header(&self) -> DatabaseHeader {
        self.header
    }

    pub fn set_header(&mut self, header: DatabaseHeader) {
        if header != self.header {
            self.header = header;
            self.header_dirty = true;
        }
    }

    /// Byte offset where a page's node payload begins.
    fn node_offset(&self, idx: u32) -> usize {
        if idx == 0 {
            self.reserve
        } else {
            0
        }
    }

    fn read_raw(&mut self, idx: u32) -> Result<Vec<u8>, Error> {
        if idx >= self.total_pages {
            return Err(err!(
                CorruptPage,
                "page {} is out of bounds ({} pages)",
                idx,
                self.total_pages
            ));
        }
        if idx >= self.file_pages {
            return Err(err!(
                CorruptPage,
                "page {} was allocated but never written",
                idx
            ));
        }
        let mut buf = vec![0u8; self.page_size];
        self.file
            .seek(SeekFrom::Start(idx as u64 * self.page_size as u64))?;
        self.file.read_exact(&mut buf)?;
        trace!(page = idx, "Read page from file");
        Ok(buf)
    }

    /// Reads a row-tree node (leaf or internal).
    pub fn get_node(&mut self, idx: u32, row_size: usize) -> Result<Page, Error> {
        if let Some(page) = self.cache.get(&idx) {
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
        let raw = self.read_raw(idx)?;
        let page = Page::decode_tree_node(&raw[self.node_offset(idx)..], row_size)?;
        self.cache.insert(idx, page.clone());
        Ok(page)
    }

    pub fn get_overflow(&mut self, idx: u32) -> Result<OverflowPage, Error> {
        if let Some(page) = self.cache.get(&idx) {
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
        let raw = self.read_raw(idx)?;
        let page = OverflowPage::decode(&mut ByteReader::new(&raw))?;
        self.cache.insert(idx, Page::Overflow(page.clone()));
        Ok(page)
    }

    pub fn get_free(&mut self, idx: u32) -> Result<FreePage, Error> {
        if let Some(page) = self.cache.get(&idx) {
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
        let raw = self.read_raw(idx)?;
        let page = FreePage::decode(&mut ByteReader::new(&raw))?;
        self.cache.insert(idx, Page::Free(page));
        Ok(page)
    }

    pub fn get_index(&mut self, idx: u32, kind: IndexKeyKind) -> Result<IndexNode, Error> {
        if let Some(page) = self.cache.get(&idx) {
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
        let raw = self.read_raw(idx)?;
        let page = IndexNode::decode(&mut ByteReader::new(&raw), kind)?;
        self.cache.insert(idx, Page::Index(page.clone()));
        Ok(page)
    }

    /// Installs a page image and marks it for the next flush.
    pub fn write_page(&mut self, idx: u32, page: Page) {
        self.cache.insert(idx, page);
        self.dirty.insert(idx);
    }

    /// Pops the free-list head, or grows the database by one page.
    pub fn get_free_page(&mut self) -> Result<u32, Error> {
        if self.header.first_free_page != 0 {
            let idx = self.header.first_free_page;
            let free = self.get_free(idx)?;
            self.header.first_free_page = free.next_free;
            self.header.free_page_count = self.header.free_page_count.saturating_sub(1);
            self.header_dirty = true;
            self.cache.remove(&idx);
            self.dirty.remove(&idx);
            debug!(page = idx, "Recycled page from the free list");
            Ok(idx)
        } else {
            let idx = self.total_pages;
            self.total_pages += 1;
            debug!(page = idx, "Allocated fresh page");
            Ok(idx)
        }
    }

    /// Pushes a page onto the free list. Page 0 holds the schema root and
    /// the database header and can never be freed.
    pub fn add_free_page(&mut self, idx: u32) -> Result<(), Error> {
        if idx == 0 {
            return Err(err!(CorruptPage, "refusing to free page 0"));
        }
        let next_free = self.header.first_free_page;
        self.write_page(idx, Page::Free(FreePage { next_free }));
        self.header.first_free_page = idx;
        self.header.free_page_count += 1;
        self.header_dirty = true;
        debug!(page = idx, "Pushed page onto the free list");
        Ok(())
    }

    fn encode_page(&self, idx: u32, page: &Page) -> Result<Vec<u8>, Error> {
        let mut w = ByteWriter::with_capacity(self.page_size);
        if idx == 0 {
            self.header.encode(&mut w, self.reserve);
        }
        match page {
            Page::Leaf(node) => node.encode(&mut w),
            Page::Internal(node) => node.encode(&mut w),
            Page::Overflow(node) => node.encode(&mut w),
            Page::Free(node) => node.encode(&mut w),
            Page::Index(node) => node.encode(&mut w)?,
        }
        if w.len() > self.page_size {
            return Err(err!(
                CorruptPage,
                "page {} serialized to {} bytes, page size is {}",
                idx,
                w.len(),
                self.page_size
            ));
        }
        w.pad(self.page_size - w.len());
        Ok(w.into_bytes())
    }

    fn write_raw(&mut self, idx: u32, buf: &[u8]) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::Start(idx as u64 * self.page_size as u64))?;
        self.file.write_all(buf)?;
        if idx >= self.file_pages {
            self.file_pages = idx + 1;
        }
        Ok(())
    }

    /// Serializes one cached page back to the file. A page that fails to
    /// serialize is evicted from the cache so later reads go back to the
    /// file.
    pub fn flush_page(&mut self, idx: u32) -> Result<(), Error> {
        let page = match self.cache.get(&idx) {
            Some(page) => page.clone(),
            None => return Ok(()),
        };
        let buf = match self.encode_page(idx, &page) {
            Ok(buf) => buf,
            Err(e) => {
                self.cache.remove(&idx);
                self.dirty.remove(&idx);
                return Err(e);
            }
        };
        self.write_raw(idx, &buf)?;
        self.dirty.remove(&idx);
        if idx == 0 {
            self.header_dirty = false;
        }
        Ok(())
    }

    /// Best-effort flush of every dirty page plus the database header.
    pub fn flush_all(&mut self) -> Result<(), Error> {
        let mut pages: Vec<u32> = self.dirty.iter().copied().collect();
        pages.sort_unstable();
        for idx in pages {
            self.flush_page(idx)?;
        }
        if self.header_dirty {
            self.flush_header()?;
        }
        self.file.flush()?;
        info!(total_pages = self.total_pages, "Flushed page file");
        Ok(())
    }

    /// Rewrites only the reserved header region of page 0, preserving the
    /// schema root payload already on disk.
    fn flush_header(&mut self) -> Result<(), Error> {
        if self.dirty.contains(&0) || self.file_pages == 0 {
            // Page 0 itself is pending; its flush carries the header.
            return Ok(());
        }
        let mut w = ByteWriter::with_capacity(self.reserve);
        self.header.encode(&mut w, self.reserve);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(w.as_slice())?;
        self.header_dirty = false;
        Ok(())
    }

    /// Walks the free list, returning each free page index in order.
    /// Diagnostic helper for tests and integrity checks.
    pub fn free_list(&mut self) -> Result<Vec<u32>, Error> {
        let mut out = Vec::new();
        let mut idx = self.header.first_free_page;
        while idx != 0 {
            if out.contains(&idx) {
                return Err(err!(CorruptPage, "free list cycles through page {}", idx));
            }
            out.push(idx);
            idx = self.get_free(idx)?.next_free;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::LeafNode;
    use tempfile::NamedTempFile;

    fn open_temp() -> (NamedTempFile, Pager) {
        let file = NamedTempFile::new().unwrap();
        let pager = Pager::open(file.path(), &EngineConfig::default()).unwrap();
        (file, pager)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = DatabaseHeader {
            first_free_page: 5,
            free_page_count: 2,
        };
        let mut w = ByteWriter::new();
        header.encode(&mut w, 100);
        assert_eq!(w.len(), 100);
        let decoded = DatabaseHeader::decode(&mut ByteReader::new(w.as_slice())).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_grow_then_recycle() {
        let (_file, mut pager) = open_temp();
        assert_eq!(pager.get_free_page().unwrap(), 0);
        assert_eq!(pager.get_free_page().unwrap(), 1);
        assert_eq!(pager.get_free_page().unwrap(), 2);
        assert_eq!(pager.total_pages(), 3);

        pager.add_free_page(2).unwrap();
        pager.add_free_page(1).unwrap();
        assert_eq!(pager.header().free_page_count, 2);
        assert_eq!(pager.free_list().unwrap(), vec![1, 2]);

        // LIFO reuse, no growth.
        assert_eq!(pager.get_free_page().unwrap(), 1);
        assert_eq!(pager.get_free_page().unwrap(), 2);
        assert_eq!(pager.get_free_page().unwrap(), 3);
        assert_eq!(pager.header().free_page_count, 0);
    }

    #[test]
    fn test_page_zero_never_freed() {
        let (_file, mut pager) = open_temp();
        pager.get_free_page().unwrap();
        assert!(pager.add_free_page(0).is_err());
    }

    #[test]
    fn test_flush_and_reopen_preserves_header_and_pages() {
        let file = NamedTempFile::new().unwrap();
        let config = EngineConfig::default();
        {
            let mut pager = Pager::open(file.path(), &config).unwrap();
            for _ in 0..4 {
                let idx = pager.get_free_page().unwrap();
                pager.write_page(idx, Page::Leaf(LeafNode::empty(idx == 0, 0)));
            }
            pager.add_free_page(3).unwrap();
            pager.flush_all().unwrap();
        }

        let mut pager = Pager::open(file.path(), &config).unwrap();
        assert_eq!(pager.total_pages(), 4);
        assert_eq!(pager.header().first_free_page, 3);
        assert_eq!(pager.header().free_page_count, 1);
        assert_eq!(pager.free_list().unwrap(), vec![3]);

        let page = pager.get_node(1, 8).unwrap();
        assert!(matches!(page, Page::Leaf(_)));
    }

    #[test]
    fn test_wrong_variant_read_is_invalid_node_kind() {
        let (_file, mut pager) = open_temp();
        let idx = pager.get_free_page().unwrap();
        let idx1 = pager.get_free_page().unwrap();
        pager.write_page(idx, Page::Leaf(LeafNode::empty(true, 0)));
        pager.write_page(
            idx1,
            Page::Overflow(OverflowPage {
                next_page: 0,
                data: vec![1, 2, 3],
            }),
        );
        assert!(matches!(
            pager.get_overflow(idx),
            Err(Error::InvalidNodeKind(_))
        ));
        assert!(matches!(
            pager.get_node(idx1, 8),
            Err(Error::InvalidNodeKind(_))
        ));
    }

    #[test]
    fn test_page_zero_payload_starts_after_reserve() {
        let file = NamedTempFile::new().unwrap();
        let config = EngineConfig::default();
        {
            let mut pager = Pager::open(file.path(), &config).unwrap();
            let idx = pager.get_free_page().unwrap();
            assert_eq!(idx, 0);
            let mut node = LeafNode::empty(true, 0);
            node.cells.push(crate::storage::page::LeafCell {
                null_mask: 0,
                key: 1,
                payload: vec![7u8; 8],
            });
            pager.write_page(0, Page::Leaf(node));
            pager.flush_all().unwrap();
        }

        // The node discriminator must sit right after the reserved header.
        let bytes = std::fs::read(file.path()).unwrap();
        assert_eq!(bytes.len(), config.page_size);
        let mut pager = Pager::open(file.path(), &config).unwrap();
        let page = pager.get_node(0, 8).unwrap();
        match page {
            Page::Leaf(node) => {
                assert!(node.is_root);
                assert_eq!(node.cells.len(), 1);
                assert_eq!(node.cells[0].key, 1);
            }
            other => panic!("unexpected page kind {}", other.kind_name()),
        }
    }
}
