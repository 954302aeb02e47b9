//! Overflow chains for text values too large to inline in a leaf cell.
//!
//! A chain is a singly linked list of overflow pages, each holding
//! `page_size - 8` payload bytes at most; `next_page == 0` terminates it.

use super::page::{OverflowPage, Page, OVERFLOW_HEADER_SIZE};
use super::txn::TxPager;
use crate::errors::Error;
use tracing::debug;

/// Payload bytes one overflow page can hold.
pub fn page_capacity(page_size: usize) -> usize {
    page_size - OVERFLOW_HEADER_SIZE
}

/// Writes `data` into a freshly allocated chain and returns the first page.
pub fn write_chain(txn: &mut TxPager, data: &[u8], page_size: usize) -> Result<u32, Error> {
    if data.is_empty() {
        return Err(err!(CorruptPage, "refusing to write an empty overflow chain"));
    }
    let capacity = page_capacity(page_size);
    let chunks: Vec<&[u8]> = data.chunks(capacity).collect();

    let mut pages = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        pages.push(txn.get_free_page()?);
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let next_page = pages.get(i + 1).copied().unwrap_or(0);
        txn.write_page(
            pages[i],
            Page::Overflow(OverflowPage {
                next_page,
                data: chunk.to_vec(),
            }),
        )?;
    }
    debug!(
        first_page = pages[0],
        pages = pages.len(),
        bytes = data.len(),
        "Wrote overflow chain"
    );
    Ok(pages[0])
}

/// Follows a chain from `first_page` until `length` bytes are collected.
pub fn read_chain(txn: &mut TxPager, first_page: u32, length: usize) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(length);
    let mut idx = first_page;
    while out.len() < length {
        if idx == 0 {
            return Err(err!(
                CorruptPage,
                "overflow chain ended after {} of {} bytes",
                out.len(),
                length
            ));
        }
        let page = txn.get_overflow(idx)?;
        out.extend_from_slice(&page.data);
        idx = page.next_page;
    }
    out.truncate(length);
    Ok(out)
}

/// Returns every page of a chain to the free list.
pub fn free_chain(txn: &mut TxPager, first_page: u32) -> Result<(), Error> {
    let mut idx = first_page;
    let mut freed = 0u32;
    while idx != 0 {
        let next = txn.get_overflow(idx)?.next_page;
        txn.add_free_page(idx)?;
        idx = next;
        freed += 1;
    }
    debug!(first_page, pages = freed, "Freed overflow chain");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::pager::Pager;
    use std::sync::{Arc, Mutex};
    use tempfile::NamedTempFile;

    fn txn_pager() -> (NamedTempFile, TxPager) {
        let file = NamedTempFile::new().unwrap();
        let pager = Pager::open(file.path(), &EngineConfig::default()).unwrap();
        let mut txn = TxPager::new(Arc::new(Mutex::new(pager)));
        txn.begin(true).unwrap();
        (file, txn)
    }

    #[test]
    fn test_single_page_chain_roundtrip() {
        let (_file, mut txn) = txn_pager();
        let data = vec![7u8; 1000];
        let first = write_chain(&mut txn, &data, 4096).unwrap();
        assert_eq!(read_chain(&mut txn, first, data.len()).unwrap(), data);
    }

    #[test]
    fn test_multi_page_chain_roundtrip() {
        let (_file, mut txn) = txn_pager();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let first = write_chain(&mut txn, &data, 4096).unwrap();

        // 20000 bytes over 4088-byte payloads is a 5-page chain.
        assert_eq!(txn.total_pages().unwrap(), 5);
        assert_eq!(read_chain(&mut txn, first, data.len()).unwrap(), data);
    }

    #[test]
    fn test_free_chain_recycles_every_page() {
        let (_file, mut txn) = txn_pager();
        let data = vec![1u8; 10_000];
        let first = write_chain(&mut txn, &data, 4096).unwrap();
        let pages = txn.total_pages().unwrap();

        free_chain(&mut txn, first).unwrap();
        assert_eq!(txn.header().unwrap().free_page_count, pages);

        // A new chain of the same size reuses the freed pages.
        let again = write_chain(&mut txn, &data, 4096).unwrap();
        assert_eq!(txn.total_pages().unwrap(), pages);
        assert_eq!(txn.header().unwrap().free_page_count, 0);
        assert_eq!(read_chain(&mut txn, again, data.len()).unwrap(), data);
    }

    #[test]
    fn test_truncated_chain_is_corrupt() {
        let (_file, mut txn) = txn_pager();
        let data = vec![9u8; 100];
        let first = write_chain(&mut txn, &data, 4096).unwrap();
        let err = read_chain(&mut txn, first, 200).unwrap_err();
        assert!(matches!(err, Error::CorruptPage(_)));
    }
}
