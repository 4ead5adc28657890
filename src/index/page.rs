//! Index leaf/node page format: prefix compression, the
//! entry-mask bitmap, and the on-disk byte layout. Decoded pages are kept
//! as a plain `Vec<Vec<u8>>` of entries and re-serialized on write; this
//! trades a little bit-twiddling efficiency for a page type simple enough
//! to reason about split/merge correctness against.

use crate::util;

pub const PAGE_TYPE_LEAF: u8 = 0x03;
pub const PAGE_TYPE_NODE: u8 = 0x04;

const OFF_TYPE: usize = 0;
const OFF_FREE_SPACE: usize = 2;
const OFF_TDEF_PAGE: usize = 4;
const OFF_PREV: usize = 12;
const OFF_NEXT: usize = 16;
const OFF_CHILD_TAIL: usize = 20;
const OFF_PREFIX_LEN: usize = 24;
const OFF_ENTRY_MASK: usize = 27;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    Leaf,
    Node,
}

/// Entry mask size in bytes, chosen so that
/// `min(page_size - entry_mask_offset - mask_bytes, mask_bytes * 8)` gives
/// a usable entry-stream budget: `mask_bytes ≈ (page_size - offset) / 9`.
pub fn entry_mask_bytes(page_size: usize) -> usize {
    ((page_size - OFF_ENTRY_MASK) / 9).max(1)
}

pub fn max_entry_stream_bytes(page_size: usize) -> usize {
    let mask_bytes = entry_mask_bytes(page_size);
    (page_size - OFF_ENTRY_MASK - mask_bytes).min(mask_bytes * 8)
}

/// One leaf or node page: an ordered run of entries sharing a common
/// prefix. Leaf entries are `key_bytes || page:3 || row:1`; node entries
/// additionally carry a 4-byte child page pointer appended by the caller
/// before insertion (this type treats both uniformly as opaque bytes).
pub struct IndexPage {
    pub page_number: u32,
    pub kind: PageKind,
    pub tdef_page: u32,
    pub prev: u32,
    pub next: u32,
    pub child_tail: u32,
    pub entries: Vec<Vec<u8>>,
    pub dirty: bool,
}

impl IndexPage {
    pub fn new(page_number: u32, kind: PageKind, tdef_page: u32) -> Self {
        IndexPage {
            page_number,
            kind,
            tdef_page,
            prev: 0,
            next: 0,
            child_tail: 0,
            entries: Vec::new(),
            dirty: true,
        }
    }

    fn common_prefix(&self) -> Vec<u8> {
        let mut iter = self.entries.iter();
        let Some(first) = iter.next() else {
            return Vec::new();
        };
        let mut len = first.len();
        for e in iter {
            len = util::common_prefix_len(&first[..len], e).min(len);
        }
        first[..len].to_vec()
    }

    /// Bytes occupied by this page's entry stream (after prefix
    /// compression) plus its entry mask, used to decide when a page must
    /// split.
    pub fn entry_stream_len(&self) -> usize {
        let prefix = self.common_prefix();
        let mut total = prefix.len();
        for (i, e) in self.entries.iter().enumerate() {
            total += if i == 0 { e.len() } else { e.len() - prefix.len() };
        }
        total
    }

    pub fn exceeds(&self, page_size: usize) -> bool {
        self.entry_stream_len() > max_entry_stream_bytes(page_size)
    }

    /// Find the insertion index maintaining sorted order; returns
    /// `Err(idx)` if an entry with this exact key prefix (ignoring the
    /// leaf trailer) already exists at `idx`, `Ok(idx)` otherwise.
    pub fn find_insertion_point(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|e| e.as_slice() < key)
    }

    pub fn insert(&mut self, entry: Vec<u8>) -> usize {
        let idx = self.find_insertion_point(&entry);
        self.entries.insert(idx, entry);
        self.dirty = true;
        idx
    }

    pub fn remove(&mut self, idx: usize) -> Vec<u8> {
        self.dirty = true;
        self.entries.remove(idx)
    }

    /// Split this page in half, returning a new page holding the upper
    /// half of entries. The caller is responsible for
    /// linking `prev`/`next` and promoting a separator key to the parent.
    pub fn split(&mut self, new_page_number: u32) -> IndexPage {
        let mid = self.entries.len() / 2;
        let upper = self.entries.split_off(mid);
        self.dirty = true;
        IndexPage {
            page_number: new_page_number,
            kind: self.kind,
            tdef_page: self.tdef_page,
            prev: self.page_number,
            next: self.next,
            child_tail: 0,
            entries: upper,
            dirty: true,
        }
    }

    pub fn to_bytes(&self, page_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; page_size];
        data[OFF_TYPE] = match self.kind {
            PageKind::Leaf => PAGE_TYPE_LEAF,
            PageKind::Node => PAGE_TYPE_NODE,
        };
        data[1] = 0x01;
        util::setu32(&mut data, OFF_TDEF_PAGE, self.tdef_page);
        util::setu32(&mut data, OFF_PREV, self.prev);
        util::setu32(&mut data, OFF_NEXT, self.next);
        util::setu32(&mut data, OFF_CHILD_TAIL, self.child_tail);

        let prefix = self.common_prefix();
        util::setu16(&mut data, OFF_PREFIX_LEN, prefix.len() as u16);

        let mask_bytes = entry_mask_bytes(page_size);
        let mut mask = vec![0u8; mask_bytes];
        let mut stream = Vec::new();
        for (i, e) in self.entries.iter().enumerate() {
            let body: &[u8] = if i == 0 { e } else { &e[prefix.len()..] };
            stream.extend_from_slice(body);
            let end_bit = stream.len() - 1;
            mask[end_bit / 8] |= 1 << (end_bit % 8);
        }

        let mask_off = OFF_ENTRY_MASK;
        data[mask_off..mask_off + mask_bytes].copy_from_slice(&mask);
        let prefix_off = mask_off + mask_bytes;
        data[prefix_off..prefix_off + prefix.len()].copy_from_slice(&prefix);
        let stream_off = prefix_off + prefix.len();
        data[stream_off..stream_off + stream.len()].copy_from_slice(&stream);

        let used = stream_off + stream.len();
        util::setu16(&mut data, OFF_FREE_SPACE, (page_size - used) as u16);
        data
    }

    pub fn from_bytes(page_number: u32, data: &[u8]) -> Self {
        let kind = match data[OFF_TYPE] {
            PAGE_TYPE_LEAF => PageKind::Leaf,
            PAGE_TYPE_NODE => PageKind::Node,
            other => panic!("not an index page: type {other:#x}"),
        };
        let tdef_page = util::getu32(data, OFF_TDEF_PAGE);
        let prev = util::getu32(data, OFF_PREV);
        let next = util::getu32(data, OFF_NEXT);
        let child_tail = util::getu32(data, OFF_CHILD_TAIL);
        let prefix_len = util::getu16(data, OFF_PREFIX_LEN) as usize;

        let mask_bytes = entry_mask_bytes(data.len());
        let mask_off = OFF_ENTRY_MASK;
        let mask = &data[mask_off..mask_off + mask_bytes];
        let prefix_off = mask_off + mask_bytes;
        let prefix = data[prefix_off..prefix_off + prefix_len].to_vec();
        let stream_off = prefix_off + prefix_len;

        let mut entries = Vec::new();
        let mut start = 0usize;
        let max_bits = mask_bytes * 8;
        for bit in 0..max_bits {
            if mask[bit / 8] & (1 << (bit % 8)) != 0 {
                let end = bit + 1;
                if stream_off + end > data.len() {
                    break;
                }
                let body = &data[stream_off + start..stream_off + end];
                let mut entry = if entries.is_empty() {
                    Vec::new()
                } else {
                    prefix.clone()
                };
                entry.extend_from_slice(body);
                entries.push(entry);
                start = end;
            }
        }

        IndexPage {
            page_number,
            kind,
            tdef_page,
            prev,
            next,
            child_tail,
            entries,
            dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut page = IndexPage::new(1, PageKind::Leaf, 9);
        page.insert(b"apple".to_vec());
        page.insert(b"apricot".to_vec());
        page.insert(b"banana".to_vec());
        let bytes = page.to_bytes(4096);
        let back = IndexPage::from_bytes(1, &bytes);
        assert_eq!(back.entries, page.entries);
    }

    #[test]
    fn split_preserves_order_and_links() {
        let mut page = IndexPage::new(1, PageKind::Leaf, 9);
        for i in 0..10u8 {
            page.insert(vec![i]);
        }
        let upper = page.split(2);
        assert_eq!(page.entries.len(), 5);
        assert_eq!(upper.entries.len(), 5);
        assert!(page.entries.last().unwrap() < upper.entries.first().unwrap());
        assert_eq!(upper.prev, 1);
    }
}
