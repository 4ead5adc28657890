//! Data page format: header, row-slot directory growing downward
//! from the header, row bodies growing upward from the end of the page,
//! and the overflow-row pointer protocol.

use crate::util;
use std::cell::RefCell;
use std::rc::Rc;

/// Shared handle to a page buffer, mirroring the way every page-owning
/// structure in this engine hands pages around by `Rc<RefCell<_>>` rather
/// than by value.
pub type PagePtr = Rc<RefCell<Page>>;

pub const PAGE_TYPE_DATA: u8 = 0x01;

const HEADER_LEN: usize = 14;
const SIZE_ROW_LOCATION: usize = 2;
const OFFSET_ROW_START: usize = HEADER_LEN;

const DELETED_ROW_MASK: u16 = 0x8000;
const OVERFLOW_ROW_MASK: u16 = 0x4000;
const ROW_OFFSET_MASK: u16 = 0x1FFF;

/// A single data page: header + slot directory (downward) + row bodies
/// (upward). Slot `n` is the `n`th row ever added to this page; a slot
/// stays valid (if only as a deleted marker) once assigned, per RowId's
/// `(page_number, row_number)` identity.
pub struct Page {
    pub data: Vec<u8>,
    pub page_number: u32,
    pub dirty: bool,
}

impl Page {
    pub fn new_data_page(page_number: u32, tdef_page: u32, page_size: usize) -> Self {
        let mut data = vec![0u8; page_size];
        data[0] = PAGE_TYPE_DATA;
        data[1] = 0x01;
        util::setu32(&mut data, 4, tdef_page);
        let mut page = Page {
            data,
            page_number,
            dirty: true,
        };
        page.set_free_space((page_size - HEADER_LEN) as u16);
        page
    }

    pub fn from_bytes(page_number: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data[0], PAGE_TYPE_DATA);
        Page {
            data,
            page_number,
            dirty: false,
        }
    }

    pub fn tdef_page(&self) -> u32 {
        util::getu32(&self.data, 4)
    }

    pub fn row_count(&self) -> u16 {
        util::getu16(&self.data, 12)
    }

    fn set_row_count(&mut self, n: u16) {
        util::setu16(&mut self.data, 12, n);
    }

    pub fn free_space(&self) -> u16 {
        util::getu16(&self.data, 2)
    }

    fn set_free_space(&mut self, n: u16) {
        util::setu16(&mut self.data, 2, n);
    }

    fn slot_offset(slot: u16) -> usize {
        OFFSET_ROW_START + slot as usize * SIZE_ROW_LOCATION
    }

    fn slot_value(&self, slot: u16) -> u16 {
        util::getu16(&self.data, Self::slot_offset(slot))
    }

    fn set_slot_value(&mut self, slot: u16, v: u16) {
        util::setu16(&mut self.data, Self::slot_offset(slot), v)
    }

    pub fn is_deleted(&self, slot: u16) -> bool {
        self.slot_value(slot) & DELETED_ROW_MASK != 0
    }

    pub fn is_overflow(&self, slot: u16) -> bool {
        self.slot_value(slot) & OVERFLOW_ROW_MASK != 0
    }

    pub fn row_offset(&self, slot: u16) -> usize {
        (self.slot_value(slot) & ROW_OFFSET_MASK) as usize
    }

    /// Raw bytes for a slot's body, without following the overflow chain.
    /// Body extent runs from this slot's offset up to the *previous* slot's
    /// offset (bodies were appended in slot order, growing toward lower
    /// addresses), or the end of the page for slot 0.
    pub fn row_bytes_raw(&self, slot: u16) -> &[u8] {
        let start = self.row_offset(slot);
        let end = if slot == 0 {
            self.data.len()
        } else {
            self.row_offset(slot - 1)
        };
        &self.data[start..end]
    }

    /// Decode an overflow pointer body: `(overflow_row_number,
    /// overflow_page_number)`.
    pub fn overflow_pointer(&self, slot: u16) -> (u8, u32) {
        debug_assert!(self.is_deleted(slot) && self.is_overflow(slot));
        let body = self.row_bytes_raw(slot);
        let row_number = body[0];
        let page_number = util::get_be(body, 1, 3) as u32;
        (row_number, page_number)
    }

    /// Append a new row body. Returns the assigned slot, or `None` if the
    /// page lacks free space for `body.len()` plus one slot entry.
    pub fn insert_row(&mut self, body: &[u8]) -> Option<u16> {
        let needed = body.len() + SIZE_ROW_LOCATION;
        if needed > self.free_space() as usize {
            return None;
        }
        let slot = self.row_count();
        let body_end = if slot == 0 {
            self.data.len()
        } else {
            self.row_offset(slot - 1)
        };
        let body_start = body_end - body.len();
        self.data[body_start..body_end].copy_from_slice(body);
        self.set_slot_value(slot, body_start as u16);
        self.set_row_count(slot + 1);
        self.set_free_space(self.free_space() - needed as u16);
        self.dirty = true;
        Some(slot)
    }

    /// Overwrite an existing slot's body in place (the new body must be no
    /// larger than the old one — callers enforce `new_size <= old_size`
    /// before calling this).
    pub fn overwrite_row(&mut self, slot: u16, body: &[u8]) {
        let start = self.row_offset(slot);
        debug_assert!(body.len() <= self.row_bytes_raw(slot).len());
        self.data[start..start + body.len()].copy_from_slice(body);
        self.dirty = true;
    }

    pub fn mark_deleted(&mut self, slot: u16) {
        let v = self.slot_value(slot) | DELETED_ROW_MASK;
        self.set_slot_value(slot, v);
        self.dirty = true;
    }

    /// Turn a slot into an overflow pointer to `(row_number, page_number)`
    /// elsewhere.
    pub fn write_overflow_pointer(&mut self, slot: u16, row_number: u8, page_number: u32) {
        let off = self.row_offset(slot);
        self.data[off] = row_number;
        util::set_be(&mut self.data, off + 1, page_number as u64, 3);
        let v = self.slot_value(slot) | DELETED_ROW_MASK | OVERFLOW_ROW_MASK;
        self.set_slot_value(slot, v);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_read_row() {
        let mut page = Page::new_data_page(1, 7, 4096);
        let slot = page.insert_row(b"hello").unwrap();
        assert_eq!(slot, 0);
        assert_eq!(page.row_bytes_raw(0), b"hello");
        assert_eq!(page.row_count(), 1);
        assert!(!page.is_deleted(0));
    }

    #[test]
    fn free_space_shrinks_on_insert() {
        let mut page = Page::new_data_page(1, 0, 4096);
        let before = page.free_space();
        page.insert_row(b"abcdef").unwrap();
        assert_eq!(page.free_space() as usize, before as usize - 6 - SIZE_ROW_LOCATION);
    }

    #[test]
    fn overflow_pointer_round_trips() {
        let mut page = Page::new_data_page(1, 0, 4096);
        page.insert_row(&[0u8; 10]).unwrap();
        page.write_overflow_pointer(0, 3, 0x01_02_03);
        assert!(page.is_deleted(0));
        assert!(page.is_overflow(0));
        assert_eq!(page.overflow_pointer(0), (3, 0x01_02_03));
    }

    #[test]
    fn insert_fails_when_full() {
        let mut page = Page::new_data_page(1, 0, 64);
        assert!(page.insert_row(&[0u8; 100]).is_none());
    }
}
