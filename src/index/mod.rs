//! B-tree index engine: page cache, cursor traversal with
//! modification tracking, and the pending-change commit/rollback protocol.

pub mod key;
pub mod page;

use crate::error::{Context, JetError, JetResult};
use crate::interfaces::PageChannel;
use page::{IndexPage, PageKind};
use std::cell::RefCell;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::rc::Rc;
use tracing::{debug, trace};

pub type IndexPagePtr = Rc<RefCell<IndexPage>>;

const LEAF_TRAILER_LEN: usize = 4; // page:3 || row:1
const NODE_TRAILER_LEN: usize = 8; // leaf trailer || child:4

fn entry_key_bytes(entry: &[u8], kind: PageKind) -> &[u8] {
    let trailer = match kind {
        PageKind::Leaf => LEAF_TRAILER_LEN,
        PageKind::Node => NODE_TRAILER_LEN,
    };
    &entry[..entry.len() - trailer]
}

fn child_pointer(entry: &[u8]) -> u32 {
    crate::util::getu32(entry, entry.len() - 4)
}

/// A page/row location decoded from a leaf entry's trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryRowId {
    pub page_number: u32,
    pub row_number: u8,
}

fn decode_row_id(entry: &[u8]) -> EntryRowId {
    let n = entry.len();
    let page_number = crate::util::get_be(entry, n - 4, 3) as u32;
    EntryRowId {
        page_number,
        row_number: entry[n - 1],
    }
}

/// In-memory cache mediating page loads, dirty tracking, and save/rollback
/// for one index's B-tree.
pub struct IndexCache {
    channel: Box<dyn PageChannel>,
    pages: RefCell<HashMap<u32, IndexPagePtr>>,
    dirty: RefCell<HashSet<u32>>,
    pub root: u32,
    pub mod_count: u64,
    tdef_page: u32,
}

impl IndexCache {
    pub fn create(mut channel: Box<dyn PageChannel>, tdef_page: u32) -> JetResult<Self> {
        let root = channel
            .allocate_new_page()
            .map_err(|e| JetError::io(e, Context::index("create")))?;
        let page = IndexPage::new(root, PageKind::Leaf, tdef_page);
        let bytes = page.to_bytes(channel.page_size());
        channel
            .write_page(root, &bytes)
            .map_err(|e| JetError::io(e, Context::index("create")))?;
        let mut pages = HashMap::default();
        pages.insert(root, Rc::new(RefCell::new(page)));
        Ok(IndexCache {
            channel,
            pages: RefCell::new(pages),
            dirty: RefCell::new(HashSet::default()),
            root,
            mod_count: 0,
            tdef_page,
        })
    }

    pub fn get_page(&self, page_number: u32) -> JetResult<IndexPagePtr> {
        if let Some(p) = self.pages.borrow().get(&page_number) {
            return Ok(p.clone());
        }
        let mut buf = self.channel.create_page_buffer();
        self.channel.read_page(page_number, &mut buf).map_err(|e| {
            let err = JetError::io(e, Context::index("load"));
            if err.is_physical() {
                self.rollback();
            }
            err
        })?;
        let page = IndexPage::from_bytes(page_number, &buf);
        let ptr = Rc::new(RefCell::new(page));
        self.pages.borrow_mut().insert(page_number, ptr.clone());
        Ok(ptr)
    }

    fn mark_dirty(&self, page_number: u32) {
        self.dirty.borrow_mut().insert(page_number);
    }

    fn new_page(&mut self, kind: PageKind) -> JetResult<IndexPagePtr> {
        let page_number = self.channel.allocate_new_page().map_err(|e| {
            let err = JetError::io(e, Context::index("split"));
            if err.is_physical() {
                self.rollback();
            }
            err
        })?;
        let page = IndexPage::new(page_number, kind, self.tdef_page);
        let ptr = Rc::new(RefCell::new(page));
        self.pages.borrow_mut().insert(page_number, ptr.clone());
        self.mark_dirty(page_number);
        Ok(ptr)
    }

    /// Descend node pages comparing `key` against each node entry,
    /// recursing through the matching child, until a leaf is reached.
    pub fn find_data_page(&self, key: &[u8]) -> JetResult<IndexPagePtr> {
        let mut current = self.get_page(self.root)?;
        loop {
            let (kind, next_page) = {
                let page = current.borrow();
                if page.kind == PageKind::Leaf {
                    (page.kind, None)
                } else {
                    let idx = page
                        .entries
                        .partition_point(|e| entry_key_bytes(e, PageKind::Node) < key.as_ref());
                    let target = if idx < page.entries.len() {
                        child_pointer(&page.entries[idx])
                    } else {
                        page.child_tail
                    };
                    (page.kind, Some(target))
                }
            };
            match next_page {
                None => return Ok(current),
                Some(p) => current = self.get_page(p)?,
            }
            let _ = kind;
        }
    }

    pub fn get_data_page(&self, page_number: u32) -> JetResult<IndexPagePtr> {
        self.get_page(page_number)
    }

    /// Insert a leaf entry, splitting (and promoting a separator upward)
    /// as needed. Returns whether an entry with byte-identical key bytes
    /// already existed (used by the unique-constraint check).
    pub fn insert_leaf_entry(&mut self, entry: Vec<u8>) -> JetResult<bool> {
        let leaf = self.find_data_page(entry_key_bytes(&entry, PageKind::Leaf))?;
        let is_dupe = {
            let page = leaf.borrow();
            let idx = page.find_insertion_point(&entry);
            idx < page.entries.len()
                && entry_key_bytes(&page.entries[idx], PageKind::Leaf)
                    == entry_key_bytes(&entry, PageKind::Leaf)
        };
        let page_number = leaf.borrow().page_number;
        leaf.borrow_mut().insert(entry);
        self.mark_dirty(page_number);
        self.mod_count += 1;

        let (exceeds, page_size) = {
            let page = leaf.borrow();
            (page.exceeds(self.channel.page_size()), self.channel.page_size())
        };
        if exceeds {
            self.split_page(leaf, page_size)?;
        }
        Ok(is_dupe)
    }

    fn split_page(&mut self, page: IndexPagePtr, page_size: usize) -> JetResult<()> {
        debug!(page = page.borrow().page_number, "splitting index page");
        let kind = page.borrow().kind;
        let new_ptr = self.new_page(kind)?;
        let new_page_number = new_ptr.borrow().page_number;

        let upper = page.borrow_mut().split(new_page_number);
        let old_next = page.borrow().next;
        *new_ptr.borrow_mut() = upper;
        new_ptr.borrow_mut().next = old_next;
        page.borrow_mut().next = new_page_number;
        self.mark_dirty(page.borrow().page_number);
        self.mark_dirty(new_page_number);

        let separator = new_ptr.borrow().entries[0].clone();
        self.promote_separator(page.borrow().page_number, new_page_number, separator, kind, page_size)
    }

    fn promote_separator(
        &mut self,
        left: u32,
        right: u32,
        separator: Vec<u8>,
        child_kind: PageKind,
        page_size: usize,
    ) -> JetResult<()> {
        let _ = child_kind;
        if left == self.root {
            let new_root = self.new_page(PageKind::Node)?;
            let mut root = new_root.borrow_mut();
            // Node entries are key || leaf-trailer || child:4, built from
            // the separator's own leaf/node entry bytes plus the left
            // child's page number.
            let mut entry = separator.clone();
            entry.extend_from_slice(&left.to_le_bytes());
            root.entries.push(entry);
            root.child_tail = right;
            drop(root);
            self.root = new_root.borrow().page_number;
            self.mark_dirty(self.root);
            trace!(new_root = self.root, "promoted new root");
            return Ok(());
        }
        // Locate the parent of `left` by walking from the root; a direct
        // parent pointer isn't kept on each page so this mirrors the
        // lookup the original insert already performed.
        let parent = self.find_parent(left)?;
        let mut entry = separator;
        entry.extend_from_slice(&left.to_le_bytes());
        let parent_number = parent.borrow().page_number;
        parent.borrow_mut().insert(entry);
        if parent.borrow().child_tail == 0 {
            parent.borrow_mut().child_tail = right;
        }
        self.mark_dirty(parent_number);
        if parent.borrow().exceeds(page_size) {
            self.split_page(parent, page_size)?;
        }
        Ok(())
    }

    fn find_parent(&self, child: u32) -> JetResult<IndexPagePtr> {
        let mut current = self.get_page(self.root)?;
        loop {
            let (is_leaf, next) = {
                let page = current.borrow();
                if page.kind == PageKind::Leaf {
                    (true, 0)
                } else if page.child_tail == child
                    || page.entries.iter().any(|e| child_pointer(e) == child)
                {
                    (true, 0) // current page *is* the parent
                } else {
                    let idx = page
                        .entries
                        .partition_point(|e| child_pointer(e) < child);
                    let target = if idx < page.entries.len() {
                        child_pointer(&page.entries[idx])
                    } else {
                        page.child_tail
                    };
                    (false, target)
                }
            };
            if is_leaf {
                return Ok(current);
            }
            current = self.get_page(next)?;
        }
    }

    /// Remove a leaf entry matching `key` exactly. Returns the removed
    /// entry, if found.
    pub fn remove_leaf_entry(&mut self, key: &[u8]) -> JetResult<Option<Vec<u8>>> {
        let leaf = self.find_data_page(key)?;
        let idx = {
            let page = leaf.borrow();
            page.entries
                .iter()
                .position(|e| entry_key_bytes(e, PageKind::Leaf) == key)
        };
        let page_number = leaf.borrow().page_number;
        let removed = idx.map(|i| leaf.borrow_mut().remove(i));
        if removed.is_some() {
            self.mark_dirty(page_number);
            self.mod_count += 1;
        }
        Ok(removed)
    }

    /// Flush every dirty page to the page channel.
    pub fn save(&mut self) -> JetResult<()> {
        self.channel.start_exclusive_write();
        let dirty: Vec<u32> = self.dirty.borrow().iter().copied().collect();
        for page_number in dirty {
            // Clone the Rc (not a reference) so the borrow of `self.pages`
            // is released before a physical failure tries to roll it back.
            let ptr = self.pages.borrow().get(&page_number).cloned();
            if let Some(ptr) = ptr {
                let bytes = ptr.borrow().to_bytes(self.channel.page_size());
                self.channel.write_page(page_number, &bytes).map_err(|e| {
                    let err = JetError::io(e, Context::index("save"));
                    if err.is_physical() {
                        self.rollback();
                    }
                    err
                })?;
                ptr.borrow_mut().dirty = false;
            }
        }
        self.dirty.borrow_mut().clear();
        self.channel.finish_write();
        Ok(())
    }

    /// Discard all cached pages so the next access re-reads from disk —
    /// the response to a physical I/O failure. Takes `&self`: both fields
    /// are already interior-mutable, so this can run from a read path
    /// (`get_page`) as well as a write path.
    pub fn rollback(&self) {
        self.pages.borrow_mut().clear();
        self.dirty.borrow_mut().clear();
    }
}

/// A cursor position: the data page, index within it, and whether the
/// position is *between* two adjacent entries.
#[derive(Clone)]
pub struct Position {
    pub page_number: u32,
    pub index: usize,
    pub between: bool,
}

impl Position {
    pub fn next_index(&self) -> usize {
        if self.between {
            self.index
        } else {
            self.index + 1
        }
    }

    pub fn prev_index(&self) -> usize {
        self.index.wrapping_sub(1)
    }
}

/// Traverses an index's leaf chain, re-validating against `mod_count` on
/// every use and relocating itself if the index changed since creation.
pub struct EntryCursor {
    first_pos: Position,
    last_pos: Position,
    cur_pos: Position,
    prev_pos: Position,
    mod_count: u64,
    lower_key: Vec<u8>,
    upper_key: Vec<u8>,
}

impl EntryCursor {
    pub fn new(cache: &IndexCache, lower_key: Vec<u8>, upper_key: Vec<u8>) -> JetResult<Self> {
        let first_pos = Self::locate(cache, &lower_key)?;
        let last_pos = Self::locate(cache, &upper_key)?;
        Ok(EntryCursor {
            cur_pos: first_pos.clone(),
            prev_pos: first_pos.clone(),
            first_pos,
            last_pos,
            mod_count: cache.mod_count,
            lower_key,
            upper_key,
        })
    }

    fn locate(cache: &IndexCache, key: &[u8]) -> JetResult<Position> {
        let page = cache.find_data_page(key)?;
        let page = page.borrow();
        let idx = page
            .entries
            .partition_point(|e| entry_key_bytes(e, page.kind) < key);
        let between = idx >= page.entries.len()
            || entry_key_bytes(&page.entries[idx], page.kind) != key;
        Ok(Position {
            page_number: page.page_number,
            index: idx,
            between,
        })
    }

    fn relocate(&mut self, cache: &IndexCache) -> JetResult<()> {
        if self.mod_count == cache.mod_count {
            return Ok(());
        }
        trace!(old = self.mod_count, new = cache.mod_count, "cursor relocating");
        self.first_pos = Self::locate(cache, &self.lower_key)?;
        self.last_pos = Self::locate(cache, &self.upper_key)?;
        self.cur_pos = self.first_pos.clone();
        self.prev_pos = self.first_pos.clone();
        self.mod_count = cache.mod_count;
        Ok(())
    }

    pub fn get_next_entry(&mut self, cache: &IndexCache) -> JetResult<Option<Vec<u8>>> {
        self.relocate(cache)?;
        let page = cache.get_data_page(self.cur_pos.page_number)?;
        let idx = self.cur_pos.next_index();
        let entry = page.borrow().entries.get(idx).cloned();
        if entry.is_some() {
            self.prev_pos = self.cur_pos.clone();
            self.cur_pos = Position {
                page_number: self.cur_pos.page_number,
                index: idx,
                between: false,
            };
        }
        Ok(entry)
    }

    pub fn get_previous_entry(&mut self, cache: &IndexCache) -> JetResult<Option<Vec<u8>>> {
        self.relocate(cache)?;
        let page = cache.get_data_page(self.cur_pos.page_number)?;
        let idx = self.cur_pos.prev_index();
        let entry = page.borrow().entries.get(idx).cloned();
        if entry.is_some() {
            self.cur_pos = Position {
                page_number: self.cur_pos.page_number,
                index: idx,
                between: false,
            };
        }
        Ok(entry)
    }
}

/// One prepared-but-not-yet-committed index mutation. `commit` applies the
/// change and returns a [`CommittedChange`] that can undo it.
pub enum PendingChange {
    Add {
        entry: Vec<u8>,
        is_dupe_entry: bool,
        replaced_old_entry: Option<Vec<u8>>,
    },
    Remove {
        key: Vec<u8>,
    },
}

impl PendingChange {
    pub fn prepare_add_row(cache: &IndexCache, entry: Vec<u8>, unique: bool) -> JetResult<Self> {
        let key = entry_key_bytes(&entry, PageKind::Leaf);
        let is_null_key = key.first() == Some(&0x00) || key.first() == Some(&0xFF);
        let dupe = if unique && !is_null_key {
            cache
                .find_data_page(key)?
                .borrow()
                .entries
                .iter()
                .any(|e| entry_key_bytes(e, PageKind::Leaf) == key)
        } else {
            false
        };
        Ok(PendingChange::Add {
            entry,
            is_dupe_entry: dupe,
            replaced_old_entry: None,
        })
    }

    pub fn prepare_update_row(old_entry: Vec<u8>, new_entry: Vec<u8>) -> Self {
        PendingChange::Add {
            entry: new_entry,
            is_dupe_entry: false,
            replaced_old_entry: Some(old_entry),
        }
    }

    /// Apply the change, returning a [`CommittedChange`] that can reverse
    /// exactly this application if a later change in the same batch fails.
    pub fn commit(self, cache: &mut IndexCache) -> JetResult<CommittedChange> {
        match self {
            PendingChange::Add {
                entry,
                is_dupe_entry,
                replaced_old_entry,
            } => {
                if is_dupe_entry {
                    return Err(JetError::constraint_violation(
                        "duplicate key in unique index",
                        Context::default(),
                    ));
                }
                let inserted_key = entry_key_bytes(&entry, PageKind::Leaf).to_vec();
                if let Some(old) = &replaced_old_entry {
                    cache.remove_leaf_entry(entry_key_bytes(old, PageKind::Leaf))?;
                }
                cache.insert_leaf_entry(entry)?;
                Ok(CommittedChange::Added {
                    inserted_key,
                    replaced_old_entry,
                })
            }
            PendingChange::Remove { key } => {
                let removed = cache.remove_leaf_entry(&key)?;
                Ok(CommittedChange::Removed { entry: removed })
            }
        }
    }
}

/// The effect of a successfully applied [`PendingChange`], kept around long
/// enough to undo it if a later change in the same `commit_all` batch fails.
pub enum CommittedChange {
    Added {
        inserted_key: Vec<u8>,
        replaced_old_entry: Option<Vec<u8>>,
    },
    Removed {
        entry: Option<Vec<u8>>,
    },
}

impl CommittedChange {
    /// Undo this change against the same cache it was committed to.
    pub fn rollback(self, cache: &mut IndexCache) {
        match self {
            CommittedChange::Added {
                inserted_key,
                replaced_old_entry,
            } => {
                let _ = cache.remove_leaf_entry(&inserted_key);
                if let Some(old) = replaced_old_entry {
                    let _ = cache.insert_leaf_entry(old);
                }
            }
            CommittedChange::Removed { entry } => {
                if let Some(entry) = entry {
                    let _ = cache.insert_leaf_entry(entry);
                }
            }
        }
    }
}

/// Commit a chain of pending changes (one per backing index) in order. On
/// any failure, every change already committed earlier in this same call is
/// rolled back (in reverse order) before the error is returned, so a
/// multi-index write never leaves some indexes updated and others not.
pub fn commit_all(cache_and_changes: Vec<(&mut IndexCache, PendingChange)>) -> JetResult<()> {
    let mut applied: Vec<(&mut IndexCache, CommittedChange)> = Vec::with_capacity(cache_and_changes.len());
    for (cache, change) in cache_and_changes {
        match change.commit(cache) {
            Ok(committed) => applied.push((cache, committed)),
            Err(e) => {
                for (cache, committed) in applied.into_iter().rev() {
                    committed.rollback(cache);
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::page::PageKind;
    use std::cell::RefCell as StdRefCell;
    use std::collections::HashMap as StdHashMap;

    struct MemChannel {
        pages: StdRefCell<StdHashMap<u32, Vec<u8>>>,
        next: StdRefCell<u32>,
        page_size: usize,
    }

    impl MemChannel {
        fn new(page_size: usize) -> Self {
            MemChannel {
                pages: StdRefCell::new(StdHashMap::new()),
                next: StdRefCell::new(1),
                page_size,
            }
        }
    }

    impl PageChannel for MemChannel {
        fn page_size(&self) -> usize {
            self.page_size
        }
        fn read_page(&self, page_number: u32, buf: &mut [u8]) -> std::io::Result<()> {
            if let Some(p) = self.pages.borrow().get(&page_number) {
                buf.copy_from_slice(p);
            }
            Ok(())
        }
        fn write_page(&mut self, page_number: u32, buf: &[u8]) -> std::io::Result<()> {
            self.pages.borrow_mut().insert(page_number, buf.to_vec());
            Ok(())
        }
        fn allocate_new_page(&mut self) -> std::io::Result<u32> {
            let mut n = self.next.borrow_mut();
            let p = *n;
            *n += 1;
            Ok(p)
        }
    }

    #[test]
    fn insert_and_find_roundtrip() {
        let mut cache = IndexCache::create(Box::new(MemChannel::new(4096)), 0).unwrap();
        let entry = key::encode_composite(
            &[(crate::value::Value::Long(42), true)],
            key::NumericKeyVariant::Current,
            7,
            1,
        );
        let dupe = cache.insert_leaf_entry(entry.clone()).unwrap();
        assert!(!dupe);
        let page = cache.find_data_page(entry_key_bytes(&entry, PageKind::Leaf)).unwrap();
        assert_eq!(page.borrow().entries.len(), 1);
    }

    #[test]
    fn split_triggers_when_page_fills() {
        let mut cache = IndexCache::create(Box::new(MemChannel::new(512)), 0).unwrap();
        for i in 0..200i64 {
            let entry = key::encode_composite(
                &[(crate::value::Value::Long(i as i32), true)],
                key::NumericKeyVariant::Current,
                1,
                0,
            );
            cache.insert_leaf_entry(entry).unwrap();
        }
        assert!(cache.root != 1 || cache.pages.borrow().len() > 1);
    }
}
