//! File-backed page storage: a single `std::fs::File`, seek-then-read/
//! write, no internal buffering. The engine is explicitly single-threaded,
//! so there is no `Mutex`/`Send + Sync` wrapping around the file handle.

use crate::interfaces::PageChannel;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

/// A [`PageChannel`] backed directly by a file on disk. Page 0 is reserved
/// for the format's root/header page; pages are allocated by appending to
/// the end of the file.
pub struct FilePageChannel {
    file: fs::File,
    page_size: usize,
    next_page: u32,
    in_exclusive_write: bool,
}

impl FilePageChannel {
    /// Open (creating if absent) `path` as a page store with `page_size`
    /// bytes per page. `next_page` is derived from the current file length.
    pub fn open(path: &str, page_size: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let next_page = (len / page_size as u64) as u32;
        Ok(FilePageChannel {
            file,
            page_size,
            next_page: next_page.max(1),
            in_exclusive_write: false,
        })
    }
}

impl PageChannel for FilePageChannel {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_number: u32, buf: &mut [u8]) -> std::io::Result<()> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(page_number as u64 * self.page_size as u64))?;
        match file.read_exact(buf) {
            Ok(()) => Ok(()),
            // A page past the current end of file reads as all zeros,
            // matching a freshly allocated but not-yet-written page.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                buf.fill(0);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn write_page(&mut self, page_number: u32, buf: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(page_number as u64 * self.page_size as u64))?;
        self.file.write_all(buf)
    }

    fn allocate_new_page(&mut self) -> std::io::Result<u32> {
        let p = self.next_page;
        self.next_page += 1;
        Ok(p)
    }

    fn start_exclusive_write(&mut self) {
        self.in_exclusive_write = true;
    }

    fn finish_write(&mut self) {
        self.in_exclusive_write = false;
        let _ = self.file.sync_data();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_page_reads_as_zero() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("jetcore_test_{}.jdb", std::process::id()));
        let path_str = path.to_str().unwrap();
        {
            let channel = FilePageChannel::open(path_str, 4096).unwrap();
            let mut buf = vec![0xFFu8; 4096];
            channel.read_page(5, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == 0));
        }
        let _ = fs::remove_file(path);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("jetcore_test_rw_{}.jdb", std::process::id()));
        let path_str = path.to_str().unwrap();
        {
            let mut channel = FilePageChannel::open(path_str, 512).unwrap();
            let page = channel.allocate_new_page().unwrap();
            let data = vec![0xABu8; 512];
            channel.write_page(page, &data).unwrap();
            let mut buf = vec![0u8; 512];
            channel.read_page(page, &mut buf).unwrap();
            assert_eq!(buf, data);
        }
        let _ = fs::remove_file(path);
    }
}
