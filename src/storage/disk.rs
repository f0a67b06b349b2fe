//! # Disk Handler
//!
//! This module owns the database file: the descriptor, the advisory lock,
//! and the read mapping. It is the only component that touches the OS.
//!
//! ## I/O Model
//!
//! Reads of committed pages go through a read-only mmap of the file, so a
//! page fetch is pointer arithmetic plus a bounds check. Writes never go
//! through the map: shadow pages are positional `write_at` calls followed by
//! an explicit fsync, which keeps the commit ordering (data pages before the
//! meta page) under the engine's control rather than the kernel's.
//!
//! ## Mapping Window
//!
//! The file is mapped with a window of at least `INIT_MMAP_SIZE` (1 GiB),
//! far beyond EOF for small databases. The window only needs rebuilding
//! when the allocation watermark crosses it; `remap` requires `&mut self`,
//! so the borrow checker guarantees no page view outlives a rebuild, and the
//! database serializes remaps behind an exclusive lock that waits for all
//! readers.
//!
//! ## Advisory Lock
//!
//! An exclusive advisory lock is taken on the file at open and held until
//! the handler drops. A second opener, from this or any other process,
//! observes `Locked` immediately and may retry.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use fs2::FileExt as _;
use memmap2::{Mmap, MmapOptions};
use tracing::{debug, trace};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::storage::page::{PageBuf, PageHeader, Pgid};

#[derive(Debug)]
pub struct Disk {
    file: File,
    path: PathBuf,
    map: Mmap,
    map_len: usize,
    page_size: usize,
}

impl Disk {
    /// Opens or creates the database file, takes the advisory lock, and maps
    /// a read window over it. Formatting an empty file is the caller's job.
    pub fn open(path: &Path, options: &Options) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::Locked);
        }

        let file_size = file.metadata()?.len();
        let map_len = required_window(options.mmap_size, file_size, options.page_size);
        let map = Self::map_window(&file, map_len)?;

        trace!(
            path = %path.display(),
            file_size,
            map_len,
            "opened database file"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            map,
            map_len,
            page_size: options.page_size,
        })
    }

    fn map_window(file: &File, len: usize) -> Result<Mmap> {
        // SAFETY: mapping a file we hold exclusively locked. The map is
        // read-only; commits write pages the active meta does not reference
        // yet, so no live view ever observes bytes changing under it. The
        // window may extend past EOF, which is fine to map; the engine only
        // dereferences pages below the committed watermark, which the file
        // always covers.
        let map = unsafe { MmapOptions::new().len(len).map(file)? };
        Ok(map)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Adopts the page size recorded in the file's meta pages.
    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn map_len(&self) -> usize {
        self.map_len
    }

    pub fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Borrowed view of one physical page, with magic and id asserted.
    pub fn page(&self, id: Pgid) -> Result<&[u8]> {
        let offset = id as usize * self.page_size;
        if offset + self.page_size > self.map_len {
            return Err(Error::corrupt(format!(
                "page {id} beyond the mapped window ({} bytes)",
                self.map_len
            )));
        }
        let data = &self.map[offset..offset + self.page_size];
        PageHeader::from_bytes(data)?.validate(id)?;
        Ok(data)
    }

    /// Borrowed view of a full logical page: `(overflow + 1)` pages.
    pub fn page_span(&self, id: Pgid) -> Result<&[u8]> {
        let first = self.page(id)?;
        let span = PageHeader::from_bytes(first)?.span() as usize;
        if span == 1 {
            return Ok(first);
        }
        let offset = id as usize * self.page_size;
        let len = span * self.page_size;
        if offset + len > self.map_len {
            return Err(Error::corrupt(format!(
                "page {id} spans {span} pages past the mapped window"
            )));
        }
        Ok(&self.map[offset..offset + len])
    }

    /// Span of the logical page at `id`, read from its header.
    pub fn span_of(&self, id: Pgid) -> Result<u32> {
        Ok(PageHeader::from_bytes(self.page(id)?)?.span())
    }

    /// Meta page body for the given slot, using an explicit page size so the
    /// second slot can be located before the stored page size is known. No
    /// header validation here: meta recovery decides what is salvageable.
    pub fn meta_body(&self, slot: u64, page_size: usize) -> Result<&[u8]> {
        let offset = slot as usize * page_size;
        if offset + page_size > self.map_len {
            return Err(Error::corrupt(format!("meta slot {slot} beyond mapping")));
        }
        let file_size = self.file_size()?;
        if (offset + page_size) as u64 > file_size {
            return Err(Error::corrupt(format!(
                "meta slot {slot} beyond end of file ({file_size} bytes)"
            )));
        }
        Ok(&self.map[offset + crate::config::PAGE_HEADER_SIZE..offset + page_size])
    }

    /// Positional write of a full shadow page buffer.
    pub fn write_page(&self, buf: &PageBuf) -> Result<()> {
        let offset = buf.id() * self.page_size as u64;
        trace!(pgid = buf.id(), span = buf.span(), "writing page");
        self.file.write_all_at(buf.bytes(), offset)?;
        Ok(())
    }

    /// Flushes the data file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Rebuilds the mapping so it covers at least `min_len` bytes. The
    /// caller must hold the mapping lock exclusively; `&mut self` enforces
    /// that no borrowed page views survive the rebuild.
    pub fn remap(&mut self, min_len: usize) -> Result<()> {
        if min_len <= self.map_len {
            return Ok(());
        }
        let mut new_len = self.map_len.max(self.page_size);
        while new_len < min_len {
            new_len *= 2;
        }
        debug!(
            old_len = self.map_len,
            new_len, "growing mapped window"
        );
        self.map = Self::map_window(&self.file, new_len)?;
        self.map_len = new_len;
        Ok(())
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn required_window(configured: usize, file_size: u64, page_size: usize) -> usize {
    let file_pages = (file_size as usize).div_ceil(page_size);
    configured.max(file_pages * page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageFlag;

    fn small_options() -> Options {
        Options {
            page_size: 4096,
            mmap_size: 1 << 20,
        }
    }

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        (dir, path)
    }

    #[test]
    fn open_creates_missing_file() {
        let (_dir, path) = scratch();
        let disk = Disk::open(&path, &small_options()).unwrap();

        assert_eq!(disk.file_size().unwrap(), 0);
        assert_eq!(disk.map_len(), 1 << 20);
    }

    #[test]
    fn second_open_observes_lock() {
        let (_dir, path) = scratch();
        let _disk = Disk::open(&path, &small_options()).unwrap();

        let second = Disk::open(&path, &small_options());
        assert!(matches!(second, Err(Error::Locked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let (_dir, path) = scratch();
        {
            let _disk = Disk::open(&path, &small_options()).unwrap();
        }
        assert!(Disk::open(&path, &small_options()).is_ok());
    }

    #[test]
    fn write_page_then_read_back_through_map() {
        let (_dir, path) = scratch();
        let disk = Disk::open(&path, &small_options()).unwrap();

        let buf = PageBuf::init(1, 4096, 3, PageFlag::Leaf);
        disk.write_page(&buf).unwrap();
        disk.sync().unwrap();

        let page = disk.page(3).unwrap();
        let header = PageHeader::from_bytes(page).unwrap();
        assert_eq!(header.id(), 3);
        assert_eq!(header.flag().unwrap(), PageFlag::Leaf);
    }

    #[test]
    fn page_rejects_unwritten_garbage() {
        let (_dir, path) = scratch();
        let disk = Disk::open(&path, &small_options()).unwrap();

        let buf = PageBuf::init(1, 4096, 0, PageFlag::Meta);
        disk.write_page(&buf).unwrap();
        disk.write_page(&PageBuf::init(1, 4096, 1, PageFlag::Meta)).unwrap();

        // page 1 was written with id 1; fetching it as id 0 must fail
        let err = disk.page(0).err();
        assert!(err.is_none(), "page 0 is valid");
        let raw = disk.page(1).unwrap();
        assert!(PageHeader::from_bytes(raw).unwrap().validate(0).is_err());
    }

    #[test]
    fn page_span_reads_overflow_pages() {
        let (_dir, path) = scratch();
        let disk = Disk::open(&path, &small_options()).unwrap();

        let mut buf = PageBuf::init(3, 4096, 5, PageFlag::Buckets);
        buf.body_mut()[9000] = 0xEE;
        disk.write_page(&buf).unwrap();

        let span = disk.page_span(5).unwrap();
        assert_eq!(span.len(), 3 * 4096);
        assert_eq!(span[crate::config::PAGE_HEADER_SIZE + 9000], 0xEE);
        assert_eq!(disk.span_of(5).unwrap(), 3);
    }

    #[test]
    fn page_beyond_window_is_rejected() {
        let (_dir, path) = scratch();
        let disk = Disk::open(&path, &small_options()).unwrap();

        let err = disk.page(1 << 40).unwrap_err();
        assert!(err.to_string().contains("mapped window"));
    }

    #[test]
    fn remap_grows_window() {
        let (_dir, path) = scratch();
        let mut disk = Disk::open(&path, &small_options()).unwrap();

        let buf = PageBuf::init(1, 4096, 700, PageFlag::Leaf);
        disk.write_page(&buf).unwrap();

        assert!(disk.page(700).is_err(), "page 700 is past the 1 MiB window");
        disk.remap(701 * 4096).unwrap();
        assert!(disk.map_len() >= 701 * 4096);
        assert!(disk.page(700).is_ok());
    }
}
