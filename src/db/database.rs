//! # Database Handle
//!
//! `Db` is the entry point: it opens (or formats) the file, selects the
//! active meta, loads the freelist, and hands out transactions while
//! enforcing the concurrency model: many readers, one writer, all within a
//! single process that owns the file's advisory lock.
//!
//! ## Lock Taxonomy
//!
//! ```text
//! metalock      Mutex<Meta>        snapshot at begin, install at commit
//! writerlock    Mutex<()>          held for the life of a write tx
//! mmaplock      RwLock<Disk>       readers shared; remap exclusive
//! freelistlock  Mutex<Freelist>    allocation and release
//! ```
//!
//! Lock order is metalock → freelistlock wherever both are held; the reader
//! table is never held together with either. Read transactions register
//! their snapshot txid so the writer can tell which pending pages are still
//! reachable from a live snapshot.
//!
//! ## Open and Recovery
//!
//! A zero-length file is formatted: two meta pages (txid 0 and 1), an empty
//! freelist page, an empty buckets page, watermark 4. An existing file
//! yields two meta candidates; the valid one with the highest txid wins.
//! One invalid meta, whatever field the damage landed in, is an explicit,
//! logged recovery onto the other; two invalid metas are fatal.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::{Options, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_HEADER_SIZE};
use crate::db::buckets::Buckets;
use crate::db::tx::{Tx, TxGuard};
use crate::error::{Error, Result};
use crate::storage::{Disk, Freelist, Meta, PageBuf, PageFlag, Txid};

#[derive(Debug)]
pub struct Db {
    pub(crate) disk: RwLock<Disk>,
    pub(crate) meta: Mutex<Meta>,
    pub(crate) freelist: Mutex<Freelist>,
    pub(crate) writer: Mutex<()>,
    /// Open read snapshots: txid → number of transactions holding it.
    pub(crate) readers: Mutex<BTreeMap<Txid, usize>>,
    pub(crate) tx_count: AtomicUsize,
    pub(crate) closed: AtomicBool,
    pub(crate) page_size: usize,
}

impl Db {
    /// Opens the database at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Db> {
        Self::open_with(path, Options::new())
    }

    /// Opens the database at `path`, formatting a fresh file when empty.
    pub fn open_with(path: impl AsRef<Path>, options: Options) -> Result<Db> {
        options.validate()?;
        let path = path.as_ref();
        let mut disk = Disk::open(path, &options)?;

        let file_size = disk.file_size()?;
        let meta = if file_size == 0 {
            Self::format(&disk, &options)?
        } else {
            Self::load_meta(&disk, &options, file_size)?
        };
        if meta.page_size as usize != disk.page_size() {
            disk.set_page_size(meta.page_size as usize);
        }

        let freelist = Freelist::read(disk.page_span(meta.freelist)?)?;
        debug!(
            path = %path.display(),
            txid = meta.txid,
            watermark = meta.watermark,
            free_pages = freelist.free_count(),
            "database opened"
        );

        Ok(Db {
            disk: RwLock::new(disk),
            meta: Mutex::new(meta),
            freelist: Mutex::new(freelist),
            writer: Mutex::new(()),
            readers: Mutex::new(BTreeMap::new()),
            tx_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            page_size: meta.page_size as usize,
        })
    }

    /// Formats pages 0–3 of a fresh file and syncs before first use.
    fn format(disk: &Disk, options: &Options) -> Result<Meta> {
        let page_size = options.page_size;
        let mut meta = Meta {
            page_size: page_size as u32,
            flags: 0,
            buckets: 3,
            freelist: 2,
            watermark: 4,
            txid: 0,
        };
        for txid in 0..crate::config::META_SLOTS {
            meta.txid = txid;
            let mut buf = PageBuf::new(1, page_size);
            meta.write_into(&mut buf)?;
            disk.write_page(&buf)?;
        }

        let freelist_page = PageBuf::init(1, page_size, 2, PageFlag::Freelist);
        disk.write_page(&freelist_page)?;

        let buckets_page = PageBuf::init(1, page_size, 3, PageFlag::Buckets);
        disk.write_page(&buckets_page)?;

        disk.sync()?;
        debug!(page_size, "formatted new database file");
        Ok(meta)
    }

    /// Picks the active meta: the checksum-valid candidate with the highest
    /// txid. Falling back from one invalid slot (torn checksum or a
    /// version field hit by bit rot) is explicit recovery; two invalid
    /// slots are fatal.
    fn load_meta(disk: &Disk, options: &Options, file_size: u64) -> Result<Meta> {
        if file_size < 2 * MIN_PAGE_SIZE as u64 {
            return Err(Error::corrupt(format!(
                "file too small to hold meta pages: {file_size} bytes"
            )));
        }

        let meta0 = disk
            .meta_body(0, options.page_size)
            .and_then(Meta::read)
            .and_then(validate_stored_page_size);
        // slot 1 sits one page in; trust slot 0's stored page size when it
        // validates, otherwise the configured size is the only guess
        let slot1_page_size = meta0
            .as_ref()
            .map(|m| m.page_size as usize)
            .unwrap_or(options.page_size);
        let meta1 = disk
            .meta_body(1, slot1_page_size)
            .and_then(Meta::read)
            .and_then(validate_stored_page_size);

        match (meta0, meta1) {
            (Ok(a), Ok(b)) => Ok(if a.txid >= b.txid { a } else { b }),
            // A checksum-valid sibling proves the file's format version; a
            // version mismatch in the other slot is corruption in those
            // four bytes and recovers like any other torn slot.
            (Ok(a), Err(e)) => {
                warn!(error = %e, "meta slot 1 invalid; recovering from slot 0");
                Ok(a)
            }
            (Err(e), Ok(b)) => {
                warn!(error = %e, "meta slot 0 invalid; recovering from slot 1");
                Ok(b)
            }
            (Err(e0), Err(e1)) => {
                // with no valid slot left, an incompatible format is the
                // more precise diagnosis than corruption
                if let Error::Version { .. } = e0 {
                    return Err(e0);
                }
                if let Error::Version { .. } = e1 {
                    return Err(e1);
                }
                Err(Error::corrupt(format!(
                    "both meta pages invalid: slot 0: {e0}; slot 1: {e1}"
                )))
            }
        }
    }

    /// Begins a transaction. A write transaction blocks until it owns the
    /// writer lock; readers proceed concurrently against their snapshot.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if writable {
            let writer = self.writer.lock();
            let guard = TxGuard::Write(self.disk.upgradable_read());
            let mut meta = *self.meta.lock();
            meta.txid += 1;
            let buckets = Self::read_registry(&guard, &meta)?;
            self.tx_count.fetch_add(1, Ordering::AcqRel);
            Ok(Tx::new(self, true, meta, buckets, guard, Some(writer), None))
        } else {
            let guard = TxGuard::Read(self.disk.read());
            let meta = *self.meta.lock();
            self.register_reader(meta.txid);
            let buckets = match Self::read_registry(&guard, &meta) {
                Ok(b) => b,
                Err(e) => {
                    self.release_reader(meta.txid);
                    return Err(e);
                }
            };
            self.tx_count.fetch_add(1, Ordering::AcqRel);
            Ok(Tx::new(
                self,
                false,
                meta,
                buckets,
                guard,
                None,
                Some(meta.txid),
            ))
        }
    }

    fn read_registry(guard: &TxGuard<'_>, meta: &Meta) -> Result<Buckets> {
        let disk: &Disk = match guard {
            TxGuard::Read(g) => g,
            TxGuard::Write(g) => g,
        };
        Buckets::read(disk.page_span(meta.buckets)?)
    }

    /// Runs `f` inside a read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin(false)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Runs `f` inside a write transaction, committing on success and
    /// rolling back on error.
    pub fn update<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin(true)?;
        match f(&tx) {
            Ok(out) => {
                tx.commit()?;
                Ok(out)
            }
            Err(e) => {
                drop(tx);
                Err(e)
            }
        }
    }

    /// Marks the database closed. Refuses while any transaction is open;
    /// the advisory lock is released when the handle drops.
    pub fn close(&self) -> Result<()> {
        if self.tx_count.load(Ordering::Acquire) != 0 {
            return Err(Error::TxOpen);
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Page size this database was formatted with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Txid of the most recent committed transaction.
    pub fn committed_txid(&self) -> Txid {
        self.meta.lock().txid
    }

    pub(crate) fn register_reader(&self, txid: Txid) {
        *self.readers.lock().entry(txid).or_insert(0) += 1;
    }

    /// Deregisters a read snapshot and releases freelist pages no remaining
    /// snapshot can reach.
    pub(crate) fn release_reader(&self, txid: Txid) {
        {
            let mut readers = self.readers.lock();
            if let Some(count) = readers.get_mut(&txid) {
                *count -= 1;
                if *count == 0 {
                    readers.remove(&txid);
                }
            }
        }
        let min_open = self.min_open_reader();
        self.freelist.lock().release(min_open);
    }

    /// Lowest txid any open read transaction observes, or `Txid::MAX` when
    /// none are open.
    pub(crate) fn min_open_reader(&self) -> Txid {
        self.readers
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(Txid::MAX)
    }
}

fn validate_stored_page_size(meta: Meta) -> Result<Meta> {
    let ps = meta.page_size as usize;
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&ps)
        || !ps.is_power_of_two()
        || ps <= PAGE_HEADER_SIZE
    {
        return Err(Error::corrupt(format!("implausible stored page size {ps}")));
    }
    Ok(meta)
}
