//! # Transactions
//!
//! A transaction is a consistent view of the database: a snapshot of the
//! active meta, the bucket registry loaded from it, and (for write
//! transactions) the shadow pager accumulating every mutation until
//! commit.
//!
//! ## State Machine
//!
//! ```text
//! ┌──────┐  commit()   ┌───────────┐
//! │ Open │ ──────────► │ Committed │
//! └──────┘             └───────────┘
//!     │ rollback() / drop
//!     ▼
//! ┌────────────┐
//! │ RolledBack │
//! └────────────┘
//! ```
//!
//! Any operation after a terminal state fails with `TxClosed`; mutating
//! operations on a read transaction fail with `TxReadOnly`.
//!
//! ## Commit Ordering
//!
//! Durability hinges on the write order of a commit:
//!
//! 1. spill dirty nodes into shadow pages (rebalance, split, allocate)
//! 2. write the registry into a fresh buckets page
//! 3. write the freelist into a fresh freelist page
//! 4. write all shadow pages, fsync the data
//! 5. write the meta for this txid to slot `txid % 2`, fsync again
//!
//! The data fsync strictly precedes the meta fsync. A crash between them
//! leaves the old meta active; the half-written shadow pages are unreferenced
//! and harmless (leaked until a future full scan, never resurrected).
//!
//! A write transaction holds the writer lock for its whole life and an
//! upgradable read lock on the mapping, upgrading only for the rare remap
//! when the watermark outgrows the mapped window.

use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering;

use parking_lot::{MutexGuard, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::db::bucket::Bucket;
use crate::db::buckets::{BucketMeta, Buckets};
use crate::db::database::Db;
use crate::error::{Error, Result};
use crate::storage::{Disk, Freelist, Meta, PageBuf, PageFlag, Txid};
use crate::tree::{ShadowPager, SpillCtx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// Mapping guard held for the life of the transaction. Readers share the
/// map; the single writer holds it upgradably so it can remap.
pub(crate) enum TxGuard<'db> {
    Read(RwLockReadGuard<'db, Disk>),
    Write(RwLockUpgradableReadGuard<'db, Disk>),
}

/// A transaction over the database. Read transactions observe the meta
/// active at begin for their entire life; a write transaction owns the
/// writer lock and publishes atomically at commit.
pub struct Tx<'db> {
    db: &'db Db,
    writable: bool,
    state: Cell<TxState>,
    meta: RefCell<Meta>,
    buckets: RefCell<Buckets>,
    pub(crate) pager: RefCell<ShadowPager>,
    guard: Option<TxGuard<'db>>,
    /// Held for the life of a write transaction.
    _writer: Option<MutexGuard<'db, ()>>,
    /// Snapshot txid registered in the reader table, for read transactions.
    reader_txid: Option<Txid>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(
        db: &'db Db,
        writable: bool,
        meta: Meta,
        buckets: Buckets,
        guard: TxGuard<'db>,
        writer: Option<MutexGuard<'db, ()>>,
        reader_txid: Option<Txid>,
    ) -> Self {
        trace!(txid = meta.txid, writable, "transaction begun");
        Self {
            db,
            writable,
            state: Cell::new(TxState::Open),
            meta: RefCell::new(meta),
            buckets: RefCell::new(buckets),
            pager: RefCell::new(ShadowPager::new(db.page_size)),
            guard: Some(guard),
            _writer: writer,
            reader_txid,
        }
    }

    pub(crate) fn disk(&self) -> &Disk {
        match self.guard.as_ref().expect("transaction mapping guard") {
            TxGuard::Read(g) => g,
            TxGuard::Write(g) => g,
        }
    }

    /// The transaction id this transaction runs as: the snapshot txid for
    /// readers, the txid being committed for the writer.
    pub fn id(&self) -> Txid {
        self.meta.borrow().txid
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        match self.state.get() {
            TxState::Open => Ok(()),
            _ => Err(Error::TxClosed),
        }
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(Error::TxReadOnly);
        }
        Ok(())
    }

    /// Creates a bucket and returns a handle to it.
    pub fn create_bucket(&self, name: &str) -> Result<Bucket<'_, 'db>> {
        self.require_writable()?;
        if name.is_empty() {
            return Err(Error::InvalidArgument("bucket name required"));
        }
        if self.buckets.borrow().get(name).is_some() {
            return Err(Error::BucketExists(name.to_string()));
        }

        let root = {
            let mut meta = self.meta.borrow_mut();
            let mut freelist = self.db.freelist.lock();
            let mut ctx = SpillCtx {
                disk: self.disk(),
                meta: &mut meta,
                freelist: &mut freelist,
            };
            self.pager.borrow_mut().create_root(&mut ctx)?
        };
        self.buckets
            .borrow_mut()
            .add(name, BucketMeta { root, auto_id: 0 })?;
        debug!(bucket = name, root, "created bucket");
        Ok(Bucket::new(self, name.to_string(), root))
    }

    /// Returns a handle to an existing bucket.
    pub fn get_bucket(&self, name: &str) -> Result<Bucket<'_, 'db>> {
        self.check_open()?;
        let meta = self
            .buckets
            .borrow()
            .get(name)
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))?;
        Ok(Bucket::new(self, name.to_string(), meta.root))
    }

    /// Removes a bucket and frees its entire tree under this txid.
    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        self.require_writable()?;
        let meta = self.buckets.borrow_mut().remove(name)?;
        self.pager.borrow_mut().free_tree(self.disk(), meta.root)?;
        debug!(bucket = name, "deleted bucket");
        Ok(())
    }

    /// Names of all buckets visible to this transaction, ascending.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.borrow().names_sorted()
    }

    pub(crate) fn bump_auto_id(&self, name: &str) -> Result<u64> {
        self.buckets.borrow_mut().bump_auto_id(name)
    }

    /// Commits the transaction. For a read transaction this only ends the
    /// snapshot. An error anywhere before the meta write leaves the old
    /// state active, equivalent to a rollback.
    pub fn commit(self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            self.state.set(TxState::Committed);
            return Ok(());
        }
        let mut this = self;
        this.commit_inner()?;
        this.state.set(TxState::Committed);
        Ok(())
    }

    /// Discards every shadow buffer and dirty node.
    pub fn rollback(self) -> Result<()> {
        self.check_open()?;
        // the drop handler performs the actual cleanup
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        let page_size = self.db.page_size;

        // Phase 1: spill under the freelist lock; all allocation happens
        // here, against this transaction's meta copy.
        let meta_snapshot = {
            let mut meta = self.meta.borrow_mut();
            let mut freelist = self.db.freelist.lock();
            let mut pager = self.pager.borrow_mut();
            let mut buckets = self.buckets.borrow_mut();

            let old_buckets_page = meta.buckets;
            let old_freelist_page = meta.freelist;

            let mut ctx = SpillCtx {
                disk: match self.guard.as_ref().expect("transaction mapping guard") {
                    TxGuard::Read(g) => g,
                    TxGuard::Write(g) => g,
                },
                meta: &mut meta,
                freelist: &mut freelist,
            };

            for name in buckets.names_sorted() {
                let bucket_meta = buckets.get(&name).expect("name from registry");
                if pager.is_dirty(bucket_meta.root) {
                    let new_root = pager.spill_bucket(&mut ctx, bucket_meta.root)?;
                    buckets.set_root(&name, new_root);
                }
            }

            // the registry and freelist pages are replaced every commit
            let span = ctx.disk.span_of(old_buckets_page)?;
            pager.note_free(old_buckets_page, span);
            let span = ctx.disk.span_of(old_freelist_page)?;
            pager.note_free(old_freelist_page, span);

            let bspan = buckets.storage_size().div_ceil(page_size) as u32;
            let bpgid = pager.allocate_span(&mut ctx, bspan)?;
            let mut bbuf = PageBuf::init(bspan, page_size, bpgid, PageFlag::Buckets);
            buckets.write_into(&mut bbuf)?;
            pager.push_shadow(bbuf);
            ctx.meta.buckets = bpgid;

            // upper bound computed before the page's own allocation shrinks
            // the free set, so the serialized ids always fit the span
            let upper = ctx.freelist.free_count()
                + ctx.freelist.pending_count()
                + pager.pending_free_count();
            let fspan = (Freelist::size_for(upper).div_ceil(page_size)) as u32;
            let fpgid = pager.allocate_span(&mut ctx, fspan)?;
            let ids = ctx.freelist.ids_for_persist(pager.pending_free());
            let mut fbuf = PageBuf::init(fspan, page_size, fpgid, PageFlag::Freelist);
            Freelist::write_ids(&mut fbuf, &ids)?;
            pager.push_shadow(fbuf);
            ctx.meta.freelist = fpgid;

            *ctx.meta
        };

        // Phase 2: make sure post-commit readers can reach every page below
        // the new watermark through the shared mapping.
        self.grow_mapping(meta_snapshot.watermark as usize * page_size)?;

        // Phase 3: data pages become durable before the meta that
        // references them.
        {
            let pager = self.pager.borrow();
            trace!(
                txid = meta_snapshot.txid,
                pages = pager.shadow_count(),
                "writing shadow pages"
            );
            pager.write_dirty_pages(self.disk())?;
        }

        // Phase 4: publish the commit with the alternating meta page.
        {
            let mut mbuf = PageBuf::new(1, page_size);
            meta_snapshot.write_into(&mut mbuf)?;
            let disk = self.disk();
            disk.write_page(&mbuf)?;
            disk.sync()?;
        }

        // Phase 5: install the new meta, then queue the replaced pages for
        // release under this txid.
        *self.db.meta.lock() = meta_snapshot;
        let min_open = self.db.min_open_reader();
        {
            let mut freelist = self.db.freelist.lock();
            let mut pager = self.pager.borrow_mut();
            for (pgid, span) in pager.take_pending_free() {
                freelist.free(meta_snapshot.txid, pgid, span);
            }
            pager.take_allocated();
            freelist.release(min_open);
        }

        debug!(txid = meta_snapshot.txid, "transaction committed");
        Ok(())
    }

    /// Rebuilds the shared mapping when the watermark outgrew it. Upgrades
    /// the writer's guard, which waits for every open reader, then
    /// downgrades back.
    fn grow_mapping(&mut self, min_len: usize) -> Result<()> {
        if min_len <= self.disk().map_len() {
            return Ok(());
        }
        let guard = self.guard.take().expect("transaction mapping guard");
        match guard {
            TxGuard::Write(g) => {
                let mut write_guard = RwLockUpgradableReadGuard::upgrade(g);
                let result = write_guard.remap(min_len);
                self.guard = Some(TxGuard::Write(RwLockWriteGuard::downgrade_to_upgradable(
                    write_guard,
                )));
                result
            }
            g @ TxGuard::Read(_) => {
                self.guard = Some(g);
                Ok(())
            }
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.state.get() == TxState::Open {
            self.state.set(TxState::RolledBack);
            if self.writable {
                // Return freelist-sourced reservations. Watermark-sourced
                // ids lie beyond the committed watermark and will be handed
                // out again by the next bump.
                let watermark = self.db.meta.lock().watermark;
                let mut freelist = self.db.freelist.lock();
                for (pgid, span) in self.pager.borrow_mut().take_allocated() {
                    if pgid < watermark {
                        freelist.reinsert(pgid, span);
                    }
                }
                trace!("write transaction rolled back");
            }
        }
        if let Some(txid) = self.reader_txid {
            self.db.release_reader(txid);
        }
        self.db.tx_count.fetch_sub(1, Ordering::Release);
    }
}
