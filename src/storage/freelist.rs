//! # Freelist Management
//!
//! The freelist tracks pages released by closed transactions so the file can
//! reuse space instead of growing forever. It keeps two sets:
//!
//! - `free`: sorted page ids available for allocation right now
//! - `pending`: ids released by transaction `T`, held until every open read
//!   transaction with `txid < T` has closed
//!
//! A page freed during a commit was reachable from the previous meta, and a
//! reader that began on that meta may still traverse into it. Holding the id
//! in `pending` until those readers close is what keeps the shadow-paging
//! snapshots consistent.
//!
//! ## Persistence
//!
//! Only the merged id set is persisted, as a Freelist page referenced by the
//! meta. Pending does not survive a restart on purpose: no readers survive a
//! restart, so every pending id is free again, and the page written at
//! commit already contains the union. The page header `count` holds the id
//! count; when the list outgrows a `u16`, the header stores `u16::MAX` and
//! the real count leads the body as a u64.

use std::collections::BTreeMap;

use crate::config::PAGE_HEADER_SIZE;
use crate::error::{Error, Result};
use crate::storage::page::{Deserializer, PageBuf, PageFlag, PageHeader, Pgid, Serializer, Txid};

/// Header `count` value signalling the body-resident u64 count.
const LONG_COUNT: u16 = u16::MAX;

#[derive(Debug, Default)]
pub struct Freelist {
    free: Vec<Pgid>,
    pending: BTreeMap<Txid, Vec<Pgid>>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(mut ids: Vec<Pgid>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self {
            free: ids,
            pending: BTreeMap::new(),
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Removes and returns the start of the first run of `n` contiguous ids,
    /// or `None` when no such run exists.
    pub fn allocate(&mut self, n: usize) -> Option<Pgid> {
        if n == 0 || self.free.len() < n {
            return None;
        }
        let mut run_start = 0;
        for i in 0..self.free.len() {
            if i > 0 && self.free[i] != self.free[i - 1] + 1 {
                run_start = i;
            }
            if i - run_start + 1 == n {
                let start = self.free[run_start];
                self.free.drain(run_start..=i);
                return Some(start);
            }
        }
        None
    }

    /// Records a span released by transaction `txid`.
    pub fn free(&mut self, txid: Txid, pgid: Pgid, span: u32) {
        debug_assert!(span > 0);
        debug_assert!(
            (pgid..pgid + span as u64).all(|id| self.free.binary_search(&id).is_err()),
            "span at {pgid} freed while already free"
        );
        debug_assert!(
            (pgid..pgid + span as u64)
                .all(|id| self.pending.values().all(|ids| !ids.contains(&id))),
            "span at {pgid} freed while already pending"
        );
        self.pending
            .entry(txid)
            .or_default()
            .extend(pgid..pgid + span as u64);
    }

    /// Moves `pending[t]` into `free` for every `t < min_open_txid`.
    pub fn release(&mut self, min_open_txid: Txid) {
        let keep = self.pending.split_off(&min_open_txid);
        let drained = std::mem::replace(&mut self.pending, keep);
        if drained.is_empty() {
            return;
        }
        for (_, ids) in drained {
            self.free.extend(ids);
        }
        self.free.sort_unstable();
        self.free.dedup();
    }

    /// Returns a rolled-back allocation to the free set. Used when a write
    /// transaction aborts after taking ids out of the freelist.
    pub fn reinsert(&mut self, pgid: Pgid, span: u32) {
        self.free.extend(pgid..pgid + span as u64);
        self.free.sort_unstable();
        self.free.dedup();
    }

    /// The full id set to persist at commit: free ids, every pending id, and
    /// the spans the committing transaction is about to release.
    pub fn ids_for_persist(&self, extra: &[(Pgid, u32)]) -> Vec<Pgid> {
        let mut ids = self.free.clone();
        for pending in self.pending.values() {
            ids.extend_from_slice(pending);
        }
        for &(pgid, span) in extra {
            ids.extend(pgid..pgid + span as u64);
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Bytes needed to persist `n` ids, including the page header.
    pub fn size_for(n: usize) -> usize {
        let long = if n >= LONG_COUNT as usize { 8 } else { 0 };
        PAGE_HEADER_SIZE + long + n * 8
    }

    /// Serializes `ids` into a freelist page buffer.
    pub fn write_ids(buf: &mut PageBuf, ids: &[Pgid]) -> Result<()> {
        let long = ids.len() >= LONG_COUNT as usize;
        let header = buf.header_mut();
        header.set_flag(PageFlag::Freelist);
        header.set_count(if long { LONG_COUNT } else { ids.len() as u16 });

        let mut ser = Serializer::new(buf.body_mut());
        if long {
            ser.put_u64(ids.len() as u64)?;
        }
        for &id in ids {
            ser.put_pgid(id)?;
        }
        Ok(())
    }

    /// Reconstructs the freelist from a page span read at open.
    pub fn read(page: &[u8]) -> Result<Freelist> {
        let header = PageHeader::from_bytes(page)?;
        if header.flag()? != PageFlag::Freelist {
            return Err(Error::corrupt(format!(
                "expected freelist page, found {:?}",
                header.flag()?
            )));
        }
        let mut de = Deserializer::new(&page[PAGE_HEADER_SIZE..]);
        let count = if header.count() == LONG_COUNT {
            de.get_u64()? as usize
        } else {
            header.count() as usize
        };
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(de.get_pgid()?);
        }
        Ok(Freelist::from_ids(ids))
    }
}
