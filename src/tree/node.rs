//! # B+Tree Nodes
//!
//! An in-memory, mutable view of one tree page, materialized the first time
//! a write transaction traverses into it. Edits land on the node while the
//! original page stays untouched in the mmap; the commit spill serializes
//! surviving nodes into shadow pages.
//!
//! ## Entry Layouts
//!
//! Leaf record: `[flags:u8][key_len:u32][value_len:u32][key][value]`
//! Branch record: `[child_pgid:u64][key_len:u32][key]`
//!
//! Records are stored in ascending key order; a branch key equals the first
//! key of its child subtree. The page header `count` holds the record count.
//!
//! ## Read Path
//!
//! Point lookups on committed pages do not materialize nodes. The records
//! are sequential, so [`leaf_lookup`] and [`branch_lookup`] walk a page body
//! in place, compare keys against the target, and stop at the first key past
//! it. The returned slices borrow from the page.

use crate::config::{
    BRANCH_ENTRY_OVERHEAD, FILL_PERCENT, LEAF_ENTRY_OVERHEAD, MIN_FILL_DIV, MIN_KEYS_BRANCH,
    MIN_KEYS_LEAF, PAGE_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::storage::{Deserializer, PageBuf, PageFlag, PageHeader, Pgid, Serializer};

/// One node entry. Leaves use `value`; branches use `child`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub child: Pgid,
}

impl Entry {
    pub fn leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            child: 0,
        }
    }

    pub fn branch(key: Vec<u8>, child: Pgid) -> Self {
        Self {
            key,
            value: Vec::new(),
            child,
        }
    }

    fn size(&self, is_leaf: bool) -> usize {
        if is_leaf {
            LEAF_ENTRY_OVERHEAD + self.key.len() + self.value.len()
        } else {
            BRANCH_ENTRY_OVERHEAD + self.key.len()
        }
    }
}

/// Mutable materialization of a branch or leaf page. Owned by the shadow
/// pager of one transaction and discarded at its end.
#[derive(Debug, Clone)]
pub struct Node {
    /// Page this node was loaded from, or the id reserved for a fresh root.
    pub pgid: Pgid,
    /// Physical pages the source page occupies; freed when the node spills.
    pub span: u32,
    pub is_leaf: bool,
    /// Entries in strictly ascending key order.
    pub entries: Vec<Entry>,
}

impl Node {
    pub fn empty_leaf(pgid: Pgid) -> Self {
        Self {
            pgid,
            span: 1,
            is_leaf: true,
            entries: Vec::new(),
        }
    }

    /// Parses a full page span into a node.
    pub fn read(page: &[u8], pgid: Pgid) -> Result<Node> {
        let header = PageHeader::from_bytes(page)?;
        let is_leaf = match header.flag()? {
            PageFlag::Leaf => true,
            PageFlag::Branch => false,
            other => {
                return Err(Error::corrupt(format!(
                    "expected tree page at {pgid}, found {other:?}"
                )))
            }
        };
        let count = header.count() as usize;
        let mut de = Deserializer::new(&page[PAGE_HEADER_SIZE..]);
        let mut entries = Vec::with_capacity(count);
        if is_leaf {
            for _ in 0..count {
                let _flags = de.get_u8()?;
                let klen = de.get_u32()? as usize;
                let vlen = de.get_u32()? as usize;
                let key = de.get_raw(klen)?.to_vec();
                let value = de.get_raw(vlen)?.to_vec();
                entries.push(Entry::leaf(key, value));
            }
        } else {
            for _ in 0..count {
                let child = de.get_pgid()?;
                let klen = de.get_u32()? as usize;
                let key = de.get_raw(klen)?.to_vec();
                entries.push(Entry::branch(key, child));
            }
        }
        Ok(Node {
            pgid,
            span: header.span(),
            is_leaf,
            entries,
        })
    }

    /// Serializes the given entries into a shadow page buffer.
    pub fn write_entries(
        buf: &mut PageBuf,
        entries: &[Entry],
        is_leaf: bool,
    ) -> Result<()> {
        let header = buf.header_mut();
        header.set_flag(if is_leaf {
            PageFlag::Leaf
        } else {
            PageFlag::Branch
        });
        debug_assert!(entries.len() < u16::MAX as usize);
        header.set_count(entries.len() as u16);

        let mut ser = Serializer::new(buf.body_mut());
        if is_leaf {
            for e in entries {
                ser.put_u8(0)?;
                ser.put_u32(e.key.len() as u32)?;
                ser.put_u32(e.value.len() as u32)?;
                ser.put_raw(&e.key)?;
                ser.put_raw(&e.value)?;
            }
        } else {
            for e in entries {
                ser.put_pgid(e.child)?;
                ser.put_u32(e.key.len() as u32)?;
                ser.put_raw(&e.key)?;
            }
        }
        Ok(())
    }

    fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        debug_assert!(self.is_leaf);
        self.search(key)
            .ok()
            .map(|i| self.entries[i].value.as_slice())
    }

    /// Inserts in sorted position, replacing on key equality.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        debug_assert!(self.is_leaf);
        match self.search(&key) {
            Ok(i) => self.entries[i].value = value,
            Err(i) => self.entries.insert(i, Entry::leaf(key, value)),
        }
    }

    /// Removes the key if present. Rebalancing is deferred to the spill.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        debug_assert!(self.is_leaf);
        match self.search(key) {
            Ok(i) => {
                self.entries.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    /// Index of the child covering `key`: the greatest entry whose key is
    /// `<= key`, or the first entry when the key sorts before all of them.
    pub fn child_index(&self, key: &[u8]) -> usize {
        debug_assert!(!self.is_leaf);
        let idx = self
            .entries
            .partition_point(|e| e.key.as_slice() <= key);
        idx.saturating_sub(1)
    }

    pub fn child_for(&self, key: &[u8]) -> Pgid {
        self.entries[self.child_index(key)].child
    }

    pub fn first_key(&self) -> &[u8] {
        self.entries.first().map(|e| e.key.as_slice()).unwrap_or(&[])
    }

    /// Serialized size of this node, including the page header.
    pub fn size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self
                .entries
                .iter()
                .map(|e| e.size(self.is_leaf))
                .sum::<usize>()
    }

    pub fn min_keys(&self) -> usize {
        if self.is_leaf {
            MIN_KEYS_LEAF
        } else {
            MIN_KEYS_BRANCH
        }
    }

    /// True when the node should merge with a sibling during the spill.
    pub fn underfull(&self, page_size: usize) -> bool {
        self.size() < page_size / MIN_FILL_DIV || self.entries.len() < self.min_keys()
    }

    /// Cuts the entries into chunks that each fit a page, targeting
    /// `FILL_PERCENT` of the usable body. The split point is chosen by
    /// cumulative byte size, not entry count. A node that already fits a
    /// page comes back as a single chunk; a single oversized record becomes
    /// its own chunk and will take overflow pages.
    pub fn split_chunks(self, page_size: usize) -> Vec<Vec<Entry>> {
        if self.size() <= page_size {
            return vec![self.entries];
        }
        let is_leaf = self.is_leaf;
        let min_keys = self.min_keys().max(1);
        let target = (page_size - PAGE_HEADER_SIZE) * FILL_PERCENT / 100;

        let mut chunks = Vec::new();
        let mut current: Vec<Entry> = Vec::new();
        let mut current_size = 0usize;
        for entry in self.entries {
            let entry_size = entry.size(is_leaf);
            if current.len() >= min_keys && current_size + entry_size > target {
                chunks.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current_size += entry_size;
            current.push(entry);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

/// Number of physical pages needed for `entries` serialized as one page.
pub fn span_for(entries: &[Entry], is_leaf: bool, page_size: usize) -> u32 {
    let size = PAGE_HEADER_SIZE
        + entries
            .iter()
            .map(|e| e.size(is_leaf))
            .sum::<usize>();
    size.div_ceil(page_size) as u32
}

/// Walks a committed leaf body in place and returns the value for `key`.
pub fn leaf_lookup<'a>(body: &'a [u8], count: usize, key: &[u8]) -> Result<Option<&'a [u8]>> {
    let mut de = Deserializer::new(body);
    for _ in 0..count {
        let _flags = de.get_u8()?;
        let klen = de.get_u32()? as usize;
        let vlen = de.get_u32()? as usize;
        let k = de.get_raw(klen)?;
        let v = de.get_raw(vlen)?;
        match k.cmp(key) {
            std::cmp::Ordering::Equal => return Ok(Some(v)),
            std::cmp::Ordering::Greater => return Ok(None),
            std::cmp::Ordering::Less => {}
        }
    }
    Ok(None)
}

/// Walks a committed branch body and returns the child covering `key`.
pub fn branch_lookup(body: &[u8], count: usize, key: &[u8]) -> Result<Pgid> {
    let mut de = Deserializer::new(body);
    let mut chosen = None;
    for i in 0..count {
        let child = de.get_pgid()?;
        let klen = de.get_u32()? as usize;
        let k = de.get_raw(klen)?;
        if i == 0 || k <= key {
            chosen = Some(child);
        } else {
            break;
        }
    }
    chosen.ok_or_else(|| Error::corrupt("branch page with no entries"))
}
