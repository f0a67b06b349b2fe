//! # Shadow Pager
//!
//! Per-transaction allocator and dirty-page tracker. Every mutation a write
//! transaction makes lives here until commit: nodes materialized for
//! editing, page ids reserved for shadow pages, and the ids of committed
//! pages the transaction is replacing.
//!
//! ## Dirty-Node Arena
//!
//! Nodes are keyed by the pgid of the page they were loaded from; parent and
//! child links are pgids, never pointers, which keeps the Tx → pager → node
//! graph acyclic and lets the spill walk the dirty overlay with plain map
//! lookups. A write traversal materializes the whole path from the bucket
//! root, because every ancestor of a changed leaf gets a new page id at
//! commit anyway.
//!
//! ## Spill
//!
//! `spill_bucket` runs at commit, bottom-up over the dirty subtree:
//!
//! 1. rebalance: an underfull node (below a quarter page, or below the
//!    minimum key count) is merged into a sibling; empty nodes drop out
//! 2. a root branch left with a single child collapses into it; a root that
//!    split grows a new branch root
//! 3. surviving nodes are cut into page-sized chunks at cumulative byte
//!    boundaries and serialized into freshly allocated shadow pages
//! 4. replaced page ids queue up in `pending_free`, released under the
//!    committing txid once the new meta is durable
//!
//! Allocation prefers the freelist and falls back to bumping the meta
//! watermark; either way the reservation is recorded so a rollback can
//! return freelist ids.

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::error::{Error, Result};
use crate::storage::{Disk, Freelist, Meta, PageBuf, PageFlag, PageHeader, Pgid};
use crate::tree::node::{branch_lookup, leaf_lookup, span_for, Entry, Node};

use crate::config::PAGE_HEADER_SIZE;

/// Replacement entries a spilled subtree hands to its parent.
type Replacements = SmallVec<[(Vec<u8>, Pgid); 4]>;

/// Allocation context for a spill: the transaction's meta copy plus the
/// shared freelist, locked for the duration of the commit phase.
pub struct SpillCtx<'a> {
    pub disk: &'a Disk,
    pub meta: &'a mut Meta,
    pub freelist: &'a mut Freelist,
}

impl SpillCtx<'_> {
    /// Returns a fresh page id spanning `span` pages, preferring the
    /// freelist and falling back to the watermark.
    fn allocate(&mut self, span: u32) -> Result<Pgid> {
        if let Some(pgid) = self.freelist.allocate(span as usize) {
            trace!(pgid, span, "allocated from freelist");
            return Ok(pgid);
        }
        let pgid = self.meta.watermark;
        self.meta.watermark += span as u64;
        trace!(pgid, span, watermark = self.meta.watermark, "allocated from watermark");
        Ok(pgid)
    }

    fn read_node(&self, pgid: Pgid) -> Result<Node> {
        Node::read(self.disk.page_span(pgid)?, pgid)
    }
}

#[derive(Debug)]
pub struct ShadowPager {
    page_size: usize,
    /// Materialized nodes under edit, keyed by source pgid.
    nodes: HashMap<Pgid, Node>,
    /// Shadow page ids reserved by this transaction, for rollback.
    allocated: Vec<(Pgid, u32)>,
    /// Committed pages this transaction replaces.
    pending_free: Vec<(Pgid, u32)>,
    /// Serialized shadow buffers awaiting the commit write.
    shadow: Vec<PageBuf>,
}

impl ShadowPager {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            nodes: HashMap::new(),
            allocated: Vec::new(),
            pending_free: Vec::new(),
            shadow: Vec::new(),
        }
    }

    pub fn node(&self, pgid: Pgid) -> Option<&Node> {
        self.nodes.get(&pgid)
    }

    pub fn is_dirty(&self, pgid: Pgid) -> bool {
        self.nodes.contains_key(&pgid)
    }

    pub fn dirty_count(&self) -> usize {
        self.nodes.len()
    }

    /// Queues a committed page for release under the committing txid.
    pub fn note_free(&mut self, pgid: Pgid, span: u32) {
        self.pending_free.push((pgid, span));
    }

    pub fn pending_free_count(&self) -> usize {
        self.pending_free.iter().map(|&(_, span)| span as usize).sum()
    }

    pub fn pending_free(&self) -> &[(Pgid, u32)] {
        &self.pending_free
    }

    pub fn take_pending_free(&mut self) -> Vec<(Pgid, u32)> {
        std::mem::take(&mut self.pending_free)
    }

    pub fn take_allocated(&mut self) -> Vec<(Pgid, u32)> {
        std::mem::take(&mut self.allocated)
    }

    fn alloc(&mut self, ctx: &mut SpillCtx<'_>, span: u32) -> Result<Pgid> {
        let pgid = ctx.allocate(span)?;
        self.allocated.push((pgid, span));
        Ok(pgid)
    }

    /// Reserves a page id and registers an empty dirty leaf for it. Used by
    /// `CreateBucket`; nothing reads the page before the spill rewrites it.
    pub fn create_root(&mut self, ctx: &mut SpillCtx<'_>) -> Result<Pgid> {
        let pgid = self.alloc(ctx, 1)?;
        self.nodes.insert(pgid, Node::empty_leaf(pgid));
        Ok(pgid)
    }

    /// Materializes the path from `root` to the leaf covering `key` and
    /// returns the leaf's pgid. Every node on the path becomes dirty.
    fn materialize_path(&mut self, disk: &Disk, root: Pgid, key: &[u8]) -> Result<Pgid> {
        let mut current = root;
        loop {
            if !self.nodes.contains_key(&current) {
                let node = Node::read(disk.page_span(current)?, current)?;
                self.nodes.insert(current, node);
            }
            let node = &self.nodes[&current];
            if node.is_leaf {
                return Ok(current);
            }
            current = node.child_for(key);
        }
    }

    pub fn put(&mut self, disk: &Disk, root: Pgid, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let leaf = self.materialize_path(disk, root, &key)?;
        let node = self.nodes.get_mut(&leaf).expect("materialized leaf");
        node.put(key, value);
        Ok(())
    }

    pub fn delete(&mut self, disk: &Disk, root: Pgid, key: &[u8]) -> Result<bool> {
        let leaf = self.materialize_path(disk, root, key)?;
        let node = self.nodes.get_mut(&leaf).expect("materialized leaf");
        Ok(node.delete(key))
    }

    /// Point lookup through the dirty overlay, falling back to committed
    /// pages. Used by both read and write transactions; a read transaction
    /// simply has an empty overlay.
    pub fn tree_get(&self, disk: &Disk, root: Pgid, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut current = root;
        loop {
            if let Some(node) = self.nodes.get(&current) {
                if node.is_leaf {
                    return Ok(node.get(key).map(<[u8]>::to_vec));
                }
                current = node.child_for(key);
                continue;
            }
            let page = disk.page_span(current)?;
            let header = PageHeader::from_bytes(page)?;
            let count = header.count() as usize;
            match header.flag()? {
                PageFlag::Leaf => {
                    let found = leaf_lookup(&page[PAGE_HEADER_SIZE..], count, key)?;
                    return Ok(found.map(<[u8]>::to_vec));
                }
                PageFlag::Branch => {
                    current = branch_lookup(&page[PAGE_HEADER_SIZE..], count, key)?;
                }
                other => {
                    return Err(Error::corrupt(format!(
                        "unexpected {other:?} page at {current} during tree descent"
                    )))
                }
            }
        }
    }

    /// Frees every page of the tree rooted at `root`, dirty or committed.
    /// Used by `DeleteBucket`.
    pub fn free_tree(&mut self, disk: &Disk, root: Pgid) -> Result<()> {
        let mut stack = vec![root];
        while let Some(pgid) = stack.pop() {
            if let Some(node) = self.nodes.remove(&pgid) {
                if !node.is_leaf {
                    stack.extend(node.entries.iter().map(|e| e.child));
                }
                self.pending_free.push((node.pgid, node.span));
                continue;
            }
            let page = disk.page_span(pgid)?;
            let header = PageHeader::from_bytes(page)?;
            if header.flag()? == PageFlag::Branch {
                let node = Node::read(page, pgid)?;
                stack.extend(node.entries.iter().map(|e| e.child));
            }
            self.pending_free.push((pgid, header.span()));
        }
        Ok(())
    }

    /// Spills the dirty subtree rooted at `root` and returns the bucket's
    /// new root page id.
    pub fn spill_bucket(&mut self, ctx: &mut SpillCtx<'_>, root: Pgid) -> Result<Pgid> {
        self.rebalance_subtree(ctx, root)?;

        // Root adjustments: a branch down to one child collapses into it; a
        // branch that lost everything leaves an empty bucket behind.
        let mut root = root;
        loop {
            let Some(node) = self.nodes.get(&root) else {
                break;
            };
            if node.is_leaf {
                break;
            }
            match node.entries.len() {
                0 => {
                    let node = self.nodes.remove(&root).expect("checked above");
                    self.pending_free.push((node.pgid, node.span));
                    let (_, pgid) = self.write_chunk(ctx, Vec::new(), true)?;
                    return Ok(pgid);
                }
                1 => {
                    let child = node.entries[0].child;
                    let node = self.nodes.remove(&root).expect("checked above");
                    self.pending_free.push((node.pgid, node.span));
                    root = child;
                }
                _ => break,
            }
        }
        if !self.nodes.contains_key(&root) {
            // Collapse landed on a clean child; the tree is unchanged below.
            return Ok(root);
        }

        let mut entries: Vec<(Vec<u8>, Pgid)> = self.spill_node(ctx, root)?.into_vec();
        loop {
            match entries.len() {
                0 => {
                    let (_, pgid) = self.write_chunk(ctx, Vec::new(), true)?;
                    return Ok(pgid);
                }
                1 => return Ok(entries.pop().expect("length checked").1),
                _ => {
                    // The root split: grow a new branch root above the
                    // replacements, which may itself need splitting.
                    let node = Node {
                        pgid: 0,
                        span: 0,
                        is_leaf: false,
                        entries: entries
                            .drain(..)
                            .map(|(key, pgid)| Entry::branch(key, pgid))
                            .collect(),
                    };
                    for chunk in node.split_chunks(self.page_size) {
                        let (key, pgid) = self.write_chunk(ctx, chunk, false)?;
                        entries.push((key, pgid));
                    }
                }
            }
        }
    }

    /// Post-order rebalance: children of `pgid` merge before `pgid`'s own
    /// children list is judged by its parent.
    fn rebalance_subtree(&mut self, ctx: &mut SpillCtx<'_>, pgid: Pgid) -> Result<()> {
        let dirty_children: Vec<Pgid> = match self.nodes.get(&pgid) {
            Some(node) if !node.is_leaf => node
                .entries
                .iter()
                .map(|e| e.child)
                .filter(|child| self.nodes.contains_key(child))
                .collect(),
            _ => return Ok(()),
        };
        for child in dirty_children {
            self.rebalance_subtree(ctx, child)?;
        }
        self.rebalance_children(ctx, pgid)
    }

    /// Merges underfull dirty children of `parent` into their siblings.
    fn rebalance_children(&mut self, ctx: &mut SpillCtx<'_>, parent: Pgid) -> Result<()> {
        let Some(mut pnode) = self.nodes.remove(&parent) else {
            return Ok(());
        };
        if pnode.is_leaf {
            self.nodes.insert(parent, pnode);
            return Ok(());
        }

        let mut i = 0;
        while i < pnode.entries.len() {
            let child_id = pnode.entries[i].child;
            let (underfull, empty) = match self.nodes.get(&child_id) {
                Some(child) => (child.underfull(self.page_size), child.entries.is_empty()),
                None => (false, false),
            };
            if !underfull {
                i += 1;
                continue;
            }
            if empty {
                let child = self.nodes.remove(&child_id).expect("dirty child");
                self.pending_free.push((child.pgid, child.span));
                pnode.entries.remove(i);
                continue;
            }
            if pnode.entries.len() < 2 {
                // Lone child: nothing to merge with here. The root collapse
                // in spill_bucket absorbs this level.
                break;
            }
            if i == 0 {
                // Merge the right sibling into this child.
                let right_id = pnode.entries[1].child;
                let mut right = self.take_or_read(ctx, right_id)?;
                let mut child = self.nodes.remove(&child_id).expect("dirty child");
                trace!(child = child_id, sibling = right_id, "merging right sibling");
                child.entries.append(&mut right.entries);
                self.pending_free.push((right.pgid, right.span));
                self.nodes.insert(child_id, child);
                pnode.entries.remove(1);
                i += 1;
            } else {
                // Merge this child into its left sibling.
                let left_id = pnode.entries[i - 1].child;
                let mut left = self.take_or_read(ctx, left_id)?;
                let mut child = self.nodes.remove(&child_id).expect("dirty child");
                trace!(child = child_id, sibling = left_id, "merging into left sibling");
                left.entries.append(&mut child.entries);
                self.pending_free.push((child.pgid, child.span));
                self.nodes.insert(left_id, left);
                pnode.entries.remove(i);
            }
        }

        self.nodes.insert(parent, pnode);
        Ok(())
    }

    fn take_or_read(&mut self, ctx: &SpillCtx<'_>, pgid: Pgid) -> Result<Node> {
        match self.nodes.remove(&pgid) {
            Some(node) => Ok(node),
            None => ctx.read_node(pgid),
        }
    }

    /// Serializes the subtree at `pgid` bottom-up into shadow pages and
    /// returns the `(first key, pgid)` replacements for the parent level.
    fn spill_node(&mut self, ctx: &mut SpillCtx<'_>, pgid: Pgid) -> Result<Replacements> {
        let mut node = self
            .nodes
            .remove(&pgid)
            .expect("spill of a page that was never materialized");
        self.pending_free.push((node.pgid, node.span));

        if !node.is_leaf {
            let old_entries = std::mem::take(&mut node.entries);
            let mut rebuilt = Vec::with_capacity(old_entries.len());
            for entry in old_entries {
                if self.nodes.contains_key(&entry.child) {
                    for (key, new_child) in self.spill_node(ctx, entry.child)? {
                        rebuilt.push(Entry::branch(key, new_child));
                    }
                } else {
                    rebuilt.push(entry);
                }
            }
            if rebuilt.is_empty() {
                return Ok(Replacements::new());
            }
            node.entries = rebuilt;
        }

        let is_leaf = node.is_leaf;
        let mut out = Replacements::new();
        for chunk in node.split_chunks(self.page_size) {
            let (key, new_pgid) = self.write_chunk(ctx, chunk, is_leaf)?;
            out.push((key, new_pgid));
        }
        Ok(out)
    }

    /// Allocates a shadow page for one chunk of entries and serializes it.
    fn write_chunk(
        &mut self,
        ctx: &mut SpillCtx<'_>,
        entries: Vec<Entry>,
        is_leaf: bool,
    ) -> Result<(Vec<u8>, Pgid)> {
        let span = span_for(&entries, is_leaf, self.page_size);
        let pgid = self.alloc(ctx, span)?;
        let flag = if is_leaf { PageFlag::Leaf } else { PageFlag::Branch };
        let mut buf = PageBuf::init(span, self.page_size, pgid, flag);
        Node::write_entries(&mut buf, &entries, is_leaf)?;
        let first_key = entries.into_iter().next().map(|e| e.key).unwrap_or_default();
        self.shadow.push(buf);
        Ok((first_key, pgid))
    }

    /// Adds a fully built shadow buffer (buckets registry, freelist page).
    pub fn push_shadow(&mut self, buf: PageBuf) {
        self.shadow.push(buf);
    }

    /// Allocates a span for a non-tree shadow page.
    pub fn allocate_span(&mut self, ctx: &mut SpillCtx<'_>, span: u32) -> Result<Pgid> {
        self.alloc(ctx, span)
    }

    /// Writes every shadow buffer and syncs the file. The meta page is
    /// written separately, after this returns.
    pub fn write_dirty_pages(&self, disk: &Disk) -> Result<()> {
        for buf in &self.shadow {
            disk.write_page(buf)?;
        }
        disk.sync()
    }

    pub fn shadow_count(&self) -> usize {
        self.shadow.len()
    }
}
