//! Bucket handles and cursors.
//!
//! A [`Bucket`] is a cursor handle bound to `(transaction, name, root)`.
//! Reads copy values out of the page they land on; mutations are routed
//! through the transaction's shadow pager and stay invisible to every other
//! transaction until commit.

use crate::db::tx::Tx;
use crate::error::{Error, Result};
use crate::storage::Pgid;
use crate::tree::Node;

use crate::config::MAX_KEY_DIV;

/// Handle to one named bucket inside a transaction.
pub struct Bucket<'a, 'db> {
    tx: &'a Tx<'db>,
    name: String,
    root: Pgid,
}

impl<'a, 'db> Bucket<'a, 'db> {
    pub(crate) fn new(tx: &'a Tx<'db>, name: String, root: Pgid) -> Self {
        Self { tx, name, root }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must not be empty"));
        }
        if key.len() > self.tx.disk().page_size() / MAX_KEY_DIV {
            return Err(Error::InvalidArgument("key too large for page size"));
        }
        Ok(())
    }

    /// Returns a copy of the value stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.check_open()?;
        self.check_key(key)?;
        self.tx
            .pager
            .borrow()
            .tree_get(self.tx.disk(), self.root, key)
    }

    /// Stores `value` under `key`, replacing any existing value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.require_writable()?;
        self.check_key(key)?;
        self.tx
            .pager
            .borrow_mut()
            .put(self.tx.disk(), self.root, key.to_vec(), value.to_vec())
    }

    /// Removes `key`. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.require_writable()?;
        self.check_key(key)?;
        self.tx
            .pager
            .borrow_mut()
            .delete(self.tx.disk(), self.root, key)?;
        Ok(())
    }

    /// Reserves the next auto-assigned id for this bucket.
    pub fn next_id(&self) -> Result<u64> {
        self.tx.require_writable()?;
        self.tx.bump_auto_id(&self.name)
    }

    /// Cursor over the bucket in ascending key order.
    pub fn cursor(&self) -> Cursor<'a, 'db> {
        Cursor {
            tx: self.tx,
            root: self.root,
            stack: Vec::new(),
            started: false,
        }
    }
}

/// Forward cursor yielding `(key, value)` pairs in ascending byte order.
///
/// The cursor walks the transaction's view of the tree: dirty nodes from the
/// shadow pager overlay the committed pages they were loaded from.
pub struct Cursor<'a, 'db> {
    tx: &'a Tx<'db>,
    root: Pgid,
    /// `(node, index)` frames from the root down to the current leaf.
    stack: Vec<(Node, usize)>,
    started: bool,
}

impl Cursor<'_, '_> {
    /// Advances and returns the next pair, or `None` past the last key.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tx.check_open()?;
        if !self.started {
            self.started = true;
            let root = self.root;
            self.descend(root)?;
        }
        loop {
            {
                let Some((node, idx)) = self.stack.last_mut() else {
                    return Ok(None);
                };
                debug_assert!(node.is_leaf, "descend always lands on a leaf");
                if *idx < node.entries.len() {
                    let entry = &node.entries[*idx];
                    let pair = (entry.key.clone(), entry.value.clone());
                    *idx += 1;
                    return Ok(Some(pair));
                }
            }
            // leaf exhausted: pop it and move to the next one
            self.stack.pop();
            self.ascend()?;
        }
    }

    /// Pushes the path to the leftmost leaf of the subtree at `pgid`.
    fn descend(&mut self, mut pgid: Pgid) -> Result<()> {
        loop {
            let node = self.load(pgid)?;
            if node.is_leaf {
                self.stack.push((node, 0));
                return Ok(());
            }
            let first_child = node
                .entries
                .first()
                .map(|e| e.child)
                .ok_or_else(|| Error::corrupt("branch page with no entries"))?;
            self.stack.push((node, 0));
            pgid = first_child;
        }
    }

    /// Advances the deepest branch frame with children left and descends
    /// into the next child. Exhausted frames pop off.
    fn ascend(&mut self) -> Result<()> {
        loop {
            let next_child = match self.stack.last_mut() {
                None => return Ok(()),
                Some((node, idx)) => {
                    *idx += 1;
                    if *idx < node.entries.len() {
                        Some(node.entries[*idx].child)
                    } else {
                        None
                    }
                }
            };
            match next_child {
                Some(child) => return self.descend(child),
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    /// Materializes a frame: the dirty node if the transaction edited this
    /// page, the committed page otherwise.
    fn load(&self, pgid: Pgid) -> Result<Node> {
        if let Some(node) = self.tx.pager.borrow().node(pgid) {
            return Ok(node.clone());
        }
        Node::read(self.tx.disk().page_span(pgid)?, pgid)
    }
}
