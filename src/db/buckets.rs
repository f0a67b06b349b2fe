//! Bucket registry: the mapping from bucket name to B+tree root.
//!
//! The registry is persisted as a single, possibly overflowing, Buckets
//! page. Each entry serializes as a length-prefixed UTF-8 name followed by
//! the bucket's auto-id counter and root page id. Every commit rewrites the
//! registry into a fresh shadow page.

use hashbrown::HashMap;

use crate::config::PAGE_HEADER_SIZE;
use crate::error::{Error, Result};
use crate::storage::{Deserializer, PageBuf, PageFlag, PageHeader, Pgid, Serializer};

/// Per-bucket persistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketMeta {
    /// Root page of the bucket's tree: a leaf for an empty or small bucket,
    /// a branch otherwise.
    pub root: Pgid,
    /// Monotonic counter for auto-assigned ids.
    pub auto_id: u64,
}

/// In-memory registry, loaded from the buckets page at transaction begin.
#[derive(Debug, Default)]
pub struct Buckets {
    map: HashMap<String, BucketMeta>,
}

impl Buckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(page: &[u8]) -> Result<Buckets> {
        let header = PageHeader::from_bytes(page)?;
        if header.flag()? != PageFlag::Buckets {
            return Err(Error::corrupt(format!(
                "expected buckets page, found {:?}",
                header.flag()?
            )));
        }
        let mut de = Deserializer::new(&page[PAGE_HEADER_SIZE..]);
        let mut map = HashMap::with_capacity(header.count() as usize);
        for _ in 0..header.count() {
            let name = String::from_utf8(de.get_bytes()?.to_vec())
                .map_err(|_| Error::corrupt("bucket name is not valid UTF-8"))?;
            let auto_id = de.get_u64()?;
            let root = de.get_pgid()?;
            if map.insert(name, BucketMeta { root, auto_id }).is_some() {
                return Err(Error::corrupt("duplicate bucket name in registry"));
            }
        }
        Ok(Buckets { map })
    }

    pub fn write_into(&self, buf: &mut PageBuf) -> Result<()> {
        let header = buf.header_mut();
        header.set_flag(PageFlag::Buckets);
        header.set_count(self.map.len() as u16);

        let mut ser = Serializer::new(buf.body_mut());
        for name in self.names_sorted() {
            let meta = self.map[&name];
            ser.put_bytes(name.as_bytes())?;
            ser.put_u64(meta.auto_id)?;
            ser.put_pgid(meta.root)?;
        }
        Ok(())
    }

    /// Serialized byte size of the registry, including the page header.
    pub fn storage_size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self
                .map
                .iter()
                .map(|(name, _)| 4 + name.len() + 8 + 8)
                .sum::<usize>()
    }

    pub fn get(&self, name: &str) -> Option<BucketMeta> {
        self.map.get(name).copied()
    }

    pub fn add(&mut self, name: &str, meta: BucketMeta) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("bucket name required"));
        }
        if self.map.contains_key(name) {
            return Err(Error::BucketExists(name.to_string()));
        }
        self.map.insert(name.to_string(), meta);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<BucketMeta> {
        self.map
            .remove(name)
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))
    }

    pub fn set_root(&mut self, name: &str, root: Pgid) {
        if let Some(meta) = self.map.get_mut(name) {
            meta.root = root;
        }
    }

    /// Increments and returns the bucket's auto-id counter.
    pub fn bump_auto_id(&mut self, name: &str) -> Result<u64> {
        let meta = self
            .map
            .get_mut(name)
            .ok_or_else(|| Error::BucketNotFound(name.to_string()))?;
        meta.auto_id += 1;
        Ok(meta.auto_id)
    }

    pub fn names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
