//! # Meta Pages
//!
//! The database root state lives in two meta pages that alternate: the meta
//! for transaction `txid` is written to page `txid % 2`. A commit becomes
//! visible the moment its meta page is durable; a torn meta write leaves the
//! other slot intact, so reopening always finds a consistent root.
//!
//! ## Meta Body Layout (56 bytes, little-endian)
//!
//! ```text
//! magic:u32 | version:u32 | page_size:u32 | flags:u32 |
//! buckets_pgid:u64 | freelist_pgid:u64 | watermark:u64 |
//! txid:u64 | checksum:u64
//! ```
//!
//! The checksum is CRC-64/ECMA-182 over all preceding bytes and is computed
//! last on write. The active meta is whichever slot has the highest `txid`
//! among slots whose checksum validates.

use crc::{Crc, CRC_64_ECMA_182};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::FORMAT_VERSION;
use crate::error::{Error, Result};
use crate::storage::page::{PageBuf, PageFlag, Pgid, Txid};

/// Magic constant identifying a meta page body.
pub const META_MAGIC: u32 = 0xDBDB_5EED;

/// Serialized size of the meta body.
pub const META_CONTENT_SIZE: usize = std::mem::size_of::<MetaBytes>();

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetaBytes {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    buckets: U64,
    freelist: U64,
    watermark: U64,
    txid: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<MetaBytes>() == 56);

const CHECKSUM_OFFSET: usize = META_CONTENT_SIZE - 8;

/// In-memory copy of a meta page. Transactions snapshot this at begin and a
/// write transaction commits by persisting its modified copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub page_size: u32,
    pub flags: u32,
    /// Root page of the bucket registry.
    pub buckets: Pgid,
    /// Page holding the persisted freelist.
    pub freelist: Pgid,
    /// Lowest page id not yet allocated from the end of the file.
    pub watermark: Pgid,
    pub txid: Txid,
}

impl Meta {
    /// Meta page slot this meta is written to.
    pub fn slot(&self) -> Pgid {
        self.txid % 2
    }

    /// Parses and validates a meta page body.
    pub fn read(body: &[u8]) -> Result<Meta> {
        if body.len() < META_CONTENT_SIZE {
            return Err(Error::corrupt(format!(
                "meta body too small: {} < {}",
                body.len(),
                META_CONTENT_SIZE
            )));
        }
        let raw = MetaBytes::ref_from_bytes(&body[..META_CONTENT_SIZE])
            .map_err(|e| Error::corrupt(format!("failed to parse meta page: {e:?}")))?;

        if raw.magic.get() != META_MAGIC {
            return Err(Error::corrupt(format!(
                "bad meta magic {:#010x}",
                raw.magic.get()
            )));
        }
        if raw.version.get() != FORMAT_VERSION {
            return Err(Error::Version {
                expected: FORMAT_VERSION,
                found: raw.version.get(),
            });
        }
        let computed = CRC64.checksum(&body[..CHECKSUM_OFFSET]);
        if computed != raw.checksum.get() {
            return Err(Error::corrupt(format!(
                "meta checksum mismatch for txid {}: stored {:#018x}, computed {:#018x}",
                raw.txid.get(),
                raw.checksum.get(),
                computed
            )));
        }

        Ok(Meta {
            page_size: raw.page_size.get(),
            flags: raw.flags.get(),
            buckets: raw.buckets.get(),
            freelist: raw.freelist.get(),
            watermark: raw.watermark.get(),
            txid: raw.txid.get(),
        })
    }

    /// Serializes this meta into a one-page buffer, computing the checksum
    /// last. The page id is the alternating slot for this txid.
    pub fn write_into(&self, buf: &mut PageBuf) -> Result<()> {
        let header = buf.header_mut();
        *header = crate::storage::page::PageHeader::new(self.slot(), PageFlag::Meta);

        let body = buf.body_mut();
        if body.len() < META_CONTENT_SIZE {
            return Err(Error::OutOfSpace);
        }
        let raw = MetaBytes {
            magic: U32::new(META_MAGIC),
            version: U32::new(FORMAT_VERSION),
            page_size: U32::new(self.page_size),
            flags: U32::new(self.flags),
            buckets: U64::new(self.buckets),
            freelist: U64::new(self.freelist),
            watermark: U64::new(self.watermark),
            txid: U64::new(self.txid),
            checksum: U64::new(0),
        };
        body[..META_CONTENT_SIZE].copy_from_slice(raw.as_bytes());

        let checksum = CRC64.checksum(&body[..CHECKSUM_OFFSET]);
        body[CHECKSUM_OFFSET..META_CONTENT_SIZE].copy_from_slice(&checksum.to_le_bytes());
        Ok(())
    }
}
