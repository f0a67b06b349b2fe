//! # Storage Module
//!
//! The foundational storage layer: the page format, the meta-page protocol,
//! the freelist, and the disk handler that owns the file and its mmap.
//!
//! ## Architecture Overview
//!
//! The file is an array of fixed-size pages. Committed pages are immutable:
//! a write transaction copies what it changes into freshly allocated shadow
//! pages and publishes them by writing one of the two alternating meta
//! pages. Readers map the file and chase page ids; they never observe a
//! partially applied commit because the old meta stays valid until the new
//! one is durable.
//!
//! ```text
//! Page 0, 1   meta pages (active = valid meta with highest txid)
//! Page 2      initial freelist page
//! Page 3      initial buckets page
//! Page 4+     tree pages, from the freelist or the watermark
//! ```
//!
//! ## Module Organization
//!
//! - `page`: header layout, page flags, body serializer/deserializer
//! - `meta`: meta codec, checksum, active-meta rules
//! - `freelist`: free/pending page tracking and persistence
//! - `disk`: file descriptor, advisory lock, mmap window, page I/O

mod disk;
mod freelist;
mod meta;
mod page;

pub use disk::Disk;
pub use freelist::Freelist;
pub use meta::{Meta, META_CONTENT_SIZE, META_MAGIC};
pub use page::{
    Deserializer, PageBuf, PageFlag, PageHeader, Pgid, Serializer, Txid, PAGE_MAGIC,
};
