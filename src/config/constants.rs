//! # CowDB Configuration Constants
//!
//! This module centralizes the constants of the on-disk format and the
//! B+tree fill policy. Constants that depend on each other are co-located
//! to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! page_size (Options, default OS page size / 4096)
//!       │
//!       ├─> PAGE_HEADER_SIZE (20 bytes, fixed by the wire format)
//!       │
//!       ├─> usable body = page_size - PAGE_HEADER_SIZE
//!       │
//!       ├─> split target  = usable * FILL_PERCENT / 100
//!       │
//!       ├─> merge trigger = page_size / MIN_FILL_DIV
//!       │
//!       └─> max key size  = page_size / MAX_KEY_DIV
//!             Two maximal branch entries must fit a single page, because
//!             only single-record pages may overflow.
//!
//! INIT_MMAP_SIZE (1 GiB)
//!       │
//!       └─> the mapping is only rebuilt when the allocation watermark
//!           crosses it, so remaps are rare on typical databases
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `FILL_PERCENT` must leave room for one more maximal entry without
//!    exceeding a page, so multi-entry nodes never overflow.
//! 2. `MIN_KEYS_BRANCH * (BRANCH_ENTRY_OVERHEAD + max key)` must fit the
//!    usable body of the smallest supported page.

/// Page size used when the OS page size cannot be determined.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest accepted page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest accepted page size.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Size of the on-disk page header in bytes.
/// Every page begins with this header: id, flags, count, overflow, magic.
pub const PAGE_HEADER_SIZE: usize = 20;

/// Initial size of the read mapping over the database file (1 GiB).
/// Mapping far beyond EOF keeps remaps rare; the file itself stays sparse.
pub const INIT_MMAP_SIZE: usize = 1 << 30;

/// Current on-disk format version, stored in both meta pages.
pub const FORMAT_VERSION: u32 = 1;

/// Number of alternating meta pages at the start of the file.
pub const META_SLOTS: u64 = 2;

/// Split target as a percentage of the usable page body. Nodes larger than
/// a page are cut at key boundaries into chunks of roughly this fill.
pub const FILL_PERCENT: usize = 50;

/// Merge trigger divisor: a node smaller than `page_size / MIN_FILL_DIV`
/// is merged with a sibling during the commit spill.
pub const MIN_FILL_DIV: usize = 4;

/// Divisor bounding key length: keys longer than `page_size / MAX_KEY_DIV`
/// are rejected so that a minimal branch node always fits one page.
pub const MAX_KEY_DIV: usize = 4;

/// Minimum entries a leaf keeps before merging (the empty-bucket root leaf
/// is the only zero-entry leaf that survives a commit).
pub const MIN_KEYS_LEAF: usize = 1;

/// Minimum children a branch keeps before merging. A root branch may fall
/// below this and collapses into its only child instead.
pub const MIN_KEYS_BRANCH: usize = 2;

/// Per-entry overhead of a serialized leaf record: flags + key and value
/// length prefixes.
pub const LEAF_ENTRY_OVERHEAD: usize = 1 + 4 + 4;

/// Per-entry overhead of a serialized branch record: child pgid + key
/// length prefix.
pub const BRANCH_ENTRY_OVERHEAD: usize = 8 + 4;

const _: () = assert!(
    MIN_PAGE_SIZE > PAGE_HEADER_SIZE,
    "pages must have room for a body"
);

const _: () = assert!(
    FILL_PERCENT > 0 && FILL_PERCENT <= 75,
    "split fill must leave headroom for one more entry"
);

const _: () = assert!(
    MIN_KEYS_BRANCH * (BRANCH_ENTRY_OVERHEAD + MIN_PAGE_SIZE / MAX_KEY_DIV)
        <= MIN_PAGE_SIZE - PAGE_HEADER_SIZE,
    "a minimal branch node must fit a single page"
);
