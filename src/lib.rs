//! # CowDB - Embedded Copy-on-Write Key-Value Store
//!
//! CowDB is an embedded, single-file, transactional key-value store: a
//! page-oriented, copy-on-write B+tree over an mmap'd file, in the lineage
//! of Berkeley-style single-file stores. One process opens one file,
//! performs read-only or read-write transactions, and within a transaction
//! manipulates named buckets of key/value pairs.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cowdb::Db;
//!
//! let db = Db::open("./app.db")?;
//!
//! db.update(|tx| {
//!     let bucket = tx.create_bucket("users")?;
//!     bucket.put(b"alice", b"admin")?;
//!     Ok(())
//! })?;
//!
//! db.view(|tx| {
//!     let bucket = tx.get_bucket("users")?;
//!     assert_eq!(bucket.get(b"alice")?.as_deref(), Some(b"admin" as &[u8]));
//!     Ok(())
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        Db / Tx / Bucket / Cursor     │
//! ├──────────────────────────────────────┤
//! │  Bucket registry │ Shadow pager      │
//! ├──────────────────┼───────────────────┤
//! │        Copy-on-write B+tree          │
//! ├──────────────────────────────────────┤
//! │  Meta protocol │ Freelist │ Pages    │
//! ├──────────────────────────────────────┤
//! │   Disk: file, advisory lock, mmap    │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Atomic commits**: a transaction's pages are fsynced before the meta
//!   page that references them; a crash at any point yields either the
//!   pre-commit or post-commit state on reopen, never a mixture.
//! - **Read isolation**: a read transaction observes the meta active at
//!   begin for its entire life; concurrent writers are invisible.
//! - **Many readers, one writer**: readers run concurrently against the
//!   shared mapping; the single writer publishes atomically at commit.
//! - **Single-writer process**: an exclusive advisory file lock makes a
//!   second opener fail fast with [`Error::Locked`].
//!
//! ## Module Overview
//!
//! - [`storage`]: page format, meta-page protocol, freelist, disk handler
//! - [`tree`]: copy-on-write B+tree nodes and the commit-time spill
//! - [`db`]: database handle, transactions, buckets, cursors
//! - [`config`]: open-time options and format constants

pub mod config;
pub mod db;
pub mod error;
pub mod storage;
pub mod tree;

pub use config::Options;
pub use db::{Bucket, Cursor, Db, Tx};
pub use error::{Error, Result};
pub use storage::{Pgid, Txid};
