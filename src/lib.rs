//! # LexiconDB index compactor
//!
//! The database compactor for LexiconDB's on-disk search index. Given one
//! or more source databases and a parallel vector of document-id offsets,
//! it produces a single output database that is the logical union of the
//! inputs, with every document id renumbered into a disjoint range and all
//! index data rewritten densely into append-only sorted tables.
//!
//! ## Architecture
//!
//! ```text
//! sources ──► cursors ──► min-heap ──► record assembler ──► table writer
//!                │                                              │
//!                │  per-source docid shifting                   │  sparse index
//!                ▼                                              ▼
//!          key normalisation                             root record ──► version sink
//! ```
//!
//! The core is an external-memory, key-ordered multi-way merge over the six
//! index tables (`postlist`, `docdata`, `termlist`, `position`, `spelling`,
//! `synonym`), each with its own merge semantics: posting-list chunks are
//! re-assembled with per-term frequency totals, value statistics are folded,
//! spelling and synonym word sets are unioned, and docid-keyed tables are
//! re-keyed by sequential copy.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`io`] | Buffered sequential file I/O, one mode (read or write) per open |
//! | [`flock`] | Exclusive advisory lock on the destination directory |
//! | [`pack`] | Variable-length integer and sort-preserving key encodings |
//! | [`wordlist`] | Prefix-compressed and byte-length-prefixed word-set formats |
//! | [`sstable`] | Append-only sorted table writer/reader with a sparse key index |
//! | [`source`] | Contracts for source databases, codecs, and the version sink |
//! | [`compact`] | The compaction driver and the per-table merge engines |
//!
//! ## Scope
//!
//! The compactor is a strictly offline, single-threaded rebuild: no source
//! may be written to during a run, a partially written output is unusable,
//! and any error aborts the whole run. The read path over live databases,
//! the version-file format, and the compression codec are collaborators
//! reached through the traits in [`source`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use lexicondb::{compact, CompactConfig, Destination};
//!
//! let sources: Vec<&dyn SourceDatabase> = vec![&db_a, &db_b];
//! let offsets = vec![0, db_a_max_docid];
//! compact(
//!     &sources,
//!     &offsets,
//!     last_docid,
//!     Destination::Directory("/srv/index-compacted".into()),
//!     &mut version_file,
//!     None,
//!     &CompactConfig::default(),
//!     None,
//! )?;
//! ```

pub mod compact;
pub mod flock;
pub mod io;
pub mod pack;
pub mod source;
pub mod sstable;
pub mod wordlist;

pub use compact::{
    compact, CompactConfig, CompactError, CompactObserver, CompactionLevel, Destination,
};
pub use source::{
    Codec, DocId, SourceCursor, SourceDatabase, SourceTable, TableKind, TermCount, VersionSink,
};
pub use sstable::{RootInfo, Table, TableError, TableOptions};
