//! Contracts for the compactor's collaborators.
//!
//! The compactor core does not know how live databases store their tables,
//! how tags are compressed, or how the version file is laid out. Those
//! concerns arrive through the traits here:
//!
//! - [`SourceDatabase`] / [`SourceTable`] / [`SourceCursor`] — the read
//!   path over an input database. Cursors yield `(key, tag)` pairs in key
//!   order; the compactor never seeks.
//! - [`Codec`] — decompression of tag blobs, needed only when a merge has
//!   to look inside a stored tag that arrived compressed.
//! - [`VersionSink`] — receives each output table's [`RootInfo`] plus the
//!   last document id, then writes and publishes the version file.
//!
//! Errors crossing these boundaries are opaque boxed errors; the compactor
//! propagates them without interpretation.

use std::error::Error;

use crate::sstable::RootInfo;

/// Document identifier. Docids are 1-based; 0 never appears in an index.
pub type DocId = u32;

/// Term or collection frequency.
pub type TermCount = u32;

/// Opaque error type for collaborator failures.
pub type SourceError = Box<dyn Error + Send + Sync + 'static>;

// ------------------------------------------------------------------------------------------------
// Table kinds
// ------------------------------------------------------------------------------------------------

/// The six index tables of a database, in their fixed compaction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Postlist,
    DocData,
    TermList,
    Position,
    Spelling,
    Synonym,
}

impl TableKind {
    /// Compaction processes tables in exactly this order.
    pub const ALL: [TableKind; 6] = [
        TableKind::Postlist,
        TableKind::DocData,
        TableKind::TermList,
        TableKind::Position,
        TableKind::Spelling,
        TableKind::Synonym,
    ];

    /// The table's base file name.
    pub fn name(self) -> &'static str {
        match self {
            TableKind::Postlist => "postlist",
            TableKind::DocData => "docdata",
            TableKind::TermList => "termlist",
            TableKind::Position => "position",
            TableKind::Spelling => "spelling",
            TableKind::Synonym => "synonym",
        }
    }

    /// Lazy tables may be absent from a database and are suppressed from
    /// the output when no source has them.
    pub fn is_lazy(self) -> bool {
        !matches!(self, TableKind::Postlist | TableKind::TermList)
    }
}

// ------------------------------------------------------------------------------------------------
// Read-path contracts
// ------------------------------------------------------------------------------------------------

/// A forward cursor over one source table.
///
/// A fresh cursor is positioned before the first record; the first
/// [`advance`](SourceCursor::advance) moves onto it. `key`, `raw_tag`,
/// and `tag` are only meaningful after an `advance` returned `true`.
pub trait SourceCursor {
    /// Move to the next record. `false` means the table is exhausted.
    fn advance(&mut self) -> Result<bool, SourceError>;

    /// The current record's key.
    fn key(&self) -> &[u8];

    /// The current tag exactly as stored, with its compression flag.
    fn raw_tag(&self) -> (&[u8], bool);

    /// The current tag fully materialised, decompressing if required.
    fn tag(&mut self) -> Result<&[u8], SourceError>;
}

/// One table of a source database.
pub trait SourceTable {
    /// Number of records, as recorded by the source's own metadata.
    fn entry_count(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// On-disk size in bytes, or `None` when it cannot be determined
    /// (compaction proceeds, but size deltas are not reported).
    fn disk_size(&self) -> Option<u64>;

    /// A fresh cursor positioned before the first record.
    fn cursor(&self) -> Box<dyn SourceCursor + '_>;
}

/// A source database contributing to the compaction.
pub trait SourceDatabase {
    /// The handle for one of the six tables, or `None` when the database
    /// does not have it (only lazy tables may be absent).
    fn table(&self, kind: TableKind) -> Option<&dyn SourceTable>;

    /// Databases with uncommitted writes cannot feed single-file output.
    fn has_uncommitted_changes(&self) -> bool {
        false
    }

    /// True when this source is itself a single concatenated file, in
    /// which case per-table sizes are not reportable.
    fn is_single_file(&self) -> bool {
        false
    }
}

// ------------------------------------------------------------------------------------------------
// Compression codec
// ------------------------------------------------------------------------------------------------

/// Black-box decompressor for tag blobs.
///
/// The compactor never compresses: already-compressed tags are passed
/// through with their flag intact, and a codec is consulted only when a
/// merge must read inside a compressed tag from a stored table.
pub trait Codec {
    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, SourceError>;
}

// ------------------------------------------------------------------------------------------------
// Version file
// ------------------------------------------------------------------------------------------------

/// Sink for the output database's version metadata.
///
/// The compactor fills in one [`RootInfo`] per emitted table, sets the
/// last document id, asks for the version file to be written, and finally
/// asks for it to be published (synced) once every table is durable.
pub trait VersionSink {
    /// The root record to fill in for `kind`. Reading `compress_min` from
    /// it configures the output table; committing writes the rest.
    fn root_mut(&mut self, kind: TableKind) -> &mut RootInfo;

    /// Highest document id in the output database.
    fn set_last_docid(&mut self, did: DocId);

    /// Offset at which table data may start in single-file output (the
    /// bytes before it belong to the version header).
    fn base_offset(&self) -> u64 {
        0
    }

    /// Write the version file at the given revision.
    fn write(&mut self, revision: u32) -> Result<(), SourceError>;

    /// Publish the written version file (durability barrier).
    fn sync(&mut self) -> Result<(), SourceError>;
}
