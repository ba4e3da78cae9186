//! Append-only sorted string tables.
//!
//! A [`Table`] is an immutable file of key-ordered, prefix-compressed
//! records followed by a sparse key index. The compactor writes one table
//! per index kind (postlist, docdata, ...) and reads tables back only in
//! forward streaming order; there is no point-lookup path here, so the
//! index is write-only as far as this crate is concerned.
//!
//! # On-disk layout
//!
//! ```text
//! [record]*                          data region, strictly increasing keys
//! [sparse index block]               starts at the root offset
//! ```
//!
//! Each record is:
//!
//! ```text
//! first record:   [key_len (1 B)][key]
//! later records:  [reuse (1 B)][suffix_len (1 B)][key suffix]
//! then:           [pack_uint((value_len << 1) | compressed)][value bytes]
//! ```
//!
//! `reuse` is the number of leading bytes shared with the previous key, so
//! sorted keys cost only their distinguishing suffix. The bottom bit of
//! the length varint carries the record's "value is compressed" flag; the
//! writer never compresses, it only passes flags through from sources.
//!
//! The sparse index holds one `(key, offset)` entry per [`INDEX_BLOCK`]
//! bytes of output, prefix-compressed the same way. Its start offset is
//! the table's **root**, published through [`RootInfo`] to the version
//! file. The reader treats the root as end-of-data.
//!
//! # Lifecycle
//!
//! `create` → `add`* → `flush_db` → `commit` → (`read_item`* | `sync`).
//! Committing switches the table into read-only mode and rewinds it so a
//! follow-on merge pass can stream it back; this is how the cascaded
//! postlist merge consumes its temporary tables.


use std::fs;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::io::BufferedFile;
use crate::pack::pack_uint;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// One sparse-index entry is emitted per this many bytes of table output.
pub const INDEX_BLOCK: u64 = 1024;

/// Longest permitted key.
pub const MAX_KEY_LEN: usize = 255;

/// Smallest accepted block size for the output database.
pub const MIN_BLOCK_SIZE: usize = 2048;

/// Largest accepted block size; also used for cascade temporaries.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Block size used when the caller's request is out of range.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors from table creation, writing, and reading.
#[derive(Debug, Error)]
pub enum TableError {
    /// A caller-supplied value is out of range (e.g. key length).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was applied in the wrong lifecycle state or order.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The table's byte stream is not a valid record sequence.
    #[error("table corrupt: {0}")]
    Corrupt(&'static str),

    /// Opening an existing table failed.
    #[error("failed to open table {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Creating a new table failed.
    #[error("failed to create table {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O failure while reading or writing records.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// RootInfo
// ------------------------------------------------------------------------------------------------

/// Per-table metadata published to the version file.
///
/// The compactor only fills these fields in; persisting them is the
/// version sink's job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootInfo {
    /// Number of records in the table.
    pub num_entries: u64,
    /// Byte offset of the sparse index block.
    pub root: u64,
    /// Index levels. Always 1; a multi-level sparse index would raise it.
    pub level: u32,
    /// Block size recorded for the reader side.
    pub blocksize: u32,
    /// Minimum value size for compression on the read path; carried
    /// through unchanged, never consulted by the writer.
    pub compress_min: u32,
    /// Records were written in key order (always true here).
    pub sequential: bool,
    /// True when the root does not point at a real index.
    pub root_is_fake: bool,
    /// Serialised free-list state for block-structured outputs.
    pub free_list: Vec<u8>,
}

impl RootInfo {
    /// Reset to the state of a freshly created table.
    pub fn init(&mut self, blocksize: u32, compress_min: u32) {
        *self = RootInfo {
            blocksize,
            compress_min,
            root_is_fake: true,
            ..RootInfo::default()
        };
    }
}

// ------------------------------------------------------------------------------------------------
// SparseIndex
// ------------------------------------------------------------------------------------------------

/// Accumulates a sparse `(key, offset)` index over appended records.
///
/// The index is a passive observer: the writer offers every record via
/// [`maybe_add_entry`] and the index keeps roughly one entry per
/// [`INDEX_BLOCK`] bytes of output. Entries are prefix-compressed against
/// the previous index key. Single level only; a parent index receiving
/// the emitted entries' offsets would slot in here if deeper tables are
/// ever needed.
///
/// [`maybe_add_entry`]: SparseIndex::maybe_add_entry
#[derive(Debug)]
pub struct SparseIndex {
    data: Vec<u8>,
    granularity: u64,
    block: u64,
    entries: u64,
    last_key: Vec<u8>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::with_granularity(INDEX_BLOCK)
    }

    pub fn with_granularity(granularity: u64) -> Self {
        Self {
            data: Vec::new(),
            granularity: granularity.max(1),
            block: 0,
            entries: 0,
            last_key: Vec::new(),
        }
    }

    /// Offer a record at `offset`; an entry is added only when the offset
    /// crosses into a new index block.
    pub fn maybe_add_entry(&mut self, key: &[u8], offset: u64) {
        let cur_block = offset / self.granularity;
        if cur_block == self.block {
            return;
        }

        let limit = self.last_key.len().min(key.len());
        let mut reuse = 0;
        while reuse < limit && self.last_key[reuse] == key[reuse] {
            reuse += 1;
        }

        self.data.push(reuse as u8);
        self.data.push((key.len() - reuse) as u8);
        self.data.extend_from_slice(&key[reuse..]);
        pack_uint(&mut self.data, offset);

        self.block = cur_block;
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entries += 1;
    }

    /// Append the accumulated index block to `fh`, returning its start
    /// offset (the table's root).
    pub fn write(&self, fh: &mut BufferedFile) -> io::Result<u64> {
        let root = fh.position();
        fh.write(&self.data)?;
        Ok(root)
    }

    /// Size of the index block in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Number of index entries accumulated.
    pub fn num_entries(&self) -> u64 {
        self.entries
    }
}

impl Default for SparseIndex {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Table
// ------------------------------------------------------------------------------------------------

/// Creation options for an output table.
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    /// Whether [`Table::sync`] performs a real durability barrier.
    pub sync: bool,
    /// Lazy tables may be suppressed entirely when no source has them.
    pub lazy: bool,
    /// Unlink the file when the table is dropped. Used for cascade
    /// temporaries so they are cleaned up after consumption and on unwind.
    pub delete_on_drop: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            sync: true,
            lazy: false,
            delete_on_drop: false,
        }
    }
}

/// One record streamed back out of a committed table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableItem {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// The stored compression flag; the reader does not decompress.
    pub compressed: bool,
}

/// An append-only sorted table, then a forward-only reader after commit.
#[derive(Debug)]
pub struct Table {
    path: PathBuf,
    fh: BufferedFile,
    read_only: bool,
    last_key: Vec<u8>,
    index: SparseIndex,
    root: Option<u64>,
    num_entries: u64,
    compress_min: u32,
    full_compaction: bool,
    max_item_size: u32,
    lazy: bool,
    sync_enabled: bool,
    delete_on_drop: bool,
}

impl Table {
    /// Create a new table file for writing.
    pub fn create(
        path: &Path,
        root_info: &RootInfo,
        options: TableOptions,
    ) -> Result<Self, TableError> {
        let fh = BufferedFile::create(path).map_err(|source| TableError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::writer(path.to_path_buf(), fh, root_info, options))
    }

    /// Create a table appended to an already-open file, starting at its
    /// current seek position. Used for single-file output.
    pub fn append_to(
        file: File,
        root_info: &RootInfo,
        options: TableOptions,
    ) -> Result<Self, TableError> {
        let fh = BufferedFile::append_to(file)?;
        Ok(Self::writer(PathBuf::new(), fh, root_info, options))
    }

    fn writer(path: PathBuf, fh: BufferedFile, root_info: &RootInfo, options: TableOptions) -> Self {
        Self {
            path,
            fh,
            read_only: false,
            last_key: Vec::new(),
            index: SparseIndex::new(),
            root: None,
            num_entries: 0,
            compress_min: root_info.compress_min,
            full_compaction: false,
            max_item_size: 0,
            lazy: options.lazy,
            sync_enabled: options.sync,
            delete_on_drop: options.delete_on_drop,
        }
    }

    /// Open an existing committed table for forward reading.
    pub fn open(path: &Path, root_info: &RootInfo) -> Result<Self, TableError> {
        let fh = BufferedFile::open(path).map_err(|source| TableError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            fh,
            read_only: true,
            last_key: Vec::new(),
            index: SparseIndex::new(),
            root: Some(root_info.root),
            num_entries: root_info.num_entries,
            compress_min: root_info.compress_min,
            full_compaction: false,
            max_item_size: 0,
            lazy: false,
            sync_enabled: true,
            delete_on_drop: false,
        })
    }

    /// Append one record. Keys must be strictly increasing and between 1
    /// and [`MAX_KEY_LEN`] bytes.
    pub fn add(&mut self, key: &[u8], value: &[u8], compressed: bool) -> Result<(), TableError> {
        if self.read_only {
            return Err(TableError::InvalidOperation("add() on a read-only table"));
        }
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(TableError::InvalidArgument(format!(
                "invalid key length {}",
                key.len()
            )));
        }
        if key <= self.last_key.as_slice() {
            return Err(TableError::InvalidOperation(
                "new key not greater than the previous key",
            ));
        }

        if !self.last_key.is_empty() {
            let limit = self.last_key.len().min(key.len());
            let mut reuse = 0;
            while reuse < limit && self.last_key[reuse] == key[reuse] {
                reuse += 1;
            }
            self.fh.write_byte(reuse as u8)?;
            self.fh.write_byte((key.len() - reuse) as u8)?;
            self.fh.write(&key[reuse..])?;
        } else {
            self.fh.write_byte(key.len() as u8)?;
            self.fh.write(key)?;
        }
        self.num_entries += 1;
        self.index.maybe_add_entry(key, self.fh.position());

        let mut len_prefix = Vec::with_capacity(10);
        pack_uint(
            &mut len_prefix,
            ((value.len() as u64) << 1) | u64::from(compressed),
        );
        self.fh.write(&len_prefix)?;
        self.fh.write(value)?;

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        Ok(())
    }

    /// Write the sparse index and flush; the index's start offset becomes
    /// the root. Must precede [`commit`](Table::commit).
    pub fn flush_db(&mut self) -> Result<(), TableError> {
        if self.read_only {
            return Err(TableError::InvalidOperation(
                "flush_db() on a read-only table",
            ));
        }
        let root = self.index.write(&mut self.fh)?;
        self.root = Some(root);
        self.fh.flush()?;
        Ok(())
    }

    /// Fill in `root_info`, switch to read-only mode, and rewind for a
    /// potential follow-on read pass.
    pub fn commit(&mut self, _revision: u32, root_info: &mut RootInfo) -> Result<(), TableError> {
        let Some(root) = self.root else {
            return Err(TableError::InvalidOperation("commit() before flush_db()"));
        };

        root_info.level = 1;
        root_info.num_entries = self.num_entries;
        root_info.root_is_fake = false;
        root_info.sequential = true;
        root_info.root = root;
        root_info.blocksize = 2048;

        debug!(
            path = %self.path.display(),
            entries = self.num_entries,
            index_bytes = self.index.byte_len(),
            index_entries = self.index.num_entries(),
            full_compaction = self.full_compaction,
            max_item_size = self.max_item_size,
            "table committed"
        );

        self.read_only = true;
        self.fh.rewind()?;
        self.last_key.clear();
        Ok(())
    }

    /// Durability barrier, honouring the table's sync option.
    pub fn sync(&mut self) -> Result<(), TableError> {
        if self.sync_enabled {
            self.fh.sync()?;
        }
        Ok(())
    }

    /// Stream the next record out of a committed table, or `None` once
    /// the data region (everything before the root) is exhausted.
    pub fn read_item(&mut self) -> Result<Option<TableItem>, TableError> {
        if !self.read_only {
            return Ok(None);
        }
        if let Some(root) = self.root {
            if self.fh.position() >= root {
                return Ok(None);
            }
        }

        let Some(first) = self.fh.read_byte()? else {
            return Ok(None);
        };

        let (reuse, suffix_len) = if !self.last_key.is_empty() {
            let Some(second) = self.fh.read_byte()? else {
                return Err(TableError::Corrupt("end of file inside a key header"));
            };
            (first as usize, second as usize)
        } else {
            (0, first as usize)
        };
        if reuse > self.last_key.len() {
            return Err(TableError::Corrupt("key reuses more bytes than exist"));
        }

        let mut key = Vec::with_capacity(reuse + suffix_len);
        key.extend_from_slice(&self.last_key[..reuse]);
        key.resize(reuse + suffix_len, 0);
        self.fh.read_exact(&mut key[reuse..])?;
        self.last_key.clear();
        self.last_key.extend_from_slice(&key);

        // Value length varint: continuation bit is the high bit.
        let mut encoded_len = 0u64;
        let mut shift = 0u32;
        loop {
            let Some(byte) = self.fh.read_byte()? else {
                return Err(TableError::Corrupt("end of file inside a value length"));
            };
            if shift >= 64 || (shift == 63 && byte & 0x7F > 1) {
                return Err(TableError::Corrupt("value length varint invalid"));
            }
            encoded_len |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let compressed = encoded_len & 1 == 1;
        let value_len = (encoded_len >> 1) as usize;

        let mut value = vec![0u8; value_len];
        self.fh.read_exact(&mut value)?;

        Ok(Some(TableItem {
            key,
            value,
            compressed,
        }))
    }

    /// True when no records have been added (or, for an opened table,
    /// when the root record says it holds none).
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Size of the accumulated sparse index in bytes.
    pub fn index_byte_len(&self) -> usize {
        self.index.byte_len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record whether this pass is a full compaction. The append-only
    /// writer is already maximally dense, so this only affects bookkeeping.
    pub fn set_full_compaction(&mut self, full: bool) {
        self.full_compaction = full;
    }

    /// Record the maximum item size hint (`FULLER` compaction sets 1).
    pub fn set_max_item_size(&mut self, size: u32) {
        self.max_item_size = size;
    }

    /// The `compress_min` carried from the creating root record.
    pub fn compress_min(&self) -> u32 {
        self.compress_min
    }

    /// Whether this table kind may be suppressed when absent everywhere.
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.delete_on_drop && !self.path.as_os_str().is_empty() {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), %e, "failed to remove temporary table");
            }
        }
    }
}
