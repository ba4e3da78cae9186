//! # Compaction driver
//!
//! Orchestrates one full compaction run: for each of the six index tables
//! (in the fixed order `postlist, docdata, termlist, position, spelling,
//! synonym`) it resolves the per-source input tables, creates the output
//! table, dispatches to the right merge engine, and commits the table's
//! root record into the version sink. After the last table it pads
//! single-file output to a whole block, writes the version file, fsyncs
//! every table, and publishes.
//!
//! ## Table rules
//!
//! - **Lazy tables** (`docdata`, `position`, `spelling`, `synonym`) are
//!   emitted only when at least one source has them.
//! - **Termlist** is all-or-nothing: if any source lacks it, the output
//!   has no termlist at all (the engine tolerates a missing termlist but
//!   not a partial one).
//! - **Postlist** fan-in above 3 is reduced by a cascaded pairwise merge
//!   when `multipass` is set (never in single-file mode, which has
//!   nowhere to put the temporaries).
//!
//! ## Failure model
//!
//! Every error aborts the run immediately. Files already written to the
//! destination are left behind for inspection; the caller must remove
//! them before retrying. The destination-directory lock is released when
//! the run ends either way.

#[cfg(test)]
mod tests;

mod cursor;
mod merge;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

use crate::flock::FileLock;
use crate::source::{
    Codec, DocId, SourceDatabase, SourceError, SourceTable, TableKind, VersionSink,
};
use crate::sstable::{
    Table, TableError, TableOptions, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
use merge::{
    merge_docid_keyed, merge_positions, merge_postlists, merge_spellings, merge_synonyms,
    multimerge_postlists, MergeInput,
};

/// Lock file held in the destination directory for the whole run.
pub const LOCK_FILENAME: &str = "lexicondb.lock";

/// Extension of every table file.
const TABLE_EXTENSION: &str = "lxt";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors from a compaction run.
#[derive(Debug, Error)]
pub enum CompactError {
    /// A caller-supplied parameter is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested operation is not allowed in this configuration.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// A source record could not be decoded.
    #[error("database corrupt: {0}")]
    Corrupt(&'static str),

    /// A decoded statistic exceeds its domain.
    #[error("value out of range: {0}")]
    Range(&'static str),

    /// Failure in the output table layer.
    #[error(transparent)]
    Table(#[from] TableError),

    /// Failure reported by a source database, codec, or the version sink.
    #[error("collaborator error: {0}")]
    Source(#[from] SourceError),

    /// The destination lock could not be acquired.
    #[error("could not lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The single-file destination could not be created.
    #[error("failed to create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O failure outside the table layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub(crate) fn corrupt(message: &'static str) -> CompactError {
    CompactError::Corrupt(message)
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// How aggressively to re-pack the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionLevel {
    /// Leave the writer's normal density.
    #[default]
    Standard,
    /// Mark the pass as a full compaction.
    Full,
    /// Full compaction plus `max_item_size = 1` (split aggressively).
    Fuller,
}

/// Tunables for one compaction run.
#[derive(Debug, Clone)]
pub struct CompactConfig {
    /// Output block size. Must be a power of two in
    /// `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]`, else the default is used.
    pub block_size: usize,

    /// Compaction aggressiveness.
    pub level: CompactionLevel,

    /// Reduce postlist merge fan-in with cascaded pairwise merges.
    /// Ignored for single-file output.
    pub multipass: bool,

    /// Skip the fsync of committed cascade temporaries. Real output
    /// tables are always fsynced before the version file is published.
    pub no_sync: bool,

    /// Skip durability barriers on intermediate writes. Like `no_sync`
    /// this relaxes only the cascaded merge's temporary tables; the
    /// published output is unaffected.
    pub dangerous: bool,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            level: CompactionLevel::Standard,
            multipass: false,
            no_sync: false,
            dangerous: false,
        }
    }
}

/// Where the output database goes.
pub enum Destination {
    /// One file per table, plus the version file, inside this directory.
    Directory(PathBuf),
    /// All tables concatenated into one file created (or truncated into
    /// place) at this path.
    SingleFilePath(PathBuf),
    /// All tables concatenated into this pre-opened file.
    SingleFileHandle(File),
}

/// Progress reporting and user-metadata conflict resolution.
///
/// Both callbacks are optional in spirit: a run with no observer resolves
/// metadata conflicts by keeping the first source's tag and reports
/// nothing.
pub trait CompactObserver {
    /// Progress message for a table; the empty message marks the start of
    /// that table's pass.
    fn set_status(&mut self, _table: &str, _message: &str) {}

    /// Combine conflicting user-metadata tags (two or more) for one key
    /// into the single tag to store.
    fn resolve_duplicate_metadata(&mut self, _key: &[u8], tags: &[Vec<u8>]) -> Vec<u8> {
        tags.first().cloned().unwrap_or_default()
    }
}

/// Reborrow an `Option<&mut dyn CompactObserver>` with a lifetime tied to
/// `observer` itself rather than to the enclosing function's signature.
/// Calling `.as_deref_mut()` directly inside a loop ties the reborrow to the
/// whole-function lifetime of the original reference, which the borrow
/// checker then treats as live across iterations; routing through this
/// helper's own lifetime parameter avoids that.
pub(crate) fn reborrow_observer<'a>(
    observer: &'a mut Option<&mut dyn CompactObserver>,
) -> Option<&'a mut dyn CompactObserver> {
    match observer {
        Some(obs) => Some(&mut **obs),
        None => None,
    }
}

// ------------------------------------------------------------------------------------------------
// Driver
// ------------------------------------------------------------------------------------------------

enum Output {
    Dir(PathBuf),
    Single(File),
}

/// Options for a real output table. Always fsynced before the version
/// file is published, whatever the durability flags say.
pub(crate) fn output_table_options(kind: TableKind) -> TableOptions {
    TableOptions {
        sync: true,
        lazy: kind.is_lazy(),
        delete_on_drop: false,
    }
}

/// Options for a cascade temporary: unlinked once consumed, and the only
/// tables whose durability the `no_sync`/`dangerous` flags relax.
pub(crate) fn temp_table_options(config: &CompactConfig) -> TableOptions {
    TableOptions {
        sync: !(config.no_sync || config.dangerous),
        lazy: false,
        delete_on_drop: true,
    }
}

/// Compact `sources` into `destination`.
///
/// `offsets[i]` is added to every document id read from `sources[i]`;
/// offsets must be chosen so the shifted ranges are disjoint and
/// monotone with source order. `last_docid` is the highest document id
/// of the combined output and is recorded in the version file.
///
/// On success every table has been committed and fsynced and the version
/// file published. On error the destination is left incomplete and must
/// be discarded by the caller.
#[allow(clippy::too_many_arguments)]
pub fn compact(
    sources: &[&dyn SourceDatabase],
    offsets: &[DocId],
    last_docid: DocId,
    destination: Destination,
    version: &mut dyn VersionSink,
    codec: Option<&dyn Codec>,
    config: &CompactConfig,
    mut observer: Option<&mut dyn CompactObserver>,
) -> Result<(), CompactError> {
    if sources.is_empty() {
        return Err(CompactError::InvalidArgument(
            "no source databases".to_string(),
        ));
    }
    if sources.len() != offsets.len() {
        return Err(CompactError::InvalidArgument(format!(
            "{} sources but {} docid offsets",
            sources.len(),
            offsets.len()
        )));
    }

    let block_size = if config.block_size.is_power_of_two()
        && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&config.block_size)
    {
        config.block_size
    } else {
        DEFAULT_BLOCK_SIZE
    };

    let single_file = !matches!(destination, Destination::Directory(_));
    let multipass = config.multipass && !single_file;

    if single_file && sources.iter().any(|s| s.has_uncommitted_changes()) {
        return Err(CompactError::InvalidOperation(
            "cannot compact a database with uncommitted changes into single-file output",
        ));
    }

    let (_lock, mut output) = match destination {
        Destination::Directory(dir) => {
            let lock_path = dir.join(LOCK_FILENAME);
            let lock = FileLock::lock(&lock_path).map_err(|source| CompactError::Lock {
                path: lock_path,
                source,
            })?;
            (Some(lock), Output::Dir(dir))
        }
        Destination::SingleFilePath(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(|source| CompactError::Create { path, source })?;
            (None, Output::Single(file))
        }
        Destination::SingleFileHandle(file) => (None, Output::Single(file)),
    };

    info!(
        sources = sources.len(),
        last_docid,
        single_file,
        multipass,
        block_size,
        "compaction started"
    );

    let mut tables: Vec<Table> = Vec::new();
    let mut total_index_bytes: usize = 0;
    let mut single_pos: u64 = version.base_offset();
    let mut prev_size: u64 = block_size as u64;

    for kind in TableKind::ALL {
        if let Some(obs) = reborrow_observer(&mut observer) {
            obs.set_status(kind.name(), "");
        }

        // Resolve this table in every source and count how many actually
        // have it. Absent lazy tables are simply missing; empty tables
        // still participate (their cursors yield nothing).
        let mut present: Vec<(&dyn SourceTable, DocId)> = Vec::new();
        let mut inputs_present = 0usize;
        let mut output_will_exist = !kind.is_lazy();
        let mut bad_stat = false;
        let mut single_file_in = false;
        let mut in_size: u64 = 0; // KiB

        for (src, &offset) in sources.iter().zip(offsets) {
            let Some(table) = src.table(kind) else {
                continue;
            };
            if src.is_single_file() {
                if kind.is_lazy() && table.is_empty() {
                    // Essentially doesn't exist.
                } else {
                    single_file_in = true;
                    output_will_exist = true;
                    inputs_present += 1;
                }
            } else {
                match table.disk_size() {
                    Some(size) => {
                        in_size += size / 1024;
                        output_will_exist = true;
                        inputs_present += 1;
                    }
                    None => {
                        bad_stat = true;
                        output_will_exist = true;
                        inputs_present += 1;
                    }
                }
            }
            present.push((table, offset));
        }

        // A partial termlist is worse than none: suppress the output
        // unless every source contributes one.
        if kind == TableKind::TermList && inputs_present != sources.len() {
            if inputs_present != 0 {
                if let Some(obs) = reborrow_observer(&mut observer) {
                    obs.set_status(
                        kind.name(),
                        &format!(
                            "{} of {} inputs present, so suppressing output",
                            inputs_present,
                            sources.len()
                        ),
                    );
                }
                continue;
            }
            output_will_exist = false;
        }

        if !output_will_exist {
            if let Some(obs) = reborrow_observer(&mut observer) {
                obs.set_status(kind.name(), "doesn't exist");
            }
            continue;
        }

        let table_options = output_table_options(kind);
        let mut dest_path: Option<PathBuf> = None;
        let mut out = match &mut output {
            Output::Dir(dir) => {
                let path = dir.join(format!("{}.{}", kind.name(), TABLE_EXTENSION));
                let table = Table::create(&path, version.root_mut(kind), table_options)?;
                dest_path = Some(path);
                table
            }
            Output::Single(file) => {
                file.seek(SeekFrom::Start(single_pos))?;
                Table::append_to(file.try_clone()?, version.root_mut(kind), table_options)?
            }
        };

        out.set_full_compaction(config.level != CompactionLevel::Standard);
        if config.level == CompactionLevel::Fuller {
            out.set_max_item_size(1);
        }

        let table_offsets: Vec<DocId> = present.iter().map(|(_, offset)| *offset).collect();
        match kind {
            TableKind::Postlist => {
                let inputs: Vec<MergeInput> =
                    present.iter().map(|(t, _)| MergeInput::Live(*t)).collect();
                match (&output, multipass && inputs.len() > 3) {
                    (Output::Dir(dir), true) => multimerge_postlists(
                        &mut out,
                        dir,
                        inputs,
                        table_offsets.clone(),
                        temp_table_options(config),
                        reborrow_observer(&mut observer),
                    )?,
                    _ => merge_postlists(
                        &mut out,
                        inputs,
                        &table_offsets,
                        reborrow_observer(&mut observer),
                    )?,
                }
            }
            TableKind::Spelling => {
                let inputs = present.iter().map(|(t, _)| MergeInput::Live(*t)).collect();
                merge_spellings(&mut out, inputs, codec)?;
            }
            TableKind::Synonym => {
                let inputs = present.iter().map(|(t, _)| MergeInput::Live(*t)).collect();
                merge_synonyms(&mut out, inputs, codec)?;
            }
            TableKind::Position => {
                let inputs = present.iter().map(|(t, _)| MergeInput::Live(*t)).collect();
                merge_positions(&mut out, inputs, &table_offsets)?;
            }
            TableKind::DocData | TableKind::TermList => {
                let inputs: Vec<&dyn SourceTable> =
                    present.iter().map(|(t, _)| *t).collect();
                merge_docid_keyed(&mut out, &inputs, &table_offsets)?;
            }
        }

        out.flush_db()?;
        out.commit(1, version.root_mut(kind))?;
        out.sync()?;

        if matches!(output, Output::Single(_)) {
            let root_info = version.root_mut(kind);
            single_pos = root_info.root + out.index_byte_len() as u64;
        }
        total_index_bytes += out.index_byte_len();
        debug!(
            table = kind.name(),
            entries = out.num_entries(),
            index_bytes = out.index_byte_len(),
            total_index_bytes,
            "table pass finished"
        );

        // Per-table size delta for the status callback.
        let mut out_size: u64 = 0; // KiB
        if !bad_stat && !single_file_in {
            let measured: io::Result<u64> = match (&output, &dest_path) {
                (Output::Single(file), _) => file.metadata().map(|m| m.len()),
                (_, Some(path)) => fs::metadata(path).map(|m| m.len()),
                _ => Ok(0),
            };
            match measured {
                Ok(size) => {
                    let effective = if matches!(output, Output::Single(_)) {
                        let consumed = prev_size.max(block_size as u64);
                        prev_size = size;
                        size.saturating_sub(consumed)
                    } else {
                        size
                    };
                    out_size = effective / 1024;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(_) => bad_stat = true,
            }
        }
        if let Some(obs) = reborrow_observer(&mut observer) {
            if bad_stat {
                obs.set_status(kind.name(), "Done (couldn't stat all the DB files)");
            } else if single_file_in {
                obs.set_status(
                    kind.name(),
                    "Done (table sizes unknown for single file DB input)",
                );
            } else {
                obs.set_status(kind.name(), &size_status(in_size, out_size));
            }
        }

        tables.push(out);
    }

    // Pad single-file output to at least one block so its leading bytes
    // cannot be parsed as a stub-database descriptor.
    if let Output::Single(file) = &mut output {
        if file.metadata()?.len() < block_size as u64 {
            file.set_len(block_size as u64)?;
        }
    }

    version.set_last_docid(last_docid);
    version.write(1)?;
    for table in &mut tables {
        table.sync()?;
    }
    version.sync()?;

    info!(
        tables = tables.len(),
        total_index_bytes, "compaction complete"
    );
    Ok(())
}

/// "Reduced by 12% 34K (280K -> 246K)" style message for the observer.
fn size_status(in_size: u64, out_size: u64) -> String {
    let mut status = String::new();
    if out_size == in_size {
        status.push_str("Size unchanged (");
    } else {
        let delta = if out_size < in_size {
            status.push_str("Reduced by ");
            in_size - out_size
        } else {
            status.push_str("INCREASED by ");
            out_size - in_size
        };
        if in_size > 0 {
            status.push_str(&format!("{}% ", 100 * delta / in_size));
        }
        status.push_str(&format!("{delta}K ({in_size}K -> "));
    }
    status.push_str(&format!("{out_size}K)"));
    status
}
