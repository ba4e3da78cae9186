//! In-memory fakes and tag builders for compaction tests.
//!
//! `MemDb`/`MemTable` implement the source-database contracts over a
//! `BTreeMap`, with an XOR stand-in for the compression codec so both the
//! compressed fast path and the materialising slow path can be exercised
//! without a real compressor.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::compact::{compact, CompactConfig, CompactError, CompactObserver, Destination};
use crate::pack::{
    pack_string_preserving_sort, pack_uint, pack_uint_preserving_sort,
};
use crate::source::{
    Codec, DocId, SourceCursor, SourceDatabase, SourceError, SourceTable, TableKind, VersionSink,
};
use crate::sstable::{RootInfo, Table};

pub fn init_tracing() {
    let _ = Subscriber::builder().with_max_level(Level::DEBUG).try_init();
}

// ------------------------------------------------------------------------------------------------
// Fake compression
// ------------------------------------------------------------------------------------------------

/// Stand-in "compression": an involutive XOR, so compress == decompress.
pub fn fake_compress(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ 0x5A).collect()
}

pub struct XorCodec;

impl Codec for XorCodec {
    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, SourceError> {
        Ok(fake_compress(input))
    }
}

// ------------------------------------------------------------------------------------------------
// In-memory source database
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
pub struct MemTable {
    pub entries: BTreeMap<Vec<u8>, (Vec<u8>, bool)>,
    pub stat_fails: bool,
}

impl MemTable {
    pub fn insert(&mut self, key: Vec<u8>, tag: Vec<u8>) {
        self.entries.insert(key, (tag, false));
    }

    /// Store `tag` fake-compressed with the compressed flag set.
    pub fn insert_compressed(&mut self, key: Vec<u8>, tag: &[u8]) {
        self.entries.insert(key, (fake_compress(tag), true));
    }
}

impl SourceTable for MemTable {
    fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    fn disk_size(&self) -> Option<u64> {
        if self.stat_fails {
            return None;
        }
        Some(
            self.entries
                .iter()
                .map(|(k, (v, _))| (k.len() + v.len()) as u64)
                .sum(),
        )
    }

    fn cursor(&self) -> Box<dyn SourceCursor + '_> {
        Box::new(MemCursor {
            iter: self.entries.iter(),
            current: None,
            materialised: None,
        })
    }
}

pub struct MemCursor<'a> {
    iter: std::collections::btree_map::Iter<'a, Vec<u8>, (Vec<u8>, bool)>,
    current: Option<(&'a Vec<u8>, &'a (Vec<u8>, bool))>,
    materialised: Option<Vec<u8>>,
}

impl SourceCursor for MemCursor<'_> {
    fn advance(&mut self) -> Result<bool, SourceError> {
        self.materialised = None;
        self.current = self.iter.next();
        Ok(self.current.is_some())
    }

    fn key(&self) -> &[u8] {
        self.current.map_or(&[], |(key, _)| key.as_slice())
    }

    fn raw_tag(&self) -> (&[u8], bool) {
        self.current
            .map_or((&[][..], false), |(_, (tag, compressed))| {
                (tag.as_slice(), *compressed)
            })
    }

    fn tag(&mut self) -> Result<&[u8], SourceError> {
        let Some((_, (tag, compressed))) = self.current else {
            return Ok(&[]);
        };
        if !*compressed {
            return Ok(tag.as_slice());
        }
        if self.materialised.is_none() {
            self.materialised = Some(fake_compress(tag));
        }
        Ok(self.materialised.as_deref().unwrap_or(&[]))
    }
}

#[derive(Default)]
pub struct MemDb {
    pub tables: HashMap<TableKind, MemTable>,
    pub uncommitted: bool,
}

impl MemDb {
    /// A database with every non-lazy table present (but empty).
    pub fn new() -> Self {
        let mut db = Self::default();
        db.tables.insert(TableKind::Postlist, MemTable::default());
        db.tables.insert(TableKind::TermList, MemTable::default());
        db
    }

    pub fn table_mut(&mut self, kind: TableKind) -> &mut MemTable {
        self.tables.entry(kind).or_default()
    }
}

impl SourceDatabase for MemDb {
    fn table(&self, kind: TableKind) -> Option<&dyn SourceTable> {
        self.tables.get(&kind).map(|t| t as &dyn SourceTable)
    }

    fn has_uncommitted_changes(&self) -> bool {
        self.uncommitted
    }
}

// ------------------------------------------------------------------------------------------------
// Version sink and observer fakes
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TestVersionSink {
    pub roots: HashMap<TableKind, RootInfo>,
    pub last_docid: DocId,
    pub written: bool,
    pub synced: bool,
}

impl VersionSink for TestVersionSink {
    fn root_mut(&mut self, kind: TableKind) -> &mut RootInfo {
        self.roots.entry(kind).or_default()
    }

    fn set_last_docid(&mut self, did: DocId) {
        self.last_docid = did;
    }

    fn write(&mut self, _revision: u32) -> Result<(), SourceError> {
        self.written = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), SourceError> {
        self.synced = true;
        Ok(())
    }
}

/// Records status messages and resolver invocations; resolves metadata
/// conflicts with a fixed closure when one is configured.
#[derive(Default)]
pub struct RecordingObserver {
    pub statuses: Vec<(String, String)>,
    pub resolve_calls: Vec<(Vec<u8>, Vec<Vec<u8>>)>,
    pub resolved_tag: Option<Vec<u8>>,
}

impl CompactObserver for RecordingObserver {
    fn set_status(&mut self, table: &str, message: &str) {
        self.statuses.push((table.to_string(), message.to_string()));
    }

    fn resolve_duplicate_metadata(&mut self, key: &[u8], tags: &[Vec<u8>]) -> Vec<u8> {
        self.resolve_calls.push((key.to_vec(), tags.to_vec()));
        match &self.resolved_tag {
            Some(tag) => tag.clone(),
            None => tags.first().cloned().unwrap_or_default(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Key and tag builders
// ------------------------------------------------------------------------------------------------

pub fn metadata_key(name: &[u8]) -> Vec<u8> {
    let mut key = vec![0x00, 0xC0];
    key.extend_from_slice(name);
    key
}

pub fn valuestats_key(slot: u64) -> Vec<u8> {
    let mut key = vec![0x00, 0xD0];
    pack_uint(&mut key, slot);
    key
}

pub fn valuechunk_key(slot: u64, did: DocId) -> Vec<u8> {
    let mut key = vec![0x00, 0xD8];
    pack_uint(&mut key, slot);
    pack_uint_preserving_sort(&mut key, u64::from(did));
    key
}

pub fn doclen_initial_key() -> Vec<u8> {
    vec![0x00, 0xE0]
}

/// Key of a term's initial posting chunk.
pub fn initial_postlist_key(term: &[u8]) -> Vec<u8> {
    let mut key = Vec::new();
    pack_string_preserving_sort(&mut key, term, true);
    key
}

/// Tag of an initial posting chunk. `body[0]` must be the continuation
/// flag byte (`b'1'` when the chunk is the last of its list).
pub fn initial_postlist_tag(tf: u64, cf: u64, firstdid: DocId, body: &[u8]) -> Vec<u8> {
    let mut tag = Vec::new();
    pack_uint(&mut tag, tf);
    pack_uint(&mut tag, cf);
    pack_uint(&mut tag, u64::from(firstdid) - 1);
    tag.extend_from_slice(body);
    tag
}

pub fn position_key(term: &[u8], did: DocId) -> Vec<u8> {
    let mut key = Vec::new();
    pack_string_preserving_sort(&mut key, term, false);
    pack_uint_preserving_sort(&mut key, u64::from(did));
    key
}

pub fn docid_key(did: DocId) -> Vec<u8> {
    let mut key = Vec::new();
    pack_uint_preserving_sort(&mut key, u64::from(did));
    key
}

pub fn docid_key_with_suffix(did: DocId, suffix: &[u8]) -> Vec<u8> {
    let mut key = docid_key(did);
    key.extend_from_slice(suffix);
    key
}

pub fn spelling_freq_key(word: &[u8]) -> Vec<u8> {
    let mut key = vec![b'W'];
    key.extend_from_slice(word);
    key
}

pub fn spelling_wordset_tag(words: &[&[u8]]) -> Vec<u8> {
    let mut writer = crate::wordlist::PrefixCompressedWriter::new();
    for word in words {
        writer.append(word);
    }
    writer.into_bytes()
}

pub fn synonym_tag(words: &[&[u8]]) -> Vec<u8> {
    let mut tag = Vec::new();
    for word in words {
        crate::wordlist::append_synonym_word(&mut tag, word);
    }
    tag
}

// ------------------------------------------------------------------------------------------------
// Running and reading back
// ------------------------------------------------------------------------------------------------

/// Compact `sources` into `dir` and return the filled version sink.
pub fn compact_into_dir(
    sources: &[&MemDb],
    offsets: &[DocId],
    last_docid: DocId,
    dir: &Path,
    config: &CompactConfig,
    observer: Option<&mut dyn CompactObserver>,
) -> Result<TestVersionSink, CompactError> {
    let dyn_sources: Vec<&dyn SourceDatabase> =
        sources.iter().map(|db| *db as &dyn SourceDatabase).collect();
    let mut sink = TestVersionSink::default();
    compact(
        &dyn_sources,
        offsets,
        last_docid,
        Destination::Directory(dir.to_path_buf()),
        &mut sink,
        Some(&XorCodec),
        config,
        observer,
    )?;
    Ok(sink)
}

/// All records of a committed table file, in order.
pub fn read_table(dir: &Path, kind: TableKind, sink: &TestVersionSink) -> Vec<(Vec<u8>, Vec<u8>, bool)> {
    let root_info = sink.roots.get(&kind).expect("table was emitted");
    let path = dir.join(format!("{}.lxt", kind.name()));
    let mut table = Table::open(&path, root_info).expect("open output table");
    let mut records = Vec::new();
    while let Some(item) = table.read_item().expect("read output table") {
        records.push((item.key, item.value, item.compressed));
    }
    assert_eq!(records.len() as u64, root_info.num_entries);
    records
}

/// Rebuild a `MemDb` from a compacted output directory, for idempotence
/// checks (output tables are valid source tables).
pub fn db_from_output(dir: &Path, sink: &TestVersionSink) -> MemDb {
    let mut db = MemDb::default();
    for kind in TableKind::ALL {
        if !sink.roots.contains_key(&kind) {
            continue;
        }
        let table = db.table_mut(kind);
        for (key, tag, compressed) in read_table(dir, kind, sink) {
            table.entries.insert(key, (tag, compressed));
        }
    }
    db
}
