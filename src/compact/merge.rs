//! The per-table merge engines.
//!
//! Each merge is a min-heap k-way merge over cursors, with table-specific
//! record re-assembly:
//!
//! - [`merge_postlists`] runs four phases over one heap, consuming a
//!   contiguous prefix of the key space per phase: user metadata (with
//!   optional conflict resolution), value statistics (folded), value
//!   stream chunks (copied through), then posting chunks re-assembled per
//!   term with summed frequencies.
//! - [`merge_spellings`] and [`merge_synonyms`] union sorted word sets,
//!   copying unique keys through without touching compression.
//! - [`merge_positions`] copies normalised records; disjoint docid ranges
//!   guarantee no collisions.
//! - [`merge_docid_keyed`] needs no heap at all: docid-keyed tables from
//!   sources with disjoint, ordered ranges concatenate.
//! - [`multimerge_postlists`] bounds postlist fan-in by cascading pairwise
//!   merges through temporary tables.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

use tracing::debug;

use crate::pack::{
    decode_valuestats, encode_valuestats, is_doclenchunk_key, is_user_metadata_key,
    is_valuechunk_key, is_valuestats_key, pack_postlist_key, pack_uint, pack_uint_last,
    pack_uint_preserving_sort, unpack_string_preserving_sort, unpack_uint_last,
    unpack_uint_preserving_sort, UnpackError,
};
use crate::source::{Codec, DocId, SourceTable};
use crate::sstable::{RootInfo, Table, TableOptions, MAX_BLOCK_SIZE};
use crate::wordlist::{
    append_synonym_word, ByteLengthPrefixedReader, PrefixCompressedReader, PrefixCompressedWriter,
};

use super::cursor::{MergeCursor, MergeSource, PositionCursor, PostlistCursor, RawSource};
use super::{corrupt, reborrow_observer, CompactError, CompactObserver};

// ------------------------------------------------------------------------------------------------
// Merge inputs
// ------------------------------------------------------------------------------------------------

/// One input to a merge: a live source table, or a stored table produced
/// by an earlier cascade round (consumed, and unlinked once done).
pub(crate) enum MergeInput<'a> {
    Live(&'a dyn SourceTable),
    Stored(Table),
}

impl<'a> MergeInput<'a> {
    fn is_empty(&self) -> bool {
        match self {
            MergeInput::Live(table) => table.is_empty(),
            MergeInput::Stored(table) => table.is_empty(),
        }
    }

    fn into_raw_source(self) -> RawSource<'a> {
        match self {
            MergeInput::Live(table) => RawSource::Live(table.cursor()),
            MergeInput::Stored(table) => RawSource::Stored(table),
        }
    }

    fn into_merge_source(self, codec: Option<&'a dyn Codec>) -> MergeSource<'a> {
        match self {
            MergeInput::Live(table) => MergeSource::Live(table.cursor()),
            MergeInput::Stored(table) => MergeSource::Stored { table, codec },
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Heap orderings
// ------------------------------------------------------------------------------------------------

// `BinaryHeap` is a max-heap, so every ordering below is inverted to make
// the smallest element surface first. Each heap slot owns its cursor plus
// its source's position in the input order; the position breaks key ties
// so that records for one key always surface in source order (the
// metadata first-source-wins rule depends on this). Popping transfers
// ownership to the loop body, which advances in place and pushes back
// while the cursor is still live.

struct PostEntry<'a>(PostlistCursor<'a>, usize);

impl PartialEq for PostEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.key == other.0.key && self.0.firstdid == other.0.firstdid && self.1 == other.1
    }
}
impl Eq for PostEntry<'_> {}
impl PartialOrd for PostEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PostEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .key
            .cmp(&self.0.key)
            .then_with(|| other.0.firstdid.cmp(&self.0.firstdid))
            .then_with(|| other.1.cmp(&self.1))
    }
}

struct WordSetEntry<'a>(MergeCursor<'a>, usize);

impl PartialEq for WordSetEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.key == other.0.key && self.1 == other.1
    }
}
impl Eq for WordSetEntry<'_> {}
impl PartialOrd for WordSetEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WordSetEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .key
            .cmp(&self.0.key)
            .then_with(|| other.1.cmp(&self.1))
    }
}

struct PosEntry<'a>(PositionCursor<'a>, usize);

impl PartialEq for PosEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.key == other.0.key && self.1 == other.1
    }
}
impl Eq for PosEntry<'_> {}
impl PartialOrd for PosEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PosEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .key
            .cmp(&self.0.key)
            .then_with(|| other.1.cmp(&self.1))
    }
}

struct SpellWord<'a>(PrefixCompressedReader<'a>);

impl PartialEq for SpellWord<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.current() == other.0.current()
    }
}
impl Eq for SpellWord<'_> {}
impl PartialOrd for SpellWord<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SpellWord<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.current().cmp(self.0.current())
    }
}

struct SynWord<'a>(ByteLengthPrefixedReader<'a>);

impl PartialEq for SynWord<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.current() == other.0.current()
    }
}
impl Eq for SynWord<'_> {}
impl PartialOrd for SynWord<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SynWord<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.current().cmp(self.0.current())
    }
}

// ------------------------------------------------------------------------------------------------
// merge_postlists
// ------------------------------------------------------------------------------------------------

fn flush_metadata(
    out: &mut Table,
    observer: &mut Option<&mut dyn CompactObserver>,
    key: &[u8],
    tags: &mut Vec<Vec<u8>>,
) -> Result<(), CompactError> {
    if tags.is_empty() {
        return Ok(());
    }
    if tags.len() > 1 {
        if let Some(observer) = observer.as_deref_mut() {
            let resolved = observer.resolve_duplicate_metadata(key, tags);
            out.add(key, &resolved, false)?;
            tags.clear();
            return Ok(());
        }
    }
    out.add(key, &tags[0], false)?;
    tags.clear();
    Ok(())
}

fn set_continuation(body: &mut [u8], last: bool) -> Result<(), CompactError> {
    let Some(first) = body.first_mut() else {
        return Err(corrupt("empty posting chunk body"));
    };
    *first = if last { b'1' } else { b'0' };
    Ok(())
}

/// Emit one term's accumulated chunks: the initial record with the summed
/// header, then a continuation record per further chunk.
fn emit_posting_group(
    out: &mut Table,
    key: &[u8],
    tf: u64,
    cf: u64,
    chunks: &mut Vec<(DocId, Vec<u8>)>,
) -> Result<(), CompactError> {
    let total = chunks.len();
    let Some((first_did, _)) = chunks.first() else {
        return Ok(());
    };

    let mut first_tag = Vec::new();
    pack_uint(&mut first_tag, tf);
    pack_uint(&mut first_tag, cf);
    let first_minus_one = u64::from(*first_did)
        .checked_sub(1)
        .ok_or_else(|| corrupt("document id zero in posting chunk"))?;
    pack_uint(&mut first_tag, first_minus_one);
    set_continuation(&mut chunks[0].1, total == 1)?;
    first_tag.extend_from_slice(&chunks[0].1);
    out.add(key, &first_tag, false)?;

    let term: Vec<u8> = if is_doclenchunk_key(key) {
        Vec::new()
    } else {
        let mut rest = key;
        let term = unpack_string_preserving_sort(&mut rest);
        if !rest.is_empty() {
            return Err(corrupt("bad posting chunk key"));
        }
        term
    };

    for i in 1..total {
        set_continuation(&mut chunks[i].1, i + 1 == total)?;
        let continuation_key = pack_postlist_key(&term, u64::from(chunks[i].0));
        out.add(&continuation_key, &chunks[i].1, false)?;
    }
    chunks.clear();
    Ok(())
}

/// Four-phase postlist merge: user metadata, value statistics, value
/// stream chunks, then posting chunks.
pub(crate) fn merge_postlists(
    out: &mut Table,
    inputs: Vec<MergeInput<'_>>,
    offsets: &[DocId],
    mut observer: Option<&mut dyn CompactObserver>,
) -> Result<(), CompactError> {
    let mut pq: BinaryHeap<PostEntry> = BinaryHeap::new();
    for (order, (input, &offset)) in inputs.into_iter().zip(offsets).enumerate() {
        if input.is_empty() {
            continue;
        }
        if let Some(cursor) = PostlistCursor::new(input.into_raw_source(), offset)? {
            pq.push(PostEntry(cursor, order));
        }
    }

    let mut last_key: Vec<u8> = Vec::new();

    // Phase 1: user metadata. Collect every source's tag per key; more
    // than one tag for a key is a conflict for the resolver (first source
    // wins without one).
    {
        let mut tags: Vec<Vec<u8>> = Vec::new();
        while pq.peek().is_some_and(|e| is_user_metadata_key(&e.0.key)) {
            let Some(mut entry) = pq.pop() else { break };
            if entry.0.key != last_key {
                flush_metadata(out, &mut observer, &last_key, &mut tags)?;
                last_key.clear();
                last_key.extend_from_slice(&entry.0.key);
            }
            tags.push(std::mem::take(&mut entry.0.tag));
            if entry.0.advance()? {
                pq.push(entry);
            }
        }
        flush_metadata(out, &mut observer, &last_key, &mut tags)?;
    }

    // Phase 2: value statistics, folded per slot. `freq` doubles as the
    // "accumulator holds something" flag: empty values are never counted,
    // so a real slot can't fold to zero.
    {
        let mut freq: u64 = 0;
        let mut lower: Vec<u8> = Vec::new();
        let mut upper: Vec<u8> = Vec::new();
        while pq.peek().is_some_and(|e| is_valuestats_key(&e.0.key)) {
            let Some(mut entry) = pq.pop() else { break };
            if entry.0.key != last_key {
                if freq != 0 {
                    out.add(&last_key, &encode_valuestats(freq, &lower, &upper), false)?;
                    freq = 0;
                }
                last_key.clear();
                last_key.extend_from_slice(&entry.0.key);
            }

            let stats = decode_valuestats(&entry.0.tag).map_err(|e| match e {
                UnpackError::Overflow => CompactError::Range("value statistic too large"),
                _ => corrupt("incomplete value statistics item"),
            })?;
            if stats.lower_bound.is_empty() {
                return Err(corrupt("empty bound in value statistics"));
            }
            if freq == 0 {
                freq = stats.freq;
                lower = stats.lower_bound;
                upper = stats.upper_bound;
            } else {
                freq += stats.freq;
                if stats.lower_bound < lower {
                    lower = stats.lower_bound;
                }
                if stats.upper_bound > upper {
                    upper = stats.upper_bound;
                }
            }

            if entry.0.advance()? {
                pq.push(entry);
            }
        }
        if freq != 0 {
            out.add(&last_key, &encode_valuestats(freq, &lower, &upper), false)?;
        }
    }

    // Phase 3: value stream chunks pass through; the cursor already moved
    // them into output coordinates.
    while pq.peek().is_some_and(|e| is_valuechunk_key(&e.0.key)) {
        let Some(mut entry) = pq.pop() else { break };
        out.add(&entry.0.key, &entry.0.tag, false)?;
        if entry.0.advance()? {
            pq.push(entry);
        }
    }

    // Phase 4: posting chunks. Group by (normalised) key, accumulate
    // chunks in docid order, and re-synthesise the initial record when
    // the group closes.
    let mut tf: u64 = 0;
    let mut cf: u64 = 0;
    let mut chunks: Vec<(DocId, Vec<u8>)> = Vec::new();
    loop {
        let entry = pq.pop();
        let group_ended = entry.as_ref().map_or(true, |e| e.0.key != last_key);
        if group_ended && !chunks.is_empty() {
            emit_posting_group(out, &last_key, tf, cf, &mut chunks)?;
        }
        let Some(mut entry) = entry else { break };
        if group_ended {
            tf = 0;
            cf = 0;
            last_key.clear();
            last_key.extend_from_slice(&entry.0.key);
        }
        tf += u64::from(entry.0.tf);
        cf += u64::from(entry.0.cf);
        chunks.push((entry.0.firstdid, std::mem::take(&mut entry.0.tag)));
        if entry.0.advance()? {
            pq.push(entry);
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// merge_spellings / merge_synonyms
// ------------------------------------------------------------------------------------------------

/// Merge spelling tables: word-set keys union their prefix-compressed
/// word lists, `W`-keys sum their frequencies.
pub(crate) fn merge_spellings(
    out: &mut Table,
    inputs: Vec<MergeInput<'_>>,
    codec: Option<&dyn Codec>,
) -> Result<(), CompactError> {
    let mut pq: BinaryHeap<WordSetEntry> = BinaryHeap::new();
    for (order, input) in inputs.into_iter().enumerate() {
        if input.is_empty() {
            continue;
        }
        if let Some(cursor) = MergeCursor::new(input.into_merge_source(codec))? {
            pq.push(WordSetEntry(cursor, order));
        }
    }

    while let Some(mut entry) = pq.pop() {
        let key = entry.0.key.clone();
        if !pq.peek().is_some_and(|next| next.0.key == key) {
            // Unique key: copy the tag through as stored, compressed or not.
            let compressed = entry.0.read_tag(true)?;
            out.add(&key, &entry.0.tag, compressed)?;
            if entry.0.advance()? {
                pq.push(entry);
            }
            continue;
        }

        if key.first() != Some(&b'W') {
            // Union of the word sets behind this key.
            let mut members: Vec<WordSetEntry> = Vec::new();
            let mut current = entry;
            loop {
                current.0.read_tag(false)?;
                members.push(current);
                if !pq.peek().is_some_and(|next| next.0.key == key) {
                    break;
                }
                let Some(next) = pq.pop() else { break };
                current = next;
            }

            let mut writer = PrefixCompressedWriter::new();
            {
                let mut words: BinaryHeap<SpellWord> = BinaryHeap::new();
                for member in &members {
                    let mut reader = PrefixCompressedReader::new(&member.0.tag);
                    if reader.next_word() {
                        words.push(SpellWord(reader));
                    }
                }
                let mut last_word: Option<Vec<u8>> = None;
                while let Some(mut word) = words.pop() {
                    if last_word.as_deref() != Some(word.0.current()) {
                        last_word = Some(word.0.current().to_vec());
                        writer.append(word.0.current());
                    }
                    if word.0.next_word() {
                        words.push(word);
                    }
                }
            }
            out.add(&key, &writer.into_bytes(), false)?;

            for mut member in members {
                if member.0.advance()? {
                    pq.push(member);
                }
            }
        } else {
            // Sum the word's frequency across sources.
            let mut total: u64 = 0;
            let mut current = entry;
            loop {
                current.0.read_tag(false)?;
                let freq = unpack_uint_last(&current.0.tag)
                    .map_err(|_| corrupt("bad spelling word frequency"))?;
                if freq == 0 {
                    return Err(corrupt("bad spelling word frequency"));
                }
                total = total.saturating_add(freq);
                if current.0.advance()? {
                    pq.push(current);
                }
                if !pq.peek().is_some_and(|next| next.0.key == key) {
                    break;
                }
                let Some(next) = pq.pop() else { break };
                current = next;
            }
            let mut tag = Vec::new();
            pack_uint_last(&mut tag, total);
            out.add(&key, &tag, false)?;
        }
    }
    Ok(())
}

/// Merge synonym tables: union the byte-length-prefixed word lists.
pub(crate) fn merge_synonyms(
    out: &mut Table,
    inputs: Vec<MergeInput<'_>>,
    codec: Option<&dyn Codec>,
) -> Result<(), CompactError> {
    let mut pq: BinaryHeap<WordSetEntry> = BinaryHeap::new();
    for (order, input) in inputs.into_iter().enumerate() {
        if input.is_empty() {
            continue;
        }
        if let Some(cursor) = MergeCursor::new(input.into_merge_source(codec))? {
            pq.push(WordSetEntry(cursor, order));
        }
    }

    while let Some(mut entry) = pq.pop() {
        let key = entry.0.key.clone();
        if !pq.peek().is_some_and(|next| next.0.key == key) {
            let compressed = entry.0.read_tag(true)?;
            out.add(&key, &entry.0.tag, compressed)?;
            if entry.0.advance()? {
                pq.push(entry);
            }
            continue;
        }

        let mut members: Vec<WordSetEntry> = Vec::new();
        let mut current = entry;
        loop {
            current.0.read_tag(false)?;
            members.push(current);
            if !pq.peek().is_some_and(|next| next.0.key == key) {
                break;
            }
            let Some(next) = pq.pop() else { break };
            current = next;
        }

        let mut tag = Vec::new();
        {
            let mut words: BinaryHeap<SynWord> = BinaryHeap::new();
            for member in &members {
                let mut reader = ByteLengthPrefixedReader::new(&member.0.tag);
                if reader.next_word() {
                    words.push(SynWord(reader));
                }
            }
            let mut last_word: Option<Vec<u8>> = None;
            while let Some(mut word) = words.pop() {
                if last_word.as_deref() != Some(word.0.current()) {
                    last_word = Some(word.0.current().to_vec());
                    append_synonym_word(&mut tag, word.0.current());
                }
                if word.0.next_word() {
                    words.push(word);
                }
            }
        }
        out.add(&key, &tag, false)?;

        for mut member in members {
            if member.0.advance()? {
                pq.push(member);
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// merge_positions
// ------------------------------------------------------------------------------------------------

/// Merge position tables. Tags never collide across disjoint docid
/// ranges, so records copy straight through.
pub(crate) fn merge_positions(
    out: &mut Table,
    inputs: Vec<MergeInput<'_>>,
    offsets: &[DocId],
) -> Result<(), CompactError> {
    let mut pq: BinaryHeap<PosEntry> = BinaryHeap::new();
    for (order, (input, &offset)) in inputs.into_iter().zip(offsets).enumerate() {
        if input.is_empty() {
            continue;
        }
        if let Some(cursor) = PositionCursor::new(input.into_raw_source(), offset)? {
            pq.push(PosEntry(cursor, order));
        }
    }

    while let Some(mut entry) = pq.pop() {
        out.add(&entry.0.key, &entry.0.tag, false)?;
        if entry.0.advance()? {
            pq.push(entry);
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// merge_docid_keyed
// ------------------------------------------------------------------------------------------------

/// Merge docdata/termlist tables by sequential copy: each source's docid
/// range is disjoint and ordered, so no heap is needed. The leading docid
/// is re-packed with the source's offset; any trailing key bytes are kept.
pub(crate) fn merge_docid_keyed(
    out: &mut Table,
    inputs: &[&dyn SourceTable],
    offsets: &[DocId],
) -> Result<(), CompactError> {
    for (table, &offset) in inputs.iter().zip(offsets) {
        if table.is_empty() {
            continue;
        }
        let mut cursor = table.cursor();
        while cursor.advance()? {
            if offset == 0 {
                let (tag, compressed) = cursor.raw_tag();
                out.add(cursor.key(), tag, compressed)?;
            } else {
                let mut rest = cursor.key();
                let did = unpack_uint_preserving_sort(&mut rest)
                    .map_err(|_| corrupt("bad document id key"))?;
                let mut key = Vec::with_capacity(cursor.key().len() + 1);
                pack_uint_preserving_sort(&mut key, did + u64::from(offset));
                key.extend_from_slice(rest);
                let (tag, compressed) = cursor.raw_tag();
                out.add(&key, tag, compressed)?;
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// multimerge_postlists
// ------------------------------------------------------------------------------------------------

/// Cascaded postlist merge: while fan-in exceeds 3, merge consecutive
/// pairs (a trailing group of 3 absorbs an odd leftover) into temporary
/// tables, then run the final merge into the real output.
///
/// Docid offsets are applied only on the first round; the temporaries are
/// already in output coordinates. Temporary tables are never compressed
/// and are unlinked once consumed (including on unwind, via their drop
/// handler); `temp_options` carries the caller's durability choice for
/// them, which never extends to the real output.
pub(crate) fn multimerge_postlists(
    out: &mut Table,
    tmpdir: &Path,
    mut inputs: Vec<MergeInput<'_>>,
    mut offsets: Vec<DocId>,
    temp_options: TableOptions,
    mut observer: Option<&mut dyn CompactObserver>,
) -> Result<(), CompactError> {
    let mut round = 0u32;
    while inputs.len() > 3 {
        debug!(round, fan_in = inputs.len(), "cascaded postlist merge round");
        let count = inputs.len();
        let mut next_inputs: Vec<MergeInput> = Vec::with_capacity(count / 2);
        let mut next_offsets: Vec<DocId> = Vec::with_capacity(count / 2);
        let mut drained = inputs.into_iter();

        let mut i = 0usize;
        while i < count {
            let mut j = i + 2;
            if j == count - 1 {
                j += 1;
            }
            let group: Vec<MergeInput> = drained.by_ref().take(j - i).collect();

            let path = tmpdir.join(format!("tmp{}_{}.lxt", round, i / 2));
            let mut root_info = RootInfo::default();
            root_info.init(MAX_BLOCK_SIZE as u32, 0);
            let mut tmp = Table::create(&path, &root_info, temp_options)?;
            merge_postlists(&mut tmp, group, &offsets[i..j], reborrow_observer(&mut observer))?;
            tmp.flush_db()?;
            let mut tmp_root = RootInfo::default();
            tmp.commit(1, &mut tmp_root)?;
            tmp.sync()?;

            next_inputs.push(MergeInput::Stored(tmp));
            next_offsets.push(0);
            i = j;
        }

        inputs = next_inputs;
        offsets = next_offsets;
        round += 1;
    }
    merge_postlists(out, inputs, &offsets, observer)
}
