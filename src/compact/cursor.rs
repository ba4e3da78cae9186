//! Cursor adapters feeding the merge engines.
//!
//! Every merge family drives a uniform cursor over two flavours of input:
//! a **live** source table (reached through the [`SourceCursor`] contract)
//! or a **stored** table written by an earlier cascade round. The flavour
//! is a private enum inside each cursor, so the heaps in the merge code
//! see one concrete type per family.
//!
//! Postlist and position cursors normalise records at advance time:
//! document ids are shifted by the source's offset, value-chunk and
//! position keys are rebuilt in output coordinates, and posting chunks are
//! all put into the non-initial form (the initial-chunk header is pulled
//! off the tag and re-synthesised once per output term group). This makes
//! the k-way merge homogeneous.

use crate::pack::{
    is_doclenchunk_key, is_user_metadata_key, is_valuechunk_key, is_valuestats_key, pack_uint,
    pack_string_preserving_sort, pack_uint_preserving_sort, unpack_string_preserving_sort,
    unpack_uint, unpack_uint_preserving_sort, VALUE_CHUNK_PREFIX,
};
use crate::source::{Codec, DocId, SourceCursor, TermCount};
use crate::sstable::Table;

use super::{corrupt, CompactError};

// ------------------------------------------------------------------------------------------------
// Shared input flavours
// ------------------------------------------------------------------------------------------------

/// A record stream whose tags are always fully materialised.
///
/// Stored tables written by the compactor are never compressed, so a
/// compressed flag coming back from one is corruption.
pub(crate) enum RawSource<'a> {
    Live(Box<dyn SourceCursor + 'a>),
    Stored(Table),
}

impl RawSource<'_> {
    fn next_materialised(
        &mut self,
        key: &mut Vec<u8>,
        tag: &mut Vec<u8>,
    ) -> Result<bool, CompactError> {
        match self {
            RawSource::Live(cursor) => {
                if !cursor.advance()? {
                    return Ok(false);
                }
                key.clear();
                key.extend_from_slice(cursor.key());
                tag.clear();
                tag.extend_from_slice(cursor.tag()?);
                Ok(true)
            }
            RawSource::Stored(table) => match table.read_item()? {
                None => Ok(false),
                Some(item) => {
                    if item.compressed {
                        return Err(corrupt("compressed entry in an intermediate table"));
                    }
                    *key = item.key;
                    *tag = item.value;
                    Ok(true)
                }
            },
        }
    }
}

fn to_docid(value: u64) -> Result<DocId, CompactError> {
    DocId::try_from(value).map_err(|_| corrupt("document id out of range"))
}

fn to_termcount(value: u64) -> Result<TermCount, CompactError> {
    TermCount::try_from(value).map_err(|_| corrupt("frequency out of range"))
}

// ------------------------------------------------------------------------------------------------
// PostlistCursor
// ------------------------------------------------------------------------------------------------

/// Cursor over one source's postlist table, normalised for merging.
///
/// After each successful [`advance`](PostlistCursor::advance):
/// - metadata and valuestats records pass through untouched;
/// - value-chunk keys are rebuilt with the shifted document id;
/// - posting and doclen chunks carry `key` in term-only form, the chunk
///   body in `tag`, and `firstdid`/`tf`/`cf` as fields (`tf`/`cf` are
///   non-zero only for what was an initial chunk).
pub(crate) struct PostlistCursor<'a> {
    src: RawSource<'a>,
    offset: DocId,
    pub key: Vec<u8>,
    pub tag: Vec<u8>,
    pub firstdid: DocId,
    pub tf: TermCount,
    pub cf: TermCount,
}

impl<'a> PostlistCursor<'a> {
    /// Position on the first record; `None` when the input is empty.
    pub fn new(src: RawSource<'a>, offset: DocId) -> Result<Option<Self>, CompactError> {
        let mut cursor = Self {
            src,
            offset,
            key: Vec::new(),
            tag: Vec::new(),
            firstdid: 0,
            tf: 0,
            cf: 0,
        };
        Ok(if cursor.advance()? { Some(cursor) } else { None })
    }

    pub fn advance(&mut self) -> Result<bool, CompactError> {
        if !self.src.next_materialised(&mut self.key, &mut self.tag)? {
            return Ok(false);
        }
        self.normalise()?;
        Ok(true)
    }

    fn normalise(&mut self) -> Result<(), CompactError> {
        self.tf = 0;
        self.cf = 0;
        self.firstdid = 0;
        if is_user_metadata_key(&self.key) || is_valuestats_key(&self.key) {
            return Ok(());
        }

        if is_valuechunk_key(&self.key) {
            let mut rest = &self.key[2..];
            let slot = unpack_uint(&mut rest).map_err(|_| corrupt("bad value chunk key"))?;
            let did = unpack_uint_preserving_sort(&mut rest)
                .map_err(|_| corrupt("bad value chunk key"))?;
            let shifted = did + u64::from(self.offset);
            to_docid(shifted)?;

            let mut key = Vec::with_capacity(self.key.len());
            key.extend_from_slice(&VALUE_CHUNK_PREFIX);
            pack_uint(&mut key, slot);
            pack_uint_preserving_sort(&mut key, shifted);
            self.key = key;
            return Ok(());
        }

        // Posting or document-length chunk. Work out where the docid
        // suffix (if any) starts.
        let doclen = is_doclenchunk_key(&self.key);
        let suffix_len = {
            let mut rest: &[u8] = if doclen { &self.key[2..] } else { &self.key };
            if !doclen {
                let _term = unpack_string_preserving_sort(&mut rest);
            }
            rest.len()
        };

        if suffix_len == 0 {
            // Initial chunk: move (tf, cf, firstdid - 1) off the tag head.
            let mut rest: &[u8] = &self.tag;
            let tf = unpack_uint(&mut rest).map_err(|_| corrupt("bad postlist chunk header"))?;
            let cf = unpack_uint(&mut rest).map_err(|_| corrupt("bad postlist chunk header"))?;
            let first =
                unpack_uint(&mut rest).map_err(|_| corrupt("bad postlist chunk header"))?;
            let consumed = self.tag.len() - rest.len();
            self.tag.drain(..consumed);
            self.tf = to_termcount(tf)?;
            self.cf = to_termcount(cf)?;
            self.firstdid = to_docid(first + 1 + u64::from(self.offset))?;
        } else {
            // Continuation chunk: strip the docid (and the term
            // terminator for non-doclen keys) so the key is term-only.
            let suffix_start = self.key.len() - suffix_len;
            let mut rest = &self.key[suffix_start..];
            let did = unpack_uint_preserving_sort(&mut rest)
                .map_err(|_| corrupt("bad postlist key"))?;
            if !rest.is_empty() {
                return Err(corrupt("bad postlist key"));
            }
            self.key
                .truncate(if doclen { suffix_start } else { suffix_start - 1 });
            self.firstdid = to_docid(did + u64::from(self.offset))?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// PositionCursor
// ------------------------------------------------------------------------------------------------

/// Cursor over one source's position table.
///
/// Keys are rebuilt as `(term, did + offset)`; tags pass through verbatim
/// since disjoint docid ranges can never collide.
pub(crate) struct PositionCursor<'a> {
    src: RawSource<'a>,
    offset: DocId,
    pub key: Vec<u8>,
    pub tag: Vec<u8>,
}

impl<'a> PositionCursor<'a> {
    pub fn new(src: RawSource<'a>, offset: DocId) -> Result<Option<Self>, CompactError> {
        let mut cursor = Self {
            src,
            offset,
            key: Vec::new(),
            tag: Vec::new(),
        };
        Ok(if cursor.advance()? { Some(cursor) } else { None })
    }

    pub fn advance(&mut self) -> Result<bool, CompactError> {
        if !self.src.next_materialised(&mut self.key, &mut self.tag)? {
            return Ok(false);
        }

        let mut rest: &[u8] = &self.key;
        let term = unpack_string_preserving_sort(&mut rest);
        let did =
            unpack_uint_preserving_sort(&mut rest).map_err(|_| corrupt("bad position key"))?;
        if !rest.is_empty() {
            return Err(corrupt("bad position key"));
        }
        let shifted = did + u64::from(self.offset);
        to_docid(shifted)?;

        let mut key = Vec::with_capacity(self.key.len());
        pack_string_preserving_sort(&mut key, &term, false);
        pack_uint_preserving_sort(&mut key, shifted);
        self.key = key;
        Ok(true)
    }
}

// ------------------------------------------------------------------------------------------------
// MergeCursor (spelling / synonym)
// ------------------------------------------------------------------------------------------------

pub(crate) enum MergeSource<'a> {
    Live(Box<dyn SourceCursor + 'a>),
    Stored {
        table: Table,
        codec: Option<&'a dyn Codec>,
    },
}

/// Cursor for the generic word-set merges.
///
/// Tags stay exactly as stored until [`read_tag`](MergeCursor::read_tag)
/// is asked to materialise them; the fast path of the word-set merges
/// copies compressed tags through without ever inflating them.
pub(crate) struct MergeCursor<'a> {
    src: MergeSource<'a>,
    pub key: Vec<u8>,
    pub tag: Vec<u8>,
    pub compressed: bool,
}

impl<'a> MergeCursor<'a> {
    pub fn new(src: MergeSource<'a>) -> Result<Option<Self>, CompactError> {
        let mut cursor = Self {
            src,
            key: Vec::new(),
            tag: Vec::new(),
            compressed: false,
        };
        Ok(if cursor.advance()? { Some(cursor) } else { None })
    }

    pub fn advance(&mut self) -> Result<bool, CompactError> {
        match &mut self.src {
            MergeSource::Live(cursor) => {
                if !cursor.advance()? {
                    return Ok(false);
                }
                self.key.clear();
                self.key.extend_from_slice(cursor.key());
                let (tag, compressed) = cursor.raw_tag();
                self.tag.clear();
                self.tag.extend_from_slice(tag);
                self.compressed = compressed;
                Ok(true)
            }
            MergeSource::Stored { table, .. } => match table.read_item()? {
                None => Ok(false),
                Some(item) => {
                    self.key = item.key;
                    self.tag = item.value;
                    self.compressed = item.compressed;
                    Ok(true)
                }
            },
        }
    }

    /// Materialise the tag in place unless `keep_compressed`. Returns the
    /// tag's compression state afterwards.
    pub fn read_tag(&mut self, keep_compressed: bool) -> Result<bool, CompactError> {
        if keep_compressed || !self.compressed {
            return Ok(self.compressed);
        }
        match &mut self.src {
            MergeSource::Live(cursor) => {
                let tag = cursor.tag()?;
                self.tag.clear();
                self.tag.extend_from_slice(tag);
            }
            MergeSource::Stored {
                codec: Some(codec), ..
            } => {
                self.tag = codec.decompress(&self.tag)?;
            }
            MergeSource::Stored { codec: None, .. } => {
                return Err(corrupt("compressed tag but no codec configured"));
            }
        }
        self.compressed = false;
        Ok(false)
    }
}
