//! Deterministic byte encodings for index keys and tags.
//!
//! Everything the compactor writes is built from a handful of hand-rolled,
//! byte-stable primitives. Owning these encodings keeps the on-disk format
//! independent of any serialization library.
//!
//! # Wire formats
//!
//! | Primitive | Encoding |
//! |-----------|----------|
//! | `pack_uint` | 7-bit groups, least significant first; high bit set on every byte but the last |
//! | `pack_uint_last` | bytes least-significant first, no length, no trailing zeros; runs to the end of the buffer |
//! | `pack_uint_preserving_sort` | length byte (1..=8) then the significant bytes big-endian |
//! | `pack_string` | `pack_uint(len)` then the raw bytes |
//! | `pack_string_preserving_sort` | each 0x00 escaped as `00 FF`; `00` terminator unless the string ends the key |
//!
//! The sort-preserving forms have the property that the lexicographic
//! order of the encodings equals the natural order of the values, which is
//! what lets composite keys like `(term, first_did)` be compared as plain
//! byte strings.
//!
//! # Key namespaces
//!
//! Within the postlist table, key namespaces are distinguished by a
//! leading byte pattern:
//!
//! | Leading bytes | Namespace |
//! |---------------|-----------|
//! | `00 C0` | user metadata |
//! | `00 D0` | value statistics (by slot) |
//! | `00 D8` | value stream chunk |
//! | `00 E0` | document-length chunk |
//! | anything else | posting-list chunk |
//!
//! All decoders are zero-panic: malformed input surfaces as
//! [`UnpackError`], never as a slice-index panic.


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while decoding a packed value.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnpackError {
    /// The buffer ended before the value was complete.
    #[error("unexpected end of encoded data")]
    Truncated,

    /// The encoded value does not fit in 64 bits.
    #[error("encoded value out of range")]
    Overflow,

    /// The encoding itself is malformed (e.g. an impossible width byte).
    #[error("malformed encoding")]
    Malformed,
}

// ------------------------------------------------------------------------------------------------
// Variable-length unsigned integers
// ------------------------------------------------------------------------------------------------

/// Append `value` as a variable-length integer.
pub fn pack_uint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a variable-length integer, advancing `input` past it.
pub fn unpack_uint(input: &mut &[u8]) -> Result<u64, UnpackError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input.split_first().ok_or(UnpackError::Truncated)?;
        *input = rest;
        if shift >= 64 || (shift == 63 && byte & 0x7F > 1) {
            return Err(UnpackError::Overflow);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Append `value` using every remaining byte of the tag: least significant
/// byte first, with no length prefix and no trailing zero bytes.
///
/// Zero encodes as the empty string, which is why decoded frequencies of
/// zero are treated as corruption by callers.
pub fn pack_uint_last(out: &mut Vec<u8>, mut value: u64) {
    while value != 0 {
        out.push(value as u8);
        value >>= 8;
    }
}

/// Decode a `pack_uint_last` value occupying the whole of `input`.
pub fn unpack_uint_last(input: &[u8]) -> Result<u64, UnpackError> {
    if input.len() > 8 {
        return Err(UnpackError::Overflow);
    }
    let mut value = 0u64;
    for &byte in input.iter().rev() {
        value = (value << 8) | u64::from(byte);
    }
    Ok(value)
}

/// Append `value` in a form whose byte-wise order matches numeric order:
/// a width byte (1..=8) followed by the significant bytes, big-endian.
pub fn pack_uint_preserving_sort(out: &mut Vec<u8>, value: u64) {
    let width = (((64 - value.leading_zeros() as usize) + 7) / 8).max(1);
    out.push(width as u8);
    out.extend_from_slice(&value.to_be_bytes()[8 - width..]);
}

/// Decode a sort-preserving integer, advancing `input` past it.
pub fn unpack_uint_preserving_sort(input: &mut &[u8]) -> Result<u64, UnpackError> {
    let (&width, rest) = input.split_first().ok_or(UnpackError::Truncated)?;
    let width = width as usize;
    if width == 0 || width > 8 {
        return Err(UnpackError::Malformed);
    }
    if rest.len() < width {
        return Err(UnpackError::Truncated);
    }
    let mut value = 0u64;
    for &byte in &rest[..width] {
        value = (value << 8) | u64::from(byte);
    }
    *input = &rest[width..];
    Ok(value)
}

// ------------------------------------------------------------------------------------------------
// Strings
// ------------------------------------------------------------------------------------------------

/// Append `s` with a `pack_uint` length prefix.
pub fn pack_string(out: &mut Vec<u8>, s: &[u8]) {
    pack_uint(out, s.len() as u64);
    out.extend_from_slice(s);
}

/// Decode a length-prefixed string, advancing `input` past it.
pub fn unpack_string(input: &mut &[u8]) -> Result<Vec<u8>, UnpackError> {
    let len = unpack_uint(input)?;
    if (input.len() as u64) < len {
        return Err(UnpackError::Truncated);
    }
    let len = len as usize;
    let (s, rest) = input.split_at(len);
    *input = rest;
    Ok(s.to_vec())
}

/// Append `s` so that encoded keys compare in string order: every 0x00
/// byte is escaped as `00 FF`, and a `00` terminator follows unless `s` is
/// the final component of the key.
pub fn pack_string_preserving_sort(out: &mut Vec<u8>, s: &[u8], last: bool) {
    for &byte in s {
        out.push(byte);
        if byte == 0 {
            out.push(0xFF);
        }
    }
    if !last {
        out.push(0);
    }
}

/// Decode a sort-preserving string, advancing `input` past it.
///
/// End-of-input acts as an implicit terminator, matching the "final
/// component" form of [`pack_string_preserving_sort`].
pub fn unpack_string_preserving_sort(input: &mut &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = *input;
    loop {
        match rest.split_first() {
            None => break,
            Some((&0, tail)) => match tail.split_first() {
                Some((&0xFF, tail2)) => {
                    out.push(0);
                    rest = tail2;
                }
                _ => {
                    rest = tail;
                    break;
                }
            },
            Some((&byte, tail)) => {
                out.push(byte);
                rest = tail;
            }
        }
    }
    *input = rest;
    out
}

// ------------------------------------------------------------------------------------------------
// Key classifiers
// ------------------------------------------------------------------------------------------------

/// Leading bytes of every document-length chunk key.
pub const DOCLEN_CHUNK_PREFIX: [u8; 2] = [0x00, 0xE0];

/// Leading bytes of every value-stream chunk key.
pub const VALUE_CHUNK_PREFIX: [u8; 2] = [0x00, 0xD8];

/// True for user-metadata keys (`00 C0 ...`).
#[inline]
pub fn is_user_metadata_key(key: &[u8]) -> bool {
    key.len() > 1 && key[0] == 0x00 && key[1] == 0xC0
}

/// True for value-statistics keys (`00 D0 ...`).
#[inline]
pub fn is_valuestats_key(key: &[u8]) -> bool {
    key.len() > 1 && key[0] == 0x00 && key[1] == 0xD0
}

/// True for value-stream chunk keys (`00 D8 ...`).
#[inline]
pub fn is_valuechunk_key(key: &[u8]) -> bool {
    key.len() > 1 && key[0] == 0x00 && key[1] == 0xD8
}

/// True for document-length chunk keys (`00 E0 ...`).
#[inline]
pub fn is_doclenchunk_key(key: &[u8]) -> bool {
    key.len() > 1 && key[0] == 0x00 && key[1] == 0xE0
}

// ------------------------------------------------------------------------------------------------
// Composite keys
// ------------------------------------------------------------------------------------------------

/// Build the key of a non-initial posting chunk: the term followed by the
/// chunk's first document id. An empty term names the document-length
/// table, which uses a fixed two-byte prefix instead of a packed term.
pub fn pack_postlist_key(term: &[u8], first_did: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(term.len() + 4);
    if term.is_empty() {
        key.extend_from_slice(&DOCLEN_CHUNK_PREFIX);
    } else {
        pack_string_preserving_sort(&mut key, term, false);
    }
    pack_uint_preserving_sort(&mut key, first_did);
    key
}

// ------------------------------------------------------------------------------------------------
// Value statistics
// ------------------------------------------------------------------------------------------------

/// Decoded value-statistics tag for one value slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueStats {
    /// Number of documents with a value in this slot.
    pub freq: u64,
    /// Smallest stored value, byte-wise.
    pub lower_bound: Vec<u8>,
    /// Largest stored value, byte-wise.
    pub upper_bound: Vec<u8>,
}

/// Encode a value-statistics tag.
///
/// Empty values are never stored or counted, so neither bound can be
/// empty; when the bounds are equal the upper bound is omitted entirely.
pub fn encode_valuestats(freq: u64, lower_bound: &[u8], upper_bound: &[u8]) -> Vec<u8> {
    let mut tag = Vec::new();
    pack_uint(&mut tag, freq);
    pack_string(&mut tag, lower_bound);
    if lower_bound != upper_bound {
        tag.extend_from_slice(upper_bound);
    }
    tag
}

/// Decode a value-statistics tag.
pub fn decode_valuestats(tag: &[u8]) -> Result<ValueStats, UnpackError> {
    let mut rest = tag;
    let freq = unpack_uint(&mut rest)?;
    let lower_bound = unpack_string(&mut rest)?;
    let upper_bound = if rest.is_empty() {
        lower_bound.clone()
    } else {
        rest.to_vec()
    };
    Ok(ValueStats {
        freq,
        lower_bound,
        upper_bound,
    })
}
