//! LZ4 framing for stored update fragments.
//!
//! Every payload in the `updates` column family is stored as
//! `<original_len: u32 LE><lz4 block>` (the `lz4_flex` size-prepended
//! format). Fragments are opaque yrs updates; the frame only shrinks the
//! structured, zero-heavy encoding the CRDT produces.
//!
//! Reference: Patterson & Hennessy, Section 5.7 (Data Compression)

use super::rocks::StoreError;

/// Frame a fragment for storage.
pub fn encode(fragment: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(fragment)
}

/// Unframe a stored payload.
///
/// `key` is only used to report which entry is damaged.
pub fn decode(key: u64, framed: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(framed).map_err(|e| StoreError::CorruptEntry {
        key,
        reason: e.to_string(),
    })
}
