//! Variable-length integer coding for keys and block payloads
//!
//! Integers are encoded with the UTF-8 shape applied to the value: one byte
//! `0xxxxxxx` up to six bytes `1111110x 10xxxxxx ...`. Encodings are
//! self-delimiting, never contain the byte 0xFE, and equal-length encodings
//! preserve byte-lexicographic order. A *range* is a packed index optionally
//! followed by `0xFE` and a packed size; a missing delimiter means size 0.

use crate::error::{Result, StorageError};
use crate::types::{GlobalCounter, Index};

/// In-record delimiter. Never a byte of a packed integer.
pub const RANGE_DELIM: u8 = 0xFE;

/// Probe stride for upper-bound scans over plain packed indices.
const PROBE_STRIDE_INDEX: usize = 20;
/// Probe stride for scans over packed ranges.
const PROBE_STRIDE_RANGE: usize = 40;
/// Probe stride for scans over 0xFE-delimited variable-size records.
const PROBE_STRIDE_STRUCT: usize = 60;

/// Number of bytes of the encoding starting with lead byte `b`.
/// Returns 7 or 8 for malformed lead bytes; callers reject those.
#[inline]
fn charlen(b: u8) -> usize {
    if b < 0x80 {
        1
    } else {
        (b.leading_ones() as usize).max(2).min(8)
    }
}

#[inline]
fn is_follow_byte(b: u8) -> bool {
    b & 0xC0 == 0x80
}

/// Append the encoding of `idx` to `buf`.
pub fn pack_index(buf: &mut Vec<u8>, idx: Index) {
    if idx < 0x80 {
        buf.push(idx as u8);
        return;
    }
    // pp = number of follow bytes
    let mut pp = 1usize;
    let mut sf = 5u32;
    while pp < 5 {
        if (idx as u64) < (64u64 << sf) {
            break;
        }
        pp += 1;
        sf += 5;
    }
    let hb = (0xFFu16 << (7 - pp)) as u8;
    let mut shf = (pp * 6) as u32;
    buf.push((((idx >> shf) as u8) & (!hb >> 1)) | hb);
    for _ in 0..pp {
        shf -= 6;
        buf.push((((idx >> shf) as u8) & 0x3F) | 0x80);
    }
}

/// Encoding of `idx` as a fresh byte vector.
pub fn packed_index(idx: Index) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    pack_index(&mut buf, idx);
    buf
}

/// Decode one packed index at the start of `buf`. Returns the value and the
/// number of bytes consumed.
pub fn unpack_index(buf: &[u8]) -> Result<(Index, usize)> {
    if buf.is_empty() {
        return Err(StorageError::CorruptData("packed index truncated".into()));
    }
    let len = charlen(buf[0]);
    if len > 6 {
        return Err(StorageError::CorruptData(
            "packed index with illegal lead byte".into(),
        ));
    }
    if buf.len() < len {
        return Err(StorageError::CorruptData("packed index truncated".into()));
    }
    if len == 1 {
        return Ok((buf[0] as Index, 1));
    }
    let mut val = (buf[0] & (0x1F >> (len - 2))) as u64;
    for &b in &buf[1..len] {
        if !is_follow_byte(b) {
            return Err(StorageError::CorruptData(
                "packed index with invalid follow byte".into(),
            ));
        }
        val = (val << 6) | (b & 0x3F) as u64;
    }
    if val > i32::MAX as u64 {
        return Err(StorageError::CorruptData(
            "packed index out of range".into(),
        ));
    }
    Ok((val as Index, len))
}

/// Number of bytes of the packed index at the start of `buf`.
pub fn skip_index(buf: &[u8]) -> Result<usize> {
    if buf.is_empty() {
        return Err(StorageError::CorruptData("packed index truncated".into()));
    }
    let len = charlen(buf[0]);
    if len > 6 || buf.len() < len {
        return Err(StorageError::CorruptData("packed index truncated".into()));
    }
    Ok(len)
}

/// Append `(idx, rangesize)`; a zero `rangesize` is encoded by omission.
pub fn pack_range(buf: &mut Vec<u8>, idx: Index, rangesize: Index) {
    pack_index(buf, idx);
    if rangesize != 0 {
        buf.push(RANGE_DELIM);
        pack_index(buf, rangesize);
    }
}

/// Decode a packed range. Returns `(idx, rangesize, consumed)`.
pub fn unpack_range(buf: &[u8]) -> Result<(Index, Index, usize)> {
    let (idx, mut at) = unpack_index(buf)?;
    let mut size = 0;
    if at < buf.len() && buf[at] == RANGE_DELIM {
        at += 1;
        let (sz, n) = unpack_index(&buf[at..])?;
        size = sz;
        at += n;
    }
    Ok((idx, size, at))
}

/// Number of bytes of the packed range at the start of `buf`.
pub fn skip_range(buf: &[u8]) -> Result<usize> {
    let mut at = skip_index(buf)?;
    if at < buf.len() && buf[at] == RANGE_DELIM {
        at += 1;
        at += skip_index(&buf[at..])?;
    }
    Ok(at)
}

/// Position of the next encoding boundary at or after `at` (skips follow bytes).
pub fn next_packed_pos(buf: &[u8], mut at: usize) -> usize {
    while at < buf.len() && is_follow_byte(buf[at]) {
        at += 1;
    }
    at
}

/// Boundary of the next range element at or after `at`.
pub fn next_packed_range_pos(buf: &[u8], at: usize) -> usize {
    let mut at = next_packed_pos(buf, at);
    if at < buf.len() && buf[at] == RANGE_DELIM {
        at = next_packed_pos(buf, at + 1);
    }
    at
}

/// Start of the encoding containing or preceding position `at`.
pub fn prev_packed_pos(buf: &[u8], mut at: usize) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    if at >= buf.len() {
        at = buf.len() - 1;
    }
    while at > 0 && is_follow_byte(buf[at]) {
        at -= 1;
    }
    if at == 0 && !buf.is_empty() && is_follow_byte(buf[0]) {
        return Err(StorageError::CorruptData(
            "no encoding start before buffer begin".into(),
        ));
    }
    Ok(at)
}

/// Count of packed indices in `buf`.
pub fn nof_packed_indices(buf: &[u8]) -> usize {
    let mut n = 0;
    let mut at = 0;
    while at < buf.len() {
        at += charlen(buf[at]);
        n += 1;
    }
    n
}

#[derive(Clone, Copy)]
enum ScanOrder {
    Asc,
    Desc,
}

#[inline]
fn element_before_needle(buf: &[u8], at: usize, needle: &[u8], order: ScanOrder) -> bool {
    let end = (at + needle.len()).min(buf.len());
    let probe = &buf[at..end];
    match order {
        // continue while element < needle
        ScanOrder::Asc => probe < needle,
        // continue while element > needle
        ScanOrder::Desc => probe > needle,
    }
}

fn find_upper_bound(
    buf: &[u8],
    needle: Index,
    order: ScanOrder,
    stride: usize,
    advance: fn(&[u8], usize) -> usize,
    resync: fn(&[u8], usize) -> usize,
) -> Option<usize> {
    let needle = packed_index(needle);
    let mut at = 0usize;
    loop {
        if at >= buf.len() {
            return None;
        }
        if !element_before_needle(buf, at, &needle, order) {
            return Some(at);
        }
        at = advance(buf, at);
        // probe forward in strides while the probed element is still before
        // the needle, then fall back to the element-wise scan
        while at < buf.len() && buf.len() - at > stride * 2 {
            let np = resync(buf, at + stride);
            if np < buf.len() && element_before_needle(buf, np, &needle, order) {
                at = np;
            } else {
                break;
            }
        }
    }
}

fn advance_index(buf: &[u8], at: usize) -> usize {
    at + charlen(buf[at])
}

fn advance_range(buf: &[u8], at: usize) -> usize {
    let mut at = at + charlen(buf[at]);
    if at < buf.len() && buf[at] == RANGE_DELIM {
        at += 1;
        if at < buf.len() {
            at += charlen(buf[at]);
        }
    }
    at
}

fn advance_struct(buf: &[u8], at: usize) -> usize {
    match buf[at..].iter().position(|&b| b == RANGE_DELIM) {
        Some(p) => at + p + 1,
        None => buf.len(),
    }
}

fn resync_index(buf: &[u8], at: usize) -> usize {
    next_packed_pos(buf, at)
}

fn resync_range(buf: &[u8], at: usize) -> usize {
    next_packed_range_pos(buf, at)
}

/// Byte offset of the first packed index `>= needle` in an ascending sequence.
pub fn find_index_upper_bound_asc(buf: &[u8], needle: Index) -> Option<usize> {
    find_upper_bound(
        buf,
        needle,
        ScanOrder::Asc,
        PROBE_STRIDE_INDEX,
        advance_index,
        resync_index,
    )
}

/// Byte offset of the first packed index `<= needle` in a descending sequence.
pub fn find_index_upper_bound_desc(buf: &[u8], needle: Index) -> Option<usize> {
    find_upper_bound(
        buf,
        needle,
        ScanOrder::Desc,
        PROBE_STRIDE_INDEX,
        advance_index,
        resync_index,
    )
}

/// Upper-bound scan over 0xFE-delimited records whose first field is a packed
/// index in descending order; mismatching records are skipped whole.
pub fn find_struct_upper_bound_desc(buf: &[u8], needle: Index) -> Option<usize> {
    find_upper_bound(
        buf,
        needle,
        ScanOrder::Desc,
        PROBE_STRIDE_STRUCT,
        advance_struct,
        advance_struct,
    )
}

/// Upper-bound scan over packed ranges ordered ascending by their index.
pub fn find_range_upper_bound_asc(buf: &[u8], needle: Index) -> Option<usize> {
    find_upper_bound(
        buf,
        needle,
        ScanOrder::Asc,
        PROBE_STRIDE_RANGE,
        advance_range,
        resync_range,
    )
}

/// Split a counter into two 31-bit limbs and pack them hi first.
pub fn pack_global_counter(buf: &mut Vec<u8>, cnt: GlobalCounter) -> Result<()> {
    if cnt >> 62 != 0 {
        return Err(StorageError::InvalidArgument(
            "global counter out of range".into(),
        ));
    }
    pack_index(buf, (cnt >> 31) as Index);
    pack_index(buf, (cnt & 0x7FFF_FFFF) as Index);
    Ok(())
}

pub fn unpack_global_counter(buf: &[u8]) -> Result<(GlobalCounter, usize)> {
    let (hi, n1) = unpack_index(buf)?;
    let (lo, n2) = unpack_index(&buf[n1..])?;
    Ok((((hi as GlobalCounter) << 31) | lo as GlobalCounter, n1 + n2))
}

/// Verify that `buf` is well-formed UTF-8 by the same length rule the codec
/// uses. User-supplied strings pass through this check at the API boundary.
pub fn check_string_utf8(buf: &[u8]) -> bool {
    let mut at = 0;
    while at < buf.len() {
        let len = charlen(buf[at]);
        if len > 6 || at + len > buf.len() {
            return false;
        }
        if buf[at + 1..at + len].iter().any(|&b| !is_follow_byte(b)) {
            return false;
        }
        at += len;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_small() {
        for n in 0..4096u32 {
            let b = packed_index(n);
            let (v, used) = unpack_index(&b).unwrap();
            assert_eq!(v, n);
            assert_eq!(used, b.len());
            assert_eq!(skip_index(&b).unwrap(), b.len());
        }
    }

    #[test]
    fn round_trip_boundaries() {
        for n in [
            0u32,
            0x7F,
            0x80,
            0x7FF,
            0x800,
            0xFFFF,
            0x10000,
            0x1F_FFFF,
            0x20_0000,
            0x3FF_FFFF,
            0x400_0000,
            i32::MAX as u32,
        ] {
            let b = packed_index(n);
            assert_eq!(unpack_index(&b).unwrap(), (n, b.len()));
        }
    }

    #[test]
    fn no_delim_byte_in_encodings() {
        for n in [0u32, 127, 128, 100_000, i32::MAX as u32] {
            assert!(!packed_index(n).contains(&RANGE_DELIM));
        }
    }

    #[test]
    fn order_preserved_on_equal_length() {
        let mut prev = packed_index(128);
        for n in 129..2048u32 {
            let cur = packed_index(n);
            if cur.len() == prev.len() {
                assert!(prev < cur, "order broken at {}", n);
            }
            prev = cur;
        }
    }

    #[test]
    fn range_round_trip() {
        for (n, s) in [(1u32, 0u32), (1, 1), (1000, 17), (70000, 0), (70000, 70000)] {
            let mut b = Vec::new();
            pack_range(&mut b, n, s);
            let (idx, size, used) = unpack_range(&b).unwrap();
            assert_eq!((idx, size, used), (n, s, b.len()));
            assert_eq!(skip_range(&b).unwrap(), b.len());
        }
    }

    #[test]
    fn rejects_truncated() {
        let b = packed_index(100_000);
        assert!(unpack_index(&b[..b.len() - 1]).is_err());
        assert!(unpack_index(&[]).is_err());
    }

    #[test]
    fn rejects_bad_follow_byte() {
        assert!(unpack_index(&[0xC2, 0x00]).is_err());
    }

    #[test]
    fn rejects_overlong_lead() {
        assert!(unpack_index(&[0xFE, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80]).is_err());
        assert!(unpack_index(&[0xFF, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80]).is_err());
    }

    #[test]
    fn upper_bound_asc_finds_first_ge() {
        let mut buf = Vec::new();
        for n in (10..1000u32).step_by(7) {
            pack_index(&mut buf, n);
        }
        for needle in [10u32, 11, 500, 997] {
            let at = find_index_upper_bound_asc(&buf, needle).unwrap();
            let (v, _) = unpack_index(&buf[at..]).unwrap();
            assert!(v >= needle);
            // the element before (if any) must be below the needle
            let mut prev = None;
            let mut scan = 0;
            while scan < at {
                let (pv, n) = unpack_index(&buf[scan..]).unwrap();
                prev = Some(pv);
                scan += n;
            }
            if let Some(pv) = prev {
                assert!(pv < needle);
            }
        }
        assert!(find_index_upper_bound_asc(&buf, 100_000).is_none());
    }

    #[test]
    fn upper_bound_desc_finds_first_le() {
        let mut buf = Vec::new();
        for n in (0..500u32).rev().step_by(3) {
            pack_index(&mut buf, n);
        }
        for needle in [498u32, 497, 250, 1] {
            let at = find_index_upper_bound_desc(&buf, needle).unwrap();
            let (v, _) = unpack_index(&buf[at..]).unwrap();
            assert!(v <= needle, "found {} for needle {}", v, needle);
        }
    }

    #[test]
    fn range_upper_bound_skips_whole_ranges() {
        let mut buf = Vec::new();
        pack_range(&mut buf, 10, 5);
        pack_range(&mut buf, 30, 0);
        pack_range(&mut buf, 200, 1000);
        let at = find_range_upper_bound_asc(&buf, 20).unwrap();
        let (idx, size, _) = unpack_range(&buf[at..]).unwrap();
        assert_eq!((idx, size), (30, 0));
        let at = find_range_upper_bound_asc(&buf, 200).unwrap();
        let (idx, size, _) = unpack_range(&buf[at..]).unwrap();
        assert_eq!((idx, size), (200, 1000));
        assert!(find_range_upper_bound_asc(&buf, 201).is_none());
    }

    #[test]
    fn boundary_walk() {
        let mut buf = Vec::new();
        for n in [5u32, 500, 50_000] {
            pack_index(&mut buf, n);
        }
        assert_eq!(nof_packed_indices(&buf), 3);
        // walk backwards from the end over encoding boundaries
        let last = prev_packed_pos(&buf, buf.len()).unwrap();
        let (v, _) = unpack_index(&buf[last..]).unwrap();
        assert_eq!(v, 50_000);
        let mid = prev_packed_pos(&buf, last - 1).unwrap();
        let (v, _) = unpack_index(&buf[mid..]).unwrap();
        assert_eq!(v, 500);
        // forward resync from inside an encoding
        assert_eq!(next_packed_pos(&buf, mid + 1), last);
    }

    #[test]
    fn counter_round_trip() {
        let mut buf = Vec::new();
        pack_global_counter(&mut buf, (1 << 40) + 12345).unwrap();
        let (v, used) = unpack_global_counter(&buf).unwrap();
        assert_eq!(v, (1 << 40) + 12345);
        assert_eq!(used, buf.len());
        let mut overflow = Vec::new();
        assert!(pack_global_counter(&mut overflow, 1 << 62).is_err());
    }

    #[test]
    fn utf8_check() {
        assert!(check_string_utf8("hello wörld".as_bytes()));
        assert!(!check_string_utf8(&[0x80]));
        assert!(!check_string_utf8(&[0xC2]));
    }
}
