//! Shared byte-level helpers: endian byte-swaps, Microsoft-style mixed-endian
//! GUID parsing, and small `nom` combinators reused by more than one backend.
//!
//! Each backend's own module additionally pulls `nom::number::complete::{be_*,
//! le_*}` directly for its plain integer fields; this module only holds the
//! handful of parsers that are either reused across backends (GUIDs) or need
//! semantics `nom`'s built-ins don't give you (null-padded UTF-16 strings,
//! bool-from-u32).

use nom::number::complete::{le_u16, le_u32};
use nom::sequence::tuple;
use nom::IResult;
use uuid::Uuid;

/// Swap a `u16` between big- and little-endian representations.
#[inline]
pub fn swap_u16(v: u16) -> u16 {
    v.swap_bytes()
}

/// Swap a `u32` between big- and little-endian representations.
#[inline]
pub fn swap_u32(v: u32) -> u32 {
    v.swap_bytes()
}

/// Swap a `u64` between big- and little-endian representations.
#[inline]
pub fn swap_u64(v: u64) -> u64 {
    v.swap_bytes()
}

/// Parses a Microsoft-style "mixed-endian" GUID: the first three fields are
/// stored little-endian on disk, the last two (clock-seq + node) are stored
/// in RFC 4122 big-endian wire order untouched. This is the layout used by
/// VHDX region/metadata UUIDs and VDI/VHD creation UUIDs alike.
pub fn t_guid(input: &[u8]) -> IResult<&[u8], Uuid> {
    let (rest, (d1, d2, d3, d4)) =
        tuple((le_u32, le_u16, le_u16, nom::bytes::complete::take(8usize)))(input)?;
    let mut d4_arr = [0u8; 8];
    d4_arr.copy_from_slice(d4);
    Ok((rest, Uuid::from_fields(d1, d2, d3, &d4_arr)))
}

/// Parses a 4-byte boolean stored as a full little-endian `u32` (any nonzero
/// value is `true`), the representation VHDX uses for `Required` flags.
pub fn t_bool_u32(input: &[u8]) -> IResult<&[u8], bool> {
    let (rest, v) = le_u32(input)?;
    Ok((rest, v != 0))
}

/// Decodes a null-terminated (or fully null-padded) UTF-16LE string out of a
/// fixed-size buffer, the representation VHDX's `FileTypeIdentifier.Creator`
/// and VDI's header comment fields use. Unpaired surrogates are replaced per
/// `char::decode_utf16`'s standard replacement-character behavior.
pub fn utf16le_padded(buf: &[u8]) -> String {
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Rounds `value` up to the next multiple of `align` (`align` must be a power of two).
#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// `true` if `value` is a power of two (the shared validity check used by
/// VDI's block-size and QCOW's cluster-size invariants).
#[inline]
pub fn is_pow2(value: u64) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_roundtrip_matches_microsoft_mixed_endian() {
        let bytes = [
            0xcc, 0xe0, 0x65, 0xb3, 0xaa, 0xf1, 0xd8, 0x4b, 0x9c, 0x8d, 0x16, 0x09, 0xd9, 0x38,
            0xb5, 0xec,
        ];
        let (_, uuid) = t_guid(&bytes).unwrap();
        assert_eq!(uuid.to_string(), "b365e0cc-f1aa-4bd8-9c8d-1609d938b5ec");
    }

    #[test]
    fn utf16_stops_at_first_null() {
        let mut buf = Vec::new();
        for c in "hi".encode_utf16() {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        buf.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(utf16le_padded(&buf), "hi");
    }

    #[test]
    fn pow2_check() {
        assert!(is_pow2(512));
        assert!(is_pow2(1));
        assert!(!is_pow2(0));
        assert!(!is_pow2(3));
    }

    #[test]
    fn align_up_rounds_correctly() {
        assert_eq!(align_up(0, 512), 0);
        assert_eq!(align_up(1, 512), 512);
        assert_eq!(align_up(512, 512), 512);
        assert_eq!(align_up(513, 512), 1024);
    }
}
