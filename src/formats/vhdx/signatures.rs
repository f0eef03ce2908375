//! The small set of 4/8-byte ASCII magic values that appear throughout a
//! VHDX file, and the `nom` parsers that recognize them.

use nom::number::complete::{le_u32, le_u64};
use nom::IResult;

pub const FTI_SIGN: u64 = 0x656C_6966_7864_6876; // "vhdxfile" read little-endian as u64
pub const HEAD_SIGN: u32 = 0x6461_6568; // "head"
pub const RGT_SIGN: u32 = 0x6967_6572; // "regi"
pub const LOGE_SIGN: u32 = 0x6567_6F6C; // "loge"
pub const ZERO_SIGN: u32 = 0x6F72_657A; // "zero"
pub const DESC_SIGN: u32 = 0x6373_6564; // "desc"
pub const DATA_SIGN: u32 = 0x6174_6164; // "data"
pub const METADATA_SIGN: u64 = 0x6164_6174_6174_656D; // "metadata" little-endian as u64

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum Signature {
    Vhdxfile,
    Head,
    Regi,
    Loge,
    Zero,
    Data,
    Desc,
    MetaData,
    Unknown(u64),
}

impl From<u32> for Signature {
    fn from(v: u32) -> Self {
        match v {
            HEAD_SIGN => Signature::Head,
            RGT_SIGN => Signature::Regi,
            LOGE_SIGN => Signature::Loge,
            ZERO_SIGN => Signature::Zero,
            DATA_SIGN => Signature::Data,
            DESC_SIGN => Signature::Desc,
            other => Signature::Unknown(other as u64),
        }
    }
}

impl From<u64> for Signature {
    fn from(v: u64) -> Self {
        match v {
            FTI_SIGN => Signature::Vhdxfile,
            METADATA_SIGN => Signature::MetaData,
            other => Signature::Unknown(other),
        }
    }
}

/// Parses a 4-byte signature into the [`Signature`] enum (`head`, `regi`,
/// `loge`, `zero`, `desc`, `data`).
pub fn t_sign_u32(input: &[u8]) -> IResult<&[u8], Signature> {
    let (rest, v) = le_u32(input)?;
    Ok((rest, Signature::from(v)))
}

/// Parses an 8-byte signature into the [`Signature`] enum (`vhdxfile`,
/// `metadata`).
pub fn t_sign_u64(input: &[u8]) -> IResult<&[u8], Signature> {
    let (rest, v) = le_u64(input)?;
    Ok((rest, Signature::from(v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fti_magic_matches_ascii_vhdxfile() {
        let bytes = b"vhdxfile";
        let v = u64::from_le_bytes(*bytes);
        assert_eq!(Signature::from(v), Signature::Vhdxfile);
    }

    #[test]
    fn head_magic_matches_ascii_head() {
        let bytes = b"head";
        let v = u32::from_le_bytes(*bytes);
        assert_eq!(Signature::from(v), Signature::Head);
    }

    #[test]
    fn metadata_magic_matches_ascii_metadata() {
        let bytes = b"metadata";
        let v = u64::from_le_bytes(*bytes);
        assert_eq!(Signature::from(v), Signature::MetaData);
    }
}
