//! QCOW v1/v2/v3 header (spec §3/§4.4, §6.2).

use nom::sequence::tuple;
use nom::IResult;

use crate::error::{Result, VdiskError};

const MAGIC: u32 = 0x514649FB; // "QFI\xFB"

fn t_be_u32(input: &[u8]) -> IResult<&[u8], u32> {
    nom::number::complete::be_u32(input)
}
fn t_be_u64(input: &[u8]) -> IResult<&[u8], u64> {
    nom::number::complete::be_u64(input)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
    V3,
}

#[derive(Debug, Clone)]
pub struct QcowHeader {
    pub version: Version,
    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub cluster_bits: u32,
    pub size: u64,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
    pub crypt_method: u32,
}

impl QcowHeader {
    /// Number of L2 entries per table: fixed at v1's `l2_bits` (read from
    /// the file) or, for v2/v3, the number that fits in one cluster.
    pub fn l2_entries(&self, l1_entry_l2_bits: u32) -> u64 {
        1u64 << l1_entry_l2_bits
    }
}

pub fn parse(buf: &[u8]) -> Result<(QcowHeader, u32)> {
    let (rest, (magic, version)) = tuple((t_be_u32, t_be_u32))(buf)?;
    if magic != MAGIC {
        return Err(VdiskError::BadSignature {
            expected: "QFI\\xFB",
            found: format!("{magic:#x}"),
        });
    }

    match version {
        1 => parse_v1(rest),
        2 => parse_v2(rest, Version::V2),
        3 => parse_v2(rest, Version::V3),
        other => Err(VdiskError::NotImplementedYet(match other {
            0 => "QCOW version 0",
            _ => "QCOW version newer than 3",
        })),
    }
}

/// v1 layout: backing_file_offset(8) backing_file_size(4) mtime(4) size(8)
/// cluster_bits(1) l2_bits(1) pad(2) crypt_method(4) l1_table_offset(8).
fn parse_v1(rest: &[u8]) -> Result<(QcowHeader, u32)> {
    let (rest2, (backing_file_offset, backing_file_size, _mtime, size)) =
        tuple((t_be_u64, t_be_u32, t_be_u32, t_be_u64))(rest)?;
    let cluster_bits = rest2[0] as u32;
    let l2_bits = rest2[1] as u32;
    let (_, (crypt_method, l1_table_offset)) = tuple((t_be_u32, t_be_u64))(&rest2[4..])?;

    if cluster_bits < 9 {
        return Err(VdiskError::bad_device("QCOW v1 cluster_bits below 9"));
    }
    let cluster_size = 1u64 << cluster_bits;
    let l2_entries = 1u64 << l2_bits;
    if l2_entries.checked_mul(cluster_size).is_none() {
        return Err(VdiskError::bad_device("QCOW v1 l2_size * cluster_size overflows"));
    }
    if crypt_method != 0 {
        return Err(VdiskError::NotImplementedYet("QCOW encrypted images"));
    }

    Ok((
        QcowHeader {
            version: Version::V1,
            backing_file_offset,
            backing_file_size,
            cluster_bits,
            size,
            l1_size: 0, // v1 has no explicit L1 size; computed by the caller from `size`
            l1_table_offset,
            refcount_table_offset: 0,
            refcount_table_clusters: 0,
            nb_snapshots: 0,
            snapshots_offset: 0,
            crypt_method,
        },
        l2_bits,
    ))
}

/// v2/v3 layout: cluster_bits(4) size(8) crypt_method(4) l1_size(4)
/// l1_table_offset(8) refcount_table_offset(8) refcount_table_clusters(4)
/// nb_snapshots(4) snapshots_offset(8) [v3: incompatible_features(8)
/// compatible_features(8) autoclear_features(8) refcount_order(4)
/// header_length(4)].
fn parse_v2(rest: &[u8], version: Version) -> Result<(QcowHeader, u32)> {
    let (rest2, (cluster_bits, size, crypt_method, l1_size, l1_table_offset, refcount_table_offset, refcount_table_clusters, nb_snapshots, snapshots_offset)) =
        tuple((t_be_u32, t_be_u64, t_be_u32, t_be_u32, t_be_u64, t_be_u64, t_be_u32, t_be_u32, t_be_u64))(rest)?;

    if cluster_bits < 9 {
        return Err(VdiskError::bad_device("QCOW v2/v3 cluster_bits below 9"));
    }

    if version == Version::V3 {
        let (_, (incompatible_features, _compatible, _autoclear, _refcount_order, _header_length)) =
            tuple((t_be_u64, t_be_u64, t_be_u64, t_be_u32, t_be_u32))(rest2)?;
        const SUPPORTED_INCOMPATIBLE: u64 = 0;
        if incompatible_features & !SUPPORTED_INCOMPATIBLE != 0 {
            return Err(VdiskError::NotImplementedYet(
                "QCOW v3 incompatible feature bit set",
            ));
        }
    }

    if nb_snapshots != 0 {
        return Err(VdiskError::NotImplementedYet("QCOW snapshots"));
    }
    if crypt_method != 0 {
        return Err(VdiskError::NotImplementedYet("QCOW encrypted images"));
    }

    let l2_bits = cluster_bits - 3; // v2/v3: l2 entries are 8 bytes each, one cluster per table
    Ok((
        QcowHeader {
            version,
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits,
            size,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            nb_snapshots,
            snapshots_offset,
            crypt_method,
        },
        l2_bits,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_header(cluster_bits: u32, size: u64, l1_size: u32, l1_offset: u64) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&MAGIC.to_be_bytes());
        b.extend_from_slice(&2u32.to_be_bytes());
        b.extend_from_slice(&cluster_bits.to_be_bytes());
        b.extend_from_slice(&size.to_be_bytes());
        b.extend_from_slice(&0u32.to_be_bytes()); // crypt_method
        b.extend_from_slice(&l1_size.to_be_bytes());
        b.extend_from_slice(&l1_offset.to_be_bytes());
        b.extend_from_slice(&0u64.to_be_bytes()); // refcount_table_offset
        b.extend_from_slice(&0u32.to_be_bytes()); // refcount_table_clusters
        b.extend_from_slice(&0u32.to_be_bytes()); // nb_snapshots
        b.extend_from_slice(&0u64.to_be_bytes()); // snapshots_offset
        b
    }

    #[test]
    fn parses_v2_header_fields() {
        let bytes = v2_header(16, 4 * 1024 * 1024, 1, 4096);
        let (header, l2_bits) = parse(&bytes).unwrap();
        assert_eq!(header.version, Version::V2);
        assert_eq!(header.cluster_bits, 16);
        assert_eq!(header.size, 4 * 1024 * 1024);
        assert_eq!(header.l1_table_offset, 4096);
        assert_eq!(l2_bits, 13); // cluster_bits - 3
    }

    #[test]
    fn rejects_nonzero_crypt_method() {
        let mut bytes = v2_header(16, 1024, 1, 4096);
        bytes[16..20].copy_from_slice(&1u32.to_be_bytes());
        assert!(parse(&bytes).is_err());
    }
}
