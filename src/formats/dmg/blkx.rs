//! `mish` block-map parsing: one descriptor run per contiguous extent of a
//! `blkx` partition (spec §3 "DMG", §4.3 "BLKX parse").

use crate::error::{Result, VdiskError};
use crate::extent::{Extent, ExtentKind};

const MISH_MAGIC: &[u8; 4] = b"mish";
const MISH_HEADER_LEN: usize = 204;
const RUN_LEN: usize = 40;

const BT_ZERO_FILL: u32 = 0x0000_0000;
const BT_RAW: u32 = 0x0000_0001;
const BT_IGNORE: u32 = 0x0000_0002;
const BT_COMMENT: u32 = 0x7FFF_FFFE;
const BT_TERMINATOR: u32 = 0xFFFF_FFFF;
const BT_ADC: u32 = 0x8000_0004;
const BT_ZLIB: u32 = 0x8000_0005;
const BT_BZIP2: u32 = 0x8000_0006;
const BT_LZFSE: u32 = 0x8000_0007;
const BT_LZVN: u32 = 0x8000_0008;

struct BlockRun {
    block_type: u32,
    sector_start: u64,
    sector_count: u64,
    compressed_offset: u64,
    compressed_length: u64,
}

fn parse_run(buf: &[u8]) -> BlockRun {
    let u32_at = |o: usize| u32::from_be_bytes(buf[o..o + 4].try_into().unwrap());
    let u64_at = |o: usize| u64::from_be_bytes(buf[o..o + 8].try_into().unwrap());
    BlockRun {
        block_type: u32_at(0),
        // comment at [4..8], unused
        sector_start: u64_at(8),
        sector_count: u64_at(16),
        compressed_offset: u64_at(24),
        compressed_length: u64_at(32),
    }
}

/// Parses one base64-decoded `blkx` dict's `Data` blob into extents, with
/// virtual sectors measured from `partition_first_sector` (the mish header's
/// own `first_sector` field) and file offsets measured from the DMG's data
/// fork base.
pub fn extents_from_mish(data: &[u8], data_fork_offset: u64) -> Result<Vec<Extent>> {
    if data.len() < MISH_HEADER_LEN {
        return Err(VdiskError::bad_device("mish block map shorter than its fixed header"));
    }
    if &data[0..4] != MISH_MAGIC {
        return Err(VdiskError::BadSignature {
            expected: "mish",
            found: String::from_utf8_lossy(&data[0..4]).into_owned(),
        });
    }
    let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if version != 1 {
        return Err(VdiskError::NotImplementedYet("mish block map version other than 1"));
    }
    let partition_first_sector = u64::from_be_bytes(data[8..16].try_into().unwrap());
    let run_count = u32::from_be_bytes(data[200..204].try_into().unwrap()) as usize;

    let need = MISH_HEADER_LEN + run_count * RUN_LEN;
    if data.len() < need {
        return Err(VdiskError::bad_device("mish block map shorter than its declared run count"));
    }

    let mut extents = Vec::new();
    for i in 0..run_count {
        let off = MISH_HEADER_LEN + i * RUN_LEN;
        let run = parse_run(&data[off..off + RUN_LEN]);

        if run.block_type == BT_TERMINATOR {
            break;
        }
        if run.block_type == BT_COMMENT {
            continue;
        }
        if matches!(run.block_type, BT_ADC | BT_BZIP2 | BT_LZFSE | BT_LZVN) {
            return Err(VdiskError::NotImplementedYet(
                "DMG block run compression other than raw/zlib",
            ));
        }

        let kind = match run.block_type {
            BT_RAW => ExtentKind::Raw {
                file_offset: data_fork_offset + run.compressed_offset,
            },
            BT_IGNORE | BT_ZERO_FILL => ExtentKind::Zero,
            BT_ZLIB => ExtentKind::CompressedZlib {
                file_offset: data_fork_offset + run.compressed_offset,
                file_bytes: run.compressed_length,
            },
            other => {
                return Err(VdiskError::bad_device(format!("unknown DMG block run type {other:#x}")))
            }
        };

        if run.sector_count == 0 {
            continue;
        }
        extents.push(Extent {
            first_sector: partition_first_sector + run.sector_start,
            sector_count: run.sector_count,
            kind,
        });
    }

    Ok(extents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_mish(first_sector: u64, runs: &[(u32, u64, u64, u64, u64)]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(MISH_MAGIC);
        b.extend_from_slice(&1u32.to_be_bytes());
        b.extend_from_slice(&first_sector.to_be_bytes());
        b.extend_from_slice(&0u64.to_be_bytes()); // sector_count (unused by parser)
        b.extend_from_slice(&0u64.to_be_bytes()); // data_offset (unused)
        b.extend_from_slice(&0u32.to_be_bytes()); // buffers_needed
        b.extend_from_slice(&0u32.to_be_bytes()); // block_descriptor_count
        b.extend_from_slice(&[0u8; 24]); // reserved
        b.extend_from_slice(&0u32.to_be_bytes()); // checksum_type
        b.extend_from_slice(&0u32.to_be_bytes()); // checksum_size
        b.extend_from_slice(&[0u8; 128]); // checksum
        b.extend_from_slice(&(runs.len() as u32).to_be_bytes());
        for &(bt, sector_start, sector_count, coff, clen) in runs {
            b.extend_from_slice(&bt.to_be_bytes());
            b.extend_from_slice(&0u32.to_be_bytes());
            b.extend_from_slice(&sector_start.to_be_bytes());
            b.extend_from_slice(&sector_count.to_be_bytes());
            b.extend_from_slice(&coff.to_be_bytes());
            b.extend_from_slice(&clen.to_be_bytes());
        }
        b
    }

    #[test]
    fn raw_and_ignore_runs_produce_extents() {
        let mish = build_mish(
            100,
            &[
                (BT_RAW, 0, 10, 4096, 5120),
                (BT_IGNORE, 10, 5, 0, 0),
                (BT_TERMINATOR, 0, 0, 0, 0),
            ],
        );
        let extents = extents_from_mish(&mish, 1_000_000).unwrap();
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[0].first_sector, 100);
        assert!(matches!(extents[0].kind, ExtentKind::Raw { file_offset } if file_offset == 1_000_000 + 4096));
        assert_eq!(extents[1].first_sector, 110);
        assert!(matches!(extents[1].kind, ExtentKind::Zero));
    }

    #[test]
    fn adc_compression_rejected() {
        let mish = build_mish(0, &[(BT_ADC, 0, 10, 0, 100)]);
        assert!(extents_from_mish(&mish, 0).is_err());
    }
}
