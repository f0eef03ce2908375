//! Block Allocation Table: one 64-bit entry per payload block (and,
//! interleaved, one per sector-bitmap block) — spec §3/§4.7 step 6.

use std::io::{Read, Seek, SeekFrom};

use crate::error::Result;

/// The 3-bit state packed into a BAT entry's low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    NotPresent,
    Undefined,
    Zero,
    Unmapped,
    FullyPresent,
    PartiallyPresent,
    Reserved(u8),
}

impl From<u8> for BlockState {
    fn from(v: u8) -> Self {
        match v {
            0 => BlockState::NotPresent,
            1 => BlockState::Undefined,
            2 => BlockState::Zero,
            3 => BlockState::Unmapped,
            6 => BlockState::FullyPresent,
            7 => BlockState::PartiallyPresent,
            other => BlockState::Reserved(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatEntry {
    pub state: BlockState,
    /// File offset in bytes of the payload block (already multiplied out of
    /// the on-disk "offset in MiB" encoding), meaningful only when
    /// `state == FullyPresent`.
    pub file_offset: u64,
}

impl BatEntry {
    pub fn from_raw(raw: u64) -> Self {
        let state = BlockState::from((raw & 0x7) as u8);
        let file_offset = (raw >> 20) * (1024 * 1024);
        BatEntry { state, file_offset }
    }
}

/// `chunk_ratio = (2^23 * logical_sector_size) / block_size`: the number of
/// payload-block BAT entries between consecutive sector-bitmap BAT entries.
pub fn chunk_ratio(logical_sector_size: u32, block_size: u32) -> u64 {
    ((1u64 << 23) * logical_sector_size as u64) / block_size as u64
}

/// Total BAT entry count including interleaved sector-bitmap entries.
pub fn bat_entry_count(data_blocks: u64, chunk_ratio: u64) -> u64 {
    data_blocks + (data_blocks.saturating_sub(1)) / chunk_ratio
}

/// Maps a logical block index to its BAT slot, skipping over the
/// interleaved sector-bitmap entries.
pub fn bat_index_for_block(block_idx: u64, chunk_ratio: u64) -> u64 {
    block_idx + block_idx / chunk_ratio
}

pub fn read_bat<T: Read + Seek>(
    reader: &mut T,
    bat_offset: u64,
    entry_count: u64,
) -> Result<Vec<BatEntry>> {
    reader.seek(SeekFrom::Start(bat_offset))?;
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        entries.push(BatEntry::from_raw(u64::from_le_bytes(buf)));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fully_present_offset_in_mib() {
        // state=6 (fully present), offset = 3 MiB
        let raw = (3u64 << 20) | 6;
        let entry = BatEntry::from_raw(raw);
        assert_eq!(entry.state, BlockState::FullyPresent);
        assert_eq!(entry.file_offset, 3 * 1024 * 1024);
    }

    #[test]
    fn decodes_not_present() {
        let entry = BatEntry::from_raw(0);
        assert_eq!(entry.state, BlockState::NotPresent);
    }

    #[test]
    fn chunk_ratio_matches_formula() {
        // logical_sector_size=512, block_size=32MiB -> ratio = (2^23*512)/ (32*1024*1024)
        let ratio = chunk_ratio(512, 32 * 1024 * 1024);
        assert_eq!(ratio, (8388608u64 * 512) / (32 * 1024 * 1024));
    }

    #[test]
    fn bat_index_accounts_for_bitmap_interleave() {
        let ratio = 4;
        assert_eq!(bat_index_for_block(0, ratio), 0);
        assert_eq!(bat_index_for_block(3, ratio), 3);
        assert_eq!(bat_index_for_block(4, ratio), 5); // one bitmap entry inserted before block 4
    }
}
