//! UDIF resource file trailer ("koly"), the 512 bytes at the end of a DMG
//! (spec §4.3).

use crate::error::{Result, VdiskError};

const MAGIC: &[u8; 4] = b"koly";
pub const FOOTER_SIZE: u64 = 512;
const KNOWN_FLAGS: u32 = 0b101; // bit0 (flattened) | bit2 (internet-enabled)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Device,
    Partition,
}

#[derive(Debug, Clone)]
pub struct Footer {
    pub version: u32,
    pub segment_count: u32,
    pub data_fork_offset: u64,
    pub data_fork_length: u64,
    pub rsrc_fork_offset: u64,
    pub rsrc_fork_length: u64,
    pub plist_offset: u64,
    pub plist_length: u64,
    pub image_type: ImageType,
    pub sector_count: u64,
}

/// `footer_offset` is the file size minus 512: the trailer is always the
/// final 512 bytes, and every region it declares must fit before it.
pub fn parse(buf: &[u8; 512], footer_offset: u64) -> Result<Footer> {
    if &buf[0..4] != MAGIC {
        return Err(VdiskError::BadSignature {
            expected: "koly",
            found: String::from_utf8_lossy(&buf[0..4]).into_owned(),
        });
    }
    let u32_at = |o: usize| u32::from_be_bytes(buf[o..o + 4].try_into().unwrap());
    let u64_at = |o: usize| u64::from_be_bytes(buf[o..o + 8].try_into().unwrap());

    let version = u32_at(4);
    let header_size = u32_at(8);
    let flags = u32_at(12);
    let data_fork_offset = u64_at(24);
    let data_fork_length = u64_at(32);
    let rsrc_fork_offset = u64_at(40);
    let rsrc_fork_length = u64_at(48);
    let segment_count = u32_at(60);
    let plist_offset = u64_at(216);
    let plist_length = u64_at(224);
    let image_type_raw = u32_at(488);
    let sector_count = u64_at(492);

    if version != 4 {
        return Err(VdiskError::NotImplementedYet("UDIF footer version other than 4"));
    }
    if header_size as u64 != FOOTER_SIZE {
        return Err(VdiskError::bad_device("UDIF footer header_size is not 512"));
    }
    if flags & !KNOWN_FLAGS != 0 {
        return Err(VdiskError::NotImplementedYet("UDIF footer flag bit outside the known mask"));
    }
    if segment_count > 1 {
        return Err(VdiskError::NotImplementedYet("segmented/split DMG images"));
    }
    let image_type = match image_type_raw {
        1 => ImageType::Device,
        2 => ImageType::Partition,
        other => {
            return Err(VdiskError::bad_device(format!(
                "UDIF footer image type {other} is neither device(1) nor partition(2)"
            )))
        }
    };
    if sector_count == 0 {
        return Err(VdiskError::bad_device("UDIF footer sector_count is zero"));
    }
    if !(128..10 * 1024 * 1024).contains(&plist_length) {
        return Err(VdiskError::bad_device("UDIF XML plist size outside [128, 10 MiB)"));
    }

    let fits = |off: u64, len: u64| off.checked_add(len).map(|end| end <= footer_offset).unwrap_or(false);
    if data_fork_length != 0 && !fits(data_fork_offset, data_fork_length) {
        return Err(VdiskError::bad_device("UDIF data fork region exceeds the footer offset"));
    }
    if rsrc_fork_length != 0 && !fits(rsrc_fork_offset, rsrc_fork_length) {
        return Err(VdiskError::bad_device("UDIF resource fork region exceeds the footer offset"));
    }
    if !fits(plist_offset, plist_length) {
        return Err(VdiskError::bad_device("UDIF XML plist region exceeds the footer offset"));
    }

    Ok(Footer {
        version,
        segment_count,
        data_fork_offset,
        data_fork_length,
        rsrc_fork_offset,
        rsrc_fork_length,
        plist_offset,
        plist_length,
        image_type,
        sector_count,
    })
}
