//! VirtualBox VDI backend: pre-header + v0/v1/v1-plus header, block pointer
//! map, fixed/sparse reads (spec §3/§4.5).

use std::io::{Read, Seek, SeekFrom};

use nom::number::complete::{le_u16, le_u32, le_u64};
use nom::sequence::tuple;
use nom::IResult;
use tracing::instrument;
use uuid::Uuid;

use crate::error::{Result, VdiskError};
use crate::parse_utils::{is_pow2, t_guid};

const SIGNATURE: u32 = 0xBEDA_107F;
const BLOCK_FREE: u32 = 0xFFFF_FFFF;
const BLOCK_ZERO: u32 = 0xFFFF_FFFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    Fixed,
    Normal,
    Diff,
    Undo,
}

impl DiskKind {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(DiskKind::Normal),
            2 => Ok(DiskKind::Fixed),
            3 => Ok(DiskKind::Undo),
            4 => Ok(DiskKind::Diff),
            _ => Err(VdiskError::bad_device(format!("unknown VDI image type {v}"))),
        }
    }
}

/// Which on-disk header shape was read, per spec §1B's supplemented legacy
/// variant plus the current v1/v1-plus layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderVariant {
    /// `cbHeader == 148`: the shrunken pre-1.1 layout with no separate
    /// `LegacyGeometry`/`u32Type` split — blocks array follows immediately.
    Legacy,
    V1,
    V1Plus,
}

#[derive(Debug, Clone)]
struct Header {
    variant: HeaderVariant,
    kind: DiskKind,
    offset_blocks: u64,
    offset_data: u64,
    cylinders: u32,
    disk_size: u64,
    block_size: u32,
    block_extra: u32,
    block_count: u32,
    blocks_allocated: u32,
    creation_uuid: Uuid,
    modify_uuid: Uuid,
}

fn t_le_u16(input: &[u8]) -> IResult<&[u8], u16> {
    le_u16(input)
}
fn t_le_u32(input: &[u8]) -> IResult<&[u8], u32> {
    le_u32(input)
}
fn t_le_u64(input: &[u8]) -> IResult<&[u8], u64> {
    le_u64(input)
}

/// Parses the pre-header (signature + version) and the version-dependent
/// header that follows it, from a buffer that starts at file offset 0.
fn parse_header(buf: &[u8]) -> Result<Header> {
    let (rest, (signature, version_major, version_minor)) =
        tuple((t_le_u32, t_le_u16, t_le_u16))(&buf[64..72])?;
    if signature != SIGNATURE {
        return Err(VdiskError::BadSignature {
            expected: "0xBEDA107F",
            found: format!("{signature:#x}"),
        });
    }
    let _ = rest;

    // cbHeader sits right after the textual comment + pre-header, at a
    // fixed offset from the start of the (also fixed-offset) header proper.
    let header_start = 72usize;
    let (_, cb_header) = t_le_u32(&buf[header_start..header_start + 4])?;

    let variant = match (version_major, cb_header) {
        (0, _) => HeaderVariant::Legacy,
        (_, 148) => HeaderVariant::Legacy,
        (_, 400) => HeaderVariant::V1Plus,
        (_, _) => HeaderVariant::V1,
    };

    // Common fields across variants, laid out identically from
    // `u32Type` onward; only the legacy variant omits the LCHS block at the
    // tail, which this parser never reads, so one field layout suffices.
    let f = header_start + 4; // skip cbHeader
    let (_, (kind_raw, flags, _comment, offset_blocks, offset_data, cylinders, heads, sectors, sector_size, _unused, disk_size, block_size, block_extra, block_count, blocks_allocated, _uuid_link, creation_uuid, modify_uuid)) =
        tuple((
            t_le_u32, // u32Type
            t_le_u32, // fFlags
            nom::bytes::complete::take(256usize), // szComment
            t_le_u32, // offBlocks
            t_le_u32, // offData
            t_le_u32, // Legacy/VDIDISKGEOMETRY cCylinders
            t_le_u32, // cHeads
            t_le_u32, // cSectors
            t_le_u32, // cbSector
            t_le_u32, // u32Dummy
            t_le_u64, // cbDisk
            t_le_u32, // cbBlock
            t_le_u32, // cbBlockExtra
            t_le_u32, // cBlocks
            t_le_u32, // cBlocksAllocated
            t_guid,   // uuidCreate (image uuid, unused)
            t_guid,   // uuidModify (creation uuid slot, kept for field-order fidelity)
            t_guid,   // uuidLinkage
        ))(&buf[f..])?;
    let _ = (heads, sectors, sector_size);

    let mut disk_size = disk_size;
    if disk_size % 512 != 0 {
        tracing::warn!(
            cb_disk = disk_size,
            "VDI cbDisk not a multiple of 512, truncating (legacy-tool quirk)"
        );
        disk_size &= !0x1FF;
    }

    let _ = flags;
    Ok(Header {
        variant,
        kind: DiskKind::from_u32(kind_raw)?,
        offset_blocks: offset_blocks as u64,
        offset_data: offset_data as u64,
        cylinders,
        disk_size,
        block_size,
        block_extra,
        block_count,
        blocks_allocated,
        creation_uuid,
        modify_uuid,
    })
}

#[derive(Debug)]
pub struct VdiImage<R> {
    reader: R,
    size_bytes: u64,
    block_size: u32,
    block_extra: u32,
    total_block_bytes: u64,
    offset_data: u64,
    blocks: Vec<u32>,
}

pub fn probe<R: Read + Seek>(reader: &mut R) -> std::io::Result<bool> {
    let pos = reader.stream_position()?;
    if reader.seek(SeekFrom::End(0))? < 72 {
        reader.seek(SeekFrom::Start(pos))?;
        return Ok(false);
    }
    reader.seek(SeekFrom::Start(64))?;
    let mut buf = [0u8; 4];
    let ok = reader.read_exact(&mut buf).is_ok() && u32::from_le_bytes(buf) == SIGNATURE;
    reader.seek(SeekFrom::Start(pos))?;
    Ok(ok)
}

struct OpenFields {
    size_bytes: u64,
    block_size: u32,
    block_extra: u32,
    total_block_bytes: u64,
    offset_data: u64,
    blocks: Vec<u32>,
}

impl<R: Read + Seek> VdiImage<R> {
    /// Opens `reader` as a VDI image, handing it back alongside the error
    /// if the body turns out malformed (spec §6.1).
    #[instrument(skip(reader))]
    pub fn open(mut reader: R) -> std::result::Result<Self, (R, VdiskError)> {
        match Self::parse(&mut reader) {
            Ok(f) => Ok(VdiImage {
                reader,
                size_bytes: f.size_bytes,
                block_size: f.block_size,
                block_extra: f.block_extra,
                total_block_bytes: f.total_block_bytes,
                offset_data: f.offset_data,
                blocks: f.blocks,
            }),
            Err(e) => Err((reader, e)),
        }
    }

    fn parse(reader: &mut R) -> Result<OpenFields> {
        reader.rewind()?;
        // pre-header(72) + cbHeader(4) + type+flags(8) + comment(256) +
        // 11 remaining u32 fields + disk_size(8) + 3 GUIDs(48).
        let mut buf = vec![0u8; 72 + 4 + 8 + 256 + 4 * 11 + 8 + 48];
        reader.read_exact(&mut buf)?;
        let header = parse_header(&buf)?;

        if !is_pow2(header.block_size as u64) {
            return Err(VdiskError::bad_device("VDI block size not a power of two"));
        }
        if header.block_extra != 0 && !is_pow2(header.block_extra as u64) {
            return Err(VdiskError::bad_device(
                "VDI extra-block size neither zero nor a power of two",
            ));
        }
        if (header.block_count as u64) * (header.block_size as u64) < header.disk_size {
            return Err(VdiskError::bad_device(
                "VDI block_count * block_size smaller than disk_size",
            ));
        }
        if header.blocks_allocated > header.block_count {
            return Err(VdiskError::bad_device(
                "VDI blocks_allocated exceeds block_count",
            ));
        }
        if header.creation_uuid.is_nil() || header.modify_uuid.is_nil() {
            return Err(VdiskError::bad_device("VDI creation/modify UUID is nil"));
        }
        let _ = header.cylinders;

        tracing::debug!(variant = ?header.variant, kind = ?header.kind, "vdi header parsed");

        let blocks_offset = if header.variant == HeaderVariant::Legacy {
            buf.len() as u64
        } else {
            header.offset_blocks
        };
        reader.seek(SeekFrom::Start(blocks_offset))?;
        let mut blocks = Vec::with_capacity(header.block_count as usize);
        for _ in 0..header.block_count {
            let mut b = [0u8; 4];
            reader.read_exact(&mut b)?;
            blocks.push(u32::from_le_bytes(b));
        }

        let offset_data = if header.variant == HeaderVariant::Legacy {
            blocks_offset + 4 * header.block_count as u64
        } else {
            header.offset_data
        };

        Ok(OpenFields {
            size_bytes: header.disk_size,
            block_size: header.block_size,
            block_extra: header.block_extra,
            total_block_bytes: header.block_size as u64 + header.block_extra as u64,
            offset_data,
            blocks,
        })
    }

    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size_bytes {
            return Err(VdiskError::OutOfRange);
        }
        let want = (buf.len() as u64).min(self.size_bytes - offset) as usize;
        if want == 0 {
            return Ok(0);
        }

        let block_idx = (offset / self.block_size as u64) as usize;
        let intra = (offset % self.block_size as u64) as usize;
        let len = want.min(self.block_size as usize - intra);

        let ptr = *self
            .blocks
            .get(block_idx)
            .ok_or_else(|| VdiskError::bad_argument("VDI block index out of range"))?;

        if ptr == BLOCK_FREE {
            return Err(VdiskError::bad_device("read from a FREE VDI block"));
        }
        if ptr == BLOCK_ZERO {
            buf[..len].fill(0);
            return Ok(len);
        }

        let file_off = self.offset_data
            + self.block_extra as u64
            + ptr as u64 * self.total_block_bytes
            + intra as u64;

        let file_len = self.reader.seek(SeekFrom::End(0))?;
        if file_off + len as u64 > file_len {
            buf[..len].fill(0);
            return Err(VdiskError::OutOfRange);
        }

        self.reader.seek(SeekFrom::Start(file_off))?;
        self.reader.read_exact(&mut buf[..len])?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_header(block_size: u32, block_count: u32, disk_size: u64, legacy: bool) -> Vec<u8> {
        let mut f = vec![0u8; 64];
        f.extend_from_slice(&SIGNATURE.to_le_bytes());
        f.extend_from_slice(&(if legacy { 0u16 } else { 1u16 }).to_le_bytes());
        f.extend_from_slice(&0u16.to_le_bytes());

        let cb_header: u32 = if legacy { 148 } else { 400 };
        f.extend_from_slice(&cb_header.to_le_bytes());

        f.extend_from_slice(&1u32.to_le_bytes()); // u32Type = NORMAL
        f.extend_from_slice(&0u32.to_le_bytes()); // fFlags
        f.extend_from_slice(&[0u8; 256]); // szComment
        let header_len_so_far = f.len() as u32;
        // Remaining fixed fields after offBlocks/offData themselves:
        // cylinders, heads, sectors, sector_size, dummy (5 * u32) + disk_size
        // (u64) + block_size/block_extra/block_count/blocks_allocated
        // (4 * u32) + 3 GUIDs, plus offBlocks/offData (2 * u32) themselves.
        let blocks_off_placeholder = header_len_so_far + 4 * 7 + 8 + 4 * 4 + 48;
        f.extend_from_slice(&blocks_off_placeholder.to_le_bytes()); // offBlocks
        let data_off_placeholder = blocks_off_placeholder + 4 * block_count;
        f.extend_from_slice(&data_off_placeholder.to_le_bytes()); // offData
        f.extend_from_slice(&0u32.to_le_bytes()); // cCylinders
        f.extend_from_slice(&0u32.to_le_bytes()); // cHeads
        f.extend_from_slice(&0u32.to_le_bytes()); // cSectors
        f.extend_from_slice(&512u32.to_le_bytes()); // cbSector
        f.extend_from_slice(&0u32.to_le_bytes()); // u32Dummy
        f.extend_from_slice(&disk_size.to_le_bytes()); // cbDisk
        f.extend_from_slice(&block_size.to_le_bytes()); // cbBlock
        f.extend_from_slice(&0u32.to_le_bytes()); // cbBlockExtra
        f.extend_from_slice(&block_count.to_le_bytes()); // cBlocks
        f.extend_from_slice(&block_count.to_le_bytes()); // cBlocksAllocated
        let uuid_bytes = Uuid::from_u128(0xdead_beef).to_bytes_le();
        f.extend_from_slice(&uuid_bytes); // uuidCreate
        f.extend_from_slice(&uuid_bytes); // uuidModify
        f.extend_from_slice(&uuid_bytes); // uuidLinkage
        f
    }

    #[test]
    fn zero_block_reads_as_zero() {
        let block_size = 1024 * 1024u32;
        let disk_size = 2 * block_size as u64;
        let mut f = build_header(block_size, 2, disk_size, false);

        // blocks array: block 0 -> 0 (allocated), block 1 -> ZERO
        f.extend_from_slice(&0u32.to_le_bytes());
        f.extend_from_slice(&BLOCK_ZERO.to_le_bytes());

        // payload for block 0
        f.resize(f.len() + block_size as usize, 0xCC);

        let mut img = VdiImage::open(Cursor::new(f)).map_err(|(_, e)| e).unwrap();
        assert_eq!(img.size(), disk_size);

        let mut buf = [0u8; 4];
        let n = img.read(0, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0xCC; 4]);

        let mut buf2 = [0u8; 1];
        let n2 = img.read(block_size as u64 + 42, &mut buf2).unwrap();
        assert_eq!(n2, 1);
        assert_eq!(buf2, [0]);
    }

    #[test]
    fn read_past_truncated_tail_reports_out_of_range() {
        let block_size = 1024u32;
        let disk_size = 2 * block_size as u64;
        let mut f = build_header(block_size, 2, disk_size, false);

        // block 0 points past where the (short) file actually ends.
        f.extend_from_slice(&0u32.to_le_bytes());
        f.extend_from_slice(&1u32.to_le_bytes());
        // No payload bytes appended: offset_data + block_size exceeds EOF.

        let mut img = VdiImage::open(Cursor::new(f)).map_err(|(_, e)| e).unwrap();
        let mut buf = vec![0u8; block_size as usize];
        let err = img.read(0, &mut buf).unwrap_err();
        assert!(matches!(err, VdiskError::OutOfRange));
    }
}
