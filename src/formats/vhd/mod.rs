//! Microsoft VHD backend: primary/backup footer, dynamic-disk header, BAT
//! and per-block sector bitmap (spec §3/§4.6).

use std::io::{Read, Seek, SeekFrom};

use nom::sequence::tuple;
use nom::IResult;
use tracing::instrument;

use crate::error::{Result, VdiskError};
use crate::parse_utils::align_up;

const FOOTER_SIZE: u64 = 512;
const COOKIE: &[u8; 8] = b"conectix";
const SPARSE_COOKIE: &[u8; 8] = b"cxsparse";

fn t_be_u32(input: &[u8]) -> IResult<&[u8], u32> {
    nom::number::complete::be_u32(input)
}

fn t_be_u64(input: &[u8]) -> IResult<&[u8], u64> {
    nom::number::complete::be_u64(input)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            other => Err(VdiskError::NotImplementedYet(match other {
                0 | 1 => "VHD disk type none/reserved",
                _ => "VHD unknown disk type",
            })),
        }
    }
}

#[derive(Debug, Clone)]
struct Footer {
    disk_type: DiskType,
    current_size: u64,
    data_offset: u64,
}

fn parse_footer(buf: &[u8]) -> Result<Footer> {
    if &buf[0..8] != COOKIE {
        return Err(VdiskError::BadSignature {
            expected: "conectix",
            found: String::from_utf8_lossy(&buf[0..8]).into_owned(),
        });
    }
    let (_, data_offset) = t_be_u64(&buf[0x10..0x18])?;
    let (_, current_size) = t_be_u64(&buf[0x30..0x38])?;
    let (_, disk_type_raw) = t_be_u32(&buf[0x3C..0x40])?;
    Ok(Footer {
        disk_type: DiskType::from_u32(disk_type_raw)?,
        current_size,
        data_offset,
    })
}

#[derive(Debug, Clone)]
struct DynamicHeader {
    block_size: u32,
    bat_offset: u64,
    max_table_entries: u32,
}

fn parse_dynamic_header(buf: &[u8]) -> Result<DynamicHeader> {
    if &buf[0..8] != SPARSE_COOKIE {
        return Err(VdiskError::BadSignature {
            expected: "cxsparse",
            found: String::from_utf8_lossy(&buf[0..8]).into_owned(),
        });
    }
    let (_, (table_offset, _reserved, max_table_entries, block_size)) =
        tuple((t_be_u64, t_be_u32, t_be_u32, t_be_u32))(&buf[0x10..0x24])?;
    const MAX_ENTRIES: u32 = ((2u64 * 1024 * 1024 * 1024 * 1024) / 512 - 2) as u32;
    if max_table_entries > MAX_ENTRIES {
        return Err(VdiskError::bad_device("VHD BAT entry count exceeds 2 TB limit"));
    }
    Ok(DynamicHeader {
        block_size,
        bat_offset: table_offset,
        max_table_entries,
    })
}

/// What a single `read()` call should do for the sectors it resolved to.
enum BlockPlan {
    /// `sectors` consecutive clean sectors: the caller zero-fills that whole
    /// run (no parent chain to fall back to — spec §9 open question).
    Hole { sectors: u32 },
    Run { file_offset: u64, sectors: u32 },
}

#[derive(Debug)]
pub struct VhdImage<R> {
    reader: R,
    disk_type: DiskType,
    size_bytes: u64,
    block_size: u32,
    block_sectors: u32,
    bitmap_sectors: u32,
    bat: Vec<u32>,
}

pub fn probe<R: Read + Seek>(reader: &mut R) -> std::io::Result<bool> {
    let len = reader.seek(SeekFrom::End(0))?;
    if len < FOOTER_SIZE {
        return Ok(false);
    }
    reader.seek(SeekFrom::Start(len - FOOTER_SIZE))?;
    let mut buf = [0u8; 8];
    let ok_primary = reader.read_exact(&mut buf).is_ok() && &buf == COOKIE;
    if ok_primary {
        reader.seek(SeekFrom::Start(0))?;
        return Ok(true);
    }
    reader.seek(SeekFrom::Start(0))?;
    let ok_backup = reader.read_exact(&mut buf).is_ok() && &buf == COOKIE;
    reader.seek(SeekFrom::Start(0))?;
    Ok(ok_backup)
}

struct OpenFields {
    disk_type: DiskType,
    size_bytes: u64,
    block_size: u32,
    block_sectors: u32,
    bitmap_sectors: u32,
    bat: Vec<u32>,
}

impl<R: Read + Seek> VhdImage<R> {
    /// Opens `reader` as a VHD, handing it back alongside the error if the
    /// body turns out malformed (spec §6.1).
    #[instrument(skip(reader))]
    pub fn open(mut reader: R) -> std::result::Result<Self, (R, VdiskError)> {
        match Self::parse(&mut reader) {
            Ok(f) => Ok(VhdImage {
                reader,
                disk_type: f.disk_type,
                size_bytes: f.size_bytes,
                block_size: f.block_size,
                block_sectors: f.block_sectors,
                bitmap_sectors: f.bitmap_sectors,
                bat: f.bat,
            }),
            Err(e) => Err((reader, e)),
        }
    }

    fn parse(reader: &mut R) -> Result<OpenFields> {
        let len = reader.seek(SeekFrom::End(0))?;
        if len < FOOTER_SIZE {
            return Err(VdiskError::bad_device("file too short for a VHD footer"));
        }

        let mut buf = [0u8; FOOTER_SIZE as usize];
        reader.seek(SeekFrom::Start(len - FOOTER_SIZE))?;
        reader.read_exact(&mut buf)?;
        let footer = match parse_footer(&buf) {
            Ok(f) => f,
            Err(_) => {
                reader.seek(SeekFrom::Start(0))?;
                reader.read_exact(&mut buf)?;
                parse_footer(&buf)?
            }
        };

        tracing::debug!(disk_type = ?footer.disk_type, size = footer.current_size, "vhd footer parsed");

        match footer.disk_type {
            DiskType::Fixed => Ok(OpenFields {
                disk_type: DiskType::Fixed,
                size_bytes: footer.current_size,
                block_size: 0,
                block_sectors: 0,
                bitmap_sectors: 0,
                bat: Vec::new(),
            }),
            DiskType::Dynamic | DiskType::Differencing => {
                reader.seek(SeekFrom::Start(footer.data_offset))?;
                let mut hbuf = [0u8; 1024];
                reader.read_exact(&mut hbuf)?;
                let dyn_header = parse_dynamic_header(&hbuf)?;

                let block_sectors = dyn_header.block_size / 512;
                let bitmap_bytes = (block_sectors as u64 + 7) / 8;
                let bitmap_sectors = align_up(bitmap_bytes, 512) / 512;

                reader.seek(SeekFrom::Start(dyn_header.bat_offset))?;
                let mut bat = Vec::with_capacity(dyn_header.max_table_entries as usize);
                for _ in 0..dyn_header.max_table_entries {
                    let mut b = [0u8; 4];
                    reader.read_exact(&mut b)?;
                    bat.push(u32::from_be_bytes(b));
                }

                Ok(OpenFields {
                    disk_type: footer.disk_type,
                    size_bytes: footer.current_size,
                    block_size: dyn_header.block_size,
                    block_sectors,
                    bitmap_sectors: bitmap_sectors as u32,
                    bat,
                })
            }
        }
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

        if self.disk_type == DiskType::Fixed {
            self.reader.seek(SeekFrom::Start(offset))?;
            self.reader.read_exact(&mut buf[..want])?;
            return Ok(want);
        }

        let sector = offset / 512;
        let bat_idx = (sector / self.block_sectors as u64) as usize;
        let sector_in_block = (sector % self.block_sectors as u64) as u32;
        let bytes_into_sector = (offset % 512) as usize;

        let entry = *self
            .bat
            .get(bat_idx)
            .ok_or_else(|| VdiskError::bad_argument("BAT index beyond table"))?;

        if entry == 0xFFFF_FFFF {
            // Whole block unallocated: zero-fill through the end of the
            // block (no parent chain to fall back to, spec §9).
            let remaining_sectors = self.block_sectors - sector_in_block;
            let run_bytes = remaining_sectors as usize * 512 - bytes_into_sector;
            let len = want.min(run_bytes);
            buf[..len].fill(0);
            return Ok(len);
        }

        let plan = self.plan_run(entry, sector_in_block, want, bytes_into_sector)?;
        match plan {
            BlockPlan::Hole { sectors } => {
                let run_bytes = sectors as usize * 512 - bytes_into_sector;
                let len = want.min(run_bytes);
                buf[..len].fill(0);
                Ok(len)
            }
            BlockPlan::Run {
                file_offset,
                sectors,
            } => {
                let run_bytes = sectors as usize * 512 - bytes_into_sector;
                let len = want.min(run_bytes);
                self.reader.seek(SeekFrom::Start(file_offset))?;
                self.reader.read_exact(&mut buf[..len])?;
                Ok(len)
            }
        }
    }

    /// Reads the block's sector bitmap, determines whether the target
    /// sector is dirty or clean, and counts the consecutive run of
    /// same-state sectors starting there (spec §4.6).
    fn plan_run(
        &mut self,
        bat_entry: u32,
        sector_in_block: u32,
        want: usize,
        bytes_into_sector: usize,
    ) -> Result<BlockPlan> {
        let bitmap_offset = bat_entry as u64 * 512;
        let bitmap_bytes = self.bitmap_sectors as u64 * 512;
        let mut bitmap = vec![0u8; bitmap_bytes as usize];
        self.reader.seek(SeekFrom::Start(bitmap_offset))?;
        self.reader.read_exact(&mut bitmap)?;

        let bit_dirty = |s: u32| -> bool {
            let byte = bitmap[(s / 8) as usize];
            (byte >> (7 - (s % 8))) & 1 == 1
        };

        let max_sectors_wanted =
            ((want + bytes_into_sector + 511) / 512).max(1) as u32;
        let start_dirty = bit_dirty(sector_in_block);
        let mut run = 1u32;
        while sector_in_block + run < self.block_sectors
            && run < max_sectors_wanted
            && bit_dirty(sector_in_block + run) == start_dirty
        {
            run += 1;
        }

        if start_dirty {
            let data_offset = bitmap_offset
                + bitmap_bytes
                + sector_in_block as u64 * 512;
            Ok(BlockPlan::Run {
                file_offset: data_offset,
                sectors: run,
            })
        } else {
            Ok(BlockPlan::Hole { sectors: run })
        }
    }
}
