//! Microsoft VHDX backend: file identifier, dual headers, region/metadata
//! tables, BAT (spec §3/§4.7).

pub mod bat;
pub mod header;
pub mod metadata;
pub mod signatures;

use std::io::{Read, Seek, SeekFrom};

use tracing::instrument;

use crate::error::{Result, VdiskError};
use crate::DeSerialise;

use bat::{bat_entry_count, bat_index_for_block, chunk_ratio, read_bat, BatEntry, BlockState};
use header::{select_current_header, FileTypeIdentifier, Header, KnownRegion, RegionTable};
use metadata::MetaData;
use signatures::FTI_SIGN;

const KB: u64 = 1024;

#[derive(Debug)]
pub struct VhdxImage<R> {
    reader: R,
    size_bytes: u64,
    block_size: u64,
    chunk_ratio: u64,
    bat: Vec<BatEntry>,
}

/// Peeks the first 8 bytes for the `"vhdxfile"` magic without consuming the
/// reader's position permanently (spec §6.2).
pub fn probe<R: Read + Seek>(reader: &mut R) -> std::io::Result<bool> {
    let pos = reader.stream_position()?;
    let mut buf = [0u8; 8];
    let ok = reader.read_exact(&mut buf).is_ok() && u64::from_le_bytes(buf) == FTI_SIGN;
    reader.seek(SeekFrom::Start(pos))?;
    Ok(ok)
}

struct OpenFields {
    size_bytes: u64,
    block_size: u64,
    chunk_ratio: u64,
    bat: Vec<BatEntry>,
}

impl<R: Read + Seek> VhdxImage<R> {
    /// Opens `reader` as a VHDX, handing it back alongside the error if the
    /// body turns out malformed (spec §6.1).
    #[instrument(skip(reader))]
    pub fn open(mut reader: R) -> std::result::Result<Self, (R, VdiskError)> {
        match Self::parse(&mut reader) {
            Ok(f) => Ok(VhdxImage {
                reader,
                size_bytes: f.size_bytes,
                block_size: f.block_size,
                chunk_ratio: f.chunk_ratio,
                bat: f.bat,
            }),
            Err(e) => Err((reader, e)),
        }
    }

    fn parse(reader: &mut R) -> Result<OpenFields> {
        reader.rewind()?;
        let fti = FileTypeIdentifier::deserialize(reader)?;
        crate::Validation::validate(&fti)?;
        tracing::debug!(creator = %fti.creator, "vhdx file type identifier parsed");

        reader.seek(SeekFrom::Start(64 * KB))?;
        let header_1 = Header::deserialize(reader).map_err(Into::into);
        reader.seek(SeekFrom::Start(128 * KB))?;
        let header_2 = Header::deserialize(reader).map_err(Into::into);
        let header = select_current_header(header_1, header_2)?;
        tracing::debug!(sequence_number = header.sequence_number(), "vhdx header selected");

        if !header.log_guid.is_nil() {
            return Err(VdiskError::NotImplementedYet(
                "VHDX log replay (non-empty log_guid)",
            ));
        }

        reader.seek(SeekFrom::Start(192 * KB))?;
        let region_table_1 = RegionTable::deserialize(reader);
        let region_table = match region_table_1 {
            Ok(rt) if crate::Validation::validate(&rt).is_ok() => rt,
            _ => {
                reader.seek(SeekFrom::Start(256 * KB))?;
                let rt2 = RegionTable::deserialize(reader)?;
                crate::Validation::validate(&rt2)?;
                rt2
            }
        };

        let bat_entry = region_table
            .table_entries
            .get(&KnownRegion::Bat)
            .ok_or_else(|| VdiskError::bad_device("VHDX file has no BAT region"))?;
        let metadata_entry = region_table
            .table_entries
            .get(&KnownRegion::MetaData)
            .ok_or_else(|| VdiskError::bad_device("VHDX file has no metadata region"))?;

        let md = MetaData::load(reader, metadata_entry.file_offset)?;
        let file_params = md.file_parameters.unwrap();
        let size_bytes = md.virtual_disk_size.unwrap();
        let logical_sector_size = md.logical_sector_size.unwrap();
        let block_size = file_params.block_size as u64;

        if !crate::parse_utils::is_pow2(block_size) {
            return Err(VdiskError::bad_device("VHDX block size not a power of two"));
        }

        let data_blocks = (size_bytes + block_size - 1) / block_size;
        let ratio = chunk_ratio(logical_sector_size, file_params.block_size);
        if ratio == 0 {
            return Err(VdiskError::bad_device("VHDX chunk ratio computed as zero"));
        }
        let total_bat_entries = bat_entry_count(data_blocks, ratio);

        let bat = read_bat(reader, bat_entry.file_offset, total_bat_entries)?;

        Ok(OpenFields {
            size_bytes,
            block_size,
            chunk_ratio: ratio,
            bat,
        })
    }

    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size_bytes {
            return Err(VdiskError::bad_argument("read offset beyond VHDX virtual size"));
        }
        let want = (buf.len() as u64).min(self.size_bytes - offset) as usize;
        if want == 0 {
            return Ok(0);
        }

        let block_idx = offset / self.block_size;
        let in_block = offset % self.block_size;
        let len = want.min((self.block_size - in_block) as usize);

        let bat_idx = bat_index_for_block(block_idx, self.chunk_ratio);
        let entry = *self
            .bat
            .get(bat_idx as usize)
            .ok_or_else(|| VdiskError::bad_device("BAT index out of range"))?;

        match entry.state {
            BlockState::FullyPresent => {
                self.reader
                    .seek(SeekFrom::Start(entry.file_offset + in_block))?;
                self.reader.read_exact(&mut buf[..len])?;
            }
            BlockState::PartiallyPresent => {
                return Err(VdiskError::NotImplementedYet(
                    "VHDX partially-present blocks (per-sector bitmap)",
                ));
            }
            BlockState::NotPresent | BlockState::Undefined | BlockState::Zero | BlockState::Unmapped => {
                buf[..len].fill(0);
            }
            BlockState::Reserved(v) => {
                return Err(VdiskError::bad_device(format!("reserved BAT state {v}")));
            }
        }

        Ok(len)
    }
}
