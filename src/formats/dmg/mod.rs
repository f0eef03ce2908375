//! Apple DMG (UDIF) backend: trailer, resource-fork plist, `mish` block
//! maps, raw/zero/zlib extents (spec §3/§4.3).

pub mod blkx;
pub mod footer;
pub mod xml;

use std::io::{Read, Seek, SeekFrom};

use flate2::read::ZlibDecoder;
use tracing::instrument;

use crate::error::{Result, VdiskError};
use crate::extent::{Extent, ExtentKind, ExtentTable};

const SECTOR_SIZE: u64 = 512;

pub fn probe<R: Read + Seek>(reader: &mut R) -> std::io::Result<bool> {
    let pos = reader.stream_position()?;
    let len = reader.seek(SeekFrom::End(0))?;
    if len < footer::FOOTER_SIZE {
        reader.seek(SeekFrom::Start(pos))?;
        return Ok(false);
    }
    reader.seek(SeekFrom::Start(len - footer::FOOTER_SIZE))?;
    let mut magic = [0u8; 4];
    let ok = reader.read_exact(&mut magic).is_ok() && &magic == b"koly";
    reader.seek(SeekFrom::Start(pos))?;
    Ok(ok)
}

pub struct DmgImage<R> {
    reader: R,
    size_bytes: u64,
    extents: ExtentTable,
    scratch: Option<(u64, Vec<u8>)>,
}

impl<R: Read + Seek> DmgImage<R> {
    /// Opens `reader` as a DMG, handing it back alongside the error if the
    /// body turns out malformed so the caller can try another backend or
    /// fall through unchanged (spec §6.1).
    #[instrument(skip(reader))]
    pub fn open(mut reader: R) -> std::result::Result<Self, (R, VdiskError)> {
        match Self::parse(&mut reader) {
            Ok((size_bytes, extents)) => Ok(DmgImage {
                reader,
                size_bytes,
                extents,
                scratch: None,
            }),
            Err(e) => Err((reader, e)),
        }
    }

    fn parse(reader: &mut R) -> Result<(u64, ExtentTable)> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        if file_len < footer::FOOTER_SIZE {
            return Err(VdiskError::bad_device("file too small for a UDIF trailer"));
        }
        let footer_offset = file_len - footer::FOOTER_SIZE;

        reader.seek(SeekFrom::Start(footer_offset))?;
        let mut footer_buf = [0u8; 512];
        reader.read_exact(&mut footer_buf)?;
        let footer = footer::parse(&footer_buf, footer_offset)?;

        reader.seek(SeekFrom::Start(footer.plist_offset))?;
        let mut plist_buf = vec![0u8; footer.plist_length as usize];
        reader.read_exact(&mut plist_buf)?;
        let resource_fork = xml::parse_resource_fork(&plist_buf)?;

        tracing::debug!(
            blkx_count = resource_fork.blkx_entries.len(),
            sector_count = footer.sector_count,
            "dmg resource fork parsed"
        );

        let mut extents: Vec<Extent> = Vec::new();
        for mish in &resource_fork.blkx_entries {
            extents.extend(blkx::extents_from_mish(mish, footer.data_fork_offset)?);
        }
        let extents = ExtentTable::new(extents)?;

        Ok((footer.sector_count * SECTOR_SIZE, extents))
    }

    pub fn size(&self) -> u64 {
        self.size_bytes
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size_bytes {
            return Err(VdiskError::bad_argument("DMG read offset beyond virtual size"));
        }
        let want = (buf.len() as u64).min(self.size_bytes - offset) as usize;
        if want == 0 {
            return Ok(0);
        }

        let sector = offset / SECTOR_SIZE;
        let extent = *self
            .extents
            .lookup(sector)
            .ok_or_else(|| VdiskError::bad_argument("DMG read falls outside any mapped extent"))?;

        let extent_byte_start = extent.first_sector * SECTOR_SIZE;
        let extent_byte_len = extent.sector_count * SECTOR_SIZE;
        let intra = offset - extent_byte_start;
        let len = want.min((extent_byte_len - intra) as usize);

        match extent.kind {
            ExtentKind::Raw { file_offset } => {
                self.reader.seek(SeekFrom::Start(file_offset + intra))?;
                self.reader.read_exact(&mut buf[..len])?;
            }
            ExtentKind::Zero => {
                buf[..len].fill(0);
            }
            ExtentKind::CompressedZlib { file_offset, file_bytes } => {
                if self.scratch.as_ref().map(|(off, _)| *off) != Some(file_offset) {
                    self.reader.seek(SeekFrom::Start(file_offset))?;
                    let mut compressed = vec![0u8; file_bytes as usize];
                    self.reader.read_exact(&mut compressed)?;
                    let mut decoder = ZlibDecoder::new(&compressed[..]);
                    let mut plain = vec![0u8; extent_byte_len as usize];
                    decoder
                        .read_exact(&mut plain)
                        .map_err(|e| VdiskError::BadCompressedData(e.to_string()))?;
                    tracing::trace!(file_offset, "dmg decompressed a new zlib extent");
                    self.scratch = Some((file_offset, plain));
                }
                let plain = &self.scratch.as_ref().unwrap().1;
                buf[..len].copy_from_slice(&plain[intra as usize..intra as usize + len]);
            }
        }

        Ok(len)
    }
}
