//! The metadata region: a small table of well-known items describing the
//! virtual disk's geometry (spec §3/§4.7 step 5).

use std::io::{Read, Seek, SeekFrom};

use nom::number::complete::{le_u16, le_u32, le_u64};
use nom::sequence::tuple;
use uuid::{uuid, Uuid};

use crate::error::{Result, VdiskError};
use crate::formats::vhdx::signatures::{t_sign_u64, Signature};
use crate::parse_utils::t_guid;
use crate::DeSerialise;

const FILE_PARAMETERS: Uuid = uuid!("caa16737-fa36-4d43-b3b6-33f0aa44e76b");
const VIRTUAL_DISK_SIZE: Uuid = uuid!("2fa54224-cd1b-4876-b211-5dbed83bf4b8");
const PAGE_83_DATA: Uuid = uuid!("beca12ab-b2e6-4523-93ef-c309e000c746");
const LOGICAL_SECTOR_SIZE: Uuid = uuid!("8141bf1d-a96f-4709-ba47-f233a8faab5f");
const PHYSICAL_SECTOR_SIZE: Uuid = uuid!("cda348c7-445d-4471-9cc9-e9885251c556");
const PARENT_LOCATOR: Uuid = uuid!("a8d35f2d-b30b-454d-abf7-d3d84834ab0b");

/// Expected `(is_user, is_virtual_disk, is_required)` flag triple for each
/// well-known item, per MS-VHDX. Physical sector size is allowed to present
/// `is_required = false` even though the table below says `true`: some
/// early writers violated this and the format still needs to load.
fn expected_flags(id: Uuid) -> Option<(bool, bool, bool)> {
    match id {
        FILE_PARAMETERS => Some((false, true, true)),
        VIRTUAL_DISK_SIZE => Some((false, true, true)),
        PAGE_83_DATA => Some((false, true, true)),
        LOGICAL_SECTOR_SIZE => Some((false, true, true)),
        PHYSICAL_SECTOR_SIZE => Some((false, true, true)),
        PARENT_LOCATOR => Some((false, false, true)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetaDataEntry {
    pub item_id: Uuid,
    pub offset: u32,
    pub length: u32,
    pub is_user: bool,
    pub is_virtual_disk: bool,
    pub is_required: bool,
}

impl<T: Read + Seek> DeSerialise<T> for MetaDataEntry {
    type Item = MetaDataEntry;

    fn deserialize(reader: &mut T) -> Result<Self::Item> {
        let mut buffer = [0u8; 32];
        reader.read_exact(&mut buffer)?;
        let (_, (item_id, offset, length, flags, _reserved)) =
            tuple((t_guid, le_u32, le_u32, le_u32, le_u32))(&buffer)?;
        Ok(MetaDataEntry {
            item_id,
            offset,
            length,
            is_user: flags & 0x1 != 0,
            is_virtual_disk: flags & 0x2 != 0,
            is_required: flags & 0x4 != 0,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileParameters {
    pub block_size: u32,
    pub has_parent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MetaData {
    pub entry_count: u16,
    pub entries: Vec<MetaDataEntry>,
    pub file_parameters: Option<FileParameters>,
    pub virtual_disk_size: Option<u64>,
    pub logical_sector_size: Option<u32>,
    pub physical_sector_size: Option<u32>,
    pub page83_data: Option<Uuid>,
}

impl MetaData {
    /// Reads the header and entry directory starting at the current
    /// position (the beginning of the metadata region), then walks each
    /// entry and loads the known item payloads. `region_start` is the file
    /// offset the metadata region begins at — item offsets in the directory
    /// are relative to it.
    pub fn load<T: Read + Seek>(reader: &mut T, region_start: u64) -> Result<MetaData> {
        reader.seek(SeekFrom::Start(region_start))?;
        let mut header_buf = [0u8; 32];
        reader.read_exact(&mut header_buf)?;
        let (rest, signature) = t_sign_u64(&header_buf)?;
        if signature != Signature::MetaData {
            return Err(VdiskError::BadSignature {
                expected: "metadata",
                found: format!("{signature:?}"),
            });
        }
        let (_, (_reserved, entry_count)) = tuple((le_u16, le_u16))(rest)?;
        if entry_count > 2047 {
            return Err(VdiskError::bad_device("metadata entry count > 2047"));
        }

        let mut md = MetaData {
            entry_count,
            ..Default::default()
        };

        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            entries.push(MetaDataEntry::deserialize(reader)?);
        }

        for entry in &entries {
            if let Some(expected) = expected_flags(entry.item_id) {
                let mut actual = (entry.is_user, entry.is_virtual_disk, entry.is_required);
                if entry.item_id == PHYSICAL_SECTOR_SIZE {
                    actual.2 = expected.2; // tolerate relaxed required flag
                }
                if actual != expected {
                    return Err(VdiskError::bad_device(format!(
                        "metadata item {} has unexpected flag triple {:?}",
                        entry.item_id, actual
                    )));
                }
            } else if entry.is_required {
                return Err(VdiskError::NotImplementedYet(
                    "unknown required VHDX metadata item",
                ));
            }

            if entry.item_id == PARENT_LOCATOR {
                return Err(VdiskError::NotImplementedYet(
                    "VHDX parent locator (differencing disks)",
                ));
            }
        }

        for entry in &entries {
            let item_offset = region_start + entry.offset as u64;
            if entry.item_id == FILE_PARAMETERS {
                reader.seek(SeekFrom::Start(item_offset))?;
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                let block_size = u32::from_le_bytes(buf[0..4].try_into().unwrap());
                let flags = u32::from_le_bytes(buf[4..8].try_into().unwrap());
                md.file_parameters = Some(FileParameters {
                    block_size,
                    has_parent: flags & 0x2 != 0,
                });
                if md.file_parameters.unwrap().has_parent {
                    return Err(VdiskError::NotImplementedYet(
                        "VHDX differencing disks (has_parent_disk)",
                    ));
                }
            } else if entry.item_id == VIRTUAL_DISK_SIZE {
                reader.seek(SeekFrom::Start(item_offset))?;
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                md.virtual_disk_size = Some(u64::from_le_bytes(buf));
            } else if entry.item_id == LOGICAL_SECTOR_SIZE {
                reader.seek(SeekFrom::Start(item_offset))?;
                let mut buf = [0u8; 4];
                reader.read_exact(&mut buf)?;
                md.logical_sector_size = Some(u32::from_le_bytes(buf));
            } else if entry.item_id == PHYSICAL_SECTOR_SIZE {
                reader.seek(SeekFrom::Start(item_offset))?;
                let mut buf = [0u8; 4];
                reader.read_exact(&mut buf)?;
                md.physical_sector_size = Some(u32::from_le_bytes(buf));
            } else if entry.item_id == PAGE_83_DATA {
                reader.seek(SeekFrom::Start(item_offset))?;
                let mut buf = [0u8; 16];
                reader.read_exact(&mut buf)?;
                let (_, uuid) = t_guid(&buf)?;
                md.page83_data = Some(uuid);
            }
        }

        md.entries = entries;

        if md.file_parameters.is_none()
            || md.virtual_disk_size.is_none()
            || md.logical_sector_size.is_none()
            || md.physical_sector_size.is_none()
            || md.page83_data.is_none()
        {
            return Err(VdiskError::bad_device(
                "VHDX metadata missing a required item",
            ));
        }

        Ok(md)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entry_bytes(id: Uuid, offset: u32, length: u32, flags: u32) -> Vec<u8> {
        let mut v = Vec::new();
        let (d1, d2, d3, d4) = id.to_fields_le();
        v.extend_from_slice(&d1.to_le_bytes());
        v.extend_from_slice(&d2.to_le_bytes());
        v.extend_from_slice(&d3.to_le_bytes());
        v.extend_from_slice(d4);
        v.extend_from_slice(&offset.to_le_bytes());
        v.extend_from_slice(&length.to_le_bytes());
        v.extend_from_slice(&flags.to_le_bytes());
        v.extend_from_slice(&[0; 4]);
        v
    }

    fn minimal_entries(region: &mut Vec<u8>) {
        region.extend_from_slice(b"metadata");
        region.extend_from_slice(&[0u8; 2]); // reserved
        region.extend_from_slice(&5u16.to_le_bytes()); // entry_count
        region.extend_from_slice(&[0u8; 20]); // reserved2
        region.extend_from_slice(&entry_bytes(FILE_PARAMETERS, 88, 8, 0b110));
        region.extend_from_slice(&entry_bytes(VIRTUAL_DISK_SIZE, 96, 8, 0b110));
        region.extend_from_slice(&entry_bytes(LOGICAL_SECTOR_SIZE, 104, 4, 0b110));
        region.extend_from_slice(&entry_bytes(PHYSICAL_SECTOR_SIZE, 108, 4, 0b110));
        region.extend_from_slice(&entry_bytes(PAGE_83_DATA, 112, 16, 0b110));
        region.resize(88, 0);
        // file parameters item at offset 88: block_size=0x200000, flags=0
        region.extend_from_slice(&0x0020_0000u32.to_le_bytes());
        region.extend_from_slice(&0u32.to_le_bytes());
        // virtual disk size at 96
        region.extend_from_slice(&(32u64 * 1024 * 1024).to_le_bytes());
        // logical sector size at 104
        region.extend_from_slice(&512u32.to_le_bytes());
        // physical sector size at 108
        region.extend_from_slice(&4096u32.to_le_bytes());
        // page83 data guid at 112
        region.extend_from_slice(&[0xAB; 16]);
    }

    #[test]
    fn loads_minimal_metadata_region() {
        let mut region = Vec::new();
        minimal_entries(&mut region);

        let mut cur = Cursor::new(region);
        let md = MetaData::load(&mut cur, 0).unwrap();
        assert_eq!(md.file_parameters.unwrap().block_size, 0x0020_0000);
        assert!(!md.file_parameters.unwrap().has_parent);
        assert_eq!(md.virtual_disk_size, Some(32 * 1024 * 1024));
        assert_eq!(md.logical_sector_size, Some(512));
        assert_eq!(md.physical_sector_size, Some(4096));
        assert!(md.page83_data.is_some());
    }

    #[test]
    fn rejects_metadata_missing_page83_data() {
        let mut region = Vec::new();
        region.extend_from_slice(b"metadata");
        region.extend_from_slice(&[0u8; 2]); // reserved
        region.extend_from_slice(&4u16.to_le_bytes()); // entry_count
        region.extend_from_slice(&[0u8; 20]); // reserved2
        region.extend_from_slice(&entry_bytes(FILE_PARAMETERS, 64, 8, 0b110));
        region.extend_from_slice(&entry_bytes(VIRTUAL_DISK_SIZE, 72, 8, 0b110));
        region.extend_from_slice(&entry_bytes(LOGICAL_SECTOR_SIZE, 80, 4, 0b110));
        region.extend_from_slice(&entry_bytes(PHYSICAL_SECTOR_SIZE, 84, 4, 0b110));
        region.resize(64, 0);
        region.extend_from_slice(&0x0020_0000u32.to_le_bytes());
        region.extend_from_slice(&0u32.to_le_bytes());
        region.extend_from_slice(&(32u64 * 1024 * 1024).to_le_bytes());
        region.extend_from_slice(&512u32.to_le_bytes());
        region.extend_from_slice(&4096u32.to_le_bytes());

        let mut cur = Cursor::new(region);
        let err = MetaData::load(&mut cur, 0).unwrap_err();
        assert!(matches!(err, VdiskError::BadDevice(_)));
    }
}
