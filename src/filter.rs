//! Front-end filter: probes a newly opened file against every backend in a
//! fixed order and wraps the first one that accepts it (spec §6.1).

use std::io::{Read, Seek, SeekFrom};

use crate::formats::{dmg, qcow, vdi, vhd, vhdx};

const MIN_FILTERED_SIZE: u64 = 64 * 1024;

/// Caller-supplied gate flags. Only the virtual-disk filter bit is defined;
/// other bits are reserved by the host and ignored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterFlags(u32);

impl FilterFlags {
    pub const NONE: FilterFlags = FilterFlags(0);
    pub const VIRTUAL_DISK: FilterFlags = FilterFlags(1 << 0);

    pub fn contains(&self, flag: FilterFlags) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for FilterFlags {
    type Output = FilterFlags;
    fn bitor(self, rhs: FilterFlags) -> FilterFlags {
        FilterFlags(self.0 | rhs.0)
    }
}

/// One open virtual disk, dispatching to whichever backend accepted it.
pub enum Image<R> {
    Dmg(dmg::DmgImage<R>),
    Qcow(qcow::QcowImage<R>),
    Vdi(vdi::VdiImage<R>),
    Vhd(vhd::VhdImage<R>),
    Vhdx(vhdx::VhdxImage<R>),
}

impl<R: Read + Seek> Image<R> {
    pub fn size(&self) -> u64 {
        match self {
            Image::Dmg(i) => i.size(),
            Image::Qcow(i) => i.size(),
            Image::Vdi(i) => i.size(),
            Image::Vhd(i) => i.size(),
            Image::Vhdx(i) => i.size(),
        }
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> crate::error::Result<usize> {
        match self {
            Image::Dmg(i) => i.read(offset, buf),
            Image::Qcow(i) => i.read(offset, buf),
            Image::Vdi(i) => i.read(offset, buf),
            Image::Vhd(i) => i.read(offset, buf),
            Image::Vhdx(i) => i.read(offset, buf),
        }
    }
}

/// Result of running a file through the filter: either a backend claimed it,
/// or every backend declined and the original handle is returned unchanged.
pub enum FilterOutcome<R> {
    Opened(Image<R>),
    Unchanged(R),
}

/// Tries each backend's `probe` in the fixed order {DMG, QCOW, VDI, VHD,
/// VHDX}; the first one whose signature matches gets handed the file via
/// `open`. A probe that matches but whose `open` then fails (a well-formed
/// signature over a malformed body) rewinds the file and reports it
/// unchanged rather than an error, same as a file no backend recognized at
/// all (spec §6.1).
pub fn probe_and_open<R: Read + Seek>(
    mut file: R,
    type_flags: FilterFlags,
) -> std::io::Result<FilterOutcome<R>> {
    if !type_flags.contains(FilterFlags::VIRTUAL_DISK) {
        return Ok(FilterOutcome::Unchanged(file));
    }

    let len = file.seek(SeekFrom::End(0))?;
    file.rewind()?;
    if len < MIN_FILTERED_SIZE {
        return Ok(FilterOutcome::Unchanged(file));
    }

    if dmg::probe(&mut file)? {
        file.rewind()?;
        match dmg::DmgImage::open(file) {
            Ok(img) => return Ok(FilterOutcome::Opened(Image::Dmg(img))),
            Err((mut f, _)) => {
                f.rewind()?;
                return Ok(FilterOutcome::Unchanged(f));
            }
        }
    }
    if qcow::probe(&mut file)? {
        file.rewind()?;
        match qcow::QcowImage::open(file) {
            Ok(img) => return Ok(FilterOutcome::Opened(Image::Qcow(img))),
            Err((mut f, _)) => {
                f.rewind()?;
                return Ok(FilterOutcome::Unchanged(f));
            }
        }
    }
    if vdi::probe(&mut file)? {
        file.rewind()?;
        match vdi::VdiImage::open(file) {
            Ok(img) => return Ok(FilterOutcome::Opened(Image::Vdi(img))),
            Err((mut f, _)) => {
                f.rewind()?;
                return Ok(FilterOutcome::Unchanged(f));
            }
        }
    }
    if vhd::probe(&mut file)? {
        file.rewind()?;
        match vhd::VhdImage::open(file) {
            Ok(img) => return Ok(FilterOutcome::Opened(Image::Vhd(img))),
            Err((mut f, _)) => {
                f.rewind()?;
                return Ok(FilterOutcome::Unchanged(f));
            }
        }
    }
    if vhdx::probe(&mut file)? {
        file.rewind()?;
        match vhdx::VhdxImage::open(file) {
            Ok(img) => return Ok(FilterOutcome::Opened(Image::Vhdx(img))),
            Err((mut f, _)) => {
                f.rewind()?;
                return Ok(FilterOutcome::Unchanged(f));
            }
        }
    }

    file.rewind()?;
    Ok(FilterOutcome::Unchanged(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_without_virtual_disk_flag() {
        let file = Cursor::new(vec![0u8; 128 * 1024]);
        let outcome = probe_and_open(file, FilterFlags::NONE).unwrap();
        assert!(matches!(outcome, FilterOutcome::Unchanged(_)));
    }

    #[test]
    fn rejects_small_file() {
        let file = Cursor::new(vec![0u8; 1024]);
        let outcome = probe_and_open(file, FilterFlags::VIRTUAL_DISK).unwrap();
        assert!(matches!(outcome, FilterOutcome::Unchanged(_)));
    }

    #[test]
    fn passes_through_unrecognized_large_file() {
        let file = Cursor::new(vec![0u8; 128 * 1024]);
        let outcome = probe_and_open(file, FilterFlags::VIRTUAL_DISK).unwrap();
        assert!(matches!(outcome, FilterOutcome::Unchanged(_)));
    }

    #[test]
    fn opens_a_fixed_vhd() {
        let mut footer = vec![0u8; 512];
        footer[0..8].copy_from_slice(b"conectix");
        let size = 128 * 1024u64;
        footer[0x30..0x38].copy_from_slice(&size.to_be_bytes());
        footer[0x3C..0x40].copy_from_slice(&2u32.to_be_bytes());

        let mut file = vec![0xCDu8; size as usize];
        file.extend_from_slice(&footer);

        let outcome = probe_and_open(Cursor::new(file), FilterFlags::VIRTUAL_DISK).unwrap();
        match outcome {
            FilterOutcome::Opened(Image::Vhd(mut img)) => {
                assert_eq!(img.size(), size);
                let mut buf = [0u8; 4];
                img.read(0, &mut buf).unwrap();
                assert_eq!(buf, [0xCD; 4]);
            }
            _ => panic!("expected a VHD image"),
        }
    }
}
