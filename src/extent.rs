//! Format-independent mapping record and the binary-search resolver shared
//! by every backend (spec §3 "Mapping entry / extent", §4.1).

use crate::error::{Result, VdiskError};

/// What a virtual sector range resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// Bytes live at `file_offset` in the underlying file, read verbatim.
    Raw { file_offset: u64 },
    /// The range reads as all-zero bytes; nothing to fetch from the file.
    Zero,
    /// The range is a compressed chunk; `file_offset`/`file_bytes` describe
    /// the compressed payload, decompression is the caller's job.
    CompressedZlib { file_offset: u64, file_bytes: u64 },
}

/// A contiguous run of virtual sectors mapped to one `ExtentKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub first_sector: u64,
    pub sector_count: u64,
    pub kind: ExtentKind,
}

impl Extent {
    pub fn contains(&self, sector: u64) -> bool {
        sector >= self.first_sector && sector < self.first_sector + self.sector_count
    }
}

/// Sorted, non-overlapping extent array with a one-entry MRU lookup hint.
///
/// The MRU index is a pure performance hint (spec §9 "Single-entry MRU
/// index"): it seeds the binary search at the most-recently-hit position so
/// sequential reads (the overwhelmingly common access pattern) resolve in
/// O(1) instead of O(log n). It never affects correctness.
#[derive(Debug)]
pub struct ExtentTable {
    extents: Vec<Extent>,
    idx_last: std::cell::Cell<usize>,
}

impl ExtentTable {
    /// Builds a table from an already-collected list of extents, sorting by
    /// `first_sector` and rejecting overlaps as a file-integrity error.
    pub fn new(mut extents: Vec<Extent>) -> Result<Self> {
        extents.sort_by_key(|e| e.first_sector);
        for pair in extents.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.first_sector == b.first_sector {
                return Err(VdiskError::bad_device(format!(
                    "duplicate extent at sector {}",
                    a.first_sector
                )));
            }
            if a.first_sector + a.sector_count > b.first_sector {
                return Err(VdiskError::bad_device(format!(
                    "overlapping extents: [{}, {}) and [{}, {})",
                    a.first_sector,
                    a.first_sector + a.sector_count,
                    b.first_sector,
                    b.first_sector + b.sector_count
                )));
            }
        }
        Ok(Self {
            extents,
            idx_last: std::cell::Cell::new(0),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Resolves `sector` to its containing extent, or `None` if the sector
    /// is not covered by any extent (the format decides what that means:
    /// zero-fill, hole, or error — see spec §3/§7).
    pub fn lookup(&self, sector: u64) -> Option<&Extent> {
        if self.extents.is_empty() {
            return None;
        }
        let hint = self.idx_last.get().min(self.extents.len() - 1);
        if self.extents[hint].contains(sector) {
            return Some(&self.extents[hint]);
        }

        match self.extents.binary_search_by(|e| {
            if sector < e.first_sector {
                std::cmp::Ordering::Greater
            } else if sector >= e.first_sector + e.sector_count {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(idx) => {
                self.idx_last.set(idx);
                Some(&self.extents[idx])
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(first: u64, count: u64, off: u64) -> Extent {
        Extent {
            first_sector: first,
            sector_count: count,
            kind: ExtentKind::Raw { file_offset: off },
        }
    }

    #[test]
    fn lookup_finds_containing_extent() {
        let table = ExtentTable::new(vec![raw(0, 10, 0), raw(10, 10, 5120)]).unwrap();
        assert_eq!(table.lookup(0).unwrap().first_sector, 0);
        assert_eq!(table.lookup(9).unwrap().first_sector, 0);
        assert_eq!(table.lookup(10).unwrap().first_sector, 10);
        assert_eq!(table.lookup(19).unwrap().first_sector, 10);
        assert!(table.lookup(20).is_none());
    }

    #[test]
    fn mru_hint_still_resolves_non_sequential_reads() {
        let table = ExtentTable::new(vec![raw(0, 10, 0), raw(10, 10, 5120), raw(30, 5, 9999)])
            .unwrap();
        assert_eq!(table.lookup(31).unwrap().first_sector, 30);
        assert_eq!(table.lookup(1).unwrap().first_sector, 0);
        assert_eq!(table.lookup(15).unwrap().first_sector, 10);
    }

    #[test]
    fn overlapping_extents_rejected() {
        let err = ExtentTable::new(vec![raw(0, 10, 0), raw(5, 10, 1)]);
        assert!(err.is_err());
    }

    #[test]
    fn duplicate_first_sector_rejected() {
        let err = ExtentTable::new(vec![raw(0, 10, 0), raw(0, 10, 1)]);
        assert!(err.is_err());
    }
}
