//! Read-only virtual-disk container layer.
//!
//! Exposes Apple DMG (UDIF), QEMU QCOW (v1/v2/v3), VirtualBox VDI, Microsoft
//! VHD (fixed/dynamic/differencing) and Microsoft VHDX images as a single
//! linear byte-addressable stream over an underlying `Read + Seek` file, plus
//! the AES and hash primitives the surrounding ecosystem uses for encrypted
//! variants of these containers.
//!
//! The entry point is [`filter::probe_and_open`]: it inspects a freshly
//! opened file, tries each backend's magic in a fixed order, and either hands
//! back an [`Image`](filter::Image) wrapping the matching backend or the
//! untouched file if nothing recognized it.

use std::io::{Read, Seek};

use error::VdiskError;

pub mod crypto;
pub mod error;
pub mod extent;
pub mod filter;
pub mod formats;
pub mod parse_utils;

pub use error::Result;
pub use filter::{probe_and_open, FilterFlags, FilterOutcome, Image};

/// Deserializes a fixed on-disk structure from a `Read + Seek` reader.
///
/// Every header/table/descriptor type in every backend implements this the
/// same way the original VHDX parser's `DeSerialise` did: read the exact
/// byte count the structure occupies, then hand it to a `nom` parser.
pub trait DeSerialise<T> {
    type Item;

    fn deserialize(reader: &mut T) -> Result<Self::Item>
    where
        T: Read + Seek;
}

/// Computes a CRC-32C (Castagnoli) checksum the way the on-disk structure
/// defines it: over the structure's own bytes with the checksum field itself
/// taken as zero. `crc32_from_digest` feeds a running digest so composite
/// structures (region tables, log entries) can checksum themselves plus
/// their children without re-serializing into a temporary buffer.
pub trait Crc32 {
    fn crc32(&self) -> u32;
    fn crc32_from_digest(&self, digest: &mut crc::Digest<u32>);
}

/// Structural validation separate from parsing: a value can be successfully
/// parsed (the bytes fit the layout) yet still violate an invariant the
/// format mandates (bad magic, non-power-of-two block size, disallowed
/// feature bit). `validate` is where those checks live.
pub trait Validation {
    fn validate(&self) -> Result<()>;
}
