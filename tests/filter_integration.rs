//! End-to-end coverage of the filter's fixed probe order dispatching each
//! minimal image to the right backend (spec §6.1, §8).

use std::io::Cursor;

use vdisk::filter::{probe_and_open, FilterFlags, FilterOutcome, Image};

fn build_fixed_vhd(size: u64, payload_byte: u8) -> Vec<u8> {
    let mut file = vec![payload_byte; size as usize];
    let mut footer = vec![0u8; 512];
    footer[0..8].copy_from_slice(b"conectix");
    footer[0x30..0x38].copy_from_slice(&size.to_be_bytes());
    footer[0x3C..0x40].copy_from_slice(&2u32.to_be_bytes());
    file.extend_from_slice(&footer);
    file
}

fn build_qcow_v2(cluster_bits: u32, size: u64, l1_offset: u64) -> Vec<u8> {
    let cluster_size = 1u64 << cluster_bits;
    let l2_offset = l1_offset + 8;
    let l2_entries = 1u64 << (cluster_bits - 3);
    let cluster_offset = l2_offset + l2_entries * 8;

    let mut header = Vec::new();
    header.extend_from_slice(&0x514649FBu32.to_be_bytes());
    header.extend_from_slice(&2u32.to_be_bytes());
    header.extend_from_slice(&cluster_bits.to_be_bytes());
    header.extend_from_slice(&size.to_be_bytes());
    header.extend_from_slice(&0u32.to_be_bytes()); // crypt_method
    header.extend_from_slice(&1u32.to_be_bytes()); // l1_size
    header.extend_from_slice(&l1_offset.to_be_bytes());
    header.extend_from_slice(&0u64.to_be_bytes()); // refcount_table_offset
    header.extend_from_slice(&0u32.to_be_bytes()); // refcount_table_clusters
    header.extend_from_slice(&0u32.to_be_bytes()); // nb_snapshots
    header.extend_from_slice(&0u64.to_be_bytes()); // snapshots_offset

    let mut file = header;
    file.resize(l1_offset as usize, 0);
    const L2_ENTRY_COPIED: u64 = 1 << 63;
    file.extend_from_slice(&(l2_offset | L2_ENTRY_COPIED).to_be_bytes());

    file.resize(l2_offset as usize, 0);
    let mut l2 = vec![0u8; (l2_entries * 8) as usize];
    l2[0..8].copy_from_slice(&(cluster_offset | L2_ENTRY_COPIED).to_be_bytes());
    file.extend_from_slice(&l2);

    file.resize(cluster_offset as usize, 0);
    file.extend_from_slice(&vec![0xBBu8; cluster_size as usize]);
    file
}

#[test]
fn rejects_files_without_the_virtual_disk_flag() {
    let file = Cursor::new(build_fixed_vhd(128 * 1024, 0xAB));
    let outcome = probe_and_open(file, FilterFlags::NONE).unwrap();
    assert!(matches!(outcome, FilterOutcome::Unchanged(_)));
}

#[test]
fn rejects_files_under_64_kib() {
    let file = Cursor::new(vec![0xABu8; 4096]);
    let outcome = probe_and_open(file, FilterFlags::VIRTUAL_DISK).unwrap();
    assert!(matches!(outcome, FilterOutcome::Unchanged(_)));
}

#[test]
fn unrecognized_large_file_passes_through_unchanged() {
    let file = Cursor::new(vec![0x11u8; 128 * 1024]);
    let outcome = probe_and_open(file, FilterFlags::VIRTUAL_DISK).unwrap();
    match outcome {
        FilterOutcome::Unchanged(cursor) => assert_eq!(cursor.into_inner().len(), 128 * 1024),
        FilterOutcome::Opened(_) => panic!("an all-0x11 buffer should match no backend"),
    }
}

#[test]
fn dispatches_a_fixed_vhd_through_the_filter() {
    let size = 128 * 1024u64;
    let file = Cursor::new(build_fixed_vhd(size, 0xCD));
    let outcome = probe_and_open(file, FilterFlags::VIRTUAL_DISK).unwrap();
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

#[test]
fn dispatches_a_qcow_v2_image_through_the_filter() {
    let cluster_bits = 16u32;
    let size = 2 * (1u64 << cluster_bits);
    let file = Cursor::new(build_qcow_v2(cluster_bits, size, 4096));
    let outcome = probe_and_open(file, FilterFlags::VIRTUAL_DISK).unwrap();
    match outcome {
        FilterOutcome::Opened(Image::Qcow(mut img)) => {
            assert_eq!(img.size(), size);
            let mut buf = [0u8; 2];
            let n = img.read(65535, &mut buf).unwrap();
            assert_eq!(n, 1);
            assert_eq!(buf[0], 0xBB);
        }
        _ => panic!("expected a QCOW image"),
    }
}
