// SPDX-FileCopyrightText: 2025-2026 The rdcpio developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{io::Cursor, sync::atomic::AtomicBool};

use rdcpio::{
    format::cpio::{CpioArchive, CpioEntry, CpioEntryType, CpioWriter},
    util,
};

// One regular file "a" containing "hi", followed by the trailer record.
const GOLDEN: &[u8] = concat!(
    "070701",   // magic
    "000493e0", // inode 300000
    "000081a4", // S_IFREG | 0644
    "00000000", // uid
    "00000000", // gid
    "00000001", // nlink
    "00000000", // mtime
    "00000002", // file size
    "00000000", // dev_maj
    "00000000", // dev_min
    "00000000", // rdev_maj
    "00000000", // rdev_min
    "00000002", // path size
    "00000000", // crc32
    "a\0",      // path, header already 4-byte aligned
    "hi\0\0",   // data, padded
    "070701",
    "00000000",
    "00000000",
    "00000000",
    "00000000",
    "00000001",
    "00000000",
    "00000000",
    "00000000",
    "00000000",
    "00000000",
    "00000000",
    "0000000b",
    "00000000",
    "TRAILER!!!\0\0\0\0",
)
.as_bytes();

fn golden_archive() -> CpioArchive {
    let mut archive = CpioArchive::new();
    let mut entry = CpioEntry::new_file(0o644, b"hi".to_vec());
    entry.inode = 300000;
    archive.insert(b"a".to_vec(), entry).unwrap();

    archive
}

fn sample_archive() -> CpioArchive {
    let mut archive = CpioArchive::new();

    archive
        .insert(b"symlink".to_vec(), CpioEntry::new_symlink(b"target"))
        .unwrap();
    archive
        .insert(b"directory".to_vec(), CpioEntry::new_directory(0o755))
        .unwrap();
    archive
        .insert(
            b"file".to_vec(),
            CpioEntry::new_file(0o644, b"foobar".to_vec()),
        )
        .unwrap();
    archive
        .insert(
            b"null".to_vec(),
            CpioEntry {
                data: vec![],
                inode: 12345,
                file_type: CpioEntryType::Char,
                file_mode: 0o666,
                uid: 12345678,
                gid: 87654321,
                nlink: 1,
                mtime: 1700000000,
                dev_maj: 2222,
                dev_min: 3333,
                rdev_maj: 1,
                rdev_min: 3,
                crc32: 0,
            },
        )
        .unwrap();

    archive.assign_inodes().unwrap();
    archive
}

fn dump(archive: &CpioArchive, pad_to_block_size: bool) -> Vec<u8> {
    let cancel_signal = AtomicBool::new(false);
    let mut writer = Cursor::new(Vec::new());

    archive
        .to_writer(&mut writer, pad_to_block_size, &cancel_signal)
        .unwrap();

    writer.into_inner()
}

fn load(data: &[u8]) -> CpioArchive {
    let cancel_signal = AtomicBool::new(false);

    CpioArchive::from_reader(Cursor::new(data), &cancel_signal).unwrap()
}

#[test]
fn golden_bytes() {
    assert_eq!(dump(&golden_archive(), false), GOLDEN);
}

#[test]
fn golden_parse() {
    let archive = load(GOLDEN);

    assert_eq!(archive.len(), 1);

    let entry = archive.get(b"a").unwrap();
    assert_eq!(entry.file_type, CpioEntryType::Regular);
    assert_eq!(entry.file_mode, 0o644);
    assert_eq!(entry.inode, 300000);
    assert_eq!(entry.data, b"hi");
}

#[test]
fn round_trip_archive() {
    let archive = sample_archive();
    let data = dump(&archive, false);
    assert_ne!(data.len() % 512, 0);

    let loaded = load(&data);
    assert_eq!(loaded, archive);

    // Metadata is preserved verbatim, so re-serializing is byte-stable.
    assert_eq!(dump(&loaded, false), data);
}

#[test]
fn pad_to_block_size() {
    let archive = sample_archive();
    let data = dump(&archive, false);
    let padded = dump(&archive, true);

    assert!(padded.starts_with(&data));
    assert!(util::is_zero(&padded[data.len()..]));
    assert_eq!(padded.len() % 512, 0);
}

#[test]
fn hard_links_rejected() {
    let writer = Cursor::new(Vec::new());
    let mut cpio_writer = CpioWriter::new(writer, false);

    let mut entry = CpioEntry::new_file(0o644, b"foobar".to_vec());
    entry.nlink = 2;
    cpio_writer.write_entry(b"hardlink", &entry).unwrap();

    let data = cpio_writer.finish().unwrap().into_inner();

    let cancel_signal = AtomicBool::new(false);
    CpioArchive::from_reader(Cursor::new(data), &cancel_signal).unwrap_err();
}

#[test]
fn iteration_is_lexicographic() {
    let archive = sample_archive();
    let paths = archive.iter().map(|(p, _)| p.to_vec()).collect::<Vec<_>>();

    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
}
