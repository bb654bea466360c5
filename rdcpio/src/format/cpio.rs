// SPDX-FileCopyrightText: 2025-2026 The rdcpio developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{btree_map, BTreeMap, HashMap, HashSet},
    fmt,
    io::{self, Cursor, Read, Write},
    sync::atomic::AtomicBool,
};

use bstr::ByteSlice;
use num_traits::ToPrimitive;
use thiserror::Error;

use crate::{
    format::padding,
    stream::{self, CountingReader, CountingWriter, WriteZerosExt},
    util::NumBytes,
};

const MAGIC_NEW: &[u8; 6] = b"070701";
const MAGIC_NEW_CRC: &[u8; 6] = b"070702";

const CPIO_TRAILER: &[u8; 10] = b"TRAILER!!!";

const S_IFIFO: u32 = 0o010000;
const S_IFCHR: u32 = 0o020000;
const S_IFDIR: u32 = 0o040000;
const S_IFBLK: u32 = 0o060000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFSOCK: u32 = 0o140000;
const C_ISCTG: u32 = 0o110000;

const IO_BLOCK_SIZE: u64 = 512;

/// The threshold when reading data where memory allocation switches from
/// allocating the exact size to resizing as necessary.
const VEC_CAP_THRESHOLD: usize = 16384;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 6]),
    #[error("Hard links are not supported: {:?}", .0.as_bstr())]
    HardLinksNotSupported(Vec<u8>),
    #[error("Entry of type {0} should not have data: {path:?}", path = .1.as_bstr())]
    EntryHasData(CpioEntryType, Vec<u8>),
    #[error("Path already exists: {:?}", .0.as_bstr())]
    PathExists(Vec<u8>),
    #[error("No inodes available for device {0:x},{1:x}")]
    DeviceFull(u32, u32),
    #[error("{0:?} overflowed integer bounds during calculations")]
    IntOverflow(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Read u32 formatted as an ASCII 8-char wide hex string.
fn read_int(mut reader: impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;

    let mut value = 0;

    for b in buf {
        let c = b as char;
        let digit = c.to_digit(16).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{:?}: Invalid hex char: {c}", buf.as_bstr()),
            )
        })?;

        value <<= 4;
        value |= digit;
    }

    Ok(value)
}

/// Write u32 formatted as an ASCII 8-char wide hex string.
fn write_int(mut writer: impl Write, mut value: u32) -> io::Result<()> {
    let mut buf = [b'0'; 8];

    for b in buf.iter_mut().rev() {
        if value == 0 {
            break;
        }

        *b = char::from_digit(value & 0xf, 16).unwrap() as u8;
        value >>= 4;
    }

    writer.write_all(&buf)
}

/// Read a chunk of bytes from the reader. If `size` is less than
/// [`VEC_CAP_THRESHOLD`], then the buffer is allocated with the exact size.
/// Otherwise, the buffer starts with a capacity of [`VEC_CAP_THRESHOLD`] and
/// grows as necessary. This avoids allocating excessive memory when the header
/// specifies an excessively large value that's not backed by actual data.
fn read_data(reader: impl Read, size: usize, cancel_signal: &AtomicBool) -> io::Result<Vec<u8>> {
    let buf = Vec::with_capacity(size.min(VEC_CAP_THRESHOLD));
    let mut cursor = Cursor::new(buf);

    stream::copy_n(reader, &mut cursor, size as u64, cancel_signal)?;

    Ok(cursor.into_inner())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpioEntryType {
    Pipe,
    Char,
    Directory,
    Block,
    Regular,
    Symlink,
    Socket,
    Reserved,
    Unknown(u16),
}

impl CpioEntryType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            S_IFIFO => Self::Pipe,
            S_IFCHR => Self::Char,
            S_IFDIR => Self::Directory,
            S_IFBLK => Self::Block,
            S_IFREG => Self::Regular,
            S_IFLNK => Self::Symlink,
            S_IFSOCK => Self::Socket,
            C_ISCTG => Self::Reserved,
            m => Self::Unknown(m as u16),
        }
    }

    pub fn to_mode(self) -> u32 {
        match self {
            Self::Pipe => S_IFIFO,
            Self::Char => S_IFCHR,
            Self::Directory => S_IFDIR,
            Self::Block => S_IFBLK,
            Self::Regular => S_IFREG,
            Self::Symlink => S_IFLNK,
            Self::Socket => S_IFSOCK,
            Self::Reserved => C_ISCTG,
            Self::Unknown(m) => m.into(),
        }
    }
}

impl fmt::Display for CpioEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe => write!(f, "pipe"),
            Self::Char => write!(f, "character device"),
            Self::Directory => write!(f, "directory"),
            Self::Block => write!(f, "block device"),
            Self::Regular => write!(f, "regular file"),
            Self::Symlink => write!(f, "symbolic link"),
            Self::Socket => write!(f, "socket"),
            Self::Reserved => write!(f, "reserved"),
            Self::Unknown(m) => write!(f, "unknown ({m:o})"),
        }
    }
}

impl Default for CpioEntryType {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

/// A single archive member. The path is not part of the entry; it is the key
/// under which the entry lives in a [`CpioArchive`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CpioEntry {
    /// File data. For [`CpioEntryType::Symlink`] entries, this is the link
    /// target. Directories and special files have no data.
    pub data: Vec<u8>,

    /// Inode number. Entries with inode 0 are assigned a fresh inode when the
    /// archive is serialized.
    pub inode: u32,

    /// File type portion of the `st_mode`-style mode.
    pub file_type: CpioEntryType,

    /// Permissions portion of the `st_mode`-style mode.
    pub file_mode: u16,

    /// Owner user ID.
    pub uid: u32,

    /// Owner group ID.
    pub gid: u32,

    /// Number of paths referencing the inode.
    pub nlink: u32,

    /// Modification timestamp in Unix time.
    pub mtime: u32,

    /// Major ID (class of device) for the device containing the inode.
    pub dev_maj: u32,

    /// Minor ID (specific device instance) for the device containing the
    /// inode.
    pub dev_min: u32,

    /// Major ID (class of device) represented by this entry. This is only
    /// relevant for [`CpioEntryType::Char`] and [`CpioEntryType::Block`].
    pub rdev_maj: u32,

    /// Minor ID (specific device instance) represented by this entry. This is
    /// only relevant for [`CpioEntryType::Char`] and [`CpioEntryType::Block`].
    pub rdev_min: u32,

    /// CRC32 checksum. Entries with a non-zero checksum serialize with the
    /// `070702` magic.
    pub crc32: u32,
}

impl fmt::Debug for CpioEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpioEntry")
            .field("data", &NumBytes(self.data.len()))
            .field("inode", &self.inode)
            .field("file_type", &self.file_type)
            .field("file_mode", &self.file_mode)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("nlink", &self.nlink)
            .field("mtime", &self.mtime)
            .field("dev_maj", &self.dev_maj)
            .field("dev_min", &self.dev_min)
            .field("rdev_maj", &self.rdev_maj)
            .field("rdev_min", &self.rdev_min)
            .field("crc32", &self.crc32)
            .finish()
    }
}

impl CpioEntry {
    pub fn new_symlink(link_target: &[u8]) -> Self {
        Self {
            data: link_target.to_owned(),
            file_type: CpioEntryType::Symlink,
            file_mode: 0o777,
            nlink: 1,
            ..Default::default()
        }
    }

    pub fn new_directory(mode: u16) -> Self {
        Self {
            file_type: CpioEntryType::Directory,
            file_mode: mode,
            nlink: 1,
            ..Default::default()
        }
    }

    pub fn new_file(mode: u16, data: Vec<u8>) -> Self {
        Self {
            data,
            file_type: CpioEntryType::Regular,
            file_mode: mode,
            nlink: 1,
            ..Default::default()
        }
    }
}

/// Streaming reader for a newc-format cpio stream. Yields `(path, entry)`
/// pairs until the trailer record is reached.
pub struct CpioReader<R: Read> {
    reader: R,
    done: bool,
}

impl<R: Read> CpioReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn next_entry(
        &mut self,
        cancel_signal: &AtomicBool,
    ) -> Result<Option<(Vec<u8>, CpioEntry)>> {
        if self.done {
            return Ok(None);
        }

        stream::check_cancel(cancel_signal)?;

        let mut reader = CountingReader::new(&mut self.reader);

        // Tolerate a stream that ends cleanly without a trailer record.
        let mut magic = [0u8; 6];
        let n = reader.read(&mut magic)?;
        if n == 0 {
            self.done = true;
            return Ok(None);
        }
        reader.read_exact(&mut magic[n..])?;

        if magic != *MAGIC_NEW && magic != *MAGIC_NEW_CRC {
            return Err(Error::UnknownMagic(magic));
        }

        let inode = read_int(&mut reader)?;
        let mode = read_int(&mut reader)?;
        let uid = read_int(&mut reader)?;
        let gid = read_int(&mut reader)?;
        let nlink = read_int(&mut reader)?;
        let mtime = read_int(&mut reader)?;
        let file_size = read_int(&mut reader)?;
        let dev_maj = read_int(&mut reader)?;
        let dev_min = read_int(&mut reader)?;
        let rdev_maj = read_int(&mut reader)?;
        let rdev_min = read_int(&mut reader)?;
        let path_size = read_int(&mut reader)?;
        let crc32 = read_int(&mut reader)?;

        let mut path = read_data(&mut reader, path_size.to_usize().unwrap(), cancel_signal)?;
        if path.last() != Some(&b'\0') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Filename is not NULL-terminated",
            )
            .into());
        }
        path.pop();
        padding::read_discard(&mut reader, 4)?;

        if path == CPIO_TRAILER {
            self.done = true;
            return Ok(None);
        }

        let file_type = CpioEntryType::from_mode(mode);
        let data = match file_type {
            CpioEntryType::Regular | CpioEntryType::Symlink => {
                let content =
                    read_data(&mut reader, file_size.to_usize().unwrap(), cancel_signal)?;
                padding::read_discard(&mut reader, 4)?;

                content
            }
            // No other entry type should have data.
            t if file_size != 0 => return Err(Error::EntryHasData(t, path)),
            _ => vec![],
        };

        let entry = CpioEntry {
            data,
            inode,
            file_type,
            file_mode: (mode & 0o7777) as u16,
            uid,
            gid,
            nlink,
            mtime,
            dev_maj,
            dev_min,
            rdev_maj,
            rdev_min,
            crc32,
        };

        Ok(Some((path, entry)))
    }
}

/// Streaming writer for a newc-format cpio stream. The trailer record is
/// written by [`CpioWriter::finish`].
pub struct CpioWriter<W: Write> {
    writer: CountingWriter<W>,
    pad_to_block_size: bool,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(writer: W, pad_to_block_size: bool) -> Self {
        Self {
            writer: CountingWriter::new(writer),
            pad_to_block_size,
        }
    }

    pub fn write_entry(&mut self, path: &[u8], entry: &CpioEntry) -> Result<()> {
        // Padding is relative to the entry start, which is always 4-byte
        // aligned in the outer stream.
        let mut writer = CountingWriter::new(&mut self.writer);

        let path_size = path
            .len()
            .checked_add(1)
            .and_then(|s| s.to_u32())
            .ok_or(Error::IntOverflow("path_size"))?;

        let file_size = entry
            .data
            .len()
            .to_u32()
            .ok_or(Error::IntOverflow("file_size"))?;
        if file_size != 0
            && entry.file_type != CpioEntryType::Regular
            && entry.file_type != CpioEntryType::Symlink
        {
            return Err(Error::EntryHasData(entry.file_type, path.to_vec()));
        }

        if entry.crc32 == 0 {
            writer.write_all(MAGIC_NEW)?;
        } else {
            writer.write_all(MAGIC_NEW_CRC)?;
        }

        let mode = entry.file_type.to_mode() | u32::from(entry.file_mode & 0o7777);

        write_int(&mut writer, entry.inode)?;
        write_int(&mut writer, mode)?;
        write_int(&mut writer, entry.uid)?;
        write_int(&mut writer, entry.gid)?;
        write_int(&mut writer, entry.nlink)?;
        write_int(&mut writer, entry.mtime)?;
        write_int(&mut writer, file_size)?;
        write_int(&mut writer, entry.dev_maj)?;
        write_int(&mut writer, entry.dev_min)?;
        write_int(&mut writer, entry.rdev_maj)?;
        write_int(&mut writer, entry.rdev_min)?;
        write_int(&mut writer, path_size)?;
        write_int(&mut writer, entry.crc32)?;

        writer.write_all(path)?;
        writer.write_zeros_exact(1)?;
        padding::write_zeros(&mut writer, 4)?;

        if !entry.data.is_empty() {
            writer.write_all(&entry.data)?;
            padding::write_zeros(&mut writer, 4)?;
        }

        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        let trailer = CpioEntry {
            // Must be 1 for CRC format.
            nlink: 1,
            ..Default::default()
        };
        self.write_entry(CPIO_TRAILER, &trailer)?;

        // Pad until the end of the block.
        if self.pad_to_block_size {
            padding::write_zeros(&mut self.writer, IO_BLOCK_SIZE)?;
        }

        Ok(self.writer.finish().0)
    }
}

/// An in-memory cpio archive: an ordered mapping from path to entry. Paths are
/// slash-separated byte strings without a leading slash and iteration is
/// always in lexicographic path order, which is also the serialization order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpioArchive {
    entries: BTreeMap<Vec<u8>, CpioEntry>,
}

impl CpioArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_reader(reader: impl Read, cancel_signal: &AtomicBool) -> Result<Self> {
        let mut cpio_reader = CpioReader::new(reader);
        let mut archive = Self::new();

        while let Some((path, entry)) = cpio_reader.next_entry(cancel_signal)? {
            if entry.file_type != CpioEntryType::Directory && entry.nlink > 1 {
                return Err(Error::HardLinksNotSupported(path));
            }

            archive.entries.insert(path, entry);
        }

        Ok(archive)
    }

    pub fn to_writer(
        &self,
        writer: impl Write,
        pad_to_block_size: bool,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let mut cpio_writer = CpioWriter::new(writer, pad_to_block_size);

        for (path, entry) in &self.entries {
            stream::check_cancel(cancel_signal)?;

            cpio_writer.write_entry(path, entry)?;
        }

        cpio_writer.finish()?;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &[u8]) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &[u8]) -> Option<&CpioEntry> {
        self.entries.get(path)
    }

    /// Insert a new entry. Inserting over an existing path is an error;
    /// callers that want replace semantics use [`CpioArchive::rename`] or
    /// remove the old entry first.
    pub fn insert(&mut self, path: Vec<u8>, entry: CpioEntry) -> Result<()> {
        match self.entries.entry(path) {
            btree_map::Entry::Vacant(e) => {
                e.insert(entry);
                Ok(())
            }
            btree_map::Entry::Occupied(e) => Err(Error::PathExists(e.key().clone())),
        }
    }

    /// Insert an entry, replacing any existing entry at the same path.
    pub fn replace(&mut self, path: Vec<u8>, entry: CpioEntry) {
        self.entries.insert(path, entry);
    }

    /// Remove `path`. With `recursive`, also remove every entry whose path
    /// begins with `path + "/"`. Returns the number of entries removed.
    pub fn remove(&mut self, path: &[u8], recursive: bool) -> usize {
        if recursive {
            let mut prefix = path.to_vec();
            prefix.push(b'/');

            let before = self.entries.len();
            self.entries
                .retain(|p, _| p.as_slice() != path && !p.starts_with(&prefix));

            before - self.entries.len()
        } else {
            usize::from(self.entries.remove(path).is_some())
        }
    }

    /// Remove and return the entry at `path`.
    pub fn take(&mut self, path: &[u8]) -> Option<CpioEntry> {
        self.entries.remove(path)
    }

    /// Rename `src` to `dst`, overwriting any existing entry at `dst`.
    /// Returns false if `src` does not exist.
    pub fn rename(&mut self, src: &[u8], dst: &[u8]) -> bool {
        match self.entries.remove(src) {
            Some(entry) => {
                self.entries.insert(dst.to_vec(), entry);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &CpioEntry)> + '_ {
        self.entries.iter().map(|(p, e)| (p.as_slice(), e))
    }

    /// Visit every entry in lexicographic path order, dropping those for
    /// which `f` returns false. This is the advance-then-maybe-delete
    /// iteration used by the patch operation.
    pub fn retain(&mut self, mut f: impl FnMut(&[u8], &mut CpioEntry) -> bool) {
        self.entries.retain(|p, e| f(p, e));
    }

    /// Move all entries from `other` into this archive. On path collision the
    /// incoming entry wins.
    pub fn merge(&mut self, other: CpioArchive) {
        self.entries.extend(other.entries);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Assign inodes to entries that have none (inode 0). New inodes are
    /// allocated starting immediately after the highest existing inode for
    /// the entry's ([`CpioEntry::dev_maj`], [`CpioEntry::dev_min`]) pair, or
    /// at 300000 for devices with no inodes yet. Existing inodes are left
    /// untouched so that a loaded archive re-serializes byte-identically.
    pub fn assign_inodes(&mut self) -> Result<()> {
        fn next_non_zero(i: u32) -> u32 {
            if i == u32::MAX {
                1
            } else {
                i.wrapping_add(1)
            }
        }

        // (dev maj, dev min) -> (inode set, last assigned inode)
        let mut inodes: HashMap<(u32, u32), (HashSet<u32>, u32)> = HashMap::new();

        for entry in self.entries.values() {
            if entry.inode != 0 {
                let key = (entry.dev_maj, entry.dev_min);
                let (set, last) = inodes.entry(key).or_default();

                set.insert(entry.inode);
                *last = (*last).max(entry.inode);
            }
        }

        for entry in self.entries.values_mut() {
            if entry.inode == 0 {
                let key = (entry.dev_maj, entry.dev_min);
                let (set, last) = inodes
                    .entry(key)
                    .or_insert_with(|| (HashSet::new(), 299999));

                let mut unused = next_non_zero(*last);

                while set.contains(&unused) {
                    if unused == *last {
                        return Err(Error::DeviceFull(entry.dev_maj, entry.dev_min));
                    }

                    unused = next_non_zero(unused);
                }

                entry.inode = unused;
                set.insert(unused);
                *last = unused;
            }
        }

        Ok(())
    }
}

impl IntoIterator for CpioArchive {
    type Item = (Vec<u8>, CpioEntry);
    type IntoIter = btree_map::IntoIter<Vec<u8>, CpioEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{CpioArchive, CpioEntry, Error};

    fn archive_with(paths: &[&[u8]]) -> CpioArchive {
        let mut archive = CpioArchive::new();

        for path in paths {
            archive
                .insert(path.to_vec(), CpioEntry::new_file(0o644, vec![]))
                .unwrap();
        }

        archive
    }

    #[test]
    fn insert_existing_path() {
        let mut archive = archive_with(&[b"init"]);

        let err = archive
            .insert(b"init".to_vec(), CpioEntry::new_file(0o750, vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::PathExists(p) if p == b"init"));
    }

    #[test]
    fn remove_recursive_respects_separator() {
        let mut archive = archive_with(&[b"sbin", b"sbin/su", b"sbinny"]);

        let n = archive.remove(b"sbin", true);
        assert_eq!(n, 2);
        assert!(!archive.contains(b"sbin"));
        assert!(!archive.contains(b"sbin/su"));
        assert!(archive.contains(b"sbinny"));
    }

    #[test]
    fn rename_overwrites_destination() {
        let mut archive = CpioArchive::new();
        archive
            .insert(b"a".to_vec(), CpioEntry::new_file(0o644, b"old".to_vec()))
            .unwrap();
        archive
            .insert(b"b".to_vec(), CpioEntry::new_file(0o644, b"new".to_vec()))
            .unwrap();

        assert!(archive.rename(b"b", b"a"));
        assert!(!archive.contains(b"b"));
        assert_eq!(archive.get(b"a").unwrap().data, b"new");

        assert!(!archive.rename(b"missing", b"a"));
    }

    #[test]
    fn merge_incoming_wins() {
        let mut archive = CpioArchive::new();
        archive
            .insert(b"a".to_vec(), CpioEntry::new_file(0o644, b"ours".to_vec()))
            .unwrap();

        let mut other = CpioArchive::new();
        other
            .insert(b"a".to_vec(), CpioEntry::new_file(0o644, b"theirs".to_vec()))
            .unwrap();
        other
            .insert(b"b".to_vec(), CpioEntry::new_file(0o644, vec![]))
            .unwrap();

        archive.merge(other);
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.get(b"a").unwrap().data, b"theirs");
    }

    #[test]
    fn assign_inodes_fills_missing_only() {
        let mut archive = CpioArchive::new();

        let mut existing = CpioEntry::new_file(0o644, vec![]);
        existing.inode = 300005;
        archive.insert(b"keep".to_vec(), existing).unwrap();
        archive
            .insert(b"fresh".to_vec(), CpioEntry::new_file(0o644, vec![]))
            .unwrap();

        archive.assign_inodes().unwrap();

        assert_eq!(archive.get(b"fresh").unwrap().inode, 300006);
        assert_eq!(archive.get(b"keep").unwrap().inode, 300005);
    }
}
