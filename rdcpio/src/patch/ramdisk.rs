// SPDX-FileCopyrightText: 2025-2026 The rdcpio developers
// SPDX-License-Identifier: GPL-3.0-only

//! The four archive-level operations: patch, test, backup, restore. These
//! mutate a loaded [`CpioArchive`]; loading and re-serializing the archive
//! file is the dispatcher's job.

use std::{
    cmp::Ordering,
    fs::File,
    io::{self, BufReader},
    path::Path,
    sync::atomic::AtomicBool,
};

use bstr::ByteSlice;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    format::{
        compression::{self, CompressedReader},
        cpio::{self, CpioArchive, CpioEntry, CpioEntryType},
    },
    patch::fstab,
};

/// The archive contains the framework's additions.
pub const MAGISK_PATCHED: u8 = 1 << 0;
/// The archive contains another root framework and cannot be patched.
pub const UNSUPPORTED_CPIO: u8 = 1 << 1;
/// The archive uses Sony's two-stage init.
pub const SONY_INIT: u8 = 1 << 2;

const UNSUPPORTED_LIST: &[&[u8]] = &[
    b"sbin/launch_daemonsu.sh",
    b"sbin/su",
    b"init.xposed.rc",
    b"boot/sbin/launch_daemonsu.sh",
];

const MAGISK_LIST: &[&[u8]] = &[
    b".backup/.magisk",
    b"init.magisk.rc",
    b"overlay/init.magisk.rc",
];

const BACKUP_DIR: &[u8] = b".backup";
const BACKUP_PREFIX: &[u8] = b".backup/";
const BACKUP_RMLIST: &[u8] = b".backup/.rmlist";
const BACKUP_MAGISK: &[u8] = b".backup/.magisk";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Compression error")]
    Compression(#[from] compression::Error),
    #[error("CPIO error")]
    Cpio(#[from] cpio::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Strip verity and forced-encryption state from the archive. Every regular
/// file whose path contains `fstab` (but is not a backup, TWRP, or recovery
/// file) is rewritten in place; the `verity_key` entry is dropped. Each flag
/// is a no-op when the caller asks to keep the corresponding state.
pub fn patch(archive: &mut CpioArchive, keep_verity: bool, keep_force_encrypt: bool) {
    info!(
        "Patching with KEEPVERITY=[{keep_verity}] KEEPFORCEENCRYPT=[{keep_force_encrypt}]",
    );

    archive.retain(|path, entry| {
        let fstab_candidate = (!keep_verity || !keep_force_encrypt)
            && entry.file_type == CpioEntryType::Regular
            && !path.starts_with(BACKUP_DIR)
            && !path.contains_str(b"twrp")
            && !path.contains_str(b"recovery")
            && path.contains_str(b"fstab");

        if !keep_verity {
            if fstab_candidate {
                info!("Found fstab file {:?}", path.as_bstr());
                fstab::patch_verity(&mut entry.data);
            } else if path == b"verity_key" {
                debug!("Removing {:?}", path.as_bstr());
                return false;
            }
        }

        if !keep_force_encrypt && fstab_candidate {
            fstab::patch_encryption(&mut entry.data);
        }

        true
    });
}

/// Classify the archive. Returns [`UNSUPPORTED_CPIO`] alone if another root
/// framework is present; otherwise ORs [`MAGISK_PATCHED`] and [`SONY_INIT`]
/// as applicable.
pub fn test(archive: &CpioArchive) -> u8 {
    for path in UNSUPPORTED_LIST {
        if archive.contains(path) {
            return UNSUPPORTED_CPIO;
        }
    }

    let mut status = 0;

    for path in MAGISK_LIST {
        if archive.contains(path) {
            status |= MAGISK_PATCHED;
            break;
        }
    }

    if archive.contains(b"init.real") {
        status |= SONY_INIT;
    }

    status
}

/// Load the reference archive for [`backup`]. A reference that cannot be
/// opened is treated as empty; a reference that opens but cannot be parsed is
/// a fatal error.
fn load_reference(path: &Path, cancel_signal: &AtomicBool) -> Result<CpioArchive> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            debug!("Treating unreadable reference archive {path:?} as empty: {e}");
            return Ok(CpioArchive::new());
        }
    };

    let reader = CompressedReader::new(BufReader::new(file), true)?;
    let archive = CpioArchive::from_reader(reader, cancel_signal)?;

    Ok(archive)
}

/// Record, under `.backup/`, everything needed to undo the differences
/// between the reference archive at `origin` and the current archive:
/// entries missing or changed in the current archive move (without copying
/// their data) from the reference into `.backup/<path>`, and paths that only
/// exist in the current archive are listed in `.backup/.rmlist` as
/// NUL-terminated strings. The `.backup/.magisk` sentinel is written by the
/// installer, not here.
pub fn backup(
    archive: &mut CpioArchive,
    origin: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut reference = load_reference(origin, cancel_signal)?;

    // Stale state from prior runs.
    reference.remove(BACKUP_DIR, true);
    archive.remove(BACKUP_DIR, true);

    let mut staging = CpioArchive::new();
    staging.replace(BACKUP_DIR.to_vec(), CpioEntry::new_directory(0));

    let mut rm_list = Vec::new();

    let mut old_iter = reference.into_iter().peekable();
    let mut new_iter = archive.iter().peekable();

    loop {
        let order = match (old_iter.peek(), new_iter.peek()) {
            (Some((old_path, _)), Some((new_path, _))) => old_path.as_slice().cmp(new_path),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };

        match order {
            Ordering::Less => {
                // Missing in the current archive.
                let (path, entry) = old_iter.next().unwrap();
                debug!("Backing up missing entry {:?}", path.as_bstr());

                let mut backup_path = BACKUP_PREFIX.to_vec();
                backup_path.extend(&path);
                staging.replace(backup_path, entry);
            }
            Ordering::Equal => {
                let (path, old_entry) = old_iter.next().unwrap();
                let (_, new_entry) = new_iter.next().unwrap();

                if old_entry.data != new_entry.data {
                    debug!("Backing up mismatched entry {:?}", path.as_bstr());

                    let mut backup_path = BACKUP_PREFIX.to_vec();
                    backup_path.extend(&path);
                    staging.replace(backup_path, old_entry);
                }
            }
            Ordering::Greater => {
                // Only exists in the current archive.
                let (path, _) = new_iter.next().unwrap();
                debug!("Recording new entry {:?}", path.as_bstr());

                rm_list.extend_from_slice(path);
                rm_list.push(b'\0');
            }
        }
    }

    drop(new_iter);

    if !rm_list.is_empty() {
        staging.replace(BACKUP_RMLIST.to_vec(), CpioEntry::new_file(0, rm_list));
    }

    if staging.len() > 1 {
        archive.merge(staging);
    }

    Ok(())
}

/// Undo a previous [`backup`]: drop the sentinels, remove every path named in
/// `.backup/.rmlist`, and move each `.backup/<path>` entry back to `<path>`.
/// An archive holding only the `.backup` directory and the `.backup/.magisk`
/// sentinel was created from scratch by a buggy earlier version of this tool,
/// so it is blanked entirely.
pub fn restore(archive: &mut CpioArchive) {
    let mut has_backup_dir = false;
    let mut has_magisk = false;
    let mut has_rm_list = false;
    let mut backups = Vec::new();

    for (path, _) in archive.iter() {
        if path == BACKUP_DIR {
            has_backup_dir = true;
        } else if path == BACKUP_RMLIST {
            has_rm_list = true;
        } else if path == BACKUP_MAGISK {
            has_magisk = true;
        } else if path.starts_with(BACKUP_PREFIX) {
            backups.push(path.to_vec());
        }
    }

    if has_backup_dir && has_magisk && !has_rm_list && backups.is_empty() {
        warn!("Archive was created from scratch; removing all entries");
        archive.clear();
        return;
    }

    archive.remove(BACKUP_DIR, false);
    archive.remove(BACKUP_MAGISK, false);

    if let Some(rm_list) = archive.take(BACKUP_RMLIST) {
        // Tolerates both a trailing NUL and a missing final separator.
        for path in rm_list.data.split(|b| *b == b'\0').filter(|p| !p.is_empty()) {
            debug!("Removing {:?}", path.as_bstr());
            archive.remove(path, false);
        }
    }

    for path in backups {
        let tail = &path[BACKUP_PREFIX.len()..];
        debug!("Restoring {:?} -> {:?}", path.as_bstr(), tail.as_bstr());
        archive.rename(&path, tail);
    }
}
