// SPDX-FileCopyrightText: 2025-2026 The rdcpio developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    env,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use anyhow::{bail, Context, Result};
use bstr::ByteSlice;
use cap_std::{ambient_authority, fs::Dir};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::{
    cli::args::Cli,
    format::{
        compression::{CompressedFormat, CompressedReader, CompressedWriter},
        cpio::{CpioArchive, CpioEntry, CpioEntryType},
    },
    patch::ramdisk,
    util,
};

/// Flag truth is the literal string `true`; anything else, including an unset
/// variable, is false.
fn check_env(name: &str) -> bool {
    env::var_os(name).is_some_and(|v| v == "true")
}

fn load_archive(
    path: &Path,
    cancel_signal: &AtomicBool,
) -> Result<(CpioArchive, CompressedFormat)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Treating missing archive {path:?} as empty");
            return Ok((CpioArchive::new(), CompressedFormat::None));
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open for reading: {path:?}"));
        }
    };

    let reader = CompressedReader::new(BufReader::new(file), true)
        .with_context(|| format!("Failed to open decompressor: {path:?}"))?;
    let format = reader.format();

    debug!("Detected {format:?} compression: {path:?}");

    let archive = CpioArchive::from_reader(reader, cancel_signal)
        .with_context(|| format!("Failed to read cpio: {path:?}"))?;

    Ok((archive, format))
}

/// Serialize the archive, re-applying the compression format detected at
/// load. The data is written to a temporary file next to the target and
/// renamed over it, so a failed dump never truncates the original.
fn save_archive(
    path: &Path,
    archive: &mut CpioArchive,
    format: CompressedFormat,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    archive
        .assign_inodes()
        .context("Failed to assign inodes")?;

    let mut temp = NamedTempFile::new_in(util::parent_path(path))
        .context("Failed to create temporary archive")?;

    let mut writer = CompressedWriter::new(BufWriter::new(temp.as_file_mut()), format)
        .with_context(|| format!("Failed to open compressor: {path:?}"))?;
    archive
        .to_writer(&mut writer, false, cancel_signal)
        .with_context(|| format!("Failed to write cpio: {path:?}"))?;

    let buf_writer = writer.finish().context("Failed to flush compressor")?;
    buf_writer
        .into_inner()
        .map_err(|_| anyhow::anyhow!("Failed to flush archive"))?;

    temp.persist(path)
        .with_context(|| format!("Failed to replace archive: {path:?}"))?;

    Ok(())
}

#[cfg(unix)]
fn permissions_from_mode(mode: u16) -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;

    std::fs::Permissions::from_mode(u32::from(mode & 0o7777))
}

/// Extract every entry into the current working directory. All writes go
/// through a capability-scoped handle so that entries cannot escape the tree.
fn extract_all(archive: &CpioArchive) -> Result<()> {
    let authority = ambient_authority();
    let tree =
        Dir::open_ambient_dir(".", authority).context("Failed to open working directory")?;

    for (path, entry) in archive.iter() {
        let rel = path
            .as_bstr()
            .to_path()
            .with_context(|| format!("Invalid entry path: {:?}", path.as_bstr()))?;

        debug!("Extracting {:?}", path.as_bstr());

        match entry.file_type {
            CpioEntryType::Directory => {
                tree.create_dir_all(rel)
                    .with_context(|| format!("Failed to create directory: {rel:?}"))?;

                #[cfg(unix)]
                tree.set_permissions(
                    rel,
                    cap_std::fs::Permissions::from_std(permissions_from_mode(entry.file_mode)),
                )
                .with_context(|| format!("Failed to set permissions: {rel:?}"))?;
            }
            CpioEntryType::Regular => {
                let parent = util::parent_path(rel);
                tree.create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {parent:?}"))?;

                let mut writer = tree
                    .create(rel)
                    .map(|f| f.into_std())
                    .with_context(|| format!("Failed to open for writing: {rel:?}"))?;
                writer
                    .write_all(&entry.data)
                    .with_context(|| format!("Failed to write file: {rel:?}"))?;

                #[cfg(unix)]
                tree.set_permissions(
                    rel,
                    cap_std::fs::Permissions::from_std(permissions_from_mode(entry.file_mode)),
                )
                .with_context(|| format!("Failed to set permissions: {rel:?}"))?;
            }
            CpioEntryType::Symlink => {
                #[cfg(unix)]
                {
                    let target = entry
                        .data
                        .as_bstr()
                        .to_path()
                        .with_context(|| format!("Invalid link target: {:?}", entry.data.as_bstr()))?;

                    tree.symlink(target, rel)
                        .with_context(|| format!("Failed to create symlink: {rel:?}"))?;
                }

                #[cfg(not(unix))]
                warn!("Skipping symlink on this platform: {:?}", path.as_bstr());
            }
            t => {
                debug!("Skipping {t} entry: {:?}", path.as_bstr());
            }
        }
    }

    Ok(())
}

/// Extract a single entry to a host path.
fn extract_entry(archive: &CpioArchive, path: &[u8], out: &Path) -> Result<()> {
    let entry = archive
        .get(path)
        .with_context(|| format!("Path does not exist in archive: {:?}", path.as_bstr()))?;

    debug!("Extracting {:?} to {out:?}", path.as_bstr());

    match entry.file_type {
        CpioEntryType::Directory => {
            fs::create_dir_all(out)
                .with_context(|| format!("Failed to create directory: {out:?}"))?;
        }
        CpioEntryType::Regular => {
            fs::write(out, &entry.data)
                .with_context(|| format!("Failed to write file: {out:?}"))?;

            #[cfg(unix)]
            fs::set_permissions(out, permissions_from_mode(entry.file_mode))
                .with_context(|| format!("Failed to set permissions: {out:?}"))?;
        }
        CpioEntryType::Symlink => {
            #[cfg(unix)]
            {
                use std::os::unix::ffi::OsStrExt;

                let target = std::ffi::OsStr::from_bytes(&entry.data);

                // A leftover file at the output path would make symlink fail.
                let _ = fs::remove_file(out);
                std::os::unix::fs::symlink(target, out)
                    .with_context(|| format!("Failed to create symlink: {out:?}"))?;
            }

            #[cfg(not(unix))]
            bail!("Symlinks are not supported on this platform: {out:?}");
        }
        t => bail!("Cannot extract {t} entry: {:?}", path.as_bstr()),
    }

    Ok(())
}

fn parse_mode(token: &str) -> Result<u16> {
    u16::from_str_radix(token, 8).with_context(|| format!("Invalid octal mode: {token:?}"))
}

/// Run each command string against the archive, then serialize it back to its
/// original path. `test`, `exists`, and `extract` terminate the run without
/// serializing; their exit codes carry the result.
pub fn cpio_main(cli: &Cli, cancel_signal: &AtomicBool) -> Result<u8> {
    let (mut archive, format) = load_archive(&cli.archive, cancel_signal)?;

    for raw in &cli.commands {
        let tokens = raw
            .split(' ')
            .filter(|t| !t.is_empty())
            .take(6)
            .collect::<Vec<_>>();

        match tokens.as_slice() {
            [] => continue,
            [first, ..] if first.starts_with('#') => continue,
            ["test"] => return Ok(ramdisk::test(&archive)),
            ["restore"] => ramdisk::restore(&mut archive),
            ["patch"] => {
                let keep_verity = check_env("KEEPVERITY");
                let keep_force_encrypt = check_env("KEEPFORCEENCRYPT");

                ramdisk::patch(&mut archive, keep_verity, keep_force_encrypt);
            }
            ["exists", path] => return Ok(u8::from(!archive.contains(path.as_bytes()))),
            ["backup", origin] => {
                ramdisk::backup(&mut archive, Path::new(origin), cancel_signal)
                    .with_context(|| format!("Failed to back up against: {origin:?}"))?;
            }
            ["rm", path] => {
                let n = archive.remove(path.as_bytes(), false);
                debug!("Removed {n} entry at {path:?}");
            }
            ["rm", "-r", path] => {
                let n = archive.remove(path.as_bytes(), true);
                debug!("Removed {n} entries under {path:?}");
            }
            ["mv", src, dst] => {
                if archive.rename(src.as_bytes(), dst.as_bytes()) {
                    debug!("Moved {src:?} to {dst:?}");
                } else {
                    warn!("Cannot find entry {src:?}");
                }
            }
            ["extract"] => {
                extract_all(&archive)?;
                return Ok(0);
            }
            ["extract", path, out] => {
                extract_entry(&archive, path.as_bytes(), Path::new(out))?;
                return Ok(0);
            }
            ["mkdir", mode, path] => {
                debug!("Creating directory {path:?}");
                archive.insert(
                    path.as_bytes().to_vec(),
                    CpioEntry::new_directory(parse_mode(mode)?),
                )?;
            }
            ["ln", target, link] => {
                debug!("Creating symlink {link:?} -> {target:?}");
                archive.insert(
                    link.as_bytes().to_vec(),
                    CpioEntry::new_symlink(target.as_bytes()),
                )?;
            }
            ["add", mode, path, file] => {
                let data = fs::read(file)
                    .with_context(|| format!("Failed to read payload: {file:?}"))?;

                debug!("Adding {path:?} ({} bytes)", data.len());
                archive.insert(
                    path.as_bytes().to_vec(),
                    CpioEntry::new_file(parse_mode(mode)?, data),
                )?;
            }
            _ => bail!("Unknown command: {raw:?}"),
        }
    }

    save_archive(&cli.archive, &mut archive, format, cancel_signal)?;

    Ok(0)
}
