// SPDX-FileCopyrightText: 2025-2026 The rdcpio developers
// SPDX-License-Identifier: GPL-3.0-only

//! Rewriters for the mount-option field of fstab files. Both transforms use
//! raw substring matching over the whole blob rather than field-aware parsing;
//! this matches the established patching behavior and must not be changed.

use bstr::ByteSlice;
use tracing::debug;

/// Longest match first so that `verifyatboot` isn't consumed as `verify` and
/// `avb_keys` isn't consumed as `avb`.
const VERITY_PATTERNS: &[&[u8]] = &[
    b"verifyatboot",
    b"verify",
    b"avb_keys",
    b"avb",
    b"support_scfs",
    b"fsverity",
];

const ENCRYPT_PATTERNS: &[&[u8]] = &[b"forceencrypt", b"forcefdeorfbe"];

const ENCRYPTABLE: &[u8] = b"encryptable";

/// Match a verity mount option at the start of `buf`: an optional leading
/// comma, one of the verity flags, and an optional `=value` where the value
/// runs until a space, newline, comma, or NUL. Returns the match length.
fn match_verity(buf: &[u8]) -> Option<usize> {
    let mut skip = usize::from(buf.first() == Some(&b','));

    let pattern = VERITY_PATTERNS
        .iter()
        .find(|p| buf[skip..].starts_with(p))?;
    skip += pattern.len();

    if buf.get(skip) == Some(&b'=') {
        skip += 1;
        while matches!(buf.get(skip), Some(b) if !matches!(b, b' ' | b'\n' | b',' | b'\0')) {
            skip += 1;
        }
    }

    Some(skip)
}

/// Remove every verity mount option from the buffer. Idempotent: a buffer
/// with no remaining matches is returned unchanged.
pub fn patch_verity(data: &mut Vec<u8>) {
    let mut patched = Vec::with_capacity(data.len());
    let mut offset = 0;

    while offset < data.len() {
        if let Some(n) = match_verity(&data[offset..]) {
            debug!(
                "Removing verity option {:?}",
                data[offset..offset + n].as_bstr()
            );
            offset += n;
        } else {
            patched.push(data[offset]);
            offset += 1;
        }
    }

    *data = patched;
}

/// Downgrade forced-encryption mount options to `encryptable`, keeping any
/// `=value` suffix. Idempotent: `encryptable` matches no pattern.
pub fn patch_encryption(data: &mut Vec<u8>) {
    let mut patched = Vec::with_capacity(data.len());
    let mut offset = 0;

    while offset < data.len() {
        if let Some(pattern) = ENCRYPT_PATTERNS
            .iter()
            .find(|p| data[offset..].starts_with(p))
        {
            debug!("Replacing {:?} with {:?}", pattern.as_bstr(), ENCRYPTABLE.as_bstr());
            patched.extend_from_slice(ENCRYPTABLE);
            offset += pattern.len();
        } else {
            patched.push(data[offset]);
            offset += 1;
        }
    }

    *data = patched;
}

#[cfg(test)]
mod tests {
    use super::{patch_encryption, patch_verity};

    fn verity(input: &[u8]) -> Vec<u8> {
        let mut data = input.to_vec();
        patch_verity(&mut data);
        data
    }

    fn encryption(input: &[u8]) -> Vec<u8> {
        let mut data = input.to_vec();
        patch_encryption(&mut data);
        data
    }

    #[test]
    fn verity_flag_with_value() {
        assert_eq!(
            verity(b"/dev 0 ext4 ro,verify=1,barrier=1 0 0\n"),
            b"/dev 0 ext4 ro,barrier=1 0 0\n",
        );
    }

    #[test]
    fn verity_flag_without_value() {
        assert_eq!(verity(b"ro,verify,barrier=1"), b"ro,barrier=1");
        assert_eq!(verity(b"ro,verifyatboot"), b"ro");
    }

    #[test]
    fn verity_avb_keys_not_consumed_as_avb() {
        assert_eq!(verity(b"ro,avb_keys=/avb/q.avbpubkey,slotselect"), b"ro,slotselect");
        assert_eq!(verity(b"ro,avb=vbmeta_system,slotselect"), b"ro,slotselect");
    }

    #[test]
    fn verity_value_ends_at_whitespace() {
        assert_eq!(verity(b"wait,verify /system ext4\n"), b"wait /system ext4\n");
    }

    #[test]
    fn verity_idempotent() {
        let first = verity(b"/dev 0 ext4 ro,verify=1,barrier=1 0 0\n");
        assert_eq!(verity(&first), first);
    }

    #[test]
    fn encryption_downgrade() {
        assert_eq!(
            encryption(b"wait,check,forceencrypt=footer"),
            b"wait,check,encryptable=footer",
        );
        assert_eq!(
            encryption(b"wait,forcefdeorfbe=/dev/block/metadata"),
            b"wait,encryptable=/dev/block/metadata",
        );
    }

    #[test]
    fn encryption_idempotent() {
        let first = encryption(b"wait,forceencrypt=footer");
        assert_eq!(encryption(&first), first);
    }

    #[test]
    fn untouched_options_survive() {
        assert_eq!(encryption(b"wait,check,encryptable=footer"), b"wait,check,encryptable=footer");
        assert_eq!(verity(b"noatime,nosuid,nodev"), b"noatime,nosuid,nodev");
    }
}
