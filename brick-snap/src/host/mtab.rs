//! Mount table parsing and brick root resolution.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// One line of a mount table (`/proc/mounts`, `/etc/mtab`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device or dataset (first field)
    pub fsname: String,
    /// Mount point (second field)
    pub dir: PathBuf,
    /// Filesystem type (third field)
    pub fstype: String,
    /// Comma separated mount options (fourth field)
    pub opts: String,
}

/// Decode the octal escapes the kernel uses for whitespace and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a single mount table line. Comments and short lines yield `None`.
pub fn parse_mount_line(line: &str) -> Option<MountEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let fsname = fields.next()?;
    let dir = fields.next()?;
    let fstype = fields.next()?;
    let opts = fields.next().unwrap_or("defaults");

    Some(MountEntry {
        fsname: unescape(fsname),
        dir: PathBuf::from(unescape(dir)),
        fstype: fstype.to_string(),
        opts: opts.to_string(),
    })
}

/// Parse the whole mount table.
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents.lines().filter_map(parse_mount_line).collect()
}

/// Find the entry mounted at `dir`.
///
/// When several filesystems are stacked on the same directory the last one
/// listed is the visible one.
pub fn find_entry<'a>(entries: &'a [MountEntry], dir: &Path) -> Option<&'a MountEntry> {
    entries.iter().rev().find(|entry| entry.dir == dir)
}

/// Walk up from `path` until the device id changes; the last directory on
/// the starting device is the mount root.
pub fn find_mount_root(path: &Path) -> io::Result<PathBuf> {
    let mut current = fs::canonicalize(path)?;
    let device = fs::metadata(&current)?.dev();

    while let Some(parent) = current.parent() {
        if fs::metadata(parent)?.dev() != device {
            break;
        }
        current = parent.to_path_buf();
    }

    Ok(current)
}
