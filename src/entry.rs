//! Canonical representation of a single watched filesystem object (§3, §4.3).

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MTIME_FORMAT: &str = "%Y/%m/%d-%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: String,
    pub content_hash: [u8; 32],
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path
            && self.kind == other.kind
            && self.size == other.size
            && self.mtime == other.mtime
            && self.content_hash == other.content_hash
    }
}
impl Eq for Entry {}

impl Entry {
    /// Build an Entry for `abs`, an absolute path somewhere under `root`.
    pub fn scan(root: &Path, abs: &Path) -> io::Result<Entry> {
        let metadata = fs::symlink_metadata(abs)?;
        let relative_path = relative_slash_path(root, abs);

        if metadata.is_dir() {
            let mtime = format_mtime(metadata.modified()?);
            let content_hash = hash_directory(&relative_path, &mtime);
            Ok(Entry { relative_path, kind: EntryKind::Directory, size: 0, mtime, content_hash })
        } else {
            let mtime = format_mtime(metadata.modified()?);
            let content_hash = hash_file(abs)?;
            Ok(Entry {
                relative_path,
                kind: EntryKind::File,
                size: metadata.len(),
                mtime,
                content_hash,
            })
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    /// Set `path`'s mtime on disk to the canonical form carried by this entry
    /// (or an explicit string, for restores where the entry's own mtime applies).
    pub fn apply_mtime(path: &Path, mtime: &str) -> io::Result<()> {
        let parsed = parse_mtime(mtime)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed mtime"))?;
        let ft = FileTime::from_system_time(parsed.into());
        filetime::set_file_times(path, ft, ft)
    }
}

/// `root`-relative, forward-slash, no-trailing-slash path.
fn relative_slash_path(root: &Path, abs: &Path) -> String {
    let rel = abs.strip_prefix(root).unwrap_or(abs);
    let mut s = rel.to_string_lossy().replace('\\', "/");
    while s.ends_with('/') {
        s.pop();
    }
    s
}

fn format_mtime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format(MTIME_FORMAT).to_string()
}

fn parse_mtime(s: &str) -> Option<SystemTime> {
    let naive = NaiveDateTime::parse_from_str(s, MTIME_FORMAT).ok()?;
    let dt = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);
    Some(SystemTime::from(dt))
}

fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

fn hash_directory(relative_path: &str, mtime: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(relative_path.as_bytes());
    hasher.update(mtime.as_bytes());
    hasher.finalize().into()
}

/// Hex-encode a content hash the way both catalogs store it on disk.
pub fn hash_to_hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn hash_from_hex(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in out.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_file_hashes_content() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("a.txt");
        fs::write(&f, b"hello").unwrap();

        let entry = Entry::scan(dir.path(), &f).unwrap();
        assert_eq!(entry.relative_path, "a.txt");
        assert!(entry.is_file());
        assert_eq!(entry.size, 5);

        let mut hasher = Sha256::new();
        hasher.update(b"hello");
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(entry.content_hash, expected);
    }

    #[test]
    fn scan_directory_hashes_path_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        let entry = Entry::scan(dir.path(), &sub).unwrap();
        assert!(entry.is_directory());
        assert_eq!(entry.content_hash, hash_directory("sub", &entry.mtime));
    }

    #[test]
    fn hex_roundtrip() {
        let hash = [7u8; 32];
        let hex = hash_to_hex(&hash);
        assert_eq!(hash_from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn equality_is_field_wise() {
        let a = Entry {
            relative_path: "x".into(),
            kind: EntryKind::File,
            size: 1,
            mtime: "2024/01/02-03:04:05".into(),
            content_hash: [0u8; 32],
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.size = 2;
        assert_ne!(a, b);
    }
}
