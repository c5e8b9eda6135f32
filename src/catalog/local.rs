//! Client-side catalog: one row per watched path for this device (§4.3).
//! Schema matches `savedFiles` bit-exact (§6.2).

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::entry::{hash_from_hex, hash_to_hex, Entry, EntryKind};
use crate::error::CatalogError;

pub struct LocalCatalog {
    conn: Mutex<Connection>,
}

impl LocalCatalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(CatalogError::Open)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS savedFiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT UNIQUE NOT NULL,
                size INTEGER NOT NULL,
                type TEXT NOT NULL,
                lastWriteTime TEXT NOT NULL,
                hash TEXT NOT NULL
            )",
            [],
        )
        .map_err(CatalogError::Schema)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn insert(&self, entry: &Entry) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO savedFiles (path, size, type, lastWriteTime, hash)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                size = excluded.size, type = excluded.type,
                lastWriteTime = excluded.lastWriteTime, hash = excluded.hash",
            params![
                entry.relative_path,
                entry.size,
                kind_str(entry.kind),
                entry.mtime,
                hash_to_hex(&entry.content_hash),
            ],
        )
        .map_err(CatalogError::Write)?;
        Ok(())
    }

    /// Alias for `insert`: the schema's `ON CONFLICT` makes insert and
    /// update the same statement, matching the original's upsert-by-path
    /// behavior even though it exposed them as two methods.
    pub fn update(&self, entry: &Entry) -> Result<(), CatalogError> {
        self.insert(entry)
    }

    pub fn get(&self, relative_path: &str) -> Result<Option<Entry>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT path, size, type, lastWriteTime, hash FROM savedFiles WHERE path = ?1",
                params![relative_path],
                row_to_entry,
            )
            .optional()
            .map_err(CatalogError::Read)?;
        Ok(row)
    }

    pub fn remove(&self, relative_path: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM savedFiles WHERE path = ?1", params![relative_path])
            .map_err(CatalogError::Write)?;
        Ok(())
    }

    /// Removes every row whose path is `dir` or nested under it (directory
    /// removal cascades to its descendants, §4.6).
    pub fn remove_subtree(&self, dir: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        let prefix = format!("{dir}/%");
        conn.execute(
            "DELETE FROM savedFiles WHERE path = ?1 OR path LIKE ?2",
            params![dir, prefix],
        )
        .map_err(CatalogError::Write)?;
        Ok(())
    }

    pub fn for_each(&self, mut f: impl FnMut(&Entry)) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT path, size, type, lastWriteTime, hash FROM savedFiles")
            .map_err(CatalogError::Prepare)?;
        let mut rows = stmt.query_map([], row_to_entry).map_err(CatalogError::Read)?;
        while let Some(row) = rows.next() {
            f(&row.map_err(CatalogError::Read)?);
        }
        Ok(())
    }
}

fn kind_str(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::File => "File",
        EntryKind::Directory => "Directory",
    }
}

fn kind_from_str(s: &str) -> EntryKind {
    if s == "Directory" { EntryKind::Directory } else { EntryKind::File }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    let path: String = row.get(0)?;
    let size: u64 = row.get(1)?;
    let kind: String = row.get(2)?;
    let mtime: String = row.get(3)?;
    let hash_hex: String = row.get(4)?;
    Ok(Entry {
        relative_path: path,
        kind: kind_from_str(&kind),
        size,
        mtime,
        content_hash: hash_from_hex(&hash_hex).unwrap_or([0u8; 32]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> Entry {
        Entry {
            relative_path: path.to_string(),
            kind: EntryKind::File,
            size: 4,
            mtime: "2024/01/02-03:04:05".to_string(),
            content_hash: [1u8; 32],
        }
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let cat = LocalCatalog::open(&dir.path().join("local.sqlite")).unwrap();
        cat.insert(&entry("a/b.txt")).unwrap();
        let got = cat.get("a/b.txt").unwrap().unwrap();
        assert_eq!(got, entry("a/b.txt"));
    }

    #[test]
    fn insert_is_idempotent_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let cat = LocalCatalog::open(&dir.path().join("local.sqlite")).unwrap();
        cat.insert(&entry("a.txt")).unwrap();
        let mut updated = entry("a.txt");
        updated.size = 9;
        cat.update(&updated).unwrap();

        let mut count = 0;
        cat.for_each(|_| count += 1).unwrap();
        assert_eq!(count, 1);
        assert_eq!(cat.get("a.txt").unwrap().unwrap().size, 9);
    }

    #[test]
    fn remove_subtree_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let cat = LocalCatalog::open(&dir.path().join("local.sqlite")).unwrap();
        cat.insert(&entry("dir")).unwrap();
        cat.insert(&entry("dir/a.txt")).unwrap();
        cat.insert(&entry("dir/sub/b.txt")).unwrap();
        cat.insert(&entry("other.txt")).unwrap();

        cat.remove_subtree("dir").unwrap();

        let mut remaining = Vec::new();
        cat.for_each(|e| remaining.push(e.relative_path.clone())).unwrap();
        assert_eq!(remaining, vec!["other.txt".to_string()]);
    }
}
