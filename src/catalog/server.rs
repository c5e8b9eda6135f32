//! Server-side catalog: every device's view of its mirrored tree, keyed by
//! `(username, mac, path)` (§4.4, §6.2). The original schema lacked a
//! uniqueness constraint on that key; this one adds it.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::entry::{hash_from_hex, hash_to_hex, Entry, EntryKind};
use crate::error::CatalogError;

pub struct ServerCatalog {
    conn: Mutex<Connection>,
}

impl ServerCatalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(CatalogError::Open)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS savedFiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                mac TEXT NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                type TEXT NOT NULL,
                lastWriteTime TEXT NOT NULL,
                hash TEXT NOT NULL,
                UNIQUE(username, mac, path)
            )",
            [],
        )
        .map_err(CatalogError::Schema)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn insert(&self, username: &str, mac: &str, entry: &Entry) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO savedFiles (username, mac, path, size, type, lastWriteTime, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(username, mac, path) DO UPDATE SET
                size = excluded.size, type = excluded.type,
                lastWriteTime = excluded.lastWriteTime, hash = excluded.hash",
            params![
                username,
                mac,
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

    pub fn update(&self, username: &str, mac: &str, entry: &Entry) -> Result<(), CatalogError> {
        self.insert(username, mac, entry)
    }

    pub fn get(
        &self,
        username: &str,
        mac: &str,
        relative_path: &str,
    ) -> Result<Option<Entry>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT path, size, type, lastWriteTime, hash FROM savedFiles
             WHERE username = ?1 AND mac = ?2 AND path = ?3",
            params![username, mac, relative_path],
            row_to_entry,
        )
        .optional()
        .map_err(CatalogError::Read)
    }

    pub fn remove(&self, username: &str, mac: &str, relative_path: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM savedFiles WHERE username = ?1 AND mac = ?2 AND path = ?3",
            params![username, mac, relative_path],
        )
        .map_err(CatalogError::Write)?;
        Ok(())
    }

    pub fn remove_subtree(&self, username: &str, mac: &str, dir: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        let prefix = format!("{dir}/%");
        conn.execute(
            "DELETE FROM savedFiles WHERE username = ?1 AND mac = ?2 AND (path = ?3 OR path LIKE ?4)",
            params![username, mac, dir, prefix],
        )
        .map_err(CatalogError::Write)?;
        Ok(())
    }

    /// Removes every row for `username` across all of their devices.
    pub fn remove_all_devices(&self, username: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM savedFiles WHERE username = ?1", params![username])
            .map_err(CatalogError::Write)?;
        Ok(())
    }

    /// Removes every row for `(username, mac)`, i.e. one device's tree.
    pub fn remove_all(&self, username: &str, mac: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM savedFiles WHERE username = ?1 AND mac = ?2",
            params![username, mac],
        )
        .map_err(CatalogError::Write)?;
        Ok(())
    }

    pub fn list_devices(&self, username: &str) -> Result<Vec<String>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT DISTINCT mac FROM savedFiles WHERE username = ?1 ORDER BY mac")
            .map_err(CatalogError::Prepare)?;
        let rows = stmt
            .query_map(params![username], |r| r.get::<_, String>(0))
            .map_err(CatalogError::Read)?;
        let mut macs = Vec::new();
        for row in rows {
            macs.push(row.map_err(CatalogError::Read)?);
        }
        Ok(macs)
    }

    pub fn for_each(
        &self,
        username: &str,
        mac: &str,
        mut f: impl FnMut(&Entry),
    ) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT path, size, type, lastWriteTime, hash FROM savedFiles
                 WHERE username = ?1 AND mac = ?2",
            )
            .map_err(CatalogError::Prepare)?;
        let mut rows = stmt
            .query_map(params![username, mac], row_to_entry)
            .map_err(CatalogError::Read)?;
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
            content_hash: [2u8; 32],
        }
    }

    #[test]
    fn insert_is_scoped_by_user_and_device() {
        let dir = tempfile::tempdir().unwrap();
        let cat = ServerCatalog::open(&dir.path().join("server.sqlite")).unwrap();
        cat.insert("alice", "0:1:2:3:4:5", &entry("a.txt")).unwrap();
        cat.insert("alice", "a:b:c:d:e:f", &entry("a.txt")).unwrap();

        assert!(cat.get("alice", "0:1:2:3:4:5", "a.txt").unwrap().is_some());
        assert!(cat.get("alice", "a:b:c:d:e:f", "a.txt").unwrap().is_some());
        assert!(cat.get("bob", "0:1:2:3:4:5", "a.txt").unwrap().is_none());
    }

    #[test]
    fn upsert_does_not_duplicate_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cat = ServerCatalog::open(&dir.path().join("server.sqlite")).unwrap();
        cat.insert("alice", "mac1", &entry("a.txt")).unwrap();
        let mut updated = entry("a.txt");
        updated.size = 99;
        cat.update("alice", "mac1", &updated).unwrap();

        let mut count = 0;
        cat.for_each("alice", "mac1", |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn list_devices_is_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let cat = ServerCatalog::open(&dir.path().join("server.sqlite")).unwrap();
        cat.insert("alice", "mac1", &entry("a.txt")).unwrap();
        cat.insert("alice", "mac2", &entry("b.txt")).unwrap();
        cat.insert("bob", "mac3", &entry("c.txt")).unwrap();

        assert_eq!(cat.list_devices("alice").unwrap(), vec!["mac1".to_string(), "mac2".to_string()]);
    }

    #[test]
    fn remove_all_scopes_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let cat = ServerCatalog::open(&dir.path().join("server.sqlite")).unwrap();
        cat.insert("alice", "mac1", &entry("a.txt")).unwrap();
        cat.insert("alice", "mac2", &entry("a.txt")).unwrap();
        cat.remove_all("alice", "mac1").unwrap();

        assert!(cat.get("alice", "mac1", "a.txt").unwrap().is_none());
        assert!(cat.get("alice", "mac2", "a.txt").unwrap().is_some());
    }

    #[test]
    fn remove_all_devices_clears_every_mac() {
        let dir = tempfile::tempdir().unwrap();
        let cat = ServerCatalog::open(&dir.path().join("server.sqlite")).unwrap();
        cat.insert("alice", "mac1", &entry("a.txt")).unwrap();
        cat.insert("alice", "mac2", &entry("a.txt")).unwrap();
        cat.remove_all_devices("alice").unwrap();

        assert_eq!(cat.list_devices("alice").unwrap().len(), 0);
    }
}
