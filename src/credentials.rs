//! Salted password-hash store (§4.5). Schema: `server.passwords` in §6.2.

use std::path::Path;

use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::Mutex;

use crate::entry::{hash_from_hex, hash_to_hex};
use crate::error::CatalogError;

pub struct CredentialStore {
    conn: Mutex<Connection>,
}

pub struct CredentialRecord {
    pub user: String,
    pub salt: [u8; 32],
    pub hash: [u8; 32],
}

impl CredentialStore {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(CatalogError::Open)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS passwords (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                salt TEXT NOT NULL,
                hash TEXT NOT NULL
            )",
            [],
        )
        .map_err(CatalogError::Schema)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn lookup(&self, user: &str) -> Result<Option<CredentialRecord>, CatalogError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT salt, hash FROM passwords WHERE username = ?1",
                params![user],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(CatalogError::Read)?;

        Ok(row.map(|(salt_hex, hash_hex)| CredentialRecord {
            user: user.to_string(),
            salt: hash_from_hex(&salt_hex).unwrap_or([0u8; 32]),
            hash: hash_from_hex(&hash_hex).unwrap_or([0u8; 32]),
        }))
    }

    pub fn add(&self, user: &str, password: &str) -> Result<(), CatalogError> {
        let (salt, hash) = salted_hash(password);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO passwords (username, salt, hash) VALUES (?1, ?2, ?3)",
            params![user, hash_to_hex(&salt), hash_to_hex(&hash)],
        )
        .map_err(CatalogError::Write)?;
        Ok(())
    }

    pub fn update(&self, user: &str, password: &str) -> Result<(), CatalogError> {
        let (salt, hash) = salted_hash(password);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE passwords SET salt = ?2, hash = ?3 WHERE username = ?1",
            params![user, hash_to_hex(&salt), hash_to_hex(&hash)],
        )
        .map_err(CatalogError::Write)?;
        Ok(())
    }

    pub fn remove(&self, user: &str) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM passwords WHERE username = ?1", params![user])
            .map_err(CatalogError::Write)?;
        Ok(())
    }

    pub fn enumerate(&self, mut f: impl FnMut(&str)) -> Result<(), CatalogError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT username FROM passwords ORDER BY username")
            .map_err(CatalogError::Prepare)?;
        let mut rows = stmt.query([]).map_err(CatalogError::Read)?;
        while let Some(row) = rows.next().map_err(CatalogError::Read)? {
            let user: String = row.get(0).map_err(CatalogError::Read)?;
            f(&user);
        }
        Ok(())
    }

    /// True iff `password` matches the stored credential for `user`.
    /// Comparison is constant-time regardless of where the mismatch is.
    pub fn verify(&self, user: &str, password: &str) -> Result<bool, CatalogError> {
        let Some(record) = self.lookup(user)? else { return Ok(false) };
        let provided = sha256_concat(password.as_bytes(), &record.salt);
        Ok(constant_time_eq(&provided, &record.hash))
    }
}

fn salted_hash(password: &str) -> ([u8; 32], [u8; 32]) {
    let mut salt = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let hash = sha256_concat(password.as_bytes(), &salt);
    (salt, hash)
}

fn sha256_concat(password: &[u8], salt: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(salt);
    hasher.finalize().into()
}

/// True comparator: unlike the `CRYPTO_memcmp`-derived original (whose
/// non-zero-means-different return value was used as a truthy "equal" at
/// one call site), this returns `true` iff the two hashes match.
fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(&dir.path().join("pwd.sqlite")).unwrap();
        store.add("alice", "hunter2").unwrap();
        assert!(store.verify("alice", "hunter2").unwrap());
        assert!(!store.verify("alice", "wrong").unwrap());
        assert!(!store.verify("bob", "hunter2").unwrap());
    }

    #[test]
    fn update_changes_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(&dir.path().join("pwd.sqlite")).unwrap();
        store.add("alice", "old").unwrap();
        store.update("alice", "new").unwrap();
        assert!(!store.verify("alice", "old").unwrap());
        assert!(store.verify("alice", "new").unwrap());
    }

    #[test]
    fn remove_and_enumerate() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(&dir.path().join("pwd.sqlite")).unwrap();
        store.add("alice", "a").unwrap();
        store.add("bob", "b").unwrap();
        store.remove("alice").unwrap();

        let mut users = Vec::new();
        store.enumerate(|u| users.push(u.to_string())).unwrap();
        assert_eq!(users, vec!["bob".to_string()]);
    }

    #[test]
    fn constant_time_eq_is_not_inverted() {
        assert!(constant_time_eq(&[1u8; 32], &[1u8; 32]));
        assert!(!constant_time_eq(&[1u8; 32], &[2u8; 32]));
    }
}
