//! Per-connection request handler. Grounded in `server::ProtocolManager`
//! (`probe`, `storeFile`, `removeFile`, `makeDir`, `removeDir`,
//! `authenticate`). Commit is rename-after-verify: a STOR writes to a
//! randomly-named temp file first and only renames it into place once size,
//! hash and mtime all match what the client declared.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::catalog::ServerCatalog;
use crate::credentials::CredentialStore;
use crate::entry::{Entry, EntryKind};
use crate::error::{ProtocolError, SessionError};
use crate::protocol::{ClientMessage, ErrCode, OkCode, ServerMessage, PROTOCOL_VERSION};
use crate::transport::FramedTransport;

use super::retrieval::serve_retrieval;

pub struct ServerSession {
    transport: FramedTransport,
    catalog: Arc<ServerCatalog>,
    username: String,
    mac: String,
    server_base_path: PathBuf,
    user_root: PathBuf,
    temp_path: PathBuf,
    temp_name_len: usize,
}

impl ServerSession {
    pub fn authenticate(
        mut transport: FramedTransport,
        credentials: &CredentialStore,
        catalog: Arc<ServerCatalog>,
        server_base_path: &std::path::Path,
        temp_path: PathBuf,
        temp_name_len: usize,
    ) -> Result<Self, SessionError> {
        let msg = recv(&mut transport)?;
        let ClientMessage::Auth { version, username, device, password } = msg else {
            send(&mut transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::Unexpected })?;
            return Err(SessionError::Protocol(ProtocolError::Unexpected));
        };

        if version != PROTOCOL_VERSION {
            send(&mut transport, &ServerMessage::Ver { version: PROTOCOL_VERSION, newversion: PROTOCOL_VERSION })?;
            return Err(SessionError::Protocol(ProtocolError::VersionMismatch(PROTOCOL_VERSION)));
        }

        let ok = credentials
            .verify(&username, &password)
            .map_err(SessionError::Catalog)?;
        if !ok {
            send(&mut transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::Auth })?;
            return Err(SessionError::FatalAuth);
        }

        send(&mut transport, &ServerMessage::Ok { version: PROTOCOL_VERSION, code: OkCode::Authenticated })?;

        let user_root = server_base_path.join(format!("{username}_{device}"));
        fs::create_dir_all(&user_root).map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;

        Ok(Self {
            transport,
            catalog,
            username,
            mac: device,
            server_base_path: server_base_path.to_path_buf(),
            user_root,
            temp_path,
            temp_name_len,
        })
    }

    /// Runs the per-connection dispatch loop until `Quit` or cancellation.
    pub fn serve(&mut self, stop: &AtomicBool) -> Result<(), SessionError> {
        while !stop.load(Ordering::SeqCst) {
            let msg = match recv(&mut self.transport) {
                Ok(m) => m,
                Err(SessionError::TransientConnection(crate::error::TransportError::Closed)) => break,
                Err(e) => return Err(e),
            };
            if msg.version() != PROTOCOL_VERSION {
                send(&mut self.transport, &ServerMessage::Ver { version: PROTOCOL_VERSION, newversion: PROTOCOL_VERSION })?;
                continue;
            }

            let result = match msg {
                ClientMessage::Prob { path, hash, .. } => self.probe(&path, hash),
                ClientMessage::Stor { path, filesize, mtime, hash, .. } => {
                    self.store_file(&path, filesize, &mtime, hash)
                }
                ClientMessage::Del { path, hash, .. } => self.remove_file(&path, hash),
                ClientMessage::Mkd { path, mtime, .. } => self.make_dir(&path, &mtime),
                ClientMessage::Rmd { path, .. } => self.remove_dir(&path),
                ClientMessage::Retr { device, all, .. } => serve_retrieval(
                    &mut self.transport,
                    &self.catalog,
                    &self.username,
                    &device,
                    all,
                    &self.server_base_path,
                ),
                ClientMessage::Quit { .. } => break,
                ClientMessage::Auth { .. } | ClientMessage::Data { .. } => {
                    send(&mut self.transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::Unexpected })
                }
            };

            if let Err(e) = result {
                send(&mut self.transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::Internal }).ok();
                return Err(e);
            }
        }
        Ok(())
    }

    fn probe(&mut self, path: &str, hash: [u8; 32]) -> Result<(), SessionError> {
        match self.catalog.get(&self.username, &self.mac, path)? {
            None => send(&mut self.transport, &ServerMessage::Send { version: PROTOCOL_VERSION, path: path.to_string(), hash }),
            Some(existing) if !existing.is_file() => {
                send(&mut self.transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::NotAFile })
            }
            Some(existing) if existing.content_hash != hash => {
                send(&mut self.transport, &ServerMessage::Send { version: PROTOCOL_VERSION, path: path.to_string(), hash })
            }
            Some(_) => send(&mut self.transport, &ServerMessage::Ok { version: PROTOCOL_VERSION, code: OkCode::Found }),
        }
    }

    fn store_file(
        &mut self,
        path: &str,
        filesize: u64,
        mtime: &str,
        hash: [u8; 32],
    ) -> Result<(), SessionError> {
        fs::create_dir_all(&self.temp_path).map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;
        let tmp_name = random_hex(self.temp_name_len);
        let tmp_path = self.temp_path.join(format!("{tmp_name}.tmp"));

        {
            let mut out = fs::File::create(&tmp_path)
                .map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;
            loop {
                let msg = recv(&mut self.transport)?;
                if msg.version() != PROTOCOL_VERSION {
                    let _ = fs::remove_file(&tmp_path);
                    return send(&mut self.transport, &ServerMessage::Ver { version: PROTOCOL_VERSION, newversion: PROTOCOL_VERSION });
                }
                let ClientMessage::Data { data, last, .. } = msg else {
                    let _ = fs::remove_file(&tmp_path);
                    return send(&mut self.transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::Unexpected });
                };
                out.write_all(&data).map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;
                if last {
                    break;
                }
            }
        }

        let final_path = self.user_root.join(path);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;
        }

        Entry::apply_mtime(&tmp_path, mtime).map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;
        let written = Entry::scan(&self.temp_path, &tmp_path)
            .map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;

        if written.size != filesize || written.content_hash != hash || written.mtime != mtime {
            let _ = fs::remove_file(&tmp_path);
            return send(&mut self.transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::StoreMismatch });
        }

        fs::rename(&tmp_path, &final_path).map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;

        let stored = Entry {
            relative_path: path.to_string(),
            kind: EntryKind::File,
            size: filesize,
            mtime: mtime.to_string(),
            content_hash: hash,
        };
        self.catalog.insert(&self.username, &self.mac, &stored)?;
        send(&mut self.transport, &ServerMessage::Ok { version: PROTOCOL_VERSION, code: OkCode::Created })
    }

    fn remove_file(&mut self, path: &str, hash: [u8; 32]) -> Result<(), SessionError> {
        match self.catalog.get(&self.username, &self.mac, path)? {
            None => send(&mut self.transport, &ServerMessage::Ok { version: PROTOCOL_VERSION, code: OkCode::NotPresent }),
            Some(existing) if !existing.is_file() || existing.content_hash != hash => {
                send(&mut self.transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::RemoveMismatch })
            }
            Some(_) => {
                let _ = fs::remove_file(self.user_root.join(path));
                self.catalog.remove(&self.username, &self.mac, path)?;
                send(&mut self.transport, &ServerMessage::Ok { version: PROTOCOL_VERSION, code: OkCode::Removed })
            }
        }
    }

    fn make_dir(&mut self, path: &str, mtime: &str) -> Result<(), SessionError> {
        let abs = self.user_root.join(path);
        if !abs.exists() {
            fs::create_dir_all(&abs).map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;
        }
        if !abs.is_dir() {
            return send(&mut self.transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::NotADirectory });
        }
        Entry::apply_mtime(&abs, mtime).map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;

        let stored = Entry::scan(&self.user_root, &abs)
            .map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;
        self.catalog.insert(&self.username, &self.mac, &stored)?;
        send(&mut self.transport, &ServerMessage::Ok { version: PROTOCOL_VERSION, code: OkCode::Created })
    }

    fn remove_dir(&mut self, path: &str) -> Result<(), SessionError> {
        match self.catalog.get(&self.username, &self.mac, path)? {
            None => send(&mut self.transport, &ServerMessage::Ok { version: PROTOCOL_VERSION, code: OkCode::NotPresent }),
            Some(existing) if !existing.is_directory() => {
                send(&mut self.transport, &ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::NotADirectory })
            }
            Some(_) => {
                let _ = fs::remove_dir_all(self.user_root.join(path));
                self.catalog.remove_subtree(&self.username, &self.mac, path)?;
                send(&mut self.transport, &ServerMessage::Ok { version: PROTOCOL_VERSION, code: OkCode::Removed })
            }
        }
    }
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}

fn send(transport: &mut FramedTransport, msg: &ServerMessage) -> Result<(), SessionError> {
    let bytes = bincode::serialize(msg).expect("server message always serializes");
    transport.send_frame(&bytes).map_err(SessionError::TransientConnection)
}

fn recv(transport: &mut FramedTransport) -> Result<ClientMessage, SessionError> {
    let bytes = transport.recv_frame().map_err(SessionError::TransientConnection)?;
    bincode::deserialize(&bytes).map_err(|_| SessionError::Protocol(ProtocolError::Unexpected))
}
