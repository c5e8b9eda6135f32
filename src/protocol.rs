//! The wire message schema (§6.1). Logically a pair of tagged records;
//! realized as Rust enums so each variant only carries the fields it needs,
//! encoded with `bincode` behind the length-prefixed framing in [`crate::transport`].

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    Auth { version: u32, username: String, device: String, password: String },
    Prob { version: u32, path: String, hash: [u8; 32] },
    Stor { version: u32, path: String, filesize: u64, mtime: String, hash: [u8; 32] },
    Data { version: u32, data: Vec<u8>, last: bool },
    Del { version: u32, path: String, hash: [u8; 32] },
    Mkd { version: u32, path: String, mtime: String },
    Rmd { version: u32, path: String },
    Retr { version: u32, device: String, all: bool },
    Quit { version: u32 },
}

impl ClientMessage {
    pub fn version(&self) -> u32 {
        match self {
            ClientMessage::Auth { version, .. }
            | ClientMessage::Prob { version, .. }
            | ClientMessage::Stor { version, .. }
            | ClientMessage::Data { version, .. }
            | ClientMessage::Del { version, .. }
            | ClientMessage::Mkd { version, .. }
            | ClientMessage::Rmd { version, .. }
            | ClientMessage::Retr { version, .. }
            | ClientMessage::Quit { version } => *version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OkCode {
    Found,
    Created,
    NotPresent,
    Removed,
    Authenticated,
    /// Sentinel closing a retrieval stream (§4.9): no more `Mkd`/`Stor`/`Data`
    /// frames follow for this request.
    RetrievalDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrCode {
    NotAFile,
    Unexpected,
    StoreMismatch,
    RemoveMismatch,
    NotADirectory,
    Auth,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Ok { version: u32, code: OkCode },
    Err { version: u32, code: ErrCode },
    Send { version: u32, path: String, hash: [u8; 32] },
    Ver { version: u32, newversion: u32 },
    Stor { version: u32, path: String, filesize: u64, mtime: String, hash: [u8; 32] },
    Mkd { version: u32, path: String, mtime: String },
    Data { version: u32, data: Vec<u8>, last: bool },
}

impl ServerMessage {
    pub fn version(&self) -> u32 {
        match self {
            ServerMessage::Ok { version, .. }
            | ServerMessage::Err { version, .. }
            | ServerMessage::Send { version, .. }
            | ServerMessage::Ver { version, .. }
            | ServerMessage::Stor { version, .. }
            | ServerMessage::Mkd { version, .. }
            | ServerMessage::Data { version, .. } => *version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bincode_roundtrip_client_message() {
        let msg = ClientMessage::Prob { version: 1, path: "a/b.txt".into(), hash: [9u8; 32] };
        let bytes = bincode::serialize(&msg).unwrap();
        let back: ClientMessage = bincode::deserialize(&bytes).unwrap();
        match back {
            ClientMessage::Prob { path, hash, .. } => {
                assert_eq!(path, "a/b.txt");
                assert_eq!(hash, [9u8; 32]);
            }
            _ => panic!("wrong variant"),
        }
    }
}
