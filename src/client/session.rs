//! Client protocol engine. Grounded in `client::ProtocolManager`: `submit`/
//! `drain` are the Rust names for `send`/`receive`, `rewind` is the Rust
//! name for `recoverFromError`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::LocalCatalog;
use crate::entry::{hash_to_hex, Entry, EntryKind};
use crate::error::{SessionError, TransportError};
use crate::protocol::{ClientMessage, ErrCode, OkCode, ServerMessage, PROTOCOL_VERSION};
use crate::queue::BoundedQueue;
use crate::retry::RetryPolicy;
use crate::transport::{FramedTransport, Transport};
use crate::watcher::ChangeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    ProbeSent,
    DeleteSent,
    MkdirSent,
    RmdirSent,
    StoreBodySent,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    entry: Entry,
    state: PendingState,
    origin: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
    Recover,
    Fatal,
}

/// Parameterized over the transport so the state machine below (`submit`,
/// `drain`, `handle_response`, `rewind`, ...) can be driven in tests against
/// an in-memory fake; every real caller uses the default, a live
/// `FramedTransport`.
pub struct ClientSession<T: Transport = FramedTransport> {
    transport: T,
    catalog: Arc<LocalCatalog>,
    root: PathBuf,
    window: BoundedQueue<PendingRequest>,
    window_capacity: usize,
    chunk_size: usize,
    retry: RetryPolicy,
    state: SessionState,
    select_timeout: Duration,
}

impl ClientSession<FramedTransport> {
    pub fn connect_and_auth(
        addr: &str,
        server_name: &str,
        ca_file: &Path,
        root: PathBuf,
        catalog: Arc<LocalCatalog>,
        username: &str,
        password: &str,
        window_capacity: usize,
        chunk_size: usize,
        max_tries: u32,
        select_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let transport = authenticate(addr, server_name, ca_file, username, password, select_timeout)?;

        Ok(Self {
            transport,
            catalog,
            root,
            window: BoundedQueue::new(window_capacity),
            window_capacity,
            chunk_size,
            retry: RetryPolicy::new(max_tries),
            state: SessionState::Active,
            select_timeout,
        })
    }

    /// Re-dials and re-authenticates, keeping the existing in-flight window
    /// intact, then re-sends it (§4.7 "reconnect replays AUTH, then
    /// `rewind()`"). Unlike `connect_and_auth`, this never discards pending
    /// requests accumulated before the connection dropped.
    pub fn reconnect(
        &mut self,
        addr: &str,
        server_name: &str,
        ca_file: &Path,
        username: &str,
        password: &str,
    ) -> Result<(), SessionError> {
        self.transport = authenticate(
            addr,
            server_name,
            ca_file,
            username,
            password,
            self.select_timeout,
        )?;
        self.state = SessionState::Active;
        self.retry.reset();
        self.rewind()
    }
}

impl<T: Transport> ClientSession<T> {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn can_send(&self) -> bool {
        self.window.len() < self.window_capacity
    }

    pub fn window_is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn close(&mut self) {
        self.transport.close();
        self.state = SessionState::Disconnected;
    }

    /// Composes and sends the request for one watcher event, then records it
    /// in the in-flight window (§4.7 event→request table).
    pub fn submit(&mut self, entry: &Entry, kind: ChangeKind) -> Result<(), SessionError> {
        let (msg, state) = compose(entry, kind);
        send(&mut self.transport, &msg)?;
        self.window.try_push(PendingRequest { entry: entry.clone(), state, origin: kind });
        Ok(())
    }

    /// Receives and handles exactly one server response for the
    /// oldest in-flight request. Blocks up to `select_timeout`.
    pub fn drain(&mut self) -> Result<(), SessionError> {
        let response = recv(&mut self.transport)?;
        self.handle_response(response)
    }

    /// Like `drain`, but a response that doesn't arrive within
    /// `select_timeout` is not an error: it returns `Ok(false)` so the
    /// caller can multiplex between the transport and the watcher's event
    /// queue on a single readiness wait (§4.7 `T_select`). Returns `Ok(true)`
    /// once a response was actually received and processed.
    pub fn try_drain(&mut self) -> Result<bool, SessionError> {
        match recv(&mut self.transport) {
            Ok(response) => {
                self.handle_response(response)?;
                Ok(true)
            }
            Err(SessionError::TransientConnection(TransportError::Timeout)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn handle_response(&mut self, response: ServerMessage) -> Result<(), SessionError> {
        if response.version() != PROTOCOL_VERSION {
            if let ServerMessage::Ver { newversion, .. } = response {
                return Err(SessionError::Protocol(crate::error::ProtocolError::VersionMismatch(newversion)));
            }
        }

        let mut pending = self.window.drain_all();
        if pending.is_empty() {
            return Err(SessionError::Internal);
        }
        let front = pending.remove(0);
        let rest = pending;

        // `rest` is re-enqueued once each arm below has decided what happens
        // to `front`. A *retried* `front` (recoverable error, rewound) goes
        // back ahead of `rest`, preserving on-wire send order (§3). A `SEND`
        // response instead turns `front` into a brand-new STOR request,
        // which is logically a fresh submission and so is appended *behind*
        // `rest` (§4.7 "re-enqueued at the tail"), not ahead of it.
        let result = match response {
            ServerMessage::Send { .. } => {
                // `rest` is restored to the window *before* `send_store`
                // pushes the new STOR entry, so that entry lands at the
                // tail behind `rest` (§4.7 "re-enqueued at the tail") instead
                // of jumping ahead of requests that were already in flight.
                for r in rest {
                    self.window.try_push(r);
                }
                if front.entry.is_file()
                    && matches!(front.state, PendingState::ProbeSent)
                    && matches!(front.origin, ChangeKind::Created | ChangeKind::Modified)
                {
                    let abs = self.root.join(&front.entry.relative_path);
                    let still_matches = abs
                        .metadata()
                        .is_ok()
                        .then(|| Entry::scan(&self.root, &abs).ok())
                        .flatten()
                        .map(|current| current.content_hash == front.entry.content_hash)
                        .unwrap_or(false);

                    if still_matches {
                        self.send_store(&front.entry, front.origin)
                    } else {
                        Ok(())
                    }
                } else {
                    Err(SessionError::Protocol(crate::error::ProtocolError::Unexpected))
                }
            }
            ServerMessage::Ok { code, .. } => {
                self.retry.reset();
                let outcome = self.apply_ok(&front, code);
                for r in rest {
                    self.window.try_push(r);
                }
                outcome
            }
            ServerMessage::Err { code, .. } => self.handle_err(front, rest, code),
            ServerMessage::Ver { newversion, .. } => {
                for r in rest {
                    self.window.try_push(r);
                }
                Err(SessionError::Protocol(crate::error::ProtocolError::VersionMismatch(newversion)))
            }
            ServerMessage::Stor { .. } | ServerMessage::Mkd { .. } | ServerMessage::Data { .. } => {
                for r in rest {
                    self.window.try_push(r);
                }
                Err(SessionError::Protocol(crate::error::ProtocolError::Unexpected))
            }
        };
        result
    }

    fn apply_ok(&mut self, front: &PendingRequest, code: OkCode) -> Result<(), SessionError> {
        match code {
            OkCode::Found => {
                self.catalog_reconcile(front)?;
                Ok(())
            }
            OkCode::Created => {
                self.catalog_reconcile(front)?;
                Ok(())
            }
            OkCode::NotPresent | OkCode::Removed => {
                self.catalog.remove(&front.entry.relative_path)?;
                Ok(())
            }
            OkCode::Authenticated | OkCode::RetrievalDone => {
                Err(SessionError::Protocol(crate::error::ProtocolError::Unexpected))
            }
        }
    }

    fn catalog_reconcile(&self, front: &PendingRequest) -> Result<(), SessionError> {
        match front.origin {
            ChangeKind::Created => self.catalog.insert(&front.entry)?,
            ChangeKind::Modified => self.catalog.update(&front.entry)?,
            ChangeKind::Deleted => {}
        }
        Ok(())
    }

    fn handle_err(
        &mut self,
        front: PendingRequest,
        rest: Vec<PendingRequest>,
        code: ErrCode,
    ) -> Result<(), SessionError> {
        match code {
            ErrCode::NotAFile | ErrCode::StoreMismatch | ErrCode::RemoveMismatch | ErrCode::NotADirectory => {
                if !self.retry.record_error_and_retry() {
                    for r in rest {
                        self.window.try_push(r);
                    }
                    return Err(SessionError::RecoverableExhausted(self.retry.max_tries()));
                }
                // `front` goes back to the head of the window before `rest`
                // is restored behind it, so `rewind()` re-sends everything
                // in the same order it was originally submitted.
                self.window.try_push(front);
                for r in rest {
                    self.window.try_push(r);
                }
                self.rewind()
            }
            ErrCode::Internal => {
                // `front` is the request that actually received the error;
                // it must survive alongside `rest` so the caller's
                // reconnect()/rewind() resends it too, instead of silently
                // dropping it (§4.7 "ERR{internal} ⇒ close connection,
                // reconnect, rewind").
                self.window.try_push(front);
                for r in rest {
                    self.window.try_push(r);
                }
                Err(SessionError::Internal)
            }
            ErrCode::Auth | ErrCode::Unexpected => {
                for r in rest {
                    self.window.try_push(r);
                }
                Err(SessionError::Protocol(crate::error::ProtocolError::Unexpected))
            }
        }
    }

    fn send_store(&mut self, entry: &Entry, origin: ChangeKind) -> Result<(), SessionError> {
        let stor = ClientMessage::Stor {
            version: PROTOCOL_VERSION,
            path: entry.relative_path.clone(),
            filesize: entry.size,
            mtime: entry.mtime.clone(),
            hash: entry.content_hash,
        };
        send(&mut self.transport, &stor)?;

        let abs = self.root.join(&entry.relative_path);
        let mut file = fs::File::open(&abs)
            .map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| SessionError::Catalog(crate::error::CatalogError::Io(e)))?;
            let last = n < buf.len();
            let data = ClientMessage::Data { version: PROTOCOL_VERSION, data: buf[..n].to_vec(), last };
            send(&mut self.transport, &data)?;
            if last {
                break;
            }
        }

        self.window.try_push(PendingRequest { entry: entry.clone(), state: PendingState::StoreBodySent, origin });
        Ok(())
    }

    /// Re-sends every still in-flight request (§4.7 `recoverFromError`).
    /// Stops at the first file whose on-disk content no longer matches
    /// what was originally queued, exactly as the original does.
    pub fn rewind(&mut self) -> Result<(), SessionError> {
        let pending = self.window.drain_all();
        for req in pending {
            if req.state == PendingState::StoreBodySent {
                let abs = self.root.join(&req.entry.relative_path);
                let matches = Entry::scan(&self.root, &abs)
                    .ok()
                    .map(|current| current.content_hash == req.entry.content_hash)
                    .unwrap_or(false);
                if !matches {
                    break;
                }
                self.send_store(&req.entry, req.origin)?;
                continue;
            }

            let (msg, _state) = compose(&req.entry, req.origin);
            send(&mut self.transport, &msg)?;
            self.window.try_push(req);
        }
        Ok(())
    }
}

/// Dials `addr`, derives this machine's device identity from the connected
/// transport (§4.1 `peer_mac`, never an operator-supplied string), performs
/// the AUTH exchange, and leaves the returned transport's read timeout set
/// to `select_timeout` (§4.7 `T_select`). Shared by `connect_and_auth`
/// (fresh session) and `reconnect` (existing session, window preserved).
fn authenticate(
    addr: &str,
    server_name: &str,
    ca_file: &Path,
    username: &str,
    password: &str,
    select_timeout: Duration,
) -> Result<FramedTransport, SessionError> {
    let mut transport = FramedTransport::connect(addr, server_name, ca_file)
        .map_err(SessionError::TransientConnection)?;

    let device = transport
        .peer_mac()
        .map_err(|e| SessionError::FatalConfig(format!("cannot determine device identity: {e}")))?;

    let auth = ClientMessage::Auth {
        version: PROTOCOL_VERSION,
        username: username.to_string(),
        device,
        password: password.to_string(),
    };
    send(&mut transport, &auth)?;
    let response = recv(&mut transport)?;

    match response {
        ServerMessage::Ok { code: OkCode::Authenticated, .. } => {}
        ServerMessage::Err { code: ErrCode::Auth, .. } => return Err(SessionError::FatalAuth),
        ServerMessage::Ver { newversion, .. } => {
            return Err(SessionError::Protocol(crate::error::ProtocolError::VersionMismatch(newversion)))
        }
        _ => return Err(SessionError::Protocol(crate::error::ProtocolError::Unexpected)),
    }

    transport
        .set_read_timeout(Some(select_timeout))
        .map_err(SessionError::TransientConnection)?;
    Ok(transport)
}

fn compose(entry: &Entry, kind: ChangeKind) -> (ClientMessage, PendingState) {
    match (entry.kind, kind) {
        (EntryKind::File, ChangeKind::Created | ChangeKind::Modified) => (
            ClientMessage::Prob { version: PROTOCOL_VERSION, path: entry.relative_path.clone(), hash: entry.content_hash },
            PendingState::ProbeSent,
        ),
        (EntryKind::File, ChangeKind::Deleted) => (
            ClientMessage::Del { version: PROTOCOL_VERSION, path: entry.relative_path.clone(), hash: entry.content_hash },
            PendingState::DeleteSent,
        ),
        (EntryKind::Directory, ChangeKind::Created | ChangeKind::Modified) => (
            ClientMessage::Mkd { version: PROTOCOL_VERSION, path: entry.relative_path.clone(), mtime: entry.mtime.clone() },
            PendingState::MkdirSent,
        ),
        (EntryKind::Directory, ChangeKind::Deleted) => (
            ClientMessage::Rmd { version: PROTOCOL_VERSION, path: entry.relative_path.clone() },
            PendingState::RmdirSent,
        ),
    }
}

fn send<T: Transport>(transport: &mut T, msg: &ClientMessage) -> Result<(), SessionError> {
    let bytes = bincode::serialize(msg).expect("client message always serializes");
    transport.send_frame(&bytes).map_err(SessionError::TransientConnection)
}

fn recv<T: Transport>(transport: &mut T) -> Result<ServerMessage, SessionError> {
    let bytes = transport.recv_frame().map_err(SessionError::TransientConnection)?;
    bincode::deserialize(&bytes)
        .map_err(|_| SessionError::Protocol(crate::error::ProtocolError::Unexpected))
}

pub fn hash_hex(entry: &Entry) -> String {
    hash_to_hex(&entry.content_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Records every frame handed to it and never has anything to receive;
    /// the tests below only exercise `handle_response`/`handle_err` directly,
    /// so nothing ever calls `recv_frame` on it.
    #[derive(Default)]
    struct FakeTransport {
        sent: Vec<Vec<u8>>,
    }

    impl Transport for FakeTransport {
        fn send_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
            self.sent.push(payload.to_vec());
            Ok(())
        }

        fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::Closed)
        }

        fn close(&mut self) {}
    }

    fn session_for_test(root: PathBuf, capacity: usize) -> ClientSession<FakeTransport> {
        ClientSession {
            transport: FakeTransport::default(),
            catalog: Arc::new(LocalCatalog::open(&root.join("catalog.sqlite")).unwrap()),
            root,
            window: BoundedQueue::new(capacity),
            window_capacity: capacity,
            chunk_size: 4096,
            retry: RetryPolicy::new(3),
            state: SessionState::Active,
            select_timeout: Duration::from_millis(50),
        }
    }

    fn pending(entry: Entry, state: PendingState, origin: ChangeKind) -> PendingRequest {
        PendingRequest { entry, state, origin }
    }

    #[test]
    fn send_response_appends_new_store_behind_already_queued_entry() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        let a = Entry::scan(&root, &root.join("a.txt")).unwrap();
        fs::create_dir(root.join("b")).unwrap();
        let b = Entry::scan(&root, &root.join("b")).unwrap();

        let mut session = session_for_test(root, 4);
        session.window.try_push(pending(a.clone(), PendingState::ProbeSent, ChangeKind::Created));
        session.window.try_push(pending(b.clone(), PendingState::MkdirSent, ChangeKind::Created));

        session
            .handle_response(ServerMessage::Send {
                version: PROTOCOL_VERSION,
                path: a.relative_path.clone(),
                hash: a.content_hash,
            })
            .unwrap();

        // The entry that was already in flight (`b`) must still precede the
        // brand-new STOR the SEND response triggered for `a` — the window's
        // FIFO order has to match the original on-wire send order (§3),
        // not jump the new request to the front.
        let remaining = session.window.drain_all();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].entry.relative_path, b.relative_path);
        assert_eq!(remaining[0].state, PendingState::MkdirSent);
        assert_eq!(remaining[1].entry.relative_path, a.relative_path);
        assert_eq!(remaining[1].state, PendingState::StoreBodySent);
    }

    #[test]
    fn internal_error_preserves_the_request_that_received_it() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        let a = Entry::scan(&root, &root.join("a.txt")).unwrap();
        fs::write(root.join("c.txt"), b"world").unwrap();
        let c = Entry::scan(&root, &root.join("c.txt")).unwrap();

        let mut session = session_for_test(root, 4);
        session.window.try_push(pending(a.clone(), PendingState::ProbeSent, ChangeKind::Created));
        session.window.try_push(pending(c.clone(), PendingState::ProbeSent, ChangeKind::Created));

        let err = session
            .handle_response(ServerMessage::Err { version: PROTOCOL_VERSION, code: ErrCode::Internal })
            .unwrap_err();
        assert!(matches!(err, SessionError::Internal));

        // `a` was the head of the window and the one that actually received
        // the error; it must come back out alongside `c`, not be dropped.
        let remaining = session.window.drain_all();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].entry.relative_path, a.relative_path);
        assert_eq!(remaining[1].entry.relative_path, c.relative_path);
    }
}
