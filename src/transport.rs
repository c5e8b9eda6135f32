//! Framed, TLS-backed transport (§4.1). A frame is a big-endian u32 length
//! followed by that many bytes of opaque payload; the session layer is
//! responsible for what those bytes mean (see [`crate::protocol`]).

use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};

use crate::error::TransportError;

/// Hard cap from §6.1: no frame body may exceed this.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

enum Conn {
    Client(StreamOwned<ClientConnection, TcpStream>),
    Server(StreamOwned<ServerConnection, TcpStream>),
}

/// A connected, mutually-trusted TLS stream exposing the four operations
/// from §4.1: `send_frame`, `recv_frame`, `peer_mac`, `close`.
pub struct FramedTransport {
    conn: Conn,
    raw: TcpStream,
}

impl FramedTransport {
    fn from_client(tcp: TcpStream, conn: ClientConnection) -> Self {
        let raw = tcp.try_clone().expect("clone tcp stream");
        Self { conn: Conn::Client(StreamOwned::new(conn, tcp)), raw }
    }

    fn from_server(tcp: TcpStream, conn: ServerConnection) -> Self {
        let raw = tcp.try_clone().expect("clone tcp stream");
        Self { conn: Conn::Server(StreamOwned::new(conn, tcp)), raw }
    }

    pub fn connect(
        addr: &str,
        server_name: &str,
        ca_file: &Path,
    ) -> Result<FramedTransport, TransportError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(&cert)
                .map_err(|e| TransportError::Protocol(format!("invalid CA certificate: {e}")))?;
        }
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = server_name
            .try_into()
            .map_err(|_| TransportError::Protocol("invalid server name".into()))?;
        let client = ClientConnection::new(Arc::new(config), server_name)
            .map_err(TransportError::Tls)?;

        let tcp = TcpStream::connect(addr)?;
        Ok(Self::from_client(tcp, client))
    }

    pub fn accept(
        tcp: TcpStream,
        cert_file: &Path,
        key_file: &Path,
    ) -> Result<FramedTransport, TransportError> {
        let certs = load_certs(cert_file)?;
        let key = load_private_key(key_file)?;
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Protocol(format!("invalid server certificate: {e}")))?;

        let server = ServerConnection::new(Arc::new(config)).map_err(TransportError::Tls)?;
        Ok(Self::from_server(tcp, server))
    }

    pub fn send_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
            return Err(TransportError::FrameTooLarge(payload.len() as u32));
        }
        let len = (payload.len() as u32).to_be_bytes();
        match &mut self.conn {
            Conn::Client(s) => {
                s.write_all(&len)?;
                s.write_all(payload)?;
                s.flush()?;
            }
            Conn::Server(s) => {
                s.write_all(&len)?;
                s.write_all(payload)?;
                s.flush()?;
            }
        }
        Ok(())
    }

    pub fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut len_buf = [0u8; 4];
        let result = match &mut self.conn {
            Conn::Client(s) => read_exact_or_eof(s, &mut len_buf),
            Conn::Server(s) => read_exact_or_eof(s, &mut len_buf),
        };
        let read = match result {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => return Err(TransportError::Timeout),
            Err(e) => return Err(TransportError::Io(e)),
        };
        if read == 0 {
            return Err(TransportError::Closed);
        }
        if read < 4 {
            return Err(TransportError::Protocol("truncated frame length".into()));
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut body = vec![0u8; len as usize];
        match &mut self.conn {
            Conn::Client(s) => s
                .read_exact(&mut body)
                .map_err(|_| TransportError::Protocol("truncated frame body".into()))?,
            Conn::Server(s) => s
                .read_exact(&mut body)
                .map_err(|_| TransportError::Protocol("truncated frame body".into()))?,
        }
        Ok(body)
    }

    /// Normalized MAC address of the local interface bearing the route to
    /// the peer (§4.1): six lowercase hex groups, leading zeros stripped.
    pub fn peer_mac(&self) -> Result<String, TransportError> {
        let local_addr = self.raw.local_addr()?;
        local_interface_mac(local_addr.ip())
            .ok_or_else(|| TransportError::Protocol("cannot determine local device MAC".into()))
    }

    pub fn close(&mut self) {
        let _ = self.raw.shutdown(Shutdown::Both);
    }

    /// Sets the socket read timeout; `recv_frame` returns
    /// `TransportError::Timeout` once it elapses with nothing read, which
    /// the session engines use to multiplex the transport and their event
    /// queue on a single readiness wait (§4.7's `T_select`).
    pub fn set_read_timeout(&self, dur: Option<std::time::Duration>) -> Result<(), TransportError> {
        self.raw.set_read_timeout(dur)?;
        Ok(())
    }
}

/// The subset of `FramedTransport` the session engines drive their state
/// machines over: framing plus teardown. Lets `ClientSession` be unit-tested
/// against an in-memory fake instead of a live TLS socket, the same way its
/// other collaborators (`LocalCatalog`, `Entry::scan`) are exercised directly
/// against a tempdir rather than mocked.
pub trait Transport {
    fn send_frame(&mut self, payload: &[u8]) -> Result<(), TransportError>;
    fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError>;
    fn close(&mut self);
}

impl Transport for FramedTransport {
    fn send_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        FramedTransport::send_frame(self, payload)
    }

    fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        FramedTransport::recv_frame(self)
    }

    fn close(&mut self) {
        FramedTransport::close(self)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn load_certs(path: &Path) -> Result<Vec<rustls::Certificate>, TransportError> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| TransportError::Protocol(format!("cannot parse certificate: {e}")))?;
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, TransportError> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| TransportError::Protocol(format!("cannot parse private key: {e}")))?;
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::Protocol("no private key found".into()))?;
    Ok(rustls::PrivateKey(key))
}

/// Normalize a raw MAC (any of the common separator/case forms) into the
/// canonical form used as the `device` key: six lowercase hex groups,
/// leading zeros stripped per-group, colons preserved as separators.
pub fn normalize_mac(raw: &str) -> String {
    raw.split(|c| c == ':' || c == '-')
        .map(|group| {
            let trimmed = group.trim_start_matches('0');
            if trimmed.is_empty() { "0".to_string() } else { trimmed.to_lowercase() }
        })
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(target_os = "linux")]
fn local_interface_mac(_local_ip: std::net::IpAddr) -> Option<String> {
    let entries = fs::read_dir("/sys/class/net").ok()?;
    let mut candidates = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "lo" {
            continue;
        }
        let addr_path = entry.path().join("address");
        if let Ok(addr) = fs::read_to_string(addr_path) {
            let addr = addr.trim();
            if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                candidates.push(addr.to_string());
            }
        }
    }
    candidates.sort();
    candidates.into_iter().next().map(|mac| normalize_mac(&mac))
}

#[cfg(not(target_os = "linux"))]
fn local_interface_mac(_local_ip: std::net::IpAddr) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_leading_zeros_and_case() {
        assert_eq!(normalize_mac(":::::"), "0:0:0:0:0:0");
        assert_eq!(normalize_mac("00:01:02:03:04:05"), "0:1:2:3:4:5");
        assert_eq!(normalize_mac("0A:3:BC:04:5:06"), "a:3:bc:4:5:6");
    }
}
