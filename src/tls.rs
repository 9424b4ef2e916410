//! TLS context/session adapter over `rustls`, standing in for the original
//! framework's OpenSSL wrapper (`Ssl`/`SslContext`) per spec.md §9's
//! explicit allowance to use any equivalent library. Exposes exactly the
//! non-blocking, step-at-a-time handshake the channel state machine
//! (spec.md §4.4) needs: feed socket bytes in, get `WantRead`/`WantWrite`/
//! `Done`/`Failed` back, never block.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("tls i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("tls handshake failed: {0}")]
    Handshake(String),
    #[error("invalid certificate/key material: {0}")]
    BadCert(String),
}

/// A loaded server identity (certificate chain + private key), built once
/// at listener-configuration time and cheaply cloned (it's an `Arc`) per
/// accepted connection.
#[derive(Clone)]
pub struct TlsContext {
    inner: ContextInner,
}

#[derive(Clone)]
enum ContextInner {
    Server(Arc<ServerConfig>),
    Client(Arc<ClientConfig>),
}

impl TlsContext {
    /// Builds a server-side context from PEM-encoded certificate chain and
    /// private key bytes (as read from `log.cmd.path`-adjacent config
    /// files; the framework leaves certificate *storage* to the caller).
    pub fn server_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut io::Cursor::new(cert_pem))
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::BadCert(e.to_string()))?;
        if certs.is_empty() {
            return Err(TlsError::BadCert("no certificates in PEM".into()));
        }

        let key = rustls_pemfile::private_key(&mut io::Cursor::new(key_pem))
            .map_err(|e| TlsError::BadCert(e.to_string()))?
            .ok_or_else(|| TlsError::BadCert("no private key in PEM".into()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::BadCert(e.to_string()))?;

        Ok(TlsContext {
            inner: ContextInner::Server(Arc::new(config)),
        })
    }

    /// Builds a client-side context that verifies the peer against the
    /// platform's native root store.
    pub fn client_with_native_roots() -> Result<Self, TlsError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsContext {
            inner: ContextInner::Client(Arc::new(config)),
        })
    }

    pub fn is_server(&self) -> bool {
        matches!(self.inner, ContextInner::Server(_))
    }

    /// Starts a server-side session for a freshly accepted connection.
    pub fn new_server_session(&self) -> Result<TlsSession, TlsError> {
        let ContextInner::Server(cfg) = &self.inner else {
            return Err(TlsError::Handshake("context is not a server context".into()));
        };
        let conn = ServerConnection::new(Arc::clone(cfg)).map_err(|e| TlsError::Handshake(e.to_string()))?;
        Ok(TlsSession {
            conn: Conn::Server(conn),
        })
    }

    /// Starts a client-side session for an outbound connection to
    /// `server_name` (used for SNI + certificate verification).
    pub fn new_client_session(&self, server_name: &str) -> Result<TlsSession, TlsError> {
        let ContextInner::Client(cfg) = &self.inner else {
            return Err(TlsError::Handshake("context is not a client context".into()));
        };
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TlsError::Handshake(e.to_string()))?;
        let conn =
            ClientConnection::new(Arc::clone(cfg), name).map_err(|e| TlsError::Handshake(e.to_string()))?;
        Ok(TlsSession {
            conn: Conn::Client(conn),
        })
    }
}

enum Conn {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Conn {
    fn is_handshaking(&self) -> bool {
        match self {
            Conn::Client(c) => c.is_handshaking(),
            Conn::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Conn::Client(c) => c.wants_write(),
            Conn::Server(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, r: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            Conn::Client(c) => c.read_tls(r),
            Conn::Server(c) => c.read_tls(r),
        }
    }

    fn write_tls(&mut self, w: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            Conn::Client(c) => c.write_tls(w),
            Conn::Server(c) => c.write_tls(w),
        }
    }

    fn process_new_packets(&mut self) -> Result<(), rustls::Error> {
        match self {
            Conn::Client(c) => c.process_new_packets().map(|_| ()),
            Conn::Server(c) => c.process_new_packets().map(|_| ()),
        }
    }
}

/// Outcome of a single non-blocking handshake step, matching the
/// `ConnectState::SslHandshaking` transitions in spec.md §4.4: `WantRW`
/// keeps the channel in `SslHandshaking`, `Done` advances it, `Failed`
/// surfaces `ChannelError::SslHandshaking`.
pub enum HandshakeStep {
    WantRw,
    Done,
    Failed(TlsError),
}

/// A live TLS session wrapping a non-blocking socket. The channel's
/// `IoBuffer` TLS variant (spec.md §4.1) delegates its raw read/write to
/// this type and translates `WouldBlock` into its own retry semantics.
pub struct TlsSession {
    conn: Conn,
}

impl TlsSession {
    /// Advances the handshake by at most one socket round-trip. Call
    /// repeatedly from `eventRead`/`eventWrite` until it returns
    /// `Done`/`Failed`.
    pub fn step<S: Read + Write>(&mut self, sock: &mut S) -> HandshakeStep {
        match self.conn.read_tls(sock) {
            Ok(0) => return HandshakeStep::Failed(TlsError::Handshake("peer closed during handshake".into())),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return HandshakeStep::Failed(TlsError::Io(e)),
        }

        if let Err(e) = self.conn.process_new_packets() {
            return HandshakeStep::Failed(TlsError::Handshake(e.to_string()));
        }

        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return HandshakeStep::Failed(TlsError::Io(e)),
            }
        }

        if self.conn.is_handshaking() {
            HandshakeStep::WantRw
        } else {
            HandshakeStep::Done
        }
    }

    /// Reads decrypted application bytes, pumping the underlying socket as
    /// needed. `Ok(0)` means the peer sent `close_notify` / closed.
    pub fn read<S: Read + Write>(&mut self, sock: &mut S, buf: &mut [u8]) -> io::Result<usize> {
        match self.conn.read_tls(sock) {
            Ok(_) => {
                let _ = self.conn.process_new_packets();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let n = match &mut self.conn {
            Conn::Client(c) => c.reader().read(buf),
            Conn::Server(c) => c.reader().read(buf),
        };

        self.flush_pending(sock)?;
        n
    }

    /// Encrypts and queues `buf`, pumping ciphertext out to the socket.
    pub fn write<S: Read + Write>(&mut self, sock: &mut S, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.conn {
            Conn::Client(c) => c.writer().write(buf)?,
            Conn::Server(c) => c.writer().write(buf)?,
        };
        self.flush_pending(sock)?;
        Ok(n)
    }

    fn flush_pending<S: Read + Write>(&mut self, sock: &mut S) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_context_rejects_empty_pem() {
        let err = TlsContext::server_from_pem(b"", b"").unwrap_err();
        assert!(matches!(err, TlsError::BadCert(_)));
    }
}
