//! Bound acceptor (spec.md §4.5): a listening socket the reactor polls for
//! readability; each accepted connection is handed to a factory that
//! produces an application channel bound to the same poller.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::socket::{ListenSocket, Socket};
use crate::tls::TlsContext;

/// Distinguishes listener roles so the owning `Instance` can apply
/// different policies (e.g. the admin listener skips the job/pool
/// machinery entirely). Mirrors the `<tag>.port` config keys in spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Service,
    ServiceSsl,
    Http,
    Https,
    Admin,
    AdminSsl,
    /// Application-defined listener with its own accept factory.
    Custom,
}

impl ListenerKind {
    pub fn is_ssl(self) -> bool {
        matches!(self, ListenerKind::ServiceSsl | ListenerKind::Https | ListenerKind::AdminSsl)
    }
}

/// A bound, listening acceptor. Owns no channel logic itself — on
/// readiness, `accept_one` hands the caller a raw `(Socket, SocketAddr)`
/// plus the optional TLS context to attach, and the caller (typically
/// `instance.rs`'s main loop) drives the factory that builds the concrete
/// application channel.
pub struct Listener {
    kind: ListenerKind,
    socket: ListenSocket,
    tls: Option<TlsContext>,
}

impl Listener {
    pub fn bind(kind: ListenerKind, addr: SocketAddr, tls: Option<TlsContext>) -> std::io::Result<Self> {
        if kind.is_ssl() && tls.is_none() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "ssl listener requires a TlsContext",
            ));
        }
        Ok(Listener {
            kind,
            socket: ListenSocket::bind(addr)?,
            tls,
        })
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    /// Accepts at most one pending connection. `Ok(None)` means nothing was
    /// pending (`again`); callers loop this until `None` to drain the
    /// accept backlog per reactor pass, matching `accept4`'s edge-triggered
    /// usage in the original.
    pub fn accept_one(&self) -> std::io::Result<Option<(Socket, SocketAddr)>> {
        self.socket.accept()
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
