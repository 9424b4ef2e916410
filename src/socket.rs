//! Thin non-blocking socket facade: connect/accept/bind/close plus the
//! `again` classifier shared by every read/write loop in the crate.

use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// Address family requested for a listening or outbound socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    /// Try the addresses `ToSocketAddrs` resolves to, in order.
    Unspec,
}

/// A non-blocking TCP stream. Wraps `std::net::TcpStream` the same way the
/// teacher crate's `net::tcp::TcpStream` wraps it, but exposes the
/// `again`/connect-in-progress vocabulary the channel state machine needs.
#[derive(Debug)]
pub struct Socket {
    inner: StdTcpStream,
}

impl Socket {
    /// Starts a non-blocking connect. Returns `Ok(Some(socket))` if the
    /// connect completed immediately (rare, usually only for loopback),
    /// `Ok(None)` if it is in progress (the common case — caller should
    /// register for `POLLOUT` and check `take_error` later), or `Err` on
    /// immediate failure.
    pub fn connect_async(addr: SocketAddr) -> io::Result<ConnectOutcome> {
        // `std` has no non-blocking connect primitive, so open the socket via
        // libc directly, matching the original design's direct syscall use.
        let domain = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking_fd(fd, true)?;

        let (sockaddr, socklen) = socket_addr_to_raw(addr);
        let ret = unsafe { libc::connect(fd, sockaddr.as_ptr() as *const libc::sockaddr, socklen) };

        if ret == 0 {
            let stream = unsafe { StdTcpStream::from_raw_fd(fd) };
            return Ok(ConnectOutcome::Connected(Socket { inner: stream }));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            let stream = unsafe { StdTcpStream::from_raw_fd(fd) };
            Ok(ConnectOutcome::InProgress(Socket { inner: stream }))
        } else {
            unsafe { libc::close(fd) };
            Err(err)
        }
    }

    pub fn from_std(stream: StdTcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Socket { inner: stream })
    }

    /// After a `POLLOUT` wakeup on a still-`InProgress` socket, checks
    /// `SO_ERROR` to decide between `ConnectState::Success` and `Fail`.
    pub fn take_connect_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub fn shutdown(&self, how: net::Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    /// Classifies an `errno` as retryable: the reactor should not surface
    /// these as channel errors, it should simply wait for the next
    /// readiness event.
    pub fn is_again(err: &io::Error) -> bool {
        matches!(
            err.raw_os_error(),
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR)
        )
    }
}

pub enum ConnectOutcome {
    Connected(Socket),
    InProgress(Socket),
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

/// A bound, listening, non-blocking TCP acceptor.
#[derive(Debug)]
pub struct ListenSocket {
    inner: StdTcpListener,
}

impl ListenSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = StdTcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(ListenSocket { inner })
    }

    /// Non-blocking accept; `Ok(None)` means no pending connection (`again`).
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(true)?;
                Ok(Some((Socket { inner: stream }, addr)))
            }
            Err(e) if Socket::is_again(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for ListenSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn set_nonblocking_fd(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn socket_addr_to_raw(addr: SocketAddr) -> (Vec<u8>, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => {
            let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = a.port().to_be();
            sa.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sa as *const _ as *const u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                )
            }
            .to_vec();
            (bytes, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = a.port().to_be();
            sa.sin6_addr.s6_addr = a.ip().octets();
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sa as *const _ as *const u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                )
            }
            .to_vec();
            (bytes, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn again_classifier_matches_expected_errnos() {
        let eagain = io::Error::from_raw_os_error(libc::EAGAIN);
        let eintr = io::Error::from_raw_os_error(libc::EINTR);
        let eother = io::Error::from_raw_os_error(libc::ECONNRESET);

        assert!(Socket::is_again(&eagain));
        assert!(Socket::is_again(&eintr));
        assert!(!Socket::is_again(&eother));
    }

    #[test]
    fn listen_and_connect_round_trip() {
        let listener = ListenSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let addr = listener.inner.local_addr().unwrap();

        let outcome = Socket::connect_async(addr).unwrap();
        let _client = match outcome {
            ConnectOutcome::Connected(s) => s,
            ConnectOutcome::InProgress(s) => s,
        };

        // Give the kernel a moment; non-blocking accept may need a retry.
        for _ in 0..100 {
            if let Some((_srv, _peer)) = listener.accept().unwrap() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("accept never completed");
    }
}
