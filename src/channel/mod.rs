//! The channel state machine (spec.md §4.4): the hardest-engineering piece
//! of this crate. [`ChannelCore`] owns the fd, the two [`IoBuffer`]s, an
//! optional TLS session, and the four orthogonal state enumerations;
//! concrete protocol channels ([`crate::channel::msg`],
//! [`crate::channel::http`], [`crate::channel::redis`]) embed a
//! `ChannelCore` and drive it through their own receive loop, plugging a
//! protocol-specific parser into the shared connect/handshake/write/release
//! machinery here.
//!
//! Per the redesign notes in spec.md §9, the polymorphic
//! `ChannelInterface`/`MsgChannel`/`HttpClientChannel`/`RedisChannel`
//! inheritance chain becomes a trait object: [`ChannelDriver`] is the
//! dyn-safe surface the reactor dispatches through, implemented by each
//! concrete protocol channel.

pub mod http;
pub mod http_packet;
pub mod msg;
pub mod redis;

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::io_buffer::IoBuffer;
use crate::packet::Packet;
use crate::poller::Interest;
use crate::registry::ChannelName;
use crate::socket::{ConnectOutcome, Socket};
use crate::tls::{HandshakeStep, TlsContext, TlsSession};

/// Error taxonomy delivered to `eventError`/`on_error` (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    Normal,
    Connect,
    ReadClose,
    Read,
    Write,
    InvalidPacket,
    SslHandshaking,
    ExHandshaking,
}

/// spec.md §3: `InstanceState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Normal,
    Expired,
    Delete,
}

/// spec.md §3: `ConnectState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    None,
    Send,
    Fail,
    Success,
    SslHandshaking,
    ExHandshaking,
}

/// spec.md §3: `RecvState`. Owned by each protocol channel's receive loop,
/// not by `ChannelCore` itself — HTTP uses all six variants, MsgChannel
/// only `Start`/`Body`/`Done`/`Error`, RedisChannel none of them (RESP
/// framing has no first-line/header notion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Start,
    FirstLine,
    Header,
    Body,
    Done,
    Error,
}

/// spec.md §3: `CheckType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    None,
    Read,
    Write,
    Both,
}

/// Outcome of a driver event, telling the reactor loop whether to keep the
/// channel registered or release it on the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    Continue,
    Release,
}

/// The dyn-safe reactor-facing surface of a channel, implemented by every
/// concrete protocol channel. Mirrors `IoPoller::Client::eventIo` in the
/// original, but split into readable/writable/error so the reactor loop
/// (in `instance.rs`) doesn't need to re-derive which condition fired.
pub trait ChannelDriver {
    fn name(&self) -> ChannelName;
    fn fd(&self) -> RawFd;
    fn instance_state(&self) -> InstanceState;
    /// The poller interest this channel currently wants registered.
    fn desired_interest(&self) -> Interest;

    fn on_readable(&mut self) -> DriverOutcome;
    fn on_writable(&mut self) -> DriverOutcome;
    fn on_error(&mut self, errno: i32) -> DriverOutcome;

    fn set_expired(&mut self);
    fn set_release(&mut self);

    /// Idle-timeout check driven by the timer (spec.md §4.4 supplement,
    /// `ChannelPingInterface`). Default: channels that don't care about
    /// ping timeouts just do nothing.
    fn check_ping_timeout(&mut self, _now: Instant, _limit: Duration) -> DriverOutcome {
        DriverOutcome::Continue
    }
}

/// Transport used by a [`ChannelCore`]: plain TCP, or TCP wrapped in a TLS
/// session. Kept as an enum rather than a trait object because the two
/// read/write paths genuinely differ (one delegates `EAGAIN`/`WouldBlock`
/// translation to the TLS session, per spec.md §4.1's "TLS variant").
enum Transport {
    Plain,
    Tls(TlsSession),
}

/// Shared state every protocol channel embeds: fd + buffers + optional TLS
/// + the four state enums + the unique registry handle. Concrete channels
/// own a `ChannelCore` and drive it; this type has no parsing logic of its
/// own, matching spec.md §4.3's observation that `ChannelInterface`'s job
/// is connect/handshake/write/release, with framing left to subclasses.
pub struct ChannelCore {
    name: ChannelName,
    socket: Option<Socket>,
    transport: Transport,
    rbuf: IoBuffer,
    wbuf: IoBuffer,
    instance_state: InstanceState,
    connect_state: ConnectState,
    check_type: CheckType,
    last_activity: Instant,
}

impl ChannelCore {
    /// Wraps an already-connected, non-TLS socket (the common case for an
    /// accepted connection with no TLS context configured).
    pub fn from_connected(name: ChannelName, socket: Socket) -> Self {
        ChannelCore {
            name,
            socket: Some(socket),
            transport: Transport::Plain,
            rbuf: IoBuffer::new(),
            wbuf: IoBuffer::new(),
            instance_state: InstanceState::Normal,
            connect_state: ConnectState::Success,
            check_type: CheckType::None,
            last_activity: Instant::now(),
        }
    }

    /// Wraps an accepted socket that must first complete a TLS handshake
    /// as the server side.
    pub fn from_accepted_tls(name: ChannelName, socket: Socket, ctx: &TlsContext) -> io::Result<Self> {
        let session = ctx
            .new_server_session()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(ChannelCore {
            name,
            socket: Some(socket),
            transport: Transport::Tls(session),
            rbuf: IoBuffer::new(),
            wbuf: IoBuffer::new(),
            instance_state: InstanceState::Normal,
            connect_state: ConnectState::SslHandshaking,
            check_type: CheckType::None,
            last_activity: Instant::now(),
        })
    }

    /// Begins an outbound connection. `tls` carries a client context when
    /// the target requires TLS. Mirrors spec.md §4.4's `connect()` ->
    /// `procConnect` transition table.
    pub fn connect(
        name: ChannelName,
        addr: std::net::SocketAddr,
        tls: Option<(&TlsContext, &str)>,
    ) -> io::Result<Self> {
        let outcome = Socket::connect_async(addr)?;
        let (socket, in_progress) = match outcome {
            ConnectOutcome::Connected(s) => (s, false),
            ConnectOutcome::InProgress(s) => (s, true),
        };

        let transport = match tls {
            Some((ctx, server_name)) if !in_progress => {
                let session = ctx
                    .new_client_session(server_name)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                Transport::Tls(session)
            }
            _ => Transport::Plain,
        };

        let connect_state = if in_progress {
            ConnectState::Send
        } else if matches!(transport, Transport::Tls(_)) {
            ConnectState::SslHandshaking
        } else {
            ConnectState::Success
        };

        Ok(ChannelCore {
            name,
            socket: Some(socket),
            transport,
            rbuf: IoBuffer::new(),
            wbuf: IoBuffer::new(),
            instance_state: InstanceState::Normal,
            connect_state,
            check_type: CheckType::None,
            last_activity: Instant::now(),
        })
    }

    pub fn name(&self) -> ChannelName {
        self.name
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    pub fn instance_state(&self) -> InstanceState {
        self.instance_state
    }

    pub fn connect_state(&self) -> ConnectState {
        self.connect_state
    }

    pub fn check_type(&self) -> CheckType {
        self.check_type
    }

    pub fn read_buf(&mut self) -> &mut IoBuffer {
        &mut self.rbuf
    }

    pub fn write_buf(&mut self) -> &mut IoBuffer {
        &mut self.wbuf
    }

    pub fn is_delete(&self) -> bool {
        self.instance_state == InstanceState::Delete
    }

    pub fn is_expired_or_delete(&self) -> bool {
        matches!(self.instance_state, InstanceState::Expired | InstanceState::Delete)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// The interest mask this channel currently wants registered: a
    /// non-empty write buffer always implies `POLLOUT` (spec.md §3
    /// invariant); handshaking states want both directions since either
    /// may be needed to make progress.
    pub fn desired_interest(&self) -> Interest {
        match self.connect_state {
            ConnectState::None | ConnectState::Fail => Interest::empty(),
            ConnectState::Send | ConnectState::SslHandshaking | ConnectState::ExHandshaking => {
                Interest::readable() | Interest::writable()
            }
            ConnectState::Success => {
                if self.wbuf.is_empty() {
                    Interest::readable()
                } else {
                    Interest::readable() | Interest::writable()
                }
            }
        }
    }

    /// Queues `pk`'s wire representation onto the write buffer. Matches
    /// `ChannelInterface::write(const PacketInterface&)`: the caller must
    /// still ensure the reactor re-checks `desired_interest`.
    pub fn queue_write(&mut self, pk: &impl Packet) -> usize {
        pk.serialize(&mut self.wbuf)
    }

    pub fn queue_bytes(&mut self, bytes: &[u8]) -> usize {
        self.wbuf.write_to_buffer(bytes)
    }

    /// Pulls raw bytes from the transport into `rbuf`. `Ok(0)` signals an
    /// orderly close (`ChannelError::ReadClose`); `Err` with
    /// `Socket::is_again` true signals "nothing yet, wait for the next
    /// readiness event".
    pub fn read_raw(&mut self) -> io::Result<usize> {
        let socket = self.socket.as_mut().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let n = match &mut self.transport {
            Transport::Plain => self.rbuf.read_from(socket)?,
            Transport::Tls(session) => {
                if self.rbuf.writable_size() == 0 {
                    self.rbuf.increase(crate::io_buffer::DEFAULT_DELTA);
                }
                let view = self.rbuf.grab_write();
                let mut scratch = vec![0u8; view.buf.len()];
                let n = session.read(socket, &mut scratch)?;
                self.rbuf.grab_write().buf[..n].copy_from_slice(&scratch[..n]);
                self.rbuf.move_write(n);
                n
            }
        };
        if n > 0 {
            self.touch();
        }
        Ok(n)
    }

    /// Drains the write buffer, up to `max_iterations` successful writes
    /// (spec.md §4.4's "bounded number of iterations per reactor pass,
    /// default 1"). Returns the number of writes performed; the caller
    /// checks `wbuf.is_empty()` afterward to decide whether to clear
    /// `POLLOUT`.
    ///
    /// When the drain empties the buffer on an `Expired` channel, this
    /// promotes the instance state to `Delete` (spec.md §4.4: "When the
    /// write buffer empties, POLLOUT is cleared; if the instance is
    /// Expired, the Channel transitions to Delete"), matching
    /// `pw_channel_if.cpp`'s `if (isInstExpired()) setRelease();` on every
    /// write that drains the buffer.
    pub fn drain_write(&mut self, max_iterations: usize) -> io::Result<usize> {
        let socket = self.socket.as_mut().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let mut iterations = 0;
        while iterations < max_iterations && !self.wbuf.is_empty() {
            let wrote = match &mut self.transport {
                Transport::Plain => self.wbuf.write_to(socket)?,
                Transport::Tls(session) => {
                    let view = self.wbuf.grab_read();
                    if view.buf.is_empty() {
                        break;
                    }
                    let n = session.write(socket, view.buf)?;
                    self.wbuf.move_read(n);
                    n
                }
            };
            if wrote == 0 {
                break;
            }
            iterations += 1;
        }
        if self.wbuf.is_empty() && self.instance_state == InstanceState::Expired {
            self.set_release();
        }
        Ok(iterations)
    }

    /// Advances an in-progress async connect by checking `SO_ERROR` after
    /// a writable wakeup. Returns `true` once the socket is confirmed
    /// connected (caller still needs to run the TLS/ex-handshake steps).
    pub fn poll_connect_writable(&mut self) -> io::Result<bool> {
        debug_assert_eq!(self.connect_state, ConnectState::Send);
        let socket = self.socket.as_ref().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        match socket.take_connect_error()? {
            None => {
                self.connect_state = match &self.transport {
                    Transport::Tls(_) => ConnectState::SslHandshaking,
                    Transport::Plain => ConnectState::Success,
                };
                Ok(true)
            }
            Some(_err) => {
                self.connect_state = ConnectState::Fail;
                Ok(false)
            }
        }
    }

    /// Advances the TLS handshake by one step. Returns `Ok(true)` once
    /// complete (state already moved past `SslHandshaking`).
    pub fn poll_tls_handshake(&mut self) -> Result<bool, ChannelError> {
        let Transport::Tls(session) = &mut self.transport else {
            self.connect_state = ConnectState::Success;
            return Ok(true);
        };
        let socket = self.socket.as_mut().expect("socket present while handshaking");
        match session.step(socket) {
            HandshakeStep::WantRw => Ok(false),
            HandshakeStep::Done => {
                self.connect_state = ConnectState::Success;
                Ok(true)
            }
            HandshakeStep::Failed(_) => {
                self.connect_state = ConnectState::Fail;
                Err(ChannelError::SslHandshaking)
            }
        }
    }

    /// Marks the channel `Expired`: the write buffer still drains, but no
    /// new application writes should be queued. Idempotent.
    pub fn set_expired(&mut self) {
        if self.instance_state == InstanceState::Normal {
            self.instance_state = InstanceState::Expired;
        }
    }

    /// Marks the channel `Delete`: the next reactor pass releases it.
    /// Idempotent; safe to call after `set_expired`.
    pub fn set_release(&mut self) {
        self.instance_state = InstanceState::Delete;
    }

    /// Closes the fd. After this, `fd()` returns -1 and no further I/O is
    /// attempted; matches `releaseInstance()`'s socket teardown.
    pub fn close(&mut self) {
        self.socket.take();
    }

    //--------------------------------------------------------------------
    // Sync helpers (spec.md §4.4): blocking bootstrap reads used only by
    // MultiChannelPool's connectSync/hello exchange, never mixed with the
    // reactor path while the reactor is active.
    //--------------------------------------------------------------------

    /// Reads a `"\r\n"`-terminated line, blocking (one byte at a time,
    /// short-sleeping on `EAGAIN`) until one is available or `timeout`
    /// elapses.
    pub fn get_line_sync(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.rbuf.get_line() {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "get_line_sync timed out"));
            }
            match self.read_raw() {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
                Ok(_) => continue,
                Err(e) if Socket::is_again(&e) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads exactly `size` bytes, blocking until they arrive or `timeout`
    /// elapses.
    pub fn get_data_sync(&mut self, size: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.rbuf.readable_size() >= size {
                let mut out = vec![0u8; size];
                self.rbuf.read_from_buffer(&mut out);
                return Ok(out);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "get_data_sync timed out"));
            }
            match self.read_raw() {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
                Ok(_) => continue,
                Err(e) if Socket::is_again(&e) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Read for ChannelCore {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.rbuf.read_from_buffer(buf);
        Ok(n)
    }
}

impl Write for ChannelCore {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.queue_bytes(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_write(usize::MAX).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    fn connected_pair() -> (ChannelCore, std::net::TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let client_std = std::net::TcpStream::connect(addr).unwrap();
        let (server_std, _) = listener.accept().unwrap();
        server_std.set_nonblocking(true).unwrap();

        let name = test_channel_name();
        let core = ChannelCore::from_connected(name, Socket::from_std(server_std).unwrap());
        (core, client_std)
    }

    // A registry-free stand-in handle for unit tests that don't need a
    // real `ChannelRegistry`.
    fn test_channel_name() -> ChannelName {
        let mut reg: crate::registry::ChannelRegistry<()> = crate::registry::ChannelRegistry::new();
        reg.insert(())
    }

    #[test]
    fn desired_interest_tracks_write_buffer_state() {
        let (mut core, _client) = connected_pair();
        assert_eq!(core.desired_interest(), Interest::readable());

        core.queue_bytes(b"hi");
        assert_eq!(core.desired_interest(), Interest::readable() | Interest::writable());
    }

    #[test]
    fn expired_then_release_is_idempotent_and_ordered() {
        let (mut core, _client) = connected_pair();
        core.set_expired();
        assert_eq!(core.instance_state(), InstanceState::Expired);
        core.set_expired();
        assert_eq!(core.instance_state(), InstanceState::Expired);

        core.set_release();
        assert_eq!(core.instance_state(), InstanceState::Delete);
        core.set_release();
        assert_eq!(core.instance_state(), InstanceState::Delete);
    }

    #[test]
    fn read_raw_and_write_drain_round_trip() {
        let (mut core, mut client) = connected_pair();
        client.write_all(b"ping").unwrap();

        // Give the kernel a moment to deliver the bytes.
        let mut n = 0;
        for _ in 0..100 {
            match core.read_raw() {
                Ok(got) => {
                    n = got;
                    break;
                }
                Err(e) if Socket::is_again(&e) => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(n, 4);
        assert_eq!(core.read_buf().readable_size(), 4);

        core.queue_bytes(b"pong");
        core.drain_write(4).unwrap();
        assert!(core.write_buf().is_empty());

        let mut out = [0u8; 4];
        client.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"pong");
    }

    #[test]
    fn expired_channel_transitions_to_delete_once_write_buffer_drains() {
        let (mut core, mut client) = connected_pair();
        core.queue_bytes(b"bye");
        core.set_expired();
        assert_eq!(core.instance_state(), InstanceState::Expired);

        core.drain_write(4).unwrap();
        assert_eq!(core.instance_state(), InstanceState::Delete);

        let mut out = [0u8; 3];
        client.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"bye");
    }
}
