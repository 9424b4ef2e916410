//! Pluggable readiness multiplexer. [`IoPoller::create`] picks a backend
//! by name (`"auto"`, `"epoll"`, `"kqueue"`); callers drive everything else
//! through the unified [`IoPoller`] trait so the reactor loop never needs to
//! know which syscall family is underneath.

mod epoll;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
mod kqueue;

use std::fmt;
use std::ops;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{NetReactorError, Result};

/// Readiness/interest bitset: readable, writable, error, hangup.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interest(u8);

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const HUP: u8 = 0b1000;
const ALL: u8 = READABLE | WRITABLE | ERROR | HUP;

impl Interest {
    #[inline]
    pub fn empty() -> Self {
        Interest(0)
    }

    #[inline]
    pub fn readable() -> Self {
        Interest(READABLE)
    }

    #[inline]
    pub fn writable() -> Self {
        Interest(WRITABLE)
    }

    #[inline]
    pub fn error() -> Self {
        Interest(ERROR)
    }

    #[inline]
    pub fn hup() -> Self {
        Interest(HUP)
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Interest::readable())
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Interest::writable())
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Interest::error())
    }

    #[inline]
    pub fn is_hup(self) -> bool {
        self.contains(Interest::hup())
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Interest) -> bool {
        (self & other) == other
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;
    #[inline]
    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl ops::BitAnd for Interest {
    type Output = Interest;
    #[inline]
    fn bitand(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl ops::Not for Interest {
    type Output = Interest;
    #[inline]
    fn not(self) -> Interest {
        Interest(!self.0 & ALL)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        write!(f, "Interest(")?;
        for (flag, name) in [
            (Interest::readable(), "READ"),
            (Interest::writable(), "WRITE"),
            (Interest::error(), "ERROR"),
            (Interest::hup(), "HUP"),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// Opaque correlation token handed back on readiness, mirroring the
/// original design's fd-indexed registration record. Callers typically
/// encode a channel's registry slot here.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

/// One readiness notification delivered by [`IoPoller::dispatch`].
#[derive(Copy, Clone, Debug)]
pub struct Event {
    pub token: Token,
    pub readiness: Interest,
}

/// Unified readiness-multiplexer interface. Implemented by the `epoll`
/// backend (Linux) and the `kqueue` backend (BSD/macOS).
pub trait IoPoller {
    /// Registers `fd` with the given token and initial interest. Fails if
    /// `fd` is already registered.
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()>;

    /// Deregisters `fd`.
    fn remove(&mut self, fd: RawFd) -> Result<()>;

    /// Overwrites `fd`'s interest set.
    fn set_mask(&mut self, fd: RawFd, interest: Interest) -> Result<()>;

    /// ORs `mask` into `fd`'s interest set.
    fn or_mask(&mut self, fd: RawFd, mask: Interest) -> Result<()>;

    /// ANDs `mask` into `fd`'s interest set.
    fn and_mask(&mut self, fd: RawFd, mask: Interest) -> Result<()>;

    /// Waits up to `timeout` for readiness and appends ready events to
    /// `events`. An `EINTR` wait is treated as a zero-event timeout.
    fn dispatch(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> Result<()>;
}

/// Instantiates a poller backend by name. `"auto"` picks the native
/// backend for the current platform.
pub fn create(kind: &str) -> Result<Box<dyn IoPoller>> {
    match kind {
        "auto" => create_native(),
        "epoll" => {
            if cfg!(target_os = "linux") {
                Ok(Box::new(epoll::EpollPoller::new()?))
            } else {
                Err(NetReactorError::BackendUnavailable("epoll".to_string()))
            }
        }
        "kqueue" => create_kqueue(),
        other => Err(NetReactorError::BackendUnavailable(other.to_string())),
    }
}

#[cfg(target_os = "linux")]
fn create_native() -> Result<Box<dyn IoPoller>> {
    Ok(Box::new(epoll::EpollPoller::new()?))
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
fn create_native() -> Result<Box<dyn IoPoller>> {
    Ok(Box::new(kqueue::KqueuePoller::new()?))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn create_native() -> Result<Box<dyn IoPoller>> {
    Err(NetReactorError::BackendUnavailable("auto".to_string()))
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
fn create_kqueue() -> Result<Box<dyn IoPoller>> {
    Ok(Box::new(kqueue::KqueuePoller::new()?))
}

#[cfg(not(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
fn create_kqueue() -> Result<Box<dyn IoPoller>> {
    Err(NetReactorError::BackendUnavailable("kqueue".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_algebra_matches_set_or_and() {
        let m1 = Interest::readable();
        let m2 = Interest::writable();
        let m3 = Interest::readable();

        let combined = (m1 | m2) & m3;
        assert!(combined.is_readable());
        assert!(!combined.is_writable());
    }

    #[test]
    fn not_is_restricted_to_known_flags() {
        let none = Interest::empty();
        let all = !none;
        assert!(all.is_readable() && all.is_writable() && all.is_error() && all.is_hup());
    }
}
