//! BSD/macOS backend: `kqueue`/`kevent`. The teacher crate only ships an
//! epoll backend; this mirrors its shape (a thin syscall wrapper plus an
//! fd -> token side table) using the `EVFILT_READ`/`EVFILT_WRITE` pair of
//! filters instead of a single combined event mask.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{NetReactorError, Result};
use crate::poller::{Event, Interest, IoPoller, Token};

pub struct KqueuePoller {
    kq: RawFd,
    tokens: HashMap<RawFd, (Token, Interest)>,
}

impl KqueuePoller {
    pub fn new() -> Result<Self> {
        let kq = cvt(unsafe { libc::kqueue() })?;
        Ok(KqueuePoller {
            kq,
            tokens: HashMap::new(),
        })
    }

    fn apply(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        let mut changes = Vec::with_capacity(2);

        changes.push(kevent_for(
            fd,
            libc::EVFILT_READ,
            if interest.is_readable() { libc::EV_ADD } else { libc::EV_DELETE },
            token,
        ));
        changes.push(kevent_for(
            fd,
            libc::EVFILT_WRITE,
            if interest.is_writable() { libc::EV_ADD } else { libc::EV_DELETE },
            token,
        ));

        // EV_DELETE on a filter that was never added returns ENOENT; that's
        // expected whenever a channel only ever wanted one direction, so we
        // submit each change singly and ignore ENOENT specifically.
        for change in changes {
            let mut change = change;
            let ret = unsafe { libc::kevent(self.kq, &change, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(NetReactorError::Io(err));
                }
            }
            let _ = &mut change;
        }

        Ok(())
    }
}

impl IoPoller for KqueuePoller {
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        if self.tokens.contains_key(&fd) {
            return Err(NetReactorError::AlreadyRegistered(fd));
        }
        self.apply(fd, token, interest)?;
        self.tokens.insert(fd, (token, interest));
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        let (token, _) = self.tokens.remove(&fd).ok_or(NetReactorError::NotRegistered(fd))?;
        self.apply(fd, token, Interest::empty())
    }

    fn set_mask(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let token = self.tokens.get(&fd).ok_or(NetReactorError::NotRegistered(fd))?.0;
        self.apply(fd, token, interest)?;
        self.tokens.insert(fd, (token, interest));
        Ok(())
    }

    fn or_mask(&mut self, fd: RawFd, mask: Interest) -> Result<()> {
        let current = self.tokens.get(&fd).ok_or(NetReactorError::NotRegistered(fd))?.1;
        self.set_mask(fd, current | mask)
    }

    fn and_mask(&mut self, fd: RawFd, mask: Interest) -> Result<()> {
        let current = self.tokens.get(&fd).ok_or(NetReactorError::NotRegistered(fd))?.1;
        self.set_mask(fd, current & mask)
    }

    fn dispatch(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> Result<()> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map(|t| t as *const libc::timespec).unwrap_or(std::ptr::null());

        let mut raw = vec![unsafe { std::mem::zeroed::<libc::kevent>() }; self.tokens.len().max(32)];

        let n = match unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                raw.as_mut_ptr(),
                raw.len() as i32,
                ts_ptr,
            )
        } {
            n if n >= 0 => n as usize,
            _ => {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    0
                } else {
                    return Err(NetReactorError::Io(err));
                }
            }
        };

        events.clear();
        for raw_event in &raw[..n] {
            let mut readiness = Interest::empty();
            if raw_event.filter == libc::EVFILT_READ {
                readiness = readiness | Interest::readable();
            }
            if raw_event.filter == libc::EVFILT_WRITE {
                readiness = readiness | Interest::writable();
            }
            if raw_event.flags & libc::EV_EOF != 0 {
                readiness = readiness | Interest::hup();
            }
            if raw_event.flags & libc::EV_ERROR != 0 {
                readiness = readiness | Interest::error();
            }

            events.push(Event {
                token: Token(raw_event.udata as usize),
                readiness,
            });
        }

        Ok(())
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

impl AsRawFd for KqueuePoller {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

fn kevent_for(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: token.0 as *mut libc::c_void,
    }
}

fn cvt(ret: libc::c_int) -> Result<RawFd> {
    if ret < 0 {
        Err(NetReactorError::Io(std::io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn add_remove_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let fd = listener.as_raw_fd();

        let mut poller = KqueuePoller::new().unwrap();
        poller.add(fd, Token(7), Interest::readable()).unwrap();
        assert!(matches!(
            poller.add(fd, Token(7), Interest::readable()),
            Err(NetReactorError::AlreadyRegistered(_))
        ));

        poller.remove(fd).unwrap();
        assert!(matches!(poller.remove(fd), Err(NetReactorError::NotRegistered(_))));
    }
}
