//! Linux backend: a thin wrapper over `epoll_create1`/`epoll_ctl`/`epoll_wait`.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::error::{NetReactorError, Result};
use crate::poller::{Event, Interest, IoPoller, Token};

pub struct EpollPoller {
    epfd: RawFd,
    // epoll_ctl only ever takes the full desired mask, so we keep the
    // current token + interest per fd to support `or_mask`/`and_mask` and
    // to reject double-registration.
    tokens: HashMap<RawFd, (Token, Interest)>,
}

impl EpollPoller {
    pub fn new() -> Result<Self> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(EpollPoller {
            epfd,
            tokens: HashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0 as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) })?;
        Ok(())
    }
}

impl IoPoller for EpollPoller {
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        if self.tokens.contains_key(&fd) {
            return Err(NetReactorError::AlreadyRegistered(fd));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)?;
        self.tokens.insert(fd, (token, interest));
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        if self.tokens.remove(&fd).is_none() {
            return Err(NetReactorError::NotRegistered(fd));
        }
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event) })?;
        Ok(())
    }

    fn set_mask(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let token = self.tokens.get(&fd).ok_or(NetReactorError::NotRegistered(fd))?.0;
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)?;
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
        let millis = timeout
            .map(|d| d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; self.tokens.len().max(32)];

        let n = match unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), raw.len() as i32, millis)
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
            events.push(Event {
                token: Token(raw_event.u64 as usize),
                readiness: epoll_to_interest(raw_event.events as libc::c_int),
            });
        }

        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

impl AsRawFd for EpollPoller {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= EPOLLIN;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    if interest.is_hup() {
        kind |= EPOLLRDHUP;
    }
    kind as u32
}

fn epoll_to_interest(epoll: libc::c_int) -> Interest {
    let mut kind = Interest::empty();
    if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
        kind = kind | Interest::readable();
    }
    if (epoll & EPOLLOUT) != 0 {
        kind = kind | Interest::writable();
    }
    if (epoll & EPOLLERR) != 0 {
        kind = kind | Interest::error();
    }
    if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
        kind = kind | Interest::hup();
    }
    kind
}

fn cvt(ret: libc::c_int) -> Result<RawFd> {
    if ret < 0 {
        Err(NetReactorError::Io(std::io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}
