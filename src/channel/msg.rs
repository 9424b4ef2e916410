//! The length-prefixed "Msg" protocol channel (spec.md §4.4/§4.5,
//! grounded in `examples/original_source/src/pw/pw_msgchannel.h`):
//! `MsgPacket` header line, `\r\n`, exactly `body-length` bytes of body,
//! repeat. Also owns the periodic idle-timeout check the original ran off
//! `Timer::Event` (`TIMER_CHECK_10SEC`).

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::channel::{ChannelCore, ChannelDriver, ChannelError, DriverOutcome, InstanceState, RecvState};
use crate::packet::{MsgPacket, Packet};
use crate::poller::Interest;
use crate::registry::ChannelName;

/// Idle-timeout check period the original ran this channel type's
/// `checkPingTimeout` on.
pub const CHECK_PING_INTERVAL: Duration = Duration::from_millis(25_000);

/// Application hooks for a `MsgChannel`, mirroring
/// `MsgChannel::eventReadPacket`/`eventPingTimeout`/`eventError`.
pub trait MsgChannelHandler {
    fn on_read_packet(&mut self, name: ChannelName, pk: &MsgPacket);
    fn on_error(&mut self, name: ChannelName, err: ChannelError);
    /// Called when no bytes have been seen for `CHECK_PING_INTERVAL`.
    /// Default: do nothing (no keep-alive packet sent).
    fn on_ping_timeout(&mut self, _name: ChannelName) {}
}

/// A channel speaking the Msg wire protocol, parameterized over an
/// application-supplied handler.
pub struct MsgChannel<H: MsgChannelHandler> {
    core: ChannelCore,
    state: RecvState,
    header: Option<(MsgPacket, usize)>,
    handler: H,
}

impl<H: MsgChannelHandler> MsgChannel<H> {
    pub fn new(core: ChannelCore, handler: H) -> Self {
        MsgChannel {
            core,
            state: RecvState::Start,
            header: None,
            handler,
        }
    }

    pub fn core(&self) -> &ChannelCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ChannelCore {
        &mut self.core
    }

    pub fn send(&mut self, pk: &MsgPacket) {
        self.core.queue_write(pk);
    }

    /// Drives the receive state machine as far as the currently buffered
    /// bytes allow. Dispatches a completed packet to the handler per
    /// iteration, so several pipelined packets in one read are all
    /// delivered before returning.
    fn drain_packets(&mut self) {
        loop {
            match self.state {
                RecvState::Start => {
                    let Some(line) = self.core.read_buf().get_line() else {
                        return;
                    };
                    match MsgPacket::parse_header(&line) {
                        Ok((pk, body_len)) => {
                            self.header = Some((pk, body_len));
                            self.state = RecvState::Body;
                        }
                        Err(_) => {
                            self.state = RecvState::Error;
                            self.handler.on_error(self.core.name(), ChannelError::InvalidPacket);
                            return;
                        }
                    }
                }
                RecvState::Body => {
                    let (_, body_len) = self.header.as_ref().expect("header set before Body state");
                    let body_len = *body_len;
                    if self.core.read_buf().readable_size() < body_len {
                        return;
                    }
                    let (mut pk, _) = self.header.take().expect("header set before Body state");
                    let mut body = vec![0u8; body_len];
                    self.core.read_buf().read_from_buffer(&mut body);
                    pk.body = body;

                    self.handler.on_read_packet(self.core.name(), &pk);
                    self.state = RecvState::Start;
                }
                RecvState::Error | RecvState::Done | RecvState::FirstLine | RecvState::Header => {
                    return;
                }
            }
        }
    }
}

impl<H: MsgChannelHandler> ChannelDriver for MsgChannel<H> {
    fn name(&self) -> ChannelName {
        self.core.name()
    }

    fn fd(&self) -> RawFd {
        self.core.fd()
    }

    fn instance_state(&self) -> InstanceState {
        self.core.instance_state()
    }

    fn desired_interest(&self) -> Interest {
        self.core.desired_interest()
    }

    fn on_readable(&mut self) -> DriverOutcome {
        match self.core.read_raw() {
            Ok(0) => {
                self.handler.on_error(self.core.name(), ChannelError::ReadClose);
                return DriverOutcome::Release;
            }
            Ok(_) => {}
            Err(e) if crate::socket::Socket::is_again(&e) => return DriverOutcome::Continue,
            Err(_) => {
                self.handler.on_error(self.core.name(), ChannelError::Read);
                return DriverOutcome::Release;
            }
        }

        self.drain_packets();
        if self.state == RecvState::Error {
            return DriverOutcome::Release;
        }
        DriverOutcome::Continue
    }

    fn on_writable(&mut self) -> DriverOutcome {
        match self.core.drain_write(1) {
            Ok(_) => DriverOutcome::Continue,
            Err(e) if crate::socket::Socket::is_again(&e) => DriverOutcome::Continue,
            Err(_) => {
                self.handler.on_error(self.core.name(), ChannelError::Write);
                DriverOutcome::Release
            }
        }
    }

    fn on_error(&mut self, _errno: i32) -> DriverOutcome {
        self.handler.on_error(self.core.name(), ChannelError::Normal);
        DriverOutcome::Release
    }

    fn set_expired(&mut self) {
        self.core.set_expired();
    }

    fn set_release(&mut self) {
        self.core.set_release();
    }

    fn check_ping_timeout(&mut self, now: Instant, limit: Duration) -> DriverOutcome {
        if self.core.idle_for(now) >= limit {
            self.handler.on_ping_timeout(self.core.name());
        }
        DriverOutcome::Continue
    }
}
