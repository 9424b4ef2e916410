//! A channel speaking RESP (spec.md §4.7), grounded in
//! `examples/original_source/src/pw/pw_redispacket.h`. Framing is delegated
//! entirely to [`crate::resp::Reader`]; this module only wires that reader
//! into the reactor-facing [`ChannelDriver`] surface.

use std::os::unix::io::RawFd;

use crate::channel::{ChannelCore, ChannelDriver, ChannelError, DriverOutcome, InstanceState};
use crate::packet::Packet;
use crate::poller::Interest;
use crate::registry::ChannelName;
use crate::resp::{RedisPacket, Reader, Value};

/// Application hooks for a `RedisChannel`.
pub trait RedisChannelHandler {
    fn on_read_value(&mut self, name: ChannelName, value: &Value);
    fn on_error(&mut self, name: ChannelName, err: ChannelError);
}

pub struct RedisChannel<H: RedisChannelHandler> {
    core: ChannelCore,
    reader: Reader,
    handler: H,
}

impl<H: RedisChannelHandler> RedisChannel<H> {
    pub fn new(core: ChannelCore, handler: H) -> Self {
        RedisChannel {
            core,
            reader: Reader::new(),
            handler,
        }
    }

    pub fn core(&self) -> &ChannelCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ChannelCore {
        &mut self.core
    }

    pub fn send(&mut self, value: Value) {
        let pk = RedisPacket::new(value);
        self.core.queue_write(&pk);
    }
}

impl<H: RedisChannelHandler> ChannelDriver for RedisChannel<H> {
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

        let chunk = self.core.read_buf().read_from_buffer_all();
        if let Err(_e) = self.reader.feed(&chunk) {
            self.handler.on_error(self.core.name(), ChannelError::InvalidPacket);
            return DriverOutcome::Release;
        }

        while let Some(value) = self.reader.pop() {
            self.handler.on_read_value(self.core.name(), &value);
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
}
