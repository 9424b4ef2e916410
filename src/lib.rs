//! `netreactor`: an event-driven TCP server/client framework built around a
//! pluggable reactor (epoll/kqueue), a generational channel registry, and
//! protocol-specific channel state machines for the length-prefixed "Msg"
//! wire protocol, HTTP/1.x, and RESP (Redis).
//!
//! A minimal echo server looks like:
//!
//! ```no_run
//! use netreactor::channel::msg::{MsgChannel, MsgChannelHandler};
//! use netreactor::channel::{ChannelCore, ChannelDriver, ChannelError};
//! use netreactor::config::Config;
//! use netreactor::instance::{Instance, InstanceHandler};
//! use netreactor::listener::ListenerKind;
//! use netreactor::packet::MsgPacket;
//! use netreactor::registry::{ChannelName, ChannelRegistry};
//! use netreactor::socket::Socket;
//! use netreactor::tls::TlsContext;
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! impl MsgChannelHandler for Echo {
//!     fn on_read_packet(&mut self, _name: ChannelName, _pk: &MsgPacket) {}
//!     fn on_error(&mut self, _name: ChannelName, _err: ChannelError) {}
//! }
//!
//! struct App {
//!     names: ChannelRegistry<()>,
//! }
//!
//! impl InstanceHandler for App {
//!     fn on_accept(
//!         &mut self,
//!         _kind: ListenerKind,
//!         socket: Socket,
//!         _peer: std::net::SocketAddr,
//!         _tls: Option<&TlsContext>,
//!     ) -> Option<Box<dyn ChannelDriver>> {
//!         let name = self.names.insert(());
//!         let core = ChannelCore::from_connected(name, socket);
//!         Some(Box::new(MsgChannel::new(core, Echo)))
//!     }
//! }
//!
//! # fn main() -> netreactor::error::Result<()> {
//! let config = Config::parse("[main]\nsvc.port = 7000\n")?;
//! let instance = Instance::new(config, "config.ini")?;
//! let mut app = App { names: ChannelRegistry::new() };
//! // instance.bind_listeners(&mut app)?;
//! // instance.run(&mut app)?;
//! # let _ = instance;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod instance;
pub mod io_buffer;
pub mod job;
pub mod listener;
pub mod logging;
pub mod packet;
pub mod poller;
pub mod pool;
pub mod registry;
pub mod resp;
pub mod socket;
pub mod timer;
pub mod tls;
