//! CLI entry point (spec.md §6): `netreactord [CONFIG_PATH]`. Wires config
//! loading, log initialization, and the `Instance` bootstrap together; all
//! the framework logic lives in the library crate.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use netreactor::channel::msg::{MsgChannel, MsgChannelHandler};
use netreactor::channel::{ChannelCore, ChannelDriver, ChannelError};
use netreactor::config::Config;
use netreactor::instance::{Instance, InstanceHandler};
use netreactor::listener::ListenerKind;
use netreactor::packet::MsgPacket;
use netreactor::registry::{ChannelName, ChannelRegistry};
use netreactor::socket::Socket;
use netreactor::tls::TlsContext;

#[derive(Parser)]
#[command(name = "netreactord", version, about = "netreactor server process")]
struct Args {
    /// Path to the INI config file.
    #[arg(default_value = "./config.ini")]
    config_path: PathBuf,
}

/// Bundled state the framework-facing `InstanceHandler` hooks into. This is
/// the minimal application this binary ships — a Msg-protocol echo server on
/// whichever `<tag>.port` entries the config file carries — left in place as
/// the demonstration wiring for anyone embedding this crate to start from.
struct EchoApp {
    names: ChannelRegistry<()>,
}

#[derive(Default)]
struct EchoHandler;

impl MsgChannelHandler for EchoHandler {
    fn on_read_packet(&mut self, name: ChannelName, pk: &MsgPacket) {
        info!("netreactord: {name} -> {} ({} byte body)", pk.command, pk.body.len());
    }

    fn on_error(&mut self, name: ChannelName, err: ChannelError) {
        info!("netreactord: {name} closed: {err:?}");
    }
}

impl InstanceHandler for EchoApp {
    fn on_accept(
        &mut self,
        kind: ListenerKind,
        socket: Socket,
        peer: SocketAddr,
        _tls: Option<&TlsContext>,
    ) -> Option<Box<dyn ChannelDriver>> {
        info!("netreactord: accepted {peer} on {kind:?}");
        let name = self.names.insert(());
        let core = ChannelCore::from_connected(name, socket);
        Some(Box::new(MsgChannel::new(core, EchoHandler)))
    }
}

fn run() -> netreactor::error::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config_path)?;

    let _logger = netreactor::logging::init(&config.log)?;
    info!("netreactord: starting ({})", config.app_name);

    let mut app = EchoApp {
        names: ChannelRegistry::new(),
    };

    let mut instance = Instance::new(config, args.config_path.as_path())?;
    instance.bind_listeners(&mut app)?;
    instance.run(&mut app)?;

    info!("netreactord: exiting cleanly");
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("netreactord: fatal: {e}");
            eprintln!("netreactord: fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
