//! Process bootstrap and main loop (spec.md §4.11), grounded in
//! `examples/original_source/src/pw_instance.h` and in this crate's own
//! `evloop::EventLoop`/`Handler` (kept elsewhere in this tree as reference):
//! the same non-recursive pattern applies here — `InstanceHandler` hooks take
//! a concrete `&mut Instance`/`&Config` rather than a generic `Instance<H>`.
//!
//! Where the original used `alarm(2)` plus a signal handler to bound a single
//! blocking `select`, this version relies on the poller's own documented
//! behavior (an interrupted wait is a zero-event timeout, see
//! [`crate::poller::IoPoller::dispatch`]): every signal handler here only
//! flips an `AtomicBool`, and the next loop turn — woken by the interrupt or
//! by `poller.timeout` at the latest — observes it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::channel::ChannelDriver;
use crate::config::{ChildType, Config, PollerType};
use crate::error::{NetReactorError, Result};
use crate::listener::{Listener, ListenerKind};
use crate::poller::{self, Event, Interest, IoPoller, Token};
use crate::registry::{ChannelName, ChannelRegistry};
use crate::socket::Socket;
use crate::timer::{Fired, Timer};
use crate::tls::TlsContext;

/// How often idle channels are swept for `check_ping_timeout`, independent
/// of `config.poller_timeout` (which only bounds signal latency).
const PING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Maps a registered fd back to what it belongs to, so a poller event can be
/// routed without every listener/channel needing a unique `Token` scheme of
/// its own — the fd itself is already unique while registered.
enum Source {
    Listener(usize),
    Channel(ChannelName),
}

/// Application hooks for the bootstrap sequence and main-loop events
/// (spec.md §4.11's `eventInitListener`/`eventInitChild`/`eventAccept`/
/// `eventExit` family). Every hook has a no-op default so an application
/// only overrides what it needs.
pub trait InstanceHandler {
    /// Called once per bound listener, for applications that want to track
    /// per-listener state (e.g. a distinct `JobManager` per admin port).
    fn on_init_listener(&mut self, kind: ListenerKind, listener: &Listener) {
        let _ = (kind, listener);
    }

    /// Supplies the TLS context for an SSL-kind listener before it is
    /// bound. Returning `None` for an SSL-kind tag that's present in
    /// `config.ports` fails [`Instance::bind_listeners`].
    fn tls_context_for(&self, kind: ListenerKind) -> Option<TlsContext> {
        let _ = kind;
        None
    }

    /// Called once at startup after listeners are bound, before the first
    /// main-loop turn — the place to open a `MultiChannelPool`'s upstream
    /// connections or register a `Timer` entry.
    fn on_init_extras(&mut self, config: &Config, timer: &mut Timer) {
        let _ = (config, timer);
    }

    /// Runs once in each freshly forked child (`child.type = multi`),
    /// before it enters its own main loop, so per-child state (e.g. a log
    /// file suffix) can be set up. `index` is `0..config.child_count`.
    fn on_init_child(&mut self, index: u32) {
        let _ = index;
    }

    /// A connection was accepted on `kind`'s listener. Returns the boxed
    /// channel to register with the reactor, or `None` to drop it
    /// immediately.
    fn on_accept(&mut self, kind: ListenerKind, socket: Socket, peer: SocketAddr, tls: Option<&TlsContext>) -> Option<Box<dyn ChannelDriver>>;

    /// Called once per main-loop turn, before the timer sweep, so the
    /// application can tick its own `JobManager`(s) — generic over packet
    /// type, so `Instance` cannot own them directly.
    fn on_job_sweep(&mut self) {}

    /// One timer entry fired.
    fn on_timer(&mut self, fired: Fired) {
        let _ = fired;
    }

    /// `SIGHUP` was received and the config file has already been
    /// re-read; `config` is the freshly reloaded value.
    fn on_reload(&mut self, config: &Config) {
        let _ = config;
    }

    /// Called once per main-loop turn, after every other hook.
    fn on_end_turn(&mut self) {}

    /// A forked child exited; only invoked in the parent/supervisor
    /// process.
    fn on_exit_child(&mut self, pid: i32, status: i32) {
        let _ = (pid, status);
    }

    /// The run flag dropped (signal-driven shutdown). Last chance to flush
    /// state before the process exits.
    fn on_exit(&mut self) {}
}

/// Signal-driven flags a running `Instance` polls once per turn. Shared
/// with `signal-hook`'s registered handlers, which only ever set these —
/// all the actual reaction happens on the main thread.
struct Signals {
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    check_child: Arc<AtomicBool>,
}

fn install_signals() -> Result<Signals> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    let check_child = Arc::new(AtomicBool::new(false));

    // SIGPIPE/SIGALRM: ignored outright, matching the original's blanket
    // "writes to a closed socket must not kill the process" policy. Neither
    // carries state a flag would help with.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGALRM, libc::SIG_IGN);
    }

    let map_err = |e: std::io::Error| NetReactorError::Config(format!("installing signal handler: {e}"));

    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&reload)).map_err(map_err)?;
    signal_hook::flag::register(signal_hook::consts::SIGCHLD, Arc::clone(&check_child)).map_err(map_err)?;
    for sig in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGUSR1,
        signal_hook::consts::SIGUSR2,
    ] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown)).map_err(map_err)?;
    }

    Ok(Signals { shutdown, reload, check_child })
}

fn listener_kind_for_tag(tag: &str) -> ListenerKind {
    match tag {
        "svc" => ListenerKind::Service,
        "svcssl" => ListenerKind::ServiceSsl,
        "http" => ListenerKind::Http,
        "https" => ListenerKind::Https,
        "admin" => ListenerKind::Admin,
        "adminssl" => ListenerKind::AdminSsl,
        _ => ListenerKind::Custom,
    }
}

/// Owns the poller, the bound listeners, every live channel, and the timer,
/// and drives them through spec.md §4.11's bootstrap-then-loop sequence.
/// Application-specific behavior is supplied entirely through
/// [`InstanceHandler`]; `Instance` itself knows nothing about any one
/// protocol.
pub struct Instance {
    config: Config,
    config_path: std::path::PathBuf,
    poller: Box<dyn IoPoller>,
    listeners: Vec<Listener>,
    channels: ChannelRegistry<Box<dyn ChannelDriver>>,
    sources: HashMap<RawFd, Source>,
    timer: Timer,
    signals: Signals,
    children: Vec<libc::pid_t>,
    events: Vec<Event>,
    last_ping_sweep: Instant,
}

impl Instance {
    /// Builds the poller and installs signal handlers, but binds no
    /// listeners yet — call [`Instance::bind_listeners`] next.
    pub fn new(config: Config, config_path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let poller_kind = match config.poller_type {
            PollerType::Auto => "auto",
            PollerType::Epoll => "epoll",
            PollerType::Kqueue => "kqueue",
        };
        let poller = poller::create(poller_kind)?;
        let signals = install_signals()?;

        Ok(Instance {
            config,
            config_path: config_path.into(),
            poller,
            listeners: Vec::new(),
            channels: ChannelRegistry::new(),
            sources: HashMap::new(),
            timer: Timer::new(),
            signals,
            children: Vec::new(),
            events: Vec::with_capacity(256),
            last_ping_sweep: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn timer_mut(&mut self) -> &mut Timer {
        &mut self.timer
    }

    /// Binds every `<tag>.port` entry present in the config, in the fixed
    /// order of [`crate::config::PORT_TAGS`], and registers each with the
    /// poller.
    pub fn bind_listeners<H: InstanceHandler>(&mut self, handler: &mut H) -> Result<()> {
        for tag in crate::config::PORT_TAGS {
            let Some(port) = self.config.port(tag) else { continue };
            let kind = listener_kind_for_tag(tag);
            let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();

            let tls = if kind.is_ssl() {
                let ctx = handler.tls_context_for(kind).ok_or_else(|| {
                    NetReactorError::Config(format!("{tag}.port is configured but no TLS context was supplied"))
                })?;
                Some(ctx)
            } else {
                None
            };

            let listener = Listener::bind(kind, addr, tls).map_err(NetReactorError::Io)?;
            let fd = listener.as_raw_fd();
            let idx = self.listeners.len();

            self.poller.add(fd, Token(fd as usize), Interest::readable())?;
            self.sources.insert(fd, Source::Listener(idx));
            handler.on_init_listener(kind, &listener);
            self.listeners.push(listener);

            info!("netreactor: listening on {tag} ({addr})");
        }
        Ok(())
    }

    fn register_channel(&mut self, channel: Box<dyn ChannelDriver>) -> ChannelName {
        let fd = channel.fd();
        let interest = channel.desired_interest();
        let name = self.channels.insert(channel);
        self.sources.insert(fd, Source::Channel(name));
        if let Err(e) = self.poller.add(fd, Token(fd as usize), interest) {
            warn!("netreactor: failed to register accepted channel: {e}");
        }
        name
    }

    fn release_channel(&mut self, name: ChannelName) {
        if let Some(channel) = self.channels.remove(name) {
            let fd = channel.fd();
            self.sources.remove(&fd);
            let _ = self.poller.remove(fd);
            self.timer.remove_client(name.as_u64());
        }
    }

    fn accept_all<H: InstanceHandler>(&mut self, idx: usize, handler: &mut H) {
        let Some(listener) = self.listeners.get(idx) else { return };
        let kind = listener.kind();
        let tls = listener.tls().cloned();

        loop {
            // Re-borrow per iteration rather than holding `listener` live:
            // `register_channel` below needs `&mut self`.
            let accepted = match self.listeners[idx].accept_one() {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(e) => {
                    warn!("netreactor: accept on {kind:?} listener failed: {e}");
                    return;
                }
            };
            let (socket, peer) = accepted;
            if let Some(channel) = handler.on_accept(kind, socket, peer, tls.as_ref()) {
                self.register_channel(channel);
            }
        }
    }

    fn dispatch_channel_event(&mut self, name: ChannelName, readiness: Interest) {
        use crate::channel::DriverOutcome;

        let mut outcome = DriverOutcome::Continue;
        if let Some(channel) = self.channels.get_mut(name) {
            if readiness.is_error() || readiness.is_hup() {
                outcome = channel.on_error(0);
            } else {
                if readiness.is_readable() && outcome == DriverOutcome::Continue {
                    outcome = channel.on_readable();
                }
                if readiness.is_writable() && outcome == DriverOutcome::Continue {
                    outcome = channel.on_writable();
                }
            }
        }

        match outcome {
            DriverOutcome::Release => self.release_channel(name),
            DriverOutcome::Continue => {
                if let Some(channel) = self.channels.get(name) {
                    if channel.instance_state() == crate::channel::InstanceState::Delete {
                        self.release_channel(name);
                    } else {
                        let _ = self.poller.set_mask(channel.fd(), channel.desired_interest());
                    }
                }
            }
        }
    }

    fn sweep_ping_timeouts(&mut self) {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_ping_sweep) < PING_SWEEP_INTERVAL {
            return;
        }
        self.last_ping_sweep = now;

        let limit = self.config.timeout_ping;
        let mut to_release = Vec::new();
        for (name, channel) in self.channels.iter_mut() {
            use crate::channel::DriverOutcome;
            if channel.check_ping_timeout(now, limit) == DriverOutcome::Release {
                to_release.push(name);
            }
        }
        for name in to_release {
            self.release_channel(name);
        }
    }

    fn reload_config(&mut self) -> Result<()> {
        self.config = Config::load(&self.config_path)?;
        Ok(())
    }

    fn reap_children<H: InstanceHandler>(&mut self, handler: &mut H) {
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                return;
            }
            self.children.retain(|&p| p != pid);
            handler.on_exit_child(pid, status);
        }
    }

    /// One main-loop turn: flag checks, poller dispatch, event routing,
    /// ping sweep, job sweep, timer sweep, end-of-turn hook.
    fn turn<H: InstanceHandler>(&mut self, handler: &mut H) -> Result<()> {
        if self.signals.check_child.swap(false, Ordering::SeqCst) {
            self.reap_children(handler);
        }
        if self.signals.reload.swap(false, Ordering::SeqCst) {
            match self.reload_config() {
                Ok(()) => handler.on_reload(&self.config),
                Err(e) => error!("netreactor: config reload failed, keeping previous config: {e}"),
            }
        }

        self.events.clear();
        self.poller.dispatch(Some(self.config.poller_timeout), &mut self.events)?;

        let events: Vec<Event> = self.events.drain(..).collect();
        for event in events {
            let fd = event.token.0 as RawFd;
            match self.sources.get(&fd) {
                Some(&Source::Listener(idx)) => self.accept_all(idx, handler),
                Some(&Source::Channel(name)) => self.dispatch_channel_event(name, event.readiness),
                None => {}
            }
        }

        self.sweep_ping_timeouts();
        handler.on_job_sweep();
        for fired in self.timer.check() {
            handler.on_timer(fired);
        }
        handler.on_end_turn();
        Ok(())
    }

    fn main_loop<H: InstanceHandler>(mut self, handler: &mut H) -> Result<()> {
        handler.on_init_extras(&self.config, &mut self.timer);
        while !self.signals.shutdown.load(Ordering::SeqCst) {
            self.turn(handler)?;
        }
        handler.on_exit();
        Ok(())
    }

    /// Forks `config.child_count` worker children, each of which inherits
    /// the already-bound listener fds and runs its own independent main
    /// loop (its own poller instance, since an epoll/kqueue fd is
    /// process-local). The calling process becomes a pure supervisor: it
    /// reaps exits and forwards shutdown signals, never serving traffic
    /// itself.
    fn fork_and_supervise<H: InstanceHandler>(mut self, handler: &mut H) -> Result<()> {
        for index in 0..self.config.child_count {
            let pid = unsafe { libc::fork() };
            match pid {
                -1 => return Err(NetReactorError::Io(std::io::Error::last_os_error())),
                0 => {
                    handler.on_init_child(index);
                    return self.main_loop(handler);
                }
                child_pid => self.children.push(child_pid),
            }
        }

        info!("netreactor: supervising {} child worker(s)", self.children.len());
        while !self.signals.shutdown.load(Ordering::SeqCst) {
            if self.signals.check_child.swap(false, Ordering::SeqCst) {
                self.reap_children(handler);
            }
            std::thread::sleep(Duration::from_millis(200));
        }

        for &pid in &self.children {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        for &pid in &self.children {
            let mut status = 0;
            unsafe {
                libc::waitpid(pid, &mut status, 0);
            }
        }
        handler.on_exit();
        Ok(())
    }

    /// Enters the bootstrap-then-loop sequence. Consumes `self`: under
    /// `child.type = multi`, a forked child never returns from this call
    /// until it shuts down, and the parent supervises until every child has
    /// exited.
    pub fn run<H: InstanceHandler>(self, handler: &mut H) -> Result<()> {
        if self.config.child_type == ChildType::Multi && self.config.child_count > 0 {
            self.fork_and_supervise(handler)
        } else {
            self.main_loop(handler)
        }
    }
}
