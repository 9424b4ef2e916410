//! `group -> host -> {redundant channels}` connection pool (spec.md §4.9),
//! grounded in `examples/original_source/src/pw_multichannel_if.h`. Each
//! level keeps its own round-robin cursor; per spec.md's "cursors must
//! advance before the channel they point at is removed" requirement, every
//! removal path rotates the owning cursor off a doomed index first.
//!
//! The original's `MultiChannelInterface` embeds reconnect state directly
//! in a `MsgChannel` subclass reachable via a raw pointer the pool stores.
//! Here the pool owns its channels outright as `Box<dyn PoolChannel>`,
//! addressed through the same generational [`ChannelRegistry`] used
//! elsewhere, so a stale `ChannelName` captured before a reconnect can
//! never alias a different channel that reused its slot.

use std::collections::HashMap;
use std::time::Duration;

use indexmap::IndexMap;

use crate::channel::{ChannelDriver, ChannelError};
use crate::packet::MsgPacket;
use crate::registry::{ChannelName, ChannelRegistry};

/// `(host, port)`, matching the original's `host_type`.
pub type HostKey = (String, u16);

/// Per-channel timer event ids used with [`crate::timer::Timer`], mirroring
/// `MultiChannelInterface::TIMER_RECONNECT_INIT`/`TIMER_RECONNECT_RESPONSE`.
pub const TIMER_RECONNECT_INIT: i32 = 19999;
pub const TIMER_RECONNECT_RESPONSE: i32 = 20000;

/// Reconnect + hello-negotiation hooks a pooled channel implements on top
/// of [`ChannelDriver`]. `instance.rs` wires a concrete `MsgChannel` up to
/// these via a thin adapter.
pub trait PoolChannel: ChannelDriver {
    fn group_name(&self) -> &str;
    fn host(&self) -> &HostKey;
    fn is_connected(&self) -> bool;

    fn send_packet(&mut self, pk: &MsgPacket);

    /// Chooses whether to send a hello packet and whether to wait for one
    /// after a fresh connect completes.
    fn hello_packet(&mut self) -> (Option<MsgPacket>, bool);

    /// Validates the peer's hello response (or the peer's own hello, if
    /// this side is the server), extracting a peer name on success.
    fn check_hello_packet(&mut self, pk: &MsgPacket) -> Option<String>;

    /// Starts (or restarts) an outbound connection attempt to `host()`.
    fn begin_reconnect(&mut self);

    fn note_connected(&mut self, peer_name: String);
    fn note_disconnected(&mut self);
}

struct Host {
    members: Vec<ChannelName>,
    cursor: usize,
}

impl Host {
    fn new() -> Self {
        Host {
            members: Vec::new(),
            cursor: 0,
        }
    }

    /// Rotates to the next connected member, trying at most `members.len()`
    /// candidates so a host with no live channel returns `None` instead of
    /// looping forever.
    fn next_connected(&mut self, channels: &ChannelRegistry<Box<dyn PoolChannel>>) -> Option<ChannelName> {
        if self.members.is_empty() {
            return None;
        }
        let attempts = self.members.len();
        for _ in 0..attempts {
            let candidate = self.members[self.cursor];
            self.cursor = (self.cursor + 1) % self.members.len();
            if let Some(ch) = channels.get(candidate) {
                if ch.is_connected() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Removes `name`, first rotating the cursor off its index if it
    /// currently points there.
    fn remove(&mut self, name: ChannelName) {
        if let Some(idx) = self.members.iter().position(|&m| m == name) {
            if self.cursor == idx {
                self.cursor = if self.members.len() <= 1 { 0 } else { (idx + 1) % self.members.len() };
            } else if self.cursor > idx {
                self.cursor -= 1;
            }
            self.members.remove(idx);
            if !self.members.is_empty() {
                self.cursor %= self.members.len();
            } else {
                self.cursor = 0;
            }
        }
    }
}

struct Group {
    hosts: IndexMap<HostKey, Host>,
    cursor: usize,
}

impl Group {
    fn new() -> Self {
        Group {
            hosts: IndexMap::new(),
            cursor: 0,
        }
    }

    fn next_connected(&mut self, channels: &ChannelRegistry<Box<dyn PoolChannel>>) -> Option<ChannelName> {
        if self.hosts.is_empty() {
            return None;
        }
        let attempts = self.hosts.len();
        for _ in 0..attempts {
            let idx = self.cursor;
            self.cursor = (self.cursor + 1) % self.hosts.len();
            if let Some((_, host)) = self.hosts.get_index_mut(idx) {
                if let Some(found) = host.next_connected(channels) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn remove_host_if_empty(&mut self, key: &HostKey) {
        if let Some(host) = self.hosts.get(key) {
            if host.members.is_empty() {
                let idx = self.hosts.get_index_of(key);
                self.hosts.shift_remove(key);
                if let Some(idx) = idx {
                    if !self.hosts.is_empty() {
                        if self.cursor > idx {
                            self.cursor -= 1;
                        }
                        self.cursor %= self.hosts.len();
                    } else {
                        self.cursor = 0;
                    }
                }
            }
        }
    }
}

/// The `group -> host -> channel` pool itself.
pub struct MultiChannelPool {
    tag: String,
    reconnect_time: Duration,
    channels: ChannelRegistry<Box<dyn PoolChannel>>,
    groups: IndexMap<String, Group>,
    pool_cursor: usize,
    timer_clients: HashMap<u64, ChannelName>,
}

impl MultiChannelPool {
    pub fn new(tag: impl Into<String>, reconnect_time: Duration) -> Self {
        MultiChannelPool {
            tag: tag.into(),
            reconnect_time,
            channels: ChannelRegistry::new(),
            groups: IndexMap::new(),
            pool_cursor: 0,
            timer_clients: HashMap::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn reconnect_time(&self) -> Duration {
        self.reconnect_time
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Registers a channel, placing it under its own `group_name()`/`host()`.
    pub fn add(&mut self, channel: Box<dyn PoolChannel>) -> ChannelName {
        let gname = channel.group_name().to_string();
        let host = channel.host().clone();

        let name = self.channels.insert(channel);
        self.timer_clients.insert(name.as_u64(), name);

        let group = self.groups.entry(gname).or_insert_with(Group::new);
        let host_entry = group.hosts.entry(host).or_insert_with(Host::new);
        host_entry.members.push(name);
        name
    }

    /// Removes `name` from the pool, advancing every cursor that pointed at
    /// it first. Returns the owned channel, if it was still present.
    pub fn remove(&mut self, name: ChannelName) -> Option<Box<dyn PoolChannel>> {
        let (gname, host) = {
            let ch = self.channels.get(name)?;
            (ch.group_name().to_string(), ch.host().clone())
        };

        if let Some(group) = self.groups.get_mut(&gname) {
            if let Some(host_entry) = group.hosts.get_mut(&host) {
                host_entry.remove(name);
            }
            group.remove_host_if_empty(&host);
            if group.hosts.is_empty() {
                let idx = self.groups.get_index_of(&gname);
                self.groups.shift_remove(&gname);
                if let Some(idx) = idx {
                    if !self.groups.is_empty() {
                        if self.pool_cursor > idx {
                            self.pool_cursor -= 1;
                        }
                        self.pool_cursor %= self.groups.len();
                    } else {
                        self.pool_cursor = 0;
                    }
                }
            }
        }

        self.timer_clients.remove(&name.as_u64());
        self.channels.remove(name)
    }

    pub fn channel(&self, name: ChannelName) -> Option<&dyn PoolChannel> {
        self.channels.get(name).map(|b| b.as_ref())
    }

    pub fn channel_mut(&mut self, name: ChannelName) -> Option<&mut Box<dyn PoolChannel>> {
        self.channels.get_mut(name)
    }

    pub fn channel_for_timer_client(&self, client: u64) -> Option<ChannelName> {
        self.timer_clients.get(&client).copied()
    }

    /// Round-robins across every group (the original's parameterless
    /// `getChannel()`).
    pub fn next_channel(&mut self) -> Option<ChannelName> {
        if self.groups.is_empty() {
            return None;
        }
        let attempts = self.groups.len();
        for _ in 0..attempts {
            let idx = self.pool_cursor;
            self.pool_cursor = (self.pool_cursor + 1) % self.groups.len();
            if let Some((_, group)) = self.groups.get_index_mut(idx) {
                if let Some(found) = group.next_connected(&self.channels) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Round-robins within a single named group.
    pub fn next_channel_in_group(&mut self, gname: &str) -> Option<ChannelName> {
        self.groups.get_mut(gname)?.next_connected(&self.channels)
    }

    /// Sends `pk` to every connected channel. Returns the count sent.
    pub fn broadcast_full(&mut self, pk: &MsgPacket) -> usize {
        let mut n = 0;
        for (_, ch) in self.channels.iter_mut() {
            if ch.is_connected() {
                ch.send_packet(pk);
                n += 1;
            }
        }
        n
    }

    /// Sends `pk` to one connected channel per host.
    pub fn broadcast_per_host(&mut self, pk: &MsgPacket) -> usize {
        let mut n = 0;
        let group_names: Vec<String> = self.groups.keys().cloned().collect();
        for gname in group_names {
            let Some(group) = self.groups.get_mut(&gname) else { continue };
            let host_keys: Vec<HostKey> = group.hosts.keys().cloned().collect();
            for host_key in host_keys {
                let Some(host) = self.groups.get_mut(&gname).and_then(|g| g.hosts.get_mut(&host_key)) else {
                    continue;
                };
                if let Some(name) = host.next_connected(&self.channels) {
                    if let Some(ch) = self.channels.get_mut(name) {
                        ch.send_packet(pk);
                        n += 1;
                    }
                }
            }
        }
        n
    }

    /// Sends `pk` to one connected channel per group.
    pub fn broadcast_per_group(&mut self, pk: &MsgPacket) -> usize {
        let mut n = 0;
        let group_names: Vec<String> = self.groups.keys().cloned().collect();
        for gname in group_names {
            let Some(name) = self.groups.get_mut(&gname).and_then(|g| g.next_connected(&self.channels)) else {
                continue;
            };
            if let Some(ch) = self.channels.get_mut(name) {
                ch.send_packet(pk);
                n += 1;
            }
        }
        n
    }

    /// `TIMER_RECONNECT_INIT` fired: tell the channel to start connecting.
    pub fn on_reconnect_init(&mut self, client: u64) {
        if let Some(name) = self.channel_for_timer_client(client) {
            if let Some(ch) = self.channels.get_mut(name) {
                ch.begin_reconnect();
            }
        }
    }

    /// `TIMER_RECONNECT_RESPONSE` fired with no hello response seen yet:
    /// clear the channel back to disconnected so the caller can re-arm
    /// `TIMER_RECONNECT_INIT`.
    pub fn on_reconnect_response_timeout(&mut self, client: u64) -> Option<ChannelName> {
        let name = self.channel_for_timer_client(client)?;
        if let Some(ch) = self.channels.get_mut(name) {
            ch.note_disconnected();
        }
        Some(name)
    }

    pub fn on_channel_error(&mut self, name: ChannelName, _err: ChannelError) {
        if let Some(ch) = self.channels.get_mut(name) {
            ch.note_disconnected();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DriverOutcome, InstanceState};
    use crate::poller::Interest;
    use std::os::unix::io::RawFd;

    struct FakeChannel {
        name: ChannelName,
        gname: String,
        host: HostKey,
        connected: bool,
        sent: Vec<MsgPacket>,
    }

    impl ChannelDriver for FakeChannel {
        fn name(&self) -> ChannelName {
            self.name
        }
        fn fd(&self) -> RawFd {
            -1
        }
        fn instance_state(&self) -> InstanceState {
            InstanceState::Normal
        }
        fn desired_interest(&self) -> Interest {
            Interest::readable()
        }
        fn on_readable(&mut self) -> DriverOutcome {
            DriverOutcome::Continue
        }
        fn on_writable(&mut self) -> DriverOutcome {
            DriverOutcome::Continue
        }
        fn on_error(&mut self, _errno: i32) -> DriverOutcome {
            DriverOutcome::Release
        }
        fn set_expired(&mut self) {}
        fn set_release(&mut self) {}
    }

    impl PoolChannel for FakeChannel {
        fn group_name(&self) -> &str {
            &self.gname
        }
        fn host(&self) -> &HostKey {
            &self.host
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        fn send_packet(&mut self, pk: &MsgPacket) {
            self.sent.push(pk.clone());
        }
        fn hello_packet(&mut self) -> (Option<MsgPacket>, bool) {
            (None, false)
        }
        fn check_hello_packet(&mut self, _pk: &MsgPacket) -> Option<String> {
            None
        }
        fn begin_reconnect(&mut self) {
            self.connected = false;
        }
        fn note_connected(&mut self, _peer_name: String) {
            self.connected = true;
        }
        fn note_disconnected(&mut self) {
            self.connected = false;
        }
    }

    fn fake(gname: &str, host: &str, connected: bool) -> Box<FakeChannel> {
        let mut reg: ChannelRegistry<()> = ChannelRegistry::new();
        let name = reg.insert(());
        Box::new(FakeChannel {
            name,
            gname: gname.to_string(),
            host: (host.to_string(), 6379),
            connected,
            sent: Vec::new(),
        })
    }

    #[test]
    fn broadcast_full_sends_only_to_connected_channels() {
        let mut pool = MultiChannelPool::new("cache", Duration::from_secs(1));
        pool.add(fake("g1", "a", true));
        pool.add(fake("g1", "b", false));

        let pk = MsgPacket::new("PING", 0, 0, Vec::new());
        assert_eq!(pool.broadcast_full(&pk), 1);
    }

    #[test]
    fn broadcast_per_host_picks_one_live_channel_per_host() {
        let mut pool = MultiChannelPool::new("cache", Duration::from_secs(1));
        pool.add(fake("g1", "a", true));
        pool.add(fake("g1", "a", true));
        pool.add(fake("g1", "b", false));

        let pk = MsgPacket::new("PING", 0, 0, Vec::new());
        assert_eq!(pool.broadcast_per_host(&pk), 1, "host b has no live channel");
    }

    #[test]
    fn next_channel_round_robins_across_groups() {
        let mut pool = MultiChannelPool::new("cache", Duration::from_secs(1));
        let a = pool.add(fake("g1", "a", true));
        let b = pool.add(fake("g2", "b", true));

        let first = pool.next_channel().unwrap();
        let second = pool.next_channel().unwrap();
        assert_ne!(first, second);
        assert!([a, b].contains(&first));
        assert!([a, b].contains(&second));
    }

    #[test]
    fn removing_the_channel_a_cursor_points_at_does_not_panic() {
        let mut pool = MultiChannelPool::new("cache", Duration::from_secs(1));
        let a = pool.add(fake("g1", "a", true));
        let _b = pool.add(fake("g1", "a", true));

        // Force the host cursor to point at `a`.
        let _ = pool.next_channel_in_group("g1");
        pool.remove(a);

        // Must still be usable without panicking or returning a stale name.
        let remaining = pool.next_channel_in_group("g1");
        assert!(remaining.is_some());
        assert_ne!(remaining.unwrap(), a);
    }

    #[test]
    fn removing_the_last_channel_in_a_host_drops_the_host_and_group() {
        let mut pool = MultiChannelPool::new("cache", Duration::from_secs(1));
        let a = pool.add(fake("g1", "a", true));
        pool.remove(a);
        assert!(pool.is_empty());
        assert_eq!(pool.next_channel(), None);
    }
}
