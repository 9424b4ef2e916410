//! Reactor-thread-only timer service: a `(client, event id) -> cycle`
//! sweep driven once per main-loop turn by [`Timer::check`].
//!
//! The original design keyed entries by the raw pointer of a callback
//! object and invoked the callback from inside the sweep, guarding
//! against self-mutation with an `invalidateIterator` flag checked after
//! every call. Calling back into `&mut Timer` while iterating its own
//! map doesn't borrow-check here, so `check` instead returns the set of
//! entries that fired — with `last_fire` already advanced — and leaves
//! dispatch to the caller. Since dispatch happens after the sweep has
//! fully returned, a dispatch hook that adds or removes entries can
//! never observe or corrupt an in-progress sweep.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identity of a timer's owner — typically a channel's registry
/// handle encoded as `u64`, or a pool/job-manager singleton id.
pub type ClientId = u64;

/// Handle returned by [`Timer::add`]; keep it to call [`Timer::remove`].
/// Stable across entry mutation, unlike the source's pointer keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// One fired entry, handed back by [`Timer::check`] for the caller to
/// dispatch (typically by looking `client` up in a channel registry and
/// invoking its `event_timer` hook).
#[derive(Debug, Clone, Copy)]
pub struct Fired {
    pub handle: TimerHandle,
    pub client: ClientId,
    pub event_id: i32,
    pub param: u64,
}

struct Entry {
    client: ClientId,
    event_id: i32,
    cycle_ms: i64,
    last_fire_ms: i64,
    param: u64,
}

/// Minimum gap between successive [`Timer::check`] calls; calls tighter
/// than this are a no-op, guarding against pathological tight loops.
const MIN_CHECK_GAP_MS: i64 = 100;

pub struct Timer {
    entries: HashMap<TimerHandle, Entry>,
    next_handle: u64,
    last_check_ms: i64,
    /// Bumped on every structural add/remove; exposed for tests that want
    /// to assert a dispatch hook actually mutated the timer.
    generation: u64,
}

impl Timer {
    pub fn new() -> Self {
        Timer {
            entries: HashMap::new(),
            next_handle: 1,
            last_check_ms: now_ms(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a periodic event. `cycle_ms` is the interval; the first
    /// fire is eligible `cycle_ms` after this call.
    pub fn add(&mut self, client: ClientId, event_id: i32, cycle_ms: i64, param: u64) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;

        self.entries.insert(
            handle,
            Entry {
                client,
                event_id,
                cycle_ms,
                last_fire_ms: now_ms(),
                param,
            },
        );
        self.generation += 1;
        handle
    }

    /// Removes an entry. No-op if the handle is unknown (already fired
    /// and self-removed, or never existed).
    pub fn remove(&mut self, handle: TimerHandle) {
        if self.entries.remove(&handle).is_some() {
            self.generation += 1;
        }
    }

    /// Removes every entry belonging to `client`, e.g. when a channel is
    /// released.
    pub fn remove_client(&mut self, client: ClientId) {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.client != client);
        if self.entries.len() != before {
            self.generation += 1;
        }
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.generation += 1;
        }
    }

    /// Sweeps for due entries. Returns an empty vec (without advancing
    /// `last_check_ms`) if called less than [`MIN_CHECK_GAP_MS`] after
    /// the previous call.
    pub fn check(&mut self) -> Vec<Fired> {
        let now = now_ms();
        if now - self.last_check_ms < MIN_CHECK_GAP_MS {
            return Vec::new();
        }
        self.last_check_ms = now;

        let mut fired = Vec::new();
        for (&handle, entry) in self.entries.iter_mut() {
            if now - entry.last_fire_ms >= entry.cycle_ms {
                entry.last_fire_ms = now;
                fired.push(Fired {
                    handle,
                    client: entry.client,
                    event_id: entry.event_id,
                    param: entry.param,
                });
            }
        }
        fired
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn check_is_a_no_op_inside_the_minimum_gap() {
        let mut timer = Timer::new();
        timer.add(1, 10, 1, 0);
        // First call right after construction: last_check_ms was just set
        // in `new`, so this is almost certainly inside the 100ms guard.
        let fired = timer.check();
        assert!(fired.is_empty());
    }

    #[test]
    fn entry_fires_once_per_elapsed_cycle() {
        let mut timer = Timer::new();
        timer.last_check_ms -= MIN_CHECK_GAP_MS + 1;
        let h = timer.add(42, 7, 50, 99);
        // Backdate the entry so it's immediately due.
        timer.entries.get_mut(&h).unwrap().last_fire_ms -= 1000;

        let fired = timer.check();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].client, 42);
        assert_eq!(fired[0].event_id, 7);
        assert_eq!(fired[0].param, 99);

        timer.last_check_ms -= MIN_CHECK_GAP_MS + 1;
        let fired_again = timer.check();
        assert!(fired_again.is_empty(), "should not re-fire until the next cycle elapses");
    }

    #[test]
    fn remove_during_dispatch_does_not_panic_or_refire() {
        let mut timer = Timer::new();
        timer.last_check_ms -= MIN_CHECK_GAP_MS + 1;
        let h1 = timer.add(1, 1, 10, 0);
        let h2 = timer.add(2, 2, 10, 0);
        timer.entries.get_mut(&h1).unwrap().last_fire_ms -= 1000;
        timer.entries.get_mut(&h2).unwrap().last_fire_ms -= 1000;

        let fired = timer.check();
        assert_eq!(fired.len(), 2);

        // Simulate a dispatch hook that removes the other entry and adds
        // a new one; the already-completed sweep must be unaffected.
        let gen_before = timer.generation();
        timer.remove(h2);
        timer.add(3, 3, 10, 0);
        assert!(timer.generation() > gen_before);
        assert_eq!(timer.len(), 2);
    }

    #[test]
    fn now_ms_advances() {
        let a = now_ms();
        sleep(Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a);
    }
}
