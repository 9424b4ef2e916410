//! Process-wide channel registry. The original framework keyed channels by a
//! raw `uint32_t` name handed out by a `ChannelMapTemplate<T>` singleton; a
//! freed name could, in principle, be reused by a later channel while a
//! stale reference elsewhere still pointed at the old one. We replace the
//! raw name with a `(slot, generation)` pair minted by a `slab`-backed
//! registry, per the redesign notes in spec.md §9 — a lookup against a
//! stale handle returns `None` instead of aliasing a new channel.

use slab::Slab;

/// Stable identity for a registered channel. Safe to copy, hash, and store
/// as a cross-component reference (job correlation, pool membership,
/// timer client id) instead of a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelName {
    slot: u32,
    generation: u32,
}

impl ChannelName {
    pub fn slot(self) -> u32 {
        self.slot
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Encodes the handle as a single `u64`, for callers (e.g. the Timer's
    /// `ClientId`) that want an opaque integer key.
    pub fn as_u64(self) -> u64 {
        (u64::from(self.slot) << 32) | u64::from(self.generation)
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// Registry mapping a [`ChannelName`] to a live value of type `T` (normally
/// a boxed channel trait object). Backed by `slab`, which freely reuses a
/// removed key for the next `insert` — so generation numbers are tracked in
/// a side table indexed by slab key, bumped on every `remove` and never
/// reset, to keep a handle minted before a slot was recycled unresolvable.
pub struct ChannelRegistry<T> {
    slots: Slab<T>,
    generations: Vec<u32>,
}

impl<T> ChannelRegistry<T> {
    pub fn new() -> Self {
        ChannelRegistry {
            slots: Slab::new(),
            generations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn generation_for(&mut self, slot: usize) -> u32 {
        if self.generations.len() <= slot {
            self.generations.resize(slot + 1, 0);
        }
        self.generations[slot] += 1;
        self.generations[slot]
    }

    /// Registers `value`, returning its handle.
    pub fn insert(&mut self, value: T) -> ChannelName {
        let slot = self.slots.insert(value) as u32;
        let generation = self.generation_for(slot as usize);
        ChannelName { slot, generation }
    }

    fn current_generation(&self, slot: u32) -> Option<u32> {
        self.generations.get(slot as usize).copied()
    }

    /// Looks the handle up. `None` if it was never valid or has since been
    /// removed (including removed-then-reused: the generation won't match).
    pub fn get(&self, name: ChannelName) -> Option<&T> {
        if self.current_generation(name.slot) != Some(name.generation) {
            return None;
        }
        self.slots.get(name.slot as usize)
    }

    pub fn get_mut(&mut self, name: ChannelName) -> Option<&mut T> {
        if self.current_generation(name.slot) != Some(name.generation) {
            return None;
        }
        self.slots.get_mut(name.slot as usize)
    }

    pub fn contains(&self, name: ChannelName) -> bool {
        self.get(name).is_some()
    }

    /// Removes the value and invalidates `name` for good; the slot may be
    /// reused by a future `insert` but will mint a fresh generation.
    pub fn remove(&mut self, name: ChannelName) -> Option<T> {
        if self.current_generation(name.slot) != Some(name.generation) {
            return None;
        }
        // Bump the generation regardless of whether the slab slot is still
        // occupied, so a double-remove can never resurrect the handle.
        self.generation_for(name.slot as usize);
        if self.slots.contains(name.slot as usize) {
            Some(self.slots.remove(name.slot as usize))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelName, &T)> {
        let generations = &self.generations;
        self.slots.iter().map(move |(slot, v)| {
            (
                ChannelName {
                    slot: slot as u32,
                    generation: generations[slot],
                },
                v,
            )
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChannelName, &mut T)> {
        let gens = self.generations.clone();
        self.slots.iter_mut().map(move |(slot, v)| {
            (
                ChannelName {
                    slot: slot as u32,
                    generation: gens[slot],
                },
                v,
            )
        })
    }
}

impl<T> Default for ChannelRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_does_not_alias_reused_slot() {
        let mut reg: ChannelRegistry<&'static str> = ChannelRegistry::new();
        let a = reg.insert("a");
        assert_eq!(reg.get(a), Some(&"a"));

        reg.remove(a);
        assert_eq!(reg.get(a), None);

        let b = reg.insert("b");
        // Same slot, different generation: `a` must not resolve to `b`.
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(reg.get(a), None);
        assert_eq!(reg.get(b), Some(&"b"));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg: ChannelRegistry<i32> = ChannelRegistry::new();
        let h = reg.insert(7);
        assert_eq!(reg.remove(h), Some(7));
        assert_eq!(reg.remove(h), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn iter_only_sees_live_entries() {
        let mut reg: ChannelRegistry<i32> = ChannelRegistry::new();
        let a = reg.insert(1);
        let _b = reg.insert(2);
        reg.remove(a);

        let remaining: Vec<_> = reg.iter().map(|(_, v)| *v).collect();
        assert_eq!(remaining, vec![2]);
    }
}
