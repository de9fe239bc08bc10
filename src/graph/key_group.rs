//! Key-aliasing map: a bound set of keys shares one value slot
//!
//! The cache builder binds every strongly-connected component so that all of
//! its members read and write the same closure bitmap.

use std::collections::HashMap;

use blake3::Hasher;
use roaring::RoaringBitmap;

use crate::error::{MinefieldError, Result};

/// Slot identity: a group hash for bound keys, the key itself otherwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Group([u8; 32]),
    Own(u32),
}

/// Identity of a key set, independent of the order keys were given in
fn group_hash(keys: &[u32]) -> [u8; 32] {
    let mut sorted = keys.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Hasher::new();
    for key in sorted {
        hasher.update(&key.to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

#[derive(Debug, Clone)]
pub struct KeyGroup<V> {
    aliases: HashMap<u32, Slot>,
    slots: HashMap<Slot, V>,
    // Bound keys in bind order, so entries() is deterministic
    bound: Vec<u32>,
}

impl<V> Default for KeyGroup<V> {
    fn default() -> Self {
        Self {
            aliases: HashMap::new(),
            slots: HashMap::new(),
            bound: Vec::new(),
        }
    }
}

impl<V> KeyGroup<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `keys` aliases of one slot. Binding the same set again is a no-op.
    pub fn bind(&mut self, keys: &[u32]) {
        let slot = Slot::Group(group_hash(keys));
        for &key in keys {
            if self.aliases.insert(key, slot).is_none() {
                self.bound.push(key);
            }
        }
    }

    fn slot(&self, key: u32) -> Slot {
        self.aliases.get(&key).copied().unwrap_or(Slot::Own(key))
    }

    /// Two keys resolve to the same slot
    pub fn same_slot(&self, a: u32, b: u32) -> bool {
        self.slot(a) == self.slot(b)
    }

    pub fn get(&self, key: u32) -> Result<&V> {
        self.slots
            .get(&self.slot(key))
            .ok_or(MinefieldError::KeyNotFound(key))
    }

    pub fn get_mut(&mut self, key: u32) -> Result<&mut V> {
        let slot = self.slot(key);
        self.slots
            .get_mut(&slot)
            .ok_or(MinefieldError::KeyNotFound(key))
    }

    pub fn set(&mut self, key: u32, value: V) {
        let slot = self.slot(key);
        self.slots.insert(slot, value);
    }

    /// One `(key, value)` per bound key; aliases of a group share the value
    pub fn entries(&self) -> impl Iterator<Item = (u32, &V)> + '_ {
        self.bound
            .iter()
            .filter_map(move |&key| self.slots.get(&self.slot(key)).map(|v| (key, v)))
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}

impl KeyGroup<RoaringBitmap> {
    /// `value(dst) |= value(src)`; a no-op when both share a slot
    pub fn union_into(&mut self, dst: u32, src: u32) -> Result<()> {
        let (dst_slot, src_slot) = (self.slot(dst), self.slot(src));
        if dst_slot == src_slot {
            return Ok(());
        }

        let source = self
            .slots
            .remove(&src_slot)
            .ok_or(MinefieldError::KeyNotFound(src))?;
        let merged = match self.slots.get_mut(&dst_slot) {
            Some(target) => {
                *target |= &source;
                Ok(())
            }
            None => Err(MinefieldError::KeyNotFound(dst)),
        };
        self.slots.insert(src_slot, source);
        merged
    }
}
