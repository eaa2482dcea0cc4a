//! Generational slot arena.
//!
//! Runtime states refer to each other through keys into an arena instead of
//! holding references. A key carries the generation of the slot it was
//! issued for, so a key to a removed value never resolves to whatever later
//! reuses the slot.

use crate::error::{KernelError, KernelResult};
use std::fmt;
use std::marker::PhantomData;

/// Raw slot address: index plus generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    /// Slot index
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Generation the key was issued for
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Typed key into an [`Arena`]
pub trait ArenaKey: Copy + Eq {
    /// Wrap a raw slot key
    fn from_slot(slot: SlotKey) -> Self;

    /// Unwrap to the raw slot key
    fn slot(self) -> SlotKey;
}

impl ArenaKey for SlotKey {
    fn from_slot(slot: SlotKey) -> Self {
        slot
    }

    fn slot(self) -> SlotKey {
        self
    }
}

/// Declare a typed arena key.
///
/// ```
/// kiln_core::arena_key! {
///     /// Key of a widget
///     pub struct WidgetKey;
/// }
/// ```
#[macro_export]
macro_rules! arena_key {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $name($crate::arena::SlotKey);

        impl $crate::arena::ArenaKey for $name {
            fn from_slot(slot: $crate::arena::SlotKey) -> Self {
                Self(slot)
            }

            fn slot(self) -> $crate::arena::SlotKey {
                self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Slot arena with generation-checked keys
pub struct Arena<K: ArenaKey, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<fn() -> K>,
}

impl<K: ArenaKey, T> Arena<K, T> {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }

    /// Insert a value, returning its key
    ///
    /// # Errors
    ///
    /// Returns error if every `u32` slot index is taken
    pub fn insert(&mut self, value: T) -> KernelResult<K> {
        while let Some(index) = self.free.pop() {
            if let Some(Slot::Vacant { generation }) = self.slots.get(index as usize) {
                let generation = generation.wrapping_add(1);
                self.slots[index as usize] = Slot::Occupied { generation, value };
                self.len += 1;
                return Ok(K::from_slot(SlotKey { index, generation }));
            }
        }

        let index = u32::try_from(self.slots.len()).map_err(|_| KernelError::ArenaExhausted {
            capacity: self.slots.len(),
        })?;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        self.len += 1;
        Ok(K::from_slot(SlotKey {
            index,
            generation: 0,
        }))
    }

    /// Get a value by key
    #[must_use]
    pub fn get(&self, key: K) -> Option<&T> {
        let slot = key.slot();
        match self.slots.get(slot.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == slot.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Get a mutable value by key
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let slot = key.slot();
        match self.slots.get_mut(slot.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == slot.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Check whether a key is live
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Remove a value, invalidating its key
    pub fn remove(&mut self, key: K) -> Option<T> {
        let slot = key.slot();
        let entry = self.slots.get_mut(slot.index as usize)?;
        match entry {
            Slot::Occupied { generation, .. } if *generation == slot.generation => {}
            _ => return None,
        }
        let vacated = std::mem::replace(
            entry,
            Slot::Vacant {
                generation: slot.generation,
            },
        );
        self.free.push(slot.index);
        self.len -= 1;
        match vacated {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Number of live values
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate live entries
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, value } => Some((
                K::from_slot(SlotKey {
                    index: index as u32,
                    generation: *generation,
                }),
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    /// Iterate live entries mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    K::from_slot(SlotKey {
                        index: index as u32,
                        generation: *generation,
                    }),
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    /// Live keys, collected
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(key, _)| key).collect()
    }
}

impl<K: ArenaKey, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, T> fmt::Debug for Arena<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len)
            .field("capacity", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::arena_key! {
        struct TestKey;
    }

    #[test]
    fn test_arena_insert_get() {
        let mut arena: Arena<TestKey, &str> = Arena::new();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();

        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_arena_remove_invalidates_key() {
        let mut arena: Arena<TestKey, u32> = Arena::new();
        let key = arena.insert(7).unwrap();

        assert_eq!(arena.remove(key), Some(7));
        assert!(arena.get(key).is_none());
        assert!(arena.remove(key).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_arena_reuses_slot_with_new_generation() {
        let mut arena: Arena<TestKey, u32> = Arena::new();
        let old = arena.insert(1).unwrap();
        arena.remove(old);
        let new = arena.insert(2).unwrap();

        assert_eq!(old.slot().index(), new.slot().index());
        assert_ne!(old, new);
        assert!(arena.get(old).is_none());
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn test_arena_iter_skips_vacant() {
        let mut arena: Arena<TestKey, u32> = Arena::new();
        let a = arena.insert(1).unwrap();
        let _b = arena.insert(2).unwrap();
        let _c = arena.insert(3).unwrap();
        arena.remove(a);

        let values: Vec<u32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![2, 3]);
        assert_eq!(arena.keys().len(), 2);
    }

    #[test]
    fn test_arena_iter_mut() {
        let mut arena: Arena<TestKey, u32> = Arena::new();
        arena.insert(1).unwrap();
        arena.insert(2).unwrap();
        for (_, value) in arena.iter_mut() {
            *value *= 10;
        }
        let values: Vec<u32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![10, 20]);
    }

    proptest::proptest! {
        #[test]
        fn prop_removed_keys_never_resolve(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let mut arena: Arena<TestKey, usize> = Arena::new();
            let mut live: Vec<TestKey> = Vec::new();
            let mut dead: Vec<TestKey> = Vec::new();

            for (step, op) in ops.into_iter().enumerate() {
                if op == 0 || live.is_empty() {
                    live.push(arena.insert(step).unwrap());
                } else {
                    let key = live.remove(step % live.len());
                    arena.remove(key);
                    dead.push(key);
                }
            }

            for key in &dead {
                proptest::prop_assert!(arena.get(*key).is_none());
            }
            for key in &live {
                proptest::prop_assert!(arena.get(*key).is_some());
            }
            proptest::prop_assert_eq!(arena.len(), live.len());
        }
    }
}
