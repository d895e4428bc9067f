//! Index-stable storage for pages and pooled buffers.
//!
//! Removing a value bumps the version of its slot, so an index that outlived
//! its value no longer resolves instead of aliasing whatever reuses the slot.

use core::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    num::NonZeroU32,
};

pub struct SlotIndex<T> {
    index: u32,
    version: NonZeroU32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SlotIndex<T> {

    #[inline(always)]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline(always)]
    pub fn version(self) -> u32 {
        self.version.get()
    }
}

impl<T> Clone for SlotIndex<T> {

    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotIndex<T> {}

impl<T> PartialEq for SlotIndex<T> {

    fn eq(&self, other: &Self) -> bool {
        self.version == other.version &&
        self.index == other.index
    }
}

impl<T> Eq for SlotIndex<T> {}

impl<T> Hash for SlotIndex<T> {

    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.version.hash(state);
    }
}

impl<T> fmt::Debug for SlotIndex<T> {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotIndex({}v{})", self.index, self.version)
    }
}

struct Slot<T> {
    value: Option<T>,
    version: NonZeroU32,
    next_free: Option<u32>,
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {

    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {

    #[inline(always)]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> SlotIndex<T> {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            self.free_head = slot.next_free.take();
            slot.value = Some(value);
            return SlotIndex {
                index,
                version: slot.version,
                _marker: PhantomData,
            }
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            value: Some(value),
            version: NonZeroU32::MIN,
            next_free: None,
        });
        SlotIndex {
            index,
            version: NonZeroU32::MIN,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn get(&self, index: SlotIndex<T>) -> Option<&T> {
        self.slots
            .get(index.index as usize)
            .filter(|slot| slot.version == index.version)
            .and_then(|slot| slot.value.as_ref())
    }

    #[inline(always)]
    pub fn get_mut(&mut self, index: SlotIndex<T>) -> Option<&mut T> {
        self.slots
            .get_mut(index.index as usize)
            .filter(|slot| slot.version == index.version)
            .and_then(|slot| slot.value.as_mut())
    }

    #[inline(always)]
    pub fn contains(&self, index: SlotIndex<T>) -> bool {
        self.get(index).is_some()
    }

    pub fn remove(&mut self, index: SlotIndex<T>) -> Option<T> {
        let slot = self.slots.get_mut(index.index as usize)?;
        if slot.version != index.version {
            return None
        }
        let value = slot.value.take()?;
        slot.version = NonZeroU32::new(slot.version.get().wrapping_add(1))
            .unwrap_or(NonZeroU32::MIN);
        slot.next_free = self.free_head;
        self.free_head = Some(index.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotIndex<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.value.as_ref().map(|value| (
                    SlotIndex {
                        index: i as u32,
                        version: slot.version,
                        _marker: PhantomData,
                    },
                    value,
                ))
            })
    }

    /// Removes every value, invalidating all indices.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for i in 0..self.slots.len() {
            let index = SlotIndex {
                index: i as u32,
                version: self.slots[i].version,
                _marker: PhantomData,
            };
            if let Some(value) = self.remove(index) {
                values.push(value);
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn stale_index_does_not_alias_reused_slot() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.insert("b");
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn drain_returns_live_values() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        arena.insert(2);
        arena.insert(3);
        arena.remove(a);
        let mut values = arena.drain();
        values.sort();
        assert_eq!(values, vec![2, 3]);
        assert!(arena.is_empty());
        assert_eq!(arena.iter().count(), 0);
    }
}
