//! Generational handle table.
//!
//! Slots are reused after removal, but every reuse bumps the slot's
//! generation, so a stale handle never resolves to a newer occupant.

use std::fmt;

/// Opaque identifier of a registered context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Identity of a context that is never registered (see
    /// [`Engine::run`](super::Engine::run)). No table hands it out, since
    /// generations start at 1.
    pub const DETACHED: Handle = Handle {
        index: u32::MAX,
        generation: 0,
    };

    /// Pack into a `u64`. Generations start at 1, so the result is never 0.
    pub fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`to_raw`](Self::to_raw). Returns `None` for 0.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(Self {
            index: raw as u32,
            generation,
        })
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot map keyed by [`Handle`].
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle that the next insertion will receive.
    fn next_handle(&self) -> Handle {
        match self.free.last() {
            Some(&index) => Handle {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => Handle {
                index: self.slots.len() as u32,
                generation: 1,
            },
        }
    }

    /// Insert a value built from the handle it will be stored under. Nothing
    /// is inserted if `build` fails.
    pub fn insert_with<E>(&mut self, build: impl FnOnce(Handle) -> Result<T, E>) -> Result<Handle, E> {
        let handle = self.next_handle();
        let value = build(handle)?;
        match self.free.pop() {
            Some(index) => self.slots[index as usize].value = Some(value),
            None => self.slots.push(Slot {
                generation: handle.generation,
                value: Some(value),
            }),
        }
        self.len += 1;
        Ok(handle)
    }

    pub fn insert(&mut self, value: T) -> Handle {
        match self.insert_with::<std::convert::Infallible>(|_| Ok(value)) {
            Ok(handle) => handle,
            Err(never) => match never {},
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Remove and return the value; the slot's generation advances so the
    /// handle goes stale.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}
