//! Generational handle tables
//!
//! Objects handed across the FFI boundary are referred to by opaque 64-bit
//! handles instead of raw pointers. A handle packs a slot index with the
//! slot's generation, so a handle to a freed object stays invalid even after
//! its slot is reused. The raw value 0 is never issued.

use crate::error::{EngineError, HandleKind, Result};

/// Opaque reference into a [`HandleTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    fn new(index: usize, generation: u32) -> Self {
        Handle((u64::from(generation) << 32) | (index as u64 + 1))
    }

    fn index(self) -> Option<usize> {
        let low = (self.0 & 0xFFFF_FFFF) as usize;
        low.checked_sub(1)
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Owning table of `T` addressed by [`Handle`]
#[derive(Debug)]
pub struct HandleTable<T> {
    kind: HandleKind,
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> HandleTable<T> {
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle::new(self.slots.len() - 1, 1)
    }

    fn live_index(&self, handle: Handle) -> Option<usize> {
        let index = handle.index()?;
        let slot = self.slots.get(index)?;
        (slot.generation == handle.generation() && slot.value.is_some()).then_some(index)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.live_index(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        self.live_index(handle)
            .and_then(|i| self.slots[i].value.as_ref())
            .ok_or_else(|| EngineError::invalid_handle(self.kind, handle.as_raw()))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        match self.live_index(handle) {
            Some(i) => self.slots[i]
                .value
                .as_mut()
                .ok_or_else(|| EngineError::invalid_handle(self.kind, handle.as_raw())),
            None => Err(EngineError::invalid_handle(self.kind, handle.as_raw())),
        }
    }

    /// Take the value out; unknown and stale handles yield `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = self.live_index(handle)?;
        let slot = &mut self.slots[index];
        let value = slot.value.take();
        // Generation 0 is skipped so a handle can never be 0
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(index);
        self.len -= 1;
        value
    }

    /// Remove every value for which `f` returns true.
    pub fn remove_where(&mut self, mut f: impl FnMut(&T) -> bool) -> Vec<T> {
        let doomed: Vec<Handle> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.as_ref().is_some_and(&mut f))
            .map(|(i, slot)| Handle::new(i, slot.generation))
            .collect();
        doomed.into_iter().filter_map(|h| self.remove(h)).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
