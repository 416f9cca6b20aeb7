//! ID generation with recycling

use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Thread-safe ID generator that hands out the lowest released ID first
///
/// Released IDs are reused in ascending order so that a long-running process
/// accepting and dropping connections keeps its IDs small and predictable.
pub struct IdGenerator {
    inner: Mutex<IdState>,
}

struct IdState {
    next: u32,
    released: BTreeSet<u32>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            inner: Mutex::new(IdState {
                next: first,
                released: BTreeSet::new(),
            }),
        }
    }

    /// Get the next available ID
    pub fn get_available_id(&self) -> u32 {
        let mut state = self.inner.lock();
        if let Some(id) = state.released.pop_first() {
            return id;
        }
        let id = state.next;
        state.next = state.next.wrapping_add(1);
        id
    }

    /// Return an ID to the pool
    pub fn release(&self, id: u32) {
        let mut state = self.inner.lock();
        if id < state.next {
            state.released.insert(id);
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let gen = IdGenerator::new();
        let id1 = gen.get_available_id();
        let id2 = gen.get_available_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_released_ids_are_reused_lowest_first() {
        let gen = IdGenerator::new();
        let a = gen.get_available_id();
        let b = gen.get_available_id();
        let _c = gen.get_available_id();
        gen.release(b);
        gen.release(a);
        assert_eq!(gen.get_available_id(), a);
        assert_eq!(gen.get_available_id(), b);
        assert_eq!(gen.get_available_id(), 4);
    }
}
