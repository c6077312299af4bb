// arena.rs - generation-checked storage for host objects referenced by script handles
//
// Handles never hold a raw pointer to a host object. They hold an index
// plus the generation the slot had when the handle was created; a freed
// and reused slot fails the generation check instead of dereferencing a
// stale object.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

/// Index + generation pair identifying one arena entry.
///
/// Copyable and engine-opaque; the scripting side only ever sees it boxed
/// inside a handle userdata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSlot {
    pub index: u32,
    pub generation: u32,
}

struct Entry {
    value: Option<Rc<RefCell<dyn Any>>>,
    generation: u32,
}

/// Arena of host objects currently referenced from script.
///
/// Each script handle owns exactly one slot; the slot holds the strong
/// reference for the handle's lifetime. Two handles to the same host
/// object occupy two slots sharing one `Rc`, which is what makes handles
/// references rather than copies.
pub struct HostArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl HostArena {
    pub fn new() -> Self {
        Self { entries: Vec::new(), free: Vec::new() }
    }

    /// Store an object and return the slot that now owns this reference.
    ///
    /// Freed slots are reused; their generation was already bumped at
    /// release time, so handles to the previous occupant stay invalid.
    pub fn insert(&mut self, value: Rc<RefCell<dyn Any>>) -> ArenaSlot {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            ArenaSlot { index, generation: entry.generation }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry { value: Some(value), generation: 0 });
            ArenaSlot { index, generation: 0 }
        }
    }

    /// Resolve a slot to its object. `None` if the slot was released or
    /// reused since the handle was created.
    pub fn get(&self, slot: ArenaSlot) -> Option<Rc<RefCell<dyn Any>>> {
        let entry = self.entries.get(slot.index as usize)?;
        if entry.generation != slot.generation {
            return None;
        }
        entry.value.clone()
    }

    /// Release a slot, dropping its strong reference.
    ///
    /// The generation is incremented so any remaining copies of the slot
    /// become stale. Releasing an already-released slot is a no-op and
    /// returns false, which makes double-finalization harmless.
    pub fn release(&mut self, slot: ArenaSlot) -> bool {
        let Some(entry) = self.entries.get_mut(slot.index as usize) else {
            return false;
        };
        if entry.generation != slot.generation || entry.value.is_none() {
            return false;
        }
        entry.value = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot.index);
        true
    }

    /// Number of live entries. Diagnostic only.
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.value.is_some()).count()
    }
}

impl Default for HostArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(n: i32) -> Rc<RefCell<dyn Any>> {
        Rc::new(RefCell::new(n))
    }

    #[test]
    fn insert_and_resolve() {
        let mut arena = HostArena::new();
        let slot = arena.insert(boxed(5));
        let obj = arena.get(slot).unwrap();
        assert_eq!(*obj.borrow().downcast_ref::<i32>().unwrap(), 5);
    }

    #[test]
    fn release_invalidates_slot() {
        let mut arena = HostArena::new();
        let slot = arena.insert(boxed(1));
        assert!(arena.release(slot));
        assert!(arena.get(slot).is_none());
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn double_release_is_a_noop() {
        let mut arena = HostArena::new();
        let slot = arena.insert(boxed(1));
        assert!(arena.release(slot));
        assert!(!arena.release(slot));
    }

    #[test]
    fn reused_slot_fails_stale_generation_check() {
        let mut arena = HostArena::new();
        let first = arena.insert(boxed(1));
        arena.release(first);

        let second = arena.insert(boxed(2));
        assert_eq!(first.index, second.index); // slot was reused
        assert!(arena.get(first).is_none());
        let obj = arena.get(second).unwrap();
        assert_eq!(*obj.borrow().downcast_ref::<i32>().unwrap(), 2);
    }

    #[test]
    fn two_slots_can_share_one_object() {
        let mut arena = HostArena::new();
        let shared: Rc<RefCell<dyn Any>> = Rc::new(RefCell::new(10i32));
        let a = arena.insert(shared.clone());
        let b = arena.insert(shared);

        *arena.get(a).unwrap().borrow_mut().downcast_mut::<i32>().unwrap() = 42;
        let through_b = arena.get(b).unwrap();
        assert_eq!(*through_b.borrow().downcast_ref::<i32>().unwrap(), 42);
    }
}
