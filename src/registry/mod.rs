//! Opaque integer handles for objects owned by the [`Runtime`](crate::runtime::Runtime).
//!
//! A handle packs `[kind:8][generation:24][slot+1:32]`. Zero never names a
//! live object; a freed slot bumps its generation so old handles to it stop
//! resolving. A slot whose generation is exhausted is retired for good
//! instead of wrapping back to a value an old handle still carries.

use parking_lot::RwLock;
use std::fmt;

pub type Handle = u64;

pub const INVALID_HANDLE: Handle = 0;

const SLOT_BITS: u32 = 32;
const GEN_BITS: u32 = 24;
const GEN_MASK: u32 = (1 << GEN_BITS) - 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleKind {
    Node = 1,
    Publisher = 2,
    Subscription = 3,
    Timer = 4,
    Executor = 5,
}

impl HandleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleKind::Node => "node",
            HandleKind::Publisher => "publisher",
            HandleKind::Subscription => "subscription",
            HandleKind::Timer => "timer",
            HandleKind::Executor => "executor",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[inline]
fn pack(kind: HandleKind, generation: u32, slot: usize) -> Handle {
    ((kind as u64) << (SLOT_BITS + GEN_BITS))
        | (((generation & GEN_MASK) as u64) << SLOT_BITS)
        | (slot as u64 + 1)
}

/// Split a handle into `(kind tag, generation, slot)`.
#[inline]
fn unpack(handle: Handle) -> Option<(u8, u32, usize)> {
    let slot_plus_one = handle & ((1 << SLOT_BITS) - 1);
    if slot_plus_one == 0 {
        return None;
    }
    let generation = ((handle >> SLOT_BITS) as u32) & GEN_MASK;
    let tag = (handle >> (SLOT_BITS + GEN_BITS)) as u8;
    Some((tag, generation, (slot_plus_one - 1) as usize))
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Bump the generation of an emptied slot. False once the generation is
/// used up; such a slot is never handed out again.
#[inline]
fn retire<T>(entry: &mut Slot<T>) -> bool {
    if entry.generation >= GEN_MASK {
        return false;
    }
    entry.generation += 1;
    entry.generation < GEN_MASK
}

struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

/// Growable generational table mapping handles of one kind to values.
pub struct HandleTable<T> {
    kind: HandleKind,
    slots: RwLock<Slots<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    #[inline]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Store `value`, returning its handle. Returns [`INVALID_HANDLE`] only
    /// when the slot space is exhausted.
    pub fn insert(&self, value: T) -> Handle {
        let mut slots = self.slots.write();
        let slot = match slots.free.pop() {
            Some(slot) => slot,
            None => {
                if slots.entries.len() >= u32::MAX as usize {
                    tracing::error!("[HandleTable] {} table exhausted", self.kind);
                    return INVALID_HANDLE;
                }
                slots.entries.push(Slot {
                    generation: 0,
                    value: None,
                });
                slots.entries.len() - 1
            }
        };
        let entry = &mut slots.entries[slot];
        entry.value = Some(value);
        let generation = entry.generation;
        slots.live += 1;
        pack(self.kind, generation, slot)
    }

    fn locate(&self, slots: &Slots<T>, handle: Handle) -> Option<usize> {
        let (tag, generation, slot) = unpack(handle)?;
        if tag != self.kind as u8 {
            return None;
        }
        let entry = slots.entries.get(slot)?;
        (entry.generation == generation && entry.value.is_some()).then_some(slot)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        let slots = self.slots.read();
        self.locate(&slots, handle).is_some()
    }

    /// Run `f` on the live value behind `handle` under the read lock.
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slots = self.slots.read();
        let slot = self.locate(&slots, handle)?;
        slots.entries[slot].value.as_ref().map(f)
    }

    /// Take the value out and retire the handle.
    pub fn remove(&self, handle: Handle) -> Option<T> {
        let mut slots = self.slots.write();
        let slot = self.locate(&slots, handle)?;
        let entry = &mut slots.entries[slot];
        let value = entry.value.take();
        if retire(entry) {
            slots.free.push(slot);
        }
        slots.live -= 1;
        value
    }

    /// Remove every value matching `pred`, returning them.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut slots = self.slots.write();
        let mut removed = Vec::new();
        let Slots {
            entries,
            free,
            live,
        } = &mut *slots;
        for (idx, entry) in entries.iter_mut().enumerate() {
            if entry.value.as_ref().is_some_and(&mut pred) {
                removed.extend(entry.value.take());
                if retire(entry) {
                    free.push(idx);
                }
                *live -= 1;
            }
        }
        removed
    }

    /// Empty the table, retiring every handle.
    pub fn drain(&self) -> Vec<T> {
        self.remove_where(|_| true)
    }

    pub fn len(&self) -> usize {
        self.slots.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> HandleTable<T> {
    /// Clone the value out so the caller can use it without holding the lock.
    pub fn get(&self, handle: Handle) -> Option<T> {
        self.with(handle, T::clone)
    }

    /// Clones of every live value.
    pub fn values(&self) -> Vec<T> {
        self.slots
            .read()
            .entries
            .iter()
            .filter_map(|entry| entry.value.clone())
            .collect()
    }
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("kind", &self.kind)
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_never_issued_or_resolved() {
        let table = HandleTable::new(HandleKind::Node);
        let h = table.insert("a");
        assert_ne!(h, INVALID_HANDLE);
        assert!(!table.contains(INVALID_HANDLE));
        assert!(table.get(INVALID_HANDLE).is_none());
    }

    #[test]
    fn stale_handle_does_not_resolve_after_slot_reuse() {
        let table = HandleTable::new(HandleKind::Timer);
        let old = table.insert(1);
        assert_eq!(table.remove(old), Some(1));

        let new = table.insert(2);
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert_eq!(table.get(new), Some(2));
        assert!(table.remove(old).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn handles_of_another_kind_are_rejected() {
        let nodes = HandleTable::new(HandleKind::Node);
        let timers = HandleTable::new(HandleKind::Timer);
        let n = nodes.insert(());
        let t = timers.insert(());
        // same slot and generation, different tag
        assert!(!timers.contains(n));
        assert!(!nodes.contains(t));
    }

    #[test]
    fn remove_where_retires_matching_handles() {
        let table = HandleTable::new(HandleKind::Publisher);
        let a = table.insert(("n1", 1));
        let b = table.insert(("n2", 2));
        let c = table.insert(("n1", 3));

        let removed = table.remove_where(|(owner, _)| *owner == "n1");
        assert_eq!(removed.len(), 2);
        assert!(!table.contains(a));
        assert!(table.contains(b));
        assert!(!table.contains(c));
        assert_eq!(table.drain(), vec![("n2", 2)]);
        assert!(table.is_empty());
    }

    #[test]
    fn slot_is_reused_while_generations_remain() {
        let table = HandleTable::new(HandleKind::Executor);
        let mut last = INVALID_HANDLE;
        for _ in 0..4 {
            last = table.insert(0u8);
            table.remove(last);
        }
        let (tag, generation, slot) = unpack(last).unwrap();
        assert_eq!(tag, HandleKind::Executor as u8);
        assert_eq!(generation, 3);
        assert_eq!(slot, 0);
    }

    #[test]
    fn exhausted_slot_is_retired_instead_of_wrapping() {
        let table = HandleTable::new(HandleKind::Node);
        let first = table.insert(1);
        // fast-forward slot 0 to its last two generations
        table.slots.write().entries[0].generation = GEN_MASK - 2;
        let stale = pack(HandleKind::Node, GEN_MASK - 2, 0);
        assert_eq!(table.remove(stale), Some(1));
        assert!(table.get(first).is_none());

        let last = table.insert(2);
        assert_eq!(unpack(last), Some((HandleKind::Node as u8, GEN_MASK - 1, 0)));
        assert_eq!(table.remove(last), Some(2));

        // slot 0 is spent: a fresh value lands elsewhere and no old handle aliases it
        let fresh = table.insert(42);
        assert_eq!(unpack(fresh).map(|(_, _, slot)| slot), Some(1));
        for old in [first, stale, last, pack(HandleKind::Node, 0, 0)] {
            assert_ne!(old, fresh);
            assert!(table.get(old).is_none());
        }
        assert_eq!(table.get(fresh), Some(42));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_where_retires_exhausted_slots_too() {
        let table = HandleTable::new(HandleKind::Timer);
        let h = table.insert("t");
        table.slots.write().entries[0].generation = GEN_MASK - 1;
        assert_eq!(table.drain(), vec!["t"]);
        assert!(table.slots.read().free.is_empty());
        let next = table.insert("u");
        assert_ne!(next, h);
        assert_eq!(unpack(next).map(|(_, _, slot)| slot), Some(1));
    }
}
