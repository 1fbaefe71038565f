//! Coroutines and the arena that owns them.
use crate::context::Context;
use crate::stack::GuardedStack;
use std::fmt;

/// The closure a coroutine runs.
pub(crate) type Entry = Box<dyn FnOnce()>;

/// A handle to a coroutine owned by a reactor.
///
/// Handles stay valid after the coroutine they refer to is gone: the slot a
/// coroutine occupies is tagged with a generation that's bumped whenever the
/// slot is released, so a stale handle never refers to a newer coroutine.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CoroutineId {
    index: u32,
    generation: u32,
}

impl CoroutineId {
    #[cfg(test)]
    pub(crate) fn from_index(index: u32) -> Self {
        CoroutineId { index, generation: 0 }
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "coroutine {}.{}", self.index, self.generation)
    }
}

/// The status of a coroutine.
pub(crate) struct CoroutineStatus {
    /// The bits used to indicate the status of the coroutine.
    ///
    /// Multiple bits may be set in order to combine different statuses.
    bits: u8,
}

impl CoroutineStatus {
    /// The coroutine's stack has been prepared and it ran at least once.
    const STARTED: u8 = 0b00_0001;

    /// The coroutine sits in one of the ready queues.
    const WAKEDUP: u8 = 0b00_0010;

    /// The coroutine was asked to stop.
    const CANCELED: u8 = 0b00_0100;

    /// The deadline of a timed wait passed before the wait was satisfied.
    const DEADLINE_REACHED: u8 = 0b00_1000;

    /// The entry closure returned.
    const FINISHED: u8 = 0b01_0000;

    /// The coroutine is kept around after finishing, until it's awaited.
    const AWAITABLE: u8 = 0b10_0000;

    pub(crate) fn new() -> Self {
        Self { bits: 0 }
    }

    pub(crate) fn set_started(&mut self) {
        self.update_bits(Self::STARTED, true);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.bit_is_set(Self::STARTED)
    }

    pub(crate) fn set_wakedup(&mut self, enable: bool) {
        self.update_bits(Self::WAKEDUP, enable);
    }

    pub(crate) fn is_wakedup(&self) -> bool {
        self.bit_is_set(Self::WAKEDUP)
    }

    pub(crate) fn set_canceled(&mut self) {
        self.update_bits(Self::CANCELED, true);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.bit_is_set(Self::CANCELED)
    }

    pub(crate) fn set_deadline_reached(&mut self, enable: bool) {
        self.update_bits(Self::DEADLINE_REACHED, enable);
    }

    pub(crate) fn deadline_reached(&self) -> bool {
        self.bit_is_set(Self::DEADLINE_REACHED)
    }

    pub(crate) fn set_finished(&mut self) {
        self.update_bits(Self::FINISHED, true);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.bit_is_set(Self::FINISHED)
    }

    pub(crate) fn set_awaitable(&mut self) {
        self.update_bits(Self::AWAITABLE, true);
    }

    pub(crate) fn is_awaitable(&self) -> bool {
        self.bit_is_set(Self::AWAITABLE)
    }

    fn update_bits(&mut self, mask: u8, enable: bool) {
        self.bits = if enable { self.bits | mask } else { self.bits & !mask };
    }

    fn bit_is_set(&self, bit: u8) -> bool {
        self.bits & bit == bit
    }
}

/// A lightweight thread of control with its own stack.
pub(crate) struct Coroutine {
    /// The closure to run, taken when the coroutine starts.
    pub(crate) entry: Option<Entry>,

    pub(crate) stack: GuardedStack,

    /// The execution point to resume, only meaningful while the coroutine
    /// isn't running.
    pub(crate) context: Context,

    pub(crate) status: CoroutineStatus,

    /// The coroutine to wake up when this one finishes.
    pub(crate) awaiter: Option<CoroutineId>,
}

impl Coroutine {
    pub(crate) fn new(
        entry: Entry,
        stack: GuardedStack,
        awaitable: bool,
    ) -> Self {
        let mut status = CoroutineStatus::new();

        if awaitable {
            status.set_awaitable();
        }

        Coroutine {
            entry: Some(entry),
            stack,
            context: Context::new(),
            status,
            awaiter: None,
        }
    }
}

struct Slot {
    generation: u32,
    coroutine: Option<Coroutine>,
}

/// The coroutines owned by a reactor, indexed by `CoroutineId`.
pub(crate) struct Coroutines {
    slots: Vec<Slot>,

    /// The indexes of slots that are free to reuse.
    free: Vec<u32>,
}

impl Coroutines {
    pub(crate) fn new() -> Self {
        Coroutines { slots: Vec::new(), free: Vec::new() }
    }

    pub(crate) fn insert(&mut self, coroutine: Coroutine) -> CoroutineId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];

            slot.coroutine = Some(coroutine);
            CoroutineId { index, generation: slot.generation }
        } else {
            let index = self.slots.len() as u32;

            self.slots.push(Slot { generation: 0, coroutine: Some(coroutine) });
            CoroutineId { index, generation: 0 }
        }
    }

    pub(crate) fn get(&self, id: CoroutineId) -> Option<&Coroutine> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.coroutine.as_ref())
    }

    pub(crate) fn get_mut(
        &mut self,
        id: CoroutineId,
    ) -> Option<&mut Coroutine> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.coroutine.as_mut())
    }

    pub(crate) fn remove(&mut self, id: CoroutineId) -> Option<Coroutine> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let coroutine = slot.coroutine.take()?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(coroutine)
    }

    /// Returns the handles of all coroutines that didn't finish yet.
    pub(crate) fn unfinished(&self) -> Vec<CoroutineId> {
        self.iter()
            .filter(|(_, coro)| !coro.status.is_finished())
            .map(|(id, _)| id)
            .collect()
    }

    /// Removes and returns all coroutines that finished.
    pub(crate) fn remove_finished(&mut self) -> Vec<Coroutine> {
        let ids: Vec<_> = self
            .iter()
            .filter(|(_, coro)| coro.status.is_finished())
            .map(|(id, _)| id)
            .collect();

        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn iter(&self) -> impl Iterator<Item = (CoroutineId, &Coroutine)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let id = CoroutineId {
                index: index as u32,
                generation: slot.generation,
            };

            slot.coroutine.as_ref().map(|coro| (id, coro))
        })
    }
}
