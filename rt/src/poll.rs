//! Book keeping of descriptors registered with a reactor.
use crate::coroutine::CoroutineId;
use crate::network_poller::Events;
use std::os::fd::RawFd;

/// The coroutines woken up by a change to a descriptor's state.
pub(crate) type Waiters = [Option<CoroutineId>; 2];

/// The state of a single registered descriptor.
#[derive(Default)]
struct WaitState {
    registered: bool,

    /// The conditions observed since they were last consumed.
    ready: Events,

    /// The coroutine waiting for the descriptor to become readable.
    reader: Option<CoroutineId>,

    /// The coroutine waiting for the descriptor to become writable.
    writer: Option<CoroutineId>,
}

impl WaitState {
    fn take_waiters(&mut self) -> Waiters {
        [self.reader.take(), self.writer.take()]
    }
}

/// The wait states of all registered descriptors, indexed by descriptor.
///
/// Descriptors are small integers that the kernel hands out starting at the
/// lowest free number, so a vector indexed by descriptor stays compact.
pub(crate) struct WaitStates {
    states: Vec<WaitState>,
}

impl WaitStates {
    pub(crate) fn new() -> Self {
        WaitStates { states: Vec::new() }
    }

    /// Starts tracking `fd`, returning `false` if it's already registered.
    pub(crate) fn register(&mut self, fd: RawFd) -> bool {
        let Ok(index) = usize::try_from(fd) else { return false };

        if index >= self.states.len() {
            self.states.resize_with(index + 1, WaitState::default);
        }

        let state = &mut self.states[index];

        if state.registered {
            return false;
        }

        *state = WaitState { registered: true, ..WaitState::default() };
        true
    }

    pub(crate) fn is_registered(&self, fd: RawFd) -> bool {
        self.get(fd).is_some()
    }

    /// Stops tracking `fd`, returning the coroutines waiting for it.
    pub(crate) fn deregister(&mut self, fd: RawFd) -> Waiters {
        match self.get_mut(fd) {
            Some(state) => {
                let waiters = state.take_waiters();

                *state = WaitState::default();
                waiters
            }
            None => [None, None],
        }
    }

    /// Returns the conditions observed for `fd` that weren't consumed yet.
    pub(crate) fn ready(&self, fd: RawFd) -> Events {
        self.get(fd).map_or(Events::NONE, |state| state.ready)
    }

    /// Clears the `events` conditions of `fd`.
    pub(crate) fn consume(&mut self, fd: RawFd, events: Events) {
        if let Some(state) = self.get_mut(fd) {
            state.ready = state.ready & !events;
        }
    }

    /// Records `id` as the coroutine waiting for `events` on `fd`.
    ///
    /// If another coroutine is already waiting for one of these events, that
    /// coroutine is returned and nothing is changed.
    pub(crate) fn add_waiter(
        &mut self,
        fd: RawFd,
        events: Events,
        id: CoroutineId,
    ) -> Result<(), CoroutineId> {
        let Some(state) = self.get_mut(fd) else { return Ok(()) };
        let read = events.contains(Events::READ);
        let write = events.contains(Events::WRITE);

        if let Some(other) = state.reader.filter(|&other| read && other != id) {
            return Err(other);
        }

        if let Some(other) = state.writer.filter(|&other| write && other != id)
        {
            return Err(other);
        }

        if read {
            state.reader = Some(id);
        }

        if write {
            state.writer = Some(id);
        }

        Ok(())
    }

    /// Removes `id` as the coroutine waiting for `events` on `fd`.
    pub(crate) fn remove_waiter(
        &mut self,
        fd: RawFd,
        events: Events,
        id: CoroutineId,
    ) {
        let Some(state) = self.get_mut(fd) else { return };

        if events.contains(Events::READ) && state.reader == Some(id) {
            state.reader = None;
        }

        if events.contains(Events::WRITE) && state.writer == Some(id) {
            state.writer = None;
        }
    }

    /// Records the conditions reported by the poller for `fd`, returning the
    /// coroutines to wake up.
    ///
    /// The waiters stay registered until they observe the change themselves,
    /// as a coroutine may be woken up for other reasons before it gets to run.
    ///
    /// An error condition counts as both readable and writable, such that
    /// the next read or write reports the actual error. Each side consumes
    /// it separately, so it can't keep a descriptor ready forever.
    pub(crate) fn mark_ready(&mut self, fd: RawFd, events: Events) -> Waiters {
        let Some(state) = self.get_mut(fd) else { return [None, None] };
        let events = if events.contains(Events::ERROR) {
            Events::READ | Events::WRITE
        } else {
            events & (Events::READ | Events::WRITE)
        };

        state.ready |= events;

        let reader = state.reader.filter(|_| events.contains(Events::READ));
        let writer = state.writer.filter(|_| events.contains(Events::WRITE));

        [reader, writer]
    }

    fn get(&self, fd: RawFd) -> Option<&WaitState> {
        usize::try_from(fd)
            .ok()
            .and_then(|index| self.states.get(index))
            .filter(|state| state.registered)
    }

    fn get_mut(&mut self, fd: RawFd) -> Option<&mut WaitState> {
        usize::try_from(fd)
            .ok()
            .and_then(|index| self.states.get_mut(index))
            .filter(|state| state.registered)
    }
}
