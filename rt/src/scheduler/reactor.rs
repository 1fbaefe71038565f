//! Cooperative scheduling of coroutines on a single thread.
//!
//! A reactor runs coroutines in rounds. Coroutines that become ready while a
//! round is in progress are queued for the next round, so a coroutine that
//! yields or is woken up never runs again before everything queued ahead of it
//! had its turn. Between rounds the reactor polls for I/O readiness, expired
//! deadlines and signals, blocking only when there's nothing left to run.
//!
//! Coroutines suspend only in the operations that take a `&self` of the
//! reactor and document doing so: `yield_now`, `wait_for` (and the I/O
//! operations built on top of it), `sleep_until` and `await_all`. Each of
//! these returns a `Result`, so cancellation and timeouts show up as regular
//! values at the point the coroutine suspended.
use crate::config::Config;
use crate::context::{self, Context};
use crate::coroutine::{Coroutine, CoroutineId, Coroutines, Entry};
use crate::network_poller::{Event, Events, NetworkPoller};
use crate::poll::WaitStates;
use crate::result::{Error, Result};
use crate::scheduler::signal::{SignalInfo, SignalSet, Signals};
use crate::scheduler::timeouts::{Deadline, DeadlineQueue};
use crate::stack::GuardedStack;
use libc::{EBADF, EBUSY, EEXIST};
use log::{debug, error, trace};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ffi::c_int;
use std::io;
use std::mem::{swap, take, ManuallyDrop};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

thread_local! {
    /// The reactor that's running on the current thread.
    static CURRENT: RefCell<Option<Reactor>> = const { RefCell::new(None) };
}

/// Makes a reactor the current reactor for as long as this value lives.
struct Enter {
    previous: Option<Reactor>,
}

impl Enter {
    fn new(reactor: &Reactor) -> Self {
        let previous = CURRENT.with(|cur| cur.replace(Some(reactor.clone())));

        Enter { previous }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        let previous = self.previous.take();

        // The old value is dropped after the borrow ends, as dropping the last
        // handle to a reactor drops its coroutines, which may run arbitrary
        // code.
        let _current = CURRENT.with(|cur| cur.replace(previous));
    }
}

/// Marks signal handlers as running for as long as this value lives.
struct Dispatching<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> Dispatching<'a> {
    fn new(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Dispatching { flag }
    }
}

impl Drop for Dispatching<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Options for starting a coroutine.
#[derive(Copy, Clone, Debug, Default)]
pub struct StartOptions {
    /// The size of the coroutine's stack, instead of the reactor's default.
    pub stack_size: Option<usize>,

    /// If the coroutine should be kept around after it finishes, until
    /// another coroutine awaits it.
    pub awaitable: bool,
}

struct State {
    coroutines: Coroutines,

    /// The number of coroutines that didn't finish yet.
    active: usize,

    /// The running coroutine, or `None` if we're on the stack that called
    /// `Reactor::run`.
    current: Option<CoroutineId>,

    /// The coroutines to run in the current round.
    ready: VecDeque<CoroutineId>,

    /// The coroutines to run in the next round.
    ready_next: VecDeque<CoroutineId>,

    /// Coroutines that finished and are to be released once we're no longer
    /// running on their stacks.
    finished: Vec<CoroutineId>,

    wait_states: WaitStates,
    deadlines: DeadlineQueue,
    signals: Signals,

    /// The payload of the first coroutine that panicked.
    panic: Option<Box<dyn Any + Send>>,
}

impl State {
    fn new() -> Self {
        State {
            coroutines: Coroutines::new(),
            active: 0,
            current: None,
            ready: VecDeque::new(),
            ready_next: VecDeque::new(),
            finished: Vec::new(),
            wait_states: WaitStates::new(),
            deadlines: DeadlineQueue::new(),
            signals: Signals::new(),
            panic: None,
        }
    }

    fn running(&self) -> CoroutineId {
        match self.current {
            Some(id) => id,
            None => panic!("this operation must be used inside a coroutine"),
        }
    }

    fn is_canceled(&self, id: CoroutineId) -> bool {
        self.coroutines.get(id).map_or(false, |c| c.status.is_canceled())
    }

    /// Returns `true` if `id` finished, including when it no longer exists.
    fn is_finished(&self, id: CoroutineId) -> bool {
        self.coroutines.get(id).map_or(true, |c| c.status.is_finished())
    }

    /// Queues `id` for the next round, unless it's already queued.
    fn wakeup(&mut self, id: CoroutineId) {
        let Some(coro) = self.coroutines.get_mut(id) else { return };

        if coro.status.is_finished() || coro.status.is_wakedup() {
            return;
        }

        coro.status.set_wakedup(true);
        self.ready_next.push_back(id);
    }

    fn cancel(&mut self, id: CoroutineId) {
        let Some(coro) = self.coroutines.get_mut(id) else {
            debug!("not canceling {}, it no longer exists", id);
            return;
        };

        if coro.status.is_finished() {
            debug!("not canceling {}, it already finished", id);
            return;
        }

        debug!("canceling {}", id);
        coro.status.set_canceled();
        self.deadlines.remove(id);
        self.wakeup(id);
    }

    fn set_deadline(&mut self, id: CoroutineId, deadline: Deadline) {
        let Some(at) = deadline.instant() else { return };

        if let Some(coro) = self.coroutines.get_mut(id) {
            coro.status.set_deadline_reached(false);
        }

        self.deadlines.push(id, at);
    }

    /// Removes the deadline of `id`, returning `true` if it was reached.
    fn clear_deadline(&mut self, id: CoroutineId) -> bool {
        self.deadlines.remove(id);

        match self.coroutines.get_mut(id) {
            Some(coro) => {
                let reached = coro.status.deadline_reached();

                coro.status.set_deadline_reached(false);
                reached
            }
            None => false,
        }
    }

    /// Returns the next coroutine to run in the current round.
    fn next_in_round(&mut self) -> Option<CoroutineId> {
        while let Some(id) = self.ready.pop_front() {
            let Some(coro) = self.coroutines.get_mut(id) else { continue };

            if coro.status.is_finished() {
                continue;
            }

            coro.status.set_wakedup(false);
            return Some(id);
        }

        None
    }

    fn start_round(&mut self) {
        swap(&mut self.ready, &mut self.ready_next);
    }

    /// Returns how long a poll may block.
    fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        if !self.ready.is_empty() || !self.ready_next.is_empty() {
            return Some(Duration::ZERO);
        }

        self.deadlines.peek().map(|at| at.saturating_duration_since(now))
    }

    fn context(&self, id: Option<CoroutineId>) -> Option<*mut *mut u8> {
        match id {
            Some(id) => self.coroutines.get(id).map(|c| c.context.as_ptr()),
            None => None,
        }
    }
}

struct Inner {
    config: Config,
    poller: NetworkPoller,

    /// The context of the stack that called `Reactor::run`.
    initial: Context,

    /// The buffer the poller writes its events into.
    events: RefCell<Vec<Event>>,

    /// Set while signal handlers run, as they can't suspend.
    dispatching: Cell<bool>,

    state: RefCell<State>,
}

/// A single-threaded scheduler of coroutines with integrated I/O polling.
///
/// A `Reactor` is a cheap handle: clones refer to the same scheduler. It owns
/// all coroutines started through it, and runs them when `run` is called on
/// the thread that created it.
///
/// Coroutines can get the reactor they're running on using
/// `Reactor::current`. Capturing a `Reactor` in a coroutine that never runs
/// creates a reference cycle, keeping the reactor alive until the thread
/// exits.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Returns a reactor configured using `Config::from_env`.
    pub fn new() -> io::Result<Reactor> {
        Reactor::with_config(Config::from_env())
    }

    pub fn with_config(mut config: Config) -> io::Result<Reactor> {
        Config::validate_stack_size(config.stack_size)?;

        config.poll_events = config.poll_batch_size();

        let poller = NetworkPoller::new()?;
        let events = Vec::with_capacity(config.poll_events);

        Ok(Reactor {
            inner: Rc::new(Inner {
                config,
                poller,
                initial: Context::new(),
                events: RefCell::new(events),
                dispatching: Cell::new(false),
                state: RefCell::new(State::new()),
            }),
        })
    }

    /// Returns the reactor running on the current thread, if any.
    pub fn current() -> Option<Reactor> {
        CURRENT.with(|cur| cur.borrow().clone())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Starts a coroutine that's released as soon as it finishes.
    ///
    /// The coroutine first runs in the next round.
    ///
    /// # Panics
    ///
    /// This method panics if the coroutine's stack can't be allocated.
    pub fn start_coroutine<F>(&self, entry: F) -> CoroutineId
    where
        F: FnOnce() + 'static,
    {
        self.start(Box::new(entry), false)
    }

    /// Starts a coroutine that's kept around after it finishes, until it's
    /// awaited using `await_coroutine` or `await_all`, or `run` returns.
    ///
    /// # Panics
    ///
    /// This method panics if the coroutine's stack can't be allocated.
    pub fn start_awaitable_coroutine<F>(&self, entry: F) -> CoroutineId
    where
        F: FnOnce() + 'static,
    {
        self.start(Box::new(entry), true)
    }

    /// Starts a coroutine using custom options.
    ///
    /// Unlike the other `start_` methods, failing to allocate the stack
    /// produces an error. An error is also produced if the stack size isn't a
    /// positive multiple of the page size.
    pub fn start_coroutine_with<F>(
        &self,
        options: StartOptions,
        entry: F,
    ) -> io::Result<CoroutineId>
    where
        F: FnOnce() + 'static,
    {
        let size = options.stack_size.unwrap_or(self.inner.config.stack_size);

        Config::validate_stack_size(size)?;

        let stack = GuardedStack::new(size)?;

        Ok(self.insert(Coroutine::new(
            Box::new(entry),
            stack,
            options.awaitable,
        )))
    }

    fn start(&self, entry: Entry, awaitable: bool) -> CoroutineId {
        // There's nothing a caller can do at runtime in response to running
        // out of address space or memory map areas, so we just terminate if
        // this ever happens.
        let stack = GuardedStack::new(self.inner.config.stack_size)
            .unwrap_or_else(|err| {
                panic!(
                    "Failed to allocate a coroutine stack: {}. You may need to \
                    increase the number of memory map areas allowed",
                    err
                )
            });

        self.insert(Coroutine::new(entry, stack, awaitable))
    }

    fn insert(&self, coroutine: Coroutine) -> CoroutineId {
        let mut state = self.inner.state.borrow_mut();
        let id = state.coroutines.insert(coroutine);

        state.active += 1;
        state.wakeup(id);
        debug!("started {}", id);
        id
    }

    /// Returns the coroutine that's currently running.
    pub fn current_coroutine(&self) -> Option<CoroutineId> {
        self.inner.state.borrow().current
    }

    /// Returns the number of coroutines that didn't finish yet.
    pub fn active_coroutines(&self) -> usize {
        self.inner.state.borrow().active
    }

    pub fn is_canceled(&self, id: CoroutineId) -> bool {
        self.inner.state.borrow().is_canceled(id)
    }

    /// Returns `true` if `id` finished or no longer exists.
    pub fn is_finished(&self, id: CoroutineId) -> bool {
        self.inner.state.borrow().is_finished(id)
    }

    /// Queues `id` for the next round, unless it's already queued or finished.
    ///
    /// A coroutine that is woken up while it's suspended resumes and checks
    /// whether what it waits for happened. If not, it suspends again.
    pub fn wakeup(&self, id: CoroutineId) {
        self.inner.state.borrow_mut().wakeup(id);
    }

    /// Cancels `id` and wakes it up.
    ///
    /// Cancellation is cooperative: the coroutine observes it the next time it
    /// suspends (or right away, if it's suspended), and the operation it
    /// suspended in produces `Error::Canceled`. Canceling a coroutine more
    /// than once has no additional effect, and canceling a finished coroutine
    /// does nothing.
    pub fn cancel(&self, id: CoroutineId) {
        self.inner.state.borrow_mut().cancel(id);
    }

    /// Cancels every coroutine that didn't finish yet.
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.borrow_mut();

        debug!("canceling all {} active coroutine(s)", state.active);

        for id in state.coroutines.unfinished() {
            state.cancel(id);
        }
    }

    /// Suspends the current coroutine until the next round.
    ///
    /// Every coroutine queued before the current one gets to run before this
    /// method returns.
    pub fn yield_now(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            let id = state.running();

            trace!("{} yields", id);
            state.wakeup(id);
        }

        self.switch_coroutine();
    }

    /// Suspends the current coroutine until `fd` is ready for any of
    /// `events`, or an error condition occurs.
    ///
    /// The descriptor must be registered using `register_fd`, and `events`
    /// is made up of `Events::READ` and `Events::WRITE`. The returned set
    /// contains the requested events that are ready. An error or hang-up
    /// makes the descriptor ready for both, such that retrying the
    /// operation reports the error.
    ///
    /// # Errors
    ///
    /// - `Error::Canceled` if the coroutine was canceled, even if the
    ///   descriptor is ready.
    /// - `Error::TimedOut` if the deadline passed first.
    /// - `Error::Os` with `EBADF` if the descriptor isn't registered, or is
    ///   deregistered while waiting.
    ///
    /// # Panics
    ///
    /// Waiting for an event another coroutine is already waiting for on the
    /// same descriptor panics in debug builds, and produces `Error::Os` with
    /// `EBUSY` in release builds.
    pub fn wait_for(
        &self,
        fd: impl AsFd,
        events: Events,
        deadline: Deadline,
    ) -> Result<Events> {
        self.wait_for_raw(fd.as_fd().as_raw_fd(), events, deadline)
    }

    pub(crate) fn wait_for_raw(
        &self,
        fd: RawFd,
        events: Events,
        deadline: Deadline,
    ) -> Result<Events> {
        let id = {
            let mut state = self.inner.state.borrow_mut();
            let id = state.running();

            if state.is_canceled(id) {
                return Err(Error::Canceled);
            }

            if !state.wait_states.is_registered(fd) {
                return Err(Error::from_raw_os_error(EBADF));
            }

            let ready = state.wait_states.ready(fd) & events;

            if !ready.is_empty() {
                return Ok(ready);
            }

            state.wait_states.consume(fd, events);

            if let Err(other) = state.wait_states.add_waiter(fd, events, id) {
                if cfg!(debug_assertions) {
                    panic!(
                        "{} can't wait for {:?} on fd {}, as {} is already \
                        waiting for it",
                        id, events, fd, other
                    );
                }

                return Err(Error::from_raw_os_error(EBUSY));
            }

            state.set_deadline(id, deadline);
            debug!(
                "{} waits for {:?} on fd {} with deadline {:?}",
                id, events, fd, deadline
            );
            id
        };

        loop {
            self.switch_coroutine();

            let mut state = self.inner.state.borrow_mut();
            let result = if state.is_canceled(id) {
                Err(Error::Canceled)
            } else if state.coroutines.get(id).map_or(false, |coro| {
                coro.status.deadline_reached()
            }) {
                Err(Error::TimedOut)
            } else if !state.wait_states.is_registered(fd) {
                Err(Error::from_raw_os_error(EBADF))
            } else {
                let ready = state.wait_states.ready(fd) & events;

                if ready.is_empty() {
                    // Woken up for some other reason, so we keep waiting.
                    continue;
                }

                Ok(ready)
            };

            state.wait_states.remove_waiter(fd, events, id);
            state.clear_deadline(id);
            return result;
        }
    }

    /// Returns `true` if the running coroutine was canceled.
    pub(crate) fn current_is_canceled(&self) -> bool {
        let state = self.inner.state.borrow();

        state.is_canceled(state.running())
    }

    /// Clears the `events` conditions recorded for `fd`, such that the next
    /// `wait_for` suspends until the poller reports them again.
    pub(crate) fn consume(&self, fd: RawFd, events: Events) {
        self.inner.state.borrow_mut().wait_states.consume(fd, events);
    }

    /// Suspends the current coroutine until `deadline` passes.
    ///
    /// Using `Deadline::NEVER` suspends the coroutine until it's canceled.
    ///
    /// # Errors
    ///
    /// `Error::Canceled` is returned if the coroutine is canceled first.
    pub fn sleep_until(&self, deadline: Deadline) -> Result<()> {
        let id = {
            let mut state = self.inner.state.borrow_mut();
            let id = state.running();

            if state.is_canceled(id) {
                return Err(Error::Canceled);
            }

            state.set_deadline(id, deadline);
            id
        };

        loop {
            self.switch_coroutine();

            let mut state = self.inner.state.borrow_mut();

            if state.is_canceled(id) {
                state.clear_deadline(id);
                return Err(Error::Canceled);
            }

            if state.clear_deadline(id) {
                return Ok(());
            }

            // The deadline is removed above, so it's added back if the wake up
            // was spurious.
            state.set_deadline(id, deadline);
        }
    }

    /// Suspends the current coroutine for `duration`.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.sleep_until(Deadline::after(duration))
    }

    /// Suspends the current coroutine until `id` finishes.
    ///
    /// See `await_all` for more details.
    pub fn await_coroutine(&self, id: CoroutineId) -> Result<()> {
        self.await_all(&[id])
    }

    /// Suspends the current coroutine until all the given coroutines finish.
    ///
    /// Awaitable coroutines that finished are released once this method
    /// observes them. Coroutines that no longer exist count as finished.
    ///
    /// # Errors
    ///
    /// If the current coroutine is already canceled, `Error::Canceled` is
    /// returned right away. If it's canceled while waiting, all coroutines
    /// that didn't finish yet are canceled too, and `Error::Canceled` is
    /// returned.
    ///
    /// # Panics
    ///
    /// A coroutine can't await itself. Awaiting a coroutine that another
    /// coroutine already awaits panics in debug builds, and produces
    /// `Error::Os` with `EBUSY` in release builds.
    pub fn await_all(&self, coroutines: &[CoroutineId]) -> Result<()> {
        let id = {
            let mut state = self.inner.state.borrow_mut();
            let id = state.running();

            if state.is_canceled(id) {
                return Err(Error::Canceled);
            }

            for &other in coroutines {
                assert_ne!(other, id, "{} can't await itself", id);

                let awaiter = state
                    .coroutines
                    .get(other)
                    .and_then(|coro| coro.awaiter)
                    .filter(|&awaiter| awaiter != id);

                if let Some(awaiter) = awaiter {
                    if cfg!(debug_assertions) {
                        panic!(
                            "{} can't await {}, as {} is already awaiting it",
                            id, other, awaiter
                        );
                    }

                    return Err(Error::from_raw_os_error(EBUSY));
                }
            }

            for &other in coroutines {
                if let Some(coro) = state.coroutines.get_mut(other) {
                    if !coro.status.is_finished() {
                        coro.awaiter = Some(id);
                    }
                }
            }

            debug!("{} awaits {} coroutine(s)", id, coroutines.len());
            id
        };

        let result = loop {
            {
                let mut state = self.inner.state.borrow_mut();

                if state.is_canceled(id) {
                    debug!("{} was canceled, canceling what it awaits", id);

                    for &other in coroutines {
                        if let Some(coro) = state.coroutines.get_mut(other) {
                            if coro.awaiter == Some(id) {
                                coro.awaiter = None;
                            }
                        }

                        state.cancel(other);
                    }

                    break Err(Error::Canceled);
                }

                if coroutines.iter().all(|&other| state.is_finished(other)) {
                    break Ok(());
                }
            }

            self.switch_coroutine();
        };

        self.release_awaited(coroutines);
        result
    }

    /// Releases the awaitable coroutines in `coroutines` that finished.
    fn release_awaited(&self, coroutines: &[CoroutineId]) {
        let released: Vec<_> = {
            let mut state = self.inner.state.borrow_mut();

            coroutines
                .iter()
                .filter_map(|&other| {
                    let zombie = state.coroutines.get(other).map_or(false, |c| {
                        c.status.is_awaitable() && c.status.is_finished()
                    });

                    if zombie {
                        state.coroutines.remove(other)
                    } else {
                        None
                    }
                })
                .collect()
        };

        // Dropping a coroutine may run arbitrary code, so this happens after
        // the state is no longer borrowed.
        drop(released);
    }

    /// Starts watching `fd` for readiness.
    ///
    /// The descriptor must be in non-blocking mode, and stay open until it's
    /// deregistered using `close_fd`.
    pub fn register_fd(&self, fd: impl AsFd) -> io::Result<()> {
        let raw = fd.as_fd().as_raw_fd();
        let mut state = self.inner.state.borrow_mut();

        if !state.wait_states.register(raw) {
            return Err(io::Error::from_raw_os_error(EEXIST));
        }

        if let Err(err) = self.inner.poller.add(raw) {
            state.wait_states.deregister(raw);
            return Err(err);
        }

        debug!("registered fd {}", raw);
        Ok(())
    }

    /// Stops watching `fd`, waking up any coroutines waiting for it.
    ///
    /// The waiting coroutines observe `Error::Os` with `EBADF`. Closing the
    /// descriptor is up to the caller, and must happen after calling this
    /// method.
    pub fn close_fd(&self, fd: impl AsFd) {
        let raw = fd.as_fd().as_raw_fd();
        let mut state = self.inner.state.borrow_mut();

        for id in state.wait_states.deregister(raw).into_iter().flatten() {
            state.wakeup(id);
        }

        if let Err(err) = self.inner.poller.delete(raw) {
            debug!("failed to remove fd {} from the poller: {}", raw, err);
        }

        debug!("deregistered fd {}", raw);
    }

    /// Runs `handler` whenever `signal` is delivered.
    ///
    /// See `on_signals` for more details.
    pub fn on_signal<F>(&self, signal: c_int, handler: F) -> io::Result<()>
    where
        F: Fn(SignalInfo) + 'static,
    {
        let mut signals = SignalSet::new();

        signals.add(signal);
        self.on_signals(&signals, handler)
    }

    /// Runs `handler` whenever one of `signals` is delivered.
    ///
    /// The signals are blocked for the current thread, and are instead picked
    /// up when the reactor polls. Threads spawned afterwards inherit the
    /// blocked signals. Handlers run on the reactor's own context, and can't
    /// suspend. Registering a handler for a signal that already has one
    /// replaces the existing handler.
    ///
    /// Signals sent to the whole process are delivered to any thread that
    /// doesn't block them. To reliably handle such signals, register the
    /// handlers before spawning other threads, or block the signals in every
    /// other thread. Signals directed at the reactor's thread (e.g. using
    /// `pthread_kill`) are always picked up.
    ///
    /// # Errors
    ///
    /// An error is returned if the signals can't be blocked, or the signal
    /// descriptor can't be created or added to the poller. In that case the
    /// thread's signal mask is left as it was.
    pub fn on_signals<F>(
        &self,
        signals: &SignalSet,
        handler: F,
    ) -> io::Result<()>
    where
        F: Fn(SignalInfo) + 'static,
    {
        let poller = &self.inner.poller;

        self.inner.state.borrow_mut().signals.register(
            signals,
            Rc::new(handler),
            |fd| poller.add(fd),
        )?;

        debug!("handling signals {:?}", signals);
        Ok(())
    }

    /// Runs coroutines until all of them finished.
    ///
    /// This returns right away if there are no coroutines. If a coroutine
    /// panics, the panic is resumed here once control is back on the calling
    /// stack.
    ///
    /// # Panics
    ///
    /// This method panics if it's called from inside a coroutine.
    pub fn run(&self) {
        {
            let state = self.inner.state.borrow();

            assert!(
                state.current.is_none(),
                "Reactor::run can't be used inside a coroutine"
            );

            if state.active == 0 {
                return;
            }
        }

        let _enter = Enter::new(self);

        self.switch_coroutine();

        let (released, panic) = {
            let mut state = self.inner.state.borrow_mut();

            state.finished.clear();
            (state.coroutines.remove_finished(), state.panic.take())
        };

        debug!("released {} finished coroutine(s)", released.len());
        drop(released);

        if let Some(payload) = panic {
            resume_unwind(payload);
        }
    }

    /// Suspends whatever is running and resumes the next ready coroutine,
    /// polling when nothing is ready.
    fn switch_coroutine(&self) {
        assert!(!self.inner.dispatching.get(), "signal handlers can't suspend");

        let next = self.next_ready();
        let data = Rc::as_ptr(&self.inner) as *mut u8;
        let (from, to) = {
            let mut state = self.inner.state.borrow_mut();
            let from = state
                .context(state.current)
                .unwrap_or_else(|| self.inner.initial.as_ptr());
            let Some(coro) = state.coroutines.get_mut(next) else {
                unreachable!("{} was picked but doesn't exist", next)
            };

            if !coro.status.is_started() {
                coro.status.set_started();
                coro.context.prepare(&mut coro.stack, coroutine_main, data);
            }

            let to = coro.context.as_ptr();

            if let Some(current) = state.current {
                trace!("switching from {} to {}", current, next);
            } else {
                trace!("switching to {}", next);
            }

            state.current = Some(next);
            (from, to)
        };

        // Safety: the target either is a prepared context, or was saved when
        // it suspended through this very function.
        unsafe { context::switch(from, to) };

        self.release_finished();
    }

    /// Suspends the current coroutine and resumes the stack that called
    /// `run`.
    fn switch_to_initial(&self) {
        let from = {
            let mut state = self.inner.state.borrow_mut();
            let Some(from) = state.context(state.current) else {
                unreachable!("switching back requires a running coroutine")
            };

            trace!("switching back to the caller of Reactor::run");
            state.current = None;
            from
        };

        // Safety: the initial context was saved when `run` switched away from
        // it.
        unsafe { context::switch(from, self.inner.initial.as_ptr()) };
    }

    /// Returns the next coroutine to run, starting new rounds and polling as
    /// needed.
    fn next_ready(&self) -> CoroutineId {
        loop {
            let mut state = self.inner.state.borrow_mut();

            if let Some(id) = state.next_in_round() {
                return id;
            }

            if state.ready_next.is_empty() {
                drop(state);

                // Nothing is runnable, so we block until something is.
                while self.inner.state.borrow().ready_next.is_empty() {
                    self.poll();
                }

                self.inner.state.borrow_mut().start_round();
            } else {
                state.start_round();
                drop(state);

                // Pick up pending events without blocking, such that
                // coroutines woken up by them aren't starved.
                self.poll();
            }
        }
    }

    /// Polls for I/O readiness, then wakes up coroutines whose deadline
    /// passed, then runs the handlers of any pending signals.
    fn poll(&self) {
        let mut signalled = false;

        {
            let now = Instant::now();
            let timeout = self.inner.state.borrow().poll_timeout(now);
            let mut events = self.inner.events.borrow_mut();
            let mut state = self.inner.state.borrow_mut();
            let signal_fd = state.signals.raw_fd();

            for (fd, ready) in self.inner.poller.poll(&mut events, timeout) {
                if Some(fd) == signal_fd {
                    signalled = true;
                    continue;
                }

                let waiters = state.wait_states.mark_ready(fd, ready);

                for id in waiters.into_iter().flatten() {
                    state.wakeup(id);
                }
            }

            let now = Instant::now();

            while let Some(id) = state.deadlines.pop_expired(now) {
                if let Some(coro) = state.coroutines.get_mut(id) {
                    coro.status.set_deadline_reached(true);
                }

                debug!("the deadline of {} passed", id);
                state.wakeup(id);
            }
        }

        if signalled {
            self.dispatch_signals();
        }
    }

    fn dispatch_signals(&self) {
        loop {
            let next = self.inner.state.borrow().signals.next();
            let (info, handler) = match next {
                Ok(Some(pending)) => pending,
                Ok(None) => break,
                Err(err) => {
                    error!("failed to read pending signals: {}", err);
                    break;
                }
            };

            debug!(
                "received signal {} from process {}",
                info.signal(),
                info.sender()
            );

            if let Some(handler) = handler {
                let _dispatching = Dispatching::new(&self.inner.dispatching);

                handler(info);
            }
        }
    }

    /// Releases the coroutines that finished, now that we're no longer
    /// running on their stacks.
    fn release_finished(&self) {
        let released: Vec<_> = {
            let mut state = self.inner.state.borrow_mut();
            let ids = take(&mut state.finished);

            ids.into_iter()
                .filter_map(|id| state.coroutines.remove(id))
                .collect()
        };

        drop(released);
    }

    /// Marks the current coroutine as finished and switches away from it for
    /// the last time.
    fn finish(&self) -> ! {
        let (id, done) = {
            let mut state = self.inner.state.borrow_mut();
            let id = state.running();
            let mut awaiter = None;
            let mut awaitable = false;

            state.deadlines.remove(id);

            if let Some(coro) = state.coroutines.get_mut(id) {
                coro.status.set_finished();
                awaiter = coro.awaiter.take();
                awaitable = coro.status.is_awaitable();
            }

            if !awaitable {
                state.finished.push(id);
            }

            state.active -= 1;
            debug!("{} finished, {} remain active", id, state.active);

            let done = state.active == 0 || state.panic.is_some();

            if let Some(awaiter) = awaiter.filter(|_| !done) {
                state.wakeup(awaiter);
            }

            (id, done)
        };

        if done {
            self.switch_to_initial();
        } else {
            self.switch_coroutine();
        }

        unreachable!("{} was resumed after it finished", id)
    }
}

/// The function every coroutine starts in.
unsafe extern "C" fn coroutine_main(data: *mut u8) -> ! {
    // Safety: `data` is the pointer of the reactor's `Rc`, which the caller of
    // `Reactor::run` keeps alive for as long as coroutines run. We don't own
    // any references to it, hence the `ManuallyDrop`.
    let reactor = ManuallyDrop::new(Reactor {
        inner: Rc::from_raw(data as *const Inner),
    });
    let (id, entry) = {
        let mut state = reactor.inner.state.borrow_mut();
        let id = state.running();

        (id, state.coroutines.get_mut(id).and_then(|coro| coro.entry.take()))
    };

    if let Some(entry) = entry {
        // Unwinding can't cross the boundary of the stack, so panics are
        // caught here and resumed by `Reactor::run`.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(entry)) {
            let mut state = reactor.inner.state.borrow_mut();

            error!("{} panicked", id);

            if state.panic.is_none() {
                state.panic = Some(payload);
            }
        }
    }

    reactor.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{pipe, reactor};
    use libc::{SIGUSR1, SIGUSR2};
    use similar_asserts::assert_eq;
    use std::thread;

    fn current() -> Reactor {
        Reactor::current().unwrap()
    }

    #[test]
    fn test_run_without_coroutines() {
        let reactor = reactor();

        reactor.run();
        assert_eq!(reactor.active_coroutines(), 0);
    }

    #[test]
    fn test_with_config_invalid_stack_size() {
        let config = Config { stack_size: 0, ..Config::new() };

        assert!(Reactor::with_config(config).is_err());
    }

    #[test]
    fn test_with_config_limits_poll_events() {
        let large = Config { poll_events: usize::MAX, ..Config::new() };
        let empty = Config { poll_events: 0, ..Config::new() };
        let reactor = Reactor::with_config(large).unwrap();

        assert_eq!(reactor.config().poll_events, 4096);
        assert!(reactor.inner.events.borrow().capacity() <= i32::MAX as usize);
        assert_eq!(
            Reactor::with_config(empty).unwrap().config().poll_events,
            1
        );
    }

    #[test]
    fn test_start_coroutine_runs_each_entry_once() {
        let reactor = reactor();
        let counter = Rc::new(Cell::new(0));

        for _ in 0..10 {
            let counter = counter.clone();

            reactor.start_coroutine(move || counter.set(counter.get() + 1));
        }

        assert_eq!(reactor.active_coroutines(), 10);
        assert_eq!(counter.get(), 0);

        reactor.run();

        assert_eq!(counter.get(), 10);
        assert_eq!(reactor.active_coroutines(), 0);
        assert_eq!(reactor.inner.state.borrow().coroutines.len(), 0);
    }

    #[test]
    fn test_current() {
        let reactor = reactor();
        let seen = Rc::new(Cell::new(None));
        let inner_seen = seen.clone();
        let id = reactor.start_coroutine(move || {
            inner_seen.set(current().current_coroutine());
        });

        assert!(Reactor::current().is_none());
        assert_eq!(reactor.current_coroutine(), None);

        reactor.run();

        assert_eq!(seen.get(), Some(id));
        assert!(Reactor::current().is_none());
    }

    #[test]
    fn test_start_coroutine_from_coroutine() {
        let reactor = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let outer_log = log.clone();

        reactor.start_coroutine(move || {
            let inner_log = outer_log.clone();

            current().start_coroutine(move || inner_log.borrow_mut().push(2));
            outer_log.borrow_mut().push(1);
        });

        reactor.run();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_yield_runs_queued_coroutines_first() {
        for children in [0, 1, 2, 10, 100] {
            let reactor = reactor();
            let finished = Rc::new(Cell::new(0));
            let observed = Rc::new(Cell::new(None));
            let parent_finished = finished.clone();
            let parent_observed = observed.clone();

            reactor.start_coroutine(move || {
                let reactor = current();

                for _ in 0..children {
                    let finished = parent_finished.clone();

                    reactor.start_coroutine(move || {
                        finished.set(finished.get() + 1)
                    });
                }

                reactor.yield_now();
                parent_observed.set(Some(parent_finished.get()));
            });

            reactor.run();
            assert_eq!(observed.get(), Some(children));
        }
    }

    #[test]
    fn test_yield_interleaves_coroutines() {
        let reactor = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b"] {
            let log = log.clone();

            reactor.start_coroutine(move || {
                for step in 0..3 {
                    log.borrow_mut().push(format!("{}{}", name, step));
                    current().yield_now();
                }
            });
        }

        reactor.run();
        assert_eq!(*log.borrow(), vec!["a0", "b0", "a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_wakeup_is_idempotent() {
        let reactor = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let a_log = log.clone();
        let b_log = log.clone();
        let a = reactor.start_coroutine(move || {
            let reactor = current();

            a_log.borrow_mut().push("a0");
            reactor.yield_now();
            a_log.borrow_mut().push("a1");
            reactor.yield_now();
            a_log.borrow_mut().push("a2");
        });

        reactor.start_coroutine(move || {
            let reactor = current();

            reactor.wakeup(a);
            reactor.wakeup(a);
            reactor.wakeup(a);
            b_log.borrow_mut().push("b0");
            reactor.yield_now();
            b_log.borrow_mut().push("b1");
        });

        reactor.run();
        assert_eq!(*log.borrow(), vec!["a0", "b0", "a1", "b1", "a2"]);
    }

    #[test]
    fn test_await_coroutine() {
        let reactor = reactor();
        let awaited = Rc::new(Cell::new(false));
        let violations = Rc::new(Cell::new(0));
        let child_awaited = awaited.clone();
        let child_violations = violations.clone();
        let child = reactor.start_awaitable_coroutine(move || {
            for _ in 0..5 {
                if child_awaited.get() {
                    child_violations.set(child_violations.get() + 1);
                }

                current().yield_now();
            }
        });
        let parent_awaited = awaited.clone();

        reactor.start_coroutine(move || {
            current().await_coroutine(child).unwrap();
            parent_awaited.set(true);
        });

        reactor.run();

        assert!(awaited.get());
        assert_eq!(violations.get(), 0);
        assert!(reactor.is_finished(child));
    }

    #[test]
    fn test_await_finished_coroutine() {
        let reactor = reactor();
        let results = Rc::new(RefCell::new(Vec::new()));
        let awaitable = reactor.start_awaitable_coroutine(|| {});
        let plain = reactor.start_coroutine(|| {});
        let inner_results = results.clone();

        reactor.start_coroutine(move || {
            let reactor = current();

            reactor.yield_now();
            inner_results
                .borrow_mut()
                .push(reactor.await_coroutine(awaitable).is_ok());
            inner_results
                .borrow_mut()
                .push(reactor.await_coroutine(plain).is_ok());

            // Awaiting a released coroutine again is fine too.
            inner_results
                .borrow_mut()
                .push(reactor.await_coroutine(awaitable).is_ok());
        });

        reactor.run();
        assert_eq!(*results.borrow(), vec![true, true, true]);
    }

    #[test]
    fn test_await_releases_zombies() {
        let reactor = reactor();
        let child = reactor.start_awaitable_coroutine(|| {});
        let live = Rc::new(Cell::new((0, 0)));
        let inner_live = live.clone();
        let inner = reactor.inner.clone();

        reactor.start_coroutine(move || {
            let reactor = current();

            reactor.yield_now();

            let before = inner.state.borrow().coroutines.len();

            reactor.await_coroutine(child).unwrap();

            let after = inner.state.borrow().coroutines.len();

            inner_live.set((before, after));
        });

        reactor.run();

        // The zombie and the awaiting coroutine, then only the latter.
        assert_eq!(live.get(), (2, 1));
    }

    #[test]
    fn test_zombies_are_released_when_run_returns() {
        let reactor = reactor();
        let child = reactor.start_awaitable_coroutine(|| {});

        reactor.run();

        assert!(reactor.is_finished(child));
        assert_eq!(reactor.inner.state.borrow().coroutines.len(), 0);
    }

    #[test]
    fn test_await_cancels_awaited_coroutine() {
        let reactor = reactor();
        let result = Rc::new(RefCell::new(None));
        let a_canceled = Rc::new(Cell::new(false));
        let inner_a_canceled = a_canceled.clone();
        let a = reactor.start_awaitable_coroutine(move || {
            let reactor = current();

            while let Some(id) = reactor.current_coroutine() {
                if reactor.is_canceled(id) {
                    inner_a_canceled.set(true);
                    break;
                }

                reactor.yield_now();
            }
        });
        let inner_result = result.clone();
        let b = reactor.start_awaitable_coroutine(move || {
            *inner_result.borrow_mut() = Some(current().await_coroutine(a));
        });

        reactor.start_coroutine(move || {
            let reactor = current();

            reactor.cancel(b);
            reactor.await_coroutine(b).unwrap();
        });

        reactor.run();

        assert!(a_canceled.get());
        assert!(matches!(*result.borrow(), Some(Err(Error::Canceled))));
        assert_eq!(reactor.active_coroutines(), 0);
    }

    #[test]
    fn test_await_all() {
        let reactor = reactor();
        let finished = Rc::new(Cell::new(0));
        let observed = Rc::new(Cell::new(0));
        let mut children = Vec::new();

        for rounds in 0..3 {
            let finished = finished.clone();

            children.push(reactor.start_awaitable_coroutine(move || {
                for _ in 0..rounds {
                    current().yield_now();
                }

                finished.set(finished.get() + 1);
            }));
        }

        let inner_finished = finished.clone();
        let inner_observed = observed.clone();

        reactor.start_coroutine(move || {
            current().await_all(&children).unwrap();
            inner_observed.set(inner_finished.get());
        });

        reactor.run();
        assert_eq!(observed.get(), 3);
    }

    #[test]
    fn test_await_all_cancels_awaited_coroutines() {
        let reactor = reactor();
        let canceled = Rc::new(Cell::new(0));
        let result = Rc::new(RefCell::new(None));
        let mut children = Vec::new();

        for _ in 0..2 {
            let canceled = canceled.clone();

            children.push(reactor.start_awaitable_coroutine(move || {
                if current().sleep_until(Deadline::NEVER).is_err() {
                    canceled.set(canceled.get() + 1);
                }
            }));
        }

        let inner_result = result.clone();
        let awaited = children.clone();
        let parent = reactor.start_awaitable_coroutine(move || {
            *inner_result.borrow_mut() = Some(current().await_all(&awaited));
        });

        reactor.start_coroutine(move || {
            let reactor = current();

            reactor.yield_now();
            reactor.cancel(parent);
            reactor.await_coroutine(parent).unwrap();

            // The children were canceled before the parent finished.
            for &child in &children {
                assert!(reactor.is_finished(child));
            }
        });

        reactor.run();

        assert_eq!(canceled.get(), 2);
        assert!(matches!(*result.borrow(), Some(Err(Error::Canceled))));
    }

    #[test]
    fn test_await_all_canceled_releases_finished_coroutines() {
        let reactor = reactor();
        let done = reactor.start_awaitable_coroutine(|| {});
        let sleeper = reactor.start_awaitable_coroutine(|| {
            let _ = current().sleep_until(Deadline::NEVER);
        });
        let result = Rc::new(RefCell::new(None));
        let released = Rc::new(Cell::new(false));
        let inner_result = result.clone();
        let inner_released = released.clone();
        let inner = reactor.inner.clone();

        let parent = reactor.start_coroutine(move || {
            let res = current().await_all(&[done, sleeper]);

            let gone = inner.state.borrow().coroutines.get(done).is_none();

            inner_released.set(gone);
            *inner_result.borrow_mut() = Some(res);
        });

        reactor.start_coroutine(move || {
            let reactor = current();

            reactor.yield_now();
            reactor.cancel(parent);
        });

        reactor.run();

        assert!(matches!(*result.borrow(), Some(Err(Error::Canceled))));
        assert!(released.get());
        assert!(reactor.is_finished(sleeper));
    }

    #[test]
    fn test_await_all_when_canceled() {
        let reactor = reactor();
        let result = Rc::new(RefCell::new(None));
        let child = reactor.start_awaitable_coroutine(|| {
            current().yield_now();
        });
        let inner_result = result.clone();

        reactor.start_coroutine(move || {
            let reactor = current();

            if let Some(id) = reactor.current_coroutine() {
                reactor.cancel(id);
            }

            *inner_result.borrow_mut() = Some(reactor.await_coroutine(child));
        });

        reactor.run();

        assert!(matches!(*result.borrow(), Some(Err(Error::Canceled))));
        assert!(!reactor.is_canceled(child));
        assert!(reactor.is_finished(child));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "is already awaiting it")]
    fn test_await_awaited_coroutine() {
        let reactor = reactor();
        let child = reactor.start_awaitable_coroutine(|| {
            let _ = current().sleep_until(Deadline::NEVER);
        });

        reactor.start_coroutine(move || {
            let _ = current().await_coroutine(child);
        });
        reactor.start_coroutine(move || {
            let _ = current().await_coroutine(child);
        });

        reactor.run();
    }

    #[test]
    fn test_multiple_cancel() {
        let reactor = reactor();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let inner_outcomes = outcomes.clone();
        let sleeper = reactor.start_coroutine(move || {
            let reactor = current();

            inner_outcomes
                .borrow_mut()
                .push(reactor.sleep_until(Deadline::NEVER).is_err());

            // Cancellation sticks.
            inner_outcomes
                .borrow_mut()
                .push(reactor.sleep(Duration::from_millis(1)).is_err());
        });

        reactor.start_coroutine(move || {
            let reactor = current();

            reactor.cancel(sleeper);
            reactor.cancel(sleeper);
            reactor.cancel(sleeper);
        });

        reactor.run();

        assert_eq!(*outcomes.borrow(), vec![true, true]);
    }

    #[test]
    fn test_cancel_finished_coroutine() {
        let reactor = reactor();
        let id = reactor.start_coroutine(|| {});

        reactor.run();
        reactor.cancel(id);
        reactor.wakeup(id);

        assert!(!reactor.is_canceled(id));
        assert_eq!(reactor.active_coroutines(), 0);
    }

    #[test]
    fn test_cancel_all() {
        let reactor = reactor();
        let canceled = Rc::new(Cell::new(0));

        for _ in 0..3 {
            let canceled = canceled.clone();

            reactor.start_coroutine(move || {
                if let Err(Error::Canceled) =
                    current().sleep_until(Deadline::NEVER)
                {
                    canceled.set(canceled.get() + 1);
                }
            });
        }

        reactor.start_coroutine(|| {
            let reactor = current();

            reactor.yield_now();
            reactor.cancel_all();
        });

        reactor.run();
        assert_eq!(canceled.get(), 3);
    }

    #[test]
    fn test_sleep() {
        let reactor = reactor();
        let elapsed = Rc::new(Cell::new(None));
        let inner_elapsed = elapsed.clone();

        reactor.start_coroutine(move || {
            let start = Instant::now();

            current().sleep(Duration::from_millis(10)).unwrap();
            inner_elapsed.set(Some(start.elapsed()));
        });

        reactor.run();
        assert!(elapsed.get().unwrap() >= Duration::from_millis(10));
    }

    #[test]
    fn test_sleep_wakes_up_in_deadline_order() {
        let reactor = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));

        for millis in [30, 10, 20] {
            let log = log.clone();

            reactor.start_coroutine(move || {
                current().sleep(Duration::from_millis(millis)).unwrap();
                log.borrow_mut().push(millis);
            });
        }

        reactor.run();
        assert_eq!(*log.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn test_sleep_ignores_spurious_wakeups() {
        let reactor = reactor();
        let elapsed = Rc::new(Cell::new(None));
        let inner_elapsed = elapsed.clone();
        let sleeper = reactor.start_coroutine(move || {
            let start = Instant::now();

            current().sleep(Duration::from_millis(20)).unwrap();
            inner_elapsed.set(Some(start.elapsed()));
        });

        reactor.start_coroutine(move || current().wakeup(sleeper));
        reactor.run();

        assert!(elapsed.get().unwrap() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_sleeping_coroutine() {
        let reactor = reactor();
        let result = Rc::new(RefCell::new(None));
        let inner_result = result.clone();
        let start = Instant::now();
        let sleeper = reactor.start_coroutine(move || {
            *inner_result.borrow_mut() =
                Some(current().sleep(Duration::from_secs(30)));
        });

        reactor.start_coroutine(move || current().cancel(sleeper));
        reactor.run();

        assert!(matches!(*result.borrow(), Some(Err(Error::Canceled))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_wait_for_deadline() {
        let reactor = reactor();
        let (reader, _writer) = pipe();
        let result = Rc::new(RefCell::new(None));
        let inner_result = result.clone();

        reactor.register_fd(&reader).unwrap();
        reactor.start_coroutine(move || {
            let deadline = Deadline::after(Duration::from_millis(10));

            *inner_result.borrow_mut() =
                Some(current().wait_for(&reader, Events::READ, deadline));
        });

        reactor.run();
        assert!(matches!(*result.borrow(), Some(Err(Error::TimedOut))));
    }

    #[test]
    fn test_wait_for_readable() {
        let reactor = reactor();
        let (reader, writer) = pipe();
        let result = Rc::new(RefCell::new(None));
        let inner_result = result.clone();

        reactor.register_fd(&reader).unwrap();
        reactor.start_coroutine(move || {
            let res =
                current().wait_for(&reader, Events::READ, Deadline::NEVER);

            *inner_result.borrow_mut() = Some(res);
        });
        reactor.start_coroutine(move || {
            current().yield_now();
            rustix::io::write(&writer, b"ping").unwrap();
        });

        reactor.run();
        assert!(matches!(
            *result.borrow(),
            Some(Ok(ev)) if ev == Events::READ
        ));
    }

    #[test]
    fn test_wait_for_already_ready() {
        let reactor = reactor();
        let (_reader, writer) = pipe();
        let result = Rc::new(RefCell::new(None));
        let inner_result = result.clone();

        reactor.register_fd(&writer).unwrap();
        reactor.start_coroutine(move || {
            let reactor = current();

            // The poll between the two rounds records the descriptor as
            // writable, so waiting doesn't suspend.
            reactor.yield_now();
            *inner_result.borrow_mut() =
                Some(reactor.wait_for(&writer, Events::WRITE, Deadline::NEVER));
        });

        reactor.run();
        assert!(matches!(
            *result.borrow(),
            Some(Ok(ev)) if ev == Events::WRITE
        ));
    }

    #[test]
    fn test_wait_for_when_canceled() {
        let reactor = reactor();
        let (_reader, writer) = pipe();
        let result = Rc::new(RefCell::new(None));
        let inner_result = result.clone();

        reactor.register_fd(&writer).unwrap();
        reactor.start_coroutine(move || {
            let reactor = current();

            reactor.yield_now();

            if let Some(id) = reactor.current_coroutine() {
                reactor.cancel(id);
            }

            *inner_result.borrow_mut() =
                Some(reactor.wait_for(&writer, Events::WRITE, Deadline::NEVER));
        });

        reactor.run();
        assert!(matches!(*result.borrow(), Some(Err(Error::Canceled))));
    }

    #[test]
    fn test_wait_for_unregistered_descriptor() {
        let reactor = reactor();
        let (reader, _writer) = pipe();
        let result = Rc::new(RefCell::new(None));
        let inner_result = result.clone();

        reactor.start_coroutine(move || {
            let res =
                current().wait_for(&reader, Events::READ, Deadline::NEVER);

            *inner_result.borrow_mut() = Some(res);
        });

        reactor.run();

        let code = result.borrow().as_ref().and_then(|res| {
            res.as_ref().err().and_then(|err| err.raw_os_error())
        });

        assert_eq!(code, Some(EBADF));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "is already waiting for it")]
    fn test_wait_for_with_two_readers() {
        let reactor = reactor();
        let (reader, _writer) = pipe();
        let reader = Rc::new(reader);

        reactor.register_fd(&*reader).unwrap();

        for _ in 0..2 {
            let reader = reader.clone();

            reactor.start_coroutine(move || {
                let _ =
                    current().wait_for(&*reader, Events::READ, Deadline::NEVER);
            });
        }

        reactor.run();
    }

    #[test]
    fn test_reader_and_writer_on_one_descriptor() {
        let reactor = reactor();
        let (reader, _writer) = pipe();
        let reader = Rc::new(reader);
        let results = Rc::new(RefCell::new(Vec::new()));

        reactor.register_fd(&*reader).unwrap();

        for events in [Events::READ, Events::WRITE] {
            let reader = reader.clone();
            let results = results.clone();

            reactor.start_coroutine(move || {
                let deadline = Deadline::after(Duration::from_millis(5));
                let res = current().wait_for(&*reader, events, deadline);

                results.borrow_mut().push(res.is_err());
            });
        }

        reactor.run();
        assert_eq!(*results.borrow(), vec![true, true]);
    }

    #[test]
    fn test_close_fd_wakes_up_waiters() {
        let reactor = reactor();
        let (reader, _writer) = pipe();
        let reader = Rc::new(reader);
        let result = Rc::new(RefCell::new(None));
        let inner_result = result.clone();
        let waiting_reader = reader.clone();

        reactor.register_fd(&*reader).unwrap();
        reactor.start_coroutine(move || {
            *inner_result.borrow_mut() = Some(current().wait_for(
                &*waiting_reader,
                Events::READ,
                Deadline::NEVER,
            ));
        });
        reactor.start_coroutine(move || current().close_fd(&*reader));

        reactor.run();

        let code = result.borrow().as_ref().and_then(|res| {
            res.as_ref().err().and_then(|err| err.raw_os_error())
        });

        assert_eq!(code, Some(EBADF));
    }

    #[test]
    fn test_register_fd_twice() {
        let reactor = reactor();
        let (reader, _writer) = pipe();

        assert!(reactor.register_fd(&reader).is_ok());
        assert!(reactor.register_fd(&reader).is_err());

        reactor.close_fd(&reader);

        assert!(reactor.register_fd(&reader).is_ok());
    }

    #[test]
    fn test_start_coroutine_with() {
        let reactor = reactor();
        let ran = Rc::new(Cell::new(false));
        let inner_ran = ran.clone();
        let page = crate::page::page_size();
        let invalid =
            StartOptions { stack_size: Some(page + 1), awaitable: false };
        let valid =
            StartOptions { stack_size: Some(page * 8), awaitable: true };

        assert!(reactor.start_coroutine_with(invalid, || {}).is_err());

        let id = reactor
            .start_coroutine_with(valid, move || inner_ran.set(true))
            .unwrap();

        reactor.run();

        assert!(ran.get());
        assert!(reactor.is_finished(id));
    }

    #[test]
    fn test_run_twice() {
        let reactor = reactor();
        let counter = Rc::new(Cell::new(0));

        for _ in 0..2 {
            let counter = counter.clone();

            reactor.start_coroutine(move || {
                current().yield_now();
                counter.set(counter.get() + 1);
            });
            reactor.run();
        }

        assert_eq!(counter.get(), 2);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_panic_propagates_to_run() {
        let reactor = reactor();

        reactor.start_coroutine(|| {
            current().yield_now();
            panic!("boom");
        });
        reactor.start_coroutine(|| {
            let _ = current().sleep_until(Deadline::NEVER);
        });

        reactor.run();
    }

    #[test]
    #[should_panic(expected = "must be used inside a coroutine")]
    fn test_yield_outside_coroutine() {
        reactor().yield_now();
    }

    #[test]
    fn test_single_signal_handler_called() {
        thread::spawn(|| {
            let reactor = reactor();
            let called = Rc::new(Cell::new(false));
            let handler_called = called.clone();

            reactor
                .on_signal(SIGUSR1, move |info| {
                    assert_eq!(info.signal(), SIGUSR1);
                    handler_called.set(true);
                })
                .unwrap();

            reactor.start_coroutine(|| unsafe {
                libc::raise(SIGUSR1);
            });

            let observed = called.clone();

            reactor.start_coroutine(move || {
                while !observed.get() {
                    current().yield_now();
                }
            });

            reactor.run();
            assert!(called.get());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_multiple_signal_handler_called() {
        thread::spawn(|| {
            let reactor = reactor();
            let called = Rc::new(Cell::new(0));
            let handler_called = called.clone();
            let signals: SignalSet = [SIGUSR1, SIGUSR2].into_iter().collect();

            reactor
                .on_signals(&signals, move |_| {
                    handler_called.set(handler_called.get() + 1)
                })
                .unwrap();

            reactor.start_coroutine(|| unsafe {
                libc::raise(SIGUSR1);
                libc::raise(SIGUSR2);
            });

            let observed = called.clone();

            reactor.start_coroutine(move || {
                while observed.get() < 2 {
                    current().yield_now();
                }
            });

            reactor.run();
            assert_eq!(called.get(), 2);
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "signal handlers can't suspend")]
    fn test_signal_handler_suspends() {
        let result = thread::spawn(|| {
            let reactor = reactor();

            reactor
                .on_signal(SIGUSR1, |_| {
                    if let Some(reactor) = Reactor::current() {
                        reactor.yield_now();
                    }
                })
                .unwrap();

            reactor.start_coroutine(|| {
                unsafe { libc::raise(SIGUSR1) };
                current().yield_now();
            });

            reactor.run();
        })
        .join();

        if let Err(payload) = result {
            resume_unwind(payload);
        }
    }

    #[test]
    fn test_signal_handler_cancels_coroutines() {
        thread::spawn(|| {
            let reactor = reactor();
            let canceled = Rc::new(Cell::new(0));

            reactor
                .on_signal(SIGUSR2, |_| {
                    if let Some(reactor) = Reactor::current() {
                        reactor.cancel_all();
                    }
                })
                .unwrap();

            for _ in 0..2 {
                let canceled = canceled.clone();

                reactor.start_coroutine(move || {
                    if current().sleep_until(Deadline::NEVER).is_err() {
                        canceled.set(canceled.get() + 1);
                    }
                });
            }

            reactor.start_coroutine(|| unsafe {
                libc::raise(SIGUSR2);
            });

            reactor.run();
            assert_eq!(canceled.get(), 2);
        })
        .join()
        .unwrap();
    }
}
