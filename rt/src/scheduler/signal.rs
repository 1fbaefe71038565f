//! Delivering process signals through the reactor's poll loop.
//!
//! Signals handled by a reactor are blocked for the reactor's thread and read
//! from a signalfd registered with the network poller, so handlers run as part
//! of a regular poll instead of interrupting whatever code happens to be
//! running.
use libc::{
    pthread_sigmask, sigaddset, sigdelset, sigemptyset, sigismember,
    signalfd, signalfd_siginfo, sigset_t, SFD_CLOEXEC, SFD_NONBLOCK,
    SIG_BLOCK, SIG_SETMASK,
};
use std::collections::HashMap;
use std::ffi::c_int;
use std::fmt;
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

/// The highest signal number we consider, covering the real-time signals.
const MAX_SIGNAL: c_int = 64;

/// A set of signal numbers.
#[derive(Copy, Clone)]
pub struct SignalSet {
    raw: sigset_t,
}

impl SignalSet {
    /// Returns an empty set.
    pub fn new() -> SignalSet {
        let raw = unsafe {
            let mut raw = MaybeUninit::uninit();

            sigemptyset(raw.as_mut_ptr());
            raw.assume_init()
        };

        SignalSet { raw }
    }

    pub fn add(&mut self, signal: c_int) -> &mut Self {
        unsafe {
            sigaddset(&mut self.raw as *mut _, signal);
        }

        self
    }

    pub fn remove(&mut self, signal: c_int) -> &mut Self {
        unsafe {
            sigdelset(&mut self.raw as *mut _, signal);
        }

        self
    }

    pub fn contains(&self, signal: c_int) -> bool {
        unsafe { sigismember(&self.raw as *const _, signal) == 1 }
    }

    /// Adds every signal in `other` to this set.
    pub fn extend(&mut self, other: &SignalSet) {
        for signal in other.signals() {
            self.add(signal);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signals().next().is_none()
    }

    /// Returns the signal numbers in this set, in ascending order.
    pub fn signals(&self) -> impl Iterator<Item = c_int> + '_ {
        (1..=MAX_SIGNAL).filter(move |&signal| self.contains(signal))
    }

    /// Blocks the signals in this set for the calling thread, in addition to
    /// the signals that are already blocked.
    ///
    /// The thread's previous mask is returned, such that it can be restored
    /// using `restore`.
    pub(crate) fn block(&self) -> io::Result<SignalSet> {
        self.thread_mask(SIG_BLOCK)
    }

    /// Makes this set the exact set of signals blocked for the calling
    /// thread.
    pub(crate) fn restore(&self) -> io::Result<()> {
        self.thread_mask(SIG_SETMASK).map(|_| ())
    }

    fn thread_mask(&self, how: c_int) -> io::Result<SignalSet> {
        let mut old = SignalSet::new();
        let res = unsafe {
            pthread_sigmask(how, &self.raw as *const _, &mut old.raw as *mut _)
        };

        if res == 0 {
            Ok(old)
        } else {
            Err(io::Error::from_raw_os_error(res))
        }
    }
}

impl Default for SignalSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<c_int> for SignalSet {
    fn from_iter<I: IntoIterator<Item = c_int>>(iter: I) -> Self {
        let mut set = SignalSet::new();

        for signal in iter {
            set.add(signal);
        }

        set
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.signals()).finish()
    }
}

/// Details about a delivered signal.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SignalInfo {
    signal: c_int,
    sender: u32,
}

impl SignalInfo {
    /// Returns the signal number.
    pub fn signal(&self) -> c_int {
        self.signal
    }

    /// Returns the ID of the process that sent the signal.
    pub fn sender(&self) -> u32 {
        self.sender
    }
}

/// A file descriptor that becomes readable when a signal in its mask is
/// pending.
pub(crate) struct SignalFd {
    fd: OwnedFd,
}

impl SignalFd {
    pub(crate) fn new(mask: &SignalSet) -> io::Result<SignalFd> {
        let fd = unsafe {
            signalfd(-1, &mask.raw as *const _, SFD_NONBLOCK | SFD_CLOEXEC)
        };

        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(SignalFd { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Replaces the mask of signals this descriptor reports.
    pub(crate) fn update(&self, mask: &SignalSet) -> io::Result<()> {
        let res = unsafe {
            signalfd(
                self.fd.as_raw_fd(),
                &mask.raw as *const _,
                SFD_NONBLOCK | SFD_CLOEXEC,
            )
        };

        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Reads the next pending signal, returning `None` if none are pending.
    pub(crate) fn read(&self) -> io::Result<Option<SignalInfo>> {
        let mut info = MaybeUninit::<signalfd_siginfo>::uninit();
        let size = size_of::<signalfd_siginfo>();

        loop {
            let res = unsafe {
                libc::read(self.fd.as_raw_fd(), info.as_mut_ptr() as _, size)
            };

            if res == size as isize {
                let info = unsafe { info.assume_init() };

                return Ok(Some(SignalInfo {
                    signal: info.ssi_signo as c_int,
                    sender: info.ssi_pid,
                }));
            }

            if res >= 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read a partial signalfd_siginfo",
                ));
            }

            let err = io::Error::last_os_error();

            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A callback invoked for a delivered signal.
pub(crate) type SignalHandler = Rc<dyn Fn(SignalInfo)>;

/// The signals a reactor handles, and the handlers to run for them.
pub(crate) struct Signals {
    mask: SignalSet,
    fd: Option<SignalFd>,
    handlers: HashMap<c_int, SignalHandler>,
}

impl Signals {
    pub(crate) fn new() -> Signals {
        Signals { mask: SignalSet::new(), fd: None, handlers: HashMap::new() }
    }

    /// Registers `handler` for every signal in `signals`, replacing any
    /// existing handlers for those signals.
    ///
    /// The signals are blocked for the calling thread. If this is the first
    /// registration, the signal descriptor is created and passed to `watch`,
    /// which adds it to the poller. If any step fails, the thread's signal
    /// mask is restored and nothing is registered.
    pub(crate) fn register(
        &mut self,
        signals: &SignalSet,
        handler: SignalHandler,
        watch: impl FnOnce(RawFd) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut mask = self.mask;

        mask.extend(signals);

        // Signals must be blocked before they're read from the descriptor,
        // otherwise their default action still runs.
        let previous = mask.block()?;
        let res = match &self.fd {
            Some(fd) => fd.update(&mask).map(|_| None),
            None => SignalFd::new(&mask)
                .and_then(|fd| watch(fd.raw_fd()).map(|_| Some(fd))),
        };

        match res {
            Ok(Some(fd)) => self.fd = Some(fd),
            Ok(None) => {}
            Err(err) => {
                previous.restore()?;
                return Err(err);
            }
        }

        self.mask = mask;

        for signal in signals.signals() {
            self.handlers.insert(signal, handler.clone());
        }

        Ok(())
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.raw_fd())
    }

    /// Reads the next pending signal along with its handler.
    pub(crate) fn next(
        &self,
    ) -> io::Result<Option<(SignalInfo, Option<SignalHandler>)>> {
        let Some(fd) = &self.fd else { return Ok(None) };

        Ok(fd.read()?.map(|info| {
            (info, self.handlers.get(&info.signal).cloned())
        }))
    }
}
