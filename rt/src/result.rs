//! The outcome of operations that may suspend a coroutine.
use libc::{ECANCELED, ETIMEDOUT};
use rustix::io::Errno;
use std::error::Error as StdError;
use std::fmt;
use std::io;

/// The ways a suspending operation can fail.
///
/// The variants are mutually exclusive: a canceled coroutine always observes
/// `Canceled`, even if its deadline also passed or the operation could
/// otherwise have completed.
#[derive(Debug)]
pub enum Error {
    /// A system call failed with an error other than "try again".
    Os(io::Error),

    /// The coroutine was canceled before or while it was suspended.
    Canceled,

    /// The deadline of the operation passed before it could complete.
    TimedOut,
}

impl Error {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut)
    }

    /// Returns the OS error code, if this is an OS error that carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Os(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// Returns an error code in the style of `errno`.
    ///
    /// OS errors without an error code produce -1.
    pub fn code(&self) -> i32 {
        match self {
            Error::Os(err) => err.raw_os_error().unwrap_or(-1),
            Error::Canceled => ECANCELED,
            Error::TimedOut => ETIMEDOUT,
        }
    }

    pub(crate) fn from_raw_os_error(code: i32) -> Error {
        Error::Os(io::Error::from_raw_os_error(code))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Os(err) => err.fmt(f),
            Error::Canceled => f.write_str("the coroutine was canceled"),
            Error::TimedOut => f.write_str("the deadline passed"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Os(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Os(error)
    }
}

impl From<Errno> for Error {
    fn from(error: Errno) -> Self {
        Error::from_raw_os_error(error.raw_os_error())
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Os(err) => err,
            Error::Canceled => io::Error::from_raw_os_error(ECANCELED),
            Error::TimedOut => io::Error::from_raw_os_error(ETIMEDOUT),
        }
    }
}

/// The result of an operation that may suspend a coroutine.
pub type Result<T> = std::result::Result<T, Error>;
