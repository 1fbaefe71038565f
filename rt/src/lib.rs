//! A single-threaded runtime for stackful coroutines with readiness-based
//! I/O, deadlines and cooperative cancellation.
#![allow(clippy::new_without_default)]

mod macros;

mod config;
mod context;
mod coroutine;
mod io;
mod memory_map;
mod network_poller;
mod page;
mod poll;
mod result;
mod scheduler;
mod socket;
mod stack;


pub use crate::config::Config;
pub use crate::coroutine::CoroutineId;
pub use crate::network_poller::Events;
pub use crate::result::{Error, Result};
pub use crate::scheduler::reactor::{Reactor, StartOptions};
pub use crate::scheduler::signal::{SignalInfo, SignalSet};
pub use crate::scheduler::timeouts::Deadline;
