use crate::page::{is_multiple_of_page_size, multiple_of_page_size};
use std::env::var;
use std::io;

/// Sets a configuration field based on an environment variable.
macro_rules! set_from_env {
    ($config:expr, $field:ident, $key:expr, $value_type:ty) => {{
        if let Ok(raw_value) = var(concat!("PORTCULLIS_", $key)) {
            if let Ok(value) = raw_value.parse::<$value_type>() {
                if value > 0 {
                    $config.$field = value;
                }
            }
        };
    }};
}

/// The default size of each coroutine's stack in bytes.
///
/// This size is _excluding_ the guard pages. It's a multiple of every page
/// size in common use (4, 16 and 64 KiB).
const DEFAULT_STACK_SIZE: usize = 512 * 1024;

/// The default number of events to read from the poller in a single call.
const DEFAULT_POLL_EVENTS: usize = 256;

/// The maximum number of events to read from the poller in a single call.
const MAX_POLL_EVENTS: usize = 4096;

/// Structure containing the configuration settings for a reactor.
#[derive(Clone, Debug)]
pub struct Config {
    /// The size of each coroutine's stack in bytes.
    ///
    /// This must be a multiple of the page size.
    pub stack_size: usize,

    /// The number of events to read from the poller in a single call.
    pub poll_events: usize,
}

impl Config {
    pub fn new() -> Config {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
            poll_events: DEFAULT_POLL_EVENTS,
        }
    }

    pub fn from_env() -> Config {
        let mut config = Config::new();

        set_from_env!(config, stack_size, "STACK_SIZE", usize);
        set_from_env!(config, poll_events, "POLL_EVENTS", usize);

        config.verify();
        config
    }

    /// Checks that `size` is usable as the size of a coroutine's stack.
    pub fn validate_stack_size(size: usize) -> io::Result<()> {
        if size > 0 && is_multiple_of_page_size(size) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "the stack size {} isn't a positive multiple of the page \
                    size",
                    size
                ),
            ))
        }
    }

    /// Returns the number of poller events to read at once, limited to a
    /// sensible range.
    pub(crate) fn poll_batch_size(&self) -> usize {
        self.poll_events.clamp(1, MAX_POLL_EVENTS)
    }

    fn verify(&mut self) {
        self.stack_size = multiple_of_page_size(self.stack_size);
        self.poll_events = self.poll_batch_size();
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
