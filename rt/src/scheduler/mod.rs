pub mod reactor;
pub mod signal;
pub mod timeouts;
