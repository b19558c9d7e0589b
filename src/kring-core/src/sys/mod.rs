//! Platform syscall wrappers.

#[cfg(unix)]
pub mod unix;
