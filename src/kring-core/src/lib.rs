#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports,
    dead_code
)]

//! Thin wrappers over the socket and file syscalls that io_uring programs reach for
//! outside the ring: creating and configuring sockets, and positioning files.
//!
//! Every call returns [`std::io::Result`], and failures carry the raw OS error code.

pub mod sys;
