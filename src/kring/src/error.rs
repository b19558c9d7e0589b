use std::io;

use libc::c_int;
use thiserror::Error;

/// Failures reported by a [`Ring`](crate::Ring).
///
/// Every variant that crosses the kernel boundary carries the positive OS error code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    /// The call to `io_uring_setup` failed.
    #[error("failed to set up io_uring (os error {0})")]
    Setup(c_int),
    /// Mapping the submission ring control region failed.
    #[error("failed to mmap submission ring (os error {0})")]
    MapSubmitRing(c_int),
    /// Mapping the submission entry array failed.
    #[error("failed to mmap submission entries (os error {0})")]
    MapSubmitEntries(c_int),
    /// Mapping the completion ring failed.
    #[error("failed to mmap completion ring (os error {0})")]
    MapCompleteRing(c_int),
    /// A kernel-reported offset falls outside, or is misaligned within, its mapping.
    #[error("{region} offset {offset:#x} does not fit the {len} byte mapping")]
    Layout {
        /// Which mapping the offset was applied to.
        region: &'static str,
        /// The offending byte offset.
        offset: usize,
        /// Length of the mapping.
        len: usize,
    },
    /// The kernel-reported parameters break a ring invariant.
    #[error("invalid ring parameters: {0}")]
    Params(&'static str),
    /// The call to `io_uring_enter` failed.
    #[error("failed to enter io_uring (os error {0})")]
    Enter(c_int),
    /// The call to `io_uring_register` failed.
    #[error("failed to register with io_uring (os error {0})")]
    Register(c_int),
    /// Unmapping a region or closing the ring descriptor failed during teardown.
    #[error("failed to release io_uring resources (os error {0})")]
    Release(c_int),
}

impl RingError {
    /// The OS error code behind this failure, if it came from the kernel.
    pub fn raw_os_error(&self) -> Option<c_int> {
        use RingError::*;
        match *self {
            Setup(errno) | MapSubmitRing(errno) | MapSubmitEntries(errno)
            | MapCompleteRing(errno) | Enter(errno) | Register(errno) | Release(errno) => {
                Some(errno)
            }
            Layout { .. } | Params(_) => None,
        }
    }

    /// Whether the call was interrupted by a signal and may simply be retried.
    pub fn is_interrupted(&self) -> bool {
        self.raw_os_error() == Some(libc::EINTR)
    }
}

impl From<RingError> for io::Error {
    fn from(e: RingError) -> Self {
        match e.raw_os_error() {
            Some(errno) => io::Error::from_raw_os_error(errno),
            None => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

/// Indicates the SubmissionQueue is full. Either the kernel needs to be notified of new SQEs, or
/// should be given time to process requests.
///
/// See [io_uring_enter(2)](https://man.archlinux.org/man/io_uring_enter.2)
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("SubmissionQueue is full. Notify the kernel of new entries via `io_uring_enter` or give it time to process requests.")]
pub struct SQFullError;

/// Converts a result in the bridge's signed convention into a `Result` carrying the
/// positive OS error code.
#[inline]
pub(crate) fn cvt(res: c_int) -> Result<u32, c_int> {
    if res < 0 {
        Err(-res)
    } else {
        Ok(res as u32)
    }
}
