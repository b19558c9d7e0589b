use std::io;

use bitflags::bitflags;
use kring_sys::{
    io_uring_cqe, IORING_CQE_F_BUFFER, IORING_CQE_F_MORE, IORING_CQE_F_NOTIF,
    IORING_CQE_F_SOCK_NONEMPTY,
};

bitflags! {
    /// Carries request-specific information
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CqeFlags: u32 {
        /// If set, the upper 16 bits of the flags field carries the buffer Id that was chosen for
        /// this request.
        const Buffer = IORING_CQE_F_BUFFER;
        /// If set, the application should expect more completions from the request.
        const More = IORING_CQE_F_MORE;
        /// If set, upon receiving the data from the socket in the current request, the socket
        /// still had data left on completion of this request.
        const SockNonEmpty = IORING_CQE_F_SOCK_NONEMPTY;
        /// Set for notification CQEs, as seen with the zero-copy networking send and receive
        /// support.
        const Notification = IORING_CQE_F_NOTIF;
    }
}

/// The result of one operation, copied out of the completion queue.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionEntry {
    inner: io_uring_cqe,
}

impl CompletionEntry {
    pub(crate) fn from_raw(cqe: io_uring_cqe) -> Self {
        Self { inner: cqe }
    }

    /// Retrieve the user_data set on the corresponding SQE request.
    pub fn user_data(&self) -> u64 {
        self.inner.user_data
    }

    /// Get flags set on the CQE, which carry request-specific information.
    pub fn flags(&self) -> CqeFlags {
        CqeFlags::from_bits_retain(self.inner.flags)
    }

    /// The buffer id the kernel selected, when [`CqeFlags::Buffer`] is set.
    pub fn buffer_id(&self) -> Option<u16> {
        self.flags()
            .contains(CqeFlags::Buffer)
            .then(|| (self.inner.flags >> 16) as u16)
    }

    /// Get the result of the operation. This is equivalent to the return value of the syscall
    /// represented by the SQE request: non-negative on success, the negated errno otherwise.
    pub fn result(&self) -> i32 {
        self.inner.res
    }

    /// The result as an [`io::Result`].
    pub fn io_result(&self) -> io::Result<u32> {
        match self.inner.res {
            res if res < 0 => Err(io::Error::from_raw_os_error(-res)),
            res => Ok(res as u32),
        }
    }
}
