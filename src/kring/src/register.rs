use std::{os::fd::RawFd, ptr};

use kring_sys::{
    IORING_REGISTER_BUFFERS, IORING_REGISTER_EVENTFD, IORING_REGISTER_FILES,
    IORING_UNREGISTER_BUFFERS, IORING_UNREGISTER_EVENTFD, IORING_UNREGISTER_FILES,
};
use libc::iovec;

use crate::{Kernel, RingError, Submitter};

impl<K: Kernel> Submitter<'_, K> {
    /// Registers fixed buffers for `*_FIXED` operations, selected with
    /// [`SubmissionEntry::buf_index`](crate::SubmissionEntry::buf_index).
    ///
    /// # Safety
    /// The memory described by `bufs` must stay valid until
    /// [`unregister_buffers`](Submitter::unregister_buffers) or the ring is closed.
    pub unsafe fn register_buffers(&self, bufs: &[iovec]) -> Result<(), RingError> {
        self.register(IORING_REGISTER_BUFFERS, bufs.as_ptr().cast(), bufs.len() as u32)
            .map(drop)
    }

    /// Drops all registered buffers.
    pub fn unregister_buffers(&self) -> Result<(), RingError> {
        unsafe { self.register(IORING_UNREGISTER_BUFFERS, ptr::null(), 0) }.map(drop)
    }

    /// Registers a fixed file table. Entries are addressed by index with
    /// [`SqeFlags::FixedFile`](crate::SqeFlags::FixedFile); `-1` leaves a sparse slot.
    pub fn register_files(&self, fds: &[RawFd]) -> Result<(), RingError> {
        // the kernel copies the table during the call
        unsafe { self.register(IORING_REGISTER_FILES, fds.as_ptr().cast(), fds.len() as u32) }
            .map(drop)
    }

    /// Drops the registered file table.
    pub fn unregister_files(&self) -> Result<(), RingError> {
        unsafe { self.register(IORING_UNREGISTER_FILES, ptr::null(), 0) }.map(drop)
    }

    /// Asks the kernel to signal `eventfd` whenever a completion is posted.
    pub fn register_eventfd(&self, eventfd: RawFd) -> Result<(), RingError> {
        unsafe { self.register(IORING_REGISTER_EVENTFD, ptr::addr_of!(eventfd).cast(), 1) }
            .map(drop)
    }

    /// Stops signalling the registered eventfd.
    pub fn unregister_eventfd(&self) -> Result<(), RingError> {
        unsafe { self.register(IORING_UNREGISTER_EVENTFD, ptr::null(), 0) }.map(drop)
    }
}

#[cfg(test)]
mod test {
    use crate::{sim::SimKernel, Builder, RingError};

    #[test]
    fn register_failure_keeps_os_code() {
        let kernel = SimKernel::new();
        let ring = Builder::new(4).build_with(kernel.clone()).unwrap();

        kernel.fail_next_register(libc::EINVAL);
        assert_eq!(
            ring.submitter().register_files(&[0, 1]),
            Err(RingError::Register(22))
        );
        assert_eq!(kernel.stats().registers, 1);
    }

    #[test]
    fn file_table_round_trip() {
        let ring = Builder::new(4).build_with(SimKernel::new()).unwrap();
        let submitter = ring.submitter();

        submitter.register_files(&[0, -1, 2]).unwrap();
        assert_eq!(submitter.register_files(&[0]), Err(RingError::Register(libc::EBUSY)));
        submitter.unregister_files().unwrap();
        assert_eq!(submitter.unregister_files(), Err(RingError::Register(libc::ENXIO)));
    }

    #[test]
    fn buffers_and_eventfd() {
        let ring = Builder::new(4).build_with(SimKernel::new()).unwrap();
        let submitter = ring.submitter();
        let mut backing = [0u8; 64];
        let bufs = [libc::iovec {
            iov_base: backing.as_mut_ptr().cast(),
            iov_len: backing.len(),
        }];

        unsafe { submitter.register_buffers(&bufs) }.unwrap();
        submitter.unregister_buffers().unwrap();

        submitter.register_eventfd(5).unwrap();
        submitter.unregister_eventfd().unwrap();
        assert_eq!(submitter.unregister_eventfd(), Err(RingError::Register(libc::ENXIO)));
    }
}
