use std::os::fd::{AsRawFd, RawFd};

use bitflags::bitflags;
use kring_sys::{IORING_ENTER_GETEVENTS, IORING_ENTER_SQ_WAIT, IORING_ENTER_SQ_WAKEUP};
use libc::c_void;

use crate::{error::cvt, Kernel, RingError, RingParameters, SetupFlags, SubmissionQueue};

bitflags! {
    /// Modifiers for [`Submitter::enter`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnterFlags: u32 {
        /// Wait for `min_complete` completions before returning.
        const GetEvents = IORING_ENTER_GETEVENTS;
        /// Wake the kernel's submission polling thread.
        const SqWakeup = IORING_ENTER_SQ_WAKEUP;
        /// Wait until the submission queue has free space.
        const SqWait = IORING_ENTER_SQ_WAIT;
    }
}

/// The syscall side of a ring: entering and registering.
///
/// Obtained from [`Ring::submitter`](crate::Ring::submitter) or
/// [`Ring::split`](crate::Ring::split). It borrows the ring, so it cannot outlive it.
#[derive(Debug)]
pub struct Submitter<'a, K: Kernel> {
    kernel: &'a K,
    fd: RawFd,
    params: &'a RingParameters,
}

impl<'a, K: Kernel> Submitter<'a, K> {
    pub(crate) fn new(kernel: &'a K, fd: RawFd, params: &'a RingParameters) -> Self {
        Self { kernel, fd, params }
    }

    /// Asks the kernel to consume up to `to_submit` published submissions and, with
    /// [`EnterFlags::GetEvents`], to block until `min_complete` completions are available.
    ///
    /// Returns the number of submissions consumed. A signal interrupting the wait surfaces
    /// as an error for which [`RingError::is_interrupted`] holds.
    ///
    /// See [io_uring_enter(2)](https://man.archlinux.org/man/io_uring_enter.2)
    #[tracing::instrument(level = "trace", skip(self), fields(fd = self.fd))]
    pub fn enter(
        &self,
        to_submit: u32,
        min_complete: u32,
        flags: EnterFlags,
    ) -> Result<u32, RingError> {
        let res = self.kernel.enter(self.fd, to_submit, min_complete, flags.bits());
        cvt(res).map_err(RingError::Enter)
    }

    /// Publishes everything staged in `sq` and lets the kernel consume it.
    ///
    /// Returns the number of entries handed over. With submission polling the kernel thread
    /// picks entries up by itself, so the syscall is only made when that thread is asleep.
    pub fn flush(&self, sq: &mut SubmissionQueue) -> Result<u32, RingError> {
        sq.sync();
        let pending = sq.pending();
        if pending == 0 {
            return Ok(0);
        }

        if self.params.flags().contains(SetupFlags::SqPoll) {
            if !sq.need_wakeup() {
                tracing::trace!(pending, "submission thread awake, skipping enter");
                return Ok(pending);
            }

            let submitted = self.enter(pending, 0, EnterFlags::SqWakeup)?;
            tracing::trace!(pending, submitted, "woke submission thread");
            return Ok(submitted);
        }

        let submitted = self.enter(pending, 0, EnterFlags::empty())?;
        tracing::trace!(pending, submitted, "flushed submission queue");

        Ok(submitted)
    }

    /// Like [`flush`](Submitter::flush), then waits for `want` completions.
    pub fn submit_and_wait(&self, sq: &mut SubmissionQueue, want: u32) -> Result<u32, RingError> {
        sq.sync();
        let mut flags = EnterFlags::GetEvents;
        if self.params.flags().contains(SetupFlags::SqPoll) && sq.need_wakeup() {
            flags |= EnterFlags::SqWakeup;
        }

        self.enter(sq.pending(), want, flags)
    }

    /// Passes a raw resource table to the kernel.
    ///
    /// See [io_uring_register(2)](https://man.archlinux.org/man/io_uring_register.2)
    ///
    /// # Safety
    /// `arg` must point to what `opcode` expects, valid for `nr_args` elements, for as long
    /// as the kernel requires it.
    #[tracing::instrument(level = "trace", skip(self, arg), fields(fd = self.fd))]
    pub unsafe fn register(
        &self,
        opcode: u32,
        arg: *const c_void,
        nr_args: u32,
    ) -> Result<u32, RingError> {
        let res = self.kernel.register(self.fd, opcode, arg, nr_args);
        cvt(res).map_err(RingError::Register)
    }
}

impl<K: Kernel> Clone for Submitter<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Kernel> Copy for Submitter<'_, K> {}

impl<K: Kernel> AsRawFd for Submitter<'_, K> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}
