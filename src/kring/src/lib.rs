#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports,
    dead_code
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! An idiomatic Rust bridge to the io_uring submission and completion rings.
//!
//! io_uring is a Linux-specific API for asynchronous I/O. It allows the user to submit one or
//! more I/O requests, which are processed asynchronously without blocking the calling process.
//! io_uring gets its name from ring buffers which are shared between user space and kernel
//! space. Rather than communicating through one syscall per request, user space writes
//! requests into the submission ring and reads results from the completion ring, entering the
//! kernel only to hand work over or to wait.
//!
//! ```no_run
//! use kring::{Ring, SubmissionEntry};
//!
//! let mut ring = Ring::new(8)?;
//! ring.submit(SubmissionEntry::nop().user_data(42)).expect("queue has room");
//! ring.submit_and_wait(1)?;
//!
//! for cqe in ring.reap() {
//!     assert_eq!(cqe.user_data(), 42);
//! }
//! ring.close()?;
//! # Ok::<(), kring::RingError>(())
//! ```

mod builder;
pub use builder::*;

mod completion_entry;
pub use completion_entry::*;

mod cqueue;
pub use cqueue::*;

mod error;
pub use error::*;

mod kernel;
pub use kernel::*;

mod params;
pub use params::*;

mod region;

mod register;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

mod squeue;
pub use squeue::*;

mod submission_entry;
pub use submission_entry::*;

mod submitter;
pub use submitter::*;

use std::os::fd::{AsRawFd, RawFd};

use kring_sys::{io_uring_params, IORING_OFF_CQ_RING, IORING_OFF_SQES, IORING_OFF_SQ_RING};
use libc::c_void;

use crate::region::{MappedRegion, RingFd};

/// An io_uring instance: the ring descriptor, the three shared mappings, and typed access to
/// the submission and completion queues inside them.
///
/// Dropping the ring unmaps everything and closes the descriptor, logging any failure;
/// [`Ring::close`] does the same but reports it.
#[derive(Debug)]
pub struct Ring<K: Kernel = Linux> {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    // declared after the queues and before the descriptor, so the mappings are released
    // once nothing points into them and before the ring instance goes away
    sq_ring: MappedRegion<K>,
    sqes: MappedRegion<K>,
    cq_ring: MappedRegion<K>,
    fd: RingFd<K>,
    params: RingParameters,
    kernel: K,
}

impl Ring<Linux> {
    /// Initializes a new io_uring instance with `entries` submission slots, including the SQ and
    /// CQ ring buffers.
    pub fn new(entries: u32) -> Result<Self, RingError> {
        Builder::new(entries).build()
    }
}

impl<K: Kernel> Ring<K> {
    /// Creates the ring instance and maps its three regions, in order: the submission ring,
    /// the submission entries, the completion ring. A failure at any step releases whatever
    /// was acquired before it.
    pub(crate) fn setup(kernel: K, entries: u32, mut p: io_uring_params) -> Result<Self, RingError> {
        let fd = kernel.setup(entries, &mut p);
        if fd < 0 {
            return Err(RingError::Setup(-fd));
        }
        let fd = RingFd::new(&kernel, fd);
        let raw_fd = fd.as_raw_fd();

        let params = RingParameters::new(p);
        params.validate()?;

        let sq_ring = unsafe {
            MappedRegion::map(&kernel, raw_fd, params.sq_ring_len(), IORING_OFF_SQ_RING, "sq ring")
        }
        .map_err(RingError::MapSubmitRing)?;

        let sqes = unsafe {
            MappedRegion::map(&kernel, raw_fd, params.sqes_len(), IORING_OFF_SQES, "sqes")
        }
        .map_err(RingError::MapSubmitEntries)?;

        let cq_ring = unsafe {
            MappedRegion::map(&kernel, raw_fd, params.cq_ring_len(), IORING_OFF_CQ_RING, "cq ring")
        }
        .map_err(RingError::MapCompleteRing)?;

        let sq = SubmissionQueue::new(&sq_ring, &sqes, &params)?;
        let cq = CompletionQueue::new(&cq_ring, &params)?;

        tracing::debug!(
            fd = raw_fd,
            sq_entries = params.sq_entries(),
            cq_entries = params.cq_entries(),
            sq_ring_len = sq_ring.len(),
            sqes_len = sqes.len(),
            cq_ring_len = cq_ring.len(),
            features = ?params.features(),
            "io_uring ready"
        );

        Ok(Self {
            sq,
            cq,
            sq_ring,
            sqes,
            cq_ring,
            fd,
            params,
            kernel,
        })
    }

    /// The parameters the kernel reported for this ring.
    pub fn params(&self) -> &RingParameters {
        &self.params
    }

    /// The submission queue, for staging entries in batches.
    pub fn submission(&mut self) -> &mut SubmissionQueue {
        &mut self.sq
    }

    /// The completion queue.
    pub fn completion(&mut self) -> &mut CompletionQueue {
        &mut self.cq
    }

    /// The syscall side of the ring.
    pub fn submitter(&self) -> Submitter<'_, K> {
        Submitter::new(&self.kernel, self.fd.as_raw_fd(), &self.params)
    }

    /// Splits the ring so that one thread can submit while another reaps.
    pub fn split(&mut self) -> (Submitter<'_, K>, &mut SubmissionQueue, &mut CompletionQueue) {
        let submitter = Submitter::new(&self.kernel, self.fd.as_raw_fd(), &self.params);
        (submitter, &mut self.sq, &mut self.cq)
    }

    /// Writes `entry` into the next free slot and publishes it. Returns the slot index.
    ///
    /// If [`SQFullError`] is returned, the submission queue is full and entries must be handed to
    /// the kernel with [`Ring::flush`] before new ones can be placed.
    pub fn submit(&mut self, entry: SubmissionEntry) -> Result<u32, SQFullError> {
        let slot = self.sq.push(entry)?;
        self.sq.sync();

        Ok(slot)
    }

    /// Informs the kernel of new SQEs, but waits for no CQEs before continuing.
    ///
    /// Returns the number of SQEs that were handed over.
    pub fn flush(&mut self) -> Result<u32, RingError> {
        let submitter = Submitter::new(&self.kernel, self.fd.as_raw_fd(), &self.params);
        submitter.flush(&mut self.sq)
    }

    /// Informs the kernel of new SQEs, and waits for the given number of CQEs
    ///
    /// Returns the number of SQEs that were successfully submitted.
    pub fn submit_and_wait(&mut self, want: u32) -> Result<u32, RingError> {
        let submitter = Submitter::new(&self.kernel, self.fd.as_raw_fd(), &self.params);
        submitter.submit_and_wait(&mut self.sq, want)
    }

    /// Enters the ring directly. See [`Submitter::enter`].
    pub fn enter(
        &self,
        to_submit: u32,
        min_complete: u32,
        flags: EnterFlags,
    ) -> Result<u32, RingError> {
        self.submitter().enter(to_submit, min_complete, flags)
    }

    /// Registers a raw resource table. See [`Submitter::register`].
    ///
    /// # Safety
    /// `arg` must point to what `opcode` expects, valid for `nr_args` elements, for as long
    /// as the kernel requires it.
    pub unsafe fn register(
        &self,
        opcode: u32,
        arg: *const c_void,
        nr_args: u32,
    ) -> Result<u32, RingError> {
        self.submitter().register(opcode, arg, nr_args)
    }

    /// Drains the completions published so far. See [`CompletionQueue::reap`].
    pub fn reap(&mut self) -> Completions<'_> {
        self.cq.reap()
    }

    /// Unmaps the ring regions and closes the descriptor.
    ///
    /// Every resource is released even if an earlier step fails; the first failure is
    /// reported.
    pub fn close(self) -> Result<(), RingError> {
        let Ring {
            sq,
            cq,
            sq_ring,
            sqes,
            cq_ring,
            fd,
            ..
        } = self;
        drop((sq, cq));

        let raw_fd = fd.as_raw_fd();
        let released = [
            sq_ring.release(),
            sqes.release(),
            cq_ring.release(),
            fd.release(),
        ];
        tracing::debug!(fd = raw_fd, "io_uring closed");

        match released.into_iter().find_map(Result::err) {
            Some(errno) => Err(RingError::Release(errno)),
            None => Ok(()),
        }
    }
}

impl<K: Kernel> AsRawFd for Ring<K> {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimKernel;

    fn assert_send<T: Send>() {}

    #[test]
    fn ring_and_queues_are_send() {
        assert_send::<Ring<Linux>>();
        assert_send::<Ring<SimKernel>>();
        assert_send::<SubmissionQueue>();
        assert_send::<CompletionQueue>();
    }

    #[test]
    fn submit_flush_reap_round_trip() {
        let mut ring = Builder::new(8).build_with(SimKernel::new()).unwrap();

        ring.submit(SubmissionEntry::nop().user_data(7)).unwrap();
        assert_eq!(ring.flush().unwrap(), 1);

        let cqes: Vec<_> = ring.reap().collect();
        assert_eq!(cqes.len(), 1);
        assert_eq!(cqes[0].user_data(), 7);
        assert_eq!(cqes[0].result(), 0);
    }

    #[test]
    fn flush_without_pending_skips_enter() {
        let kernel = SimKernel::new();
        let mut ring = Builder::new(8).build_with(kernel.clone()).unwrap();

        assert_eq!(ring.flush().unwrap(), 0);
        assert_eq!(kernel.stats().enters, 0);
    }

    #[test]
    fn enter_failure_keeps_os_code() {
        let kernel = SimKernel::new();
        let mut ring = Builder::new(8).build_with(kernel.clone()).unwrap();
        ring.submit(SubmissionEntry::nop()).unwrap();

        kernel.fail_next_enter(libc::EINTR);
        let err = ring.flush().unwrap_err();
        assert_eq!(err, RingError::Enter(libc::EINTR));
        assert!(err.is_interrupted());

        // nothing was consumed, so a retry hands the entry over
        assert_eq!(ring.flush().unwrap(), 1);
        assert_eq!(ring.reap().count(), 1);
    }

    #[test]
    fn sqpoll_enters_only_to_wake_the_thread() {
        let kernel = SimKernel::new();
        let mut ring = Builder::new(8)
            .sqpoll(std::time::Duration::from_millis(10))
            .build_with(kernel.clone())
            .unwrap();

        kernel.set_need_wakeup(false);
        ring.submit(SubmissionEntry::nop()).unwrap();
        assert_eq!(ring.flush().unwrap(), 1);
        assert_eq!(kernel.stats().enters, 0);

        kernel.set_need_wakeup(true);
        assert_eq!(ring.flush().unwrap(), 1);
        assert_eq!(kernel.stats().enters, 1);
        assert_eq!(kernel.last_enter_flags(), Some(EnterFlags::SqWakeup.bits()));
    }

    #[test]
    fn sqpoll_wakeup_reports_what_the_kernel_consumed() {
        let kernel = SimKernel::new();
        let mut ring = Builder::new(2)
            .sqpoll(std::time::Duration::from_millis(10))
            .build_with(kernel.clone())
            .unwrap();
        assert_eq!(ring.completion().capacity(), 4);

        // fill the completion ring without reaping
        for _ in 0..2 {
            ring.submit(SubmissionEntry::nop()).unwrap();
            ring.submit(SubmissionEntry::nop()).unwrap();
            assert_eq!(ring.flush().unwrap(), 2);
        }

        ring.submit(SubmissionEntry::nop()).unwrap();
        assert_eq!(ring.flush().unwrap(), 0);
        assert_eq!(ring.submission().pending(), 1);
        assert_eq!(kernel.stats().enters, 3);

        assert_eq!(ring.reap().count(), 4);
        assert_eq!(ring.flush().unwrap(), 1);
    }

    #[test]
    fn setup_failure_reports_errno() {
        let kernel = SimKernel::new();
        kernel.fail_next_setup(libc::ENOMEM);

        let err = Builder::new(8).build_with(kernel.clone()).unwrap_err();
        assert_eq!(err, RingError::Setup(libc::ENOMEM));
        assert_eq!(kernel.stats().live_rings, 0);
    }

    #[test]
    fn invalid_depth_is_rejected_by_kernel() {
        let err = Builder::new(0).build_with(SimKernel::new()).unwrap_err();
        assert_eq!(err, RingError::Setup(libc::EINVAL));
    }

    #[test]
    fn close_releases_everything() {
        let kernel = SimKernel::new();
        let ring = Builder::new(8).build_with(kernel.clone()).unwrap();
        assert_eq!(kernel.stats().live_mappings, 3);

        ring.close().unwrap();

        let stats = kernel.stats();
        assert_eq!(stats.maps, 3);
        assert_eq!(stats.unmaps, 3);
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.live_mappings, 0);
        assert_eq!(stats.live_rings, 0);
    }

    #[test]
    fn drop_releases_everything() {
        let kernel = SimKernel::new();
        drop(Builder::new(8).build_with(kernel.clone()).unwrap());

        let stats = kernel.stats();
        assert_eq!(stats.unmaps, 3);
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.live_mappings, 0);
    }
}
