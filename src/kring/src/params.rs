use std::mem::size_of;

use bitflags::bitflags;
use kring_sys::{
    io_cqring_offsets, io_sqring_offsets, io_uring_cqe, io_uring_params, io_uring_sqe,
    IORING_FEAT_CUR_PERSONALITY, IORING_FEAT_FAST_POLL, IORING_FEAT_NODROP,
    IORING_FEAT_RW_CUR_POS, IORING_FEAT_SINGLE_MMAP, IORING_FEAT_SUBMIT_STABLE,
    IORING_SETUP_CLAMP, IORING_SETUP_CQSIZE, IORING_SETUP_IOPOLL, IORING_SETUP_SQPOLL,
    IORING_SETUP_SQ_AFF,
};

use crate::RingError;

bitflags! {
    /// Flags requested at ring creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SetupFlags: u32 {
        /// Busy-wait for I/O completion instead of using interrupts.
        const IoPoll = IORING_SETUP_IOPOLL;
        /// A kernel thread polls the submission queue, so most submissions need no syscall.
        const SqPoll = IORING_SETUP_SQPOLL;
        /// Pin the polling thread to a CPU.
        const SqAffinity = IORING_SETUP_SQ_AFF;
        /// The completion queue size is given explicitly.
        const CqSize = IORING_SETUP_CQSIZE;
        /// Clamp entry counts to the kernel maximum instead of failing.
        const Clamp = IORING_SETUP_CLAMP;
    }
}

bitflags! {
    /// Capabilities the kernel reports back from ring creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// Both rings may live in one mapping.
        const SingleMmap = IORING_FEAT_SINGLE_MMAP;
        /// Completions are never dropped on overflow.
        const NoDrop = IORING_FEAT_NODROP;
        /// Submitted data is stable once enter returns.
        const SubmitStable = IORING_FEAT_SUBMIT_STABLE;
        /// An offset of -1 means the current file position.
        const RwCurPos = IORING_FEAT_RW_CUR_POS;
        /// Requests use the submitter's credentials.
        const CurPersonality = IORING_FEAT_CUR_PERSONALITY;
        /// Internal polling replaces worker threads where possible.
        const FastPoll = IORING_FEAT_FAST_POLL;
    }
}

/// The parameter block the kernel returned for a ring: entry counts, features and the
/// byte offsets of every ring field inside the mapped regions.
///
/// Offsets differ between kernel versions and are only ever read from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingParameters {
    inner: io_uring_params,
}

impl RingParameters {
    pub(crate) fn new(inner: io_uring_params) -> Self {
        Self { inner }
    }

    /// Number of submission queue entries.
    pub fn sq_entries(&self) -> u32 {
        self.inner.sq_entries
    }

    /// Number of completion queue entries.
    pub fn cq_entries(&self) -> u32 {
        self.inner.cq_entries
    }

    /// Flags the ring was created with.
    pub fn flags(&self) -> SetupFlags {
        SetupFlags::from_bits_retain(self.inner.flags)
    }

    /// Features the kernel supports for this ring.
    pub fn features(&self) -> Features {
        Features::from_bits_retain(self.inner.features)
    }

    /// Field offsets within the submission ring mapping.
    pub fn sq_offsets(&self) -> &io_sqring_offsets {
        &self.inner.sq_off
    }

    /// Field offsets within the completion ring mapping.
    pub fn cq_offsets(&self) -> &io_cqring_offsets {
        &self.inner.cq_off
    }

    /// Length of the submission ring mapping. The indirection array is the last field, so
    /// the mapping ends right after its `sq_entries` slots.
    pub fn sq_ring_len(&self) -> usize {
        self.inner.sq_off.array as usize + self.inner.sq_entries as usize * size_of::<u32>()
    }

    /// Length of the submission entry array mapping.
    pub fn sqes_len(&self) -> usize {
        self.inner.sq_entries as usize * size_of::<io_uring_sqe>()
    }

    /// Length of the completion ring mapping, which ends with the CQE table.
    pub fn cq_ring_len(&self) -> usize {
        self.inner.cq_off.cqes as usize + self.inner.cq_entries as usize * size_of::<io_uring_cqe>()
    }

    pub(crate) fn validate(&self) -> Result<(), RingError> {
        if !self.inner.sq_entries.is_power_of_two() {
            return Err(RingError::Params("submission entries are not a power of two"));
        }

        if !self.inner.cq_entries.is_power_of_two() {
            return Err(RingError::Params("completion entries are not a power of two"));
        }

        Ok(())
    }
}
