use std::{
    ptr::{self, NonNull},
    sync::atomic::{self, AtomicU32, Ordering},
};

use kring_sys::{io_uring_sqe, IORING_SQ_CQ_OVERFLOW, IORING_SQ_NEED_WAKEUP};

use crate::{region::MappedRegion, Kernel, RingError, RingParameters, SQFullError, SubmissionEntry};

/// The submission ring: user space produces, the kernel consumes.
///
/// Entries are staged with [`push`](SubmissionQueue::push) and become visible to the kernel
/// only once [`sync`](SubmissionQueue::sync) publishes the tail. Pushing several entries
/// before one sync batches them into a single tail update.
#[derive(Debug)]
pub struct SubmissionQueue {
    khead: NonNull<AtomicU32>,
    ktail: NonNull<AtomicU32>,
    kflags: NonNull<AtomicU32>,
    kdropped: NonNull<AtomicU32>,
    array: NonNull<u32>,
    sqes: NonNull<io_uring_sqe>,

    sqe_tail: u32,

    ring_mask: u32,
    ring_entries: u32,
}

// The pointers target the ring's shared mappings, which outlive the queue. Mutation goes
// through `&mut self`, so moving the queue to another thread keeps a single producer.
unsafe impl Send for SubmissionQueue {}

impl SubmissionQueue {
    pub(crate) fn new<K: Kernel>(
        ring: &MappedRegion<K>,
        sqes: &MappedRegion<K>,
        params: &RingParameters,
    ) -> Result<Self, RingError> {
        let off = params.sq_offsets();
        let entries = params.sq_entries();

        let khead = ring.field::<AtomicU32>(off.head)?;
        let ktail = ring.field::<AtomicU32>(off.tail)?;
        let kflags = ring.field::<AtomicU32>(off.flags)?;
        let kdropped = ring.field::<AtomicU32>(off.dropped)?;
        let ring_mask = ring.field::<AtomicU32>(off.ring_mask)?;
        let ring_entries = ring.field::<AtomicU32>(off.ring_entries)?;
        let array = ring.array::<u32>(off.array, entries)?;
        let sqes = sqes.array::<io_uring_sqe>(0, entries)?;

        let (ring_mask, ring_entries, sqe_tail) = unsafe {
            (
                ring_mask.as_ref().load(Ordering::Relaxed),
                ring_entries.as_ref().load(Ordering::Relaxed),
                ktail.as_ref().load(Ordering::Relaxed),
            )
        };

        if ring_entries != entries || ring_mask != entries.wrapping_sub(1) {
            return Err(RingError::Params("submission ring mask does not match its entries"));
        }

        Ok(Self {
            khead,
            ktail,
            kflags,
            kdropped,
            array,
            sqes,
            sqe_tail,
            ring_mask,
            ring_entries,
        })
    }

    #[inline]
    fn head(&self) -> u32 {
        unsafe { self.khead.as_ref() }.load(Ordering::Acquire)
    }

    #[inline]
    fn tail(&self) -> u32 {
        // only this side stores the tail
        unsafe { self.ktail.as_ref() }.load(Ordering::Relaxed)
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> u32 {
        self.ring_entries
    }

    /// Entries staged or published that the kernel has not consumed yet.
    pub fn len(&self) -> u32 {
        self.sqe_tail.wrapping_sub(self.head())
    }

    /// Whether no entry is waiting for the kernel.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every slot is taken.
    pub fn is_full(&self) -> bool {
        self.len() >= self.ring_entries
    }

    /// Slots free for [`push`](SubmissionQueue::push).
    pub fn space_left(&self) -> u32 {
        self.ring_entries.saturating_sub(self.len())
    }

    /// Entries published by [`sync`](SubmissionQueue::sync) that the kernel has not consumed.
    pub fn pending(&self) -> u32 {
        self.tail().wrapping_sub(self.head())
    }

    /// Entries pushed but not yet published.
    pub fn unpublished(&self) -> u32 {
        self.sqe_tail.wrapping_sub(self.tail())
    }

    /// Stages `entry` in the next free slot and returns the slot index.
    ///
    /// The kernel does not see the entry until [`sync`](SubmissionQueue::sync). When the ring
    /// is full nothing is written and [`SQFullError`] is returned.
    pub fn push(&mut self, entry: SubmissionEntry) -> Result<u32, SQFullError> {
        if self.is_full() {
            return Err(SQFullError);
        }

        let slot = self.sqe_tail & self.ring_mask;
        unsafe {
            // slot <= ring_mask, and both tables were bounds-checked for ring_entries elements
            ptr::write(self.sqes.as_ptr().add(slot as usize), entry.into_raw());
            ptr::write(self.array.as_ptr().add(slot as usize), slot);
        }
        self.sqe_tail = self.sqe_tail.wrapping_add(1);

        Ok(slot)
    }

    /// Stages all of `entries`, or none of them if they do not fit.
    pub fn push_multiple(&mut self, entries: &[SubmissionEntry]) -> Result<(), SQFullError> {
        if (self.space_left() as usize) < entries.len() {
            return Err(SQFullError);
        }

        for entry in entries {
            self.push(*entry)?;
        }

        Ok(())
    }

    /// Publishes every staged entry to the kernel and returns how many were published.
    ///
    /// The release store orders the entry and indirection writes before the new tail.
    pub fn sync(&mut self) -> u32 {
        let published = self.unpublished();
        if published > 0 {
            unsafe { self.ktail.as_ref() }.store(self.sqe_tail, Ordering::Release);
        }

        published
    }

    /// Whether the kernel's submission polling thread is asleep and must be woken by
    /// entering the ring with `SQ_WAKEUP`.
    pub fn need_wakeup(&self) -> bool {
        // the flag load must not be reordered before the tail store in `sync`
        atomic::fence(Ordering::SeqCst);
        unsafe { self.kflags.as_ref() }.load(Ordering::Relaxed) & IORING_SQ_NEED_WAKEUP != 0
    }

    /// Whether the kernel flagged a completion queue overflow.
    pub fn cq_overflow(&self) -> bool {
        unsafe { self.kflags.as_ref() }.load(Ordering::Acquire) & IORING_SQ_CQ_OVERFLOW != 0
    }

    /// Number of invalid entries the kernel skipped.
    pub fn dropped(&self) -> u32 {
        unsafe { self.kdropped.as_ref() }.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, os::fd::AsRawFd};

    use kring_sys::{IORING_OFF_SQES, IORING_OFF_SQ_RING};

    use crate::{sim::SimKernel, Builder, SubmissionEntry};

    #[test]
    fn full_queue_rejects_without_writing() {
        let kernel = SimKernel::new();
        let mut ring = Builder::new(4).build_with(kernel.clone()).unwrap();
        let sq = ring.submission();

        for tag in 0..4 {
            sq.push(SubmissionEntry::nop().user_data(tag)).unwrap();
        }
        assert!(sq.is_full());

        let fd = ring.as_raw_fd();
        let sqes_before = kernel.snapshot(fd, IORING_OFF_SQES).unwrap();
        let ring_before = kernel.snapshot(fd, IORING_OFF_SQ_RING).unwrap();
        let sq = ring.submission();

        assert_eq!(sq.push(SubmissionEntry::nop().user_data(99)), Err(super::SQFullError));
        assert_eq!(sq.push(SubmissionEntry::nop().user_data(99)), Err(super::SQFullError));
        assert_eq!(sq.len(), 4);
        assert_eq!(sq.unpublished(), 4);
        assert_eq!(kernel.snapshot(fd, IORING_OFF_SQES).unwrap(), sqes_before);
        assert_eq!(kernel.snapshot(fd, IORING_OFF_SQ_RING).unwrap(), ring_before);
    }

    #[test]
    fn push_multiple_is_all_or_nothing() {
        let mut ring = Builder::new(4).build_with(SimKernel::new()).unwrap();
        let sq = ring.submission();
        let batch = [SubmissionEntry::nop(); 3];

        sq.push_multiple(&batch).unwrap();
        assert_eq!(sq.push_multiple(&batch), Err(super::SQFullError));
        assert_eq!(sq.len(), 3);
        assert_eq!(sq.space_left(), 1);
    }

    #[test]
    fn sync_publishes_batch_once() {
        let mut ring = Builder::new(8).build_with(SimKernel::new()).unwrap();
        let sq = ring.submission();

        sq.push(SubmissionEntry::nop()).unwrap();
        sq.push(SubmissionEntry::nop()).unwrap();
        assert_eq!(sq.pending(), 0);
        assert_eq!(sq.unpublished(), 2);

        assert_eq!(sq.sync(), 2);
        assert_eq!(sq.pending(), 2);
        assert_eq!(sq.unpublished(), 0);
        assert_eq!(sq.sync(), 0);
    }

    #[test]
    fn slots_stay_distinct_across_index_wraparound() {
        let kernel = SimKernel::builder().start_index(u32::MAX - 1).build();
        let mut ring = Builder::new(4).build_with(kernel).unwrap();
        let sq = ring.submission();

        let slots: HashSet<u32> = (0..4)
            .map(|_| sq.push(SubmissionEntry::nop()).unwrap())
            .collect();

        assert_eq!(slots.len(), 4);
        assert!(slots.iter().all(|slot| *slot < 4));
        assert!(sq.is_full());
    }
}
