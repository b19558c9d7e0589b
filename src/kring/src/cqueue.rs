use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering},
};

use kring_sys::io_uring_cqe;

use crate::{region::MappedRegion, CompletionEntry, Kernel, RingError, RingParameters};

/// The completion ring: the kernel produces, user space consumes.
#[derive(Debug)]
pub struct CompletionQueue {
    khead: NonNull<AtomicU32>,
    ktail: NonNull<AtomicU32>,
    koverflow: NonNull<AtomicU32>,
    cqes: NonNull<io_uring_cqe>,

    ring_mask: u32,
    ring_entries: u32,
}

// Same reasoning as for `SubmissionQueue`: shared mappings, single consumer via `&mut`.
unsafe impl Send for CompletionQueue {}

impl CompletionQueue {
    pub(crate) fn new<K: Kernel>(
        ring: &MappedRegion<K>,
        params: &RingParameters,
    ) -> Result<Self, RingError> {
        let off = params.cq_offsets();
        let entries = params.cq_entries();

        let khead = ring.field::<AtomicU32>(off.head)?;
        let ktail = ring.field::<AtomicU32>(off.tail)?;
        let koverflow = ring.field::<AtomicU32>(off.overflow)?;
        let ring_mask = ring.field::<AtomicU32>(off.ring_mask)?;
        let ring_entries = ring.field::<AtomicU32>(off.ring_entries)?;
        let cqes = ring.array::<io_uring_cqe>(off.cqes, entries)?;

        let (ring_mask, ring_entries) = unsafe {
            (
                ring_mask.as_ref().load(Ordering::Relaxed),
                ring_entries.as_ref().load(Ordering::Relaxed),
            )
        };

        if ring_entries != entries || ring_mask != entries.wrapping_sub(1) {
            return Err(RingError::Params("completion ring mask does not match its entries"));
        }

        Ok(Self {
            khead,
            ktail,
            koverflow,
            cqes,
            ring_mask,
            ring_entries,
        })
    }

    #[inline]
    fn head(&self) -> u32 {
        // only this side stores the head
        unsafe { self.khead.as_ref() }.load(Ordering::Relaxed)
    }

    #[inline]
    fn tail(&self) -> u32 {
        unsafe { self.ktail.as_ref() }.load(Ordering::Acquire)
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> u32 {
        self.ring_entries
    }

    /// Gets the number of unconsumed, ready entries
    pub fn ready(&self) -> u32 {
        self.tail().wrapping_sub(self.head())
    }

    /// Whether no completion is waiting.
    pub fn is_empty(&self) -> bool {
        self.ready() == 0
    }

    /// Number of completions the kernel had to drop because the ring was full.
    pub fn overflow(&self) -> u32 {
        unsafe { self.koverflow.as_ref() }.load(Ordering::Acquire)
    }

    /// Drains the completions the kernel has published so far.
    ///
    /// The iterator covers exactly the entries visible when it was created. Entries are
    /// handed back to the kernel when the iterator is dropped, and only those that were
    /// actually yielded; the rest are seen again by the next call.
    pub fn reap(&mut self) -> Completions<'_> {
        let head = self.head();
        let tail = self.tail();

        Completions {
            queue: self,
            head,
            tail,
        }
    }
}

/// An iterator over CQEs, automatically advancing the ring buffer when iteration completes
#[derive(Debug)]
pub struct Completions<'a> {
    queue: &'a mut CompletionQueue,
    head: u32,
    tail: u32,
}

impl Iterator for Completions<'_> {
    type Item = CompletionEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.head == self.tail {
            return None;
        }

        let slot = self.head & self.queue.ring_mask;
        // the acquire load of the tail made every entry before it visible, and slot is in
        // bounds of the table checked at construction
        let cqe = unsafe { ptr::read(self.queue.cqes.as_ptr().add(slot as usize)) };
        self.head = self.head.wrapping_add(1);

        Some(CompletionEntry::from_raw(cqe))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.tail.wrapping_sub(self.head) as usize;
        (len, Some(len))
    }
}

impl ExactSizeIterator for Completions<'_> {}

impl Drop for Completions<'_> {
    fn drop(&mut self) {
        if self.head != self.queue.head() {
            // the reads above must finish before the kernel may reuse the slots
            unsafe { self.queue.khead.as_ref() }.store(self.head, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{sim::SimKernel, Builder, SubmissionEntry};

    #[test]
    fn partially_consumed_entries_are_seen_again() {
        let mut ring = Builder::new(4).build_with(SimKernel::new()).unwrap();
        for tag in 1..=3 {
            ring.submit(SubmissionEntry::nop().user_data(tag)).unwrap();
        }
        ring.flush().unwrap();
        assert_eq!(ring.completion().ready(), 3);

        let first: Vec<u64> = ring.reap().take(1).map(|cqe| cqe.user_data()).collect();
        assert_eq!(first, vec![1]);
        assert_eq!(ring.completion().ready(), 2);

        let rest: Vec<u64> = ring.reap().map(|cqe| cqe.user_data()).collect();
        assert_eq!(rest, vec![2, 3]);
        assert!(ring.completion().is_empty());
    }

    #[test]
    fn reap_reports_exact_size() {
        let mut ring = Builder::new(8).build_with(SimKernel::new()).unwrap();
        for _ in 0..5 {
            ring.submit(SubmissionEntry::nop()).unwrap();
        }
        ring.flush().unwrap();

        let mut reaped = ring.reap();
        assert_eq!(reaped.len(), 5);
        reaped.next();
        assert_eq!(reaped.len(), 4);
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let mut ring = Builder::new(4).build_with(SimKernel::new()).unwrap();

        assert_eq!(ring.reap().count(), 0);
        assert_eq!(ring.completion().overflow(), 0);
    }
}
