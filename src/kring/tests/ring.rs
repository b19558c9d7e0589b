use std::{
    os::fd::{AsRawFd, RawFd},
    ptr::NonNull,
    thread,
    time::Duration,
};

use kring::{
    sim::SimKernel, Builder, EnterFlags, Kernel, RingError, SQFullError, SetupFlags,
    SubmissionEntry,
};
use kring_sys::{io_uring_params, IORING_OP_NOP, IORING_OP_WRITE, IORING_REGISTER_FILES};
use libc::{c_int, c_void};

/// A parameter block the simulator's rings do not actually match.
#[derive(Debug, Clone, Copy)]
enum Skew {
    CqOverflowOutOfRange,
    CqMaskOnEntries,
    SqMaskOnEntries,
}

impl Skew {
    fn apply(self, p: &mut io_uring_params) {
        match self {
            Skew::CqOverflowOutOfRange => p.cq_off.overflow = 1 << 20,
            // the entry count is never entries - 1
            Skew::CqMaskOnEntries => p.cq_off.ring_mask = p.cq_off.ring_entries,
            Skew::SqMaskOnEntries => p.sq_off.ring_mask = p.sq_off.ring_entries,
        }
    }
}

#[derive(Debug, Clone)]
struct Skewed {
    inner: SimKernel,
    skew: Skew,
}

impl Kernel for Skewed {
    fn setup(&self, entries: u32, params: &mut io_uring_params) -> c_int {
        let fd = self.inner.setup(entries, params);
        if fd >= 0 {
            self.skew.apply(params);
        }
        fd
    }

    unsafe fn map(&self, fd: RawFd, len: usize, offset: u64) -> isize {
        self.inner.map(fd, len, offset)
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> c_int {
        self.inner.unmap(addr, len)
    }

    unsafe fn close(&self, fd: RawFd) -> c_int {
        self.inner.close(fd)
    }

    fn enter(&self, fd: RawFd, to_submit: u32, min_complete: u32, flags: u32) -> c_int {
        self.inner.enter(fd, to_submit, min_complete, flags)
    }

    unsafe fn register(&self, fd: RawFd, opcode: u32, arg: *const c_void, nr_args: u32) -> c_int {
        self.inner.register(fd, opcode, arg, nr_args)
    }
}

fn build_skewed(skew: Skew) -> (SimKernel, RingError) {
    let inner = SimKernel::new();
    let kernel = Skewed {
        inner: inner.clone(),
        skew,
    };

    let err = Builder::new(4).build_with(kernel).unwrap_err();
    (inner, err)
}

fn assert_fully_released(kernel: &SimKernel) {
    let stats = kernel.stats();
    assert_eq!(
        (stats.maps, stats.unmaps, stats.closes, stats.live_mappings, stats.live_rings),
        (3, 3, 1, 0, 0)
    );
}

#[test]
fn depth_four_round_trips_tags_in_order() {
    let kernel = SimKernel::new();
    let mut ring = Builder::new(4).build_with(kernel.clone()).unwrap();

    for tag in 1..=4 {
        ring.submit(SubmissionEntry::nop().user_data(tag)).unwrap();
    }
    assert_eq!(
        ring.submit(SubmissionEntry::nop().user_data(5)),
        Err(SQFullError)
    );

    assert_eq!(ring.enter(4, 0, EnterFlags::empty()).unwrap(), 4);

    let tags: Vec<u64> = ring.reap().map(|cqe| cqe.user_data()).collect();
    assert_eq!(tags, vec![1, 2, 3, 4]);
    assert!(kernel.submitted().iter().all(|op| op.opcode == IORING_OP_NOP));

    ring.close().unwrap();
}

#[test]
fn tags_survive_index_wraparound() {
    let kernel = SimKernel::builder().start_index(u32::MAX - 2).build();
    let mut ring = Builder::new(4).build_with(kernel.clone()).unwrap();

    let mut next = 0u64;
    for _ in 0..5 {
        let batch: Vec<u64> = (0..3).map(|i| next + i).collect();
        next += 3;

        for tag in &batch {
            ring.submit(SubmissionEntry::nop().user_data(*tag)).unwrap();
        }
        assert_eq!(ring.flush().unwrap(), 3);

        let reaped: Vec<u64> = ring.reap().map(|cqe| cqe.user_data()).collect();
        assert_eq!(reaped, batch);
    }

    let slots: Vec<u32> = kernel.submitted().iter().map(|op| op.slot).collect();
    assert!(slots.iter().all(|slot| *slot < 4));
    assert_eq!(&slots[..4], &[1, 2, 3, 0]);
}

#[test]
fn failed_second_mapping_releases_first() {
    let kernel = SimKernel::new();
    kernel.fail_map(2, libc::ENOMEM);

    let err = Builder::new(4).build_with(kernel.clone()).unwrap_err();
    assert_eq!(err, RingError::MapSubmitEntries(libc::ENOMEM));
    assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));

    let stats = kernel.stats();
    assert_eq!(stats.maps, 1);
    assert_eq!(stats.unmaps, 1);
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.live_mappings, 0);
    assert_eq!(stats.live_rings, 0);
}

#[test]
fn failed_third_mapping_releases_both_earlier() {
    let kernel = SimKernel::new();
    kernel.fail_map(3, libc::EPERM);

    let err = Builder::new(4).build_with(kernel.clone()).unwrap_err();
    assert_eq!(err, RingError::MapCompleteRing(libc::EPERM));

    let stats = kernel.stats();
    assert_eq!((stats.maps, stats.unmaps, stats.closes), (2, 2, 1));
    assert_eq!(stats.live_rings, 0);
}

#[test]
fn out_of_range_offset_releases_all_mappings() {
    let (kernel, err) = build_skewed(Skew::CqOverflowOutOfRange);

    assert!(
        matches!(err, RingError::Layout { region: "cq ring", offset, .. } if offset == 1 << 20),
        "{err:?}"
    );
    assert_eq!(err.raw_os_error(), None);
    assert_fully_released(&kernel);
}

#[test]
fn mismatched_mask_releases_all_mappings() {
    let (kernel, err) = build_skewed(Skew::CqMaskOnEntries);

    assert!(matches!(err, RingError::Params(_)), "{err:?}");
    assert_fully_released(&kernel);
}

#[test]
fn mismatched_submission_mask_releases_all_mappings() {
    let (kernel, err) = build_skewed(Skew::SqMaskOnEntries);

    assert!(matches!(err, RingError::Params(_)), "{err:?}");
    assert_fully_released(&kernel);
}

#[test]
fn register_failure_surfaces_exact_code() {
    let kernel = SimKernel::new();
    let ring = Builder::new(4).build_with(kernel.clone()).unwrap();

    kernel.fail_next_register(libc::EINVAL);
    let fds = [0];
    let err = unsafe { ring.register(IORING_REGISTER_FILES, fds.as_ptr().cast(), 1) }.unwrap_err();

    assert_eq!(err, RingError::Register(22));
    assert_eq!(std::io::Error::from(err).raw_os_error(), Some(22));
}

#[test]
fn close_leaves_nothing_mapped() {
    let kernel = SimKernel::new();
    let mut ring = Builder::new(16).build_with(kernel.clone()).unwrap();
    let fd = ring.as_raw_fd();

    ring.submit(SubmissionEntry::nop()).unwrap();
    ring.flush().unwrap();
    ring.close().unwrap();

    let stats = kernel.stats();
    assert_eq!(stats.live_mappings, 0);
    assert_eq!(stats.live_rings, 0);
    assert!(kernel.snapshot(fd, kring_sys::IORING_OFF_SQ_RING).is_none());
}

#[test]
fn explicit_completion_size_is_honoured() {
    let mut ring = Builder::new(4)
        .cq_entries(64)
        .build_with(SimKernel::new())
        .unwrap();

    assert_eq!(ring.params().sq_entries(), 4);
    assert_eq!(ring.params().cq_entries(), 64);
    assert!(ring.params().flags().contains(SetupFlags::CqSize));
    assert_eq!(ring.completion().capacity(), 64);
}

#[test]
fn sqpoll_wakes_sleeping_thread_only() {
    let kernel = SimKernel::new();
    let mut ring = Builder::new(8)
        .sqpoll(Duration::from_millis(100))
        .build_with(kernel.clone())
        .unwrap();

    // the polling thread starts asleep
    ring.submit(SubmissionEntry::nop().user_data(1)).unwrap();
    assert_eq!(ring.flush().unwrap(), 1);
    assert_eq!(kernel.stats().enters, 1);
    assert_eq!(kernel.last_enter_flags(), Some(EnterFlags::SqWakeup.bits()));

    kernel.set_need_wakeup(false);
    ring.submit(SubmissionEntry::nop().user_data(2)).unwrap();
    assert_eq!(ring.flush().unwrap(), 1);
    assert_eq!(kernel.stats().enters, 1);
    assert_eq!(ring.submission().pending(), 1);
}

#[test]
fn completions_report_operation_results() {
    let mut ring = Builder::new(4).build_with(SimKernel::new()).unwrap();
    let buf = [0u8; 32];

    let write = unsafe { SubmissionEntry::write(std::io::stderr(), &buf, 0) }.user_data(1);
    assert_eq!(write.opcode(), IORING_OP_WRITE);
    ring.submit(write).unwrap();
    ring.submit(SubmissionEntry::new(0xfe).user_data(2)).unwrap();
    ring.flush().unwrap();

    let results: Vec<(u64, i32)> = ring.reap().map(|cqe| (cqe.user_data(), cqe.result())).collect();
    assert_eq!(results, vec![(1, 32), (2, -libc::EINVAL)]);
}

#[test]
fn split_ring_submits_and_reaps_on_separate_threads() {
    const TOTAL: u64 = 64;

    let mut ring = Builder::new(8).build_with(SimKernel::new()).unwrap();
    let (submitter, sq, cq) = ring.split();

    let reaped = thread::scope(|s| {
        s.spawn(move || {
            for tag in 0..TOTAL {
                while sq.push(SubmissionEntry::nop().user_data(tag)).is_err() {
                    submitter.flush(sq).unwrap();
                    thread::yield_now();
                }
                submitter.flush(sq).unwrap();
            }

            // the completion ring may have been full on the last flushes
            while !sq.is_empty() {
                submitter.flush(sq).unwrap();
                thread::yield_now();
            }
        });

        let reaper = s.spawn(move || {
            let mut tags = Vec::new();
            while (tags.len() as u64) < TOTAL {
                tags.extend(cq.reap().map(|cqe| cqe.user_data()));
                thread::yield_now();
            }
            tags
        });

        reaper.join().unwrap()
    });

    assert_eq!(reaped, (0..TOTAL).collect::<Vec<_>>());
}

#[test]
fn real_kernel_nop_round_trip() {
    // io_uring may be unavailable or disabled, e.g. in containers
    let Ok(mut ring) = Builder::new(4).build() else {
        return;
    };

    ring.submit(SubmissionEntry::nop().user_data(0xdead_beef)).unwrap();
    assert_eq!(ring.submit_and_wait(1).unwrap(), 1);

    let cqes: Vec<_> = ring.reap().collect();
    assert_eq!(cqes.len(), 1);
    assert_eq!(cqes[0].user_data(), 0xdead_beef);
    assert_eq!(cqes[0].io_result().unwrap(), 0);

    ring.close().unwrap();
}
