//! An in-process [`Kernel`] that speaks the io_uring ring protocol.
//!
//! [`SimKernel`] allocates the three ring regions on the heap, fills in a parameter block
//! with its own offsets, and consumes submissions synchronously inside
//! [`Kernel::enter`]. It never blocks and never touches real file descriptors, so the ring
//! logic can be exercised anywhere, including index wraparound and injected failures.
//!
//! Completions echo the submission's `user_data`. A NOP, FSYNC or CLOSE completes with 0,
//! a READ or WRITE with its length, a TIMEOUT with `-ETIME`, anything else with `-EINVAL`.

use std::{
    alloc::{self, Layout},
    os::fd::RawFd,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use kring_sys::{
    io_uring_cqe, io_uring_params, io_uring_sqe, IORING_FEAT_NODROP, IORING_FEAT_RW_CUR_POS,
    IORING_FEAT_SUBMIT_STABLE, IORING_OFF_CQ_RING, IORING_OFF_SQES, IORING_OFF_SQ_RING,
    IORING_OP_CLOSE, IORING_OP_FSYNC, IORING_OP_NOP, IORING_OP_READ, IORING_OP_READV,
    IORING_OP_TIMEOUT, IORING_OP_WRITE, IORING_OP_WRITEV, IORING_REGISTER_BUFFERS,
    IORING_REGISTER_EVENTFD, IORING_REGISTER_FILES, IORING_SETUP_CLAMP, IORING_SETUP_CQSIZE,
    IORING_SETUP_SQPOLL, IORING_SQ_NEED_WAKEUP, IORING_UNREGISTER_BUFFERS,
    IORING_UNREGISTER_EVENTFD, IORING_UNREGISTER_FILES,
};
use libc::{c_int, c_void};
use slab::Slab;

use crate::Kernel;

const PAGE_SIZE: usize = 4096;
const FD_BASE: RawFd = 1000;

const MAX_ENTRIES: u32 = 32768;
const MAX_CQ_ENTRIES: u32 = 2 * MAX_ENTRIES;

// submission ring layout
const SQ_HEAD: u32 = 0;
const SQ_TAIL: u32 = 4;
const SQ_RING_MASK: u32 = 8;
const SQ_RING_ENTRIES: u32 = 12;
const SQ_FLAGS: u32 = 16;
const SQ_DROPPED: u32 = 20;
const SQ_ARRAY: u32 = 64;

// completion ring layout
const CQ_HEAD: u32 = 0;
const CQ_TAIL: u32 = 4;
const CQ_RING_MASK: u32 = 8;
const CQ_RING_ENTRIES: u32 = 12;
const CQ_OVERFLOW: u32 = 16;
const CQ_FLAGS: u32 = 20;
const CQ_CQES: u32 = 64;

/// Call counters and live resource counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    /// Setup calls, failed ones included.
    pub setups: usize,
    /// Successful maps.
    pub maps: usize,
    /// Successful unmaps.
    pub unmaps: usize,
    /// Successful closes.
    pub closes: usize,
    /// Enter calls, failed ones included.
    pub enters: usize,
    /// Register calls, failed ones included.
    pub registers: usize,
    /// Mappings not yet unmapped.
    pub live_mappings: usize,
    /// Rings whose memory is still allocated: open, or closed with mappings left.
    pub live_rings: usize,
}

/// A submission the simulated kernel consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimOp {
    /// The descriptor of the ring it was submitted to.
    pub ring: RawFd,
    /// The entry slot it was read from.
    pub slot: u32,
    /// Its opcode.
    pub opcode: u8,
    /// Its user data.
    pub user_data: u64,
}

/// Page-aligned, zeroed heap memory standing in for a ring mapping.
#[derive(Debug)]
struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Only reached through the state mutex or through pointers handed out by `map`.
unsafe impl Send for Block {}

impl Block {
    fn zeroed(len: usize) -> Option<Self> {
        let layout = Layout::from_size_align(len.max(1), PAGE_SIZE).ok()?;
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;

        Some(Self { ptr, layout })
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn atomic(&self, offset: u32) -> &AtomicU32 {
        debug_assert!(offset as usize + 4 <= self.len());
        // every caller passes one of the layout constants above, which are in bounds and
        // 4-byte aligned
        unsafe { &*self.ptr.as_ptr().add(offset as usize).cast::<AtomicU32>() }
    }

    fn to_vec(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.len()];
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr(), bytes.as_mut_ptr(), self.len()) };
        bytes
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Debug)]
struct SimRing {
    fd: RawFd,
    flags: u32,
    sq_entries: u32,
    cq_entries: u32,
    sq_ring: Block,
    sqes: Block,
    cq_ring: Block,
    mappings: usize,
    closed: bool,
    buffers: Option<u32>,
    files: Option<u32>,
    eventfd: Option<RawFd>,
}

impl SimRing {
    fn block(&self, offset: u64) -> Option<&Block> {
        match offset {
            IORING_OFF_SQ_RING => Some(&self.sq_ring),
            IORING_OFF_SQES => Some(&self.sqes),
            IORING_OFF_CQ_RING => Some(&self.cq_ring),
            _ => None,
        }
    }

    fn sqe(&self, slot: u32) -> io_uring_sqe {
        unsafe { ptr::read(self.sqes.ptr.as_ptr().cast::<io_uring_sqe>().add(slot as usize)) }
    }

    fn array(&self, index: u32) -> u32 {
        let mask = self.sq_entries - 1;
        let array = unsafe { self.sq_ring.ptr.as_ptr().add(SQ_ARRAY as usize) }.cast::<u32>();
        unsafe { ptr::read(array.add((index & mask) as usize)) }
    }

    fn post(&self, tail: u32, cqe: io_uring_cqe) {
        let mask = self.cq_entries - 1;
        let cqes = unsafe { self.cq_ring.ptr.as_ptr().add(CQ_CQES as usize) }.cast::<io_uring_cqe>();
        unsafe { ptr::write(cqes.add((tail & mask) as usize), cqe) };
    }
}

#[derive(Debug)]
struct Mapping {
    ring: usize,
    addr: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct SimState {
    start_index: u32,
    rings: Slab<SimRing>,
    mappings: Slab<Mapping>,
    stats: SimStats,
    map_calls: usize,
    fail_setup: Option<c_int>,
    fail_map: Option<(usize, c_int)>,
    fail_enter: Option<c_int>,
    fail_register: Option<c_int>,
    last_enter_flags: Option<u32>,
    submitted: Vec<SimOp>,
}

impl SimState {
    fn ring_key(&self, fd: RawFd) -> Option<usize> {
        let key = usize::try_from(fd.checked_sub(FD_BASE)?).ok()?;
        match self.rings.get(key) {
            Some(ring) if !ring.closed => Some(key),
            _ => None,
        }
    }

    fn ring(&self, fd: RawFd) -> Option<&SimRing> {
        self.ring_key(fd).map(|key| &self.rings[key])
    }

    fn ring_mut(&mut self, fd: RawFd) -> Option<&mut SimRing> {
        let key = self.ring_key(fd)?;
        Some(&mut self.rings[key])
    }

    fn free_if_unused(&mut self, key: usize) {
        let ring = &self.rings[key];
        if ring.closed && ring.mappings == 0 {
            tracing::trace!(fd = ring.fd, "sim ring freed");
            self.rings.remove(key);
        }
    }

    fn refresh_live(&mut self) {
        self.stats.live_mappings = self.mappings.len();
        self.stats.live_rings = self.rings.len();
    }
}

/// A simulated kernel. Clones share state, so a test can keep one handle while a ring owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct SimKernel {
    state: Arc<Mutex<SimState>>,
}

/// Configures a [`SimKernel`].
#[derive(Debug, Default, Clone)]
pub struct SimKernelBuilder {
    start_index: u32,
}

impl SimKernelBuilder {
    /// The value every ring head and tail starts at. Values close to `u32::MAX` make the
    /// indices wrap after a few operations.
    pub fn start_index(mut self, index: u32) -> Self {
        self.start_index = index;
        self
    }

    /// Creates the kernel.
    pub fn build(self) -> SimKernel {
        let state = SimState {
            start_index: self.start_index,
            ..Default::default()
        };

        SimKernel {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl SimKernel {
    /// A kernel whose ring indices start at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures a kernel.
    pub fn builder() -> SimKernelBuilder {
        SimKernelBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counters so far.
    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }

    /// Every submission consumed so far, in order.
    pub fn submitted(&self) -> Vec<SimOp> {
        self.lock().submitted.clone()
    }

    /// Flags passed to the most recent enter call.
    pub fn last_enter_flags(&self) -> Option<u32> {
        self.lock().last_enter_flags
    }

    /// A copy of the bytes of one region of the open ring `fd`.
    pub fn snapshot(&self, fd: RawFd, offset: u64) -> Option<Vec<u8>> {
        let state = self.lock();
        state.ring(fd)?.block(offset).map(Block::to_vec)
    }

    /// Sets or clears the submission ring's wakeup flag on every open polling ring.
    pub fn set_need_wakeup(&self, need_wakeup: bool) {
        let state = self.lock();
        for (_, ring) in state.rings.iter() {
            if ring.closed || ring.flags & IORING_SETUP_SQPOLL == 0 {
                continue;
            }

            let flags = ring.sq_ring.atomic(SQ_FLAGS);
            if need_wakeup {
                flags.fetch_or(IORING_SQ_NEED_WAKEUP, Ordering::Release);
            } else {
                flags.fetch_and(!IORING_SQ_NEED_WAKEUP, Ordering::Release);
            }
        }
    }

    /// Makes the next setup call fail with `errno`.
    pub fn fail_next_setup(&self, errno: c_int) {
        self.lock().fail_setup = Some(errno);
    }

    /// Makes the `nth` map call from now on (counting from 1) fail with `errno`.
    pub fn fail_map(&self, nth: usize, errno: c_int) {
        let mut state = self.lock();
        let at = state.map_calls + nth;
        state.fail_map = Some((at, errno));
    }

    /// Makes the next enter call fail with `errno`.
    pub fn fail_next_enter(&self, errno: c_int) {
        self.lock().fail_enter = Some(errno);
    }

    /// Makes the next register call fail with `errno`.
    pub fn fail_next_register(&self, errno: c_int) {
        self.lock().fail_register = Some(errno);
    }
}

fn completion_result(sqe: &io_uring_sqe) -> i32 {
    match sqe.opcode {
        IORING_OP_NOP | IORING_OP_FSYNC | IORING_OP_CLOSE => 0,
        IORING_OP_READ | IORING_OP_WRITE | IORING_OP_READV | IORING_OP_WRITEV => {
            i32::try_from(sqe.len).unwrap_or(i32::MAX)
        }
        IORING_OP_TIMEOUT => -libc::ETIME,
        _ => -libc::EINVAL,
    }
}

impl Kernel for SimKernel {
    fn setup(&self, entries: u32, params: &mut io_uring_params) -> c_int {
        let mut state = self.lock();
        state.stats.setups += 1;

        if let Some(errno) = state.fail_setup.take() {
            return -errno;
        }

        let clamp = params.flags & IORING_SETUP_CLAMP != 0;
        if entries == 0 || (entries > MAX_ENTRIES && !clamp) {
            return -libc::EINVAL;
        }
        let sq_entries = entries.min(MAX_ENTRIES).next_power_of_two();

        let cq_entries = if params.flags & IORING_SETUP_CQSIZE != 0 {
            let requested = params.cq_entries;
            if requested == 0 || (requested > MAX_CQ_ENTRIES && !clamp) {
                return -libc::EINVAL;
            }

            let cq_entries = requested.min(MAX_CQ_ENTRIES).next_power_of_two();
            if cq_entries < sq_entries {
                return -libc::EINVAL;
            }
            cq_entries
        } else {
            2 * sq_entries
        };

        let sq_ring_len = SQ_ARRAY as usize + sq_entries as usize * 4;
        let sqes_len = sq_entries as usize * std::mem::size_of::<io_uring_sqe>();
        let cq_ring_len = CQ_CQES as usize + cq_entries as usize * std::mem::size_of::<io_uring_cqe>();

        let (Some(sq_ring), Some(sqes), Some(cq_ring)) = (
            Block::zeroed(sq_ring_len),
            Block::zeroed(sqes_len),
            Block::zeroed(cq_ring_len),
        ) else {
            return -libc::ENOMEM;
        };

        let start = state.start_index;
        for offset in [SQ_HEAD, SQ_TAIL] {
            sq_ring.atomic(offset).store(start, Ordering::Relaxed);
        }
        sq_ring.atomic(SQ_RING_MASK).store(sq_entries - 1, Ordering::Relaxed);
        sq_ring.atomic(SQ_RING_ENTRIES).store(sq_entries, Ordering::Relaxed);
        if params.flags & IORING_SETUP_SQPOLL != 0 {
            sq_ring.atomic(SQ_FLAGS).store(IORING_SQ_NEED_WAKEUP, Ordering::Relaxed);
        }

        for offset in [CQ_HEAD, CQ_TAIL] {
            cq_ring.atomic(offset).store(start, Ordering::Relaxed);
        }
        cq_ring.atomic(CQ_RING_MASK).store(cq_entries - 1, Ordering::Relaxed);
        cq_ring.atomic(CQ_RING_ENTRIES).store(cq_entries, Ordering::Relaxed);

        let entry = state.rings.vacant_entry();
        let Some(fd) = RawFd::try_from(entry.key()).ok().and_then(|key| key.checked_add(FD_BASE)) else {
            return -libc::EMFILE;
        };
        entry.insert(SimRing {
            fd,
            flags: params.flags,
            sq_entries,
            cq_entries,
            sq_ring,
            sqes,
            cq_ring,
            mappings: 0,
            closed: false,
            buffers: None,
            files: None,
            eventfd: None,
        });
        state.refresh_live();

        params.sq_entries = sq_entries;
        params.cq_entries = cq_entries;
        params.features = IORING_FEAT_NODROP | IORING_FEAT_SUBMIT_STABLE | IORING_FEAT_RW_CUR_POS;

        params.sq_off.head = SQ_HEAD;
        params.sq_off.tail = SQ_TAIL;
        params.sq_off.ring_mask = SQ_RING_MASK;
        params.sq_off.ring_entries = SQ_RING_ENTRIES;
        params.sq_off.flags = SQ_FLAGS;
        params.sq_off.dropped = SQ_DROPPED;
        params.sq_off.array = SQ_ARRAY;

        params.cq_off.head = CQ_HEAD;
        params.cq_off.tail = CQ_TAIL;
        params.cq_off.ring_mask = CQ_RING_MASK;
        params.cq_off.ring_entries = CQ_RING_ENTRIES;
        params.cq_off.overflow = CQ_OVERFLOW;
        params.cq_off.flags = CQ_FLAGS;
        params.cq_off.cqes = CQ_CQES;

        tracing::trace!(fd, sq_entries, cq_entries, "sim ring created");
        fd
    }

    unsafe fn map(&self, fd: RawFd, len: usize, offset: u64) -> isize {
        let mut state = self.lock();
        state.map_calls += 1;

        if let Some((at, errno)) = state.fail_map {
            if at == state.map_calls {
                state.fail_map = None;
                return -(errno as isize);
            }
        }

        let Some(key) = state.ring_key(fd) else {
            return -(libc::EBADF as isize);
        };
        let addr = match state.rings[key].block(offset) {
            Some(block) if len <= block.len() => block.ptr.as_ptr() as usize,
            _ => return -(libc::EINVAL as isize),
        };

        state.rings[key].mappings += 1;
        state.mappings.insert(Mapping { ring: key, addr, len });
        state.stats.maps += 1;
        state.refresh_live();

        addr as isize
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> c_int {
        let mut state = self.lock();
        let addr = addr.as_ptr() as usize;

        let found = state
            .mappings
            .iter()
            .find(|(_, mapping)| mapping.addr == addr && mapping.len == len)
            .map(|(key, _)| key);
        let Some(key) = found else {
            return -libc::EINVAL;
        };

        let mapping = state.mappings.remove(key);
        state.rings[mapping.ring].mappings -= 1;
        state.free_if_unused(mapping.ring);
        state.stats.unmaps += 1;
        state.refresh_live();

        0
    }

    unsafe fn close(&self, fd: RawFd) -> c_int {
        let mut state = self.lock();
        let Some(key) = state.ring_key(fd) else {
            return -libc::EBADF;
        };

        state.rings[key].closed = true;
        state.free_if_unused(key);
        state.stats.closes += 1;
        state.refresh_live();

        0
    }

    fn enter(&self, fd: RawFd, to_submit: u32, min_complete: u32, flags: u32) -> c_int {
        let mut state = self.lock();
        state.stats.enters += 1;
        state.last_enter_flags = Some(flags);

        if let Some(errno) = state.fail_enter.take() {
            return -errno;
        }

        let Some(ring) = state.ring(fd) else {
            return -libc::EBADF;
        };

        let sq_head = ring.sq_ring.atomic(SQ_HEAD).load(Ordering::Relaxed);
        let sq_tail = ring.sq_ring.atomic(SQ_TAIL).load(Ordering::Acquire);
        let cq_head = ring.cq_ring.atomic(CQ_HEAD).load(Ordering::Acquire);
        let mut cq_tail = ring.cq_ring.atomic(CQ_TAIL).load(Ordering::Relaxed);

        let available = sq_tail.wrapping_sub(sq_head);
        let cq_free = ring.cq_entries - cq_tail.wrapping_sub(cq_head);
        let consumed = to_submit.min(available).min(cq_free);

        let mut ops = Vec::with_capacity(consumed as usize);
        let mut dropped = 0;
        for i in 0..consumed {
            let slot = ring.array(sq_head.wrapping_add(i));
            if slot >= ring.sq_entries {
                dropped += 1;
                continue;
            }

            let sqe = ring.sqe(slot);
            ring.post(
                cq_tail,
                io_uring_cqe {
                    user_data: sqe.user_data,
                    res: completion_result(&sqe),
                    flags: 0,
                },
            );
            cq_tail = cq_tail.wrapping_add(1);

            ops.push(SimOp {
                ring: fd,
                slot,
                opcode: sqe.opcode,
                user_data: sqe.user_data,
            });
        }

        if dropped > 0 {
            ring.sq_ring.atomic(SQ_DROPPED).fetch_add(dropped, Ordering::Release);
        }
        ring.sq_ring
            .atomic(SQ_HEAD)
            .store(sq_head.wrapping_add(consumed), Ordering::Release);
        ring.cq_ring.atomic(CQ_TAIL).store(cq_tail, Ordering::Release);

        tracing::trace!(fd, to_submit, min_complete, flags, consumed, "sim enter");
        state.submitted.extend(ops);

        consumed as c_int
    }

    unsafe fn register(&self, fd: RawFd, opcode: u32, arg: *const c_void, nr_args: u32) -> c_int {
        let mut state = self.lock();
        state.stats.registers += 1;

        if let Some(errno) = state.fail_register.take() {
            return -errno;
        }

        let Some(ring) = state.ring_mut(fd) else {
            return -libc::EBADF;
        };

        match opcode {
            IORING_REGISTER_BUFFERS | IORING_REGISTER_FILES => {
                let table = if opcode == IORING_REGISTER_BUFFERS {
                    &mut ring.buffers
                } else {
                    &mut ring.files
                };
                if table.is_some() {
                    return -libc::EBUSY;
                }
                if arg.is_null() || nr_args == 0 {
                    return -libc::EINVAL;
                }
                *table = Some(nr_args);
            }
            IORING_UNREGISTER_BUFFERS => {
                if ring.buffers.take().is_none() {
                    return -libc::ENXIO;
                }
            }
            IORING_UNREGISTER_FILES => {
                if ring.files.take().is_none() {
                    return -libc::ENXIO;
                }
            }
            IORING_REGISTER_EVENTFD => {
                if ring.eventfd.is_some() {
                    return -libc::EBUSY;
                }
                if arg.is_null() || nr_args != 1 {
                    return -libc::EINVAL;
                }
                ring.eventfd = Some(ptr::read(arg.cast::<RawFd>()));
            }
            IORING_UNREGISTER_EVENTFD => {
                if ring.eventfd.take().is_none() {
                    return -libc::ENXIO;
                }
            }
            _ => return -libc::EINVAL,
        }

        0
    }
}
